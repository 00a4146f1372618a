//! Read, write and raw commands

use anyhow::{bail, Result};

use candiag::parse::{parse_did, parse_hex_bytes};
use candiag::DiagEvent;

use super::{failure, DiagSession};
use crate::output::{spaced_hex, DataRow, OutputContext};

/// Read data identifiers one after another
pub async fn read(diag: &mut DiagSession<'_>, dids: &[String], ctx: &OutputContext) -> Result<()> {
    let mut rows = Vec::with_capacity(dids.len());

    for did in dids {
        let did = parse_did(did)?;
        let id = diag.orchestrator.read_data_by_identifier(did)?;
        let data = diag
            .until(|event| match event {
                DiagEvent::DataRead { did: got, data } if *got == did => Some(Ok(data.clone())),
                other => failure(id, other).map(Err),
            })
            .await?;
        rows.push(DataRow::new(did, &data));
    }

    ctx.print(&rows);
    Ok(())
}

/// Write a data identifier
pub async fn write(
    diag: &mut DiagSession<'_>,
    did: &str,
    data: Option<&str>,
    text: Option<&str>,
    ctx: &OutputContext,
) -> Result<()> {
    let did = parse_did(did)?;
    let value = match (data, text) {
        (Some(hex), _) => parse_hex_bytes(hex)?,
        (None, Some(text)) => text.as_bytes().to_vec(),
        (None, None) => bail!("Nothing to write"),
    };

    let id = diag.orchestrator.write_data_by_identifier(did, &value)?;
    diag.response(id).await?;

    ctx.success(&format!("Wrote {} byte(s) to DID 0x{:04X}", value.len(), did));
    Ok(())
}

/// Send a raw request and print the raw response
pub async fn raw(diag: &mut DiagSession<'_>, payload: &str, ctx: &OutputContext) -> Result<()> {
    let payload = parse_hex_bytes(payload)?;
    let id = diag.orchestrator.send_raw(payload)?;
    let response = diag.response(id).await?;

    ctx.print_value(&hex::encode_upper(&response), &spaced_hex(&response));
    Ok(())
}
