//! DTC commands - read and clear diagnostic information

use anyhow::{anyhow, Result};

use candiag::parse::parse_can_id;
use candiag::DiagEvent;

use super::{failure, parse_u8, DiagSession};
use crate::output::{DtcRow, OutputContext};

/// Read DTCs, or only their count
pub async fn dtcs(
    diag: &mut DiagSession<'_>,
    sub_function: &str,
    mask: &str,
    count_only: bool,
    ctx: &OutputContext,
) -> Result<()> {
    let mask = parse_u8(mask, "status mask")?;

    if count_only {
        let id = diag.orchestrator.read_dtc_count(mask)?;
        let count = diag
            .until(|event| match event {
                DiagEvent::DtcCountReceived { count, .. } => Some(Ok(*count)),
                other => failure(id, other).map(Err),
            })
            .await?;
        ctx.print_value(
            &serde_json::json!({ "status_mask": mask, "count": count }),
            &format!("{} DTC(s) match status mask 0x{:02X}", count, mask),
        );
        return Ok(());
    }

    let sub_function = parse_u8(sub_function, "sub-function")?;
    let id = diag.orchestrator.read_dtcs(sub_function, mask)?;
    let dtcs = diag
        .until(|event| match event {
            DiagEvent::DtcsReceived { dtcs, .. } => Some(Ok(dtcs.clone())),
            other => failure(id, other).map(Err),
        })
        .await?;

    if dtcs.is_empty() {
        ctx.info("No DTCs found");
        if !ctx.json {
            return Ok(());
        }
    }

    let rows: Vec<DtcRow> = dtcs.iter().map(DtcRow::from).collect();
    ctx.print(&rows);
    Ok(())
}

/// Clear diagnostic information for a DTC group
pub async fn clear_dtcs(diag: &mut DiagSession<'_>, group: &str, ctx: &OutputContext) -> Result<()> {
    let group = parse_can_id(group).map_err(|e| anyhow!("Invalid DTC group: {}", e))?;
    let id = diag.orchestrator.clear_dtcs(group)?;
    diag.response(id).await?;

    ctx.success(&format!("Cleared DTC group 0x{:06X}", group));
    Ok(())
}
