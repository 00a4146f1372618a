//! Reset command - ECU reset

use anyhow::Result;

use candiag::uds::reset_type;

use super::{parse_u8, DiagSession};
use crate::output::OutputContext;

fn parse_reset_type(s: &str) -> Result<u8> {
    let value = match s.to_lowercase().as_str() {
        "hard" => reset_type::HARD_RESET,
        "key_off_on" | "keyoffon" => reset_type::KEY_OFF_ON_RESET,
        "soft" => reset_type::SOFT_RESET,
        other => parse_u8(other, "reset type")?,
    };
    Ok(value)
}

/// Reset ECU
pub async fn reset(diag: &mut DiagSession<'_>, kind: &str, ctx: &OutputContext) -> Result<()> {
    let kind = parse_reset_type(kind)?;
    ctx.info(&format!("Resetting ECU (type 0x{:02X})...", kind));

    let id = diag.orchestrator.ecu_reset(kind)?;
    diag.response(id).await?;

    ctx.success("ECU reset, back in default session");
    Ok(())
}
