//! TesterPresent command

use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::sync::broadcast::error::RecvError;

use candiag::uds::{service_id, tester_present::ZERO_SUB_FUNCTION};

use super::DiagSession;
use crate::output::{spaced_hex, OutputContext};

/// Send one TesterPresent
///
/// A suppressed request gets no answer, so it counts as done once its
/// frame is on the bus.
pub async fn tester_present(diag: &mut DiagSession<'_>, suppress: bool, ctx: &OutputContext) -> Result<()> {
    if !suppress {
        let id = diag
            .orchestrator
            .send_raw(vec![service_id::TESTER_PRESENT, ZERO_SUB_FUNCTION])?;
        let response = diag.response(id).await?;
        ctx.success(&format!("ECU present: {}", spaced_hex(&response)));
        return Ok(());
    }

    let mut frames = diag.orchestrator.subscribe_frames();
    diag.orchestrator.keep_alive(true)?;
    let sent = async {
        loop {
            match frames.recv().await {
                Ok(frame) if frame.data.get(1) == Some(&service_id::TESTER_PRESENT) => {
                    return Ok(frame)
                }
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return Err(anyhow!("Connection closed")),
            }
        }
    };
    let frame = tokio::time::timeout(Duration::from_secs(2), sent)
        .await
        .map_err(|_| anyhow!("TesterPresent was not sent"))??;

    ctx.success(&format!("TesterPresent sent: {}", spaced_hex(&frame.data)));
    Ok(())
}
