//! Monitor command - stream diagnostic events

use anyhow::Result;
use tokio::sync::broadcast::error::RecvError;

use super::DiagSession;
use crate::output::OutputContext;

/// Print events, and optionally transmitted frames, until Ctrl+C
pub async fn monitor(diag: &mut DiagSession<'_>, frames: bool, ctx: &OutputContext) -> Result<()> {
    ctx.info(&format!(
        "Monitoring 0x{:03X} ...",
        diag.orchestrator.addressing().map_or(0, |a| a.tx_id)
    ));
    ctx.info("Press Ctrl+C to stop");

    let mut events = diag.orchestrator.subscribe();
    let mut tx_frames = diag.orchestrator.subscribe_frames();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => ctx.event(&event),
                Err(RecvError::Lagged(n)) => ctx.warn(&format!("{} event(s) missed", n)),
                Err(RecvError::Closed) => break,
            },
            frame = tx_frames.recv(), if frames => match frame {
                Ok(frame) => ctx.frame(&frame),
                Err(RecvError::Lagged(n)) => ctx.warn(&format!("{} frame(s) missed", n)),
                Err(RecvError::Closed) => break,
            },
        }
    }

    let dropped = diag.orchestrator.dropped_frames();
    if dropped > 0 {
        ctx.warn(&format!("{} inbound frame(s) dropped on queue overflow", dropped));
    }
    Ok(())
}
