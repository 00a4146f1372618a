//! Unlock command - security access

use anyhow::{anyhow, Result};

use candiag::parse::parse_hex_bytes;
use candiag::uds::service_id;
use candiag::{DiagEvent, KeyAlgorithm, RequestId};

use super::{failure, parse_u8, DiagSession};
use crate::output::{spaced_hex, OutputContext};

/// Perform security access (unlock ECU)
///
/// With `key` the seed is printed and the given key sent; otherwise the key
/// is computed with the configured algorithm.
pub async fn unlock(
    diag: &mut DiagSession<'_>,
    level: &str,
    key: Option<&str>,
    algorithm: KeyAlgorithm,
    ctx: &OutputContext,
) -> Result<()> {
    let level = parse_u8(level, "security level")?;
    ctx.info(&format!(
        "Requesting seed for security level 0x{:02X}...",
        level
    ));

    let unlocked = match key {
        Some(key) => with_key(diag, level, parse_hex_bytes(key)?, ctx).await?,
        None => with_algorithm(diag, level, algorithm).await?,
    };

    if unlocked {
        ctx.success("Security access granted");
    } else {
        ctx.success("Security level already unlocked");
    }
    Ok(())
}

async fn with_key(
    diag: &mut DiagSession<'_>,
    level: u8,
    key: Vec<u8>,
    ctx: &OutputContext,
) -> Result<bool> {
    let id = diag.orchestrator.request_seed(level)?;
    let seed = diag
        .until(|event| match event {
            DiagEvent::SecurityStatusChanged {
                level: got,
                unlocked: false,
                seed,
            } if *got == level && !seed.is_empty() => Some(Ok(Some(seed.clone()))),
            other if zero_seed(id, other) => Some(Ok(None)),
            other => failure(id, other).map(Err),
        })
        .await?;

    let Some(seed) = seed else {
        return Ok(false);
    };
    ctx.info(&format!("Seed received: {}", spaced_hex(&seed)));
    ctx.info(&format!("Sending key: {}", spaced_hex(&key)));

    let id = diag.orchestrator.send_key(level + 1, key)?;
    diag.response(id).await?;
    Ok(true)
}

async fn with_algorithm(diag: &mut DiagSession<'_>, level: u8, algorithm: KeyAlgorithm) -> Result<bool> {
    let id = diag.orchestrator.unlock(level, algorithm.provider())?;
    diag.until(|event| match event {
        DiagEvent::SecurityStatusChanged {
            level: got,
            unlocked: true,
            ..
        } if *got == level => Some(Ok(true)),
        other if zero_seed(id, other) => Some(Ok(false)),
        // The key request is queued by the orchestrator, so match by service
        DiagEvent::ResponseReceived {
            service,
            success: false,
            nrc,
            ..
        } if *service == service_id::name(service_id::SECURITY_ACCESS) => Some(Err(match nrc {
            Some(nrc) => anyhow!("Security access rejected: {}", nrc),
            None => anyhow!("Security access failed: no valid response"),
        })),
        DiagEvent::ErrorOccurred { message, .. } => Some(Err(anyhow!("{}", message))),
        _ => None,
    })
    .await
}

/// Whether `event` is the seed response to `id` carrying an all-zero seed
fn zero_seed(id: RequestId, event: &DiagEvent) -> bool {
    match event {
        DiagEvent::ResponseReceived {
            id: got,
            success: true,
            data,
            ..
        } if *got == id => data.get(2..).map_or(true, |seed| seed.iter().all(|&b| b == 0)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed_response(data: Vec<u8>) -> DiagEvent {
        DiagEvent::ResponseReceived {
            id: 1,
            service: "SecurityAccess",
            success: true,
            data,
            nrc: None,
        }
    }

    #[test]
    fn test_zero_seed() {
        assert!(zero_seed(1, &seed_response(vec![0x67, 0x01, 0x00, 0x00])));
        assert!(!zero_seed(1, &seed_response(vec![0x67, 0x01, 0x12, 0x34])));
        assert!(!zero_seed(2, &seed_response(vec![0x67, 0x01, 0x00, 0x00])));
    }
}
