//! Session command - diagnostic session control

use anyhow::Result;

use candiag::{DiagEvent, SessionType};

use super::{failure, parse_u8, DiagSession};
use crate::output::OutputContext;

/// Parse a session name or number
pub fn parse_session(s: &str) -> Result<SessionType> {
    let session = match s.to_lowercase().as_str() {
        "default" => SessionType::Default,
        "programming" => SessionType::Programming,
        "extended" => SessionType::Extended,
        "eol" | "endofline" | "end_of_line" => SessionType::EndOfLine,
        other => SessionType::from(parse_u8(other, "session type")?),
    };
    Ok(session)
}

/// Change diagnostic session
pub async fn session(diag: &mut DiagSession<'_>, session_type: &str, ctx: &OutputContext) -> Result<()> {
    let target = parse_session(session_type)?;
    let id = diag.orchestrator.change_session(target)?;

    let entered = diag
        .until(|event| match event {
            DiagEvent::SessionChanged { session_type, .. } => Some(Ok(*session_type)),
            other => failure(id, other).map(Err),
        })
        .await?;

    ctx.success(&format!("Session changed to {}", entered));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_session() {
        assert_eq!(parse_session("Extended").unwrap(), SessionType::Extended);
        assert_eq!(parse_session("0x02").unwrap(), SessionType::Programming);
        assert_eq!(parse_session("0x60").unwrap(), SessionType::Vendor(0x60));
        assert!(parse_session("sport").is_err());
    }
}
