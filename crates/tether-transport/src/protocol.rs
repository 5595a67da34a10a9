//! Wire protocol: one envelope per JSON text frame.

use tether_core::Envelope;
use thiserror::Error;

/// Frame decoding error.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Envelope has an empty command")]
    EmptyCommand,
}

/// Encode an envelope as frame text.
///
/// # Errors
/// Returns error if the payload cannot be serialized.
pub fn encode(envelope: &Envelope) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(envelope)?)
}

/// Decode frame bytes (text or binary) into an envelope.
///
/// # Errors
/// Returns error if the bytes are not an envelope.
pub fn decode(bytes: &[u8]) -> Result<Envelope, ProtocolError> {
    let envelope: Envelope = serde_json::from_slice(bytes)?;
    if envelope.command.trim().is_empty() {
        return Err(ProtocolError::EmptyCommand);
    }
    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tether_core::CorrelationId;

    use super::*;

    #[test]
    fn decode_accepts_binary_json() {
        let bytes = br#"{"command":"RUN","data":{"job_id":"a"},"correlation_id":"7"}"#;
        let env = decode(bytes).unwrap();
        assert_eq!(env.command, "RUN");
        assert_eq!(env.data, json!({ "job_id": "a" }));
        assert_eq!(env.correlation_id, Some(CorrelationId::from("7")));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(decode(b"not json"), Err(ProtocolError::Json(_))));
    }

    #[test]
    fn decode_rejects_empty_command() {
        assert!(matches!(
            decode(br#"{"command":"  "}"#),
            Err(ProtocolError::EmptyCommand)
        ));
    }

    #[test]
    fn encode_is_single_line() {
        let env = Envelope::new("hello", json!({ "slots": 2, "text": "a\nb" }));
        let text = encode(&env).unwrap();
        assert!(!text.contains('\n'));
        assert_eq!(decode(text.as_bytes()).unwrap(), env);
    }
}
