//! Signaling relay.
//!
//! Moves negotiation payloads and call notices to a named identity. Payloads
//! are passed through untouched and never logged; the only inspection is a
//! shape check so obviously bogus signals are refused at the door.

use serde_json::Value;

use crate::error::{RelayError, Result};
use crate::identity::Identity;
use crate::presence::Presence;
use crate::protocol::ServerMessage;

#[derive(Clone)]
pub struct SignalRelay {
    presence: Presence,
}

impl SignalRelay {
    pub fn new(presence: Presence) -> Self {
        Self { presence }
    }

    /// Deliver `message` to `to` if it is connected.
    ///
    /// Messages to one recipient share a single FIFO queue, so a sender's
    /// events arrive in the order it submitted them.
    pub fn forward(&self, to: &Identity, message: ServerMessage) -> Result<()> {
        let event = message.event_name();
        self.presence.send(to, message).inspect_err(|e| {
            tracing::debug!(to = %to, event, error = %e, "Relay failed");
        })?;
        tracing::trace!(to = %to, event, "Relayed");
        Ok(())
    }
}

/// Sanity check for an SDP/ICE payload: a non-empty JSON object or string.
pub fn check_signal(payload: &Value) -> Result<()> {
    let kind = match payload {
        Value::Object(map) if !map.is_empty() => return Ok(()),
        Value::String(s) if !s.is_empty() => return Ok(()),
        Value::Object(_) | Value::String(_) => "empty",
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::Array(_) => "an array",
    };
    Err(RelayError::InvalidPayload(format!(
        "expected a session description or candidate, got {}",
        kind
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ScriptedAllocator;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    #[test]
    fn test_forward_delivers_payload_unchanged() {
        let presence = Presence::new(Arc::new(ScriptedAllocator::new(&["B1"])));
        let (tx, mut rx) = mpsc::channel(8);
        let b = presence.connect(tx);
        while rx.try_recv().is_ok() {}

        let relay = SignalRelay::new(presence);
        let signal = json!({"type": "offer", "sdp": "v=0\r\no=- 46117 2 IN IP4 127.0.0.1\r\n"});
        relay
            .forward(
                &b,
                ServerMessage::Hey {
                    signal: signal.clone(),
                    from: Identity::from("A1"),
                },
            )
            .unwrap();

        assert_eq!(
            rx.try_recv().unwrap(),
            ServerMessage::Hey {
                signal,
                from: Identity::from("A1")
            }
        );
    }

    #[test]
    fn test_forward_preserves_submission_order() {
        let presence = Presence::new(Arc::new(ScriptedAllocator::new(&["B1"])));
        let (tx, mut rx) = mpsc::channel(16);
        let b = presence.connect(tx);
        while rx.try_recv().is_ok() {}

        let relay = SignalRelay::new(presence);
        for i in 0..5 {
            relay
                .forward(
                    &b,
                    ServerMessage::Signal {
                        from: Identity::from("A1"),
                        signal: json!({ "candidate": i }),
                    },
                )
                .unwrap();
        }
        for i in 0..5 {
            match rx.try_recv().unwrap() {
                ServerMessage::Signal { signal, .. } => assert_eq!(signal["candidate"], i),
                other => panic!("Expected signal, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_forward_to_disconnected_is_unavailable() {
        let presence = Presence::new(Arc::new(ScriptedAllocator::new(&[])));
        let relay = SignalRelay::new(presence);
        let err = relay
            .forward(&Identity::from("B1"), ServerMessage::CallEnded)
            .unwrap_err();
        assert_eq!(err, RelayError::TargetUnavailable(Identity::from("B1")));
    }

    #[test]
    fn test_check_signal_accepts_sdp_and_strings() {
        assert!(check_signal(&json!({"type": "answer", "sdp": "v=0"})).is_ok());
        assert!(check_signal(&json!({"candidate": {"candidate": "candidate:1 1 UDP"}})).is_ok());
        assert!(check_signal(&json!("O")).is_ok());
    }

    #[test]
    fn test_check_signal_rejects_junk() {
        for bad in [json!(null), json!(42), json!(true), json!([1, 2]), json!({}), json!("")] {
            let err = check_signal(&bad).unwrap_err();
            assert!(matches!(err, RelayError::InvalidPayload(_)), "{:?}", bad);
        }
    }
}
