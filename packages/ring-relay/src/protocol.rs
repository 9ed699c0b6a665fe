//! Relay protocol message definitions.
//!
//! Every WebSocket text frame is one JSON event: `{"event": name, "data": payload}`.
//! Events without a payload omit `data`. Signal payloads (SDP offers/answers,
//! ICE candidates) are carried as opaque JSON and never inspected.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identity::Identity;

/// Roster snapshot as broadcast to clients: identity → identity.
pub type Roster = BTreeMap<Identity, Identity>;

// ── Client → Relay ────────────────────────────────────────────────────────────

/// Events sent from a client to the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Ring another identity with an SDP offer.
    #[serde(rename_all = "camelCase")]
    CallUser {
        user_to_call: Identity,
        signal_data: Value,
        /// Ignored; the relay uses the connection's own identity.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<Identity>,
    },

    /// Answer a ringing call.
    AcceptCall { signal: Value, to: Target },

    /// Reject a ringing call (callee side).
    DeclineCall { to: Target },

    /// Withdraw an unanswered call (caller side).
    CancelCall { to: Target },

    /// Hang up a connected call.
    EndCall { to: Target },

    /// Text message to the other participant of a connected call.
    Message { to: Identity, message: String },

    /// Further negotiation payload (trickled ICE candidate, renegotiation)
    /// for the other participant of an active call.
    Signal { to: Identity, signal: Value },

    /// Keepalive.
    Ping,
}

/// The `to` field of lifecycle events.
///
/// Browser clients send either the peer's identity or a `[self, peer]` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Target {
    One(Identity),
    Many(Vec<Identity>),
}

impl Target {
    /// The identity on the other end of the call from `me`'s point of view.
    pub fn peer_of(&self, me: &Identity) -> Option<Identity> {
        match self {
            Target::One(id) => Some(id.clone()),
            Target::Many(ids) => ids.iter().find(|id| *id != me).cloned(),
        }
    }
}

// ── Relay → Client ────────────────────────────────────────────────────────────

/// Events sent from the relay to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerMessage {
    /// The identity assigned to this connection. Sent once, first.
    #[serde(rename = "yourID")]
    YourId(Identity),

    /// Everyone currently connected.
    AllUsers(Roster),

    /// Incoming call with the caller's offer.
    Hey { signal: Value, from: Identity },

    /// The callee accepted; carries the answer.
    CallAccepted(Value),

    /// The callee rejected the call, or it went unanswered.
    CallDeclined,

    /// The caller withdrew, or the caller went away before the call connected.
    CallCancelled,

    /// The other participant hung up or went away.
    CallEnded,

    /// Text from the other participant.
    Message { from: Identity, message: String },

    /// Further negotiation payload from the other participant.
    Signal { from: Identity, signal: Value },

    /// Keepalive reply.
    Pong,

    /// Something the client sent was rejected.
    Error { code: i32, message: String },
}

impl ServerMessage {
    /// Event name as it appears on the wire, for logging.
    pub fn event_name(&self) -> &'static str {
        match self {
            ServerMessage::YourId(_) => "yourID",
            ServerMessage::AllUsers(_) => "allUsers",
            ServerMessage::Hey { .. } => "hey",
            ServerMessage::CallAccepted(_) => "callAccepted",
            ServerMessage::CallDeclined => "callDeclined",
            ServerMessage::CallCancelled => "callCancelled",
            ServerMessage::CallEnded => "callEnded",
            ServerMessage::Message { .. } => "message",
            ServerMessage::Signal { .. } => "signal",
            ServerMessage::Pong => "pong",
            ServerMessage::Error { .. } => "error",
        }
    }
}

impl From<&crate::error::RelayError> for ServerMessage {
    fn from(err: &crate::error::RelayError) -> Self {
        ServerMessage::Error {
            code: err.code(),
            message: err.to_string(),
        }
    }
}
