//! Relay error types.
//!
//! Every failure the relay can hit while handling a client event. None of
//! them are fatal to the process: validation errors go back to the client
//! that caused them, delivery errors end the affected call, and stale events
//! are dropped without a reply.
//!
//! ```text
//! RelayError
//! ├── Validation (100-199)   reported to the originating client
//! │   ├── InvalidTarget       callee unknown or self-call
//! │   ├── CallInProgress      pair already has an active call
//! │   ├── NotPermitted        event sent by the wrong participant
//! │   ├── InvalidPayload      signal payload failed the type check
//! │   └── MalformedMessage    frame could not be decoded
//! ├── Delivery (200-299)     ends the call, survivor is notified
//! │   ├── TargetUnavailable   recipient disconnected
//! │   └── TransportFailure    recipient's outbound queue is full
//! └── Session (300-399)      never surfaced
//!     └── StaleSession        call already ended or never existed
//! ```

use thiserror::Error;

use crate::identity::Identity;

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    // ========================================================================
    // Validation Errors (100-199)
    // ========================================================================

    /// The callee is not connected, or is the caller itself
    #[error("Invalid call target: {0}")]
    InvalidTarget(String),

    /// A call between these two identities is already ringing or connected
    #[error("A call with {0} is already in progress")]
    CallInProgress(Identity),

    /// The event is not allowed for the sender's role in the call
    #[error("Not permitted: {0}")]
    NotPermitted(String),

    /// Signaling payload failed the sanity check
    #[error("Invalid signal payload: {0}")]
    InvalidPayload(String),

    /// The frame could not be decoded into a client event
    #[error("Invalid message format: {0}")]
    MalformedMessage(String),

    // ========================================================================
    // Delivery Errors (200-299)
    // ========================================================================

    /// The recipient is no longer connected
    #[error("Target unavailable: {0}")]
    TargetUnavailable(Identity),

    /// The recipient's outbound queue rejected the message
    #[error("Transport failure delivering to {0}")]
    TransportFailure(Identity),

    // ========================================================================
    // Session Errors (300-399)
    // ========================================================================

    /// The call this event refers to has already ended
    #[error("Call session is no longer active")]
    StaleSession,
}

impl RelayError {
    /// Numeric code sent to clients alongside the message.
    pub fn code(&self) -> i32 {
        match self {
            RelayError::InvalidTarget(_) => 100,
            RelayError::CallInProgress(_) => 101,
            RelayError::NotPermitted(_) => 102,
            RelayError::InvalidPayload(_) => 103,
            RelayError::MalformedMessage(_) => 104,

            RelayError::TargetUnavailable(_) => 200,
            RelayError::TransportFailure(_) => 201,

            RelayError::StaleSession => 300,
        }
    }

    /// Whether the error is swallowed instead of being reported to the sender.
    pub fn is_silent(&self) -> bool {
        matches!(self, RelayError::StaleSession)
    }
}
