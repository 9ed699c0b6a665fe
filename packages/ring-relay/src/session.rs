//! Call session state machine.
//!
//! One `CallSession` per call attempt between two identities:
//!
//! ```text
//!            accept (callee)
//!  Ringing ─────────────────▶ Accepted
//!     │                          │
//!     │ decline / cancel /       │ end / disconnect /
//!     │ disconnect / timeout /   │ unreachable
//!     │ unreachable              │
//!     ▼                          ▼
//!   Ended ◀──────────────────────┘
//! ```
//!
//! All lifecycle input goes through [`CallSession::dispatch`], which either
//! applies the event and returns the notices to deliver, reports it as stale
//! (the call already moved on), or rejects it because the sender's role does
//! not allow it. The session does no I/O itself.

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::RelayError;
use crate::identity::Identity;
use crate::protocol::ServerMessage;

/// Lifecycle state of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Offer delivered, waiting for the callee
    Ringing,
    /// Callee answered, media negotiation under way or done
    Accepted,
    /// Terminal
    Ended,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Ringing => "ringing",
            CallState::Accepted => "accepted",
            CallState::Ended => "ended",
        }
    }
}

/// Why a call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Declined,
    Cancelled,
    HungUp,
    Disconnected,
    TimedOut,
    Unreachable,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::Declined => "declined",
            EndReason::Cancelled => "cancelled",
            EndReason::HungUp => "hung_up",
            EndReason::Disconnected => "disconnected",
            EndReason::TimedOut => "timed_out",
            EndReason::Unreachable => "unreachable",
        }
    }
}

/// Which side of the call a participant is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Caller,
    Callee,
}

/// Lifecycle input for an existing session.
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    /// Callee answers with an SDP answer.
    Accept { answer: Value },
    /// Callee rejects.
    Decline,
    /// Caller withdraws before an answer.
    Cancel,
    /// Either side hangs up.
    End,
    /// The acting participant's connection closed.
    Disconnected,
    /// A notice to the acting participant could not be delivered.
    Unreachable,
    /// Nobody answered in time.
    Timeout,
}

/// A message the relay owes a participant as the result of a transition.
#[derive(Debug, Clone, PartialEq)]
pub struct Notice {
    pub to: Identity,
    pub message: ServerMessage,
}

/// Result of dispatching an event.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Transition taken; deliver these notices in order.
    Applied(Vec<Notice>),
    /// The call already moved past the point this event refers to.
    Stale,
    /// The sender is not allowed to do this; nothing changed.
    Rejected(RelayError),
}

/// One call attempt between two identities.
#[derive(Debug, Clone)]
pub struct CallSession {
    pub id: Uuid,
    pub caller: Identity,
    pub callee: Identity,
    state: CallState,
    /// The last negotiation payload relayed for this call.
    pending_signal: Value,
    rang_at: DateTime<Utc>,
    end_reason: Option<EndReason>,
}

impl CallSession {
    /// Start ringing `callee`. Returns the session and the `hey` notice that
    /// carries the offer.
    pub fn ring(
        caller: Identity,
        callee: Identity,
        offer: Value,
    ) -> Result<(Self, Notice), RelayError> {
        if caller == callee {
            return Err(RelayError::InvalidTarget("cannot call yourself".to_string()));
        }

        let session = Self {
            id: Uuid::new_v4(),
            caller,
            callee,
            state: CallState::Ringing,
            pending_signal: offer,
            rang_at: Utc::now(),
            end_reason: None,
        };
        let notice = session.ring_notice();
        Ok((session, notice))
    }

    /// The `hey` that rings the callee with the current offer.
    fn ring_notice(&self) -> Notice {
        Notice {
            to: self.callee.clone(),
            message: ServerMessage::Hey {
                signal: self.pending_signal.clone(),
                from: self.caller.clone(),
            },
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state != CallState::Ended
    }

    pub fn end_reason(&self) -> Option<EndReason> {
        self.end_reason
    }

    #[cfg(test)]
    pub fn pending_signal(&self) -> &Value {
        &self.pending_signal
    }

    pub fn role_of(&self, identity: &Identity) -> Option<Role> {
        if *identity == self.caller {
            Some(Role::Caller)
        } else if *identity == self.callee {
            Some(Role::Callee)
        } else {
            None
        }
    }

    /// The other participant from `identity`'s point of view.
    pub fn peer_of(&self, identity: &Identity) -> Option<&Identity> {
        match self.role_of(identity)? {
            Role::Caller => Some(&self.callee),
            Role::Callee => Some(&self.caller),
        }
    }

    /// Whether a call that is still ringing has outlived `ttl_secs`.
    pub fn is_unanswered_after(&self, ttl_secs: i64, now: DateTime<Utc>) -> bool {
        self.state == CallState::Ringing && (now - self.rang_at).num_seconds() > ttl_secs
    }

    /// Record a further negotiation payload relayed during the call.
    pub fn note_signal(&mut self, signal: Value) {
        self.pending_signal = signal;
    }

    /// Apply a lifecycle event sent by `actor`.
    pub fn dispatch(&mut self, actor: &Identity, event: CallEvent) -> Outcome {
        if self.state == CallState::Ended {
            return Outcome::Stale;
        }
        let Some(role) = self.role_of(actor) else {
            return Outcome::Rejected(RelayError::NotPermitted(
                "not a participant in this call".to_string(),
            ));
        };

        match (self.state, event) {
            (CallState::Ringing, CallEvent::Accept { answer }) => {
                if role != Role::Callee {
                    return not_permitted("only the callee can accept a call");
                }
                self.state = CallState::Accepted;
                self.pending_signal = answer.clone();
                Outcome::Applied(vec![Notice {
                    to: self.caller.clone(),
                    message: ServerMessage::CallAccepted(answer),
                }])
            }

            (CallState::Ringing, CallEvent::Decline) => {
                if role != Role::Callee {
                    return not_permitted("only the callee can decline a call");
                }
                self.finish(EndReason::Declined, actor, ServerMessage::CallDeclined)
            }

            (CallState::Ringing, CallEvent::Cancel) => {
                if role != Role::Caller {
                    return not_permitted("only the caller can cancel a call");
                }
                self.finish(EndReason::Cancelled, actor, ServerMessage::CallCancelled)
            }

            // Hanging up before an answer withdraws or rejects the call.
            (CallState::Ringing, CallEvent::End) => match role {
                Role::Caller => self.dispatch(actor, CallEvent::Cancel),
                Role::Callee => self.dispatch(actor, CallEvent::Decline),
            },

            (CallState::Ringing, CallEvent::Disconnected) => {
                self.finish(EndReason::Disconnected, actor, ServerMessage::CallCancelled)
            }
            (CallState::Ringing, CallEvent::Unreachable) => {
                self.finish(EndReason::Unreachable, actor, ServerMessage::CallCancelled)
            }

            (CallState::Ringing, CallEvent::Timeout) => {
                self.state = CallState::Ended;
                self.end_reason = Some(EndReason::TimedOut);
                Outcome::Applied(vec![
                    Notice {
                        to: self.callee.clone(),
                        message: ServerMessage::CallCancelled,
                    },
                    Notice {
                        to: self.caller.clone(),
                        message: ServerMessage::CallDeclined,
                    },
                ])
            }

            (CallState::Accepted, CallEvent::End) => {
                self.finish(EndReason::HungUp, actor, ServerMessage::CallEnded)
            }
            (CallState::Accepted, CallEvent::Disconnected) => {
                self.finish(EndReason::Disconnected, actor, ServerMessage::CallEnded)
            }
            (CallState::Accepted, CallEvent::Unreachable) => {
                self.finish(EndReason::Unreachable, actor, ServerMessage::CallEnded)
            }

            // Accept/decline/cancel/timeout racing an answer that already won.
            (CallState::Accepted, _) => Outcome::Stale,

            (CallState::Ended, _) => Outcome::Stale,
        }
    }

    /// End the call and notify whoever is on the other side of `actor`.
    fn finish(&mut self, reason: EndReason, actor: &Identity, message: ServerMessage) -> Outcome {
        self.state = CallState::Ended;
        self.end_reason = Some(reason);
        let Some(peer) = self.peer_of(actor).cloned() else {
            return Outcome::Applied(Vec::new());
        };
        Outcome::Applied(vec![Notice { to: peer, message }])
    }
}

fn not_permitted(reason: &str) -> Outcome {
    Outcome::Rejected(RelayError::NotPermitted(reason.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn a() -> Identity {
        Identity::from("A1")
    }

    fn b() -> Identity {
        Identity::from("B1")
    }

    fn ringing() -> CallSession {
        CallSession::ring(a(), b(), json!("O")).unwrap().0
    }

    fn accepted() -> CallSession {
        let mut session = ringing();
        session.dispatch(&b(), CallEvent::Accept { answer: json!("X") });
        session
    }

    fn notice(to: Identity, message: ServerMessage) -> Notice {
        Notice { to, message }
    }

    #[test]
    fn test_ring_sends_hey_to_callee() {
        let (session, hey) = CallSession::ring(a(), b(), json!("O")).unwrap();
        assert_eq!(session.state(), CallState::Ringing);
        assert_eq!(session.pending_signal(), &json!("O"));
        assert_eq!(
            hey,
            notice(
                b(),
                ServerMessage::Hey {
                    signal: json!("O"),
                    from: a()
                }
            )
        );
    }

    #[test]
    fn test_ring_self_is_invalid_target() {
        let err = CallSession::ring(a(), a(), json!("O")).unwrap_err();
        assert!(matches!(err, RelayError::InvalidTarget(_)));
    }

    #[test]
    fn test_callee_accepts() {
        let mut session = ringing();
        let outcome = session.dispatch(&b(), CallEvent::Accept { answer: json!("X") });
        assert_eq!(
            outcome,
            Outcome::Applied(vec![notice(a(), ServerMessage::CallAccepted(json!("X")))])
        );
        assert_eq!(session.state(), CallState::Accepted);
        assert_eq!(session.pending_signal(), &json!("X"));
    }

    #[test]
    fn test_caller_cannot_accept_own_call() {
        let mut session = ringing();
        let outcome = session.dispatch(&a(), CallEvent::Accept { answer: json!("X") });
        assert!(matches!(outcome, Outcome::Rejected(RelayError::NotPermitted(_))));
        assert_eq!(session.state(), CallState::Ringing);
    }

    #[test]
    fn test_accept_only_once() {
        let mut session = accepted();
        let outcome = session.dispatch(&b(), CallEvent::Accept { answer: json!("Y") });
        assert_eq!(outcome, Outcome::Stale);
        assert_eq!(session.pending_signal(), &json!("X"));
    }

    #[test]
    fn test_outsider_is_rejected() {
        let mut session = ringing();
        let outcome = session.dispatch(&Identity::from("C1"), CallEvent::Cancel);
        assert!(matches!(outcome, Outcome::Rejected(RelayError::NotPermitted(_))));
        assert!(session.is_active());
    }

    #[test]
    fn test_decline_notifies_caller() {
        let mut session = ringing();
        let outcome = session.dispatch(&b(), CallEvent::Decline);
        assert_eq!(
            outcome,
            Outcome::Applied(vec![notice(a(), ServerMessage::CallDeclined)])
        );
        assert_eq!(session.state(), CallState::Ended);
        assert_eq!(session.end_reason(), Some(EndReason::Declined));
    }

    #[test]
    fn test_caller_cannot_decline() {
        let mut session = ringing();
        assert!(matches!(
            session.dispatch(&a(), CallEvent::Decline),
            Outcome::Rejected(_)
        ));
    }

    #[test]
    fn test_cancel_notifies_callee() {
        let mut session = ringing();
        let outcome = session.dispatch(&a(), CallEvent::Cancel);
        assert_eq!(
            outcome,
            Outcome::Applied(vec![notice(b(), ServerMessage::CallCancelled)])
        );
        assert_eq!(session.end_reason(), Some(EndReason::Cancelled));
    }

    #[test]
    fn test_callee_cannot_cancel() {
        let mut session = ringing();
        assert!(matches!(
            session.dispatch(&b(), CallEvent::Cancel),
            Outcome::Rejected(_)
        ));
        assert!(session.is_active());
    }

    #[test]
    fn test_decline_twice_notifies_once() {
        let mut session = ringing();
        assert!(matches!(
            session.dispatch(&b(), CallEvent::Decline),
            Outcome::Applied(_)
        ));
        assert_eq!(session.dispatch(&b(), CallEvent::Decline), Outcome::Stale);
    }

    #[test]
    fn test_decline_after_cancel_is_stale() {
        let mut session = ringing();
        session.dispatch(&a(), CallEvent::Cancel);
        assert_eq!(session.dispatch(&b(), CallEvent::Decline), Outcome::Stale);
        assert_eq!(session.end_reason(), Some(EndReason::Cancelled));
    }

    #[test]
    fn test_accept_after_cancel_is_stale() {
        let mut session = ringing();
        session.dispatch(&a(), CallEvent::Cancel);
        let outcome = session.dispatch(&b(), CallEvent::Accept { answer: json!("X") });
        assert_eq!(outcome, Outcome::Stale);
        assert_eq!(session.state(), CallState::Ended);
    }

    #[test]
    fn test_cancel_after_accept_is_stale() {
        let mut session = accepted();
        assert_eq!(session.dispatch(&a(), CallEvent::Cancel), Outcome::Stale);
        assert_eq!(session.state(), CallState::Accepted);
    }

    #[test]
    fn test_end_from_either_side() {
        for (actor, peer) in [(a(), b()), (b(), a())] {
            let mut session = accepted();
            let outcome = session.dispatch(&actor, CallEvent::End);
            assert_eq!(
                outcome,
                Outcome::Applied(vec![notice(peer, ServerMessage::CallEnded)])
            );
            assert_eq!(session.end_reason(), Some(EndReason::HungUp));
        }
    }

    #[test]
    fn test_end_while_ringing_maps_to_cancel_or_decline() {
        let mut session = ringing();
        assert_eq!(
            session.dispatch(&a(), CallEvent::End),
            Outcome::Applied(vec![notice(b(), ServerMessage::CallCancelled)])
        );

        let mut session = ringing();
        assert_eq!(
            session.dispatch(&b(), CallEvent::End),
            Outcome::Applied(vec![notice(a(), ServerMessage::CallDeclined)])
        );
    }

    #[test]
    fn test_callee_disconnect_while_ringing_cancels_for_caller() {
        let mut session = ringing();
        let outcome = session.dispatch(&b(), CallEvent::Disconnected);
        assert_eq!(
            outcome,
            Outcome::Applied(vec![notice(a(), ServerMessage::CallCancelled)])
        );
        assert_eq!(session.end_reason(), Some(EndReason::Disconnected));
        assert_eq!(session.dispatch(&b(), CallEvent::Disconnected), Outcome::Stale);
    }

    #[test]
    fn test_disconnect_while_accepted_ends_for_survivor() {
        let mut session = accepted();
        let outcome = session.dispatch(&b(), CallEvent::Disconnected);
        assert_eq!(
            outcome,
            Outcome::Applied(vec![notice(a(), ServerMessage::CallEnded)])
        );
        assert_eq!(session.dispatch(&a(), CallEvent::End), Outcome::Stale);
    }

    #[test]
    fn test_unreachable_participant_ends_call() {
        let mut session = accepted();
        let outcome = session.dispatch(&a(), CallEvent::Unreachable);
        assert_eq!(
            outcome,
            Outcome::Applied(vec![notice(b(), ServerMessage::CallEnded)])
        );
        assert_eq!(session.end_reason(), Some(EndReason::Unreachable));
    }

    #[test]
    fn test_timeout_notifies_both_sides() {
        let mut session = ringing();
        let outcome = session.dispatch(&a(), CallEvent::Timeout);
        assert_eq!(
            outcome,
            Outcome::Applied(vec![
                notice(b(), ServerMessage::CallCancelled),
                notice(a(), ServerMessage::CallDeclined),
            ])
        );
        assert_eq!(session.end_reason(), Some(EndReason::TimedOut));
    }

    #[test]
    fn test_timeout_after_accept_is_stale() {
        let mut session = accepted();
        assert_eq!(session.dispatch(&a(), CallEvent::Timeout), Outcome::Stale);
    }

    #[test]
    fn test_unanswered_after_ttl() {
        let session = ringing();
        let now = Utc::now();
        assert!(session.is_unanswered_after(-1, now));
        assert!(!session.is_unanswered_after(60, now));
        assert!(!accepted().is_unanswered_after(-1, now));
    }

    #[test]
    fn test_peer_of() {
        let session = ringing();
        assert_eq!(session.peer_of(&a()), Some(&b()));
        assert_eq!(session.peer_of(&b()), Some(&a()));
        assert_eq!(session.peer_of(&Identity::from("C1")), None);
    }
}
