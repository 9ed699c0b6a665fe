//! Server state management.
//!
//! Owns the presence registry and every active call. Calls are keyed by the
//! unordered pair of participants, so a pair can have at most one call in
//! flight. Each call's transitions run under its DashMap shard guard, which
//! makes check-then-transition atomic per call without a global lock.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{RelayError, Result};
use crate::identity::{Identity, IdentityAllocator, UuidAllocator};
use crate::presence::{ClientSender, Presence};
use crate::protocol::ServerMessage;
use crate::relay::{check_signal, SignalRelay};
use crate::session::{CallEvent, CallSession, CallState, Notice, Outcome};

/// Default outbound queue depth per client.
const DEFAULT_CLIENT_BUFFER: usize = 64;

/// Default maximum size of one inbound WebSocket message (64 KiB).
const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// Default time a call may ring before it is ended (1 minute).
const DEFAULT_RING_TIMEOUT_SECS: i64 = 60;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub port: u16,
    /// Outbound messages buffered per client before sends start failing
    pub client_buffer: usize,
    /// Largest accepted inbound frame, in bytes
    pub max_message_bytes: usize,
    pub ring_timeout_secs: i64,
    /// Redirect plain-HTTP requests (as reported by the proxy) to HTTPS
    pub production: bool,
    /// Directory holding the built browser client, served as a fallback
    pub static_dir: Option<PathBuf>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            client_buffer: DEFAULT_CLIENT_BUFFER,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            ring_timeout_secs: DEFAULT_RING_TIMEOUT_SECS,
            production: false,
            static_dir: None,
        }
    }
}

/// The two participants of a call, in a fixed order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PairKey(Identity, Identity);

impl PairKey {
    pub fn new(a: &Identity, b: &Identity) -> Self {
        if a <= b {
            Self(a.clone(), b.clone())
        } else {
            Self(b.clone(), a.clone())
        }
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.0 == *identity || self.1 == *identity
    }

    /// The member of the pair that is not `identity`.
    pub fn other(&self, identity: &Identity) -> Option<&Identity> {
        if self.0 == *identity {
            Some(&self.1)
        } else if self.1 == *identity {
            Some(&self.0)
        } else {
            None
        }
    }
}

/// Shared server state.
#[derive(Clone)]
pub struct RelayState {
    /// Connected identities and their outbound queues.
    pub presence: Presence,

    /// Delivery of signals and call notices.
    pub relay: SignalRelay,

    /// Participant pair → active call.
    /// Ended calls are removed right after their final transition.
    pub sessions: Arc<DashMap<PairKey, CallSession>>,

    /// Server configuration.
    pub config: RelayConfig,
}

impl RelayState {
    /// Create a new relay state with random UUID identities.
    pub fn new(config: RelayConfig) -> Self {
        Self::with_allocator(config, Arc::new(UuidAllocator))
    }

    /// Create a new relay state with a custom identity allocator.
    pub fn with_allocator(config: RelayConfig, allocator: Arc<dyn IdentityAllocator>) -> Self {
        let presence = Presence::new(allocator);
        Self {
            relay: SignalRelay::new(presence.clone()),
            presence,
            sessions: Arc::new(DashMap::new()),
            config,
        }
    }

    // ── Client Management ─────────────────────────────────────────────────

    /// A fresh outbound queue sized for one client.
    pub fn outbound_channel(&self) -> (ClientSender, mpsc::Receiver<ServerMessage>) {
        mpsc::channel(self.config.client_buffer.max(1))
    }

    /// Register a new connection. The client is told its identity and
    /// everyone gets the new roster.
    pub fn connect(&self, sender: ClientSender) -> Identity {
        self.presence.connect(sender)
    }

    /// Tear down a connection: drop it from the roster and end every call it
    /// was part of. Runs at most once per identity; repeated calls are no-ops.
    pub fn disconnect(&self, identity: &Identity) {
        if !self.presence.disconnect(identity) {
            return;
        }

        let pairs: Vec<PairKey> = self
            .sessions
            .iter()
            .filter(|entry| entry.key().contains(identity))
            .map(|entry| entry.key().clone())
            .collect();

        for pair in pairs {
            if let Some(peer) = pair.other(identity) {
                // Stale here means the call ended concurrently; nothing to do.
                let _ = self.apply(identity, peer, CallEvent::Disconnected);
            }
        }
    }

    // ── Call Lifecycle ────────────────────────────────────────────────────

    /// Ring `callee` with `offer`. Returns the new call's session ID.
    pub fn call_user(&self, caller: &Identity, callee: &Identity, offer: Value) -> Result<Uuid> {
        check_signal(&offer)?;
        if caller == callee {
            return Err(RelayError::InvalidTarget("cannot call yourself".to_string()));
        }
        if !self.presence.is_online(callee) {
            return Err(RelayError::InvalidTarget(format!("{} is not connected", callee)));
        }

        let session_id = match self.sessions.entry(PairKey::new(caller, callee)) {
            Entry::Occupied(slot) if slot.get().is_active() => {
                return Err(RelayError::CallInProgress(callee.clone()));
            }
            entry => {
                let (session, hey) = CallSession::ring(caller.clone(), callee.clone(), offer)?;
                // If the offer can't be delivered the attempt is abandoned
                // before anyone else can see it.
                self.relay.forward(&hey.to, hey.message)?;
                let session_id = session.id;
                entry.insert(session);
                session_id
            }
        };

        tracing::info!(
            session_id = %session_id,
            caller = %caller,
            callee = %callee,
            "Call ringing"
        );

        // The callee may have dropped between the presence check and insert,
        // after its own disconnect sweep had already run.
        if !self.presence.is_online(callee) {
            let _ = self.apply(callee, caller, CallEvent::Disconnected);
        }

        Ok(session_id)
    }

    /// Callee answers the call from `caller`.
    pub fn accept_call(&self, callee: &Identity, caller: &Identity, answer: Value) -> Result<()> {
        check_signal(&answer)?;
        self.apply(callee, caller, CallEvent::Accept { answer })
    }

    /// Callee rejects the call from `caller`.
    pub fn decline_call(&self, callee: &Identity, caller: &Identity) -> Result<()> {
        self.apply(callee, caller, CallEvent::Decline)
    }

    /// Caller withdraws the call to `callee`.
    pub fn cancel_call(&self, caller: &Identity, callee: &Identity) -> Result<()> {
        self.apply(caller, callee, CallEvent::Cancel)
    }

    /// Either participant hangs up.
    pub fn end_call(&self, actor: &Identity, peer: &Identity) -> Result<()> {
        self.apply(actor, peer, CallEvent::End)
    }

    /// Forward a further negotiation payload (e.g. a trickled ICE candidate)
    /// between the participants of an active call.
    pub fn relay_signal(&self, from: &Identity, to: &Identity, signal: Value) -> Result<()> {
        check_signal(&signal)?;
        let pair = PairKey::new(from, to);

        let ended = {
            let Some(mut session) = self.sessions.get_mut(&pair) else {
                return Err(RelayError::StaleSession);
            };
            if !session.is_active() {
                return Err(RelayError::StaleSession);
            }
            session.note_signal(signal.clone());
            let notice = Notice {
                to: to.clone(),
                message: ServerMessage::Signal {
                    from: from.clone(),
                    signal,
                },
            };
            self.deliver(&mut session, vec![notice]);
            !session.is_active()
        };

        if ended {
            self.sessions.remove_if(&pair, |_, session| !session.is_active());
        }
        Ok(())
    }

    /// End calls that have rung longer than the configured timeout.
    /// Called periodically by the sweep task. Returns how many were ended.
    pub fn sweep_unanswered(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<(Identity, Identity)> = self
            .sessions
            .iter()
            .filter(|entry| entry.is_unanswered_after(self.config.ring_timeout_secs, now))
            .map(|entry| (entry.caller.clone(), entry.callee.clone()))
            .collect();

        let mut ended = 0usize;
        for (caller, callee) in expired {
            // An answer may have landed since the scan; that wins.
            if self.apply(&caller, &callee, CallEvent::Timeout).is_ok() {
                ended += 1;
            }
        }

        if ended > 0 {
            tracing::debug!(count = ended, "Ended unanswered calls");
        }
        ended
    }

    /// Run one lifecycle event against the call between `actor` and `peer`.
    ///
    /// Dispatch and notice delivery happen under the call's shard guard, so
    /// concurrent events for the same call are applied one at a time and the
    /// first terminal event wins.
    fn apply(&self, actor: &Identity, peer: &Identity, event: CallEvent) -> Result<()> {
        let pair = PairKey::new(actor, peer);

        let ended = {
            let Some(mut session) = self.sessions.get_mut(&pair) else {
                return Err(RelayError::StaleSession);
            };
            match session.dispatch(actor, event) {
                Outcome::Applied(notices) => self.deliver(&mut session, notices),
                Outcome::Stale => return Err(RelayError::StaleSession),
                Outcome::Rejected(err) => return Err(err),
            }

            match (session.state(), session.end_reason()) {
                (CallState::Ended, Some(reason)) => {
                    tracing::info!(
                        session_id = %session.id,
                        caller = %session.caller,
                        callee = %session.callee,
                        reason = reason.as_str(),
                        "Call ended"
                    );
                    true
                }
                (state, _) => {
                    tracing::info!(
                        session_id = %session.id,
                        state = state.as_str(),
                        "Call transitioned"
                    );
                    false
                }
            }
        };

        if ended {
            self.sessions.remove_if(&pair, |_, session| !session.is_active());
        }
        Ok(())
    }

    /// Deliver transition notices. A participant that can't be reached ends
    /// the call; the survivor is told on a best-effort basis.
    fn deliver(&self, session: &mut CallSession, notices: Vec<Notice>) {
        for notice in notices {
            let Err(err) = self.relay.forward(&notice.to, notice.message) else {
                continue;
            };
            tracing::warn!(
                session_id = %session.id,
                to = %notice.to,
                error = %err,
                "Call notice undeliverable"
            );
            if let Outcome::Applied(fallout) = session.dispatch(&notice.to, CallEvent::Unreachable) {
                for notice in fallout {
                    let _ = self.relay.forward(&notice.to, notice.message);
                }
            }
        }
    }

    // ── Text Channel ──────────────────────────────────────────────────────

    /// Relay a chat message to the other participant of a connected call.
    ///
    /// Fire-and-forget: messages outside a connected call, or to a client
    /// that can't take them, are dropped without telling the sender.
    pub fn send_message(&self, from: &Identity, to: &Identity, body: String) {
        let Some(session) = self.sessions.get(&PairKey::new(from, to)) else {
            tracing::debug!(from = %from, to = %to, "Message outside a call, dropped");
            return;
        };
        if session.state() != CallState::Accepted {
            tracing::debug!(
                session_id = %session.id,
                state = session.state().as_str(),
                "Message before call connected, dropped"
            );
            return;
        }

        // Held guard keeps one sender's messages in submission order.
        let message = ServerMessage::Message {
            from: from.clone(),
            message: body,
        };
        if self.relay.forward(to, message).is_err() {
            tracing::debug!(session_id = %session.id, "Message undeliverable, dropped");
        }
    }

    // ── Inspection ────────────────────────────────────────────────────────

    /// State of the active call between two identities, if any.
    #[cfg(test)]
    pub fn call_state(&self, a: &Identity, b: &Identity) -> Option<CallState> {
        self.sessions
            .get(&PairKey::new(a, b))
            .map(|session| session.state())
    }

    /// Number of active calls in each non-terminal state: (ringing, accepted).
    pub fn call_counts(&self) -> (usize, usize) {
        self.sessions
            .iter()
            .fold((0, 0), |(ringing, accepted), entry| match entry.state() {
                CallState::Ringing => (ringing + 1, accepted),
                CallState::Accepted => (ringing, accepted + 1),
                CallState::Ended => (ringing, accepted),
            })
    }
}
