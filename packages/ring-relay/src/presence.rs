//! Presence registry.
//!
//! Tracks which identities are connected and owns their outbound queues.
//! Every membership change is followed by a roster broadcast to all clients.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::error::{RelayError, Result};
use crate::identity::{Identity, IdentityAllocator};
use crate::protocol::{Roster, ServerMessage};

/// A connected client's outbound queue.
pub type ClientSender = mpsc::Sender<ServerMessage>;

/// Identity → outbound queue for every live connection.
#[derive(Clone)]
pub struct Presence {
    clients: Arc<DashMap<Identity, ClientSender>>,
    allocator: Arc<dyn IdentityAllocator>,
}

impl Presence {
    pub fn new(allocator: Arc<dyn IdentityAllocator>) -> Self {
        Self {
            clients: Arc::new(DashMap::new()),
            allocator,
        }
    }

    /// Register a new connection and return the identity minted for it.
    ///
    /// The client receives `yourID` first, then everyone (the new client
    /// included) receives the updated roster.
    pub fn connect(&self, sender: ClientSender) -> Identity {
        let identity = loop {
            let candidate = self.allocator.allocate();
            if let Entry::Vacant(slot) = self.clients.entry(candidate.clone()) {
                slot.insert(sender);
                break candidate;
            }
            tracing::warn!(identity = %candidate, "Allocated identity already in use, retrying");
        };

        tracing::info!(identity = %identity, "Client connected");
        self.send_best_effort(&identity, ServerMessage::YourId(identity.clone()));
        self.broadcast_roster();
        identity
    }

    /// Remove a connection. Returns false if it was already gone, in which
    /// case nothing is broadcast.
    pub fn disconnect(&self, identity: &Identity) -> bool {
        if self.clients.remove(identity).is_none() {
            return false;
        }
        tracing::info!(identity = %identity, "Client disconnected");
        self.broadcast_roster();
        true
    }

    pub fn is_online(&self, identity: &Identity) -> bool {
        self.clients.contains_key(identity)
    }

    pub fn online_count(&self) -> usize {
        self.clients.len()
    }

    /// Snapshot of every connected identity.
    pub fn roster(&self) -> Roster {
        self.clients
            .iter()
            .map(|entry| (entry.key().clone(), entry.key().clone()))
            .collect()
    }

    /// Queue a message for a client without waiting.
    ///
    /// Fails with `TargetUnavailable` if the client is gone and with
    /// `TransportFailure` if its queue is full.
    pub fn send(&self, identity: &Identity, message: ServerMessage) -> Result<()> {
        let Some(sender) = self.clients.get(identity) else {
            return Err(RelayError::TargetUnavailable(identity.clone()));
        };
        match sender.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(RelayError::TransportFailure(identity.clone())),
            Err(TrySendError::Closed(_)) => Err(RelayError::TargetUnavailable(identity.clone())),
        }
    }

    /// Queue a message, dropping it if the client is gone or backed up.
    pub fn send_best_effort(&self, identity: &Identity, message: ServerMessage) -> bool {
        let event = message.event_name();
        match self.send(identity, message) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(identity = %identity, event, error = %e, "Dropped outbound message");
                false
            }
        }
    }

    /// Send the current roster to every connected client. Clients whose
    /// queues are full miss this update; the next one supersedes it anyway.
    pub fn broadcast_roster(&self) {
        let roster = self.roster();
        let mut dropped = 0usize;
        for entry in self.clients.iter() {
            if entry
                .value()
                .try_send(ServerMessage::AllUsers(roster.clone()))
                .is_err()
            {
                dropped += 1;
            }
        }
        if dropped > 0 {
            tracing::debug!(dropped, online = roster.len(), "Roster broadcast partially dropped");
        }
    }
}
