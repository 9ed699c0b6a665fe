//! Connection identities.
//!
//! An identity is the address other clients dial. It is minted when a
//! WebSocket connects and dies with it. Allocation sits behind a trait so the
//! transport never decides what an identity looks like.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque per-connection call address.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    #[cfg(test)]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Identity {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Mints identities for new connections.
pub trait IdentityAllocator: Send + Sync {
    fn allocate(&self) -> Identity;
}

/// Random UUIDv4 identities. Unguessable, never reused.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidAllocator;

impl IdentityAllocator for UuidAllocator {
    fn allocate(&self) -> Identity {
        Identity(Uuid::new_v4().to_string())
    }
}

/// Hands out a fixed list of identities in order. Test scenarios use it to
/// get readable names like `A1` and `B1`.
#[cfg(test)]
pub struct ScriptedAllocator {
    names: std::sync::Mutex<std::collections::VecDeque<String>>,
}

#[cfg(test)]
impl ScriptedAllocator {
    pub fn new(names: &[&str]) -> Self {
        Self {
            names: std::sync::Mutex::new(names.iter().map(|n| n.to_string()).collect()),
        }
    }
}

#[cfg(test)]
impl IdentityAllocator for ScriptedAllocator {
    fn allocate(&self) -> Identity {
        let next = self.names.lock().unwrap().pop_front();
        match next {
            Some(name) => Identity(name),
            None => UuidAllocator.allocate(),
        }
    }
}
