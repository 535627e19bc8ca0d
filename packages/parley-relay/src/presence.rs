//! Presence directory.
//!
//! Maps each principal to its single live connection (last writer wins) and
//! keeps the index of connections bound to privileged principals. Both live
//! behind one mutex so a rebind updates them together. The lock is held only
//! for map mutations, never across I/O or `.await`.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use crate::connection::{ConnectionHandle, ConnectionId};

#[derive(Default)]
struct Directory {
    /// Principal id → bound connection.
    bindings: HashMap<String, ConnectionHandle>,
    /// Connections bound to privileged principals.
    privileged: HashSet<ConnectionId>,
}

/// Process-wide principal → connection map. Lost on restart.
#[derive(Default)]
pub struct PresenceDirectory {
    inner: Mutex<Directory>,
}

impl PresenceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `principal_id` to `handle`, superseding any existing binding.
    ///
    /// Returns the superseded handle when it belonged to a different
    /// connection. That connection is dropped from the privileged index.
    pub fn bind(
        &self,
        principal_id: &str,
        privileged: bool,
        handle: ConnectionHandle,
    ) -> Option<ConnectionHandle> {
        let new_id = handle.id();
        let previous = {
            let mut dir = self.inner.lock();
            let previous = dir.bindings.insert(principal_id.to_string(), handle);
            if let Some(ref old) = previous {
                dir.privileged.remove(&old.id());
            }
            if privileged {
                dir.privileged.insert(new_id);
            }
            previous
        };

        match previous {
            Some(old) if old.id() != new_id => {
                tracing::info!(
                    principal = principal_id,
                    old_connection = %old.id(),
                    new_connection = %new_id,
                    "Presence superseded"
                );
                Some(old)
            }
            _ => {
                tracing::debug!(principal = principal_id, connection = %new_id, "Presence bound");
                None
            }
        }
    }

    /// Current connection for `principal_id`, if any.
    pub fn lookup(&self, principal_id: &str) -> Option<ConnectionHandle> {
        self.inner.lock().bindings.get(principal_id).cloned()
    }

    pub fn is_online(&self, principal_id: &str) -> bool {
        self.inner.lock().bindings.contains_key(principal_id)
    }

    /// Remove the binding only if it still points at `connection_id`.
    /// A stale disconnect racing a fresh authenticate is a no-op.
    pub fn unbind(&self, principal_id: &str, connection_id: ConnectionId) -> bool {
        let removed = {
            let mut dir = self.inner.lock();
            let current = dir.bindings.get(principal_id).map(|h| h.id());
            if current == Some(connection_id) {
                dir.bindings.remove(principal_id);
                dir.privileged.remove(&connection_id);
                true
            } else {
                false
            }
        };

        if removed {
            tracing::debug!(principal = principal_id, connection = %connection_id, "Presence unbound");
        } else {
            tracing::debug!(
                principal = principal_id,
                connection = %connection_id,
                "Ignoring stale unbind"
            );
        }
        removed
    }

    /// Handles of every connection bound to a privileged principal.
    pub fn privileged_listeners(&self) -> Vec<ConnectionHandle> {
        let dir = self.inner.lock();
        dir.bindings
            .values()
            .filter(|h| dir.privileged.contains(&h.id()))
            .cloned()
            .collect()
    }

    pub fn online_count(&self) -> usize {
        self.inner.lock().bindings.len()
    }

    pub fn privileged_count(&self) -> usize {
        self.inner.lock().privileged.len()
    }
}
