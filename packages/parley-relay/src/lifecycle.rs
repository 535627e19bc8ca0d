//! Connection lifecycle manager.
//!
//! Binds a connection to a principal on authenticate and releases it on
//! disconnect. Keeps its own connection → principal map because the
//! presence directory may already point the principal at a newer connection
//! by the time the old one closes.

use std::sync::Arc;

use dashmap::DashMap;

use crate::connection::{ConnectionHandle, ConnectionId};
use crate::error::{RelayError, Result};
use crate::identity::{IdentityProvider, Principal};
use crate::presence::PresenceDirectory;
use crate::protocol::ServerMessage;

pub struct ConnectionLifecycle {
    presence: Arc<PresenceDirectory>,
    identity: Arc<dyn IdentityProvider>,
    /// Connection → principal it is currently authenticated as.
    sessions: DashMap<ConnectionId, Principal>,
}

impl ConnectionLifecycle {
    pub fn new(presence: Arc<PresenceDirectory>, identity: Arc<dyn IdentityProvider>) -> Self {
        Self {
            presence,
            identity,
            sessions: DashMap::new(),
        }
    }

    /// Verify `credential` and bind the connection to the resulting principal.
    ///
    /// A principal already bound elsewhere is superseded: the old connection
    /// gets `session_replaced` and is no longer authenticated.
    pub async fn on_authenticate(
        &self,
        handle: &ConnectionHandle,
        credential: &str,
    ) -> Result<Principal> {
        let principal = match self.identity.verify(credential).await {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(connection = %handle.id(), error = %e, "Authentication rejected");
                return Err(e);
            }
        };

        // Same connection switching identity: release the old binding first.
        if let Some(previous) = self.sessions.insert(handle.id(), principal.clone()) {
            if previous.id != principal.id {
                self.presence.unbind(&previous.id, handle.id());
            }
        }

        if let Some(old) = self
            .presence
            .bind(&principal.id, principal.privileged, handle.clone())
        {
            self.sessions
                .remove_if(&old.id(), |_, bound| bound.id == principal.id);
            old.emit(ServerMessage::SessionReplaced);
        }

        tracing::info!(
            principal = principal.id.as_str(),
            privileged = principal.privileged,
            connection = %handle.id(),
            "Client authenticated"
        );
        Ok(principal)
    }

    /// Release whatever the connection was bound to. Returns the principal,
    /// if the connection was still authenticated.
    pub fn on_disconnect(&self, connection_id: ConnectionId) -> Option<Principal> {
        let (_, principal) = self.sessions.remove(&connection_id)?;
        self.presence.unbind(&principal.id, connection_id);

        tracing::info!(
            principal = principal.id.as_str(),
            connection = %connection_id,
            "Client disconnected"
        );
        Some(principal)
    }

    /// The principal this connection is authenticated as.
    pub fn principal_for(&self, connection_id: ConnectionId) -> Result<Principal> {
        self.sessions
            .get(&connection_id)
            .map(|entry| entry.value().clone())
            .ok_or(RelayError::NotAuthenticated)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
