//! Session identity tracking.
//!
//! Every live connection owns exactly one [`Identity`]. Identities are stored
//! by uuid with a second index from connection id to uuid; both indexes are
//! only touched through the methods below so they never drift apart.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use tandem_shared::protocol::UserInfo;
use tandem_shared::types::{ConnectionId, UserId};

/// A connected user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub uuid: UserId,
    pub template_id: String,
    pub is_requesting_help: bool,
    pub is_joining_help: bool,
    pub connection_id: ConnectionId,
    pub connected_at: DateTime<Utc>,
}

impl Identity {
    pub fn info(&self) -> UserInfo {
        UserInfo {
            uuid: self.uuid,
            template_id: self.template_id.clone(),
            is_requesting_help: self.is_requesting_help,
        }
    }
}

#[derive(Debug, Default)]
pub struct IdentityRegistry {
    by_uuid: HashMap<UserId, Identity>,
    by_connection: HashMap<ConnectionId, UserId>,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a fresh identity for `connection_id`. A connection that already
    /// had one gets it replaced.
    pub fn create(&mut self, connection_id: ConnectionId) -> Identity {
        if let Some(previous) = self.by_connection.remove(&connection_id) {
            self.by_uuid.remove(&previous);
        }

        let identity = Identity {
            uuid: UserId::new(),
            template_id: String::new(),
            is_requesting_help: false,
            is_joining_help: false,
            connection_id,
            connected_at: Utc::now(),
        };

        self.by_connection.insert(connection_id, identity.uuid);
        self.by_uuid.insert(identity.uuid, identity.clone());

        debug!(uuid = %identity.uuid, connection = %connection_id, "Identity created");
        identity
    }

    pub fn get_by_connection(&self, connection_id: ConnectionId) -> Option<&Identity> {
        self.by_connection
            .get(&connection_id)
            .and_then(|uuid| self.by_uuid.get(uuid))
    }

    pub fn get_by_uuid(&self, uuid: &UserId) -> Option<&Identity> {
        self.by_uuid.get(uuid)
    }

    pub fn set_requesting_help(&mut self, uuid: &UserId, value: bool) -> bool {
        match self.by_uuid.get_mut(uuid) {
            Some(identity) => {
                identity.is_requesting_help = value;
                true
            }
            None => false,
        }
    }

    pub fn set_joining_help(&mut self, uuid: &UserId, value: bool) -> bool {
        match self.by_uuid.get_mut(uuid) {
            Some(identity) => {
                identity.is_joining_help = value;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, connection_id: ConnectionId) -> bool {
        match self.by_connection.remove(&connection_id) {
            Some(uuid) => {
                self.by_uuid.remove(&uuid);
                debug!(uuid = %uuid, connection = %connection_id, "Identity removed");
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.by_uuid.len()
    }
}
