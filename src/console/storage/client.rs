//! DashMap-based client storage implementation.
//!
//! Provides lock-free concurrent access to MQTT clients using `DashMap`.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::console::mqtt::VirtualConnection;

use super::traits::{ClientRef, ClientStorage};

/// DashMap-based implementation of `ClientStorage`.
#[derive(Default)]
pub struct DashMapClientStorage {
    clients: DashMap<String, ClientRef>,
}

impl DashMapClientStorage {
    /// Create a new client storage instance.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ClientStorage for DashMapClientStorage {
    fn insert_new(&self, client_uuid: &str, client: ClientRef) -> bool {
        match self.clients.entry(client_uuid.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(client);
                true
            }
        }
    }

    fn get(&self, client_uuid: &str) -> Option<ClientRef> {
        self.clients.get(client_uuid).map(|entry| entry.value().clone())
    }

    fn remove_connection(
        &self,
        client_uuid: &str,
        connection: &Arc<VirtualConnection>,
    ) -> Option<ClientRef> {
        self.clients
            .remove_if(client_uuid, |_, client| {
                Arc::ptr_eq(&client.connection, connection)
            })
            .map(|(_, client)| client)
    }

    fn drain(&self) -> Vec<ClientRef> {
        let ids = self.client_ids();
        ids.iter()
            .filter_map(|id| self.clients.remove(id).map(|(_, client)| client))
            .collect()
    }

    fn contains(&self, client_uuid: &str) -> bool {
        self.clients.contains_key(client_uuid)
    }

    fn len(&self) -> usize {
        self.clients.len()
    }

    fn client_ids(&self) -> Vec<String> {
        self.clients.iter().map(|e| e.key().clone()).collect()
    }
}
