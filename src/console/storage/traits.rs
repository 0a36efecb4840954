//! Storage trait definitions for MQTT client bookkeeping.
//!
//! The MQTT adapter keeps one entry per remote client identity. The trait
//! lets the adapter run against any concurrency-safe map; the default
//! implementation uses `DashMap`.

use std::sync::Arc;

use crate::console::mqtt::VirtualConnection;
use crate::console::session::Console;

/// A client's virtual connection and the console reading from it.
#[derive(Clone)]
pub struct ClientRef {
    pub connection: Arc<VirtualConnection>,
    pub console: Console,
}

/// Trait for client storage operations.
///
/// Implementations must be thread-safe (`Send + Sync`): inbound messages
/// for unrelated clients are handled concurrently without an adapter lock.
pub trait ClientStorage: Send + Sync {
    /// Insert a client unless one is already stored under `client_uuid`.
    ///
    /// Returns `false`, leaving the existing entry untouched, when the
    /// identity is taken.
    fn insert_new(&self, client_uuid: &str, client: ClientRef) -> bool;

    /// Get a client by identity.
    fn get(&self, client_uuid: &str) -> Option<ClientRef>;

    /// Remove a client, but only if its entry still holds `connection`.
    fn remove_connection(&self, client_uuid: &str, connection: &Arc<VirtualConnection>) -> Option<ClientRef>;

    /// Remove every client, returning them.
    fn drain(&self) -> Vec<ClientRef>;

    /// Check if a client exists.
    fn contains(&self, client_uuid: &str) -> bool;

    /// Number of live clients.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get all client identities.
    fn client_ids(&self) -> Vec<String>;
}
