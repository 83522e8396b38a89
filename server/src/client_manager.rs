//! Bounded registry of connected clients
//!
//! The registry is owned by the network loop and never touched from another
//! thread, so it needs no synchronisation. It enforces the server's capacity
//! limit and hands out client IDs, which increase monotonically and are never
//! reused during a service's lifetime.

use log::{info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::sync::mpsc;

use crate::client::{Client, ClientId, Outbound};

/// Tracks every registered client up to a fixed capacity
pub struct ClientRegistry {
    /// Connected clients indexed by their ID
    clients: HashMap<ClientId, Client>,
    /// Next ID handed out on insert
    next_client_id: u32,
    /// Maximum number of concurrent clients allowed
    max_clients: usize,
}

impl ClientRegistry {
    /// Creates an empty registry that holds at most `max_clients` clients
    ///
    /// IDs start at 1 so that a zero ID never names a real client.
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: HashMap::with_capacity(max_clients),
            next_client_id: 1,
            max_clients,
        }
    }

    /// Registers a new connection.
    ///
    /// Returns `None` without consuming an ID when the registry is full,
    /// and also once the ID space is used up; callers are expected to check
    /// [`is_full`](Self::is_full) before accepting in the first place.
    pub fn insert(
        &mut self,
        addr: SocketAddr,
        outbound: mpsc::Sender<Outbound>,
    ) -> Option<&mut Client> {
        if self.is_full() {
            return None;
        }

        let Some(next_client_id) = self.next_client_id.checked_add(1) else {
            warn!("Client IDs exhausted, refusing {}", addr);
            return None;
        };
        let id = ClientId(self.next_client_id);
        self.next_client_id = next_client_id;

        info!("Client {} connected from {}", id, addr);
        Some(
            self.clients
                .entry(id)
                .or_insert_with(|| Client::new(id, addr, outbound)),
        )
    }

    /// Unregisters a client and hands it back to the caller, who decides
    /// when the connection is dropped
    pub fn remove(&mut self, id: ClientId) -> Option<Client> {
        let client = self.clients.remove(&id)?;
        info!(
            "Client {} disconnected after {:.1}s",
            id,
            client.connected_for().as_secs_f32()
        );
        Some(client)
    }

    /// Looks up a registered client for mutation
    ///
    /// Returns `None` for IDs that were never issued or have been removed.
    pub fn get_mut(&mut self, id: ClientId) -> Option<&mut Client> {
        self.clients.get_mut(&id)
    }

    /// Whether `id` currently names a registered client
    pub fn contains(&self, id: ClientId) -> bool {
        self.clients.contains_key(&id)
    }

    /// Snapshot of the registered IDs, in ascending order
    ///
    /// The snapshot stays valid while clients are inserted or removed, so
    /// callers can walk it and modify the registry along the way.
    pub fn ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self.clients.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Number of registered clients
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether no client is registered
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Maximum number of clients this registry accepts
    pub fn capacity(&self) -> usize {
        self.max_clients
    }

    /// Whether another insert would be refused for lack of space
    pub fn is_full(&self) -> bool {
        self.clients.len() >= self.max_clients
    }
}
