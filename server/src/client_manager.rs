//! Registry of live connections
//!
//! This module keeps track of every accepted connection:
//! - capacity-limited admission and small-id allocation
//! - the UDP pairing token handed out in `Welcome`
//! - the datagram source address each connection paired from, so the UDP
//!   receive task can route datagrams without decoding them first
//!
//! Entries are removed by a disconnect observer installed when the connection is
//! admitted, so the registry never holds a disposed connection for long.

use log::{debug, info};
use netplus_core::{DualConnection, NetError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

/// A connection plus what the server knows about how it reached us
///
/// Each entry keeps:
/// - The connection itself, shared with the socket tasks and pool roles
/// - Both peer addresses, the datagram one only once pairing succeeded
/// - The pairing token, which never leaves the server except in `Welcome`
pub struct Client {
    pub connection: Arc<DualConnection>,
    /// Peer address of the reliable stream
    pub tcp_addr: SocketAddr,
    /// Secret the peer must echo in `UdpHello`
    pub udp_token: u64,
    /// Source address of the paired datagram path, if any
    pub udp_addr: Option<SocketAddr>,
    /// When the handshake admitted this connection
    pub connected_at: Instant,
}

/// Lookup tables guarded together so pairing can update both atomically
#[derive(Default)]
struct Registry {
    clients: HashMap<u32, Client>,
    by_udp_addr: HashMap<SocketAddr, u32>,
    next_id: u32,
}

impl Registry {
    /// Next id not held by a live connection; ids start at 1
    fn allocate_id(&mut self) -> u32 {
        loop {
            self.next_id = self.next_id.wrapping_add(1);
            if self.next_id != 0 && !self.clients.contains_key(&self.next_id) {
                return self.next_id;
            }
        }
    }
}

/// Capacity-limited set of live connections, keyed by id and by datagram source
///
/// Every inbound datagram and every flush looks a connection up under the read
/// lock. Only admission, removal and pairing take the write lock.
pub struct ConnectionManager {
    registry: RwLock<Registry>,
    max_clients: usize,
}

impl ConnectionManager {
    /// Creates an empty registry that admits at most `max_clients` connections
    pub fn new(max_clients: usize) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            max_clients,
        }
    }

    /// Admits a new connection built by `make` for the allocated id
    ///
    /// The capacity check, id allocation and insertion happen under one write
    /// lock, so concurrent handshakes can never push the registry past
    /// `max_clients`. `make` runs under that lock and must not call back into
    /// the manager.
    ///
    /// Returns `None` when the server is full.
    pub fn add_client<F>(&self, tcp_addr: SocketAddr, udp_token: u64, make: F) -> Option<Arc<DualConnection>>
    where
        F: FnOnce(u32) -> Arc<DualConnection>,
    {
        let mut registry = self.registry.write();
        if registry.clients.len() >= self.max_clients {
            return None;
        }

        let id = registry.allocate_id();
        let connection = make(id);
        registry.clients.insert(
            id,
            Client {
                connection: Arc::clone(&connection),
                tcp_addr,
                udp_token,
                udp_addr: None,
                connected_at: Instant::now(),
            },
        );
        info!("Connection {} accepted from {}", id, tcp_addr);
        Some(connection)
    }

    /// Forgets a connection and its datagram address
    ///
    /// Called from the disconnect observer. Returns false if the connection was
    /// already gone, which happens when shutdown and a peer close race.
    pub fn remove_client(&self, id: u32) -> bool {
        let mut registry = self.registry.write();
        match registry.clients.remove(&id) {
            Some(client) => {
                if let Some(addr) = client.udp_addr {
                    registry.by_udp_addr.remove(&addr);
                }
                debug!(
                    "Connection {} removed after {:?}",
                    id,
                    client.connected_at.elapsed()
                );
                true
            }
            None => false,
        }
    }

    /// Looks a connection up by id
    ///
    /// Ids are reused after removal, so callers holding a `ConnectionInfo`
    /// should also compare the uid.
    pub fn get(&self, id: u32) -> Option<Arc<DualConnection>> {
        self.registry
            .read()
            .clients
            .get(&id)
            .map(|client| Arc::clone(&client.connection))
    }

    /// Routes a datagram to the connection paired from `addr`
    pub fn find_by_udp_addr(&self, addr: SocketAddr) -> Option<Arc<DualConnection>> {
        let registry = self.registry.read();
        registry
            .by_udp_addr
            .get(&addr)
            .and_then(|id| registry.clients.get(id))
            .map(|client| Arc::clone(&client.connection))
    }

    /// Checks a `UdpHello` and binds `addr` to the connection it names
    ///
    /// The token must match the one handed out in `Welcome`; a wrong token is
    /// reported as an unknown connection.
    /// Re-pairing from a new address (NAT rebinding) replaces the old one, and
    /// an address taken over from another connection is unbound there.
    pub fn pair_udp(&self, id: u32, udp_token: u64, addr: SocketAddr) -> Result<Arc<DualConnection>> {
        let mut registry = self.registry.write();
        let Registry {
            clients,
            by_udp_addr,
            ..
        } = &mut *registry;

        let client = clients
            .get_mut(&id)
            .filter(|client| client.udp_token == udp_token)
            .ok_or(NetError::UnknownConnection(id))?;

        if let Some(previous) = client.udp_addr.replace(addr) {
            by_udp_addr.remove(&previous);
        }
        if let Some(stale) = by_udp_addr.insert(addr, id) {
            if stale != id {
                if let Some(other) = clients.get_mut(&stale) {
                    other.udp_addr = None;
                }
            }
        }
        match clients.get(&id) {
            Some(client) => Ok(Arc::clone(&client.connection)),
            None => Err(NetError::UnknownConnection(id)),
        }
    }

    /// All live connections, for heartbeats and broadcasts
    pub fn snapshot(&self) -> Vec<Arc<DualConnection>> {
        self.registry
            .read()
            .clients
            .values()
            .map(|client| Arc::clone(&client.connection))
            .collect()
    }

    /// Peer address of the reliable stream, for logging
    pub fn tcp_addr(&self, id: u32) -> Option<SocketAddr> {
        self.registry.read().clients.get(&id).map(|client| client.tcp_addr)
    }

    /// Number of live connections
    pub fn len(&self) -> usize {
        self.registry.read().clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients
    }
}
