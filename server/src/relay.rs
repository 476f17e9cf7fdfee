//! Minimal data dispatcher for the server
//!
//! Game semantics live elsewhere; the server only fans every inbound data item
//! out to the other connections. Relayed items keep their flags, so state
//! updates stay unreliable, and keep the originator stamped by the sender.

use crate::client_manager::ConnectionManager;
use log::{debug, trace};
use netplus_core::{DataHandler, DataItem, DualConnection, DualTransport, Packet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

pub struct RelayHandler {
    connections: Weak<ConnectionManager>,
    relayed: AtomicU64,
    loopbacks: AtomicU64,
}

impl RelayHandler {
    pub fn new(connections: &Arc<ConnectionManager>) -> Self {
        Self {
            connections: Arc::downgrade(connections),
            relayed: AtomicU64::new(0),
            loopbacks: AtomicU64::new(0),
        }
    }

    /// Item copies handed to other connections
    pub fn relayed(&self) -> u64 {
        self.relayed.load(Ordering::Relaxed)
    }

    pub fn loopbacks(&self) -> u64 {
        self.loopbacks.load(Ordering::Relaxed)
    }

    fn relay(&self, from: &Arc<DualConnection>, item: DataItem) {
        let Some(connections) = self.connections.upgrade() else {
            return;
        };
        let item = DataItem {
            exclude: Some(from.id()),
            ..item
        };

        for target in connections.snapshot() {
            if target.id() == from.id() || !target.is_alive() {
                continue;
            }
            match target.send(Packet::Data(item.clone())) {
                Ok(()) => {
                    self.relayed.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => debug!("Relay {} -> {} failed: {}", from.id(), target.id(), e),
            }
        }
    }
}

impl DataHandler<DualTransport> for RelayHandler {
    fn handle(&self, connection: &Arc<DualConnection>, packet: Packet) {
        match packet {
            Packet::Data(item) => self.relay(connection, item),
            Packet::Loopback(item) => {
                self.loopbacks.fetch_add(1, Ordering::Relaxed);
                trace!(
                    "Loopback on connection {} channel {} ({} bytes)",
                    connection.id(),
                    item.channel,
                    item.payload.len()
                );
            }
            other => trace!("Ignoring {:?} from connection {}", other, connection.id()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netplus_core::{ConnectionConfig, ConnectionInfo, ItemFlags, Result, SendQueue, TransportKind, Wire};
    use std::net::SocketAddr;
    use tokio::runtime::Handle;

    struct NullWire;

    impl Wire for NullWire {
        fn schedule_flush(&self, _: ConnectionInfo, _: TransportKind, _: &Arc<SendQueue>) -> Result<()> {
            Ok(())
        }

        fn write_now(&self, _: ConnectionInfo, _: TransportKind, _: Packet) -> Result<()> {
            Ok(())
        }
    }

    fn setup(clients: usize) -> (Arc<ConnectionManager>, Arc<RelayHandler>, Vec<Arc<DualConnection>>) {
        let manager = Arc::new(ConnectionManager::new(clients));
        let handler = Arc::new(RelayHandler::new(&manager));
        let config = ConnectionConfig {
            merge_window_ms: 60_000,
            ..Default::default()
        };
        let connections = (0..clients)
            .map(|n| {
                let addr: SocketAddr = format!("127.0.0.1:{}", 7000 + n).parse().unwrap();
                let handler: Arc<RelayHandler> = Arc::clone(&handler);
                manager
                    .add_client(addr, 0, |id| {
                        DualTransport::connect(
                            ConnectionInfo { id, uid: id as u64 },
                            config.clone(),
                            handler,
                            Arc::new(NullWire),
                            Handle::current(),
                        )
                    })
                    .unwrap()
            })
            .collect();
        (manager, handler, connections)
    }

    fn queued(connection: &Arc<DualConnection>, kind: TransportKind) -> usize {
        connection.transport().queue(kind).len()
    }

    #[tokio::test]
    async fn test_data_is_relayed_to_everyone_else() {
        let (_manager, handler, connections) = setup(3);

        connections[0].receive(Packet::Data(DataItem::reliable(1, vec![9])));

        assert_eq!(handler.relayed(), 2);
        assert_eq!(queued(&connections[0], TransportKind::Tcp), 0);
        assert_eq!(queued(&connections[1], TransportKind::Tcp), 1);
        assert_eq!(queued(&connections[2], TransportKind::Tcp), 1);
    }

    #[tokio::test]
    async fn test_relay_preserves_flags_and_routes_over_udp() {
        let (_manager, _handler, connections) = setup(2);
        connections[1]
            .transport()
            .init_udp("127.0.0.1:9100".parse().unwrap(), 4100)
            .unwrap();

        let item = DataItem::new(2, ItemFlags::UPDATE, vec![1, 2]);
        connections[0].receive(Packet::Data(item));

        assert_eq!(queued(&connections[1], TransportKind::Udp), 1);
        assert_eq!(queued(&connections[1], TransportKind::Tcp), 0);
    }

    #[tokio::test]
    async fn test_dead_targets_are_skipped() {
        let (_manager, handler, connections) = setup(3);
        connections[2].dispose(netplus_core::DisconnectReason::Requested);

        connections[0].receive(Packet::Data(DataItem::reliable(0, vec![])));
        assert_eq!(handler.relayed(), 1);
    }

    #[tokio::test]
    async fn test_loopback_is_counted_not_relayed() {
        let (_manager, handler, connections) = setup(2);

        connections[0]
            .send(Packet::Loopback(DataItem::reliable(0, vec![1])))
            .unwrap();

        assert_eq!(handler.loopbacks(), 1);
        assert_eq!(handler.relayed(), 0);
        assert_eq!(queued(&connections[1], TransportKind::Tcp), 0);
    }
}
