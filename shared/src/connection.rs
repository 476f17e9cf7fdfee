//! Connection lifecycle, filter chains and transport-agnostic send routing
//!
//! A `Connection` owns identity and liveness, runs the send/receive filter chains
//! and hands surviving items either to the transport's queue selector or, when no
//! queue applies, straight to the transport. The transport itself is a type
//! parameter so specialised connections (see `dual`) keep their own state next
//! to the shared lifecycle.
//!
//! Disposal is the only way a connection dies. It is idempotent, may race from any
//! number of threads, and fires every disconnect observer exactly once. Observers
//! registered after death run immediately.

use crate::error::{DisconnectReason, Result};
use crate::send_queue::SendQueue;
use crate::Packet;
use log::{info, trace};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionInfo {
    /// Small id, unique among live connections of one endpoint
    pub id: u32,
    /// Opaque long-lived identity
    pub uid: u64,
}

/// Result of one filter in a chain; `Stop` silently drops the item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterVerdict {
    Continue,
    Stop,
}

pub type Filter = Box<dyn Fn(&ConnectionInfo, &Packet) -> FilterVerdict + Send + Sync>;
pub type DisconnectObserver = Box<dyn FnOnce(&ConnectionInfo, &DisconnectReason) + Send>;

/// Byte-level side of a connection
pub trait Transport: Send + Sync + Sized + 'static {
    /// Queue an outbound item belongs to, or `None` to send it without queueing
    fn select_queue(&self, packet: &Packet) -> Option<Arc<SendQueue>>;

    fn send_immediate(&self, packet: Packet) -> Result<()>;

    /// Releases queues and timers; called once from `Connection::dispose`
    fn close(&self);
}

/// Receives every inbound item that survived the receive filters
pub trait DataHandler<T: Transport>: Send + Sync {
    fn handle(&self, connection: &Arc<Connection<T>>, packet: Packet);
}

enum Lifecycle {
    Alive {
        observers: Vec<(u64, DisconnectObserver)>,
    },
    Disposed(DisconnectReason),
}

pub struct Connection<T: Transport> {
    info: ConnectionInfo,
    alive: AtomicBool,
    lifecycle: Mutex<Lifecycle>,
    next_observer: AtomicU64,
    send_filters: RwLock<Vec<Filter>>,
    receive_filters: RwLock<Vec<Filter>>,
    handler: Arc<dyn DataHandler<T>>,
    transport: T,
}

impl<T: Transport> Connection<T> {
    pub fn new(info: ConnectionInfo, handler: Arc<dyn DataHandler<T>>, transport: T) -> Arc<Self> {
        Self::new_cyclic(info, handler, |_| transport)
    }

    /// Builds a connection whose transport keeps a weak handle back to it
    pub fn new_cyclic<F>(info: ConnectionInfo, handler: Arc<dyn DataHandler<T>>, make_transport: F) -> Arc<Self>
    where
        F: FnOnce(&Weak<Self>) -> T,
    {
        Arc::new_cyclic(|me| Self {
            info,
            alive: AtomicBool::new(true),
            lifecycle: Mutex::new(Lifecycle::Alive {
                observers: Vec::new(),
            }),
            next_observer: AtomicU64::new(1),
            send_filters: RwLock::new(Vec::new()),
            receive_filters: RwLock::new(Vec::new()),
            handler,
            transport: make_transport(me),
        })
    }

    pub fn info(&self) -> ConnectionInfo {
        self.info
    }

    pub fn id(&self) -> u32 {
        self.info.id
    }

    pub fn uid(&self) -> u64 {
        self.info.uid
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn add_send_filter<F>(&self, filter: F)
    where
        F: Fn(&ConnectionInfo, &Packet) -> FilterVerdict + Send + Sync + 'static,
    {
        self.send_filters.write().push(Box::new(filter));
    }

    pub fn add_receive_filter<F>(&self, filter: F)
    where
        F: Fn(&ConnectionInfo, &Packet) -> FilterVerdict + Send + Sync + 'static,
    {
        self.receive_filters.write().push(Box::new(filter));
    }

    /// Routes an outbound item. Vetoed items and sends on a dead connection are
    /// dropped without error; queue overflow is reported after the connection died.
    pub fn send(self: &Arc<Self>, mut packet: Packet) -> Result<()> {
        if !self.is_alive() {
            trace!("Dropping send on dead connection {}", self.info.id);
            return Ok(());
        }

        if packet.is_loopback() {
            self.handler.handle(self, packet);
            return Ok(());
        }

        packet.generate_meta(&self.info);
        if !packet.filter_send(&self.info) || !self.passes(&self.send_filters, &packet) {
            return Ok(());
        }
        if !self.is_alive() {
            return Ok(());
        }

        match self.transport.select_queue(&packet) {
            Some(queue) => queue.enqueue(packet),
            None => self.transport.send_immediate(packet),
        }
    }

    /// Runs the receive filters and hands the item to the data handler
    pub fn receive(self: &Arc<Self>, packet: Packet) {
        if !self.is_alive() || !self.passes(&self.receive_filters, &packet) {
            return;
        }
        self.handler.handle(self, packet);
    }

    /// Registers an observer for end of life. On a dead connection the observer
    /// runs before this returns and no handle is given out.
    pub fn on_disconnect<F>(&self, observer: F) -> Option<u64>
    where
        F: FnOnce(&ConnectionInfo, &DisconnectReason) + Send + 'static,
    {
        let mut lifecycle = self.lifecycle.lock();
        match &mut *lifecycle {
            Lifecycle::Alive { observers } => {
                let id = self.next_observer.fetch_add(1, Ordering::Relaxed);
                observers.push((id, Box::new(observer)));
                Some(id)
            }
            Lifecycle::Disposed(reason) => {
                let reason = reason.clone();
                drop(lifecycle);
                observer(&self.info, &reason);
                None
            }
        }
    }

    pub fn remove_disconnect_observer(&self, id: u64) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        match &mut *lifecycle {
            Lifecycle::Alive { observers } => {
                let before = observers.len();
                observers.retain(|(observer_id, _)| *observer_id != id);
                observers.len() != before
            }
            Lifecycle::Disposed(_) => false,
        }
    }

    /// Ends the connection. Returns false if it was already disposed.
    pub fn dispose(&self, reason: DisconnectReason) -> bool {
        let observers = {
            let mut lifecycle = self.lifecycle.lock();
            let previous = std::mem::replace(&mut *lifecycle, Lifecycle::Disposed(reason.clone()));
            match previous {
                Lifecycle::Alive { observers } => observers,
                already @ Lifecycle::Disposed(_) => {
                    *lifecycle = already;
                    return false;
                }
            }
        };
        self.alive.store(false, Ordering::Release);

        info!("Connection {} disposed: {}", self.info.id, reason);
        self.transport.close();
        for (_, observer) in observers {
            observer(&self.info, &reason);
        }
        true
    }

    /// Reason recorded at disposal, if the connection is dead
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        match &*self.lifecycle.lock() {
            Lifecycle::Alive { .. } => None,
            Lifecycle::Disposed(reason) => Some(reason.clone()),
        }
    }

    fn passes(&self, chain: &RwLock<Vec<Filter>>, packet: &Packet) -> bool {
        chain
            .read()
            .iter()
            .all(|filter| filter(&self.info, packet) == FilterVerdict::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NetError;
    use crate::DataItem;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::runtime::Handle;

    #[derive(Default)]
    struct RecordingTransport {
        queue: Option<Arc<SendQueue>>,
        immediate: Mutex<Vec<Packet>>,
        closes: AtomicUsize,
    }

    impl Transport for RecordingTransport {
        fn select_queue(&self, packet: &Packet) -> Option<Arc<SendQueue>> {
            if packet.is_unreliable() {
                return None;
            }
            self.queue.clone()
        }

        fn send_immediate(&self, packet: Packet) -> Result<()> {
            self.immediate.lock().push(packet);
            Ok(())
        }

        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
            if let Some(queue) = &self.queue {
                queue.dispose();
            }
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        packets: Mutex<Vec<Packet>>,
    }

    impl DataHandler<RecordingTransport> for RecordingHandler {
        fn handle(&self, _connection: &Arc<Connection<RecordingTransport>>, packet: Packet) {
            self.packets.lock().push(packet);
        }
    }

    fn info() -> ConnectionInfo {
        ConnectionInfo { id: 5, uid: 55 }
    }

    fn connection() -> (Arc<Connection<RecordingTransport>>, Arc<RecordingHandler>) {
        let handler = Arc::new(RecordingHandler::default());
        let conn = Connection::new(info(), handler.clone(), RecordingTransport::default());
        (conn, handler)
    }

    fn item(n: u8) -> Packet {
        Packet::Data(DataItem::reliable(0, vec![n]))
    }

    #[test]
    fn test_send_without_queue_goes_out_immediately() {
        let (conn, _) = connection();
        conn.send(item(1)).unwrap();

        let sent = conn.transport().immediate.lock();
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            Packet::Data(data) => assert_eq!(data.meta.map(|m| m.sender), Some(5)),
            _ => panic!("Wrong packet type"),
        }
    }

    #[test]
    fn test_loopback_bypasses_transport() {
        let (conn, handler) = connection();
        conn.send(Packet::Loopback(DataItem::reliable(0, vec![1])))
            .unwrap();

        assert!(conn.transport().immediate.lock().is_empty());
        assert_eq!(handler.packets.lock().len(), 1);
    }

    #[test]
    fn test_send_filter_vetoes_silently() {
        let (conn, _) = connection();
        conn.add_send_filter(|_, packet| match packet {
            Packet::Data(item) if item.payload == vec![2] => FilterVerdict::Stop,
            _ => FilterVerdict::Continue,
        });

        assert!(conn.send(item(1)).is_ok());
        assert!(conn.send(item(2)).is_ok());
        assert_eq!(conn.transport().immediate.lock().len(), 1);
    }

    #[test]
    fn test_excluded_target_is_skipped() {
        let (conn, _) = connection();
        let mut data = DataItem::reliable(0, vec![1]);
        data.exclude = Some(5);
        conn.send(Packet::Data(data)).unwrap();
        assert!(conn.transport().immediate.lock().is_empty());
    }

    #[test]
    fn test_receive_filter_chain() {
        let (conn, handler) = connection();
        conn.add_receive_filter(|_, _| FilterVerdict::Continue);
        conn.add_receive_filter(|_, packet| {
            if matches!(packet, Packet::Keepalive { .. }) {
                FilterVerdict::Stop
            } else {
                FilterVerdict::Continue
            }
        });

        conn.receive(Packet::Keepalive { sequence: 1 });
        conn.receive(item(3));

        assert_eq!(*handler.packets.lock(), vec![item(3)]);
    }

    #[test]
    fn test_dead_connection_drops_traffic() {
        let (conn, handler) = connection();
        assert!(conn.dispose(DisconnectReason::Requested));

        conn.send(item(1)).unwrap();
        conn.receive(item(2));

        assert!(conn.transport().immediate.lock().is_empty());
        assert!(handler.packets.lock().is_empty());
        assert_eq!(conn.disconnect_reason(), Some(DisconnectReason::Requested));
    }

    #[test]
    fn test_late_observer_runs_immediately() {
        let (conn, _) = connection();
        conn.dispose(DisconnectReason::HeartbeatTimeout);

        let seen = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        let handle = conn.on_disconnect(move |info, reason| {
            *slot.lock() = Some((info.id, reason.clone()));
        });

        assert!(handle.is_none());
        assert_eq!(
            *seen.lock(),
            Some((5, DisconnectReason::HeartbeatTimeout))
        );
    }

    #[test]
    fn test_removed_observer_does_not_fire() {
        let (conn, _) = connection();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let id = conn
            .on_disconnect(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        assert!(conn.remove_disconnect_observer(id));
        assert!(!conn.remove_disconnect_observer(id));
        conn.dispose(DisconnectReason::Requested);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_concurrent_dispose_fires_once() {
        let (conn, _) = connection();
        let fired = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let counter = Arc::clone(&fired);
            conn.on_disconnect(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        let winners: usize = (0..8)
            .map(|_| {
                let conn = Arc::clone(&conn);
                std::thread::spawn(move || conn.dispose(DisconnectReason::Requested))
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|handle| handle.join().unwrap() as usize)
            .sum();

        assert_eq!(winners, 1);
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert_eq!(conn.transport().closes.load(Ordering::SeqCst), 1);
        assert!(!conn.is_alive());
    }

    #[tokio::test]
    async fn test_queue_overflow_disposes_connection() {
        let handler = Arc::new(RecordingHandler::default());
        let conn = Connection::new_cyclic(info(), handler, |me: &Weak<Connection<RecordingTransport>>| {
            let owner = me.clone();
            let queue = SendQueue::new(
                "tcp",
                1,
                Duration::from_secs(5),
                Handle::current(),
                Arc::new(|queue: &Arc<SendQueue>| -> Result<()> {
                    queue.take_batch();
                    queue.signal_flushed();
                    Ok(())
                }),
                Box::new(move |err: &NetError| {
                    if let Some(conn) = owner.upgrade() {
                        conn.dispose(DisconnectReason::from(err));
                    }
                }),
            );
            RecordingTransport {
                queue: Some(queue),
                ..Default::default()
            }
        });

        conn.send(item(1)).unwrap();
        assert!(matches!(
            conn.send(item(2)),
            Err(NetError::QueueOverflow { .. })
        ));
        assert!(!conn.is_alive());
        assert_eq!(conn.disconnect_reason(), Some(DisconnectReason::QueueOverflow));
    }
}
