//! Pool roles that move bytes
//!
//! Socket tasks on the tokio runtime only read: every complete TCP frame or
//! datagram becomes an `InboundFrame` on the dispatch channel. Send queues only
//! schedule: a flush becomes an `OutboundJob` on the flush channel through
//! `ServerWire`. Pool threads running `DispatchRole` or `FlushRole` drain those
//! channels, so decode and encode cost shows up in the activity rates the
//! scheduler balances on.

use crate::client_manager::ConnectionManager;
use crate::role::{ActivityTracker, RoleWorker, ThreadRole, WorkerRegistry};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, trace, warn};
use netplus_core::dual::deliver;
use netplus_core::framing::{decode_datagram, decode_packet, encode_datagrams, encode_frame, encode_frames};
use netplus_core::{
    ConnectionInfo, DisconnectReason, DualConnection, NetError, Packet, Result, SendQueue, TransportKind, Wire,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

const JOB_POLL: Duration = Duration::from_millis(20);
/// Retry delay for a flush that found the stream writer busy
const WRITER_BUSY_DELAY: Duration = Duration::from_millis(1);
/// A peer that drains nothing for this long loses its connection
const STALLED_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

pub type SharedWriter = Arc<tokio::sync::Mutex<OwnedWriteHalf>>;

/// Bytes read from a socket, waiting to be decoded
pub struct InboundFrame {
    pub connection: Arc<DualConnection>,
    pub kind: TransportKind,
    pub bytes: Vec<u8>,
}

pub enum OutboundJob {
    /// The queue's back buffer holds a batch ready to be written
    Flush {
        connection: ConnectionInfo,
        kind: TransportKind,
        queue: Arc<SendQueue>,
    },
    Immediate {
        connection: ConnectionInfo,
        kind: TransportKind,
        packet: Packet,
    },
}

/// `Wire` for server-side connections: hands every write to the flush role
pub struct ServerWire {
    jobs: Sender<OutboundJob>,
}

impl ServerWire {
    pub fn new(jobs: Sender<OutboundJob>) -> Self {
        Self { jobs }
    }

    fn push(&self, job: OutboundJob) -> Result<()> {
        self.jobs.send(job).map_err(|_| NetError::PoolShutdown)
    }
}

impl Wire for ServerWire {
    fn schedule_flush(&self, connection: ConnectionInfo, kind: TransportKind, queue: &Arc<SendQueue>) -> Result<()> {
        self.push(OutboundJob::Flush {
            connection,
            kind,
            queue: Arc::clone(queue),
        })
    }

    fn write_now(&self, connection: ConnectionInfo, kind: TransportKind, packet: Packet) -> Result<()> {
        self.push(OutboundJob::Immediate {
            connection,
            kind,
            packet,
        })
    }
}

/// Write sides of every server socket
pub struct SocketSet {
    connections: Arc<ConnectionManager>,
    writers: Mutex<HashMap<u32, SharedWriter>>,
    udp: Arc<UdpSocket>,
    runtime: Handle,
}

impl SocketSet {
    pub fn new(connections: Arc<ConnectionManager>, udp: Arc<UdpSocket>, runtime: Handle) -> Self {
        Self {
            connections,
            writers: Mutex::new(HashMap::new()),
            udp,
            runtime,
        }
    }

    pub fn insert_writer(&self, id: u32, writer: SharedWriter) {
        self.writers.lock().insert(id, writer);
    }

    pub fn remove_writer(&self, id: u32) -> Option<SharedWriter> {
        self.writers.lock().remove(&id)
    }

    pub fn writer(&self, id: u32) -> Option<SharedWriter> {
        self.writers.lock().get(&id).cloned()
    }

    fn stream_writer(&self, id: u32) -> Result<SharedWriter> {
        self.writer(id).ok_or(NetError::ConnectionClosed(id))
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn udp(&self) -> &Arc<UdpSocket> {
        &self.udp
    }
}

/// Pulls jobs until the worker is cancelled, each one inside an active zone
/// Drives a stream write from a pool thread.
///
/// The write is polled first, so one that completes at once is never abandoned.
/// A write still pending when the worker is cancelled, or after
/// `STALLED_WRITE_TIMEOUT`, fails with an i/o error. The stream may then hold a
/// partial frame, so the caller must dispose the connection.
fn block_on_write<F>(runtime: &Handle, token: &CancellationToken, write: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    runtime.block_on(async {
        tokio::select! {
            biased;
            written = tokio::time::timeout(STALLED_WRITE_TIMEOUT, write) => match written {
                Ok(result) => result,
                Err(_) => Err(std::io::Error::new(ErrorKind::TimedOut, "peer stopped reading").into()),
            },
            _ = token.cancelled() => {
                Err(std::io::Error::new(ErrorKind::Interrupted, "write abandoned by cancelled worker").into())
            }
        }
    })
}

fn drain_jobs<J>(
    jobs: &Receiver<J>,
    runtime: &Handle,
    tracker: &ActivityTracker,
    token: &CancellationToken,
    mut handle: impl FnMut(J),
) -> Result<()> {
    while !token.is_cancelled() {
        match jobs.recv_timeout(JOB_POLL) {
            Ok(job) => {
                let _zone = tracker.active_zone();
                handle(job);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                // producers are gone; park until the pool moves or stops us
                runtime.block_on(token.cancelled());
            }
        }
    }
    Ok(())
}

pub struct DispatchRole {
    inbound: Receiver<InboundFrame>,
    runtime: Handle,
    max_threads: usize,
    registry: WorkerRegistry,
    dispatched: Arc<AtomicU64>,
}

impl DispatchRole {
    pub const NAME: &'static str = "dispatch";

    pub fn new(inbound: Receiver<InboundFrame>, runtime: Handle, max_threads: usize) -> Self {
        Self {
            inbound,
            runtime,
            max_threads: max_threads.max(1),
            registry: WorkerRegistry::default(),
            dispatched: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Frames decoded so far
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }
}

impl ThreadRole for DispatchRole {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn min_threads(&self) -> usize {
        1
    }

    fn max_threads(&self) -> usize {
        self.max_threads
    }

    fn create_worker(&self, _slot: usize) -> Box<dyn RoleWorker> {
        Box::new(DispatchWorker {
            inbound: self.inbound.clone(),
            runtime: self.runtime.clone(),
            dispatched: Arc::clone(&self.dispatched),
        })
    }

    fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }
}

struct DispatchWorker {
    inbound: Receiver<InboundFrame>,
    runtime: Handle,
    dispatched: Arc<AtomicU64>,
}

impl RoleWorker for DispatchWorker {
    fn start_worker(&mut self, tracker: &ActivityTracker, token: &CancellationToken) -> Result<()> {
        let dispatched = &self.dispatched;
        drain_jobs(&self.inbound, &self.runtime, tracker, token, |frame| {
            dispatch_frame(frame);
            dispatched.fetch_add(1, Ordering::Relaxed);
        })
    }
}

fn dispatch_frame(frame: InboundFrame) {
    let InboundFrame {
        connection,
        kind,
        bytes,
    } = frame;
    if !connection.is_alive() {
        return;
    }

    match kind {
        TransportKind::Tcp => match decode_packet(&bytes) {
            Ok(packet) => deliver(&connection, kind, packet),
            Err(e) => {
                warn!("Undecodable frame from connection {}: {}", connection.id(), e);
                connection.dispose(DisconnectReason::Io(e.to_string()));
            }
        },
        TransportKind::Udp => match decode_datagram(&bytes) {
            Ok(packets) => {
                for packet in packets {
                    deliver(&connection, kind, packet);
                }
            }
            Err(e) => debug!("Dropping datagram for connection {}: {}", connection.id(), e),
        },
    }
}

pub struct FlushRole {
    jobs: Receiver<OutboundJob>,
    sockets: Arc<SocketSet>,
    max_threads: usize,
    registry: WorkerRegistry,
}

impl FlushRole {
    pub const NAME: &'static str = "flush";

    pub fn new(jobs: Receiver<OutboundJob>, sockets: Arc<SocketSet>, max_threads: usize) -> Self {
        Self {
            jobs,
            sockets,
            max_threads: max_threads.max(1),
            registry: WorkerRegistry::default(),
        }
    }
}

impl ThreadRole for FlushRole {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn min_threads(&self) -> usize {
        1
    }

    fn max_threads(&self) -> usize {
        self.max_threads
    }

    fn create_worker(&self, _slot: usize) -> Box<dyn RoleWorker> {
        Box::new(FlushWorker {
            jobs: self.jobs.clone(),
            sockets: Arc::clone(&self.sockets),
        })
    }

    fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }
}

struct FlushWorker {
    jobs: Receiver<OutboundJob>,
    sockets: Arc<SocketSet>,
}

impl RoleWorker for FlushWorker {
    fn start_worker(&mut self, tracker: &ActivityTracker, token: &CancellationToken) -> Result<()> {
        let sockets = &self.sockets;
        drain_jobs(&self.jobs, &sockets.runtime, tracker, token, |job| match job {
            OutboundJob::Flush {
                connection,
                kind,
                queue,
            } => flush_queue(sockets, token, connection, kind, &queue),
            OutboundJob::Immediate {
                connection,
                kind,
                packet,
            } => write_immediate(sockets, token, connection, kind, &packet),
        })
    }
}

fn flush_queue(
    sockets: &SocketSet,
    token: &CancellationToken,
    info: ConnectionInfo,
    kind: TransportKind,
    queue: &Arc<SendQueue>,
) {
    let Some(connection) = sockets.connections.get(info.id).filter(|c| c.uid() == info.uid) else {
        queue.dispose();
        return;
    };
    if queue.in_flight() == 0 {
        queue.signal_flushed();
        return;
    }
    match kind {
        TransportKind::Tcp => flush_tcp(sockets, token, &connection, queue),
        TransportKind::Udp => flush_udp(sockets, &connection, queue),
    }
}

fn flush_tcp(
    sockets: &SocketSet,
    token: &CancellationToken,
    connection: &Arc<DualConnection>,
    queue: &Arc<SendQueue>,
) {
    let writer = match sockets.stream_writer(connection.id()) {
        Ok(writer) => writer,
        Err(e) => {
            trace!("Dropping tcp batch: {}", e);
            queue.dispose();
            return;
        }
    };
    let Ok(mut stream) = writer.try_lock() else {
        queue.delay_flush(WRITER_BUSY_DELAY, false);
        return;
    };

    let batch = queue.take_batch();
    let written = encode_frames(&batch).and_then(|bytes| {
        block_on_write(&sockets.runtime, token, async {
            stream.write_all(&bytes).await.map_err(NetError::from)
        })
    });
    drop(stream);

    match written {
        Ok(()) => {
            trace!("Flushed {} items to connection {} over tcp", batch.len(), connection.id());
            connection.transport().note_sent(TransportKind::Tcp);
            queue.signal_flushed();
        }
        Err(e) => {
            warn!("tcp flush to connection {} failed: {}", connection.id(), e);
            connection.dispose(DisconnectReason::from(&e));
        }
    }
}

fn flush_udp(sockets: &SocketSet, connection: &Arc<DualConnection>, queue: &Arc<SendQueue>) {
    let Some((endpoint, max_datagram_size)) = connection.transport().udp_target() else {
        // path died after the batch was cut
        queue.delay_flush(Duration::ZERO, true);
        return;
    };

    let batch = queue.take_batch();
    match encode_datagrams(&batch, max_datagram_size) {
        Ok(datagrams) => {
            for datagram in &datagrams {
                if let Err(e) = sockets.runtime.block_on(sockets.udp.send_to(datagram, endpoint)) {
                    debug!("udp send to connection {} failed: {}", connection.id(), e);
                    break;
                }
            }
            trace!(
                "Flushed {} items in {} datagrams to connection {}",
                batch.len(),
                datagrams.len(),
                connection.id()
            );
            connection.transport().note_sent(TransportKind::Udp);
        }
        Err(e) => warn!("Dropping udp batch for connection {}: {}", connection.id(), e),
    }
    queue.signal_flushed();
}

fn write_immediate(
    sockets: &SocketSet,
    token: &CancellationToken,
    info: ConnectionInfo,
    kind: TransportKind,
    packet: &Packet,
) {
    let Some(connection) = sockets.connections.get(info.id).filter(|c| c.uid() == info.uid) else {
        trace!("Dropping immediate write for gone connection {}", info.id);
        return;
    };

    match kind {
        TransportKind::Tcp => {
            let written = sockets.stream_writer(info.id).and_then(|writer| {
                let frame = encode_frame(packet)?;
                block_on_write(&sockets.runtime, token, async {
                    let mut stream = writer.lock().await;
                    stream.write_all(&frame).await.map_err(NetError::from)
                })
            });
            match written {
                Ok(()) => {}
                Err(e @ NetError::ConnectionClosed(_)) => trace!("Dropping immediate write: {}", e),
                Err(e) => {
                    warn!("tcp write to connection {} failed: {}", info.id, e);
                    connection.dispose(DisconnectReason::from(&e));
                }
            }
        }
        TransportKind::Udp => {
            let Some((endpoint, max_datagram_size)) = connection.transport().udp_target() else {
                return;
            };
            let sent = encode_datagrams(std::iter::once(packet), max_datagram_size).and_then(|datagrams| {
                for datagram in datagrams {
                    sockets.runtime.block_on(sockets.udp.send_to(&datagram, endpoint))?;
                }
                Ok(())
            });
            if let Err(e) = sent {
                debug!("udp write to connection {} failed: {}", info.id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netplus_core::framing::read_frame;
    use netplus_core::{ConnectionConfig, DataHandler, DataItem, DualTransport};
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;
    use tokio::net::{TcpListener, TcpStream};

    #[derive(Default)]
    struct CountingHandler {
        received: AtomicUsize,
    }

    impl DataHandler<DualTransport> for CountingHandler {
        fn handle(&self, _: &Arc<DualConnection>, _: Packet) {
            self.received.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    fn connect(
        id: u32,
        handler: Arc<CountingHandler>,
        jobs: Sender<OutboundJob>,
        config: ConnectionConfig,
    ) -> Arc<DualConnection> {
        DualTransport::connect(
            ConnectionInfo { id, uid: 99 },
            config,
            handler,
            Arc::new(ServerWire::new(jobs)),
            Handle::current(),
        )
    }

    fn run_worker(
        role: &dyn ThreadRole,
        token: &CancellationToken,
    ) -> std::thread::JoinHandle<Result<()>> {
        let mut worker = role.create_worker(0);
        let token = token.clone();
        std::thread::spawn(move || {
            let tracker = ActivityTracker::new(Duration::from_millis(100));
            worker.start_worker(&tracker, &token)
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dispatch_decodes_and_delivers() {
        let (inbound_tx, inbound_rx) = crossbeam_channel::unbounded();
        let (jobs_tx, _jobs_rx) = crossbeam_channel::unbounded();
        let handler = Arc::new(CountingHandler::default());
        let connection = connect(1, Arc::clone(&handler), jobs_tx, ConnectionConfig::default());

        let role = DispatchRole::new(inbound_rx, Handle::current(), 4);
        let token = CancellationToken::new();
        let worker = run_worker(&role, &token);

        let packet = Packet::Data(DataItem::reliable(3, vec![1, 2, 3]));
        inbound_tx
            .send(InboundFrame {
                connection: Arc::clone(&connection),
                kind: TransportKind::Tcp,
                bytes: netplus_core::framing::encode_packet(&packet).unwrap(),
            })
            .unwrap();
        let datagram = encode_datagrams(&[packet.clone(), packet], 4096).unwrap().remove(0);
        inbound_tx
            .send(InboundFrame {
                connection: Arc::clone(&connection),
                kind: TransportKind::Udp,
                bytes: datagram,
            })
            .unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            handler.received.load(Ordering::SeqCst) == 3
        }));
        assert!(wait_until(Duration::from_secs(1), || role.dispatched() == 2));

        token.cancel();
        assert!(worker.join().unwrap().is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_garbage_on_stream_disposes_connection() {
        let (inbound_tx, inbound_rx) = crossbeam_channel::unbounded();
        let (jobs_tx, _jobs_rx) = crossbeam_channel::unbounded();
        let connection = connect(
            1,
            Arc::new(CountingHandler::default()),
            jobs_tx,
            ConnectionConfig::default(),
        );

        let role = DispatchRole::new(inbound_rx, Handle::current(), 1);
        let token = CancellationToken::new();
        let worker = run_worker(&role, &token);

        inbound_tx
            .send(InboundFrame {
                connection: Arc::clone(&connection),
                kind: TransportKind::Udp,
                bytes: vec![0],
            })
            .unwrap();
        inbound_tx
            .send(InboundFrame {
                connection: Arc::clone(&connection),
                kind: TransportKind::Tcp,
                bytes: vec![0xff; 3],
            })
            .unwrap();

        assert!(wait_until(Duration::from_secs(2), || !connection.is_alive()));
        assert!(matches!(connection.disconnect_reason(), Some(DisconnectReason::Io(_))));

        token.cancel();
        worker.join().unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_wire_reports_shutdown_without_flushers() {
        let (jobs_tx, jobs_rx) = crossbeam_channel::unbounded();
        let wire = ServerWire::new(jobs_tx);
        let info = ConnectionInfo { id: 1, uid: 1 };

        wire.write_now(info, TransportKind::Tcp, Packet::Keepalive { sequence: 1 })
            .unwrap();
        assert!(matches!(jobs_rx.try_recv(), Ok(OutboundJob::Immediate { .. })));

        drop(jobs_rx);
        assert!(matches!(
            wire.write_now(info, TransportKind::Tcp, Packet::Keepalive { sequence: 2 }),
            Err(NetError::PoolShutdown)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_flush_writes_batches_to_the_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut peer = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server_side, peer_addr) = listener.accept().await.unwrap();
        let (_read_half, write_half) = server_side.into_split();

        let udp = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let manager = Arc::new(ConnectionManager::new(4));
        let sockets = Arc::new(SocketSet::new(Arc::clone(&manager), udp, Handle::current()));

        let (jobs_tx, jobs_rx) = crossbeam_channel::unbounded();
        let handler = Arc::new(CountingHandler::default());
        let connection = manager
            .add_client(peer_addr, 5, |id| {
                DualTransport::connect(
                    ConnectionInfo { id, uid: 7 },
                    ConnectionConfig::default(),
                    handler,
                    Arc::new(ServerWire::new(jobs_tx)),
                    Handle::current(),
                )
            })
            .unwrap();
        sockets.insert_writer(connection.id(), Arc::new(tokio::sync::Mutex::new(write_half)));

        let role = FlushRole::new(jobs_rx, Arc::clone(&sockets), 2);
        let token = CancellationToken::new();
        let worker = run_worker(&role, &token);

        for n in 0..3u8 {
            connection.send(Packet::Data(DataItem::reliable(0, vec![n]))).unwrap();
        }

        for n in 0..3u8 {
            let body = tokio::time::timeout(Duration::from_secs(2), read_frame(&mut peer))
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            match decode_packet(&body).unwrap() {
                Packet::Data(item) => {
                    assert_eq!(item.payload, vec![n]);
                    assert_eq!(item.meta.map(|m| m.sender), Some(connection.id()));
                }
                other => panic!("unexpected packet {:?}", other),
            }
        }
        assert!(wait_until(Duration::from_secs(1), || {
            !connection.transport().queue(TransportKind::Tcp).is_flushing()
        }));

        token.cancel();
        tokio::task::spawn_blocking(move || worker.join().unwrap())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_releases_worker_stuck_on_unread_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        // connected but never read, so the kernel buffers fill up
        let _peer = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server_side, peer_addr) = listener.accept().await.unwrap();
        let (_read_half, write_half) = server_side.into_split();

        let udp = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let manager = Arc::new(ConnectionManager::new(4));
        let sockets = Arc::new(SocketSet::new(Arc::clone(&manager), udp, Handle::current()));

        let (jobs_tx, jobs_rx) = crossbeam_channel::unbounded();
        let connection = manager
            .add_client(peer_addr, 5, |id| {
                DualTransport::connect(
                    ConnectionInfo { id, uid: 8 },
                    ConnectionConfig::default(),
                    Arc::new(CountingHandler::default()),
                    Arc::new(ServerWire::new(jobs_tx)),
                    Handle::current(),
                )
            })
            .unwrap();
        sockets.insert_writer(connection.id(), Arc::new(tokio::sync::Mutex::new(write_half)));

        let role = FlushRole::new(jobs_rx, Arc::clone(&sockets), 1);
        let token = CancellationToken::new();
        let worker = run_worker(&role, &token);

        // well past what loopback socket buffers absorb
        for n in 0..400u16 {
            connection
                .send(Packet::Data(DataItem::reliable(0, vec![n as u8; 60 * 1024])))
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(connection.is_alive());
        assert!(connection.transport().queue(TransportKind::Tcp).is_flushing());

        token.cancel();
        let joined = tokio::time::timeout(
            Duration::from_secs(3),
            tokio::task::spawn_blocking(move || worker.join().unwrap()),
        )
        .await;
        assert!(matches!(joined, Ok(Ok(Ok(())))));

        // the stream may hold half a frame, so the connection cannot be reused
        assert!(!connection.is_alive());
        assert!(matches!(connection.disconnect_reason(), Some(DisconnectReason::Io(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_immediate_write_without_writer_is_dropped() {
        let udp = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let manager = Arc::new(ConnectionManager::new(4));
        let sockets = Arc::new(SocketSet::new(Arc::clone(&manager), udp, Handle::current()));
        assert!(matches!(sockets.stream_writer(3), Err(NetError::ConnectionClosed(3))));

        let (jobs_tx, jobs_rx) = crossbeam_channel::unbounded();
        let wire = ServerWire::new(jobs_tx.clone());
        let connection = manager
            .add_client("127.0.0.1:9".parse().unwrap(), 5, |id| {
                DualTransport::connect(
                    ConnectionInfo { id, uid: 9 },
                    ConnectionConfig::default(),
                    Arc::new(CountingHandler::default()),
                    Arc::new(ServerWire::new(jobs_tx)),
                    Handle::current(),
                )
            })
            .unwrap();

        let role = FlushRole::new(jobs_rx, Arc::clone(&sockets), 1);
        let token = CancellationToken::new();
        let worker = run_worker(&role, &token);

        wire.write_now(connection.info(), TransportKind::Tcp, Packet::Keepalive { sequence: 1 })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(connection.is_alive());

        token.cancel();
        tokio::task::spawn_blocking(move || worker.join().unwrap())
            .await
            .unwrap()
            .unwrap();
    }
}
