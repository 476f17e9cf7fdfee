//! Server socket tasks
//!
//! The tokio side of the server: one accept loop, one reader task per TCP
//! connection, one UDP receive task and the heartbeat ticker. These tasks only
//! move raw bytes into the dispatch channel; decoding, relaying and every write
//! happen on pool threads (see `io_roles`).

use crate::client_manager::ConnectionManager;
use crate::config::ServerSettings;
use crate::io_roles::{DispatchRole, FlushRole, InboundFrame, OutboundJob, ServerWire, SharedWriter, SocketSet};
use crate::pool::ThreadPool;
use crate::relay::RelayHandler;
use crossbeam_channel::Sender;
use log::{debug, error, info, trace, warn};
use netplus_core::framing::{decode_datagram, decode_packet, encode_frame, read_frame};
use netplus_core::{
    ConnectionInfo, DataHandler, DisconnectReason, DualConnection, DualTransport, NetError, Packet, Result,
    TransportKind, UdpInfo, Wire, PROTOCOL_VERSION,
};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::runtime::Handle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_DATAGRAM: usize = 64 * 1024;

/// NetPlus server: connection registry, socket tasks and the thread pool
pub struct Server {
    settings: ServerSettings,
    listener: TcpListener,
    tcp_addr: SocketAddr,
    udp_addr: SocketAddr,
    connections: Arc<ConnectionManager>,
    sockets: Arc<SocketSet>,
    relay: Arc<RelayHandler>,
    wire: Arc<dyn Wire>,
    inbound: Sender<InboundFrame>,
    pool: Arc<ThreadPool>,
    token: CancellationToken,
    runtime: Handle,
}

impl Server {
    /// Binds both sockets and starts the pool with its dispatch and flush roles
    pub async fn bind(settings: ServerSettings) -> Result<Self> {
        settings.validate()?;
        if settings.pool.threads < 2 {
            return Err(NetError::Config(
                "the server needs at least two pool threads".into(),
            ));
        }

        let listener = TcpListener::bind((settings.host.as_str(), settings.tcp_port)).await?;
        let udp = Arc::new(UdpSocket::bind((settings.host.as_str(), settings.udp_port)).await?);
        let tcp_addr = listener.local_addr()?;
        let udp_addr = udp.local_addr()?;
        info!("Server listening on tcp {} and udp {}", tcp_addr, udp_addr);

        let runtime = Handle::current();
        let connections = Arc::new(ConnectionManager::new(settings.max_clients));
        let sockets = Arc::new(SocketSet::new(
            Arc::clone(&connections),
            udp,
            runtime.clone(),
        ));
        let relay = Arc::new(RelayHandler::new(&connections));

        let (inbound_tx, inbound_rx) = crossbeam_channel::unbounded::<InboundFrame>();
        let (jobs_tx, jobs_rx) = crossbeam_channel::unbounded::<OutboundJob>();
        let threads = settings.pool.threads;
        let dispatch = Arc::new(DispatchRole::new(inbound_rx, runtime.clone(), threads));
        let flush = Arc::new(FlushRole::new(jobs_rx, Arc::clone(&sockets), threads));

        let pool_config = settings.pool.clone();
        let pool_runtime = runtime.clone();
        let pool = tokio::task::spawn_blocking(move || -> Result<ThreadPool> {
            let pool = ThreadPool::new(pool_config, pool_runtime)?;
            pool.add_role(dispatch)?;
            pool.add_role(flush)?;
            Ok(pool)
        })
        .await
        .map_err(|e| NetError::WorkerFailed(e.to_string()))??;

        Ok(Self {
            settings,
            listener,
            tcp_addr,
            udp_addr,
            connections,
            sockets,
            relay,
            wire: Arc::new(ServerWire::new(jobs_tx)),
            inbound: inbound_tx,
            pool: Arc::new(pool),
            token: CancellationToken::new(),
            runtime,
        })
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        self.tcp_addr
    }

    pub fn udp_addr(&self) -> SocketAddr {
        self.udp_addr
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn relay(&self) -> &Arc<RelayHandler> {
        &self.relay
    }

    pub fn pool(&self) -> &ThreadPool {
        &self.pool
    }

    pub fn is_running(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// Serves until `shutdown` is called
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.pool.start_scheduler();
        let udp_task = tokio::spawn(Arc::clone(&self).udp_loop());
        let heartbeat_task = tokio::spawn(Arc::clone(&self).heartbeat_loop());

        self.accept_loop().await;

        for task in [udp_task, heartbeat_task] {
            if let Err(e) = task.await {
                error!("Server task ended abnormally: {}", e);
            }
        }
        info!("Server stopped");
        Ok(())
    }

    /// Disposes every connection, stops the socket tasks, then joins the pool
    pub async fn shutdown(&self) {
        if self.token.is_cancelled() {
            return;
        }
        info!("Shutting down with {} connections", self.connections.len());
        for connection in self.connections.snapshot() {
            connection.dispose(DisconnectReason::Shutdown);
        }
        self.token.cancel();

        let pool = Arc::clone(&self.pool);
        if let Err(e) = tokio::task::spawn_blocking(move || pool.dispose()).await {
            error!("Pool shutdown panicked: {}", e);
        }
    }

    async fn accept_loop(self: &Arc<Self>) {
        loop {
            let accepted = tokio::select! {
                _ = self.token.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    let server = Arc::clone(self);
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream, addr).await {
                            warn!("Connection from {} failed: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        stream.set_nodelay(true)?;
        let (mut reader, writer) = stream.into_split();
        let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(writer));

        let hello = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut reader))
            .await
            .map_err(|_| NetError::MalformedFrame(format!("no Hello from {} in time", addr)))??;
        let Some(body) = hello else {
            return Ok(());
        };
        match decode_packet(&body)? {
            Packet::Hello { client_version } if client_version == PROTOCOL_VERSION => {}
            Packet::Hello { client_version } => {
                reject(&writer, format!("Unsupported protocol version {}", client_version)).await;
                return Ok(());
            }
            other => {
                return Err(NetError::MalformedFrame(format!(
                    "expected Hello, got {:?}",
                    other
                )))
            }
        }

        // Hold the stream until Welcome is out so nothing overtakes it
        let mut stream = writer.lock().await;
        let udp_token: u64 = rand::random();
        let uid: u64 = rand::random();
        let handler: Arc<dyn DataHandler<DualTransport>> = self.relay.clone();
        let admitted = self.connections.add_client(addr, udp_token, |id| {
            DualTransport::connect(
                ConnectionInfo { id, uid },
                self.settings.connection.clone(),
                handler,
                Arc::clone(&self.wire),
                self.runtime.clone(),
            )
        });
        let Some(connection) = admitted else {
            drop(stream);
            warn!("Rejecting {}: server full", addr);
            reject(&writer, "Server full".to_string()).await;
            return Ok(());
        };

        let id = connection.id();
        let reader_token = self.token.child_token();
        self.install_observers(&connection, reader_token.clone());
        self.sockets.insert_writer(id, Arc::clone(&writer));

        let welcome = encode_frame(&Packet::Welcome {
            connection_id: id,
            uid,
            udp_token,
            udp_port: self.udp_addr.port(),
        })?;
        if let Err(e) = stream.write_all(&welcome).await {
            drop(stream);
            connection.dispose(DisconnectReason::Io(e.to_string()));
            return Err(e.into());
        }
        drop(stream);

        self.read_frames(&connection, &mut reader, &reader_token).await;
        Ok(())
    }

    fn install_observers(&self, connection: &Arc<DualConnection>, reader_token: CancellationToken) {
        let connections = Arc::clone(&self.connections);
        let sockets = Arc::clone(&self.sockets);
        let runtime = self.runtime.clone();
        connection.on_disconnect(move |info, _reason| {
            reader_token.cancel();
            connections.remove_client(info.id);
            if let Some(writer) = sockets.remove_writer(info.id) {
                runtime.spawn(async move {
                    let _ = writer.lock().await.shutdown().await;
                });
            }
        });

        let connections: Weak<ConnectionManager> = Arc::downgrade(&self.connections);
        connection.transport().on_udp_died(move |info| {
            let Some(connection) = connections.upgrade().and_then(|c| c.get(info.id)) else {
                return;
            };
            let report = connection.transport().local_udp_info();
            if let Err(e) = connection.send(Packet::UdpInfo(report)) {
                debug!("Could not report udp state to connection {}: {}", info.id, e);
            }
        });
    }

    async fn read_frames(&self, connection: &Arc<DualConnection>, reader: &mut OwnedReadHalf, token: &CancellationToken) {
        loop {
            let frame = tokio::select! {
                _ = token.cancelled() => break,
                frame = read_frame(&mut *reader) => frame,
            };
            match frame {
                Ok(Some(bytes)) => {
                    let frame = InboundFrame {
                        connection: Arc::clone(connection),
                        kind: TransportKind::Tcp,
                        bytes,
                    };
                    if self.inbound.send(frame).is_err() {
                        connection.dispose(DisconnectReason::Shutdown);
                        break;
                    }
                }
                Ok(None) => {
                    connection.dispose(DisconnectReason::RemoteClosed);
                    break;
                }
                Err(e) => {
                    connection.dispose(DisconnectReason::from(&e));
                    break;
                }
            }
        }
        trace!("Reader for connection {} finished", connection.id());
    }

    async fn udp_loop(self: Arc<Self>) {
        let udp = Arc::clone(self.sockets.udp());
        let mut buffer = vec![0u8; MAX_DATAGRAM];
        loop {
            let received = tokio::select! {
                _ = self.token.cancelled() => break,
                received = udp.recv_from(&mut buffer) => received,
            };
            let (len, from) = match received {
                Ok(received) => received,
                Err(e) => {
                    debug!("Error receiving datagram: {}", e);
                    continue;
                }
            };
            let bytes = &buffer[..len];

            if let Some(connection) = self.connections.find_by_udp_addr(from) {
                if connection.transport().udp_endpoint() == Some(from) {
                    let frame = InboundFrame {
                        connection,
                        kind: TransportKind::Udp,
                        bytes: bytes.to_vec(),
                    };
                    if self.inbound.send(frame).is_err() {
                        break;
                    }
                    continue;
                }
            }
            self.try_pair(bytes, from);
        }
    }

    /// Unpaired sources may only introduce themselves with a lone `UdpHello`
    fn try_pair(&self, bytes: &[u8], from: SocketAddr) {
        let packets = match decode_datagram(bytes) {
            Ok(packets) => packets,
            Err(e) => {
                trace!("Ignoring datagram from {}: {}", from, e);
                return;
            }
        };
        let [Packet::UdpHello {
            connection_id,
            udp_token,
        }] = packets.as_slice()
        else {
            trace!("Ignoring datagram from unpaired {}", from);
            return;
        };

        let connection = match self.connections.pair_udp(*connection_id, *udp_token, from) {
            Ok(connection) => connection,
            Err(e) => {
                debug!("Rejected UdpHello from {}: {}", from, e);
                return;
            }
        };
        let report = match connection
            .transport()
            .init_udp(from, self.settings.connection.udp_max_datagram_size)
        {
            Ok(()) => connection.transport().local_udp_info(),
            Err(e) => {
                info!("Refusing udp for connection {}: {}", connection.id(), e);
                UdpInfo {
                    max_datagram_size: 0,
                    disable_udp: true,
                }
            }
        };
        if let Err(e) = connection.send(Packet::UdpInfo(report)) {
            debug!("Could not answer UdpHello of connection {}: {}", connection.id(), e);
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.settings.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            for connection in self.connections.snapshot() {
                if connection.transport().do_heartbeat_tick() {
                    warn!("Connection {} timed out", connection.id());
                    connection.dispose(DisconnectReason::HeartbeatTimeout);
                }
            }
        }
    }
}

async fn reject(writer: &SharedWriter, reason: String) {
    let mut stream = writer.lock().await;
    match encode_frame(&Packet::Disconnect { reason }) {
        Ok(frame) => {
            if let Err(e) = stream.write_all(&frame).await {
                debug!("Could not send rejection: {}", e);
            }
        }
        Err(e) => debug!("Could not encode rejection: {}", e),
    }
    let _ = stream.shutdown().await;
}
