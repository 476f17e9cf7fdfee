//! Headless NetPlus client
//!
//! Runs the same `DualTransport` as the server but writes straight from tokio
//! tasks: a client has one connection, so a thread pool would only add latency.
//! Used by the `test_client` load binary and by the integration tests.

use crate::io_roles::SharedWriter;
use log::{debug, info, trace, warn};
use netplus_core::dual::deliver;
use netplus_core::framing::{decode_datagram, decode_packet, encode_datagrams, encode_frame, encode_frames, read_frame};
use netplus_core::{
    ConnectionConfig, ConnectionInfo, DataHandler, DataItem, DisconnectReason, DualConnection, DualTransport,
    NetError, Packet, Result, SendQueue, TransportKind, UdpInfo, UdpPhase, Wire, PROTOCOL_VERSION,
};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpStream, UdpSocket};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const UDP_HELLO_ATTEMPTS: u32 = 20;
const UDP_HELLO_INTERVAL: Duration = Duration::from_millis(100);
const MAX_DATAGRAM: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub connection: ConnectionConfig,
    pub heartbeat_interval: Duration,
    /// Pair the unreliable transport after the handshake
    pub enable_udp: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            heartbeat_interval: Duration::from_millis(500),
            enable_udp: true,
        }
    }
}

/// Everything needed to (re)introduce our datagram socket to the server
#[derive(Debug, Clone, Copy)]
struct Pairing {
    connection_id: u32,
    udp_token: u64,
    server_udp: SocketAddr,
    max_datagram_size: usize,
}

#[derive(Clone)]
struct ClientWire {
    writer: SharedWriter,
    udp: Arc<UdpSocket>,
    owner: Arc<OnceLock<Weak<DualConnection>>>,
    runtime: Handle,
}

impl ClientWire {
    fn connection(&self) -> Option<Arc<DualConnection>> {
        self.owner.get().and_then(Weak::upgrade)
    }

    async fn flush(self, kind: TransportKind, queue: Arc<SendQueue>) {
        let Some(connection) = self.connection() else {
            queue.dispose();
            return;
        };
        if queue.in_flight() == 0 {
            queue.signal_flushed();
            return;
        }

        let written = match kind {
            TransportKind::Tcp => {
                let batch = queue.take_batch();
                match encode_frames(&batch) {
                    Ok(bytes) => self
                        .writer
                        .lock()
                        .await
                        .write_all(&bytes)
                        .await
                        .map_err(NetError::from),
                    Err(e) => Err(e),
                }
            }
            TransportKind::Udp => {
                let Some((endpoint, max_datagram_size)) = connection.transport().udp_target() else {
                    queue.delay_flush(Duration::ZERO, true);
                    return;
                };
                let batch = queue.take_batch();
                if let Err(e) = self.send_datagrams(&batch, endpoint, max_datagram_size).await {
                    debug!("udp flush failed: {}", e);
                }
                Ok(())
            }
        };

        match written {
            Ok(()) => {
                connection.transport().note_sent(kind);
                queue.signal_flushed();
            }
            Err(e) => {
                warn!("{} flush failed: {}", kind, e);
                connection.dispose(DisconnectReason::from(&e));
            }
        }
    }

    async fn write(self, kind: TransportKind, packet: Packet) {
        let Some(connection) = self.connection() else {
            return;
        };
        match kind {
            TransportKind::Tcp => {
                let written = match encode_frame(&packet) {
                    Ok(frame) => self
                        .writer
                        .lock()
                        .await
                        .write_all(&frame)
                        .await
                        .map_err(NetError::from),
                    Err(e) => Err(e),
                };
                if let Err(e) = written {
                    connection.dispose(DisconnectReason::from(&e));
                }
            }
            TransportKind::Udp => {
                let Some((endpoint, max_datagram_size)) = connection.transport().udp_target() else {
                    return;
                };
                let packets = std::slice::from_ref(&packet);
                if let Err(e) = self.send_datagrams(packets, endpoint, max_datagram_size).await {
                    debug!("udp write failed: {}", e);
                }
            }
        }
    }

    async fn send_datagrams(&self, packets: &[Packet], endpoint: SocketAddr, max_datagram_size: usize) -> Result<()> {
        for datagram in encode_datagrams(packets, max_datagram_size)? {
            self.udp.send_to(&datagram, endpoint).await?;
        }
        Ok(())
    }
}

impl Wire for ClientWire {
    fn schedule_flush(&self, _: ConnectionInfo, kind: TransportKind, queue: &Arc<SendQueue>) -> Result<()> {
        self.runtime.spawn(self.clone().flush(kind, Arc::clone(queue)));
        Ok(())
    }

    fn write_now(&self, _: ConnectionInfo, kind: TransportKind, packet: Packet) -> Result<()> {
        self.runtime.spawn(self.clone().write(kind, packet));
        Ok(())
    }
}

/// Hands every inbound data item to `Client::recv`
struct ClientHandler {
    received: mpsc::UnboundedSender<Packet>,
}

impl DataHandler<DualTransport> for ClientHandler {
    fn handle(&self, _: &Arc<DualConnection>, packet: Packet) {
        let _ = self.received.send(packet);
    }
}

pub struct Client {
    connection: Arc<DualConnection>,
    writer: SharedWriter,
    received: mpsc::UnboundedReceiver<Packet>,
    local_udp: SocketAddr,
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Client {
    /// Performs the handshake and, if enabled, pairs the unreliable transport.
    /// A server that never answers `UdpHello` leaves the client on TCP only.
    pub async fn connect(server: SocketAddr, config: ClientConfig) -> Result<Self> {
        let stream = TcpStream::connect(server).await?;
        stream.set_nodelay(true)?;
        let (mut reader, writer) = stream.into_split();
        let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(writer));

        let hello = encode_frame(&Packet::Hello {
            client_version: PROTOCOL_VERSION,
        })?;
        writer.lock().await.write_all(&hello).await?;

        let body = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut reader))
            .await
            .map_err(|_| NetError::MalformedFrame("no Welcome in time".into()))??
            .ok_or_else(|| NetError::Rejected("connection closed during handshake".into()))?;
        let (connection_id, uid, udp_token, udp_port) = match decode_packet(&body)? {
            Packet::Welcome {
                connection_id,
                uid,
                udp_token,
                udp_port,
            } => (connection_id, uid, udp_token, udp_port),
            Packet::Disconnect { reason } => return Err(NetError::Rejected(reason)),
            other => {
                return Err(NetError::MalformedFrame(format!(
                    "expected Welcome, got {:?}",
                    other
                )))
            }
        };
        info!("Connected to {} as connection {}", server, connection_id);

        let bind: SocketAddr = if server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let udp = Arc::new(UdpSocket::bind(bind).await?);
        let local_udp = udp.local_addr()?;

        let runtime = Handle::current();
        let owner = Arc::new(OnceLock::new());
        let wire = ClientWire {
            writer: Arc::clone(&writer),
            udp: Arc::clone(&udp),
            owner: Arc::clone(&owner),
            runtime: runtime.clone(),
        };
        let (received_tx, received_rx) = mpsc::unbounded_channel();
        let connection = DualTransport::connect(
            ConnectionInfo {
                id: connection_id,
                uid,
            },
            config.connection.clone(),
            Arc::new(ClientHandler {
                received: received_tx,
            }),
            Arc::new(wire),
            runtime,
        );
        let _ = owner.set(Arc::downgrade(&connection));

        let token = CancellationToken::new();
        let on_close = token.clone();
        connection.on_disconnect(move |info, reason| {
            debug!("Connection {} closed: {}", info.id, reason);
            on_close.cancel();
        });
        let weak = Arc::downgrade(&connection);
        connection.transport().on_udp_died(move |_| {
            if let Some(connection) = weak.upgrade() {
                let report = connection.transport().local_udp_info();
                let _ = connection.send(Packet::UdpInfo(report));
            }
        });

        let paired = Arc::new(Notify::new());
        let pairing = Pairing {
            connection_id,
            udp_token,
            server_udp: SocketAddr::new(server.ip(), udp_port),
            max_datagram_size: config.connection.udp_max_datagram_size,
        };
        let mut tasks = vec![
            tokio::spawn(read_tcp(
                Arc::clone(&connection),
                reader,
                Arc::clone(&paired),
                token.clone(),
            )),
            tokio::spawn(read_udp(
                Arc::clone(&connection),
                Arc::clone(&udp),
                pairing.server_udp,
                token.clone(),
            )),
        ];

        if config.enable_udp && !pair(&connection, &udp, &pairing, &paired).await {
            warn!("Server never answered UdpHello; staying on tcp");
            connection.transport().handle_udp_info(UdpInfo {
                max_datagram_size: 0,
                disable_udp: true,
            });
        }
        tasks.push(tokio::spawn(heartbeat(
            Arc::clone(&connection),
            udp,
            pairing,
            config.heartbeat_interval,
            config.enable_udp,
            token.clone(),
        )));

        Ok(Self {
            connection,
            writer,
            received: received_rx,
            local_udp,
            token,
            tasks,
        })
    }

    pub fn connection(&self) -> &Arc<DualConnection> {
        &self.connection
    }

    pub fn id(&self) -> u32 {
        self.connection.id()
    }

    pub fn local_udp_addr(&self) -> SocketAddr {
        self.local_udp
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_alive()
    }

    pub fn udp_active(&self) -> bool {
        self.connection.transport().use_udp()
    }

    pub fn send(&self, item: DataItem) -> Result<()> {
        self.connection.send(Packet::Data(item))
    }

    /// Next item relayed to us; `None` once the connection is gone
    pub async fn recv(&mut self) -> Option<Packet> {
        tokio::select! {
            packet = self.received.recv() => packet,
            _ = self.token.cancelled() => self.received.try_recv().ok(),
        }
    }

    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<Packet> {
        tokio::time::timeout(timeout, self.recv()).await.ok().flatten()
    }

    /// Waits for queued items to go out, says goodbye and tears the connection down
    pub async fn close(&mut self) -> Result<()> {
        let deadline = Instant::now() + Duration::from_secs(1);
        let transport = self.connection.transport();
        while self.connection.is_alive()
            && Instant::now() < deadline
            && (transport.queue(TransportKind::Tcp).is_flushing() || transport.queue(TransportKind::Udp).is_flushing())
        {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        if self.connection.is_alive() {
            let goodbye = encode_frame(&Packet::Disconnect {
                reason: "client closing".to_string(),
            })?;
            let mut stream = self.writer.lock().await;
            if let Err(e) = stream.write_all(&goodbye).await {
                debug!("Could not send goodbye: {}", e);
            }
            let _ = stream.shutdown().await;
        }

        self.connection.dispose(DisconnectReason::Requested);
        self.token.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.token.cancel();
        self.connection.dispose(DisconnectReason::Requested);
    }
}

async fn send_udp_hello(udp: &UdpSocket, pairing: &Pairing) {
    let hello = Packet::UdpHello {
        connection_id: pairing.connection_id,
        udp_token: pairing.udp_token,
    };
    let sent = match encode_datagrams(std::slice::from_ref(&hello), pairing.max_datagram_size) {
        Ok(datagrams) => {
            let mut result = Ok(0);
            for datagram in &datagrams {
                result = udp.send_to(datagram, pairing.server_udp).await;
            }
            result.map(|_| ()).map_err(NetError::from)
        }
        Err(e) => Err(e),
    };
    if let Err(e) = sent {
        debug!("UdpHello to {} failed: {}", pairing.server_udp, e);
    }
}

/// Initialises our side and repeats `UdpHello` until the server reports back
async fn pair(connection: &Arc<DualConnection>, udp: &UdpSocket, pairing: &Pairing, paired: &Notify) -> bool {
    if let Err(e) = connection
        .transport()
        .init_udp(pairing.server_udp, pairing.max_datagram_size)
    {
        debug!("Not pairing udp: {}", e);
        return false;
    }
    for _ in 0..UDP_HELLO_ATTEMPTS {
        send_udp_hello(udp, pairing).await;
        tokio::select! {
            _ = paired.notified() => return true,
            _ = tokio::time::sleep(UDP_HELLO_INTERVAL) => {}
        }
    }
    false
}

async fn read_tcp(connection: Arc<DualConnection>, mut reader: OwnedReadHalf, paired: Arc<Notify>, token: CancellationToken) {
    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => break,
            frame = read_frame(&mut reader) => frame,
        };
        let body = match frame {
            Ok(Some(body)) => body,
            Ok(None) => {
                connection.dispose(DisconnectReason::RemoteClosed);
                break;
            }
            Err(e) => {
                connection.dispose(DisconnectReason::from(&e));
                break;
            }
        };
        let packet = match decode_packet(&body) {
            Ok(packet) => packet,
            Err(e) => {
                connection.dispose(DisconnectReason::Io(e.to_string()));
                break;
            }
        };

        let report = matches!(&packet, Packet::UdpInfo(info) if !info.disable_udp);
        deliver(&connection, TransportKind::Tcp, packet);
        if report {
            paired.notify_one();
            let ours = connection.transport().local_udp_info();
            if let Err(e) = connection.send(Packet::UdpInfo(ours)) {
                debug!("Could not answer UdpInfo: {}", e);
            }
        }
    }
}

async fn read_udp(connection: Arc<DualConnection>, udp: Arc<UdpSocket>, server_udp: SocketAddr, token: CancellationToken) {
    let mut buffer = vec![0u8; MAX_DATAGRAM];
    loop {
        let received = tokio::select! {
            _ = token.cancelled() => break,
            received = udp.recv_from(&mut buffer) => received,
        };
        match received {
            Ok((len, from)) if from == server_udp => match decode_datagram(&buffer[..len]) {
                Ok(packets) => {
                    for packet in packets {
                        deliver(&connection, TransportKind::Udp, packet);
                    }
                }
                Err(e) => debug!("Dropping datagram: {}", e),
            },
            Ok((_, from)) => trace!("Ignoring datagram from {}", from),
            Err(e) => debug!("Error receiving datagram: {}", e),
        }
    }
}

async fn heartbeat(
    connection: Arc<DualConnection>,
    udp: Arc<UdpSocket>,
    pairing: Pairing,
    interval: Duration,
    enable_udp: bool,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let transport = connection.transport();
        if transport.do_heartbeat_tick() {
            warn!("Server went silent");
            connection.dispose(DisconnectReason::HeartbeatTimeout);
            break;
        }
        if enable_udp
            && transport.udp_phase() == UdpPhase::Lost
            && transport
                .init_udp(pairing.server_udp, pairing.max_datagram_size)
                .is_ok()
        {
            info!("Re-pairing udp with {}", pairing.server_udp);
            send_udp_hello(&udp, &pairing).await;
        }
    }
}
