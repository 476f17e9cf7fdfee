//! Reliable + unreliable dual transport
//!
//! Every connection has a reliable stream; an unreliable datagram path is added
//! once the peer pairs it (`init_udp`). Whether the datagram path is still worth
//! using is tracked by three bounded scores under a single lock:
//!
//! - alive score: heartbeat successes; overflowing it pays back one step of the
//!   downgrade and death scores
//! - downgrade score: heartbeat misses; saturating it halves the datagram ceiling
//! - death score: datagram paths lost; saturating it disables UDP for good
//!
//! The ladder is Active -> Degraded (smaller datagrams) -> Dead. A ceiling that can
//! no longer carry one full packet kills the path and drops all queued
//! unreliable items.

use crate::config::ConnectionConfig;
use crate::connection::{Connection, ConnectionInfo, DataHandler, Transport};
use crate::error::{DisconnectReason, NetError, Result};
use crate::framing;
use crate::send_queue::SendQueue;
use crate::{Packet, UdpInfo, MAX_PACKET_SIZE};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;

pub type DualConnection = Connection<DualTransport>;
pub type UdpDiedListener = Box<dyn Fn(&ConnectionInfo) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Tcp,
    Udp,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Tcp => write!(f, "tcp"),
            TransportKind::Udp => write!(f, "udp"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpPhase {
    /// Never paired
    NoUdp,
    Active,
    /// Datagram ceiling halved at least once
    Degraded,
    /// Path lost; the peer may pair again while the death score is below max
    Lost,
    /// Death score saturated; terminal for this connection
    Dead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UdpScores {
    pub alive: u32,
    pub downgrade: u32,
    pub death: u32,
}

/// Outbound side of an endpoint: whoever actually owns the sockets
pub trait Wire: Send + Sync + 'static {
    /// Called from a send queue's flush timer; the batch waits in the queue's back buffer
    fn schedule_flush(&self, connection: ConnectionInfo, kind: TransportKind, queue: &Arc<SendQueue>) -> Result<()>;

    /// Writes one packet without queueing (keepalives, handshake replies)
    fn write_now(&self, connection: ConnectionInfo, kind: TransportKind, packet: Packet) -> Result<()>;
}

struct UdpState {
    phase: UdpPhase,
    endpoint: Option<SocketAddr>,
    max_datagram_size: usize,
    scores: UdpScores,
    tcp_misses: u32,
    udp_misses: u32,
    suppress_tcp_keepalive: bool,
    suppress_udp_keepalive: bool,
    keepalive_sequence: u32,
    udp_ack_pending: Option<u32>,
}

impl UdpState {
    fn is_usable(&self, death_max: u32) -> bool {
        self.endpoint.is_some() && self.max_datagram_size > 0 && self.scores.death < death_max
    }
}

pub struct DualTransport {
    info: ConnectionInfo,
    config: ConnectionConfig,
    wire: Arc<dyn Wire>,
    tcp_queue: Arc<SendQueue>,
    udp_queue: Arc<SendQueue>,
    udp: Mutex<UdpState>,
    udp_died: Mutex<Vec<UdpDiedListener>>,
}

impl DualTransport {
    /// Creates a connection backed by a dual transport writing through `wire`
    pub fn connect(
        info: ConnectionInfo,
        config: ConnectionConfig,
        handler: Arc<dyn DataHandler<DualTransport>>,
        wire: Arc<dyn Wire>,
        runtime: Handle,
    ) -> Arc<DualConnection> {
        Connection::new_cyclic(info, handler, |owner| {
            DualTransport::new(info, config, wire, runtime, owner)
        })
    }

    fn new(
        info: ConnectionInfo,
        config: ConnectionConfig,
        wire: Arc<dyn Wire>,
        runtime: Handle,
        owner: &Weak<DualConnection>,
    ) -> Self {
        let tcp_queue = Self::make_queue(TransportKind::Tcp, info, &config, &wire, &runtime, owner);
        let udp_queue = Self::make_queue(TransportKind::Udp, info, &config, &wire, &runtime, owner);
        Self {
            info,
            udp: Mutex::new(UdpState {
                phase: UdpPhase::NoUdp,
                endpoint: None,
                max_datagram_size: config.udp_max_datagram_size,
                scores: UdpScores::default(),
                tcp_misses: 0,
                udp_misses: 0,
                suppress_tcp_keepalive: false,
                suppress_udp_keepalive: false,
                keepalive_sequence: 0,
                udp_ack_pending: None,
            }),
            config,
            wire,
            tcp_queue,
            udp_queue,
            udp_died: Mutex::new(Vec::new()),
        }
    }

    fn make_queue(
        kind: TransportKind,
        info: ConnectionInfo,
        config: &ConnectionConfig,
        wire: &Arc<dyn Wire>,
        runtime: &Handle,
        owner: &Weak<DualConnection>,
    ) -> Arc<SendQueue> {
        let label = match kind {
            TransportKind::Tcp => "tcp",
            TransportKind::Udp => "udp",
        };
        let wire = Arc::clone(wire);
        let owner = owner.clone();
        SendQueue::new(
            label,
            config.max_queue_size,
            config.merge_window(),
            runtime.clone(),
            Arc::new(move |queue: &Arc<SendQueue>| wire.schedule_flush(info, kind, queue)),
            Box::new(move |err: &NetError| {
                if let Some(connection) = owner.upgrade() {
                    connection.dispose(DisconnectReason::from(err));
                }
            }),
        )
    }

    pub fn info(&self) -> ConnectionInfo {
        self.info
    }

    pub fn queue(&self, kind: TransportKind) -> &Arc<SendQueue> {
        match kind {
            TransportKind::Tcp => &self.tcp_queue,
            TransportKind::Udp => &self.udp_queue,
        }
    }

    /// True when unreliable items may currently travel as datagrams
    pub fn use_udp(&self) -> bool {
        self.udp.lock().is_usable(self.config.udp_death_score_max)
    }

    pub fn udp_phase(&self) -> UdpPhase {
        self.udp.lock().phase
    }

    pub fn udp_endpoint(&self) -> Option<SocketAddr> {
        self.udp.lock().endpoint
    }

    pub fn udp_max_datagram_size(&self) -> usize {
        self.udp.lock().max_datagram_size
    }

    pub fn udp_scores(&self) -> UdpScores {
        self.udp.lock().scores
    }

    /// Endpoint and datagram ceiling to flush the unreliable queue with, if usable
    pub fn udp_target(&self) -> Option<(SocketAddr, usize)> {
        let state = self.udp.lock();
        if !state.is_usable(self.config.udp_death_score_max) {
            return None;
        }
        state.endpoint.map(|endpoint| (endpoint, state.max_datagram_size))
    }

    /// What this end tells the peer about its datagram path
    pub fn local_udp_info(&self) -> UdpInfo {
        let state = self.udp.lock();
        UdpInfo {
            max_datagram_size: state.max_datagram_size.min(u32::MAX as usize) as u32,
            disable_udp: state.phase == UdpPhase::Dead,
        }
    }

    pub fn on_udp_died<F>(&self, listener: F)
    where
        F: Fn(&ConnectionInfo) + Send + Sync + 'static,
    {
        self.udp_died.lock().push(Box::new(listener));
    }

    /// Pairs (or re-pairs) the datagram path. A first pairing starts every score
    /// from zero; a re-pairing after a loss keeps the death score.
    pub fn init_udp(&self, endpoint: SocketAddr, max_datagram_size: usize) -> Result<()> {
        let mut state = self.udp.lock();
        if state.phase == UdpPhase::Dead {
            return Err(NetError::UdpDisabled(self.info.id));
        }
        let death = if state.phase == UdpPhase::NoUdp {
            0
        } else {
            state.scores.death
        };
        state.endpoint = Some(endpoint);
        state.max_datagram_size = max_datagram_size;
        state.scores = UdpScores {
            alive: 0,
            downgrade: 0,
            death,
        };
        state.udp_misses = 0;
        state.udp_ack_pending = None;
        state.phase = UdpPhase::Active;
        info!(
            "Connection {} paired udp at {} (max datagram {} bytes)",
            self.info.id, endpoint, max_datagram_size
        );
        Ok(())
    }

    /// Heartbeat success on the datagram path
    pub fn increase_udp_score(&self) {
        let mut state = self.udp.lock();
        if state.endpoint.is_none() {
            return;
        }
        state.scores.alive += 1;
        if state.scores.alive > self.config.udp_alive_score_max {
            state.scores.alive = 0;
            state.scores.downgrade = state.scores.downgrade.saturating_sub(1);
            state.scores.death = state.scores.death.saturating_sub(1);
        }
    }

    /// Heartbeat miss on the datagram path
    pub fn decrease_udp_score(&self) {
        let died = {
            let mut state = self.udp.lock();
            self.decrease_locked(&mut state)
        };
        if died {
            self.udp_lost();
        }
    }

    /// Halves the datagram ceiling, killing the path if it becomes useless
    pub fn downgrade_udp(&self) {
        let died = {
            let mut state = self.udp.lock();
            self.downgrade_locked(&mut state)
        };
        if died {
            self.udp_lost();
        }
    }

    /// Applies the peer's view: it may disable the path or lower the ceiling
    pub fn handle_udp_info(&self, remote: UdpInfo) {
        let died = {
            let mut state = self.udp.lock();
            if remote.disable_udp {
                self.kill_locked(&mut state, true)
            } else {
                let peer_max = remote.max_datagram_size as usize;
                if peer_max < state.max_datagram_size {
                    debug!(
                        "Connection {} lowers udp ceiling {} -> {} (peer)",
                        self.info.id, state.max_datagram_size, peer_max
                    );
                    state.max_datagram_size = peer_max;
                }
                if state.endpoint.is_some() && state.max_datagram_size < 1 + MAX_PACKET_SIZE {
                    self.kill_locked(&mut state, false)
                } else {
                    false
                }
            }
        };
        if died {
            self.udp_lost();
        }
    }

    /// Advances heartbeat bookkeeping by one tick and sends keepalives that were
    /// not made redundant by other traffic. Returns true when the reliable
    /// transport has been silent for too long and the connection should die.
    pub fn do_heartbeat_tick(&self) -> bool {
        let mut keepalives = Vec::with_capacity(2);
        let (died, sequence) = {
            let mut state = self.udp.lock();
            state.tcp_misses += 1;
            if state.tcp_misses > self.config.max_heartbeat_delay {
                return true;
            }

            let mut died = false;
            if self.udp_active(&state) {
                if state.udp_ack_pending.take().is_some() {
                    died |= self.decrease_locked(&mut state);
                }
                state.udp_misses += 1;
                if self.udp_active(&state) && state.udp_misses > self.config.max_heartbeat_delay {
                    state.udp_misses = 0;
                    died |= self.downgrade_locked(&mut state);
                }
            }

            let sequence = state.keepalive_sequence;
            state.keepalive_sequence = sequence.wrapping_add(1);
            if !state.suppress_tcp_keepalive {
                keepalives.push(TransportKind::Tcp);
            }
            if self.udp_active(&state) && !state.suppress_udp_keepalive {
                keepalives.push(TransportKind::Udp);
                state.udp_ack_pending = Some(sequence);
            }
            state.suppress_tcp_keepalive = false;
            state.suppress_udp_keepalive = false;
            (died, sequence)
        };

        if died {
            self.udp_lost();
        }
        for kind in keepalives {
            if let Err(e) = self
                .wire
                .write_now(self.info, kind, Packet::Keepalive { sequence })
            {
                debug!("Keepalive on {} for connection {} failed: {}", kind, self.info.id, e);
            }
        }
        false
    }

    /// Inbound traffic on a transport proves it alive for this tick
    pub fn note_received(&self, kind: TransportKind) {
        let mut state = self.udp.lock();
        match kind {
            TransportKind::Tcp => state.tcp_misses = 0,
            TransportKind::Udp => state.udp_misses = 0,
        }
    }

    /// Outbound traffic on a transport makes this tick's keepalive redundant
    pub fn note_sent(&self, kind: TransportKind) {
        let mut state = self.udp.lock();
        match kind {
            TransportKind::Tcp => state.suppress_tcp_keepalive = true,
            TransportKind::Udp => state.suppress_udp_keepalive = true,
        }
    }

    pub fn handle_keepalive_ack(&self, sequence: u32) {
        let matched = {
            let mut state = self.udp.lock();
            if state.udp_ack_pending == Some(sequence) {
                state.udp_ack_pending = None;
                true
            } else {
                false
            }
        };
        if matched {
            self.increase_udp_score();
        }
    }

    fn udp_active(&self, state: &UdpState) -> bool {
        matches!(state.phase, UdpPhase::Active | UdpPhase::Degraded)
            && state.is_usable(self.config.udp_death_score_max)
    }

    fn decrease_locked(&self, state: &mut UdpState) -> bool {
        if state.endpoint.is_none() {
            return false;
        }
        state.scores.alive = 0;
        state.scores.downgrade += 1;
        if state.scores.downgrade >= self.config.udp_downgrade_score_max {
            return self.downgrade_locked(state);
        }
        false
    }

    fn downgrade_locked(&self, state: &mut UdpState) -> bool {
        if state.endpoint.is_none() || state.phase == UdpPhase::Dead {
            return false;
        }
        state.max_datagram_size /= 2;
        // landing on the single-packet floor leaves no further step down, so a
        // path halved from 2 * (1 + MAX_PACKET_SIZE) dies; a peer may still
        // report exactly the floor through `handle_udp_info`
        if state.max_datagram_size <= 1 + MAX_PACKET_SIZE {
            return self.kill_locked(state, false);
        }
        state.scores.alive = 0;
        state.scores.downgrade = 0;
        state.phase = UdpPhase::Degraded;
        info!(
            "Connection {} downgraded udp to {} byte datagrams",
            self.info.id, state.max_datagram_size
        );
        false
    }

    /// Drops the datagram path. Returns true if it was alive until now.
    fn kill_locked(&self, state: &mut UdpState, terminal: bool) -> bool {
        if state.phase == UdpPhase::Dead {
            return false;
        }
        let was_paired = state.endpoint.is_some();
        let death_max = self.config.udp_death_score_max;
        state.endpoint = None;
        state.udp_ack_pending = None;
        state.scores.death = if terminal {
            death_max
        } else {
            (state.scores.death + 1).min(death_max)
        };
        state.phase = if state.scores.death >= death_max {
            UdpPhase::Dead
        } else {
            UdpPhase::Lost
        };
        was_paired || state.phase == UdpPhase::Dead
    }

    fn udp_lost(&self) {
        let dropped = self.udp_queue.drop_unreliable();
        info!(
            "Connection {} lost udp ({:?}), dropped {} queued unreliable items",
            self.info.id,
            self.udp_phase(),
            dropped
        );
        for listener in self.udp_died.lock().iter() {
            listener(&self.info);
        }
    }
}

impl Transport for DualTransport {
    fn select_queue(&self, packet: &Packet) -> Option<Arc<SendQueue>> {
        if packet.is_unreliable() && self.use_udp() {
            match framing::packet_size(packet) {
                Ok(size) if size <= MAX_PACKET_SIZE => return Some(Arc::clone(&self.udp_queue)),
                Ok(_) => {}
                Err(e) => warn!("Cannot size packet for connection {}: {}", self.info.id, e),
            }
        }
        Some(Arc::clone(&self.tcp_queue))
    }

    fn send_immediate(&self, packet: Packet) -> Result<()> {
        self.wire.write_now(self.info, TransportKind::Tcp, packet)
    }

    fn close(&self) {
        self.tcp_queue.dispose();
        self.udp_queue.dispose();
        let mut state = self.udp.lock();
        state.endpoint = None;
        state.udp_ack_pending = None;
    }
}

/// Feeds one inbound packet through transport bookkeeping and, for payload
/// packets, into the connection's receive path.
pub fn deliver(connection: &Arc<DualConnection>, kind: TransportKind, packet: Packet) {
    let transport = connection.transport();
    transport.note_received(kind);
    match packet {
        Packet::Keepalive { sequence } => {
            if let Err(e) = transport
                .wire
                .write_now(connection.info(), kind, Packet::KeepaliveAck { sequence })
            {
                debug!("Keepalive ack for connection {} failed: {}", connection.id(), e);
            }
        }
        Packet::KeepaliveAck { sequence } => {
            if kind == TransportKind::Udp {
                transport.handle_keepalive_ack(sequence);
            }
        }
        Packet::UdpInfo(remote) => transport.handle_udp_info(remote),
        Packet::Disconnect { reason } => {
            debug!("Peer closed connection {}: {}", connection.id(), reason);
            connection.dispose(DisconnectReason::RemoteClosed);
        }
        other => connection.receive(other),
    }
}
