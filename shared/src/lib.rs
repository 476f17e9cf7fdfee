//! # NetPlus connection core
//!
//! Transport-agnostic pieces used by both ends of a NetPlus session: the packet
//! model, wire framing, batching send queues, the connection lifecycle with its
//! filter chains, and the dual TCP/UDP transport that decides per item whether
//! the unreliable path is still worth using.
//!
//! ## Module Organization
//!
//! - `send_queue`: per-transport front/back queues flushed after a merge window
//! - `connection`: identity, liveness, filters, disconnect observers, send routing
//! - `dual`: reliable + unreliable transport with UDP viability scoring and heartbeats
//! - `framing`: length-prefixed TCP frames and packed datagrams
//! - `heuristic`: time-decayed smoothing used for activity measurement
//! - `config` / `error`: connection settings and the shared error type
//!
//! Game payloads are opaque: a `DataItem` carries bytes plus routing flags and
//! the core never looks inside.

pub mod config;
pub mod connection;
pub mod dual;
pub mod error;
pub mod framing;
pub mod heuristic;
pub mod send_queue;

pub use config::ConnectionConfig;
pub use connection::{Connection, ConnectionInfo, DataHandler, FilterVerdict, Transport};
pub use dual::{DualConnection, DualTransport, TransportKind, UdpPhase, Wire};
pub use error::{DisconnectReason, NetError, Result};
pub use heuristic::SteadyHeuristic;
pub use send_queue::SendQueue;

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const PROTOCOL_VERSION: u32 = 1;
/// Largest encoded packet allowed inside a datagram
pub const MAX_PACKET_SIZE: usize = 1024;
/// Largest encoded packet accepted on the reliable stream
pub const MAX_FRAME_SIZE: usize = 1 << 20;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Packet {
    Hello {
        client_version: u32,
    },
    Welcome {
        connection_id: u32,
        uid: u64,
        udp_token: u64,
        /// Port the server receives datagrams on
        udp_port: u16,
    },
    UdpHello {
        connection_id: u32,
        udp_token: u64,
    },
    UdpInfo(UdpInfo),
    Keepalive {
        sequence: u32,
    },
    KeepaliveAck {
        sequence: u32,
    },
    Data(DataItem),
    /// Delivered in-process to the local handler, never written to a socket
    Loopback(DataItem),
    Disconnect {
        reason: String,
    },
}

impl Packet {
    /// True when the item may travel over the unreliable transport
    pub fn is_unreliable(&self) -> bool {
        match self {
            Packet::Data(item) => item.flags.is_unreliable(),
            _ => false,
        }
    }

    pub fn is_loopback(&self) -> bool {
        matches!(self, Packet::Loopback(_))
    }

    /// Stamps sender metadata on outbound data items that carry none yet;
    /// relayed items keep their originator
    pub fn generate_meta(&mut self, info: &ConnectionInfo) {
        if let Packet::Data(item) = self {
            if item.meta.is_some() {
                return;
            }
            item.meta = Some(ItemMeta {
                sender: info.id,
                sent_at_ms: get_timestamp(),
            });
        }
    }

    /// Item-level veto, e.g. a broadcast that must skip its originator
    pub fn filter_send(&self, info: &ConnectionInfo) -> bool {
        match self {
            Packet::Data(item) => item.exclude != Some(info.id),
            _ => true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub struct ItemFlags(u8);

impl ItemFlags {
    pub const NONE: ItemFlags = ItemFlags(0);
    pub const UNRELIABLE: ItemFlags = ItemFlags(0b01);
    /// Periodic state update; superseded by the next one, so loss is acceptable
    pub const UPDATE: ItemFlags = ItemFlags(0b10);

    pub fn contains(self, other: ItemFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_unreliable(self) -> bool {
        self.0 & (Self::UNRELIABLE.0 | Self::UPDATE.0) != 0
    }
}

impl std::ops::BitOr for ItemFlags {
    type Output = ItemFlags;

    fn bitor(self, rhs: ItemFlags) -> ItemFlags {
        ItemFlags(self.0 | rhs.0)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DataItem {
    pub channel: u16,
    pub flags: ItemFlags,
    pub meta: Option<ItemMeta>,
    /// Connection that must not receive this item
    pub exclude: Option<u32>,
    pub payload: Vec<u8>,
}

impl DataItem {
    pub fn new(channel: u16, flags: ItemFlags, payload: Vec<u8>) -> Self {
        Self {
            channel,
            flags,
            meta: None,
            exclude: None,
            payload,
        }
    }

    pub fn reliable(channel: u16, payload: Vec<u8>) -> Self {
        Self::new(channel, ItemFlags::NONE, payload)
    }

    pub fn update(channel: u16, payload: Vec<u8>) -> Self {
        Self::new(channel, ItemFlags::UPDATE, payload)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct ItemMeta {
    pub sender: u32,
    pub sent_at_ms: u64,
}

/// What one end reports about its view of the unreliable transport
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct UdpInfo {
    pub max_datagram_size: u32,
    pub disable_udp: bool,
}

/// Current timestamp in milliseconds
pub fn get_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}
