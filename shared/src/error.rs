//! Error types shared by the connection core and the server runtime

use std::fmt;
use thiserror::Error;

/// Errors raised by queues, connections, transports and the thread pool
#[derive(Debug, Error)]
pub enum NetError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Encode(#[from] bincode::Error),

    #[error("packet of {size} bytes exceeds the {limit} byte limit")]
    PacketTooLarge { size: usize, limit: usize },

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("send queue overflow ({size} items, max {max})")]
    QueueOverflow { size: usize, max: usize },

    #[error("send queue has been disposed")]
    QueueDisposed,

    #[error("connection {0} is closed")]
    ConnectionClosed(u32),

    #[error("udp is disabled for connection {0}")]
    UdpDisabled(u32),

    #[error("unknown connection {0}")]
    UnknownConnection(u32),

    #[error("thread pool is shutting down")]
    PoolShutdown,

    #[error("worker failed: {0}")]
    WorkerFailed(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("rejected by server: {0}")]
    Rejected(String),
}

pub type Result<T> = std::result::Result<T, NetError>;

/// Why a connection reached the end of its life
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    Requested,
    QueueOverflow,
    FlushFailed,
    HeartbeatTimeout,
    RemoteClosed,
    Io(String),
    Shutdown,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Requested => write!(f, "requested"),
            DisconnectReason::QueueOverflow => write!(f, "send queue overflow"),
            DisconnectReason::FlushFailed => write!(f, "flush failed"),
            DisconnectReason::HeartbeatTimeout => write!(f, "heartbeat timeout"),
            DisconnectReason::RemoteClosed => write!(f, "closed by peer"),
            DisconnectReason::Io(msg) => write!(f, "i/o error: {}", msg),
            DisconnectReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

impl From<&NetError> for DisconnectReason {
    fn from(err: &NetError) -> Self {
        match err {
            NetError::QueueOverflow { .. } => DisconnectReason::QueueOverflow,
            NetError::Io(e) => DisconnectReason::Io(e.to_string()),
            NetError::PoolShutdown => DisconnectReason::Shutdown,
            _ => DisconnectReason::FlushFailed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: NetError = io.into();
        assert!(matches!(err, NetError::Io(_)));
        assert!(err.to_string().contains("pipe"));
    }

    #[test]
    fn test_overflow_maps_to_overflow_reason() {
        let err = NetError::QueueOverflow { size: 3, max: 3 };
        assert_eq!(DisconnectReason::from(&err), DisconnectReason::QueueOverflow);
    }

    #[test]
    fn test_other_errors_map_to_flush_failure() {
        let err = NetError::MalformedFrame("short".to_string());
        assert_eq!(DisconnectReason::from(&err), DisconnectReason::FlushFailed);
    }

    #[test]
    fn test_reason_display() {
        assert_eq!(DisconnectReason::HeartbeatTimeout.to_string(), "heartbeat timeout");
        assert_eq!(
            DisconnectReason::Io("reset".to_string()).to_string(),
            "i/o error: reset"
        );
    }
}
