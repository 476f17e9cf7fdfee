//! Server configuration
//!
//! Command line flags (each with a `NETPLUS_*` environment fallback) are parsed
//! into `ServerArgs` and then split into the pieces the runtime consumes:
//! `ConnectionConfig` for every accepted connection, `PoolConfig` for the thread
//! pool and its scheduler, and the socket/heartbeat settings in `ServerSettings`.

use clap::Parser;
use log::warn;
use netplus_core::{ConnectionConfig, NetError, Result};
use std::time::Duration;

/// Thread pool and role scheduler tuning
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Number of OS threads owned by the pool
    pub threads: usize,
    /// Period of the background scheduling pass
    pub scheduler_interval: Duration,
    /// Threads at or below this activity may be moved to another role
    pub underload_threshold: f64,
    /// Roles at or above this mean activity ask for another thread
    pub overload_threshold: f64,
    /// Roles above this mean activity never give threads away
    pub steal_threshold: f64,
    /// Time constant of the per-thread activity average
    pub activity_time_constant: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            threads: 8,
            scheduler_interval: Duration::from_millis(250),
            underload_threshold: 0.1,
            overload_threshold: 0.75,
            steal_threshold: 0.9,
            activity_time_constant: Duration::from_secs(1),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(NetError::Config("pool needs at least one thread".into()));
        }
        if self.scheduler_interval.is_zero() || self.activity_time_constant.is_zero() {
            return Err(NetError::Config(
                "scheduler interval and activity time constant must be positive".into(),
            ));
        }
        for (name, value) in [
            ("underload", self.underload_threshold),
            ("overload", self.overload_threshold),
            ("steal", self.steal_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(NetError::Config(format!(
                    "{} threshold {} outside 0..=1",
                    name, value
                )));
            }
        }
        // Operator's responsibility; a bad ordering only makes the scheduler less useful
        if self.steal_threshold < self.overload_threshold
            || self.steal_threshold < self.underload_threshold
        {
            warn!(
                "steal threshold {} is below overload {} or underload {}",
                self.steal_threshold, self.overload_threshold, self.underload_threshold
            );
        }
        Ok(())
    }
}

/// Everything `Server::bind` needs
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub tcp_port: u16,
    pub udp_port: u16,
    pub heartbeat_interval: Duration,
    pub max_clients: usize,
    pub connection: ConnectionConfig,
    pub pool: PoolConfig,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            tcp_port: 8080,
            udp_port: 8081,
            heartbeat_interval: Duration::from_millis(500),
            max_clients: 32,
            connection: ConnectionConfig::default(),
            pool: PoolConfig::default(),
        }
    }
}

impl ServerSettings {
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval.is_zero() {
            return Err(NetError::Config("heartbeat interval must be positive".into()));
        }
        if self.max_clients == 0 {
            return Err(NetError::Config("max_clients must be positive".into()));
        }
        self.connection.validate()?;
        self.pool.validate()
    }
}

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about)]
pub struct ServerArgs {
    /// Server IP address to bind to
    #[clap(short = 'H', long, env = "NETPLUS_HOST", default_value = "127.0.0.1")]
    pub host: String,
    /// TCP port to accept connections on
    #[clap(short, long, env = "NETPLUS_PORT", default_value = "8080")]
    pub port: u16,
    /// UDP port for the unreliable transport
    #[clap(long, env = "NETPLUS_UDP_PORT", default_value = "8081")]
    pub udp_port: u16,
    /// Heartbeat ticks per second
    #[clap(short, long, env = "NETPLUS_TICK_RATE", default_value = "2")]
    pub tick_rate: u32,
    /// Maximum number of concurrent connections
    #[clap(short, long, env = "NETPLUS_MAX_CLIENTS", default_value = "32")]
    pub max_clients: usize,

    #[clap(long, env = "NETPLUS_MERGE_WINDOW_MS", default_value = "5")]
    pub merge_window_ms: u64,
    #[clap(long, env = "NETPLUS_MAX_QUEUE_SIZE", default_value = "4096")]
    pub max_queue_size: usize,
    /// Heartbeat ticks without traffic before a transport counts as lost
    #[clap(long, env = "NETPLUS_MAX_HEARTBEAT_DELAY", default_value = "10")]
    pub max_heartbeat_delay: u32,
    #[clap(long, env = "NETPLUS_UDP_MAX_DATAGRAM_SIZE", default_value = "4100")]
    pub udp_max_datagram_size: usize,
    #[clap(long, env = "NETPLUS_UDP_ALIVE_SCORE_MAX", default_value = "20")]
    pub udp_alive_score_max: u32,
    #[clap(long, env = "NETPLUS_UDP_DOWNGRADE_SCORE_MAX", default_value = "5")]
    pub udp_downgrade_score_max: u32,
    #[clap(long, env = "NETPLUS_UDP_DEATH_SCORE_MAX", default_value = "1")]
    pub udp_death_score_max: u32,

    /// Pool threads
    #[clap(long, env = "NETPLUS_THREADS", default_value = "8")]
    pub threads: usize,
    #[clap(long, env = "NETPLUS_SCHEDULER_INTERVAL_MS", default_value = "250")]
    pub scheduler_interval_ms: u64,
    #[clap(long, env = "NETPLUS_UNDERLOAD_THRESHOLD", default_value = "0.1")]
    pub underload_threshold: f64,
    #[clap(long, env = "NETPLUS_OVERLOAD_THRESHOLD", default_value = "0.75")]
    pub overload_threshold: f64,
    #[clap(long, env = "NETPLUS_STEAL_THRESHOLD", default_value = "0.9")]
    pub steal_threshold: f64,
    #[clap(long, env = "NETPLUS_ACTIVITY_TIME_CONSTANT_MS", default_value = "1000")]
    pub activity_time_constant_ms: u64,
}

impl ServerArgs {
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            merge_window_ms: self.merge_window_ms,
            max_queue_size: self.max_queue_size,
            max_heartbeat_delay: self.max_heartbeat_delay,
            udp_max_datagram_size: self.udp_max_datagram_size,
            udp_alive_score_max: self.udp_alive_score_max,
            udp_downgrade_score_max: self.udp_downgrade_score_max,
            udp_death_score_max: self.udp_death_score_max,
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            threads: self.threads,
            scheduler_interval: Duration::from_millis(self.scheduler_interval_ms),
            underload_threshold: self.underload_threshold,
            overload_threshold: self.overload_threshold,
            steal_threshold: self.steal_threshold,
            activity_time_constant: Duration::from_millis(self.activity_time_constant_ms),
        }
    }

    /// Converts and validates the parsed flags
    pub fn settings(&self) -> Result<ServerSettings> {
        if self.tick_rate == 0 {
            return Err(NetError::Config("tick rate must be positive".into()));
        }
        let settings = ServerSettings {
            host: self.host.clone(),
            tcp_port: self.port,
            udp_port: self.udp_port,
            heartbeat_interval: Duration::from_micros(1_000_000 / self.tick_rate as u64),
            max_clients: self.max_clients,
            connection: self.connection_config(),
            pool: self.pool_config(),
        };
        settings.validate()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> ServerArgs {
        let mut argv = vec!["netplus-server"];
        argv.extend_from_slice(extra);
        ServerArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults_match_library_defaults() {
        let args = parse(&[]);
        let settings = args.settings().unwrap();
        assert_eq!(settings.connection, ConnectionConfig::default());
        assert_eq!(settings.pool, PoolConfig::default());
        assert_eq!(settings.heartbeat_interval, Duration::from_millis(500));
    }

    #[test]
    fn test_flags_override_defaults() {
        let args = parse(&["--threads", "4", "--tick-rate", "10", "-m", "3", "--merge-window-ms", "2"]);
        let settings = args.settings().unwrap();
        assert_eq!(settings.pool.threads, 4);
        assert_eq!(settings.max_clients, 3);
        assert_eq!(settings.heartbeat_interval, Duration::from_millis(100));
        assert_eq!(settings.connection.merge_window(), Duration::from_millis(2));
    }

    #[test]
    fn test_rejects_zero_tick_rate() {
        let args = parse(&["--tick-rate", "0"]);
        assert!(matches!(args.settings(), Err(NetError::Config(_))));
    }

    #[test]
    fn test_pool_thresholds_must_be_fractions() {
        let config = PoolConfig {
            overload_threshold: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = PoolConfig {
            threads: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tiny_datagram_ceiling_is_rejected() {
        let args = parse(&["--udp-max-datagram-size", "512"]);
        assert!(args.settings().is_err());
    }
}
