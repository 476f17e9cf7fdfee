//! # NetPlus Server Library
//!
//! Server runtime for NetPlus sessions. Connections come from `netplus-core`;
//! this crate owns the sockets, keeps the registry of live connections and runs
//! all byte-level work on a small pool of OS threads whose jobs shift with load.
//!
//! ## Core Responsibilities
//!
//! ### Connection Lifecycle
//! - TCP handshake (`Hello` / `Welcome`) with a capacity limit
//! - UDP pairing through a per-connection token
//! - Heartbeats on both transports and timeout of silent peers
//! - Cleanup through disconnect observers, whatever killed the connection
//!
//! ### Role-Based Thread Pool
//! Every pool thread runs exactly one role at a time: dispatching inbound frames,
//! flushing send queues or idling. A scheduler samples how busy each thread has
//! been and moves idle threads to overloaded roles, so decode-heavy and
//! write-heavy phases get the threads they need without a thread per connection.
//!
//! ### Relay
//! Game semantics are out of scope; every inbound data item is relayed to the
//! other connections with its flags intact, which is enough to drive clients.
//!
//! ## Module Organization
//!
//! - `config`: command line flags, pool tuning and server settings
//! - `role` / `scheduler` / `pool`: activity tracking, role planning and the thread pool
//! - `io_roles`: dispatch and flush roles plus the server-side `Wire`
//! - `client_manager`: registry of live connections
//! - `network`: accept loop, reader tasks, UDP receive task, heartbeat ticker
//! - `relay`: the data handler installed on server connections
//! - `client`: headless client used by `test_client` and the integration tests
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use netplus_server::config::ServerSettings;
//! use netplus_server::network::Server;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Arc::new(Server::bind(ServerSettings::default()).await?);
//!
//!     let running = tokio::spawn(Arc::clone(&server).run());
//!     tokio::signal::ctrl_c().await?;
//!     server.shutdown().await;
//!     running.await??;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod client_manager;
pub mod config;
pub mod io_roles;
pub mod network;
pub mod pool;
pub mod relay;
pub mod role;
pub mod scheduler;
