//! # iperf3-server
//!
//! A modular, async implementation of the server side of the iperf3
//! network-throughput measurement protocol.
//!
//! ## Features
//!
//! - Full control-channel protocol (cookie, phase bytes, JSON parameter and
//!   result exchange)
//! - TCP and UDP data streams, including UDP's loss/out-of-order/jitter
//!   accounting
//! - One `tokio` task per data stream, coordinated by a timer-driven event
//!   loop
//! - A reporter hook trait for embedding callers that want live stats
//!
//! ## Example
//!
//! ```no_run
//! use iperf3_server::{Iperf3Config, Iperf3Server};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Iperf3Config::default();
//!     let server = Iperf3Server::new(config);
//!     server.run().await.unwrap();
//! }
//! ```

pub mod config;
pub mod error;
pub mod net;
pub mod protocol;
pub mod server;
pub mod session;
pub mod stats;
pub mod stream;
pub mod tcp;
pub mod timer;
pub mod udp;
pub mod worker;

pub use config::Iperf3Config;
pub use error::Iperf3Error;
pub use server::Iperf3Server;
pub use session::TestSession;
