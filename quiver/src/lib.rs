//! # quiver: QUIC endpoint runtime
//!
//! The run loop around [`quiver_quic`]'s protocol core: one UDP socket, a
//! timer wheel, connection lookup by CID / source address / reset token, a
//! pre-allocated buffer pool, and the blocking API surface (`connect`,
//! `accept`, `read_stream`, `ready`).
//!
//! Scheduling is single-threaded and cooperative on a current-thread tokio
//! runtime; the only suspension points are the socket receive and the
//! timer sleep. Each blocking call enters the loop until its completion
//! condition holds or its deadline passes.
//!
//! ```no_run
//! use quiver::{Config, Endpoint};
//! use std::time::Duration;
//!
//! # fn main() -> anyhow::Result<()> {
//! let mut server = Endpoint::server(Config::default(), "0.0.0.0:4433".parse()?)?;
//! while let Some(conn) = server.accept(Some(Duration::from_secs(5)))? {
//!     // serve requests on `conn`
//!     let _ = conn;
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod endpoint;
pub mod pool;
pub mod timer;

pub use config::Config;
pub use endpoint::{ConnHandle, Endpoint, TlsFactory};
pub use quiver_quic::{Event, StreamId};
