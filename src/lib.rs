//! lineloop — leader–follower networking core for line-oriented TCP servers.
//!
//! lineloop accepts connections, shuttles bytes between kernel sockets and
//! per-connection ring buffers, frames inbound requests on a delimiter, and
//! transmits responses — sustaining high concurrency with a small, bounded
//! pool of worker threads over a single readiness demultiplexer (epoll on
//! Linux, kqueue on the BSDs and macOS).
//!
//! Three pieces carry the load:
//!
//! - a **leader–follower worker pool**: threads take turns running the
//!   demultiplexer; each ready event is handled outside the serialization
//!   point, so event handling parallelizes while the event loop itself never
//!   needs per-event locking;
//! - **dual circular buffers per connection** with 8x growth, scatter/gather
//!   `readv`/`writev`, and zero-copy extraction of complete frames;
//! - a **write path** that writes directly to the socket until backpressure
//!   forces a short write, then queues bytes in the output ring and drains
//!   them from the write watcher, preserving order across the switch.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use lineloop::{ClientHandle, ConfigBuilder, HandlerError, Networking, RequestHandler};
//!
//! struct Echo;
//!
//! impl RequestHandler for Echo {
//!     fn handle_request(&self, client: &mut ClientHandle<'_>) -> Result<(), HandlerError> {
//!         while let Some(frame) = client.input.extract_to_terminator(b'\n') {
//!             // The frame ends in NUL where the terminator was.
//!             let line = &frame[..frame.len() - 1];
//!             client
//!                 .conn
//!                 .send_response(&[line, b"\n"])
//!                 .map_err(|e| HandlerError(e.to_string()))?;
//!         }
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> Result<(), lineloop::Error> {
//!     let config = ConfigBuilder::new()
//!         .tcp_port(7878)
//!         .worker_threads(4)
//!         .build()?;
//!     let net = Networking::init(config, Arc::new(Echo))?;
//!     let (_shutdown, handles) = net.launch()?;
//!     for h in handles {
//!         h.join().unwrap();
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Platform
//!
//! Unix only. The core talks to the kernel through `readv`/`writev` on
//! non-blocking sockets and a readiness poller.

// ── Internal modules ────────────────────────────────────────────────────
pub(crate) mod acceptor;
pub(crate) mod commands;
pub(crate) mod connection;
pub(crate) mod demux;
pub(crate) mod driver;
pub(crate) mod worker;

// ── Public modules ──────────────────────────────────────────────────────
pub mod buffer;
pub mod config;
pub mod error;
pub mod handler;
pub mod metrics;

// ── Re-exports ──────────────────────────────────────────────────────────

pub use buffer::{CircBuf, Frame};
pub use config::{Config, ConfigBuilder};
pub use driver::Networking;
pub use error::Error;
pub use handler::{ClientHandle, ConnCtx, HandlerError, InputRing, RequestHandler};
pub use worker::ShutdownHandle;
