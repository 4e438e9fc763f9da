//! The request-handler interface.
//!
//! The networking core frames bytes; a [`RequestHandler`] interprets them.
//! After every successful read the core invokes the handler with a
//! [`ClientHandle`] exposing the connection's input ring and its response
//! side. The handler consumes complete frames via
//! [`InputRing::extract_to_terminator`] and emits replies via
//! [`ConnCtx::send_response`].

use std::cell::Cell;
use std::os::fd::RawFd;
use std::sync::Arc;

use parking_lot::MutexGuard;
use thiserror::Error;

use crate::buffer::{CircBuf, Frame};
use crate::connection::Conn;
use crate::driver::Networking;
use crate::error::Error as NetError;

/// Error returned by a request handler. Returning `Err` closes the
/// connection.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

/// Business logic invoked by the core. Implementations carry their own state
/// (the filter manager, command tables, whatever interprets the frames);
/// the core never looks inside.
pub trait RequestHandler: Send + Sync {
    /// Called once when the networking context is initialized, before any
    /// listener is armed.
    fn startup(&self) {}

    /// Invoked after each read that delivered bytes. Extract as many
    /// complete frames as the input ring holds; partial frames stay put for
    /// the next read. Returning `Err` closes the connection.
    fn handle_request(&self, client: &mut ClientHandle<'_>) -> Result<(), HandlerError>;
}

/// Handle passed to [`RequestHandler::handle_request`].
///
/// The two sides are separate fields so a frame borrowed from `input` can be
/// passed straight to `conn.send_response` without fighting the borrow
/// checker:
///
/// ```ignore
/// while let Some(frame) = client.input.extract_to_terminator(b'\n') {
///     client.conn.send_response(&[&frame[..frame.len() - 1], b"\n"])?;
/// }
/// ```
pub struct ClientHandle<'a> {
    /// The connection's input ring; frames are consumed from here.
    pub input: InputRing<'a>,
    /// The response and control side of the connection.
    pub conn: ConnCtx<'a>,
}

impl<'a> ClientHandle<'a> {
    pub(crate) fn new(
        net: &'a Networking,
        conn: &'a Arc<Conn>,
        input: MutexGuard<'a, CircBuf>,
    ) -> Self {
        ClientHandle {
            input: InputRing { guard: input },
            conn: ConnCtx {
                net,
                conn,
                close_requested: Cell::new(false),
            },
        }
    }
}

/// Borrow of the connection's input ring for the duration of one handler
/// invocation.
pub struct InputRing<'a> {
    guard: MutexGuard<'a, CircBuf>,
}

impl InputRing<'_> {
    /// Extract the next frame ending in `terminator`, consuming it from the
    /// ring. The terminator byte is replaced with NUL in the returned frame.
    /// `None` means no complete frame is buffered; the partial bytes remain
    /// for the next read to finish.
    ///
    /// The returned [`Frame`] borrows the ring when the frame is contiguous
    /// (the common case) and owns a copy only when it crossed the wrap
    /// boundary.
    pub fn extract_to_terminator(&mut self, terminator: u8) -> Option<Frame<'_>> {
        self.guard.extract_to_terminator(terminator)
    }

    /// Unconsumed bytes currently buffered.
    pub fn len(&self) -> usize {
        self.guard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard.is_empty()
    }
}

/// The response and control side of a connection.
pub struct ConnCtx<'a> {
    net: &'a Networking,
    conn: &'a Arc<Conn>,
    pub(crate) close_requested: Cell<bool>,
}

impl ConnCtx<'_> {
    /// Deliver the concatenation of `buffers` in order. Most responses go
    /// straight to the socket; under backpressure the bytes queue in the
    /// output ring and drain as the peer accepts them, preserving order.
    pub fn send_response(&self, buffers: &[&[u8]]) -> Result<(), NetError> {
        self.net.send_response(self.conn, buffers)
    }

    /// Ask the core to close this connection once the handler returns.
    /// Idempotent. Deferred rather than immediate so the handler can keep
    /// using the input ring it still holds.
    pub fn request_close(&self) {
        self.close_requested.set(true);
    }

    /// The connection's raw descriptor, for logging.
    pub fn fd(&self) -> RawFd {
        self.conn.fd
    }
}
