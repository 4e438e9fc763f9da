use std::io;

use thiserror::Error;

/// Errors returned by the lineloop networking core.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying syscall or poller failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Listener socket setup failed (socket/bind/listen/sockopt).
    #[error("listener setup: {0}")]
    ListenerSetup(String),
    /// Configuration value out of range.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Operation on a connection that has already been closed.
    #[error("connection closed")]
    ConnectionClosed,
    /// Ring growth failed at the allocator. Fatal to the connection only.
    #[error("buffer allocation failed")]
    BufferAlloc,
}
