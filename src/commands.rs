//! Deferred control operations for the event loop.
//!
//! Watcher state must only be mutated from inside a loop iteration, but
//! worker threads and handler code need to re-arm watchers (or break the
//! loop) from outside. They push a [`Command`] here and signal the poller's
//! wakeup channel; the current leader drains the queue inside its iteration.

use parking_lot::Mutex;

use crate::demux::WatcherId;

/// A deferred control operation. Each command is an idempotent intent, so
/// ordering among pending commands is insignificant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Command {
    /// Break out of the worker loop.
    Exit,
    /// Start (re-arm) the referenced watcher.
    Schedule(WatcherId),
}

/// Lock-protected list of pending commands. The lock is held only over head
/// mutation; handling happens outside it.
#[derive(Default)]
pub(crate) struct CommandQueue {
    pending: Mutex<Vec<Command>>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, command: Command) {
        self.pending.lock().push(command);
    }

    /// Take the whole pending list, leaving the queue empty.
    pub fn drain(&self) -> Vec<Command> {
        std::mem::take(&mut *self.pending.lock())
    }
}
