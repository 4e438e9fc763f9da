//! Event demultiplexer binding.
//!
//! Wraps the kernel readiness facility (epoll on Linux, kqueue on the BSDs
//! and macOS) behind the narrow interface the worker pool needs: start a
//! watcher, stop a watcher, block for one ready event, wake the blocked
//! leader from another thread, and drop a descriptor. Keeping the seam this
//! small isolates the backend choice and lets tests substitute a
//! deterministic fake.
//!
//! One-shot mode does the leader–follower handoff for us: a delivered event
//! leaves the descriptor disarmed in the kernel until it is explicitly
//! re-armed, so two workers can never handle events for the same watcher
//! concurrently.

use std::collections::HashMap;
use std::io;
use std::num::NonZeroUsize;
use std::os::fd::{BorrowedFd, RawFd};

use parking_lot::Mutex;
use polling::{Event, Events, PollMode, Poller};

/// Readiness edge a watcher is registered for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Direction {
    Read,
    Write,
}

/// A watcher is one descriptor + direction readiness registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct WatcherId {
    pub fd: RawFd,
    pub dir: Direction,
}

impl WatcherId {
    pub fn read(fd: RawFd) -> Self {
        WatcherId {
            fd,
            dir: Direction::Read,
        }
    }

    pub fn write(fd: RawFd) -> Self {
        WatcherId {
            fd,
            dir: Direction::Write,
        }
    }
}

/// Outcome of one blocking iteration.
pub(crate) enum Wait {
    /// Exactly one watcher fired. It is already stopped; the caller owns its
    /// handling and must re-arm it explicitly.
    Ready(WatcherId),
    /// The wakeup channel fired (or the wait was interrupted spuriously):
    /// drain the command queue.
    Wakeup,
}

/// The five demultiplexer capabilities the core relies on.
pub(crate) trait Demux: Send + Sync {
    fn arm(&self, watcher: WatcherId) -> io::Result<()>;
    fn disarm(&self, watcher: WatcherId) -> io::Result<()>;
    fn wait_one(&self) -> io::Result<Wait>;
    fn wake(&self);
    fn forget(&self, fd: RawFd);
}

/// Armed state for one descriptor. The kernel holds a single registration
/// per fd, so the two logical watchers (read, write) merge into one interest
/// set here.
#[derive(Default)]
struct FdState {
    registered: bool,
    read_armed: bool,
    write_armed: bool,
}

impl FdState {
    fn interest(&self, fd: RawFd) -> Event {
        let key = fd as usize;
        match (self.read_armed, self.write_armed) {
            (true, true) => Event::all(key),
            (true, false) => Event::readable(key),
            (false, true) => Event::writable(key),
            (false, false) => Event::none(key),
        }
    }
}

/// Readiness demultiplexer over `polling::Poller` in one-shot mode.
pub(crate) struct PollDemux {
    poller: Poller,
    fds: Mutex<HashMap<RawFd, FdState>>,
}

impl PollDemux {
    pub fn new() -> io::Result<Self> {
        Ok(PollDemux {
            poller: Poller::new()?,
            fds: Mutex::new(HashMap::new()),
        })
    }

    /// Push the fd's current interest set down to the kernel, registering it
    /// on first use.
    fn apply(&self, fd: RawFd, state: &mut FdState) -> io::Result<()> {
        let interest = state.interest(fd);
        if state.registered {
            self.poller.modify_with_mode(
                unsafe { BorrowedFd::borrow_raw(fd) },
                interest,
                PollMode::Oneshot,
            )
        } else {
            unsafe { self.poller.add_with_mode(fd, interest, PollMode::Oneshot)? };
            state.registered = true;
            Ok(())
        }
    }
}

impl Demux for PollDemux {
    fn arm(&self, watcher: WatcherId) -> io::Result<()> {
        let mut fds = self.fds.lock();
        let state = fds.entry(watcher.fd).or_default();
        match watcher.dir {
            Direction::Read => state.read_armed = true,
            Direction::Write => state.write_armed = true,
        }
        self.apply(watcher.fd, state)
    }

    fn disarm(&self, watcher: WatcherId) -> io::Result<()> {
        let mut fds = self.fds.lock();
        let Some(state) = fds.get_mut(&watcher.fd) else {
            return Ok(());
        };
        match watcher.dir {
            Direction::Read => state.read_armed = false,
            Direction::Write => state.write_armed = false,
        }
        if state.registered {
            self.apply(watcher.fd, state)
        } else {
            Ok(())
        }
    }

    fn wait_one(&self) -> io::Result<Wait> {
        let mut events = Events::with_capacity(NonZeroUsize::new(1).unwrap());
        loop {
            events.clear();
            match self.poller.wait(&mut events, None) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            let Some(event) = events.iter().next() else {
                return Ok(Wait::Wakeup);
            };

            let fd = event.key as RawFd;
            let mut fds = self.fds.lock();
            let Some(state) = fds.get_mut(&fd) else {
                // The descriptor was forgotten between delivery and here.
                continue;
            };

            // The one-shot delivery disarmed the whole fd. Hand off exactly
            // one watcher — write first, matching the dispatch order — and
            // restore the kernel registration for the other direction if it
            // is still wanted.
            let dir = if event.writable && state.write_armed {
                state.write_armed = false;
                Direction::Write
            } else if event.readable && state.read_armed {
                state.read_armed = false;
                Direction::Read
            } else {
                // Stale delivery for a disarmed watcher: restore the
                // remaining interest and keep waiting.
                let _ = self.apply(fd, state);
                continue;
            };

            if state.read_armed || state.write_armed {
                let _ = self.apply(fd, state);
            }
            return Ok(Wait::Ready(WatcherId { fd, dir }));
        }
    }

    fn wake(&self) {
        let _ = self.poller.notify();
    }

    fn forget(&self, fd: RawFd) {
        let mut fds = self.fds.lock();
        if let Some(state) = fds.remove(&fd) {
            if state.registered {
                let _ = self.poller.delete(unsafe { BorrowedFd::borrow_raw(fd) });
            }
        }
    }
}
