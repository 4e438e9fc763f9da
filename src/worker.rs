//! The leader–follower worker pool and lifecycle management.
//!
//! Worker threads take turns being the sole consumer of the demultiplexer:
//! one leader blocks inside `wait_one` while the followers queue on the
//! leader lock. When an event arrives, the leader records it, releases the
//! lock (crowning the next follower), and handles the event outside the
//! lock. The handed-off watcher is already stopped, so no two workers can
//! ever process events for the same watcher concurrently — N-way
//! parallelism over event handling with no per-event locking inside the
//! demultiplexer.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;

use crate::commands::Command;
use crate::demux::Wait;
use crate::driver::Networking;
use crate::error::Error;
use crate::metrics;

/// Handle returned by [`Networking::launch`] to trigger graceful shutdown.
pub struct ShutdownHandle {
    net: Arc<Networking>,
}

impl ShutdownHandle {
    /// Shut the networking core down; see [`Networking::shutdown`].
    pub fn shutdown(&self) {
        self.net.shutdown();
    }
}

impl Networking {
    /// Enter the worker pool on the calling thread. Blocks until shutdown.
    ///
    /// Any number of threads may call this; no thread is special. Use
    /// [`launch`](Self::launch) to have the core spawn them instead.
    pub fn run_worker(&self) {
        *self.active_workers.lock() += 1;

        self.worker_loop();

        let mut active = self.active_workers.lock();
        *active -= 1;
        if *active == 0 {
            self.workers_done.notify_all();
        }
    }

    fn worker_loop(&self) {
        let mut registered = false;

        while self.should_run.load(Ordering::Acquire) {
            // Become the leader.
            let leader = self.leader_lock.lock();

            if !registered {
                self.roster.lock().push(thread::current().id());
                registered = true;
                log::debug!("worker {:?} joined the pool", thread::current().id());
            }

            // Shutdown may have started while we waited for leadership.
            if !self.should_run.load(Ordering::Acquire) {
                drop(leader);
                break;
            }

            // Run one iteration of the event loop. At most one watcher
            // fires, and it comes back already stopped.
            let ready = match self.demux.wait_one() {
                Ok(ready) => ready,
                Err(e) => {
                    log::error!("demultiplexer wait failed: {e}");
                    drop(leader);
                    continue;
                }
            };

            let mut event = None;
            let mut exit = false;
            match ready {
                Wait::Ready(watcher) => event = Some(watcher),
                Wait::Wakeup => {
                    // Drain deferred control operations while still leader:
                    // watcher state must only change inside the loop.
                    for command in self.commands.drain() {
                        metrics::COMMANDS_PROCESSED.increment();
                        match command {
                            Command::Exit => exit = true,
                            Command::Schedule(watcher) => {
                                if !self.watcher_armable(watcher) {
                                    continue;
                                }
                                if let Err(e) = self.demux.arm(watcher) {
                                    log::error!(
                                        "failed to re-arm watcher on [{}]: {e}",
                                        watcher.fd
                                    );
                                }
                            }
                        }
                    }
                }
            }

            // Release leadership; another worker may enter the loop while we
            // handle the event.
            drop(leader);

            if exit {
                break;
            }
            if let Some(watcher) = event {
                self.dispatch(watcher);
            }
        }
    }

    /// The minimal shutdown trigger: set the stop flag, post an exit
    /// command, wake the leader. Touches nothing else, so it is safe to call
    /// from a signal-handling thread.
    pub fn request_stop(&self) {
        self.should_run.store(false, Ordering::Release);
        self.commands.push(Command::Exit);
        self.demux.wake();
    }

    /// Graceful shutdown: stop the workers, wait for every one of them to
    /// exit (a worker mid-handler finishes its event first), then close the
    /// listeners and all client connections.
    ///
    /// Must not be called from a worker thread.
    pub fn shutdown(&self) {
        self.request_stop();

        let mut active = self.active_workers.lock();
        while *active > 0 {
            self.workers_done.wait(&mut active);
        }
        drop(active);

        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }

        // Stop listening for new connections.
        if self.tcp_fd >= 0 {
            self.demux.forget(self.tcp_fd);
            unsafe { libc::close(self.tcp_fd) };
        }
        if self.udp_fd >= 0 {
            self.demux.forget(self.udp_fd);
            unsafe { libc::close(self.udp_fd) };
        }

        // Close all the client connections.
        for conn in self.conns.snapshot() {
            self.close_client_connection(&conn);
        }

        log::debug!("networking stack shut down");
    }

    /// Spawn the configured number of worker threads (0 = number of CPUs),
    /// each running [`run_worker`](Self::run_worker).
    pub fn launch(
        self: Arc<Self>,
    ) -> Result<(ShutdownHandle, Vec<thread::JoinHandle<()>>), Error> {
        let num_threads = if self.config.worker_threads == 0 {
            num_cpus()
        } else {
            self.config.worker_threads
        };

        let mut handles = Vec::with_capacity(num_threads);
        for worker_id in 0..num_threads {
            let net = Arc::clone(&self);
            let handle = thread::Builder::new()
                .name(format!("lineloop-worker-{worker_id}"))
                .spawn(move || net.run_worker())
                .map_err(Error::Io)?;
            handles.push(handle);
        }

        Ok((ShutdownHandle { net: self }, handles))
    }
}

/// Get the number of available CPU cores.
fn num_cpus() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if ret < 1 { 1 } else { ret as usize }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::os::fd::RawFd;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use parking_lot::{Condvar, Mutex};

    use crate::demux::{Demux, WatcherId};

    /// Deterministic demultiplexer: `wait_one` blocks until `wake` and
    /// instruments how many threads are inside it at once.
    struct FakeDemux {
        wakes: Mutex<usize>,
        cond: Condvar,
        inside: AtomicUsize,
        max_inside: AtomicUsize,
        iterations: AtomicUsize,
    }

    impl FakeDemux {
        fn new() -> Self {
            FakeDemux {
                wakes: Mutex::new(0),
                cond: Condvar::new(),
                inside: AtomicUsize::new(0),
                max_inside: AtomicUsize::new(0),
                iterations: AtomicUsize::new(0),
            }
        }
    }

    impl Demux for FakeDemux {
        fn arm(&self, _watcher: WatcherId) -> io::Result<()> {
            Ok(())
        }

        fn disarm(&self, _watcher: WatcherId) -> io::Result<()> {
            Ok(())
        }

        fn wait_one(&self) -> io::Result<Wait> {
            let inside = self.inside.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_inside.fetch_max(inside, Ordering::SeqCst);
            self.iterations.fetch_add(1, Ordering::SeqCst);

            // Linger a little so overlapping entries would be caught.
            thread::sleep(Duration::from_micros(200));

            let mut wakes = self.wakes.lock();
            while *wakes == 0 {
                self.cond.wait(&mut wakes);
            }
            *wakes -= 1;
            drop(wakes);

            self.inside.fetch_sub(1, Ordering::SeqCst);
            Ok(Wait::Wakeup)
        }

        fn wake(&self) {
            *self.wakes.lock() += 1;
            self.cond.notify_one();
        }

        fn forget(&self, _fd: RawFd) {}
    }

    #[test]
    fn at_most_one_leader_inside_the_demultiplexer() {
        let fake = Arc::new(FakeDemux::new());
        let net = Networking::for_tests(fake.clone());

        let mut workers = Vec::new();
        for _ in 0..4 {
            let net = Arc::clone(&net);
            workers.push(thread::spawn(move || net.run_worker()));
        }

        // Cycle leadership a few hundred times.
        for _ in 0..200 {
            fake.wake();
            thread::sleep(Duration::from_micros(100));
        }

        net.request_stop();
        for worker in workers {
            worker.join().unwrap();
        }

        assert!(fake.iterations.load(Ordering::SeqCst) > 0);
        assert_eq!(
            fake.max_inside.load(Ordering::SeqCst),
            1,
            "two workers entered the demultiplexer concurrently"
        );
        assert_eq!(net.roster.lock().len(), 4);
    }

    #[test]
    fn shutdown_waits_for_workers() {
        let fake = Arc::new(FakeDemux::new());
        let net = Networking::for_tests(fake.clone());

        let mut workers = Vec::new();
        for _ in 0..2 {
            let net = Arc::clone(&net);
            workers.push(thread::spawn(move || net.run_worker()));
        }
        thread::sleep(Duration::from_millis(20));

        net.shutdown();
        assert_eq!(*net.active_workers.lock(), 0);

        for worker in workers {
            worker.join().unwrap();
        }
    }

    #[test]
    fn exit_command_terminates_a_worker() {
        let fake = Arc::new(FakeDemux::new());
        let net = Networking::for_tests(fake.clone());

        let worker = {
            let net = Arc::clone(&net);
            thread::spawn(move || net.run_worker())
        };
        thread::sleep(Duration::from_millis(10));

        // Exit alone must unblock and terminate the worker even though the
        // flag flips in the same call.
        net.request_stop();
        worker.join().unwrap();
        assert_eq!(*net.active_workers.lock(), 0);
    }
}
