//! The networking context: event dispatch, the read path, and the
//! DIRECT/BUFFERED write-path state machine.
//!
//! Handlers run on whichever worker thread just gave up leadership, so every
//! path here is written to be safe under N-way concurrency across
//! connections: input rings are guarded by their mutex (uncontended — leader
//! exclusion admits one read event per connection at a time), and the entire
//! output side of a connection is guarded by its output lock.

use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::acceptor;
use crate::commands::{Command, CommandQueue};
use crate::config::Config;
use crate::connection::{Conn, ConnTable, OutputState};
use crate::demux::{Demux, PollDemux, WatcherId};
use crate::error::Error;
use crate::handler::{ClientHandle, RequestHandler};
use crate::metrics;

/// Process-wide state of the networking core. One per server process;
/// shared by every worker thread.
pub struct Networking {
    pub(crate) config: Config,
    pub(crate) demux: Arc<dyn Demux>,
    pub(crate) commands: CommandQueue,
    pub(crate) conns: ConnTable,
    /// Serializes entry into the demultiplexer: at most one leader.
    pub(crate) leader_lock: Mutex<()>,
    pub(crate) tcp_fd: RawFd,
    pub(crate) udp_fd: RawFd,
    bound_tcp_port: u16,
    bound_udp_port: u16,
    pub(crate) should_run: AtomicBool,
    /// Thread ids of workers that have entered the pool.
    pub(crate) roster: Mutex<Vec<std::thread::ThreadId>>,
    pub(crate) active_workers: Mutex<usize>,
    pub(crate) workers_done: Condvar,
    pub(crate) handler: Arc<dyn RequestHandler>,
    pub(crate) torn_down: AtomicBool,
}

impl Networking {
    /// Initialize the networking core: bind the TCP and UDP listeners, set
    /// up the demultiplexer, and arm the listener watchers. Fully rolls back
    /// on partial failure. Workers are started separately with
    /// [`run_worker`](Self::run_worker) or [`launch`](Self::launch).
    pub fn init(
        config: Config,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<Arc<Networking>, Error> {
        config.validate()?;

        let demux = PollDemux::new()?;

        let tcp_fd = acceptor::setup_tcp_listener(&config)?;
        let udp_fd = match acceptor::setup_udp_listener(&config) {
            Ok(fd) => fd,
            Err(e) => {
                unsafe { libc::close(tcp_fd) };
                return Err(e);
            }
        };

        let bound_tcp_port = acceptor::local_port(tcp_fd).unwrap_or(config.tcp_port);
        let bound_udp_port = acceptor::local_port(udp_fd).unwrap_or(config.udp_port);

        let net = Arc::new(Networking {
            conns: ConnTable::new(config.conn_table_size, config.buffer_size),
            config,
            demux: Arc::new(demux),
            commands: CommandQueue::new(),
            leader_lock: Mutex::new(()),
            tcp_fd,
            udp_fd,
            bound_tcp_port,
            bound_udp_port,
            should_run: AtomicBool::new(true),
            roster: Mutex::new(Vec::new()),
            active_workers: Mutex::new(0),
            workers_done: Condvar::new(),
            handler,
            torn_down: AtomicBool::new(false),
        });

        // Prepare the request handler before any traffic can arrive.
        net.handler.startup();

        if let Err(e) = net
            .demux
            .arm(WatcherId::read(tcp_fd))
            .and_then(|()| net.demux.arm(WatcherId::read(udp_fd)))
        {
            unsafe {
                libc::close(tcp_fd);
                libc::close(udp_fd);
            }
            return Err(Error::Io(e));
        }

        Ok(net)
    }

    /// The port the TCP listener actually bound (useful with `tcp_port: 0`).
    pub fn tcp_port(&self) -> u16 {
        self.bound_tcp_port
    }

    /// The port the reserved UDP socket actually bound.
    pub fn udp_port(&self) -> u16 {
        self.bound_udp_port
    }

    /// Enqueue a deferred control operation and wake the current leader so
    /// it drains the queue inside the loop. Multiple pending commands
    /// coalesce into one wakeup.
    pub(crate) fn schedule_async(&self, command: Command) {
        self.commands.push(command);
        self.demux.wake();
    }

    /// Whether a `Schedule` command should still be honored. Listeners are
    /// always armable; a connection watcher is only armable while the
    /// connection has not been closed.
    pub(crate) fn watcher_armable(&self, watcher: WatcherId) -> bool {
        if watcher.fd == self.tcp_fd || watcher.fd == self.udp_fd {
            return true;
        }
        self.conns
            .get(watcher.fd)
            .map(|conn| conn.schedulable.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Handle one ready watcher. Runs outside the leader lock; any number of
    /// dispatches may execute concurrently across workers (for distinct
    /// watchers).
    pub(crate) fn dispatch(&self, watcher: WatcherId) {
        if watcher.fd == self.tcp_fd {
            acceptor::handle_new_client(self);
            self.schedule_async(Command::Schedule(watcher));
            return;
        }

        if watcher.fd == self.udp_fd {
            // Reserved endpoint: bound but unimplemented. The watcher stays
            // disarmed so this logs once per arm, not per datagram.
            log::warn!("UDP datagrams are not handled; ignoring readiness event");
            metrics::UDP_EVENTS_IGNORED.increment();
            return;
        }

        let Some(conn) = self.conns.get(watcher.fd) else {
            log::error!("readiness event for unknown descriptor [{}]", watcher.fd);
            return;
        };
        match watcher.dir {
            crate::demux::Direction::Write => self.handle_conn_write(&conn),
            crate::demux::Direction::Read => self.handle_conn_read(&conn),
        }
    }

    /// The read path: drain the socket into the input ring, then hand the
    /// buffered bytes to the request handler.
    fn handle_conn_read(&self, conn: &Arc<Conn>) {
        let mut input = conn.input.lock();

        // Keep at least half the ring writable so one readv can make real
        // progress.
        if input.available() < input.capacity() / 2 {
            if input.grow().is_err() {
                log::error!("input ring growth failed for connection [{}]", conn.fd);
                drop(input);
                self.close_client_connection(conn);
                return;
            }
        }

        let (first, second) = input.write_slices();
        let iovs = [
            libc::iovec {
                iov_base: first.as_mut_ptr() as *mut libc::c_void,
                iov_len: first.len(),
            },
            libc::iovec {
                iov_base: second.as_mut_ptr() as *mut libc::c_void,
                iov_len: second.len(),
            },
        ];
        let num_vectors: libc::c_int = if iovs[1].iov_len == 0 { 1 } else { 2 };
        let read_bytes = unsafe { libc::readv(conn.fd, iovs.as_ptr(), num_vectors) };

        if read_bytes == 0 {
            log::debug!("closed client connection [{}]", conn.fd);
            drop(input);
            self.close_client_connection(conn);
            return;
        }

        if read_bytes < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EINTR) => {
                    // Spurious readiness; the watcher re-arms below.
                    drop(input);
                }
                _ => {
                    log::error!("failed to read from connection [{}]: {err}", conn.fd);
                    drop(input);
                    self.close_client_connection(conn);
                    return;
                }
            }
        } else {
            input.advance_write(read_bytes as usize);
            metrics::BYTES_RECEIVED.add(read_bytes as u64);

            let mut client = ClientHandle::new(self, conn, input);
            let result = self.handler.handle_request(&mut client);
            let close_requested = client.conn.close_requested.get();
            drop(client);

            match result {
                Err(e) => {
                    log::debug!("request handler closed connection [{}]: {e}", conn.fd);
                    self.close_client_connection(conn);
                    return;
                }
                Ok(()) if close_requested => {
                    self.close_client_connection(conn);
                    return;
                }
                Ok(()) => {}
            }
        }

        if conn.schedulable.load(Ordering::Acquire) {
            self.schedule_async(Command::Schedule(conn.read_watcher()));
        } else {
            // Closed while the handler held the input ring: finish the reset
            // that close_client_connection had to skip.
            conn.input.lock().reset();
        }
    }

    /// The write watcher fired: flush buffered output to the socket.
    pub(crate) fn handle_conn_write(&self, conn: &Arc<Conn>) {
        let mut out = conn.output.lock();

        let (first, second) = out.ring.read_slices();
        if first.is_empty() {
            // Nothing left to flush; go back to direct writes.
            out.buffered = false;
            return;
        }
        let iovs = [
            libc::iovec {
                iov_base: first.as_ptr() as *mut libc::c_void,
                iov_len: first.len(),
            },
            libc::iovec {
                iov_base: second.as_ptr() as *mut libc::c_void,
                iov_len: second.len(),
            },
        ];
        let num_vectors: libc::c_int = if iovs[1].iov_len == 0 { 1 } else { 2 };
        let write_bytes = unsafe { libc::writev(conn.fd, iovs.as_ptr(), num_vectors) };

        if write_bytes == 0 {
            log::debug!("closed client connection [{}]", conn.fd);
            drop(out);
            self.close_client_connection(conn);
            return;
        }

        if write_bytes < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EINTR) => {
                    self.schedule_async(Command::Schedule(conn.write_watcher()));
                }
                _ => {
                    log::error!("failed to write to connection [{}]: {err}", conn.fd);
                    drop(out);
                    self.close_client_connection(conn);
                }
            }
            return;
        }

        out.ring.advance_read(write_bytes as usize);
        metrics::BYTES_SENT.add(write_bytes as u64);

        if out.ring.is_empty() {
            // Drained: back to direct writes, stop re-arming the watcher.
            out.buffered = false;
        } else {
            self.schedule_async(Command::Schedule(conn.write_watcher()));
        }
    }

    /// Deliver the concatenation of `buffers` in order.
    ///
    /// Most responses fit in the TCP send buffer and go out in one `writev`
    /// without touching the output ring. A short write stashes the exact
    /// unsent suffix in the ring and flips the connection to buffered mode;
    /// from then on responses append to the ring until the write watcher
    /// drains it, preserving byte order across the switch.
    pub(crate) fn send_response(
        &self,
        conn: &Arc<Conn>,
        buffers: &[&[u8]],
    ) -> Result<(), Error> {
        if buffers.is_empty() {
            return Ok(());
        }
        if !conn.schedulable.load(Ordering::Acquire) {
            return Err(Error::ConnectionClosed);
        }

        let mut out = conn.output.lock();

        if out.buffered {
            // Another worker may still be draining the ring; appending under
            // the same lock keeps the bytes ordered behind it.
            if copy_to_output(&mut out, buffers, 0).is_err() {
                drop(out);
                log::error!("output ring growth failed for connection [{}]", conn.fd);
                self.close_client_connection(conn);
                return Err(Error::BufferAlloc);
            }
            metrics::RESPONSES_BUFFERED.increment();
            return Ok(());
        }

        // DIRECT: write straight to the socket.
        let total: usize = buffers.iter().map(|b| b.len()).sum();
        let iovs: Vec<libc::iovec> = buffers
            .iter()
            .map(|b| libc::iovec {
                iov_base: b.as_ptr() as *mut libc::c_void,
                iov_len: b.len(),
            })
            .collect();
        let sent = unsafe { libc::writev(conn.fd, iovs.as_ptr(), iovs.len() as libc::c_int) };

        if sent >= 0 && sent as usize == total {
            metrics::BYTES_SENT.add(total as u64);
            metrics::RESPONSES_DIRECT.increment();
            return Ok(());
        }

        let sent = if sent < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                // A transient failure with nothing written behaves as a full
                // short write: the entire payload is buffered.
                Some(libc::EAGAIN) | Some(libc::EINTR) | Some(libc::EWOULDBLOCK) => 0,
                _ => {
                    log::error!("failed to send to connection [{}]: {err}", conn.fd);
                    drop(out);
                    self.close_client_connection(conn);
                    return Err(Error::Io(err));
                }
            }
        } else {
            sent as usize
        };
        metrics::BYTES_SENT.add(sent as u64);

        // Short write: stash the unsent suffix and switch to buffered mode.
        if copy_to_output(&mut out, buffers, sent).is_err() {
            drop(out);
            log::error!("output ring growth failed for connection [{}]", conn.fd);
            self.close_client_connection(conn);
            return Err(Error::BufferAlloc);
        }
        out.buffered = true;
        metrics::RESPONSES_BUFFERED.increment();
        self.schedule_async(Command::Schedule(conn.write_watcher()));
        Ok(())
    }

    /// Close a client connection: stop its watchers, reset its rings, close
    /// the descriptor. Idempotent; the table slot stays allocated so the
    /// record can be re-used when the kernel hands the descriptor number
    /// back out.
    pub(crate) fn close_client_connection(&self, conn: &Conn) {
        if !conn.schedulable.swap(false, Ordering::AcqRel) {
            return;
        }

        self.demux.forget(conn.fd);
        // The request handler may be holding the input ring when a send
        // failure closes the connection mid-invocation; the read path resets
        // it after the handler returns in that case.
        if let Some(mut input) = conn.input.try_lock() {
            input.reset();
        }
        {
            let mut out = conn.output.lock();
            out.ring.reset();
            out.buffered = false;
        }
        unsafe { libc::close(conn.fd) };

        metrics::CONNECTIONS_CLOSED.increment();
        metrics::CONNECTIONS_ACTIVE.decrement();
        log::debug!("client connection closed [{}]", conn.fd);
    }
}

/// Append `buffers` to the output ring, skipping the first `skip` bytes of
/// the concatenation (the part a direct write already sent).
fn copy_to_output(
    out: &mut OutputState,
    buffers: &[&[u8]],
    mut skip: usize,
) -> Result<(), std::collections::TryReserveError> {
    for buf in buffers {
        if skip >= buf.len() {
            skip -= buf.len();
            continue;
        }
        out.ring.write(&buf[skip..])?;
        skip = 0;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::handler::HandlerError;

    pub(crate) struct NoopHandler;

    impl RequestHandler for NoopHandler {
        fn handle_request(&self, _client: &mut ClientHandle<'_>) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    impl Networking {
        /// A context with no listeners, for exercising the internals without
        /// binding sockets.
        pub(crate) fn for_tests(demux: Arc<dyn Demux>) -> Arc<Networking> {
            Arc::new(Networking {
                config: Config::default(),
                demux,
                commands: CommandQueue::new(),
                conns: ConnTable::new(64, 4096),
                leader_lock: Mutex::new(()),
                tcp_fd: -1,
                udp_fd: -1,
                bound_tcp_port: 0,
                bound_udp_port: 0,
                should_run: AtomicBool::new(true),
                roster: Mutex::new(Vec::new()),
                active_workers: Mutex::new(0),
                workers_done: Condvar::new(),
                handler: Arc::new(NoopHandler),
                torn_down: AtomicBool::new(false),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn socketpair_server_nonblocking() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let ret = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        };
        assert_eq!(ret, 0, "socketpair failed");
        let (server, client) = (fds[0], fds[1]);
        unsafe {
            let flags = libc::fcntl(server, libc::F_GETFL);
            libc::fcntl(server, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
        (server, client)
    }

    #[test]
    fn write_path_preserves_order_across_backpressure() {
        let net = Networking::for_tests(Arc::new(PollDemux::new().unwrap()));
        let (server, client) = socketpair_server_nonblocking();

        // Shrink the send buffer so backpressure hits within a few chunks.
        let bufsize: libc::c_int = 4096;
        unsafe {
            libc::setsockopt(
                server,
                libc::SOL_SOCKET,
                libc::SO_SNDBUF,
                &bufsize as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }

        let conn = net.conns.get_or_create(server);
        conn.schedulable.store(true, Ordering::Release);

        const CHUNKS: u32 = 200;
        const CHUNK_LEN: usize = 1000;
        let expected: Vec<u8> = (0..CHUNKS)
            .flat_map(|i| vec![(i % 251) as u8; CHUNK_LEN])
            .collect();

        // The peer starts reading only after a delay, so early sends fill
        // the kernel buffer and force the DIRECT -> BUFFERED switch.
        let reader = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            let mut chunk = vec![0u8; 65536];
            let mut received = Vec::new();
            while received.len() < CHUNKS as usize * CHUNK_LEN {
                let n = unsafe {
                    libc::read(client, chunk.as_mut_ptr() as *mut libc::c_void, chunk.len())
                };
                if n <= 0 {
                    break;
                }
                received.extend_from_slice(&chunk[..n as usize]);
            }
            unsafe { libc::close(client) };
            received
        });

        for i in 0..CHUNKS {
            let payload = vec![(i % 251) as u8; CHUNK_LEN];
            net.send_response(&conn, &[&payload]).unwrap();
        }
        assert!(
            conn.output.lock().buffered,
            "expected the short write to switch the connection to buffered mode"
        );

        // Drive the write watcher by hand until the ring drains.
        loop {
            if !conn.output.lock().buffered {
                break;
            }
            net.handle_conn_write(&conn);
            thread::sleep(Duration::from_millis(1));
        }

        let received = reader.join().unwrap();
        assert_eq!(received.len(), expected.len());
        assert_eq!(received, expected, "byte order broke across the switch");
        assert!(!conn.output.lock().buffered, "should be back in direct mode");

        net.close_client_connection(&conn);
    }

    #[test]
    fn close_is_idempotent_and_fails_sends_fast() {
        let net = Networking::for_tests(Arc::new(PollDemux::new().unwrap()));
        let (server, client) = socketpair_server_nonblocking();

        let conn = net.conns.get_or_create(server);
        conn.schedulable.store(true, Ordering::Release);

        net.close_client_connection(&conn);
        assert!(!conn.schedulable.load(Ordering::Acquire));
        // Second close is a no-op, not a double-close of the descriptor.
        net.close_client_connection(&conn);

        assert!(matches!(
            net.send_response(&conn, &[b"late"]),
            Err(Error::ConnectionClosed)
        ));

        unsafe { libc::close(client) };
    }

    #[test]
    fn empty_response_is_a_noop() {
        let net = Networking::for_tests(Arc::new(PollDemux::new().unwrap()));
        let (server, client) = socketpair_server_nonblocking();
        let conn = net.conns.get_or_create(server);
        conn.schedulable.store(true, Ordering::Release);

        net.send_response(&conn, &[]).unwrap();
        assert!(!conn.output.lock().buffered);

        net.close_client_connection(&conn);
        unsafe { libc::close(client) };
    }
}
