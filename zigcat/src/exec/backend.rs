//! The shared submission/completion contract the exec session drives, plus
//! the portable readiness backend. Platform-specific backends live in
//! sibling modules and are selected at session init with runtime fallback.

use crate::shared::RelayResult;
use std::time::Duration;
use wick::logging::{self, Logger};

#[cfg(unix)]
use std::os::unix::io::RawFd;

/// Identifies the originating operation of a completion. One operation per
/// tag may be in flight at a time.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OpTag {
    SocketRead,
    SocketWrite,
    StdinWrite,
    StdoutRead,
    StderrRead,
}

impl OpTag {
    pub const COUNT: usize = 5;

    pub fn index(self) -> usize {
        match self {
            OpTag::SocketRead => 0,
            OpTag::SocketWrite => 1,
            OpTag::StdinWrite => 2,
            OpTag::StdoutRead => 3,
            OpTag::StderrRead => 4,
        }
    }

    pub fn from_index(index: usize) -> Option<OpTag> {
        match index {
            0 => Some(OpTag::SocketRead),
            1 => Some(OpTag::SocketWrite),
            2 => Some(OpTag::StdinWrite),
            3 => Some(OpTag::StdoutRead),
            4 => Some(OpTag::StderrRead),
            _ => None,
        }
    }

    pub fn is_write(self) -> bool {
        matches!(self, OpTag::SocketWrite | OpTag::StdinWrite)
    }
}

/// Outcome of one submitted operation: a byte count, zero for EOF, or a
/// negative errno.
#[derive(Debug, Copy, Clone)]
pub struct Completion {
    pub tag: OpTag,
    pub result: isize,
}

/// The four descriptors a session multiplexes.
#[cfg(unix)]
#[derive(Debug, Copy, Clone)]
pub struct SessionFds {
    pub socket: RawFd,
    pub child_stdin: RawFd,
    pub child_stdout: RawFd,
    pub child_stderr: RawFd,
}

#[cfg(unix)]
impl SessionFds {
    fn fd_for(&self, tag: OpTag) -> RawFd {
        match tag {
            OpTag::SocketRead | OpTag::SocketWrite => self.socket,
            OpTag::StdinWrite => self.child_stdin,
            OpTag::StdoutRead => self.child_stdout,
            OpTag::StderrRead => self.child_stderr,
        }
    }
}

#[cfg(unix)]
#[derive(Debug, Copy, Clone)]
struct PendingOp {
    ptr: *mut u8,
    len: usize,
}

// Safety: the pointer refers to a buffer owned by the `ExecSession` this
// `PendingOp` lives inside, which is moved across threads as a whole (never
// shared), so there is no cross-thread aliasing of the pointee.
#[cfg(unix)]
unsafe impl Send for PendingOp {}

/// The per-platform I/O engines behind one dispatch surface. A tagged
/// variant keeps the hot-path dispatch a plain match.
pub enum Backend {
    #[cfg(target_os = "linux")]
    Submission(crate::exec::uring::UringBackend),
    #[cfg(windows)]
    CompletionPort(crate::exec::iocp::IocpBackend),
    #[cfg(unix)]
    Readiness(ReadinessBackend),
}

impl Backend {
    /// Picks the best available backend: submission/completion where the
    /// kernel supports it, the poll-based readiness engine otherwise.
    #[cfg(unix)]
    pub fn create(fds: SessionFds, log: &Logger) -> RelayResult<Backend> {
        #[cfg(target_os = "linux")]
        {
            match crate::exec::uring::UringBackend::create(fds, log) {
                Ok(backend) => return Ok(Backend::Submission(backend)),
                Err(err) => {
                    logging::info!(log, "submission backend unavailable, falling back";
                                   "error" => ?err);
                }
            }
        }

        ReadinessBackend::create(fds, log).map(Backend::Readiness)
    }

    /// Windows: the completion port is the only engine; a setup failure is
    /// surfaced rather than falling anywhere.
    #[cfg(windows)]
    pub fn create(
        handles: crate::exec::iocp::SessionHandles,
        log: &Logger,
    ) -> RelayResult<Backend> {
        let backend = crate::exec::iocp::IocpBackend::create(handles)?;
        logging::debug!(log, "using completion-port backend");
        Ok(Backend::CompletionPort(backend))
    }

    pub fn name(&self) -> &'static str {
        match self {
            #[cfg(target_os = "linux")]
            Backend::Submission(_) => "submission",
            #[cfg(windows)]
            Backend::CompletionPort(_) => "completion-port",
            #[cfg(unix)]
            Backend::Readiness(_) => "readiness",
        }
    }

    /// Submits a read of up to `len` bytes into `ptr`. The region must stay
    /// valid and unmoved until the completion for `tag` is observed.
    pub fn submit_read(&mut self, tag: OpTag, ptr: *mut u8, len: usize) -> RelayResult<()> {
        match self {
            #[cfg(target_os = "linux")]
            Backend::Submission(backend) => backend.submit_read(tag, ptr, len),
            #[cfg(windows)]
            Backend::CompletionPort(backend) => backend.submit_read(tag, ptr, len),
            #[cfg(unix)]
            Backend::Readiness(backend) => backend.submit(tag, ptr, len),
        }
    }

    /// Submits a write of `len` bytes from `ptr`, same lifetime contract as
    /// `submit_read`.
    pub fn submit_write(&mut self, tag: OpTag, ptr: *const u8, len: usize) -> RelayResult<()> {
        match self {
            #[cfg(target_os = "linux")]
            Backend::Submission(backend) => backend.submit_write(tag, ptr, len),
            #[cfg(windows)]
            Backend::CompletionPort(backend) => backend.submit_write(tag, ptr, len),
            #[cfg(unix)]
            Backend::Readiness(backend) => backend.submit(tag, ptr as *mut u8, len),
        }
    }

    pub fn in_flight(&self, tag: OpTag) -> bool {
        match self {
            #[cfg(target_os = "linux")]
            Backend::Submission(backend) => backend.in_flight(tag),
            #[cfg(windows)]
            Backend::CompletionPort(backend) => backend.in_flight(tag),
            #[cfg(unix)]
            Backend::Readiness(backend) => backend.in_flight(tag),
        }
    }

    /// Blocks until at least one completion or the timeout. A wait that
    /// times out leaves `out` empty; that is the distinguished sentinel.
    pub fn wait(&mut self, timeout: Option<Duration>, out: &mut Vec<Completion>) -> RelayResult<()> {
        match self {
            #[cfg(target_os = "linux")]
            Backend::Submission(backend) => backend.wait(timeout, out),
            #[cfg(windows)]
            Backend::CompletionPort(backend) => backend.wait(timeout, out),
            #[cfg(unix)]
            Backend::Readiness(backend) => backend.wait(timeout, out),
        }
    }

    /// Drops every in-flight operation. Called during session teardown
    /// before buffers are released.
    pub fn cancel_all(&mut self) {
        match self {
            #[cfg(target_os = "linux")]
            Backend::Submission(backend) => backend.cancel_all(),
            #[cfg(windows)]
            Backend::CompletionPort(backend) => backend.cancel_all(),
            #[cfg(unix)]
            Backend::Readiness(backend) => backend.cancel_all(),
        }
    }
}

/// Poll-based engine: a four-slot array covering the socket and the three
/// child pipes. Events are recomputed every wait from the pending
/// submissions; the actual non-blocking I/O happens when readiness arrives,
/// which is when the "completion" materializes.
#[cfg(unix)]
pub struct ReadinessBackend {
    fds: SessionFds,
    pending: [Option<PendingOp>; OpTag::COUNT],
    log: Logger,
}

#[cfg(unix)]
impl ReadinessBackend {
    /// Slot order in the poll array: socket, child stdin, child stdout,
    /// child stderr.
    const SLOTS: usize = 4;

    pub fn create(fds: SessionFds, log: &Logger) -> RelayResult<ReadinessBackend> {
        Ok(ReadinessBackend {
            fds,
            pending: [None; OpTag::COUNT],
            log: log.new(logging::o!("backend" => "readiness")),
        })
    }

    fn slot_for(tag: OpTag) -> usize {
        match tag {
            OpTag::SocketRead | OpTag::SocketWrite => 0,
            OpTag::StdinWrite => 1,
            OpTag::StdoutRead => 2,
            OpTag::StderrRead => 3,
        }
    }

    fn fd_for_slot(&self, slot: usize) -> RawFd {
        match slot {
            0 => self.fds.socket,
            1 => self.fds.child_stdin,
            2 => self.fds.child_stdout,
            _ => self.fds.child_stderr,
        }
    }

    pub fn submit(&mut self, tag: OpTag, ptr: *mut u8, len: usize) -> RelayResult<()> {
        if self.pending[tag.index()].is_some() {
            logging::warn!(self.log, "double submission suppressed"; "tag" => ?tag);
            return Ok(());
        }
        self.pending[tag.index()] = Some(PendingOp { ptr, len });
        Ok(())
    }

    pub fn in_flight(&self, tag: OpTag) -> bool {
        self.pending[tag.index()].is_some()
    }

    pub fn cancel_all(&mut self) {
        for slot in self.pending.iter_mut() {
            *slot = None;
        }
    }

    pub fn wait(&mut self, timeout: Option<Duration>, out: &mut Vec<Completion>) -> RelayResult<()> {
        let mut fds = [libc::pollfd {
            fd: -1,
            events: 0,
            revents: 0,
        }; Self::SLOTS];

        let mut any = false;
        for index in 0..OpTag::COUNT {
            if self.pending[index].is_none() {
                continue;
            }
            let tag = OpTag::from_index(index).expect("Tag index out of range");
            let slot = Self::slot_for(tag);
            fds[slot].fd = self.fd_for_slot(slot);
            fds[slot].events |= if tag.is_write() {
                libc::POLLOUT
            } else {
                libc::POLLIN
            };
            any = true;
        }

        let timeout_ms: libc::c_int = match timeout {
            Some(timeout) => timeout.as_millis().min(i32::max_value() as u128) as libc::c_int,
            None => -1,
        };

        if !any {
            // Nothing submitted; honor the timeout so the caller's deadline
            // bookkeeping still runs.
            if timeout_ms > 0 {
                std::thread::sleep(Duration::from_millis(timeout_ms as u64));
            }
            return Ok(());
        }

        let rc = unsafe {
            libc::poll(
                fds.as_mut_ptr(),
                Self::SLOTS as libc::nfds_t,
                timeout_ms,
            )
        };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err.into());
        }
        if rc == 0 {
            return Ok(());
        }

        for index in 0..OpTag::COUNT {
            let op = match self.pending[index] {
                Some(op) => op,
                None => continue,
            };
            let tag = OpTag::from_index(index).expect("Tag index out of range");
            let slot = Self::slot_for(tag);
            let revents = fds[slot].revents;

            if revents & libc::POLLNVAL != 0 {
                self.pending[index] = None;
                out.push(Completion {
                    tag,
                    result: -(libc::EBADF as isize),
                });
                continue;
            }

            let wanted = if tag.is_write() {
                libc::POLLOUT
            } else {
                libc::POLLIN
            };
            if revents & (wanted | libc::POLLHUP | libc::POLLERR) == 0 {
                continue;
            }

            let fd = fds[slot].fd;
            let n = if tag.is_write() {
                unsafe { libc::write(fd, op.ptr as *const libc::c_void, op.len) }
            } else {
                unsafe { libc::read(fd, op.ptr as *mut libc::c_void, op.len) }
            };

            if n >= 0 {
                self.pending[index] = None;
                out.push(Completion {
                    tag,
                    result: n as isize,
                });
                continue;
            }

            let errno = std::io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or(libc::EIO);
            match errno {
                libc::EAGAIN | libc::EINTR => {
                    // Spurious readiness; the operation stays armed.
                }
                errno => {
                    self.pending[index] = None;
                    out.push(Completion {
                        tag,
                        result: -(errno as isize),
                    });
                }
            }
        }

        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::AsRawFd;
    use std::time::Instant;

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (server, client)
    }

    fn fds_for(socket: RawFd) -> SessionFds {
        // Only the socket slot is exercised; the pipe slots stay idle.
        SessionFds {
            socket,
            child_stdin: -1,
            child_stdout: -1,
            child_stderr: -1,
        }
    }

    #[test]
    fn test_tag_index_round_trip() {
        for index in 0..OpTag::COUNT {
            let tag = OpTag::from_index(index).unwrap();
            assert_eq!(tag.index(), index);
        }
        assert!(OpTag::from_index(OpTag::COUNT).is_none());
    }

    #[test]
    fn test_readiness_read_completion() {
        let (server, mut client) = socket_pair();
        let mut backend =
            ReadinessBackend::create(fds_for(server.as_raw_fd()), &logging::discard()).unwrap();

        let mut buf = [0u8; 64];
        backend
            .submit(OpTag::SocketRead, buf.as_mut_ptr(), buf.len())
            .unwrap();
        assert!(backend.in_flight(OpTag::SocketRead));

        client.write_all(b"ping").unwrap();

        let mut out = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while out.is_empty() && Instant::now() < deadline {
            backend
                .wait(Some(Duration::from_millis(50)), &mut out)
                .unwrap();
        }

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].tag, OpTag::SocketRead);
        assert_eq!(out[0].result, 4);
        assert_eq!(&buf[..4], b"ping");
        assert!(!backend.in_flight(OpTag::SocketRead));
    }

    #[test]
    fn test_readiness_eof_completes_zero() {
        let (server, client) = socket_pair();
        let mut backend =
            ReadinessBackend::create(fds_for(server.as_raw_fd()), &logging::discard()).unwrap();

        let mut buf = [0u8; 16];
        backend
            .submit(OpTag::SocketRead, buf.as_mut_ptr(), buf.len())
            .unwrap();
        drop(client);

        let mut out = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while out.is_empty() && Instant::now() < deadline {
            backend
                .wait(Some(Duration::from_millis(50)), &mut out)
                .unwrap();
        }

        assert_eq!(out[0].result, 0);
    }

    #[test]
    fn test_readiness_timeout_returns_empty() {
        let (server, _client) = socket_pair();
        let mut backend =
            ReadinessBackend::create(fds_for(server.as_raw_fd()), &logging::discard()).unwrap();

        let mut buf = [0u8; 16];
        backend
            .submit(OpTag::SocketRead, buf.as_mut_ptr(), buf.len())
            .unwrap();

        let mut out = Vec::new();
        backend
            .wait(Some(Duration::from_millis(20)), &mut out)
            .unwrap();
        assert!(out.is_empty());
        assert!(backend.in_flight(OpTag::SocketRead));
    }

    #[test]
    fn test_readiness_write_completion() {
        let (server, _client) = socket_pair();
        let mut backend =
            ReadinessBackend::create(fds_for(server.as_raw_fd()), &logging::discard()).unwrap();

        let data = b"pong";
        backend
            .submit(OpTag::SocketWrite, data.as_ptr() as *mut u8, data.len())
            .unwrap();

        let mut out = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while out.is_empty() && Instant::now() < deadline {
            backend
                .wait(Some(Duration::from_millis(50)), &mut out)
                .unwrap();
        }

        assert_eq!(out[0].tag, OpTag::SocketWrite);
        assert_eq!(out[0].result, 4);
    }

    #[test]
    fn test_cancel_all_clears_pending() {
        let (server, _client) = socket_pair();
        let mut backend =
            ReadinessBackend::create(fds_for(server.as_raw_fd()), &logging::discard()).unwrap();

        let mut buf = [0u8; 16];
        backend
            .submit(OpTag::SocketRead, buf.as_mut_ptr(), buf.len())
            .unwrap();
        backend.cancel_all();
        assert!(!backend.in_flight(OpTag::SocketRead));
    }
}
