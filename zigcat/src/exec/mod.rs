//! Exec mode: shuttle bytes between an accepted socket and a spawned child
//! process, one session per connection, one thread per session.

pub mod backend;
#[cfg(windows)]
pub mod iocp;
pub mod timeout;
#[cfg(target_os = "linux")]
pub mod uring;

use crate::net::access::{AccessList, DenialBackoff, Verdict};
use crate::net::buffer::RingBuffer;
use crate::net::flow::FlowGate;
use crate::net::telnet::{self, TelnetSession};
use crate::shared::{ErrorKind, RelayError, RelayResult};
use crate::shutdown;
use backend::{Backend, Completion, OpTag};
use std::io::{self, Write};
use std::net::{IpAddr, Shutdown};
use std::process::{Child, ExitStatus};
#[cfg(unix)]
use std::process::{ChildStderr, ChildStdin, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use timeout::{TimeoutLimits, TimeoutTracker};
use wick::logging::{self, Logger};

#[cfg(unix)]
use backend::SessionFds;
#[cfg(unix)]
use std::os::unix::io::{AsRawFd, RawFd};

/// Capacity of each of the session's ring buffers.
const RING_CAPACITY: usize = 64 * 1024;

/// Staging buffer for telnet-filtered socket reads.
const SCRATCH_SIZE: usize = 4096;

/// Upper bound on one backend wait so timeouts stay responsive.
const MAX_WAIT: Duration = Duration::from_millis(500);

/// Session tuning. The flow gate pauses reads at `pause_fraction` of
/// `max_total_buffer` and resumes at `resume_fraction`.
#[derive(Debug, Clone)]
pub struct ExecConfig {
    pub max_total_buffer: usize,
    pub pause_fraction: f64,
    pub resume_fraction: f64,
    pub timeouts: TimeoutLimits,
    pub telnet: bool,
}

impl Default for ExecConfig {
    fn default() -> ExecConfig {
        ExecConfig {
            max_total_buffer: 3 * RING_CAPACITY,
            pause_fraction: 0.75,
            resume_fraction: 0.5,
            timeouts: TimeoutLimits::default(),
            telnet: false,
        }
    }
}

/// The accepted stream a session drives.
pub enum ExecStream {
    Tcp(std::net::TcpStream),
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixStream),
}

impl ExecStream {
    #[cfg(unix)]
    fn set_nonblocking(&self) -> io::Result<()> {
        match self {
            ExecStream::Tcp(stream) => stream.set_nonblocking(true),
            ExecStream::Unix(stream) => stream.set_nonblocking(true),
        }
    }

    fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        match self {
            ExecStream::Tcp(stream) => stream.shutdown(how),
            #[cfg(unix)]
            ExecStream::Unix(stream) => stream.shutdown(how),
        }
    }

    fn write_some(&mut self, data: &[u8]) -> io::Result<usize> {
        match self {
            ExecStream::Tcp(stream) => stream.write(data),
            #[cfg(unix)]
            ExecStream::Unix(stream) => stream.write(data),
        }
    }

    pub fn peer_describe(&self) -> String {
        match self {
            ExecStream::Tcp(stream) => stream
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "?".to_owned()),
            #[cfg(unix)]
            ExecStream::Unix(_) => "unix-peer".to_owned(),
        }
    }

    #[cfg(unix)]
    fn raw_fd(&self) -> RawFd {
        match self {
            ExecStream::Tcp(stream) => stream.as_raw_fd(),
            ExecStream::Unix(stream) => stream.as_raw_fd(),
        }
    }

    #[cfg(windows)]
    fn raw_socket(&self) -> std::os::windows::io::RawSocket {
        use std::os::windows::io::AsRawSocket;
        match self {
            ExecStream::Tcp(stream) => stream.as_raw_socket(),
        }
    }
}

#[derive(Debug, Default)]
struct CloseFlags {
    socket_read: bool,
    socket_write: bool,
    child_stdin: bool,
    child_stdout: bool,
    child_stderr: bool,
}

/// Which buffer the in-flight socket write drains from.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum WriteSource {
    None,
    Stdout,
    Stderr,
    Wire,
}

/// One bidirectional socket ↔ child shuttle. Three bounded rings, five
/// closed-flags, a hysteresis flow gate, three independent deadlines and a
/// platform backend; runs until the end condition holds:
/// no buffered child output, both child output streams closed, no buffered
/// inbound bytes, and one of socket-read / child-stdin closed.
pub struct ExecSession {
    log: Logger,
    // Declared before the buffers: on teardown the backend (and any kernel
    // references to buffer memory) dies first.
    backend: Backend,
    stream: ExecStream,
    child: Child,
    #[cfg(unix)]
    child_stdin: Option<ChildStdin>,
    #[cfg(unix)]
    child_stdout: Option<ChildStdout>,
    #[cfg(unix)]
    child_stderr: Option<ChildStderr>,
    #[cfg(windows)]
    child_stdin: Option<iocp::PipeEnd>,
    #[cfg(windows)]
    child_stdout: Option<iocp::PipeEnd>,
    #[cfg(windows)]
    child_stderr: Option<iocp::PipeEnd>,
    stdin_buf: RingBuffer,
    stdout_buf: RingBuffer,
    stderr_buf: RingBuffer,
    wire_buf: RingBuffer,
    telnet: Option<TelnetSession>,
    scratch: Box<[u8; SCRATCH_SIZE]>,
    closed: CloseFlags,
    flow: FlowGate,
    timeouts: TimeoutTracker,
    write_source: WriteSource,
    max_total: usize,
    completions: Vec<Completion>,
    child_gone: bool,
}

#[cfg(unix)]
fn set_nonblocking_fd(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

impl ExecSession {
    #[cfg(unix)]
    pub fn new(
        stream: ExecStream,
        command: &[String],
        config: &ExecConfig,
        log: &Logger,
    ) -> RelayResult<ExecSession> {
        assert!(!command.is_empty(), "Exec command must be non-empty");

        let mut child = Command::new(&command[0])
            .args(&command[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| RelayError::Fatal(ErrorKind::ChildSpawn(err.kind())))?;

        let child_stdin = child.stdin.take().expect("Child stdin was not piped");
        let child_stdout = child.stdout.take().expect("Child stdout was not piped");
        let child_stderr = child.stderr.take().expect("Child stderr was not piped");

        stream.set_nonblocking().map_err(RelayError::from)?;
        set_nonblocking_fd(child_stdin.as_raw_fd()).map_err(RelayError::from)?;
        set_nonblocking_fd(child_stdout.as_raw_fd()).map_err(RelayError::from)?;
        set_nonblocking_fd(child_stderr.as_raw_fd()).map_err(RelayError::from)?;

        let log = log.new(logging::o!(
            "component" => "exec",
            "child_pid" => child.id(),
        ));

        let fds = SessionFds {
            socket: stream.raw_fd(),
            child_stdin: child_stdin.as_raw_fd(),
            child_stdout: child_stdout.as_raw_fd(),
            child_stderr: child_stderr.as_raw_fd(),
        };
        let backend = Backend::create(fds, &log)?;

        logging::info!(log, "exec session started";
                       "command" => command.join(" "),
                       "peer" => stream.peer_describe(),
                       "backend" => backend.name(),
                       "telnet" => config.telnet);

        let now = Instant::now();
        let telnet = if config.telnet {
            Some(TelnetSession::new(&log))
        } else {
            None
        };
        Ok(ExecSession {
            log,
            backend,
            stream,
            child,
            child_stdin: Some(child_stdin),
            child_stdout: Some(child_stdout),
            child_stderr: Some(child_stderr),
            stdin_buf: RingBuffer::new(RING_CAPACITY),
            stdout_buf: RingBuffer::new(RING_CAPACITY),
            stderr_buf: RingBuffer::new(RING_CAPACITY),
            wire_buf: RingBuffer::new(RING_CAPACITY),
            telnet,
            scratch: Box::new([0u8; SCRATCH_SIZE]),
            closed: CloseFlags::default(),
            flow: FlowGate::from_fractions(
                config.max_total_buffer,
                config.pause_fraction,
                config.resume_fraction,
            ),
            timeouts: TimeoutTracker::new(config.timeouts, now),
            write_source: WriteSource::None,
            max_total: config.max_total_buffer,
            completions: Vec::with_capacity(OpTag::COUNT),
            child_gone: false,
        })
    }

    #[cfg(windows)]
    pub fn new(
        stream: ExecStream,
        command: &[String],
        config: &ExecConfig,
        log: &Logger,
    ) -> RelayResult<ExecSession> {
        assert!(!command.is_empty(), "Exec command must be non-empty");

        // The child's stdio rides overlapped pipes so the completion port
        // can drive all four kernel objects.
        let (child, pipes) = iocp::spawn_child(command)
            .map_err(|err| RelayError::Fatal(ErrorKind::ChildSpawn(err.kind())))?;

        let log = log.new(logging::o!(
            "component" => "exec",
            "child_pid" => child.id(),
        ));

        let handles = iocp::SessionHandles {
            socket: stream.raw_socket(),
            child_stdin: pipes.stdin.raw(),
            child_stdout: pipes.stdout.raw(),
            child_stderr: pipes.stderr.raw(),
        };
        let backend = Backend::create(handles, &log)?;

        logging::info!(log, "exec session started";
                       "command" => command.join(" "),
                       "peer" => stream.peer_describe(),
                       "backend" => backend.name(),
                       "telnet" => config.telnet);

        let iocp::ChildPipes {
            stdin,
            stdout,
            stderr,
        } = pipes;

        let now = Instant::now();
        Ok(ExecSession {
            log,
            backend,
            stream,
            child,
            child_stdin: Some(stdin),
            child_stdout: Some(stdout),
            child_stderr: Some(stderr),
            stdin_buf: RingBuffer::new(RING_CAPACITY),
            stdout_buf: RingBuffer::new(RING_CAPACITY),
            stderr_buf: RingBuffer::new(RING_CAPACITY),
            wire_buf: RingBuffer::new(RING_CAPACITY),
            telnet: if config.telnet {
                Some(TelnetSession::new(&log))
            } else {
                None
            },
            scratch: Box::new([0u8; SCRATCH_SIZE]),
            closed: CloseFlags::default(),
            flow: FlowGate::from_fractions(
                config.max_total_buffer,
                config.pause_fraction,
                config.resume_fraction,
            ),
            timeouts: TimeoutTracker::new(config.timeouts, now),
            write_source: WriteSource::None,
            max_total: config.max_total_buffer,
            completions: Vec::with_capacity(OpTag::COUNT),
            child_gone: false,
        })
    }

    /// Outbound bytes still owed to the socket.
    fn outbound_buffered(&self) -> usize {
        self.stdout_buf.readable() + self.stderr_buf.readable() + self.wire_buf.readable()
    }

    /// The application-level end condition.
    fn should_continue(&self) -> bool {
        let finished = self.outbound_buffered() == 0
            && self.closed.child_stdout
            && self.closed.child_stderr
            && self.stdin_buf.is_empty()
            && (self.closed.socket_read || self.closed.child_stdin);
        !finished
    }

    /// Drives the session to its end condition, then flushes, half-closes
    /// the socket and reaps the child.
    pub fn run(&mut self) -> RelayResult<ExitStatus> {
        let outcome = self.drive();

        // No kernel reference to the rings may survive past this point.
        self.backend.cancel_all();

        if outcome.is_ok() {
            self.final_flush();
        }

        if let Err(err) = self.stream.shutdown(Shutdown::Write) {
            // Best effort; the peer may already be gone.
            logging::debug!(self.log, "send-side shutdown failed"; "error" => %err);
        }

        self.child_stdin = None;
        if outcome.is_err() {
            self.kill_child();
        }
        let status = self.reap_child();

        match outcome {
            Ok(()) => {
                let status = status?;
                logging::info!(self.log, "exec session finished";
                               "exit_code" => status.code());
                Ok(status)
            }
            Err(err) => {
                logging::warn!(self.log, "exec session failed"; "error" => ?err);
                Err(err)
            }
        }
    }

    fn drive(&mut self) -> RelayResult<()> {
        while self.should_continue() {
            if shutdown::requested() {
                logging::info!(self.log, "shutdown requested, ending session");
                break;
            }

            let now = Instant::now();
            if let Some(kind) = self.timeouts.check(now) {
                logging::warn!(self.log, "session timeout"; "kind" => ?kind);
                return Err(RelayError::Fatal(ErrorKind::Timeout(kind)));
            }

            self.enforce_flow()?;
            self.check_child_exit();
            self.propagate_stdin_eof();
            self.submit_io()?;

            let timeout = self
                .timeouts
                .next_deadline(now)
                .map_or(MAX_WAIT, |deadline| deadline.min(MAX_WAIT));

            let mut completions = std::mem::replace(&mut self.completions, Vec::new());
            completions.clear();
            let waited = self.backend.wait(Some(timeout), &mut completions);
            for completion in completions.drain(..) {
                self.on_completion(completion, Instant::now());
            }
            self.completions = completions;
            waited?;
        }
        Ok(())
    }

    fn enforce_flow(&mut self) -> RelayResult<()> {
        let total =
            self.stdin_buf.readable() + self.stdout_buf.readable() + self.stderr_buf.readable();
        if total > self.max_total {
            // Unreachable under correct submission; kept as a safety net.
            logging::error!(self.log, "buffered total exceeds hard cap";
                            "total" => total, "cap" => self.max_total);
            return Err(RelayError::Fatal(ErrorKind::FlowCapExceeded));
        }
        if self.flow.update(total) {
            logging::debug!(self.log, "flow state changed";
                            "paused" => self.flow.is_paused(),
                            "total" => total);
        }
        Ok(())
    }

    /// Once the child is gone and nothing remains to deliver to it, the
    /// stdin side has no purpose.
    fn check_child_exit(&mut self) {
        if self.child_gone {
            if !self.closed.child_stdin
                && self.stdin_buf.is_empty()
                && !self.backend.in_flight(OpTag::StdinWrite)
            {
                self.close_child_stdin("child exited");
            }
            return;
        }
        if let Ok(Some(status)) = self.child.try_wait() {
            logging::debug!(self.log, "child exited"; "exit_code" => status.code());
            self.child_gone = true;
        }
    }

    /// Socket-read EOF plus a drained stdin buffer closes child stdin,
    /// passing the EOF through.
    fn propagate_stdin_eof(&mut self) {
        if self.closed.socket_read
            && self.stdin_buf.is_empty()
            && !self.closed.child_stdin
            && !self.backend.in_flight(OpTag::StdinWrite)
        {
            self.close_child_stdin("socket read closed");
        }
    }

    fn close_child_stdin(&mut self, why: &str) {
        logging::debug!(self.log, "closing child stdin"; "why" => why.to_owned());
        self.closed.child_stdin = true;
        self.child_stdin = None;
        if !self.stdin_buf.is_empty() {
            // Undeliverable remainder.
            let dropped = self.stdin_buf.readable();
            logging::debug!(self.log, "dropping undeliverable inbound bytes";
                            "count" => dropped);
            self.stdin_buf.clear();
        }
    }

    /// Decides which operations to hand the backend this turn, per the
    /// submission rules. Tags already in flight are left alone.
    fn submit_io(&mut self) -> RelayResult<()> {
        // Socket → stdin_buf.
        if !self.closed.socket_read
            && !self.closed.child_stdin
            && !self.flow.is_paused()
            && !self.backend.in_flight(OpTag::SocketRead)
        {
            if self.telnet.is_some() {
                let len = SCRATCH_SIZE.min(self.stdin_buf.writable());
                if len > 0 {
                    self.backend
                        .submit_read(OpTag::SocketRead, self.scratch.as_mut_ptr(), len)?;
                }
            } else {
                let region = self.stdin_buf.writable_slice();
                if !region.is_empty() {
                    let (ptr, len) = (region.as_mut_ptr(), region.len());
                    self.backend.submit_read(OpTag::SocketRead, ptr, len)?;
                }
            }
        }

        // Child stdout/stderr → their rings.
        if !self.closed.child_stdout
            && self.child_stdout.is_some()
            && !self.flow.is_paused()
            && !self.backend.in_flight(OpTag::StdoutRead)
        {
            let region = self.stdout_buf.writable_slice();
            if !region.is_empty() {
                let (ptr, len) = (region.as_mut_ptr(), region.len());
                self.backend.submit_read(OpTag::StdoutRead, ptr, len)?;
            }
        }
        if !self.closed.child_stderr
            && self.child_stderr.is_some()
            && !self.flow.is_paused()
            && !self.backend.in_flight(OpTag::StderrRead)
        {
            let region = self.stderr_buf.writable_slice();
            if !region.is_empty() {
                let (ptr, len) = (region.as_mut_ptr(), region.len());
                self.backend.submit_read(OpTag::StderrRead, ptr, len)?;
            }
        }

        // stdin_buf → child stdin.
        if !self.closed.child_stdin
            && self.child_stdin.is_some()
            && !self.stdin_buf.is_empty()
            && !self.backend.in_flight(OpTag::StdinWrite)
        {
            let region = self.stdin_buf.readable_slice();
            let (ptr, len) = (region.as_ptr(), region.len());
            self.backend.submit_write(OpTag::StdinWrite, ptr, len)?;
        }

        // Buffered child output → socket, stdout preferred over stderr.
        if !self.closed.socket_write && !self.backend.in_flight(OpTag::SocketWrite) {
            if self.telnet.is_some() {
                self.top_up_wire();
                if !self.wire_buf.is_empty() {
                    let region = self.wire_buf.readable_slice();
                    let (ptr, len) = (region.as_ptr(), region.len());
                    self.backend.submit_write(OpTag::SocketWrite, ptr, len)?;
                    self.write_source = WriteSource::Wire;
                }
            } else if !self.stdout_buf.is_empty() {
                let region = self.stdout_buf.readable_slice();
                let (ptr, len) = (region.as_ptr(), region.len());
                self.backend.submit_write(OpTag::SocketWrite, ptr, len)?;
                self.write_source = WriteSource::Stdout;
            } else if !self.stderr_buf.is_empty() {
                let region = self.stderr_buf.readable_slice();
                let (ptr, len) = (region.as_ptr(), region.len());
                self.backend.submit_write(OpTag::SocketWrite, ptr, len)?;
                self.write_source = WriteSource::Stderr;
            }
        }

        Ok(())
    }

    /// Escapes buffered child output into the wire ring. Telnet responses
    /// were already queued there by the decoder.
    fn top_up_wire(&mut self) {
        Self::encode_into_wire(&mut self.stdout_buf, &mut self.wire_buf);
        Self::encode_into_wire(&mut self.stderr_buf, &mut self.wire_buf);
    }

    fn encode_into_wire(src: &mut RingBuffer, wire: &mut RingBuffer) {
        loop {
            let mut moved = 0;
            {
                let readable = src.readable_slice();
                if readable.is_empty() {
                    return;
                }
                for &byte in readable {
                    let need = if byte == telnet::IAC { 2 } else { 1 };
                    if wire.writable() < need {
                        break;
                    }
                    if byte == telnet::IAC {
                        wire.extend_from_slice(&[telnet::IAC, telnet::IAC]);
                    } else {
                        wire.extend_from_slice(&[byte]);
                    }
                    moved += 1;
                }
            }
            if moved == 0 {
                return;
            }
            src.consume(moved);
        }
    }

    fn on_completion(&mut self, completion: Completion, now: Instant) {
        // A would-block result (submission backends surface these instead of
        // consuming readiness) simply re-arms on the next submission pass.
        #[cfg(unix)]
        {
            if completion.result == -(libc::EAGAIN as isize)
                || completion.result == -(libc::EINTR as isize)
            {
                return;
            }
        }

        match completion.tag {
            OpTag::SocketRead => self.on_socket_read(completion.result, now),
            OpTag::StdoutRead => {
                Self::on_child_read(
                    &self.log,
                    "stdout",
                    completion.result,
                    &mut self.stdout_buf,
                    &mut self.closed.child_stdout,
                    &mut self.child_stdout,
                    &mut self.timeouts,
                    now,
                );
            }
            OpTag::StderrRead => {
                Self::on_child_read(
                    &self.log,
                    "stderr",
                    completion.result,
                    &mut self.stderr_buf,
                    &mut self.closed.child_stderr,
                    &mut self.child_stderr,
                    &mut self.timeouts,
                    now,
                );
            }
            OpTag::StdinWrite => self.on_stdin_write(completion.result, now),
            OpTag::SocketWrite => self.on_socket_write(completion.result, now),
        }
    }

    fn on_socket_read(&mut self, result: isize, now: Instant) {
        if result < 0 {
            logging::debug!(self.log, "socket read error"; "errno" => -(result as i64));
            self.closed.socket_read = true;
            return;
        }
        if result == 0 {
            logging::debug!(self.log, "socket read eof");
            self.closed.socket_read = true;
            return;
        }

        let n = result as usize;
        self.timeouts.mark_activity(now);

        if let Some(session) = self.telnet.as_mut() {
            let mut app = Vec::with_capacity(n);
            let mut replies = Vec::new();
            if let Err(err) = session.decode(&self.scratch[..n], &mut app, &mut replies) {
                logging::warn!(self.log, "telnet protocol failure, closing inbound";
                               "error" => ?err);
                self.closed.socket_read = true;
                return;
            }
            let taken = self.stdin_buf.extend_from_slice(&app);
            debug_assert_eq!(taken, app.len(), "Decoded bytes must fit the reserved space");
            if !replies.is_empty() {
                let queued = self.wire_buf.extend_from_slice(&replies);
                if queued < replies.len() {
                    logging::warn!(self.log, "dropping telnet replies, wire buffer full";
                                   "dropped" => replies.len() - queued);
                }
            }
        } else {
            self.stdin_buf.commit(n);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_child_read<P>(
        log: &Logger,
        name: &'static str,
        result: isize,
        ring: &mut RingBuffer,
        closed: &mut bool,
        pipe: &mut Option<P>,
        timeouts: &mut TimeoutTracker,
        now: Instant,
    ) {
        if *closed {
            // The stream was closed while this operation was in flight; the
            // pipe was kept alive for the kernel's sake and dies here.
            *pipe = None;
            return;
        }
        if result < 0 {
            logging::debug!(log, "child pipe read error";
                            "stream" => name, "errno" => -(result as i64));
            *closed = true;
            *pipe = None;
            return;
        }
        if result == 0 {
            logging::debug!(log, "child pipe eof"; "stream" => name);
            *closed = true;
            *pipe = None;
            return;
        }
        ring.commit(result as usize);
        timeouts.mark_activity(now);
    }

    fn on_stdin_write(&mut self, result: isize, now: Instant) {
        if result <= 0 {
            logging::debug!(self.log, "child stdin write failed";
                            "errno" => -(result as i64));
            self.close_child_stdin("write failure");
            return;
        }
        // Partial writes just leave the remainder for the next submission.
        self.stdin_buf.consume(result as usize);
        self.timeouts.mark_activity(now);
    }

    fn on_socket_write(&mut self, result: isize, now: Instant) {
        let source = std::mem::replace(&mut self.write_source, WriteSource::None);

        if result <= 0 {
            logging::debug!(self.log, "socket write failed";
                            "errno" => -(result as i64));
            self.closed.socket_write = true;
            // Outbound data has nowhere to go; stop collecting it. Pipes
            // with an operation still in flight stay alive until that
            // completion drains (their fds must not be recycled under the
            // kernel), then the closed flag retires them.
            self.stdout_buf.clear();
            self.stderr_buf.clear();
            self.wire_buf.clear();
            self.closed.child_stdout = true;
            if !self.backend.in_flight(OpTag::StdoutRead) {
                self.child_stdout = None;
            }
            self.closed.child_stderr = true;
            if !self.backend.in_flight(OpTag::StderrRead) {
                self.child_stderr = None;
            }
            return;
        }

        let n = result as usize;
        match source {
            WriteSource::Stdout => self.stdout_buf.consume(n),
            WriteSource::Stderr => self.stderr_buf.consume(n),
            WriteSource::Wire => self.wire_buf.consume(n),
            WriteSource::None => {
                logging::warn!(self.log, "socket write completion without source");
            }
        }
        self.timeouts.mark_activity(now);
    }

    /// One last synchronous drain of buffered child output before the
    /// send-side shutdown.
    fn final_flush(&mut self) {
        if self.closed.socket_write {
            return;
        }
        if self.telnet.is_some() {
            self.top_up_wire();
        }

        let deadline = Instant::now() + Duration::from_secs(1);
        loop {
            let (ptr_data, which) = if !self.wire_buf.is_empty() {
                (self.wire_buf.readable_slice().to_vec(), WriteSource::Wire)
            } else if !self.stdout_buf.is_empty() {
                (self.stdout_buf.readable_slice().to_vec(), WriteSource::Stdout)
            } else if !self.stderr_buf.is_empty() {
                (self.stderr_buf.readable_slice().to_vec(), WriteSource::Stderr)
            } else {
                break;
            };

            match self.stream.write_some(&ptr_data) {
                Ok(0) => break,
                Ok(n) => match which {
                    WriteSource::Wire => self.wire_buf.consume(n),
                    WriteSource::Stdout => self.stdout_buf.consume(n),
                    WriteSource::Stderr => self.stderr_buf.consume(n),
                    WriteSource::None => unreachable!(),
                },
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() > deadline {
                        break;
                    }
                    thread::sleep(Duration::from_millis(5));
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => break,
            }
        }
    }

    fn kill_child(&mut self) {
        if self.child_gone {
            return;
        }
        if let Err(err) = self.child.kill() {
            logging::debug!(self.log, "child kill failed"; "error" => %err);
        }
    }

    fn reap_child(&mut self) -> RelayResult<ExitStatus> {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {
                    if Instant::now() > deadline {
                        self.kill_child();
                        return self.child.wait().map_err(RelayError::from);
                    }
                    thread::sleep(Duration::from_millis(10));
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

/// A listening endpoint for exec mode.
pub enum ServeListener {
    Tcp(std::net::TcpListener),
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixListener),
}

impl ServeListener {
    fn set_nonblocking(&self) -> io::Result<()> {
        match self {
            ServeListener::Tcp(listener) => listener.set_nonblocking(true),
            #[cfg(unix)]
            ServeListener::Unix(listener) => listener.set_nonblocking(true),
        }
    }

    fn accept(&self) -> io::Result<(ExecStream, Option<IpAddr>)> {
        match self {
            ServeListener::Tcp(listener) => {
                let (stream, addr) = listener.accept()?;
                Ok((ExecStream::Tcp(stream), Some(addr.ip())))
            }
            #[cfg(unix)]
            ServeListener::Unix(listener) => {
                let (stream, _) = listener.accept()?;
                Ok((ExecStream::Unix(stream), None))
            }
        }
    }
}

/// How the serve loop pulls connections: through the submission ring where
/// available, a plain non-blocking accept elsewhere. Semantics are
/// identical.
enum AcceptDriver {
    #[cfg(target_os = "linux")]
    Submission(uring::UringAcceptor),
    Poll,
}

impl AcceptDriver {
    fn create(listener: &ServeListener, log: &Logger) -> AcceptDriver {
        #[cfg(target_os = "linux")]
        {
            if let ServeListener::Tcp(tcp) = listener {
                if let Ok(acceptor) = uring::UringAcceptor::create(tcp.as_raw_fd(), log) {
                    logging::debug!(log, "accept loop using submission backend");
                    return AcceptDriver::Submission(acceptor);
                }
            }
        }
        let _ = log;
        AcceptDriver::Poll
    }

    /// Waits briefly for one connection; `None` when the wait lapsed.
    fn next(
        &mut self,
        listener: &ServeListener,
    ) -> RelayResult<Option<(ExecStream, Option<IpAddr>)>> {
        match self {
            #[cfg(target_os = "linux")]
            AcceptDriver::Submission(acceptor) => {
                match acceptor.accept(Duration::from_millis(100))? {
                    Some((fd, peer)) => {
                        let stream = unsafe {
                            std::os::unix::io::FromRawFd::from_raw_fd(fd)
                        };
                        Ok(Some((ExecStream::Tcp(stream), peer)))
                    }
                    None => Ok(None),
                }
            }
            AcceptDriver::Poll => match listener.accept() {
                Ok(accepted) => Ok(Some(accepted)),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(50));
                    Ok(None)
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => Ok(None),
                Err(err) => Err(err.into()),
            },
        }
    }
}

/// Accept loop for exec mode: per-connection access filtering with denial
/// backoff, one session thread per admitted client.
pub fn serve(
    listener: ServeListener,
    command: Vec<String>,
    config: ExecConfig,
    access: AccessList,
    log: &Logger,
) -> RelayResult<()> {
    listener.set_nonblocking().map_err(RelayError::from)?;
    let mut backoff = DenialBackoff::default_policy();
    let log = log.new(logging::o!("component" => "exec-serve"));
    let mut driver = AcceptDriver::create(&listener, &log);

    logging::info!(log, "exec server listening"; "command" => command.join(" "));

    while !shutdown::requested() {
        let accepted = match driver.next(&listener) {
            Ok(Some(accepted)) => accepted,
            Ok(None) => continue,
            Err(err) => {
                logging::error!(log, "accept failed"; "error" => ?err);
                thread::sleep(Duration::from_millis(100));
                continue;
            }
        };

        let (stream, peer_ip) = accepted;
        if let Some(ip) = peer_ip {
            if access.evaluate(ip) == Verdict::Denied {
                logging::info!(log, "connection denied"; "peer" => %ip);
                drop(stream);
                if let Some(sleep) = backoff.on_denied() {
                    logging::warn!(log, "denial backoff engaged";
                                   "consecutive" => backoff.consecutive(),
                                   "sleep_ms" => sleep.as_millis() as u64);
                    thread::sleep(sleep);
                }
                continue;
            }
        }
        backoff.on_allowed();

        let command = command.clone();
        let config = config.clone();
        let session_log = log.clone();
        thread::spawn(move || {
            match ExecSession::new(stream, &command, &config, &session_log) {
                Ok(mut session) => {
                    let _ = session.run();
                }
                Err(err) => {
                    logging::error!(session_log, "session setup failed"; "error" => ?err);
                }
            }
        });
    }

    Ok(())
}
