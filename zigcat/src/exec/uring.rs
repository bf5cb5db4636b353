//! Linux submission/completion backend. A small ring (well above the five
//! operation slots a session uses) is probed at session init; any setup
//! failure falls the session back to the readiness engine.

use crate::exec::backend::{Completion, OpTag, SessionFds};
use crate::shared::{ErrorKind, RelayError, RelayResult};
use io_uring::{opcode, types, IoUring};
use std::io;
use std::time::Duration;
use wick::logging::{self, Logger};

const QUEUE_DEPTH: u32 = 32;

/// User-data values outside the tag range.
const TIMEOUT_DATA: u64 = 64;
const CANCEL_DATA: u64 = 65;

pub struct UringBackend {
    ring: IoUring,
    fds: SessionFds,
    pending: [bool; OpTag::COUNT],
    /// Storage for the wait timeout; the kernel reads it during submit.
    timeout_spec: types::Timespec,
    log: Logger,
}

impl UringBackend {
    /// Capability probe: ring setup fails on kernels (or sandboxes) without
    /// io_uring, which selects the next backend in preference order.
    pub fn create(fds: SessionFds, log: &Logger) -> RelayResult<UringBackend> {
        let ring = IoUring::new(QUEUE_DEPTH)
            .map_err(|_| RelayError::Fatal(ErrorKind::Unsupported))?;

        Ok(UringBackend {
            ring,
            fds,
            pending: [false; OpTag::COUNT],
            timeout_spec: types::Timespec::new(),
            log: log.new(logging::o!("backend" => "submission")),
        })
    }

    fn fd_for(&self, tag: OpTag) -> types::Fd {
        let fd = match tag {
            OpTag::SocketRead | OpTag::SocketWrite => self.fds.socket,
            OpTag::StdinWrite => self.fds.child_stdin,
            OpTag::StdoutRead => self.fds.child_stdout,
            OpTag::StderrRead => self.fds.child_stderr,
        };
        types::Fd(fd)
    }

    fn push(&mut self, entry: io_uring::squeue::Entry) -> RelayResult<()> {
        unsafe {
            self.ring
                .submission()
                .push(&entry)
                .map_err(|_| RelayError::Fatal(ErrorKind::Io(io::ErrorKind::Other)))
        }
    }

    pub fn submit_read(&mut self, tag: OpTag, ptr: *mut u8, len: usize) -> RelayResult<()> {
        if self.pending[tag.index()] {
            logging::warn!(self.log, "double submission suppressed"; "tag" => ?tag);
            return Ok(());
        }
        let entry = opcode::Read::new(self.fd_for(tag), ptr, len as u32)
            .build()
            .user_data(tag.index() as u64);
        self.push(entry)?;
        self.pending[tag.index()] = true;
        Ok(())
    }

    pub fn submit_write(&mut self, tag: OpTag, ptr: *const u8, len: usize) -> RelayResult<()> {
        if self.pending[tag.index()] {
            logging::warn!(self.log, "double submission suppressed"; "tag" => ?tag);
            return Ok(());
        }
        let entry = opcode::Write::new(self.fd_for(tag), ptr, len as u32)
            .build()
            .user_data(tag.index() as u64);
        self.push(entry)?;
        self.pending[tag.index()] = true;
        Ok(())
    }

    pub fn in_flight(&self, tag: OpTag) -> bool {
        self.pending[tag.index()]
    }

    pub fn wait(&mut self, timeout: Option<Duration>, out: &mut Vec<Completion>) -> RelayResult<()> {
        if let Some(timeout) = timeout {
            self.timeout_spec = types::Timespec::new()
                .sec(timeout.as_secs())
                .nsec(timeout.subsec_nanos());
            let entry = opcode::Timeout::new(&self.timeout_spec)
                .build()
                .user_data(TIMEOUT_DATA);
            self.push(entry)?;
        }

        match self.ring.submit_and_wait(1) {
            Ok(_) => {}
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(err) => return Err(err.into()),
        }

        self.drain_completions(out);
        Ok(())
    }

    fn drain_completions(&mut self, out: &mut Vec<Completion>) {
        let pending = &mut self.pending;
        for entry in self.ring.completion() {
            match entry.user_data() {
                TIMEOUT_DATA | CANCEL_DATA => {}
                data => {
                    if let Some(tag) = OpTag::from_index(data as usize) {
                        if pending[tag.index()] {
                            pending[tag.index()] = false;
                            out.push(Completion {
                                tag,
                                result: entry.result() as isize,
                            });
                        }
                    }
                }
            }
        }
    }

    /// Cancels every in-flight operation and drains their terminal
    /// completions so no kernel reference to session buffers survives this
    /// call.
    pub fn cancel_all(&mut self) {
        let mut sink = Vec::new();
        for index in 0..OpTag::COUNT {
            if !self.pending[index] {
                continue;
            }
            let entry = opcode::AsyncCancel::new(index as u64)
                .build()
                .user_data(CANCEL_DATA);
            if self.push(entry).is_err() {
                break;
            }
        }

        for _ in 0..64 {
            if !self.pending.iter().any(|&in_flight| in_flight) {
                break;
            }
            match self.ring.submit_and_wait(1) {
                Ok(_) => self.drain_completions(&mut sink),
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    }
}

/// Submission-driven accept: the same tag-and-completion contract applied to
/// the exec server's listener. Semantics match the readiness accept loop.
pub struct UringAcceptor {
    ring: IoUring,
    fd: std::os::unix::io::RawFd,
    addr: Box<libc::sockaddr_storage>,
    addr_len: Box<libc::socklen_t>,
    armed: bool,
    timeout_spec: types::Timespec,
    log: Logger,
}

const ACCEPT_DATA: u64 = 1;
const ACCEPT_TIMEOUT_DATA: u64 = 2;

impl UringAcceptor {
    pub fn create(fd: std::os::unix::io::RawFd, log: &Logger) -> RelayResult<UringAcceptor> {
        let ring = IoUring::new(8)
            .map_err(|_| RelayError::Fatal(ErrorKind::Unsupported))?;

        Ok(UringAcceptor {
            ring,
            fd,
            addr: Box::new(unsafe { std::mem::zeroed() }),
            addr_len: Box::new(std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t),
            armed: false,
            timeout_spec: types::Timespec::new(),
            log: log.new(logging::o!("backend" => "submission-accept")),
        })
    }

    /// Waits up to `timeout` for one connection. Returns the accepted
    /// descriptor and the peer address when one arrived.
    pub fn accept(
        &mut self,
        timeout: Duration,
    ) -> RelayResult<Option<(std::os::unix::io::RawFd, Option<std::net::IpAddr>)>> {
        if !self.armed {
            *self.addr_len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let entry = opcode::Accept::new(
                types::Fd(self.fd),
                self.addr.as_mut() as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                self.addr_len.as_mut(),
            )
            .build()
            .user_data(ACCEPT_DATA);
            unsafe {
                self.ring
                    .submission()
                    .push(&entry)
                    .map_err(|_| RelayError::Fatal(ErrorKind::Io(io::ErrorKind::Other)))?;
            }
            self.armed = true;
        }

        self.timeout_spec = types::Timespec::new()
            .sec(timeout.as_secs())
            .nsec(timeout.subsec_nanos());
        let entry = opcode::Timeout::new(&self.timeout_spec)
            .build()
            .user_data(ACCEPT_TIMEOUT_DATA);
        unsafe {
            self.ring
                .submission()
                .push(&entry)
                .map_err(|_| RelayError::Fatal(ErrorKind::Io(io::ErrorKind::Other)))?;
        }

        match self.ring.submit_and_wait(1) {
            Ok(_) => {}
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => return Ok(None),
            Err(err) => return Err(err.into()),
        }

        let mut accepted = None;
        for entry in self.ring.completion() {
            if entry.user_data() != ACCEPT_DATA {
                continue;
            }
            self.armed = false;
            let result = entry.result();
            if result >= 0 {
                accepted = Some(result);
            } else if result != -libc::EAGAIN && result != -libc::ECANCELED {
                logging::warn!(self.log, "async accept failed"; "errno" => -result);
            }
        }

        Ok(accepted.map(|fd| (fd, sockaddr_to_ip(&self.addr))))
    }
}

fn sockaddr_to_ip(addr: &libc::sockaddr_storage) -> Option<std::net::IpAddr> {
    match i32::from(addr.ss_family) {
        libc::AF_INET => {
            let v4 = unsafe { &*(addr as *const _ as *const libc::sockaddr_in) };
            let octets = v4.sin_addr.s_addr.to_ne_bytes();
            Some(std::net::IpAddr::V4(std::net::Ipv4Addr::from(octets)))
        }
        libc::AF_INET6 => {
            let v6 = unsafe { &*(addr as *const _ as *const libc::sockaddr_in6) };
            Some(std::net::IpAddr::V6(std::net::Ipv6Addr::from(
                v6.sin6_addr.s6_addr,
            )))
        }
        _ => None,
    }
}
