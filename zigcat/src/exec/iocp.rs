//! Windows completion-port backend. Each operation slot owns its overlapped
//! control block; block and buffer must both stay alive and unmoved until the
//! completion packet is dequeued, which the session guarantees by keeping the
//! backend alive for its whole lifetime and cancelling before teardown.

#![cfg(windows)]

use crate::exec::backend::{Completion, OpTag};
use crate::shared::{ErrorKind, RelayError, RelayResult};
use miow::iocp::{CompletionPort, CompletionStatus};
use miow::Overlapped;
use std::ffi::OsStr;
use std::io;
use std::os::windows::ffi::OsStrExt;
use std::os::windows::io::{FromRawHandle, RawHandle, RawSocket};
use std::process::{Child, Command, Stdio};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use winapi::shared::winerror::{ERROR_BROKEN_PIPE, ERROR_HANDLE_EOF, ERROR_IO_PENDING};
use winapi::um::errhandlingapi::GetLastError;
use winapi::um::fileapi::{CreateFileW, ReadFile, WriteFile, OPEN_EXISTING};
use winapi::um::handleapi::{CloseHandle, INVALID_HANDLE_VALUE};
use winapi::um::ioapiset::CancelIoEx;
use winapi::um::namedpipeapi::CreateNamedPipeW;
use winapi::um::processthreadsapi::GetCurrentProcessId;
use winapi::um::winbase::{
    FILE_FLAG_FIRST_PIPE_INSTANCE, FILE_FLAG_OVERLAPPED, PIPE_ACCESS_INBOUND,
    PIPE_ACCESS_OUTBOUND, PIPE_READMODE_BYTE, PIPE_TYPE_BYTE, PIPE_WAIT,
};
use winapi::um::winnt::{FILE_ATTRIBUTE_NORMAL, GENERIC_READ, GENERIC_WRITE, HANDLE};

/// The four kernel objects a session multiplexes on Windows. The socket is a
/// SOCKET but participates in overlapped ReadFile/WriteFile like any handle;
/// the child pipes must have been created with FILE_FLAG_OVERLAPPED.
#[derive(Debug, Copy, Clone)]
pub struct SessionHandles {
    pub socket: RawSocket,
    pub child_stdin: RawHandle,
    pub child_stdout: RawHandle,
    pub child_stderr: RawHandle,
}

impl SessionHandles {
    fn handle_for(&self, tag: OpTag) -> HANDLE {
        match tag {
            OpTag::SocketRead | OpTag::SocketWrite => self.socket as HANDLE,
            OpTag::StdinWrite => self.child_stdin as HANDLE,
            OpTag::StdoutRead => self.child_stdout as HANDLE,
            OpTag::StderrRead => self.child_stderr as HANDLE,
        }
    }
}

/// One operation slot: the overlapped block is boxed so its address is
/// stable for the kernel no matter how the backend itself moves.
struct OpSlot {
    overlapped: Box<Overlapped>,
    in_flight: bool,
}

pub struct IocpBackend {
    port: CompletionPort,
    handles: SessionHandles,
    slots: Vec<OpSlot>,
    /// Submission-time failures surfaced as completions on the next wait.
    immediate: Vec<Completion>,
    statuses: Vec<CompletionStatus>,
}

impl IocpBackend {
    pub fn create(handles: SessionHandles) -> RelayResult<IocpBackend> {
        let port = CompletionPort::new(1)
            .map_err(|_| RelayError::Fatal(ErrorKind::Unsupported))?;

        let backend = IocpBackend {
            port,
            handles,
            slots: (0..OpTag::COUNT)
                .map(|_| OpSlot {
                    overlapped: Box::new(Overlapped::zero()),
                    in_flight: false,
                })
                .collect(),
            immediate: Vec::new(),
            statuses: vec![CompletionStatus::zero(); 16],
        };

        for tag_index in 0..OpTag::COUNT {
            let tag = OpTag::from_index(tag_index).expect("Tag index out of range");
            let handle = backend.handles.handle_for(tag);
            if handle == INVALID_HANDLE_VALUE {
                return Err(RelayError::Fatal(ErrorKind::Unsupported));
            }
        }

        // One association per distinct kernel object; the token is the slot
        // of the read-side tag, write completions are told apart by their
        // overlapped address.
        backend
            .port
            .add_handle(OpTag::SocketRead.index(), &HandleRef(handles.socket as HANDLE))
            .map_err(RelayError::from)?;
        backend
            .port
            .add_handle(OpTag::StdinWrite.index(), &HandleRef(handles.child_stdin as HANDLE))
            .map_err(RelayError::from)?;
        backend
            .port
            .add_handle(OpTag::StdoutRead.index(), &HandleRef(handles.child_stdout as HANDLE))
            .map_err(RelayError::from)?;
        backend
            .port
            .add_handle(OpTag::StderrRead.index(), &HandleRef(handles.child_stderr as HANDLE))
            .map_err(RelayError::from)?;

        Ok(backend)
    }

    pub fn in_flight(&self, tag: OpTag) -> bool {
        self.slots[tag.index()].in_flight
    }

    pub fn submit_read(&mut self, tag: OpTag, ptr: *mut u8, len: usize) -> RelayResult<()> {
        if self.slots[tag.index()].in_flight {
            return Ok(());
        }

        let handle = self.handles.handle_for(tag);
        let overlapped = self.slots[tag.index()].overlapped.raw();
        let ok = unsafe {
            ReadFile(
                handle,
                ptr as *mut _,
                len as u32,
                std::ptr::null_mut(),
                overlapped,
            )
        };

        if ok == 0 {
            let code = unsafe { GetLastError() };
            match code {
                // Queued; the packet arrives through the port.
                ERROR_IO_PENDING => {}
                ERROR_HANDLE_EOF | ERROR_BROKEN_PIPE => {
                    self.immediate.push(Completion { tag, result: 0 });
                    return Ok(());
                }
                code => {
                    self.immediate.push(Completion {
                        tag,
                        result: -(code as isize),
                    });
                    return Ok(());
                }
            }
        }

        self.slots[tag.index()].in_flight = true;
        Ok(())
    }

    pub fn submit_write(&mut self, tag: OpTag, ptr: *const u8, len: usize) -> RelayResult<()> {
        if self.slots[tag.index()].in_flight {
            return Ok(());
        }

        let handle = self.handles.handle_for(tag);
        let overlapped = self.slots[tag.index()].overlapped.raw();
        let ok = unsafe {
            WriteFile(
                handle,
                ptr as *const _,
                len as u32,
                std::ptr::null_mut(),
                overlapped,
            )
        };

        if ok == 0 {
            let code = unsafe { GetLastError() };
            match code {
                ERROR_IO_PENDING => {}
                code => {
                    self.immediate.push(Completion {
                        tag,
                        result: -(code as isize),
                    });
                    return Ok(());
                }
            }
        }

        self.slots[tag.index()].in_flight = true;
        Ok(())
    }

    fn tag_for_overlapped(&self, overlapped: *mut winapi::um::minwinbase::OVERLAPPED) -> Option<OpTag> {
        for index in 0..OpTag::COUNT {
            if self.slots[index].overlapped.raw() as usize == overlapped as usize {
                return OpTag::from_index(index);
            }
        }
        None
    }

    pub fn wait(&mut self, timeout: Option<Duration>, out: &mut Vec<Completion>) -> RelayResult<()> {
        out.append(&mut self.immediate);
        if !out.is_empty() {
            // Deliver submission-time results without blocking.
            return Ok(());
        }

        let statuses = match self.port.get_many(&mut self.statuses, timeout) {
            Ok(statuses) => statuses,
            Err(ref err) if err.raw_os_error() == Some(258) => return Ok(()), // WAIT_TIMEOUT
            Err(err) => return Err(err.into()),
        };

        let mut done = Vec::with_capacity(statuses.len());
        for status in statuses.iter() {
            done.push((status.overlapped(), status.bytes_transferred()));
        }

        for (overlapped, bytes) in done {
            if let Some(tag) = self.tag_for_overlapped(overlapped) {
                if self.slots[tag.index()].in_flight {
                    self.slots[tag.index()].in_flight = false;
                    out.push(Completion {
                        tag,
                        result: bytes as isize,
                    });
                }
            }
        }

        Ok(())
    }

    /// Cancels in-flight operations and drains their terminal packets. The
    /// overlapped blocks stay alive through this entire sequence.
    pub fn cancel_all(&mut self) {
        for index in 0..OpTag::COUNT {
            if !self.slots[index].in_flight {
                continue;
            }
            let tag = OpTag::from_index(index).expect("Tag index out of range");
            let handle = self.handles.handle_for(tag);
            unsafe {
                CancelIoEx(handle, self.slots[index].overlapped.raw());
            }
        }

        let mut sink = Vec::new();
        for _ in 0..64 {
            if !self.slots.iter().any(|slot| slot.in_flight) {
                break;
            }
            if self.wait(Some(Duration::from_millis(50)), &mut sink).is_err() {
                break;
            }
            sink.clear();
        }
    }
}

/// Minimal AsRawHandle wrapper for port association.
struct HandleRef(HANDLE);

impl std::os::windows::io::AsRawHandle for HandleRef {
    fn as_raw_handle(&self) -> RawHandle {
        self.0 as RawHandle
    }
}

/// Our end of an overlapped pipe to the child. Closed exactly once on drop.
pub struct PipeEnd(RawHandle);

impl PipeEnd {
    pub fn raw(&self) -> RawHandle {
        self.0
    }
}

impl Drop for PipeEnd {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.0 as HANDLE);
        }
    }
}

unsafe impl Send for PipeEnd {}

pub struct ChildPipes {
    pub stdin: PipeEnd,
    pub stdout: PipeEnd,
    pub stderr: PipeEnd,
}

static PIPE_SERIAL: AtomicUsize = AtomicUsize::new(0);

/// Creates one pipe whose parent end is opened `FILE_FLAG_OVERLAPPED` so the
/// completion port can drive it; anonymous pipes cannot do overlapped I/O,
/// so this goes through a uniquely named pipe pair. The child end is plain
/// synchronous.
fn overlapped_pipe(ours_reads: bool) -> io::Result<(PipeEnd, RawHandle)> {
    let serial = PIPE_SERIAL.fetch_add(1, Ordering::Relaxed);
    let name = format!(
        r"\\.\pipe\zigcat-exec-{}-{}",
        unsafe { GetCurrentProcessId() },
        serial
    );
    let wide: Vec<u16> = OsStr::new(&name).encode_wide().chain(Some(0)).collect();

    let access = if ours_reads {
        PIPE_ACCESS_INBOUND
    } else {
        PIPE_ACCESS_OUTBOUND
    };
    let ours = unsafe {
        CreateNamedPipeW(
            wide.as_ptr(),
            access | FILE_FLAG_OVERLAPPED | FILE_FLAG_FIRST_PIPE_INSTANCE,
            PIPE_TYPE_BYTE | PIPE_READMODE_BYTE | PIPE_WAIT,
            1,
            65536,
            65536,
            0,
            ptr::null_mut(),
        )
    };
    if ours == INVALID_HANDLE_VALUE {
        return Err(io::Error::last_os_error());
    }

    let theirs = unsafe {
        CreateFileW(
            wide.as_ptr(),
            if ours_reads { GENERIC_WRITE } else { GENERIC_READ },
            0,
            ptr::null_mut(),
            OPEN_EXISTING,
            FILE_ATTRIBUTE_NORMAL,
            ptr::null_mut(),
        )
    };
    if theirs == INVALID_HANDLE_VALUE {
        let err = io::Error::last_os_error();
        unsafe {
            CloseHandle(ours);
        }
        return Err(err);
    }

    Ok((PipeEnd(ours as RawHandle), theirs as RawHandle))
}

/// Spawns the exec child with all three stdio streams on overlapped pipes
/// and hands back the parent ends for the completion port. `Stdio` takes
/// ownership of the child ends and closes them after the spawn.
pub fn spawn_child(command: &[String]) -> io::Result<(Child, ChildPipes)> {
    let (stdin_ours, stdin_theirs) = overlapped_pipe(false)?;
    let (stdout_ours, stdout_theirs) = overlapped_pipe(true)?;
    let (stderr_ours, stderr_theirs) = overlapped_pipe(true)?;

    let child = Command::new(&command[0])
        .args(&command[1..])
        .stdin(unsafe { Stdio::from_raw_handle(stdin_theirs) })
        .stdout(unsafe { Stdio::from_raw_handle(stdout_theirs) })
        .stderr(unsafe { Stdio::from_raw_handle(stderr_theirs) })
        .spawn()?;

    Ok((
        child,
        ChildPipes {
            stdin: stdin_ours,
            stdout: stdout_ours,
            stderr: stderr_ours,
        },
    ))
}
