//! Completion-based kernel queue on IOCP.
//!
//! Every operation owns a boxed overlapped block carrying its slot index, so
//! a dequeued packet leads straight back to the operation. Cancellation is
//! asynchronous: `CancelIoEx` is issued and the operation stays parked until
//! the aborted (or already completed) packet is dequeued.

use std::{
    io,
    os::windows::{
        io::HandleOrNull,
        prelude::{AsRawHandle, OwnedHandle, RawHandle},
    },
    ptr::null_mut,
    task::Poll,
    time::Duration,
};

use slab::Slab;
use windows_sys::Win32::{
    Foundation::{
        GetLastError, RtlNtStatusToDosError, ERROR_HANDLE_EOF, INVALID_HANDLE_VALUE, WAIT_TIMEOUT,
    },
    Networking::WinSock::SOCKADDR_STORAGE,
    System::{
        Threading::INFINITE,
        IO::{
            CancelIoEx, CreateIoCompletionPort, GetQueuedCompletionStatusEx,
            PostQueuedCompletionStatus, OVERLAPPED, OVERLAPPED_ENTRY,
        },
    },
};

use crate::{
    driver::Activation,
    instrument,
    op::{Op, OpKind},
};

pub(crate) mod op;

/// On windows, handles and sockets are the same size and both can be
/// attached to an IOCP, so both are treated as fds.
pub type RawFd = RawHandle;

/// Process handles are kernel object handles.
pub type ProcessHandle = RawFd;

/// Extracts raw fds.
pub trait AsRawFd {
    /// Extracts the raw fd.
    fn as_raw_fd(&self) -> RawFd;
}

/// Constructs IO objects from raw fds.
pub trait FromRawFd {
    /// Constructs a new IO object from the specified raw fd.
    ///
    /// # Safety
    ///
    /// The fd passed in must be a valid open handle or socket, opened for
    /// overlapped IO and attached to a loop.
    unsafe fn from_raw_fd(fd: RawFd) -> Self;
}

/// Consumes an object and acquires ownership of its raw fd.
pub trait IntoRawFd {
    /// Consumes this object, returning the raw underlying fd.
    fn into_raw_fd(self) -> RawFd;
}

/// Completion key reserved for cross-thread wake posts.
const WAKE_KEY: usize = usize::MAX;

/// Size of the AcceptEx local+remote address scratch.
pub(crate) const ACCEPT_ADDR_BUFFER_SIZE: usize =
    (std::mem::size_of::<SOCKADDR_STORAGE>() + 16) * 2;

/// Overlapped block with the owning operation's slot index behind it.
#[repr(C)]
pub(crate) struct Overlapped {
    pub(crate) base: OVERLAPPED,
    pub(crate) index: usize,
}

impl Overlapped {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            base: unsafe { std::mem::zeroed() },
            index,
        }
    }
}

/// One completion packet retrieved from a kernel wait.
#[derive(Debug)]
pub(crate) struct CompletionEvent {
    pub(crate) key: usize,
    pub(crate) result: io::Result<usize>,
}

/// Low-level kernel queue of the completion back-end.
pub(crate) struct KernelQueue {
    port: OwnedHandle,
    entries: Vec<OVERLAPPED_ENTRY>,
}

impl KernelQueue {
    pub(crate) fn new(capacity: u32) -> io::Result<Self> {
        instrument!(crate::log::Level::TRACE, "new", capacity);
        let port = unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, 0, 0, 0) };
        let port = OwnedHandle::try_from(unsafe { HandleOrNull::from_raw_handle(port as _) })
            .map_err(|_| io::Error::last_os_error())?;
        let empty: OVERLAPPED_ENTRY = unsafe { std::mem::zeroed() };
        Ok(Self {
            port,
            entries: vec![empty; capacity.max(1) as usize],
        })
    }

    /// Raw handle of the completion port.
    pub(crate) fn loop_fd(&self) -> RawFd {
        self.port.as_raw_handle()
    }

    pub(crate) fn notify_handle(&self) -> NotifyHandle {
        NotifyHandle {
            port: self.port.as_raw_handle() as isize,
        }
    }

    /// Attach an fd to the completion port. An fd can only be attached once,
    /// and every fd used by an operation must have been attached before.
    pub(crate) fn attach(&mut self, fd: RawFd) -> io::Result<()> {
        let port = unsafe {
            CreateIoCompletionPort(fd as _, self.port.as_raw_handle() as _, 0, 0)
        };
        if port == 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// One-time preparation: allocate the overlapped block.
    pub(crate) fn setup(&mut self, op: &mut Op, index: usize) -> io::Result<()> {
        if op.overlapped.is_none() {
            op.overlapped = Some(Box::new(Overlapped::new(index)));
        }
        Ok(())
    }

    /// Issue the native submission. Called with state `Submitting` the first
    /// time and `Active` on reactivations.
    pub(crate) fn activate(&mut self, op: &mut Op, index: usize) -> io::Result<Activation> {
        instrument!(crate::log::Level::TRACE, "activate", index);
        let port = self.port.as_raw_handle() as isize;
        let optr = match op.overlapped.as_mut() {
            Some(overlapped) => {
                overlapped.base = unsafe { std::mem::zeroed() };
                &mut overlapped.base as *mut OVERLAPPED
            }
            None => return Err(crate::Error::InvalidArgument.into()),
        };
        // `Pending` means a packet will be dequeued from the port, even when
        // the call succeeded synchronously; `Ready` means no packet was
        // queued and the result is final.
        let outcome: Poll<io::Result<usize>> = match &mut op.kind {
            OpKind::SocketAccept(a) => unsafe { a.issue(optr) },
            OpKind::SocketConnect(c) => unsafe { c.issue(optr) },
            OpKind::SocketSend(s) => unsafe { s.issue(optr) },
            OpKind::SocketReceive(r) => unsafe { r.issue(optr) },
            OpKind::FileRead(r) => unsafe { r.issue(optr) },
            OpKind::FileWrite(w) => unsafe { w.issue(optr) },
            OpKind::SocketClose(c) => Poll::Ready(c.close()),
            OpKind::FileClose(c) => Poll::Ready(c.close()),
            OpKind::ProcessExit(p) => match p.register(port, optr) {
                Ok(()) => Poll::Pending,
                Err(e) => return Err(e),
            },
            // The external owner issues the native submission with this
            // operation's overlapped block; nothing to do here.
            OpKind::NativePoll(_) => Poll::Pending,
            OpKind::LoopTimeout(_) | OpKind::LoopWakeUp(_) | OpKind::Vacated => {
                debug_assert!(false, "operation without kernel interaction");
                Poll::Ready(Ok(0))
            }
        };
        match outcome {
            Poll::Pending => Ok(Activation::Kernel),
            Poll::Ready(res) => {
                op.queued_result = Some(res);
                Ok(Activation::Manual)
            }
        }
    }

    /// Request cancellation. Returns `false` when the acknowledgement will
    /// arrive as an aborted completion packet and the operation must stay
    /// parked until then.
    pub(crate) fn cancel(&mut self, op: &mut Op, _index: usize) -> bool {
        if let OpKind::ProcessExit(p) = &mut op.kind {
            let was_registered = p.wait.is_some();
            p.unregister();
            // The exit callback may already have posted this operation's
            // block. Stay parked until the packet is dequeued so it resolves
            // against live memory, like every other in-flight cancellation.
            return !was_registered;
        }
        let Some(fd) = op.kind.native_fd() else {
            return true;
        };
        let Some(overlapped) = op.overlapped.as_mut() else {
            return true;
        };
        // Failure means the packet is already queued or the op never started;
        // both resolve through the port or through the manual queue.
        unsafe { CancelIoEx(fd as _, &mut overlapped.base) };
        false
    }

    /// Kernel wait; dequeues a batch of completion packets.
    pub(crate) fn poll(
        &mut self,
        timeout: Option<Duration>,
        out: &mut Vec<CompletionEvent>,
    ) -> io::Result<()> {
        instrument!(crate::log::Level::TRACE, "poll", ?timeout);
        let timeout = match timeout {
            Some(timeout) => ((timeout.as_nanos() + 999_999) / 1_000_000) as u32,
            None => INFINITE,
        };
        let mut removed = 0;
        let res = unsafe {
            GetQueuedCompletionStatusEx(
                self.port.as_raw_handle() as _,
                self.entries.as_mut_ptr(),
                self.entries.len() as _,
                &mut removed,
                timeout,
                0,
            )
        };
        if res == 0 {
            let error = unsafe { GetLastError() };
            if error == WAIT_TIMEOUT {
                return Ok(());
            }
            return Err(io::Error::from_raw_os_error(error as _));
        }
        for entry in &self.entries[..removed as usize] {
            if entry.lpCompletionKey == WAKE_KEY || entry.lpOverlapped.is_null() {
                continue;
            }
            let overlapped = unsafe { &*entry.lpOverlapped.cast::<Overlapped>() };
            let status = unsafe { (*entry.lpOverlapped).Internal } as i32;
            let result = if status >= 0 {
                Ok(entry.dwNumberOfBytesTransferred as usize)
            } else {
                let error = unsafe { RtlNtStatusToDosError(status) };
                match error {
                    ERROR_HANDLE_EOF => Ok(0),
                    _ => Err(io::Error::from_raw_os_error(error as _)),
                }
            };
            out.push(CompletionEvent {
                key: overlapped.index,
                result,
            });
        }
        Ok(())
    }

    /// Recover the operation a packet belongs to. Stale keys are spurious.
    pub(crate) fn resolve(
        &mut self,
        ops: &mut Slab<Op>,
        ev: CompletionEvent,
    ) -> Option<(usize, io::Result<usize>)> {
        if !ops.contains(ev.key) {
            return None;
        }
        Some((ev.key, ev.result))
    }

    /// Per-variant result finalization at completion time.
    pub(crate) fn finalize(&mut self, op: &mut Op, n: usize) -> io::Result<usize> {
        match &mut op.kind {
            OpKind::SocketAccept(a) => {
                a.update_context()?;
                Ok(n)
            }
            OpKind::SocketConnect(c) => {
                c.update_context()?;
                Ok(n)
            }
            OpKind::ProcessExit(p) => {
                p.unregister();
                p.exit_code = Some(p.query_exit_code()?);
                Ok(n)
            }
            _ => Ok(n),
        }
    }
}

/// A thread-safe handle that interrupts the kernel wait with a reserved-key
/// post.
#[derive(Clone)]
pub(crate) struct NotifyHandle {
    port: isize,
}

unsafe impl Send for NotifyHandle {}
unsafe impl Sync for NotifyHandle {}

impl NotifyHandle {
    pub(crate) fn notify(&self) -> io::Result<()> {
        let res = unsafe {
            PostQueuedCompletionStatus(self.port as _, 0, WAKE_KEY, null_mut())
        };
        if res == 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

/// An active `RegisterWaitForSingleObject` registration. Dropping it blocks
/// until the wait callback is no longer executing.
pub(crate) struct WaitRegistration {
    handle: isize,
    // Keeps the callback context alive while the wait is registered.
    _context: Box<op::WaitContext>,
}

impl WaitRegistration {
    pub(crate) fn new(handle: isize, context: Box<op::WaitContext>) -> Self {
        Self {
            handle,
            _context: context,
        }
    }
}

impl Drop for WaitRegistration {
    fn drop(&mut self) {
        unsafe {
            windows_sys::Win32::System::Threading::UnregisterWaitEx(
                self.handle,
                INVALID_HANDLE_VALUE,
            )
        };
    }
}
