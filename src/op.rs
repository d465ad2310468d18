//! The async operations.
//!
//! Types in this mod represent the requests passed to the kernel queue and
//! the per-variant completion results handed to user callbacks. An operation
//! itself doesn't perform anything: start one on an [`EventLoop`] and drive
//! the loop.

use std::io;
#[cfg(pidfd)]
use std::os::fd::OwnedFd;
use std::sync::Arc;

use socket2::{SockAddr, Socket};

#[cfg(windows)]
use crate::driver::{Overlapped, WaitRegistration};
use crate::{
    driver::{ProcessHandle, RawFd},
    event_loop::EventLoop,
    time::TimeCounter,
    wakeup::{EventObject, WakeShared},
};

/// Identity of a started operation.
///
/// The id stays valid from `start` until the final callback return, across
/// reactivations. After the operation went back to rest its slot may be
/// reused by a later `start`; don't keep ids of completed operations around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpId {
    pub(crate) loop_id: u32,
    pub(crate) index: usize,
}

/// Lifecycle state of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpState {
    /// Not in any queue.
    Free,
    /// In the submission queue.
    Submitting,
    /// Monitored by the kernel (or queued for manual completion).
    Active,
    /// In the submission queue, waiting for the cancellation to be staged.
    Cancelling,
}

/// Which active bookkeeping an operation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpCategory {
    Timer,
    WakeUp,
    Handle,
}

pub(crate) type Callback<R> = Box<dyn FnMut(&mut EventLoop, &mut R)>;

/// Address family of a TCP socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    /// IPv4.
    V4,
    /// IPv6.
    V6,
}

impl AddressFamily {
    pub(crate) fn domain(self) -> socket2::Domain {
        match self {
            Self::V4 => socket2::Domain::IPV4,
            Self::V6 => socket2::Domain::IPV6,
        }
    }
}

pub(crate) struct Op {
    pub(crate) state: OpState,
    pub(crate) debug_name: &'static str,
    /// Result parked by an activation that completed without the kernel,
    /// consumed when the manual-completion queue is drained.
    pub(crate) queued_result: Option<io::Result<usize>>,
    #[cfg(windows)]
    pub(crate) overlapped: Option<Box<Overlapped>>,
    pub(crate) kind: OpKind,
}

impl Op {
    pub(crate) fn new(kind: OpKind) -> Self {
        Self {
            state: OpState::Free,
            debug_name: kind.name(),
            queued_result: None,
            #[cfg(windows)]
            overlapped: None,
            kind,
        }
    }

    /// Placeholder holding an operation's slot while its callback runs.
    pub(crate) fn vacated() -> Self {
        Self::new(OpKind::Vacated)
    }

    pub(crate) fn category(&self) -> OpCategory {
        match self.kind {
            OpKind::LoopTimeout(_) => OpCategory::Timer,
            OpKind::LoopWakeUp(_) => OpCategory::WakeUp,
            _ => OpCategory::Handle,
        }
    }
}

pub(crate) enum OpKind {
    LoopTimeout(LoopTimeout),
    LoopWakeUp(LoopWakeUp),
    ProcessExit(ProcessExit),
    SocketAccept(SocketAccept),
    SocketConnect(SocketConnect),
    SocketSend(SocketSend),
    SocketReceive(SocketReceive),
    SocketClose(SocketClose),
    FileRead(FileRead),
    FileWrite(FileWrite),
    FileClose(FileClose),
    #[cfg(windows)]
    NativePoll(NativePoll),
    /// Transient filler while the real operation is out for its callback.
    Vacated,
}

impl OpKind {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::LoopTimeout(_) => "loop_timeout",
            Self::LoopWakeUp(_) => "loop_wake_up",
            Self::ProcessExit(_) => "process_exit",
            Self::SocketAccept(_) => "socket_accept",
            Self::SocketConnect(_) => "socket_connect",
            Self::SocketSend(_) => "socket_send",
            Self::SocketReceive(_) => "socket_receive",
            Self::SocketClose(_) => "socket_close",
            Self::FileRead(_) => "file_read",
            Self::FileWrite(_) => "file_write",
            Self::FileClose(_) => "file_close",
            #[cfg(windows)]
            Self::NativePoll(_) => "native_poll",
            Self::Vacated => "vacated",
        }
    }

    /// The fd whose readiness the reactor watches for this operation, if any.
    #[cfg(unix)]
    pub(crate) fn registered_fd(&self) -> Option<RawFd> {
        match self {
            Self::SocketAccept(a) => Some(a.fd),
            Self::SocketConnect(c) => Some(c.fd),
            Self::SocketSend(s) => Some(s.fd),
            Self::SocketReceive(r) => Some(r.fd),
            _ => None,
        }
    }

    /// The handle an in-flight native submission can be cancelled on.
    #[cfg(windows)]
    pub(crate) fn native_fd(&self) -> Option<RawFd> {
        match self {
            Self::SocketAccept(a) => Some(a.fd),
            Self::SocketConnect(c) => Some(c.fd),
            Self::SocketSend(s) => Some(s.fd),
            Self::SocketReceive(r) => Some(r.fd),
            Self::FileRead(r) => Some(r.fd),
            Self::FileWrite(w) => Some(w.fd),
            Self::NativePoll(p) => Some(p.fd),
            _ => None,
        }
    }
}

pub(crate) struct LoopTimeout {
    pub(crate) expires_at: TimeCounter,
    pub(crate) callback: Callback<LoopTimeoutResult>,
}

pub(crate) struct LoopWakeUp {
    pub(crate) shared: Arc<WakeShared>,
    pub(crate) event: Option<Arc<EventObject>>,
    pub(crate) callback: Callback<LoopWakeUpResult>,
}

pub(crate) struct ProcessExit {
    pub(crate) process: ProcessHandle,
    pub(crate) exit_code: Option<i32>,
    #[cfg(pidfd)]
    pub(crate) pidfd: Option<OwnedFd>,
    #[cfg(windows)]
    pub(crate) wait: Option<WaitRegistration>,
    pub(crate) callback: Callback<ProcessExitResult>,
}

pub(crate) struct SocketAccept {
    pub(crate) fd: RawFd,
    #[cfg_attr(unix, allow(dead_code))]
    pub(crate) family: AddressFamily,
    pub(crate) accepted: Option<Socket>,
    pub(crate) peer: Option<SockAddr>,
    #[cfg(windows)]
    pub(crate) client: Option<Socket>,
    #[cfg(windows)]
    pub(crate) addr_buf: Box<[u8; crate::driver::ACCEPT_ADDR_BUFFER_SIZE]>,
    pub(crate) callback: Callback<SocketAcceptResult>,
}

pub(crate) struct SocketConnect {
    pub(crate) fd: RawFd,
    pub(crate) addr: SockAddr,
    pub(crate) callback: Callback<SocketConnectResult>,
}

pub(crate) struct SocketSend {
    pub(crate) fd: RawFd,
    pub(crate) buffer: Option<Vec<u8>>,
    pub(crate) callback: Callback<SocketSendResult>,
}

pub(crate) struct SocketReceive {
    pub(crate) fd: RawFd,
    pub(crate) buffer: Option<Vec<u8>>,
    pub(crate) callback: Callback<SocketReceiveResult>,
}

pub(crate) struct SocketClose {
    pub(crate) fd: RawFd,
    pub(crate) callback: Callback<SocketCloseResult>,
}

pub(crate) struct FileRead {
    pub(crate) fd: RawFd,
    pub(crate) offset: u64,
    pub(crate) buffer: Option<Vec<u8>>,
    pub(crate) callback: Callback<FileReadResult>,
}

pub(crate) struct FileWrite {
    pub(crate) fd: RawFd,
    pub(crate) offset: u64,
    pub(crate) buffer: Option<Vec<u8>>,
    pub(crate) callback: Callback<FileWriteResult>,
}

pub(crate) struct FileClose {
    pub(crate) fd: RawFd,
    pub(crate) callback: Callback<FileCloseResult>,
}

/// Keeps an externally-driven overlapped submission alive on the port.
#[cfg(windows)]
pub(crate) struct NativePoll {
    pub(crate) fd: RawFd,
    pub(crate) callback: Callback<NativePollResult>,
}

// RESULTS

/// Completion of a [`EventLoop::start_loop_timeout`] request.
pub struct LoopTimeoutResult {
    pub(crate) res: io::Result<()>,
}

impl LoopTimeoutResult {
    /// Whether the timer fired normally.
    pub fn is_ok(&self) -> bool {
        self.res.is_ok()
    }

    /// The failure, if the timer could not be armed.
    pub fn error(&self) -> Option<&io::Error> {
        self.res.as_ref().err()
    }
}

/// Completion of a [`EventLoop::start_loop_wake_up`] request.
///
/// A wake-up stays armed after its callback unless the callback calls
/// [`reactivate(false)`](Self::reactivate).
pub struct LoopWakeUpResult {
    pub(crate) res: io::Result<()>,
    pub(crate) reactivate: bool,
}

impl LoopWakeUpResult {
    /// Whether the wake-up fired normally.
    pub fn is_ok(&self) -> bool {
        self.res.is_ok()
    }

    /// The failure, if any.
    pub fn error(&self) -> Option<&io::Error> {
        self.res.as_ref().err()
    }

    /// Keep (`true`, the default) or disarm (`false`) the wake-up.
    pub fn reactivate(&mut self, keep: bool) {
        self.reactivate = keep;
    }
}

/// Completion of a [`EventLoop::start_process_exit`] request.
pub struct ProcessExitResult {
    pub(crate) res: io::Result<()>,
    pub(crate) exit_code: Option<i32>,
}

impl ProcessExitResult {
    /// Whether the notification was delivered.
    pub fn is_ok(&self) -> bool {
        self.res.is_ok()
    }

    /// The failure, if any.
    pub fn error(&self) -> Option<&io::Error> {
        self.res.as_ref().err()
    }

    /// Exit code of the watched process. Negated signal number on unix when
    /// the process was killed by a signal.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }
}

/// Completion of a [`EventLoop::start_socket_accept`] request.
pub struct SocketAcceptResult {
    pub(crate) res: io::Result<()>,
    pub(crate) accepted: Option<Socket>,
    pub(crate) peer: Option<SockAddr>,
    pub(crate) reactivate: bool,
}

impl SocketAcceptResult {
    /// Whether a client was accepted.
    pub fn is_ok(&self) -> bool {
        self.res.is_ok()
    }

    /// The failure, if any.
    pub fn error(&self) -> Option<&io::Error> {
        self.res.as_ref().err()
    }

    /// Move the accepted client socket out of the result. The socket is
    /// non-blocking and already associated with the loop.
    pub fn take_socket(&mut self) -> Option<Socket> {
        self.accepted.take()
    }

    /// Address of the accepted peer.
    pub fn peer_addr(&self) -> Option<&SockAddr> {
        self.peer.as_ref()
    }

    /// Request the accept to be issued again with the same listener.
    pub fn reactivate(&mut self, value: bool) {
        self.reactivate = value;
    }
}

/// Completion of a [`EventLoop::start_socket_connect`] request.
pub struct SocketConnectResult {
    pub(crate) res: io::Result<()>,
}

impl SocketConnectResult {
    /// Whether the socket is connected.
    pub fn is_ok(&self) -> bool {
        self.res.is_ok()
    }

    /// The failure (`ConnectionRefused`, `HostUnreachable`, ...), if any.
    pub fn error(&self) -> Option<&io::Error> {
        self.res.as_ref().err()
    }
}

/// Completion of a [`EventLoop::start_socket_send`] request.
pub struct SocketSendResult {
    pub(crate) res: io::Result<usize>,
    pub(crate) buffer: Option<Vec<u8>>,
    pub(crate) reactivate: bool,
}

impl SocketSendResult {
    /// Whether data was sent.
    pub fn is_ok(&self) -> bool {
        self.res.is_ok()
    }

    /// The failure (`ConnectionReset`, ...), if any.
    pub fn error(&self) -> Option<&io::Error> {
        self.res.as_ref().err()
    }

    /// Number of bytes handed to the kernel. May be shorter than the buffer;
    /// re-arm with the remainder in that case.
    pub fn bytes_sent(&self) -> usize {
        *self.res.as_ref().unwrap_or(&0)
    }

    /// Reclaim the send buffer.
    pub fn take_buffer(&mut self) -> Option<Vec<u8>> {
        self.buffer.take()
    }

    /// Request the same send to be issued again.
    pub fn reactivate(&mut self, value: bool) {
        self.reactivate = value;
    }
}

/// Completion of a [`EventLoop::start_socket_receive`] request.
pub struct SocketReceiveResult {
    pub(crate) res: io::Result<usize>,
    pub(crate) buffer: Option<Vec<u8>>,
    pub(crate) reactivate: bool,
}

impl SocketReceiveResult {
    /// Whether the receive completed.
    pub fn is_ok(&self) -> bool {
        self.res.is_ok()
    }

    /// The failure (`ConnectionReset`, ...), if any.
    pub fn error(&self) -> Option<&io::Error> {
        self.res.as_ref().err()
    }

    /// The received bytes. Empty when the peer closed the connection.
    pub fn data(&self) -> &[u8] {
        match (&self.res, &self.buffer) {
            (Ok(n), Some(buffer)) => &buffer[..*n],
            _ => &[],
        }
    }

    /// Whether the peer closed the connection (zero bytes received).
    pub fn peer_closed(&self) -> bool {
        matches!(self.res, Ok(0))
    }

    /// Reclaim the receive buffer.
    pub fn take_buffer(&mut self) -> Option<Vec<u8>> {
        self.buffer.take()
    }

    /// Request another receive into the same buffer.
    pub fn reactivate(&mut self, value: bool) {
        self.reactivate = value;
    }
}

/// Completion of a [`EventLoop::start_socket_close`] request.
pub struct SocketCloseResult {
    pub(crate) res: io::Result<()>,
}

impl SocketCloseResult {
    /// Whether the socket was closed.
    pub fn is_ok(&self) -> bool {
        self.res.is_ok()
    }

    /// The failure, if any.
    pub fn error(&self) -> Option<&io::Error> {
        self.res.as_ref().err()
    }
}

/// Completion of a [`EventLoop::start_file_read`] request.
pub struct FileReadResult {
    pub(crate) res: io::Result<usize>,
    pub(crate) buffer: Option<Vec<u8>>,
    pub(crate) reactivate: bool,
}

impl FileReadResult {
    /// Whether the read completed. End of file is a successful empty read,
    /// not an error.
    pub fn is_ok(&self) -> bool {
        self.res.is_ok()
    }

    /// The failure, if any.
    pub fn error(&self) -> Option<&io::Error> {
        self.res.as_ref().err()
    }

    /// The bytes read. Empty at end of file.
    pub fn data(&self) -> &[u8] {
        match (&self.res, &self.buffer) {
            (Ok(n), Some(buffer)) => &buffer[..*n],
            _ => &[],
        }
    }

    /// Whether the read hit end of file.
    pub fn end_of_file(&self) -> bool {
        matches!(self.res, Ok(0))
    }

    /// Reclaim the read buffer.
    pub fn take_buffer(&mut self) -> Option<Vec<u8>> {
        self.buffer.take()
    }

    /// Request another read at the same offset into the same buffer.
    pub fn reactivate(&mut self, value: bool) {
        self.reactivate = value;
    }
}

/// Completion of a [`EventLoop::start_file_write`] request.
pub struct FileWriteResult {
    pub(crate) res: io::Result<usize>,
    pub(crate) buffer: Option<Vec<u8>>,
    pub(crate) reactivate: bool,
}

impl FileWriteResult {
    /// Whether the write completed.
    pub fn is_ok(&self) -> bool {
        self.res.is_ok()
    }

    /// The failure (`DiskFull` maps to `StorageFull`), if any.
    pub fn error(&self) -> Option<&io::Error> {
        self.res.as_ref().err()
    }

    /// Number of bytes written.
    pub fn bytes_written(&self) -> usize {
        *self.res.as_ref().unwrap_or(&0)
    }

    /// Reclaim the write buffer.
    pub fn take_buffer(&mut self) -> Option<Vec<u8>> {
        self.buffer.take()
    }

    /// Request the same write to be issued again.
    pub fn reactivate(&mut self, value: bool) {
        self.reactivate = value;
    }
}

/// Completion of a [`EventLoop::start_file_close`] request.
pub struct FileCloseResult {
    pub(crate) res: io::Result<()>,
}

impl FileCloseResult {
    /// Whether the file was closed.
    pub fn is_ok(&self) -> bool {
        self.res.is_ok()
    }

    /// The failure, if any.
    pub fn error(&self) -> Option<&io::Error> {
        self.res.as_ref().err()
    }
}

/// Completion of a [`EventLoop::start_native_poll`] request.
#[cfg(windows)]
pub struct NativePollResult {
    pub(crate) res: io::Result<()>,
    pub(crate) reactivate: bool,
}

#[cfg(windows)]
impl NativePollResult {
    /// Whether the externally-issued submission completed successfully.
    pub fn is_ok(&self) -> bool {
        self.res.is_ok()
    }

    /// The failure, if any.
    pub fn error(&self) -> Option<&io::Error> {
        self.res.as_ref().err()
    }

    /// Keep waiting for the next externally-issued submission.
    pub fn reactivate(&mut self, value: bool) {
        self.reactivate = value;
    }
}
