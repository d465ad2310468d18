//! Readiness-based kernel queue on top of the `polling` crate
//! (epoll/kqueue).
//!
//! Socket operations are attempt-then-register: the first syscall happens at
//! activate time, and only a `WouldBlock` outcome registers readiness
//! interest. File operations on regular files never block meaningfully and
//! complete through the manual queue. Process exits are watched through a
//! pidfd on Linux and through `EVFILT_PROC` registered on the poller's own
//! kqueue elsewhere.

#[doc(no_inline)]
pub use std::os::fd::{AsRawFd, RawFd};
#[cfg(pidfd)]
use std::os::fd::{AsFd, FromRawFd, OwnedFd};
use std::{
    collections::{HashMap, VecDeque},
    io,
    num::NonZeroUsize,
    os::fd::BorrowedFd,
    sync::Arc,
    task::Poll,
    time::Duration,
};

use polling::{Event, Events, Poller};
use slab::Slab;

use crate::{
    driver::Activation,
    instrument,
    log::trace,
    op::{Op, OpKind},
    syscall,
};

pub(crate) mod op;

/// Process handles are plain pids.
pub type ProcessHandle = libc::pid_t;

/// Readiness direction an operation waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interest {
    Readable,
    Writable,
}

/// Registration produced by an activation attempt that would block.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WaitArg {
    pub(crate) fd: RawFd,
    pub(crate) interest: Interest,
}

/// Outcome of the first syscall attempt at activate time.
pub(crate) enum Decision {
    /// Completed or failed instantly, no registration needed.
    Complete(io::Result<usize>),
    /// Needs to wait for readiness.
    Wait(WaitArg),
}

/// One event retrieved from a kernel wait.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CompletionEvent {
    pub(crate) key: usize,
    pub(crate) readable: bool,
    pub(crate) writable: bool,
}

#[derive(Debug, Default)]
struct FdQueue {
    read_queue: VecDeque<usize>,
    write_queue: VecDeque<usize>,
}

impl FdQueue {
    fn push_back_interest(&mut self, index: usize, interest: Interest) {
        match interest {
            Interest::Readable => self.read_queue.push_back(index),
            Interest::Writable => self.write_queue.push_back(index),
        }
    }

    fn push_front_interest(&mut self, index: usize, interest: Interest) {
        match interest {
            Interest::Readable => self.read_queue.push_front(index),
            Interest::Writable => self.write_queue.push_front(index),
        }
    }

    fn remove(&mut self, index: usize) {
        self.read_queue.retain(|&i| i != index);
        self.write_queue.retain(|&i| i != index);
    }

    fn is_empty(&self) -> bool {
        self.read_queue.is_empty() && self.write_queue.is_empty()
    }

    /// The combined oneshot interest for the queue fronts.
    fn event(&self) -> Event {
        let mut event = Event::none(0);
        if let Some(&key) = self.read_queue.front() {
            event.readable = true;
            event.key = key;
        }
        if let Some(&key) = self.write_queue.front() {
            event.writable = true;
            event.key = key;
        }
        event
    }

    fn pop_interest(&mut self, ev: &CompletionEvent) -> Option<(usize, Interest)> {
        if ev.readable {
            if let Some(index) = self.read_queue.pop_front() {
                return Some((index, Interest::Readable));
            }
        }
        if ev.writable {
            if let Some(index) = self.write_queue.pop_front() {
                return Some((index, Interest::Writable));
            }
        }
        None
    }
}

/// Low-level kernel queue of the readiness back-end.
pub(crate) struct KernelQueue {
    poller: Arc<Poller>,
    events: Events,
    registry: HashMap<RawFd, FdQueue>,
}

impl KernelQueue {
    pub(crate) fn new(capacity: u32) -> io::Result<Self> {
        instrument!(crate::log::Level::TRACE, "new", capacity);
        let capacity = NonZeroUsize::new(capacity.max(1) as usize).unwrap();
        Ok(Self {
            poller: Arc::new(Poller::new()?),
            events: Events::with_capacity(capacity),
            registry: HashMap::new(),
        })
    }

    /// Raw handle of the kernel queue object.
    pub(crate) fn loop_fd(&self) -> RawFd {
        self.poller.as_raw_fd()
    }

    pub(crate) fn notify_handle(&self) -> NotifyHandle {
        NotifyHandle {
            poller: self.poller.clone(),
        }
    }

    /// Readiness back-ends need no per-descriptor association.
    pub(crate) fn attach(&mut self, _fd: RawFd) -> io::Result<()> {
        Ok(())
    }

    /// One-time preparation before the first activation.
    pub(crate) fn setup(&mut self, op: &mut Op, _index: usize) -> io::Result<()> {
        match &mut op.kind {
            #[cfg(pidfd)]
            OpKind::ProcessExit(p) => {
                let fd = syscall!(libc::syscall(
                    libc::SYS_pidfd_open,
                    p.process as libc::c_long,
                    0 as libc::c_long
                ))?;
                p.pidfd = Some(unsafe { OwnedFd::from_raw_fd(fd as RawFd) });
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Publish an operation. Called with state `Submitting` the first time
    /// and `Active` on reactivations.
    pub(crate) fn activate(&mut self, op: &mut Op, index: usize) -> io::Result<Activation> {
        instrument!(crate::log::Level::TRACE, "activate", index);
        let decision = match &mut op.kind {
            OpKind::SocketAccept(a) => a.attempt(),
            OpKind::SocketConnect(c) => c.attempt(),
            OpKind::SocketSend(s) => s.attempt(),
            OpKind::SocketReceive(r) => r.attempt(),
            OpKind::SocketClose(c) => Decision::Complete(c.close()),
            OpKind::FileClose(c) => Decision::Complete(c.close()),
            OpKind::FileRead(r) => Decision::Complete(r.attempt()),
            OpKind::FileWrite(w) => Decision::Complete(w.attempt()),
            OpKind::ProcessExit(_) => return self.activate_process_exit(op, index),
            OpKind::LoopTimeout(_) | OpKind::LoopWakeUp(_) | OpKind::Vacated => {
                debug_assert!(false, "operation without kernel interaction");
                Decision::Complete(Ok(0))
            }
        };
        match decision {
            Decision::Complete(res) => {
                op.queued_result = Some(res);
                Ok(Activation::Manual)
            }
            Decision::Wait(arg) => {
                trace!("register {:?} for {}", arg, index);
                self.submit(index, arg)?;
                Ok(Activation::Kernel)
            }
        }
    }

    /// Remove any kernel registration of the operation. Idempotent; tolerates
    /// operations that were never activated. Returns `true` because readiness
    /// cancellations always acknowledge synchronously.
    pub(crate) fn cancel(&mut self, op: &mut Op, index: usize) -> bool {
        if let Some(fd) = op.kind.registered_fd() {
            if let Some(queue) = self.registry.get_mut(&fd) {
                queue.remove(index);
                let _ = Self::renew(&self.poller, &mut self.registry, fd);
            }
            return true;
        }
        if let OpKind::ProcessExit(p) = &mut op.kind {
            #[cfg(pidfd)]
            if let Some(pidfd) = p.pidfd.take() {
                let _ = self.poller.delete(pidfd.as_fd());
            }
            #[cfg(kqueue_proc)]
            let _ = self.unwatch_process(p.process);
            #[cfg(not(any(pidfd, kqueue_proc)))]
            let _ = p;
        }
        true
    }

    /// Watch a process for exit.
    #[cfg(pidfd)]
    fn activate_process_exit(&mut self, op: &mut Op, index: usize) -> io::Result<Activation> {
        let OpKind::ProcessExit(p) = &mut op.kind else {
            return Err(crate::Error::InvalidArgument.into());
        };
        let Some(pidfd) = p.pidfd.as_ref() else {
            return Err(crate::Error::InvalidArgument.into());
        };
        unsafe { self.poller.add(pidfd.as_raw_fd(), Event::readable(index))? };
        Ok(Activation::Kernel)
    }

    /// Watch a process for exit.
    #[cfg(kqueue_proc)]
    fn activate_process_exit(&mut self, op: &mut Op, index: usize) -> io::Result<Activation> {
        let OpKind::ProcessExit(p) = &mut op.kind else {
            return Err(crate::Error::InvalidArgument.into());
        };
        match self.watch_process(p.process, index) {
            Ok(()) => Ok(Activation::Kernel),
            // The process is already gone; reap at completion.
            Err(e) if e.raw_os_error() == Some(libc::ESRCH) => {
                op.queued_result = Some(Ok(0));
                Ok(Activation::Manual)
            }
            Err(e) => Err(e),
        }
    }

    #[cfg(not(any(pidfd, kqueue_proc)))]
    fn activate_process_exit(&mut self, op: &mut Op, _index: usize) -> io::Result<Activation> {
        op.queued_result = Some(Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "process exit notifications are not supported on this platform",
        )));
        Ok(Activation::Manual)
    }

    /// Kernel wait. `EINTR` is retried internally; a zero timeout never
    /// blocks.
    pub(crate) fn poll(
        &mut self,
        timeout: Option<Duration>,
        out: &mut Vec<CompletionEvent>,
    ) -> io::Result<()> {
        instrument!(crate::log::Level::TRACE, "poll", ?timeout);
        self.events.clear();
        loop {
            match self.poller.wait(&mut self.events, timeout) {
                Ok(_) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    if timeout == Some(Duration::ZERO) {
                        break;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        out.extend(self.events.iter().map(|ev| CompletionEvent {
            key: ev.key,
            readable: ev.readable,
            writable: ev.writable,
        }));
        Ok(())
    }

    /// Turn a raw event into the operation it completes and its result.
    /// Spurious events (stale keys, wrong-direction readiness, syscalls that
    /// still block) return `None` after re-arming whatever remains
    /// registered.
    pub(crate) fn resolve(
        &mut self,
        ops: &mut Slab<Op>,
        ev: CompletionEvent,
    ) -> Option<(usize, io::Result<usize>)> {
        enum Target {
            Process,
            Socket(RawFd),
        }
        let target = {
            let op = ops.get(ev.key)?;
            match &op.kind {
                OpKind::ProcessExit(_) => Target::Process,
                kind => Target::Socket(kind.registered_fd()?),
            }
        };
        match target {
            Target::Process => Some((ev.key, Ok(0))),
            Target::Socket(fd) => {
                let queue = self.registry.get_mut(&fd)?;
                let Some((index, interest)) = queue.pop_interest(&ev) else {
                    let _ = Self::renew(&self.poller, &mut self.registry, fd);
                    return None;
                };
                let outcome = match ops.get_mut(index).map(|op| &mut op.kind) {
                    Some(OpKind::SocketAccept(a)) => a.on_ready(),
                    Some(OpKind::SocketConnect(c)) => c.on_ready(),
                    Some(OpKind::SocketSend(s)) => s.on_ready(),
                    Some(OpKind::SocketReceive(r)) => r.on_ready(),
                    _ => {
                        let _ = Self::renew(&self.poller, &mut self.registry, fd);
                        return None;
                    }
                };
                match outcome {
                    Poll::Pending => {
                        // Spurious readiness; go back to the queue front.
                        if let Some(queue) = self.registry.get_mut(&fd) {
                            queue.push_front_interest(index, interest);
                        }
                        let _ = Self::renew(&self.poller, &mut self.registry, fd);
                        None
                    }
                    Poll::Ready(res) => {
                        let _ = Self::renew(&self.poller, &mut self.registry, fd);
                        Some((index, res))
                    }
                }
            }
        }
    }

    /// Per-variant result finalization at completion time.
    pub(crate) fn finalize(&mut self, op: &mut Op, n: usize) -> io::Result<usize> {
        if let OpKind::ProcessExit(p) = &mut op.kind {
            #[cfg(pidfd)]
            if let Some(pidfd) = p.pidfd.take() {
                let _ = self.poller.delete(pidfd.as_fd());
            }
            p.exit_code = Some(op::reap_exit_code(p.process)?);
        }
        Ok(n)
    }

    /// Queue readiness interest, registering or re-registering the fd.
    fn submit(&mut self, index: usize, arg: WaitArg) -> io::Result<()> {
        let need_add = !self.registry.contains_key(&arg.fd);
        let queue = self.registry.entry(arg.fd).or_default();
        queue.push_back_interest(index, arg.interest);
        let event = queue.event();
        let res = if need_add {
            unsafe { self.poller.add(arg.fd, event) }
        } else {
            self.poller
                .modify(unsafe { BorrowedFd::borrow_raw(arg.fd) }, event)
        };
        if let Err(e) = res {
            if let Some(queue) = self.registry.get_mut(&arg.fd) {
                queue.remove(index);
                if queue.is_empty() {
                    self.registry.remove(&arg.fd);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    /// Re-arm the oneshot interest for whatever is still queued on `fd`, or
    /// drop the registration when nothing is.
    fn renew(
        poller: &Poller,
        registry: &mut HashMap<RawFd, FdQueue>,
        fd: RawFd,
    ) -> io::Result<()> {
        let Some(queue) = registry.get(&fd) else {
            return Ok(());
        };
        let event = queue.event();
        if !event.readable && !event.writable {
            registry.remove(&fd);
            poller.delete(unsafe { BorrowedFd::borrow_raw(fd) })?;
        } else {
            poller.modify(unsafe { BorrowedFd::borrow_raw(fd) }, event)?;
        }
        Ok(())
    }

    #[cfg(kqueue_proc)]
    fn watch_process(&self, pid: ProcessHandle, index: usize) -> io::Result<()> {
        let mut kev: libc::kevent = unsafe { std::mem::zeroed() };
        kev.ident = pid as libc::uintptr_t;
        kev.filter = libc::EVFILT_PROC;
        kev.flags = libc::EV_ADD | libc::EV_ENABLE | libc::EV_ONESHOT;
        kev.fflags = libc::NOTE_EXIT;
        kev.udata = index as _;
        syscall!(libc::kevent(
            self.poller.as_raw_fd(),
            &kev,
            1,
            std::ptr::null_mut(),
            0,
            std::ptr::null()
        ))?;
        Ok(())
    }

    #[cfg(kqueue_proc)]
    fn unwatch_process(&self, pid: ProcessHandle) -> io::Result<()> {
        let mut kev: libc::kevent = unsafe { std::mem::zeroed() };
        kev.ident = pid as libc::uintptr_t;
        kev.filter = libc::EVFILT_PROC;
        kev.flags = libc::EV_DELETE;
        syscall!(libc::kevent(
            self.poller.as_raw_fd(),
            &kev,
            1,
            std::ptr::null_mut(),
            0,
            std::ptr::null()
        ))?;
        Ok(())
    }
}

impl Drop for KernelQueue {
    fn drop(&mut self) {
        for fd in self.registry.keys() {
            let _ = self.poller.delete(unsafe { BorrowedFd::borrow_raw(*fd) });
        }
    }
}

/// A thread-safe handle that interrupts the kernel wait.
#[derive(Clone)]
pub(crate) struct NotifyHandle {
    poller: Arc<Poller>,
}

impl NotifyHandle {
    pub(crate) fn notify(&self) -> io::Result<()> {
        self.poller.notify()
    }
}
