//! The event loop.
//!
//! A step runs in phases: drain the submission queue (setup + activate, or
//! stage cancellations), wait in the kernel up to the next timer expiry, fire
//! expired timers, translate kernel events into completions, run pending
//! wake-ups, then drain completions that never involved the kernel. User
//! callbacks run inline on the loop thread and may start or stop other
//! operations; submissions queued from inside a callback are picked up by the
//! next step.

use std::{
    collections::VecDeque,
    io, mem,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use slab::Slab;
use socket2::{Protocol, SockAddr, Socket, Type};

use crate::{
    driver::{Activation, CompletionEvent, KernelQueue, ProcessHandle, RawFd},
    log::trace,
    op::*,
    time::TimeCounter,
    timer::TimerQueue,
    wakeup::{EventObject, WakeShared, WakeUpHandle},
    Error, Result,
};

static NEXT_LOOP_ID: AtomicU32 = AtomicU32::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollMode {
    NoWait,
    ForcedForwardProgress,
}

/// A single-threaded callback-driven event loop.
///
/// Exactly one thread may drive the loop and start or stop operations; the
/// only cross-thread entry points are [`WakeUpHandle::wake`] and
/// [`EventObject::wait`]. All callbacks run on the loop thread.
pub struct EventLoop {
    id: u32,
    ops: Slab<Op>,
    submissions: VecDeque<usize>,
    manual_completions: VecDeque<usize>,
    active_timers: TimerQueue,
    active_wake_ups: VecDeque<usize>,
    active_handles: usize,
    external_count: usize,
    loop_time: TimeCounter,
    queue: KernelQueue,
    events: Vec<CompletionEvent>,
}

impl EventLoop {
    /// Create a loop with the default kernel queue capacity of 1024 entries.
    pub fn new() -> Result<Self> {
        Self::with_capacity(1024)
    }

    /// Create a loop with the given kernel event batch capacity.
    pub fn with_capacity(capacity: u32) -> Result<Self> {
        let queue = KernelQueue::new(capacity).map_err(Error::KernelInit)?;
        Ok(Self {
            id: NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed),
            ops: Slab::new(),
            submissions: VecDeque::new(),
            manual_completions: VecDeque::new(),
            active_timers: TimerQueue::new(),
            active_wake_ups: VecDeque::new(),
            active_handles: 0,
            external_count: 0,
            loop_time: TimeCounter::now(),
            queue,
            events: Vec::new(),
        })
    }

    /// Release the kernel queue. Equivalent to dropping the loop; callers
    /// are responsible for having stopped or completed all outstanding
    /// operations first.
    pub fn close(self) {
        drop(self);
    }

    /// Run steps until no active operations and no submissions remain.
    /// Propagates the first fatal kernel error.
    pub fn run(&mut self) -> Result<()> {
        while self.total_active() > 0 || !self.submissions.is_empty() {
            self.step_once()?;
        }
        Ok(())
    }

    /// Run a single step that guarantees forward progress: blocks in the
    /// kernel up to the next timer expiry, or indefinitely if there are no
    /// timers.
    pub fn step_once(&mut self) -> Result<()> {
        self.step(PollMode::ForcedForwardProgress)
    }

    /// Run a single step that never blocks: drains already-available events
    /// and returns.
    pub fn step_nowait(&mut self) -> Result<()> {
        self.step(PollMode::NoWait)
    }

    /// Stop a started operation.
    ///
    /// An `Active` operation transitions to cancelling and is detached from
    /// the kernel during the next step; its callback is not invoked. A
    /// still-submitting operation is withdrawn on the spot.
    pub fn stop(&mut self, id: OpId) -> Result<()> {
        if id.loop_id != self.id {
            return Err(Error::WrongLoop);
        }
        let Some((state, category)) = self
            .ops
            .get(id.index)
            .map(|op| (op.state, op.category()))
        else {
            return Err(Error::NotActive);
        };
        trace!("stop {} ({:?})", id.index, state);
        match state {
            OpState::Free => Err(Error::NotActive),
            OpState::Cancelling => Err(Error::AlreadyCancelling),
            OpState::Submitting => {
                self.submissions.retain(|&i| i != id.index);
                self.ops.remove(id.index);
                Ok(())
            }
            OpState::Active => {
                self.ops[id.index].state = OpState::Cancelling;
                match category {
                    OpCategory::Timer => self.active_timers.remove(id.index),
                    OpCategory::WakeUp => self.active_wake_ups.retain(|&i| i != id.index),
                    OpCategory::Handle => self.active_handles -= 1,
                }
                self.manual_completions.retain(|&i| i != id.index);
                self.submissions.push_back(id.index);
                Ok(())
            }
        }
    }

    /// Keep the loop alive for an external subsystem performing its own
    /// kernel interactions against [`loop_fd`](Self::loop_fd).
    pub fn increase_external_count(&mut self) {
        self.external_count += 1;
    }

    /// Undo one [`increase_external_count`](Self::increase_external_count).
    pub fn decrease_external_count(&mut self) {
        self.external_count = self.external_count.saturating_sub(1);
    }

    /// Associate an externally created descriptor with the loop.
    ///
    /// ## Platform specific
    /// * IOCP: attaches the handle to the completion port. A handle can only
    ///   be attached to one loop, and must be attached before any operation
    ///   uses it.
    /// * epoll/kqueue: does nothing and returns `Ok(())`.
    pub fn associate(&mut self, fd: RawFd) -> io::Result<()> {
        self.queue.attach(fd)
    }

    /// Raw handle of the kernel queue object, for external subsystems that
    /// call native async functions themselves.
    pub fn loop_fd(&self) -> RawFd {
        self.queue.loop_fd()
    }

    /// Create a non-blocking TCP socket of the given family and associate it
    /// with the loop.
    pub fn create_async_tcp_socket(&mut self, family: AddressFamily) -> io::Result<Socket> {
        let socket = Socket::new(family.domain(), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        #[cfg(apple)]
        socket.set_nosigpipe(true)?;
        self.associate(raw_socket_fd(&socket))?;
        Ok(socket)
    }

    /// Attach a short name to a started operation for trace logs.
    pub fn set_debug_name(&mut self, id: OpId, name: &'static str) -> Result<()> {
        if id.loop_id != self.id {
            return Err(Error::WrongLoop);
        }
        match self.ops.get_mut(id.index) {
            Some(op) => {
                op.debug_name = name;
                Ok(())
            }
            None => Err(Error::NotActive),
        }
    }

    // Starts. Every start queues a submission picked up by the next step; on
    // success the callback is guaranteed to be invoked exactly once per
    // completion (and once more per reactivation). On error the callback is
    // guaranteed not to be invoked.

    /// Start a timer firing `after` the current time.
    ///
    /// Timers are one-shot; re-arm from the callback by starting a new one.
    pub fn start_loop_timeout<F>(&mut self, after: Duration, callback: F) -> Result<OpId>
    where
        F: FnMut(&mut EventLoop, &mut LoopTimeoutResult) + 'static,
    {
        self.loop_time = TimeCounter::now();
        let op = Op::new(OpKind::LoopTimeout(LoopTimeout {
            expires_at: self.loop_time.offset_by(after),
            callback: Box::new(callback),
        }));
        Ok(self.queue_submission(op))
    }

    /// Start a wake-up request. The returned [`WakeUpHandle`] may be moved to
    /// other threads; each [`WakeUpHandle::wake`] schedules the callback to
    /// run on the loop thread, with concurrent wakes coalesced into one
    /// invocation.
    ///
    /// If `event` is supplied, it is signaled after every callback
    /// invocation so producing threads can wait for the loop to catch up.
    pub fn start_loop_wake_up<F>(
        &mut self,
        event: Option<Arc<EventObject>>,
        callback: F,
    ) -> Result<(OpId, WakeUpHandle)>
    where
        F: FnMut(&mut EventLoop, &mut LoopWakeUpResult) + 'static,
    {
        let shared = Arc::new(WakeShared::new(self.queue.notify_handle()));
        let handle = WakeUpHandle::new(shared.clone());
        let op = Op::new(OpKind::LoopWakeUp(LoopWakeUp {
            shared,
            event,
            callback: Box::new(callback),
        }));
        Ok((self.queue_submission(op), handle))
    }

    /// Start a process-exit notification for a child process.
    pub fn start_process_exit<F>(&mut self, process: ProcessHandle, callback: F) -> Result<OpId>
    where
        F: FnMut(&mut EventLoop, &mut ProcessExitResult) + 'static,
    {
        let op = Op::new(OpKind::ProcessExit(ProcessExit {
            process,
            exit_code: None,
            #[cfg(pidfd)]
            pidfd: None,
            #[cfg(windows)]
            wait: None,
            callback: Box::new(callback),
        }));
        Ok(self.queue_submission(op))
    }

    /// Start accepting one connection on a bound, listening socket created
    /// with async flags (see
    /// [`create_async_tcp_socket`](Self::create_async_tcp_socket)).
    /// Reactivate from the callback to keep accepting.
    pub fn start_socket_accept<F>(
        &mut self,
        socket: RawFd,
        family: AddressFamily,
        callback: F,
    ) -> Result<OpId>
    where
        F: FnMut(&mut EventLoop, &mut SocketAcceptResult) + 'static,
    {
        let op = Op::new(OpKind::SocketAccept(SocketAccept {
            fd: socket,
            family,
            accepted: None,
            peer: None,
            #[cfg(windows)]
            client: None,
            #[cfg(windows)]
            addr_buf: Box::new([0; crate::driver::ACCEPT_ADDR_BUFFER_SIZE]),
            callback: Box::new(callback),
        }));
        Ok(self.queue_submission(op))
    }

    /// Start connecting a socket to a resolved address.
    pub fn start_socket_connect<F>(
        &mut self,
        socket: RawFd,
        addr: SockAddr,
        callback: F,
    ) -> Result<OpId>
    where
        F: FnMut(&mut EventLoop, &mut SocketConnectResult) + 'static,
    {
        let op = Op::new(OpKind::SocketConnect(SocketConnect {
            fd: socket,
            addr,
            callback: Box::new(callback),
        }));
        Ok(self.queue_submission(op))
    }

    /// Start sending `data` on a connected socket. The buffer is owned by
    /// the operation until the callback returns and can be reclaimed there.
    pub fn start_socket_send<F>(&mut self, socket: RawFd, data: Vec<u8>, callback: F) -> Result<OpId>
    where
        F: FnMut(&mut EventLoop, &mut SocketSendResult) + 'static,
    {
        if data.is_empty() {
            return Err(Error::InvalidArgument);
        }
        let op = Op::new(OpKind::SocketSend(SocketSend {
            fd: socket,
            buffer: Some(data),
            callback: Box::new(callback),
        }));
        Ok(self.queue_submission(op))
    }

    /// Start receiving into `buffer` on a connected socket. A completion
    /// with zero bytes means the peer closed the connection.
    pub fn start_socket_receive<F>(
        &mut self,
        socket: RawFd,
        buffer: Vec<u8>,
        callback: F,
    ) -> Result<OpId>
    where
        F: FnMut(&mut EventLoop, &mut SocketReceiveResult) + 'static,
    {
        if buffer.is_empty() {
            return Err(Error::InvalidArgument);
        }
        let op = Op::new(OpKind::SocketReceive(SocketReceive {
            fd: socket,
            buffer: Some(buffer),
            callback: Box::new(callback),
        }));
        Ok(self.queue_submission(op))
    }

    /// Start closing a socket. Completes through the manual queue without
    /// kernel involvement.
    pub fn start_socket_close<F>(&mut self, socket: RawFd, callback: F) -> Result<OpId>
    where
        F: FnMut(&mut EventLoop, &mut SocketCloseResult) + 'static,
    {
        let op = Op::new(OpKind::SocketClose(SocketClose {
            fd: socket,
            callback: Box::new(callback),
        }));
        Ok(self.queue_submission(op))
    }

    /// Start reading at `offset` into `buffer`. End of file completes with
    /// an empty span, not an error.
    pub fn start_file_read<F>(
        &mut self,
        fd: RawFd,
        offset: u64,
        buffer: Vec<u8>,
        callback: F,
    ) -> Result<OpId>
    where
        F: FnMut(&mut EventLoop, &mut FileReadResult) + 'static,
    {
        if buffer.is_empty() {
            return Err(Error::InvalidArgument);
        }
        let op = Op::new(OpKind::FileRead(FileRead {
            fd,
            offset,
            buffer: Some(buffer),
            callback: Box::new(callback),
        }));
        Ok(self.queue_submission(op))
    }

    /// Start writing `data` at `offset`.
    pub fn start_file_write<F>(
        &mut self,
        fd: RawFd,
        offset: u64,
        data: Vec<u8>,
        callback: F,
    ) -> Result<OpId>
    where
        F: FnMut(&mut EventLoop, &mut FileWriteResult) + 'static,
    {
        if data.is_empty() {
            return Err(Error::InvalidArgument);
        }
        let op = Op::new(OpKind::FileWrite(FileWrite {
            fd,
            offset,
            buffer: Some(data),
            callback: Box::new(callback),
        }));
        Ok(self.queue_submission(op))
    }

    /// Start closing a file handle. Completes through the manual queue
    /// without kernel involvement.
    pub fn start_file_close<F>(&mut self, fd: RawFd, callback: F) -> Result<OpId>
    where
        F: FnMut(&mut EventLoop, &mut FileCloseResult) + 'static,
    {
        let op = Op::new(OpKind::FileClose(FileClose {
            fd,
            callback: Box::new(callback),
        }));
        Ok(self.queue_submission(op))
    }

    /// Start watching an associated handle for the completion of a native
    /// submission issued by an external subsystem through
    /// [`native_poll_overlapped`](Self::native_poll_overlapped).
    #[cfg(windows)]
    pub fn start_native_poll<F>(&mut self, fd: RawFd, callback: F) -> Result<OpId>
    where
        F: FnMut(&mut EventLoop, &mut NativePollResult) + 'static,
    {
        let op = Op::new(OpKind::NativePoll(NativePoll {
            fd,
            callback: Box::new(callback),
        }));
        Ok(self.queue_submission(op))
    }

    /// The overlapped block an external subsystem must pass to its native
    /// submission so the completion is delivered to the given native-poll
    /// operation.
    #[cfg(windows)]
    pub fn native_poll_overlapped(&mut self, id: OpId) -> Result<*mut std::ffi::c_void> {
        if id.loop_id != self.id {
            return Err(Error::WrongLoop);
        }
        match self.ops.get_mut(id.index).and_then(|op| op.overlapped.as_mut()) {
            Some(overlapped) => Ok(&mut overlapped.base as *mut _ as *mut std::ffi::c_void),
            None => Err(Error::NotActive),
        }
    }

    pub(crate) fn total_active(&self) -> usize {
        self.active_handles
            + self.active_timers.len()
            + self.active_wake_ups.len()
            + self.external_count
    }

    fn queue_submission(&mut self, mut op: Op) -> OpId {
        op.state = OpState::Submitting;
        let index = self.ops.insert(op);
        self.submissions.push_back(index);
        trace!("queued {} as {}", self.ops[index].debug_name, index);
        OpId {
            loop_id: self.id,
            index,
        }
    }

    fn step(&mut self, mode: PollMode) -> Result<()> {
        trace!("--------------- step {:?}", mode);
        self.loop_time = TimeCounter::now();

        while let Some(index) = self.submissions.pop_front() {
            self.stage_submission(index);
        }

        if self.total_active() == 0 && self.manual_completions.is_empty() {
            // Happens when the last active operation was just cancelled.
            return Ok(());
        }

        if self.total_active() > 0 {
            let timeout = self.next_timeout(mode);
            let mut events = mem::take(&mut self.events);
            events.clear();
            let polled = self.queue.poll(timeout, &mut events);
            self.events = events;
            polled.map_err(Error::KernelPoll)?;
        }

        self.loop_time = TimeCounter::now();

        for index in self.active_timers.take_expired(&self.ops, self.loop_time) {
            // An earlier callback in this pass may have stopped this timer.
            if self.ops.get(index).map(|op| op.state) != Some(OpState::Active) {
                continue;
            }
            trace!("timer {} expired", index);
            self.complete_operation(index, Ok(0));
        }

        let mut events = mem::take(&mut self.events);
        for ev in events.drain(..) {
            self.process_event(ev);
        }
        self.events = events;

        self.execute_wake_ups();

        // Entries queued by the completions below run in the next step.
        let pending = self.manual_completions.len();
        for _ in 0..pending {
            let Some(index) = self.manual_completions.pop_front() else {
                break;
            };
            let Some(op) = self.ops.get_mut(index) else {
                continue;
            };
            let res = op.queued_result.take().unwrap_or(Ok(0));
            self.complete_operation(index, res);
        }

        trace!("active after step = {}", self.total_active());
        Ok(())
    }

    /// How long this step may block in the kernel.
    fn next_timeout(&self, mode: PollMode) -> Option<Duration> {
        if mode == PollMode::NoWait || !self.manual_completions.is_empty() {
            return Some(Duration::ZERO);
        }
        self.active_timers
            .next_expiry(&self.ops)
            .map(|at| at.saturating_duration_since(self.loop_time))
    }

    fn stage_submission(&mut self, index: usize) {
        let Some(state) = self.ops.get(index).map(|op| op.state) else {
            debug_assert!(false, "submission queue held a vacant slot");
            return;
        };
        trace!("stage {} ({:?})", index, state);
        match state {
            OpState::Submitting => {
                if let Err(e) = self.setup_and_activate(index) {
                    self.fail_operation(index, e);
                }
            }
            OpState::Cancelling => {
                let acknowledged = self.queue.cancel(&mut self.ops[index], index);
                if acknowledged {
                    self.free_slot(index);
                }
                // Otherwise the acknowledgement arrives as a kernel event.
            }
            OpState::Free | OpState::Active => {
                debug_assert!(false, "submission queue held a {:?} operation", state);
            }
        }
    }

    fn setup_and_activate(&mut self, index: usize) -> io::Result<()> {
        let category = self.ops[index].category();
        match category {
            OpCategory::Timer => {
                self.ops[index].state = OpState::Active;
                self.active_timers.push(index);
                Ok(())
            }
            OpCategory::WakeUp => {
                self.ops[index].state = OpState::Active;
                self.active_wake_ups.push_back(index);
                Ok(())
            }
            OpCategory::Handle => {
                self.queue
                    .setup(&mut self.ops[index], index)
                    .map_err(|e| io::Error::new(e.kind(), Error::KernelSubmit(e)))?;
                let activation = self
                    .queue
                    .activate(&mut self.ops[index], index)
                    .map_err(|e| io::Error::new(e.kind(), Error::KernelSubmit(e)))?;
                self.ops[index].state = OpState::Active;
                self.active_handles += 1;
                if let Activation::Manual = activation {
                    self.manual_completions.push_back(index);
                }
                Ok(())
            }
        }
    }

    fn process_event(&mut self, ev: CompletionEvent) {
        let Some((index, res)) = self.queue.resolve(&mut self.ops, ev) else {
            return;
        };
        let Some(state) = self.ops.get(index).map(|op| op.state) else {
            return;
        };
        if state == OpState::Cancelling {
            // Acknowledgement of a cancellation; the callback stays silent.
            trace!("cancel acknowledged for {}", index);
            self.free_slot(index);
            return;
        }
        if state != OpState::Active {
            return;
        }
        self.complete_operation(index, res);
    }

    /// Finalize the payload, invoke the callback, then either reissue the
    /// operation or return it to rest.
    fn complete_operation(&mut self, index: usize, res: io::Result<usize>) {
        debug_assert!(matches!(
            self.ops.get(index).map(|op| op.state),
            Some(OpState::Active)
        ));
        let res = match res {
            Ok(n) => self.queue.finalize(&mut self.ops[index], n),
            Err(e) => Err(e),
        };
        let mut op = self.take_op(index);
        trace!(
            "complete {} {} ({})",
            index,
            op.debug_name,
            if res.is_ok() { "ok" } else { "err" }
        );
        let reactivate = self.dispatch_callback(&mut op, res);
        if reactivate {
            self.ops[index] = op;
            match self.queue.activate(&mut self.ops[index], index) {
                Ok(Activation::Kernel) => {}
                Ok(Activation::Manual) => self.manual_completions.push_back(index),
                Err(e) => self.fail_operation(index, e),
            }
        } else {
            self.queue.cancel(&mut op, index);
            if op.category() == OpCategory::Handle {
                self.active_handles -= 1;
            }
            self.ops.try_remove(index);
        }
    }

    /// Deliver an error through the callback and return the operation to
    /// rest. Used when setup, activation or reactivation failed.
    fn fail_operation(&mut self, index: usize, error: io::Error) {
        let Some(op) = self.ops.get(index) else {
            return;
        };
        let (state, category) = (op.state, op.category());
        if state == OpState::Active {
            match category {
                OpCategory::Timer => self.active_timers.remove(index),
                OpCategory::WakeUp => self.active_wake_ups.retain(|&i| i != index),
                OpCategory::Handle => self.active_handles -= 1,
            }
            self.manual_completions.retain(|&i| i != index);
        }
        let mut op = self.take_op(index);
        trace!("report error for {} {}: {}", index, op.debug_name, error);
        let _ = self.dispatch_callback(&mut op, Err(error));
        self.queue.cancel(&mut op, index);
        self.ops.try_remove(index);
    }

    /// Run the callbacks of every wake-up whose pending flag is set: invoke
    /// the callback, signal the event object, then clear the flag so the
    /// next wake interrupts the loop again.
    fn execute_wake_ups(&mut self) {
        let candidates: Vec<usize> = self.active_wake_ups.iter().copied().collect();
        for index in candidates {
            let fire = match self.ops.get(index) {
                Some(op) if op.state == OpState::Active => match &op.kind {
                    OpKind::LoopWakeUp(w) => w.shared.is_pending(),
                    _ => {
                        debug_assert!(false, "non-wake-up in the wake-up list");
                        false
                    }
                },
                _ => false,
            };
            if !fire {
                continue;
            }
            let mut op = self.take_op(index);
            let OpKind::LoopWakeUp(w) = &mut op.kind else {
                self.ops[index] = op;
                continue;
            };
            let mut result = LoopWakeUpResult {
                res: Ok(()),
                reactivate: true,
            };
            (w.callback)(self, &mut result);
            if let Some(event) = &w.event {
                event.signal();
            }
            w.shared.clear_pending();
            if result.reactivate {
                self.ops[index] = op;
            } else {
                self.active_wake_ups.retain(|&i| i != index);
                self.ops.try_remove(index);
            }
        }
    }

    fn dispatch_callback(&mut self, op: &mut Op, res: io::Result<usize>) -> bool {
        match &mut op.kind {
            OpKind::LoopTimeout(t) => {
                let mut result = LoopTimeoutResult {
                    res: res.map(|_| ()),
                };
                (t.callback)(self, &mut result);
                false
            }
            OpKind::LoopWakeUp(_) => {
                // Wake-ups complete through execute_wake_ups.
                debug_assert!(false, "wake-up routed through generic completion");
                false
            }
            OpKind::ProcessExit(p) => {
                let mut result = ProcessExitResult {
                    res: res.map(|_| ()),
                    exit_code: p.exit_code,
                };
                (p.callback)(self, &mut result);
                false
            }
            OpKind::SocketAccept(a) => {
                let mut result = SocketAcceptResult {
                    res: res.map(|_| ()),
                    accepted: a.accepted.take(),
                    peer: a.peer.take(),
                    reactivate: false,
                };
                (a.callback)(self, &mut result);
                result.reactivate
            }
            OpKind::SocketConnect(c) => {
                let mut result = SocketConnectResult {
                    res: res.map(|_| ()),
                };
                (c.callback)(self, &mut result);
                false
            }
            OpKind::SocketSend(s) => {
                let mut result = SocketSendResult {
                    res,
                    buffer: s.buffer.take(),
                    reactivate: false,
                };
                (s.callback)(self, &mut result);
                s.buffer = result.buffer.take();
                result.reactivate
            }
            OpKind::SocketReceive(r) => {
                let mut result = SocketReceiveResult {
                    res,
                    buffer: r.buffer.take(),
                    reactivate: false,
                };
                (r.callback)(self, &mut result);
                r.buffer = result.buffer.take();
                result.reactivate
            }
            OpKind::SocketClose(c) => {
                let mut result = SocketCloseResult {
                    res: res.map(|_| ()),
                };
                (c.callback)(self, &mut result);
                false
            }
            OpKind::FileRead(r) => {
                let mut result = FileReadResult {
                    res,
                    buffer: r.buffer.take(),
                    reactivate: false,
                };
                (r.callback)(self, &mut result);
                r.buffer = result.buffer.take();
                result.reactivate
            }
            OpKind::FileWrite(w) => {
                let mut result = FileWriteResult {
                    res,
                    buffer: w.buffer.take(),
                    reactivate: false,
                };
                (w.callback)(self, &mut result);
                w.buffer = result.buffer.take();
                result.reactivate
            }
            OpKind::FileClose(c) => {
                let mut result = FileCloseResult {
                    res: res.map(|_| ()),
                };
                (c.callback)(self, &mut result);
                false
            }
            #[cfg(windows)]
            OpKind::NativePoll(p) => {
                let mut result = NativePollResult {
                    res: res.map(|_| ()),
                    reactivate: false,
                };
                (p.callback)(self, &mut result);
                result.reactivate
            }
            OpKind::Vacated => {
                debug_assert!(false, "completion of a vacated slot");
                false
            }
        }
    }

    fn take_op(&mut self, index: usize) -> Op {
        mem::replace(&mut self.ops[index], Op::vacated())
    }

    fn free_slot(&mut self, index: usize) {
        self.submissions.retain(|&i| i != index);
        self.manual_completions.retain(|&i| i != index);
        self.ops.try_remove(index);
    }
}

#[cfg(unix)]
fn raw_socket_fd(socket: &Socket) -> RawFd {
    use std::os::fd::AsRawFd;
    socket.as_raw_fd()
}

#[cfg(windows)]
fn raw_socket_fd(socket: &Socket) -> RawFd {
    use std::os::windows::io::AsRawSocket;
    socket.as_raw_socket() as RawFd
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, rc::Rc, time::Duration};

    use super::*;

    #[test]
    fn stop_on_unknown_id_is_not_active() {
        let mut ev = EventLoop::new().unwrap();
        let id = OpId {
            loop_id: ev.id,
            index: 42,
        };
        assert!(matches!(ev.stop(id), Err(Error::NotActive)));
    }

    #[test]
    fn stop_checks_the_owning_loop() {
        let mut first = EventLoop::new().unwrap();
        let mut second = EventLoop::new().unwrap();
        let id = first
            .start_loop_timeout(Duration::from_secs(10), |_, _| {})
            .unwrap();
        assert!(matches!(second.stop(id), Err(Error::WrongLoop)));
        first.stop(id).unwrap();
    }

    #[test]
    fn start_stop_round_trip_leaves_the_loop_idle() {
        let mut ev = EventLoop::new().unwrap();
        let id = ev
            .start_loop_timeout(Duration::from_secs(10), |_, _| {
                panic!("cancelled timer fired")
            })
            .unwrap();
        ev.stop(id).unwrap();
        assert_eq!(ev.total_active(), 0);
        assert!(ev.submissions.is_empty());
        assert_eq!(ev.ops.len(), 0);
        // Nothing left to wait for.
        ev.run().unwrap();
        assert!(matches!(ev.stop(id), Err(Error::NotActive)));
    }

    #[test]
    fn stop_of_an_armed_timer_is_acknowledged_next_step() {
        let mut ev = EventLoop::new().unwrap();
        let fired = Rc::new(Cell::new(false));
        let probe = fired.clone();
        let id = ev
            .start_loop_timeout(Duration::from_secs(10), move |_, _| probe.set(true))
            .unwrap();
        // Arm it.
        ev.step_nowait().unwrap();
        assert_eq!(ev.total_active(), 1);
        ev.stop(id).unwrap();
        assert!(matches!(ev.stop(id), Err(Error::AlreadyCancelling)));
        ev.step_nowait().unwrap();
        assert_eq!(ev.total_active(), 0);
        assert_eq!(ev.ops.len(), 0);
        assert!(!fired.get());
    }

    #[test]
    fn empty_buffers_are_rejected_at_start() {
        let mut ev = EventLoop::new().unwrap();
        let listener = ev.create_async_tcp_socket(AddressFamily::V4).unwrap();
        let fd = raw_socket_fd(&listener);
        assert!(matches!(
            ev.start_socket_send(fd, Vec::new(), |_, _| {}),
            Err(Error::InvalidArgument)
        ));
        assert!(matches!(
            ev.start_socket_receive(fd, Vec::new(), |_, _| {}),
            Err(Error::InvalidArgument)
        ));
        assert!(matches!(
            ev.start_file_read(fd, 0, Vec::new(), |_, _| {}),
            Err(Error::InvalidArgument)
        ));
        assert!(matches!(
            ev.start_file_write(fd, 0, Vec::new(), |_, _| {}),
            Err(Error::InvalidArgument)
        ));
    }

    #[test]
    fn callbacks_may_start_follow_up_operations() {
        let mut ev = EventLoop::new().unwrap();
        let chained = Rc::new(Cell::new(0u32));
        let probe = chained.clone();
        ev.start_loop_timeout(Duration::from_millis(1), move |ev, _| {
            let probe = probe.clone();
            ev.start_loop_timeout(Duration::from_millis(1), move |_, _| {
                probe.set(probe.get() + 1);
            })
            .unwrap();
        })
        .unwrap();
        ev.run().unwrap();
        assert_eq!(chained.get(), 1);
    }
}
