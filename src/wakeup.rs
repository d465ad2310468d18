//! Cross-thread wake-ups.
//!
//! The only loop entry points that are safe off the loop thread live here:
//! [`WakeUpHandle::wake`] and [`EventObject::wait`].

use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex,
    },
};

use crate::driver::NotifyHandle;

/// State shared between a started wake-up operation and its handles.
pub(crate) struct WakeShared {
    pending: AtomicBool,
    notifier: NotifyHandle,
}

impl WakeShared {
    pub(crate) fn new(notifier: NotifyHandle) -> Self {
        Self {
            pending: AtomicBool::new(false),
            notifier,
        }
    }

    /// Whether a wake has been requested since the flag was last cleared.
    pub(crate) fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Clear the pending flag on the loop thread, allowing the next wake to
    /// interrupt the loop again. Called after the callback and event-object
    /// signal; wakes arriving in between coalesce into the invocation that
    /// just ran.
    pub(crate) fn clear_pending(&self) {
        self.pending.swap(false, Ordering::AcqRel);
    }
}

/// Thread-safe handle to a started wake-up operation.
///
/// Obtained from [`EventLoop::start_loop_wake_up`]; may be cloned and moved
/// to any thread.
///
/// [`EventLoop::start_loop_wake_up`]: crate::EventLoop::start_loop_wake_up
#[derive(Clone)]
pub struct WakeUpHandle {
    shared: Arc<WakeShared>,
}

impl WakeUpHandle {
    pub(crate) fn new(shared: Arc<WakeShared>) -> Self {
        Self { shared }
    }

    /// Schedule the wake-up's callback to run on the loop thread.
    ///
    /// Concurrent calls coalesce: whoever flips the pending flag performs the
    /// single loop interrupt, everybody else returns success without kernel
    /// work. The call happens-before the next invocation of the wake-up's
    /// callback.
    pub fn wake(&self) -> io::Result<()> {
        if !self.shared.pending.swap(true, Ordering::AcqRel) {
            self.shared.notifier.notify()?;
        }
        Ok(())
    }
}

/// An auto-reset event other threads can block on to learn that a wake-up
/// callback has run.
///
/// Pass one to [`EventLoop::start_loop_wake_up`]; the loop signals it after
/// each callback invocation.
///
/// [`EventLoop::start_loop_wake_up`]: crate::EventLoop::start_loop_wake_up
#[derive(Default)]
pub struct EventObject {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl EventObject {
    /// Create an unsignaled event.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal the event, releasing one waiter.
    pub fn signal(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        *signaled = true;
        self.cond.notify_one();
    }

    /// Block until the event is signaled, then reset it.
    pub fn wait(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        while !*signaled {
            signaled = self.cond.wait(signaled).unwrap();
        }
        *signaled = false;
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Duration};

    use super::*;

    #[test]
    fn event_object_round_trip() {
        let event = Arc::new(EventObject::new());
        let signaller = event.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            signaller.signal();
        });
        event.wait();
        handle.join().unwrap();
    }

    #[test]
    fn event_object_resets_after_wait() {
        let event = EventObject::new();
        event.signal();
        event.wait();
        assert!(!*event.signaled.lock().unwrap());
    }
}
