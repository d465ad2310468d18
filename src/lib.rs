//! Callback based async event loop.
//!
//! `evio` multiplexes timers, cross-thread wake-ups, process-exit
//! notifications, TCP socket operations and positional file I/O onto a
//! single kernel queue per platform: IOCP on windows, epoll/kqueue (through
//! the `polling` crate) everywhere else.
//!
//! Every request is bound to a completion callback. Start operations on an
//! [`EventLoop`], then drive it:
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use evio::EventLoop;
//!
//! # fn main() -> evio::Result<()> {
//! let mut ev = EventLoop::new()?;
//! ev.start_loop_timeout(Duration::from_millis(200), |_ev, _res| {
//!     println!("tick");
//! })?;
//! ev.run()
//! # }
//! ```
//!
//! The loop is single-threaded: all starts, stops and callbacks happen on
//! the loop thread. The only cross-thread entry points are
//! [`WakeUpHandle::wake`] and [`EventObject::wait`].

#![warn(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

mod driver;
mod error;
mod event_loop;
#[doc(hidden)]
pub mod log;
pub mod op;
mod time;
mod timer;
mod wakeup;

pub use driver::{AsRawFd, ProcessHandle, RawFd};
#[cfg(windows)]
pub use driver::{FromRawFd, IntoRawFd};
pub use error::{Error, Result};
pub use event_loop::EventLoop;
#[doc(no_inline)]
pub use socket2::{SockAddr, Socket};
pub use wakeup::{EventObject, WakeUpHandle};

pub use crate::op::{AddressFamily, OpId};

/// Helper macro to execute a system call
#[cfg(unix)]
#[macro_export]
#[doc(hidden)]
macro_rules! syscall {
    (break $e:expr) => {
        loop {
            match $crate::syscall!($e) {
                Ok(fd) => break ::std::task::Poll::Ready(Ok(fd as usize)),
                Err(e) if e.kind() == ::std::io::ErrorKind::WouldBlock || e.raw_os_error() == Some(::libc::EINPROGRESS)
                    => break ::std::task::Poll::Pending,
                Err(e) if e.kind() == ::std::io::ErrorKind::Interrupted => {},
                Err(e) => break ::std::task::Poll::Ready(Err(e)),
            }
        }
    };
    ($e:expr) => {{
        #[allow(unused_unsafe)]
        let res = unsafe { $e };
        if res == -1 {
            Err(::std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

#[cfg(windows)]
#[macro_export]
#[doc(hidden)]
macro_rules! syscall {
    (BOOL, $e:expr) => {
        $crate::syscall!($e, == 0)
    };
    (SOCKET, $e:expr) => {
        $crate::syscall!($e, != 0)
    };
    (HANDLE, $e:expr) => {
        $crate::syscall!($e, == ::windows_sys::Win32::Foundation::INVALID_HANDLE_VALUE)
    };
    ($e:expr, $op: tt $rhs: expr) => {{
        #[allow(unused_unsafe)]
        let res = unsafe { $e };
        if res $op $rhs {
            Err(::std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}
