//! The platform-specified kernel queue.
//!
//! One back-end per platform behind a single contract: IOCP on windows
//! (completion based), the `polling` crate (epoll/kqueue) everywhere else
//! (readiness based). The loop controller only sees `KernelQueue`,
//! `CompletionEvent` and [`Activation`]; everything kernel-flavored stays in
//! here.
//!
//! Some types differ by compilation target.

cfg_if::cfg_if! {
    if #[cfg(windows)] {
        mod iocp;
        pub use iocp::{AsRawFd, FromRawFd, IntoRawFd, ProcessHandle, RawFd};
        pub(crate) use iocp::*;
    } else {
        mod poll;
        pub use poll::{AsRawFd, ProcessHandle, RawFd};
        pub(crate) use poll::*;
    }
}

/// What `activate` did with an operation.
pub(crate) enum Activation {
    /// Published to the kernel; a completion event will deliver the result.
    Kernel,
    /// Completed without kernel involvement; the result is parked on the
    /// operation and drained from the manual-completion queue.
    Manual,
}
