//! Per-variant syscalls of the readiness back-end.

use std::{io, os::fd::FromRawFd, task::Poll};
#[cfg(not(has_accept4))]
use std::os::fd::IntoRawFd;

#[cfg(any(target_os = "android", target_os = "linux"))]
use libc::{pread64 as pread, pwrite64 as pwrite};
#[cfg(not(any(target_os = "android", target_os = "linux")))]
use libc::{pread, pwrite};
use socket2::{SockAddr, Socket};

use super::{Decision, Interest, ProcessHandle, RawFd, WaitArg};
use crate::{
    op::{
        FileClose, FileRead, FileWrite, SocketAccept, SocketClose, SocketConnect, SocketReceive,
        SocketSend,
    },
    syscall,
};

fn decide(outcome: Poll<io::Result<usize>>, wait: WaitArg) -> Decision {
    match outcome {
        Poll::Pending => Decision::Wait(wait),
        Poll::Ready(res) => Decision::Complete(res),
    }
}

#[cfg(msg_nosignal)]
fn send_flags() -> libc::c_int {
    libc::MSG_NOSIGNAL
}

#[cfg(not(msg_nosignal))]
fn send_flags() -> libc::c_int {
    0
}

impl SocketAccept {
    pub(crate) fn attempt(&mut self) -> Decision {
        let wait = WaitArg {
            fd: self.fd,
            interest: Interest::Readable,
        };
        decide(self.on_ready(), wait)
    }

    pub(crate) fn on_ready(&mut self) -> Poll<io::Result<usize>> {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut addr_len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        match Self::call_accept(self.fd, &mut storage, &mut addr_len) {
            Poll::Ready(Ok(fd)) => {
                self.accepted = Some(unsafe { Socket::from_raw_fd(fd as RawFd) });
                self.peer = Some(unsafe { SockAddr::new(storage, addr_len) });
                Poll::Ready(Ok(0))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }

    #[cfg(has_accept4)]
    fn call_accept(
        fd: RawFd,
        storage: &mut libc::sockaddr_storage,
        addr_len: &mut libc::socklen_t,
    ) -> Poll<io::Result<usize>> {
        syscall!(break libc::accept4(
            fd,
            storage as *mut _ as *mut _,
            addr_len,
            libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
        ))
    }

    #[cfg(not(has_accept4))]
    fn call_accept(
        fd: RawFd,
        storage: &mut libc::sockaddr_storage,
        addr_len: &mut libc::socklen_t,
    ) -> Poll<io::Result<usize>> {
        match syscall!(break libc::accept(fd, storage as *mut _ as *mut _, addr_len)) {
            Poll::Ready(Ok(fd)) => {
                let socket = unsafe { Socket::from_raw_fd(fd as RawFd) };
                if let Err(e) = socket
                    .set_cloexec(true)
                    .and_then(|_| socket.set_nonblocking(true))
                {
                    return Poll::Ready(Err(e));
                }
                Poll::Ready(Ok(socket.into_raw_fd() as usize))
            }
            other => other,
        }
    }
}

impl SocketConnect {
    pub(crate) fn attempt(&mut self) -> Decision {
        let wait = WaitArg {
            fd: self.fd,
            interest: Interest::Writable,
        };
        let outcome = syscall!(break libc::connect(
            self.fd,
            self.addr.as_ptr().cast(),
            self.addr.len(),
        ));
        decide(outcome, wait)
    }

    /// The socket became writable; the handshake outcome is in `SO_ERROR`.
    pub(crate) fn on_ready(&mut self) -> Poll<io::Result<usize>> {
        let mut err: libc::c_int = 0;
        let mut err_len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        if let Err(e) = syscall!(libc::getsockopt(
            self.fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut _,
            &mut err_len,
        )) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(if err == 0 {
            Ok(0)
        } else {
            Err(io::Error::from_raw_os_error(err))
        })
    }
}

impl SocketSend {
    pub(crate) fn attempt(&mut self) -> Decision {
        let wait = WaitArg {
            fd: self.fd,
            interest: Interest::Writable,
        };
        decide(self.on_ready(), wait)
    }

    pub(crate) fn on_ready(&mut self) -> Poll<io::Result<usize>> {
        let Some(buffer) = self.buffer.as_ref() else {
            return Poll::Ready(Err(crate::Error::InvalidArgument.into()));
        };
        syscall!(break libc::send(
            self.fd,
            buffer.as_ptr().cast(),
            buffer.len(),
            send_flags(),
        ))
    }
}

impl SocketReceive {
    pub(crate) fn attempt(&mut self) -> Decision {
        let wait = WaitArg {
            fd: self.fd,
            interest: Interest::Readable,
        };
        decide(self.on_ready(), wait)
    }

    pub(crate) fn on_ready(&mut self) -> Poll<io::Result<usize>> {
        let Some(buffer) = self.buffer.as_mut() else {
            return Poll::Ready(Err(crate::Error::InvalidArgument.into()));
        };
        syscall!(break libc::recv(
            self.fd,
            buffer.as_mut_ptr().cast(),
            buffer.len(),
            0,
        ))
    }
}

impl SocketClose {
    pub(crate) fn close(&mut self) -> io::Result<usize> {
        syscall!(libc::close(self.fd)).map(|_| 0)
    }
}

impl FileClose {
    pub(crate) fn close(&mut self) -> io::Result<usize> {
        syscall!(libc::close(self.fd)).map(|_| 0)
    }
}

impl FileRead {
    pub(crate) fn attempt(&mut self) -> io::Result<usize> {
        let Some(buffer) = self.buffer.as_mut() else {
            return Err(crate::Error::InvalidArgument.into());
        };
        let read = syscall!(pread(
            self.fd,
            buffer.as_mut_ptr().cast(),
            buffer.len(),
            self.offset as _,
        ))?;
        Ok(read as usize)
    }
}

impl FileWrite {
    pub(crate) fn attempt(&mut self) -> io::Result<usize> {
        let Some(buffer) = self.buffer.as_ref() else {
            return Err(crate::Error::InvalidArgument.into());
        };
        let written = syscall!(pwrite(
            self.fd,
            buffer.as_ptr().cast(),
            buffer.len(),
            self.offset as _,
        ))?;
        Ok(written as usize)
    }
}

/// Collect the exit status of a child that is known to have exited.
pub(crate) fn reap_exit_code(pid: ProcessHandle) -> io::Result<i32> {
    let mut status = 0;
    syscall!(libc::waitpid(pid, &mut status, 0))?;
    if libc::WIFEXITED(status) {
        Ok(libc::WEXITSTATUS(status))
    } else if libc::WIFSIGNALED(status) {
        Ok(-libc::WTERMSIG(status))
    } else {
        Ok(-1)
    }
}
