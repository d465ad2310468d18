//! Per-variant native submissions of the completion back-end.

use std::{
    ffi::c_void,
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    os::windows::io::AsRawSocket,
    ptr::{null, null_mut},
    task::Poll,
};

use once_cell::sync::OnceCell;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use windows_sys::{
    core::GUID,
    Win32::{
        Foundation::{
            CloseHandle, GetLastError, BOOLEAN, ERROR_HANDLE_EOF, ERROR_IO_INCOMPLETE,
            ERROR_IO_PENDING, ERROR_NO_DATA,
        },
        Networking::WinSock::{
            bind, closesocket, setsockopt, WSAGetLastError, WSAIoctl, WSARecv, WSASend,
            LPFN_ACCEPTEX, LPFN_CONNECTEX, LPFN_GETACCEPTEXSOCKADDRS,
            SIO_GET_EXTENSION_FUNCTION_POINTER, SOCKADDR, SOCKADDR_STORAGE, SOL_SOCKET,
            SO_UPDATE_ACCEPT_CONTEXT, SO_UPDATE_CONNECT_CONTEXT, WSABUF, WSAEINVAL,
            WSAID_ACCEPTEX, WSAID_CONNECTEX, WSAID_GETACCEPTEXSOCKADDRS,
        },
        Storage::FileSystem::{ReadFile, WriteFile},
        System::{
            Threading::{
                GetExitCodeProcess, RegisterWaitForSingleObject, WT_EXECUTEINWAITTHREAD,
                WT_EXECUTEONLYONCE,
            },
            IO::{PostQueuedCompletionStatus, OVERLAPPED},
        },
    },
};

use super::{RawFd, ACCEPT_ADDR_BUFFER_SIZE};
use crate::{
    driver::WaitRegistration,
    op::{
        FileClose, FileRead, FileWrite, ProcessExit, SocketAccept, SocketClose, SocketConnect,
        SocketReceive, SocketSend,
    },
    syscall,
};

/// Interpret `GetLastError` after a native call reported failure.
#[inline]
unsafe fn winapi_result(transferred: u32) -> Poll<io::Result<usize>> {
    let error = GetLastError();
    match error {
        ERROR_IO_PENDING => Poll::Pending,
        ERROR_IO_INCOMPLETE | ERROR_HANDLE_EOF | ERROR_NO_DATA => {
            Poll::Ready(Ok(transferred as _))
        }
        _ => Poll::Ready(Err(io::Error::from_raw_os_error(error as _))),
    }
}

// Overlapped calls that succeed synchronously still queue a packet to the
// port, so a success here is reported as `Pending` and picked up with the
// packet; only outright submission failures resolve immediately.

#[inline]
unsafe fn win32_overlapped_result(res: i32) -> Poll<io::Result<usize>> {
    if res == 0 {
        winapi_result(0)
    } else {
        Poll::Pending
    }
}

#[inline]
unsafe fn winsock_overlapped_result(res: i32, transferred: u32) -> Poll<io::Result<usize>> {
    if res != 0 {
        winapi_result(transferred)
    } else {
        Poll::Pending
    }
}

unsafe fn get_wsa_fn<F>(handle: RawFd, fguid: GUID) -> io::Result<Option<F>> {
    let mut fptr = None;
    let mut returned = 0;
    syscall!(
        SOCKET,
        WSAIoctl(
            handle as _,
            SIO_GET_EXTENSION_FUNCTION_POINTER,
            std::ptr::addr_of!(fguid).cast(),
            std::mem::size_of_val(&fguid) as _,
            std::ptr::addr_of_mut!(fptr).cast(),
            std::mem::size_of::<F>() as _,
            &mut returned,
            null_mut(),
            None,
        )
    )?;
    Ok(fptr)
}

static ACCEPT_EX: OnceCell<LPFN_ACCEPTEX> = OnceCell::new();
static CONNECT_EX: OnceCell<LPFN_CONNECTEX> = OnceCell::new();
static GET_ADDRS: OnceCell<LPFN_GETACCEPTEXSOCKADDRS> = OnceCell::new();

impl SocketAccept {
    pub(crate) unsafe fn issue(&mut self, optr: *mut OVERLAPPED) -> Poll<io::Result<usize>> {
        if self.client.is_none() {
            match Socket::new(self.family.domain(), Type::STREAM, Some(Protocol::TCP)) {
                Ok(socket) => self.client = Some(socket),
                Err(e) => return Poll::Ready(Err(e)),
            }
        }
        let accept_fn = match ACCEPT_EX.get_or_try_init(|| get_wsa_fn(self.fd, WSAID_ACCEPTEX)) {
            Ok(Some(f)) => *f,
            Ok(None) => {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "cannot retrieve AcceptEx",
                )));
            }
            Err(e) => return Poll::Ready(Err(e)),
        };
        let client = self
            .client
            .as_ref()
            .map(|socket| socket.as_raw_socket() as usize)
            .unwrap_or_default();
        let mut received = 0;
        let res = accept_fn(
            self.fd as _,
            client,
            self.addr_buf.as_mut_ptr() as _,
            0,
            (ACCEPT_ADDR_BUFFER_SIZE / 2) as _,
            (ACCEPT_ADDR_BUFFER_SIZE / 2) as _,
            &mut received,
            optr,
        );
        win32_overlapped_result(res)
    }

    /// Adopt the accept context and extract the peer address.
    pub(crate) fn update_context(&mut self) -> io::Result<()> {
        let Some(client) = self.client.take() else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "no client socket to adopt",
            ));
        };
        syscall!(
            SOCKET,
            setsockopt(
                client.as_raw_socket() as _,
                SOL_SOCKET,
                SO_UPDATE_ACCEPT_CONTEXT,
                &self.fd as *const _ as _,
                std::mem::size_of_val(&self.fd) as _,
            )
        )?;
        client.set_nonblocking(true)?;
        self.peer = self.extract_peer().ok();
        self.accepted = Some(client);
        Ok(())
    }

    fn extract_peer(&mut self) -> io::Result<SockAddr> {
        let get_addrs_fn = GET_ADDRS
            .get_or_try_init(|| unsafe { get_wsa_fn(self.fd, WSAID_GETACCEPTEXSOCKADDRS) })?
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::Unsupported,
                    "cannot retrieve GetAcceptExSockAddrs",
                )
            })?;
        let mut local_addr: *mut SOCKADDR = null_mut();
        let mut local_addr_len = 0;
        let mut remote_addr: *mut SOCKADDR = null_mut();
        let mut remote_addr_len = 0;
        unsafe {
            get_addrs_fn(
                self.addr_buf.as_ptr() as _,
                0,
                (ACCEPT_ADDR_BUFFER_SIZE / 2) as _,
                (ACCEPT_ADDR_BUFFER_SIZE / 2) as _,
                &mut local_addr,
                &mut local_addr_len,
                &mut remote_addr,
                &mut remote_addr_len,
            );
        }
        Ok(unsafe { SockAddr::new(*remote_addr.cast::<SOCKADDR_STORAGE>(), remote_addr_len) })
    }
}

impl SocketConnect {
    pub(crate) unsafe fn issue(&mut self, optr: *mut OVERLAPPED) -> Poll<io::Result<usize>> {
        if let Err(e) = self.ensure_bound() {
            return Poll::Ready(Err(e));
        }
        let connect_fn = match CONNECT_EX.get_or_try_init(|| get_wsa_fn(self.fd, WSAID_CONNECTEX))
        {
            Ok(Some(f)) => *f,
            Ok(None) => {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "cannot retrieve ConnectEx",
                )));
            }
            Err(e) => return Poll::Ready(Err(e)),
        };
        let mut sent = 0;
        let res = connect_fn(
            self.fd as _,
            self.addr.as_ptr().cast(),
            self.addr.len(),
            null(),
            0,
            &mut sent,
            optr,
        );
        win32_overlapped_result(res)
    }

    // ConnectEx requires a bound socket.
    fn ensure_bound(&self) -> io::Result<()> {
        let local = if self.addr.domain() == Domain::IPV6 {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
        } else {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
        };
        let local = SockAddr::from(local);
        let res = unsafe { bind(self.fd as _, local.as_ptr().cast(), local.len()) };
        if res != 0 {
            let error = unsafe { WSAGetLastError() };
            if error == WSAEINVAL {
                return Ok(());
            }
            return Err(io::Error::from_raw_os_error(error));
        }
        Ok(())
    }

    pub(crate) fn update_context(&mut self) -> io::Result<()> {
        syscall!(
            SOCKET,
            setsockopt(
                self.fd as _,
                SOL_SOCKET,
                SO_UPDATE_CONNECT_CONTEXT,
                null(),
                0,
            )
        )?;
        Ok(())
    }
}

impl SocketSend {
    pub(crate) unsafe fn issue(&mut self, optr: *mut OVERLAPPED) -> Poll<io::Result<usize>> {
        let Some(buffer) = self.buffer.as_ref() else {
            return Poll::Ready(Err(crate::Error::InvalidArgument.into()));
        };
        let slice = WSABUF {
            len: buffer.len() as _,
            buf: buffer.as_ptr() as *mut _,
        };
        let mut sent = 0;
        let res = WSASend(self.fd as _, &slice, 1, &mut sent, 0, optr, None);
        winsock_overlapped_result(res, sent)
    }
}

impl SocketReceive {
    pub(crate) unsafe fn issue(&mut self, optr: *mut OVERLAPPED) -> Poll<io::Result<usize>> {
        let Some(buffer) = self.buffer.as_mut() else {
            return Poll::Ready(Err(crate::Error::InvalidArgument.into()));
        };
        let slice = WSABUF {
            len: buffer.len() as _,
            buf: buffer.as_mut_ptr(),
        };
        let mut flags = 0;
        let mut received = 0;
        let res = WSARecv(
            self.fd as _,
            &slice,
            1,
            &mut received,
            &mut flags,
            optr,
            None,
        );
        winsock_overlapped_result(res, received)
    }
}

impl FileRead {
    pub(crate) unsafe fn issue(&mut self, optr: *mut OVERLAPPED) -> Poll<io::Result<usize>> {
        let Some(buffer) = self.buffer.as_mut() else {
            return Poll::Ready(Err(crate::Error::InvalidArgument.into()));
        };
        if let Some(overlapped) = optr.as_mut() {
            overlapped.Anonymous.Anonymous.Offset = (self.offset & 0xFFFF_FFFF) as _;
            overlapped.Anonymous.Anonymous.OffsetHigh = (self.offset >> 32) as _;
        }
        let res = ReadFile(
            self.fd as _,
            buffer.as_mut_ptr() as _,
            buffer.len() as _,
            null_mut(),
            optr,
        );
        win32_overlapped_result(res)
    }
}

impl FileWrite {
    pub(crate) unsafe fn issue(&mut self, optr: *mut OVERLAPPED) -> Poll<io::Result<usize>> {
        let Some(buffer) = self.buffer.as_ref() else {
            return Poll::Ready(Err(crate::Error::InvalidArgument.into()));
        };
        if let Some(overlapped) = optr.as_mut() {
            overlapped.Anonymous.Anonymous.Offset = (self.offset & 0xFFFF_FFFF) as _;
            overlapped.Anonymous.Anonymous.OffsetHigh = (self.offset >> 32) as _;
        }
        let res = WriteFile(
            self.fd as _,
            buffer.as_ptr() as _,
            buffer.len() as _,
            null_mut(),
            optr,
        );
        win32_overlapped_result(res)
    }
}

impl SocketClose {
    pub(crate) fn close(&mut self) -> io::Result<usize> {
        syscall!(SOCKET, closesocket(self.fd as _)).map(|_| 0)
    }
}

impl FileClose {
    pub(crate) fn close(&mut self) -> io::Result<usize> {
        syscall!(BOOL, CloseHandle(self.fd as _)).map(|_| 0)
    }
}

/// Context handed to the registered-wait callback; posts the operation's
/// overlapped block back to the loop's port when the process exits.
pub(crate) struct WaitContext {
    port: isize,
    overlapped: *mut OVERLAPPED,
}

unsafe extern "system" fn wait_callback(context: *mut c_void, _timed_out: BOOLEAN) {
    let context = &*(context as *const WaitContext);
    PostQueuedCompletionStatus(context.port as _, 0, 0, context.overlapped);
}

impl ProcessExit {
    pub(crate) fn register(&mut self, port: isize, optr: *mut OVERLAPPED) -> io::Result<()> {
        let context = Box::new(WaitContext {
            port,
            overlapped: optr,
        });
        let mut wait = 0;
        syscall!(
            BOOL,
            RegisterWaitForSingleObject(
                &mut wait,
                self.process as _,
                Some(wait_callback),
                &*context as *const _ as _,
                windows_sys::Win32::System::Threading::INFINITE,
                WT_EXECUTEINWAITTHREAD | WT_EXECUTEONLYONCE,
            )
        )?;
        self.wait = Some(WaitRegistration::new(wait, context));
        Ok(())
    }

    pub(crate) fn unregister(&mut self) {
        self.wait = None;
    }

    pub(crate) fn query_exit_code(&self) -> io::Result<i32> {
        let mut code = 0;
        syscall!(BOOL, GetExitCodeProcess(self.process as _, &mut code))?;
        Ok(code as i32)
    }
}
