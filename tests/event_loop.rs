use std::{
    cell::{Cell, RefCell},
    rc::Rc,
    sync::Arc,
    thread,
    time::Duration,
};

use evio::{AddressFamily, Error, EventLoop, EventObject};

#[test]
fn timeout_fires_in_expiry_order_across_steps() {
    let mut ev = EventLoop::new().unwrap();
    let first = Rc::new(Cell::new(0u32));
    let second = Rc::new(Cell::new(0u32));
    let probe = first.clone();
    ev.start_loop_timeout(Duration::from_millis(1), move |_, res| {
        assert!(res.is_ok());
        probe.set(probe.get() + 1);
    })
    .unwrap();
    let probe = second.clone();
    ev.start_loop_timeout(Duration::from_millis(200), move |_, res| {
        assert!(res.is_ok());
        probe.set(probe.get() + 1);
    })
    .unwrap();

    ev.step_once().unwrap();
    assert_eq!(first.get(), 1);
    assert_eq!(second.get(), 0);

    ev.step_once().unwrap();
    assert_eq!(first.get(), 1);
    assert_eq!(second.get(), 1);
}

#[test]
fn timers_expired_in_one_step_fire_in_order() {
    let mut ev = EventLoop::new().unwrap();
    let order = Rc::new(RefCell::new(Vec::new()));
    let probe = order.clone();
    ev.start_loop_timeout(Duration::from_millis(1), move |_, _| {
        probe.borrow_mut().push("near");
    })
    .unwrap();
    let probe = order.clone();
    ev.start_loop_timeout(Duration::from_millis(5), move |_, _| {
        probe.borrow_mut().push("far");
    })
    .unwrap();

    // Let both expire before the step sees them.
    thread::sleep(Duration::from_millis(20));
    ev.step_once().unwrap();
    assert_eq!(*order.borrow(), ["near", "far"]);
}

#[test]
fn timer_callback_can_rearm() {
    let mut ev = EventLoop::new().unwrap();
    let ticks = Rc::new(Cell::new(0u32));
    let probe = ticks.clone();
    ev.start_loop_timeout(Duration::from_millis(1), move |ev, _| {
        probe.set(probe.get() + 1);
        if probe.get() < 3 {
            let probe = probe.clone();
            ev.start_loop_timeout(Duration::from_millis(1), move |_, _| {
                probe.set(probe.get() + 1);
            })
            .unwrap();
        }
    })
    .unwrap();
    ev.run().unwrap();
    assert_eq!(ticks.get(), 2);
}

#[test]
fn wake_up_runs_callback_on_the_loop_thread() {
    let mut ev = EventLoop::new().unwrap();
    let observed = Rc::new(RefCell::new(None));
    let probe = observed.clone();
    let (_id, handle) = ev
        .start_loop_wake_up(None, move |_, res| {
            assert!(res.is_ok());
            *probe.borrow_mut() = Some(thread::current().id());
        })
        .unwrap();
    // Arm the wake-up before the external thread signals it.
    ev.step_nowait().unwrap();

    let waker = thread::spawn(move || handle.wake().unwrap());
    waker.join().unwrap();

    ev.step_once().unwrap();
    assert_eq!(*observed.borrow(), Some(thread::current().id()));
}

#[test]
fn concurrent_wakes_coalesce_into_one_callback() {
    let mut ev = EventLoop::new().unwrap();
    let invoked = Rc::new(Cell::new(0u32));
    let probe = invoked.clone();
    let (_id, handle) = ev
        .start_loop_wake_up(None, move |_, _| {
            probe.set(probe.get() + 1);
        })
        .unwrap();
    ev.step_nowait().unwrap();

    let first = {
        let handle = handle.clone();
        thread::spawn(move || handle.wake().unwrap())
    };
    let second = thread::spawn(move || handle.wake().unwrap());
    first.join().unwrap();
    second.join().unwrap();

    ev.step_once().unwrap();
    assert_eq!(invoked.get(), 1);
}

#[test]
fn wake_up_signals_the_event_object() {
    let mut ev = EventLoop::new().unwrap();
    let event = Arc::new(EventObject::new());
    let (_id, handle) = ev
        .start_loop_wake_up(Some(event.clone()), |_, _| {})
        .unwrap();
    ev.step_nowait().unwrap();

    let waiter = thread::spawn(move || {
        handle.wake().unwrap();
        event.wait();
    });

    ev.step_once().unwrap();
    waiter.join().unwrap();
}

#[test]
fn wake_up_can_disarm_itself() {
    let mut ev = EventLoop::new().unwrap();
    let invoked = Rc::new(Cell::new(0u32));
    let probe = invoked.clone();
    let (_id, handle) = ev
        .start_loop_wake_up(None, move |_, res| {
            probe.set(probe.get() + 1);
            res.reactivate(false);
        })
        .unwrap();
    ev.step_nowait().unwrap();
    handle.wake().unwrap();
    ev.step_once().unwrap();
    assert_eq!(invoked.get(), 1);
    // Disarmed: the loop has nothing left to run.
    ev.run().unwrap();
}

#[cfg(unix)]
mod unix {
    use std::{io::Write, net::SocketAddr, os::fd::AsRawFd, process::Command};

    use evio::Socket;

    use super::*;

    fn listening_socket(ev: &mut EventLoop) -> (Socket, SocketAddr) {
        let listener = ev.create_async_tcp_socket(AddressFamily::V4).unwrap();
        let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
        listener.bind(&any.into()).unwrap();
        listener.listen(8).unwrap();
        let local = listener.local_addr().unwrap().as_socket().unwrap();
        (listener, local)
    }

    #[test]
    fn accept_delivers_connections_in_order() {
        let mut ev = EventLoop::new().unwrap();
        let (listener, addr) = listening_socket(&mut ev);
        let accepted = Rc::new(RefCell::new(Vec::new()));
        let probe = accepted.clone();
        ev.start_socket_accept(listener.as_raw_fd(), AddressFamily::V4, move |_, res| {
            assert!(res.is_ok(), "accept failed: {:?}", res.error());
            probe.borrow_mut().push(res.take_socket().unwrap());
            res.reactivate(true);
        })
        .unwrap();

        let _c1 = std::net::TcpStream::connect(addr).unwrap();
        let _c2 = std::net::TcpStream::connect(addr).unwrap();

        ev.step_once().unwrap();
        ev.step_once().unwrap();
        assert_eq!(accepted.borrow().len(), 2);
    }

    #[test]
    fn send_and_receive_echo_one_byte() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        client.set_nonblocking(true).unwrap();
        server.set_nonblocking(true).unwrap();

        let mut ev = EventLoop::new().unwrap();
        let sent = Rc::new(Cell::new(false));
        let probe = sent.clone();
        ev.start_socket_send(client.as_raw_fd(), vec![0x7b], move |_, res| {
            assert!(res.is_ok(), "send failed: {:?}", res.error());
            assert_eq!(res.bytes_sent(), 1);
            probe.set(true);
        })
        .unwrap();
        ev.step_once().unwrap();
        assert!(sent.get());

        let received = Rc::new(RefCell::new(Vec::new()));
        let probe = received.clone();
        ev.start_socket_receive(server.as_raw_fd(), vec![0u8; 1], move |_, res| {
            assert!(res.is_ok(), "receive failed: {:?}", res.error());
            assert!(!res.peer_closed());
            probe.borrow_mut().extend_from_slice(res.data());
        })
        .unwrap();
        ev.step_once().unwrap();
        assert_eq!(*received.borrow(), [0x7b]);
    }

    #[test]
    fn receive_reports_peer_close_as_empty() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        drop(client);

        let mut ev = EventLoop::new().unwrap();
        let closed = Rc::new(Cell::new(false));
        let probe = closed.clone();
        ev.start_socket_receive(server.as_raw_fd(), vec![0u8; 8], move |_, res| {
            assert!(res.is_ok());
            assert!(res.peer_closed());
            assert!(res.data().is_empty());
            probe.set(true);
        })
        .unwrap();
        ev.step_once().unwrap();
        assert!(closed.get());
    }

    #[test]
    fn connect_reaches_a_listening_socket() {
        let mut ev = EventLoop::new().unwrap();
        let (_listener, addr) = listening_socket(&mut ev);
        let socket = ev.create_async_tcp_socket(AddressFamily::V4).unwrap();
        let connected = Rc::new(Cell::new(false));
        let probe = connected.clone();
        ev.start_socket_connect(socket.as_raw_fd(), addr.into(), move |_, res| {
            assert!(res.is_ok(), "connect failed: {:?}", res.error());
            probe.set(true);
        })
        .unwrap();
        ev.run().unwrap();
        assert!(connected.get());
    }

    #[test]
    fn file_write_then_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload");

        let mut ev = EventLoop::new().unwrap();
        {
            let file = std::fs::File::create(&path).unwrap();
            let written = Rc::new(Cell::new(0usize));
            let probe = written.clone();
            ev.start_file_write(file.as_raw_fd(), 0, b"test".to_vec(), move |_, res| {
                assert!(res.is_ok(), "write failed: {:?}", res.error());
                probe.set(res.bytes_written());
            })
            .unwrap();
            ev.step_once().unwrap();
            assert_eq!(written.get(), 4);
        }

        let file = std::fs::File::open(&path).unwrap();
        let contents = Rc::new(RefCell::new(Vec::new()));
        let probe = contents.clone();
        ev.start_file_read(file.as_raw_fd(), 0, vec![0u8; 4], move |_, res| {
            assert!(res.is_ok(), "read failed: {:?}", res.error());
            assert!(!res.end_of_file());
            probe.borrow_mut().extend_from_slice(res.data());
        })
        .unwrap();
        ev.step_once().unwrap();
        assert_eq!(*contents.borrow(), b"test");
    }

    #[test]
    fn file_read_past_the_end_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(b"ab").unwrap();
        let file = std::fs::File::open(&path).unwrap();

        let mut ev = EventLoop::new().unwrap();
        let eof = Rc::new(Cell::new(false));
        let probe = eof.clone();
        ev.start_file_read(file.as_raw_fd(), 16, vec![0u8; 4], move |_, res| {
            assert!(res.is_ok());
            assert!(res.end_of_file());
            probe.set(true);
        })
        .unwrap();
        ev.step_once().unwrap();
        assert!(eof.get());
    }

    #[test]
    fn stopping_an_armed_accept_keeps_the_listener_usable() {
        let mut ev = EventLoop::new().unwrap();
        let (listener, addr) = listening_socket(&mut ev);
        let id = ev
            .start_socket_accept(listener.as_raw_fd(), AddressFamily::V4, |_, _| {
                panic!("cancelled accept fired")
            })
            .unwrap();
        // Arm it, then cancel before any connection shows up.
        ev.step_nowait().unwrap();
        ev.stop(id).unwrap();
        ev.step_nowait().unwrap();
        assert!(matches!(ev.stop(id), Err(Error::NotActive)));
        // The loop is idle again.
        ev.run().unwrap();

        // The listener still accepts.
        let accepted = Rc::new(Cell::new(0u32));
        let probe = accepted.clone();
        ev.start_socket_accept(listener.as_raw_fd(), AddressFamily::V4, move |_, res| {
            assert!(res.is_ok());
            probe.set(probe.get() + 1);
        })
        .unwrap();
        let _client = std::net::TcpStream::connect(addr).unwrap();
        ev.step_once().unwrap();
        assert_eq!(accepted.get(), 1);
    }

    #[test]
    fn socket_close_completes_without_kernel_wait() {
        let mut ev = EventLoop::new().unwrap();
        let socket = ev.create_async_tcp_socket(AddressFamily::V4).unwrap();
        let fd = socket.as_raw_fd();
        // The operation owns the descriptor from here on.
        std::mem::forget(socket);
        let closed = Rc::new(Cell::new(false));
        let probe = closed.clone();
        ev.start_socket_close(fd, move |_, res| {
            assert!(res.is_ok());
            probe.set(true);
        })
        .unwrap();
        ev.step_nowait().unwrap();
        assert!(closed.get());
    }

    #[test]
    fn process_exit_reports_the_exit_code() {
        let child = Command::new("/bin/sh")
            .arg("-c")
            .arg("exit 7")
            .spawn()
            .unwrap();
        let pid = child.id() as evio::ProcessHandle;

        let mut ev = EventLoop::new().unwrap();
        let code = Rc::new(Cell::new(None));
        let probe = code.clone();
        ev.start_process_exit(pid, move |_, res| {
            assert!(res.is_ok(), "process exit failed: {:?}", res.error());
            probe.set(res.exit_code());
        })
        .unwrap();
        ev.run().unwrap();
        assert_eq!(code.get(), Some(7));
    }
}
