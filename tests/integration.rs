//! End-to-end tests driving real `Socket`/`Reactor`/`UdpMultiplexer`
//! pairs over loopback UDP, the way the teacher's own `sockets`/`net`
//! tests drove real sockets rather than mocking the transport.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use utp_machines::{Error, Reactor, Socket, UdpMultiplexer};

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

#[test]
fn binding_to_port_zero_yields_a_distinct_local_endpoint() {
    let reactor = Reactor::new().unwrap();
    let mut a = Socket::new();
    let mut b = Socket::new();
    a.bind(&reactor, loopback()).unwrap();
    b.bind(&reactor, loopback()).unwrap();
    let ea = a.local_endpoint().unwrap();
    let eb = b.local_endpoint().unwrap();
    assert_ne!(ea.port(), 0);
    assert_ne!(eb.port(), 0);
    assert_ne!(ea, eb);
}

#[test]
fn connect_accept_and_a_small_exchange() {
    let reactor = Reactor::new().unwrap();

    let mut server = Socket::new();
    server.bind(&reactor, loopback()).unwrap();
    let server_addr = server.local_endpoint().unwrap();

    let mut client = Socket::new();
    client.bind(&reactor, loopback()).unwrap();

    let accepted: Rc<RefCell<Option<Socket>>> = Rc::new(RefCell::new(None));
    {
        let accepted = accepted.clone();
        server
            .accept(move |result| {
                *accepted.borrow_mut() = Some(result.expect("accept should succeed"));
            })
            .unwrap();
    }

    let connected = Rc::new(RefCell::new(false));
    {
        let connected = connected.clone();
        client
            .connect(server_addr, move |result| {
                result.expect("connect should succeed");
                *connected.borrow_mut() = true;
            })
            .unwrap();
    }

    let deadline = Duration::from_secs(5);
    let ok = reactor.run_for(deadline, || *connected.borrow() && accepted.borrow().is_some());
    assert!(ok, "connect/accept did not complete in time");

    let mut server_side = accepted.borrow_mut().take().unwrap();

    let received = Rc::new(RefCell::new(None));
    {
        let received = received.clone();
        server_side
            .read_some(1024, move |result| {
                *received.borrow_mut() = Some(result.expect("read should succeed"));
            })
            .unwrap();
    }

    let wrote = Rc::new(RefCell::new(false));
    {
        let wrote = wrote.clone();
        client
            .write_some(b"hello uTP".to_vec(), move |result| {
                assert_eq!(result.unwrap(), 9);
                *wrote.borrow_mut() = true;
            })
            .unwrap();
    }

    let ok = reactor.run_for(deadline, || *wrote.borrow() && received.borrow().is_some());
    assert!(ok, "write/read did not complete in time");
    assert_eq!(received.borrow_mut().take().unwrap(), b"hello uTP".to_vec());
}

#[test]
fn a_write_larger_than_one_read_arrives_in_chunks() {
    let reactor = Reactor::new().unwrap();

    let mut server = Socket::new();
    server.bind(&reactor, loopback()).unwrap();
    let server_addr = server.local_endpoint().unwrap();

    let mut client = Socket::new();
    client.bind(&reactor, loopback()).unwrap();

    let accepted: Rc<RefCell<Option<Socket>>> = Rc::new(RefCell::new(None));
    {
        let accepted = accepted.clone();
        server.accept(move |r| *accepted.borrow_mut() = Some(r.unwrap())).unwrap();
    }
    let connected = Rc::new(RefCell::new(false));
    {
        let connected = connected.clone();
        client.connect(server_addr, move |r| { r.unwrap(); *connected.borrow_mut() = true; }).unwrap();
    }
    let ok = reactor.run_for(Duration::from_secs(5), || *connected.borrow() && accepted.borrow().is_some());
    assert!(ok);
    let mut server_side = accepted.borrow_mut().take().unwrap();

    let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
    let wrote = Rc::new(RefCell::new(false));
    {
        let wrote = wrote.clone();
        let expected_len = payload.len();
        client
            .write_some(payload.clone(), move |result| {
                assert_eq!(result.unwrap(), expected_len);
                *wrote.borrow_mut() = true;
            })
            .unwrap();
    }

    let collected: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    let pending = Rc::new(RefCell::new(false));
    let target = payload.len();
    let ok = reactor.run_for(Duration::from_secs(10), || {
        if collected.borrow().len() < target && !*pending.borrow() {
            *pending.borrow_mut() = true;
            let collected = collected.clone();
            let pending = pending.clone();
            server_side
                .read_some(4096, move |result| {
                    *pending.borrow_mut() = false;
                    if let Ok(bytes) = result {
                        collected.borrow_mut().extend_from_slice(&bytes);
                    }
                })
                .unwrap();
        }
        *wrote.borrow() && collected.borrow().len() >= target
    });
    assert!(ok, "did not receive the full payload in time");
    assert_eq!(*collected.borrow(), payload);
}

#[test]
fn two_streams_share_one_bound_endpoint() {
    let reactor = Reactor::new().unwrap();

    let mut server = Socket::new();
    server.bind(&reactor, loopback()).unwrap();
    let server_addr = server.local_endpoint().unwrap();

    let multiplexer = UdpMultiplexer::bind(&reactor, loopback()).unwrap();
    let mut client_a = Socket::new();
    client_a.bind_multiplexer(&reactor, &multiplexer).unwrap();
    let mut client_b = Socket::new();
    client_b.bind_multiplexer(&reactor, &multiplexer).unwrap();
    assert_eq!(client_a.local_endpoint().unwrap(), client_b.local_endpoint().unwrap());

    let accepted_count = Rc::new(RefCell::new(0u32));
    for _ in 0..2 {
        let accepted_count = accepted_count.clone();
        server
            .accept(move |result| {
                result.expect("accept should succeed");
                *accepted_count.borrow_mut() += 1;
            })
            .unwrap();
    }

    let connected_count = Rc::new(RefCell::new(0u32));
    {
        let connected_count = connected_count.clone();
        client_a.connect(server_addr, move |r| { r.unwrap(); *connected_count.borrow_mut() += 1; }).unwrap();
    }
    {
        let connected_count = connected_count.clone();
        client_b.connect(server_addr, move |r| { r.unwrap(); *connected_count.borrow_mut() += 1; }).unwrap();
    }

    let ok = reactor.run_for(Duration::from_secs(5), || {
        *connected_count.borrow() == 2 && *accepted_count.borrow() == 2
    });
    assert!(ok, "both connections over the shared endpoint should complete");
}

#[test]
fn server_side_close_delivers_eof_to_the_client() {
    let reactor = Reactor::new().unwrap();

    let mut server = Socket::new();
    server.bind(&reactor, loopback()).unwrap();
    let server_addr = server.local_endpoint().unwrap();
    let mut client = Socket::new();
    client.bind(&reactor, loopback()).unwrap();

    let accepted: Rc<RefCell<Option<Socket>>> = Rc::new(RefCell::new(None));
    {
        let accepted = accepted.clone();
        server.accept(move |r| *accepted.borrow_mut() = Some(r.unwrap())).unwrap();
    }
    let connected = Rc::new(RefCell::new(false));
    {
        let connected = connected.clone();
        client.connect(server_addr, move |r| { r.unwrap(); *connected.borrow_mut() = true; }).unwrap();
    }
    let ok = reactor.run_for(Duration::from_secs(5), || *connected.borrow() && accepted.borrow().is_some());
    assert!(ok);
    let mut server_side = accepted.borrow_mut().take().unwrap();
    server_side.close();

    let reset_seen = Rc::new(RefCell::new(false));
    {
        let reset_seen = reset_seen.clone();
        client
            .read_some(64, move |result| {
                assert!(matches!(result, Err(Error::ConnectionReset) | Err(Error::ConnectionAborted)));
                *reset_seen.borrow_mut() = true;
            })
            .unwrap();
    }

    let ok = reactor.run_for(Duration::from_secs(5), || *reset_seen.borrow());
    assert!(ok, "client should observe the server's close");
}

#[test]
fn closing_an_acceptor_before_any_connect_is_harmless() {
    let reactor = Reactor::new().unwrap();
    let mut server = Socket::new();
    server.bind(&reactor, loopback()).unwrap();

    let aborted = Rc::new(RefCell::new(None));
    {
        let aborted = aborted.clone();
        server
            .accept(move |result| {
                *aborted.borrow_mut() = Some(result);
            })
            .unwrap();
    }
    server.close();
    assert!(!server.is_open());

    let ok = reactor.run_for(Duration::from_millis(100), || aborted.borrow().is_some());
    assert!(ok, "the pending accept should complete immediately on close");
    match aborted.borrow_mut().take().unwrap() {
        Err(Error::OperationAborted) => {}
        other => panic!("expected Err(Error::OperationAborted), got {:?}", other.map(|_| ())),
    }
}
