// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! End-to-end socket scenarios on loopback and Unix-domain transports.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rill_net::{
    read_until, with_timeout_read, write_all, IpEndpoint, LocalEndpoint, ShutdownHow,
    TcpAcceptor, TcpSocket, UdpSocket, UnixAcceptor, UnixStreamSocket,
};
use rill_rt::{sleep, spawn_detached, ErrorKind, Reactor};

fn loopback_ephemeral() -> IpEndpoint {
    IpEndpoint::from_string("127.0.0.1:0").unwrap()
}

#[test]
fn tcp_round_trip() {
    let reactor = Reactor::new().unwrap();
    let ex = reactor.executor();

    let acceptor = TcpAcceptor::bind(&ex, &loopback_ephemeral(), 128).unwrap();
    let server_ep = acceptor.local_endpoint().unwrap();
    assert_ne!(server_ep.port(), 0);

    // Echo one line back to the client.
    spawn_detached(&ex, async move {
        let sock = acceptor.accept().await.unwrap();
        let mut buf = Vec::new();
        let n = read_until(&sock, &mut buf, b'\n').await.unwrap();
        let mut written = 0;
        while written < n {
            written += sock.write_some(&buf[written..n]).await.unwrap();
        }
    });

    let got = Arc::new(Mutex::new(None));
    let got2 = got.clone();
    let ex2 = ex.clone();
    spawn_detached(&ex, async move {
        let client = TcpSocket::new(&ex2);
        client.connect(&server_ep).await.unwrap();
        write_all(&client, b"hello\n").await.unwrap();

        let mut buf = Vec::new();
        let n = read_until(&client, &mut buf, b'\n').await.unwrap();
        *got2.lock().unwrap() = Some((n, buf));
        client.close();
    });

    reactor.run();
    let (n, buf) = got.lock().unwrap().take().unwrap();
    assert_eq!(n, 6);
    assert_eq!(&buf[..n], b"hello\n");
}

#[test]
fn udp_send_receive_four_bytes() {
    let reactor = Reactor::new().unwrap();
    let ex = reactor.executor();

    let a = UdpSocket::new(&ex);
    let b = UdpSocket::new(&ex);
    a.bind(&loopback_ephemeral()).unwrap();
    b.bind(&loopback_ephemeral()).unwrap();
    let b_ep = b.local_endpoint().unwrap();

    let got = Arc::new(Mutex::new(None));
    let got2 = got.clone();
    {
        let b = b.clone();
        spawn_detached(&ex, async move {
            let mut buf = [0u8; 16];
            let (n, _src) = b.receive_from(&mut buf).await.unwrap();
            *got2.lock().unwrap() = Some((n, buf));
        });
    }
    {
        let a = a.clone();
        spawn_detached(&ex, async move {
            let n = a
                .send_to(&[0x11, 0x22, 0x33, 0x44], Some(&b_ep))
                .await
                .unwrap();
            assert_eq!(n, 4);
        });
    }

    reactor.run();
    let (n, buf) = got.lock().unwrap().take().unwrap();
    assert_eq!(n, 4);
    assert_eq!(&buf[..4], &[0x11, 0x22, 0x33, 0x44]);
}

#[test]
fn udp_connected_peer_mismatch_rejected() {
    let reactor = Reactor::new().unwrap();
    let ex = reactor.executor();

    let a = UdpSocket::new(&ex);
    let b = UdpSocket::new(&ex);
    let c = UdpSocket::new(&ex);
    b.bind(&loopback_ephemeral()).unwrap();
    c.bind(&loopback_ephemeral()).unwrap();
    let b_ep = b.local_endpoint().unwrap();
    let c_ep = c.local_endpoint().unwrap();

    a.connect(&b_ep).unwrap();

    let out = Arc::new(Mutex::new(Vec::new()));
    let out2 = out.clone();
    spawn_detached(&ex, async move {
        // Matching destination and no destination are both fine.
        let r = a.send_to(b"x", Some(&b_ep)).await;
        out2.lock().unwrap().push(r);
        let r = a.send_to(b"x", None).await;
        out2.lock().unwrap().push(r);
        // A different destination is rejected.
        let r = a.send_to(b"x", Some(&c_ep)).await;
        out2.lock().unwrap().push(r);
        // Empty buffer: no syscall, returns 0.
        let r = a.send_to(&[], Some(&c_ep)).await;
        out2.lock().unwrap().push(r);
    });

    reactor.run();
    let out = out.lock().unwrap();
    assert_eq!(out[0], Ok(1));
    assert_eq!(out[1], Ok(1));
    assert_eq!(out[2], Err(ErrorKind::InvalidArgument));
    assert_eq!(out[3], Ok(0));
}

#[test]
fn udp_receive_boundaries() {
    let reactor = Reactor::new().unwrap();
    let ex = reactor.executor();

    let sock = UdpSocket::new(&ex);
    let out = Arc::new(Mutex::new(Vec::new()));
    let out2 = out.clone();
    {
        let sock = sock.clone();
        spawn_detached(&ex, async move {
            // Not even open yet.
            let mut buf = [0u8; 4];
            let r = sock.receive_from(&mut buf).await.map(|(n, _)| n);
            out2.lock().unwrap().push(r);

            // Open but unbound: no local address to receive on.
            sock.open(&loopback_ephemeral()).unwrap();
            let r = sock.receive_from(&mut buf).await.map(|(n, _)| n);
            out2.lock().unwrap().push(r);

            sock.bind(&loopback_ephemeral()).unwrap();
            // Bound, but empty buffer.
            let r = sock.receive_from(&mut []).await.map(|(n, _)| n);
            out2.lock().unwrap().push(r);
        });
    }
    reactor.run();
    let out = out.lock().unwrap();
    assert_eq!(out[0], Err(ErrorKind::NotOpen));
    assert_eq!(out[1], Err(ErrorKind::NotBound));
    assert_eq!(out[2], Err(ErrorKind::InvalidArgument));
}

#[test]
fn udp_truncated_datagram_reports_message_size() {
    let reactor = Reactor::new().unwrap();
    let ex = reactor.executor();

    let a = UdpSocket::new(&ex);
    let b = UdpSocket::new(&ex);
    a.bind(&loopback_ephemeral()).unwrap();
    b.bind(&loopback_ephemeral()).unwrap();
    let b_ep = b.local_endpoint().unwrap();

    let got = Arc::new(Mutex::new(None));
    let got2 = got.clone();
    {
        let b = b.clone();
        spawn_detached(&ex, async move {
            let mut small = [0u8; 2];
            *got2.lock().unwrap() = Some(b.receive_from(&mut small).await.map(|(n, _)| n));
        });
    }
    {
        let a = a.clone();
        spawn_detached(&ex, async move {
            a.send_to(&[1, 2, 3, 4, 5, 6], Some(&b_ep)).await.unwrap();
        });
    }
    reactor.run();
    assert_eq!(
        got.lock().unwrap().take().unwrap(),
        Err(ErrorKind::MessageSize)
    );
}

#[test]
fn timeout_of_blocking_read() {
    let reactor = Reactor::new().unwrap();
    let ex = reactor.executor();

    let acceptor = TcpAcceptor::bind(&ex, &loopback_ephemeral(), 16).unwrap();
    let server_ep = acceptor.local_endpoint().unwrap();

    // Server holds the connection silent for a while, then closes.
    spawn_detached(&ex, async move {
        let sock = acceptor.accept().await.unwrap();
        sleep(Duration::from_millis(200)).await.ok();
        sock.close();
    });

    let got = Arc::new(Mutex::new(None));
    let got2 = got.clone();
    let ex2 = ex.clone();
    spawn_detached(&ex, async move {
        let client = TcpSocket::new(&ex2);
        client.connect(&server_ep).await.unwrap();

        let mut buf = [0u8; 64];
        let r = with_timeout_read(
            &client,
            client.read_some(&mut buf),
            Duration::from_millis(10),
        )
        .await;
        *got2.lock().unwrap() = Some(r);
        // The socket is still in a sane state and closes cleanly.
        client.close();
        client.close();
    });

    reactor.run();
    assert_eq!(
        got.lock().unwrap().take().unwrap(),
        Err(ErrorKind::TimedOut)
    );
}

#[test]
fn acceptor_fifo_order() {
    let reactor = Reactor::new().unwrap();
    let ex = reactor.executor();

    let acceptor = TcpAcceptor::bind(&ex, &loopback_ephemeral(), 16).unwrap();
    let server_ep = acceptor.local_endpoint().unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let accepted = Arc::new(AtomicUsize::new(0));

    for i in 0..3 {
        let acceptor = acceptor.clone();
        let order = order.clone();
        let accepted = accepted.clone();
        spawn_detached(&ex, async move {
            let _sock = acceptor.accept().await.unwrap();
            order.lock().unwrap().push(i);
            accepted.fetch_add(1, Ordering::SeqCst);
        });
    }

    // Clients connect one after another.
    let ex2 = ex.clone();
    spawn_detached(&ex, async move {
        let mut clients = Vec::new();
        for _ in 0..3 {
            let client = TcpSocket::new(&ex2);
            client.connect(&server_ep).await.unwrap();
            clients.push(client);
            sleep(Duration::from_millis(5)).await.ok();
        }
        // Keep client sockets alive until all accepts completed.
        sleep(Duration::from_millis(30)).await.ok();
        drop(clients);
    });

    reactor.run();
    assert_eq!(accepted.load(Ordering::SeqCst), 3);
    // First registered accept got the first connection, and so on.
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
}

#[test]
fn accept_without_listen_fails() {
    let reactor = Reactor::new().unwrap();
    let ex = reactor.executor();
    let acceptor = TcpAcceptor::new(&ex);
    let got = Arc::new(Mutex::new(None));
    let got2 = got.clone();
    spawn_detached(&ex, async move {
        *got2.lock().unwrap() = Some(acceptor.accept().await.map(|_| ()));
    });
    reactor.run();
    assert_eq!(
        got.lock().unwrap().take().unwrap(),
        Err(ErrorKind::NotListening)
    );
}

#[test]
fn stream_shutdown_write_signals_peer_eof() {
    let reactor = Reactor::new().unwrap();
    let ex = reactor.executor();

    let acceptor = TcpAcceptor::bind(&ex, &loopback_ephemeral(), 16).unwrap();
    let server_ep = acceptor.local_endpoint().unwrap();

    let server_saw = Arc::new(Mutex::new(None));
    let server_saw2 = server_saw.clone();
    spawn_detached(&ex, async move {
        let sock = acceptor.accept().await.unwrap();
        let mut buf = [0u8; 8];
        // Client shut its write side down without sending: clean EOF.
        *server_saw2.lock().unwrap() = Some(sock.read_some(&mut buf).await);
    });

    let client_result = Arc::new(Mutex::new(None));
    let client_result2 = client_result.clone();
    let ex2 = ex.clone();
    spawn_detached(&ex, async move {
        let client = TcpSocket::new(&ex2);
        client.connect(&server_ep).await.unwrap();
        client.shutdown(ShutdownHow::Write).unwrap();
        // Writing after shutdown is a broken pipe, locally detected.
        *client_result2.lock().unwrap() = Some(client.write_some(b"x").await);
        sleep(Duration::from_millis(20)).await.ok();
        client.close();
    });

    reactor.run();
    assert_eq!(server_saw.lock().unwrap().take().unwrap(), Ok(0));
    assert_eq!(
        client_result.lock().unwrap().take().unwrap(),
        Err(ErrorKind::BrokenPipe)
    );
}

#[test]
fn concurrent_reads_report_busy() {
    let reactor = Reactor::new().unwrap();
    let ex = reactor.executor();

    let acceptor = TcpAcceptor::bind(&ex, &loopback_ephemeral(), 16).unwrap();
    let server_ep = acceptor.local_endpoint().unwrap();

    spawn_detached(&ex, async move {
        let _sock = acceptor.accept().await.unwrap();
        sleep(Duration::from_millis(60)).await.ok();
    });

    let second = Arc::new(Mutex::new(None));
    let second2 = second.clone();
    let ex2 = ex.clone();
    spawn_detached(&ex, async move {
        let client = TcpSocket::new(&ex2);
        client.connect(&server_ep).await.unwrap();

        // First read parks on readiness.
        {
            let client = client.clone();
            spawn_detached(&rill_rt::current_executor().unwrap(), async move {
                let mut buf = [0u8; 8];
                let _ = client.read_some(&mut buf).await;
            });
        }
        sleep(Duration::from_millis(10)).await.ok();

        let mut buf = [0u8; 8];
        *second2.lock().unwrap() = Some(client.read_some(&mut buf).await);
        client.close();
    });

    reactor.run();
    assert_eq!(
        second.lock().unwrap().take().unwrap(),
        Err(ErrorKind::Busy)
    );
}

#[test]
fn unix_stream_round_trip() {
    let reactor = Reactor::new().unwrap();
    let ex = reactor.executor();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rill.sock");
    let ep = LocalEndpoint::from_path(&path).unwrap();

    let acceptor = UnixAcceptor::bind(&ex, &ep, 8).unwrap();
    spawn_detached(&ex, async move {
        let sock = acceptor.accept().await.unwrap();
        let mut buf = [0u8; 8];
        let n = sock.read_some(&mut buf).await.unwrap();
        let mut written = 0;
        while written < n {
            written += sock.write_some(&buf[written..n]).await.unwrap();
        }
    });

    let got = Arc::new(Mutex::new(None));
    let got2 = got.clone();
    let ex2 = ex.clone();
    spawn_detached(&ex, async move {
        let client = UnixStreamSocket::new(&ex2);
        client.connect(&ep).await.unwrap();
        client.write_some(b"ping").await.unwrap();
        let mut buf = [0u8; 8];
        let n = client.read_some(&mut buf).await.unwrap();
        *got2.lock().unwrap() = Some((n, buf));
        client.close();
    });

    reactor.run();
    let (n, buf) = got.lock().unwrap().take().unwrap();
    assert_eq!(n, 4);
    assert_eq!(&buf[..4], b"ping");
}

#[test]
fn close_aborts_pending_read() {
    let reactor = Reactor::new().unwrap();
    let ex = reactor.executor();

    for _ in 0..10 {
        let acceptor = TcpAcceptor::bind(&ex, &loopback_ephemeral(), 16).unwrap();
        let server_ep = acceptor.local_endpoint().unwrap();

        let server_side = Arc::new(Mutex::new(None));
        {
            let server_side = server_side.clone();
            spawn_detached(&ex, async move {
                *server_side.lock().unwrap() = Some(acceptor.accept().await.unwrap());
            });
        }

        let got = Arc::new(Mutex::new(None));
        let got2 = got.clone();
        let ex2 = ex.clone();
        spawn_detached(&ex, async move {
            let client = TcpSocket::new(&ex2);
            client.connect(&server_ep).await.unwrap();

            // Park a read, then close underneath it.
            {
                let client = client.clone();
                spawn_detached(&rill_rt::current_executor().unwrap(), async move {
                    sleep(Duration::from_millis(5)).await.ok();
                    client.close();
                });
            }
            let mut buf = [0u8; 16];
            *got2.lock().unwrap() = Some(client.read_some(&mut buf).await);
        });

        reactor.run();
        // Abort surfaced either as the wait abort or as the epoch check.
        let r = got.lock().unwrap().take().unwrap();
        assert!(
            matches!(r, Err(ErrorKind::OperationAborted) | Err(ErrorKind::NotOpen)),
            "unexpected read result: {r:?}"
        );
        drop(server_side);
    }
}

#[test]
fn double_close_is_clean() {
    let reactor = Reactor::new().unwrap();
    let ex = reactor.executor();
    let sock = TcpSocket::new(&ex);
    sock.bind(&loopback_ephemeral()).unwrap();
    assert!(sock.is_open());
    sock.close();
    assert!(!sock.is_open());
    sock.close();
    assert!(!sock.is_open());
}

#[test]
fn read_on_disconnected_socket_fails() {
    let reactor = Reactor::new().unwrap();
    let ex = reactor.executor();
    let sock = TcpSocket::new(&ex);
    let got = Arc::new(Mutex::new(None));
    let got2 = got.clone();
    {
        let sock = sock.clone();
        spawn_detached(&ex, async move {
            let mut buf = [0u8; 4];
            *got2.lock().unwrap() = Some(sock.read_some(&mut buf).await);
        });
    }
    reactor.run();
    assert_eq!(
        got.lock().unwrap().take().unwrap(),
        Err(ErrorKind::NotConnected)
    );
}
