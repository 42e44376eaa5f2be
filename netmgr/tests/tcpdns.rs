//! DNS-over-TCP end-to-end tests: framing, echo, timeouts, and
//! sequential-mode backpressure.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{bounded, unbounded, Receiver};
use netmgr::{Config, Handle, Manager, NetError};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Frame a DNS message with its 16-bit length prefix.
fn frame(msg: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(2 + msg.len());
    framed.extend_from_slice(&(msg.len() as u16).to_be_bytes());
    framed.extend_from_slice(msg);
    framed
}

/// Read one framed message off a blocking client stream.
fn read_framed(stream: &mut TcpStream) -> Vec<u8> {
    let mut prefix = [0u8; 2];
    stream.read_exact(&mut prefix).unwrap();
    let len = u16::from_be_bytes(prefix) as usize;
    let mut msg = vec![0u8; len];
    stream.read_exact(&mut msg).unwrap();
    msg
}

/// Start an echo server; every received message is sent straight back.
fn echo_server(mgr: &Manager) -> (netmgr::Listener, Receiver<Vec<u8>>) {
    let (tx, rx) = unbounded();
    let listener = mgr
        .listen_tcpdns(
            "127.0.0.1:0".parse().unwrap(),
            move |handle, msg| {
                // Teardown delivers Eof/Canceled here; only echo data.
                let Ok(msg) = msg else { return };
                tx.send(msg.to_vec()).unwrap();
                handle.send(Bytes::copy_from_slice(msg), |_, result| {
                    result.expect("server send failed");
                });
            },
            |_handle, result| {
                result?;
                Ok(())
            },
            0,
            128,
            None,
        )
        .unwrap();
    (listener, rx)
}

#[test]
fn test_echo_roundtrip() {
    init_logging();
    let mgr = Manager::new(Config::with_workers(1)).unwrap();
    let (listener, server_rx) = echo_server(&mgr);
    let addr = listener.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    client.set_read_timeout(Some(RECV_TIMEOUT)).unwrap();

    let query = b"\x12\x34query bytes!";
    assert_eq!(query.len(), 14);
    client.write_all(&frame(query)).unwrap();

    // The server delivered exactly the 14-byte region.
    let seen = server_rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(seen, query);

    // And echoed it back, framed.
    let reply = read_framed(&mut client);
    assert_eq!(reply, query);

    drop(client);
    drop(listener);
    mgr.destroy();
}

#[test]
fn test_partial_framing_single_delivery() {
    init_logging();
    let mgr = Manager::new(Config::with_workers(1)).unwrap();
    let (listener, server_rx) = echo_server(&mgr);
    let addr = listener.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).unwrap();

    // First segment: length prefix plus three of five payload bytes.
    client.write_all(&[0x00, 0x05, b'h', b'e', b'l']).unwrap();
    assert!(
        server_rx.recv_timeout(Duration::from_millis(200)).is_err(),
        "incomplete message must not be delivered"
    );

    // Remainder arrives later; exactly one delivery with the full payload.
    client.write_all(&[b'l', b'o']).unwrap();
    let seen = server_rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(seen, b"hello");
    assert!(server_rx.recv_timeout(Duration::from_millis(200)).is_err());

    drop(client);
    drop(listener);
    mgr.destroy();
}

#[test]
fn test_pipelined_messages_in_order() {
    init_logging();
    let mgr = Manager::new(Config::with_workers(2)).unwrap();
    let (listener, server_rx) = echo_server(&mgr);
    let addr = listener.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    let mut wire = Vec::new();
    for i in 0..10u8 {
        wire.extend_from_slice(&frame(&[i; 4]));
    }
    client.write_all(&wire).unwrap();

    for i in 0..10u8 {
        let seen = server_rx.recv_timeout(RECV_TIMEOUT).unwrap();
        assert_eq!(seen, vec![i; 4], "messages must arrive in order, untorn");
    }

    drop(client);
    drop(listener);
    mgr.destroy();
}

#[test]
fn test_client_connect_and_roundtrip() {
    init_logging();
    let mgr = Manager::new(Config::with_workers(1)).unwrap();
    let (listener, _server_rx) = echo_server(&mgr);
    let addr = listener.local_addr().unwrap();

    let (conn_tx, conn_rx) = bounded::<Handle>(1);
    mgr.connect_tcpdns(
        None,
        addr,
        move |handle, result| {
            result.expect("connect failed");
            conn_tx.send(handle.clone()).unwrap();
        },
        5_000,
        0,
    )
    .unwrap();

    let handle = conn_rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(handle.peer_addr(), addr);

    let (resp_tx, resp_rx) = bounded::<Vec<u8>>(1);
    handle.read(move |_handle, msg| {
        if let Ok(msg) = msg {
            resp_tx.send(msg.to_vec()).unwrap();
        }
    });
    handle.send(Bytes::from_static(b"ping!"), |_, result| {
        result.expect("client send failed");
    });

    let reply = resp_rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(reply, b"ping!");

    drop(handle);
    drop(listener);
    mgr.destroy();
}

#[test]
fn test_read_timeout_fires_on_idle_connection() {
    init_logging();
    let mgr = Manager::new(Config::with_workers(1)).unwrap();
    mgr.set_timeouts(200, 200, 200, 200);

    let (err_tx, err_rx) = bounded::<NetError>(4);
    let listener = mgr
        .listen_tcpdns(
            "127.0.0.1:0".parse().unwrap(),
            move |_handle, msg| {
                if let Err(e) = msg {
                    err_tx.send(e).unwrap();
                }
            },
            |_handle, _result| Ok(()),
            0,
            16,
            None,
        )
        .unwrap();
    let addr = listener.local_addr().unwrap();

    let started = Instant::now();
    let client = TcpStream::connect(addr).unwrap();

    let error = err_rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(error, NetError::TimedOut);
    assert!(
        started.elapsed() >= Duration::from_millis(200),
        "timeout fired too early"
    );

    drop(client);
    drop(listener);
    mgr.destroy();
}

#[test]
fn test_sequential_mode_backpressure() {
    init_logging();
    let mgr = Manager::new(Config::with_workers(1)).unwrap();

    let (msg_tx, msg_rx) = unbounded::<(Vec<u8>, Handle)>();
    let listener = mgr
        .listen_tcpdns(
            "127.0.0.1:0".parse().unwrap(),
            move |handle, msg| {
                let Ok(msg) = msg else { return };
                // No pipelining: one message at a time from this client.
                handle.set_sequential();
                msg_tx.send((msg.to_vec(), handle.clone())).unwrap();
            },
            |_handle, _result| Ok(()),
            0,
            16,
            None,
        )
        .unwrap();
    let addr = listener.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    let mut wire = frame(b"first");
    wire.extend_from_slice(&frame(b"second"));
    client.write_all(&wire).unwrap();

    // Only the first message is dispatched while its handle is held.
    let (first, first_handle) = msg_rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(first, b"first");
    assert!(
        msg_rx.recv_timeout(Duration::from_millis(300)).is_err(),
        "second message dispatched despite sequential mode"
    );

    // Releasing the in-flight handle resumes processing.
    drop(first_handle);
    let (second, second_handle) = msg_rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(second, b"second");

    drop(second_handle);
    drop(client);
    drop(listener);
    mgr.destroy();
}

#[test]
fn test_handle_payload_and_extra_space() {
    init_logging();
    let mgr = Manager::new(Config::with_workers(1)).unwrap();

    let (tx, rx) = bounded::<Handle>(1);
    let listener = mgr
        .listen_tcpdns(
            "127.0.0.1:0".parse().unwrap(),
            move |handle, msg| {
                if msg.is_ok() {
                    tx.send(handle.clone()).unwrap();
                }
            },
            |_handle, _result| Ok(()),
            32,
            16,
            None,
        )
        .unwrap();
    let addr = listener.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(&frame(b"q")).unwrap();

    let handle = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    handle.with_extra(|extra| {
        assert_eq!(extra.len(), 32);
        extra[0] = 0x55;
    });
    handle.set_data(Box::new(7u64), None, None);
    handle.with_data(|data| {
        assert_eq!(*data.unwrap().downcast_ref::<u64>().unwrap(), 7);
    });
    assert_eq!(handle.peer_addr(), client.local_addr().unwrap());
    assert_eq!(handle.local_addr().port(), addr.port());

    drop(handle);
    drop(client);
    drop(listener);
    mgr.destroy();
}
