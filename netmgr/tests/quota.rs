//! Connection quota tests: the cap holds, and overflow accepts are
//! deferred until a slot frees rather than leaked.

use std::io::Write;
use std::net::TcpStream;
use std::time::Duration;

use crossbeam_channel::unbounded;
use netmgr::{Config, Handle, Manager, Quota};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn frame(msg: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(2 + msg.len());
    framed.extend_from_slice(&(msg.len() as u16).to_be_bytes());
    framed.extend_from_slice(msg);
    framed
}

#[test]
fn test_quota_defers_overflow_accept() {
    init_logging();
    let mgr = Manager::new(Config::with_workers(1)).unwrap();
    let quota = Quota::new(1);

    let (accept_tx, accept_rx) = unbounded::<Handle>();
    let listener = mgr
        .listen_tcpdns(
            "127.0.0.1:0".parse().unwrap(),
            |_handle, _msg| {},
            move |handle, result| {
                result?;
                accept_tx.send(handle.clone()).unwrap();
                Ok(())
            },
            0,
            16,
            Some(quota.clone()),
        )
        .unwrap();
    let addr = listener.local_addr().unwrap();

    // First client takes the only slot.
    let mut first = TcpStream::connect(addr).unwrap();
    first.write_all(&frame(b"one")).unwrap();
    let _first_handle = accept_rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(quota.used(), 1);

    // Second client connects (the TCP handshake lands in the backlog) but
    // must not be accepted while the first connection holds the quota.
    let mut second = TcpStream::connect(addr).unwrap();
    second.write_all(&frame(b"two")).unwrap();
    assert!(
        accept_rx.recv_timeout(Duration::from_millis(400)).is_err(),
        "second connection accepted past the quota"
    );
    assert_eq!(quota.used(), 1);

    // Closing the first connection releases the slot; the deferred accept
    // fires.
    drop(_first_handle);
    drop(first);
    let _second_handle = accept_rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(quota.used(), 1);

    drop(_second_handle);
    drop(second);
    drop(listener);
    mgr.destroy();
}

#[test]
fn test_quota_released_on_close() {
    init_logging();
    let mgr = Manager::new(Config::with_workers(1)).unwrap();
    let quota = Quota::new(2);

    let listener = mgr
        .listen_tcpdns(
            "127.0.0.1:0".parse().unwrap(),
            |_handle, _msg| {},
            |_handle, result| {
                result?;
                Ok(())
            },
            0,
            16,
            Some(quota.clone()),
        )
        .unwrap();
    let addr = listener.local_addr().unwrap();

    {
        let mut a = TcpStream::connect(addr).unwrap();
        let mut b = TcpStream::connect(addr).unwrap();
        a.write_all(&frame(b"a")).unwrap();
        b.write_all(&frame(b"b")).unwrap();

        // Both admitted.
        let deadline = std::time::Instant::now() + RECV_TIMEOUT;
        while quota.used() < 2 {
            assert!(std::time::Instant::now() < deadline, "connections not admitted");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    // Both clients hung up; the server notices EOF and the quota drains.
    let deadline = std::time::Instant::now() + RECV_TIMEOUT;
    while quota.used() > 0 {
        assert!(
            std::time::Instant::now() < deadline,
            "quota not released after close"
        );
        std::thread::sleep(Duration::from_millis(10));
    }

    drop(listener);
    mgr.destroy();
}
