//! Manager lifecycle, ordering, and pause/resume fence tests.

use std::io::Write;
use std::net::TcpStream;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{bounded, unbounded};
use netmgr::{Config, Handle, Manager};

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
fn test_lifecycle_multiple_managers() {
    init_logging();
    let a = Manager::new(Config::with_workers(2)).unwrap();
    let b = Manager::new(Config::with_workers(3)).unwrap();
    assert_eq!(a.workers(), 2);
    assert_eq!(b.workers(), 3);
    b.destroy();
    a.destroy();
}

#[test]
fn test_repeated_pause_resume() {
    init_logging();
    let mgr = Manager::new(Config::with_workers(4)).unwrap();
    for _ in 0..10 {
        mgr.pause();
        mgr.resume();
    }
    mgr.destroy();
}

#[test]
fn test_handle_reference_counting_balances() {
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
            0,
            16,
            None,
        )
        .unwrap();
    let addr = listener.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(&frame(b"refs")).unwrap();

    let handle = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    let base = handle.references();

    let clone_a = handle.clone();
    let clone_b = clone_a.clone();
    assert_eq!(handle.references(), base + 2);

    drop(clone_a);
    drop(clone_b);
    assert_eq!(handle.references(), base);

    drop(handle);
    drop(client);
    drop(listener);
    mgr.destroy();
}

#[test]
fn test_pause_fence_defers_send_completion() {
    init_logging();
    let mgr = Manager::new(Config::with_workers(1)).unwrap();

    let (msg_tx, msg_rx) = bounded::<Handle>(1);
    let listener = mgr
        .listen_tcpdns(
            "127.0.0.1:0".parse().unwrap(),
            move |handle, msg| {
                if msg.is_ok() {
                    msg_tx.send(handle.clone()).unwrap();
                }
            },
            |_handle, _result| Ok(()),
            0,
            16,
            None,
        )
        .unwrap();
    let addr = listener.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_millis(300)))
        .unwrap();
    client.write_all(&frame(b"request")).unwrap();
    let handle = msg_rx.recv_timeout(RECV_TIMEOUT).unwrap();

    // Fence the workers, then post a send from this (external) thread.
    mgr.pause();

    let (done_tx, done_rx) = bounded::<()>(1);
    handle.send(Bytes::from_static(b"reply"), move |_, result| {
        result.expect("send failed");
        done_tx.send(()).unwrap();
    });

    // Neither the completion nor the bytes may appear while paused.
    assert!(
        done_rx.recv_timeout(Duration::from_millis(300)).is_err(),
        "send completed while the manager was paused"
    );
    let mut probe = [0u8; 1];
    assert!(
        std::io::Read::read(&mut client, &mut probe).is_err(),
        "bytes reached the peer while the manager was paused"
    );

    mgr.resume();

    done_rx.recv_timeout(RECV_TIMEOUT).unwrap();
    client.set_read_timeout(Some(RECV_TIMEOUT)).unwrap();
    let mut prefix = [0u8; 2];
    std::io::Read::read_exact(&mut client, &mut prefix).unwrap();
    assert_eq!(u16::from_be_bytes(prefix) as usize, b"reply".len());

    drop(handle);
    drop(client);
    drop(listener);
    mgr.destroy();
}

#[test]
fn test_same_priority_events_run_in_enqueue_order() {
    init_logging();
    let mgr = Manager::new(Config::with_workers(2)).unwrap();

    // Tasks from this thread to one worker execute in enqueue order.
    let (tx, rx) = unbounded::<u32>();
    let (tx2, rx2) = unbounded::<u32>();
    let listener = mgr
        .listen_tcpdns(
            "127.0.0.1:0".parse().unwrap(),
            move |_handle, _msg| {},
            |_handle, _result| Ok(()),
            0,
            16,
            None,
        )
        .unwrap();

    // Drive ordering through observable listener behavior: sends on one
    // handle complete in the order posted. Connect a client so we have a
    // handle to post against.
    let (conn_tx, conn_rx) = bounded::<Handle>(1);
    mgr.connect_tcpdns(
        None,
        listener.local_addr().unwrap(),
        move |handle, result| {
            result.expect("connect failed");
            conn_tx.send(handle.clone()).unwrap();
        },
        5_000,
        0,
    )
    .unwrap();
    let handle = conn_rx.recv_timeout(RECV_TIMEOUT).unwrap();

    for i in 0..64u32 {
        let tx = tx.clone();
        handle.send(Bytes::copy_from_slice(&i.to_be_bytes()), move |_, result| {
            result.expect("send failed");
            tx.send(i).unwrap();
        });
    }
    for i in 0..64u32 {
        let tx2 = tx2.clone();
        handle.send(Bytes::copy_from_slice(&i.to_be_bytes()), move |_, result| {
            result.expect("send failed");
            tx2.send(i).unwrap();
        });
    }

    for i in 0..64u32 {
        assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), i);
    }
    for i in 0..64u32 {
        assert_eq!(rx2.recv_timeout(RECV_TIMEOUT).unwrap(), i);
    }

    drop(handle);
    drop(listener);
    mgr.destroy();
}

#[test]
fn test_shutdown_tears_down_live_connections() {
    init_logging();
    let mgr = Manager::new(Config::with_workers(2)).unwrap();

    let (err_tx, err_rx) = unbounded();
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

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(&frame(b"hold open")).unwrap();
    // Let the server pick the connection up before shutting down.
    std::thread::sleep(Duration::from_millis(100));

    mgr.shutdown();
    let error = err_rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(error, netmgr::NetError::Canceled);

    drop(client);
    drop(listener);
    mgr.destroy();
}
