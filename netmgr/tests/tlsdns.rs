//! DNS-over-TLS end-to-end tests: handshake, framed request/response, and
//! framing across TLS record boundaries.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{bounded, unbounded};
use netmgr::{Config, Handle, Manager, TlsContext};
use rustls::pki_types::PrivatePkcs8KeyDer;
use rustls::RootCertStore;

const RECV_TIMEOUT: Duration = Duration::from_secs(10);

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A self-signed server context and a client context trusting it.
fn test_contexts() -> (Arc<TlsContext>, Arc<TlsContext>) {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_der = cert.cert.der().clone();
    let key = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());

    let server = TlsContext::server(vec![cert_der.clone()], key.into()).unwrap();

    let mut roots = RootCertStore::empty();
    roots.add(cert_der).unwrap();
    let client = TlsContext::client(roots, "localhost").unwrap();

    (server, client)
}

#[test]
fn test_handshake_and_request_response() {
    init_logging();
    let (server_ctx, client_ctx) = test_contexts();
    let mgr = Manager::new(Config::with_workers(1)).unwrap();

    // Server: accept fires after the handshake; every request gets a
    // fixed reply.
    let (accept_tx, accept_rx) = bounded::<Handle>(1);
    let (req_tx, req_rx) = bounded::<Vec<u8>>(4);
    let listener = mgr
        .listen_tlsdns(
            "127.0.0.1:0".parse().unwrap(),
            move |handle, msg| {
                let Ok(msg) = msg else { return };
                req_tx.send(msg.to_vec()).unwrap();
                handle.send(Bytes::from_static(b"reply"), |_, result| {
                    result.expect("server send failed");
                });
            },
            move |handle, result| {
                result?;
                accept_tx.send(handle.clone()).unwrap();
                Ok(())
            },
            0,
            16,
            None,
            server_ctx,
        )
        .unwrap();
    let addr = listener.local_addr().unwrap();

    // Client: the connect callback is deferred until the handshake
    // completes, then one request goes out.
    let (conn_tx, conn_rx) = bounded::<Handle>(1);
    mgr.connect_tlsdns(
        None,
        addr,
        move |handle, result| {
            result.expect("TLS connect failed");
            conn_tx.send(handle.clone()).unwrap();
        },
        10_000,
        0,
        client_ctx,
    )
    .unwrap();

    let client_handle = conn_rx.recv_timeout(RECV_TIMEOUT).unwrap();
    let server_handle = accept_rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(client_handle.peer_addr(), addr);
    assert_eq!(server_handle.local_addr().port(), addr.port());

    let (resp_tx, resp_rx) = bounded::<Vec<u8>>(1);
    client_handle.read(move |_handle, msg| {
        if let Ok(msg) = msg {
            resp_tx.send(msg.to_vec()).unwrap();
        }
    });
    client_handle.send(Bytes::from_static(b"request"), |_, result| {
        result.expect("client send failed");
    });

    assert_eq!(req_rx.recv_timeout(RECV_TIMEOUT).unwrap(), b"request");
    assert_eq!(resp_rx.recv_timeout(RECV_TIMEOUT).unwrap(), b"reply");

    drop(client_handle);
    drop(server_handle);
    drop(listener);
    mgr.destroy();
}

#[test]
fn test_multiple_messages_across_records() {
    init_logging();
    let (server_ctx, client_ctx) = test_contexts();
    let mgr = Manager::new(Config::with_workers(2)).unwrap();

    let (req_tx, req_rx) = unbounded::<Vec<u8>>();
    let listener = mgr
        .listen_tlsdns(
            "127.0.0.1:0".parse().unwrap(),
            move |handle, msg| {
                let Ok(msg) = msg else { return };
                req_tx.send(msg.to_vec()).unwrap();
                handle.send(Bytes::copy_from_slice(msg), |_, result| {
                    result.expect("server send failed");
                });
            },
            |_handle, result| {
                result?;
                Ok(())
            },
            0,
            16,
            None,
            server_ctx,
        )
        .unwrap();
    let addr = listener.local_addr().unwrap();

    let (conn_tx, conn_rx) = bounded::<Handle>(1);
    mgr.connect_tlsdns(
        None,
        addr,
        move |handle, result| {
            result.expect("TLS connect failed");
            conn_tx.send(handle.clone()).unwrap();
        },
        10_000,
        0,
        client_ctx,
    )
    .unwrap();
    let handle = conn_rx.recv_timeout(RECV_TIMEOUT).unwrap();

    // A large message spans several 16 KiB output chunks; small ones ride
    // alongside. All must arrive whole and in order.
    let big = vec![0xABu8; 40_000];
    let msgs: Vec<Vec<u8>> = vec![b"one".to_vec(), big.clone(), b"three".to_vec()];
    for msg in &msgs {
        handle.send(Bytes::copy_from_slice(msg), |_, result| {
            result.expect("client send failed");
        });
    }

    for expected in &msgs {
        let seen = req_rx.recv_timeout(RECV_TIMEOUT).unwrap();
        assert_eq!(&seen, expected, "message torn or reordered across TLS records");
    }

    drop(handle);
    drop(listener);
    mgr.destroy();
}

#[test]
fn test_untrusted_client_fails_connect() {
    init_logging();
    let (server_ctx, _) = test_contexts();
    // A client that trusts nothing must fail its handshake.
    let empty_roots = RootCertStore::empty();
    let untrusting = TlsContext::client(empty_roots, "localhost").unwrap();

    let mgr = Manager::new(Config::with_workers(1)).unwrap();
    let listener = mgr
        .listen_tlsdns(
            "127.0.0.1:0".parse().unwrap(),
            |_handle, _msg| {},
            |_handle, _result| Ok(()),
            0,
            16,
            None,
            server_ctx,
        )
        .unwrap();
    let addr = listener.local_addr().unwrap();

    let (conn_tx, conn_rx) = bounded(1);
    mgr.connect_tlsdns(
        None,
        addr,
        move |_handle, result| {
            conn_tx.send(result).unwrap();
        },
        5_000,
        0,
        untrusting,
    )
    .unwrap();

    let result = conn_rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert!(result.is_err(), "handshake with an untrusted peer succeeded");

    drop(listener);
    mgr.destroy();
}
