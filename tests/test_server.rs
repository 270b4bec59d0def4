use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tuplegate::config::Config;
use tuplegate::http::connection::ConnectionContext;
use tuplegate::http::error_page::HtmlErrorPages;
use tuplegate::proxy::ResourceProxy;
use tuplegate::server::log::TracingLog;
use tuplegate::server::pool::PoolStatus;
use tuplegate::server::{Server, listener};
use tuplegate::store::MemoryStore;

fn config(workers: usize, queue_capacity: usize) -> Config {
    let mut cfg = Config::default();
    cfg.pool.workers = workers;
    cfg.pool.queue_capacity = queue_capacity;
    cfg.server.read_timeout_ms = 1_000;
    cfg.server.idle_wait_ms = 20;
    cfg.server.max_idle_ticks = 100;
    cfg
}

fn store() -> MemoryStore {
    let store = MemoryStore::new(64, Duration::from_secs(60));
    store.insert("/", "a.txt", Some("text/plain"), &b"alfa"[..]);
    store.insert("/", "b.txt", Some("text/plain"), &b"bravo"[..]);
    store
}

/// Starts a server on an ephemeral port and returns its address.
async fn start(cfg: &Config, store: &MemoryStore) -> (Arc<Server>, SocketAddr) {
    let context = Arc::new(ConnectionContext {
        proxy: ResourceProxy::start(Arc::new(store.clone()), cfg.proxy_settings()),
        pages: Arc::new(HtmlErrorPages::default()),
        log: Arc::new(TracingLog),
        settings: cfg.connection_settings(),
    });
    let server = Arc::new(Server::new(cfg, context));

    let socket = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let serving = Arc::clone(&server);
    tokio::spawn(async move { listener::serve(socket, &serving).await });

    (server, addr)
}

/// Reads one response framed by its Content-Length.
async fn read_response(client: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    loop {
        let mut chunk = [0u8; 1024];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut chunk))
            .await
            .expect("no response")
            .unwrap();
        assert!(n > 0, "connection closed early");
        buf.extend_from_slice(&chunk[..n]);

        let text = String::from_utf8_lossy(&buf).into_owned();
        if let Some((head, body)) = text.split_once("\r\n\r\n") {
            let length: usize = head
                .lines()
                .find_map(|line| line.strip_prefix("Content-Length: "))
                .map(|v| v.parse().unwrap())
                .unwrap_or(0);
            if body.len() >= length {
                return text;
            }
        }
    }
}

async fn read_until_closed(client: &mut TcpStream) -> String {
    let mut out = Vec::new();
    tokio::time::timeout(Duration::from_secs(3), client.read_to_end(&mut out))
        .await
        .expect("connection never closed")
        .unwrap();
    String::from_utf8(out).unwrap()
}

async fn eventually(check: impl Fn() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never held");
}

#[tokio::test]
async fn test_persistent_connection_is_served_across_pool_rounds() {
    let store = store();
    let (_server, addr) = start(&config(2, 8), &store).await;
    let mut client = TcpStream::connect(addr).await.unwrap();

    client.write_all(b"GET /a.txt HTTP/1.1\r\n\r\n").await.unwrap();
    let first = read_response(&mut client).await;
    assert!(first.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(first.ends_with("alfa"));

    // several idle rounds go through the queue before the next request
    tokio::time::sleep(Duration::from_millis(100)).await;

    client
        .write_all(b"GET /b.txt HTTP/1.1\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let second = read_until_closed(&mut client).await;
    assert!(second.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(second.contains("Connection: close\r\n"));
    assert!(second.ends_with("bravo"));
}

#[tokio::test]
async fn test_silent_client_is_dropped_after_read_timeout() {
    let store = store();
    let mut cfg = config(1, 4);
    cfg.server.read_timeout_ms = 50;
    let (server, addr) = start(&cfg, &store).await;

    let mut client = TcpStream::connect(addr).await.unwrap();

    assert_eq!(read_until_closed(&mut client).await, "");
    eventually(|| server.pool().busy() == 0 && server.pool().queued() == 0).await;
}

#[tokio::test]
async fn test_full_queue_answers_503() {
    let store = store();
    let (server, addr) = start(&config(0, 1), &store).await;

    // no workers, so the first socket stays queued
    let mut waiting = TcpStream::connect(addr).await.unwrap();
    eventually(|| server.pool().queued() == 1).await;

    let mut refused = TcpStream::connect(addr).await.unwrap();
    let reply = read_until_closed(&mut refused).await;
    assert!(reply.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));
    assert!(reply.contains("Connection: close\r\n"));

    // the queued socket is served once a worker exists
    server.pool().set_thread_number(1);
    waiting
        .write_all(b"GET /a.txt HTTP/1.1\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let served = read_until_closed(&mut waiting).await;
    assert!(served.starts_with("HTTP/1.1 200 OK\r\n"));
}

#[tokio::test]
async fn test_shutdown_drains_then_terminates() {
    let store = store();
    let (server, addr) = start(&config(2, 8), &store).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"GET /a.txt HTTP/1.1\r\n\r\n").await.unwrap();
    assert!(read_response(&mut client).await.ends_with("alfa"));
    assert_eq!(store.active_leases(), 1);

    tokio::time::timeout(Duration::from_secs(2), server.shutdown())
        .await
        .expect("shutdown stalled")
        .unwrap();

    assert_eq!(server.pool().status(), PoolStatus::Terminated);
    assert_eq!(server.pool().live(), 0);
    assert!(server.context().proxy.bindings().is_empty());
    assert_eq!(store.active_leases(), 0);

    // the idle persistent connection was refused a new round and closed
    assert_eq!(read_until_closed(&mut client).await, "");
}
