//! Shared utilities for integration tests: mock nodes and an ingress harness.
//!
//! Every listener binds `127.0.0.1:0`, so suites can run in parallel.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use ingress_proxy::config::{IngressConfig, NodeConfig};
use ingress_proxy::http::IngressState;
use ingress_proxy::{IngressServer, Shutdown};

/// A running ingress bound to an ephemeral port.
pub struct Ingress {
    pub addr: SocketAddr,
    pub state: Arc<IngressState>,
    pub shutdown: Shutdown,
}

impl Ingress {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

impl Drop for Ingress {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

/// Node configs `node-1..node-N` for the given addresses.
pub fn nodes(addrs: &[SocketAddr]) -> Vec<NodeConfig> {
    addrs
        .iter()
        .enumerate()
        .map(|(i, addr)| NodeConfig::new(format!("node-{}", i + 1), addr.ip().to_string(), addr.port()))
        .collect()
}

/// Start an ingress in front of `addrs`, letting the test adjust the config.
pub async fn start_ingress<F>(addrs: &[SocketAddr], tweak: F) -> Ingress
where
    F: FnOnce(&mut IngressConfig),
{
    let mut config = IngressConfig::default();
    config.listener.host = "127.0.0.1".into();
    config.listener.port = 0;
    config.upstream.nodes = nodes(addrs);
    config.upstream.timeout_ms = 500;
    tweak(&mut config);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = IngressServer::new(config);
    let state = server.state();
    let shutdown = Shutdown::new();
    let server_shutdown = shutdown.subscribe();

    tokio::spawn(async move {
        let _ = server.run(listener, server_shutdown).await;
    });

    Ingress {
        addr,
        state,
        shutdown,
    }
}

/// A client that never reuses connections, so each request is independent.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap()
}

/// An address nothing listens on.
pub async fn refused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Read one request: the head as text and the `Content-Length` body.
pub async fn read_request(socket: &mut TcpStream) -> Option<(String, Vec<u8>)> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    let mut body = buf[head_end..].to_vec();
    while body.len() < length {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    Some((head, body))
}

fn status_line(status: u16) -> &'static str {
    match status {
        200 => "200 OK",
        201 => "201 Created",
        403 => "403 Forbidden",
        404 => "404 Not Found",
        500 => "500 Internal Server Error",
        502 => "502 Bad Gateway",
        503 => "503 Service Unavailable",
        _ => "200 OK",
    }
}

/// Start a node that answers every request with a fixed 200 body.
pub async fn start_mock_backend(response: &'static str) -> SocketAddr {
    start_programmable_backend(move || async move { (200, response.to_string()) }).await
}

/// Start a node whose status and body come from `f`, one call per request.
pub async fn start_programmable_backend<F, Fut>(f: F) -> SocketAddr
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (u16, String)> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let f = Arc::new(f);

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let f = f.clone();
            tokio::spawn(async move {
                if read_request(&mut socket).await.is_none() {
                    return;
                }
                let (status, body) = f().await;
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status_line(status),
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    addr
}

/// Request heads seen by an echo node, oldest first.
pub type SeenHeads = Arc<Mutex<Vec<String>>>;

/// Start a node that records each request head and echoes the body back
/// with status 201.
pub async fn start_echo_backend() -> (SocketAddr, SeenHeads) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen: SeenHeads = Arc::new(Mutex::new(Vec::new()));
    let record = seen.clone();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let record = record.clone();
            tokio::spawn(async move {
                let Some((head, body)) = read_request(&mut socket).await else {
                    return;
                };
                record.lock().unwrap().push(head);
                let mut response = format!(
                    "HTTP/1.1 201 Created\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                )
                .into_bytes();
                response.extend_from_slice(&body);
                let _ = socket.write_all(&response).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    (addr, seen)
}

/// Start a node that writes `response` verbatim to every connection.
pub async fn start_raw_backend(response: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                if read_request(&mut socket).await.is_none() {
                    return;
                }
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    addr
}

/// Start a node that sends `head`, waits `pause`, then sends `tail`.
pub async fn start_trickle_backend(
    head: &'static str,
    tail: &'static str,
    pause: Duration,
) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                if read_request(&mut socket).await.is_none() {
                    return;
                }
                let _ = socket.write_all(head.as_bytes()).await;
                tokio::time::sleep(pause).await;
                let _ = socket.write_all(tail.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    addr
}

/// Start a node that accepts any upgrade with a 101 and then echoes raw
/// bytes, starting with whatever arrived right behind the request head.
pub async fn start_raw_upgrade_echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Some((head, early)) = read_request(&mut socket).await else {
                    return;
                };
                let protocol = head
                    .lines()
                    .filter_map(|line| line.split_once(':'))
                    .find(|(name, _)| name.trim().eq_ignore_ascii_case("upgrade"))
                    .map(|(_, value)| value.trim().to_string())
                    .unwrap_or_default();
                let accept = format!(
                    "HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: {}\r\n\r\n",
                    protocol
                );
                if socket.write_all(accept.as_bytes()).await.is_err() {
                    return;
                }
                if !early.is_empty() && socket.write_all(&early).await.is_err() {
                    return;
                }

                let mut chunk = [0u8; 4096];
                loop {
                    match socket.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&chunk[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// Read from `socket` into `buf` until it contains `needle`; panics after two seconds.
pub async fn read_until(socket: &mut TcpStream, buf: &mut Vec<u8>, needle: &[u8]) {
    let mut chunk = [0u8; 4096];
    tokio::time::timeout(Duration::from_secs(2), async {
        while !buf.windows(needle.len()).any(|w| w == needle) {
            let n = socket.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed before {:?}", String::from_utf8_lossy(needle));
            buf.extend_from_slice(&chunk[..n]);
        }
    })
    .await
    .unwrap();
}

/// Start a node that accepts connections and never answers.
pub async fn start_silent_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    addr
}

/// Start a WebSocket node that echoes text and binary frames.
pub async fn start_ws_echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(socket).await else {
                    return;
                };
                while let Some(Ok(message)) = ws.next().await {
                    if message.is_text() || message.is_binary() {
                        if ws.send(message).await.is_err() {
                            break;
                        }
                    } else if message.is_close() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

/// Poll `/healthz` until `check` passes or a second elapses.
pub async fn wait_for_health<F>(ingress: &Ingress, check: F) -> serde_json::Value
where
    F: Fn(&serde_json::Value) -> bool,
{
    let client = client();
    let mut last = serde_json::Value::Null;
    for _ in 0..50 {
        last = client
            .get(ingress.url("/healthz"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if check(&last) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    last
}
