//! Protocol-upgrade forwarding (WebSocket and similar).
//!
//! # Data Flow
//! ```text
//! upgrade request
//!     → attempt order from the planner
//!     → for each node: connect, send the handshake, wait for a first byte
//!       (all under the upstream timeout)
//!         first byte → close circuit, commit to this node
//!             head is 101 → hand both upgraded streams to a relay task
//!             other head  → pass the node's answer through
//!             bad head    → 502, no retry
//!         failure → mark failure, next node
//!     → none left → 502, Connection: close
//!
//! relay: client ⇄ node byte copy until either side ends, then both close
//! ```
//!
//! # Design Decisions
//! - Each attempt owns a fresh connection; upgraded sockets never return to the pool
//! - Nothing is retried once the node has sent a byte
//! - Bytes either peer sent ahead of the handshake stay buffered in hyper's `Upgraded`

use std::io;
use std::net::IpAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::http::header::{CONNECTION, SET_COOKIE};
use axum::http::request::Parts;
use axum::http::{HeaderValue, Request, Response, StatusCode, Version};
use axum::response::IntoResponse;
use hyper::body::Incoming;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::http::error::{IngressError, TransportError};
use crate::http::forward::read_body;
use crate::http::headers::{sanitize_response_headers, upgrade_request_headers};
use crate::http::server::IngressState;
use crate::load_balancer::affinity::RoutingHints;
use crate::load_balancer::node::UpstreamNode;
use crate::net::connection::{closed, ConnectionTracker};
use crate::observability::metrics;

/// Proxy an upgrade request. Always produces a response: 101 from a node,
/// the node's refusal, or a 502.
pub async fn forward_upgrade(
    state: &IngressState,
    mut request: Request<Body>,
    remote: Option<IpAddr>,
    request_id: &str,
) -> axum::response::Response {
    let start = Instant::now();
    let client_upgrade = hyper::upgrade::on(&mut request);
    let (parts, body) = request.into_parts();
    let method = parts.method.to_string();

    let lead = match read_body(body, &parts.headers, state.config.upstream.max_body_bytes).await {
        Ok(lead) => lead,
        Err(err) => return err.into_response(),
    };

    let hints = RoutingHints::from_headers(
        &parts.headers,
        remote,
        &state.planner.affinity().cookie_name,
    );
    let plan = state
        .planner
        .attempt_order(&hints, &state.registry, &state.breaker);

    let mut last_error: Option<TransportError> = None;

    for (attempt, &index) in plan.order.iter().enumerate() {
        let Some(node) = state.registry.get(index) else {
            continue;
        };

        let call = node.begin_call();
        let upstream = upgrade_request(&parts, node, remote, lead.clone());

        match handshake(node, upstream, state.client.timeout()).await {
            Ok(answered) => {
                state.breaker.mark_success(node);
                drop(call);

                let mut response = match answered.head(state.client.timeout()).await {
                    Ok(response) => response,
                    Err(err) => {
                        tracing::error!(
                            request_id = %request_id,
                            node = %node.id,
                            error = %err,
                            "Upgrade response unreadable after commit"
                        );
                        metrics::record_request(&method, 502, &node.id, start);
                        return bad_gateway(err.to_string());
                    }
                };

                let status = response.status();
                metrics::record_request(&method, status.as_u16(), &node.id, start);
                let cookie = state
                    .planner
                    .cookie_for_attempt(&plan, node, attempt)
                    .and_then(|c| HeaderValue::from_str(&c).ok());

                if status == StatusCode::SWITCHING_PROTOCOLS {
                    let node_upgrade = hyper::upgrade::on(&mut response);
                    let (mut head, _) = response.into_parts();
                    if let Some(cookie) = cookie {
                        head.headers.append(SET_COOKIE, cookie);
                    }

                    tracing::info!(
                        request_id = %request_id,
                        node = %node.id,
                        attempt,
                        "Upgrade accepted"
                    );
                    tokio::spawn(relay(
                        client_upgrade,
                        node_upgrade,
                        state.relays.clone(),
                        node.id.clone(),
                    ));
                    return Response::from_parts(head, Body::empty());
                }

                tracing::debug!(
                    request_id = %request_id,
                    node = %node.id,
                    status = status.as_u16(),
                    "Upgrade declined by node"
                );
                let (mut head, incoming) = response.into_parts();
                sanitize_response_headers(&mut head.headers);
                if let Some(cookie) = cookie {
                    head.headers.append(SET_COOKIE, cookie);
                }
                return Response::from_parts(head, Body::new(incoming));
            }
            Err(err) => {
                tracing::warn!(
                    request_id = %request_id,
                    node = %node.id,
                    attempt,
                    error = %err,
                    "Upgrade attempt failed"
                );
                state.breaker.mark_failure(node);
                metrics::record_upstream_failure(&node.id);
                last_error = Some(err);
            }
        }
    }

    let reason = last_error
        .map(|e| e.to_string())
        .unwrap_or_else(|| "no upstream nodes".to_string());
    tracing::error!(request_id = %request_id, reason = %reason, "All upstream nodes failed for upgrade");
    metrics::record_request(&method, 502, "none", start);
    bad_gateway(reason)
}

/// 502 that also ends the client connection.
fn bad_gateway(reason: String) -> axum::response::Response {
    let mut response = IngressError::AllNodesExhausted(reason).into_response();
    response
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("close"));
    response
}

fn upgrade_request(
    parts: &Parts,
    node: &UpstreamNode,
    remote: Option<IpAddr>,
    lead: Bytes,
) -> Request<Body> {
    let target = parts
        .uri
        .path_and_query()
        .cloned()
        .map(Into::into)
        .unwrap_or_else(|| axum::http::Uri::from_static("/"));
    let headers = upgrade_request_headers(parts, node, remote, lead.len());

    let mut request = Request::new(Body::from(lead));
    *request.method_mut() = parts.method.clone();
    *request.uri_mut() = target;
    *request.version_mut() = Version::HTTP_11;
    *request.headers_mut() = headers;
    request
}

/// A node that has sent at least one byte of its handshake response.
struct Answered {
    response: JoinHandle<Result<Response<Incoming>, hyper::Error>>,
    connection: JoinHandle<()>,
}

impl Answered {
    /// Wait for the rest of the response head.
    async fn head(mut self, limit: Duration) -> Result<Response<Incoming>, TransportError> {
        let failure = match tokio::time::timeout(limit, &mut self.response).await {
            Ok(Ok(Ok(response))) => return Ok(response),
            Ok(Ok(Err(e))) => TransportError::from_client(&e),
            Ok(Err(e)) => TransportError::Client(e.to_string()),
            Err(_) => TransportError::Timeout,
        };
        self.response.abort();
        self.connection.abort();
        Err(failure)
    }
}

/// Connect to `node`, send the handshake and wait for the first response
/// byte, all within `limit`.
async fn handshake(
    node: &UpstreamNode,
    request: Request<Body>,
    limit: Duration,
) -> Result<Answered, TransportError> {
    let (first_byte, answered) = oneshot::channel();
    let mut connection: Option<JoinHandle<()>> = None;
    let mut response: Option<JoinHandle<Result<Response<Incoming>, hyper::Error>>> = None;

    let attempt = async {
        let stream = TcpStream::connect(node.authority()).await?;
        stream.set_nodelay(true)?;
        let io = TokioIo::new(FirstByte::new(stream, first_byte));

        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| TransportError::from_client(&e))?;
        connection = Some(tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                tracing::debug!(error = %e, "Upstream handshake connection ended");
            }
        }));
        response = Some(tokio::spawn(async move { sender.send_request(request).await }));

        // The sender side lives in the connection; if it closes first, the
        // node hung up without a byte.
        answered.await.map_err(|_| TransportError::Closed)
    };
    let outcome = tokio::time::timeout(limit, attempt).await;

    let failure = match outcome {
        Ok(Ok(())) => match (response.take(), connection.take()) {
            (Some(response), Some(connection)) => {
                return Ok(Answered {
                    response,
                    connection,
                })
            }
            _ => TransportError::Closed,
        },
        Ok(Err(err)) => err,
        Err(_) => TransportError::Timeout,
    };
    if let Some(response) = response {
        response.abort();
    }
    if let Some(connection) = connection {
        connection.abort();
    }
    Err(failure)
}

/// Node socket that reports the first byte it reads.
struct FirstByte {
    inner: TcpStream,
    notify: Option<oneshot::Sender<()>>,
}

impl FirstByte {
    fn new(inner: TcpStream, notify: oneshot::Sender<()>) -> Self {
        Self {
            inner,
            notify: Some(notify),
        }
    }
}

impl AsyncRead for FirstByte {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if matches!(poll, Poll::Ready(Ok(()))) && buf.filled().len() > before {
            if let Some(notify) = self.notify.take() {
                let _ = notify.send(());
            }
        }
        poll
    }
}

impl AsyncWrite for FirstByte {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Splice the two upgraded streams until either side finishes.
async fn relay(client: OnUpgrade, node: OnUpgrade, relays: ConnectionTracker, node_id: String) {
    let (client, upstream) = match tokio::try_join!(client, node) {
        Ok(pair) => pair,
        Err(e) => {
            tracing::warn!(node = %node_id, error = %e, "Upgrade handoff failed");
            return;
        }
    };

    let guard = relays.track();
    metrics::relay_opened();
    let opened = Instant::now();

    let (mut client_rx, mut client_tx) = tokio::io::split(TokioIo::new(client));
    let (mut node_rx, mut node_tx) = tokio::io::split(TokioIo::new(upstream));

    let (ended_by, result) = tokio::select! {
        r = tokio::io::copy(&mut client_rx, &mut node_tx) => ("client", r),
        r = tokio::io::copy(&mut node_rx, &mut client_tx) => ("node", r),
        _ = closed(relays.closing()) => ("shutdown", Ok(0)),
    };

    let _ = node_tx.shutdown().await;
    let _ = client_tx.shutdown().await;
    metrics::relay_closed();

    match result {
        Ok(_) => tracing::debug!(
            relay_id = %guard.id(),
            node = %node_id,
            ended_by,
            duration_ms = opened.elapsed().as_millis() as u64,
            "Relay finished"
        ),
        Err(e) => tracing::debug!(
            relay_id = %guard.id(),
            node = %node_id,
            ended_by,
            error = %e,
            "Relay failed"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upgrade_request_uses_origin_form() {
        let (parts, _) = Request::builder()
            .uri("http://public.example.com/ws?room=7")
            .header("host", "public.example.com")
            .header("connection", "Upgrade")
            .header("upgrade", "websocket")
            .body(())
            .unwrap()
            .into_parts();
        let node = UpstreamNode::new("node-1", "127.0.0.1", 3001);

        let request = upgrade_request(&parts, &node, None, Bytes::new());
        assert_eq!(request.uri(), "/ws?room=7");
        assert_eq!(request.headers()["upgrade"], "websocket");
        assert_eq!(request.headers()["host"], "127.0.0.1:3001");
    }

    #[tokio::test]
    async fn refused_connect_is_a_transport_failure() {
        let vacant = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = vacant.local_addr().unwrap().port();
        drop(vacant);

        let node = UpstreamNode::new("node-1", "127.0.0.1", port);
        let request = Request::new(Body::empty());
        let result = handshake(&node, request, Duration::from_millis(500)).await;
        assert!(matches!(result, Err(TransportError::Io(_))));
    }

    #[tokio::test]
    async fn node_closing_without_a_byte_fails() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _node = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let node = UpstreamNode::new("node-1", "127.0.0.1", port);
        let result = handshake(&node, Request::new(Body::empty()), Duration::from_secs(2)).await;
        assert!(matches!(result, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn first_byte_commits_even_if_head_stalls() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _node = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"HTTP/1.1 1").await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let node = UpstreamNode::new("node-1", "127.0.0.1", port);
        let limit = Duration::from_millis(150);
        let answered = handshake(&node, Request::new(Body::empty()), limit)
            .await
            .unwrap();
        assert!(matches!(answered.head(limit).await, Err(TransportError::Timeout)));
    }

    #[tokio::test]
    async fn silent_node_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _hold = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let node = UpstreamNode::new("node-1", "127.0.0.1", port);
        let result = handshake(&node, Request::new(Body::empty()), Duration::from_millis(100)).await;
        assert!(matches!(result, Err(TransportError::Timeout)));
    }
}
