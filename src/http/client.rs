//! Upstream HTTP client.
//!
//! # Responsibilities
//! - Keep-alive connection pool shared by every node
//! - Cap concurrent connections per node (`pool.max_sockets`)
//! - Enforce the upstream timeout up to the response headers
//!
//! # Design Decisions
//! - The socket permit rides along with the response body, so a slow
//!   download keeps its connection slot until the last byte
//! - Waiting for a socket permit counts against the upstream timeout

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response};
use futures_util::StreamExt;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use tokio::sync::Semaphore;

use crate::config::PoolConfig;
use crate::http::error::TransportError;

/// Pooled HTTP/1.1 client for upstream nodes.
#[derive(Clone)]
pub struct UpstreamClient {
    client: Client<HttpConnector, Body>,
    sockets: Arc<Vec<Arc<Semaphore>>>,
    timeout: Duration,
}

impl UpstreamClient {
    /// Build the pool for `node_count` nodes.
    pub fn new(pool: &PoolConfig, timeout: Duration, node_count: usize) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.set_connect_timeout(Some(timeout));
        if pool.keep_alive {
            connector.set_keepalive(Some(Duration::from_millis(pool.keep_alive_ms)));
        }

        let idle_per_node = if pool.keep_alive { pool.max_free_sockets } else { 0 };
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(idle_per_node)
            .build(connector);

        let sockets = (0..node_count)
            .map(|_| Arc::new(Semaphore::new(pool.max_sockets.max(1))))
            .collect();

        Self {
            client,
            sockets: Arc::new(sockets),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send `request` to the node at `index` and wait for the response headers.
    pub async fn send(
        &self,
        index: usize,
        request: Request<Body>,
    ) -> Result<Response<Body>, TransportError> {
        let sockets = self.sockets.get(index).cloned();

        let attempt = async {
            let permit = match sockets {
                Some(sem) => Some(
                    sem.acquire_owned()
                        .await
                        .map_err(|_| TransportError::Client("connection pool closed".into()))?,
                ),
                None => None,
            };
            let response = self
                .client
                .request(request)
                .await
                .map_err(|e| TransportError::from_client(&e))?;
            Ok::<_, TransportError>((permit, response))
        };

        let (permit, response) = tokio::time::timeout(self.timeout, attempt)
            .await
            .map_err(|_| TransportError::Timeout)??;

        Ok(hold_while_streaming(response.map(Body::new), permit))
    }
}

/// Keep `guard` alive until the response body has been consumed or dropped.
pub fn hold_while_streaming<G>(response: Response<Body>, guard: G) -> Response<Body>
where
    G: Send + 'static,
{
    let (parts, body) = response.into_parts();
    let stream = body.into_data_stream().map(move |chunk| {
        let _held = &guard;
        chunk
    });
    Response::from_parts(parts, Body::from_stream(stream))
}
