//! HTTP server setup and request dispatch.
//!
//! # Responsibilities
//! - Build the Axum router: `/healthz` plus a catch-all proxy handler
//! - Wire up middleware (request ID, tracing)
//! - Admit every proxied request through the admission controller
//! - Dispatch to the HTTP or upgrade forwarder by request kind
//! - Serve until the shutdown signal fires

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderName, Request},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::config::IngressConfig;
use crate::http::client::UpstreamClient;
use crate::http::error::IngressError;
use crate::http::forward::forward_http;
use crate::http::headers::RequestKind;
use crate::http::upgrade::forward_upgrade;
use crate::load_balancer::node::NodeStatus;
use crate::load_balancer::planner::RoutingPlanner;
use crate::load_balancer::registry::NodeRegistry;
use crate::net::connection::ConnectionTracker;
use crate::observability::metrics;
use crate::resilience::admission::{AdmissionController, AdmissionSnapshot};
use crate::resilience::circuit_breaker::CircuitBreaker;

pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Everything a request handler needs, built once at startup.
pub struct IngressState {
    pub config: Arc<IngressConfig>,
    pub registry: NodeRegistry,
    pub breaker: CircuitBreaker,
    pub planner: RoutingPlanner,
    pub admission: AdmissionController,
    pub client: UpstreamClient,
    pub relays: ConnectionTracker,
}

impl IngressState {
    pub fn new(config: IngressConfig) -> Self {
        let registry = NodeRegistry::new(&config.upstream.nodes);
        let client = UpstreamClient::new(&config.pool, config.upstream.timeout(), registry.len());

        Self {
            breaker: CircuitBreaker::new(&config.circuit_breaker),
            planner: RoutingPlanner::new(config.affinity.clone()),
            admission: AdmissionController::new(&config.admission),
            relays: ConnectionTracker::new(),
            registry,
            client,
            config: Arc::new(config),
        }
    }

    /// The `/healthz` body.
    pub fn health(&self) -> HealthReport {
        HealthReport {
            ok: true,
            admission: self.admission.snapshot(),
            relays: self.relays.active_count(),
            nodes: self.registry.statuses(&self.breaker),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub ok: bool,
    pub admission: AdmissionSnapshot,
    pub relays: u64,
    pub nodes: Vec<NodeStatus>,
}

/// The ingress HTTP server.
pub struct IngressServer {
    router: Router,
    state: Arc<IngressState>,
}

impl IngressServer {
    pub fn new(config: IngressConfig) -> Self {
        let state = Arc::new(IngressState::new(config));
        let router = Self::build_router(state.clone());
        Self { router, state }
    }

    fn build_router(state: Arc<IngressState>) -> Router {
        Router::new()
            .route("/healthz", get(healthz).fallback(proxy_handler))
            .fallback(proxy_handler)
            .with_state(state)
            .layer(
                ServiceBuilder::new()
                    .layer(SetRequestIdLayer::new(X_REQUEST_ID, MakeRequestUuid))
                    .layer(TraceLayer::new_for_http())
                    .layer(PropagateRequestIdLayer::new(X_REQUEST_ID)),
            )
    }

    pub fn state(&self) -> Arc<IngressState> {
        self.state.clone()
    }

    /// Serve on `listener` until `shutdown` fires, then drain in-flight requests.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, nodes = self.state.registry.len(), "Ingress listening");

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("Ingress no longer accepting connections");
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// `GET /healthz` exactly; anything with a query string is proxied.
async fn healthz(State(state): State<Arc<IngressState>>, request: Request<Body>) -> Response {
    if request.uri().query().is_some() {
        return proxy_handler(State(state), request).await;
    }
    Json(state.health()).into_response()
}

/// Catch-all handler: admit, then forward.
async fn proxy_handler(State(state): State<Arc<IngressState>>, request: Request<Body>) -> Response {
    let start = Instant::now();
    let remote = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let request_id = request
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();
    let kind = RequestKind::of(request.headers());

    tracing::debug!(
        request_id = %request_id,
        method = %request.method(),
        path = %request.uri().path(),
        kind = ?kind,
        "Proxying request"
    );

    let permit = match state.admission.enter().await {
        Ok(permit) => permit,
        Err(reason) => {
            tracing::warn!(request_id = %request_id, reason = %reason, "Request not admitted");
            metrics::record_request(request.method().as_str(), 503, "none", start);
            return IngressError::from(reason).into_response();
        }
    };

    let response = match kind {
        RequestKind::Standard => match forward_http(&state, request, remote, &request_id).await {
            Ok(response) => response,
            Err(err) => err.into_response(),
        },
        RequestKind::ProtocolUpgrade => forward_upgrade(&state, request, remote, &request_id).await,
    };

    // The slot is held until the response head is ready; bodies and relays
    // stream outside admission.
    drop(permit);
    response
}
