//! Gateway HTTP surface.
//!
//! - `POST /`: liveness probe, answers "Hit the broker"
//! - `POST /handle`: dispatch an inbound action document via the route table
//! - `POST /log-grpc`: dispatch a log entry through the gRPC adapter
//!
//! Successful results answer `202 Accepted`; failed results and rejected
//! requests answer `400 Bad Request`. The body is always a `CanonicalResult`.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::action::{Action, CanonicalRequest, CanonicalResult};
use crate::bus::BrokerConnection;
use crate::config::Config;
use crate::dispatch::{DispatchError, Dispatcher, RouteError, RouteTable, TransportKind};
use crate::lifecycle::{Connector, LifecycleManager};
use crate::transport::{Adapter, GrpcAdapter, HttpAdapter, QueueAdapter, RpcAdapter, TransportError};
use crate::utils::bootstrap::wait_for_shutdown;

/// Errors assembling the gateway.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Route(#[from] RouteError),
}

/// Shared state for axum handlers.
#[derive(Clone)]
pub struct GatewayState {
    dispatcher: Arc<Dispatcher>,
    grpc: Arc<Dispatcher>,
}

impl GatewayState {
    pub fn new(dispatcher: Dispatcher, grpc: Dispatcher) -> Self {
        Self {
            dispatcher: Arc::new(dispatcher),
            grpc: Arc::new(grpc),
        }
    }

    /// Build every adapter from configuration and resolve the route table.
    ///
    /// The async-publish adapter borrows connections from `manager`.
    pub fn from_config<C>(
        config: &Config,
        manager: Arc<LifecycleManager<C>>,
    ) -> Result<Self, GatewayError>
    where
        C: Connector + 'static,
        C::Handle: BrokerConnection,
    {
        let services = &config.services;
        let grpc: Arc<dyn Adapter> =
            Arc::new(GrpcAdapter::new(&services.grpc_address, services.grpc_deadline()));

        let http: Arc<dyn Adapter> = Arc::new(HttpAdapter::new(
            services.http_endpoints(),
            services.http_timeout(),
        )?);
        let rpc: Arc<dyn Adapter> = Arc::new(RpcAdapter::new(
            &services.rpc_address,
            &services.rpc_method,
            services.rpc_timeout(),
        ));
        let queue: Arc<dyn Adapter> = Arc::new(QueueAdapter::new(
            manager,
            &config.messaging.exchange,
            services.queue_timeout(),
        ));

        let adapters = HashMap::from([
            (TransportKind::Http, http),
            (TransportKind::Rpc, rpc),
            (TransportKind::Grpc, Arc::clone(&grpc)),
            (TransportKind::Queue, queue),
        ]);

        let routes = RouteTable::from_kinds(&config.routes.kinds(), &adapters)?;
        info!(routes = ?routes, "Route table built");

        Ok(Self::new(
            Dispatcher::new(routes),
            Dispatcher::new(RouteTable::new().with_route(Action::Log, grpc)),
        ))
    }
}

/// Build the axum router (separated for testing).
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/", post(broker))
        .route("/handle", post(handle_submission))
        .route("/log-grpc", post(log_via_grpc))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the gateway on `listener` until `shutdown` flips.
pub async fn serve(
    listener: TcpListener,
    state: GatewayState,
    shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    info!(addr = ?listener.local_addr()?, "Gateway listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(wait_for_shutdown(shutdown))
        .await
}

// ============================================================================
// Handlers
// ============================================================================

type Reply = (StatusCode, Json<CanonicalResult>);

async fn broker() -> Reply {
    (
        StatusCode::ACCEPTED,
        Json(CanonicalResult::success("Hit the broker")),
    )
}

async fn handle_submission(State(state): State<GatewayState>, body: Bytes) -> Reply {
    respond(state.dispatcher.dispatch_json(&body).await)
}

async fn log_via_grpc(State(state): State<GatewayState>, body: Bytes) -> Reply {
    let outcome = match CanonicalRequest::from_json(&body) {
        Ok(request) => state.grpc.dispatch(&request).await,
        Err(e) => Err(DispatchError::from(e)),
    };
    respond(outcome)
}

fn respond(outcome: Result<CanonicalResult, DispatchError>) -> Reply {
    match outcome {
        Ok(result) if result.success => (StatusCode::ACCEPTED, Json(result)),
        Ok(result) => (StatusCode::BAD_REQUEST, Json(result)),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(CanonicalResult::failure(e.to_string())),
        ),
    }
}
