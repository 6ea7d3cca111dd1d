//! `FanoutServer`: the WebSocket endpoint and the publish service.
//!
//! Two listeners:
//! - socket: `GET /connect` (WebSocket upgrade)
//! - service: `POST /push/all`, `POST /push/room`, `GET /health`, `GET /metrics`,
//!   optionally over TLS

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum_server::tls_rustls::RustlsConfig;
use fanout_core::ids::ConnectionIdGenerator;
use fanout_settings::FanoutSettings;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::errors::ServerError;
use crate::health::{self, HealthResponse};
use crate::merge::MergeLayer;
use crate::push;
use crate::registry::{ConnectionRegistry, PushSink};
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::connection::ConnectionLimits;
use crate::websocket::{self, SocketContext};

/// Shared state of the publish service.
#[derive(Clone)]
pub struct ServiceState {
    /// Merge layer receiving publishes.
    pub merge: Arc<MergeLayer>,
    /// Registry, for health counters.
    pub registry: Arc<ConnectionRegistry>,
    /// Prometheus handle, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
    /// When the server started.
    pub start_time: Instant,
}

/// Bound addresses of a running server.
#[derive(Clone, Copy, Debug)]
pub struct ServerHandle {
    /// WebSocket endpoint.
    pub socket_addr: SocketAddr,
    /// Publish service.
    pub service_addr: SocketAddr,
}

/// The fan-out server.
///
/// Owns the registry and the merge layer; every other component receives
/// `Arc` handles to them.
pub struct FanoutServer {
    settings: FanoutSettings,
    registry: Arc<ConnectionRegistry>,
    merge: Arc<MergeLayer>,
    ids: Arc<ConnectionIdGenerator>,
    shutdown: Arc<ShutdownCoordinator>,
    service_stop: CancellationToken,
    socket_stop: CancellationToken,
    metrics: Option<PrometheusHandle>,
    start_time: Instant,
}

impl FanoutServer {
    /// Build the registry and merge layer and start their workers.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(settings: FanoutSettings, metrics: Option<PrometheusHandle>) -> Self {
        let shutdown = Arc::new(ShutdownCoordinator::new());
        let root = shutdown.token();

        let registry = Arc::new(ConnectionRegistry::new(
            &settings.registry,
            root.child_token(),
        ));
        let sink: Arc<dyn PushSink> = Arc::clone(&registry) as Arc<dyn PushSink>;
        let merge = Arc::new(MergeLayer::new(&settings.merge, sink, root.child_token()));

        Self {
            settings,
            registry,
            merge,
            ids: Arc::new(ConnectionIdGenerator::new()),
            service_stop: root.child_token(),
            socket_stop: root.child_token(),
            shutdown,
            metrics,
            start_time: Instant::now(),
        }
    }

    /// Router for the WebSocket listener.
    pub fn socket_router(&self) -> Router {
        let socket = &self.settings.socket;
        let ctx = SocketContext {
            registry: Arc::clone(&self.registry),
            ids: Arc::clone(&self.ids),
            limits: ConnectionLimits::from(socket),
            heartbeat_interval: socket.heartbeat_interval(),
            write_timeout: socket.write_timeout(),
            shutdown: self.shutdown.token(),
        };

        Router::new()
            .route("/connect", get(connect_handler))
            .with_state(ctx)
            // Bounds the upgrade handshake only; the socket outlives the response.
            .layer(timeout_layer(socket.read_timeout()))
            .layer(TraceLayer::new_for_http())
    }

    /// Router for the publish service.
    pub fn service_router(&self) -> Router {
        let state = ServiceState {
            merge: Arc::clone(&self.merge),
            registry: Arc::clone(&self.registry),
            metrics: self.metrics.clone(),
            start_time: self.start_time,
        };

        Router::new()
            .route("/push/all", post(push::push_all))
            .route("/push/room", post(push::push_room))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(state)
            .layer(timeout_layer(self.settings.service.request_timeout()))
            .layer(TraceLayer::new_for_http())
    }

    /// Bind both listeners and start serving in the background.
    pub async fn listen(&self) -> Result<ServerHandle, ServerError> {
        let socket_listener = bind(&self.settings.socket.host, self.settings.socket.port).await?;
        let socket_addr = local_addr(&socket_listener)?;
        let service_listener = bind(&self.settings.service.host, self.settings.service.port).await?;
        let service_addr = local_addr(&service_listener)?;

        let stop = self.socket_stop.clone();
        let router = self.socket_router();
        self.shutdown.track(tokio::spawn(async move {
            let serve = axum::serve(socket_listener, router)
                .with_graceful_shutdown(stop.cancelled_owned());
            if let Err(e) = serve.await {
                error!(error = %e, "socket listener failed");
            }
        }));
        info!(addr = %socket_addr, "websocket endpoint listening on /connect");

        let router = self.service_router();
        let stop = self.service_stop.clone();
        if let Some((cert, key)) = self.settings.service.tls_pair() {
            let config = RustlsConfig::from_pem_file(cert, key)
                .await
                .map_err(ServerError::CertInvalid)?;
            let std_listener = service_listener.into_std().map_err(|source| ServerError::Listener {
                addr: service_addr,
                source,
            })?;
            let handle = axum_server::Handle::new();
            let graceful = handle.clone();
            let grace = self.settings.service.request_timeout();
            self.shutdown.track(tokio::spawn(async move {
                stop.cancelled().await;
                graceful.graceful_shutdown(Some(grace));
            }));
            self.shutdown.track(tokio::spawn(async move {
                let serve = axum_server::from_tcp_rustls(std_listener, config)
                    .handle(handle)
                    .serve(router.into_make_service());
                if let Err(e) = serve.await {
                    error!(error = %e, "service listener failed");
                }
            }));
            info!(addr = %service_addr, "publish service listening (tls)");
        } else {
            self.shutdown.track(tokio::spawn(async move {
                let serve = axum::serve(service_listener, router)
                    .with_graceful_shutdown(stop.cancelled_owned());
                if let Err(e) = serve.await {
                    error!(error = %e, "service listener failed");
                }
            }));
            info!(addr = %service_addr, "publish service listening");
        }

        Ok(ServerHandle {
            socket_addr,
            service_addr,
        })
    }

    /// Stop everything in order: publish service, WebSocket endpoint, merge
    /// layer, registry, then open connections. Waits up to `timeout` for all
    /// tasks and aborts the rest.
    pub async fn stop(&self, timeout: Duration) {
        info!("stopping publish service");
        self.service_stop.cancel();
        info!("stopping websocket endpoint");
        self.socket_stop.cancel();
        info!("stopping merge layer");
        self.merge.shutdown();
        info!("stopping connection registry");
        self.registry.shutdown();

        let mut handles = self.merge.take_tasks();
        handles.extend(self.registry.take_tasks());
        self.shutdown.graceful_shutdown(handles, Some(timeout)).await;
        info!("shutdown complete");
    }

    /// Get the connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Get the merge layer.
    pub fn merge(&self) -> &Arc<MergeLayer> {
        &self.merge
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }
}

/// Answers `408 Request Timeout` once `timeout` elapses.
fn timeout_layer(timeout: Duration) -> TimeoutLayer {
    TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, timeout)
}

async fn bind(host: &str, port: u16) -> Result<TcpListener, ServerError> {
    TcpListener::bind((host, port))
        .await
        .map_err(|source| ServerError::Bind {
            addr: format!("{host}:{port}"),
            source,
        })
}

fn local_addr(listener: &TcpListener) -> Result<SocketAddr, ServerError> {
    listener.local_addr().map_err(|source| ServerError::Bind {
        addr: "<bound listener>".into(),
        source,
    })
}

/// GET /connect
async fn connect_handler(ws: WebSocketUpgrade, State(ctx): State<SocketContext>) -> Response {
    if ctx.shutdown.is_cancelled() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    ws.on_upgrade(move |socket| websocket::serve_socket(socket, ctx))
}

/// GET /health
async fn health_handler(State(state): State<ServiceState>) -> Json<HealthResponse> {
    let resp = health::health_check(
        state.start_time,
        state.registry.connection_count(),
        state.registry.shard_count(),
    );
    Json(resp)
}

/// GET /metrics
async fn metrics_handler(State(state): State<ServiceState>) -> Response {
    match &state.metrics {
        Some(handle) => crate::metrics::render(handle).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
