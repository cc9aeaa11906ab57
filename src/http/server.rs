//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create the Axum router with the device endpoints under the route prefix
//! - Wire up middleware (tracing, request ID, body limit)
//! - Serve plain TCP or TLS with graceful shutdown
//! - Apply live `[proxy]` settings from the config watcher
//! - Run the rate limit sweeper and traffic log consumer

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tower::ServiceBuilder;
use tower_http::{
    limit::RequestBodyLimitLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::config::{ProxyConfig, ProxySettings, SettingsHandle};
use crate::http::handlers;
use crate::net::tls::load_tls_config;
use crate::observability::traffic::{self, FileTrafficSink, TrafficLogger, TrafficRecord};
use crate::proxy::ForwardingEngine;
use crate::security::{AccessControl, RateLimiter};

/// Time allowed for open connections to finish after shutdown on TLS.
const TLS_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to build upstream client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ProxyConfig>,
    pub settings: Arc<SettingsHandle>,
    pub access: Arc<AccessControl>,
    pub engine: ForwardingEngine,
    /// Fires once when the server starts shutting down.
    pub closing: broadcast::Sender<()>,
}

/// HTTP server for the device gateway.
pub struct HttpServer {
    router: Router,
    config: Arc<ProxyConfig>,
    settings: Arc<SettingsHandle>,
    limiter: Arc<RateLimiter>,
    traffic_rx: mpsc::Receiver<TrafficRecord>,
    closing: broadcast::Sender<()>,
}

impl HttpServer {
    /// Create a new HTTP server with the given configuration.
    pub fn new(config: ProxyConfig) -> Result<Self, ServerError> {
        let config = Arc::new(config);
        let settings = Arc::new(SettingsHandle::new(config.proxy.clone()));
        let limiter = Arc::new(RateLimiter::new());
        let access = Arc::new(AccessControl::new(
            settings.clone(),
            limiter.clone(),
            config.rate_limit.clone(),
        ));

        let (traffic, traffic_rx) = TrafficLogger::channel(config.traffic_log.queue_capacity);
        let engine = ForwardingEngine::new(traffic)?;
        let (closing, _) = broadcast::channel(1);

        let state = AppState {
            config: config.clone(),
            settings: settings.clone(),
            access,
            engine,
            closing: closing.clone(),
        };

        let router = Self::build_router(&config, state);
        Ok(Self {
            router,
            config,
            settings,
            limiter,
            traffic_rx,
            closing,
        })
    }

    /// Build the Axum router with all middleware layers.
    fn build_router(config: &ProxyConfig, state: AppState) -> Router {
        let device = Router::new()
            .route("/entry", get(handlers::entry).post(handlers::entry))
            .route("/ping", get(handlers::ping))
            .route("/passphrase", get(handlers::passphrase))
            .route("/pro_info", get(handlers::pro_info))
            .route("/pro-info", get(handlers::pro_info))
            .route("/pro_info/{code}", get(handlers::pro_info_code))
            .route("/pro-info/{code}", get(handlers::pro_info_code))
            .route("/upload", post(handlers::upload))
            .route("/weather/v1", get(handlers::weather))
            .route("/transport", post(handlers::transport_subscribe))
            .route("/transport/v7", post(handlers::transport_subscribe))
            .route("/transport/v7/subscribe", post(handlers::transport_subscribe))
            .route("/transport/put", post(handlers::transport_put))
            .route("/transport/v7/put", post(handlers::transport_put))
            .route("/transport/device/{serial}", get(handlers::transport_device))
            .route("/transport/v7/device/{serial}", get(handlers::transport_device));

        Router::new()
            .route("/", get(handlers::root))
            .route("/health", get(handlers::health))
            .nest(&config.api.route_prefix, device)
            .with_state(state)
            .layer(DefaultBodyLimit::disable())
            .layer(
                ServiceBuilder::new()
                    .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                    .layer(TraceLayer::new_for_http())
                    .layer(PropagateRequestIdLayer::x_request_id())
                    .layer(RequestBodyLimitLayer::new(config.listener.max_body_bytes)),
            )
    }

    /// Router without a listener, for in-process use.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Live settings shared with the handlers.
    pub fn settings(&self) -> Arc<SettingsHandle> {
        self.settings.clone()
    }

    /// Run the server, accepting connections on the given listener.
    ///
    /// Returns after `shutdown` fires and in-flight requests have finished.
    /// Open subscriptions are closed at their next line boundary.
    pub async fn run(
        self,
        listener: TcpListener,
        config_updates: mpsc::UnboundedReceiver<ProxySettings>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        let addr = listener.local_addr()?;
        let HttpServer {
            router,
            config,
            settings,
            limiter,
            traffic_rx,
            closing,
        } = self;

        tracing::info!(
            address = %addr,
            route_prefix = %config.api.route_prefix,
            upstream = %settings.snapshot().upstream_base_url,
            tls = config.listener.tls.is_some(),
            "HTTP server starting"
        );

        let sweep_interval = Duration::from_secs(config.rate_limit.sweep_interval_secs.max(1));
        tokio::spawn(limiter.run_sweeper(sweep_interval, shutdown.resubscribe()));

        let sink = FileTrafficSink::new(&config.traffic_log.directory);
        let consumer = tokio::spawn(traffic::run_consumer(
            traffic_rx,
            sink,
            shutdown.resubscribe(),
        ));

        tokio::spawn(apply_settings_updates(
            settings,
            config_updates,
            shutdown.resubscribe(),
        ));

        let app = router.into_make_service_with_connect_info::<SocketAddr>();

        match &config.listener.tls {
            None => {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move {
                        let _ = shutdown.recv().await;
                        tracing::info!("Shutdown signal received");
                        let _ = closing.send(());
                    })
                    .await?;
            }
            Some(tls) => {
                let rustls =
                    load_tls_config(Path::new(&tls.cert_path), Path::new(&tls.key_path)).await?;
                let handle = axum_server::Handle::new();
                let signal = handle.clone();
                tokio::spawn(async move {
                    let _ = shutdown.recv().await;
                    tracing::info!("Shutdown signal received");
                    let _ = closing.send(());
                    signal.graceful_shutdown(Some(TLS_DRAIN_TIMEOUT));
                });

                axum_server::from_tcp_rustls(listener.into_std()?, rustls)
                    .handle(handle)
                    .serve(app)
                    .await?;
            }
        }

        // Pending traffic records are flushed before returning.
        let _ = consumer.await;
        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Store each reloaded `[proxy]` section into the live settings.
async fn apply_settings_updates(
    settings: Arc<SettingsHandle>,
    mut updates: mpsc::UnboundedReceiver<ProxySettings>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Some(proxy) => settings.update(proxy),
                None => break,
            },
            _ = shutdown.recv() => break,
        }
    }
}
