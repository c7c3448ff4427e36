use crate::config::Config;
use crate::engine::AdmissionEngine;
use crate::error::Result;
use crate::handlers::{
    check_admission, get_policies, health_check, metrics, readiness_check, replace_policies, AppState,
    SharedState,
};
use crate::middleware::logging_middleware;
use axum::routing::{get, post};
use axum::{middleware, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Routes of the standalone decision service.
///
/// Cross-origin access is granted to the decision and status routes only;
/// the policy admin route stays same-origin.
pub fn create_app(state: SharedState) -> Router {
    let public = Router::new()
        .route("/v1/admission/check", post(check_admission))
        .route("/metrics", get(metrics))
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .layer(CorsLayer::permissive());

    let admin = Router::new().route("/v1/policies", get(get_policies).put(replace_policies));

    public
        .merge(admin)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn(logging_middleware)),
        )
}

pub struct Server {
    engine: Arc<AdmissionEngine>,
    bind_addr: SocketAddr,
    sweep_interval: Duration,
}

impl Server {
    pub fn new(config: &Config) -> Result<Self> {
        let engine = Arc::new(AdmissionEngine::from_config(config)?);
        Ok(Self {
            engine,
            bind_addr: config.bind_addr,
            sweep_interval: config.sweep_interval(),
        })
    }

    pub fn engine(&self) -> &Arc<AdmissionEngine> {
        &self.engine
    }

    pub async fn run(self) -> std::result::Result<(), Box<dyn std::error::Error>> {
        let sweeper = self.engine.spawn_sweeper(self.sweep_interval);
        let app = create_app(AppState::new(Arc::clone(&self.engine)));
        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;

        tracing::info!("Admission gate listening on {}", self.bind_addr);
        tracing::info!("Decision endpoint available at POST /v1/admission/check");
        tracing::info!("Health check available at /health");

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

        sweeper.abort();
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::error!("failed to install signal handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
