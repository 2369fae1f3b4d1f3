//! Orchestrator process entry point: loads configuration, wires up
//! `OrchestratorServices`, starts the worker pool and sweepers, and serves
//! the HTTP API.

use std::process::ExitCode;
use std::sync::Arc;

use agentflow_orchestrator::api::{self, AppState};
use agentflow_orchestrator::clients::{HttpAgentClient, UnavailableLlmClient};
use agentflow_orchestrator::hitl::{self, NullNotificationChannel};
use agentflow_orchestrator::intake::IntakeClassifier;
use agentflow_orchestrator::webhook::WebhookIngress;
use agentflow_orchestrator::{config::ConfigError, locks, registry, OrchestratorConfig, OrchestratorServices};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

/// Exit codes per spec §6.7.
const EXIT_OK: u8 = 0;
const EXIT_CONFIG_ERROR: u8 = 64;
/// Surfaced by a future process-wide replay-integrity escalation; not yet wired.
#[allow(dead_code)]
const EXIT_INTEGRITY_ERROR: u8 = 70;
const EXIT_STORE_UNAVAILABLE: u8 = 75;

enum BootError {
    Config(ConfigError),
    Bind(std::io::Error),
}

impl BootError {
    fn exit_code(&self) -> u8 {
        match self {
            BootError::Config(_) => EXIT_CONFIG_ERROR,
            BootError::Bind(_) => EXIT_STORE_UNAVAILABLE,
        }
    }
}

impl std::fmt::Display for BootError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BootError::Config(e) => write!(f, "configuration error: {e}"),
            BootError::Bind(e) => write!(f, "failed to bind HTTP listener: {e}"),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agentflow_orchestrator=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run().await {
        Ok(()) => ExitCode::from(EXIT_OK),
        Err(err) => {
            tracing::error!("{err}");
            ExitCode::from(err.exit_code())
        }
    }
}

async fn run() -> Result<(), BootError> {
    let config = OrchestratorConfig::from_env().map_err(BootError::Config)?;
    tracing::info!("agentflow-orchestrator starting");

    let services = OrchestratorServices::with_collaborators(
        config.clone(),
        Arc::new(NullNotificationChannel),
        Arc::new(HttpAgentClient::new()),
        None,
    );

    // Default LLM client is a clean "not configured" stub until a provider
    // is wired; the intake classifier degrades to its keyword-only fast
    // path when every message falls through to it.
    let intake = Arc::new(IntakeClassifier::new(Arc::new(UnavailableLlmClient)));
    let webhooks = Arc::new(WebhookIngress::new(&services.config));

    if let Err(err) = services.worker_pool.start().await {
        tracing::error!("worker pool failed to start: {err}");
    }

    locks::spawn_sweeper(services.locks.clone());
    registry::spawn_sweeper(services.registry.clone(), services.config.heartbeat_interval);
    let hitl_services = services.clone();
    hitl::spawn_sweeper(services.hitl.clone(), move |expired| {
        let hitl_services = hitl_services.clone();
        async move { hitl_services.sync_expired_approvals(expired).await }
    });

    let state = AppState { services, webhooks, intake };

    let app = api::routes(state)
        .merge(SwaggerUi::new("/docs").url("/docs/openapi.json", api::ApiDoc::openapi()))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http());

    let addr = std::env::var("ORCHESTRATOR_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await.map_err(BootError::Bind)?;
    tracing::info!("listening on {addr}");

    if let Err(err) = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await {
        tracing::error!("server error: {err}");
    }

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
