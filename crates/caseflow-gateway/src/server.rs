//! HTTP server implementation using Axum.

use std::sync::Arc;

use axum::{
    routing::{delete, get, post, put},
    Router,
};
use caseflow_bus::{MessageChannel, TopicBus};
use caseflow_core::config::GatewayConfig;
use caseflow_dispatch::Dispatcher;
use caseflow_monitor::MarkerCache;
use caseflow_scheduler::ScheduleEngine;
use caseflow_store::Store;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared state for the gateway server.
#[derive(Clone)]
pub struct AppState {
    pub config: GatewayConfig,
    pub store: Arc<Store>,
    pub engine: Arc<ScheduleEngine>,
    pub dispatcher: Arc<Dispatcher>,
    pub channel: Arc<dyn MessageChannel>,
    pub bus: Arc<TopicBus>,
    pub markers: Arc<MarkerCache>,
    pub start_time: std::time::Instant,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let shared = Arc::new(state);

    let api = Router::new()
        // Scheduled jobs
        .route("/api/v1/jobs", get(super::routes::list_jobs))
        .route("/api/v1/jobs", post(super::routes::create_job))
        .route("/api/v1/jobs/{id}", get(super::routes::get_job))
        .route("/api/v1/jobs/{id}", put(super::routes::update_job))
        .route("/api/v1/jobs/{id}", delete(super::routes::delete_job))
        .route("/api/v1/jobs/{id}/pause", post(super::routes::pause_job))
        .route("/api/v1/jobs/{id}/resume", post(super::routes::resume_job))
        // Run entry points
        .route("/api/v1/run/case/{id}", post(super::routes::run_case))
        .route("/api/v1/run/suite/{id}", post(super::routes::run_suite))
        .route("/api/v1/run/task/{id}", post(super::routes::run_task))
        // Run records
        .route("/api/v1/records/tasks", get(super::routes::list_task_records))
        .route("/api/v1/records/tasks/{id}", get(super::routes::get_task_record))
        .route("/api/v1/records/tasks/{id}", delete(super::routes::delete_task_record))
        .route("/api/v1/records/suites", get(super::routes::list_suite_records))
        .route("/api/v1/records/suites/{id}", get(super::routes::get_suite_record))
        .route("/api/v1/records/suites/{id}", delete(super::routes::delete_suite_record))
        .route("/api/v1/records/cases", get(super::routes::list_case_records))
        .route("/api/v1/records/cases/{id}", get(super::routes::get_case_record))
        .route("/api/v1/records/cases/{id}", delete(super::routes::delete_case_record))
        .route("/api/v1/records/cases/{id}/result", post(super::routes::report_case_result))
        // Agent registry
        .route("/api/v1/agents", get(super::routes::list_agents))
        .route("/api/v1/agents/register", post(super::routes::register_agent))
        .route("/api/v1/agents/{id}", get(super::routes::get_agent))
        .route("/api/v1/agents/{id}", delete(super::routes::delete_agent))
        .route("/api/v1/agents/{id}/heartbeat", post(super::routes::agent_heartbeat))
        .route("/api/v1/agents/{id}/workload", post(super::routes::agent_workload))
        .route("/api/v1/agents/{id}/events", post(super::routes::agent_events))
        // Health check
        .route("/health", get(super::routes::health_check))
        // Live relay
        .route("/ws/{agent_id}", get(super::ws::ws_handler));

    api.layer(
        CorsLayer::new()
            .allow_methods([
                axum::http::Method::GET,
                axum::http::Method::POST,
                axum::http::Method::PUT,
                axum::http::Method::DELETE,
                axum::http::Method::OPTIONS,
            ])
            .allow_headers(Any)
            .allow_origin(Any),
    )
    .layer(TraceLayer::new_for_http())
    .with_state(shared)
}

/// Bind and serve until shutdown.
pub async fn start(state: AppState) -> anyhow::Result<()> {
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("gateway listening on http://{addr}");
    axum::serve(listener, router).await?;
    Ok(())
}
