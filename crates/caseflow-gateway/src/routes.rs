//! API route handlers for the gateway.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use caseflow_bus::{Event, EventKind};
use caseflow_core::types::{CaseStatus, CronjobKind, Workload};
use caseflow_core::CaseflowError;
use caseflow_dispatch::{AgentSelector, RunRequest};
use caseflow_scheduler::Trigger;
use caseflow_store::{AgentRegistration, JobDefInput};
use serde::Deserialize;

use super::server::AppState;

/// Error envelope every handler funnels through. The error kind maps
/// onto the HTTP status; the message goes to the client verbatim.
#[derive(Debug)]
pub struct ApiError(CaseflowError);

impl From<CaseflowError> for ApiError {
    fn from(e: CaseflowError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CaseflowError::NotFound(_) => StatusCode::NOT_FOUND,
            CaseflowError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            CaseflowError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({
            "ok": false,
            "kind": self.0.kind(),
            "error": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult = Result<Json<serde_json::Value>, ApiError>;

fn ok(data: serde_json::Value) -> ApiResult {
    Ok(Json(serde_json::json!({ "ok": true, "data": data })))
}

/// Health check endpoint.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "caseflow-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

// ─── Scheduled jobs ───────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct JobBody {
    pub name: String,
    pub username: String,
    #[serde(default)]
    pub project: Option<String>,
    pub env_id: i64,
    pub task_id: i64,
    pub trigger: Trigger,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl JobBody {
    fn to_input(&self) -> JobDefInput {
        let (kind, params) = self.trigger.to_parts();
        JobDefInput {
            name: self.name.clone(),
            username: self.username.clone(),
            project: self.project.clone(),
            env_id: self.env_id,
            task_id: self.task_id,
            trigger_kind: kind.to_string(),
            trigger_params: params,
            cronjob_kind: CronjobKind::Recurring,
        }
    }
}

pub async fn list_jobs(State(state): State<Arc<AppState>>) -> ApiResult {
    let defs = state.store.list_job_defs()?;
    let live = state.engine.list_jobs();
    let jobs: Vec<serde_json::Value> = defs
        .into_iter()
        .map(|def| {
            let snapshot = live.iter().find(|j| j.id == def.id);
            serde_json::json!({
                "def": def,
                "next_fire": snapshot.and_then(|s| s.next_fire),
                "paused": snapshot.map(|s| s.paused),
            })
        })
        .collect();
    ok(serde_json::json!(jobs))
}

pub async fn get_job(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> ApiResult {
    let def = state.store.get_job_def(id)?;
    ok(serde_json::to_value(def).map_err(CaseflowError::from)?)
}

/// Create the definition, then register it with the engine. An engine
/// rejection rolls the definition back so the two never drift.
pub async fn create_job(
    State(state): State<Arc<AppState>>,
    Json(body): Json<JobBody>,
) -> ApiResult {
    state.store.get_task(body.task_id)?;
    state.store.get_environment(body.env_id)?;
    let def = state.store.create_job_def(&body.to_input())?;
    if let Err(e) = state.engine.create_job(def.id, &def.name, body.trigger.clone()) {
        state.store.delete_job_def(def.id)?;
        return Err(e.into());
    }
    if !body.enabled {
        state.store.set_job_def_enabled(def.id, false)?;
        state.engine.pause_job(def.id)?;
    }
    ok(serde_json::to_value(def).map_err(CaseflowError::from)?)
}

pub async fn update_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<JobBody>,
) -> ApiResult {
    body.trigger.validate(chrono::Utc::now()).map_err(ApiError::from)?;
    let def = match state.store.update_job_def(id, &body.to_input()) {
        Ok(def) => def,
        // modify-without-create still creates, mirroring the engine
        Err(CaseflowError::NotFound(_)) => state.store.create_job_def(&body.to_input())?,
        Err(e) => return Err(e.into()),
    };
    state.engine.modify_job(def.id, &def.name, body.trigger.clone())?;
    ok(serde_json::to_value(def).map_err(CaseflowError::from)?)
}

pub async fn delete_job(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> ApiResult {
    state.engine.remove_job(id)?;
    state.store.delete_job_def(id)?;
    ok(serde_json::json!({ "deleted": id }))
}

pub async fn pause_job(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> ApiResult {
    state.store.set_job_def_enabled(id, false)?;
    state.engine.pause_job(id)?;
    ok(serde_json::json!({ "paused": id }))
}

pub async fn resume_job(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> ApiResult {
    state.store.set_job_def_enabled(id, true)?;
    state.engine.resume_job(id)?;
    ok(serde_json::json!({ "resumed": id }))
}

// ─── Run entry points ─────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RunBody {
    pub env_id: i64,
    pub username: String,
    /// Explicit agent ids; omitted means pick for me.
    #[serde(default)]
    pub agents: Vec<String>,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub reset_cache: bool,
}

impl RunBody {
    fn to_request(&self, spread_default: bool) -> RunRequest {
        let selector = if !self.agents.is_empty() {
            AgentSelector::Explicit(self.agents.clone())
        } else if spread_default {
            AgentSelector::Spread
        } else {
            AgentSelector::FirstOnline
        };
        RunRequest {
            env_id: self.env_id,
            username: self.username.clone(),
            selector,
            debug: self.debug,
            reset_cache: self.reset_cache,
            cronjob_type: CronjobKind::AdHoc,
        }
    }
}

pub async fn run_case(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<RunBody>,
) -> ApiResult {
    let dispatch = state.dispatcher.dispatch_case(id, &body.to_request(false)).await?;
    ok(serde_json::to_value(dispatch).map_err(CaseflowError::from)?)
}

pub async fn run_suite(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<RunBody>,
) -> ApiResult {
    let dispatch = state.dispatcher.dispatch_suite(id, &body.to_request(false)).await?;
    ok(serde_json::to_value(dispatch).map_err(CaseflowError::from)?)
}

pub async fn run_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<RunBody>,
) -> ApiResult {
    let receipt = state.dispatcher.dispatch_task(id, &body.to_request(true)).await?;
    ok(serde_json::to_value(receipt).map_err(CaseflowError::from)?)
}

// ─── Run records ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RecordListQuery {
    pub task_id: Option<i64>,
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_size")]
    pub size: i64,
}

fn default_page() -> i64 {
    1
}

fn default_size() -> i64 {
    20
}

pub async fn list_task_records(
    State(state): State<Arc<AppState>>,
    Query(q): Query<RecordListQuery>,
) -> ApiResult {
    let (total, records) = state.store.list_task_records(q.task_id, q.page, q.size)?;
    ok(serde_json::json!({
        "total": total,
        "page": q.page,
        "records": records,
    }))
}

#[derive(Debug, Deserialize)]
pub struct SuiteRecordListQuery {
    pub task_record_id: Option<i64>,
    pub suite_id: Option<i64>,
}

pub async fn list_suite_records(
    State(state): State<Arc<AppState>>,
    Query(q): Query<SuiteRecordListQuery>,
) -> ApiResult {
    let records = match (q.task_record_id, q.suite_id) {
        (Some(id), _) => state.store.list_suite_records_of_task(id)?,
        (None, Some(id)) => state.store.list_suite_records_of_suite(id)?,
        (None, None) => {
            return Err(CaseflowError::InvalidArgument(
                "task_record_id or suite_id is required".into(),
            )
            .into())
        }
    };
    ok(serde_json::json!(records))
}

#[derive(Debug, Deserialize)]
pub struct CaseRecordListQuery {
    pub suite_record_id: Option<i64>,
    pub case_id: Option<i64>,
}

pub async fn list_case_records(
    State(state): State<Arc<AppState>>,
    Query(q): Query<CaseRecordListQuery>,
) -> ApiResult {
    let records = match (q.suite_record_id, q.case_id) {
        (Some(id), _) => state.store.list_case_records_of_suite(id)?,
        (None, Some(id)) => state.store.list_case_records_of_case(id)?,
        (None, None) => {
            return Err(CaseflowError::InvalidArgument(
                "suite_record_id or case_id is required".into(),
            )
            .into())
        }
    };
    ok(serde_json::json!(records))
}

/// A task record together with its suite children.
pub async fn get_task_record(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> ApiResult {
    let record = state.store.get_task_record(id)?;
    let suites = state.store.list_suite_records_of_task(id)?;
    ok(serde_json::json!({ "record": record, "suites": suites }))
}

pub async fn delete_task_record(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult {
    // children go first so no orphaned rows survive
    for suite in state.store.list_suite_records_of_task(id)? {
        for case in state.store.list_case_records_of_suite(suite.id)? {
            state.store.delete_case_record(case.id)?;
        }
        state.store.delete_suite_record(suite.id)?;
    }
    state.store.delete_task_record(id)?;
    ok(serde_json::json!({ "deleted": id }))
}

pub async fn get_suite_record(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult {
    let record = state.store.get_suite_record(id)?;
    let cases = state.store.list_case_records_of_suite(id)?;
    ok(serde_json::json!({ "record": record, "cases": cases }))
}

pub async fn delete_suite_record(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult {
    for case in state.store.list_case_records_of_suite(id)? {
        state.store.delete_case_record(case.id)?;
    }
    state.store.delete_suite_record(id)?;
    ok(serde_json::json!({ "deleted": id }))
}

pub async fn get_case_record(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> ApiResult {
    let record = state.store.get_case_record(id)?;
    ok(serde_json::to_value(record).map_err(CaseflowError::from)?)
}

pub async fn delete_case_record(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult {
    state.store.delete_case_record(id)?;
    ok(serde_json::json!({ "deleted": id }))
}

#[derive(Debug, Deserialize)]
pub struct CaseResultBody {
    pub status: CaseStatus,
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub run_info: serde_json::Value,
}

/// Result callback from an agent. Parent counters are recomputed
/// before the response goes out.
pub async fn report_case_result(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<CaseResultBody>,
) -> ApiResult {
    state
        .store
        .apply_case_result(id, body.status, body.duration, &body.run_info)?;
    ok(serde_json::json!({ "applied": id }))
}

// ─── Agent registry ───────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct AgentListQuery {
    pub status: Option<String>,
}

pub async fn list_agents(
    State(state): State<Arc<AppState>>,
    Query(q): Query<AgentListQuery>,
) -> ApiResult {
    let agents = state.store.list_agents(q.status.as_deref())?;
    let view: Vec<serde_json::Value> = agents
        .iter()
        .map(|a| {
            let mut v = serde_json::to_value(a).unwrap_or_default();
            v["status"] = serde_json::json!(a.status());
            v
        })
        .collect();
    ok(serde_json::json!(view))
}

/// Registration doubles as re-announcement: a known id refreshes in
/// place and comes back reachable.
pub async fn register_agent(
    State(state): State<Arc<AppState>>,
    Json(reg): Json<AgentRegistration>,
) -> ApiResult {
    let agent = state.store.register_agent(&reg)?;
    state.markers.touch(&agent.id);
    tracing::info!("agent {} registered from {}", agent.id, agent.address);
    ok(serde_json::to_value(&agent).map_err(CaseflowError::from)?)
}

pub async fn get_agent(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    let agent = state.store.get_agent(&id)?;
    let mut v = serde_json::to_value(&agent).map_err(CaseflowError::from)?;
    v["status"] = serde_json::json!(agent.status());
    ok(v)
}

pub async fn delete_agent(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    state.store.delete_agent(&id)?;
    state.channel.delete_queue(&id).await?;
    state.bus.clear(&format!("{id}:log"));
    state.bus.clear(&format!("{id}:screen"));
    ok(serde_json::json!({ "deleted": id }))
}

/// Push heartbeat for agents that cannot accept inbound probes.
pub async fn agent_heartbeat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    state.store.get_agent(&id)?;
    state.markers.touch(&id);
    state.store.set_agent_reachable(&id, true)?;
    ok(serde_json::json!({ "heartbeat": id }))
}

#[derive(Debug, Deserialize)]
pub struct WorkloadBody {
    pub workload: Workload,
}

pub async fn agent_workload(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<WorkloadBody>,
) -> ApiResult {
    state.store.get_agent(&id)?;
    state.store.set_agent_workload(&id, body.workload)?;
    ok(serde_json::json!({ "workload": body.workload.as_str() }))
}

#[derive(Debug, Deserialize)]
pub struct AgentEventBody {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub data: serde_json::Value,
}

/// Ingest a log line or screen frame and fan it out to the relay.
pub async fn agent_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<AgentEventBody>,
) -> ApiResult {
    let topic = match body.kind {
        EventKind::Log => format!("{id}:log"),
        EventKind::Screen => format!("{id}:screen"),
        EventKind::Status => {
            return Err(CaseflowError::InvalidArgument(
                "status events come from the monitor, not agents".into(),
            )
            .into())
        }
    };
    state.bus.publish(&topic, Event { kind: body.kind, data: body.data });
    ok(serde_json::json!({ "published": topic }))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use caseflow_bus::{InProcBroker, TopicBus};
    use caseflow_core::config::GatewayConfig;
    use caseflow_core::Result;
    use caseflow_dispatch::Dispatcher;
    use caseflow_monitor::MarkerCache;
    use caseflow_scheduler::{JobRunner, ScheduleEngine, ScheduledJob, SchedulerDb};
    use caseflow_store::Store;

    use super::*;

    struct NullRunner;

    #[async_trait]
    impl JobRunner for NullRunner {
        async fn run(&self, _job: &ScheduledJob) -> Result<()> {
            Ok(())
        }
    }

    fn state() -> Arc<AppState> {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let broker = Arc::new(InProcBroker::new());
        let engine = Arc::new(ScheduleEngine::new(
            SchedulerDb::open_in_memory().unwrap(),
            Arc::new(NullRunner),
            1,
            30,
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            broker.clone(),
            1,
            Duration::from_millis(1),
        ));
        Arc::new(AppState {
            config: GatewayConfig::default(),
            store,
            engine,
            dispatcher,
            channel: broker,
            bus: Arc::new(TopicBus::new(10)),
            markers: Arc::new(MarkerCache::new(Duration::from_secs(30))),
            start_time: std::time::Instant::now(),
        })
    }

    fn seed_definitions(state: &AppState) -> (i64, i64) {
        state
            .store
            .insert_environment("stage", "https://stage.example.com", &serde_json::json!({}))
            .unwrap();
        let task_id = state.store.insert_task("smoke", "tester").unwrap();
        (1, task_id)
    }

    fn job_body(env_id: i64, task_id: i64, trigger: Trigger) -> JobBody {
        JobBody {
            name: "nightly".into(),
            username: "tester".into(),
            project: None,
            env_id,
            task_id,
            trigger,
            enabled: true,
        }
    }

    #[tokio::test]
    async fn test_error_envelope_shape() {
        let resp = ApiError(CaseflowError::NotFound("task 9".into())).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let bytes = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["ok"], false);
        assert_eq!(v["kind"], "not_found");
        assert!(v["error"].as_str().unwrap().contains("task 9"));
    }

    #[tokio::test]
    async fn test_create_job_registers_def_and_engine() {
        let state = state();
        let (env_id, task_id) = seed_definitions(&state);
        let body = job_body(env_id, task_id, Trigger::Interval { seconds: 3600 });

        create_job(State(state.clone()), Json(body)).await.unwrap();
        assert_eq!(state.store.list_job_defs().unwrap().len(), 1);
        assert_eq!(state.engine.list_jobs().len(), 1);
    }

    #[tokio::test]
    async fn test_create_job_rolls_back_on_engine_rejection() {
        let state = state();
        let (env_id, task_id) = seed_definitions(&state);
        let body = job_body(
            env_id,
            task_id,
            Trigger::Date { run_at: chrono::Utc::now() - chrono::Duration::hours(1) },
        );

        assert!(create_job(State(state.clone()), Json(body)).await.is_err());
        // the rejected definition must not linger
        assert!(state.store.list_job_defs().unwrap().is_empty());
        assert!(state.engine.list_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_create_job_requires_existing_task() {
        let state = state();
        state
            .store
            .insert_environment("stage", "https://stage.example.com", &serde_json::json!({}))
            .unwrap();
        let body = job_body(1, 404, Trigger::Interval { seconds: 60 });
        let err = create_job(State(state.clone()), Json(body)).await.unwrap_err();
        assert!(matches!(err.0, CaseflowError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_pause_disables_def_and_engine_job() {
        let state = state();
        let (env_id, task_id) = seed_definitions(&state);
        let body = job_body(env_id, task_id, Trigger::Interval { seconds: 3600 });
        create_job(State(state.clone()), Json(body)).await.unwrap();
        let id = state.store.list_job_defs().unwrap()[0].id;

        pause_job(State(state.clone()), Path(id)).await.unwrap();
        assert!(!state.store.get_job_def(id).unwrap().enabled);
        assert!(state.engine.list_jobs()[0].paused);

        resume_job(State(state.clone()), Path(id)).await.unwrap();
        assert!(state.store.get_job_def(id).unwrap().enabled);
        assert!(!state.engine.list_jobs()[0].paused);
    }

    #[tokio::test]
    async fn test_heartbeat_touches_marker_and_liveness() {
        let state = state();
        state
            .store
            .register_agent(&AgentRegistration {
                id: "agent-1".into(),
                address: "10.0.0.5".into(),
                name: "agent-1".into(),
                platform: "android".into(),
                version: "1.4.0".into(),
                hostname: "a1.lab".into(),
                capabilities: serde_json::json!([]),
                username: "tester".into(),
            })
            .unwrap();
        state.store.set_agent_reachable("agent-1", false).unwrap();

        agent_heartbeat(State(state.clone()), Path("agent-1".into())).await.unwrap();
        assert!(state.store.get_agent("agent-1").unwrap().reachable);
        assert!(state.markers.is_fresh("agent-1"));
    }

    #[tokio::test]
    async fn test_agent_events_route_to_topics() {
        let state = state();
        agent_events(
            State(state.clone()),
            Path("agent-1".into()),
            Json(AgentEventBody { kind: EventKind::Log, data: serde_json::json!("line") }),
        )
        .await
        .unwrap();

        let (history, _) = state.bus.subscribe("agent-1:log");
        assert_eq!(history.len(), 1);

        let err = agent_events(
            State(state.clone()),
            Path("agent-1".into()),
            Json(AgentEventBody { kind: EventKind::Status, data: serde_json::json!({}) }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err.0, CaseflowError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_one_session_sees_log_and_screen_frames() {
        let state = state();
        // a relay session holds both of the agent's topics
        let (_, mut log_rx) = state.bus.subscribe("agent-1:log");
        let (_, mut screen_rx) = state.bus.subscribe("agent-1:screen");

        agent_events(
            State(state.clone()),
            Path("agent-1".into()),
            Json(AgentEventBody { kind: EventKind::Log, data: serde_json::json!("boot") }),
        )
        .await
        .unwrap();
        agent_events(
            State(state.clone()),
            Path("agent-1".into()),
            Json(AgentEventBody { kind: EventKind::Screen, data: serde_json::json!("frame-1") }),
        )
        .await
        .unwrap();
        agent_events(
            State(state.clone()),
            Path("agent-1".into()),
            Json(AgentEventBody { kind: EventKind::Screen, data: serde_json::json!("frame-2") }),
        )
        .await
        .unwrap();

        assert_eq!(log_rx.recv().await.unwrap().kind, EventKind::Log);
        assert_eq!(screen_rx.recv().await.unwrap().data, "frame-1");
        assert_eq!(screen_rx.recv().await.unwrap().data, "frame-2");

        // a late session replays only the freshest screen frame
        let (screen_history, _) = state.bus.subscribe("agent-1:screen");
        assert_eq!(screen_history.last().unwrap().data, "frame-2");
    }

    #[tokio::test]
    async fn test_case_result_for_unknown_record_is_not_found() {
        let state = state();
        let err = report_case_result(
            State(state.clone()),
            Path(404),
            Json(CaseResultBody {
                status: CaseStatus::Success,
                duration: 1.0,
                run_info: serde_json::json!({}),
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err.0, CaseflowError::NotFound(_)));
    }
}
