//! Record-then-publish dispatch over per-agent queues.

use std::sync::Arc;
use std::time::Duration;

use caseflow_core::types::{CronjobKind, DispatchState, EnvSnapshot};
use caseflow_core::{CaseflowError, Result};
use caseflow_bus::{publish_with_retry, MessageChannel, MessageHeaders};
use caseflow_store::{Agent, Store, SuiteDef};
use tracing::warn;

use crate::envelope::{CaseItem, DispatchMessage, RunSuite};

/// How a dispatch call picks its agents.
#[derive(Debug, Clone)]
pub enum AgentSelector {
    /// First reachable agent wins. The default for single runs.
    FirstOnline,
    /// These agents, in order, filtered down to the reachable ones.
    /// An unknown id fails the call; a fully offline list does too.
    Explicit(Vec<String>),
    /// All reachable agents, suites split between them.
    Spread,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SuiteDispatch {
    pub suite_id: i64,
    pub suite_record_id: i64,
    pub agent_id: String,
    pub state: DispatchState,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CaseDispatch {
    pub case_record_id: i64,
    pub agent_id: String,
    pub state: DispatchState,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DispatchReceipt {
    pub task_record_id: Option<i64>,
    pub suites: Vec<SuiteDispatch>,
}

/// Run request parameters shared by every dispatch entry point.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub env_id: i64,
    pub username: String,
    pub selector: AgentSelector,
    pub debug: bool,
    pub reset_cache: bool,
    pub cronjob_type: CronjobKind,
}

pub struct Dispatcher {
    store: Arc<Store>,
    channel: Arc<dyn MessageChannel>,
    publish_attempts: u32,
    retry_delay: Duration,
}

impl Dispatcher {
    pub fn new(
        store: Arc<Store>,
        channel: Arc<dyn MessageChannel>,
        publish_attempts: u32,
        retry_delay: Duration,
    ) -> Self {
        Self { store, channel, publish_attempts, retry_delay }
    }

    /// Run one case on one agent. The payload is a one-case suite so
    /// agents keep a single consume path.
    pub async fn dispatch_case(&self, case_id: i64, req: &RunRequest) -> Result<CaseDispatch> {
        let case = self.store.get_case(case_id)?;
        let env = self.snapshot_env(req)?;
        let agent = self.resolve_agents(&req.selector)?.remove(0);

        let record_id = self.store.create_case_record(case.id, None, &req.username, &env)?;
        let message = DispatchMessage {
            env_config: env,
            run_suite: RunSuite {
                id: 0,
                suite_record_id: None,
                task_record_id: None,
                name: case.name.clone(),
                username: req.username.clone(),
                family: caseflow_core::types::TaskFamily::Functional,
                variables: serde_json::json!({}),
                config: serde_json::json!({}),
                reset_cache: req.reset_cache,
                setup_step: serde_json::json!(null),
                cases: vec![CaseItem {
                    record_id,
                    id: case.id,
                    name: case.name,
                    skip: false,
                    steps: case.steps,
                }],
                cronjob_type: req.cronjob_type,
            },
        };
        let state = self.publish(&agent, &message).await;
        Ok(CaseDispatch { case_record_id: record_id, agent_id: agent.id, state })
    }

    /// Run one suite on one agent.
    pub async fn dispatch_suite(&self, suite_id: i64, req: &RunRequest) -> Result<SuiteDispatch> {
        let suite = self.store.get_suite(suite_id)?;
        let env = self.snapshot_env(req)?;
        let agent = self.resolve_agents(&req.selector)?.remove(0);
        let dispatch = self.dispatch_one_suite(&suite, None, &agent, &env, req).await?;
        Ok(dispatch)
    }

    /// Run a whole task: its suites are partitioned across the selected
    /// agents in contiguous chunks, and a publish failure on one agent
    /// never stops the others.
    pub async fn dispatch_task(&self, task_id: i64, req: &RunRequest) -> Result<DispatchReceipt> {
        let task = self.store.get_task(task_id)?;
        let suites = self.store.task_suites(task_id)?;
        if suites.is_empty() {
            return Err(CaseflowError::InvalidArgument(format!(
                "task {} has no suites",
                task.id
            )));
        }
        let env = self.snapshot_env(req)?;
        let agents = self.resolve_agents(&req.selector)?;

        let task_record_id = self.store.create_task_record(task.id, &req.username, &env)?;
        let mut dispatches = Vec::new();
        let mut total_cases = 0;
        for (agent, chunk) in partition(&suites, &agents) {
            for suite in chunk {
                let d = self
                    .dispatch_one_suite(suite, Some(task_record_id), agent, &env, req)
                    .await?;
                total_cases += self.store.get_suite_record(d.suite_record_id)?.counters.all;
                dispatches.push(d);
            }
        }
        self.store.set_task_record_total(task_record_id, total_cases)?;
        tracing::info!(
            "task {} dispatched as record {task_record_id}: {} suites over {} agents",
            task.id,
            dispatches.len(),
            agents.len()
        );
        Ok(DispatchReceipt { task_record_id: Some(task_record_id), suites: dispatches })
    }

    /// Record a suite and its cases, then publish. The records exist
    /// whatever the publish outcome; the dispatch state says which.
    async fn dispatch_one_suite(
        &self,
        suite: &SuiteDef,
        task_record_id: Option<i64>,
        agent: &Agent,
        env: &EnvSnapshot,
        req: &RunRequest,
    ) -> Result<SuiteDispatch> {
        let members = self.store.suite_cases(suite.id)?;
        let suite_record_id =
            self.store.create_suite_record(suite.id, task_record_id, &req.username, env)?;

        let mut cases = Vec::with_capacity(members.len());
        for member in members {
            let record_id = self.store.create_case_record(
                member.case.id,
                Some(suite_record_id),
                &req.username,
                env,
            )?;
            cases.push(CaseItem {
                record_id,
                id: member.case.id,
                name: member.case.name,
                skip: member.skip,
                steps: member.case.steps,
            });
        }
        self.store.set_suite_record_total(suite_record_id, cases.len() as i64)?;

        let message = DispatchMessage {
            env_config: env.clone(),
            run_suite: RunSuite {
                id: suite.id,
                suite_record_id: Some(suite_record_id),
                task_record_id,
                name: suite.name.clone(),
                username: req.username.clone(),
                family: suite.family,
                variables: serde_json::json!({}),
                config: serde_json::json!({}),
                reset_cache: req.reset_cache,
                setup_step: suite.setup_step.clone(),
                cases,
                cronjob_type: req.cronjob_type,
            },
        };
        let state = self.publish(agent, &message).await;
        self.store.set_suite_dispatch_state(suite_record_id, state)?;
        Ok(SuiteDispatch {
            suite_id: suite.id,
            suite_record_id,
            agent_id: agent.id.clone(),
            state,
        })
    }

    /// Bounded-retry publish to the agent's queue. Exhaustion maps to
    /// `publish_failed`; nothing upstream retries on its own.
    async fn publish(&self, agent: &Agent, message: &DispatchMessage) -> DispatchState {
        let payload = match serde_json::to_vec(message) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!("payload for agent {} failed to serialize: {e}", agent.id);
                return DispatchState::PublishFailed;
            }
        };
        let headers = MessageHeaders::json(message.run_suite.family);
        if let Err(e) = self.channel.declare_queue(&agent.id).await {
            tracing::error!("declaring queue {} failed: {e}", agent.id);
            return DispatchState::PublishFailed;
        }
        match publish_with_retry(
            self.channel.as_ref(),
            &agent.id,
            &headers,
            &payload,
            self.publish_attempts,
            self.retry_delay,
        )
        .await
        {
            Ok(()) => DispatchState::Dispatched,
            Err(e) => {
                tracing::error!("publish to agent {} failed for good: {e}", agent.id);
                DispatchState::PublishFailed
            }
        }
    }

    fn snapshot_env(&self, req: &RunRequest) -> Result<EnvSnapshot> {
        let env = self.store.get_environment(req.env_id)?;
        Ok(EnvSnapshot { debug: req.debug, host: env.host, variables: env.variables })
    }

    /// Validation happens here, before any record is written.
    fn resolve_agents(&self, selector: &AgentSelector) -> Result<Vec<Agent>> {
        let agents = match selector {
            AgentSelector::FirstOnline => {
                let mut reachable = self.store.reachable_agents()?;
                if reachable.is_empty() {
                    return Err(CaseflowError::Unavailable("no reachable agents".into()));
                }
                vec![reachable.remove(0)]
            }
            AgentSelector::Explicit(ids) => {
                if ids.is_empty() {
                    return Err(CaseflowError::InvalidArgument("no agents named".into()));
                }
                let mut agents = Vec::with_capacity(ids.len());
                for id in ids {
                    let agent = self.store.get_agent(id)?;
                    if agent.reachable {
                        agents.push(agent);
                    } else {
                        warn!(agent = %id, "skipping offline agent");
                    }
                }
                if agents.is_empty() {
                    return Err(CaseflowError::Unavailable(
                        "all named agents are offline".into(),
                    ));
                }
                agents
            }
            AgentSelector::Spread => {
                let reachable = self.store.reachable_agents()?;
                if reachable.is_empty() {
                    return Err(CaseflowError::Unavailable("no reachable agents".into()));
                }
                reachable
            }
        };
        Ok(agents)
    }
}

/// Contiguous round-robin split: with `s` suites over `k` agents, the
/// first `s % k` agents take `s / k + 1` suites, the rest `s / k`.
/// Agents left without suites are omitted.
fn partition<'a>(suites: &'a [SuiteDef], agents: &'a [Agent]) -> Vec<(&'a Agent, &'a [SuiteDef])> {
    let k = agents.len();
    if k == 0 {
        return Vec::new();
    }
    let base = suites.len() / k;
    let extra = suites.len() % k;
    let mut out = Vec::new();
    let mut offset = 0;
    for (i, agent) in agents.iter().enumerate() {
        let take = base + usize::from(i < extra);
        if take == 0 {
            break;
        }
        out.push((agent, &suites[offset..offset + take]));
        offset += take;
    }
    out
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use caseflow_bus::InProcBroker;
    use caseflow_store::AgentRegistration;

    use super::*;

    fn registration(id: &str) -> AgentRegistration {
        AgentRegistration {
            id: id.into(),
            address: format!("10.0.0.{}", id.len()),
            name: id.into(),
            platform: "android".into(),
            version: "1.4.0".into(),
            hostname: format!("{id}.lab"),
            capabilities: serde_json::json!(["ui"]),
            username: "tester".into(),
        }
    }

    fn request() -> RunRequest {
        RunRequest {
            env_id: 1,
            username: "tester".into(),
            selector: AgentSelector::Spread,
            debug: false,
            reset_cache: false,
            cronjob_type: CronjobKind::AdHoc,
        }
    }

    /// One task, two suites (3 cases + 1 case), two registered agents.
    fn seed(store: &Store) -> i64 {
        store
            .insert_environment("stage", "https://stage.example.com", &serde_json::json!({}))
            .unwrap();
        let task_id = store.insert_task("smoke", "tester").unwrap();
        let s1 = store
            .insert_suite("login", caseflow_core::types::TaskFamily::Functional, &serde_json::json!(null), "tester")
            .unwrap();
        let s2 = store
            .insert_suite("billing", caseflow_core::types::TaskFamily::Api, &serde_json::json!(null), "tester")
            .unwrap();
        store.add_suite_to_task(task_id, s1, 0).unwrap();
        store.add_suite_to_task(task_id, s2, 1).unwrap();
        for i in 0..3 {
            let c = store.insert_case(&format!("login-{i}"), &serde_json::json!([])).unwrap();
            store.add_case_to_suite(s1, c, i, false).unwrap();
        }
        let c = store.insert_case("invoice", &serde_json::json!([])).unwrap();
        store.add_case_to_suite(s2, c, 0, false).unwrap();
        store.register_agent(&registration("agent-1")).unwrap();
        store.register_agent(&registration("agent-2")).unwrap();
        task_id
    }

    fn dispatcher(store: Arc<Store>, channel: Arc<dyn MessageChannel>) -> Dispatcher {
        Dispatcher::new(store, channel, 1, Duration::from_millis(1))
    }

    #[test]
    fn test_partition_five_over_two() {
        let suites: Vec<SuiteDef> = (0..5)
            .map(|i| SuiteDef {
                id: i,
                name: format!("s{i}"),
                family: caseflow_core::types::TaskFamily::Api,
                setup_step: serde_json::json!(null),
                username: "tester".into(),
            })
            .collect();
        let store = Store::open_in_memory().unwrap();
        let a = store.register_agent(&registration("a")).unwrap();
        let b = store.register_agent(&registration("b")).unwrap();
        let agents = vec![a, b];
        let parts = partition(&suites, &agents);
        assert_eq!(parts[0].1.len(), 3);
        assert_eq!(parts[1].1.len(), 2);
    }

    #[test]
    fn test_partition_more_agents_than_suites() {
        let suites: Vec<SuiteDef> = (0..2)
            .map(|i| SuiteDef {
                id: i,
                name: format!("s{i}"),
                family: caseflow_core::types::TaskFamily::Api,
                setup_step: serde_json::json!(null),
                username: "tester".into(),
            })
            .collect();
        let store = Store::open_in_memory().unwrap();
        let agents: Vec<Agent> = ["a", "b", "c"]
            .iter()
            .map(|id| store.register_agent(&registration(id)).unwrap())
            .collect();
        let parts = partition(&suites, &agents);
        assert_eq!(parts.len(), 2);
        assert!(parts.iter().all(|(_, chunk)| chunk.len() == 1));
    }

    #[tokio::test]
    async fn test_dispatch_task_records_then_publishes() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let task_id = seed(&store);
        let broker = Arc::new(InProcBroker::new());
        let d = dispatcher(store.clone(), broker.clone());

        let receipt = d.dispatch_task(task_id, &request()).await.unwrap();
        assert_eq!(receipt.suites.len(), 2);
        assert!(receipt.suites.iter().all(|s| s.state == DispatchState::Dispatched));
        // 2 suites over 2 agents, one each
        assert_eq!(broker.depth("agent-1"), 1);
        assert_eq!(broker.depth("agent-2"), 1);

        let task_record = store.get_task_record(receipt.task_record_id.unwrap()).unwrap();
        assert_eq!(task_record.counters.all, 4);
        let children = store.list_suite_records_of_task(task_record.id).unwrap();
        assert_eq!(children.iter().map(|s| s.counters.all).sum::<i64>(), 4);

        // the payload carries record ids the agent will echo back
        let msg: DispatchMessage =
            serde_json::from_slice(&broker.drain("agent-1")[0].payload).unwrap();
        assert_eq!(msg.run_suite.cases.len(), 3);
        assert!(msg.run_suite.cases[0].record_id > 0);
    }

    #[tokio::test]
    async fn test_missing_environment_leaves_no_records() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let task_id = seed(&store);
        let d = dispatcher(store.clone(), Arc::new(InProcBroker::new()));

        let mut req = request();
        req.env_id = 404;
        let err = d.dispatch_task(task_id, &req).await.unwrap_err();
        assert!(matches!(err, CaseflowError::NotFound(_)));
        let (total, _) = store.list_task_records(None, 1, 10).unwrap();
        assert_eq!(total, 0);
    }

    struct DeadChannel;

    #[async_trait]
    impl MessageChannel for DeadChannel {
        async fn declare_queue(&self, _q: &str) -> caseflow_core::Result<()> {
            Ok(())
        }
        async fn delete_queue(&self, _q: &str) -> caseflow_core::Result<()> {
            Ok(())
        }
        async fn publish(&self, q: &str, _h: &MessageHeaders, _p: &[u8]) -> caseflow_core::Result<()> {
            Err(CaseflowError::Unavailable(format!("queue {q} down")))
        }
    }

    #[tokio::test]
    async fn test_publish_failure_keeps_records_and_marks_state() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let task_id = seed(&store);
        let d = dispatcher(store.clone(), Arc::new(DeadChannel));

        let receipt = d.dispatch_task(task_id, &request()).await.unwrap();
        assert!(receipt.suites.iter().all(|s| s.state == DispatchState::PublishFailed));
        for s in &receipt.suites {
            let record = store.get_suite_record(s.suite_record_id).unwrap();
            assert_eq!(record.dispatch_state, DispatchState::PublishFailed);
            assert!(record.counters.all > 0);
        }
    }

    #[tokio::test]
    async fn test_explicit_selector_skips_offline_agent() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let task_id = seed(&store);
        store.set_agent_reachable("agent-2", false).unwrap();
        let d = dispatcher(store.clone(), Arc::new(InProcBroker::new()));

        let mut req = request();
        req.selector = AgentSelector::Explicit(vec!["agent-1".into(), "agent-2".into()]);
        let receipt = d.dispatch_task(task_id, &req).await.unwrap();
        assert!(receipt.suites.iter().all(|s| s.agent_id == "agent-1"));
    }

    #[tokio::test]
    async fn test_explicit_selector_all_offline_is_unavailable() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let task_id = seed(&store);
        store.set_agent_reachable("agent-1", false).unwrap();
        let d = dispatcher(store.clone(), Arc::new(InProcBroker::new()));

        let mut req = request();
        req.selector = AgentSelector::Explicit(vec!["agent-1".into()]);
        let err = d.dispatch_task(task_id, &req).await.unwrap_err();
        assert!(matches!(err, CaseflowError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_dispatch_case_wraps_single_case() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        seed(&store);
        let broker = Arc::new(InProcBroker::new());
        let d = dispatcher(store.clone(), broker.clone());

        let mut req = request();
        req.selector = AgentSelector::FirstOnline;
        let dispatch = d.dispatch_case(1, &req).await.unwrap();
        assert_eq!(dispatch.state, DispatchState::Dispatched);

        let msg: DispatchMessage =
            serde_json::from_slice(&broker.drain(&dispatch.agent_id)[0].payload).unwrap();
        assert_eq!(msg.run_suite.id, 0);
        assert_eq!(msg.run_suite.cases.len(), 1);
        assert_eq!(msg.run_suite.cases[0].record_id, dispatch.case_record_id);
    }
}
