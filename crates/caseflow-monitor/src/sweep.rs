//! The periodic liveness sweep.

use std::sync::Arc;
use std::time::Duration;

use caseflow_bus::{Event, EventKind, TopicBus};
use caseflow_core::Result;
use caseflow_store::{Agent, Store};
use futures::future::join_all;

use crate::markers::MarkerCache;

pub struct HeartbeatMonitor {
    store: Arc<Store>,
    bus: Arc<TopicBus>,
    markers: Arc<MarkerCache>,
    client: reqwest::Client,
    agent_port: u16,
    check_interval: Duration,
}

impl HeartbeatMonitor {
    pub fn new(
        store: Arc<Store>,
        bus: Arc<TopicBus>,
        markers: Arc<MarkerCache>,
        agent_port: u16,
        probe_timeout: Duration,
        check_interval: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(probe_timeout)
            .build()
            .unwrap_or_default();
        Self { store, bus, markers, client, agent_port, check_interval }
    }

    /// Run the sweep loop forever. Spawned once at startup.
    pub async fn run(self: Arc<Self>) {
        tracing::info!(
            "heartbeat monitor started (every {:?}, agent port {})",
            self.check_interval,
            self.agent_port
        );
        let mut interval = tokio::time::interval(self.check_interval);
        loop {
            interval.tick().await;
            if let Err(e) = self.sweep_once().await {
                tracing::error!("liveness sweep failed: {e}");
            }
        }
    }

    /// Check the whole fleet concurrently and persist verdict changes.
    pub async fn sweep_once(&self) -> Result<()> {
        let agents = self.store.list_agents(None)?;
        let checks = agents.iter().map(|agent| self.check_agent(agent));
        let verdicts: Vec<bool> = join_all(checks).await;

        for (agent, reachable) in agents.iter().zip(verdicts) {
            // one agent's failed write must not stall the rest
            let changed = match self.store.set_agent_reachable(&agent.id, reachable) {
                Ok(changed) => changed,
                Err(e) => {
                    tracing::error!("persisting status for agent {} failed: {e}", agent.id);
                    continue;
                }
            };
            if changed {
                tracing::info!(
                    "agent {} is now {}",
                    agent.id,
                    if reachable { "reachable" } else { "unreachable" }
                );
                self.bus.publish(
                    &format!("agent:{}:status", agent.id),
                    Event {
                        kind: EventKind::Status,
                        data: serde_json::json!({
                            "agent_id": agent.id,
                            "reachable": reachable,
                        }),
                    },
                );
            }
        }
        self.markers.prune();
        Ok(())
    }

    /// Probe first; fall back to a fresh heartbeat marker so agents
    /// that cannot accept inbound connections still count.
    async fn check_agent(&self, agent: &Agent) -> bool {
        let url = format!("http://{}:{}/health", agent.address, self.agent_port);
        match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                tracing::debug!("agent {} health returned {}", agent.id, resp.status());
                self.markers.is_fresh(&agent.id)
            }
            Err(e) => {
                tracing::debug!("agent {} probe failed: {e}", agent.id);
                self.markers.is_fresh(&agent.id)
            }
        }
    }
}
