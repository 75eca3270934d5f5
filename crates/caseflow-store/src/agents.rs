//! Agent registry rows.
//!
//! Agents self-register with their own id. `reachable` is flipped only by
//! the heartbeat monitor (and on re-registration); `workload` is the
//! dispatcher's advisory marker and never blocks a liveness transition.

use caseflow_core::types::{agent_status, Workload};
use caseflow_core::{CaseflowError, Result};
use chrono::Utc;
use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};

use crate::db::{db_err, Store};

/// A registered execution agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub address: String,
    pub name: String,
    pub platform: String,
    pub version: String,
    pub hostname: String,
    pub capabilities: serde_json::Value,
    pub username: String,
    pub reachable: bool,
    pub workload: Workload,
    pub created_at: String,
    pub updated_at: String,
}

impl Agent {
    /// Combined status string for the API edge.
    pub fn status(&self) -> &'static str {
        agent_status(self.reachable, self.workload)
    }
}

/// Registration payload sent by an agent on startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub id: String,
    pub address: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub capabilities: serde_json::Value,
    #[serde(default)]
    pub username: String,
}

fn row_to_agent(row: &Row<'_>) -> rusqlite::Result<Agent> {
    Ok(Agent {
        id: row.get(0)?,
        address: row.get(1)?,
        name: row.get(2)?,
        platform: row.get(3)?,
        version: row.get(4)?,
        hostname: row.get(5)?,
        capabilities: serde_json::from_str(&row.get::<_, String>(6)?).unwrap_or_default(),
        username: row.get(7)?,
        reachable: row.get::<_, i32>(8)? != 0,
        workload: Workload::parse(&row.get::<_, String>(9)?),
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

const AGENT_COLS: &str = "id, address, name, platform, version, hostname, capabilities, \
                          username, reachable, workload, created_at, updated_at";

impl Store {
    /// Upsert an agent. Re-registration of a known id marks it reachable
    /// again and refreshes its metadata.
    pub fn register_agent(&self, reg: &AgentRegistration) -> Result<Agent> {
        let now = Utc::now().to_rfc3339();
        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO agents
                   (id, address, name, platform, version, hostname, capabilities,
                    username, reachable, workload, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, 'idle', ?9, ?9)
                 ON CONFLICT(id) DO UPDATE SET
                   address = excluded.address,
                   name = excluded.name,
                   platform = excluded.platform,
                   version = excluded.version,
                   hostname = excluded.hostname,
                   capabilities = excluded.capabilities,
                   reachable = 1,
                   updated_at = excluded.updated_at",
                params![
                    reg.id,
                    reg.address,
                    reg.name,
                    reg.platform,
                    reg.version,
                    reg.hostname,
                    reg.capabilities.to_string(),
                    reg.username,
                    now,
                ],
            )
            .map_err(db_err)?;
        }
        self.get_agent(&reg.id)
    }

    pub fn get_agent(&self, id: &str) -> Result<Agent> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("SELECT {AGENT_COLS} FROM agents WHERE id = ?1"),
            [id],
            row_to_agent,
        )
        .map_err(|_| CaseflowError::NotFound(format!("agent {id}")))
    }

    /// All agents, optionally filtered by combined status string.
    pub fn list_agents(&self, status: Option<&str>) -> Result<Vec<Agent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {AGENT_COLS} FROM agents ORDER BY created_at DESC"
            ))
            .map_err(db_err)?;
        let rows = stmt.query_map([], row_to_agent).map_err(db_err)?;
        let mut agents = rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        if let Some(filter) = status {
            agents.retain(|a| a.status() == filter);
        }
        Ok(agents)
    }

    /// Agents whose liveness is currently confirmed.
    pub fn reachable_agents(&self) -> Result<Vec<Agent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {AGENT_COLS} FROM agents WHERE reachable = 1 ORDER BY id"
            ))
            .map_err(db_err)?;
        let rows = stmt.query_map([], row_to_agent).map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Atomically set the liveness axis. Returns true when the stored value
    /// actually changed; callers emit a notification only in that case.
    pub fn set_agent_reachable(&self, id: &str, reachable: bool) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                "UPDATE agents SET reachable = ?1, updated_at = ?2
                 WHERE id = ?3 AND reachable != ?1",
                params![reachable as i32, Utc::now().to_rfc3339(), id],
            )
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    /// Advisory workload marker, written by the dispatcher.
    pub fn set_agent_workload(&self, id: &str, workload: Workload) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let n = conn
            .execute(
                "UPDATE agents SET workload = ?1, updated_at = ?2 WHERE id = ?3",
                params![workload.as_str(), Utc::now().to_rfc3339(), id],
            )
            .map_err(db_err)?;
        if n == 0 {
            return Err(CaseflowError::NotFound(format!("agent {id}")));
        }
        Ok(())
    }

    /// Soft lifecycle: run records keep their historical agent references,
    /// so deletion only removes the registry row.
    pub fn delete_agent(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let n = conn
            .execute("DELETE FROM agents WHERE id = ?1", [id])
            .map_err(db_err)?;
        if n == 0 {
            return Err(CaseflowError::NotFound(format!("agent {id}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reg(id: &str) -> AgentRegistration {
        AgentRegistration {
            id: id.into(),
            address: "10.0.0.5".into(),
            name: "runner-1".into(),
            platform: "linux".into(),
            version: "1.4.0".into(),
            hostname: "runner-1.local".into(),
            capabilities: serde_json::json!(["functional"]),
            username: "ops".into(),
        }
    }

    #[test]
    fn test_register_and_status() {
        let store = Store::open_in_memory().unwrap();
        let agent = store.register_agent(&reg("agent-1")).unwrap();
        assert!(agent.reachable);
        assert_eq!(agent.status(), "online");
    }

    #[test]
    fn test_set_reachable_only_reports_change() {
        let store = Store::open_in_memory().unwrap();
        store.register_agent(&reg("agent-1")).unwrap();

        assert!(store.set_agent_reachable("agent-1", false).unwrap());
        // second write with the same value is a no-op
        assert!(!store.set_agent_reachable("agent-1", false).unwrap());
        assert!(store.set_agent_reachable("agent-1", true).unwrap());
    }

    #[test]
    fn test_workload_does_not_override_liveness() {
        let store = Store::open_in_memory().unwrap();
        store.register_agent(&reg("agent-1")).unwrap();
        store
            .set_agent_workload("agent-1", Workload::Running)
            .unwrap();
        store.set_agent_reachable("agent-1", false).unwrap();

        let agent = store.get_agent("agent-1").unwrap();
        assert_eq!(agent.workload, Workload::Running);
        assert_eq!(agent.status(), "offline");
    }

    #[test]
    fn test_reregistration_marks_reachable() {
        let store = Store::open_in_memory().unwrap();
        store.register_agent(&reg("agent-1")).unwrap();
        store.set_agent_reachable("agent-1", false).unwrap();

        let agent = store.register_agent(&reg("agent-1")).unwrap();
        assert!(agent.reachable);
    }
}
