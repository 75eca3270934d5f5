//! Scheduled job definitions.
//!
//! The store keeps a trigger as an opaque `(kind, params)` pair so it
//! stays agnostic of the schedule engine; the gateway converts both ways.

use caseflow_core::types::CronjobKind;
use caseflow_core::{CaseflowError, Result};
use chrono::Utc;
use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};

use crate::db::{db_err, Store};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDef {
    pub id: i64,
    pub name: String,
    pub username: String,
    pub project: Option<String>,
    pub env_id: i64,
    pub task_id: i64,
    pub trigger_kind: String,
    pub trigger_params: serde_json::Value,
    pub cronjob_kind: CronjobKind,
    pub enabled: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// Fields supplied when creating or replacing a job definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefInput {
    pub name: String,
    pub username: String,
    #[serde(default)]
    pub project: Option<String>,
    pub env_id: i64,
    pub task_id: i64,
    pub trigger_kind: String,
    pub trigger_params: serde_json::Value,
    pub cronjob_kind: CronjobKind,
}

const JOB_COLS: &str = "id, name, username, project, env_id, task_id, trigger_kind, \
     trigger_params, cronjob_kind, enabled, created_at, updated_at";

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<JobDef> {
    Ok(JobDef {
        id: row.get(0)?,
        name: row.get(1)?,
        username: row.get(2)?,
        project: row.get(3)?,
        env_id: row.get(4)?,
        task_id: row.get(5)?,
        trigger_kind: row.get(6)?,
        trigger_params: serde_json::from_str(&row.get::<_, String>(7)?).unwrap_or_default(),
        cronjob_kind: CronjobKind::parse(&row.get::<_, String>(8)?),
        enabled: row.get::<_, i64>(9)? != 0,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

impl Store {
    pub fn create_job_def(&self, input: &JobDefInput) -> Result<JobDef> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO job_defs (name, username, project, env_id, task_id, trigger_kind,
                 trigger_params, cronjob_kind, enabled, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, ?9, ?9)",
            params![
                input.name,
                input.username,
                input.project,
                input.env_id,
                input.task_id,
                input.trigger_kind,
                input.trigger_params.to_string(),
                input.cronjob_kind.as_str(),
                now
            ],
        )
        .map_err(db_err)?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get_job_def(id)
    }

    pub fn get_job_def(&self, id: i64) -> Result<JobDef> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("SELECT {JOB_COLS} FROM job_defs WHERE id = ?1"),
            [id],
            row_to_job,
        )
        .map_err(|_| CaseflowError::NotFound(format!("job {id}")))
    }

    pub fn list_job_defs(&self) -> Result<Vec<JobDef>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&format!("SELECT {JOB_COLS} FROM job_defs ORDER BY id"))
            .map_err(db_err)?;
        let rows = stmt.query_map([], row_to_job).map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Replace a job definition in place, preserving its enabled flag.
    pub fn update_job_def(&self, id: i64, input: &JobDefInput) -> Result<JobDef> {
        let conn = self.conn.lock().unwrap();
        let n = conn
            .execute(
                "UPDATE job_defs
                 SET name = ?1, username = ?2, project = ?3, env_id = ?4, task_id = ?5,
                     trigger_kind = ?6, trigger_params = ?7, cronjob_kind = ?8, updated_at = ?9
                 WHERE id = ?10",
                params![
                    input.name,
                    input.username,
                    input.project,
                    input.env_id,
                    input.task_id,
                    input.trigger_kind,
                    input.trigger_params.to_string(),
                    input.cronjob_kind.as_str(),
                    Utc::now().to_rfc3339(),
                    id
                ],
            )
            .map_err(db_err)?;
        if n == 0 {
            return Err(CaseflowError::NotFound(format!("job {id}")));
        }
        drop(conn);
        self.get_job_def(id)
    }

    pub fn set_job_def_enabled(&self, id: i64, enabled: bool) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let n = conn
            .execute(
                "UPDATE job_defs SET enabled = ?1, updated_at = ?2 WHERE id = ?3",
                params![enabled as i64, Utc::now().to_rfc3339(), id],
            )
            .map_err(db_err)?;
        if n == 0 {
            return Err(CaseflowError::NotFound(format!("job {id}")));
        }
        Ok(())
    }

    pub fn delete_job_def(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let n = conn
            .execute("DELETE FROM job_defs WHERE id = ?1", [id])
            .map_err(db_err)?;
        if n == 0 {
            return Err(CaseflowError::NotFound(format!("job {id}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(name: &str) -> JobDefInput {
        JobDefInput {
            name: name.into(),
            username: "tester".into(),
            project: Some("web".into()),
            env_id: 1,
            task_id: 1,
            trigger_kind: "interval".into(),
            trigger_params: serde_json::json!({"seconds": 3600}),
            cronjob_kind: CronjobKind::Recurring,
        }
    }

    #[test]
    fn test_job_def_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let job = store.create_job_def(&input("nightly")).unwrap();
        assert!(job.enabled);
        assert_eq!(job.trigger_kind, "interval");
        assert_eq!(job.trigger_params["seconds"], 3600);

        let fetched = store.get_job_def(job.id).unwrap();
        assert_eq!(fetched.name, "nightly");
    }

    #[test]
    fn test_update_preserves_enabled_flag() {
        let store = Store::open_in_memory().unwrap();
        let job = store.create_job_def(&input("nightly")).unwrap();
        store.set_job_def_enabled(job.id, false).unwrap();

        let mut changed = input("hourly");
        changed.trigger_params = serde_json::json!({"seconds": 60});
        let updated = store.update_job_def(job.id, &changed).unwrap();
        assert_eq!(updated.name, "hourly");
        assert!(!updated.enabled);
    }

    #[test]
    fn test_missing_job_is_not_found() {
        let store = Store::open_in_memory().unwrap();
        assert!(matches!(
            store.get_job_def(42),
            Err(CaseflowError::NotFound(_))
        ));
        assert!(matches!(
            store.delete_job_def(42),
            Err(CaseflowError::NotFound(_))
        ));
    }
}
