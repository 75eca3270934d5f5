//! The engine's own SQLite file.
//!
//! Deliberately separate from the main store: the scheduler owns its
//! job table the way it owns its fire times, and a corrupted record
//! store can never take scheduling down with it.

use std::path::Path;
use std::sync::Mutex;

use caseflow_core::{CaseflowError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use crate::triggers::Trigger;

/// One persisted job row.
#[derive(Debug, Clone)]
pub struct PersistedJob {
    pub id: i64,
    pub name: String,
    pub trigger: Trigger,
    pub paused: bool,
    pub next_fire: Option<DateTime<Utc>>,
}

pub struct SchedulerDb {
    conn: Mutex<Connection>,
}

fn db_err(e: rusqlite::Error) -> CaseflowError {
    CaseflowError::Storage(e.to_string())
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<(i64, String, String, String, bool, Option<String>)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get::<_, i64>(4)? != 0,
        row.get(5)?,
    ))
}

impl SchedulerDb {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        let db = Self { conn: Mutex::new(conn) };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        let db = Self { conn: Mutex::new(conn) };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS jobs (
                 id             INTEGER PRIMARY KEY,
                 name           TEXT NOT NULL,
                 trigger_kind   TEXT NOT NULL,
                 trigger_params TEXT NOT NULL DEFAULT '{}',
                 paused         INTEGER NOT NULL DEFAULT 0,
                 next_fire      TEXT
             );",
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Insert or replace a job row. Same id means same job.
    pub fn upsert_job(&self, job: &PersistedJob) -> Result<()> {
        let (kind, params) = job.trigger.to_parts();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO jobs (id, name, trigger_kind, trigger_params, paused, next_fire)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 trigger_kind = excluded.trigger_kind,
                 trigger_params = excluded.trigger_params,
                 paused = excluded.paused,
                 next_fire = excluded.next_fire",
            params![
                job.id,
                job.name,
                kind,
                params.to_string(),
                job.paused as i64,
                job.next_fire.map(|t| t.to_rfc3339()),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Returns false when no such job existed.
    pub fn remove_job(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn
            .execute("DELETE FROM jobs WHERE id = ?1", [id])
            .map_err(db_err)?;
        Ok(n > 0)
    }

    pub fn set_paused(&self, id: i64, paused: bool) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn
            .execute(
                "UPDATE jobs SET paused = ?1 WHERE id = ?2",
                params![paused as i64, id],
            )
            .map_err(db_err)?;
        Ok(n > 0)
    }

    pub fn set_next_fire(&self, id: i64, next_fire: Option<DateTime<Utc>>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE jobs SET next_fire = ?1 WHERE id = ?2",
            params![next_fire.map(|t| t.to_rfc3339()), id],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Load every job. Rows with unreadable triggers are logged and
    /// skipped rather than failing the whole hydration.
    pub fn load_all(&self) -> Result<Vec<PersistedJob>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id, name, trigger_kind, trigger_params, paused, next_fire
                 FROM jobs ORDER BY id",
            )
            .map_err(db_err)?;
        let rows = stmt.query_map([], row_to_job).map_err(db_err)?;

        let mut jobs = Vec::new();
        for row in rows {
            let (id, name, kind, params, paused, next_fire) = row.map_err(db_err)?;
            let params: serde_json::Value = serde_json::from_str(&params).unwrap_or_default();
            let trigger = match Trigger::from_parts(&kind, &params) {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!("skipping job {id} with unreadable trigger: {e}");
                    continue;
                }
            };
            let next_fire = next_fire
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|t| t.with_timezone(&Utc));
            jobs.push(PersistedJob { id, name, trigger, paused, next_fire });
        }
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: i64) -> PersistedJob {
        PersistedJob {
            id,
            name: format!("job-{id}"),
            trigger: Trigger::Interval { seconds: 300 },
            paused: false,
            next_fire: Some(Utc::now() + chrono::Duration::seconds(300)),
        }
    }

    #[test]
    fn test_jobs_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        {
            let db = SchedulerDb::open(&path).unwrap();
            db.upsert_job(&sample(1)).unwrap();
            db.upsert_job(&sample(2)).unwrap();
            db.set_paused(2, true).unwrap();
        }
        let db = SchedulerDb::open(&path).unwrap();
        let jobs = db.load_all().unwrap();
        assert_eq!(jobs.len(), 2);
        assert!(!jobs[0].paused);
        assert!(jobs[1].paused);
    }

    #[test]
    fn test_upsert_replaces_same_id() {
        let db = SchedulerDb::open_in_memory().unwrap();
        db.upsert_job(&sample(1)).unwrap();
        let mut changed = sample(1);
        changed.trigger = Trigger::Interval { seconds: 60 };
        db.upsert_job(&changed).unwrap();

        let jobs = db.load_all().unwrap();
        assert_eq!(jobs.len(), 1);
        assert!(matches!(jobs[0].trigger, Trigger::Interval { seconds: 60 }));
    }

    #[test]
    fn test_pause_missing_job_reports_false() {
        let db = SchedulerDb::open_in_memory().unwrap();
        assert!(!db.set_paused(99, true).unwrap());
        assert!(!db.remove_job(99).unwrap());
    }
}
