//! Run records: the Task → Suite → Case result tree.
//!
//! Records are created by the dispatcher before any message leaves the
//! process; results arrive later through `apply_case_result`, which
//! recomputes parent counters from children so the aggregation invariant
//! (`task.all == Σ suite.all`, pass_rate in [0,1]) holds after every write.

use caseflow_core::types::{CaseStatus, DispatchState, EnvSnapshot, RunStatus};
use caseflow_core::{CaseflowError, Result};
use chrono::Utc;
use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};

use crate::db::{db_err, Store};

/// Counter block shared by the task and suite record levels.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunCounters {
    pub all: i64,
    pub run_all: i64,
    pub no_run: i64,
    pub success: i64,
    pub fail: i64,
    pub error: i64,
    pub skip: i64,
    pub pass_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRunRecord {
    pub id: i64,
    pub task_id: i64,
    pub username: String,
    pub status: RunStatus,
    pub env: serde_json::Value,
    pub start_time: String,
    pub duration: f64,
    #[serde(flatten)]
    pub counters: RunCounters,
    pub task_log: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteRunRecord {
    pub id: i64,
    pub suite_id: i64,
    pub task_record_id: Option<i64>,
    pub username: String,
    pub status: RunStatus,
    pub dispatch_state: DispatchState,
    pub env: serde_json::Value,
    pub start_time: String,
    pub duration: f64,
    #[serde(flatten)]
    pub counters: RunCounters,
    pub suite_log: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseRunRecord {
    pub id: i64,
    pub case_id: i64,
    pub suite_record_id: Option<i64>,
    pub username: String,
    pub status: CaseStatus,
    pub env: serde_json::Value,
    pub start_time: String,
    pub duration: f64,
    pub run_info: serde_json::Value,
}

fn counters_from_row(row: &Row<'_>, base: usize) -> rusqlite::Result<RunCounters> {
    Ok(RunCounters {
        all: row.get(base)?,
        run_all: row.get(base + 1)?,
        no_run: row.get(base + 2)?,
        success: row.get(base + 3)?,
        fail: row.get(base + 4)?,
        error: row.get(base + 5)?,
        skip: row.get(base + 6)?,
        pass_rate: row.get(base + 7)?,
    })
}

const TASK_COLS: &str = "id, task_id, username, status, env, start_time, duration, \
     all_count, run_all, no_run, success, fail, error, skip, pass_rate, task_log";

const SUITE_COLS: &str = "id, suite_id, task_record_id, username, status, dispatch_state, env, \
     start_time, duration, all_count, run_all, no_run, success, fail, error, skip, pass_rate, \
     suite_log";

const CASE_COLS: &str =
    "id, case_id, suite_record_id, username, status, env, start_time, duration, run_info";

fn row_to_task_record(row: &Row<'_>) -> rusqlite::Result<TaskRunRecord> {
    Ok(TaskRunRecord {
        id: row.get(0)?,
        task_id: row.get(1)?,
        username: row.get(2)?,
        status: RunStatus::parse(&row.get::<_, String>(3)?),
        env: serde_json::from_str(&row.get::<_, String>(4)?).unwrap_or_default(),
        start_time: row.get(5)?,
        duration: row.get(6)?,
        counters: counters_from_row(row, 7)?,
        task_log: serde_json::from_str(&row.get::<_, String>(15)?).unwrap_or_default(),
    })
}

fn row_to_suite_record(row: &Row<'_>) -> rusqlite::Result<SuiteRunRecord> {
    Ok(SuiteRunRecord {
        id: row.get(0)?,
        suite_id: row.get(1)?,
        task_record_id: row.get(2)?,
        username: row.get(3)?,
        status: RunStatus::parse(&row.get::<_, String>(4)?),
        dispatch_state: DispatchState::parse(&row.get::<_, String>(5)?),
        env: serde_json::from_str(&row.get::<_, String>(6)?).unwrap_or_default(),
        start_time: row.get(7)?,
        duration: row.get(8)?,
        counters: counters_from_row(row, 9)?,
        suite_log: serde_json::from_str(&row.get::<_, String>(17)?).unwrap_or_default(),
    })
}

fn row_to_case_record(row: &Row<'_>) -> rusqlite::Result<CaseRunRecord> {
    Ok(CaseRunRecord {
        id: row.get(0)?,
        case_id: row.get(1)?,
        suite_record_id: row.get(2)?,
        username: row.get(3)?,
        status: CaseStatus::parse(&row.get::<_, String>(4)?),
        env: serde_json::from_str(&row.get::<_, String>(5)?).unwrap_or_default(),
        start_time: row.get(6)?,
        duration: row.get(7)?,
        run_info: serde_json::from_str(&row.get::<_, String>(8)?).unwrap_or_default(),
    })
}

impl Store {
    // ─── Creation (dispatch path) ─────────────────────────────

    pub fn create_task_record(
        &self,
        task_id: i64,
        username: &str,
        env: &EnvSnapshot,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO task_records (task_id, username, env, start_time)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                task_id,
                username,
                serde_json::to_string(env)?,
                Utc::now().to_rfc3339()
            ],
        )
        .map_err(db_err)?;
        Ok(conn.last_insert_rowid())
    }

    pub fn create_suite_record(
        &self,
        suite_id: i64,
        task_record_id: Option<i64>,
        username: &str,
        env: &EnvSnapshot,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO suite_records (suite_id, task_record_id, username, env, start_time)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                suite_id,
                task_record_id,
                username,
                serde_json::to_string(env)?,
                Utc::now().to_rfc3339()
            ],
        )
        .map_err(db_err)?;
        Ok(conn.last_insert_rowid())
    }

    pub fn create_case_record(
        &self,
        case_id: i64,
        suite_record_id: Option<i64>,
        username: &str,
        env: &EnvSnapshot,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO case_records (case_id, suite_record_id, username, env, start_time)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                case_id,
                suite_record_id,
                username,
                serde_json::to_string(env)?,
                Utc::now().to_rfc3339()
            ],
        )
        .map_err(db_err)?;
        Ok(conn.last_insert_rowid())
    }

    /// Fix the case total at dispatch time. `no_run` starts equal to `all`.
    pub fn set_suite_record_total(&self, record_id: i64, all: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE suite_records SET all_count = ?1, no_run = ?1 WHERE id = ?2",
            params![all, record_id],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn set_task_record_total(&self, record_id: i64, all: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE task_records SET all_count = ?1, no_run = ?1 WHERE id = ?2",
            params![all, record_id],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Second phase of record-then-publish: the publish outcome.
    pub fn set_suite_dispatch_state(&self, record_id: i64, state: DispatchState) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE suite_records SET dispatch_state = ?1 WHERE id = ?2",
            params![state.as_str(), record_id],
        )
        .map_err(db_err)?;
        Ok(())
    }

    // ─── Result application (agent callback path) ─────────────

    /// Record a case outcome and re-derive the parent suite and task
    /// counters by summing children.
    pub fn apply_case_result(
        &self,
        case_record_id: i64,
        status: CaseStatus,
        duration: f64,
        run_info: &serde_json::Value,
    ) -> Result<()> {
        let record = self.get_case_record(case_record_id)?;
        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "UPDATE case_records SET status = ?1, duration = ?2, run_info = ?3
                 WHERE id = ?4",
                params![
                    status.as_str(),
                    duration,
                    run_info.to_string(),
                    case_record_id
                ],
            )
            .map_err(db_err)?;
        }
        if let Some(suite_record_id) = record.suite_record_id {
            let task_record_id = self.recompute_suite_record(suite_record_id)?;
            if let Some(task_record_id) = task_record_id {
                self.recompute_task_record(task_record_id)?;
            }
        }
        Ok(())
    }

    /// Re-derive one suite record's counters from its case records.
    /// Returns the owning task record id, if any.
    fn recompute_suite_record(&self, suite_record_id: i64) -> Result<Option<i64>> {
        let cases = self.list_case_records_of_suite(suite_record_id)?;
        let mut c = RunCounters::default();
        let mut duration = 0.0;
        for case in &cases {
            duration += case.duration;
            match case.status {
                CaseStatus::Success => c.success += 1,
                CaseStatus::Fail => c.fail += 1,
                CaseStatus::Error => c.error += 1,
                CaseStatus::Skip => c.skip += 1,
                CaseStatus::Queued | CaseStatus::Running => {}
            }
        }
        c.run_all = c.success + c.fail + c.error;
        let terminal = cases.iter().filter(|r| r.status.is_terminal()).count() as i64;
        let conn = self.conn.lock().unwrap();
        let (all, task_record_id): (i64, Option<i64>) = conn
            .query_row(
                "SELECT all_count, task_record_id FROM suite_records WHERE id = ?1",
                [suite_record_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(db_err)?;
        c.all = all;
        c.no_run = (all - c.run_all - c.skip).max(0);
        c.pass_rate = pass_rate(c.success, c.run_all);
        let status = if terminal >= all {
            RunStatus::Completed
        } else {
            RunStatus::Running
        };
        conn.execute(
            "UPDATE suite_records
             SET run_all = ?1, no_run = ?2, success = ?3, fail = ?4, error = ?5,
                 skip = ?6, pass_rate = ?7, duration = ?8, status = ?9
             WHERE id = ?10",
            params![
                c.run_all,
                c.no_run,
                c.success,
                c.fail,
                c.error,
                c.skip,
                c.pass_rate,
                duration,
                status.as_str(),
                suite_record_id
            ],
        )
        .map_err(db_err)?;
        Ok(task_record_id)
    }

    /// Re-derive one task record's counters from its suite records.
    fn recompute_task_record(&self, task_record_id: i64) -> Result<()> {
        let suites = self.list_suite_records_of_task(task_record_id)?;
        let mut c = RunCounters::default();
        let mut duration = 0.0;
        let mut completed = 0;
        for suite in &suites {
            c.run_all += suite.counters.run_all;
            c.success += suite.counters.success;
            c.fail += suite.counters.fail;
            c.error += suite.counters.error;
            c.skip += suite.counters.skip;
            duration += suite.duration;
            if suite.status == RunStatus::Completed {
                completed += 1;
            }
        }
        let conn = self.conn.lock().unwrap();
        let all: i64 = conn
            .query_row(
                "SELECT all_count FROM task_records WHERE id = ?1",
                [task_record_id],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        c.all = all;
        c.no_run = (all - c.run_all - c.skip).max(0);
        c.pass_rate = pass_rate(c.success, c.run_all);
        let status = if !suites.is_empty() && completed == suites.len() {
            RunStatus::Completed
        } else {
            RunStatus::Running
        };
        conn.execute(
            "UPDATE task_records
             SET run_all = ?1, no_run = ?2, success = ?3, fail = ?4, error = ?5,
                 skip = ?6, pass_rate = ?7, duration = ?8, status = ?9
             WHERE id = ?10",
            params![
                c.run_all,
                c.no_run,
                c.success,
                c.fail,
                c.error,
                c.skip,
                c.pass_rate,
                duration,
                status.as_str(),
                task_record_id
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Append an entry to a task record's free-form log buffer.
    pub fn append_task_record_log(
        &self,
        record_id: i64,
        entry: &serde_json::Value,
    ) -> Result<()> {
        let record = self.get_task_record(record_id)?;
        let mut log = match record.task_log {
            serde_json::Value::Array(v) => v,
            _ => Vec::new(),
        };
        log.push(entry.clone());
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE task_records SET task_log = ?1 WHERE id = ?2",
            params![serde_json::Value::Array(log).to_string(), record_id],
        )
        .map_err(db_err)?;
        Ok(())
    }

    // ─── Reads ────────────────────────────────────────────────

    pub fn get_task_record(&self, id: i64) -> Result<TaskRunRecord> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("SELECT {TASK_COLS} FROM task_records WHERE id = ?1"),
            [id],
            row_to_task_record,
        )
        .map_err(|_| CaseflowError::NotFound(format!("task record {id}")))
    }

    pub fn get_suite_record(&self, id: i64) -> Result<SuiteRunRecord> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("SELECT {SUITE_COLS} FROM suite_records WHERE id = ?1"),
            [id],
            row_to_suite_record,
        )
        .map_err(|_| CaseflowError::NotFound(format!("suite record {id}")))
    }

    pub fn get_case_record(&self, id: i64) -> Result<CaseRunRecord> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("SELECT {CASE_COLS} FROM case_records WHERE id = ?1"),
            [id],
            row_to_case_record,
        )
        .map_err(|_| CaseflowError::NotFound(format!("case record {id}")))
    }

    pub fn list_task_records(
        &self,
        task_id: Option<i64>,
        page: i64,
        size: i64,
    ) -> Result<(i64, Vec<TaskRunRecord>)> {
        let conn = self.conn.lock().unwrap();
        let (total, sql): (i64, String) = match task_id {
            Some(tid) => (
                conn.query_row(
                    "SELECT COUNT(*) FROM task_records WHERE task_id = ?1",
                    [tid],
                    |r| r.get(0),
                )
                .map_err(db_err)?,
                format!(
                    "SELECT {TASK_COLS} FROM task_records WHERE task_id = {tid}
                     ORDER BY id DESC LIMIT ?1 OFFSET ?2"
                ),
            ),
            None => (
                conn.query_row("SELECT COUNT(*) FROM task_records", [], |r| r.get(0))
                    .map_err(db_err)?,
                format!(
                    "SELECT {TASK_COLS} FROM task_records ORDER BY id DESC LIMIT ?1 OFFSET ?2"
                ),
            ),
        };
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params![size, (page - 1).max(0) * size], row_to_task_record)
            .map_err(db_err)?;
        let records = rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)?;
        Ok((total, records))
    }

    pub fn list_suite_records_of_task(&self, task_record_id: i64) -> Result<Vec<SuiteRunRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SUITE_COLS} FROM suite_records WHERE task_record_id = ?1 ORDER BY id"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map([task_record_id], row_to_suite_record)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    pub fn list_suite_records_of_suite(&self, suite_id: i64) -> Result<Vec<SuiteRunRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SUITE_COLS} FROM suite_records WHERE suite_id = ?1 ORDER BY id DESC"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map([suite_id], row_to_suite_record)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    pub fn list_case_records_of_suite(&self, suite_record_id: i64) -> Result<Vec<CaseRunRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {CASE_COLS} FROM case_records WHERE suite_record_id = ?1 ORDER BY id"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map([suite_record_id], row_to_case_record)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    pub fn list_case_records_of_case(&self, case_id: i64) -> Result<Vec<CaseRunRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {CASE_COLS} FROM case_records WHERE case_id = ?1 ORDER BY id DESC"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map([case_id], row_to_case_record)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    // ─── Deletion ─────────────────────────────────────────────

    pub fn delete_task_record(&self, id: i64) -> Result<()> {
        self.delete_record("task_records", id)
    }

    pub fn delete_suite_record(&self, id: i64) -> Result<()> {
        self.delete_record("suite_records", id)
    }

    pub fn delete_case_record(&self, id: i64) -> Result<()> {
        self.delete_record("case_records", id)
    }

    fn delete_record(&self, table: &str, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let n = conn
            .execute(&format!("DELETE FROM {table} WHERE id = ?1"), [id])
            .map_err(db_err)?;
        if n == 0 {
            return Err(CaseflowError::NotFound(format!("record {id} in {table}")));
        }
        Ok(())
    }
}

/// success / run_all, clamped to [0,1]; 0 when nothing ran yet.
fn pass_rate(success: i64, run_all: i64) -> f64 {
    if run_all <= 0 {
        return 0.0;
    }
    (success as f64 / run_all as f64).clamp(0.0, 1.0)
}
