//! Database handle and migrations.

use caseflow_core::{CaseflowError, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Mutex;

/// The Caseflow database, a single SQLite file behind a mutex.
pub struct Store {
    pub(crate) conn: Mutex<Connection>,
}

pub(crate) fn db_err(e: rusqlite::Error) -> CaseflowError {
    CaseflowError::Storage(e.to_string())
}

impl Store {
    /// Open or create the database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            -- Definition tables (owned by the external CRUD layer)
            CREATE TABLE IF NOT EXISTS environments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                host TEXT NOT NULL,
                variables TEXT NOT NULL DEFAULT '{}'     -- JSON object
            );

            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                username TEXT NOT NULL DEFAULT ''
            );

            CREATE TABLE IF NOT EXISTS suites (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                family TEXT NOT NULL DEFAULT 'functional', -- functional | api
                setup_step TEXT NOT NULL DEFAULT '[]',     -- JSON list
                username TEXT NOT NULL DEFAULT ''
            );

            CREATE TABLE IF NOT EXISTS cases (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                steps TEXT NOT NULL DEFAULT '[]'           -- JSON list
            );

            CREATE TABLE IF NOT EXISTS task_suites (
                task_id INTEGER NOT NULL,
                suite_id INTEGER NOT NULL,
                sort INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (task_id, suite_id)
            );

            CREATE TABLE IF NOT EXISTS suite_cases (
                suite_id INTEGER NOT NULL,
                case_id INTEGER NOT NULL,
                sort INTEGER NOT NULL DEFAULT 0,
                skip INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (suite_id, case_id)
            );

            -- Agent registry. reachable is the liveness axis (heartbeat
            -- monitor only); workload is the advisory dispatch marker.
            CREATE TABLE IF NOT EXISTS agents (
                id TEXT PRIMARY KEY,
                address TEXT NOT NULL,
                name TEXT NOT NULL DEFAULT '',
                platform TEXT NOT NULL DEFAULT '',
                version TEXT NOT NULL DEFAULT '',
                hostname TEXT NOT NULL DEFAULT '',
                capabilities TEXT NOT NULL DEFAULT '[]',   -- JSON list
                username TEXT NOT NULL DEFAULT '',
                reachable INTEGER NOT NULL DEFAULT 1,
                workload TEXT NOT NULL DEFAULT 'idle',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- Scheduled job definitions (mirrored into the engine's own
            -- job store under the same id).
            CREATE TABLE IF NOT EXISTS job_defs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                username TEXT NOT NULL DEFAULT '',
                project TEXT,
                env_id INTEGER NOT NULL,
                task_id INTEGER NOT NULL,
                trigger_kind TEXT NOT NULL,                -- date | interval | cron
                trigger_params TEXT NOT NULL,              -- JSON
                cronjob_kind TEXT NOT NULL DEFAULT 'recurring',
                enabled INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- Run records
            CREATE TABLE IF NOT EXISTS task_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id INTEGER NOT NULL,
                username TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'queued',
                env TEXT NOT NULL DEFAULT '{}',            -- JSON snapshot
                start_time TEXT NOT NULL,
                duration REAL NOT NULL DEFAULT 0,
                all_count INTEGER NOT NULL DEFAULT 0,
                run_all INTEGER NOT NULL DEFAULT 0,
                no_run INTEGER NOT NULL DEFAULT 0,
                success INTEGER NOT NULL DEFAULT 0,
                fail INTEGER NOT NULL DEFAULT 0,
                error INTEGER NOT NULL DEFAULT 0,
                skip INTEGER NOT NULL DEFAULT 0,
                pass_rate REAL NOT NULL DEFAULT 0,
                task_log TEXT NOT NULL DEFAULT '[]'        -- JSON list
            );

            CREATE TABLE IF NOT EXISTS suite_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                suite_id INTEGER NOT NULL,
                task_record_id INTEGER,
                username TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'queued',
                dispatch_state TEXT NOT NULL DEFAULT 'queued',
                env TEXT NOT NULL DEFAULT '{}',
                start_time TEXT NOT NULL,
                duration REAL NOT NULL DEFAULT 0,
                all_count INTEGER NOT NULL DEFAULT 0,
                run_all INTEGER NOT NULL DEFAULT 0,
                no_run INTEGER NOT NULL DEFAULT 0,
                success INTEGER NOT NULL DEFAULT 0,
                fail INTEGER NOT NULL DEFAULT 0,
                error INTEGER NOT NULL DEFAULT 0,
                skip INTEGER NOT NULL DEFAULT 0,
                pass_rate REAL NOT NULL DEFAULT 0,
                suite_log TEXT NOT NULL DEFAULT '[]'
            );

            CREATE TABLE IF NOT EXISTS case_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                case_id INTEGER NOT NULL,
                suite_record_id INTEGER,
                username TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'queued',
                env TEXT NOT NULL DEFAULT '{}',
                start_time TEXT NOT NULL,
                duration REAL NOT NULL DEFAULT 0,
                run_info TEXT NOT NULL DEFAULT '{}'        -- JSON detail
            );

            CREATE INDEX IF NOT EXISTS idx_suite_records_task
                ON suite_records(task_record_id);
            CREATE INDEX IF NOT EXISTS idx_case_records_suite
                ON case_records(suite_record_id);
            ",
        )
        .map_err(db_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_and_migrate() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("test.db")).unwrap();
        assert!(store.list_agents(None).unwrap().is_empty());
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        drop(Store::open(&path).unwrap());
        // reopening runs migrations again
        let store = Store::open(&path).unwrap();
        assert!(store.list_agents(None).unwrap().is_empty());
    }
}
