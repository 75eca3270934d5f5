//! Definition lookups: tasks, suites, cases, environments.
//!
//! These rows are managed by the external CRUD layer; the dispatcher only
//! reads them. Insert helpers exist so a fresh deployment (and the tests)
//! can seed data without that layer.

use caseflow_core::types::TaskFamily;
use caseflow_core::{CaseflowError, Result};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::db::{db_err, Store};

/// A test environment definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentDef {
    pub id: i64,
    pub name: String,
    pub host: String,
    pub variables: serde_json::Value,
}

/// A test task (plan) definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDef {
    pub id: i64,
    pub name: String,
    pub username: String,
}

/// A test suite definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteDef {
    pub id: i64,
    pub name: String,
    pub family: TaskFamily,
    pub setup_step: serde_json::Value,
    pub username: String,
}

/// A test case definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseDef {
    pub id: i64,
    pub name: String,
    pub steps: serde_json::Value,
}

/// A case's membership row inside a suite, in declared order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteCaseDef {
    pub case: CaseDef,
    pub sort: i64,
    pub skip: bool,
}

impl Store {
    pub fn insert_environment(
        &self,
        name: &str,
        host: &str,
        variables: &serde_json::Value,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO environments (name, host, variables) VALUES (?1, ?2, ?3)",
            params![name, host, variables.to_string()],
        )
        .map_err(db_err)?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_environment(&self, id: i64) -> Result<EnvironmentDef> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, name, host, variables FROM environments WHERE id = ?1",
            [id],
            |row| {
                Ok(EnvironmentDef {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    host: row.get(2)?,
                    variables: serde_json::from_str(&row.get::<_, String>(3)?)
                        .unwrap_or_default(),
                })
            },
        )
        .map_err(|_| CaseflowError::NotFound(format!("environment {id}")))
    }

    pub fn insert_task(&self, name: &str, username: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO tasks (name, username) VALUES (?1, ?2)",
            params![name, username],
        )
        .map_err(db_err)?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_task(&self, id: i64) -> Result<TaskDef> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, name, username FROM tasks WHERE id = ?1",
            [id],
            |row| {
                Ok(TaskDef {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    username: row.get(2)?,
                })
            },
        )
        .map_err(|_| CaseflowError::NotFound(format!("task {id}")))
    }

    pub fn insert_suite(
        &self,
        name: &str,
        family: TaskFamily,
        setup_step: &serde_json::Value,
        username: &str,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO suites (name, family, setup_step, username) VALUES (?1, ?2, ?3, ?4)",
            params![name, family.as_str(), setup_step.to_string(), username],
        )
        .map_err(db_err)?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_suite(&self, id: i64) -> Result<SuiteDef> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, name, family, setup_step, username FROM suites WHERE id = ?1",
            [id],
            |row| {
                Ok(SuiteDef {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    family: TaskFamily::parse(&row.get::<_, String>(2)?),
                    setup_step: serde_json::from_str(&row.get::<_, String>(3)?)
                        .unwrap_or_default(),
                    username: row.get(4)?,
                })
            },
        )
        .map_err(|_| CaseflowError::NotFound(format!("suite {id}")))
    }

    pub fn insert_case(&self, name: &str, steps: &serde_json::Value) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO cases (name, steps) VALUES (?1, ?2)",
            params![name, steps.to_string()],
        )
        .map_err(db_err)?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_case(&self, id: i64) -> Result<CaseDef> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, name, steps FROM cases WHERE id = ?1",
            [id],
            |row| {
                Ok(CaseDef {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    steps: serde_json::from_str(&row.get::<_, String>(2)?).unwrap_or_default(),
                })
            },
        )
        .map_err(|_| CaseflowError::NotFound(format!("case {id}")))
    }

    pub fn add_suite_to_task(&self, task_id: i64, suite_id: i64, sort: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO task_suites (task_id, suite_id, sort) VALUES (?1, ?2, ?3)",
            params![task_id, suite_id, sort],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn add_case_to_suite(
        &self,
        suite_id: i64,
        case_id: i64,
        sort: i64,
        skip: bool,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO suite_cases (suite_id, case_id, sort, skip)
             VALUES (?1, ?2, ?3, ?4)",
            params![suite_id, case_id, sort, skip as i32],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Suites under a task, in declared order.
    pub fn task_suites(&self, task_id: i64) -> Result<Vec<SuiteDef>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT s.id, s.name, s.family, s.setup_step, s.username
                 FROM suites s JOIN task_suites ts ON ts.suite_id = s.id
                 WHERE ts.task_id = ?1 ORDER BY ts.sort, s.id",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([task_id], |row| {
                Ok(SuiteDef {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    family: TaskFamily::parse(&row.get::<_, String>(2)?),
                    setup_step: serde_json::from_str(&row.get::<_, String>(3)?)
                        .unwrap_or_default(),
                    username: row.get(4)?,
                })
            })
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Cases under a suite, in declared (step) order.
    pub fn suite_cases(&self, suite_id: i64) -> Result<Vec<SuiteCaseDef>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT c.id, c.name, c.steps, sc.sort, sc.skip
                 FROM cases c JOIN suite_cases sc ON sc.case_id = c.id
                 WHERE sc.suite_id = ?1 ORDER BY sc.sort, c.id",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([suite_id], |row| {
                Ok(SuiteCaseDef {
                    case: CaseDef {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        steps: serde_json::from_str(&row.get::<_, String>(2)?)
                            .unwrap_or_default(),
                    },
                    sort: row.get(3)?,
                    skip: row.get::<_, i32>(4)? != 0,
                })
            })
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definitions_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let env = store
            .insert_environment("staging", "https://stage.example.com", &serde_json::json!({}))
            .unwrap();
        assert_eq!(store.get_environment(env).unwrap().name, "staging");

        let task = store.insert_task("nightly", "tester").unwrap();
        let suite = store
            .insert_suite("login", TaskFamily::Functional, &serde_json::json!([]), "tester")
            .unwrap();
        let case_a = store.insert_case("valid login", &serde_json::json!([])).unwrap();
        let case_b = store.insert_case("bad password", &serde_json::json!([])).unwrap();

        store.add_suite_to_task(task, suite, 0).unwrap();
        store.add_case_to_suite(suite, case_b, 1, false).unwrap();
        store.add_case_to_suite(suite, case_a, 0, true).unwrap();

        let suites = store.task_suites(task).unwrap();
        assert_eq!(suites.len(), 1);

        // ordered by sort, not insertion
        let cases = store.suite_cases(suite).unwrap();
        assert_eq!(cases[0].case.id, case_a);
        assert!(cases[0].skip);
        assert_eq!(cases[1].case.id, case_b);
    }

    #[test]
    fn test_missing_definition_is_not_found() {
        let store = Store::open_in_memory().unwrap();
        assert!(matches!(
            store.get_task(999),
            Err(caseflow_core::CaseflowError::NotFound(_))
        ));
    }
}
