//! The wire shape of an execution payload.

use caseflow_core::types::{CronjobKind, EnvSnapshot, TaskFamily};
use serde::{Deserialize, Serialize};

/// One case inside a payload. `record_id` is what the agent echoes back
/// in its result callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseItem {
    pub record_id: i64,
    pub id: i64,
    pub name: String,
    pub skip: bool,
    pub steps: serde_json::Value,
}

/// The suite-shaped unit of work an agent consumes. Single-case runs
/// travel as a one-case suite with `id` 0 so agents have one code path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSuite {
    pub id: i64,
    pub suite_record_id: Option<i64>,
    pub task_record_id: Option<i64>,
    pub name: String,
    pub username: String,
    pub family: TaskFamily,
    /// Suite-level variable overrides, merged over the environment's.
    pub variables: serde_json::Value,
    /// Free-form per-suite configuration the agent passes to its driver.
    pub config: serde_json::Value,
    pub reset_cache: bool,
    pub setup_step: serde_json::Value,
    pub cases: Vec<CaseItem>,
    pub cronjob_type: CronjobKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchMessage {
    pub env_config: EnvSnapshot,
    pub run_suite: RunSuite,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_shape_is_stable() {
        let msg = DispatchMessage {
            env_config: EnvSnapshot {
                debug: true,
                host: "https://stage.example.com".into(),
                variables: serde_json::json!({"token": "abc"}),
            },
            run_suite: RunSuite {
                id: 4,
                suite_record_id: Some(17),
                task_record_id: Some(9),
                name: "login".into(),
                username: "tester".into(),
                family: TaskFamily::Functional,
                variables: serde_json::json!({}),
                config: serde_json::json!({}),
                reset_cache: false,
                setup_step: serde_json::json!(null),
                cases: vec![CaseItem {
                    record_id: 31,
                    id: 12,
                    name: "happy path".into(),
                    skip: false,
                    steps: serde_json::json!([]),
                }],
                cronjob_type: CronjobKind::AdHoc,
            },
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["run_suite"]["cases"][0]["record_id"], 31);
        assert_eq!(v["run_suite"]["cronjob_type"], "ad_hoc");
        assert_eq!(v["env_config"]["host"], "https://stage.example.com");
    }
}
