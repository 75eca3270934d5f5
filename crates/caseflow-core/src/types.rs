//! Domain types shared across the workspace.

use serde::{Deserialize, Serialize};

/// An agent's advisory workload marker. Orthogonal to liveness: the
/// heartbeat monitor owns `reachable`, the dispatcher writes this field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Workload {
    Idle,
    Busy,
    Running,
    Fault,
}

impl Workload {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Running => "running",
            Self::Fault => "fault",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "busy" => Self::Busy,
            "running" => Self::Running,
            "fault" => Self::Fault,
            _ => Self::Idle,
        }
    }
}

/// Combined status string for the API edge. Liveness wins: an unreachable
/// agent is "offline" no matter what its workload says.
pub fn agent_status(reachable: bool, workload: Workload) -> &'static str {
    if !reachable {
        return "offline";
    }
    match workload {
        Workload::Idle => "online",
        Workload::Busy => "busy",
        Workload::Running => "running",
        Workload::Fault => "fault",
    }
}

/// Task/suite run record status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "completed" => Self::Completed,
            _ => Self::Queued,
        }
    }
}

/// Case run record status, the finer-grained leaf level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Queued,
    Running,
    Success,
    Fail,
    Error,
    Skip,
}

impl CaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Success => "success",
            Self::Fail => "fail",
            Self::Error => "error",
            Self::Skip => "skip",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "success" => Self::Success,
            "fail" => Self::Fail,
            "error" => Self::Error,
            "skip" => Self::Skip,
            _ => Self::Queued,
        }
    }

    /// A terminal case has been executed (or deliberately skipped).
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Queued | Self::Running)
    }
}

/// Outcome of the record-then-publish sequence for a suite record.
/// `queued` means records exist but no message was sent yet;
/// `publish_failed` is terminal and operator-visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchState {
    Queued,
    Dispatched,
    PublishFailed,
}

impl DispatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Dispatched => "dispatched",
            Self::PublishFailed => "publish_failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "dispatched" => Self::Dispatched,
            "publish_failed" => Self::PublishFailed,
            _ => Self::Queued,
        }
    }
}

/// Discriminates a schedule-fired run from an operator-fired one.
/// Travels on the wire so agents can label results accordingly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CronjobKind {
    AdHoc,
    Recurring,
}

impl CronjobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AdHoc => "ad_hoc",
            Self::Recurring => "recurring",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "recurring" => Self::Recurring,
            _ => Self::AdHoc,
        }
    }
}

/// Which family of tests a suite (and its queue messages) belongs to.
/// A shared channel carries both; the header keeps them apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskFamily {
    Functional,
    Api,
}

impl TaskFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Functional => "functional",
            Self::Api => "api",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "api" => Self::Api,
            _ => Self::Functional,
        }
    }
}

/// Snapshot of the execution environment taken at dispatch time and
/// frozen into every run record and wire message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvSnapshot {
    /// Debug mode requested by the initiator.
    pub debug: bool,
    /// Target host under test.
    pub host: String,
    /// Environment-level global variables.
    #[serde(default)]
    pub variables: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for s in ["queued", "running", "success", "fail", "error", "skip"] {
            assert_eq!(CaseStatus::parse(s).as_str(), s);
        }
        for s in ["queued", "running", "completed"] {
            assert_eq!(RunStatus::parse(s).as_str(), s);
        }
    }

    #[test]
    fn test_agent_status_liveness_wins() {
        assert_eq!(agent_status(false, Workload::Running), "offline");
        assert_eq!(agent_status(true, Workload::Running), "running");
        assert_eq!(agent_status(true, Workload::Idle), "online");
    }

    #[test]
    fn test_terminal_case_states() {
        assert!(CaseStatus::Success.is_terminal());
        assert!(CaseStatus::Skip.is_terminal());
        assert!(!CaseStatus::Queued.is_terminal());
        assert!(!CaseStatus::Running.is_terminal());
    }
}
