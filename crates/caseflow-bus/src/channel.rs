//! The work-queue channel trait and the retrying publish helper.

use std::time::Duration;

use async_trait::async_trait;
use caseflow_core::types::TaskFamily;
use caseflow_core::Result;
use serde::{Deserialize, Serialize};

/// Message metadata delivered alongside the payload. Agents read the
/// family header to pick an executor without parsing the body first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageHeaders {
    pub task_family: TaskFamily,
    pub content_type: String,
    /// Persistent messages survive a broker restart.
    pub persistent: bool,
}

impl MessageHeaders {
    pub fn json(task_family: TaskFamily) -> Self {
        Self { task_family, content_type: "application/json".into(), persistent: true }
    }
}

/// A named-queue message broker. One queue per agent; declaring an
/// existing queue is a no-op, so callers declare before every publish.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    async fn declare_queue(&self, queue: &str) -> Result<()>;
    async fn delete_queue(&self, queue: &str) -> Result<()>;
    async fn publish(&self, queue: &str, headers: &MessageHeaders, payload: &[u8]) -> Result<()>;
}

/// Publish with bounded fixed-delay retries. Returns the last error when
/// every attempt fails; the caller decides what the failure means.
pub async fn publish_with_retry(
    channel: &dyn MessageChannel,
    queue: &str,
    headers: &MessageHeaders,
    payload: &[u8],
    attempts: u32,
    delay: Duration,
) -> Result<()> {
    let mut last = None;
    for attempt in 1..=attempts.max(1) {
        match channel.publish(queue, headers, payload).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                tracing::warn!("publish to {queue} failed (attempt {attempt}/{attempts}): {e}");
                last = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    Err(last.unwrap_or_else(|| {
        caseflow_core::CaseflowError::Unavailable(format!("queue {queue} unreachable"))
    }))
}
