//! In-process broker backend for single-node deployments and tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use caseflow_core::{CaseflowError, Result};

use crate::channel::{MessageChannel, MessageHeaders};

/// A queued message as the broker stores it.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub headers: MessageHeaders,
    pub payload: Vec<u8>,
}

/// Named FIFO queues held in memory. Publishing to an undeclared queue
/// is an error so a dispatcher bug surfaces instead of silently piling
/// messages nobody will consume.
#[derive(Default)]
pub struct InProcBroker {
    queues: Mutex<HashMap<String, Vec<QueuedMessage>>>,
}

impl InProcBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain all pending messages from a queue, oldest first.
    pub fn drain(&self, queue: &str) -> Vec<QueuedMessage> {
        let mut queues = self.queues.lock().unwrap();
        queues.get_mut(queue).map(std::mem::take).unwrap_or_default()
    }

    pub fn depth(&self, queue: &str) -> usize {
        let queues = self.queues.lock().unwrap();
        queues.get(queue).map_or(0, Vec::len)
    }
}

#[async_trait]
impl MessageChannel for InProcBroker {
    async fn declare_queue(&self, queue: &str) -> Result<()> {
        let mut queues = self.queues.lock().unwrap();
        queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> Result<()> {
        let mut queues = self.queues.lock().unwrap();
        queues.remove(queue);
        Ok(())
    }

    async fn publish(&self, queue: &str, headers: &MessageHeaders, payload: &[u8]) -> Result<()> {
        let mut queues = self.queues.lock().unwrap();
        let slot = queues
            .get_mut(queue)
            .ok_or_else(|| CaseflowError::Unavailable(format!("queue {queue} not declared")))?;
        slot.push(QueuedMessage { headers: headers.clone(), payload: payload.to_vec() });
        tracing::debug!("queued {} bytes on {queue}", payload.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use caseflow_core::types::TaskFamily;

    use super::*;

    #[tokio::test]
    async fn test_declare_is_idempotent_and_publish_preserves_order() {
        let broker = InProcBroker::new();
        broker.declare_queue("agent-1").await.unwrap();
        broker.declare_queue("agent-1").await.unwrap();

        let headers = MessageHeaders::json(TaskFamily::Functional);
        broker.publish("agent-1", &headers, b"first").await.unwrap();
        broker.publish("agent-1", &headers, b"second").await.unwrap();

        let drained = broker.drain("agent-1");
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].payload, b"first");
        assert_eq!(drained[1].payload, b"second");
        assert_eq!(broker.depth("agent-1"), 0);
    }

    #[tokio::test]
    async fn test_publish_to_undeclared_queue_fails() {
        let broker = InProcBroker::new();
        let headers = MessageHeaders::json(TaskFamily::Api);
        let err = broker.publish("ghost", &headers, b"{}").await.unwrap_err();
        assert!(matches!(err, CaseflowError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_delete_queue_discards_backlog() {
        let broker = InProcBroker::new();
        broker.declare_queue("agent-2").await.unwrap();
        let headers = MessageHeaders::json(TaskFamily::Api);
        broker.publish("agent-2", &headers, b"{}").await.unwrap();
        broker.delete_queue("agent-2").await.unwrap();
        assert_eq!(broker.depth("agent-2"), 0);
    }
}
