//! Topic pub/sub with bounded history, backing the live relay.
//!
//! Agents publish log lines and screen frames to `{agent_id}:log` and
//! `{agent_id}:screen`; websocket sessions subscribe and receive the
//! retained history first, then the live stream. The monitor uses
//! `agent:{id}:status` topics the same way with a history of one.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Log,
    Screen,
    Status,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub data: serde_json::Value,
}

struct Topic {
    sender: broadcast::Sender<Event>,
    history: VecDeque<Event>,
}

/// In-process fan-out bus. Slow subscribers lag and drop instead of
/// backpressuring the publisher.
pub struct TopicBus {
    topics: Mutex<HashMap<String, Topic>>,
    history_limit: usize,
}

impl TopicBus {
    pub fn new(history_limit: usize) -> Self {
        Self { topics: Mutex::new(HashMap::new()), history_limit }
    }

    /// Publish an event, retaining it in the topic history. Delivery to
    /// live subscribers is best-effort.
    pub fn publish(&self, topic: &str, event: Event) {
        let mut topics = self.topics.lock().unwrap();
        let slot = topics.entry(topic.to_string()).or_insert_with(|| Topic {
            sender: broadcast::channel(256).0,
            history: VecDeque::new(),
        });
        if slot.history.len() >= self.history_limit {
            slot.history.pop_front();
        }
        slot.history.push_back(event.clone());
        let _ = slot.sender.send(event);
    }

    /// Subscribe to a topic: the retained history plus a live receiver.
    pub fn subscribe(&self, topic: &str) -> (Vec<Event>, broadcast::Receiver<Event>) {
        let mut topics = self.topics.lock().unwrap();
        let slot = topics.entry(topic.to_string()).or_insert_with(|| Topic {
            sender: broadcast::channel(256).0,
            history: VecDeque::new(),
        });
        (slot.history.iter().cloned().collect(), slot.sender.subscribe())
    }

    /// Drop a topic and its history. Live receivers see the channel close.
    pub fn clear(&self, topic: &str) {
        let mut topics = self.topics.lock().unwrap();
        topics.remove(topic);
    }
}
