//! Heartbeat markers pushed by agents.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// In-memory marker set with a fixed freshness window. The gateway
/// touches a marker on every agent heartbeat; the sweep consults it
/// when the direct probe fails.
pub struct MarkerCache {
    ttl: Duration,
    seen: Mutex<HashMap<String, Instant>>,
}

impl MarkerCache {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, seen: Mutex::new(HashMap::new()) }
    }

    pub fn touch(&self, agent_id: &str) {
        let mut seen = self.seen.lock().unwrap();
        seen.insert(agent_id.to_string(), Instant::now());
    }

    pub fn is_fresh(&self, agent_id: &str) -> bool {
        let seen = self.seen.lock().unwrap();
        seen.get(agent_id).is_some_and(|t| t.elapsed() < self.ttl)
    }

    /// Drop stale markers so the map stays bounded by the live fleet.
    pub fn prune(&self) {
        let mut seen = self.seen.lock().unwrap();
        seen.retain(|_, t| t.elapsed() < self.ttl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_within_ttl() {
        let cache = MarkerCache::new(Duration::from_secs(30));
        assert!(!cache.is_fresh("agent-1"));
        cache.touch("agent-1");
        assert!(cache.is_fresh("agent-1"));
        assert!(!cache.is_fresh("agent-2"));
    }

    #[test]
    fn test_marker_expires() {
        let cache = MarkerCache::new(Duration::from_millis(10));
        cache.touch("agent-1");
        std::thread::sleep(Duration::from_millis(20));
        assert!(!cache.is_fresh("agent-1"));
        cache.prune();
        assert!(cache.seen.lock().unwrap().is_empty());
    }
}
