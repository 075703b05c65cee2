//! Process-local operational counters.
//!
//! Counters back the metric-recording callsites in the ingestor, the
//! orchestrator, and the GitHub integrator. Aggregate per-repository numbers
//! come from the repository instead; these counters are cheap, in-memory,
//! and reset on restart.

use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Default)]
pub struct Metrics {
    counters: Mutex<BTreeMap<String, u64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self, name: &str) {
        let mut counters = self.counters.lock().unwrap();
        *counters.entry(name.to_string()).or_insert(0) += 1;
    }

    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counters.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incr_and_snapshot() {
        let metrics = Metrics::new();
        metrics.incr("webhook.received");
        metrics.incr("webhook.received");
        metrics.incr("webhook.deduplicated");

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.get("webhook.received"), Some(&2));
        assert_eq!(snapshot.get("webhook.deduplicated"), Some(&1));
        assert_eq!(snapshot.get("missing"), None);
    }
}
