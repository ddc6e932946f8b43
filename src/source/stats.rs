//! Per-source fetch observability.
//!
//! Rolling in-memory window of fetch latencies and outcome counts,
//! reset on boot with everything else. Queried for operator
//! diagnostics; never consulted by the pipeline itself.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

/// Observations kept per source.
const MAX_HISTORY: usize = 256;

/// Aggregate view of one source's recent fetches.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceWindow {
    pub ok: u64,
    pub err: u64,
    pub avg_latency_ms: f64,
    pub last_latency_ms: f64,
}

#[derive(Default)]
struct History {
    latencies_ms: VecDeque<f64>,
    ok: u64,
    err: u64,
}

impl History {
    fn push(&mut self, latency: Duration) {
        if self.latencies_ms.len() >= MAX_HISTORY {
            self.latencies_ms.pop_front();
        }
        self.latencies_ms.push_back(latency.as_secs_f64() * 1000.0);
    }
}

pub struct SourceStats {
    inner: Mutex<HashMap<String, History>>,
}

impl SourceStats {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn record_ok(&self, id: &str, latency: Duration) {
        let mut map = lock(&self.inner);
        let history = map.entry(id.to_string()).or_default();
        history.ok += 1;
        history.push(latency);
    }

    pub fn record_err(&self, id: &str, latency: Duration) {
        let mut map = lock(&self.inner);
        let history = map.entry(id.to_string()).or_default();
        history.err += 1;
        history.push(latency);
    }

    pub fn window(&self, id: &str) -> Option<SourceWindow> {
        let map = lock(&self.inner);
        map.get(id).map(aggregate)
    }

    /// All sources, sorted by id.
    pub fn snapshot(&self) -> Vec<(String, SourceWindow)> {
        let map = lock(&self.inner);
        let mut out: Vec<(String, SourceWindow)> = map
            .iter()
            .map(|(id, history)| (id.clone(), aggregate(history)))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

impl Default for SourceStats {
    fn default() -> Self {
        Self::new()
    }
}

fn aggregate(history: &History) -> SourceWindow {
    let n = history.latencies_ms.len();
    let avg = if n > 0 {
        history.latencies_ms.iter().sum::<f64>() / n as f64
    } else {
        0.0
    };
    SourceWindow {
        ok: history.ok,
        err: history.err,
        avg_latency_ms: avg,
        last_latency_ms: history.latencies_ms.back().copied().unwrap_or(0.0),
    }
}

fn lock(mutex: &Mutex<HashMap<String, History>>) -> std::sync::MutexGuard<'_, HashMap<String, History>> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
