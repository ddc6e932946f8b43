//! Observable runtime status.
//!
//! The latest successful observation plus listener state, published
//! through a watch channel so status pollers and the SSE layer read
//! without touching runner state. Reset to empty on every boot.

use crate::judge::Rule;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub listening: bool,
    pub last_height: u64,
    pub last_hash: String,
    /// RFC3339 UTC of the last block, empty until the first fetch.
    #[serde(rename = "lastTimeISO")]
    pub last_time_iso: String,
    pub classifier_rule: Rule,
    pub machine_count: usize,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            listening: false,
            last_height: 0,
            last_hash: String::new(),
            last_time_iso: String::new(),
            classifier_rule: Rule::default(),
            machine_count: 0,
        }
    }
}

pub struct StatusStore {
    tx: watch::Sender<Status>,
}

impl StatusStore {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Status::default());
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> Status {
        self.tx.borrow().clone()
    }

    pub fn set_listening(&self, listening: bool) {
        self.tx.send_modify(|status| status.listening = listening);
    }

    pub fn set_rule(&self, rule: Rule) {
        self.tx.send_modify(|status| status.classifier_rule = rule);
    }

    pub fn set_machine_count(&self, count: usize) {
        self.tx.send_modify(|status| status.machine_count = count);
    }

    pub fn update_block(&self, height: u64, hash: &str, time: DateTime<Utc>) {
        self.tx.send_modify(|status| {
            status.last_height = height;
            status.last_hash = hash.to_string();
            status.last_time_iso = time.to_rfc3339_opts(SecondsFormat::Secs, true);
        });
    }
}

impl Default for StatusStore {
    fn default() -> Self {
        Self::new()
    }
}
