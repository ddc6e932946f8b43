//! Machine collection and per-block fan-out.

use super::{Machine, MachineConfig, Signal, State};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Owns all state machines. Keyed by machine id in a `BTreeMap` so
/// fan-out, and therefore signal emission, is always in ascending id
/// order.
pub struct MachineManager {
    machines: BTreeMap<String, Machine>,
}

impl MachineManager {
    pub fn new() -> Self {
        Self {
            machines: BTreeMap::new(),
        }
    }

    /// Replace the whole collection. Machines are rebuilt from config,
    /// which implicitly clears every runtime.
    pub fn replace_all(&mut self, configs: Vec<MachineConfig>) {
        self.machines = configs
            .into_iter()
            .map(|cfg| (cfg.id.clone(), Machine::new(cfg)))
            .collect();
    }

    /// Clear every machine's runtime. Invoked on classifier rule
    /// changes.
    pub fn reset_all(&mut self) {
        for machine in self.machines.values_mut() {
            machine.reset();
        }
    }

    /// Feed one block event to every machine, collecting emitted
    /// signals in ascending machine-id order.
    pub fn process_block(&mut self, height: u64, state: State, now: DateTime<Utc>) -> Vec<Signal> {
        let mut signals = Vec::new();
        for machine in self.machines.values_mut() {
            signals.extend(machine.process(height, state, now));
        }
        signals
    }

    pub fn get(&self, id: &str) -> Option<&Machine> {
        self.machines.get(id)
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }
}

impl Default for MachineManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::SignalKind;
    use State::{Off, On};

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn config(id: &str, count: u32) -> MachineConfig {
        MachineConfig {
            id: id.to_string(),
            enabled: true,
            trigger_state: On,
            trigger_count: count,
            hit_enabled: false,
            hit_expect: Off,
            hit_offset: 1,
        }
    }

    #[test]
    fn test_signals_in_ascending_id_order() {
        let mut mgr = MachineManager::new();
        // inserted out of order on purpose
        mgr.replace_all(vec![config("m3", 1), config("m1", 1), config("m2", 1)]);

        // open every gate, then fire all three on the same block
        mgr.process_block(100, Off, now());
        let signals = mgr.process_block(101, On, now());

        let ids: Vec<&str> = signals.iter().map(|s| s.machine_id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);
        assert!(signals.iter().all(|s| s.kind == SignalKind::Trigger));
    }

    #[test]
    fn test_replace_all_resets_runtime() {
        let mut mgr = MachineManager::new();
        mgr.replace_all(vec![config("m1", 3)]);
        mgr.process_block(100, Off, now());
        mgr.process_block(101, On, now());
        assert_eq!(mgr.get("m1").unwrap().count(), 1);

        mgr.replace_all(vec![config("m1", 3)]);
        let m = mgr.get("m1").unwrap();
        assert_eq!(m.count(), 0);
        assert!(m.waiting_reverse());
    }

    #[test]
    fn test_reset_all() {
        let mut mgr = MachineManager::new();
        mgr.replace_all(vec![config("m1", 5), config("m2", 5)]);
        mgr.process_block(100, Off, now());
        mgr.process_block(101, On, now());

        mgr.reset_all();
        for id in ["m1", "m2"] {
            let m = mgr.get(id).unwrap();
            assert_eq!(m.count(), 0);
            assert!(m.waiting_reverse());
        }
    }
}
