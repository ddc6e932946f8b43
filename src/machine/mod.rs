//! Counting state machines over the (height, state) stream.
//!
//! A machine counts consecutive blocks matching its trigger state
//! under a reverse-gate discipline: after boot and after every
//! TRIGGER, a block of the opposite state must be seen before
//! counting resumes. A trigger may arm a deferred HIT observation at
//! trigger height + offset, which fires iff the state seen at exactly
//! that height matches the configured expectation.

pub mod manager;

pub use manager::MachineManager;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Binary block state derived from the hash classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    #[serde(rename = "ON")]
    On,
    #[serde(rename = "OFF")]
    Off,
}

impl State {
    pub fn flip(self) -> State {
        match self {
            State::On => State::Off,
            State::Off => State::On,
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            State::On => write!(f, "ON"),
            State::Off => write!(f, "OFF"),
        }
    }
}

/// Per-machine configuration. Runtime state is never persisted; a
/// config change always rebuilds the machine from scratch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineConfig {
    pub id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// The state being counted.
    pub trigger_state: State,
    /// Consecutive occurrences needed to fire.
    pub trigger_count: u32,
    #[serde(default)]
    pub hit_enabled: bool,
    #[serde(default = "default_hit_expect")]
    pub hit_expect: State,
    /// HIT observation height is trigger height + this offset.
    #[serde(default = "default_hit_offset")]
    pub hit_offset: u32,
}

fn default_true() -> bool {
    true
}
fn default_hit_expect() -> State {
    State::Off
}
fn default_hit_offset() -> u32 {
    1
}

/// Kind of an emitted signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SignalKind {
    #[serde(rename = "TRIGGER")]
    Trigger,
    #[serde(rename = "HIT")]
    Hit,
}

/// A signal pushed to subscribers.
///
/// For TRIGGER, `base_height == height` and `state` is the machine's
/// trigger state. For HIT, `base_height` is the originating trigger's
/// height and `state` is the state observed at `height`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub machine_id: String,
    pub height: u64,
    pub base_height: u64,
    pub state: State,
    pub time: DateTime<Utc>,
}

/// Volatile per-machine state. Reset on boot, on rule switch, and on
/// any machine config change.
#[derive(Debug, Clone, Copy)]
struct Runtime {
    count: u32,
    waiting_reverse: bool,
    base_height: u64,
    hit_waiting: bool,
    hit_target: u64,
}

impl Runtime {
    fn cleared() -> Self {
        Self {
            count: 0,
            waiting_reverse: true,
            base_height: 0,
            hit_waiting: false,
            hit_target: 0,
        }
    }
}

/// One counting state machine.
pub struct Machine {
    config: MachineConfig,
    rt: Runtime,
}

impl Machine {
    pub fn new(config: MachineConfig) -> Self {
        Self {
            config,
            rt: Runtime::cleared(),
        }
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    pub fn count(&self) -> u32 {
        self.rt.count
    }

    pub fn waiting_reverse(&self) -> bool {
        self.rt.waiting_reverse
    }

    pub fn hit_waiting(&self) -> bool {
        self.rt.hit_waiting
    }

    /// Clear all volatile state: counter zeroed, reverse gate closed,
    /// pending HIT dropped.
    pub fn reset(&mut self) {
        self.rt = Runtime::cleared();
    }

    /// Process one block event. Returns the signals emitted by this
    /// event: usually none, a TRIGGER, a HIT, or (rarely) both when a
    /// HIT observation and a fresh trigger land on the same height.
    pub fn process(&mut self, height: u64, state: State, now: DateTime<Utc>) -> Vec<Signal> {
        let mut out = Vec::new();
        if !self.config.enabled {
            return out;
        }

        // HIT phase: the armed target height is observed at most once.
        // A height beyond the target means the observation was skipped
        // (missed polling tick); the wait is cleared silently.
        if self.rt.hit_waiting && height >= self.rt.hit_target {
            self.rt.hit_waiting = false;
            if height == self.rt.hit_target {
                if state == self.config.hit_expect {
                    info!(
                        machine = %self.config.id,
                        base = self.rt.base_height,
                        height,
                        state = %state,
                        "HIT_SIGNAL"
                    );
                    out.push(Signal {
                        kind: SignalKind::Hit,
                        machine_id: self.config.id.clone(),
                        height,
                        base_height: self.rt.base_height,
                        state,
                        time: now,
                    });
                } else {
                    info!(
                        machine = %self.config.id,
                        base = self.rt.base_height,
                        height,
                        got = %state,
                        expect = %self.config.hit_expect,
                        "HIT_MISS"
                    );
                }
            }
        }

        // Reverse gate: counting only resumes once a non-trigger state
        // has been seen.
        if self.rt.waiting_reverse {
            if state != self.config.trigger_state {
                self.rt.waiting_reverse = false;
                self.rt.count = 0;
            }
            return out;
        }

        // Counting.
        if state == self.config.trigger_state {
            self.rt.count += 1;
        } else {
            self.rt.count = 0;
        }

        // Trigger check.
        if self.rt.count >= self.config.trigger_count {
            self.rt.count = 0;
            self.rt.waiting_reverse = true;
            self.rt.base_height = height;

            match state {
                State::On => info!(machine = %self.config.id, height, "ON_SIGNAL"),
                State::Off => info!(machine = %self.config.id, height, "OFF_SIGNAL"),
            }
            out.push(Signal {
                kind: SignalKind::Trigger,
                machine_id: self.config.id.clone(),
                height,
                base_height: height,
                state,
                time: now,
            });

            if self.config.hit_enabled && self.config.hit_offset >= 1 {
                self.rt.hit_waiting = true;
                self.rt.hit_target = height + u64::from(self.config.hit_offset);
                info!(
                    machine = %self.config.id,
                    base = height,
                    offset = self.config.hit_offset,
                    expect = %self.config.hit_expect,
                    "HIT_ARMED"
                );
            }
        }

        out
    }
}
