//! The polling runner.
//!
//! One cooperative loop drives the whole pipeline each tick:
//! dispatcher race → dedup → classifier → machine fan-out → hub
//! broadcast. Dedup, classification, and machine state all live on
//! this task, so none of them needs locking.

pub mod status;

use crate::block::{Block, DedupRing};
use crate::config::AppConfig;
use crate::hub::SignalHub;
use crate::judge::{self, Rule};
use crate::machine::{MachineManager, Signal};
use crate::source::dispatcher::Dispatcher;
use crate::source::{Fetch, SourceAdapter, SourceConfig};
use chrono::Utc;
use status::StatusStore;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, timeout, Interval, MissedTickBehavior};
use tracing::{info, warn};

/// Consecutive dispatcher failures tolerated before the failure
/// policy engages.
const FAIL_THRESHOLD: u32 = 3;
/// Per-tick fetch deadline, as a multiple of the tick interval.
const TICK_DEADLINE_FACTOR: u32 = 4;

/// Builds the adapter set for a config snapshot. Injectable so tests
/// can run the loop against scripted fetchers.
pub type AdapterFactory<F> = Box<dyn Fn(&[SourceConfig]) -> Vec<Arc<F>> + Send + Sync>;

pub struct Runner<F: Fetch> {
    cfg_rx: watch::Receiver<Arc<AppConfig>>,
    dispatcher: Arc<Dispatcher<F>>,
    hub: Arc<SignalHub>,
    status: Arc<StatusStore>,
    shutdown: watch::Receiver<bool>,
    adapter_factory: AdapterFactory<F>,

    // Owned exclusively by the runner task.
    machines: MachineManager,
    ring: DedupRing,
    rule: Rule,
    failures: u32,
    listening: bool,
}

impl Runner<SourceAdapter> {
    /// Runner wired to real HTTP adapters.
    pub fn new(
        cfg_rx: watch::Receiver<Arc<AppConfig>>,
        dispatcher: Arc<Dispatcher<SourceAdapter>>,
        hub: Arc<SignalHub>,
        status: Arc<StatusStore>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self::with_adapter_factory(
            cfg_rx,
            dispatcher,
            hub,
            status,
            shutdown,
            Box::new(build_http_adapters),
        )
    }
}

fn build_http_adapters(configs: &[SourceConfig]) -> Vec<Arc<SourceAdapter>> {
    let mut adapters = Vec::with_capacity(configs.len());
    for cfg in configs {
        match SourceAdapter::new(cfg.clone()) {
            Ok(adapter) => adapters.push(Arc::new(adapter)),
            Err(err) => warn!(id = %cfg.id, err = %err, "failed to build source adapter"),
        }
    }
    adapters
}

impl<F: Fetch> Runner<F> {
    pub fn with_adapter_factory(
        mut cfg_rx: watch::Receiver<Arc<AppConfig>>,
        dispatcher: Arc<Dispatcher<F>>,
        hub: Arc<SignalHub>,
        status: Arc<StatusStore>,
        shutdown: watch::Receiver<bool>,
        adapter_factory: AdapterFactory<F>,
    ) -> Self {
        let initial = cfg_rx.borrow_and_update().clone();
        let mut runner = Self {
            cfg_rx,
            dispatcher,
            hub,
            status,
            shutdown,
            adapter_factory,
            machines: MachineManager::new(),
            ring: DedupRing::default(),
            rule: initial.classifier_rule,
            failures: 0,
            listening: false,
        };
        runner.apply_config(&initial, true);
        runner
    }

    /// Rebuild adapters and machines from a new snapshot. The dedup
    /// ring survives unless the classifier rule moved.
    fn apply_config(&mut self, cfg: &AppConfig, boot: bool) {
        let rule_changed = cfg.classifier_rule != self.rule;
        if rule_changed && !boot {
            info!(from = %self.rule, to = %cfg.classifier_rule, "JUDGE_RULE_CHANGED");
        }

        self.dispatcher
            .replace_all((self.adapter_factory)(&cfg.sources));
        self.machines.replace_all(cfg.machines.clone());
        if rule_changed || boot {
            self.ring.reset();
        }
        self.rule = cfg.classifier_rule;
        self.status.set_rule(self.rule);
        self.status.set_machine_count(self.machines.len());
    }

    fn refresh_config(&mut self, cfg: &mut Arc<AppConfig>, ticker: &mut Interval) {
        *cfg = self.cfg_rx.borrow_and_update().clone();
        self.apply_config(cfg, false);
        if cfg.tick() != ticker.period() {
            *ticker = new_ticker(cfg.tick());
        }
        if !self.listening {
            self.failures = 0;
            self.start_listening();
        }
    }

    /// Run until shutdown. Exits after the in-flight tick; nothing is
    /// drained.
    pub async fn run(mut self) {
        let mut cfg = self.cfg_rx.borrow_and_update().clone();
        let mut ticker = new_ticker(cfg.tick());
        self.start_listening();

        loop {
            if self.listening {
                tokio::select! {
                    _ = wait_shutdown(&mut self.shutdown) => break,
                    _ = ticker.tick() => self.tick_once(&cfg).await,
                }
                if self.cfg_rx.has_changed().unwrap_or(false) {
                    self.refresh_config(&mut cfg, &mut ticker);
                }
            } else {
                // Stopped by the failure policy: only a config change
                // (or shutdown) wakes the loop back up.
                tokio::select! {
                    _ = wait_shutdown(&mut self.shutdown) => break,
                    changed = self.cfg_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        self.refresh_config(&mut cfg, &mut ticker);
                    }
                }
            }
        }

        self.stop_listening();
    }

    async fn tick_once(&mut self, cfg: &AppConfig) {
        let deadline = cfg.tick() * TICK_DEADLINE_FACTOR;
        let fetched = timeout(deadline, self.dispatcher.fetch_any()).await;
        let block = match fetched {
            Ok(Ok(block)) => block,
            Ok(Err(err)) => {
                self.on_fetch_failure(cfg, &err.to_string()).await;
                return;
            }
            Err(_) => {
                self.on_fetch_failure(cfg, "tick deadline exceeded").await;
                return;
            }
        };

        self.failures = 0;
        let Some(height) = block.height_u64() else {
            warn!(height = %block.height, "block height unparseable");
            return;
        };
        self.status.update_block(height, &block.hash, block.time);

        for signal in self.intake(height, block) {
            self.hub.broadcast(&signal);
        }
    }

    /// Dedup → classify → machine fan-out. Returns the signals this
    /// block produced, in ascending machine-id order.
    fn intake(&mut self, height: u64, block: Block) -> Vec<Signal> {
        if !self.ring.add_if_new(&block) {
            return Vec::new();
        }

        let state = match judge::classify(self.rule, &block.hash) {
            Ok(state) => state,
            Err(err) => {
                warn!(rule = %self.rule, height, hash = %block.hash, err = %err, "JUDGE_FAIL");
                return Vec::new();
            }
        };

        self.machines.process_block(height, state, Utc::now())
    }

    async fn on_fetch_failure(&mut self, cfg: &AppConfig, err: &str) {
        self.failures += 1;
        warn!(failures = self.failures, err, "fetch failed");
        if self.failures < FAIL_THRESHOLD {
            return;
        }

        if cfg.auto_restart {
            warn!(
                wait_minutes = cfg.fail_wait_minutes,
                "sources failing, waiting before resuming"
            );
            tokio::select! {
                _ = wait_shutdown(&mut self.shutdown) => {}
                _ = tokio::time::sleep(cfg.fail_wait()) => {}
            }
            self.failures = 0;
        } else {
            warn!("sources failing, stopping until reconfigured");
            self.failures = 0;
            self.stop_listening();
        }
    }

    fn start_listening(&mut self) {
        if !self.listening {
            self.listening = true;
            self.status.set_listening(true);
            info!("LISTENER_START");
        }
    }

    fn stop_listening(&mut self) {
        if self.listening {
            self.listening = false;
            self.status.set_listening(false);
            info!("LISTENER_STOP");
        }
    }
}

fn new_ticker(period: std::time::Duration) -> Interval {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Resolves once the shutdown flag flips (or its sender is gone).
/// Cancel-safe, so it can sit in the runner's select arms.
async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{self, AppConfig};
    use crate::machine::{MachineConfig, SignalKind, State};
    use chrono::DateTime;

    fn block(height: u64, hash: &str) -> Block {
        Block {
            height: height.to_string(),
            hash: hash.to_string(),
            time: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            source_id: "test".to_string(),
        }
    }

    fn machine_cfg(id: &str, count: u32) -> MachineConfig {
        MachineConfig {
            id: id.to_string(),
            enabled: true,
            trigger_state: State::On,
            trigger_count: count,
            hit_enabled: false,
            hit_expect: State::Off,
            hit_offset: 1,
        }
    }

    // Runner under test has no adapters; blocks are pushed straight
    // into the intake pipeline. The shutdown sender must stay alive:
    // dropping it reads as a shutdown request.
    fn test_runner(
        cfg: AppConfig,
    ) -> (Runner<SourceAdapter>, config::ConfigHandle, watch::Sender<bool>) {
        let (handle, cfg_rx) = config::channel(cfg).unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = Runner::with_adapter_factory(
            cfg_rx,
            Arc::new(Dispatcher::new()),
            Arc::new(SignalHub::new()),
            Arc::new(StatusStore::new()),
            shutdown_rx,
            Box::new(|_| Vec::new()),
        );
        (runner, handle, shutdown_tx)
    }

    #[test]
    fn test_lucky_trigger_sequence() {
        // Hashes alternate classes under LUCKY; only the run after the
        // first OFF may fire.
        let mut cfg = AppConfig::default();
        cfg.machines = vec![machine_cfg("m1", 3)];
        let (mut runner, _handle, _shutdown_tx) = test_runner(cfg);

        let hashes = ["00a3", "00b7", "0099", "00c2", "00d4", "00e5"];
        let mut signals = Vec::new();
        for (i, hash) in hashes.iter().enumerate() {
            let height = 10 + i as u64;
            signals.extend(runner.intake(height, block(height, hash)));
        }

        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].kind, SignalKind::Trigger);
        assert_eq!(signals[0].machine_id, "m1");
        assert_eq!(signals[0].height, 15);
        assert_eq!(signals[0].state, State::On);
    }

    #[test]
    fn test_duplicate_block_stops_pipeline() {
        let mut cfg = AppConfig::default();
        cfg.machines = vec![machine_cfg("m1", 1)];
        let (mut runner, _handle, _shutdown_tx) = test_runner(cfg);

        // OFF block opens the gate once; the replay must not reach the
        // machines and reopen/advance anything.
        assert!(runner.intake(10, block(10, "0099")).is_empty());
        assert!(!runner.machines.get("m1").unwrap().waiting_reverse());

        assert!(runner.intake(10, block(10, "0099")).is_empty());
        assert_eq!(runner.ring.len(), 1);

        // a fresh ON now triggers (count reached 1)
        let signals = runner.intake(11, block(11, "00a3"));
        assert_eq!(signals.len(), 1);
    }

    #[test]
    fn test_unclassifiable_block_is_discarded() {
        let mut cfg = AppConfig::default();
        cfg.machines = vec![machine_cfg("m1", 1)];
        let (mut runner, _handle, _shutdown_tx) = test_runner(cfg);

        assert!(runner.intake(10, block(10, "00zz")).is_empty());
        // gate untouched: the machines never saw the block
        assert!(runner.machines.get("m1").unwrap().waiting_reverse());
        // but it still occupies the dedup window
        assert_eq!(runner.ring.len(), 1);
    }

    #[test]
    fn test_rule_switch_clears_runtime_and_ring() {
        let mut cfg = AppConfig::default();
        let mut m = machine_cfg("m1", 3);
        m.hit_enabled = true;
        m.hit_offset = 5;
        cfg.machines = vec![m];
        let (mut runner, handle, _shutdown_tx) = test_runner(cfg);

        // gate open, trigger at h4 (arms HIT for h9), gate reopened,
        // count back to 1
        for (height, hash) in [
            (1u64, "0099"),
            (2, "00a3"),
            (3, "00b7"),
            (4, "00c2"),
            (5, "0099"),
            (6, "00d4"),
        ] {
            runner.intake(height, block(height, hash));
        }
        {
            let m = runner.machines.get("m1").unwrap();
            assert_eq!(m.count(), 1);
            assert!(m.hit_waiting());
        }
        assert!(!runner.ring.is_empty());

        handle.set_rule(Rule::BigSmall);
        let next = handle.current();
        runner.apply_config(&next, false);

        let m = runner.machines.get("m1").unwrap();
        assert_eq!(m.count(), 0);
        assert!(m.waiting_reverse());
        assert!(!m.hit_waiting());
        assert!(runner.ring.is_empty());
        assert_eq!(runner.rule, Rule::BigSmall);

        // the next block classifies under BIG_SMALL: trailing digit 9
        // is OFF, which opens the gate
        runner.intake(7, block(7, "0099"));
        assert!(!runner.machines.get("m1").unwrap().waiting_reverse());
    }

    #[test]
    fn test_signals_ordered_across_machines() {
        let mut cfg = AppConfig::default();
        cfg.machines = vec![machine_cfg("m2", 1), machine_cfg("m1", 1)];
        let (mut runner, _handle, _shutdown_tx) = test_runner(cfg);

        runner.intake(10, block(10, "0099"));
        let signals = runner.intake(11, block(11, "00a3"));
        let ids: Vec<&str> = signals.iter().map(|s| s.machine_id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2"]);
    }

    #[tokio::test]
    async fn test_failure_policy_stops_without_auto_restart() {
        let mut cfg = AppConfig::default();
        cfg.auto_restart = false;
        let (mut runner, _handle, _shutdown_tx) = test_runner(cfg.clone());
        runner.start_listening();

        for _ in 0..FAIL_THRESHOLD {
            runner.on_fetch_failure(&cfg, "all sources failed").await;
        }
        assert!(!runner.listening);
        assert_eq!(runner.failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_policy_waits_with_auto_restart() {
        let mut cfg = AppConfig::default();
        cfg.auto_restart = true;
        cfg.fail_wait_minutes = 1;
        let (mut runner, _handle, _shutdown_tx) = test_runner(cfg.clone());
        runner.start_listening();

        let started = tokio::time::Instant::now();
        for _ in 0..FAIL_THRESHOLD {
            runner.on_fetch_failure(&cfg, "all sources failed").await;
        }
        // the third failure slept for the configured wait
        assert!(started.elapsed() >= std::time::Duration::from_secs(60));
        assert!(runner.listening);
        assert_eq!(runner.failures, 0);
    }
}
