//! Race-to-first fan-out across enabled sources.
//!
//! Every enabled adapter is polled concurrently; the first valid
//! block wins and the remaining tasks are aborted so losers observe
//! cancellation at their next await point and abandon their I/O.

use super::stats::SourceStats;
use super::{Fetch, SourceError};
use crate::block::Block;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum DispatchError {
    /// No adapter was enabled when the race started.
    #[error("no enabled sources")]
    NoSources,
    /// Every adapter failed or yielded nothing usable; carries the
    /// last non-disabled error seen.
    #[error("all sources failed: {0}")]
    AllSourcesFailed(SourceError),
}

/// Holds the current adapter set and races it on demand. The set is
/// only ever mutated wholesale, so `fetch_any` works on an immutable
/// snapshot.
pub struct Dispatcher<F> {
    fetchers: RwLock<Arc<Vec<Arc<F>>>>,
    stats: SourceStats,
}

impl<F: Fetch> Dispatcher<F> {
    pub fn new() -> Self {
        Self {
            fetchers: RwLock::new(Arc::new(Vec::new())),
            stats: SourceStats::new(),
        }
    }

    /// Swap in a rebuilt adapter set. In-flight races keep their old
    /// snapshot.
    pub fn replace_all(&self, list: Vec<Arc<F>>) {
        let snapshot = Arc::new(list);
        match self.fetchers.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
    }

    fn snapshot(&self) -> Arc<Vec<Arc<F>>> {
        match self.fetchers.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn stats(&self) -> &SourceStats {
        &self.stats
    }

    /// Poll all enabled adapters concurrently and return the first
    /// valid block. Ties break strictly on arrival; losing results
    /// are discarded even when valid. Cancelling the returned future
    /// (tick deadline, shutdown) aborts every in-flight task.
    pub async fn fetch_any(&self) -> Result<Block, DispatchError> {
        let fetchers = self.snapshot();

        let mut set = JoinSet::new();
        for fetcher in fetchers.iter() {
            if !fetcher.enabled() {
                continue;
            }
            let fetcher = Arc::clone(fetcher);
            set.spawn(async move {
                let started = Instant::now();
                let result = fetcher.fetch_latest().await;
                (fetcher, result, started.elapsed())
            });
        }
        if set.is_empty() {
            return Err(DispatchError::NoSources);
        }

        let mut last_err: Option<SourceError> = None;
        while let Some(joined) = set.join_next().await {
            let (fetcher, result, cost) = match joined {
                Ok(r) => r,
                // an aborted loser; nothing to record
                Err(_) => continue,
            };
            let cost_ms = cost.as_millis() as u64;

            match result {
                Ok(block) if block.is_valid() => {
                    self.stats.record_ok(fetcher.id(), cost);
                    info!(
                        id = fetcher.id(),
                        r#type = fetcher.dialect_tag(),
                        height = %block.height,
                        cost_ms,
                        "SOURCE_OK"
                    );
                    set.abort_all();
                    return Ok(block);
                }
                Ok(_) => {
                    self.stats.record_err(fetcher.id(), cost);
                    warn!(
                        id = fetcher.id(),
                        r#type = fetcher.dialect_tag(),
                        err = "invalid block",
                        cost_ms,
                        "SOURCE_ERR"
                    );
                    last_err = Some(SourceError::InvalidBlock("missing height or hash"));
                }
                Err(SourceError::Disabled) => {
                    debug!(id = fetcher.id(), "source disabled mid-race");
                }
                Err(SourceError::RateLimited) => {
                    debug!(id = fetcher.id(), "RATE_LIMITED");
                    last_err = Some(SourceError::RateLimited);
                }
                Err(err) => {
                    self.stats.record_err(fetcher.id(), cost);
                    warn!(
                        id = fetcher.id(),
                        r#type = fetcher.dialect_tag(),
                        err = %err,
                        cost_ms,
                        "SOURCE_ERR"
                    );
                    last_err = Some(err);
                }
            }
        }

        Err(DispatchError::AllSourcesFailed(
            last_err.unwrap_or(SourceError::InvalidBlock("no usable result")),
        ))
    }
}

impl<F: Fetch> Default for Dispatcher<F> {
    fn default() -> Self {
        Self::new()
    }
}
