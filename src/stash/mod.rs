//! Stash decorator: a table-invalidated result cache.
//!
//! Reads are cached by `(canonical_sql, params_key)` and indexed by every
//! table they scan; any write through the same decorator marks the entries
//! of its affected tables stale. A stale entry stops hitting — the next
//! read falls through to the database — but stays resident so the
//! background refill can re-execute it and clear the flag. A cache hit
//! returns the very same [`Rows`] handle the first miss produced.

mod state;
mod tasks;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::executor::{Executor, Param, ResultFormat, Tx, TxFn};
use crate::rows::Rows;
use crate::sql;
use state::{params_key, CacheState};

/// Cache tuning. `None` intervals disable the corresponding background
/// task entirely.
#[derive(Debug, Clone)]
pub struct StashConfig {
    /// Maximum retained entries across all queries.
    pub cap: usize,
    pub cap_interval: Option<Duration>,
    /// Entries idle longer than this are dropped.
    pub retire_after: Duration,
    pub retire_interval: Option<Duration>,
    pub refill_interval: Option<Duration>,
    /// How long after invalidation a stale entry becomes eligible for
    /// refill.
    pub refill_delay: Duration,
    /// Background workers shared by all three tasks.
    pub workers: usize,
    /// Bound on queued background jobs.
    pub queue: usize,
}

impl Default for StashConfig {
    fn default() -> Self {
        Self {
            cap: 10_000,
            cap_interval: Some(Duration::from_secs(60)),
            retire_after: Duration::from_secs(15 * 60),
            retire_interval: Some(Duration::from_secs(60)),
            refill_interval: Some(Duration::from_secs(16)),
            refill_delay: Duration::ZERO,
            workers: 4,
            queue: 128,
        }
    }
}

impl StashConfig {
    pub fn cap(mut self, cap: usize) -> Self {
        self.cap = cap;
        self
    }

    pub fn cap_interval(mut self, interval: Option<Duration>) -> Self {
        self.cap_interval = interval;
        self
    }

    pub fn retire_after(mut self, after: Duration) -> Self {
        self.retire_after = after;
        self
    }

    pub fn retire_interval(mut self, interval: Option<Duration>) -> Self {
        self.retire_interval = interval;
        self
    }

    pub fn refill_interval(mut self, interval: Option<Duration>) -> Self {
        self.refill_interval = interval;
        self
    }

    pub fn refill_delay(mut self, delay: Duration) -> Self {
        self.refill_delay = delay;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn queue(mut self, queue: usize) -> Self {
        self.queue = queue;
        self
    }
}

/// The cache decorator.
pub struct Stash {
    inner: Arc<dyn Executor>,
    state: Arc<CacheState>,
    config: StashConfig,
}

impl Stash {
    pub fn new(inner: Arc<dyn Executor>, config: StashConfig) -> Self {
        Self {
            inner,
            state: Arc::new(CacheState::new()),
            config,
        }
    }

    /// Cache decorator with default tuning.
    pub fn with_defaults(inner: Arc<dyn Executor>) -> Self {
        Self::new(inner, StashConfig::default())
    }

    /// Stop the background tasks. Timers halt immediately; queued jobs
    /// drain on the workers.
    pub fn shutdown(&self) {
        self.state.shutdown();
    }

    /// Total cached entries right now.
    pub fn cached_entries(&self) -> usize {
        self.state.entry_count()
    }
}

#[async_trait]
impl Executor for Stash {
    async fn version(&self) -> Result<String> {
        self.inner.version().await
    }

    async fn exec(&self, sql: &str, params: &[Param], format: ResultFormat) -> Result<Rows> {
        let sql = sql::canonicalize(sql);

        if sql::is_modifier(&sql) {
            let rows = self.inner.exec(&sql, params, format).await?;
            let affected = sql::affected_tables(&sql);
            if !affected.is_empty() {
                let marked = self.state.invalidate(&affected);
                if marked > 0 {
                    tracing::debug!(
                        tables = ?affected,
                        entries = marked,
                        "invalidated cached reads"
                    );
                }
            }
            return Ok(rows);
        }

        let key = params_key(params);
        if let Some(rows) = self.state.lookup(&sql, &key) {
            return Ok(rows);
        }

        let rows = self.inner.exec(&sql, params, format).await?;

        // Time-dependent results are served but never retained.
        if sql::mentions_now(&sql) {
            return Ok(rows);
        }
        let read_tables = sql::read_tables(&sql);
        if read_tables.is_empty() {
            return Err(Error::Cache(format!(
                "query reads no table and cannot be cached: {sql}"
            )));
        }
        self.state
            .insert(&sql, key, rows.clone(), params.to_vec(), format, &read_tables);
        Ok(rows)
    }

    async fn transaction(&self, f: TxFn) -> Result<()> {
        let state = self.state.clone();
        let config = self.config.clone();
        self.inner
            .transaction(Box::new(move |tx| {
                Box::pin(async move {
                    // Writes inside the transaction invalidate immediately;
                    // a rollback just costs extra misses afterwards.
                    let stashed = Tx::new(Arc::new(Stash {
                        inner: tx.into_executor(),
                        state,
                        config,
                    }));
                    f(stashed).await
                })
            }))
            .await
    }

    async fn start(&self, n: usize) -> Result<()> {
        self.inner.start(n).await?;
        if !self.state.mark_launched() {
            return Err(Error::Cache(
                "cannot launch multiple times on same cache data".to_string(),
            ));
        }
        tasks::launch(&self.config, &self.state, &self.inner);
        Ok(())
    }

    async fn dump(&self) -> Result<String> {
        let mut out = self.inner.dump().await?;
        let (entries, tables, hits, misses) = self.state.stats();
        out.push_str(&format!(
            "stash: {entries} entr{} over {tables} table(s), {hits} hit(s), {misses} miss(es)\n",
            if entries == 1 { "y" } else { "ies" }
        ));
        Ok(out)
    }
}
