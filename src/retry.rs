//! Retry decorator: re-run failing reads.
//!
//! Only statements whose first token is `SELECT` are retried; anything
//! else reaches the inner executor exactly once. Retries are immediate
//! (no backoff) and the last error re-raises unchanged. Transactions pass
//! through untouched — statements inside one must never be silently
//! retried, since partial effects may already sit on the connection.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::executor::{Executor, Param, ResultFormat, TxFn};
use crate::rows::Rows;
use crate::sql;

/// Default number of attempts for read-only statements.
pub const DEFAULT_ATTEMPTS: u32 = 3;

pub struct Retry {
    inner: Arc<dyn Executor>,
    attempts: u32,
}

impl Retry {
    /// Retry decorator with the default attempt count.
    pub fn new(inner: Arc<dyn Executor>) -> Self {
        Self::with_attempts(inner, DEFAULT_ATTEMPTS)
    }

    /// Retry decorator making at most `attempts` total calls per read.
    pub fn with_attempts(inner: Arc<dyn Executor>, attempts: u32) -> Self {
        Self {
            inner,
            attempts: attempts.max(1),
        }
    }
}

#[async_trait]
impl Executor for Retry {
    async fn version(&self) -> Result<String> {
        self.inner.version().await
    }

    async fn exec(&self, sql: &str, params: &[Param], format: ResultFormat) -> Result<Rows> {
        let sql = sql::canonicalize(sql);
        if !sql::is_read_only(&sql) {
            return self.inner.exec(&sql, params, format).await;
        }
        let mut failures = 0;
        loop {
            match self.inner.exec(&sql, params, format).await {
                Ok(rows) => return Ok(rows),
                Err(e) => {
                    failures += 1;
                    if failures >= self.attempts {
                        return Err(e);
                    }
                    tracing::debug!(sql = %sql, attempt = failures + 1, error = %e, "retrying read");
                }
            }
        }
    }

    async fn transaction(&self, f: TxFn) -> Result<()> {
        self.inner.transaction(f).await
    }

    async fn start(&self, n: usize) -> Result<()> {
        self.inner.start(n).await
    }

    async fn dump(&self) -> Result<String> {
        self.inner.dump().await
    }
}
