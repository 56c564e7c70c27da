//! Impatient decorator: per-statement deadlines.
//!
//! Statements that overrun the limit are abandoned — tokio drops the
//! in-flight future, the pool sends a CancelRequest for the orphaned
//! statement and replaces the connection — and the caller gets a
//! [`Error::TooSlow`]. Statements matching an exemption pattern run
//! untimed. Inside a transaction the limit is additionally enforced
//! server-side via `SET LOCAL statement_timeout`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;

use crate::error::{Error, Result};
use crate::executor::{Executor, Param, ResultFormat, Tx, TxFn};
use crate::rows::Rows;
use crate::sql;

pub struct Impatient {
    inner: Arc<dyn Executor>,
    limit: Duration,
    exempt: Arc<Vec<Regex>>,
}

impl Impatient {
    /// Deadline decorator with no exemptions.
    pub fn new(inner: Arc<dyn Executor>, limit: Duration) -> Self {
        Self {
            inner,
            limit,
            exempt: Arc::new(Vec::new()),
        }
    }

    /// Deadline decorator exempting statements that match any of the given
    /// patterns.
    pub fn with_exemptions(
        inner: Arc<dyn Executor>,
        limit: Duration,
        patterns: &[&str],
    ) -> Result<Self> {
        let mut exempt = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            exempt.push(
                Regex::new(pattern)
                    .map_err(|e| Error::Config(format!("bad exemption pattern {pattern:?}: {e}")))?,
            );
        }
        Ok(Self {
            inner,
            limit,
            exempt: Arc::new(exempt),
        })
    }

    fn from_parts(inner: Arc<dyn Executor>, limit: Duration, exempt: Arc<Vec<Regex>>) -> Self {
        Self {
            inner,
            limit,
            exempt,
        }
    }
}

#[async_trait]
impl Executor for Impatient {
    async fn version(&self) -> Result<String> {
        self.inner.version().await
    }

    async fn exec(&self, sql: &str, params: &[Param], format: ResultFormat) -> Result<Rows> {
        let sql = sql::canonicalize(sql);
        if self.exempt.iter().any(|re| re.is_match(&sql)) {
            return self.inner.exec(&sql, params, format).await;
        }
        let clock = Instant::now();
        match tokio::time::timeout(self.limit, self.inner.exec(&sql, params, format)).await {
            Ok(result) => result,
            // Our own deadline fired. A deadline imposed by an outer caller
            // cancels this whole future instead, so its error wins.
            Err(_) => Err(Error::TooSlow {
                elapsed: clock.elapsed(),
                params: params.len(),
            }),
        }
    }

    async fn transaction(&self, f: TxFn) -> Result<()> {
        let limit = self.limit;
        let exempt = self.exempt.clone();
        self.inner
            .transaction(Box::new(move |tx| {
                Box::pin(async move {
                    // Server-side enforcement for statements that ignore
                    // client-side cancellation.
                    let timeout_ms = limit.as_millis();
                    tx.query(&format!("SET LOCAL statement_timeout = {timeout_ms}"), &[])
                        .await?;
                    let wrapped = Tx::new(Arc::new(Impatient::from_parts(
                        tx.into_executor(),
                        limit,
                        exempt,
                    )));
                    f(wrapped).await
                })
            }))
            .await
    }

    async fn start(&self, n: usize) -> Result<()> {
        self.inner.start(n).await
    }

    async fn dump(&self) -> Result<String> {
        self.inner.dump().await
    }
}
