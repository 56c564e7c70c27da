//! Spy decorator: observe every executed statement.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::Result;
use crate::executor::{Executor, Param, ResultFormat, Tx, TxFn};
use crate::rows::Rows;
use crate::sql;

/// Callback invoked with `(canonical_sql, elapsed)` after each successful
/// statement.
pub type Observer = Arc<dyn Fn(&str, Duration) + Send + Sync>;

/// Pass-through decorator that times every statement and reports it to an
/// observer. Failed statements are not reported. Statements inside a
/// transaction are observed too: the yielded handle is re-wrapped in a Spy
/// with the same observer.
pub struct Spy {
    inner: Arc<dyn Executor>,
    observer: Observer,
}

impl Spy {
    pub fn new<F>(inner: Arc<dyn Executor>, observer: F) -> Self
    where
        F: Fn(&str, Duration) + Send + Sync + 'static,
    {
        Self {
            inner,
            observer: Arc::new(observer),
        }
    }

    fn with_observer(inner: Arc<dyn Executor>, observer: Observer) -> Self {
        Self { inner, observer }
    }
}

#[async_trait]
impl Executor for Spy {
    async fn version(&self) -> Result<String> {
        self.inner.version().await
    }

    async fn exec(&self, sql: &str, params: &[Param], format: ResultFormat) -> Result<Rows> {
        let sql = sql::canonicalize(sql);
        let clock = Instant::now();
        let rows = self.inner.exec(&sql, params, format).await?;
        (self.observer)(&sql, clock.elapsed());
        Ok(rows)
    }

    async fn transaction(&self, f: TxFn) -> Result<()> {
        let observer = self.observer.clone();
        self.inner
            .transaction(Box::new(move |tx| {
                Box::pin(async move {
                    let spied = Tx::new(Arc::new(Spy::with_observer(tx.into_executor(), observer)));
                    f(spied).await
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
