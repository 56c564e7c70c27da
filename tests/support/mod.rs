//! Scripted in-process executor for exercising the decorator chain
//! without a PostgreSQL server.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use stratum::{Error, Executor, Param, Result, ResultFormat, Rows, Tx, TxFn};

/// Install the log subscriber for a test binary. Honors `RUST_LOG`;
/// repeated calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One scripted response. When the script is empty the mock answers with a
/// fresh empty result set.
pub enum Script {
    Rows {
        names: Vec<String>,
        rows: Vec<Vec<Option<String>>>,
    },
    ConnectionError(String),
    QueryError(String),
}

struct MockInner {
    calls: AtomicUsize,
    starts: AtomicUsize,
    log: Mutex<Vec<String>>,
    script: Mutex<VecDeque<Script>>,
    delay: Mutex<Option<Duration>>,
}

/// Cloneable handle; clones share the same state.
#[derive(Clone)]
pub struct MockExecutor {
    inner: Arc<MockInner>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MockInner {
                calls: AtomicUsize::new(0),
                starts: AtomicUsize::new(0),
                log: Mutex::new(Vec::new()),
                script: Mutex::new(VecDeque::new()),
                delay: Mutex::new(None),
            }),
        }
    }

    /// Queue a result: `names` are the columns, each row a list of values.
    pub fn push_rows(&self, names: &[&str], rows: &[&[&str]]) {
        self.inner.script.lock().push_back(Script::Rows {
            names: names.iter().map(|n| n.to_string()).collect(),
            rows: rows
                .iter()
                .map(|row| row.iter().map(|v| Some(v.to_string())).collect())
                .collect(),
        });
    }

    pub fn push_connection_error(&self, message: &str) {
        self.inner
            .script
            .lock()
            .push_back(Script::ConnectionError(message.to_string()));
    }

    pub fn push_query_error(&self, message: &str) {
        self.inner
            .script
            .lock()
            .push_back(Script::QueryError(message.to_string()));
    }

    /// Make every subsequent statement take this long.
    pub fn set_delay(&self, delay: Duration) {
        *self.inner.delay.lock() = Some(delay);
    }

    /// How many statements reached this executor.
    pub fn calls(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> usize {
        self.inner.starts.load(Ordering::SeqCst)
    }

    /// Every statement seen, in order, plus transaction markers.
    pub fn log(&self) -> Vec<String> {
        self.inner.log.lock().clone()
    }
}

#[async_trait]
impl Executor for MockExecutor {
    async fn version(&self) -> Result<String> {
        Ok("16.2".to_string())
    }

    async fn exec(&self, sql: &str, _params: &[Param], _format: ResultFormat) -> Result<Rows> {
        self.inner.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.log.lock().push(sql.to_string());
        let delay = *self.inner.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.inner.script.lock().pop_front();
        match next {
            None => Ok(Rows::from_raw(Vec::new(), Vec::new())),
            Some(Script::Rows { names, rows }) => Ok(Rows::from_raw(
                names,
                rows.into_iter()
                    .map(|row| {
                        row.into_iter()
                            .map(|v| v.map(String::into_bytes))
                            .collect()
                    })
                    .collect(),
            )),
            Some(Script::ConnectionError(message)) => Err(Error::Connection(message)),
            Some(Script::QueryError(message)) => Err(Error::Query {
                message,
                sql: sql.to_string(),
            }),
        }
    }

    async fn transaction(&self, f: TxFn) -> Result<()> {
        self.inner.log.lock().push("START TRANSACTION".to_string());
        let tx = Tx::new(Arc::new(self.clone()));
        match f(tx).await {
            Ok(()) => {
                self.inner.log.lock().push("COMMIT".to_string());
                Ok(())
            }
            Err(e) => {
                self.inner.log.lock().push("ROLLBACK".to_string());
                Err(e)
            }
        }
    }

    async fn start(&self, _n: usize) -> Result<()> {
        self.inner.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn dump(&self) -> Result<String> {
        Ok("mock executor\n".to_string())
    }
}
