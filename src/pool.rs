//! Connection pool.
//!
//! A fixed-size set of live connections behind a semaphore. Checkout blocks
//! while the idle queue is empty; every caller returns its connection, and
//! a connection that errored at the connection layer (or was abandoned
//! mid-statement by a cancelled caller) is closed and replaced by a fresh
//! one from the pool's [`Wire`] before going back into rotation.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Mutex, Semaphore};

use crate::driver::PgConnection;
use crate::error::{Error, Result};
use crate::executor::{Executor, Param, ResultFormat, Tx, TxFn};
use crate::rows::Rows;
use crate::sql;
use crate::wire::Wire;

/// Successful statements at or above this take an INFO line instead of DEBUG.
const SLOW_THRESHOLD: Duration = Duration::from_secs(1);

struct PoolInner {
    wire: Wire,
    idle: Mutex<VecDeque<PgConnection>>,
    permits: Semaphore,
    started: AtomicBool,
    version: parking_lot::Mutex<Option<String>>,
}

impl PoolInner {
    /// Return a connection to rotation. A dirty connection gets a
    /// best-effort cancel, is closed, and a replacement is dialed.
    async fn checkin(&self, conn: PgConnection) {
        if conn.is_dirty() {
            let token = conn.cancel_token();
            if let Err(e) = token.cancel().await {
                tracing::debug!(error = %e, "cancel request failed");
            }
            let pid = conn.backend_pid();
            conn.terminate().await;
            match self.wire.connection().await {
                Ok(fresh) => {
                    tracing::debug!(old_pid = pid, new_pid = fresh.backend_pid(), "replaced broken connection");
                    self.idle.lock().await.push_back(fresh);
                }
                Err(e) => {
                    // The permit is still released below; the next checkout
                    // dials lazily.
                    tracing::warn!(error = %e, "could not replace broken connection");
                }
            }
        } else {
            self.idle.lock().await.push_back(conn);
        }
        self.permits.add_permits(1);
    }
}

/// A checked-out connection that returns itself to the pool on drop.
struct Checkout {
    conn: Option<PgConnection>,
    pool: Arc<PoolInner>,
}

impl Checkout {
    fn conn(&mut self) -> &mut PgConnection {
        self.conn.as_mut().expect("connection should always be present")
    }

    /// Force replacement on checkin even if the session looks in sync.
    fn discard(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            conn.mark_broken();
        }
    }
}

impl Drop for Checkout {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let pool = self.pool.clone();
            tokio::spawn(async move { pool.checkin(conn).await });
        }
    }
}

/// The connection pool. Cloning shares the same pool.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    pub fn new(wire: Wire) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                wire,
                idle: Mutex::new(VecDeque::new()),
                permits: Semaphore::new(0),
                started: AtomicBool::new(false),
                version: parking_lot::Mutex::new(None),
            }),
        }
    }

    async fn checkout(&self) -> Result<Checkout> {
        if !self.inner.started.load(Ordering::SeqCst) {
            return Err(Error::Connection("pool has not been started".to_string()));
        }
        let permit = self
            .inner
            .permits
            .acquire()
            .await
            .map_err(|_| Error::Connection("pool is closed".to_string()))?;
        permit.forget();

        let existing = self.inner.idle.lock().await.pop_front();
        let conn = match existing {
            Some(conn) => conn,
            None => match self.inner.wire.connection().await {
                Ok(conn) => conn,
                Err(e) => {
                    self.inner.permits.add_permits(1);
                    return Err(e);
                }
            },
        };
        Ok(Checkout {
            conn: Some(conn),
            pool: self.inner.clone(),
        })
    }
}

fn log_statement(sql: &str, elapsed: Duration, result: &Result<Rows>) {
    match result {
        Ok(rows) => {
            if elapsed >= SLOW_THRESHOLD {
                tracing::info!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    rows = rows.len(),
                    sql = %sql,
                    "statement completed"
                );
            } else {
                tracing::debug!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    rows = rows.len(),
                    sql = %sql,
                    "statement completed"
                );
            }
        }
        Err(e) => {
            tracing::error!(sql = %sql, error = %e, "statement failed");
        }
    }
}

#[async_trait]
impl Executor for Pool {
    async fn version(&self) -> Result<String> {
        if let Some(version) = self.inner.version.lock().clone() {
            return Ok(version);
        }
        let mut checked = self.checkout().await?;
        let version = checked.conn().server_version().to_string();
        if version.is_empty() {
            return Err(Error::Connection(
                "server did not advertise a version".to_string(),
            ));
        }
        *self.inner.version.lock() = Some(version.clone());
        Ok(version)
    }

    async fn exec(&self, sql: &str, params: &[Param], format: ResultFormat) -> Result<Rows> {
        let sql = sql::canonicalize(sql);
        let mut checked = self.checkout().await?;
        let clock = Instant::now();
        let result = checked.conn().query(&sql, params, format).await;
        log_statement(&sql, clock.elapsed(), &result);
        result
    }

    async fn transaction(&self, f: TxFn) -> Result<()> {
        let mut checked = self.checkout().await?;
        checked.conn().batch("START TRANSACTION").await?;

        let session = Arc::new(TxSession {
            checked: Mutex::new(checked),
        });
        let tx = Tx::new(session.clone() as Arc<dyn Executor>);
        let outcome = f(tx).await;

        let mut guard = session.checked.lock().await;
        match outcome {
            Ok(()) => {
                guard.conn().batch("COMMIT").await?;
                Ok(())
            }
            Err(e) => {
                if guard.conn().is_dirty() {
                    // A statement was abandoned mid-flight (e.g. a timed-out
                    // call); the server rolls back when the connection is
                    // replaced.
                    tracing::warn!("transaction connection out of sync; discarding without rollback");
                } else if let Err(rollback_err) = guard.conn().batch("ROLLBACK").await {
                    tracing::warn!(error = %rollback_err, "rollback failed; discarding connection");
                    guard.discard();
                }
                Err(e)
            }
        }
    }

    async fn start(&self, n: usize) -> Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(Error::Config("pool already started".to_string()));
        }
        let mut opened = Vec::with_capacity(n);
        for _ in 0..n {
            match self.inner.wire.connection().await {
                Ok(conn) => opened.push(conn),
                Err(e) => {
                    self.inner.started.store(false, Ordering::SeqCst);
                    for conn in opened {
                        conn.terminate().await;
                    }
                    return Err(e);
                }
            }
        }
        self.inner.idle.lock().await.extend(opened);
        self.inner.permits.add_permits(n);
        tracing::debug!(connections = n, "pool started");
        Ok(())
    }

    async fn dump(&self) -> Result<String> {
        let version = self
            .inner
            .version
            .lock()
            .clone()
            .unwrap_or_else(|| "unknown".to_string());
        let idle = self.inner.idle.lock().await;
        let mut out = format!(
            "pool: server version {version}, {} idle connection(s)\n",
            idle.len()
        );
        for conn in idle.iter() {
            out.push_str(&format!("  connection pid={}\n", conn.backend_pid()));
        }
        Ok(out)
    }
}

/// Executor bound to one transaction's connection. Statements execute in
/// program order through the connection mutex.
struct TxSession {
    checked: Mutex<Checkout>,
}

#[async_trait]
impl Executor for TxSession {
    async fn version(&self) -> Result<String> {
        let mut guard = self.checked.lock().await;
        Ok(guard.conn().server_version().to_string())
    }

    async fn exec(&self, sql: &str, params: &[Param], format: ResultFormat) -> Result<Rows> {
        let sql = sql::canonicalize(sql);
        let mut guard = self.checked.lock().await;
        let clock = Instant::now();
        let result = guard.conn().query(&sql, params, format).await;
        log_statement(&sql, clock.elapsed(), &result);
        result
    }

    async fn transaction(&self, _f: TxFn) -> Result<()> {
        Err(Error::Config(
            "transactions cannot be nested on a transaction handle".to_string(),
        ))
    }

    async fn start(&self, _n: usize) -> Result<()> {
        Err(Error::Config(
            "a transaction handle cannot start the pool".to_string(),
        ))
    }

    async fn dump(&self) -> Result<String> {
        let mut guard = self.checked.lock().await;
        Ok(format!(
            "transaction on connection pid={}\n",
            guard.conn().backend_pid()
        ))
    }
}
