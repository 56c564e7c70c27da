//! The uniform executor contract.
//!
//! [`Pool`](crate::Pool) and every decorator implement [`Executor`], so a
//! chain like `Spy(Retry(Impatient(Stash(Pool))))` is assembled by handing
//! each layer an `Arc<dyn Executor>` of the next one in. Transaction
//! handles implement the same contract, which is what lets cross-cutting
//! behavior (spying, deadlines, caching) keep applying to statements inside
//! a transaction.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::rows::Rows;

/// Boxed future used by transaction callbacks.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Callback run inside a transaction. It receives an owned [`Tx`] handle
/// bound to one connection; when it returns `Ok` the transaction commits,
/// on `Err` it rolls back and the error re-raises.
pub type TxFn = Box<dyn FnOnce(Tx) -> BoxFuture<'static, Result<()>> + Send>;

/// Requested encoding of result columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultFormat {
    /// Every column value is a UTF-8 string.
    Text,
    /// Every column value is the server's binary encoding.
    Binary,
}

impl ResultFormat {
    /// Wire format code (0 text, 1 binary).
    pub(crate) fn code(self) -> i16 {
        match self {
            ResultFormat::Text => 0,
            ResultFormat::Binary => 1,
        }
    }
}

impl Default for ResultFormat {
    fn default() -> Self {
        ResultFormat::Text
    }
}

/// A statement parameter: string, integer, float, or NULL.
///
/// Parameters travel to the server in text format; the server casts them
/// to the placeholder's inferred type.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Str(String),
    Int(i64),
    Float(f64),
    Null,
}

impl Param {
    /// Text-format wire bytes, `None` for NULL.
    pub(crate) fn to_wire(&self) -> Option<Vec<u8>> {
        match self {
            Param::Str(s) => Some(s.as_bytes().to_vec()),
            Param::Int(v) => Some(v.to_string().into_bytes()),
            Param::Float(v) => Some(v.to_string().into_bytes()),
            Param::Null => None,
        }
    }

    /// Tagged fragment for the cache key. The tag keeps `Str("1")`,
    /// `Int(1)` and NULL distinct.
    pub(crate) fn key_fragment(&self) -> String {
        match self {
            Param::Str(s) => format!("s:{s}"),
            Param::Int(v) => format!("i:{v}"),
            Param::Float(v) => format!("f:{v}"),
            Param::Null => "~".to_string(),
        }
    }
}

impl From<&str> for Param {
    fn from(s: &str) -> Self {
        Param::Str(s.to_string())
    }
}

impl From<String> for Param {
    fn from(s: String) -> Self {
        Param::Str(s)
    }
}

impl From<i64> for Param {
    fn from(v: i64) -> Self {
        Param::Int(v)
    }
}

impl From<i32> for Param {
    fn from(v: i32) -> Self {
        Param::Int(v as i64)
    }
}

impl From<f64> for Param {
    fn from(v: f64) -> Self {
        Param::Float(v)
    }
}

/// The contract implemented by the pool and every decorator.
#[async_trait]
pub trait Executor: Send + Sync {
    /// The server's advertised version, first whitespace token, memoized.
    async fn version(&self) -> Result<String>;

    /// Execute one parameterized statement and materialize all rows.
    ///
    /// `sql` is whitespace-canonicalized before execution; use
    /// [`crate::sql::canonicalize_fragments`] to build a statement from
    /// fragments first.
    async fn exec(&self, sql: &str, params: &[Param], format: ResultFormat) -> Result<Rows>;

    /// Run `f` inside a transaction on a single connection. Every statement
    /// issued through the yielded [`Tx`] passes back through this executor's
    /// decorator stack.
    async fn transaction(&self, f: TxFn) -> Result<()>;

    /// Open `n` connections. Only meaningful on the outermost pool-like
    /// component; decorators pass it through.
    async fn start(&self, n: usize) -> Result<()>;

    /// Human-readable multi-line snapshot.
    async fn dump(&self) -> Result<String>;
}

impl dyn Executor {
    /// `exec` with text-format results, the common case.
    pub async fn query(&self, sql: &str, params: &[Param]) -> Result<Rows> {
        self.exec(sql, params, ResultFormat::Text).await
    }

    /// Transaction variant that carries a value out of the callback.
    pub async fn transaction_returning<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Tx) -> BoxFuture<'static, Result<T>> + Send + 'static,
    {
        let slot: Arc<Mutex<Option<T>>> = Arc::new(Mutex::new(None));
        let sink = slot.clone();
        self.transaction(Box::new(move |tx| {
            Box::pin(async move {
                let value = f(tx).await?;
                *sink.lock() = Some(value);
                Ok(())
            })
        }))
        .await?;
        let result = slot
            .lock()
            .take()
            .ok_or_else(|| Error::Connection("transaction callback produced no value".to_string()));
        result
    }
}

/// Handle yielded to a transaction callback.
///
/// Owns an executor bound to the transaction's connection; statements run in
/// program order. The handle is restricted to statement execution — nested
/// `transaction`/`start` are not available on it.
#[derive(Clone)]
pub struct Tx {
    inner: Arc<dyn Executor>,
}

impl Tx {
    pub fn new(inner: Arc<dyn Executor>) -> Self {
        Self { inner }
    }

    /// The executor behind this handle. Decorators use this to re-wrap the
    /// handle in their own layer.
    pub fn into_executor(self) -> Arc<dyn Executor> {
        self.inner
    }

    pub async fn exec(&self, sql: &str, params: &[Param], format: ResultFormat) -> Result<Rows> {
        self.inner.exec(sql, params, format).await
    }

    /// `exec` with text-format results.
    pub async fn query(&self, sql: &str, params: &[Param]) -> Result<Rows> {
        self.inner.exec(sql, params, ResultFormat::Text).await
    }

    pub async fn version(&self) -> Result<String> {
        self.inner.version().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_wire_encoding_is_text() {
        assert_eq!(Param::from("X").to_wire(), Some(b"X".to_vec()));
        assert_eq!(Param::from(42i64).to_wire(), Some(b"42".to_vec()));
        assert_eq!(Param::Null.to_wire(), None);
    }

    #[test]
    fn key_fragments_distinguish_types() {
        assert_ne!(Param::from("1").key_fragment(), Param::from(1i64).key_fragment());
        assert_ne!(Param::from("~").key_fragment(), Param::Null.key_fragment());
    }
}
