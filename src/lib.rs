//! # stratum
//!
//! A layered PostgreSQL client. At the bottom sits a [`Pool`] of raw
//! connections dialed through a [`Wire`]; on top of it any stack of query
//! decorators, all speaking the same [`Executor`] contract:
//!
//! - [`Spy`] reports `(sql, elapsed)` for every executed statement,
//! - [`Impatient`] cancels statements that overrun a deadline,
//! - [`Retry`] re-runs failing `SELECT`s,
//! - [`Stash`] caches read results and invalidates them on table writes.
//!
//! Because transaction handles implement the same contract, every layer
//! keeps applying to statements inside a transaction.
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use stratum::{Executor, Impatient, Pool, Retry, Spy, Stash, Wire};
//!
//! let pool = Arc::new(Pool::new(Wire::env_url("DATABASE_URL")));
//! let stash = Arc::new(Stash::with_defaults(pool));
//! let impatient = Arc::new(Impatient::new(stash, Duration::from_secs(5)));
//! let retry = Arc::new(Retry::new(impatient));
//! let db: Arc<dyn Executor> = Arc::new(Spy::new(retry, |sql, elapsed| {
//!     tracing::trace!(%sql, ?elapsed, "observed");
//! }));
//!
//! db.start(8).await?;
//! let rows = db.query("SELECT id, title FROM book WHERE author = $1", &["le guin".into()]).await?;
//! ```

pub mod driver;
mod error;
mod executor;
mod impatient;
mod pool;
mod protocol;
mod retry;
mod rows;
pub mod sql;
mod spy;
mod stash;
mod wire;

pub use error::{Error, Result};
pub use executor::{BoxFuture, Executor, Param, ResultFormat, Tx, TxFn};
pub use impatient::Impatient;
pub use pool::Pool;
pub use retry::{Retry, DEFAULT_ATTEMPTS};
pub use rows::{Row, Rows};
pub use spy::{Observer, Spy};
pub use stash::{Stash, StashConfig};
pub use wire::{render_config_yaml, ConnectSpec, Wire};
