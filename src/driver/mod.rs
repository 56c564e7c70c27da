//! The raw connection layer: TCP sessions and cancellation.

mod cancel;
mod connection;

pub use cancel::CancelToken;
pub use connection::PgConnection;
