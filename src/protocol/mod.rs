//! PostgreSQL wire protocol: message framing and authentication.

mod message;
mod scram;

pub(crate) use message::{BackendMessage, ErrorFields, FrontendMessage};
pub(crate) use scram::{ScramExchange, MECHANISM as SCRAM_MECHANISM};
