//! Generation service invocation.
//!
//! - [`classify`] - vendor error wording -> [`ErrorKind`]
//! - [`budget`] - output token budgets
//! - [`client`] - the retry / rotation / escalation loop
//! - [`schema`] - output schemas from Rust types

pub mod budget;
pub mod classify;
pub mod client;
pub mod schema;

pub use budget::{escalate, initial_token_budget};
pub use classify::{classify_error, is_truncation_error, parse_retry_hint, strip_code_fences, ErrorKind};
pub use client::{GenerationClient, GenerationOutput};
pub use schema::response_schema;
