//! Timed, replay-resistant peer authentication
//!
//! - Accounts and credential derivation
//! - The sliding-window credential index with one-shot taint fuses

mod account;
mod timed;

pub use account::{credential_at, Account};
pub use timed::TimedAuthenticator;
