//! Session engine for a multi-protocol tunnel server.
//!
//! The crate covers the layer between an accepted transport stream and the
//! business logic that routes flows: time-windowed replay-resistant
//! authentication, the request/response header codec, bounded bidirectional
//! relay links, and per-session idle supervision. Transports, ciphers and
//! outbound routing are injected by the embedding server through the
//! [`hooks`] traits.
//!
//! A minimal embedding wires an [`session::Engine`] to an authenticator
//! and a dispatcher, then calls [`session::run_session`] (or
//! `Engine::handle`) once per accepted connection.

pub mod auth;
pub mod config;
pub mod error;
pub mod hooks;
pub mod logger;
pub mod protocol;
pub mod relay;
pub mod session;

pub use config::EngineConfig;
pub use error::{Result, SessionError};
pub use session::{run_session, Engine};
