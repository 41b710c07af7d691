//! Session lifecycle
//!
//! - Idle supervision timer
//! - Live session registry with kick-off
//! - The engine orchestrating one session end to end

mod orchestrator;
mod registry;
mod timer;

pub use orchestrator::{run_session, Engine, EngineBuilder, SessionState};
pub use registry::{SessionId, SessionRegistry};
pub use timer::ActivityTimer;
