use std::io;
use thiserror::Error;

/// Authentication failures from the timed credential index
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    /// Presented hash matches no bucket in the current window
    #[error("credential not found")]
    NotFound,

    /// Bucket exists but its one-shot fuse was already set
    #[error("credential already used (replay)")]
    Tainted,
}

/// Protocol decode/encode failures
#[derive(Error, Debug)]
pub enum CodecError {
    /// Structurally invalid header
    #[error("malformed request: {0}")]
    Malformed(&'static str),

    /// Buffer does not yet hold a complete header; caller must read more
    #[error("need more data")]
    NeedMoreData,

    /// Credential lookup or burn failed
    #[error("authentication failed: {0}")]
    AuthenticationFailed(#[from] AuthError),

    /// Request declared a flow that does not match the account's flow
    #[error("flow mismatch")]
    FlowMismatch,

    /// Account mandates a flow but the request declared none
    #[error("flow required")]
    FlowRequired,

    /// Underlying transport error while reading the handshake
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Relay link failures
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayError {
    /// Write side already closed
    #[error("link closed")]
    Closed,

    /// Orderly end of stream
    #[error("end of stream")]
    Eof,

    /// Link abandoned by interrupt
    #[error("link interrupted")]
    Interrupted,
}

/// Which layered timeout fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Decode step exceeded the handshake allowance
    Handshake,
    /// Both directions live, no activity
    ConnectionIdle,
    /// Only uplink remained and went silent
    UplinkOnly,
    /// Only downlink remained and went silent
    DownlinkOnly,
}

impl std::fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutKind::Handshake => write!(f, "handshake"),
            TimeoutKind::ConnectionIdle => write!(f, "connection idle"),
            TimeoutKind::UplinkOnly => write!(f, "uplink only"),
            TimeoutKind::DownlinkOnly => write!(f, "downlink only"),
        }
    }
}

/// Session-level error surfaced to the caller of `run_session`
#[derive(Error, Debug)]
pub enum SessionError {
    /// Configuration could not be parsed
    #[error("invalid configuration: {0}")]
    Config(#[from] toml::de::Error),

    /// Handshake rejected before any relay was established
    #[error("rejected before relay: {0}")]
    Codec(#[from] CodecError),

    /// Relay ended with a directional error
    #[error("relay failure: {0}")]
    Relay(#[from] RelayError),

    /// Network-level failure after a successful handshake
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// A layered timeout fired
    #[error("{0} timeout")]
    Timeout(TimeoutKind),

    /// Dispatcher failed to route the decoded destination
    #[error("dispatch failed: {0}")]
    Dispatch(#[source] anyhow::Error),
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, SessionError>;
