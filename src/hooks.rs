//! Extension points
//!
//! The engine owns authentication, header parsing and relay plumbing; what
//! happens on the far side of a link is injected through these traits.

use async_trait::async_trait;

use crate::protocol::{Address, TransferKind};
use crate::relay::{LinkReader, LinkWriter};

/// User ID type used throughout the system.
/// Using i64 for consistency with database and API layer.
pub type UserId = i64;

/// The two halves of a session handed to a dispatcher: `uplink` carries
/// client bytes toward the destination, `downlink` carries destination
/// bytes back to the client.
pub struct LinkPair {
    pub uplink: LinkReader,
    pub downlink: LinkWriter,
}

/// Flow handler invoked once per authenticated session
///
/// Dropping either half ends that direction: dropping `downlink` is an
/// orderly end of the response stream, dropping `uplink` makes further
/// client writes fail.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn handle_flow(
        &self,
        destination: Address,
        transfer: TransferKind,
        link: LinkPair,
    ) -> anyhow::Result<()>;
}

/// Observer for connections that fail authentication or present a
/// malformed header before authenticating
pub trait UnauthorizedSink: Send + Sync {
    fn record(&self, peer: &str, reason: &str);
}

/// Default sink: structured warn-level log, nothing else
pub struct LogSink;

impl UnauthorizedSink for LogSink {
    fn record(&self, peer: &str, reason: &str) {
        crate::logger::log::authentication(peer, false);
        crate::logger::log::protocol("handshake rejected", Some(reason));
    }
}
