//! Session orchestration
//!
//! The engine drives one authenticated session end to end: handshake under
//! its own deadline, link setup, dispatcher hand-off, two relay phases
//! under a shared idle supervisor, orderly drain. The two phases run as
//! structured concurrency inside the session task; nothing outlives it
//! except the dispatcher, which is cancelled on teardown.

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::auth::TimedAuthenticator;
use crate::config::EngineConfig;
use crate::error::{RelayError, Result, SessionError, TimeoutKind};
use crate::hooks::{Dispatcher, LinkPair, LogSink, UnauthorizedSink};
use crate::logger::log;
use crate::protocol::{read_request, ResponseHeader};
use crate::relay::{
    copy_chunked_stream_to_link, copy_link_to_chunked_stream, copy_link_to_stream,
    copy_stream_to_link, link, splice_raw_buffer, take_raw_buffered, RawBufferSource,
};

use super::registry::SessionRegistry;
use super::timer::ActivityTimer;

/// Lifecycle of one session, used for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Handshaking,
    Authenticated,
    Relaying,
    Draining,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Handshaking => "handshaking",
            SessionState::Authenticated => "authenticated",
            SessionState::Relaying => "relaying",
            SessionState::Draining => "draining",
            SessionState::Closed => "closed",
        }
    }
}

/// Session engine: authentication, codec and relay plumbing around an
/// injected dispatcher
pub struct Engine {
    pub authenticator: Arc<TimedAuthenticator>,
    pub dispatcher: Arc<dyn Dispatcher>,
    /// Observer for rejected handshakes
    pub unauthorized: Arc<dyn UnauthorizedSink>,
    pub registry: SessionRegistry,
    pub config: EngineConfig,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Drive one accepted connection to completion
    pub async fn handle<S>(&self, stream: S, peer: String) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + RawBufferSource + Unpin,
    {
        run_session(self, stream, peer).await
    }
}

/// Builder for constructing an Engine
pub struct EngineBuilder {
    authenticator: Option<Arc<TimedAuthenticator>>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    unauthorized: Option<Arc<dyn UnauthorizedSink>>,
    registry: Option<SessionRegistry>,
    config: Option<EngineConfig>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            authenticator: None,
            dispatcher: None,
            unauthorized: None,
            registry: None,
            config: None,
        }
    }

    pub fn authenticator(mut self, authenticator: Arc<TimedAuthenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn unauthorized(mut self, sink: Arc<dyn UnauthorizedSink>) -> Self {
        self.unauthorized = Some(sink);
        self
    }

    pub fn registry(mut self, registry: SessionRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Build the engine
    ///
    /// Panics if authenticator or dispatcher is not set
    pub fn build(self) -> Engine {
        Engine {
            authenticator: self.authenticator.expect("authenticator is required"),
            dispatcher: self.dispatcher.expect("dispatcher is required"),
            unauthorized: self.unauthorized.unwrap_or_else(|| Arc::new(LogSink)),
            registry: self.registry.unwrap_or_default(),
            config: self.config.unwrap_or_default(),
        }
    }
}

/// Run one session over an accepted stream.
///
/// Returns Ok for orderly closes, including closes forced by the idle
/// supervisor; a kick through the registry surfaces as an interrupted
/// relay.
pub async fn run_session<S>(engine: &Engine, mut stream: S, peer: String) -> Result<()>
where
    S: AsyncRead + AsyncWrite + RawBufferSource + Unpin,
{
    let policy = &engine.config.timeouts;
    let relay_cfg = &engine.config.relay;
    log::session(&peer, SessionState::Handshaking.as_str());

    let mut head = BytesMut::with_capacity(1024);
    let header = match tokio::time::timeout(
        policy.handshake(),
        read_request(
            &mut stream,
            &mut head,
            &engine.authenticator,
            true,
            relay_cfg.max_header_size,
        ),
    )
    .await
    {
        Err(_) => {
            engine.unauthorized.record(&peer, "handshake timeout");
            return Err(SessionError::Timeout(TimeoutKind::Handshake));
        }
        Ok(Err(e)) => {
            engine.unauthorized.record(&peer, &e.to_string());
            return Err(e.into());
        }
        Ok(Ok(header)) => header,
    };

    log::authentication(&peer, true);
    log::session(&peer, SessionState::Authenticated.as_str());

    let (session_id, cancel) = engine
        .registry
        .register(header.account.user_id, peer.clone());
    let registry = engine.registry.clone();
    let _unregister = scopeguard::guard(session_id, move |id| registry.unregister(id));

    let chunked = header.options.chunk_stream
        || header.command.transfer_kind() == crate::protocol::TransferKind::Datagram;

    let (up_reader, up_writer) = link(relay_cfg.link_capacity);
    let (mut down_reader, down_writer) = link(relay_cfg.link_capacity);

    // Bytes that arrived ahead of the relay loops: the payload trailing
    // the header, then any raw backlog the transport still holds. The
    // backlog bypasses the body codec, so it is collected only for
    // unframed sessions whose flow asked for it. Collection is
    // non-blocking here; the link writes happen inside the request phase,
    // after the dispatcher and the idle supervisor are running, so a
    // backlog wider than the link capacity cannot stall an unsupervised
    // session.
    let splice = !chunked && header.flow.as_deref() == Some(crate::protocol::FLOW_RAW_SPLICE);
    let mut uplink_backlog: Vec<Bytes> = Vec::new();
    if !chunked && !head.is_empty() {
        uplink_backlog.push(head.split().freeze());
    }
    if splice {
        uplink_backlog.extend(take_raw_buffered(&mut stream));
    }

    // Cancellation fans out to the links so the dispatcher's blocked link
    // operations return as well
    let watcher = tokio::spawn({
        let cancel = cancel.clone();
        let up_int = up_writer.interrupter();
        let down_int = down_reader.interrupter();
        async move {
            cancel.cancelled().await;
            up_int.interrupt();
            down_int.interrupt();
        }
    });

    let timed_out: Arc<Mutex<Option<TimeoutKind>>> = Arc::new(Mutex::new(None));
    let phase_kind = Arc::new(Mutex::new(TimeoutKind::ConnectionIdle));
    let timer = {
        let timed_out = Arc::clone(&timed_out);
        let phase_kind = Arc::clone(&phase_kind);
        let cancel = cancel.clone();
        ActivityTimer::new(policy.connection_idle(), move || {
            *timed_out.lock() = Some(*phase_kind.lock());
            cancel.cancel();
        })
    };

    let dispatch = tokio::spawn({
        let dispatcher = Arc::clone(&engine.dispatcher);
        let destination = header.destination.clone();
        let transfer = header.command.transfer_kind();
        let pair = LinkPair {
            uplink: up_reader,
            downlink: down_writer,
        };
        async move { dispatcher.handle_flow(destination, transfer, pair).await }
    });

    log::session(&peer, SessionState::Relaying.as_str());

    let (read_half, mut write_half) = tokio::io::split(stream);
    // Framed sessions parse the trailing handshake bytes as body frames
    let seed = if chunked { head.freeze() } else { Bytes::new() };
    let mut client_read = std::io::Cursor::new(seed).chain(read_half);

    let request_done = AtomicBool::new(false);
    let response_done = AtomicBool::new(false);

    let request_phase = async {
        let result = tokio::select! {
            r = async {
                // Seed first so backlog bytes keep their place ahead of
                // anything read off the stream
                let mut total =
                    splice_raw_buffer(uplink_backlog, &up_writer, timer.activity_hook())
                        .await?;
                if chunked {
                    total += copy_chunked_stream_to_link(
                        &mut client_read,
                        &up_writer,
                        relay_cfg.buffer_size,
                        timer.activity_hook(),
                    )
                    .await?;
                } else {
                    total += copy_stream_to_link(
                        &mut client_read,
                        &up_writer,
                        relay_cfg.buffer_size,
                        timer.activity_hook(),
                    )
                    .await?;
                }
                Ok::<u64, SessionError>(total)
            } => r,
            _ = cancel.cancelled() => Err(SessionError::Relay(RelayError::Interrupted)),
        };
        request_done.store(true, Ordering::SeqCst);
        if result.is_ok() && !response_done.load(Ordering::SeqCst) {
            // Only the downlink remains; shrink the idle allowance
            *phase_kind.lock() = TimeoutKind::DownlinkOnly;
            timer.set_timeout(policy.downlink_only());
        }
        result
    };

    let response_phase = async {
        let result: std::result::Result<u64, SessionError> = async {
            let mut out = BytesMut::new();
            ResponseHeader {
                options: header.options,
                command: None,
            }
            .encode(&mut out);
            write_half.write_all(&out).await?;

            tokio::select! {
                r = async {
                    if chunked {
                        copy_link_to_chunked_stream(
                            &mut down_reader,
                            &mut write_half,
                            timer.activity_hook(),
                        )
                        .await
                    } else {
                        copy_link_to_stream(
                            &mut down_reader,
                            &mut write_half,
                            timer.activity_hook(),
                        )
                        .await
                    }
                } => r,
                _ = cancel.cancelled() => Err(SessionError::Relay(RelayError::Interrupted)),
            }
        }
        .await;
        response_done.store(true, Ordering::SeqCst);
        if result.is_ok() {
            if !request_done.load(Ordering::SeqCst) {
                *phase_kind.lock() = TimeoutKind::UplinkOnly;
                timer.set_timeout(policy.uplink_only());
            }
            let _ = write_half.shutdown().await;
        }
        result
    };

    let relay_result = tokio::try_join!(request_phase, response_phase);

    let outcome = match relay_result {
        Ok((uplink_bytes, downlink_bytes)) => {
            timer.cancel();
            log::session(&peer, SessionState::Draining.as_str());
            match dispatch.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(SessionError::Dispatch(e)),
                Err(e) => return Err(SessionError::Dispatch(anyhow::Error::new(e))),
            }
            log::info!(
                peer = %peer,
                uplink_bytes,
                downlink_bytes,
                "Session finished"
            );
            cancel.cancel();
            Ok(())
        }
        Err(e) => {
            timer.cancel();
            cancel.cancel();
            dispatch.abort();
            let idle = *timed_out.lock();
            match (e, idle) {
                (SessionError::Relay(RelayError::Interrupted), Some(kind)) => {
                    // The supervisor fired with no directional error in
                    // flight; this is a clean close
                    log::debug!(peer = %peer, timeout = %kind, "Session closed by idle supervisor");
                    Ok(())
                }
                (e, _) => Err(e),
            }
        }
    };

    let _ = watcher.await;
    log::session(&peer, SessionState::Closed.as_str());
    outcome
}
