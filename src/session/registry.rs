//! Active session tracking
//!
//! Tracks live sessions per user and provides kick-off capability.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::hooks::UserId;

/// Unique session identifier
pub type SessionId = u64;

#[derive(Debug, Clone)]
struct SessionInfo {
    user_id: UserId,
    #[allow(dead_code)]
    peer_addr: String,
    #[allow(dead_code)]
    opened_at: Instant,
}

/// Live session handle with cancellation support
#[derive(Debug)]
struct ActiveSession {
    info: SessionInfo,
    cancel_token: CancellationToken,
}

/// Registry of live sessions with kick-off capability
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    next_session_id: Arc<AtomicU64>,
    sessions: Arc<DashMap<SessionId, ActiveSession>>,
    /// Map from user_id to its session ids, for kick-by-user
    user_sessions: Arc<DashMap<UserId, Vec<SessionId>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            next_session_id: Arc::new(AtomicU64::new(1)),
            sessions: Arc::new(DashMap::new()),
            user_sessions: Arc::new(DashMap::new()),
        }
    }

    /// Register a session and return its ID and cancellation token
    pub fn register(&self, user_id: UserId, peer_addr: String) -> (SessionId, CancellationToken) {
        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let cancel_token = CancellationToken::new();

        let session = ActiveSession {
            info: SessionInfo {
                user_id,
                peer_addr,
                opened_at: Instant::now(),
            },
            cancel_token: cancel_token.clone(),
        };

        self.sessions.insert(session_id, session);
        self.user_sessions
            .entry(user_id)
            .or_default()
            .push(session_id);

        (session_id, cancel_token)
    }

    /// Unregister a session
    pub fn unregister(&self, session_id: SessionId) {
        if let Some((_, session)) = self.sessions.remove(&session_id) {
            let user_id = session.info.user_id;
            // Atomically remove session_id from the Vec and delete the entry
            // if empty. remove_if_mut holds the shard lock for the entire
            // check, so a concurrent register() cannot insert into the Vec
            // between the retain and the removal.
            self.user_sessions.remove_if_mut(&user_id, |_, ids| {
                ids.retain(|&id| id != session_id);
                ids.is_empty()
            });
        }
    }

    /// Cancel all sessions of a user, returning how many were signalled
    pub fn kick_user(&self, user_id: UserId) -> usize {
        let mut kicked = 0;
        if let Some(ids) = self.user_sessions.get(&user_id) {
            for &session_id in ids.iter() {
                if let Some(session) = self.sessions.get(&session_id) {
                    session.cancel_token.cancel();
                    kicked += 1;
                }
            }
        }
        kicked
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn user_count(&self) -> usize {
        self.user_sessions.len()
    }
}
