//! Replay-resistant, time-windowed credential index
//!
//! For every active account the index holds one bucket per second in the
//! sliding window [now-W, now+W], keyed by the 16-byte credential hash for
//! that second. A background task extends coverage forward and evicts
//! entries that fell out of the window. Each bucket carries a one-shot
//! taint fuse: the first burn wins, replays of the same presented hash
//! fail even though the account stays valid for newer buckets.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::AuthConfig;
use crate::error::AuthError;
use crate::hooks::UserId;
use crate::logger::log;

use super::account::{credential_at, Account};

/// Current epoch second
pub(crate) fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs() as i64
}

/// One time-bucket entry in the credential index
struct BucketEntry {
    account: Arc<Account>,
    /// Epoch second this credential was derived for
    epoch_second: i64,
    /// One-shot fuse, set by the first successful burn
    taint: AtomicBool,
}

/// Per-account generation state
struct AccountSlot {
    account: Arc<Account>,
    /// Last epoch second buckets were generated for (inclusive)
    last_generated: i64,
}

/// All maps live behind one lock: readers (authenticate/burn) share it,
/// the periodic refresh takes it exclusively only for its own pass.
#[derive(Default)]
struct Index {
    accounts: HashMap<Uuid, AccountSlot>,
    buckets: HashMap<[u8; 16], BucketEntry>,
    /// AEAD-oriented secondary index, keyed by account not by time
    derived: HashMap<[u8; 16], Arc<Account>>,
}

/// Time-windowed authenticator with replay protection
pub struct TimedAuthenticator {
    index: RwLock<Index>,
    /// Window half-width W in seconds
    window: i64,
    refresh_interval: std::time::Duration,
    /// Forced AEAD mode: legacy alternate-id credentials stop resolving,
    /// only the primary id and the derived-key path authenticate
    forced_aead: bool,
    started: AtomicBool,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl TimedAuthenticator {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            index: RwLock::new(Index::default()),
            window: config.replay_window_secs as i64,
            refresh_interval: config.refresh_interval(),
            forced_aead: config.forced_aead,
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    /// Register an account and materialize its buckets for the current
    /// window. Duplicate identifiers are an operator error; the last add
    /// wins without raising one.
    pub fn add(&self, account: Account) -> Arc<Account> {
        let account = Arc::new(account);
        let now = now_secs();
        let mut index = self.index.write();

        index
            .derived
            .insert(account.derived_key(), Arc::clone(&account));

        let from = now - self.window;
        let to = now + self.window;
        generate_buckets(&mut index.buckets, &account, from, to, self.forced_aead);

        index.accounts.insert(
            account.id,
            AccountSlot {
                account: Arc::clone(&account),
                last_generated: to,
            },
        );
        account
    }

    /// Delete the account owning `id` and every bucket it produced.
    /// Returns whether an account was found.
    pub fn remove(&self, id: &Uuid) -> bool {
        let mut index = self.index.write();
        let Some(slot) = index.accounts.remove(id) else {
            return false;
        };
        let account_id = slot.account.id;
        index.derived.remove(&slot.account.derived_key());
        index
            .buckets
            .retain(|_, entry| entry.account.id != account_id);
        true
    }

    /// Delete all accounts belonging to an operator-level user id
    pub fn remove_by_user_id(&self, user_id: UserId) -> bool {
        let ids: Vec<Uuid> = {
            let index = self.index.read();
            index
                .accounts
                .values()
                .filter(|slot| slot.account.user_id == user_id)
                .map(|slot| slot.account.id)
                .collect()
        };
        let mut removed = false;
        for id in ids {
            removed |= self.remove(&id);
        }
        removed
    }

    /// Look up a presented hash. Does not set the taint fuse: callers that
    /// want single-use semantics call [`burn`](Self::burn) once the rest of
    /// the handshake validated, so a differently-malformed packet does not
    /// waste the single-use window.
    ///
    /// Returns the account and the epoch second the matched bucket encodes.
    pub fn authenticate(
        &self,
        presented: &[u8; 16],
    ) -> Result<(Arc<Account>, i64), AuthError> {
        let index = self.index.read();
        let entry = index.buckets.get(presented).ok_or(AuthError::NotFound)?;
        if entry.taint.load(Ordering::Acquire) {
            return Err(AuthError::Tainted);
        }
        Ok((Arc::clone(&entry.account), entry.epoch_second))
    }

    /// Set the taint fuse for a presented hash. Exactly one of any number
    /// of concurrent callers wins; the rest observe `Tainted`.
    pub fn burn(&self, presented: &[u8; 16]) -> Result<(), AuthError> {
        let index = self.index.read();
        let entry = index.buckets.get(presented).ok_or(AuthError::NotFound)?;
        // CAS independent of the surrounding read lock: concurrent burns
        // of the same hash race safely.
        entry
            .taint
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| AuthError::Tainted)
    }

    /// O(1) lookup by per-account derived key, for protocol variants that
    /// authenticate via a header-embedded encrypted identifier. No replay
    /// window on this path; nonce uniqueness is the caller's concern.
    pub fn match_by_derived_key(&self, key: &[u8; 16]) -> Option<Arc<Account>> {
        self.index.read().derived.get(key).cloned()
    }

    /// Spawn the periodic refresh task. Calling twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let this = Arc::clone(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.refresh_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        this.refresh(now_secs());
                    }
                    _ = cancel.cancelled() => {
                        log::debug!("Credential refresh task stopped");
                        return;
                    }
                }
            }
        });
    }

    /// Stop the refresh task. Calling twice is a no-op.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
    }

    /// Extend bucket coverage to `now + W` and evict entries older than
    /// `now - W`. Entries at exactly the window edges stay valid.
    pub(crate) fn refresh(&self, now: i64) {
        let window = self.window;
        let mut index = self.index.write();
        let Index {
            accounts, buckets, ..
        } = &mut *index;

        for slot in accounts.values_mut() {
            let from = (slot.last_generated + 1).max(now - window);
            let to = now + window;
            if from > to {
                continue;
            }
            generate_buckets(buckets, &slot.account, from, to, self.forced_aead);
            slot.last_generated = to;
        }

        let threshold = now - window;
        buckets.retain(|_, entry| entry.epoch_second >= threshold);
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.index.read().buckets.len()
    }
}

impl Drop for TimedAuthenticator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Walk every second in [from, to] for every identifier the account owns.
/// Cost is O(seconds * identifiers), independent of the account count.
/// Under forced AEAD only the primary identifier produces buckets.
fn generate_buckets(
    buckets: &mut HashMap<[u8; 16], BucketEntry>,
    account: &Arc<Account>,
    from: i64,
    to: i64,
    primary_only: bool,
) {
    for second in from..=to {
        let ids: Box<dyn Iterator<Item = &Uuid>> = if primary_only {
            Box::new(std::iter::once(&account.id))
        } else {
            Box::new(account.all_ids())
        };
        for id in ids {
            buckets.insert(
                credential_at(id, second),
                BucketEntry {
                    account: Arc::clone(account),
                    epoch_second: second,
                    taint: AtomicBool::new(false),
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SecurityType;

    const W: i64 = 120;

    fn authenticator() -> TimedAuthenticator {
        TimedAuthenticator::new(&AuthConfig::default())
    }

    fn account(user_id: UserId, alter_count: usize) -> Account {
        Account::new(
            user_id,
            Uuid::new_v4(),
            alter_count,
            SecurityType::Auto,
            None,
            vec![],
        )
    }

    #[test]
    fn test_authenticate_within_window() {
        let auth = authenticator();
        let account = auth.add(account(1, 0));

        let presented = credential_at(&account.id, now_secs() + 5);
        let (matched, epoch) = auth.authenticate(&presented).unwrap();
        assert_eq!(matched.id, account.id);
        assert!((epoch - now_secs() - 5).abs() <= 1);
    }

    #[test]
    fn test_replay_rejected_after_burn() {
        let auth = authenticator();
        let account = auth.add(account(1, 0));

        let presented = credential_at(&account.id, now_secs() + 5);
        auth.authenticate(&presented).unwrap();
        auth.burn(&presented).unwrap();

        // Second use of the identical presented hash is a replay
        assert_eq!(auth.authenticate(&presented), Err(AuthError::Tainted));
        assert_eq!(auth.burn(&presented), Err(AuthError::Tainted));

        // But fresh buckets of the same account stay valid
        let fresh = credential_at(&account.id, now_secs() + 6);
        assert!(auth.authenticate(&fresh).is_ok());
    }

    #[test]
    fn test_outside_window_not_found() {
        let auth = authenticator();
        let account = auth.add(account(1, 0));

        let stale = credential_at(&account.id, now_secs() - 200);
        assert_eq!(auth.authenticate(&stale), Err(AuthError::NotFound));

        let future = credential_at(&account.id, now_secs() + 200);
        assert_eq!(auth.authenticate(&future), Err(AuthError::NotFound));
    }

    #[test]
    fn test_window_boundaries_inclusive() {
        let auth = authenticator();
        let t0 = now_secs();
        let account = auth.add(account(1, 0));

        // Entries exist at exactly now-W and now+W
        assert!(auth.authenticate(&credential_at(&account.id, t0 - W)).is_ok());
        assert!(auth.authenticate(&credential_at(&account.id, t0 + W)).is_ok());
    }

    #[test]
    fn test_alternate_ids_authenticate() {
        let auth = authenticator();
        let account = auth.add(account(1, 3));

        for alter in &account.alter_ids {
            let presented = credential_at(alter, now_secs());
            let (matched, _) = auth.authenticate(&presented).unwrap();
            assert_eq!(matched.id, account.id);
        }
    }

    #[test]
    fn test_remove_invalidates_credentials() {
        let auth = authenticator();
        let account = auth.add(account(1, 1));
        let presented = credential_at(&account.id, now_secs());
        assert!(auth.authenticate(&presented).is_ok());

        assert!(auth.remove(&account.id));
        assert_eq!(auth.authenticate(&presented), Err(AuthError::NotFound));
        // Alternate identifiers are gone as well
        let alt = credential_at(&account.alter_ids[0], now_secs());
        assert_eq!(auth.authenticate(&alt), Err(AuthError::NotFound));
        // Second remove finds nothing
        assert!(!auth.remove(&account.id));
    }

    #[test]
    fn test_remove_by_user_id() {
        let auth = authenticator();
        let a = auth.add(account(10, 0));
        let b = auth.add(account(10, 0));
        let other = auth.add(account(11, 0));

        assert!(auth.remove_by_user_id(10));
        assert_eq!(
            auth.authenticate(&credential_at(&a.id, now_secs())),
            Err(AuthError::NotFound)
        );
        assert_eq!(
            auth.authenticate(&credential_at(&b.id, now_secs())),
            Err(AuthError::NotFound)
        );
        assert!(auth
            .authenticate(&credential_at(&other.id, now_secs()))
            .is_ok());
        assert!(!auth.remove_by_user_id(10));
    }

    #[test]
    fn test_refresh_extends_and_evicts() {
        let auth = authenticator();
        let t0 = now_secs();
        let account = auth.add(account(1, 0));

        // Advance the logical clock far enough that the original oldest
        // buckets fall out of the window
        let later = t0 + 300;
        auth.refresh(later);

        assert_eq!(
            auth.authenticate(&credential_at(&account.id, t0 - W)),
            Err(AuthError::NotFound),
            "evicted bucket must be gone"
        );
        assert!(
            auth.authenticate(&credential_at(&account.id, later + W)).is_ok(),
            "coverage must extend to the new window edge"
        );
        // Exactly one bucket per second in the new window
        assert_eq!(auth.bucket_count(), (2 * W + 1) as usize);
    }

    #[test]
    fn test_refresh_resumes_from_last_generated() {
        let auth = authenticator();
        let t0 = now_secs();
        let account = auth.add(account(1, 0));

        // A refresh within the already-generated range must not clear fuses
        let presented = credential_at(&account.id, t0 + 5);
        auth.burn(&presented).unwrap();
        auth.refresh(t0 + 1);
        assert_eq!(auth.authenticate(&presented), Err(AuthError::Tainted));
    }

    #[test]
    fn test_match_by_derived_key() {
        let auth = authenticator();
        let account = auth.add(account(1, 0));
        let key = account.derived_key();

        let matched = auth.match_by_derived_key(&key).unwrap();
        assert_eq!(matched.id, account.id);

        // No replay window on this path: lookups repeat freely
        assert!(auth.match_by_derived_key(&key).is_some());

        auth.remove(&account.id);
        assert!(auth.match_by_derived_key(&key).is_none());
    }

    #[test]
    fn test_concurrent_burn_exactly_one_winner() {
        use std::thread;

        let auth = Arc::new(authenticator());
        let account = auth.add(account(1, 0));
        let presented = credential_at(&account.id, now_secs());

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let auth = Arc::clone(&auth);
                thread::spawn(move || auth.burn(&presented))
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let wins = results.iter().filter(|r| r.is_ok()).count();
        let replays = results
            .iter()
            .filter(|r| **r == Err(AuthError::Tainted))
            .count();
        assert_eq!(wins, 1);
        assert_eq!(replays, 15);
    }

    #[tokio::test]
    async fn test_start_close_idempotent() {
        let auth = Arc::new(authenticator());
        auth.start();
        auth.start(); // no-op
        auth.close();
        auth.close(); // no-op

        // The refresh task must have observed cancellation
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(auth.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_refresh_task_runs() {
        let config = AuthConfig {
            replay_window_secs: 120,
            refresh_interval_secs: 1,
            forced_aead: false,
        };
        let auth = Arc::new(TimedAuthenticator::new(&config));
        let account = auth.add(account(1, 0));
        auth.start();

        // First interval tick fires immediately; the task keeps coverage
        // at the moving window edge.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let presented = credential_at(&account.id, now_secs() + W);
        assert!(auth.authenticate(&presented).is_ok());
        auth.close();
    }

    #[test]
    fn test_forced_aead_drops_alternate_ids() {
        let config = AuthConfig {
            forced_aead: true,
            ..AuthConfig::default()
        };
        let auth = TimedAuthenticator::new(&config);
        let account = auth.add(account(1, 3));

        // Primary id and derived-key path keep working
        let primary = credential_at(&account.id, now_secs());
        assert!(auth.authenticate(&primary).is_ok());
        assert!(auth.match_by_derived_key(&account.derived_key()).is_some());

        // Alternate-id credentials no longer resolve
        let alt = credential_at(&account.alter_ids[0], now_secs());
        assert_eq!(auth.authenticate(&alt), Err(AuthError::NotFound));
    }
}
