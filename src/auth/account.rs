//! Subscriber accounts and credential derivation
//!
//! An account is immutable once created: alternate identifiers are derived
//! deterministically from the primary identifier at construction time.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::hooks::UserId;
use crate::protocol::SecurityType;

type HmacSha256 = Hmac<Sha256>;

/// Domain separation labels for the two derivation paths
const ALTER_ID_LABEL: &[u8] = b"veil alter id";
const DERIVED_KEY_INFO: &[u8] = b"veil auth id";

/// Identity and credential material for one subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    /// Operator-facing user id (database key in the management layer)
    pub user_id: UserId,
    /// Primary 16-byte identifier
    pub id: Uuid,
    /// Alternate identifiers, generated once at creation
    pub alter_ids: Vec<Uuid>,
    /// Negotiable cipher mode for this account
    pub security: SecurityType,
    /// Mandatory flow for stream commands, if configured
    pub flow: Option<String>,
    /// Opaque per-protocol secret
    pub secret: Vec<u8>,
}

impl Account {
    /// Create an account, deriving `alter_count` alternate identifiers
    pub fn new(
        user_id: UserId,
        id: Uuid,
        alter_count: usize,
        security: SecurityType,
        flow: Option<String>,
        secret: Vec<u8>,
    ) -> Self {
        let mut alter_ids = Vec::with_capacity(alter_count);
        let mut prev = id;
        for _ in 0..alter_count {
            prev = next_alter_id(&prev);
            alter_ids.push(prev);
        }
        Self {
            user_id,
            id,
            alter_ids,
            security,
            flow,
            secret,
        }
    }

    /// All identifiers owned by this account, primary first
    pub fn all_ids(&self) -> impl Iterator<Item = &Uuid> {
        std::iter::once(&self.id).chain(self.alter_ids.iter())
    }

    /// Canonical 8-4-4-4-12 rendering of the primary identifier.
    /// Display/config only; the wire always carries raw bytes.
    pub fn display_id(&self) -> String {
        self.id.hyphenated().to_string()
    }

    /// Key for the AEAD-oriented secondary index, derived from the
    /// primary identifier alone. No replay window on this path.
    pub fn derived_key(&self) -> [u8; 16] {
        let hk = Hkdf::<Sha256>::new(None, self.id.as_bytes());
        let mut okm = [0u8; 16];
        hk.expand(DERIVED_KEY_INFO, &mut okm)
            .expect("16 bytes is a valid HKDF-SHA256 output length");
        okm
    }
}

/// Derive the next alternate identifier in the chain
fn next_alter_id(prev: &Uuid) -> Uuid {
    let mut hasher = Sha256::new();
    hasher.update(prev.as_bytes());
    hasher.update(ALTER_ID_LABEL);
    let digest = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes)
}

/// Time-bucketed credential: HMAC-SHA256 over the epoch second, keyed by
/// the raw identifier bytes, truncated to 16 bytes.
pub fn credential_at(id: &Uuid, epoch_second: i64) -> [u8; 16] {
    let mut mac =
        HmacSha256::new_from_slice(id.as_bytes()).expect("HMAC accepts any key length");
    mac.update(&(epoch_second as u64).to_be_bytes());
    let digest = mac.finalize().into_bytes();
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[..16]);
    out
}
