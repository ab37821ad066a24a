//! Resume tokens: a signed, opaque snapshot of session table state.
//!
//! The core defines the token shape and the signing scheme; storing tokens
//! and enforcing TTLs is the embedding application's job. A snapshot records
//! the ID counters and both tables with their refcounts - enough to rebuild
//! the bookkeeping on a new transport. Hooks for non-root exports cannot be
//! serialized; the application re-registers its targets on restore.

use crate::error::RpcError;
use crate::session::RpcSession;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

pub const SNAPSHOT_VERSION: u32 = 1;

/// Serializable import entry: `(id, local refcount, announcements)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportSnapshot {
    pub id: i64,
    pub refcount: u32,
    pub remote_refs: u32,
}

/// Serializable export entry: `(id, introductions)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportSnapshot {
    pub id: i64,
    pub introductions: u32,
}

/// Complete serializable session state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub version: u32,
    pub session_id: String,
    pub next_positive_id: i64,
    pub next_negative_id: i64,
    pub imports: Vec<ImportSnapshot>,
    pub exports: Vec<ExportSnapshot>,
}

impl SessionSnapshot {
    /// Capture the current table state of a session.
    pub fn capture(session: &RpcSession, session_id: impl Into<String>) -> Self {
        let core = session.core();
        let (next_positive_id, next_negative_id) = core.allocator.positions();
        SessionSnapshot {
            version: SNAPSHOT_VERSION,
            session_id: session_id.into(),
            next_positive_id,
            next_negative_id,
            imports: core
                .imports
                .snapshot()
                .into_iter()
                .map(|(id, refcount, remote_refs)| ImportSnapshot {
                    id,
                    refcount,
                    remote_refs,
                })
                .collect(),
            exports: core
                .exports
                .snapshot()
                .into_iter()
                .map(|(id, introductions)| ExportSnapshot { id, introductions })
                .collect(),
        }
    }
}

/// An issued token: opaque signed payload plus expiry metadata for the
/// external store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeToken {
    pub token_data: String,
    pub session_id: String,
    pub issued_at: u64,
    pub expires_at: u64,
}

/// Issues and verifies resume tokens with a shared secret.
#[derive(Debug)]
pub struct ResumeTokenManager {
    secret_key: Vec<u8>,
    default_ttl: u64,
}

impl ResumeTokenManager {
    pub fn new(secret_key: Vec<u8>) -> Self {
        Self {
            secret_key,
            default_ttl: 3600,
        }
    }

    pub fn with_ttl(secret_key: Vec<u8>, default_ttl: u64) -> Self {
        Self {
            secret_key,
            default_ttl,
        }
    }

    pub fn generate_secret_key() -> Vec<u8> {
        use rand::RngCore;
        let mut key = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        key
    }

    /// Sign a snapshot into an opaque token.
    pub fn issue(&self, snapshot: &SessionSnapshot) -> Result<ResumeToken, RpcError> {
        let payload = serde_json::to_vec(snapshot)
            .map_err(|e| RpcError::internal(format!("snapshot encoding failed: {}", e)))?;
        let encoded = URL_SAFE_NO_PAD.encode(&payload);
        let signature = self.sign(encoded.as_bytes());
        let issued_at = unix_now();
        Ok(ResumeToken {
            token_data: format!("{}.{}", encoded, signature),
            session_id: snapshot.session_id.clone(),
            issued_at,
            expires_at: issued_at + self.default_ttl,
        })
    }

    /// Verify a token and decode its snapshot. Expiry enforcement against
    /// the caller-supplied clock stays with the external store; this checks
    /// only the signature and shape.
    pub fn redeem(&self, token: &ResumeToken) -> Result<SessionSnapshot, RpcError> {
        let (encoded, signature) = token
            .token_data
            .split_once('.')
            .ok_or_else(|| RpcError::bad_request("malformed resume token"))?;
        if self.sign(encoded.as_bytes()) != signature {
            return Err(RpcError::permission_denied("resume token signature mismatch"));
        }
        let payload = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| RpcError::bad_request("malformed resume token payload"))?;
        let snapshot: SessionSnapshot = serde_json::from_slice(&payload)
            .map_err(|_| RpcError::bad_request("malformed resume token snapshot"))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(RpcError::bad_request(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        Ok(snapshot)
    }

    fn sign(&self, data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.secret_key);
        hasher.update(data);
        URL_SAFE_NO_PAD.encode(hasher.finalize())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_snapshot() -> SessionSnapshot {
        SessionSnapshot {
            version: SNAPSHOT_VERSION,
            session_id: "sess-1".into(),
            next_positive_id: 4,
            next_negative_id: -2,
            imports: vec![ImportSnapshot {
                id: 1,
                refcount: 2,
                remote_refs: 1,
            }],
            exports: vec![ExportSnapshot {
                id: -1,
                introductions: 3,
            }],
        }
    }

    #[test]
    fn issue_and_redeem_round_trips() {
        let manager = ResumeTokenManager::new(ResumeTokenManager::generate_secret_key());
        let snapshot = sample_snapshot();
        let token = manager.issue(&snapshot).unwrap();
        assert_eq!(manager.redeem(&token).unwrap(), snapshot);
    }

    #[test]
    fn tampered_token_is_rejected() {
        let manager = ResumeTokenManager::new(b"secret".to_vec());
        let mut token = manager.issue(&sample_snapshot()).unwrap();
        token.token_data = token.token_data.replace('A', "B");
        assert!(manager.redeem(&token).is_err());
    }

    #[test]
    fn wrong_key_is_rejected() {
        let issuer = ResumeTokenManager::new(b"key-one".to_vec());
        let verifier = ResumeTokenManager::new(b"key-two".to_vec());
        let token = issuer.issue(&sample_snapshot()).unwrap();
        let err = verifier.redeem(&token).unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::PermissionDenied);
    }

    #[test]
    fn expiry_metadata_uses_ttl() {
        let manager = ResumeTokenManager::with_ttl(b"k".to_vec(), 60);
        let token = manager.issue(&sample_snapshot()).unwrap();
        assert_eq!(token.expires_at - token.issued_at, 60);
    }
}
