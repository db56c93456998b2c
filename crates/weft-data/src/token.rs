use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::registry::DataRegistry;

/// Permission flags granted over one DataRef.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    pub read: bool,
    pub write: bool,
    pub delete: bool,
}

impl Permissions {
    pub fn read_only() -> Self {
        Self {
            read: true,
            write: false,
            delete: false,
        }
    }

    pub fn full() -> Self {
        Self {
            read: true,
            write: true,
            delete: true,
        }
    }
}

impl Default for Permissions {
    fn default() -> Self {
        Self::read_only()
    }
}

/// A self-contained capability over exactly one DataRef.
///
/// When server B needs data held by server A, the orchestrator issues a
/// token that B presents to A with its pull request. A verifies the
/// signature and expiry locally; there is no revocation list, so TTLs
/// are kept short.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessToken {
    pub data_uuid: Uuid,
    pub issued_by: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub permissions: Permissions,
    /// Hex-encoded keyed SHA-256 over the preceding fields.
    pub signature: String,
}

impl AccessToken {
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    pub fn time_remaining(&self) -> Option<Duration> {
        let now = Utc::now();
        if now > self.expires_at {
            None
        } else {
            Some(self.expires_at - now)
        }
    }

    /// Canonical byte encoding covered by the signature. Any field edit
    /// after signing changes this string and voids the token.
    fn signing_payload(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}{}{}",
            self.data_uuid,
            self.issued_by,
            self.issued_at.to_rfc3339(),
            self.expires_at.to_rfc3339(),
            self.permissions.read as u8,
            self.permissions.write as u8,
            self.permissions.delete as u8,
        )
    }
}

/// Issues and verifies access tokens with a process-local signing key.
///
/// Verification is stateless apart from the registry existence check;
/// tokens are never stored.
pub struct TokenService {
    issuer: String,
    key: Vec<u8>,
}

impl TokenService {
    pub fn new(issuer: &str, key: impl Into<Vec<u8>>) -> Self {
        Self {
            issuer: issuer.to_string(),
            key: key.into(),
        }
    }

    /// Issue a token for one DataRef with the given permission set.
    pub fn issue(&self, data_uuid: Uuid, permissions: Permissions, ttl: Duration) -> AccessToken {
        let issued_at = Utc::now();
        let mut token = AccessToken {
            data_uuid,
            issued_by: self.issuer.clone(),
            issued_at,
            expires_at: issued_at + ttl,
            permissions,
            signature: String::new(),
        };
        token.signature = self.sign(&token);
        token
    }

    /// Read-only token with a default one-hour TTL.
    pub fn issue_read_only(&self, data_uuid: Uuid) -> AccessToken {
        self.issue(data_uuid, Permissions::read_only(), Duration::hours(1))
    }

    /// Verify a token, failing closed.
    ///
    /// Order: unknown subject, then signature, then expiry. A token
    /// that was tampered with reports `BadSignature` even when it is also
    /// expired, and an expired token with a valid signature reports
    /// `Expired`.
    pub fn verify(&self, token: &AccessToken, registry: &DataRegistry) -> Result<(), TokenError> {
        if !registry.contains(token.data_uuid) {
            return Err(TokenError::UnknownSubject(token.data_uuid));
        }
        if self.sign(token) != token.signature {
            return Err(TokenError::BadSignature);
        }
        if token.is_expired() {
            return Err(TokenError::Expired);
        }
        Ok(())
    }

    /// Parse and verify a serialized token. Anything unparsable is a
    /// `BadSignature`, never a panic or a pass.
    pub fn verify_encoded(&self, raw: &str, registry: &DataRegistry) -> Result<AccessToken, TokenError> {
        let token: AccessToken = serde_json::from_str(raw).map_err(|_| TokenError::BadSignature)?;
        self.verify(&token, registry)?;
        Ok(token)
    }

    fn sign(&self, token: &AccessToken) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.key);
        hasher.update(token.signing_payload().as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("Token expired")]
    Expired,

    #[error("Invalid token signature")]
    BadSignature,

    #[error("Token subject unknown: {0}")]
    UnknownSubject(Uuid),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{DataRef, PayloadKind};

    fn registry_with_ref() -> (DataRegistry, Uuid) {
        let registry = DataRegistry::new();
        let r = DataRef::new("server-a", Uuid::new_v4(), 100, PayloadKind::Json);
        let id = r.uuid;
        registry.register(r).unwrap();
        (registry, id)
    }

    #[test]
    fn issue_and_verify() {
        let (registry, id) = registry_with_ref();
        let service = TokenService::new("client-1", b"secret".to_vec());

        let token = service.issue_read_only(id);
        assert!(token.permissions.read);
        assert!(!token.permissions.write);
        assert_eq!(service.verify(&token, &registry), Ok(()));
    }

    #[test]
    fn expired_token_rejected_despite_valid_signature() {
        let (registry, id) = registry_with_ref();
        let service = TokenService::new("client-1", b"secret".to_vec());

        let token = service.issue(id, Permissions::read_only(), Duration::seconds(-5));
        // The signature itself is genuine
        assert_eq!(service.sign(&token), token.signature);
        assert_eq!(service.verify(&token, &registry), Err(TokenError::Expired));
    }

    #[test]
    fn altered_payload_rejected() {
        let (registry, id) = registry_with_ref();
        let service = TokenService::new("client-1", b"secret".to_vec());

        let mut token = service.issue_read_only(id);
        token.permissions.delete = true;
        assert_eq!(
            service.verify(&token, &registry),
            Err(TokenError::BadSignature)
        );
    }

    #[test]
    fn unknown_subject_rejected() {
        let (registry, _) = registry_with_ref();
        let service = TokenService::new("client-1", b"secret".to_vec());

        let token = service.issue_read_only(Uuid::new_v4());
        assert!(matches!(
            service.verify(&token, &registry),
            Err(TokenError::UnknownSubject(_))
        ));
    }

    #[test]
    fn wrong_key_rejected() {
        let (registry, id) = registry_with_ref();
        let service = TokenService::new("client-1", b"secret".to_vec());
        let other = TokenService::new("client-1", b"different".to_vec());

        let token = service.issue_read_only(id);
        assert_eq!(
            other.verify(&token, &registry),
            Err(TokenError::BadSignature)
        );
    }

    #[test]
    fn garbage_fails_closed() {
        let (registry, _) = registry_with_ref();
        let service = TokenService::new("client-1", b"secret".to_vec());
        assert!(matches!(
            service.verify_encoded("not json at all", &registry),
            Err(TokenError::BadSignature)
        ));
    }
}
