// Token bookkeeping for gateway sessions
//
// Tokens are `base64(payload).base64(hmac-sha256(payload))` where the
// payload is `user_id.expires_at.nonce`. Validation checks the signature,
// the expiry, and the session store, so revocation is immediate. Expired
// entries are pruned lazily on access.

use crate::error::{GatewayError, Result};
use crate::id::ConnectionId;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use sha2::Sha256;
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// Session bound to an issued token.
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub user_id: String,
    pub connection_id: ConnectionId,
    pub issued_at: u64,
    pub expires_at: u64,
}

/// Issues, validates and revokes signed session tokens.
pub struct AuthManager {
    enabled: bool,
    secret: Vec<u8>,
    token_ttl: Duration,
    sessions: RwLock<HashMap<String, AuthSession>>,
}

impl AuthManager {
    pub fn new(enabled: bool, secret: impl Into<Vec<u8>>, token_ttl: Duration) -> Self {
        Self {
            enabled,
            secret: secret.into(),
            token_ttl,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Issue a token for a user on a connection and record the session.
    pub fn issue(&self, user_id: &str, connection_id: ConnectionId) -> Result<String> {
        if user_id.is_empty() || user_id.contains('.') {
            return Err(GatewayError::Authentication(format!(
                "invalid user id {:?}",
                user_id
            )));
        }
        let issued_at = now_unix();
        let expires_at = issued_at + self.token_ttl.as_secs();
        let nonce: u64 = rand::random();
        let payload = format!("{}.{}.{}", user_id, expires_at, nonce);
        let signature = self.sign(payload.as_bytes())?;
        let token = format!(
            "{}.{}",
            BASE64.encode(payload.as_bytes()),
            BASE64.encode(signature)
        );

        self.sessions.write().insert(
            token.clone(),
            AuthSession {
                user_id: user_id.to_string(),
                connection_id,
                issued_at,
                expires_at,
            },
        );
        debug!(user_id, connection_id, "token issued");
        Ok(token)
    }

    /// Validate a token: signature, expiry, and presence in the session
    /// store.
    pub fn validate(&self, token: &str) -> Result<AuthSession> {
        let (encoded_payload, encoded_signature) = token
            .split_once('.')
            .ok_or_else(|| GatewayError::Authentication("malformed token".to_string()))?;
        let payload = BASE64
            .decode(encoded_payload)
            .map_err(|_| GatewayError::Authentication("malformed token".to_string()))?;
        let signature = BASE64
            .decode(encoded_signature)
            .map_err(|_| GatewayError::Authentication("malformed token".to_string()))?;

        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| GatewayError::Internal(e.to_string()))?;
        mac.update(&payload);
        mac.verify_slice(&signature)
            .map_err(|_| GatewayError::Authentication("bad token signature".to_string()))?;

        let session = {
            let sessions = self.sessions.read();
            sessions
                .get(token)
                .cloned()
                .ok_or_else(|| GatewayError::Authentication("unknown or revoked token".to_string()))?
        };
        if session.expires_at <= now_unix() {
            self.sessions.write().remove(token);
            return Err(GatewayError::Authentication("token expired".to_string()));
        }
        Ok(session)
    }

    /// Drop a token. Idempotent.
    pub fn revoke(&self, token: &str) {
        if self.sessions.write().remove(token).is_some() {
            debug!("token revoked");
        }
    }

    /// Drop every session bound to a closed connection.
    pub fn detach_connection(&self, connection_id: ConnectionId) {
        self.sessions
            .write()
            .retain(|_, session| session.connection_id != connection_id);
    }

    /// Drop expired sessions.
    pub fn prune_expired(&self) {
        let now = now_unix();
        self.sessions
            .write()
            .retain(|_, session| session.expires_at > now);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    fn sign(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| GatewayError::Internal(e.to_string()))?;
        mac.update(payload);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
