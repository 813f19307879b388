//! Credential verification.
//!
//! The auth collaborator issues HS256 bearer tokens; the gateway's only
//! contract with it is: given an opaque credential, produce a verified
//! identity `(userId, role, active)`. Expired and malformed tokens are
//! distinguished so operators can tell clock drift from abuse.
//!
//! Authentication failures are throttled per source address: five failures
//! inside the window lock the address out for fifteen minutes.

use chrono::{Duration, Utc};
use common::model::{Role, User};
use dashmap::DashMap;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};
use store::AuctionStore;
use thiserror::Error;
use tracing::warn;

/// JWT payload carried by the bearer credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: user id, stringified.
    pub sub: String,
    pub username: String,
    pub email: String,
    pub role: Role,
    /// Issued at (Unix timestamp).
    pub iat: i64,
    /// Expiration (Unix timestamp).
    pub exp: i64,
}

impl Claims {
    pub fn new(user: &User, ttl_minutes: i64) -> Self {
        let now = Utc::now();
        Self {
            sub: user.id.to_string(),
            username: user.username.clone(),
            email: user.email.clone(),
            role: user.role,
            iat: now.timestamp(),
            exp: (now + Duration::minutes(ttl_minutes)).timestamp(),
        }
    }
}

/// Authentication error type.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("credential expired")]
    Expired,
    #[error("credential invalid")]
    Invalid,
    #[error("account inactive")]
    Inactive,
    #[error("source address locked out")]
    LockedOut,
    #[error("verification unavailable")]
    Unavailable,
}

/// The verified identity attached to every inbound command.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: i64,
    pub username: String,
    pub role: Role,
}

/// Issue a credential for a user. The platform's auth service does this in
/// production; tests and tooling use it directly.
pub fn issue_token(user: &User, secret: &str, ttl_minutes: i64) -> Result<String, AuthError> {
    encode(
        &Header::default(),
        &Claims::new(user, ttl_minutes),
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|_| AuthError::Invalid)
}

/// Decode and validate a credential.
pub fn decode_token(token: &str, secret: &str) -> Result<Claims, AuthError> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|e| match e.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
        _ => AuthError::Invalid,
    })
}

#[derive(Debug)]
struct ThrottleEntry {
    failures: u32,
    window_start: Instant,
    locked_until: Option<Instant>,
}

/// Per-source-address failure throttle.
#[derive(Debug, Clone)]
pub struct AuthThrottle {
    entries: Arc<DashMap<IpAddr, ThrottleEntry>>,
    max_failures: u32,
    window: StdDuration,
    lockout: StdDuration,
}

impl Default for AuthThrottle {
    fn default() -> Self {
        Self::new(5, StdDuration::from_secs(15 * 60), StdDuration::from_secs(15 * 60))
    }
}

impl AuthThrottle {
    pub fn new(max_failures: u32, window: StdDuration, lockout: StdDuration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            max_failures,
            window,
            lockout,
        }
    }

    pub fn is_locked(&self, addr: IpAddr) -> bool {
        match self.entries.get(&addr) {
            Some(entry) => match entry.locked_until {
                Some(until) => Instant::now() < until,
                None => false,
            },
            None => false,
        }
    }

    pub fn record_failure(&self, addr: IpAddr) {
        let now = Instant::now();
        let mut entry = self.entries.entry(addr).or_insert(ThrottleEntry {
            failures: 0,
            window_start: now,
            locked_until: None,
        });
        if now.duration_since(entry.window_start) > self.window {
            entry.failures = 0;
            entry.window_start = now;
            entry.locked_until = None;
        }
        entry.failures += 1;
        if entry.failures >= self.max_failures {
            warn!("locking out {} after {} auth failures", addr, entry.failures);
            entry.locked_until = Some(now + self.lockout);
        }
    }

    pub fn record_success(&self, addr: IpAddr) {
        self.entries.remove(&addr);
    }
}

/// Verifies credentials against the token secret and the user table.
#[derive(Clone)]
pub struct Verifier {
    secret: String,
    store: Arc<dyn AuctionStore>,
}

impl Verifier {
    pub fn new(secret: impl Into<String>, store: Arc<dyn AuctionStore>) -> Self {
        Self {
            secret: secret.into(),
            store,
        }
    }

    /// Full verification: signature, expiry, user existence, active flag.
    pub async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let claims = decode_token(token, &self.secret)?;
        let user_id: i64 = claims.sub.parse().map_err(|_| AuthError::Invalid)?;
        let user = self
            .store
            .get_user(user_id)
            .await
            .map_err(|e| {
                warn!("user lookup failed during auth: {}", e);
                AuthError::Unavailable
            })?
            .ok_or(AuthError::Invalid)?;
        if !user.active {
            return Err(AuthError::Inactive);
        }
        Ok(Identity {
            user_id: user.id,
            username: user.username,
            role: user.role,
        })
    }
}
