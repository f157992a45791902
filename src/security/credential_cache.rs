use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{RelayError, RelayResult};
use crate::security::token_issuer::{CredentialKey, TokenIssuer};

/// Seconds before `expires_at` at which a cached token stops being handed out.
pub const EXPIRY_MARGIN_SECS: i64 = 60;

/// Wall-clock source for expiry decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// What a caller does when it finds the token stale while another caller is
/// already refreshing it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPolicy {
    /// Wait for the in-flight refresh and share its result.
    #[default]
    Wait,
    /// Use the cached token if it has not actually expired yet.
    ServeStale,
}

impl FromStr for RefreshPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wait" => Ok(RefreshPolicy::Wait),
            "serve-stale" | "serve_stale" | "stale" => Ok(RefreshPolicy::ServeStale),
            other => Err(format!("unknown refresh policy: {other}")),
        }
    }
}

/// A cached access token and the identity it was issued for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessCredential {
    pub token: String,
    pub issued_for: CredentialKey,
    pub expires_at: DateTime<Utc>,
}

impl AccessCredential {
    /// Inside the validity window, margin included.
    fn is_fresh(&self, key: &CredentialKey, now: DateTime<Utc>) -> bool {
        self.issued_for == *key && now + Duration::seconds(EXPIRY_MARGIN_SECS) < self.expires_at
    }

    /// Not yet past the upstream expiry.
    fn is_unexpired(&self, key: &CredentialKey, now: DateTime<Utc>) -> bool {
        self.issued_for == *key && now < self.expires_at
    }
}

/// Outcome of the most recent issuance call.
#[derive(Debug, Default)]
struct LastAttempt {
    seq: u64,
    failure: Option<String>,
}

struct Inner<I> {
    issuer: I,
    clock: Arc<dyn Clock>,
    policy: RefreshPolicy,
    slot: RwLock<Option<AccessCredential>>,
    refresh_gate: Mutex<()>,
    last_attempt: RwLock<LastAttempt>,
}

/// Single-slot access token cache with single-flight refresh.
///
/// The slot lock is only held for reads and the final write; the network
/// call happens under `refresh_gate`, which serializes refreshes. Callers
/// queued behind a refresh that fails get that failure instead of issuing
/// their own call; the next caller to arrive afterwards tries again.
pub struct CredentialCache<I> {
    inner: Arc<Inner<I>>,
}

impl<I> Clone for CredentialCache<I> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<I> fmt::Debug for CredentialCache<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialCache")
            .field("policy", &self.inner.policy)
            .finish_non_exhaustive()
    }
}

impl<I: TokenIssuer> CredentialCache<I> {
    pub fn new(issuer: I, policy: RefreshPolicy) -> Self {
        Self::with_clock(issuer, policy, Arc::new(SystemClock))
    }

    pub fn with_clock(issuer: I, policy: RefreshPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                issuer,
                clock,
                policy,
                slot: RwLock::new(None),
                refresh_gate: Mutex::new(()),
                last_attempt: RwLock::new(LastAttempt::default()),
            }),
        }
    }

    /// Current cached credential, fresh or not.
    pub async fn snapshot(&self) -> Option<AccessCredential> {
        self.inner.slot.read().await.clone()
    }

    /// Drop the cached credential.
    pub async fn invalidate(&self) {
        self.inner.slot.write().await.take();
    }

    async fn cached_token<F>(&self, accept: F) -> Option<String>
    where
        F: Fn(&AccessCredential) -> bool,
    {
        self.inner
            .slot
            .read()
            .await
            .as_ref()
            .filter(|c| accept(c))
            .map(|c| c.token.clone())
    }

    /// Return a valid token for `key`, fetching a new one if needed.
    ///
    /// A failed refresh leaves the previously cached credential in place.
    pub async fn get_or_refresh(&self, key: &CredentialKey) -> RelayResult<String> {
        let now = self.inner.clock.now();
        if let Some(token) = self.cached_token(|c| c.is_fresh(key, now)).await {
            return Ok(token);
        }

        let seen = self.inner.last_attempt.read().await.seq;
        let _gate = match self.inner.policy {
            RefreshPolicy::Wait => self.inner.refresh_gate.lock().await,
            RefreshPolicy::ServeStale => match self.inner.refresh_gate.try_lock() {
                Ok(gate) => gate,
                Err(_) => {
                    if let Some(token) = self.cached_token(|c| c.is_unexpired(key, now)).await {
                        debug!(corp_id = %key.corp_id, "refresh in flight, serving stale token");
                        return Ok(token);
                    }
                    self.inner.refresh_gate.lock().await
                }
            },
        };

        // another caller may have refreshed while we waited on the gate
        let now = self.inner.clock.now();
        if let Some(token) = self.cached_token(|c| c.is_fresh(key, now)).await {
            return Ok(token);
        }

        {
            let last = self.inner.last_attempt.read().await;
            if last.seq != seen {
                if let Some(cause) = &last.failure {
                    debug!(corp_id = %key.corp_id, "sharing failure of the refresh we waited on");
                    return Err(RelayError::RefreshFailed(cause.clone()));
                }
            }
        }

        let outcome = self.issue_credential(key).await;
        {
            let mut last = self.inner.last_attempt.write().await;
            last.seq += 1;
            last.failure = outcome.as_ref().err().map(ToString::to_string);
        }
        let credential = match outcome {
            Ok(credential) => credential,
            Err(err) => {
                warn!(corp_id = %key.corp_id, error = %err, "access token refresh failed");
                return Err(err);
            }
        };

        let expires_at = credential.expires_at;
        let token = credential.token.clone();
        *self.inner.slot.write().await = Some(credential);

        info!(
            corp_id = %key.corp_id,
            expires_at = %expires_at,
            "access token refreshed"
        );
        Ok(token)
    }

    async fn issue_credential(&self, key: &CredentialKey) -> RelayResult<AccessCredential> {
        let issued = self.inner.issuer.issue(key).await?;
        let expires_at = Duration::try_seconds(issued.expires_in)
            .and_then(|ttl| self.inner.clock.now().checked_add_signed(ttl))
            .ok_or_else(|| {
                RelayError::InvalidResponse(format!(
                    "expires_in {} is out of range",
                    issued.expires_in
                ))
            })?;
        Ok(AccessCredential {
            token: issued.access_token,
            issued_for: key.clone(),
            expires_at,
        })
    }
}
