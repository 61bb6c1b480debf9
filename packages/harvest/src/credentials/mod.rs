//! Credential pool with durable exhaustion state.
//!
//! Holds the API tokens used for generation calls, tracks which are in
//! cooldown, and picks the next usable one. Every mutation is persisted
//! through a [`CredentialRepository`] before the method returns, so
//! cooldowns survive process restarts.
//!
//! A credential is *available* when it has no `exhausted_until` or that
//! instant has passed. `exhausted_until` is only cleared by cooldown expiry
//! (lazily, on the next [`CredentialPool::current`]) or by removing the
//! credential; marking an already-exhausted credential never shortens its
//! cooldown.

mod secret;

pub use secret::{fingerprint, SecretString};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::stores::MemoryStore;
use crate::traits::store::CredentialRepository;

/// Longest cooldown a credential can be put in, whatever the service says.
pub const MAX_COOLDOWN: Duration = Duration::from_secs(7 * 24 * 60 * 60);

// ============================================================================
// Persisted state
// ============================================================================

/// One credential as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredCredential {
    pub token: String,

    #[serde(default)]
    pub exhausted_until: Option<DateTime<Utc>>,

    #[serde(default)]
    pub call_count: u64,

    #[serde(default)]
    pub failure_count: u64,

    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
}

impl StoredCredential {
    fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            exhausted_until: None,
            call_count: 0,
            failure_count: 0,
            last_used_at: None,
        }
    }

    fn is_available(&self, now: DateTime<Utc>) -> bool {
        self.exhausted_until.map_or(true, |until| until <= now)
    }
}

/// Whole-pool state as persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolState {
    pub credentials: Vec<StoredCredential>,

    #[serde(default)]
    pub cursor: usize,
}

// ============================================================================
// Public views
// ============================================================================

/// A credential handed out for one call.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    token: SecretString,
    fingerprint: String,
}

impl Credential {
    fn new(token: &str) -> Self {
        Self {
            token: SecretString::new(token),
            fingerprint: fingerprint(token),
        }
    }

    pub fn token(&self) -> &SecretString {
        &self.token
    }

    /// Loggable identifier.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

/// Result of a selection: the credential and whether it is actually usable.
///
/// When every credential is in cooldown the pool still hands out the one at
/// the cursor with `exhausted = true`; callers should expect that call to fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub credential: Credential,
    pub exhausted: bool,
}

/// Per-credential status for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialStatus {
    pub fingerprint: String,
    pub available: bool,
    pub current: bool,
    pub exhausted_until: Option<DateTime<Utc>>,
    pub call_count: u64,
    pub failure_count: u64,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Pool-wide status for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub total: usize,
    pub available: usize,
    pub total_calls: u64,
    pub total_failures: u64,
    pub credentials: Vec<CredentialStatus>,
}

// ============================================================================
// Pool
// ============================================================================

/// Rotating pool of API credentials.
pub struct CredentialPool {
    state: Mutex<PoolState>,
    repo: Arc<dyn CredentialRepository>,
    clock: Arc<dyn Clock>,
}

impl CredentialPool {
    /// Load the pool from its repository (empty if nothing saved yet).
    pub async fn open(repo: Arc<dyn CredentialRepository>, clock: Arc<dyn Clock>) -> Result<Self> {
        let mut state = repo.load_pool().await?.unwrap_or_default();
        if state.cursor >= state.credentials.len() {
            state.cursor = 0;
        }
        debug!(credentials = state.credentials.len(), "Credential pool loaded");

        Ok(Self {
            state: Mutex::new(state),
            repo,
            clock,
        })
    }

    /// Pool backed by memory only, seeded with `tokens`.
    pub fn in_memory<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::in_memory_with_clock(tokens, Arc::new(SystemClock))
    }

    /// Memory-backed pool with an explicit clock.
    pub fn in_memory_with_clock<I, S>(tokens: I, clock: Arc<dyn Clock>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = PoolState::default();
        for token in tokens {
            let token = token.into();
            if !state.credentials.iter().any(|c| c.token == token) {
                state.credentials.push(StoredCredential::new(token));
            }
        }

        Self {
            state: Mutex::new(state),
            repo: Arc::new(MemoryStore::new()),
            clock,
        }
    }

    /// Number of credentials.
    pub async fn len(&self) -> usize {
        self.state.lock().await.credentials.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Number of credentials not in cooldown.
    pub async fn available_count(&self) -> usize {
        let now = self.clock.now();
        let state = self.state.lock().await;
        state
            .credentials
            .iter()
            .filter(|c| c.is_available(now))
            .count()
    }

    /// Current credential.
    ///
    /// Clears expired cooldowns, then returns the first available credential
    /// starting at the cursor (wrapping). With none available, returns the
    /// cursor's credential marked exhausted. `None` only for an empty pool.
    pub async fn current(&self) -> Result<Option<Selection>> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        if state.credentials.is_empty() {
            return Ok(None);
        }

        let mut cleared = false;
        for cred in state.credentials.iter_mut() {
            if matches!(cred.exhausted_until, Some(until) if until <= now) {
                debug!(credential = %fingerprint(&cred.token), "Cooldown expired");
                cred.exhausted_until = None;
                cleared = true;
            }
        }

        let n = state.credentials.len();
        let start = state.cursor % n;
        let found = (0..n)
            .map(|offset| (start + offset) % n)
            .find(|&i| state.credentials[i].is_available(now));

        let selection = match found {
            Some(index) => {
                if index != state.cursor {
                    state.cursor = index;
                    cleared = true;
                }
                Selection {
                    credential: Credential::new(&state.credentials[index].token),
                    exhausted: false,
                }
            }
            None => {
                warn!(
                    credentials = n,
                    "All credentials exhausted, using cursor credential anyway"
                );
                Selection {
                    credential: Credential::new(&state.credentials[start].token),
                    exhausted: true,
                }
            }
        };

        if cleared {
            self.persist(&state).await?;
        }
        Ok(Some(selection))
    }

    /// Put a credential in cooldown for `cooldown` from now.
    ///
    /// An existing later cooldown is kept.
    pub async fn mark_exhausted(&self, credential: &Credential, cooldown: Duration) -> Result<()> {
        let now = self.clock.now();
        let cooldown = cooldown.min(MAX_COOLDOWN);
        let until = chrono::Duration::from_std(cooldown)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(now);

        let mut state = self.state.lock().await;
        let Some(cred) = state
            .credentials
            .iter_mut()
            .find(|c| c.token == credential.token().expose())
        else {
            warn!(credential = %credential.fingerprint(), "Cannot mark unknown credential exhausted");
            return Ok(());
        };

        let until = match cred.exhausted_until {
            Some(existing) if existing > until => existing,
            _ => until,
        };
        cred.exhausted_until = Some(until);

        info!(
            credential = %credential.fingerprint(),
            cooldown_secs = cooldown.as_secs(),
            exhausted_until = %until,
            "Credential marked exhausted"
        );
        self.persist(&state).await
    }

    /// Advance to the next available credential after the cursor.
    ///
    /// With none available the cursor moves one position anyway and the
    /// credential there is returned marked exhausted.
    pub async fn rotate(&self) -> Result<Option<Selection>> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let n = state.credentials.len();
        if n == 0 {
            return Ok(None);
        }

        let original = state.cursor % n;
        let next = (1..=n)
            .map(|offset| (original + offset) % n)
            .find(|&i| state.credentials[i].is_available(now));

        let selection = match next {
            Some(index) => {
                state.cursor = index;
                debug!(
                    from = original,
                    to = index,
                    credential = %fingerprint(&state.credentials[index].token),
                    "Rotated credential"
                );
                Selection {
                    credential: Credential::new(&state.credentials[index].token),
                    exhausted: false,
                }
            }
            None => {
                let forced = (original + 1) % n;
                state.cursor = forced;
                warn!(
                    from = original,
                    to = forced,
                    "Forced rotation: no credential available"
                );
                Selection {
                    credential: Credential::new(&state.credentials[forced].token),
                    exhausted: true,
                }
            }
        };

        self.persist(&state).await?;
        Ok(Some(selection))
    }

    /// Move the cursor back to the first credential.
    pub async fn reset_cursor(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.cursor == 0 {
            return Ok(());
        }
        state.cursor = 0;
        self.persist(&state).await
    }

    /// Record one call made with `credential`.
    pub async fn record_call(&self, credential: &Credential, success: bool) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let Some(cred) = state
            .credentials
            .iter_mut()
            .find(|c| c.token == credential.token().expose())
        else {
            return Ok(());
        };

        cred.call_count += 1;
        if !success {
            cred.failure_count += 1;
        }
        cred.last_used_at = Some(now);
        self.persist(&state).await
    }

    /// Add a token. Returns `false` if it was already present.
    pub async fn add(&self, token: impl Into<String>) -> Result<bool> {
        let token = token.into();
        let mut state = self.state.lock().await;
        if state.credentials.iter().any(|c| c.token == token) {
            return Ok(false);
        }

        info!(credential = %fingerprint(&token), "Credential added");
        state.credentials.push(StoredCredential::new(token));
        self.persist(&state).await?;
        Ok(true)
    }

    /// Remove a token. Returns `false` if it was not present.
    pub async fn remove(&self, token: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(index) = state.credentials.iter().position(|c| c.token == token) else {
            return Ok(false);
        };

        state.credentials.remove(index);
        if index < state.cursor {
            state.cursor -= 1;
        }
        if state.cursor >= state.credentials.len() {
            state.cursor = 0;
        }

        info!(credential = %fingerprint(token), "Credential removed");
        self.persist(&state).await?;
        Ok(true)
    }

    /// Snapshot of every credential's state.
    pub async fn status(&self) -> PoolStatus {
        let now = self.clock.now();
        let state = self.state.lock().await;
        let credentials: Vec<CredentialStatus> = state
            .credentials
            .iter()
            .enumerate()
            .map(|(i, c)| CredentialStatus {
                fingerprint: fingerprint(&c.token),
                available: c.is_available(now),
                current: i == state.cursor,
                exhausted_until: c.exhausted_until.filter(|until| *until > now),
                call_count: c.call_count,
                failure_count: c.failure_count,
                last_used_at: c.last_used_at,
            })
            .collect();

        PoolStatus {
            total: credentials.len(),
            available: credentials.iter().filter(|c| c.available).count(),
            total_calls: credentials.iter().map(|c| c.call_count).sum(),
            total_failures: credentials.iter().map(|c| c.failure_count).sum(),
            credentials,
        }
    }

    /// `(calls, failures)` summed across the pool.
    pub async fn totals(&self) -> (u64, u64) {
        let state = self.state.lock().await;
        state.credentials.iter().fold((0, 0), |(calls, failures), c| {
            (calls + c.call_count, failures + c.failure_count)
        })
    }

    async fn persist(&self, state: &PoolState) -> Result<()> {
        self.repo.save_pool(state).await.inspect_err(|e| {
            warn!(error = %e, "Failed to persist credential pool");
        })
    }
}
