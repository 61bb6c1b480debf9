//! Cross-process operation locks.
//!
//! One marker file per `(site, kind)` under the lock directory, created with
//! `create_new` so only one process can hold it. A marker older than the
//! staleness ceiling is assumed to belong to a crashed process and removed.
//! Scrape and repair runs share a marker: at most one history writer per site.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{HarvestError, Result};
use crate::sources::site_key;
use crate::types::config::LockConfig;

/// What a lock protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Scrape,
    Predict,
    Repair,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Scrape => "scrape",
            OperationKind::Predict => "predict",
            OperationKind::Repair => "repair",
        }
    }

    /// Name of the marker file guarding this kind. Scrapes and repairs both
    /// rewrite the site's history, so they share one marker.
    pub fn marker_name(&self) -> &'static str {
        match self {
            OperationKind::Scrape | OperationKind::Repair => "history",
            OperationKind::Predict => "predict",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Contents of a marker file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockMarker {
    pub site: String,
    pub operation_kind: OperationKind,
    pub owner_pid: u32,
    pub created_at: DateTime<Utc>,
}

/// Creates and inspects lock markers.
#[derive(Clone)]
pub struct LockManager {
    dir: PathBuf,
    config: LockConfig,
    clock: Arc<dyn Clock>,
}

impl LockManager {
    pub fn new(dir: impl Into<PathBuf>, config: LockConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            dir: dir.into(),
            config,
            clock,
        }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Marker path for a site and kind.
    pub fn lock_path(&self, site: &str, kind: OperationKind) -> PathBuf {
        self.dir
            .join(format!("{}_{}.lock", site_key(site), kind.marker_name()))
    }

    /// Acquire the lock, waiting up to `timeout` (the configured default when
    /// `None`). Stale markers are removed and acquisition retried.
    pub async fn acquire(
        &self,
        site: &str,
        kind: OperationKind,
        timeout: Option<Duration>,
    ) -> Result<LockGuard> {
        let timeout = timeout.unwrap_or(self.config.default_timeout);
        let path = self.lock_path(site, kind);
        tokio::fs::create_dir_all(&self.dir).await?;

        let started = tokio::time::Instant::now();
        let mut logged_wait = false;

        loop {
            match self.try_create(&path, site, kind).await {
                Ok(()) => {
                    info!(site = %site, kind = %kind, "Lock acquired");
                    return Ok(LockGuard {
                        path,
                        site: site.to_string(),
                        kind,
                        released: false,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }

            if self.is_stale(&path).await {
                warn!(site = %site, kind = %kind, path = %path.display(), "Removing stale lock");
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                continue;
            }

            let waited = started.elapsed();
            if waited >= timeout {
                return Err(HarvestError::LockTimeout {
                    site: site.to_string(),
                    kind,
                    waited,
                });
            }

            if !logged_wait {
                info!(site = %site, kind = %kind, "Lock held elsewhere, waiting");
                logged_wait = true;
            }
            let remaining = timeout - waited;
            tokio::time::sleep(self.config.poll_interval.min(remaining)).await;
        }
    }

    /// Whether a non-stale marker exists.
    pub async fn is_locked(&self, site: &str, kind: OperationKind) -> bool {
        let path = self.lock_path(site, kind);
        tokio::fs::try_exists(&path).await.unwrap_or(false) && !self.is_stale(&path).await
    }

    /// Read a marker, if present and parseable.
    pub async fn marker(&self, site: &str, kind: OperationKind) -> Option<LockMarker> {
        read_marker(&self.lock_path(site, kind)).await
    }

    async fn try_create(&self, path: &Path, site: &str, kind: OperationKind) -> std::io::Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await?;

        let marker = LockMarker {
            site: site.to_string(),
            operation_kind: kind,
            owner_pid: std::process::id(),
            created_at: self.clock.now(),
        };
        let body = serde_json::to_vec_pretty(&marker)?;
        file.write_all(&body).await?;
        file.flush().await
    }

    /// Age from the marker's `created_at`, or file mtime if unreadable.
    async fn is_stale(&self, path: &Path) -> bool {
        let created_at = match read_marker(path).await {
            Some(marker) => Some(marker.created_at),
            None => tokio::fs::metadata(path)
                .await
                .and_then(|m| m.modified())
                .ok()
                .map(DateTime::<Utc>::from),
        };

        let Some(created_at) = created_at else {
            return false;
        };
        let age = (self.clock.now() - created_at).to_std().unwrap_or_default();
        debug!(path = %path.display(), age_secs = age.as_secs(), "Lock age");
        age > self.config.stale_after
    }
}

async fn read_marker(path: &Path) -> Option<LockMarker> {
    let bytes = tokio::fs::read(path).await.ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Held lock. Released explicitly or on drop.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    site: String,
    kind: OperationKind,
    released: bool,
}

impl LockGuard {
    pub fn site(&self) -> &str {
        &self.site
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Remove the marker now.
    pub fn release(mut self) -> Result<()> {
        self.remove()?;
        Ok(())
    }

    fn remove(&mut self) -> std::io::Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(site = %self.site, kind = %self.kind, "Lock released");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.remove() {
            warn!(site = %self.site, kind = %self.kind, error = %e, "Failed to release lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ManualClock;

    fn manager(dir: &Path, clock: Arc<ManualClock>) -> LockManager {
        let config = LockConfig::default().with_poll_interval(Duration::from_millis(10));
        LockManager::new(dir.join("locks"), config, clock)
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let locks = manager(dir.path(), Arc::new(ManualClock::default()));

        let guard = locks
            .acquire("anid.cl", OperationKind::Scrape, None)
            .await
            .unwrap();
        assert!(locks.is_locked("anid.cl", OperationKind::Scrape).await);
        assert!(!locks.is_locked("anid.cl", OperationKind::Predict).await);

        let marker = locks.marker("anid.cl", OperationKind::Scrape).await.unwrap();
        assert_eq!(marker.owner_pid, std::process::id());

        guard.release().unwrap();
        assert!(!locks.is_locked("anid.cl", OperationKind::Scrape).await);
    }

    #[tokio::test]
    async fn test_drop_releases() {
        let dir = tempfile::tempdir().unwrap();
        let locks = manager(dir.path(), Arc::new(ManualClock::default()));

        {
            let _guard = locks
                .acquire("anid.cl", OperationKind::Predict, None)
                .await
                .unwrap();
        }
        assert!(!locks.is_locked("anid.cl", OperationKind::Predict).await);
    }

    #[tokio::test]
    async fn test_second_acquire_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let locks = manager(dir.path(), Arc::new(ManualClock::default()));

        let _held = locks
            .acquire("anid.cl", OperationKind::Scrape, None)
            .await
            .unwrap();
        let err = locks
            .acquire("anid.cl", OperationKind::Scrape, Some(Duration::from_millis(50)))
            .await
            .unwrap_err();

        match err {
            HarvestError::LockTimeout { site, kind, .. } => {
                assert_eq!(site, "anid.cl");
                assert_eq!(kind, OperationKind::Scrape);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stale_lock_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::default());
        let locks = manager(dir.path(), clock.clone());

        let held = locks
            .acquire("anid.cl", OperationKind::Scrape, None)
            .await
            .unwrap();
        // simulate a crashed owner
        std::mem::forget(held);

        clock.advance(Duration::from_secs(5 * 60 * 60));
        assert!(!locks.is_locked("anid.cl", OperationKind::Scrape).await);

        let guard = locks
            .acquire("anid.cl", OperationKind::Scrape, Some(Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(guard.kind(), OperationKind::Scrape);
    }

    #[test]
    fn test_lock_path_uses_site_key() {
        let locks = LockManager::new(
            "/tmp/locks",
            LockConfig::default(),
            Arc::new(ManualClock::default()),
        );
        assert_eq!(
            locks.lock_path("https://www.anid.cl/concursos/", OperationKind::Repair),
            PathBuf::from("/tmp/locks/anid_cl_history.lock")
        );
        assert_eq!(
            locks.lock_path("anid.cl", OperationKind::Scrape),
            locks.lock_path("anid.cl", OperationKind::Repair)
        );
    }

    #[tokio::test]
    async fn test_repair_excluded_while_scrape_held() {
        let dir = tempfile::tempdir().unwrap();
        let locks = manager(dir.path(), Arc::new(ManualClock::default()));

        let scrape = locks
            .acquire("anid.cl", OperationKind::Scrape, None)
            .await
            .unwrap();
        let err = locks
            .acquire("anid.cl", OperationKind::Repair, Some(Duration::ZERO))
            .await
            .unwrap_err();
        assert!(matches!(err, HarvestError::LockTimeout { kind: OperationKind::Repair, .. }));

        scrape.release().unwrap();
        let repair = locks
            .acquire("anid.cl", OperationKind::Repair, Some(Duration::ZERO))
            .await
            .unwrap();
        assert!(locks.is_locked("anid.cl", OperationKind::Scrape).await);

        let marker = locks.marker("anid.cl", OperationKind::Scrape).await.unwrap();
        assert_eq!(marker.operation_kind, OperationKind::Repair);
        repair.release().unwrap();
    }
}
