#![forbid(unsafe_code)]

//! On-disk cache of finished downloads.
//!
//! Every entry is a single file `{video_id}_{quality}.mp4` in the cache
//! directory and its modification time is its creation time. Downloads in
//! flight live under `staging/` and are only renamed into the cache once they
//! are complete, so a reader never sees a partial file under a cache name.

use std::{
    fs::{self, File},
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use walkdir::WalkDir;

use crate::error::CacheError;

pub const STAGING_DIR: &str = "staging";
pub const CACHE_EXTENSION: &str = "mp4";
/// Staging files untouched for this long belong to a dead download.
pub const STAGING_MAX_AGE: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub video_id: String,
    pub quality: String,
    #[serde(skip)]
    pub file_path: PathBuf,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// What a single janitor pass deleted.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub orphaned: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.expired + self.orphaned
    }
}

#[derive(Debug, Clone)]
pub struct CacheStore {
    dir: PathBuf,
    ttl: Duration,
}

impl CacheStore {
    /// Creates the cache and staging directories if they are missing.
    pub fn open(dir: impl Into<PathBuf>, ttl: Duration) -> Result<Self, CacheError> {
        let store = Self {
            dir: dir.into(),
            ttl,
        };
        fs::create_dir_all(store.staging_dir())?;
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.dir.join(STAGING_DIR)
    }

    fn file_name(video_id: &str, quality: &str) -> String {
        format!("{video_id}_{quality}.{CACHE_EXTENSION}")
    }

    pub fn path_for(&self, video_id: &str, quality: &str) -> PathBuf {
        self.dir.join(Self::file_name(video_id, quality))
    }

    pub fn staging_path(&self, video_id: &str, quality: &str) -> PathBuf {
        self.staging_dir().join(Self::file_name(video_id, quality))
    }

    /// Returns the entry when the file exists, is non-empty and is younger
    /// than the TTL. Expired files are left for the janitor.
    pub fn lookup(&self, video_id: &str, quality: &str) -> Option<CacheEntry> {
        self.lookup_at(video_id, quality, SystemTime::now())
    }

    pub fn lookup_at(&self, video_id: &str, quality: &str, now: SystemTime) -> Option<CacheEntry> {
        let path = self.path_for(video_id, quality);
        let meta = fs::metadata(&path).ok()?;
        if !meta.is_file() || meta.len() == 0 {
            return None;
        }
        let modified = meta.modified().ok()?;
        if age(modified, now) > self.ttl {
            return None;
        }
        Some(CacheEntry {
            video_id: video_id.to_string(),
            quality: quality.to_string(),
            file_path: path,
            size_bytes: meta.len(),
            created_at: DateTime::<Utc>::from(modified),
        })
    }

    /// Moves a finished staging file into the cache and stamps it with the
    /// current time. An existing entry for the same key is replaced.
    pub fn insert(
        &self,
        video_id: &str,
        quality: &str,
        staged: &Path,
    ) -> Result<CacheEntry, CacheError> {
        let size = fs::metadata(staged)?.len();
        if size == 0 {
            return Err(CacheError::Empty(staged.to_path_buf()));
        }

        // Restamp before the rename so the file is never visible under a
        // cache name with an old mtime the janitor would delete.
        let now = SystemTime::now();
        File::options().write(true).open(staged)?.set_modified(now)?;

        let target = self.path_for(video_id, quality);
        fs::create_dir_all(&self.dir)?;
        fs::rename(staged, &target).map_err(|source| CacheError::Rename {
            from: staged.to_path_buf(),
            source,
        })?;

        tracing::debug!(video_id, quality, size, path = %target.display(), "cached download");
        Ok(CacheEntry {
            video_id: video_id.to_string(),
            quality: quality.to_string(),
            file_path: target,
            size_bytes: size,
            created_at: DateTime::<Utc>::from(now),
        })
    }

    /// Removes everything a failed download left in staging for this key:
    /// the merged file plus per-track `.fNNN` and `.part` files. Returns how
    /// many files were deleted.
    pub fn discard_staging(&self, video_id: &str, quality: &str) -> usize {
        let prefix = format!("{video_id}_{quality}.");
        let staging = self.staging_dir();
        if !staging.exists() {
            return 0;
        }

        let mut removed = 0;
        for entry in WalkDir::new(&staging)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with(&prefix))
        {
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(err) => {
                    tracing::warn!(path = %entry.path().display(), error = %err, "could not remove staging file");
                }
            }
        }
        removed
    }

    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(SystemTime::now())
    }

    /// Deletes cache files older than the TTL and staging files older than
    /// [`STAGING_MAX_AGE`]. Failures on individual files are logged and
    /// skipped.
    pub fn sweep_at(&self, now: SystemTime) -> SweepReport {
        SweepReport {
            expired: remove_older_than(&self.dir, self.ttl, now),
            orphaned: remove_older_than(&self.staging_dir(), STAGING_MAX_AGE, now),
        }
    }
}

fn age(modified: SystemTime, now: SystemTime) -> Duration {
    // A timestamp from the future counts as brand new.
    now.duration_since(modified).unwrap_or(Duration::ZERO)
}

fn remove_older_than(dir: &Path, max_age: Duration, now: SystemTime) -> usize {
    if !dir.exists() {
        return 0;
    }

    let mut removed = 0;
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
    {
        let Some(modified) = entry.metadata().ok().and_then(|meta| meta.modified().ok()) else {
            continue;
        };
        if age(modified, now) <= max_age {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => {
                tracing::debug!(path = %entry.path().display(), "removed expired file");
                removed += 1;
            }
            Err(err) => {
                tracing::warn!(path = %entry.path().display(), error = %err, "could not remove expired file");
            }
        }
    }
    removed
}

/// Runs a sweep right away and then every `every`, for as long as the
/// runtime lives.
pub fn spawn_janitor(store: Arc<CacheStore>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let store = Arc::clone(&store);
            match tokio::task::spawn_blocking(move || store.sweep()).await {
                Ok(report) if report.total() > 0 => tracing::info!(
                    expired = report.expired,
                    orphaned = report.orphaned,
                    "cache sweep removed files"
                ),
                Ok(_) => tracing::debug!("cache sweep found nothing to remove"),
                Err(err) => tracing::warn!(error = %err, "cache sweep task failed"),
            }
        }
    })
}
