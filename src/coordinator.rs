#![forbid(unsafe_code)]

//! Download coordination: one job per `(video, quality)` key, a bounded
//! number of concurrent downloader processes, and progress fan-out.
//!
//! All job bookkeeping goes through the `jobs` mutex. Broadcasting happens
//! while that lock is held so a caller attaching to a running job gets the
//! latest snapshot followed by every later event, with nothing skipped or
//! delivered twice. Lock order is always jobs, then broadcaster.
//!
//! New jobs are pushed onto a queue while the jobs lock is held and a single
//! dispatcher task hands out permits, so queued downloads start in the order
//! they were requested.

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};

use crate::{
    broadcast::{ProgressBroadcaster, Subscription},
    cache::{CacheEntry, CacheStore},
    progress::{Phase, ProgressEvent, ProgressUpdate},
    ytdlp::{self, Fetcher},
};

pub fn download_key(video_id: &str, quality: &str) -> String {
    format!("{video_id}:{quality}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Merging,
    Complete,
    Failed,
}

/// Bookkeeping for one in-flight download.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadJob {
    pub video_id: String,
    pub quality: String,
    pub state: JobState,
    pub bytes_video: u64,
    pub total_video: u64,
    pub bytes_audio: u64,
    pub total_audio: u64,
    pub percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip)]
    last_event: Option<ProgressEvent>,
}

impl DownloadJob {
    fn new(video_id: &str, quality: &str) -> Self {
        Self {
            video_id: video_id.to_string(),
            quality: quality.to_string(),
            state: JobState::Queued,
            bytes_video: 0,
            total_video: 0,
            bytes_audio: 0,
            total_audio: 0,
            percent: 0.0,
            error: None,
            started_at: Utc::now(),
            last_event: None,
        }
    }

    fn apply(&mut self, update: &ProgressUpdate) {
        match update.phase {
            Phase::Video => {
                self.state = JobState::Running;
                self.bytes_video = update.downloaded_bytes;
                self.total_video = update.total_bytes;
            }
            Phase::Audio => {
                self.state = JobState::Running;
                self.bytes_audio = update.downloaded_bytes;
                self.total_audio = update.total_bytes;
            }
            Phase::Merging => self.state = JobState::Merging,
            Phase::Complete => self.state = JobState::Complete,
            Phase::Error => self.state = JobState::Failed,
        }
        self.percent = update.percent;
    }
}

/// How a download request was satisfied.
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadOutcome {
    /// A fresh cache entry exists; the subscription holds a single Complete.
    Cached(CacheEntry),
    /// A new job was queued for this key.
    Started,
    /// The caller joined a job that was already running.
    Attached,
}

impl DownloadOutcome {
    pub fn already_serving(&self) -> bool {
        !matches!(self, Self::Started)
    }
}

struct QueuedJob {
    key: String,
    video_id: String,
    quality: String,
}

struct Inner {
    jobs: Mutex<HashMap<String, DownloadJob>>,
    broadcaster: ProgressBroadcaster,
    queue: mpsc::UnboundedSender<QueuedJob>,
    fetcher: Arc<dyn Fetcher>,
    cache: Arc<CacheStore>,
}

#[derive(Clone)]
pub struct DownloadCoordinator {
    inner: Arc<Inner>,
}

impl DownloadCoordinator {
    /// Spawns the dispatcher, so this must be called from within a Tokio
    /// runtime. The dispatcher exits once every clone is dropped.
    pub fn new(fetcher: Arc<dyn Fetcher>, cache: Arc<CacheStore>, max_concurrent: usize) -> Self {
        let (queue, pending) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            jobs: Mutex::new(HashMap::new()),
            broadcaster: ProgressBroadcaster::new(),
            queue,
            fetcher,
            cache,
        });
        let permits = Arc::new(Semaphore::new(max_concurrent.max(1)));
        tokio::spawn(dispatch(Arc::downgrade(&inner), permits, pending));
        Self { inner }
    }

    pub fn cache(&self) -> &CacheStore {
        &self.inner.cache
    }

    /// Returns a subscription for the key and how it was satisfied. Starts a
    /// background job only when nothing is running and nothing is cached.
    ///
    pub fn request_download(&self, video_id: &str, quality: &str) -> (Subscription, DownloadOutcome) {
        let key = download_key(video_id, quality);
        let mut jobs = self.inner.jobs.lock();

        if let Some(job) = jobs.get(&key) {
            let subscription = self.inner.broadcaster.subscribe(&key, job.last_event.clone());
            tracing::debug!(video_id, quality, "attached to running download");
            return (subscription, DownloadOutcome::Attached);
        }

        if let Some(entry) = self.inner.cache.lookup(video_id, quality) {
            let event = ProgressEvent::complete(video_id, quality, entry.size_bytes);
            return (Subscription::preloaded([event]), DownloadOutcome::Cached(entry));
        }

        jobs.insert(key.clone(), DownloadJob::new(video_id, quality));
        let subscription = self.inner.broadcaster.subscribe(&key, None);
        let queued = self.inner.queue.send(QueuedJob {
            key: key.clone(),
            video_id: video_id.to_string(),
            quality: quality.to_string(),
        });
        drop(jobs);

        match queued {
            Ok(()) => tracing::info!(video_id, quality, "download queued"),
            Err(_) => self.fail(&key, "download queue is closed".to_string()),
        }
        (subscription, DownloadOutcome::Started)
    }

    /// Subscribes to an existing job or cache entry without starting anything.
    pub fn subscribe_existing(&self, video_id: &str, quality: &str) -> Option<Subscription> {
        let key = download_key(video_id, quality);
        let jobs = self.inner.jobs.lock();
        if let Some(job) = jobs.get(&key) {
            return Some(self.inner.broadcaster.subscribe(&key, job.last_event.clone()));
        }
        self.inner.cache.lookup(video_id, quality).map(|entry| {
            Subscription::preloaded([ProgressEvent::complete(video_id, quality, entry.size_bytes)])
        })
    }

    /// Snapshots of every running job for `video_id`, ordered by quality.
    pub fn active_jobs(&self, video_id: &str) -> Vec<DownloadJob> {
        let mut jobs: Vec<DownloadJob> = self
            .inner
            .jobs
            .lock()
            .values()
            .filter(|job| job.video_id == video_id)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.quality.cmp(&b.quality));
        jobs
    }

    async fn run_job(self, queued: QueuedJob, permit: OwnedSemaphorePermit) {
        let QueuedJob {
            key,
            video_id,
            quality,
        } = queued;
        if let Some(job) = self.inner.jobs.lock().get_mut(&key) {
            job.state = JobState::Running;
        }
        tracing::info!(%video_id, %quality, "download started");

        let staging = self.inner.cache.staging_path(&video_id, &quality);
        let url = ytdlp::video_url(&video_id);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let fetch = self.inner.fetcher.fetch(&url, &quality, &staging, tx);
        let pump = async {
            while let Some(update) = rx.recv().await {
                self.record_progress(&key, update);
            }
        };
        let (result, ()) = tokio::join!(fetch, pump);
        drop(permit);

        let cache = Arc::clone(&self.inner.cache);
        let outcome = match result {
            Ok(_) => {
                let (id, label) = (video_id.clone(), quality.clone());
                tokio::task::spawn_blocking(move || cache.insert(&id, &label, &staging))
                    .await
                    .map_err(|err| format!("cache insert failed: {err}"))
                    .and_then(|inserted| inserted.map_err(|err| err.to_string()))
            }
            Err(err) => Err(err.to_string()),
        };
        match outcome {
            Ok(entry) => self.complete(&key, entry),
            Err(message) => {
                let cache = Arc::clone(&self.inner.cache);
                match tokio::task::spawn_blocking(move || cache.discard_staging(&video_id, &quality))
                    .await
                {
                    Ok(removed) if removed > 0 => {
                        tracing::debug!(key = %key, removed, "removed staging leftovers")
                    }
                    Ok(_) => {}
                    Err(err) => tracing::warn!(key = %key, error = %err, "staging cleanup failed"),
                }
                self.fail(&key, message);
            }
        }
    }

    fn record_progress(&self, key: &str, update: ProgressUpdate) {
        let mut jobs = self.inner.jobs.lock();
        let Some(job) = jobs.get_mut(key) else {
            return;
        };
        if update.phase == Phase::Merging && job.state != JobState::Merging {
            tracing::info!(video_id = %job.video_id, quality = %job.quality, "merging tracks");
        }
        job.apply(&update);
        let event = ProgressEvent::from_update(&job.video_id, &job.quality, update);
        job.last_event = Some(event.clone());
        self.inner.broadcaster.publish(key, event);
    }

    fn complete(&self, key: &str, entry: CacheEntry) {
        let mut jobs = self.inner.jobs.lock();
        jobs.remove(key);
        tracing::info!(
            video_id = %entry.video_id,
            quality = %entry.quality,
            size = entry.size_bytes,
            path = %entry.file_path.display(),
            "download complete"
        );
        let event = ProgressEvent::complete(&entry.video_id, &entry.quality, entry.size_bytes);
        self.inner.broadcaster.publish(key, event);
    }

    fn fail(&self, key: &str, message: String) {
        let mut jobs = self.inner.jobs.lock();
        let Some(job) = jobs.remove(key) else {
            return;
        };
        tracing::warn!(video_id = %job.video_id, quality = %job.quality, error = %message, "download failed");
        let event = ProgressEvent::failed(&job.video_id, &job.quality, message);
        self.inner.broadcaster.publish(key, event);
    }
}

/// Starts queued jobs one at a time as permits free up.
async fn dispatch(
    inner: Weak<Inner>,
    permits: Arc<Semaphore>,
    mut pending: mpsc::UnboundedReceiver<QueuedJob>,
) {
    while let Some(queued) = pending.recv().await {
        let permit = Arc::clone(&permits).acquire_owned().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let coordinator = DownloadCoordinator { inner };
        match permit {
            Ok(permit) => {
                tokio::spawn(coordinator.run_job(queued, permit));
            }
            // The semaphore is never closed, but a closed pool must still end the job.
            Err(_) => coordinator.fail(&queued.key, "download pool is shut down".to_string()),
        }
    }
    tracing::debug!("download dispatcher stopped");
}
