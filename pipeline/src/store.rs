use bytes::Bytes;
use chrono::Utc;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use petcam_common::config::{PersistConfig, RetentionConfig};
use petcam_common::types::HistoryRecord;

use crate::broadcast::FrameHub;
use crate::motion::MotionDetector;
use crate::subscribe::{SubscriberSet, Token};

/// Persists a rate-limited, motion-aware subset of frames under a retention
/// horizon and answers nearest-timestamp lookups.
///
/// Index invariant: `timestamps` is strictly increasing and stays in lockstep
/// with `history`; culls drop the same prefix from both, and the file for a
/// timestamp exists exactly while its index entry does. The single index lock
/// spans file reads and deletes, so a lookup can never observe a file a
/// concurrent cull is removing.
pub struct FrameStore {
    dir: PathBuf,
    min_interval: Duration,
    max_interval_ms: i64,
    window_ms: i64,
    cull_interval: Duration,
    inner: Mutex<StoreInner>,
}

struct StoreInner {
    timestamps: Vec<i64>,
    history: Vec<HistoryRecord>,
    last_save_ms: Option<i64>,
    subscribers: SubscriberSet<HistoryRecord>,
}

/// A frame is persisted while the detector sees motion, on the very first
/// opportunity, or once the idle gap exceeds the maximum interval.
fn should_persist(
    last_save_ms: Option<i64>,
    now_ms: i64,
    in_motion: bool,
    max_interval_ms: i64,
) -> bool {
    match last_save_ms {
        None => true,
        Some(last) => in_motion || now_ms - last > max_interval_ms,
    }
}

impl FrameStore {
    pub fn new(persist: &PersistConfig, retention: &RetentionConfig) -> Self {
        Self {
            dir: PathBuf::from(&persist.dir),
            min_interval: Duration::from_secs(persist.min_interval_secs),
            max_interval_ms: persist.max_interval_secs as i64 * 1000,
            window_ms: retention.window_secs as i64 * 1000,
            cull_interval: Duration::from_secs(retention.cull_interval_secs),
            inner: Mutex::new(StoreInner {
                timestamps: Vec::new(),
                history: Vec::new(),
                last_save_ms: None,
                subscribers: SubscriberSet::new(),
            }),
        }
    }

    fn frame_path(&self, timestamp_ms: i64) -> PathBuf {
        self.dir.join(format!("{timestamp_ms}.jpg"))
    }

    /// Delete every frame persisted by a previous run. Called once at startup;
    /// the index never survives a restart.
    pub async fn erase_all(&self) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StoreError::Scan(self.dir.display().to_string(), e))?;
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| StoreError::Scan(self.dir.display().to_string(), e))?;
        let mut removed = 0usize;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::Scan(self.dir.display().to_string(), e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("jpg") {
                tokio::fs::remove_file(&path)
                    .await
                    .map_err(|e| StoreError::Delete(path.display().to_string(), e))?;
                removed += 1;
            }
        }
        info!(removed, dir = %self.dir.display(), "cleared persisted frames");
        Ok(())
    }

    /// Persist one frame if the policy calls for it. Returns the new history
    /// record when the frame was written.
    pub async fn record(
        &self,
        frame: &Bytes,
        now_ms: i64,
        in_motion: bool,
    ) -> Result<Option<HistoryRecord>, StoreError> {
        let mut inner = self.inner.lock().await;
        if !should_persist(inner.last_save_ms, now_ms, in_motion, self.max_interval_ms) {
            return Ok(None);
        }
        // Sub-millisecond arrivals would collide on the filename and break
        // the strictly-increasing index; skip them.
        if inner.timestamps.last().copied().is_some_and(|t| t >= now_ms) {
            return Ok(None);
        }

        let path = self.frame_path(now_ms);
        tokio::fs::write(&path, frame)
            .await
            .map_err(|e| StoreError::Write(path.display().to_string(), e))?;

        let record = HistoryRecord {
            timestamp_ms: now_ms,
            in_motion,
        };
        inner.timestamps.push(now_ms);
        inner.history.push(record);
        inner.last_save_ms = Some(now_ms);
        inner.subscribers.publish(&record);
        debug!(timestamp_ms = now_ms, in_motion, "persisted frame");
        Ok(Some(record))
    }

    /// Persistence loop: pull, decide, persist, pace. The sleep after every
    /// frame is what bounds the persist rate during continuous motion.
    /// A failed write is fatal to this loop.
    pub async fn run(&self, hub: &FrameHub, motion: &MotionDetector) -> Result<(), StoreError> {
        loop {
            let Ok(frame) = hub.next().await else {
                debug!("frame stream closed, stopping persistence");
                return Ok(());
            };
            let now_ms = Utc::now().timestamp_millis();
            self.record(&frame, now_ms, motion.in_motion()).await?;
            tokio::time::sleep(self.min_interval).await;
        }
    }

    /// Drop everything older than `cutoff_ms`: the files, then the same
    /// prefix of the index and history. Returns how many entries went.
    pub async fn cull_before(&self, cutoff_ms: i64) -> usize {
        let mut inner = self.inner.lock().await;
        let split = inner.timestamps.partition_point(|&ts| ts < cutoff_ms);
        for &ts in &inner.timestamps[..split] {
            let path = self.frame_path(ts);
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(error = %e, path = %path.display(), "failed to delete culled frame");
            }
        }
        inner.timestamps.drain(..split);
        inner.history.drain(..split);
        split
    }

    /// Retention loop: periodically drops frames older than the window.
    pub async fn cull(&self) {
        loop {
            tokio::time::sleep(self.cull_interval).await;
            let cutoff_ms = Utc::now().timestamp_millis() - self.window_ms;
            let removed = self.cull_before(cutoff_ms).await;
            if removed > 0 {
                info!(removed, "culled expired frames");
            }
        }
    }

    /// Nearest-timestamp lookup: compares the two index neighbors around the
    /// query and returns the closer one, preferring the earlier on ties.
    pub async fn get(&self, timestamp_ms: i64) -> Result<Vec<u8>, StoreError> {
        let inner = self.inner.lock().await;
        let idx = inner.timestamps.partition_point(|&t| t <= timestamp_ms);

        let mut best: Option<i64> = None;
        for neighbor in [idx.checked_sub(1), Some(idx)] {
            let Some(candidate) = neighbor.and_then(|j| inner.timestamps.get(j).copied()) else {
                continue;
            };
            let closer = match best {
                None => true,
                Some(b) => (candidate - timestamp_ms).abs() < (b - timestamp_ms).abs(),
            };
            if closer {
                best = Some(candidate);
            }
        }

        let best = best.ok_or(StoreError::NotFound)?;
        let path = self.frame_path(best);
        tokio::fs::read(&path)
            .await
            .map_err(|e| StoreError::Read(path.display().to_string(), e))
    }

    /// Register for save events.
    pub async fn subscribe(&self) -> (Token, mpsc::UnboundedReceiver<HistoryRecord>) {
        self.inner.lock().await.subscribers.subscribe()
    }

    /// Register for save events and snapshot the history under one lock, so
    /// no record can land between the bootstrap and the live feed.
    pub async fn subscribe_with_history(
        &self,
    ) -> (Token, Vec<HistoryRecord>, mpsc::UnboundedReceiver<HistoryRecord>) {
        let mut inner = self.inner.lock().await;
        let (token, rx) = inner.subscribers.subscribe();
        (token, inner.history.clone(), rx)
    }

    pub async fn unsubscribe(&self, token: Token) {
        self.inner.lock().await.subscribers.unsubscribe(token);
    }

    pub async fn history(&self) -> Vec<HistoryRecord> {
        self.inner.lock().await.history.clone()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no persisted frames")]
    NotFound,
    #[error("failed to write frame {0}: {1}")]
    Write(String, std::io::Error),
    #[error("failed to read frame {0}: {1}")]
    Read(String, std::io::Error),
    #[error("failed to scan frame directory {0}: {1}")]
    Scan(String, std::io::Error),
    #[error("failed to delete frame {0}: {1}")]
    Delete(String, std::io::Error),
}
