use bytes::Bytes;
use std::future::Future;
use std::sync::Mutex;
use tokio::sync::oneshot;
use tokio::task;
use tracing::{debug, error, info};

use crate::source::FrameSource;

/// Fans each captured frame out to every consumer waiting at the moment it
/// arrives, and caches the most recent frame for immediate reads.
///
/// `next()` registers a fresh one-shot waiter per call, so a consumer that
/// wants a continuous feed re-subscribes after each delivery. A frame arriving
/// inside that re-subscription gap is not redelivered; this is accepted
/// semantics, not a bug.
pub struct FrameHub {
    state: Mutex<HubState>,
}

struct HubState {
    latest: Bytes,
    waiters: Vec<oneshot::Sender<Bytes>>,
    closed: bool,
}

impl FrameHub {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HubState {
                latest: Bytes::new(),
                waiters: Vec::new(),
                closed: false,
            }),
        }
    }

    /// The most recently captured frame; empty before the first capture.
    pub fn latest(&self) -> Bytes {
        self.state.lock().unwrap().latest.clone()
    }

    /// Waits for the next frame. The waiter is registered before this returns,
    /// so holding the future is enough to not miss the following broadcast.
    /// Fails once the source is exhausted.
    pub fn next(&self) -> impl Future<Output = Result<Bytes, StreamClosed>> {
        let receiver = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.push(tx);
                Some(rx)
            }
        };
        async move {
            match receiver {
                Some(rx) => rx.await.map_err(|_| StreamClosed),
                None => Err(StreamClosed),
            }
        }
    }

    /// Caches `frame` as latest and resolves every pending waiter with it.
    /// Waiters that were cancelled in the meantime are skipped silently.
    pub fn publish(&self, frame: Bytes) {
        let mut state = self.state.lock().unwrap();
        state.latest = frame.clone();
        for waiter in state.waiters.drain(..) {
            let _ = waiter.send(frame.clone());
        }
    }

    fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        // Dropping the senders fails the pending waiters.
        state.waiters.clear();
    }

    #[cfg(test)]
    pub(crate) fn waiter_count(&self) -> usize {
        self.state.lock().unwrap().waiters.len()
    }

    /// Capture loop: pulls frames from the source on the blocking pool and
    /// broadcasts each one. Closes the hub when the source ends or fails,
    /// which shuts the whole pipeline down.
    pub async fn run<S: FrameSource>(&self, source: S) {
        let mut source = source;
        loop {
            let pulled = task::spawn_blocking(move || {
                let result = source.pull();
                (source, result)
            })
            .await;

            let (returned, result) = match pulled {
                Ok(v) => v,
                Err(e) => {
                    error!(error = %e, "frame pull worker panicked");
                    break;
                }
            };
            source = returned;

            match result {
                Ok(Some(frame)) => {
                    debug!(bytes = frame.len(), "broadcasting frame");
                    self.publish(frame);
                }
                Ok(None) => {
                    info!("frame source exhausted");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "frame source failed");
                    break;
                }
            }
        }
        self.close();
    }
}

impl Default for FrameHub {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("frame stream closed")]
pub struct StreamClosed;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct ScriptedSource(std::vec::IntoIter<Bytes>);

    impl FrameSource for ScriptedSource {
        fn pull(&mut self) -> Result<Option<Bytes>, crate::source::SourceError> {
            Ok(self.0.next())
        }
    }

    #[tokio::test]
    async fn latest_is_empty_before_first_frame() {
        let hub = FrameHub::new();
        assert!(hub.latest().is_empty());
        hub.publish(Bytes::from_static(b"one"));
        assert_eq!(hub.latest().as_ref(), b"one");
    }

    #[tokio::test]
    async fn every_registered_waiter_gets_the_frame_exactly_once() {
        let hub = FrameHub::new();
        let first = hub.next();
        let second = hub.next();
        hub.publish(Bytes::from_static(b"f1"));

        assert_eq!(first.await.unwrap().as_ref(), b"f1");
        assert_eq!(second.await.unwrap().as_ref(), b"f1");

        // Waiters are one-shot: a new frame only reaches re-registered ones.
        let third = hub.next();
        hub.publish(Bytes::from_static(b"f2"));
        assert_eq!(third.await.unwrap().as_ref(), b"f2");
        assert_eq!(hub.waiter_count(), 0);
    }

    #[tokio::test]
    async fn cancelled_waiter_is_skipped_silently() {
        let hub = FrameHub::new();
        let kept = hub.next();
        let cancelled = hub.next();
        drop(cancelled);

        hub.publish(Bytes::from_static(b"frame"));
        assert_eq!(kept.await.unwrap().as_ref(), b"frame");
    }

    #[tokio::test]
    async fn close_fails_pending_and_future_waiters() {
        let hub = FrameHub::new();
        let pending = hub.next();
        hub.close();

        assert_eq!(pending.await, Err(StreamClosed));
        assert_eq!(hub.next().await, Err(StreamClosed));
    }

    #[tokio::test]
    async fn run_broadcasts_all_frames_then_closes() {
        let hub = Arc::new(FrameHub::new());
        let frames = vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")];
        let source = ScriptedSource(frames.into_iter());

        let waiter = hub.next();
        hub.run(source).await;

        // The first broadcast resolved the early waiter; afterwards the hub
        // is closed and the last frame stays cached.
        assert_eq!(waiter.await.unwrap().as_ref(), b"a");
        assert_eq!(hub.latest().as_ref(), b"b");
        assert_eq!(hub.next().await, Err(StreamClosed));
    }
}
