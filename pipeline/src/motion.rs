use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task;
use tracing::{debug, error, warn};

use petcam_common::config::MotionConfig;
use petcam_common::types::Rect;

use crate::broadcast::FrameHub;
use crate::subscribe::{SubscriberSet, Token};
use crate::vision::{self, BackgroundModel, Tuning};

/// Classifies each broadcast frame as motion / no-motion against a rolling
/// background model and fans the bounding boxes out to subscribers.
pub struct MotionDetector {
    hub: Arc<FrameHub>,
    tuning: Tuning,
    interval: Duration,
    in_motion: AtomicBool,
    subscribers: Mutex<SubscriberSet<Vec<Rect>>>,
}

impl MotionDetector {
    pub fn new(hub: Arc<FrameHub>, config: &MotionConfig) -> Self {
        Self {
            hub,
            tuning: Tuning::from(config),
            interval: Duration::from_secs(config.detect_interval_secs),
            in_motion: AtomicBool::new(false),
            subscribers: Mutex::new(SubscriberSet::new()),
        }
    }

    /// Latest classification: `true` while the most recently processed frame
    /// contained at least one motion region. Pollable without subscribing.
    pub fn in_motion(&self) -> bool {
        self.in_motion.load(Ordering::Relaxed)
    }

    /// Register for per-frame motion results (one `Vec<Rect>` per pass, empty
    /// when the scene is still).
    pub fn subscribe(&self) -> (Token, mpsc::UnboundedReceiver<Vec<Rect>>) {
        self.subscribers.lock().unwrap().subscribe()
    }

    pub fn unsubscribe(&self, token: Token) {
        self.subscribers.lock().unwrap().unsubscribe(token);
    }

    /// Detection loop. Consumes frames until the hub closes. The image math
    /// runs on the blocking pool; the model travels in and out of the worker
    /// so this loop keeps exclusive ownership between frames.
    pub async fn run(&self) {
        let mut model: Option<BackgroundModel> = None;
        loop {
            let Ok(frame) = self.hub.next().await else {
                debug!("frame stream closed, stopping motion detection");
                break;
            };

            let tuning = self.tuning;
            let worker = task::spawn_blocking(move || {
                let mut model = model;
                let result = vision::process(&mut model, &frame, &tuning);
                (model, result)
            });

            match worker.await {
                Ok((returned, Ok(boxes))) => {
                    model = returned;
                    self.in_motion.store(!boxes.is_empty(), Ordering::Relaxed);
                    if !boxes.is_empty() {
                        debug!(regions = boxes.len(), "motion detected");
                    }
                    self.subscribers.lock().unwrap().publish(&boxes);
                }
                Ok((returned, Err(e))) => {
                    model = returned;
                    warn!(error = %e, "undecodable frame, skipping");
                }
                Err(e) => {
                    error!(error = %e, "detection worker panicked, resetting model");
                    model = None;
                }
            }

            tokio::time::sleep(self.interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use image::{GrayImage, Luma};
    use std::io::Cursor;
    use std::time::Duration;
    use tokio::time::timeout;

    fn jpeg(img: GrayImage) -> Bytes {
        let mut data = Vec::new();
        image::DynamicImage::ImageLuma8(img)
            .write_to(&mut Cursor::new(&mut data), image::ImageFormat::Jpeg)
            .unwrap();
        Bytes::from(data)
    }

    fn config() -> MotionConfig {
        MotionConfig {
            detect_interval_secs: 0,
            // Blur off and a low floor keep the synthetic scenes crisp.
            blur_sigma: 0.0,
            min_area: 100,
            ..MotionConfig::default()
        }
    }

    async fn wait_for_waiter(hub: &FrameHub) {
        timeout(Duration::from_secs(5), async {
            while hub.waiter_count() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("detector loop never registered a waiter");
    }

    async fn publish_and_recv(
        hub: &FrameHub,
        frame: &Bytes,
        rx: &mut mpsc::UnboundedReceiver<Vec<Rect>>,
    ) -> Vec<Rect> {
        wait_for_waiter(hub).await;
        hub.publish(frame.clone());
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no motion event")
            .expect("motion feed ended")
    }

    #[tokio::test]
    async fn detector_flags_motion_and_notifies_subscribers() {
        let hub = Arc::new(FrameHub::new());
        let detector = Arc::new(MotionDetector::new(hub.clone(), &config()));
        let runner = detector.clone();
        tokio::spawn(async move { runner.run().await });

        let (_token, mut events) = detector.subscribe();

        let dark = jpeg(GrayImage::from_pixel(160, 120, Luma([0])));
        let mut bright_square = GrayImage::from_pixel(160, 120, Luma([0]));
        for y in 40..104 {
            for x in 50..114 {
                bright_square.put_pixel(x, y, Luma([255]));
            }
        }
        let moving = jpeg(bright_square);

        // First frame only establishes the background model.
        let boxes = publish_and_recv(&hub, &dark, &mut events).await;
        assert!(boxes.is_empty());
        assert!(!detector.in_motion());

        // A second still frame keeps the flag down.
        let boxes = publish_and_recv(&hub, &dark, &mut events).await;
        assert!(boxes.is_empty());

        // The appeared square flips the flag and reports a region covering it.
        let boxes = publish_and_recv(&hub, &moving, &mut events).await;
        assert!(!boxes.is_empty());
        assert!(boxes.iter().any(|b| b.x <= 50 && b.x + b.w >= 114));
        assert!(detector.in_motion());
    }

    #[tokio::test]
    async fn undecodable_frame_is_skipped_without_an_event() {
        let hub = Arc::new(FrameHub::new());
        let detector = Arc::new(MotionDetector::new(hub.clone(), &config()));
        let runner = detector.clone();
        tokio::spawn(async move { runner.run().await });

        let (_token, mut events) = detector.subscribe();

        wait_for_waiter(&hub).await;
        hub.publish(Bytes::from_static(b"not a jpeg"));

        // The next good frame produces the next event; the garbage one never
        // reached subscribers.
        let dark = jpeg(GrayImage::from_pixel(32, 24, Luma([0])));
        let boxes = publish_and_recv(&hub, &dark, &mut events).await;
        assert!(boxes.is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let hub = Arc::new(FrameHub::new());
        let detector = MotionDetector::new(hub, &config());
        let (token, mut events) = detector.subscribe();
        detector.unsubscribe(token);
        detector.subscribers.lock().unwrap().publish(&Vec::new());
        assert!(events.recv().await.is_none());
    }
}
