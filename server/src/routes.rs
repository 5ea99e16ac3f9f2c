use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path as UrlPath, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::{BufMut, Bytes, BytesMut};
use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use petcam_common::types::HistoryRecord;
use petcam_pipeline::broadcast::FrameHub;
use petcam_pipeline::motion::MotionDetector;
use petcam_pipeline::store::{FrameStore, StoreError};

const BOUNDARY: &str = "jpegboundary";

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<FrameHub>,
    pub motion: Arc<MotionDetector>,
    pub store: Arc<FrameStore>,
}

pub fn router(
    hub: Arc<FrameHub>,
    motion: Arc<MotionDetector>,
    store: Arc<FrameStore>,
    web_root: PathBuf,
) -> Router {
    let state = AppState { hub, motion, store };
    Router::new()
        .route("/vstream.mjpg", get(stream_video))
        .route("/imgs/:filename", get(lookup_frame))
        .route("/motion", get(motion_feed))
        .route("/history", get(history_feed))
        .route_service("/", ServeFile::new(web_root.join("index-video.html")))
        .fallback_service(ServeDir::new(web_root))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// `multipart/x-mixed-replace` framing for one JPEG part.
fn mjpeg_part(frame: &Bytes) -> Bytes {
    let mut part = BytesMut::with_capacity(frame.len() + 96);
    part.put_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
            frame.len()
        )
        .as_bytes(),
    );
    part.put_slice(frame);
    part.put_slice(b"\r\n");
    part.freeze()
}

/// GET /vstream.mjpg: the live view, the cached frame first, then one part
/// per broadcast frame until the client disconnects or the source ends.
async fn stream_video(State(state): State<AppState>) -> Response {
    let first = state.hub.latest();
    let hub = state.hub.clone();

    let parts = stream::once(async move { Ok::<_, Infallible>(mjpeg_part(&first)) }).chain(
        stream::unfold(hub, |hub| async move {
            match hub.next().await {
                Ok(frame) => {
                    let part = mjpeg_part(&frame);
                    Some((Ok(part), hub))
                }
                Err(_) => None,
            }
        }),
    );

    (
        [(
            header::CONTENT_TYPE,
            format!("multipart/x-mixed-replace; boundary={BOUNDARY}"),
        )],
        Body::from_stream(parts),
    )
        .into_response()
}

/// Accepts `<unix-millis>.jpg`.
fn parse_timestamp(filename: &str) -> Option<i64> {
    filename.strip_suffix(".jpg")?.parse().ok()
}

/// GET /imgs/{timestamp}.jpg: nearest persisted frame; 404 for a malformed
/// name or an empty index.
async fn lookup_frame(
    State(state): State<AppState>,
    UrlPath(filename): UrlPath<String>,
) -> Response {
    let Some(timestamp_ms) = parse_timestamp(&filename) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match state.store.get(timestamp_ms).await {
        Ok(data) => ([(header::CONTENT_TYPE, "image/jpeg")], data).into_response(),
        Err(StoreError::NotFound) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            warn!(error = %e, "frame lookup failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// GET /motion: WebSocket feed, one JSON array of `[x, y, w, h]` boxes per
/// detector pass.
async fn motion_feed(State(state): State<AppState>, upgrade: WebSocketUpgrade) -> Response {
    upgrade.on_upgrade(move |socket| run_motion_feed(socket, state))
}

async fn run_motion_feed(mut socket: WebSocket, state: AppState) {
    let (token, mut events) = state.motion.subscribe();
    debug!(token, "motion subscriber connected");

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(boxes) = event else { break };
                let Ok(payload) = serde_json::to_string(&boxes) else { break };
                if socket.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                // Client messages only signal liveness; close or error ends
                // the subscription.
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.motion.unsubscribe(token);
    debug!(token, "motion subscriber disconnected");
}

#[derive(Serialize)]
struct HistoryPayload<'a> {
    now: i64,
    records: &'a [HistoryRecord],
}

async fn send_history(socket: &mut WebSocket, records: &[HistoryRecord]) -> bool {
    let payload = HistoryPayload {
        now: Utc::now().timestamp_millis(),
        records,
    };
    match serde_json::to_string(&payload) {
        Ok(text) => socket.send(Message::Text(text)).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "failed to encode history payload");
            false
        }
    }
}

/// GET /history: WebSocket feed, the full history once, then one record per
/// subsequent save.
async fn history_feed(State(state): State<AppState>, upgrade: WebSocketUpgrade) -> Response {
    upgrade.on_upgrade(move |socket| run_history_feed(socket, state))
}

async fn run_history_feed(mut socket: WebSocket, state: AppState) {
    let (token, backlog, mut events) = state.store.subscribe_with_history().await;
    debug!(token, backlog = backlog.len(), "history subscriber connected");

    if send_history(&mut socket, &backlog).await {
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(record) = event else { break };
                    if !send_history(&mut socket, &[record]).await {
                        break;
                    }
                }
                incoming = socket.recv() => {
                    match incoming {
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                        Some(Ok(_)) => {}
                    }
                }
            }
        }
    }

    state.store.unsubscribe(token).await;
    debug!(token, "history subscriber disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mjpeg_part_frames_the_payload() {
        let part = mjpeg_part(&Bytes::from_static(b"\xFF\xD8jpegdata"));
        let text = String::from_utf8_lossy(&part);
        assert!(text.starts_with("--jpegboundary\r\n"));
        assert!(text.contains("Content-Type: image/jpeg\r\n"));
        assert!(text.contains("Content-Length: 10\r\n\r\n"));
        assert!(part.ends_with(b"\r\n"));
    }

    #[test]
    fn mjpeg_part_of_the_empty_sentinel_is_well_formed() {
        let part = mjpeg_part(&Bytes::new());
        let text = String::from_utf8_lossy(&part);
        assert!(text.contains("Content-Length: 0\r\n\r\n"));
    }

    #[test]
    fn timestamp_parsing_accepts_millis_and_rejects_garbage() {
        assert_eq!(parse_timestamp("1708300000000.jpg"), Some(1708300000000));
        assert_eq!(parse_timestamp("-5.jpg"), Some(-5));
        assert_eq!(parse_timestamp("1708300000000.png"), None);
        assert_eq!(parse_timestamp("latest.jpg"), None);
        assert_eq!(parse_timestamp("12.5.jpg"), None);
        assert_eq!(parse_timestamp(""), None);
    }

    #[test]
    fn history_payload_shape() {
        let records = [HistoryRecord {
            timestamp_ms: 1000,
            in_motion: true,
        }];
        let payload = HistoryPayload {
            now: 2000,
            records: &records,
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert_eq!(json, r#"{"now":2000,"records":[[1000,true]]}"#);
    }
}
