use serde::Serialize;

/// Axis-aligned bounding box of one detected motion region, in pixels.
///
/// Serializes as a `[x, y, w, h]` tuple, which is the shape the motion
/// WebSocket feed emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(into = "[u32; 4]")]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl From<Rect> for [u32; 4] {
    fn from(r: Rect) -> Self {
        [r.x, r.y, r.w, r.h]
    }
}

/// One entry of the save history: when a frame was persisted and whether the
/// detector reported motion at that moment.
///
/// Serializes as a `[timestamp_ms, in_motion]` pair for the history feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(into = "(i64, bool)")]
pub struct HistoryRecord {
    pub timestamp_ms: i64,
    pub in_motion: bool,
}

impl From<HistoryRecord> for (i64, bool) {
    fn from(r: HistoryRecord) -> Self {
        (r.timestamp_ms, r.in_motion)
    }
}
