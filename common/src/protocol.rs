//! HTTP and SSE payload types exposed by the capture server.

use chrono::{DateTime, SecondsFormat, TimeZone};
use serde::{Deserialize, Serialize};

/// Most recent snapshot-fetch failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraErrorInfo {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Ok,
    Error,
}

/// Result of the periodic reachability probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraHealthInfo {
    pub status: HealthStatus,
    pub code: String,
    pub message: String,
    /// `YYYY-MM-DD HH:MM:SS` in the configured timezone.
    pub checked_at: String,
}

/// Coarse scheduler state shown on the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerStatus {
    Running,
    Paused,
    WaitingWindow,
}

/// Value of the `status` field of a `status` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusEventKind {
    Running,
    Paused,
    WaitingWindow,
    ConfigReloaded,
}

impl From<SchedulerStatus> for StatusEventKind {
    fn from(s: SchedulerStatus) -> Self {
        match s {
            SchedulerStatus::Running => Self::Running,
            SchedulerStatus::Paused => Self::Paused,
            SchedulerStatus::WaitingWindow => Self::WaitingWindow,
        }
    }
}

/// Live update pushed over `/events`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Snapshot {
        filename: String,
        /// `HH:MM:SS`
        timestamp: String,
        timestamp_iso: String,
    },
    Status {
        status: StatusEventKind,
    },
    NextSnapshot {
        next_snapshot_iso: Option<String>,
    },
    CameraError {
        code: String,
        message: String,
    },
    CameraHealth {
        status: HealthStatus,
        code: String,
        message: String,
        checked_at: String,
    },
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Snapshot { .. } => "snapshot",
            Self::Status { .. } => "status",
            Self::NextSnapshot { .. } => "next_snapshot",
            Self::CameraError { .. } => "camera_error",
            Self::CameraHealth { .. } => "camera_health",
        }
    }
}

impl From<&CameraErrorInfo> for Event {
    fn from(e: &CameraErrorInfo) -> Self {
        Event::CameraError {
            code: e.code.clone(),
            message: e.message.clone(),
        }
    }
}

impl From<&CameraHealthInfo> for Event {
    fn from(h: &CameraHealthInfo) -> Self {
        Event::CameraHealth {
            status: h.status,
            code: h.code.clone(),
            message: h.message.clone(),
            checked_at: h.checked_at.clone(),
        }
    }
}

/// `GET /status` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Current time, `HH:MM:SS`.
    pub time: String,
    pub count: u64,
    pub last_snapshot: Option<String>,
    pub last_snapshot_iso: Option<String>,
    /// Name of the newest snapshot, servable from `/pictures/{name}`.
    pub last_filename: Option<String>,
    pub next_snapshot_iso: Option<String>,
    pub sunrise: String,
    pub sunset: String,
    pub paused: bool,
    pub active: bool,
    pub status: SchedulerStatus,
    pub camera_error: Option<CameraErrorInfo>,
    pub camera_health: Option<CameraHealthInfo>,
}

/// `GET /api/health` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub instance: String,
    pub event_subscribers: usize,
}

// ── gallery ──────────────────────────────────────────────────────────────

/// `POST /gallery/range-count` and `POST /gallery/delete-range` body.
///
/// Both are snapshot file names; their modification times bound the range
/// in either order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeRequest {
    #[serde(default)]
    pub start: String,
    #[serde(default)]
    pub end: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeCount {
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeDeleted {
    /// False when at least one file could not be removed.
    pub ok: bool,
    pub deleted: usize,
    pub failed: usize,
}

// ── render ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RenderState {
    #[default]
    Idle,
    Running,
    Done,
    Error,
}

/// `GET /timelapse/status` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RenderStatus {
    pub state: RenderState,
    /// 0–100, never decreasing while running.
    pub progress: u8,
    pub frame: u64,
    pub count: u64,
    pub output: Option<String>,
    pub message: Option<String>,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    #[serde(default)]
    pub has_output: bool,
}

/// `POST /timelapse` body.
///
/// The range is given either by two snapshot file names (`start`, `end`)
/// whose modification times bound it, or by RFC 3339 instants (`from`,
/// `to`).  Without any bound every snapshot is used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderRequest {
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default = "default_crf")]
    pub crf: u32,
    #[serde(default = "default_preset")]
    pub preset: String,
    #[serde(default)]
    pub width: Option<i32>,
    #[serde(default)]
    pub height: Option<i32>,
}

impl Default for RenderRequest {
    fn default() -> Self {
        RenderRequest {
            start: None,
            end: None,
            from: None,
            to: None,
            fps: default_fps(),
            crf: default_crf(),
            preset: default_preset(),
            width: None,
            height: None,
        }
    }
}

fn default_fps() -> u32 {
    25
}

fn default_crf() -> u32 {
    23
}

fn default_preset() -> String {
    "medium".into()
}

/// `POST /timelapse` success response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderStarted {
    pub ok: bool,
    pub output: String,
    pub count: usize,
}

// ── formatting helpers ───────────────────────────────────────────────────

/// RFC 3339 with whole seconds and numeric offset.
pub fn iso_seconds<Tz: TimeZone>(t: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    t.to_rfc3339_opts(SecondsFormat::Secs, false)
}

/// `YYYY-MM-DD HH:MM:SS`
pub fn local_stamp<Tz: TimeZone>(t: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    t.format("%Y-%m-%d %H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::Europe::Berlin;

    #[test]
    fn test_event_wire_format() {
        let e = Event::Snapshot {
            filename: "snapshot_20240603_090000.jpg".into(),
            timestamp: "09:00:00".into(),
            timestamp_iso: "2024-06-03T09:00:00+02:00".into(),
        };
        let v: serde_json::Value = serde_json::to_value(&e).unwrap();
        assert_eq!(v["type"], "snapshot");
        assert_eq!(v["filename"], "snapshot_20240603_090000.jpg");

        let s = Event::Status { status: StatusEventKind::ConfigReloaded };
        assert_eq!(
            serde_json::to_string(&s).unwrap(),
            r#"{"type":"status","status":"config_reloaded"}"#
        );

        let n = Event::NextSnapshot { next_snapshot_iso: None };
        assert_eq!(
            serde_json::to_string(&n).unwrap(),
            r#"{"type":"next_snapshot","next_snapshot_iso":null}"#
        );
        assert_eq!(n.kind(), "next_snapshot");
    }

    #[test]
    fn test_health_event_fields() {
        let h = CameraHealthInfo {
            status: HealthStatus::Error,
            code: "timeout".into(),
            message: "Camera did not respond in time".into(),
            checked_at: "2024-06-03 09:00:00".into(),
        };
        let v = serde_json::to_value(Event::from(&h)).unwrap();
        assert_eq!(v["type"], "camera_health");
        assert_eq!(v["status"], "error");
        assert_eq!(v["code"], "timeout");
    }

    #[test]
    fn test_render_request_defaults() {
        let r: RenderRequest = serde_json::from_str(r#"{"start":"a.jpg","end":"b.jpg"}"#).unwrap();
        assert_eq!(r.fps, 25);
        assert_eq!(r.crf, 23);
        assert_eq!(r.preset, "medium");
        assert!(r.from.is_none());
    }

    #[test]
    fn test_time_formats() {
        let t = Berlin.with_ymd_and_hms(2024, 6, 3, 9, 1, 0).unwrap();
        assert_eq!(iso_seconds(&t), "2024-06-03T09:01:00+02:00");
        assert_eq!(local_stamp(&t), "2024-06-03 09:01:00");
    }
}
