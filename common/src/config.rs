//! Configuration parsing – reads a KEY=VALUE file (`capturelapse.conf`).
//!
//! The file is the only persistent state besides the image store.  The
//! capture server re-reads it on change and writes back a single key
//! (`PAUSED`) when the scheduler is paused or resumed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{NaiveDate, Weekday};
use chrono_tz::Tz;
use tracing::{info, warn};

use crate::schedule::ActiveWindow;

/// How the capture server authenticates against the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthMode {
    #[default]
    None,
    Basic,
    Digest,
}

impl AuthMode {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "basic" => Self::Basic,
            "digest" => Self::Digest,
            _ => Self::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Basic => "basic",
            Self::Digest => "digest",
        }
    }
}

/// Immutable configuration snapshot.
///
/// A reload builds a fresh value; nothing mutates a `Config` that has
/// already been handed out.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    // ── camera ───────────────────────────────────────────────────────
    pub cam_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub auth_mode: AuthMode,

    // ── storage ──────────────────────────────────────────────────────
    pub storage_dir: PathBuf,
    pub instance_name: Option<String>,

    // ── schedule ─────────────────────────────────────────────────────
    pub interval_secs: u64,
    pub active_window: ActiveWindow,
    /// Weekdays on which capture is allowed.  Never empty.
    pub active_days: Vec<Weekday>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub paused: bool,

    // ── location (astral restriction) ────────────────────────────────
    pub use_astral: bool,
    pub latitude: f64,
    pub longitude: f64,
    pub timezone: Tz,

    // ── runtime tuning ───────────────────────────────────────────────
    pub listen_addr: String,
    pub tick_millis: u64,
    pub health_check_secs: u64,
    pub snapshot_timeout_secs: u64,
    pub health_timeout_secs: u64,
    /// Total attempt budget per camera request (first try included).
    pub camera_retries: u32,
    pub ffmpeg_bin: String,
    pub event_queue_capacity: usize,
    pub sse_keepalive_secs: u64,
    /// Period of the repeated `status` event; 0 disables it.
    pub status_heartbeat_secs: u64,
}

pub const ALL_DAYS: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

impl Default for Config {
    fn default() -> Self {
        Config {
            cam_url: String::new(),
            username: None,
            password: None,
            auth_mode: AuthMode::None,
            storage_dir: PathBuf::from("./pictures"),
            instance_name: None,
            interval_secs: 300,
            active_window: ActiveWindow::parse("06:00", "22:00"),
            active_days: ALL_DAYS.to_vec(),
            date_from: None,
            date_to: None,
            paused: false,
            use_astral: false,
            latitude: 52.1676,
            longitude: 10.5479,
            timezone: chrono_tz::Europe::Berlin,
            listen_addr: "0.0.0.0:8000".into(),
            tick_millis: 1000,
            health_check_secs: 60,
            snapshot_timeout_secs: 10,
            health_timeout_secs: 5,
            camera_retries: 3,
            ffmpeg_bin: "ffmpeg".into(),
            event_queue_capacity: 64,
            sse_keepalive_secs: 15,
            status_heartbeat_secs: 10,
        }
    }
}

impl Config {
    /// Default config path.
    pub fn default_path() -> &'static str {
        "/etc/capturelapse/capturelapse.conf"
    }

    /// Flat snapshot area (the storage root itself).
    pub fn snapshot_dir(&self) -> PathBuf {
        self.storage_dir.clone()
    }

    /// Generated thumbnails live here; never a render input.
    pub fn thumbs_dir(&self) -> PathBuf {
        self.storage_dir.join(".thumbs")
    }

    /// Rendered timelapse videos.
    pub fn timelapse_dir(&self) -> PathBuf {
        self.storage_dir.join("timelapse")
    }

    /// File-name safe version of the instance name, used for render outputs.
    pub fn instance_slug(&self) -> String {
        let raw = self
            .instance_name
            .as_deref()
            .unwrap_or("")
            .trim()
            .to_lowercase();
        let cleaned: String = raw
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let cleaned = cleaned.trim_matches(|c| c == '_' || c == '-');
        if cleaned.is_empty() {
            return "capturelapse".into();
        }
        cleaned.chars().take(64).collect()
    }

    /// Whether credentials are configured for the selected auth mode.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.auth_mode, &self.username, &self.password) {
            (AuthMode::None, _, _) => None,
            (_, Some(u), Some(p)) if !u.is_empty() => Some((u.as_str(), p.as_str())),
            _ => None,
        }
    }
}

/// Parse a `KEY=VALUE` configuration file.
///
/// Lines starting with `#` are comments.  Values may be optionally
/// double-quoted.  Unknown keys are silently ignored.  Malformed schedule
/// values fall back to permissive defaults instead of failing the load.
pub fn load(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read config: {}", path.display()))?;

    let config = from_str(&text);
    info!("Loaded config from {}", path.display());
    Ok(config)
}

/// Build a [`Config`] from the text of a config file.
pub fn from_str(text: &str) -> Config {
    let map = parse_conf(text);
    let defaults = Config::default();

    let get = |key: &str| -> Option<String> { map.get(key).cloned().filter(|v| !v.is_empty()) };
    let get_f64 = |key: &str, default: f64| -> f64 {
        get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    };
    let get_u64 = |key: &str, default: u64| -> u64 {
        get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    };
    let get_bool = |key: &str| -> bool {
        get(key)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes"))
            .unwrap_or(false)
    };

    let active_start = get("ACTIVE_START").unwrap_or_else(|| "06:00".into());
    let active_end = get("ACTIVE_END").unwrap_or_else(|| "22:00".into());
    let active_window = ActiveWindow::parse(&active_start, &active_end);

    let timezone = match get("TIMEZONE") {
        Some(name) => name.parse::<Tz>().unwrap_or_else(|_| {
            warn!("Unknown TIMEZONE {name:?}, falling back to UTC");
            Tz::UTC
        }),
        None => defaults.timezone,
    };

    Config {
        cam_url: get("CAM_URL").unwrap_or_default(),
        username: get("CAM_USERNAME"),
        password: get("CAM_PASSWORD"),
        auth_mode: get("CAM_AUTH")
            .map(|v| AuthMode::parse(&v))
            .unwrap_or_default(),

        storage_dir: get("STORAGE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.storage_dir),
        instance_name: get("INSTANCE_NAME"),

        interval_secs: get_u64("INTERVAL_SECONDS", defaults.interval_secs).max(1),
        active_window,
        active_days: get("ACTIVE_DAYS")
            .map(|v| parse_days(&v))
            .unwrap_or(defaults.active_days),
        date_from: get("SCHEDULE_START_DATE").and_then(|v| parse_date("SCHEDULE_START_DATE", &v)),
        date_to: get("SCHEDULE_END_DATE").and_then(|v| parse_date("SCHEDULE_END_DATE", &v)),
        paused: get_bool("PAUSED"),

        use_astral: get_bool("USE_ASTRAL"),
        latitude: get_f64("LATITUDE", defaults.latitude),
        longitude: get_f64("LONGITUDE", defaults.longitude),
        timezone,

        listen_addr: get("LISTEN_ADDR").unwrap_or(defaults.listen_addr),
        tick_millis: get_u64("TICK_MILLIS", defaults.tick_millis).clamp(50, 10_000),
        health_check_secs: get_u64("HEALTH_CHECK_SECONDS", defaults.health_check_secs).max(1),
        snapshot_timeout_secs: get_u64("SNAPSHOT_TIMEOUT_SECONDS", defaults.snapshot_timeout_secs)
            .max(1),
        health_timeout_secs: get_u64("HEALTH_TIMEOUT_SECONDS", defaults.health_timeout_secs).max(1),
        camera_retries: get("CAMERA_RETRIES")
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.camera_retries)
            .max(1),
        ffmpeg_bin: get("FFMPEG_BIN").unwrap_or(defaults.ffmpeg_bin),
        event_queue_capacity: get("EVENT_QUEUE_CAPACITY")
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.event_queue_capacity)
            .max(1),
        sse_keepalive_secs: get_u64("SSE_KEEPALIVE_SECONDS", defaults.sse_keepalive_secs).max(1),
        status_heartbeat_secs: get_u64("STATUS_HEARTBEAT_SECONDS", defaults.status_heartbeat_secs),
    }
}

/// Persist the pause flag, keeping every other line of the file intact.
///
/// Writes to a sibling temp file and renames it over the original.
pub fn save_paused(path: &Path, paused: bool) -> Result<()> {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => {
            return Err(e).with_context(|| format!("Cannot read config: {}", path.display()))
        }
    };

    let value = if paused { "true" } else { "false" };
    let mut replaced = false;
    let mut lines: Vec<String> = text
        .lines()
        .map(|line| {
            let is_paused_key = line
                .split_once('=')
                .map(|(k, _)| k.trim() == "PAUSED")
                .unwrap_or(false);
            if is_paused_key && !line.trim_start().starts_with('#') {
                replaced = true;
                format!("PAUSED={value}")
            } else {
                line.to_string()
            }
        })
        .collect();
    if !replaced {
        lines.push(format!("PAUSED={value}"));
    }

    let mut out = lines.join("\n");
    out.push('\n');

    let tmp = path.with_extension("conf.tmp");
    std::fs::write(&tmp, out).with_context(|| format!("Cannot write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Cannot replace config: {}", path.display()))?;
    Ok(())
}

/// Parse `KEY=VALUE` lines into a map, stripping optional double-quotes.
fn parse_conf(text: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, val)) = line.split_once('=') {
            let key = key.trim();
            let val = val.trim().trim_matches('"');
            map.insert(key.to_string(), val.to_string());
        }
    }
    map
}

/// `Mon,Tue,...` → weekdays.  Unknown names are skipped; an empty result
/// means every day.
fn parse_days(text: &str) -> Vec<Weekday> {
    let mut days: Vec<Weekday> = text
        .split(',')
        .filter_map(|d| d.trim().parse::<Weekday>().ok())
        .collect();
    days.sort_by_key(|d| d.num_days_from_monday());
    days.dedup();
    if days.is_empty() {
        warn!("ACTIVE_DAYS {text:?} names no weekday, capturing on all days");
        return ALL_DAYS.to_vec();
    }
    days
}

fn parse_date(key: &str, text: &str) -> Option<NaiveDate> {
    match NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d") {
        Ok(d) => Some(d),
        Err(_) => {
            warn!("Ignoring malformed {key}={text:?} (expected YYYY-MM-DD)");
            None
        }
    }
}

// ─── tests ───────────────────────────────────────────────────────────────
