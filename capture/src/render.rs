//! Timelapse rendering: a single-flight background job.
//!
//! `start` selects and orders the frames, flips the job to `running` and
//! hands the work to a dedicated thread.  The encoder writes to a `.part`
//! file which is renamed over the final output only on success.

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use lapse_common::config::Config;
use lapse_common::protocol::{local_stamp, RenderRequest, RenderStarted, RenderState, RenderStatus};
use lapse_common::snapshot::{self, SnapshotFile};

const PRESETS: [&str; 9] = [
    "ultrafast",
    "superfast",
    "veryfast",
    "faster",
    "fast",
    "medium",
    "slow",
    "slower",
    "veryslow",
];

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("A timelapse is already being rendered")]
    Busy,
    #[error("No snapshots in selected range")]
    NoFrames,
    #[error("Invalid request: {0}")]
    InvalidRequest(&'static str),
    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),
    #[error("Timelapse not found")]
    OutputNotFound,
    #[error("Encoder failed: {0}")]
    Encoder(String),
    #[error("File error: {0}")]
    Io(#[from] std::io::Error),
}

impl RenderError {
    /// Short code for API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Busy => "timelapse_running",
            Self::NoFrames => "no_items",
            Self::InvalidRequest(code) => *code,
            Self::SnapshotNotFound(_) | Self::OutputNotFound => "not_found",
            Self::Encoder(_) => "encoder_failed",
            Self::Io(_) => "io_error",
        }
    }
}

/// Validated encoder settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeSettings {
    pub fps: u32,
    pub crf: u32,
    pub preset: String,
    /// `scale=W:H` filter, `-1` keeps the aspect ratio.
    pub scale: Option<String>,
}

/// Everything an [`Encoder`] needs for one run.
#[derive(Debug, Clone)]
pub struct EncodeJob {
    /// Frames in playback order.
    pub frames: Vec<PathBuf>,
    /// Temporary output path; renamed by the caller on success.
    pub output: PathBuf,
    pub settings: EncodeSettings,
}

/// Turns an ordered frame list into a video file.
pub trait Encoder: Send + Sync {
    /// Encode `job`, calling `on_frame` with the number of frames consumed
    /// so far.
    fn encode(&self, job: &EncodeJob, on_frame: &mut dyn FnMut(u64)) -> Result<(), RenderError>;
}

pub struct RenderManager {
    job: Mutex<RenderStatus>,
    encoder: Arc<dyn Encoder>,
}

impl RenderManager {
    pub fn new(encoder: Arc<dyn Encoder>) -> Arc<Self> {
        Arc::new(RenderManager {
            job: Mutex::new(RenderStatus::default()),
            encoder,
        })
    }

    /// Current job plus whether a finished output exists on disk.
    pub fn status(&self, cfg: &Config) -> RenderStatus {
        let mut status = self.lock().clone();
        let output = cfg.timelapse_dir().join(output_name(cfg));
        status.has_output = output.is_file();
        if status.has_output && status.output.is_none() {
            status.output = Some(output_name(cfg));
        }
        status
    }

    /// Start a render.  Rejected with [`RenderError::Busy`] while one runs;
    /// the running job is left untouched.
    pub fn start(self: &Arc<Self>, cfg: &Config, req: &RenderRequest) -> Result<RenderStarted, RenderError> {
        if self.lock().state == RenderState::Running {
            return Err(RenderError::Busy);
        }

        let settings = validate(req)?;
        let frames = select_frames(&cfg.snapshot_dir(), req)?;
        let output = output_name(cfg);
        let now = local_stamp(&Utc::now().with_timezone(&cfg.timezone));

        {
            let mut job = self.lock();
            if job.state == RenderState::Running {
                return Err(RenderError::Busy);
            }
            if frames.is_empty() {
                warn!("Timelapse requested for an empty range");
                *job = RenderStatus {
                    state: RenderState::Error,
                    message: Some(RenderError::NoFrames.to_string()),
                    started_at: Some(now.clone()),
                    finished_at: Some(now),
                    ..RenderStatus::default()
                };
                return Err(RenderError::NoFrames);
            }
            *job = RenderStatus {
                state: RenderState::Running,
                count: frames.len() as u64,
                output: Some(output.clone()),
                message: Some("running".into()),
                started_at: Some(now),
                ..RenderStatus::default()
            };
        }

        let count = frames.len();
        info!("Rendering {count} frames into {output}");

        let dir = cfg.timelapse_dir();
        let job = EncodeJob {
            frames: frames.into_iter().map(|f| f.path).collect(),
            output: dir.join(format!("{output}.part")),
            settings,
        };
        let final_path = dir.join(&output);
        let tz = cfg.timezone;
        let manager = Arc::clone(self);

        let spawned = std::thread::Builder::new()
            .name("timelapse".into())
            .spawn(move || {
                let result = manager.run(&job, &final_path);
                let finished = local_stamp(&Utc::now().with_timezone(&tz));
                manager.finish(result, finished);
            });
        if let Err(e) = spawned {
            error!("Cannot spawn render thread: {e}");
            let finished = local_stamp(&Utc::now().with_timezone(&cfg.timezone));
            self.finish(Err(RenderError::Io(e)), finished);
            return Err(RenderError::Encoder("cannot start render".into()));
        }

        Ok(RenderStarted {
            ok: true,
            output,
            count,
        })
    }

    /// Remove a finished output and clear the output fields of the job.
    pub fn delete_output(&self, cfg: &Config, name: &str) -> Result<(), RenderError> {
        if !is_output_name(name) {
            return Err(RenderError::OutputNotFound);
        }
        let mut job = self.lock();
        if job.state == RenderState::Running && job.output.as_deref() == Some(name) {
            return Err(RenderError::Busy);
        }
        let path = cfg.timelapse_dir().join(name);
        if !path.is_file() {
            return Err(RenderError::OutputNotFound);
        }
        std::fs::remove_file(&path)?;
        info!("Deleted timelapse {name}");

        if job.state != RenderState::Running {
            job.output = None;
            job.progress = 0;
            job.frame = 0;
            job.count = 0;
        }
        Ok(())
    }

    fn run(&self, job: &EncodeJob, final_path: &Path) -> Result<(), RenderError> {
        if let Some(dir) = job.output.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let count = job.frames.len() as u64;
        let result = self
            .encoder
            .encode(job, &mut |frame| advance(&mut self.lock(), frame, count))
            .and_then(|()| std::fs::rename(&job.output, final_path).map_err(RenderError::from));

        if result.is_err() {
            let _ = std::fs::remove_file(&job.output);
        }
        result
    }

    fn finish(&self, result: Result<(), RenderError>, finished_at: String) {
        let mut job = self.lock();
        match result {
            Ok(()) => {
                info!("Timelapse created: {}", job.output.as_deref().unwrap_or("?"));
                job.state = RenderState::Done;
                job.progress = 100;
                job.frame = job.count;
                job.message = Some("done".into());
            }
            Err(e) => {
                error!("Timelapse failed: {e}");
                job.state = RenderState::Error;
                job.message = Some(e.to_string());
            }
        }
        job.finished_at = Some(finished_at);
    }

    fn lock(&self) -> MutexGuard<'_, RenderStatus> {
        self.job.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Record encoder progress.  Never moves backwards.
fn advance(job: &mut RenderStatus, frame: u64, count: u64) {
    if job.state != RenderState::Running {
        return;
    }
    job.frame = job.frame.max(frame.min(count));
    let percent = if count > 0 { (job.frame * 100 / count).min(100) } else { 0 };
    job.progress = job.progress.max(percent as u8);
}

fn validate(req: &RenderRequest) -> Result<EncodeSettings, RenderError> {
    if !(1..=120).contains(&req.fps) {
        return Err(RenderError::InvalidRequest("invalid_fps"));
    }
    if req.crf > 51 {
        return Err(RenderError::InvalidRequest("invalid_crf"));
    }
    let preset = req.preset.trim().to_lowercase();
    let preset = if PRESETS.contains(&preset.as_str()) {
        preset
    } else {
        "medium".to_string()
    };

    let scale = match (req.width, req.height) {
        (None, None) => None,
        (w, h) => {
            let w = w.unwrap_or(-1);
            let h = h.unwrap_or(-1);
            if (w != -1 && w < 1) || (h != -1 && h < 1) {
                return Err(RenderError::InvalidRequest("invalid_scale"));
            }
            Some(format!("scale={w}:{h}"))
        }
    };

    Ok(EncodeSettings {
        fps: req.fps,
        crf: req.crf,
        preset,
        scale,
    })
}

/// Frames of the snapshot area inside the requested bounds, render-ordered.
fn select_frames(dir: &Path, req: &RenderRequest) -> Result<Vec<SnapshotFile>, RenderError> {
    let mut files = snapshot::list_snapshots(dir).map_err(|e| {
        error!("Cannot list snapshots: {e:#}");
        RenderError::Io(std::io::Error::other("cannot list snapshots"))
    })?;

    let lookup = |name: &Option<String>| -> Result<Option<SystemTime>, RenderError> {
        let Some(name) = name.as_deref().map(str::trim).filter(|n| !n.is_empty()) else {
            return Ok(None);
        };
        if !snapshot::is_safe_image_name(name) {
            return Err(RenderError::SnapshotNotFound(name.to_string()));
        }
        files
            .iter()
            .find(|f| f.name == name)
            .map(|f| Some(f.modified))
            .ok_or_else(|| RenderError::SnapshotNotFound(name.to_string()))
    };
    let instant = |value: &Option<String>| -> Result<Option<SystemTime>, RenderError> {
        match value.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
            None => Ok(None),
            Some(v) => DateTime::parse_from_rfc3339(v)
                .map(|t| Some(SystemTime::from(t)))
                .map_err(|_| RenderError::InvalidRequest("invalid_range")),
        }
    };

    let low = lookup(&req.start)?.or(instant(&req.from)?);
    let high = lookup(&req.end)?.or(instant(&req.to)?);
    if let (Some(low), Some(high)) = (low, high) {
        if low > high {
            return Err(RenderError::InvalidRequest("start_after_end"));
        }
    }

    snapshot::retain_between(&mut files, low, high);
    snapshot::order_for_render(&mut files);
    Ok(files)
}

fn output_name(cfg: &Config) -> String {
    format!("timelapse_{}.mp4", cfg.instance_slug())
}

/// Names a client may use to address a rendered video.
pub fn is_output_name(name: &str) -> bool {
    name.starts_with("timelapse_")
        && name.to_lowercase().ends_with(".mp4")
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains("..")
}

// ── ffmpeg ───────────────────────────────────────────────────────────────

/// [`Encoder`] that shells out to ffmpeg with the concat demuxer.
pub struct FfmpegEncoder {
    bin: String,
}

impl FfmpegEncoder {
    pub fn new(bin: impl Into<String>) -> Self {
        FfmpegEncoder { bin: bin.into() }
    }
}

impl Encoder for FfmpegEncoder {
    fn encode(&self, job: &EncodeJob, on_frame: &mut dyn FnMut(u64)) -> Result<(), RenderError> {
        let list_path = job.output.with_extension("txt");
        let list: String = job.frames.iter().map(|p| concat_line(p) + "\n").collect();
        std::fs::write(&list_path, list)?;

        let result = self.run_ffmpeg(job, &list_path, on_frame);
        let _ = std::fs::remove_file(&list_path);
        result
    }
}

impl FfmpegEncoder {
    fn run_ffmpeg(
        &self,
        job: &EncodeJob,
        list_path: &Path,
        on_frame: &mut dyn FnMut(u64),
    ) -> Result<(), RenderError> {
        let args = ffmpeg_args(job, list_path);
        debug!("Spawning: {} {}", self.bin, args.join(" "));

        let mut child = Command::new(&self.bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                error!("Failed to spawn {}: {e}", self.bin);
                RenderError::Encoder(format!("cannot start {}", self.bin))
            })?;

        // Drain stderr in a background thread so the pipe never fills up
        // and blocks ffmpeg.
        let stderr_thread = child.stderr.take().and_then(|stderr| {
            std::thread::Builder::new()
                .name("ffmpeg-stderr".into())
                .spawn(move || {
                    let reader = BufReader::new(stderr);
                    for line in reader.lines() {
                        match line {
                            Ok(l) if l.trim().is_empty() => {}
                            Ok(l) => warn!("[ffmpeg] {}", l.trim()),
                            Err(_) => break,
                        }
                    }
                    debug!("ffmpeg stderr stream ended");
                })
                .ok()
        });

        if let Some(stdout) = child.stdout.take() {
            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else { break };
                if let Some(frame) = parse_progress_frame(&line) {
                    on_frame(frame);
                }
            }
        }

        let status = child.wait()?;
        if let Some(t) = stderr_thread {
            let _ = t.join();
        }
        if !status.success() {
            return Err(RenderError::Encoder(format!("ffmpeg exited with {status}")));
        }
        Ok(())
    }
}

fn ffmpeg_args(job: &EncodeJob, list_path: &Path) -> Vec<String> {
    let s = &job.settings;
    let mut args: Vec<String> = [
        "-hide_banner",
        "-loglevel",
        "error",
        "-nostdin",
        "-y",
        "-f",
        "concat",
        "-safe",
        "0",
        "-i",
    ]
    .iter()
    .map(|a| a.to_string())
    .collect();
    args.push(list_path.display().to_string());
    args.extend([
        "-r".into(),
        s.fps.to_string(),
        "-c:v".into(),
        "libx264".into(),
        "-pix_fmt".into(),
        "yuv420p".into(),
        "-crf".into(),
        s.crf.to_string(),
        "-preset".into(),
        s.preset.clone(),
    ]);
    if let Some(scale) = &s.scale {
        args.push("-vf".into());
        args.push(scale.clone());
    }
    args.extend([
        "-progress".into(),
        "pipe:1".into(),
        "-nostats".into(),
        "-f".into(),
        "mp4".into(),
    ]);
    args.push(job.output.display().to_string());
    args
}

/// One concat demuxer entry with single quotes escaped.
fn concat_line(path: &Path) -> String {
    format!("file '{}'", path.display().to_string().replace('\'', "'\\''"))
}

fn parse_progress_frame(line: &str) -> Option<u64> {
    let (key, value) = line.trim().split_once('=')?;
    if key.trim() != "frame" {
        return None;
    }
    value.trim().parse().ok()
}
