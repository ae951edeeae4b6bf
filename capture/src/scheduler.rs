//! Capture loop: ticks the schedule, fetches snapshots, owns scheduler state.
//!
//! The loop is the only writer of [`SchedulerState`].  It publishes every
//! new state as a whole value through a `watch` channel, so HTTP handlers
//! always read a consistent snapshot.  Pause, resume, snapshot-now, reload
//! and health reports arrive as [`Command`]s and are handled between ticks.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use lapse_common::config::Config;
use lapse_common::protocol::{
    iso_seconds, local_stamp, CameraErrorInfo, CameraHealthInfo, Event, HealthStatus,
    SchedulerStatus, StatusEventKind,
};
use lapse_common::schedule::{self, Decision};
use lapse_common::snapshot;

use crate::camera::{Camera, CameraError};
use crate::events::EventBus;
use crate::live_config::LiveConfig;

const COMMAND_QUEUE: usize = 32;

/// Snapshot of everything the dashboard shows about the capture loop.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerState {
    pub status: SchedulerStatus,
    /// All calendar gates open right now (pause ignored).
    pub active: bool,
    pub last_capture: Option<DateTime<Tz>>,
    pub last_filename: Option<String>,
    pub count: u64,
    pub next_snapshot: Option<DateTime<Tz>>,
    pub camera_error: Option<CameraErrorInfo>,
    pub camera_health: Option<CameraHealthInfo>,
}

pub type SnapshotReply = Result<String, CameraErrorInfo>;

pub enum Command {
    Pause,
    Resume,
    SnapshotNow(oneshot::Sender<SnapshotReply>),
    Reload(oneshot::Sender<Result<bool, String>>),
    Health(Result<(), CameraError>),
    /// Recount the snapshot store after files were removed.
    Rescan(oneshot::Sender<()>),
}

/// Cloneable front door to a running [`CaptureLoop`].
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<Command>,
    state: watch::Receiver<SchedulerState>,
}

impl SchedulerHandle {
    pub fn state(&self) -> SchedulerState {
        self.state.borrow().clone()
    }

    pub async fn pause(&self) -> Result<()> {
        self.send(Command::Pause).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.send(Command::Resume).await
    }

    /// Capture immediately, regardless of the schedule.
    pub async fn snapshot_now(&self) -> Result<SnapshotReply> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::SnapshotNow(tx)).await?;
        Ok(rx.await?)
    }

    /// Re-read the config file.  Returns whether anything changed.
    pub async fn reload(&self) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Reload(tx)).await?;
        match rx.await? {
            Ok(changed) => Ok(changed),
            Err(msg) => bail!(msg),
        }
    }

    pub async fn report_health(&self, result: Result<(), CameraError>) -> Result<()> {
        self.send(Command::Health(result)).await
    }

    /// Refresh count and newest snapshot from disk; returns once applied.
    pub async fn rescan(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Rescan(tx)).await?;
        Ok(rx.await?)
    }

    async fn send(&self, cmd: Command) -> Result<()> {
        if self.tx.send(cmd).await.is_err() {
            bail!("Capture loop is not running");
        }
        Ok(())
    }
}

pub struct CaptureLoop {
    config: LiveConfig,
    camera: Arc<dyn Camera>,
    bus: Arc<EventBus>,
    state: watch::Sender<SchedulerState>,
    commands: Option<mpsc::Receiver<Command>>,
    /// Start of the current interval: the last scheduled attempt.
    anchor: Option<DateTime<Tz>>,
}

impl CaptureLoop {
    pub fn new(config: LiveConfig, camera: Arc<dyn Camera>, bus: Arc<EventBus>) -> (Self, SchedulerHandle) {
        let cfg = config.current();
        let now = now_in(cfg.timezone);

        let stats = snapshot::image_stats(&cfg.snapshot_dir()).unwrap_or_else(|e| {
            warn!("Cannot read snapshot directory: {e:#}");
            Default::default()
        });
        let last_capture = stats
            .latest
            .as_ref()
            .map(|f| DateTime::<Utc>::from(f.modified).with_timezone(&cfg.timezone));
        if let Some(f) = &stats.latest {
            info!("Found {} snapshots, newest {}", stats.count, f.name);
        }

        let (status, active) = status_at(&now, &cfg);
        let initial = SchedulerState {
            status,
            active,
            last_capture,
            last_filename: stats.latest.map(|f| f.name),
            count: stats.count,
            next_snapshot: schedule::next_eligible(&now, &cfg, last_capture.as_ref()),
            camera_error: None,
            camera_health: None,
        };

        let (state_tx, state_rx) = watch::channel(initial);
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);

        let capture_loop = CaptureLoop {
            config,
            camera,
            bus,
            state: state_tx,
            commands: Some(cmd_rx),
            anchor: last_capture,
        };
        let handle = SchedulerHandle {
            tx: cmd_tx,
            state: state_rx,
        };
        (capture_loop, handle)
    }

    /// Drive the loop until `shutdown` flips.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let Some(mut commands) = self.commands.take() else {
            return;
        };
        let mut period = self.config.current().tick_millis;
        let mut ticker = make_ticker(period);
        let mut beat_secs = self.config.current().status_heartbeat_secs;
        let mut heartbeat = make_heartbeat(beat_secs);
        info!("Capture loop started (tick={period}ms)");

        loop {
            let cfg = self.config.current();
            if cfg.tick_millis != period {
                period = cfg.tick_millis;
                ticker = make_ticker(period);
            }
            if cfg.status_heartbeat_secs != beat_secs {
                beat_secs = cfg.status_heartbeat_secs;
                heartbeat = make_heartbeat(beat_secs);
            }

            tokio::select! {
                _ = ticker.tick() => {
                    let now = now_in(self.config.current().timezone);
                    self.tick(now).await;
                }
                _ = next_beat(&mut heartbeat) => {
                    let status = self.state.borrow().status;
                    self.bus.publish(Event::Status { status: status.into() });
                }
                Some(cmd) = commands.recv() => {
                    let now = now_in(self.config.current().timezone);
                    self.handle(cmd, now).await;
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("Capture loop stopped");
    }

    /// One evaluation of the schedule at `now`.
    async fn tick(&mut self, now: DateTime<Tz>) {
        let cfg = self.config.current();
        let decision = schedule::decide(&now, &cfg, self.anchor.as_ref());
        if decision == Decision::Eligible {
            self.anchor = Some(now);
            if let Err(e) = self.capture(&cfg, now).await {
                debug!("Scheduled capture failed: {}", e.code);
            }
        } else {
            debug!("Tick at {}: {decision}", now.format("%H:%M:%S"));
        }
        self.refresh(&cfg, now);
    }

    async fn handle(&mut self, cmd: Command, now: DateTime<Tz>) {
        match cmd {
            Command::Pause => self.set_paused(true, now).await,
            Command::Resume => self.set_paused(false, now).await,
            Command::SnapshotNow(reply) => {
                let cfg = self.config.current();
                let result = self.capture(&cfg, now).await;
                self.refresh(&cfg, now);
                let _ = reply.send(result);
            }
            Command::Reload(reply) => {
                let result = self.reload(now).await;
                let _ = reply.send(result.map_err(|e| format!("{e:#}")));
            }
            Command::Health(result) => self.record_health(result, now),
            Command::Rescan(reply) => {
                self.rescan().await;
                let _ = reply.send(());
            }
        }
    }

    async fn set_paused(&mut self, paused: bool, now: DateTime<Tz>) {
        if let Err(e) = self.config.set_paused(paused).await {
            warn!("Cannot persist pause flag: {e:#}");
        }
        info!("{}", if paused { "Capture paused" } else { "Capture resumed" });
        if !paused {
            self.update(|s| s.camera_error = None);
        }
        let cfg = self.config.current();
        self.refresh(&cfg, now);
    }

    async fn reload(&mut self, now: DateTime<Tz>) -> Result<bool> {
        let changed = self.config.reload().await?;
        if changed {
            info!("Configuration reloaded");
            self.bus.publish(Event::Status {
                status: StatusEventKind::ConfigReloaded,
            });
        }
        let cfg = self.config.current();
        self.refresh(&cfg, now);
        Ok(changed)
    }

    /// Fetch and persist one snapshot.  Failure sets the camera error and
    /// publishes exactly one `camera_error` event.
    async fn capture(&mut self, cfg: &Arc<Config>, now: DateTime<Tz>) -> SnapshotReply {
        let camera = Arc::clone(&self.camera);
        let fetch_cfg = Arc::clone(cfg);
        let fetched = tokio::task::spawn_blocking(move || camera.fetch(&fetch_cfg))
            .await
            .unwrap_or_else(|e| {
                error!("Snapshot task failed: {e}");
                Err(CameraError::Unknown)
            });

        let bytes = match fetched {
            Ok(bytes) => bytes,
            Err(e) => {
                let info = e.info();
                warn!("Snapshot failed: {} ({})", info.message, info.code);
                self.update(|s| s.camera_error = Some(info.clone()));
                self.bus.publish(Event::from(&info));
                return Err(info);
            }
        };

        let dir = cfg.snapshot_dir();
        let saved = tokio::task::spawn_blocking(move || snapshot::write_snapshot(&dir, &now, &bytes))
            .await
            .map_err(anyhow::Error::from)
            .and_then(|r| r);
        let file = match saved {
            Ok(file) => file,
            Err(e) => {
                error!("Cannot save snapshot: {e:#}");
                return Err(CameraErrorInfo {
                    code: "storage_error".into(),
                    message: "Snapshot could not be saved".into(),
                });
            }
        };

        info!("Snapshot saved: {} ({} bytes)", file.name, file.size);
        let name = file.name.clone();
        self.update(|s| {
            s.last_capture = Some(now);
            s.last_filename = Some(name.clone());
            s.count += 1;
            s.camera_error = None;
        });
        self.bus.publish(Event::Snapshot {
            filename: file.name.clone(),
            timestamp: now.format("%H:%M:%S").to_string(),
            timestamp_iso: iso_seconds(&now),
        });
        Ok(file.name)
    }

    fn record_health(&mut self, result: Result<(), CameraError>, now: DateTime<Tz>) {
        let health = match &result {
            Ok(()) => CameraHealthInfo {
                status: HealthStatus::Ok,
                code: "ok".into(),
                message: "Camera reachable".into(),
                checked_at: local_stamp(&now),
            },
            Err(e) => CameraHealthInfo {
                status: HealthStatus::Error,
                code: e.code(),
                message: e.to_string(),
                checked_at: local_stamp(&now),
            },
        };
        if let Err(e) = &result {
            debug!("Camera health probe failed: {}", e.code());
        }
        self.update(|s| {
            if result.is_ok() {
                s.camera_error = None;
            }
            s.camera_health = Some(health.clone());
        });
        self.bus.publish(Event::from(&health));
    }

    async fn rescan(&mut self) {
        let cfg = self.config.current();
        let dir = cfg.snapshot_dir();
        let stats = match tokio::task::spawn_blocking(move || snapshot::image_stats(&dir)).await {
            Ok(Ok(stats)) => stats,
            Ok(Err(e)) => {
                warn!("Cannot rescan snapshots: {e:#}");
                return;
            }
            Err(e) => {
                error!("Rescan task failed: {e}");
                return;
            }
        };
        let tz = cfg.timezone;
        debug!("Snapshot store holds {} images", stats.count);
        self.update(|s| {
            s.count = stats.count;
            s.last_capture = stats
                .latest
                .as_ref()
                .map(|f| DateTime::<Utc>::from(f.modified).with_timezone(&tz));
            s.last_filename = stats.latest.map(|f| f.name);
        });
    }

    /// Recompute status, active flag and next snapshot; announce changes.
    fn refresh(&mut self, cfg: &Config, now: DateTime<Tz>) {
        let (status, active) = status_at(&now, cfg);
        let next = schedule::next_eligible(&now, cfg, self.anchor.as_ref());
        let prev = self.state.borrow().clone();

        if prev.status == status && prev.active == active && prev.next_snapshot == next {
            return;
        }
        self.update(|s| {
            s.status = status;
            s.active = active;
            s.next_snapshot = next;
        });
        if prev.status != status {
            info!("Scheduler status: {:?}", status);
            self.bus.publish(Event::Status {
                status: status.into(),
            });
        }
        if prev.next_snapshot != next {
            self.bus.publish(Event::NextSnapshot {
                next_snapshot_iso: next.as_ref().map(iso_seconds),
            });
        }
    }

    /// Replace the published state with a modified copy.
    fn update(&self, f: impl FnOnce(&mut SchedulerState)) {
        let mut next = self.state.borrow().clone();
        f(&mut next);
        self.state.send_replace(next);
    }
}

/// Probe the camera on its own cadence and report to the capture loop.
pub async fn run_health_probe(
    config: LiveConfig,
    camera: Arc<dyn Camera>,
    scheduler: SchedulerHandle,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let cfg = config.current();
        let period = Duration::from_secs(cfg.health_check_secs.max(1));

        let cam = Arc::clone(&camera);
        let result = tokio::task::spawn_blocking(move || cam.probe(&cfg))
            .await
            .unwrap_or(Err(CameraError::Unknown));
        if scheduler.report_health(result).await.is_err() {
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            _ = shutdown.changed() => break,
        }
    }
    debug!("Camera health probe stopped");
}

fn status_at(now: &DateTime<Tz>, cfg: &Config) -> (SchedulerStatus, bool) {
    let active = schedule::calendar_gate(now, cfg) == Decision::Eligible;
    let status = if cfg.paused {
        SchedulerStatus::Paused
    } else if active {
        SchedulerStatus::Running
    } else {
        SchedulerStatus::WaitingWindow
    };
    (status, active)
}

fn now_in(tz: Tz) -> DateTime<Tz> {
    Utc::now().with_timezone(&tz)
}

fn make_heartbeat(secs: u64) -> Option<tokio::time::Interval> {
    (secs > 0).then(|| {
        let mut beat = tokio::time::interval(Duration::from_secs(secs));
        beat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        beat
    })
}

/// Next heartbeat tick; never resolves when disabled.
async fn next_beat(heartbeat: &mut Option<tokio::time::Interval>) {
    match heartbeat {
        Some(beat) => {
            beat.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn make_ticker(millis: u64) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval(Duration::from_millis(millis.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}
