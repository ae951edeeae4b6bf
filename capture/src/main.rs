//! CaptureLapse – periodic IP-camera snapshots and timelapse rendering.
//!
//! This binary:
//! 1. Reads configuration from `capturelapse.conf`
//! 2. Runs the capture loop and the camera health probe
//! 3. Watches the config file and applies edits without a restart
//! 4. Runs an axum HTTP server with status, live events and rendering.

mod camera;
mod digest;
mod events;
mod gallery;
mod live_config;
mod render;
mod scheduler;
mod server;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info, warn};

use camera::{Camera, HttpCamera};
use events::EventBus;
use live_config::LiveConfig;
use render::{FfmpegEncoder, RenderManager};
use scheduler::CaptureLoop;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // ── load config ──────────────────────────────────────────────────
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| lapse_common::config::Config::default_path().to_string());
    let config_path = PathBuf::from(config_path);
    let config = lapse_common::config::load(&config_path).context("Config load failed")?;

    info!(
        "CaptureLapse starting (listen={}, storage={}, interval={}s)",
        config.listen_addr,
        config.storage_dir.display(),
        config.interval_secs
    );
    if config.cam_url.is_empty() {
        warn!("CAM_URL is not set; snapshots will fail until it is configured");
    }

    for dir in [config.snapshot_dir(), config.thumbs_dir(), config.timelapse_dir()] {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Cannot create {}", dir.display()))?;
    }

    // ── ctrl-c ───────────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    {
        let shutdown_tx = Arc::clone(&shutdown_tx);
        ctrlc::set_handler(move || {
            info!("Shutdown signal received");
            shutdown_tx.send_replace(true);
        })
        .context("Cannot set Ctrl-C handler")?;
    }

    // ── scheduler ────────────────────────────────────────────────────
    let listen_addr = config.listen_addr.clone();
    let ffmpeg_bin = config.ffmpeg_bin.clone();
    let bus = EventBus::new(config.event_queue_capacity);
    let live = LiveConfig::new(config, Some(config_path));
    let camera: Arc<dyn Camera> = Arc::new(HttpCamera::new());

    let (capture_loop, scheduler) = CaptureLoop::new(live.clone(), Arc::clone(&camera), Arc::clone(&bus));
    let loop_handle = tokio::spawn(capture_loop.run(shutdown_rx.clone()));
    let probe_handle = tokio::spawn(scheduler::run_health_probe(
        live.clone(),
        camera,
        scheduler.clone(),
        shutdown_rx.clone(),
    ));

    // Dropping the watcher stops it, so it lives until main returns.
    let _watcher = match live_config::watch_file(&live, scheduler.clone()) {
        Ok(watcher) => watcher,
        Err(e) => {
            warn!("Config hot reload disabled: {e:#}");
            None
        }
    };

    // ── start HTTP server ────────────────────────────────────────────
    let state = server::AppState {
        scheduler,
        config: live,
        bus,
        render: RenderManager::new(Arc::new(FfmpegEncoder::new(ffmpeg_bin))),
        start_time: Instant::now(),
    };
    if let Err(e) = server::run(state, &listen_addr, shutdown_rx).await {
        error!("HTTP server error: {e:#}");
        shutdown_tx.send_replace(true);
    }

    let _ = loop_handle.await;
    let _ = probe_handle.await;
    info!("CaptureLapse stopped");

    Ok(())
}
