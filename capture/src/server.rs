//! HTTP API: status, live events, scheduler actions, timelapse rendering.
//!
//! Routes:
//!   GET    /status                      → dashboard status snapshot
//!   GET    /events                      → server-sent events
//!   POST   /action/{action}             → pause | resume | snapshot | reload
//!   GET    /timelapse/status            → render job status
//!   POST   /timelapse                   → start a render
//!   GET    /timelapse/download/{name}   → download a rendered video
//!   DELETE /timelapse/{name}            → remove a rendered video
//!   GET    /pictures/{name}             → serve one snapshot
//!   DELETE /pictures/{name}             → remove one snapshot
//!   POST   /gallery/range-count         → snapshots between two names
//!   POST   /gallery/delete-range        → remove snapshots between two names
//!   GET    /api/health                  → liveness

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use chrono::Utc;
use futures_util::stream::{self, Stream};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};

use lapse_common::protocol::{
    iso_seconds, HealthResponse, RangeCount, RangeRequest, RenderRequest, StatusResponse,
};
use lapse_common::{snapshot, sun};

use crate::events::EventBus;
use crate::gallery::{self, GalleryError};
use crate::live_config::LiveConfig;
use crate::render::{self, RenderError, RenderManager};
use crate::scheduler::SchedulerHandle;

/// Shared state for route handlers.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: SchedulerHandle,
    pub config: LiveConfig,
    pub bus: Arc<EventBus>,
    pub render: Arc<RenderManager>,
    pub start_time: Instant,
}

type ApiError = (StatusCode, Json<serde_json::Value>);

fn api_error(status: StatusCode, detail: &str) -> ApiError {
    (status, Json(json!({ "ok": false, "detail": detail })))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/events", get(events))
        .route("/action/{action}", post(action))
        .route("/timelapse", post(start_timelapse))
        .route("/timelapse/status", get(timelapse_status))
        .route("/timelapse/download/{name}", get(download_timelapse))
        .route("/timelapse/{name}", delete(delete_timelapse))
        .route("/pictures/{name}", get(picture).delete(delete_picture))
        .route("/gallery/range-count", post(range_count))
        .route("/gallery/delete-range", post(delete_range))
        .route("/api/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server.  Returns once `shutdown` flips and open
/// connections have drained.
pub async fn run(
    state: AppState,
    listen_addr: &str,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let bus = Arc::clone(&state.bus);
    let app = router(state);

    let listener = TcpListener::bind(listen_addr).await?;
    info!("HTTP server listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
            // SSE streams only end once their subscriptions are gone.
            bus.close_all();
        })
        .await?;

    Ok(())
}

// ── route handlers ───────────────────────────────────────────────────────

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let cfg = state.config.current();
    let s = state.scheduler.state();
    let now = Utc::now().with_timezone(&cfg.timezone);

    let sun = if cfg.use_astral {
        sun::sun_times(now.date_naive(), cfg.latitude, cfg.longitude, cfg.timezone)
    } else {
        None
    };

    Json(StatusResponse {
        time: now.format("%H:%M:%S").to_string(),
        count: s.count,
        last_snapshot: s.last_capture.map(|t| t.format("%H:%M:%S").to_string()),
        last_snapshot_iso: s.last_capture.as_ref().map(iso_seconds),
        last_filename: s.last_filename,
        next_snapshot_iso: s.next_snapshot.as_ref().map(iso_seconds),
        sunrise: sun::format_hm(sun.as_ref().map(|t| &t.sunrise)),
        sunset: sun::format_hm(sun.as_ref().map(|t| &t.sunset)),
        paused: cfg.paused,
        active: s.active,
        status: s.status,
        camera_error: s.camera_error,
        camera_health: s.camera_health,
    })
}

async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<SseEvent, axum::Error>>> {
    let keepalive = Duration::from_secs(state.config.current().sse_keepalive_secs);
    let subscription = state.bus.subscribe();
    debug!(subscriber = subscription.id(), "SSE stream opened");

    let stream = stream::unfold(subscription, |mut sub| async move {
        let event = sub.recv().await?;
        Some((SseEvent::default().json_data(&*event), sub))
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(keepalive))
}

async fn action(
    State(state): State<AppState>,
    Path(action): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let unavailable = |e: anyhow::Error| {
        error!("Scheduler command failed: {e:#}");
        api_error(StatusCode::SERVICE_UNAVAILABLE, "scheduler_unavailable")
    };

    match action.as_str() {
        "pause" => {
            state.scheduler.pause().await.map_err(unavailable)?;
            Ok(Json(json!({ "ok": true })))
        }
        "resume" => {
            state.scheduler.resume().await.map_err(unavailable)?;
            Ok(Json(json!({ "ok": true })))
        }
        "snapshot" => match state.scheduler.snapshot_now().await.map_err(unavailable)? {
            Ok(filename) => Ok(Json(json!({ "ok": true, "filename": filename }))),
            Err(e) => Err((
                StatusCode::BAD_GATEWAY,
                Json(json!({ "ok": false, "detail": e.code, "message": e.message })),
            )),
        },
        "reload" => match state.scheduler.reload().await {
            Ok(changed) => Ok(Json(json!({ "ok": true, "changed": changed }))),
            Err(e) => {
                warn!("Reload failed: {e:#}");
                Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, "reload_failed"))
            }
        },
        _ => Err(api_error(StatusCode::NOT_FOUND, "unknown_action")),
    }
}

async fn timelapse_status(State(state): State<AppState>) -> impl IntoResponse {
    let cfg = state.config.current();
    Json(state.render.status(&cfg))
}

async fn start_timelapse(
    State(state): State<AppState>,
    Json(req): Json<RenderRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let cfg = state.config.current();
    let render = Arc::clone(&state.render);

    let started = tokio::task::spawn_blocking(move || render.start(&cfg, &req))
        .await
        .map_err(|e| {
            error!("Render start task failed: {e}");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
        })?;

    started.map(Json).map_err(|e| render_error(&e))
}

async fn download_timelapse(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, StatusCode> {
    if !render::is_output_name(&name) {
        return Err(StatusCode::BAD_REQUEST);
    }
    let path = state.config.current().timelapse_dir().join(&name);
    if !path.is_file() {
        return Err(StatusCode::NOT_FOUND);
    }

    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok((
        [
            (header::CONTENT_TYPE, "video/mp4".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{name}\""),
            ),
        ],
        Body::from(bytes),
    )
        .into_response())
}

async fn delete_timelapse(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let cfg = state.config.current();
    state
        .render
        .delete_output(&cfg, &name)
        .map_err(|e| render_error(&e))?;
    Ok(Json(json!({ "ok": true })))
}

async fn picture(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, StatusCode> {
    // Sanitise: prevent directory traversal
    if !snapshot::is_safe_image_name(&name) {
        return Err(StatusCode::BAD_REQUEST);
    }

    let path = state.config.current().snapshot_dir().join(&name);
    if !path.is_file() {
        return Err(StatusCode::NOT_FOUND);
    }

    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let content_type = if name.to_lowercase().ends_with(".png") {
        "image/png"
    } else {
        "image/jpeg"
    };
    Ok(([(header::CONTENT_TYPE, content_type)], Body::from(bytes)).into_response())
}

async fn delete_picture(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let dir = state.config.current().snapshot_dir();
    run_blocking(move || gallery::delete_picture(&dir, &name)).await?;
    rescan(&state).await;
    Ok(Json(json!({ "ok": true })))
}

async fn range_count(
    State(state): State<AppState>,
    Json(req): Json<RangeRequest>,
) -> Result<Json<RangeCount>, ApiError> {
    let dir = state.config.current().snapshot_dir();
    let files = run_blocking(move || gallery::range(&dir, &req.start, &req.end)).await?;
    Ok(Json(RangeCount { count: files.len() }))
}

async fn delete_range(
    State(state): State<AppState>,
    Json(req): Json<RangeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let dir = state.config.current().snapshot_dir();
    let result = run_blocking(move || gallery::delete_range(&dir, &req.start, &req.end)).await?;
    rescan(&state).await;
    Ok(Json(result))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        instance: state.config.current().instance_slug(),
        event_subscribers: state.bus.subscriber_count(),
    })
}

/// Run a store operation off the async workers.
async fn run_blocking<T: Send + 'static>(
    op: impl FnOnce() -> Result<T, GalleryError> + Send + 'static,
) -> Result<T, ApiError> {
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| {
            error!("Gallery task failed: {e}");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
        })?
        .map_err(|e| gallery_error(&e))
}

async fn rescan(state: &AppState) {
    if let Err(e) = state.scheduler.rescan().await {
        warn!("Snapshot rescan failed: {e:#}");
    }
}

fn gallery_error(e: &GalleryError) -> ApiError {
    let status = match e {
        GalleryError::InvalidName | GalleryError::MissingBounds => StatusCode::BAD_REQUEST,
        GalleryError::NotFound(_) => StatusCode::NOT_FOUND,
        GalleryError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    api_error(status, e.code())
}

fn render_error(e: &RenderError) -> ApiError {
    let status = match e {
        RenderError::Busy => StatusCode::CONFLICT,
        RenderError::NoFrames => StatusCode::UNPROCESSABLE_ENTITY,
        RenderError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        RenderError::SnapshotNotFound(_) | RenderError::OutputNotFound => StatusCode::NOT_FOUND,
        RenderError::Encoder(_) | RenderError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    api_error(status, e.code())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{Camera, CameraError};
    use crate::render::{EncodeJob, Encoder};
    use crate::scheduler::CaptureLoop;
    use lapse_common::config::Config;

    struct StillCamera;

    impl Camera for StillCamera {
        fn fetch(&self, _cfg: &Config) -> Result<Vec<u8>, CameraError> {
            Ok(b"JPEG".to_vec())
        }

        fn probe(&self, _cfg: &Config) -> Result<(), CameraError> {
            Ok(())
        }
    }

    struct NullEncoder;

    impl Encoder for NullEncoder {
        fn encode(&self, job: &EncodeJob, _on_frame: &mut dyn FnMut(u64)) -> Result<(), RenderError> {
            std::fs::write(&job.output, b"mp4")?;
            Ok(())
        }
    }

    struct TestServer {
        base: String,
        client: reqwest::Client,
        shutdown: watch::Sender<bool>,
        dir: tempfile::TempDir,
    }

    async fn spawn_server() -> TestServer {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("snapshot_20240603_090000.jpg"), b"JPEG").unwrap();
        let cfg = Config {
            storage_dir: dir.path().to_path_buf(),
            instance_name: Some("porch".into()),
            // Range long over, so the loop never captures on its own.
            date_to: chrono::NaiveDate::from_ymd_opt(2000, 1, 1),
            tick_millis: 100,
            ..Config::default()
        };

        let live = LiveConfig::new(cfg, None);
        let bus = EventBus::new(16);
        let (capture_loop, scheduler) =
            CaptureLoop::new(live.clone(), Arc::new(StillCamera), Arc::clone(&bus));
        let (shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(capture_loop.run(shutdown_rx));

        let state = AppState {
            scheduler,
            config: live,
            bus,
            render: RenderManager::new(Arc::new(NullEncoder)),
            start_time: Instant::now(),
        };
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });

        TestServer {
            base: format!("http://{addr}"),
            client: reqwest::Client::new(),
            shutdown,
            dir,
        }
    }

    #[tokio::test]
    async fn test_status_and_health() {
        let srv = spawn_server().await;
        let v: serde_json::Value = srv
            .client
            .get(format!("{}/status", srv.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(v["count"], 1);
        assert_eq!(v["last_filename"], "snapshot_20240603_090000.jpg");
        assert_eq!(v["paused"], false);
        assert_eq!(v["active"], false);
        assert_eq!(v["sunrise"], "--:--");
        assert!(v["camera_error"].is_null());
        assert!(v["next_snapshot_iso"].is_null());

        let h: serde_json::Value = srv
            .client
            .get(format!("{}/api/health", srv.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(h["status"], "ok");
        assert_eq!(h["instance"], "porch");
        assert_eq!(h["event_subscribers"], 0);
        srv.shutdown.send(true).unwrap();
    }

    #[tokio::test]
    async fn test_actions() {
        let srv = spawn_server().await;
        let post = |path: &str| srv.client.post(format!("{}{path}", srv.base)).send();

        let r = post("/action/pause").await.unwrap();
        assert_eq!(r.status(), 200);
        let r = post("/action/snapshot").await.unwrap();
        let v: serde_json::Value = r.json().await.unwrap();
        assert_eq!(v["ok"], true);
        assert!(v["filename"].as_str().unwrap().starts_with("snapshot_"));

        let v: serde_json::Value = srv
            .client
            .get(format!("{}/status", srv.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(v["paused"], true);
        assert_eq!(v["status"], "paused");
        assert_eq!(v["count"], 2);

        let r = post("/action/explode").await.unwrap();
        assert_eq!(r.status(), 404);
        let v: serde_json::Value = r.json().await.unwrap();
        assert_eq!(v, json!({ "ok": false, "detail": "unknown_action" }));
        srv.shutdown.send(true).unwrap();
    }

    #[tokio::test]
    async fn test_events_stream_delivers_status() {
        let srv = spawn_server().await;
        let mut resp = srv
            .client
            .get(format!("{}/events", srv.base))
            .send()
            .await
            .unwrap();
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE.as_str()],
            "text/event-stream"
        );

        srv.client
            .post(format!("{}/action/pause", srv.base))
            .send()
            .await
            .unwrap();

        let mut body = String::new();
        let found = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(chunk) = resp.chunk().await.unwrap() {
                body.push_str(&String::from_utf8_lossy(&chunk));
                if body.contains(r#""status":"paused""#) {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap_or(false);
        assert!(found, "{body}");
        assert!(body.contains("data: {\"type\":\"status\""));
        srv.shutdown.send(true).unwrap();
    }

    #[tokio::test]
    async fn test_timelapse_flow() {
        let srv = spawn_server().await;

        let r = srv
            .client
            .post(format!("{}/timelapse", srv.base))
            .json(&json!({ "from": "2030-01-01T00:00:00Z" }))
            .send()
            .await
            .unwrap();
        assert_eq!(r.status(), 422);
        let v: serde_json::Value = r.json().await.unwrap();
        assert_eq!(v["detail"], "no_items");

        let r = srv
            .client
            .post(format!("{}/timelapse", srv.base))
            .json(&json!({ "fps": 500 }))
            .send()
            .await
            .unwrap();
        assert_eq!(r.status(), 400);

        let r = srv
            .client
            .post(format!("{}/timelapse", srv.base))
            .json(&json!({}))
            .send()
            .await
            .unwrap();
        assert_eq!(r.status(), 200);
        let v: serde_json::Value = r.json().await.unwrap();
        assert_eq!(v["output"], "timelapse_porch.mp4");
        assert_eq!(v["count"], 1);

        let mut status = serde_json::Value::Null;
        for _ in 0..100 {
            status = srv
                .client
                .get(format!("{}/timelapse/status", srv.base))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            if status["state"] != "running" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(status["state"], "done");
        assert_eq!(status["has_output"], true);

        let r = srv
            .client
            .get(format!("{}/timelapse/download/timelapse_porch.mp4", srv.base))
            .send()
            .await
            .unwrap();
        assert_eq!(r.status(), 200);
        assert_eq!(r.bytes().await.unwrap().as_ref(), b"mp4");

        let r = srv
            .client
            .delete(format!("{}/timelapse/timelapse_porch.mp4", srv.base))
            .send()
            .await
            .unwrap();
        assert_eq!(r.status(), 200);
        let r = srv
            .client
            .get(format!("{}/timelapse/download/timelapse_porch.mp4", srv.base))
            .send()
            .await
            .unwrap();
        assert_eq!(r.status(), 404);
        srv.shutdown.send(true).unwrap();
    }

    #[tokio::test]
    async fn test_pictures() {
        let srv = spawn_server().await;
        let get = |path: &str| srv.client.get(format!("{}{path}", srv.base)).send();

        let r = get("/pictures/snapshot_20240603_090000.jpg").await.unwrap();
        assert_eq!(r.status(), 200);
        assert_eq!(r.headers()[header::CONTENT_TYPE.as_str()], "image/jpeg");

        assert_eq!(get("/pictures/missing.jpg").await.unwrap().status(), 404);
        assert_eq!(get("/pictures/notes.txt").await.unwrap().status(), 400);
        assert_eq!(get("/pictures/..%2Fsecret.jpg").await.unwrap().status(), 400);
        srv.shutdown.send(true).unwrap();
    }

    fn add_snapshot(dir: &std::path::Path, name: &str, secs: u64) {
        let path = dir.join(name);
        std::fs::write(&path, b"JPEG").unwrap();
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(std::time::SystemTime::UNIX_EPOCH + Duration::from_secs(1_717_400_000 + secs))
            .unwrap();
    }

    #[tokio::test]
    async fn test_delete_picture_updates_status() {
        let srv = spawn_server().await;
        add_snapshot(srv.dir.path(), "snapshot_20240603_091000.jpg", 600);
        let url = |name: &str| format!("{}/pictures/{name}", srv.base);

        let r = srv.client.delete(url("snapshot_20240603_091000.jpg")).send().await.unwrap();
        assert_eq!(r.status(), 200);
        let v: serde_json::Value = r.json().await.unwrap();
        assert_eq!(v, json!({ "ok": true }));

        let v: serde_json::Value = srv
            .client
            .get(format!("{}/status", srv.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(v["count"], 1);
        assert_eq!(v["last_filename"], "snapshot_20240603_090000.jpg");

        let r = srv.client.delete(url("snapshot_20240603_091000.jpg")).send().await.unwrap();
        assert_eq!(r.status(), 404);
        let r = srv.client.delete(url("notes.txt")).send().await.unwrap();
        assert_eq!(r.status(), 400);
        let v: serde_json::Value = r.json().await.unwrap();
        assert_eq!(v["detail"], "invalid_name");
        srv.shutdown.send(true).unwrap();
    }

    #[tokio::test]
    async fn test_gallery_range_count_and_delete() {
        let srv = spawn_server().await;
        add_snapshot(srv.dir.path(), "snapshot_20240603_090000.jpg", 0);
        add_snapshot(srv.dir.path(), "snapshot_20240603_091000.jpg", 600);
        add_snapshot(srv.dir.path(), "snapshot_20240603_092000.jpg", 1200);
        add_snapshot(srv.dir.path(), "snapshot_20240603_093000.jpg", 1800);
        let post = |path: &str, body: serde_json::Value| {
            srv.client.post(format!("{}{path}", srv.base)).json(&body).send()
        };
        let range = json!({
            "start": "snapshot_20240603_092000.jpg",
            "end": "snapshot_20240603_091000.jpg",
        });

        let v: serde_json::Value = post("/gallery/range-count", range.clone())
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(v, json!({ "count": 2 }));

        let r = post("/gallery/range-count", json!({ "start": "snapshot_20240603_092000.jpg" }))
            .await
            .unwrap();
        assert_eq!(r.status(), 400);
        let v: serde_json::Value = r.json().await.unwrap();
        assert_eq!(v["detail"], "start_end_required");

        let v: serde_json::Value = post("/gallery/delete-range", range)
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(v, json!({ "ok": true, "deleted": 2, "failed": 0 }));

        let v: serde_json::Value = srv
            .client
            .get(format!("{}/status", srv.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(v["count"], 2);
        assert_eq!(v["last_filename"], "snapshot_20240603_093000.jpg");
        srv.shutdown.send(true).unwrap();
    }
}
