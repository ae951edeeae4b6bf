//! Hot-swappable configuration.
//!
//! The current [`Config`] lives behind a `watch` channel as an immutable
//! `Arc`.  Readers clone the `Arc` once per tick or request; a reload
//! replaces the whole value.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use lapse_common::config::{self, Config};

use crate::scheduler::SchedulerHandle;

#[derive(Clone)]
pub struct LiveConfig {
    path: Option<PathBuf>,
    tx: Arc<watch::Sender<Arc<Config>>>,
}

impl LiveConfig {
    pub fn new(config: Config, path: Option<PathBuf>) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(config));
        LiveConfig {
            path,
            tx: Arc::new(tx),
        }
    }

    pub fn current(&self) -> Arc<Config> {
        Arc::clone(&self.tx.borrow())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Swap in `config`.  Returns `false` when it equals the current one.
    pub fn replace(&self, config: Config) -> bool {
        self.tx.send_if_modified(|current| {
            if **current == config {
                return false;
            }
            *current = Arc::new(config);
            true
        })
    }

    /// Re-read the config file.  `Ok(false)` when nothing changed or there
    /// is no file to read.
    pub async fn reload(&self) -> Result<bool> {
        let Some(path) = self.path.clone() else {
            return Ok(false);
        };
        let config = tokio::task::spawn_blocking(move || config::load(&path))
            .await
            .context("Config reload task failed")??;
        Ok(self.replace(config))
    }

    /// Update the pause flag in memory, then persist it.
    ///
    /// Memory is updated first so the file watcher's reload sees no change.
    pub async fn set_paused(&self, paused: bool) -> Result<()> {
        let current = self.current();
        if current.paused != paused {
            self.replace(Config {
                paused,
                ..(*current).clone()
            });
        }

        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        tokio::task::spawn_blocking(move || config::save_paused(&path, paused))
            .await
            .context("Config save task failed")?
    }
}

/// Watch the config file and ask the capture loop to reload on change.
///
/// The parent directory is watched because editors and our own
/// `save_paused` replace the file by rename.  The returned watcher must be
/// kept alive.
pub fn watch_file(live: &LiveConfig, scheduler: SchedulerHandle) -> Result<Option<RecommendedWatcher>> {
    let Some(path) = live.path() else {
        return Ok(None);
    };
    let Some(file_name) = path.file_name().map(|n| n.to_os_string()) else {
        return Ok(None);
    };
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let runtime = tokio::runtime::Handle::current();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        let event = match res {
            Ok(event) => event,
            Err(e) => {
                warn!("Config watcher error: {e}");
                return;
            }
        };
        if !(event.kind.is_modify() || event.kind.is_create()) {
            return;
        }
        if !event
            .paths
            .iter()
            .any(|p| p.file_name() == Some(file_name.as_os_str()))
        {
            return;
        }
        debug!("Config file changed: {:?}", event.kind);
        let scheduler = scheduler.clone();
        runtime.spawn(async move {
            if let Err(e) = scheduler.reload().await {
                warn!("Config reload failed: {e:#}");
            }
        });
    })
    .context("Cannot create config file watcher")?;

    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("Cannot watch {}", dir.display()))?;
    info!("Watching {} for config changes", path.display());

    Ok(Some(watcher))
}
