//! Configuration hot reload.
//!
//! Watches the directory holding the config file (editors usually replace
//! the file rather than writing in place) and republishes the configuration
//! on the `watch` channel every task reads from. A file that fails to parse
//! or validate is rejected and the previous configuration stays in effect.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ConfigError, DaemonConfig};

/// Quiet period after a change before the file is read.
const DEBOUNCE: Duration = Duration::from_millis(250);

/// Starts watching `path` and publishing reloads on `publisher`.
///
/// # Errors
///
/// Fails if the platform watcher cannot be created or the directory cannot
/// be watched.
pub fn spawn_config_watcher(
    path: PathBuf,
    publisher: watch::Sender<Arc<DaemonConfig>>,
    cancel_token: CancellationToken,
) -> Result<JoinHandle<()>, ConfigError> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let file_name = path.file_name().map(ToOwned::to_owned);

    let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
        match res {
            Ok(event) => {
                let ours = event
                    .paths
                    .iter()
                    .any(|p| p.file_name() == file_name.as_deref());
                if ours && (event.kind.is_modify() || event.kind.is_create()) {
                    let _ = tx.send(());
                }
            }
            Err(e) => warn!(error = %e, "Config watch error"),
        }
    })?;

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    watcher.watch(dir, RecursiveMode::NonRecursive)?;

    info!(path = %path.display(), "Config watcher started");

    Ok(tokio::spawn(async move {
        // Dropping the watcher stops notifications.
        let _watcher = watcher;

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => break,

                changed = rx.recv() => {
                    if changed.is_none() {
                        break;
                    }
                    sleep(DEBOUNCE).await;
                    while rx.try_recv().is_ok() {}

                    match reload_config(&path, &publisher).await {
                        Ok(true) => {}
                        Ok(false) => debug!("Config file touched without changes"),
                        Err(e) => warn!(
                            path = %path.display(),
                            error = %e,
                            "Config reload rejected, keeping previous configuration"
                        ),
                    }
                }
            }
        }

        debug!("Config watcher stopped");
    }))
}

/// Reloads the file and publishes it if it differs from the current one.
///
/// Returns whether a new configuration was published.
pub async fn reload_config(
    path: &Path,
    publisher: &watch::Sender<Arc<DaemonConfig>>,
) -> Result<bool, ConfigError> {
    let next = DaemonConfig::load_async(path).await?;
    let current = publisher.borrow().clone();
    if *current == next {
        return Ok(false);
    }
    if current.requires_restart(&next) {
        warn!("Endpoint or auth settings changed; they take effect after a restart");
    }
    publisher.send_replace(Arc::new(next));
    info!(path = %path.display(), "Configuration reloaded");
    Ok(true)
}
