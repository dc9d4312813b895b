//! Debounced config-file watching.
//!
//! Editors commonly write a file several times in quick succession
//! (truncate, write, rename); the debounce window collapses those into one
//! reload signal.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::error::ConfigError;

/// Handle keeping the underlying watcher alive.
///
/// Dropping the handle stops the watch; the signal channel closes once the
/// debounce task drains.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    path: PathBuf,
}

impl ConfigWatcher {
    /// Path being watched.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Watch `path`, emitting one `()` on the returned channel per settled
/// burst of filesystem events.
pub fn watch_config(
    path: &Path,
    debounce: Duration,
) -> Result<(ConfigWatcher, mpsc::Receiver<()>), ConfigError> {
    let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<()>();
    let (signal_tx, signal_rx) = mpsc::channel::<()>(1);

    let watched = path.to_path_buf();
    let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
        match event {
            Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                let _ = raw_tx.send(());
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "config watcher error"),
        }
    })
    .map_err(|e| ConfigError::parse(format!("failed to create watcher: {e}")))?;

    // Watch the parent directory: atomic-rename writers replace the file
    // inode, which a direct watch would lose track of.
    let watch_root = path.parent().unwrap_or(path);
    watcher
        .watch(watch_root, RecursiveMode::NonRecursive)
        .map_err(|e| ConfigError::parse(format!("failed to watch {}: {e}", watch_root.display())))?;

    tokio::spawn(async move {
        loop {
            // Wait for the first event of a burst.
            if raw_rx.recv().await.is_none() {
                break;
            }
            // Then absorb the rest of the burst.
            loop {
                match tokio::time::timeout(debounce, raw_rx.recv()).await {
                    Ok(Some(())) => continue,
                    Ok(None) => return,
                    Err(_) => break,
                }
            }
            tracing::debug!("config change settled, signalling reload");
            // A full signal buffer means a reload is already pending.
            let _ = signal_tx.try_send(());
        }
    });

    Ok((
        ConfigWatcher {
            _watcher: watcher,
            path: path.to_path_buf(),
        },
        signal_rx,
    ))
}
