//! File system watcher that triggers plugin reloads.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::manager::{PluginManager, WatchControl};
use crate::manifest::PluginClass;

/// Configuration for the plugin watcher.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Debounce duration for file changes.
    pub debounce: Duration,
    /// Whether to watch recursively.
    pub recursive: bool,
    /// File extensions to watch. Removals are reported regardless.
    pub extensions: Vec<String>,
    /// Whether to auto-reload on change.
    pub auto_reload: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            recursive: true,
            extensions: vec!["json".to_string(), "toml".to_string(), "txt".to_string()],
            auto_reload: true,
        }
    }
}

impl WatchConfig {
    /// Create a new watch configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the debounce duration.
    pub fn with_debounce(mut self, duration: Duration) -> Self {
        self.debounce = duration;
        self
    }

    /// Set recursive watching.
    pub fn with_recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    /// Set file extensions to watch.
    pub fn with_extensions(mut self, extensions: Vec<String>) -> Self {
        self.extensions = extensions;
        self
    }

    /// Set auto-reload behavior.
    pub fn with_auto_reload(mut self, auto: bool) -> Self {
        self.auto_reload = auto;
        self
    }
}

/// Event emitted when a watched file changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A file was created.
    Created {
        /// Path to the created file.
        path: PathBuf,
    },
    /// A file was modified.
    Modified {
        /// Path to the modified file.
        path: PathBuf,
    },
    /// A file was removed.
    Removed {
        /// Path to the removed file.
        path: PathBuf,
    },
}

impl WatchEvent {
    /// Get the path for this event.
    pub fn path(&self) -> &Path {
        match self {
            Self::Created { path } | Self::Modified { path } | Self::Removed { path } => path,
        }
    }

    /// Check if this event affects a file with the given extensions.
    pub fn matches_extension(&self, extensions: &[String]) -> bool {
        match self.path().extension().and_then(|e| e.to_str()) {
            Some(ext) => extensions.iter().any(|e| e == ext),
            None => false,
        }
    }

    fn is_relevant(&self, config: &WatchConfig) -> bool {
        matches!(self, Self::Removed { .. }) || self.matches_extension(&config.extensions)
    }
}

type EventHandler = Box<dyn Fn(PluginClass, &WatchEvent) + Send + Sync>;

struct WatchState {
    last_events: HashMap<PathBuf, Instant>,
    handlers: Vec<EventHandler>,
}

/// Watches plugin directories, one notify watcher per plugin class.
pub struct PluginWatcher {
    config: WatchConfig,
    watchers: Mutex<HashMap<PluginClass, RecommendedWatcher>>,
    state: Arc<RwLock<WatchState>>,
}

impl PluginWatcher {
    /// Create a new plugin watcher.
    pub fn new(config: WatchConfig) -> Self {
        Self {
            config,
            watchers: Mutex::new(HashMap::new()),
            state: Arc::new(RwLock::new(WatchState {
                last_events: HashMap::new(),
                handlers: Vec::new(),
            })),
        }
    }

    /// Get the watcher configuration.
    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    /// True while `class` is being watched.
    pub fn is_watching(&self, class: PluginClass) -> bool {
        self.watchers.lock().contains_key(&class)
    }

    /// Classes currently watched.
    pub fn watched_classes(&self) -> Vec<PluginClass> {
        let mut classes: Vec<PluginClass> = self.watchers.lock().keys().copied().collect();
        classes.sort();
        classes
    }

    /// Add an event handler.
    pub fn on_change<F>(&self, handler: F)
    where
        F: Fn(PluginClass, &WatchEvent) + Send + Sync + 'static,
    {
        self.state.write().handlers.push(Box::new(handler));
    }

    fn handle_event(state: &RwLock<WatchState>, config: &WatchConfig, class: PluginClass, event: Event) {
        let Some(path) = event.paths.first().cloned() else {
            return;
        };
        let watch_event = match event.kind {
            EventKind::Create(_) => WatchEvent::Created { path },
            EventKind::Modify(_) => WatchEvent::Modified { path },
            EventKind::Remove(_) => WatchEvent::Removed { path },
            _ => return,
        };

        if !watch_event.is_relevant(config) {
            return;
        }

        let mut state = state.write();
        let now = Instant::now();
        let path = watch_event.path().to_path_buf();
        if let Some(last) = state.last_events.get(&path) {
            if now.duration_since(*last) < config.debounce {
                return;
            }
        }
        state.last_events.insert(path, now);

        tracing::debug!(class = %class, path = %watch_event.path().display(), "plugin files changed");
        for handler in &state.handlers {
            handler(class, &watch_event);
        }
    }
}

impl WatchControl for PluginWatcher {
    fn stop(&self, class: PluginClass) {
        if self.watchers.lock().remove(&class).is_some() {
            tracing::debug!(class = %class, "stopped watching plugin sources");
        }
    }

    fn start(&self, class: PluginClass, paths: &[PathBuf]) -> Result<()> {
        let state = self.state.clone();
        let config = self.config.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| match res {
                Ok(event) => Self::handle_event(&state, &config, class, event),
                Err(err) => tracing::warn!(class = %class, error = %err, "watch error"),
            },
            Config::default(),
        )
        .map_err(|e| Error::Watch(e.to_string()))?;

        let mode = if self.config.recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        for path in paths.iter().filter(|p| p.exists()) {
            watcher
                .watch(path, mode)
                .map_err(|e| Error::Watch(format!("{}: {e}", path.display())))?;
        }

        self.watchers.lock().insert(class, watcher);
        tracing::debug!(class = %class, paths = paths.len(), "watching plugin sources");
        Ok(())
    }
}

impl std::fmt::Debug for PluginWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginWatcher")
            .field("config", &self.config)
            .field("watched_classes", &self.watched_classes())
            .finish()
    }
}

/// Reload a class whenever the watcher reports a change in it.
///
/// Changes arriving while a reload runs are coalesced into one more reload.
/// The task ends once the manager is dropped or `cancel` fires. Does nothing
/// useful unless `auto_reload` is set on the watcher's configuration.
pub fn spawn_auto_reload(
    manager: &Arc<PluginManager>,
    watcher: &PluginWatcher,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<PluginClass>();
    if watcher.config().auto_reload {
        watcher.on_change(move |class, _event| {
            let _ = tx.send(class);
        });
    }

    let manager: Weak<PluginManager> = Arc::downgrade(manager);
    tokio::spawn(async move {
        loop {
            let class = tokio::select! {
                _ = cancel.cancelled() => break,
                class = rx.recv() => match class {
                    Some(class) => class,
                    None => break,
                },
            };

            let mut pending = vec![class];
            while let Ok(more) = rx.try_recv() {
                if !pending.contains(&more) {
                    pending.push(more);
                }
            }

            let Some(manager) = manager.upgrade() else {
                break;
            };
            for class in pending {
                match manager.reload(class, &cancel).await {
                    Ok(summary) => tracing::info!(
                        class = %class,
                        changed = summary.changed(),
                        removed = summary.removed.len(),
                        "auto reload finished"
                    ),
                    Err(err) => tracing::warn!(class = %class, error = %err, "auto reload failed"),
                }
            }
        }
    })
}
