//! Registry lifecycle events and hooks.

use std::sync::Arc;
use std::time::Instant;

use crate::manifest::PluginClass;

/// Lifecycle event emitted by the registry and the manager.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    /// Plugin was published in the registry.
    Added {
        /// Plugin ID.
        id: String,
        /// Plugin version.
        version: String,
        /// Event time.
        at: Instant,
    },
    /// Plugin was unpublished and its backend released.
    Removed {
        /// Plugin ID.
        id: String,
        /// True if in-flight calls had to be cut off.
        forced: bool,
        /// Event time.
        at: Instant,
    },
    /// Registration failed.
    Failed {
        /// Plugin ID.
        id: String,
        /// Error message.
        message: String,
        /// Event time.
        at: Instant,
    },
    /// A plugin class was reloaded.
    Reloaded {
        /// Plugin class.
        class: PluginClass,
        /// Number of plugins added or updated.
        changed: usize,
        /// Number of plugins removed.
        removed: usize,
        /// Event time.
        at: Instant,
    },
}

impl LifecycleEvent {
    /// Plugin ID, when the event concerns a single plugin.
    pub fn plugin_id(&self) -> Option<&str> {
        match self {
            Self::Added { id, .. } | Self::Removed { id, .. } | Self::Failed { id, .. } => Some(id),
            Self::Reloaded { .. } => None,
        }
    }

    /// Get the event timestamp.
    pub fn timestamp(&self) -> Instant {
        match self {
            Self::Added { at, .. }
            | Self::Removed { at, .. }
            | Self::Failed { at, .. }
            | Self::Reloaded { at, .. } => *at,
        }
    }

    /// Get the event name.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Added { .. } => "added",
            Self::Removed { .. } => "removed",
            Self::Failed { .. } => "failed",
            Self::Reloaded { .. } => "reloaded",
        }
    }
}

type EventHandler = Arc<dyn Fn(&LifecycleEvent) + Send + Sync>;

/// Hooks for lifecycle events.
///
/// Cloning is cheap and shares the handlers, so a caller can emit from a
/// copy without holding whatever lock guards the original.
#[derive(Clone)]
pub struct LifecycleHooks {
    handlers: Vec<EventHandler>,
}

impl LifecycleHooks {
    /// Create new lifecycle hooks.
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Add a lifecycle event handler.
    pub fn on_event<F>(&mut self, handler: F)
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.handlers.push(Arc::new(handler));
    }

    /// Emit a lifecycle event.
    pub fn emit(&self, event: LifecycleEvent) {
        for handler in &self.handlers {
            handler(&event);
        }
    }

    /// Emit an added event.
    pub fn emit_added(&self, id: &str, version: &str) {
        self.emit(LifecycleEvent::Added {
            id: id.to_string(),
            version: version.to_string(),
            at: Instant::now(),
        });
    }

    /// Emit a removed event.
    pub fn emit_removed(&self, id: &str, forced: bool) {
        self.emit(LifecycleEvent::Removed {
            id: id.to_string(),
            forced,
            at: Instant::now(),
        });
    }

    /// Emit a failure event.
    pub fn emit_failed(&self, id: &str, message: &str) {
        self.emit(LifecycleEvent::Failed {
            id: id.to_string(),
            message: message.to_string(),
            at: Instant::now(),
        });
    }

    /// Emit a reloaded event.
    pub fn emit_reloaded(&self, class: PluginClass, changed: usize, removed: usize) {
        self.emit(LifecycleEvent::Reloaded {
            class,
            changed,
            removed,
            at: Instant::now(),
        });
    }
}

impl Default for LifecycleHooks {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LifecycleHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleHooks")
            .field("handler_count", &self.handlers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_lifecycle_hooks() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let mut hooks = LifecycleHooks::new();
        hooks.on_event(move |_| {
            counter_clone.fetch_add(1, Ordering::Relaxed);
        });

        hooks.emit_added("mysql", "1.0.0");
        hooks.emit_removed("mysql", false);
        hooks.emit_reloaded(PluginClass::External, 1, 1);

        assert_eq!(counter.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_clone_shares_handlers() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let mut hooks = LifecycleHooks::new();
        hooks.on_event(move |_| {
            counter_clone.fetch_add(1, Ordering::Relaxed);
        });
        let copy = hooks.clone();
        hooks.on_event(|_| {});

        copy.emit_failed("pg", "boom");
        assert_eq!(counter.load(Ordering::Relaxed), 1);
        assert_eq!(format!("{copy:?}"), "LifecycleHooks { handler_count: 1 }");
    }

    #[test]
    fn test_lifecycle_event_info() {
        let event = LifecycleEvent::Removed {
            id: "pg".to_string(),
            forced: true,
            at: Instant::now(),
        };

        assert_eq!(event.plugin_id(), Some("pg"));
        assert_eq!(event.event_name(), "removed");

        let reload = LifecycleEvent::Reloaded {
            class: PluginClass::Bundled,
            changed: 0,
            removed: 0,
            at: Instant::now(),
        };
        assert_eq!(reload.plugin_id(), None);
    }
}
