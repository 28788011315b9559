//! Backend handle with in-flight call accounting.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::backend::BackendPlugin;
use crate::error::Result;
use crate::plugin::BackendStatus;

struct HandleInner {
    plugin_id: String,
    backend: Arc<dyn BackendPlugin>,
    accepting: AtomicBool,
    in_flight: AtomicUsize,
    idle: Notify,
    shutdown: CancellationToken,
}

/// The backend of one registry entry.
///
/// Not cloneable: a handle belongs to exactly one entry. Calls borrow it
/// through a [`CallGuard`].
pub struct BackendHandle {
    inner: Arc<HandleInner>,
}

impl BackendHandle {
    pub(crate) fn new(plugin_id: impl Into<String>, backend: Arc<dyn BackendPlugin>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                plugin_id: plugin_id.into(),
                backend,
                accepting: AtomicBool::new(true),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Plugin ID this handle serves.
    pub fn plugin_id(&self) -> &str {
        &self.inner.plugin_id
    }

    pub(crate) async fn start(&self) -> Result<()> {
        self.inner.backend.start().await
    }

    /// Begin a call. Returns `None` once the handle stopped accepting calls.
    pub fn acquire(&self) -> Option<CallGuard> {
        // Increment before checking the flag; drain does the reverse.
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = CallGuard {
            inner: self.inner.clone(),
        };
        if self.inner.accepting.load(Ordering::SeqCst) {
            Some(guard)
        } else {
            None
        }
    }

    /// Calls currently in flight.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// True until removal begins.
    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::SeqCst)
    }

    /// True once the backend process has exited.
    pub fn has_exited(&self) -> bool {
        self.inner.backend.is_exited()
    }

    /// Backend status for snapshots.
    pub fn status(&self) -> BackendStatus {
        if self.has_exited() {
            BackendStatus::Exited
        } else {
            BackendStatus::Running
        }
    }

    /// Stop accepting calls and wait for in-flight ones to finish.
    ///
    /// Returns false if `timeout` elapsed first.
    pub(crate) async fn drain(&self, timeout: Duration) -> bool {
        self.inner.accepting.store(false, Ordering::SeqCst);

        let wait = async {
            loop {
                let notified = self.inner.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                    return;
                }
                notified.await;
            }
        };

        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    /// Refuse new calls and cut off running ones without stopping the backend.
    pub(crate) fn abort(&self) {
        self.inner.accepting.store(false, Ordering::SeqCst);
        self.inner.shutdown.cancel();
    }

    /// Cancel anything still running on the handle and stop the backend.
    pub(crate) async fn release(&self, timeout: Duration) {
        self.abort();

        match tokio::time::timeout(timeout, self.inner.backend.stop()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::warn!(plugin_id = %self.inner.plugin_id, error = %err, "backend stop failed");
            }
            Err(_) => {
                tracing::warn!(plugin_id = %self.inner.plugin_id, "backend stop timed out");
            }
        }
    }
}

impl fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendHandle")
            .field("plugin_id", &self.inner.plugin_id)
            .field("accepting", &self.is_accepting())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// An admitted call. Dropping it ends the call.
pub struct CallGuard {
    inner: Arc<HandleInner>,
}

impl CallGuard {
    /// The backend to call.
    pub fn backend(&self) -> Arc<dyn BackendPlugin> {
        self.inner.backend.clone()
    }

    /// Cancelled when the handle is force-released.
    pub fn shutdown(&self) -> &CancellationToken {
        &self.inner.shutdown
    }

    /// Plugin ID of the handle.
    pub fn plugin_id(&self) -> &str {
        &self.inner.plugin_id
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        if self.inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

impl fmt::Debug for CallGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallGuard")
            .field("plugin_id", &self.inner.plugin_id)
            .finish()
    }
}
