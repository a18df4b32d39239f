use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use crate::error::UpstreamError;

/// Materialized value at a watched path. `None` means "no data currently".
pub type Snapshot = Option<serde_json::Value>;

/// Invoked with the full snapshot after every change at the watched path.
///
/// Sources call it from their own task; it must not block.
pub type ChangeCallback = Arc<dyn Fn(Snapshot) + Send + Sync>;

/// Common interface implemented by every realtime store adapter.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Stable lowercase identifier for logs (e.g. `"firebase"`).
    fn name(&self) -> &str;

    /// Start watching `path`. `on_change` fires once per upstream mutation,
    /// in the order the store emitted them, until the returned handle is
    /// unwatched or dropped.
    async fn watch(
        &self,
        path: &str,
        on_change: ChangeCallback,
    ) -> Result<WatchHandle, UpstreamError>;
}

/// Owned cancel capability for one upstream watch.
///
/// Cancellation runs at most once: either through [`WatchHandle::unwatch`]
/// or when the handle is dropped.
pub struct WatchHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl WatchHandle {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Cancel the upstream watch.
    pub fn unwatch(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

impl fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchHandle")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
