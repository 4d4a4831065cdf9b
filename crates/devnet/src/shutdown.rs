//! Work the owning application runs once, right before it exits.

use std::{
    fmt,
    future::Future,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use futures_util::future::BoxFuture;
use tracing::{debug, warn};

pub const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(10);

type Hook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Cloneable registry of exit hooks. Every clone shares the same hooks, so
/// an orchestrator can register into the registry its application drains.
#[derive(Clone)]
pub struct ShutdownHooks {
    hooks: Arc<Mutex<Vec<(String, Hook)>>>,
    timeout: Duration,
}

impl ShutdownHooks {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_HOOK_TIMEOUT)
    }

    /// Bounds how long any single hook may hold up shutdown.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            hooks: Arc::new(Mutex::new(Vec::new())),
            timeout,
        }
    }

    pub fn register<F, Fut>(&self, label: impl Into<String>, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let label = label.into();
        debug!(hook = %label, "registered shutdown hook");
        self.lock()
            .push((label, Box::new(move || Box::pin(hook()) as BoxFuture<'static, ()>)));
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drains and runs every registered hook in registration order. Hooks
    /// registered after this call are left for the next one.
    pub async fn run(&self) {
        let hooks = std::mem::take(&mut *self.lock());
        for (label, hook) in hooks {
            if tokio::time::timeout(self.timeout, hook()).await.is_err() {
                warn!(
                    hook = %label,
                    timeout_secs = self.timeout.as_secs(),
                    "shutdown hook timed out"
                );
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(String, Hook)>> {
        self.hooks
            .lock()
            .unwrap_or_else(|error| error.into_inner())
    }
}

impl Default for ShutdownHooks {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ShutdownHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownHooks")
            .field("pending", &self.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}
