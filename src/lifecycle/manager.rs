//! Shutdown Manager
//!
//! Keeps a set of running apps keyed by id and stops all of them
//! concurrently on request.

use super::{App, HookContext};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::RngCore;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

/// One app whose stop failed during a fan-out shutdown
#[derive(Debug, Error)]
#[error("app {id} shutdown failed: {source}")]
pub struct AppFailure {
    pub id: String,
    #[source]
    pub source: anyhow::Error,
}

/// Errors returned by [`ShutdownManager`]
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("app id must not be empty")]
    EmptyId,

    #[error("app {0} is already registered")]
    Duplicate(String),

    #[error("app {0} is not registered")]
    NotFound(String),

    /// One entry per app whose stop failed
    #[error("{}", render_failures(.0))]
    Shutdown(Vec<AppFailure>),
}

impl ManagerError {
    /// Ids of the apps that failed to stop
    pub fn failed_ids(&self) -> Vec<&str> {
        match self {
            Self::Shutdown(failures) => failures.iter().map(|f| f.id.as_str()).collect(),
            _ => Vec::new(),
        }
    }
}

fn render_failures(failures: &[AppFailure]) -> String {
    let rendered: Vec<String> = failures.iter().map(ToString::to_string).collect();
    format!("shutdown failed: {}", rendered.join("; "))
}

/// Registry of apps that are stopped together
///
/// # Example
///
/// ```rust,ignore
/// use crab::lifecycle::{App, HookContext, ShutdownManager};
/// use std::time::Duration;
///
/// let manager = ShutdownManager::new();
/// manager.register(api.clone())?;
/// manager.register(worker.clone())?;
///
/// // on SIGTERM
/// manager.shutdown_with_timeout(Duration::from_secs(30)).await?;
/// ```
#[derive(Default)]
pub struct ShutdownManager {
    apps: DashMap<String, Arc<App>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an app under its own id
    pub fn register(&self, app: Arc<App>) -> Result<(), ManagerError> {
        if app.id().is_empty() {
            return Err(ManagerError::EmptyId);
        }
        match self.apps.entry(app.id().to_string()) {
            Entry::Occupied(entry) => Err(ManagerError::Duplicate(entry.key().clone())),
            Entry::Vacant(entry) => {
                tracing::debug!(app_id = %entry.key(), "App registered for shutdown");
                entry.insert(app);
                Ok(())
            }
        }
    }

    /// Remove an app without stopping it
    pub fn unregister(&self, id: &str) -> Result<Arc<App>, ManagerError> {
        self.apps
            .remove(id)
            .map(|(_, app)| app)
            .ok_or_else(|| ManagerError::NotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.apps.contains_key(id)
    }

    /// Registered ids, sorted
    pub fn app_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.apps.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }

    /// Stop every registered app concurrently
    ///
    /// Works on a snapshot taken at entry: apps registered meanwhile are not
    /// stopped by this call. Returns once every stop has returned, with one
    /// [`AppFailure`] per app that failed. Registrations are left untouched,
    /// except that apps built with `register_global` leave the process-wide
    /// manager once stopped.
    pub async fn shutdown(&self, ctx: &HookContext) -> Result<(), ManagerError> {
        let apps: Vec<(String, Arc<App>)> = self
            .apps
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        if apps.is_empty() {
            return Ok(());
        }

        tracing::info!(apps = apps.len(), "Shutting down registered apps");

        let handles: Vec<(String, JoinHandle<super::Result<()>>)> = apps
            .into_iter()
            .map(|(id, app)| {
                let ctx = ctx.clone();
                (id, tokio::spawn(async move { app.stop(&ctx).await }))
            })
            .collect();

        let mut failures = Vec::new();
        for (id, handle) in handles {
            let source = match handle.await {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => anyhow::Error::new(err),
                Err(join) => anyhow::anyhow!("stop task failed: {join}"),
            };
            tracing::error!(app_id = %id, error = %source, "App shutdown failed");
            failures.push(AppFailure { id, source });
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ManagerError::Shutdown(failures))
        }
    }

    /// [`shutdown`](Self::shutdown) with a fresh context bounded by `timeout`
    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> Result<(), ManagerError> {
        self.shutdown(&HookContext::new().with_timeout(timeout)).await
    }
}

impl fmt::Debug for ShutdownManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownManager")
            .field("apps", &self.app_ids())
            .finish()
    }
}

static FALLBACK_SEQ: AtomicU64 = AtomicU64::new(0);

/// A new app id: `app-` followed by 16 random hex characters
///
/// Falls back to the current time in nanoseconds plus a process-wide counter
/// if the OS random source is unavailable.
pub fn generate_app_id() -> String {
    let mut bytes = [0u8; 8];
    match rand::rngs::OsRng.try_fill_bytes(&mut bytes) {
        Ok(()) => format!("app-{}", hex::encode(bytes)),
        Err(err) => {
            tracing::warn!(error = %err, "OS random source unavailable, using time-based app id");
            let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
            let seq = FALLBACK_SEQ.fetch_add(1, Ordering::Relaxed);
            format!("app-{nanos}-{seq}")
        }
    }
}
