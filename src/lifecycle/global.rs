//! Process-wide defaults
//!
//! A default [`App`] for binaries that only ever run one, and a default
//! [`ShutdownManager`] that apps built with
//! [`register_global`](super::AppBuilder::register_global) join.

use super::{App, Hook, HookContext, ManagerError, Result, ShutdownManager};
use crate::logging::Logger;
use std::sync::{Arc, LazyLock, PoisonError, RwLock};
use std::time::Duration;

static DEFAULT_APP: LazyLock<RwLock<Arc<App>>> = LazyLock::new(|| RwLock::new(App::new()));

static GLOBAL_SHUTDOWN: LazyLock<ShutdownManager> = LazyLock::new(ShutdownManager::new);

/// The current default app
pub fn default_app() -> Arc<App> {
    Arc::clone(&DEFAULT_APP.read().unwrap_or_else(PoisonError::into_inner))
}

/// Register hooks on the default app
pub fn add(hooks: impl IntoIterator<Item = Hook>) {
    default_app().add(hooks);
}

/// Register `hooks` (if any) on the default app and run it
///
/// # Example
///
/// ```rust,ignore
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     crab::lifecycle::global::run([
///         Hook::new("http").with_start(|ctx| async move { serve(ctx).await }),
///     ])
///     .await?;
///     Ok(())
/// }
/// ```
pub async fn run(hooks: impl IntoIterator<Item = Hook>) -> Result<()> {
    let app = default_app();
    app.add(hooks);
    app.run().await
}

/// Stop the default app
pub async fn stop(ctx: &HookContext) -> Result<()> {
    default_app().stop(ctx).await
}

pub fn is_running() -> bool {
    default_app().is_running()
}

/// Give the default app a different logger
///
/// Hooks already added are carried over. Has no effect once the default app
/// has started.
pub fn set_logger(logger: Arc<dyn Logger>) {
    let mut current = DEFAULT_APP.write().unwrap_or_else(PoisonError::into_inner);
    let Some(hooks) = current.take_hooks() else {
        tracing::warn!("Default app already started, logger not replaced");
        return;
    };
    let app = App::builder().logger(logger).build();
    app.add(hooks);
    *current = app;
}

/// Replace the default app with a fresh one, allowing another `run`
pub fn reset() {
    *DEFAULT_APP.write().unwrap_or_else(PoisonError::into_inner) = App::new();
}

/// The process-wide shutdown manager
pub fn shutdown_manager() -> &'static ShutdownManager {
    &GLOBAL_SHUTDOWN
}

pub fn register(app: Arc<App>) -> std::result::Result<(), ManagerError> {
    GLOBAL_SHUTDOWN.register(app)
}

pub fn unregister(id: &str) -> std::result::Result<Arc<App>, ManagerError> {
    GLOBAL_SHUTDOWN.unregister(id)
}

/// Stop every app registered with the process-wide manager
pub async fn shutdown(ctx: &HookContext) -> std::result::Result<(), ManagerError> {
    GLOBAL_SHUTDOWN.shutdown(ctx).await
}

pub async fn shutdown_with_timeout(timeout: Duration) -> std::result::Result<(), ManagerError> {
    GLOBAL_SHUTDOWN.shutdown_with_timeout(timeout).await
}

/// Ids of the apps registered with the process-wide manager
pub fn app_ids() -> Vec<String> {
    GLOBAL_SHUTDOWN.app_ids()
}
