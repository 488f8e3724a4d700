//! Hooks: the unit of registration
//!
//! A [`Hook`] pairs an optional start action with an optional stop action.
//! Start actions run in registration order, stop actions in reverse order.

use super::{HookContext, HookError};
use async_trait::async_trait;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use tokio::time::Instant;

/// Boxed future returned by lifecycle actions
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Outcome of a single start or stop action
pub type HookResult = anyhow::Result<()>;

/// A start action
pub type Runner = Arc<dyn Fn(HookContext) -> BoxFuture<HookResult> + Send + Sync>;

/// A stop action
pub type Stopper = Runner;

/// Box an async closure into a [`Runner`]/[`Stopper`]
pub fn action<F, Fut>(f: F) -> Runner
where
    F: Fn(HookContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HookResult> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// A named pair of optional start/stop actions
///
/// # Example
///
/// ```rust,ignore
/// use crab::lifecycle::Hook;
///
/// let hook = Hook::new("redis")
///     .with_start(|_ctx| async move { connect().await })
///     .with_stop(|_ctx| async move { disconnect().await });
/// app.add([hook]);
/// ```
#[derive(Clone, Default)]
pub struct Hook {
    /// Label used in logs and errors
    pub name: Option<String>,
    pub on_start: Option<Runner>,
    pub on_stop: Option<Stopper>,
}

impl Hook {
    /// An empty hook with a name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// A hook with only a start action
    pub fn on_start<F, Fut>(f: F) -> Self
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult> + Send + 'static,
    {
        Self::default().with_start(f)
    }

    /// A hook with only a stop action
    pub fn on_stop<F, Fut>(f: F) -> Self
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult> + Send + 'static,
    {
        Self::default().with_stop(f)
    }

    /// A stop-only hook wrapping a synchronous closer such as a pool's `close`
    ///
    /// ```rust,ignore
    /// lifecycle.append(Hook::close(move || pool.close()).named("mysql"));
    /// ```
    pub fn close<F>(f: F) -> Self
    where
        F: Fn() -> HookResult + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self::on_stop(move |_ctx| {
            let f = Arc::clone(&f);
            async move { f() }
        })
    }

    /// A stop-only hook wrapping a close function that honours the context
    pub fn close_with_context<F, Fut>(f: F) -> Self
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult> + Send + 'static,
    {
        Self::on_stop(f)
    }

    /// A hook driving a [`Component`]'s `start` and `stop`
    pub fn component<C>(component: Arc<C>) -> Self
    where
        C: Component + 'static,
    {
        let starter = Arc::clone(&component);
        let stopper = Arc::clone(&component);
        Self::new(component.name())
            .with_start(move |ctx| {
                let component = Arc::clone(&starter);
                async move { component.start(ctx).await }
            })
            .with_stop(move |ctx| {
                let component = Arc::clone(&stopper);
                async move { component.stop(ctx).await }
            })
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_start<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult> + Send + 'static,
    {
        self.on_start = Some(action(f));
        self
    }

    pub fn with_stop<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult> + Send + 'static,
    {
        self.on_stop = Some(action(f));
        self
    }

    /// Name for logs and errors; unnamed hooks are identified by position
    pub fn display_name(&self, index: usize) -> String {
        match &self.name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => format!("hook#{index}"),
        }
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook")
            .field("name", &self.name)
            .field("on_start", &self.on_start.is_some())
            .field("on_stop", &self.on_stop.is_some())
            .finish()
    }
}

/// A resource that takes part in the app lifecycle
///
/// Both actions default to no-ops, so a component only implements the phase
/// it cares about. Register it with [`Hook::component`].
///
/// # Example
///
/// ```rust,ignore
/// use crab::lifecycle::{Component, HookContext, HookResult};
/// use async_trait::async_trait;
///
/// struct Consumer { /* ... */ }
///
/// #[async_trait]
/// impl Component for Consumer {
///     fn name(&self) -> &str {
///         "order-consumer"
///     }
///
///     async fn stop(&self, _ctx: HookContext) -> HookResult {
///         self.drain().await
///     }
/// }
/// ```
#[async_trait]
pub trait Component: Send + Sync {
    fn name(&self) -> &str;

    /// Called once, in registration order, while the app starts
    async fn start(&self, _ctx: HookContext) -> HookResult {
        Ok(())
    }

    /// Called once, in reverse registration order, while the app stops
    async fn stop(&self, _ctx: HookContext) -> HookResult {
        Ok(())
    }
}

/// Run one action: the only place a hook's closure is called.
///
/// Panics, whether raised while building the future or while polling it, come
/// back as [`HookError::Panicked`]. With a deadline the action's future is
/// dropped once it passes.
pub(crate) async fn invoke(
    action: &Runner,
    ctx: HookContext,
    deadline: Option<Instant>,
) -> Result<(), HookError> {
    let future = match std::panic::catch_unwind(AssertUnwindSafe(|| action(ctx))) {
        Ok(future) => future,
        Err(payload) => return Err(HookError::panicked(payload)),
    };
    let guarded = AssertUnwindSafe(future).catch_unwind();

    let outcome = match deadline {
        Some(deadline) => match tokio::time::timeout_at(deadline, guarded).await {
            Ok(outcome) => outcome,
            Err(_) => return Err(HookError::DeadlineExceeded),
        },
        None => guarded.await,
    };

    match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(HookError::Failed(e)),
        Err(payload) => Err(HookError::panicked(payload)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_invoke_converts_async_panic() {
        let hook = Hook::on_start(|_ctx| async move {
            if true {
                panic!("exploded while starting");
            }
            Ok(())
        });
        let err = invoke(hook.on_start.as_ref().unwrap(), HookContext::new(), None)
            .await
            .unwrap_err();

        match err {
            HookError::Panicked { message, backtrace } => {
                assert_eq!(message, "exploded while starting");
                assert!(!backtrace.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_invoke_converts_panic_before_first_poll() {
        let runner: Runner =
            Arc::new(|_ctx: HookContext| -> BoxFuture<HookResult> { panic!("no future for you") });
        let err = invoke(&runner, HookContext::new(), None).await.unwrap_err();
        assert!(err.is_panic());
    }

    #[tokio::test]
    async fn test_invoke_enforces_deadline() {
        let hook = Hook::on_stop(|_ctx| async move {
            std::future::pending::<()>().await;
            Ok(())
        });
        let ctx = HookContext::new().with_timeout(Duration::from_millis(20));
        let err = invoke(hook.on_stop.as_ref().unwrap(), ctx.clone(), ctx.deadline())
            .await
            .unwrap_err();
        assert!(matches!(err, HookError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_close_wraps_sync_closer() {
        let closed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&closed);
        let hook = Hook::close(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .named("pool");

        assert!(hook.on_start.is_none());
        invoke(hook.on_stop.as_ref().unwrap(), HookContext::new(), None)
            .await
            .unwrap();
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(hook.display_name(3), "pool");
    }

    #[test]
    fn test_unnamed_hooks_use_position() {
        assert_eq!(Hook::default().display_name(2), "hook#2");
        assert_eq!(Hook::new("").display_name(0), "hook#0");
    }

    struct Counter {
        starts: AtomicUsize,
        stops: AtomicUsize,
    }

    #[async_trait]
    impl Component for Counter {
        fn name(&self) -> &str {
            "counter"
        }

        async fn start(&self, _ctx: HookContext) -> HookResult {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self, _ctx: HookContext) -> HookResult {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_component_hook_drives_both_phases() {
        let counter = Arc::new(Counter {
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        });
        let hook = Hook::component(Arc::clone(&counter));
        assert_eq!(hook.name.as_deref(), Some("counter"));

        invoke(hook.on_start.as_ref().unwrap(), HookContext::new(), None)
            .await
            .unwrap();
        invoke(hook.on_stop.as_ref().unwrap(), HookContext::new(), None)
            .await
            .unwrap();

        assert_eq!(counter.starts.load(Ordering::SeqCst), 1);
        assert_eq!(counter.stops.load(Ordering::SeqCst), 1);
    }
}
