//! Application lifecycle coordinator
//!
//! [`App`] owns an ordered list of hooks and drives them through
//! `New → Starting → Running → Stopping → Stopped`:
//!
//! ```text
//! run()
//!   ├─ start phase: on_start in registration order (optional startup timeout)
//!   │    └─ on failure: rollback = stop phase over the hooks already started
//!   ├─ Running: wait for a watched signal or stop()
//!   └─ stop phase: on_stop in reverse order, every failure collected
//! ```

use super::context::HookContext;
use super::error::{ComponentError, HookError, LifecycleError, Result, ShutdownErrors};
use super::hook::{invoke, Hook};
use super::manager::generate_app_id;
use super::registry::Lifecycle;
use super::signal::{self, Signal, DEFAULT_SIGNALS};
use super::{global, ContextError};
use crate::bag::Bagger;
use crate::common::format_cost;
use crate::config::ConfigService;
use crate::error::ConfigError;
use crate::health::HealthProbe;
use crate::logging::{Logger, TracingLogger};
use serde::Serialize;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use strum_macros::Display;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Default bound on the stop phase
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle state; only ever moves forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum State {
    New,
    Starting,
    Running,
    Stopping,
    Stopped,
}

struct Inner {
    state: State,
    hooks: Vec<Hook>,
    /// Hooks the start phase got past; the stop phase only visits these
    started: usize,
}

/// An application instance
///
/// Shared behind an `Arc` so `stop` can be called from another task, a
/// [`ShutdownManager`](super::ShutdownManager) or a signal handler while `run`
/// is blocked.
///
/// # Example
///
/// ```rust,ignore
/// use crab::lifecycle::{App, Hook};
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let app = App::builder()
///         .name("orders")
///         .startup_timeout(Duration::from_secs(30))
///         .build();
///
///     app.add([
///         Hook::new("database")
///             .with_start(|_ctx| async move { connect().await })
///             .with_stop(|_ctx| async move { disconnect().await }),
///         Hook::new("http").with_start(|_ctx| async move { serve().await }),
///     ]);
///
///     app.run().await?;
///     Ok(())
/// }
/// ```
pub struct App {
    id: String,
    name: Option<String>,
    root: HookContext,
    shutdown_timeout: Duration,
    startup_timeout: Option<Duration>,
    signals: Vec<Signal>,
    logger: Arc<dyn Logger>,
    health: Option<Arc<HealthProbe>>,
    on_shutdown: Bagger,
    global: AtomicBool,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<State>,
}

impl App {
    /// An app with default settings
    pub fn new() -> Arc<Self> {
        AppBuilder::new().build()
    }

    pub fn builder() -> AppBuilder {
        AppBuilder::new()
    }

    /// Register hooks
    ///
    /// # Panics
    ///
    /// Panics once `run` (or `stop`) has been called: hooks added after the
    /// start phase began would start in an unpredictable order.
    pub fn add(&self, hooks: impl IntoIterator<Item = Hook>) {
        let mut inner = self.lock();
        if inner.state != State::New {
            drop(inner);
            panic!("crab: cannot add hook after app has started");
        }
        inner.hooks.extend(hooks);
    }

    /// Generated unique identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn state(&self) -> State {
        self.lock().state
    }

    /// Whether every start action completed and stopping has not begun
    pub fn is_running(&self) -> bool {
        self.lock().state == State::Running
    }

    /// Root context, cancelled when the app begins stopping
    ///
    /// Background tasks spawned by start actions should watch this rather than
    /// the context passed to `on_start`, which may carry the startup deadline.
    pub fn context(&self) -> &HookContext {
        &self.root
    }

    /// Move the registered hooks out of an app that has not started
    pub(crate) fn take_hooks(&self) -> Option<Vec<Hook>> {
        let mut inner = self.lock();
        (inner.state == State::New).then(|| std::mem::take(&mut inner.hooks))
    }

    pub fn hook_count(&self) -> usize {
        self.lock().hooks.len()
    }

    /// Register a notification fired once when the stop phase begins
    ///
    /// A panicking notification is logged and does not keep the others from
    /// running.
    pub fn on_shutdown<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let logger = Arc::clone(&self.logger);
        self.on_shutdown.register_fn(move || {
            if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(&f)) {
                logger.error(
                    "Shutdown notification panicked",
                    &[("error", HookError::panicked(payload).to_string())],
                );
            }
            Ok(())
        });
    }

    /// Wait until the app has reached (or passed) `target`
    pub async fn wait_for(&self, target: State) {
        let mut rx = self.state_tx.subscribe();
        // the sender lives as long as `self`, so this cannot fail
        let _ = rx.wait_for(|state| *state >= target).await;
    }

    pub async fn wait_stopped(&self) {
        self.wait_for(State::Stopped).await;
    }

    /// Start every hook, block until a signal or `stop`, then stop every hook
    ///
    /// Returns the start error (after rolling back) if startup fails, otherwise
    /// the aggregated result of the stop phase. When `stop` was called by
    /// someone else, waits for that stop phase and returns `Ok(())`; the errors
    /// go to the caller of `stop`.
    pub async fn run(&self) -> Result<()> {
        if !self.transition(State::New, State::Starting) {
            return Err(LifecycleError::AlreadyStarted);
        }

        self.run_inner().await
    }

    async fn run_inner(&self) -> Result<()> {
        self.logger
            .info("App starting...", &[("id", self.id.clone())]);
        let begin = Instant::now();

        if let Err(err) = self.start_with_timeout().await {
            self.logger.error(
                "App start failed. Rolling back...",
                &[("error", err.to_string())],
            );
            self.rollback().await;
            return Err(err);
        }

        if !self.transition(State::Starting, State::Running) {
            // stop() arrived after the last start action had begun
            self.rollback().await;
            return Err(LifecycleError::StartCancelled);
        }
        if let Some(health) = &self.health {
            health.set_ready(true);
        }
        self.logger.info(
            "App started successfully",
            &[("cost", format_cost(begin.elapsed()))],
        );

        tokio::select! {
            received = signal::wait_for(&self.signals) => match received {
                Ok(sig) => self.logger.info("Received signal", &[("signal", sig.to_string())]),
                Err(err) => {
                    self.logger.error(
                        "Failed to listen for signals, waiting for stop()",
                        &[("error", err.to_string())],
                    );
                    self.root.token().cancelled().await;
                }
            },
            _ = self.root.token().cancelled() => {
                self.logger.info("Context canceled", &[]);
            }
        }

        let result = self.stop(&HookContext::new()).await;
        self.wait_stopped().await;
        result
    }

    /// Stop the app
    ///
    /// Idempotent: once stopping has begun every further call returns `Ok(())`
    /// straight away. The stop phase is bounded by `ctx` and the shutdown
    /// timeout, whichever ends first. Stopping an app that never ran just marks
    /// it stopped; stopping one that is still starting cancels the start and
    /// waits for `run` to roll back.
    pub async fn stop(&self, ctx: &HookContext) -> Result<()> {
        let previous = {
            let mut inner = self.lock();
            let previous = inner.state;
            let next = match previous {
                State::Stopping | State::Stopped => return Ok(()),
                State::New => State::Stopped,
                State::Starting | State::Running => State::Stopping,
            };
            inner.state = next;
            self.state_tx.send_replace(next);
            previous
        };

        self.root.cancel();
        let ctx = ctx.with_timeout(self.shutdown_timeout);

        match previous {
            State::New => {
                self.leave_global();
                if let Some(health) = &self.health {
                    health.set_ready(false);
                }
                self.logger.info("App stopped before it was started", &[]);
                Ok(())
            }
            State::Starting => {
                self.logger
                    .info("App stop requested during startup, waiting for rollback", &[]);
                match ctx.deadline() {
                    Some(deadline) => tokio::time::timeout_at(deadline, self.wait_stopped())
                        .await
                        .map_err(|_| LifecycleError::StopTimeout),
                    None => {
                        self.wait_stopped().await;
                        Ok(())
                    }
                }
            }
            _ => {
                self.logger.info("App stopping...", &[]);
                self.stop_phase(&ctx).await
            }
        }
    }

    async fn start_with_timeout(&self) -> Result<()> {
        match self.startup_timeout {
            Some(timeout) => {
                let ctx = self.root.with_timeout(timeout);
                tokio::time::timeout(timeout, self.start(&ctx, timeout))
                    .await
                    .unwrap_or(Err(LifecycleError::StartupTimeout { timeout }))
            }
            None => self.start(&self.root.child(), Duration::ZERO).await,
        }
    }

    async fn start(&self, ctx: &HookContext, timeout: Duration) -> Result<()> {
        let hooks = self.lock().hooks.clone();

        for (index, hook) in hooks.iter().enumerate() {
            match ctx.err() {
                Some(ContextError::DeadlineExceeded) => {
                    return Err(LifecycleError::StartupTimeout { timeout });
                }
                Some(ContextError::Canceled) => return Err(LifecycleError::StartCancelled),
                None => {}
            }

            if let Some(on_start) = &hook.on_start {
                let name = hook.display_name(index);
                self.logger
                    .info("Starting component...", &[("name", name.clone())]);
                let began = Instant::now();
                invoke(on_start, ctx.clone(), None)
                    .await
                    .map_err(|source| LifecycleError::StartFailed {
                        hook: name.clone(),
                        source,
                    })?;
                self.logger.info(
                    "Started component",
                    &[("name", name), ("cost", format_cost(began.elapsed()))],
                );
            }

            self.lock().started = index + 1;
        }
        Ok(())
    }

    /// Stop whatever the failed start phase left running
    async fn rollback(&self) {
        {
            let mut inner = self.lock();
            if inner.state == State::Stopped {
                return;
            }
            inner.state = State::Stopping;
            self.state_tx.send_replace(State::Stopping);
        }
        self.root.cancel();

        let ctx = HookContext::new().with_timeout(self.shutdown_timeout);
        if let Err(err) = self.stop_phase(&ctx).await {
            self.logger
                .error("Rollback failed", &[("error", err.to_string())]);
        }
    }

    async fn stop_phase(&self, ctx: &HookContext) -> Result<()> {
        // reaches Stopped even if this future is dropped or unwinds
        let _stopped = StopGuard(self);
        if let Some(health) = &self.health {
            health.set_ready(false);
        }
        if let Err(err) = self.on_shutdown.finish() {
            self.logger
                .error("Shutdown notification failed", &[("error", err.to_string())]);
        }

        let hooks = {
            let inner = self.lock();
            inner.hooks[..inner.started].to_vec()
        };

        let begin = Instant::now();
        let mut errors = Vec::new();
        for (index, hook) in hooks.iter().enumerate().rev() {
            let Some(on_stop) = &hook.on_stop else {
                continue;
            };
            let name = hook.display_name(index);

            if let Some(reason) = ctx.err() {
                self.logger.error(
                    "Shutdown aborted",
                    &[("name", name.clone()), ("reason", reason.to_string())],
                );
                errors.push(ComponentError {
                    name,
                    source: HookError::Aborted(reason),
                });
                break;
            }

            self.logger
                .info("Stopping component...", &[("name", name.clone())]);
            let began = Instant::now();
            match invoke(on_stop, ctx.clone(), ctx.deadline()).await {
                Ok(()) => self.logger.info(
                    "Stopped component",
                    &[("name", name), ("cost", format_cost(began.elapsed()))],
                ),
                Err(source) => {
                    self.logger.error(
                        "Failed to stop component",
                        &[("name", name.clone()), ("error", source.to_string())],
                    );
                    errors.push(ComponentError { name, source });
                }
            }
        }

        if errors.is_empty() {
            self.logger
                .info("App stopped", &[("cost", format_cost(begin.elapsed()))]);
            Ok(())
        } else {
            Err(ShutdownErrors::new(errors).into())
        }
    }

    fn transition(&self, from: State, to: State) -> bool {
        let mut inner = self.lock();
        if inner.state != from {
            return false;
        }
        inner.state = to;
        self.state_tx.send_replace(to);
        true
    }

    fn leave_global(&self) {
        if self.global.swap(false, Ordering::AcqRel) {
            let _ = global::shutdown_manager().unregister(&self.id);
        }
    }

    fn set_state(&self, to: State) {
        let mut inner = self.lock();
        inner.state = to;
        self.state_tx.send_replace(to);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct StopGuard<'a>(&'a App);

impl Drop for StopGuard<'_> {
    fn drop(&mut self) {
        self.0.set_state(State::Stopped);
        self.0.leave_global();
    }
}

impl Lifecycle for App {
    fn append(&self, hook: Hook) {
        self.add([hook]);
    }
}

impl fmt::Debug for App {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("App")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("hooks", &self.hook_count())
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("startup_timeout", &self.startup_timeout)
            .field("signals", &self.signals)
            .finish()
    }
}

/// Builder for [`App`]
pub struct AppBuilder {
    name: Option<String>,
    parent: Option<CancellationToken>,
    shutdown_timeout: Duration,
    startup_timeout: Option<Duration>,
    signals: Vec<Signal>,
    logger: Arc<dyn Logger>,
    health: Option<Arc<HealthProbe>>,
    register_global: bool,
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            name: None,
            parent: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            startup_timeout: None,
            signals: DEFAULT_SIGNALS.to_vec(),
            logger: Arc::new(TracingLogger),
            health: None,
            register_global: false,
        }
    }

    /// Diagnostic label, included in the app's log lines
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Derive the app's root context from `token`; cancelling it stops the app
    pub fn parent(mut self, token: CancellationToken) -> Self {
        self.parent = Some(token);
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Bound the whole start phase; unbounded by default
    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = Some(timeout);
        self
    }

    /// Signals that trigger shutdown; an empty set leaves only `stop`
    pub fn signals(mut self, signals: impl IntoIterator<Item = Signal>) -> Self {
        self.signals = signals.into_iter().collect();
        self
    }

    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    /// Flip `probe` ready while the app is running
    pub fn health(mut self, probe: Arc<HealthProbe>) -> Self {
        self.health = Some(probe);
        self
    }

    /// Join the process-wide [`ShutdownManager`](super::ShutdownManager);
    /// the app leaves it again once it reaches `Stopped`
    pub fn register_global(mut self) -> Self {
        self.register_global = true;
        self
    }

    /// Apply name, timeouts and signal set from configuration
    pub fn config(mut self, config: &ConfigService) -> std::result::Result<Self, ConfigError> {
        if let Some(name) = config.app_name() {
            self.name = Some(name);
        }
        if let Some(timeout) = config.shutdown_timeout()? {
            self.shutdown_timeout = timeout;
        }
        if let Some(timeout) = config.startup_timeout()? {
            self.startup_timeout = Some(timeout);
        }
        if let Some(signals) = config.signals()? {
            self.signals = signals;
        }
        Ok(self)
    }

    pub fn build(self) -> Arc<App> {
        let root = match self.parent {
            Some(parent) => HookContext::from_token(parent.child_token()),
            None => HookContext::new(),
        };
        let (state_tx, _) = watch::channel(State::New);

        let app = Arc::new(App {
            id: generate_app_id(),
            name: self.name,
            root,
            shutdown_timeout: self.shutdown_timeout,
            startup_timeout: self.startup_timeout.filter(|t| !t.is_zero()),
            signals: self.signals,
            logger: self.logger,
            health: self.health,
            on_shutdown: Bagger::new(),
            global: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                state: State::New,
                hooks: Vec::new(),
                started: 0,
            }),
            state_tx,
        });

        if self.register_global {
            match global::shutdown_manager().register(Arc::clone(&app)) {
                Ok(()) => app.global.store(true, Ordering::Release),
                Err(err) => app.logger.error(
                    "Failed to join global shutdown manager",
                    &[("error", err.to_string())],
                ),
            }
        }
        app
    }
}
