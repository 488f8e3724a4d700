//! Signal-driven graceful shutdown
//!
//! [`GracefulShutdown::watch`] blocks until an application-supplied `done`
//! future resolves or a termination signal arrives, then finishes every
//! cleanup [`Bagger`] concurrently under a hard deadline and finally hands over
//! to a [`Terminator`]. The default terminator exits the process, so a cleanup
//! callback that never returns cannot keep a container alive.
//!
//! ```text
//! done / SIGTERM / SIGINT
//!    ↓
//! shutdown_start event
//!    ↓
//! finish(bagger[0..n]) concurrently   ← max wait (60s)
//!    ↓
//! shutdown_complete | shutdown_timeout event
//!    ↓
//! Terminator::terminate
//! ```

use crate::bag::{BagError, Bagger, FuncErr};
use crate::common::format_cost;
use crate::config::ConfigService;
use crate::error::ConfigError;
use crate::lifecycle::{self, Signal, DEFAULT_SIGNALS};
use serde::Serialize;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, LazyLock, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;

/// Default bound on the cleanup phase
pub const MAX_WAIT_TIME: Duration = Duration::from_secs(60);

/// How long a shutdown callback may block the watcher
const CALLBACK_WAIT: Duration = Duration::from_secs(1);

/// Reason reported when the `done` future, rather than a signal, triggered shutdown
pub const REASON_DONE: &str = "application_done";

/// Transitions reported to the [`ShutdownCallback`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event")]
pub enum ShutdownEvent {
    #[serde(rename = "shutdown_start")]
    ShutdownStarted {
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        signal: Option<String>,
    },

    #[serde(rename = "shutdown_complete")]
    ShutdownCompleted { reason: String, error_count: usize },

    #[serde(rename = "shutdown_timeout")]
    ShutdownTimedOut { reason: String, max_wait: String },
}

impl ShutdownEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ShutdownStarted { .. } => "shutdown_start",
            Self::ShutdownCompleted { .. } => "shutdown_complete",
            Self::ShutdownTimedOut { .. } => "shutdown_timeout",
        }
    }

    /// Event payload as a JSON object, without the event name
    pub fn data(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut data = match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        data.remove("event");
        data
    }
}

/// Observability hook; must not be relied on for cleanup
pub type ShutdownCallback = Arc<dyn Fn(&ShutdownEvent) + Send + Sync>;

/// What happens once cleanup has finished or timed out
pub trait Terminator: Send + Sync {
    fn terminate(&self, errors: &[GracefulError]);
}

/// Exit the process: status 0 after a clean shutdown, 1 otherwise
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessExit;

impl Terminator for ProcessExit {
    fn terminate(&self, errors: &[GracefulError]) {
        let code = if errors.is_empty() { 0 } else { 1 };
        tracing::warn!(code, "Terminating process");
        std::process::exit(code);
    }
}

/// Leave the process running and let `watch` return
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTerminator;

impl Terminator for NoopTerminator {
    fn terminate(&self, _errors: &[GracefulError]) {}
}

#[derive(Debug, Error)]
pub enum GracefulError {
    #[error("bagger[{index}] error: {source}")]
    Bagger {
        index: usize,
        #[source]
        source: BagError,
    },

    #[error("bagger[{index}] panicked: {message}")]
    Panicked { index: usize, message: String },

    #[error("graceful shutdown timeout exceeded ({})", format_cost(*.0))]
    Timeout(Duration),
}

static DEFAULT_BAG: LazyLock<Arc<Bagger>> = LazyLock::new(|| Arc::new(Bagger::new()));

static CALLBACK: RwLock<Option<ShutdownCallback>> = RwLock::new(None);

/// Add cleanup callbacks to the process-wide shutdown bagger
pub fn register(fns: impl IntoIterator<Item = FuncErr>) {
    DEFAULT_BAG.register(fns);
}

/// The process-wide shutdown bagger, always finished last by [`watch_signal`]
pub fn default_bag() -> Arc<Bagger> {
    Arc::clone(&DEFAULT_BAG)
}

/// Set the callback used by watchers that were not given one explicitly
pub fn set_shutdown_callback<F>(callback: F)
where
    F: Fn(&ShutdownEvent) + Send + Sync + 'static,
{
    *CALLBACK.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
}

/// Watch with the defaults, finishing `extra` and then the default bagger
///
/// Exits the process when done.
///
/// # Example
///
/// ```rust,ignore
/// let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();
/// crab::graceful::register([crab::bag::func(|| flush_logs())]);
///
/// tokio::spawn(async move {
///     server.serve().await;
///     let _ = done_tx.send(());
/// });
///
/// crab::graceful::watch_signal(async { let _ = done_rx.await; }, []).await;
/// ```
pub async fn watch_signal<D>(
    done: D,
    extra: impl IntoIterator<Item = Arc<Bagger>>,
) -> Vec<GracefulError>
where
    D: Future<Output = ()>,
{
    GracefulShutdown::new().watch(done, extra).await
}

/// Configurable signal watcher
pub struct GracefulShutdown {
    max_wait: Duration,
    signals: Vec<Signal>,
    callback: Option<ShutdownCallback>,
    terminator: Arc<dyn Terminator>,
    bag: Arc<Bagger>,
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl GracefulShutdown {
    pub fn new() -> Self {
        Self {
            max_wait: MAX_WAIT_TIME,
            signals: DEFAULT_SIGNALS.to_vec(),
            callback: None,
            terminator: Arc::new(ProcessExit),
            bag: default_bag(),
        }
    }

    pub fn max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn signals(mut self, signals: impl IntoIterator<Item = Signal>) -> Self {
        self.signals = signals.into_iter().collect();
        self
    }

    pub fn callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ShutdownEvent) + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
        self
    }

    pub fn terminator(mut self, terminator: impl Terminator + 'static) -> Self {
        self.terminator = Arc::new(terminator);
        self
    }

    /// Replace the bagger finished after the extra ones (the process-wide one by default)
    pub fn bag(mut self, bag: Arc<Bagger>) -> Self {
        self.bag = bag;
        self
    }

    /// Apply `CRAB_GRACEFUL_MAX_WAIT` and `CRAB_SIGNALS`
    pub fn config(mut self, config: &ConfigService) -> Result<Self, ConfigError> {
        if let Some(max_wait) = config.graceful_max_wait()? {
            self.max_wait = max_wait;
        }
        if let Some(signals) = config.signals()? {
            self.signals = signals;
        }
        Ok(self)
    }

    /// Wait for `done` or a signal, finish every bagger, then terminate
    ///
    /// Returns the collected errors when the terminator lets the process live.
    pub async fn watch<D>(
        &self,
        done: D,
        extra: impl IntoIterator<Item = Arc<Bagger>>,
    ) -> Vec<GracefulError>
    where
        D: Future<Output = ()>,
    {
        let mut baggers: Vec<Arc<Bagger>> = extra.into_iter().collect();
        baggers.push(Arc::clone(&self.bag));

        let (reason, signal) = tokio::select! {
            _ = done => (REASON_DONE.to_string(), None),
            received = lifecycle::wait_for(&self.signals) => match received {
                Ok(signal) => (signal.to_string(), Some(signal.to_string())),
                Err(err) => {
                    tracing::error!(error = %err, "Failed to listen for signals");
                    (format!("signal listener failed: {err}"), None)
                }
            },
        };
        let start = ShutdownEvent::ShutdownStarted {
            reason: if signal.is_some() {
                "received signal".to_string()
            } else {
                reason.clone()
            },
            signal,
        };

        tracing::info!(reason = %reason, baggers = baggers.len(), "Graceful shutdown started");
        self.emit(start).await;

        let mut errors = Vec::new();
        let finished = tokio::time::timeout(self.max_wait, finish_all(baggers, &mut errors)).await;
        // failures arrive in completion order, report them in bagger order
        errors.sort_by_key(|err| match err {
            GracefulError::Bagger { index, .. } | GracefulError::Panicked { index, .. } => *index,
            GracefulError::Timeout(_) => usize::MAX,
        });

        let event = match finished {
            Ok(()) => {
                tracing::info!(reason = %reason, errors = errors.len(), "Graceful shutdown complete");
                ShutdownEvent::ShutdownCompleted {
                    reason,
                    error_count: errors.len(),
                }
            }
            Err(_) => {
                tracing::error!(
                    reason = %reason,
                    max_wait = %format_cost(self.max_wait),
                    "Graceful shutdown timed out"
                );
                errors.push(GracefulError::Timeout(self.max_wait));
                ShutdownEvent::ShutdownTimedOut {
                    reason,
                    max_wait: format_cost(self.max_wait),
                }
            }
        };
        self.emit(event).await;

        self.terminator.terminate(&errors);
        errors
    }

    /// Run the callback off the shutdown path; panics and slow callbacks are ignored
    async fn emit(&self, event: ShutdownEvent) {
        let callback = match &self.callback {
            Some(callback) => Arc::clone(callback),
            None => match CALLBACK.read().unwrap_or_else(PoisonError::into_inner).as_ref() {
                Some(callback) => Arc::clone(callback),
                None => return,
            },
        };

        let name = event.name();
        let call = tokio::task::spawn_blocking(move || {
            std::panic::catch_unwind(AssertUnwindSafe(|| callback(&event))).is_ok()
        });
        match tokio::time::timeout(CALLBACK_WAIT, call).await {
            Ok(Ok(true)) => {}
            Ok(_) => tracing::warn!(event = name, "Shutdown callback panicked"),
            Err(_) => tracing::warn!(event = name, "Shutdown callback is slow, not waiting"),
        }
    }
}

/// Finish every bagger on the blocking pool, pushing failures as they arrive
async fn finish_all(baggers: Vec<Arc<Bagger>>, errors: &mut Vec<GracefulError>) {
    let mut set = JoinSet::new();
    for (index, bag) in baggers.into_iter().enumerate() {
        set.spawn_blocking(move || {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| bag.finish()));
            (index, outcome)
        });
    }

    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((_, Ok(Ok(())))) => {}
            Ok((index, Ok(Err(source)))) => {
                tracing::error!(index, error = %source, "Bagger failed");
                errors.push(GracefulError::Bagger { index, source });
            }
            Ok((index, Err(payload))) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(index, message = %message, "Bagger panicked");
                errors.push(GracefulError::Panicked { index, message });
            }
            Err(join) => tracing::error!(error = %join, "Bagger task failed"),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Instant;

    struct Counting(Arc<AtomicUsize>);

    impl Terminator for Counting {
        fn terminate(&self, _errors: &[GracefulError]) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    type Events = Arc<Mutex<Vec<ShutdownEvent>>>;

    fn recorder() -> (Events, impl Fn(&ShutdownEvent) + Send + Sync + 'static) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        (events, move |event: &ShutdownEvent| {
            sink.lock().unwrap().push(event.clone())
        })
    }

    fn watcher() -> GracefulShutdown {
        GracefulShutdown::new()
            .signals(Vec::new())
            .terminator(NoopTerminator)
            .bag(Arc::new(Bagger::new()))
    }

    #[tokio::test]
    async fn test_done_finishes_every_bagger_and_reports() {
        let (events, callback) = recorder();
        let terminated = Arc::new(AtomicUsize::new(0));

        let ok = Arc::new(Bagger::new());
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        ok.register_fn(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let failing = Arc::new(Bagger::new());
        failing.register_fn(|| anyhow::bail!("queue not drained"));

        let errors = watcher()
            .callback(callback)
            .terminator(Counting(Arc::clone(&terminated)))
            .watch(async {}, [ok, failing])
            .await;

        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], GracefulError::Bagger { index: 1, .. }));
        assert!(errors[0].to_string().contains("queue not drained"));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(terminated.load(Ordering::SeqCst), 1);

        let events = events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                ShutdownEvent::ShutdownStarted {
                    reason: REASON_DONE.to_string(),
                    signal: None
                },
                ShutdownEvent::ShutdownCompleted {
                    reason: REASON_DONE.to_string(),
                    error_count: 1
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_baggers_finish_concurrently() {
        let slow = || {
            let bag = Arc::new(Bagger::new());
            bag.register_fn(|| {
                std::thread::sleep(Duration::from_millis(150));
                Ok(())
            });
            bag
        };

        let began = Instant::now();
        let errors = watcher().watch(async {}, [slow(), slow(), slow()]).await;

        assert!(errors.is_empty());
        assert!(began.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_max_wait_bounds_cleanup() {
        let (events, callback) = recorder();
        let stuck = Arc::new(Bagger::new());
        stuck.register_fn(|| {
            std::thread::sleep(Duration::from_millis(500));
            Ok(())
        });

        let began = Instant::now();
        let errors = watcher()
            .max_wait(Duration::from_millis(50))
            .callback(callback)
            .watch(async {}, [stuck])
            .await;

        assert!(began.elapsed() < Duration::from_millis(400));
        assert!(matches!(errors.as_slice(), [GracefulError::Timeout(_)]));
        let events = events.lock().unwrap().clone();
        assert_eq!(events.last().map(ShutdownEvent::name), Some("shutdown_timeout"));
    }

    #[tokio::test]
    async fn test_timeout_keeps_finished_errors_in_bagger_order() {
        let bagger = |delay: u64, fail: bool| {
            let bag = Arc::new(Bagger::new());
            bag.register_fn(move || {
                std::thread::sleep(Duration::from_millis(delay));
                if fail {
                    anyhow::bail!("cleanup {delay} failed");
                }
                Ok(())
            });
            bag
        };

        let errors = watcher()
            .max_wait(Duration::from_millis(400))
            .watch(async {}, [bagger(100, true), bagger(0, true), bagger(800, false)])
            .await;

        assert!(
            matches!(
                errors.as_slice(),
                [
                    GracefulError::Bagger { index: 0, .. },
                    GracefulError::Bagger { index: 1, .. },
                    GracefulError::Timeout(_),
                ]
            ),
            "unexpected errors: {errors:?}"
        );
    }

    #[tokio::test]
    async fn test_callback_panic_does_not_fail_shutdown() {
        let bag = Arc::new(Bagger::new());
        bag.register_fn(|| Ok(()));

        let errors = watcher()
            .callback(|_event: &ShutdownEvent| panic!("logger is gone"))
            .bag(bag)
            .watch(async {}, [])
            .await;
        assert!(errors.is_empty());
    }

    #[tokio::test]
    async fn test_bagger_panic_is_reported() {
        let bag = Arc::new(Bagger::new());
        bag.register_fn(|| {
            if true {
                panic!("cleanup exploded");
            }
            Ok(())
        });

        let errors = watcher().bag(bag).watch(async {}, []).await;
        match errors.as_slice() {
            [GracefulError::Panicked { index, message }] => {
                assert_eq!(*index, 0);
                assert_eq!(message, "cleanup exploded");
            }
            other => panic!("unexpected errors: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_waits_for_done() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            watcher()
                .watch(
                    async {
                        let _ = rx.await;
                    },
                    [],
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        tx.send(()).unwrap();
        assert!(handle.await.unwrap().is_empty());
    }

    #[test]
    fn test_event_data() {
        let event = ShutdownEvent::ShutdownTimedOut {
            reason: "SIGTERM".to_string(),
            max_wait: "60.00s".to_string(),
        };
        let data = event.data();
        assert_eq!(data["reason"], "SIGTERM");
        assert_eq!(data["max_wait"], "60.00s");
        assert!(!data.contains_key("event"));
    }
}
