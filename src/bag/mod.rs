//! One-shot, fail-fast callback collector
//!
//! A [`Bagger`] gathers zero-argument cleanup callbacks and runs them exactly
//! once, in registration order, stopping at the first error. This is a
//! different policy from the app's stop phase, which keeps going and collects
//! every failure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

/// A fallible zero-argument callback
pub type FuncErr = Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

/// Box a closure into a [`FuncErr`]
pub fn func<F>(f: F) -> FuncErr
where
    F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// The first callback failure of a [`Bagger::finish`] pass
#[derive(Debug, Error)]
#[error("callback #{index} failed: {source}")]
pub struct BagError {
    /// Position of the failing callback in registration order
    pub index: usize,
    #[source]
    pub source: anyhow::Error,
}

/// Ordered callbacks with at-most-once `finish`
///
/// The first `finish` call runs the callbacks and reports the first error.
/// A call that loses a race with the first blocks until that pass is over;
/// it and every later call then return `Ok(())` without running anything: the
/// first outcome is not replayed. Callbacks registered after `finish` has
/// begun are never run. A callback must not call `finish` on its own bagger.
///
/// # Example
///
/// ```rust,ignore
/// use crab::bag::Bagger;
///
/// let bag = Bagger::new();
/// bag.register_fn(|| flush_metrics());
/// bag.register_fn(|| close_files());
/// bag.finish()?;
/// ```
#[derive(Default)]
pub struct Bagger {
    list: Mutex<Vec<FuncErr>>,
    /// Held for the whole pass; `true` once a pass has begun
    once: Mutex<bool>,
    finished: AtomicBool,
}

impl Bagger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append callbacks
    pub fn register(&self, fns: impl IntoIterator<Item = FuncErr>) {
        self.lock().extend(fns);
    }

    /// Append a single closure
    pub fn register_fn<F>(&self, f: F)
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.lock().push(func(f));
    }

    /// Run the callbacks once, in order, stopping at the first error
    pub fn finish(&self) -> Result<(), BagError> {
        // a panicking callback poisons the guard after the flag is set
        let mut ran = self.once.lock().unwrap_or_else(PoisonError::into_inner);
        if *ran {
            return Ok(());
        }
        *ran = true;
        self.finished.store(true, Ordering::Release);

        let list = self.lock().clone();
        for (index, callback) in list.iter().enumerate() {
            callback().map_err(|source| BagError { index, source })?;
        }
        Ok(())
    }

    /// A new, unfinished bagger holding a snapshot of the pending callbacks
    pub fn copy(&self) -> Bagger {
        Bagger {
            list: Mutex::new(self.lock().clone()),
            once: Mutex::new(false),
            finished: AtomicBool::new(false),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a `finish` pass has begun
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<FuncErr>> {
        self.list.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Bagger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bagger")
            .field("callbacks", &self.len())
            .field("finished", &self.is_finished())
            .finish()
    }
}
