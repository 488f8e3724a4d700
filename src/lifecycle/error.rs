//! Lifecycle-specific error types

use super::ContextError;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Why a single start or stop action failed
#[derive(Debug, Error)]
pub enum HookError {
    /// The action returned an error
    #[error(transparent)]
    Failed(anyhow::Error),

    /// The action panicked; the panic was recovered at the call boundary
    #[error("panic recovered: {message}")]
    Panicked {
        /// Panic payload rendered as text
        message: String,
        /// Stack captured where the panic was recovered
        backtrace: String,
    },

    /// The action did not return before the context deadline
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The action was skipped because the shutdown context was already done
    #[error("shutdown aborted: {0}")]
    Aborted(ContextError),
}

impl HookError {
    pub(crate) fn panicked(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&str>() {
            (*message).to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::Panicked {
            message,
            backtrace: std::backtrace::Backtrace::force_capture().to_string(),
        }
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, Self::Panicked { .. })
    }
}

/// A stop action failure attributed to its hook
#[derive(Debug, Error)]
#[error("[{name}] stop failed: {source}")]
pub struct ComponentError {
    /// Hook name, or `hook#<index>` for unnamed hooks
    pub name: String,
    #[source]
    pub source: HookError,
}

/// Every failure collected during one stop phase, in the order they happened
#[derive(Debug)]
pub struct ShutdownErrors {
    errors: Vec<ComponentError>,
}

impl ShutdownErrors {
    pub(crate) fn new(errors: Vec<ComponentError>) -> Self {
        Self { errors }
    }

    pub fn errors(&self) -> &[ComponentError] {
        &self.errors
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Names of the hooks that failed to stop
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.errors.iter().map(|e| e.name.as_str())
    }

    pub fn into_inner(self) -> Vec<ComponentError> {
        self.errors
    }
}

impl fmt::Display for ShutdownErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shutdown errors: ")?;
        for (i, error) in self.errors.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ShutdownErrors {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.errors
            .first()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Errors returned by [`App`](super::App) operations
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// `run` was called on an app that already left the `New` state
    #[error("app already started")]
    AlreadyStarted,

    /// A start action failed; already-started hooks were rolled back
    #[error("failed to start [{hook}]: {source}")]
    StartFailed {
        hook: String,
        #[source]
        source: HookError,
    },

    /// The start phase did not finish within the startup timeout
    #[error("app startup timed out after {timeout:?}")]
    StartupTimeout { timeout: Duration },

    /// `stop` was requested while the app was still starting
    #[error("app startup canceled")]
    StartCancelled,

    /// One or more stop actions failed
    #[error(transparent)]
    Shutdown(#[from] ShutdownErrors),

    /// `stop` gave up waiting for a concurrent start to roll back
    #[error("timed out waiting for app to stop")]
    StopTimeout,
}

impl LifecycleError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::StartupTimeout { .. } | Self::StopTimeout)
    }

    /// Name of the hook a start failure originated from
    pub fn hook(&self) -> Option<&str> {
        match self {
            Self::StartFailed { hook, .. } => Some(hook),
            _ => None,
        }
    }

    /// Collected stop failures, if this is a shutdown error
    pub fn shutdown_errors(&self) -> Option<&ShutdownErrors> {
        match self {
            Self::Shutdown(errors) => Some(errors),
            _ => None,
        }
    }
}

/// A specialized Result type for lifecycle operations
pub type Result<T> = std::result::Result<T, LifecycleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_errors_enumerate_every_component() {
        let errors = ShutdownErrors::new(vec![
            ComponentError {
                name: "db".into(),
                source: HookError::Failed(anyhow::anyhow!("connection reset")),
            },
            ComponentError {
                name: "hook#0".into(),
                source: HookError::DeadlineExceeded,
            },
        ]);

        let rendered = errors.to_string();
        assert_eq!(
            rendered,
            "shutdown errors: [db] stop failed: connection reset; [hook#0] stop failed: deadline exceeded"
        );
        assert_eq!(errors.names().collect::<Vec<_>>(), vec!["db", "hook#0"]);
    }

    #[test]
    fn test_panic_payloads_are_rendered() {
        let from_str = HookError::panicked(Box::new("boom"));
        let from_string = HookError::panicked(Box::new(String::from("bang")));
        let opaque = HookError::panicked(Box::new(42_u8));

        assert_eq!(from_str.to_string(), "panic recovered: boom");
        assert_eq!(from_string.to_string(), "panic recovered: bang");
        assert!(opaque.is_panic());
    }
}
