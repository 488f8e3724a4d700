//! Lifecycle Module
//!
//! Ordered startup and reverse-order shutdown of an application's components.
//!
//! # Lifecycle Phases
//!
//! ```text
//! 1. Hook registration (App::add / Registry)
//!    ↓
//! 2. Start phase: on_start of each hook, in order   ← startup timeout
//!    ↓                         └─ failure: stop what already started
//! 3. Running
//!    ↓
//! 4. Signal (SIGTERM/SIGINT) or App::stop
//!    ↓
//! 5. on_shutdown notifications, readiness cleared
//!    ↓
//! 6. Stop phase: on_stop of each started hook, reversed   ← shutdown timeout
//!    ↓
//! 7. Stopped
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use crab::lifecycle::{App, Hook};
//!
//! let app = App::new();
//! app.add([
//!     Hook::new("database")
//!         .with_start(|_ctx| async move {
//!             tracing::info!("Opening database pool");
//!             Ok(())
//!         })
//!         .with_stop(|_ctx| async move {
//!             tracing::info!("Closing database pool");
//!             Ok(())
//!         }),
//! ]);
//! app.run().await?;
//! ```

mod application;
mod context;
mod error;
pub mod global;
mod hook;
mod manager;
mod registry;
mod signal;

pub use application::{App, AppBuilder, State, DEFAULT_SHUTDOWN_TIMEOUT};
pub use context::{ContextError, HookContext};
pub use error::{ComponentError, HookError, LifecycleError, Result, ShutdownErrors};
pub use hook::{action, BoxFuture, Component, Hook, HookResult, Runner, Stopper};
pub use manager::{generate_app_id, AppFailure, ManagerError, ShutdownManager};
pub use registry::{Lifecycle, Registry};
pub use signal::{shutdown_signal, wait_for, Signal, DEFAULT_SIGNALS};
