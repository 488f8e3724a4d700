//! # Crab
//!
//! Application lifecycle coordination for long-running Rust services.
//!
//! Crab starts an application's components in order, keeps them running until
//! a termination signal arrives (or someone calls `stop`), and then stops them
//! in reverse order within a bounded time, reporting every component that
//! failed to stop.
//!
//! ## Features
//!
//! - **Ordered hooks**: start in registration order, stop in reverse
//! - **Rollback**: a failed or timed-out startup stops whatever already started
//! - **Error aggregation**: every stop failure is collected and named
//! - **Panic isolation**: a panicking hook becomes an error, never a crash
//! - **Graceful watcher**: signal-driven cleanup with a hard deadline
//! - **Shutdown manager**: stop many apps in one process concurrently
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use crab::prelude::*;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     crab::logging::init(&Default::default());
//!
//!     let app = App::builder()
//!         .name("orders")
//!         .startup_timeout(Duration::from_secs(30))
//!         .build();
//!
//!     app.add([
//!         Hook::new("database")
//!             .with_start(|_ctx| async move {
//!                 tracing::info!("Opening pool");
//!                 Ok(())
//!             })
//!             .with_stop(|_ctx| async move {
//!                 tracing::info!("Closing pool");
//!                 Ok(())
//!             }),
//!         Hook::new("http").with_start(|ctx: HookContext| async move {
//!             let token = ctx.token().clone();
//!             tokio::spawn(async move { token.cancelled().await });
//!             Ok(())
//!         }),
//!     ]);
//!
//!     // blocks until SIGTERM/SIGINT, then stops both hooks in reverse order
//!     app.run().await?;
//!     Ok(())
//! }
//! ```

pub mod bag;
pub mod common;
pub mod config;
pub mod error;
pub mod graceful;
pub mod health;
pub mod lifecycle;
pub mod logging;

// Re-export core types
pub use bag::{BagError, Bagger};
pub use config::ConfigService;
pub use error::{ConfigError, CrabError, Result};
pub use lifecycle::{App, AppBuilder, Hook, HookContext, LifecycleError, ShutdownManager, State};

// Re-export commonly used types from dependencies
pub use async_trait::async_trait;

/// Prelude module for convenient imports
///
/// ```
/// use crab::prelude::*;
/// ```
pub mod prelude {
    pub use crate::bag::{Bagger, FuncErr};
    pub use crate::config::ConfigService;
    pub use crate::error::{CrabError, Result};
    pub use crate::graceful::{GracefulShutdown, NoopTerminator, ShutdownEvent, Terminator};
    pub use crate::health::HealthProbe;
    pub use crate::lifecycle::{
        App, AppBuilder, Component, Hook, HookContext, HookResult, Lifecycle, LifecycleError,
        Registry, ShutdownManager, Signal, State, shutdown_signal,
    };
    pub use crate::logging::{Logger, NoopLogger, TracingLogger};
    pub use async_trait::async_trait;
    pub use std::sync::Arc;
}
