//! Termination signals
//!
//! Listens for OS signals (SIGTERM, SIGINT by default) and reports which one
//! arrived. On non-Unix targets only Ctrl+C can be observed.

use serde::Serialize;
use std::io;
use strum_macros::{AsRefStr, Display, EnumString};

/// A process signal an app can watch for
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr, Serialize,
)]
#[strum(ascii_case_insensitive)]
pub enum Signal {
    #[strum(to_string = "SIGTERM", serialize = "TERM", serialize = "TERMINATE")]
    Terminate,
    #[strum(to_string = "SIGINT", serialize = "INT", serialize = "INTERRUPT")]
    Interrupt,
    #[strum(to_string = "SIGHUP", serialize = "HUP", serialize = "HANGUP")]
    Hangup,
    #[strum(to_string = "SIGQUIT", serialize = "QUIT")]
    Quit,
    #[strum(to_string = "SIGUSR1", serialize = "USR1")]
    User1,
    #[strum(to_string = "SIGUSR2", serialize = "USR2")]
    User2,
}

/// SIGTERM and SIGINT
pub const DEFAULT_SIGNALS: [Signal; 2] = [Signal::Terminate, Signal::Interrupt];

#[cfg(unix)]
impl Signal {
    fn kind(self) -> tokio::signal::unix::SignalKind {
        use tokio::signal::unix::SignalKind;
        match self {
            Signal::Terminate => SignalKind::terminate(),
            Signal::Interrupt => SignalKind::interrupt(),
            Signal::Hangup => SignalKind::hangup(),
            Signal::Quit => SignalKind::quit(),
            Signal::User1 => SignalKind::user_defined1(),
            Signal::User2 => SignalKind::user_defined2(),
        }
    }
}

/// Wait until any of `signals` is delivered
///
/// Handlers are installed when the future is first polled and stop listening
/// when it is dropped. An empty set never resolves.
#[cfg(unix)]
pub async fn wait_for(signals: &[Signal]) -> io::Result<Signal> {
    use std::task::Poll;
    use tokio::signal::unix::signal;

    let mut streams = signals
        .iter()
        .map(|s| -> io::Result<_> { Ok((*s, signal(s.kind())?)) })
        .collect::<io::Result<Vec<_>>>()?;

    std::future::poll_fn(|cx| {
        for (sig, stream) in streams.iter_mut() {
            if stream.poll_recv(cx).is_ready() {
                return Poll::Ready(Ok(*sig));
            }
        }
        Poll::Pending
    })
    .await
}

/// Wait until any of `signals` is delivered
#[cfg(not(unix))]
pub async fn wait_for(signals: &[Signal]) -> io::Result<Signal> {
    if signals.is_empty() {
        std::future::pending::<()>().await;
    }
    tokio::signal::ctrl_c().await?;
    Ok(Signal::Interrupt)
}

/// Create a future that completes when SIGTERM or SIGINT is received
///
/// # Example
///
/// ```rust,ignore
/// use crab::lifecycle::shutdown_signal;
///
/// tokio::select! {
///     _ = shutdown_signal() => {
///         println!("Shutdown signal received");
///     }
///     _ = server.serve() => {}
/// }
/// ```
pub async fn shutdown_signal() -> io::Result<Signal> {
    let signal = wait_for(&DEFAULT_SIGNALS).await?;
    tracing::info!(%signal, "Received shutdown signal");
    Ok(signal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_signal_names_parse() {
        assert_eq!(Signal::from_str("SIGTERM").unwrap(), Signal::Terminate);
        assert_eq!(Signal::from_str("term").unwrap(), Signal::Terminate);
        assert_eq!(Signal::from_str("Interrupt").unwrap(), Signal::Interrupt);
        assert_eq!(Signal::from_str("usr1").unwrap(), Signal::User1);
        assert!(Signal::from_str("SIGKILL").is_err());
    }

    #[test]
    fn test_signal_display() {
        assert_eq!(Signal::Terminate.to_string(), "SIGTERM");
        assert_eq!(Signal::Hangup.to_string(), "SIGHUP");
    }

    #[tokio::test]
    async fn test_empty_set_never_resolves() {
        let waited =
            tokio::time::timeout(std::time::Duration::from_millis(20), wait_for(&[])).await;
        assert!(waited.is_err());
    }
}
