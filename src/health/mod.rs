//! Liveness / readiness flags for orchestrator probes
//!
//! An app built with `.health(probe)` marks the probe ready once every start
//! action has completed and not-ready as soon as it begins stopping, so a
//! `/readyz` handler only has to read [`HealthProbe::is_ready`].

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};

static PROBE: LazyLock<Arc<HealthProbe>> = LazyLock::new(|| Arc::new(HealthProbe::new()));

/// Process-wide probe, live from first use
pub fn probe() -> Arc<HealthProbe> {
    Arc::clone(&PROBE)
}

#[derive(Debug)]
pub struct HealthProbe {
    ready: AtomicBool,
    live: AtomicBool,
}

/// Point-in-time view of a probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthStatus {
    pub live: bool,
    pub ready: bool,
}

impl Default for HealthProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthProbe {
    /// Live but not yet ready
    pub fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
            live: AtomicBool::new(true),
        }
    }

    pub fn set_ready(&self, status: bool) {
        self.ready.store(status, Ordering::Release);
    }

    pub fn set_live(&self, status: bool) {
        self.live.store(status, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub fn status(&self) -> HealthStatus {
        HealthStatus {
            live: self.is_live(),
            ready: self.is_ready(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_probe_is_live_not_ready() {
        let probe = HealthProbe::new();
        assert_eq!(
            probe.status(),
            HealthStatus {
                live: true,
                ready: false
            }
        );

        probe.set_ready(true);
        probe.set_live(false);
        assert!(probe.is_ready());
        assert!(!probe.is_live());
    }

    #[test]
    fn test_global_probe_is_shared() {
        assert!(Arc::ptr_eq(&probe(), &probe()));
        assert!(probe().is_live());
    }
}
