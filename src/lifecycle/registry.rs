//! Hook staging area for resource constructors
//!
//! Constructors take a `&dyn Lifecycle` and append their own cleanup instead of
//! returning closures or holding a reference to the running app.

use super::Hook;
use std::sync::{Mutex, PoisonError};

/// Anything that accepts lifecycle hooks
///
/// # Example
///
/// ```rust,ignore
/// use crab::lifecycle::{Hook, Lifecycle};
///
/// pub fn new_redis(config: &RedisConfig, lc: &dyn Lifecycle) -> anyhow::Result<Client> {
///     let client = Client::open(config.url.as_str())?;
///     let closer = client.clone();
///     lc.append(Hook::close(move || closer.close()).named("redis"));
///     Ok(client)
/// }
/// ```
pub trait Lifecycle: Send + Sync {
    fn append(&self, hook: Hook);
}

/// Thread-safe, append-only list of hooks
///
/// Typically shared by every provider during wiring; its contents are then
/// handed to the app with `app.add(registry.hooks())`.
#[derive(Debug, Default)]
pub struct Registry {
    hooks: Mutex<Vec<Hook>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the registered hooks, independent of the registry
    pub fn hooks(&self) -> Vec<Hook> {
        self.hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.hooks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Lifecycle for Registry {
    fn append(&self, hook: Hook) {
        self.hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(hook);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_hooks_returns_independent_copy() {
        let registry = Registry::new();
        registry.append(Hook::new("db"));

        let mut snapshot = registry.hooks();
        snapshot.push(Hook::new("cache"));
        snapshot[0].name = Some("renamed".into());

        let hooks = registry.hooks();
        assert_eq!(hooks.len(), 1);
        assert_eq!(hooks[0].name.as_deref(), Some("db"));
    }

    #[test]
    fn test_concurrent_append() {
        let registry = Arc::new(Registry::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for j in 0..25 {
                        registry.append(Hook::new(format!("provider-{i}-{j}")));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.len(), 200);
    }

    #[test]
    fn test_providers_register_through_trait_object() {
        fn provide(lc: &dyn Lifecycle) {
            lc.append(Hook::close(|| Ok(())).named("pool"));
        }

        let registry = Registry::new();
        provide(&registry);
        assert_eq!(registry.hooks()[0].name.as_deref(), Some("pool"));
    }
}
