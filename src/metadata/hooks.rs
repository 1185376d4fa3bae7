//! Flush hooks
//!
//! Named callbacks run, in registration order, whenever the metadata
//! cache is flushed. A failing or panicking hook is logged and skipped;
//! the remaining hooks and the flush itself still complete.

use parking_lot::RwLock;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, error};

/// What a flush covered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushScope {
    /// One object on every instance
    Object(String),
    /// Every object of one instance
    Instance(String),
    All,
}

impl fmt::Display for FlushScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlushScope::Object(name) => write!(f, "object:{}", name),
            FlushScope::Instance(id) => write!(f, "instance:{}", id),
            FlushScope::All => f.write_str("all"),
        }
    }
}

type FlushCallback = Box<dyn Fn(&FlushScope) -> anyhow::Result<()> + Send + Sync>;

/// Outcome of running the hooks once
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub ran: usize,
    pub failed: Vec<String>,
}

#[derive(Default)]
pub struct FlushHooks {
    hooks: RwLock<Vec<(String, FlushCallback)>>,
}

impl FlushHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a hook; a hook with the same name is replaced in place
    pub fn register<F>(&self, name: impl Into<String>, hook: F)
    where
        F: Fn(&FlushScope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let name = name.into();
        let mut hooks = self.hooks.write();
        if let Some(slot) = hooks.iter_mut().find(|(existing, _)| *existing == name) {
            slot.1 = Box::new(hook);
        } else {
            hooks.push((name, Box::new(hook)));
        }
    }

    pub fn unregister(&self, name: &str) -> bool {
        let mut hooks = self.hooks.write();
        let before = hooks.len();
        hooks.retain(|(existing, _)| existing != name);
        hooks.len() != before
    }

    pub fn names(&self) -> Vec<String> {
        self.hooks.read().iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn run(&self, scope: &FlushScope) -> FlushReport {
        let hooks = self.hooks.read();
        let mut report = FlushReport::default();
        for (name, hook) in hooks.iter() {
            report.ran += 1;
            match catch_unwind(AssertUnwindSafe(|| hook(scope))) {
                Ok(Ok(())) => debug!(hook = %name, scope = %scope, "Flush hook ran"),
                Ok(Err(e)) => {
                    error!(hook = %name, scope = %scope, error = %e, "Flush hook failed");
                    report.failed.push(name.clone());
                }
                Err(_) => {
                    error!(hook = %name, scope = %scope, "Flush hook panicked");
                    report.failed.push(name.clone());
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_hooks_run_in_order_despite_failures() {
        let hooks = FlushHooks::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let log = seen.clone();
        hooks.register("first", move |_| {
            log.lock().push("first");
            Ok(())
        });
        hooks.register("broken", |_| anyhow::bail!("downstream cache unreachable"));
        hooks.register("panicky", |_| panic!("hook bug"));
        let log = seen.clone();
        hooks.register("last", move |scope| {
            assert_eq!(scope, &FlushScope::All);
            log.lock().push("last");
            Ok(())
        });

        let report = hooks.run(&FlushScope::All);
        assert_eq!(report.ran, 4);
        assert_eq!(report.failed, vec!["broken".to_string(), "panicky".to_string()]);
        assert_eq!(*seen.lock(), vec!["first", "last"]);
    }

    #[test]
    fn test_register_replaces_and_unregister_removes() {
        let hooks = FlushHooks::new();
        hooks.register("a", |_| Ok(()));
        hooks.register("b", |_| Ok(()));
        hooks.register("a", |_| anyhow::bail!("replaced"));
        assert_eq!(hooks.names(), vec!["a".to_string(), "b".to_string()]);

        assert!(hooks.unregister("a"));
        assert!(!hooks.unregister("a"));
        assert_eq!(hooks.run(&FlushScope::Object("dbo.MyTvp".into())).failed.len(), 0);
    }
}
