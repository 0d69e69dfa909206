//! Cleanup-on-failure wrapping for owner operations.
//!
//! Every owner type (session, context, program, kernel, queue) declares the
//! operations that get wrapped up front. When a wrapped operation fails, the
//! owner releases everything it holds (if the cleanup policy is on) and the
//! error is re-raised as `Owner.operation: original message`. Failed calls are
//! never retried.

use crate::error::{ClError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::thread::{self, ThreadId};

/// What an owner exposes to its dispatcher.
pub trait Owner {
    /// Releases every resource the owner holds, transitively.
    fn release_all(&self) -> Result<()>;

    /// One-line state summary for diagnostics.
    fn snapshot(&self) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    pub cleanup: bool,
    pub debug: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self { cleanup: true, debug: false }
    }
}

pub struct CleanupDispatcher {
    owner_type: &'static str,
    operations: &'static [&'static str],
    policy: Policy,
    /// Wrapped-call nesting per calling thread.
    depths: Mutex<HashMap<ThreadId, usize>>,
}

impl CleanupDispatcher {
    #[must_use]
    pub fn new(
        owner_type: &'static str,
        operations: &'static [&'static str],
        policy: Policy,
    ) -> Self {
        Self { owner_type, operations, policy, depths: Mutex::new(HashMap::new()) }
    }

    #[must_use]
    pub fn wraps(&self, operation: &str) -> bool {
        self.operations.contains(&operation)
    }

    #[must_use]
    pub fn policy(&self) -> Policy {
        self.policy
    }

    /// Runs `f` as `owner.operation(args)`.
    ///
    /// Operations outside the declared list run bare. Nested wrapped calls on
    /// the same dispatcher and thread pass failures through untouched; only
    /// the outermost one cleans up and adds context. Calls on other threads
    /// are never nested in each other.
    pub fn run<T>(
        &self,
        owner: &dyn Owner,
        operation: &'static str,
        args: &dyn fmt::Debug,
        f: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        if !self.wraps(operation) {
            return f();
        }
        let guard = DepthGuard::enter(&self.depths);
        let err = match f() {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        if !guard.is_outermost() {
            return Err(err);
        }

        if self.policy.debug {
            tracing::error!(
                owner = self.owner_type,
                operation,
                arguments = ?args,
                state = %owner.snapshot(),
                "exception trapped: {err}"
            );
        }
        if self.policy.cleanup {
            if let Err(cleanup_err) = owner.release_all() {
                tracing::warn!(
                    owner = self.owner_type,
                    operation,
                    "cleanup after failure did not complete: {cleanup_err}"
                );
            }
        }
        Err(ClError::Operation {
            owner: self.owner_type,
            operation,
            source: Box::new(err),
        })
    }
}

struct DepthGuard<'a> {
    depths: &'a Mutex<HashMap<ThreadId, usize>>,
    thread: ThreadId,
    level: usize,
}

impl<'a> DepthGuard<'a> {
    fn enter(depths: &'a Mutex<HashMap<ThreadId, usize>>) -> Self {
        let thread = thread::current().id();
        let mut map = depths.lock();
        let level = map.entry(thread).or_insert(0);
        *level += 1;
        let level = *level;
        drop(map);
        Self { depths, thread, level }
    }

    fn is_outermost(&self) -> bool {
        self.level == 1
    }
}

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        let mut map = self.depths.lock();
        if let Some(level) = map.get_mut(&self.thread) {
            *level -= 1;
            if *level == 0 {
                map.remove(&self.thread);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::registry::NamedRegistry;
    use crate::resource::Releasable;
    use crate::testing::TestHandle;
    use std::sync::atomic::Ordering;
    use std::sync::mpsc;

    const OPS: &[&str] = &["create", "nested", "outer"];

    struct Holder {
        items: NamedRegistry<TestHandle>,
        dispatcher: CleanupDispatcher,
    }

    impl Holder {
        fn new(policy: Policy) -> Self {
            Self {
                items: NamedRegistry::new(),
                dispatcher: CleanupDispatcher::new("Holder", OPS, policy),
            }
        }

        fn create(&self, name: &str, fail: bool) -> Result<()> {
            self.dispatcher.run(self, "create", &name, || {
                if fail {
                    return Err(ProviderError::new(-5, "OUT_OF_RESOURCES").into());
                }
                self.items.insert(TestHandle::new(name));
                Ok(())
            })
        }

        fn outer(&self) -> Result<()> {
            self.dispatcher.run(self, "outer", &(), || {
                self.create("late", true)?;
                Ok(())
            })
        }

        fn unwrapped(&self) -> Result<()> {
            self.dispatcher.run(self, "peek", &(), || {
                Err(ProviderError::new(-1, "DEVICE_NOT_FOUND").into())
            })
        }
    }

    impl Owner for Holder {
        fn release_all(&self) -> Result<()> {
            self.items.release_all()
        }

        fn snapshot(&self) -> String {
            format!("Holder {{ items: {:?} }}", self.items.names())
        }
    }

    #[test]
    fn failure_releases_prior_resources() {
        let holder = Holder::new(Policy::default());
        holder.create("a", false).unwrap();
        holder.create("b", false).unwrap();
        let a = holder.items.lookup("a").unwrap();
        let b = holder.items.lookup("b").unwrap();

        let err = holder.create("c", true).unwrap_err();
        assert_eq!(err.to_string(), "Holder.create: provider error -5: OUT_OF_RESOURCES");
        assert!(a.is_released());
        assert!(b.is_released());
        assert!(holder.items.is_empty());
    }

    #[test]
    fn cleanup_disabled_keeps_resources() {
        let holder = Holder::new(Policy { cleanup: false, debug: true });
        holder.create("a", false).unwrap();
        let a = holder.items.lookup("a").unwrap();
        assert!(holder.create("b", true).is_err());
        assert!(!a.is_released());
        assert_eq!(holder.items.len(), 1);
    }

    #[test]
    fn nested_failure_cleans_up_once_with_outer_context() {
        let holder = Holder::new(Policy::default());
        holder.create("a", false).unwrap();
        let a = holder.items.lookup("a").unwrap();

        let err = holder.outer().unwrap_err();
        assert_eq!(err.to_string(), "Holder.outer: provider error -5: OUT_OF_RESOURCES");
        assert!(matches!(err.root_cause(), ClError::ExternalProvider(_)));
        assert_eq!(a.release_calls.load(Ordering::SeqCst), 1);
        assert!(holder.dispatcher.depths.lock().is_empty());
    }

    #[test]
    fn undeclared_operations_run_bare() {
        let holder = Holder::new(Policy::default());
        holder.create("a", false).unwrap();
        let err = holder.unwrapped().unwrap_err();
        assert!(matches!(err, ClError::ExternalProvider(_)));
        assert_eq!(holder.items.len(), 1);
        assert!(!holder.dispatcher.wraps("peek"));
    }

    #[test]
    fn success_passes_through() {
        let holder = Holder::new(Policy::default());
        let value = holder
            .dispatcher
            .run(&holder, "create", &(), || Ok::<_, ClError>(42))
            .unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn failure_on_one_thread_is_outermost_while_another_is_inside_a_call() {
        let holder = Holder::new(Policy::default());
        holder.create("a", false).unwrap();
        let a = holder.items.lookup("a").unwrap();

        let (entered_tx, entered_rx) = mpsc::channel();
        let (resume_tx, resume_rx) = mpsc::channel::<()>();
        let holder = &holder;
        thread::scope(|s| {
            let busy = s.spawn(move || {
                holder.dispatcher.run(holder, "outer", &(), || {
                    entered_tx.send(()).unwrap();
                    resume_rx.recv().unwrap();
                    Ok::<_, ClError>(())
                })
            });
            entered_rx.recv().unwrap();

            let err = holder.create("b", true).unwrap_err();
            assert_eq!(err.to_string(), "Holder.create: provider error -5: OUT_OF_RESOURCES");
            assert!(a.is_released());

            resume_tx.send(()).unwrap();
            busy.join().unwrap().unwrap();
        });
        assert!(holder.dispatcher.depths.lock().is_empty());
    }

    #[test]
    fn concurrent_failures_each_get_context() {
        let holder = Holder::new(Policy { cleanup: false, debug: false });
        thread::scope(|s| {
            let workers: Vec<_> = (0..8)
                .map(|i| {
                    let holder = &holder;
                    s.spawn(move || holder.create(&format!("w{i}"), true).unwrap_err())
                })
                .collect();
            for worker in workers {
                let err = worker.join().unwrap();
                assert!(matches!(err, ClError::Operation { owner: "Holder", operation: "create", .. }));
            }
        });
        assert!(holder.dispatcher.depths.lock().is_empty());
    }
}
