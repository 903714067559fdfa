//! Explicit compensation stack.
//!
//! Every acquired resource pushes the action that releases it. On any exit
//! path the orchestrator pops and runs those actions in reverse order of
//! acquisition. A failing action never stops the ones below it.

use crate::error::{CoreError, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;

type Action = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

struct Entry {
    name: &'static str,
    action: Action,
}

/// A cleanup action that failed while unwinding.
#[derive(Debug)]
pub struct TeardownFailure {
    /// Name the action was pushed under.
    pub step: &'static str,
    /// What went wrong.
    pub error: CoreError,
}

/// Stack of named async cleanup actions.
#[derive(Default)]
pub struct UnwindStack {
    entries: Vec<Entry>,
}

impl UnwindStack {
    /// Create an empty stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a cleanup action. It runs before everything pushed earlier.
    pub fn push<F, Fut>(&mut self, name: &'static str, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        tracing::trace!(step = name, depth = self.entries.len() + 1, "Cleanup registered");
        self.entries.push(Entry {
            name,
            action: Box::new(move || action().boxed()),
        });
    }

    /// Number of pending actions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no actions are pending.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Names of pending actions in the order they would run.
    pub fn pending(&self) -> Vec<&'static str> {
        self.entries.iter().rev().map(|e| e.name).collect()
    }

    /// Drop the most recent action named `name` without running it.
    ///
    /// Returns `false` if no such action is pending.
    pub fn disarm(&mut self, name: &str) -> bool {
        match self.entries.iter().rposition(|e| e.name == name) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Run every pending action, most recent first.
    ///
    /// Returns the failures in the order they occurred.
    pub async fn unwind(&mut self) -> Vec<TeardownFailure> {
        let mut failures = Vec::new();
        while let Some(entry) = self.entries.pop() {
            tracing::debug!(step = entry.name, "Unwinding");
            if let Err(error) = (entry.action)().await {
                tracing::warn!(step = entry.name, error = %error, "Cleanup step failed");
                failures.push(TeardownFailure {
                    step: entry.name,
                    error,
                });
            }
        }
        failures
    }
}

impl Drop for UnwindStack {
    /// Pending actions are finished on the current tokio runtime, so a
    /// dropped run still releases what it acquired.
    fn drop(&mut self) {
        if self.entries.is_empty() {
            return;
        }
        let pending = self.pending();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!(?pending, "Unwind stack dropped with pending cleanup, unwinding in background");
                let mut orphaned = UnwindStack {
                    entries: std::mem::take(&mut self.entries),
                };
                handle.spawn(async move {
                    let failures = orphaned.unwind().await;
                    tracing::debug!(failures = failures.len(), "Background unwind finished");
                });
            }
            Err(_) => {
                tracing::error!(?pending, "Unwind stack dropped outside a runtime, cleanup skipped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder() -> Arc<Mutex<Vec<&'static str>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[tokio::test]
    async fn test_unwind_runs_in_reverse_order() {
        let log = recorder();
        let mut stack = UnwindStack::new();
        for name in ["sandbox", "container", "process"] {
            let log = Arc::clone(&log);
            stack.push(name, move || async move {
                log.lock().unwrap().push(name);
                Ok::<(), CoreError>(())
            });
        }
        assert_eq!(stack.pending(), vec!["process", "container", "sandbox"]);

        let failures = stack.unwind().await;
        assert!(failures.is_empty());
        assert!(stack.is_empty());
        assert_eq!(*log.lock().unwrap(), vec!["process", "container", "sandbox"]);
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_unwind() {
        let log = recorder();
        let mut stack = UnwindStack::new();
        let first = Arc::clone(&log);
        stack.push("sandbox", move || async move {
            first.lock().unwrap().push("sandbox");
            Ok::<(), CoreError>(())
        });
        stack.push("container", || async {
            Err::<(), _>(CoreError::Teardown("container stuck".into()))
        });

        let failures = stack.unwind().await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].step, "container");
        assert_eq!(*log.lock().unwrap(), vec!["sandbox"]);
    }

    #[tokio::test]
    async fn test_drop_unwinds_in_background() {
        let log = recorder();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let mut stack = UnwindStack::new();
        {
            let log = Arc::clone(&log);
            stack.push("sandbox", move || async move {
                log.lock().unwrap().push("sandbox");
                let _ = done_tx.send(());
                Ok::<(), CoreError>(())
            });
        }
        {
            let log = Arc::clone(&log);
            stack.push("container", move || async move {
                log.lock().unwrap().push("container");
                Ok::<(), CoreError>(())
            });
        }

        drop(stack);
        tokio::time::timeout(std::time::Duration::from_secs(5), done_rx)
            .await
            .expect("background unwind should finish")
            .unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["container", "sandbox"]);
    }

    #[test]
    fn test_drop_outside_runtime_does_not_panic() {
        let mut stack = UnwindStack::new();
        stack.push("sandbox", || async { Ok::<(), CoreError>(()) });
        drop(stack);
    }

    #[tokio::test]
    async fn test_disarm_skips_action() {
        let log = recorder();
        let mut stack = UnwindStack::new();
        for name in ["sandbox", "container"] {
            let log = Arc::clone(&log);
            stack.push(name, move || async move {
                log.lock().unwrap().push(name);
                Ok::<(), CoreError>(())
            });
        }

        assert!(stack.disarm("container"));
        assert!(!stack.disarm("container"));
        assert_eq!(stack.len(), 1);

        stack.unwind().await;
        assert_eq!(*log.lock().unwrap(), vec!["sandbox"]);
    }
}
