// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Task registry for long-running engine calls started by reconcilers.
//!
//! A reconciler must not block its caller for the length of an attach or a
//! migration. It starts the call here under a deterministic key and returns
//! `NotYet`; on its next invocation it polls the key and picks up the result.
//! A completion hook runs once the result is pollable, so whatever it
//! triggers never observes the task as still pending.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("Task {0} was cancelled")]
    Cancelled(String),

    #[error("Task {0} panicked")]
    Panicked(String),
}

/// Result of polling a key.
#[derive(Debug)]
pub enum TaskStatus<T> {
    /// Nothing registered under the key.
    Absent,
    Pending,
    /// Finished; the entry has been removed from the registry.
    Done(Result<T, TaskError>),
}

struct TaskEntry<T> {
    output: Arc<Mutex<Option<T>>>,
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

pub struct TaskRegistry<T> {
    tasks: DashMap<String, TaskEntry<T>>,
}

impl<T: Send + 'static> TaskRegistry<T> {
    pub fn new() -> Self {
        Self {
            tasks: DashMap::new(),
        }
    }

    /// Spawn `future` under `key`. Returns `false` and drops `future` if a
    /// task with that key is already registered.
    pub fn start<F>(&self, key: impl Into<String>, future: F) -> bool
    where
        F: Future<Output = T> + Send + 'static,
    {
        self.start_with(key, future, |_| {})
    }

    /// Like [`start`](Self::start), calling `on_finish` with the output once
    /// [`poll`](Self::poll) can return it. Not called on cancellation.
    pub fn start_with<F, N>(&self, key: impl Into<String>, future: F, on_finish: N) -> bool
    where
        F: Future<Output = T> + Send + 'static,
        N: FnOnce(&T) + Send + 'static,
    {
        let key = key.into();
        match self.tasks.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let cancel = CancellationToken::new();
                let token = cancel.clone();
                let output = Arc::new(Mutex::new(None));
                let task_output = output.clone();
                let handle = tokio::spawn(async move {
                    tokio::select! {
                        _ = token.cancelled() => {}
                        result = future => {
                            let mut stored = task_output.lock();
                            on_finish(stored.insert(result));
                        }
                    }
                });
                debug!(task = %key, "Started background task");
                slot.insert(TaskEntry { output, handle, cancel });
                true
            }
        }
    }

    pub fn poll(&self, key: &str) -> TaskStatus<T> {
        let result = {
            let Some(entry) = self.tasks.get(key) else {
                return TaskStatus::Absent;
            };
            let output = entry.output.lock().take();
            match output {
                Some(output) => Ok(output),
                None if !entry.handle.is_finished() => return TaskStatus::Pending,
                None if entry.cancel.is_cancelled() => Err(TaskError::Cancelled(key.to_string())),
                None => {
                    warn!(task = %key, "Background task panicked");
                    Err(TaskError::Panicked(key.to_string()))
                }
            }
        };
        self.tasks.remove(key);
        TaskStatus::Done(result)
    }

    /// Cancel and forget the task under `key`. Returns whether one existed.
    pub fn cancel(&self, key: &str) -> bool {
        match self.tasks.remove(key) {
            Some((_, entry)) => {
                entry.cancel.cancel();
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        let keys: Vec<String> = self.tasks.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.cancel(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl<T: Send + 'static> Default for TaskRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    async fn wait_until_done(registry: &TaskRegistry<u32>, key: &str) -> Result<u32, TaskError> {
        loop {
            match registry.poll(key) {
                TaskStatus::Done(result) => return result,
                TaskStatus::Pending => tokio::task::yield_now().await,
                TaskStatus::Absent => panic!("task {} vanished", key),
            }
        }
    }

    #[tokio::test]
    async fn test_poll_lifecycle() {
        let registry = TaskRegistry::new();
        assert!(matches!(registry.poll("k"), TaskStatus::Absent));

        let (tx, rx) = oneshot::channel::<()>();
        assert!(registry.start("k", async move {
            let _ = rx.await;
            7
        }));
        assert!(matches!(registry.poll("k"), TaskStatus::Pending));

        tx.send(()).unwrap();
        assert_eq!(wait_until_done(&registry, "k").await, Ok(7));
        assert!(matches!(registry.poll("k"), TaskStatus::Absent));
    }

    #[tokio::test]
    async fn test_duplicate_key_is_rejected() {
        let registry = TaskRegistry::new();
        assert!(registry.start("k", async { 1 }));
        assert!(!registry.start("k", async { 2 }));
        assert_eq!(wait_until_done(&registry, "k").await, Ok(1));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_removes_task() {
        let registry: TaskRegistry<u32> = TaskRegistry::new();
        registry.start("slow", async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            1
        });
        assert!(registry.cancel("slow"));
        assert!(!registry.cancel("slow"));
        assert!(matches!(registry.poll("slow"), TaskStatus::Absent));
    }

    #[tokio::test]
    async fn test_result_is_pollable_once_hook_fires() {
        let registry = TaskRegistry::new();
        let (tx, rx) = oneshot::channel::<u32>();
        registry.start_with("k", async { 3 }, move |output| {
            let _ = tx.send(*output);
        });
        assert_eq!(rx.await.unwrap(), 3);
        assert!(matches!(registry.poll("k"), TaskStatus::Done(Ok(3))));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_panicking_task_reports_panicked() {
        let registry: TaskRegistry<u32> = TaskRegistry::new();
        registry.start("boom", async {
            let fail = true;
            if fail {
                panic!("boom");
            }
            0
        });
        assert_eq!(
            wait_until_done(&registry, "boom").await,
            Err(TaskError::Panicked("boom".to_string()))
        );
    }
}
