// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Per-pool async locks.
//!
//! Serializes work on one pool inside this process while different pools
//! proceed concurrently. An entry lives only while someone holds or waits on
//! it, so the map does not grow with every pool ever touched.

use dashmap::DashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct KeyedLocks<K> {
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self { locks: DashMap::new() }
    }

    /// Run `work` while holding the lock for `key`.
    pub async fn run<F, T>(&self, key: &K, work: F) -> T
    where
        F: Future<Output = T>,
    {
        let lock = self.locks.entry(key.clone()).or_default().clone();
        let result = {
            let _guard = lock.lock().await;
            work.await
        };
        drop(lock);
        // waiters hold their own clone, so a count of one means only the map
        self.locks.remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    /// Keys currently held or waited on.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_entries_are_dropped_after_use() {
        let locks = KeyedLocks::new();
        assert_eq!(locks.run(&"a", async { 1 }).await, 1);
        assert_eq!(locks.run(&"b", async { 2 }).await, 2);
        assert!(locks.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_key_never_overlaps() {
        let locks = Arc::new(KeyedLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = inside.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                locks
                    .run(&"pool", async {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        inside.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_different_keys_run_concurrently() {
        let locks = KeyedLocks::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        // the second key completes the first key's wait; a shared lock would deadlock
        let first = locks.run(&"a", async {
            rx.await.unwrap();
        });
        let second = locks.run(&"b", async {
            tx.send(()).unwrap();
        });
        tokio::time::timeout(Duration::from_secs(5), async { tokio::join!(first, second) })
            .await
            .unwrap();
    }
}
