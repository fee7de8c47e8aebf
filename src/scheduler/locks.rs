//! Per-namespace critical sections for the snapshot-through-apply phase

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::namespace::Namespace;

/// Hands out one async mutex per namespace, dropping idle ones lazily
#[derive(Debug, Default)]
pub(crate) struct NamespaceLocks {
    locks: Mutex<HashMap<Namespace, Arc<AsyncMutex<()>>>>,
}

impl NamespaceLocks {
    /// Wait for exclusive access to `namespace`
    pub(crate) async fn acquire(&self, namespace: &Namespace) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            // only the map itself holds an idle lock
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(namespace.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[tokio::test]
    async fn test_same_namespace_is_exclusive() {
        let locks = NamespaceLocks::default();
        let ns = Namespace::new(["memories", "u-1"]).unwrap();

        let guard = locks.acquire(&ns).await;
        let mut contender = task::spawn(locks.acquire(&ns));
        assert_pending!(contender.poll());

        drop(guard);
        assert!(contender.is_woken());
        assert_ready!(contender.poll());
    }

    #[tokio::test]
    async fn test_other_namespaces_do_not_block_and_idle_locks_are_pruned() {
        let locks = NamespaceLocks::default();
        let a = Namespace::new(["memories", "a"]).unwrap();
        let b = Namespace::new(["memories", "b"]).unwrap();

        let guard_a = locks.acquire(&a).await;
        let guard_b = locks.acquire(&b).await;
        assert_eq!(locks.tracked(), 2);

        drop(guard_a);
        drop(guard_b);
        let _again = locks.acquire(&a).await;
        assert_eq!(locks.tracked(), 1);
    }
}
