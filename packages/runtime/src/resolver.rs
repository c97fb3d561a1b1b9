// ABOUTME: One-shot resolution slot observable by any number of waiters
// ABOUTME: The first resolve() wins; later attempts are no-ops

use std::sync::Arc;
use tokio::sync::watch;

/// A value that is decided exactly once.
///
/// Cloning shares the slot. `resolve` may race from several tasks (normal
/// completion against an external kill, for instance); only the first
/// call has effect.
#[derive(Debug)]
pub struct Resolver<T> {
    slot: Arc<watch::Sender<Option<T>>>,
}

impl<T> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T: Clone> Default for Resolver<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Resolver<T> {
    pub fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Self {
            slot: Arc::new(slot),
        }
    }

    /// Store `value` unless something was stored before. Returns whether
    /// this call was the one that resolved the slot.
    pub fn resolve(&self, value: T) -> bool {
        self.slot.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(value);
            true
        })
    }

    pub fn is_resolved(&self) -> bool {
        self.slot.borrow().is_some()
    }

    pub fn get(&self) -> Option<T> {
        self.slot.borrow().clone()
    }

    /// Wait until the slot is resolved and return a copy of the value.
    pub async fn wait(&self) -> T {
        let mut rx = self.slot.subscribe();
        loop {
            if let Some(value) = rx.borrow_and_update().clone() {
                return value;
            }
            // The sender lives in `self`, so the channel cannot close while we wait.
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_first_resolution_wins() {
        let resolver = Resolver::new();
        assert!(resolver.resolve(1));
        assert!(!resolver.resolve(2));
        assert_eq!(resolver.get(), Some(1));
    }

    #[tokio::test]
    async fn test_wait_observes_later_resolution() {
        let resolver: Resolver<&'static str> = Resolver::new();
        let waiter = {
            let resolver = resolver.clone();
            tokio::spawn(async move { resolver.wait().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(resolver.resolve("done"));
        assert_eq!(waiter.await.unwrap(), "done");
    }

    #[tokio::test]
    async fn test_concurrent_resolution_has_one_winner() {
        let resolver = Resolver::new();
        let attempts: Vec<_> = (0..16)
            .map(|i| {
                let resolver = resolver.clone();
                tokio::spawn(async move { resolver.resolve(i) })
            })
            .collect();

        let mut winners = 0;
        for attempt in attempts {
            if attempt.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert!(resolver.is_resolved());
    }
}
