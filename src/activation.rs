//! Per-key mutual exclusion for app activation.
//!
//! Activating the same app twice at once makes the conductor fail one of
//! the calls, so activations of one key run one at a time. Waiters poll
//! instead of queueing, so there is no fairness between them.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Default interval between checks of a held key.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ActivationGate {
    held: Arc<Mutex<HashSet<String>>>,
    poll_interval: Duration,
}

impl Default for ActivationGate {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}

/// Releases a key when dropped, whatever happened to the holder.
struct HeldKey {
    held: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl Drop for HeldKey {
    fn drop(&mut self) {
        lock(&self.held).remove(&self.key);
        tracing::debug!(key = %self.key, "Released activation lock");
    }
}

fn lock(held: &Mutex<HashSet<String>>) -> MutexGuard<'_, HashSet<String>> {
    held.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ActivationGate {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            held: Arc::new(Mutex::new(HashSet::new())),
            poll_interval,
        }
    }

    /// Whether `key` is currently held.
    pub fn is_held(&self, key: &str) -> bool {
        lock(&self.held).contains(key)
    }

    /// Run `f` while holding `key`, waiting for any current holder first.
    pub async fn with_lock<F, Fut, T>(&self, key: &str, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _held = self.acquire(key).await;
        f().await
    }

    async fn acquire(&self, key: &str) -> HeldKey {
        let mut waited = 0u32;
        loop {
            if lock(&self.held).insert(key.to_string()) {
                if waited > 0 {
                    tracing::debug!(key, waited, "Acquired activation lock after waiting");
                }
                return HeldKey {
                    held: Arc::clone(&self.held),
                    key: key.to_string(),
                };
            }
            waited += 1;
            tracing::debug!(key, "Activation already in progress, waiting {:?}", self.poll_interval);
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::{assert_pending, assert_ready};

    const POLL: Duration = Duration::from_secs(5);

    #[tokio::test(start_paused = true)]
    async fn second_holder_waits_for_next_poll_after_release() {
        let gate = ActivationGate::new(POLL);
        let (release, released) = tokio::sync::oneshot::channel::<()>();

        let first = tokio::spawn({
            let gate = gate.clone();
            async move {
                gate.with_lock("app", || async {
                    let _ = released.await;
                })
                .await
            }
        });
        tokio::task::yield_now().await;
        assert!(gate.is_held("app"));

        let mut second = tokio_test::task::spawn(gate.with_lock("app", || async { 2 }));
        assert_pending!(second.poll());

        tokio::time::advance(Duration::from_secs(1)).await;
        release.send(()).unwrap();
        first.await.unwrap();
        assert!(!gate.is_held("app"));
        // Released, but the waiter only notices on its next poll.
        assert_pending!(second.poll());

        tokio::time::advance(POLL).await;
        assert_eq!(assert_ready!(second.poll()), 2);
        assert!(!gate.is_held("app"));
    }

    #[tokio::test(start_paused = true)]
    async fn different_keys_do_not_block() {
        let gate = ActivationGate::new(POLL);
        let outer = gate
            .with_lock("a", || async { gate.with_lock("b", || async { "both" }).await })
            .await;
        assert_eq!(outer, "both");
    }

    #[tokio::test]
    async fn key_is_released_when_holder_is_cancelled() {
        let gate = ActivationGate::new(POLL);
        let task = tokio::spawn({
            let gate = gate.clone();
            async move { gate.with_lock("app", std::future::pending::<()>).await }
        });
        while !gate.is_held("app") {
            tokio::task::yield_now().await;
        }
        task.abort();
        let _ = task.await;
        assert!(!gate.is_held("app"));
    }

    #[tokio::test]
    async fn key_is_released_when_holder_panics() {
        let gate = ActivationGate::new(POLL);
        let task = tokio::spawn({
            let gate = gate.clone();
            async move {
                gate.with_lock("app", || async {
                    let installed: Option<u8> = None;
                    installed.expect("activation blew up")
                })
                .await
            }
        });
        assert!(task.await.unwrap_err().is_panic());
        assert!(!gate.is_held("app"));
    }

    /// Counts holders inside the critical section and remembers the peak.
    #[derive(Default)]
    struct Occupancy {
        inside: AtomicUsize,
        peak: AtomicUsize,
        entered: AtomicUsize,
    }

    impl Occupancy {
        async fn hold(&self, for_how_long: Duration) {
            let now = self.inside.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.entered.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(for_how_long).await;
            self.inside.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_holders_of_one_key_never_overlap() {
        let gate = ActivationGate::new(Duration::from_millis(10));
        let occupancy = Arc::new(Occupancy::default());

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let gate = gate.clone();
                let occupancy = Arc::clone(&occupancy);
                tokio::spawn(async move {
                    gate.with_lock("app", || occupancy.hold(Duration::from_millis(25)))
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(occupancy.entered.load(Ordering::SeqCst), 8);
        assert_eq!(occupancy.peak.load(Ordering::SeqCst), 1);
        assert!(!gate.is_held("app"));
    }

    #[tokio::test(start_paused = true)]
    async fn aborted_holder_admits_one_waiter_at_a_time() {
        let gate = ActivationGate::new(POLL);
        let occupancy = Arc::new(Occupancy::default());

        let holder = tokio::spawn({
            let gate = gate.clone();
            async move { gate.with_lock("app", std::future::pending::<()>).await }
        });
        while !gate.is_held("app") {
            tokio::task::yield_now().await;
        }

        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let gate = gate.clone();
                let occupancy = Arc::clone(&occupancy);
                tokio::spawn(async move {
                    gate.with_lock("app", || occupancy.hold(Duration::from_secs(60)))
                        .await
                })
            })
            .collect();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(occupancy.entered.load(Ordering::SeqCst), 0);

        holder.abort();
        assert!(holder.await.unwrap_err().is_cancelled());
        assert!(!gate.is_held("app"));

        // Both waiters wake on the same poll; only one may take the key.
        tokio::time::advance(POLL).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(occupancy.entered.load(Ordering::SeqCst), 1);
        assert!(gate.is_held("app"));

        for waiter in waiters {
            waiter.await.unwrap();
        }
        assert_eq!(occupancy.entered.load(Ordering::SeqCst), 2);
        assert_eq!(occupancy.peak.load(Ordering::SeqCst), 1);
    }
}
