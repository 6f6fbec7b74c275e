//! Leader election
//!
//! Each instance runs one [`LeaderElector`]. It acquires the shared lease,
//! renews it every TTL/3 and keeps a local deadline measured from the moment
//! each successful acquire or renew request was *sent*. Once that deadline
//! passes the instance is standby, whatever the lease store later says.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use openanomaly_core::domain::lease::{FencingToken, Leadership};
use openanomaly_core::store::LeaseStore;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
struct Held {
    token: FencingToken,
    deadline: Instant,
}

pub struct LeaderElector {
    store: Arc<dyn LeaseStore>,
    instance_id: String,
    ttl: Duration,
    renew_interval: Duration,
    held: Mutex<Option<Held>>,
    role: watch::Sender<Leadership>,
}

impl LeaderElector {
    /// Create an elector
    ///
    /// # Arguments
    /// * `store` - Shared lease store
    /// * `instance_id` - Holder id written into the lease
    /// * `ttl` - Lease lifetime; renewal runs every `ttl / 3`
    pub fn new(store: Arc<dyn LeaseStore>, instance_id: impl Into<String>, ttl: Duration) -> Self {
        let (role, _) = watch::channel(Leadership::Standby);
        Self {
            store,
            instance_id: instance_id.into(),
            ttl,
            renew_interval: ttl / 3,
            held: Mutex::new(None),
            role,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn renew_interval(&self) -> Duration {
        self.renew_interval
    }

    /// Role changes, for the API and the scheduling loop
    pub fn subscribe(&self) -> watch::Receiver<Leadership> {
        self.role.subscribe()
    }

    /// Fencing token to act under, or `None` when standby
    ///
    /// The local deadline is checked on every call, so an instance whose
    /// renewals stopped getting through demotes itself without waiting for
    /// the lease store.
    pub fn active_token(&self) -> Option<FencingToken> {
        let mut held = self.lock_held();
        match *held {
            Some(h) if Instant::now() < h.deadline => Some(h.token),
            Some(h) => {
                *held = None;
                drop(held);
                warn!(token = %h.token, "lease deadline passed without renewal; stepping down");
                self.publish(Leadership::Standby);
                None
            }
            None => None,
        }
    }

    /// Step down immediately, e.g. after an enqueue was fenced
    pub fn demote(&self, reason: &str) {
        if let Some(h) = self.lock_held().take() {
            warn!(token = %h.token, reason, "stepping down");
            self.publish(Leadership::Standby);
        }
    }

    /// One acquire-or-renew cycle
    pub async fn step(&self) -> Leadership {
        match self.active_token() {
            Some(token) => self.renew(token).await,
            None => self.acquire().await,
        }
        self.leadership()
    }

    /// Run acquire/renew cycles forever
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.renew_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.step().await;
        }
    }

    /// Give the lease up so a standby can take over without waiting for expiry
    pub async fn resign(&self) {
        let Some(h) = self.lock_held().take() else {
            return;
        };
        self.publish(Leadership::Standby);
        match tokio::time::timeout(self.renew_interval, self.store.release(&self.instance_id, h.token))
            .await
        {
            Ok(Ok(())) => info!(token = %h.token, "lease released"),
            Ok(Err(e)) => warn!(error = %e, "failed to release lease"),
            Err(_) => warn!("timed out releasing lease"),
        }
    }

    /// Current role, with the local deadline applied
    pub fn leadership(&self) -> Leadership {
        match self.active_token() {
            Some(fencing_token) => Leadership::Active { fencing_token },
            None => Leadership::Standby,
        }
    }

    async fn acquire(&self) {
        let sent = Instant::now();
        let attempt = tokio::time::timeout(
            self.renew_interval,
            self.store.acquire(&self.instance_id, self.ttl),
        )
        .await;

        match attempt {
            Ok(Ok(Some(lease))) => {
                let deadline = sent + self.ttl;
                if Instant::now() >= deadline {
                    warn!(token = %lease.fencing_token, "lease granted too late to use");
                    return;
                }
                *self.lock_held() = Some(Held {
                    token: lease.fencing_token,
                    deadline,
                });
                info!(
                    instance = %self.instance_id,
                    token = %lease.fencing_token,
                    "acquired leadership"
                );
                self.publish(Leadership::Active {
                    fencing_token: lease.fencing_token,
                });
            }
            Ok(Ok(None)) => debug!("lease held elsewhere; staying standby"),
            Ok(Err(e)) => warn!(error = %e, "lease acquire failed"),
            Err(_) => warn!("lease acquire timed out"),
        }
    }

    async fn renew(&self, token: FencingToken) {
        let sent = Instant::now();
        let attempt = tokio::time::timeout(
            self.renew_interval,
            self.store.renew(&self.instance_id, token, self.ttl),
        )
        .await;

        match attempt {
            Ok(Ok(Some(_))) => {
                let mut held = self.lock_held();
                // A concurrent demotion wins over a late renewal.
                if let Some(h) = held.as_mut().filter(|h| h.token == token) {
                    h.deadline = sent + self.ttl;
                    debug!(token = %token, "lease renewed");
                }
            }
            Ok(Ok(None)) => self.demote("lease lost to another holder"),
            // Keep the current deadline; active_token() enforces it.
            Ok(Err(e)) => warn!(error = %e, "lease renewal failed"),
            Err(_) => warn!("lease renewal timed out"),
        }
    }

    fn publish(&self, leadership: Leadership) {
        self.role.send_replace(leadership);
    }

    fn lock_held(&self) -> std::sync::MutexGuard<'_, Option<Held>> {
        // Poisoning cannot leave a Copy value half-written.
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use openanomaly_core::domain::lease::Lease;
    use openanomaly_core::error::StoreError;
    use openanomaly_core::memory::MemoryLeaseStore;
    use std::sync::atomic::{AtomicBool, Ordering};

    const TTL: Duration = Duration::from_secs(15);

    /// Adds latency on the way to the store and on the way back.
    struct DelayedLeaseStore {
        inner: Arc<MemoryLeaseStore>,
        request: Duration,
        response: Duration,
        hang_renewals: AtomicBool,
    }

    impl DelayedLeaseStore {
        fn new(inner: Arc<MemoryLeaseStore>, request: Duration, response: Duration) -> Self {
            Self {
                inner,
                request,
                response,
                hang_renewals: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl LeaseStore for DelayedLeaseStore {
        async fn acquire(&self, holder_id: &str, ttl: Duration) -> Result<Option<Lease>, StoreError> {
            tokio::time::sleep(self.request).await;
            let lease = self.inner.acquire(holder_id, ttl).await;
            tokio::time::sleep(self.response).await;
            lease
        }

        async fn renew(
            &self,
            holder_id: &str,
            token: FencingToken,
            ttl: Duration,
        ) -> Result<Option<Lease>, StoreError> {
            if self.hang_renewals.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            tokio::time::sleep(self.request).await;
            let lease = self.inner.renew(holder_id, token, ttl).await;
            tokio::time::sleep(self.response).await;
            lease
        }

        async fn release(&self, holder_id: &str, token: FencingToken) -> Result<(), StoreError> {
            self.inner.release(holder_id, token).await
        }

        async fn current(&self) -> Result<Option<Lease>, StoreError> {
            self.inner.current().await
        }
    }

    fn elector(store: Arc<dyn LeaseStore>, id: &str) -> Arc<LeaderElector> {
        Arc::new(LeaderElector::new(store, id, TTL))
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_instance_acquires_and_keeps_lease() {
        let store = Arc::new(MemoryLeaseStore::new());
        let a = elector(store.clone(), "a");
        let mut role = a.subscribe();

        assert!(a.step().await.is_active());
        assert!(role.has_changed().unwrap());
        assert!(role.borrow_and_update().is_active());

        for _ in 0..10 {
            tokio::time::advance(a.renew_interval()).await;
            assert!(a.step().await.is_active());
        }
        assert_eq!(a.active_token(), store.live_token().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutual_exclusion_under_network_delay() {
        let shared = Arc::new(MemoryLeaseStore::new());
        let a_store = Arc::new(DelayedLeaseStore::new(
            shared.clone(),
            Duration::from_millis(1200),
            Duration::from_millis(3000),
        ));
        let b_store = Arc::new(DelayedLeaseStore::new(
            shared.clone(),
            Duration::from_millis(300),
            Duration::from_millis(700),
        ));
        let a = elector(a_store, "a");
        let b = elector(b_store.clone(), "b");

        let run_a = tokio::spawn({
            let a = a.clone();
            async move { a.run().await }
        });
        let run_b = tokio::spawn({
            let b = b.clone();
            async move { b.run().await }
        });

        let mut saw_a = false;
        let mut saw_b = false;
        for i in 0..1200 {
            // B wins the first race; partway through its renewals stop arriving.
            if i == 300 {
                b_store.hang_renewals.store(true, Ordering::SeqCst);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;

            let a_token = a.active_token();
            let b_token = b.active_token();
            assert!(
                a_token.is_none() || b_token.is_none(),
                "both instances active at step {i}: {a_token:?} / {b_token:?}"
            );
            saw_a |= a_token.is_some();
            saw_b |= b_token.is_some();
        }
        assert!(saw_a && saw_b, "leadership never moved between instances");

        run_a.abort();
        run_b.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_standby_takes_over_after_crash_with_higher_token() {
        let store = Arc::new(MemoryLeaseStore::new());
        let a = elector(store.clone(), "a");
        let b = elector(store.clone(), "b");

        let first = a.step().await.token().unwrap();
        assert!(!b.step().await.is_active());

        let run_a = tokio::spawn({
            let a = a.clone();
            async move { a.run().await }
        });
        let run_b = tokio::spawn({
            let b = b.clone();
            async move { b.run().await }
        });
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(b.active_token(), None);

        // Crash: A stops renewing and never releases.
        run_a.abort();
        let crashed_at = Instant::now();

        let bound = TTL + b.renew_interval();
        let token = loop {
            if let Some(token) = b.active_token() {
                break token;
            }
            assert!(crashed_at.elapsed() <= bound, "failover exceeded {bound:?}");
            tokio::time::sleep(Duration::from_millis(100)).await;
        };
        assert!(token > first);

        run_b.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_renewal_steps_down_at_local_deadline() {
        let shared = Arc::new(MemoryLeaseStore::new());
        let store = Arc::new(DelayedLeaseStore::new(shared, Duration::ZERO, Duration::ZERO));
        let a = elector(store.clone(), "a");

        assert!(a.step().await.is_active());
        let acquired_at = Instant::now();
        store.hang_renewals.store(true, Ordering::SeqCst);

        // The renewal times out after renew_interval; the deadline still holds.
        tokio::time::advance(Duration::from_secs(5)).await;
        a.step().await;
        assert!(a.active_token().is_some());

        tokio::time::advance(TTL - acquired_at.elapsed()).await;
        assert_eq!(a.active_token(), None);
        assert_eq!(*a.subscribe().borrow(), Leadership::Standby);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resign_lets_standby_in_immediately() {
        let store = Arc::new(MemoryLeaseStore::new());
        let a = elector(store.clone(), "a");
        let b = elector(store.clone(), "b");

        let first = a.step().await.token().unwrap();
        a.resign().await;
        assert_eq!(a.active_token(), None);

        let second = b.step().await.token().unwrap();
        assert!(second > first);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_lease_demotes_on_renew() {
        let store = Arc::new(MemoryLeaseStore::new());
        let a = elector(store.clone(), "a");
        let token = a.step().await.token().unwrap();

        // Another holder takes over after a forced release.
        store.release("a", token).await.unwrap();
        store.acquire("b", TTL).await.unwrap().unwrap();

        assert!(!a.step().await.is_active());
        assert_eq!(a.active_token(), None);
    }
}
