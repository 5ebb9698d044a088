//! Bounded-concurrency resource pool: amortizes expensive circuit
//! construction across concurrent consumers.
//!
//! Critical invariant (spec §4.7/§8): a second concurrent `acquire()`
//! must not launch another `min-in-flight` batch while the first
//! batch's builds are still outstanding — it subscribes to them instead.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::{select_ok, FutureExt};

use crate::clock::Clock;
use crate::error::{PoolFailureClass, Result, TorError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Empty,
    Building,
    Ready,
    Failed,
    Disposed,
}

pub struct PoolConfig {
    pub min_ready: usize,
    pub min_in_flight: usize,
    pub max_total: usize,
    pub idle_ttl: Duration,
    pub build_timeout: Duration,
    pub failure_cooldown: Duration,
    pub failure_threshold: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_ready: 2,
            min_in_flight: 2,
            max_total: 8,
            idle_ttl: Duration::from_secs(600),
            build_timeout: Duration::from_secs(30),
            failure_cooldown: Duration::from_secs(60),
            failure_threshold: 3,
        }
    }
}

#[derive(Default)]
pub struct PoolStats {
    pub builds_started: u64,
    pub builds_succeeded: u64,
    pub builds_failed: u64,
}

struct Slot<T> {
    state: SlotState,
    value: Option<Arc<T>>,
    created_at: Duration,
    last_used: Duration,
}

/// A resource pool over values of type `T` produced by an async factory.
/// Generic over the factory so tests can supply one that counts
/// invocations and takes a fixed virtual-clock delay.
pub struct ResourcePool<T, C: Clock> {
    config: PoolConfig,
    clock: Arc<C>,
    slots: std::sync::Mutex<Vec<Slot<T>>>,
    /// Subscribers waiting on the current in-flight build batch; cleared
    /// once that batch resolves (success or failure).
    in_flight_waiters: std::sync::Mutex<Vec<oneshot::Sender<Result<Arc<T>>>>>,
    in_flight_count: std::sync::atomic::AtomicUsize,
    failure_counts: std::sync::Mutex<HashMap<String, (u32, Duration)>>,
    disposed: std::sync::atomic::AtomicBool,
    stats: std::sync::Mutex<PoolStats>,
}

impl<T, C: Clock> ResourcePool<T, C> {
    pub fn new(config: PoolConfig, clock: Arc<C>) -> Self {
        Self {
            config,
            clock,
            slots: std::sync::Mutex::new(Vec::new()),
            in_flight_waiters: std::sync::Mutex::new(Vec::new()),
            in_flight_count: std::sync::atomic::AtomicUsize::new(0),
            failure_counts: std::sync::Mutex::new(HashMap::new()),
            disposed: std::sync::atomic::AtomicBool::new(false),
            stats: std::sync::Mutex::new(PoolStats::default()),
        }
    }

    pub fn stats(&self) -> PoolStats {
        let s = self.stats.lock().unwrap();
        PoolStats {
            builds_started: s.builds_started,
            builds_succeeded: s.builds_succeeded,
            builds_failed: s.builds_failed,
        }
    }

    pub fn dispose(&self) {
        self.disposed.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    /// Returns a ready resource, reusing one from the slot table if
    /// present, otherwise racing up to `min_in_flight` builds and
    /// returning the first to succeed. A caller arriving while a batch
    /// is already in flight subscribes to it rather than starting a new
    /// one.
    pub async fn acquire<F, Fut>(&self, factory: F) -> Result<Arc<T>>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        if self.disposed.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(TorError::Closed("pool disposed".into()));
        }

        if let Some(ready) = self.take_ready() {
            return Ok(ready);
        }

        let batch_size = self.config.min_in_flight.max(1);

        // The in-flight check and the decision to launch must happen
        // under the same lock as pushing a waiter: if they were two
        // separately-locked sections, two concurrent callers could both
        // observe `in_flight == 0` and both launch a batch. Claiming the
        // batch (the atomic store) here, before releasing `waiters`,
        // closes that window.
        let joined_existing = {
            let mut waiters = self.in_flight_waiters.lock().unwrap();
            let in_flight = self.in_flight_count.load(std::sync::atomic::Ordering::SeqCst);
            if in_flight > 0 {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                Some(rx)
            } else {
                self.in_flight_count.store(batch_size, std::sync::atomic::Ordering::SeqCst);
                None
            }
        };

        if let Some(rx) = joined_existing {
            return rx.await.map_err(|_| TorError::Cancelled)?;
        }

        self.launch_batch(factory, batch_size).await
    }

    fn take_ready(&self) -> Option<Arc<T>> {
        let mut slots = self.slots.lock().unwrap();
        let now = self.clock.now();
        for slot in slots.iter_mut() {
            if slot.state == SlotState::Ready {
                if let Some(v) = slot.value.clone() {
                    slot.last_used = now;
                    return Some(v);
                }
            }
        }
        None
    }

    /// `batch_size` must already be reflected in `in_flight_count`
    /// (the caller claims it atomically with the in-flight check in
    /// `acquire`) before this is called.
    async fn launch_batch<F, Fut>(&self, factory: F, batch_size: usize) -> Result<Arc<T>>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        {
            let mut stats = self.stats.lock().unwrap();
            stats.builds_started += batch_size as u64;
        }

        let attempts: Vec<std::pin::Pin<Box<dyn std::future::Future<Output = Result<Arc<T>>>>>> = (0
            ..batch_size)
            .map(|_| {
                let fut = factory();
                Box::pin(fut.map(|r| r.map(Arc::new)))
                    as std::pin::Pin<Box<dyn std::future::Future<Output = Result<Arc<T>>>>>
            })
            .collect();

        let result = select_ok(attempts).await;

        self.in_flight_count.store(0, std::sync::atomic::Ordering::SeqCst);
        let waiters: Vec<_> = self.in_flight_waiters.lock().unwrap().drain(..).collect();

        match result {
            Ok((value, _remaining)) => {
                {
                    let mut stats = self.stats.lock().unwrap();
                    stats.builds_succeeded += 1;
                }
                let now = self.clock.now();
                self.slots.lock().unwrap().push(Slot {
                    state: SlotState::Ready,
                    value: Some(value.clone()),
                    created_at: now,
                    last_used: now,
                });
                for tx in waiters {
                    let _ = tx.send(Ok(value.clone()));
                }
                Ok(value)
            }
            Err(e) => {
                {
                    let mut stats = self.stats.lock().unwrap();
                    stats.builds_failed += 1;
                }
                if e.pool_class() != PoolFailureClass::Terminal {
                    self.record_relay_failure("default");
                }
                for tx in waiters {
                    let _ = tx.send(Err(e.clone()));
                }
                Err(e)
            }
        }
    }

    fn record_relay_failure(&self, relay_key: &str) {
        let now = self.clock.now();
        let mut counts = self.failure_counts.lock().unwrap();
        let entry = counts.entry(relay_key.to_string()).or_insert((0, now));
        if now.saturating_sub(entry.1) > self.config.failure_cooldown {
            *entry = (1, now);
        } else {
            entry.0 += 1;
            entry.1 = now;
        }
    }

    pub fn is_relay_excluded(&self, relay_key: &str) -> bool {
        let counts = self.failure_counts.lock().unwrap();
        match counts.get(relay_key) {
            Some((count, since)) => {
                *count > self.config.failure_threshold
                    && self.clock.now().saturating_sub(*since) <= self.config.failure_cooldown
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;
    use futures::executor::block_on;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn two_concurrent_acquires_cause_at_most_two_creations() {
        let clock = Arc::new(VirtualClock::new());
        let pool: ResourcePool<u32, VirtualClock> = ResourcePool::new(
            PoolConfig {
                min_in_flight: 2,
                ..Default::default()
            },
            clock.clone(),
        );

        let invocation_count = Arc::new(AtomicUsize::new(0));

        let factory = {
            let invocation_count = invocation_count.clone();
            let clock = clock.clone();
            move || {
                let invocation_count = invocation_count.clone();
                let clock = clock.clone();
                async move {
                    invocation_count.fetch_add(1, Ordering::SeqCst);
                    clock.sleep(Duration::from_millis(100)).await;
                    Ok::<u32, TorError>(42)
                }
            }
        };

        let pool = Arc::new(pool);
        let fut1 = {
            let pool = pool.clone();
            let factory = factory.clone();
            async move { pool.acquire(factory).await }
        };
        let fut2 = {
            let pool = pool.clone();
            let factory = factory.clone();
            async move { pool.acquire(factory).await }
        };

        // Advance the virtual clock from a background thread shortly
        // after the acquires start, matching the 100ms factory delay.
        let advancer_clock = clock.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            advancer_clock.advance(Duration::from_millis(100));
        });

        let (r1, r2) = block_on(async { futures::join!(fut1, fut2) });

        assert_eq!(invocation_count.load(Ordering::SeqCst), 2);
        assert_eq!(*r1.unwrap(), 42);
        assert_eq!(*r2.unwrap(), 42);
    }

    #[test]
    fn disposed_pool_rejects_new_acquires() {
        let clock = Arc::new(VirtualClock::new());
        let pool: ResourcePool<u32, VirtualClock> = ResourcePool::new(PoolConfig::default(), clock);
        pool.dispose();
        let result = block_on(pool.acquire(|| async { Ok::<u32, TorError>(1) }));
        assert!(result.is_err());
    }

    #[test]
    fn ready_slot_is_reused_without_a_new_build() {
        let clock = Arc::new(VirtualClock::new());
        let pool: ResourcePool<u32, VirtualClock> = ResourcePool::new(
            PoolConfig {
                min_in_flight: 1,
                ..Default::default()
            },
            clock,
        );
        let invocation_count = Arc::new(AtomicUsize::new(0));
        let factory = {
            let invocation_count = invocation_count.clone();
            move || {
                let invocation_count = invocation_count.clone();
                async move {
                    invocation_count.fetch_add(1, Ordering::SeqCst);
                    Ok::<u32, TorError>(7)
                }
            }
        };
        block_on(pool.acquire(factory.clone())).unwrap();
        block_on(pool.acquire(factory)).unwrap();
        assert_eq!(invocation_count.load(Ordering::SeqCst), 1);
    }
}
