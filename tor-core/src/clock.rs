//! Real and virtual clocks. All timers in the circuit/pool/directory
//! layers route through a `Clock` so tests can drive time deterministically.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::channel::oneshot;

/// An instant in a clock's own timeline. Not comparable across clocks.
pub type Instant = Duration;

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    /// Resolves after `dur` has elapsed on this clock.
    fn sleep(&self, dur: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;

    /// Resolves after the clock reaches `deadline`, or immediately if
    /// `deadline` has already passed.
    fn set_timeout(&self, deadline: Instant) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let now = self.now();
        let dur = deadline.saturating_sub(now);
        self.sleep(dur)
    }
}

/// Wall-clock time via `std::time::Instant`.
#[derive(Clone, Default)]
pub struct SystemClock {
    start: once_cell_instant::OnceInstant,
}

mod once_cell_instant {
    use std::sync::OnceLock;

    #[derive(Clone, Default)]
    pub struct OnceInstant(std::sync::Arc<OnceLock<std::time::Instant>>);

    impl OnceInstant {
        pub fn get(&self) -> std::time::Instant {
            *self.0.get_or_init(std::time::Instant::now)
        }
    }
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        self.start.get().elapsed()
    }

    fn sleep(&self, dur: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            let (tx, rx) = oneshot::channel::<()>();
            std::thread::spawn(move || {
                std::thread::sleep(dur);
                let _ = tx.send(());
            });
            let _ = rx.await;
        })
    }
}

struct VirtualClockInner {
    now: Instant,
    waiters: Vec<(Instant, oneshot::Sender<()>)>,
}

/// A manually-advanced clock for deterministic tests.
#[derive(Clone)]
pub struct VirtualClock {
    inner: Arc<Mutex<VirtualClockInner>>,
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualClock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(VirtualClockInner {
                now: Duration::ZERO,
                waiters: Vec::new(),
            })),
        }
    }

    /// Advances the clock by `dur`, waking any sleepers whose deadline has
    /// now passed, in deadline order.
    pub fn advance(&self, dur: Duration) {
        let mut inner = self.inner.lock().unwrap();
        inner.now += dur;
        let now = inner.now;
        inner.waiters.sort_by_key(|(deadline, _)| *deadline);
        let ready_count = inner.waiters.iter().take_while(|(d, _)| *d <= now).count();
        for (_, tx) in inner.waiters.drain(0..ready_count) {
            let _ = tx.send(());
        }
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> Instant {
        self.inner.lock().unwrap().now
    }

    fn sleep(&self, dur: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let deadline = self.now() + dur;
        let inner = self.inner.clone();
        Box::pin(async move {
            if dur.is_zero() {
                return;
            }
            let (tx, rx) = oneshot::channel::<()>();
            {
                let mut guard = inner.lock().unwrap();
                if guard.now >= deadline {
                    let _ = tx.send(());
                } else {
                    guard.waiters.push((deadline, tx));
                }
            }
            let _ = rx.await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use futures::FutureExt;

    #[test]
    fn virtual_clock_does_not_resolve_before_advance() {
        let clock = VirtualClock::new();
        let mut fut = Box::pin(clock.sleep(Duration::from_millis(100)));
        assert!(fut.as_mut().now_or_never().is_none());
    }

    #[test]
    fn virtual_clock_resolves_after_advance() {
        let clock = VirtualClock::new();
        let fut = clock.sleep(Duration::from_millis(100));
        clock.advance(Duration::from_millis(100));
        block_on(fut);
        assert_eq!(clock.now(), Duration::from_millis(100));
    }

    #[test]
    fn virtual_clock_wakes_multiple_waiters_in_deadline_order() {
        let clock = VirtualClock::new();
        let short = clock.sleep(Duration::from_millis(10));
        let long = clock.sleep(Duration::from_millis(50));
        clock.advance(Duration::from_millis(20));
        block_on(short);
        assert!(Box::pin(long).now_or_never().is_none());
    }
}
