//! Coarse time provider using browser's performance API

use std::time::Duration;
use js_sys::Date;

/// Coarse-grained instant for WASM
///
/// Uses JavaScript's Date.now() which is cheaper than high-resolution timers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct WasmCoarseInstant {
    millis_since_epoch: u64,
}

impl WasmCoarseInstant {
    /// Get the current coarse instant
    pub fn now() -> Self {
        let millis = Date::now() as u64;
        Self {
            millis_since_epoch: millis,
        }
    }
    
    /// Get duration since another instant
    pub fn duration_since(&self, earlier: WasmCoarseInstant) -> Duration {
        let millis = self.millis_since_epoch.saturating_sub(earlier.millis_since_epoch);
        Duration::from_millis(millis)
    }
    
    /// Get duration until another instant
    pub fn duration_until(&self, later: WasmCoarseInstant) -> Duration {
        later.duration_since(*self)
    }
    
    /// Check if this instant is after another
    pub fn is_after(&self, other: WasmCoarseInstant) -> bool {
        self.millis_since_epoch > other.millis_since_epoch
    }
}

impl std::ops::Add<Duration> for WasmCoarseInstant {
    type Output = Self;
    
    fn add(self, duration: Duration) -> Self {
        Self {
            millis_since_epoch: self.millis_since_epoch + duration.as_millis() as u64,
        }
    }
}

impl std::ops::Sub<Duration> for WasmCoarseInstant {
    type Output = Self;
    
    fn sub(self, duration: Duration) -> Self {
        Self {
            millis_since_epoch: self.millis_since_epoch.saturating_sub(duration.as_millis() as u64),
        }
    }
}

impl std::ops::Sub<WasmCoarseInstant> for WasmCoarseInstant {
    type Output = Duration;
    
    fn sub(self, other: WasmCoarseInstant) -> Duration {
        self.duration_since(other)
    }
}

use super::WasmRuntime;

impl WasmRuntime {
    /// Get current coarse time
    pub fn now_coarse(&self) -> WasmCoarseInstant {
        WasmCoarseInstant::now()
    }
}

use std::future::Future;
use std::pin::Pin;

use torclient_core::clock::{Clock, Instant};

/// `Clock` backed by `Date.now()` and `gloo_timers`' browser timeout.
///
/// The browser event loop is single-threaded, so unlike `SystemClock`'s
/// `std::thread::spawn`-based sleep this drives timeouts through
/// `gloo_timers::future::TimeoutFuture` instead.
#[derive(Debug, Clone, Copy, Default)]
pub struct WasmClock {
    epoch: Option<WasmCoarseInstant>,
}

impl WasmClock {
    pub fn new() -> Self {
        Self {
            epoch: Some(WasmCoarseInstant::now()),
        }
    }
}

/// Wraps a `!Send` browser future so it satisfies `Clock::sleep`'s `Send`
/// bound. Sound because wasm32 has no real threads: nothing can observe
/// this future from a second thread.
struct AssertSend<F>(F);
unsafe impl<F> Send for AssertSend<F> {}

impl<F: Future> Future for AssertSend<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<F::Output> {
        unsafe { self.map_unchecked_mut(|s| &mut s.0) }.poll(cx)
    }
}

impl Clock for WasmClock {
    fn now(&self) -> Instant {
        let epoch = self.epoch.unwrap_or_else(WasmCoarseInstant::now);
        WasmCoarseInstant::now().duration_since(epoch)
    }

    fn sleep(&self, dur: std::time::Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let millis = dur.as_millis().min(u64::from(u32::MAX) as u128) as u32;
        Box::pin(AssertSend(async move {
            gloo_timers::future::TimeoutFuture::new(millis).await;
        }))
    }
}

// SAFETY: see `AssertSend` above — wasm32 has no real threads.
unsafe impl Send for WasmClock {}
unsafe impl Sync for WasmClock {}
