//! Guard node selection and persistence.
//!
//! Using the same small set of entry relays for weeks at a time limits an
//! adversary's observation window: frequent rotation only increases the
//! chance of eventually picking a hostile first hop. Selection favors
//! bandwidth among relays carrying the `Guard` flag; persistence survives
//! page reloads via the [`torclient_core::store::Store`] abstraction
//! rather than this crate inventing its own format.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use torclient_core::consensus::microdesc::Microdesc;
use torclient_core::error::TorError as CoreError;
use torclient_core::store::Store;

use crate::error::{Result, TorError};

/// Tor's path-spec recommends 2-3 months; 60 days is the conservative end.
pub const GUARD_LIFETIME_SECS: u64 = 60 * 24 * 60 * 60;
pub const MIN_GUARDS: usize = 3;
pub const MAX_GUARDS: usize = 5;
pub const MAX_FAILURES_BEFORE_BAD: u32 = 5;
pub const BAD_GUARD_TIMEOUT_SECS: u64 = 60 * 60;

const STORE_KEY: &str = "state:guards";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FailureInfo {
    pub consecutive_failures: u32,
    pub last_failure_time: u64,
    pub last_error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardState {
    pub guards: Vec<String>,
    pub selected_at: u64,
    pub rotate_after: u64,
    pub failed_guards: HashMap<String, FailureInfo>,
    pub bad_guards: HashMap<String, u64>,
    pub version: u32,
}

impl Default for GuardState {
    fn default() -> Self {
        Self {
            guards: Vec::new(),
            selected_at: 0,
            rotate_after: 0,
            failed_guards: HashMap::new(),
            bad_guards: HashMap::new(),
            version: 1,
        }
    }
}

impl GuardState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn needs_refresh(&self, now: u64) -> bool {
        if self.guards.is_empty() {
            return true;
        }
        if now > self.rotate_after {
            return true;
        }
        self.usable_guard_count(now) < MIN_GUARDS
    }

    pub fn usable_guard_count(&self, now: u64) -> usize {
        self.usable_guards(now).len()
    }

    /// Picks up to `MAX_GUARDS` relays carrying the `Guard` and `Running`
    /// flags, weighted toward the top quintile by bandwidth.
    pub fn select_guards(&mut self, relays: &[Microdesc], now: u64, mut rng_state: u64) -> Result<()> {
        let mut candidates: Vec<&Microdesc> = relays
            .iter()
            .filter(|r| {
                has_flag(r, "Guard")
                    && has_flag(r, "Running")
                    && has_flag(r, "Stable")
                    && !self.is_bad_guard(&r.identity_fingerprint, now)
            })
            .collect();

        if candidates.len() < MIN_GUARDS {
            return Err(TorError::Core(CoreError::protocol(format!(
                "not enough guard candidates: {} (need {MIN_GUARDS})",
                candidates.len()
            ))));
        }

        candidates.sort_by(|a, b| b.bandwidth.unwrap_or(0).cmp(&a.bandwidth.unwrap_or(0)));

        let mut selected = Vec::new();
        while selected.len() < MAX_GUARDS && !candidates.is_empty() {
            let top_count = (candidates.len() / 5).max(1);
            let idx = (xorshift64(&mut rng_state) as usize) % top_count;
            let guard = candidates.remove(idx);
            selected.push(guard.identity_fingerprint.clone());
        }

        self.guards = selected;
        self.selected_at = now;
        self.rotate_after = now + GUARD_LIFETIME_SECS;
        self.failed_guards.clear();
        log::info!("selected {} guards, valid until {}", self.guards.len(), self.rotate_after);
        Ok(())
    }

    pub fn next_guard(&self, now: u64) -> Option<&String> {
        self.usable_guards(now).into_iter().next()
    }

    pub fn usable_guards(&self, now: u64) -> Vec<&String> {
        self.guards
            .iter()
            .filter(|fp| !self.is_bad_guard(fp, now))
            .collect()
    }

    pub fn record_failure(&mut self, fingerprint: &str, error: &str, now: u64) {
        let failure = self.failed_guards.entry(fingerprint.to_string()).or_default();
        failure.consecutive_failures += 1;
        failure.last_failure_time = now;
        failure.last_error = error.to_string();
        log::warn!("guard {fingerprint} failed ({} times): {error}", failure.consecutive_failures);
        if failure.consecutive_failures >= MAX_FAILURES_BEFORE_BAD {
            self.mark_bad(fingerprint, now);
        }
    }

    pub fn record_success(&mut self, fingerprint: &str) {
        self.failed_guards.remove(fingerprint);
        self.bad_guards.remove(fingerprint);
    }

    fn mark_bad(&mut self, fingerprint: &str, now: u64) {
        self.bad_guards.insert(fingerprint.to_string(), now + BAD_GUARD_TIMEOUT_SECS);
        log::warn!("guard {fingerprint} marked bad until {}", now + BAD_GUARD_TIMEOUT_SECS);
    }

    fn is_bad_guard(&self, fingerprint: &str, now: u64) -> bool {
        self.bad_guards.get(fingerprint).is_some_and(|&bad_until| now < bad_until)
    }

    pub fn cleanup(&mut self, now: u64) {
        self.bad_guards.retain(|_, &mut bad_until| now < bad_until);
        let one_day_ago = now.saturating_sub(24 * 60 * 60);
        self.failed_guards.retain(|_, info| info.last_failure_time > one_day_ago);
    }
}

fn has_flag(relay: &Microdesc, flag: &str) -> bool {
    relay.flags.iter().any(|f| f == flag)
}

fn xorshift64(state: &mut u64) -> u64 {
    *state ^= *state << 13;
    *state ^= *state >> 7;
    *state ^= *state << 17;
    *state
}

/// Loads/saves [`GuardState`] through an injected [`Store`] so the bindings
/// layer can swap `WasmStore` for `MemStore` in tests without this type
/// changing.
pub struct GuardPersistence<'a, S: Store> {
    store: &'a S,
}

impl<'a, S: Store> GuardPersistence<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    pub async fn load(&self) -> Result<GuardState> {
        match self.store.read(STORE_KEY).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| TorError::Core(CoreError::parse(format!("guard state: {e}")))),
            Err(CoreError::Closed(_)) => Ok(GuardState::new()),
            Err(e) => Err(TorError::Core(e)),
        }
    }

    pub async fn save(&self, state: &GuardState) -> Result<()> {
        let bytes = serde_json::to_vec(state)
            .map_err(|e| TorError::Core(CoreError::parse(format!("guard state: {e}"))))?;
        self.store.write(STORE_KEY, &bytes).await.map_err(TorError::Core)
    }

    pub async fn clear(&self) -> Result<()> {
        self.store.remove(STORE_KEY).await.map_err(TorError::Core)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use torclient_core::store::MemStore;

    fn relay(fingerprint: &str, bandwidth: u64, flags: &[&str]) -> Microdesc {
        Microdesc {
            identity_fingerprint: fingerprint.to_string(),
            bandwidth: Some(bandwidth),
            flags: flags.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn empty_state_needs_refresh() {
        assert!(GuardState::new().needs_refresh(0));
    }

    #[test]
    fn selection_requires_minimum_candidates() {
        let mut state = GuardState::new();
        let relays = vec![relay("A", 1000, &["Guard", "Running", "Stable"])];
        assert!(state.select_guards(&relays, 0, 42).is_err());
    }

    #[test]
    fn selection_picks_guard_flagged_relays() {
        let mut state = GuardState::new();
        let relays: Vec<_> = (0..6)
            .map(|i| relay(&format!("FP{i}"), 1000 * i as u64, &["Guard", "Running", "Stable"]))
            .collect();
        state.select_guards(&relays, 1000, 7).unwrap();
        assert!(state.guards.len() >= MIN_GUARDS);
        assert!(!state.needs_refresh(1000));
    }

    #[test]
    fn failures_mark_guard_bad_after_threshold() {
        let mut state = GuardState::new();
        state.guards.push("FP".to_string());
        for i in 0..MAX_FAILURES_BEFORE_BAD {
            state.record_failure("FP", "timeout", 0);
            if i < MAX_FAILURES_BEFORE_BAD - 1 {
                assert!(!state.is_bad_guard("FP", 0));
            }
        }
        assert!(state.is_bad_guard("FP", 0));
    }

    #[test]
    fn success_clears_failure_and_bad_state() {
        let mut state = GuardState::new();
        state.record_failure("FP", "e1", 0);
        state.record_success("FP");
        assert!(!state.failed_guards.contains_key("FP"));
    }

    #[test]
    fn persists_through_injected_store() {
        let store = MemStore::new();
        let mut state = GuardState::new();
        state.guards.push("FP1".to_string());
        state.selected_at = 1000;
        state.rotate_after = 1000 + GUARD_LIFETIME_SECS;

        let persistence = GuardPersistence::new(&store);
        block_on(persistence.save(&state)).unwrap();
        let restored = block_on(persistence.load()).unwrap();
        assert_eq!(restored.guards, state.guards);
        assert_eq!(restored.rotate_after, state.rotate_after);
    }

    #[test]
    fn loading_with_no_saved_state_returns_default() {
        let store = MemStore::new();
        let persistence = GuardPersistence::new(&store);
        let state = block_on(persistence.load()).unwrap();
        assert!(state.guards.is_empty());
    }
}
