//! # Tor WASM Client
//!
//! A browser-capable Tor client compiled to WebAssembly: directory
//! consensus fetch and caching, ntor-based circuit construction over a
//! WebSocket or Snowflake/WebRTC bridge, guard persistence, and a
//! bounded-concurrency circuit pool. The cell-framing, crypto, and
//! directory-document parsing live in `torclient-core`; this crate
//! supplies the browser I/O (WebSocket, WebRTC, IndexedDB, `Crypto`)
//! that the core trusts nothing about.
//!
//! ## Architecture
//!
//! ```text
//! TorClient (WASM)
//!   -> ResourcePool<Circuit>  (torclient-core)
//!   -> circuit_builder        (CREATE2/EXTEND2 over CellLink)
//!   -> CellLink               (cell framing over a Duplex)
//!   -> WasmTcpStream / WasmRtcStream (WebSocket / Snowflake bridge)
//! ```

use std::sync::Arc;

use wasm_bindgen::prelude::*;

mod circuit_builder;
mod directory;
pub mod error;
mod link;
mod link_handshake;
pub mod guards;
pub mod runtime;
pub mod storage;
pub mod transport;

pub use error::{Result, TorError};
pub use guards::{FailureInfo, GuardPersistence, GuardState, GUARD_LIFETIME_SECS, MAX_GUARDS, MIN_GUARDS};
pub use runtime::{WasmClock, WasmRuntime};
pub use storage::WasmStore;
pub use transport::{BridgeConfig, WasmRtcStream, WasmTcpStream};

use torclient_core::circuit::Circuit;
use torclient_core::consensus::Consensus;
use torclient_core::crypto::SystemCryptoProvider;
use torclient_core::pool::{PoolConfig, PoolStats, ResourcePool};
use torclient_core::store::Store;

/// Initializes panic reporting and the `log` backend. Call once before
/// constructing a [`TorClient`].
#[wasm_bindgen(start)]
pub fn init() {
    console_error_panic_hook::set_once();
    let _ = console_log::init_with_level(log::Level::Info);
    log::info!("torclient-wasm initialized");
}

fn http_base_from_bridge(bridge_url: &str) -> String {
    if let Some(rest) = bridge_url.strip_prefix("wss://") {
        format!("https://{rest}")
    } else if let Some(rest) = bridge_url.strip_prefix("ws://") {
        format!("http://{rest}")
    } else {
        bridge_url.to_string()
    }
}

fn xorshift_reseed(clock: &WasmClock) -> u64 {
    use torclient_core::clock::Clock;
    let nanos = clock.now().as_nanos() as u64;
    nanos ^ 0x9E3779B97F4A7C15
}

/// Browser-facing Tor client: owns persistent state (guards, directory
/// cache) and the circuit pool, and exposes the lifecycle JS needs.
#[wasm_bindgen]
pub struct TorClient {
    bridge_url: String,
    store: WasmStore,
    clock: WasmClock,
    guard_state: GuardState,
    consensus: Option<Consensus>,
    pool: Arc<ResourcePool<Circuit, WasmClock>>,
    bootstrapped: bool,
    next_circuit_id: u32,
}

#[wasm_bindgen]
impl TorClient {
    /// Creates a new client. `bridge_url` defaults to a local
    /// development bridge if omitted.
    #[wasm_bindgen(constructor)]
    pub async fn new(bridge_url: Option<String>) -> std::result::Result<TorClient, JsValue> {
        let bridge_url = bridge_url.unwrap_or_else(|| "ws://localhost:8080".to_string());
        log::info!("creating TorClient against bridge {bridge_url}");

        let store = WasmStore::open().await.map_err(TorError::Core)?;
        let clock = WasmClock::new();

        let guard_state = {
            let persistence = GuardPersistence::new(&store);
            match persistence.load().await {
                Ok(state) => state,
                Err(e) => {
                    log::warn!("failed to load guard state, starting fresh: {e}");
                    GuardState::new()
                }
            }
        };

        let pool = Arc::new(ResourcePool::new(PoolConfig::default(), Arc::new(clock)));

        Ok(Self {
            bridge_url,
            store,
            clock,
            guard_state,
            consensus: None,
            pool,
            bootstrapped: false,
            next_circuit_id: 0x8000_0001,
        })
    }

    /// Fetches (or loads a cached) consensus, refreshes guards if
    /// needed, and marks the client ready to build circuits.
    #[wasm_bindgen]
    pub async fn bootstrap(&mut self) -> std::result::Result<(), JsValue> {
        log::info!("bootstrapping...");
        let directory_url = http_base_from_bridge(&self.bridge_url);

        if let Ok(Some(cached)) = directory::load_cached_consensus(&self.store).await {
            log::info!("loaded {} relays from cache while fetching fresh consensus", cached.microdescs.len());
            self.consensus = Some(cached);
        }

        let now_unix = web_time::SystemTime::now()
            .duration_since(web_time::SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let clock = self.clock;
        let fetched = directory::fetch_consensus(
            &directory_url,
            &self.store,
            move |dur| {
                use torclient_core::clock::Clock;
                clock.sleep(dur)
            },
            || js_sys::Math::random() * 0.5 - 0.25,
        )
        .await;

        let consensus = match fetched {
            Ok(c) => c,
            Err(e) if self.consensus.is_some() => {
                log::warn!("consensus refresh failed, continuing with cached copy: {e}");
                self.consensus.take().unwrap()
            }
            Err(e) => return Err(JsValue::from(TorError::Core(e))),
        };

        log::info!("consensus has {} relays", consensus.microdescs.len());

        self.guard_state.cleanup(now_unix);
        if self.guard_state.needs_refresh(now_unix) {
            log::info!("selecting new guards...");
            self.guard_state
                .select_guards(&consensus.microdescs, now_unix, xorshift_reseed(&self.clock))?;
            let persistence = GuardPersistence::new(&self.store);
            if let Err(e) = persistence.save(&self.guard_state).await {
                log::warn!("failed to persist guard state: {e}");
            }
        } else {
            log::info!("reusing {} existing guards", self.guard_state.guards.len());
        }

        self.consensus = Some(consensus);
        self.bootstrapped = true;
        log::info!("bootstrap complete");
        Ok(())
    }

    /// Current status as a JSON-ish object for JS consumption.
    #[wasm_bindgen]
    pub fn status(&self) -> JsValue {
        let now_unix = web_time::SystemTime::now()
            .duration_since(web_time::SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let stats = self.pool.stats();
        let payload = serde_json::json!({
            "bootstrapped": self.bootstrapped,
            "relay_count": self.consensus.as_ref().map(|c| c.microdescs.len()).unwrap_or(0),
            "guard_count": self.guard_state.guards.len(),
            "usable_guards": self.guard_state.usable_guard_count(now_unix),
            "pool": pool_stats_json(&stats),
        });
        serde_wasm_bindgen::to_value(&payload).unwrap_or(JsValue::NULL)
    }

    /// Builds a 3-hop circuit (guard, middle, exit) and returns its
    /// circuit id. Reuses a pooled circuit when one is ready.
    #[wasm_bindgen]
    pub async fn build_circuit(&mut self) -> std::result::Result<u32, JsValue> {
        if !self.bootstrapped {
            return Err(JsValue::from(TorError::NotBootstrapped));
        }
        let consensus = self
            .consensus
            .as_ref()
            .ok_or_else(|| JsValue::from(TorError::NotBootstrapped))?;

        let path = select_path(consensus, &self.guard_state)
            .map_err(|e| JsValue::from(TorError::Core(e)))?;

        let directory_url = http_base_from_bridge(&self.bridge_url);
        let bridge_url = self.bridge_url.clone();
        let circuit_id = self.next_circuit_id;
        self.next_circuit_id = self.next_circuit_id.wrapping_add(2) | 0x8000_0000;

        let pool = self.pool.clone();
        let circuit = pool
            .acquire(move || {
                let path = path.clone();
                let directory_url = directory_url.clone();
                let bridge_url = bridge_url.clone();
                async move { build_one_circuit(&directory_url, &bridge_url, circuit_id, &path).await }
            })
            .await
            .map_err(TorError::Core)?;

        log::info!("circuit {circuit_id:#x} ready with {} hops", circuit.hop_count());
        Ok(circuit_id)
    }

    /// Resource-pool build/reuse statistics.
    #[wasm_bindgen]
    pub fn pool_stats(&self) -> JsValue {
        let stats = self.pool.stats();
        serde_wasm_bindgen::to_value(&pool_stats_json(&stats)).unwrap_or(JsValue::NULL)
    }
}

fn pool_stats_json(stats: &PoolStats) -> serde_json::Value {
    serde_json::json!({
        "builds_started": stats.builds_started,
        "builds_succeeded": stats.builds_succeeded,
        "builds_failed": stats.builds_failed,
    })
}

#[derive(Clone)]
struct PathEntry {
    fingerprint: String,
    digest: String,
    hostname: String,
    orport: u16,
}

/// Picks a guard (from persisted guard state), a middle relay, and an
/// exit relay from the current consensus, the way the reference
/// client's relay selector did: guard first, then any running relay,
/// then any relay carrying the `Exit` flag, excluding relays already
/// used earlier in the path.
fn select_path(consensus: &Consensus, guards: &GuardState) -> torclient_core::Result<Vec<PathEntry>> {
    use torclient_core::error::TorError as CoreError;

    let now_unix = 0; // only used to filter already-bad guards, already applied by caller
    let guard_fp = guards
        .next_guard(now_unix)
        .ok_or_else(|| CoreError::protocol("no usable guard"))?;

    let find = |fp: &str| consensus.microdescs.iter().find(|m| &m.identity_fingerprint == fp);
    let guard_desc = find(guard_fp).ok_or_else(|| CoreError::protocol("guard not present in consensus"))?;

    let middle = consensus
        .microdescs
        .iter()
        .find(|m| m.identity_fingerprint != *guard_fp && m.flags.iter().any(|f| f == "Running"))
        .ok_or_else(|| CoreError::protocol("no usable middle relay"))?;

    let exit = consensus
        .microdescs
        .iter()
        .find(|m| {
            m.identity_fingerprint != *guard_fp
                && m.identity_fingerprint != middle.identity_fingerprint
                && m.flags.iter().any(|f| f == "Exit")
        })
        .ok_or_else(|| CoreError::protocol("no usable exit relay"))?;

    [guard_desc, middle, exit]
        .into_iter()
        .map(|m| {
            Ok(PathEntry {
                fingerprint: m.identity_fingerprint.clone(),
                digest: m
                    .microdesc_digest
                    .clone()
                    .ok_or_else(|| CoreError::protocol("relay missing microdescriptor digest"))?,
                hostname: m.hostname.clone(),
                orport: m.orport,
            })
        })
        .collect()
}

fn identity_from_fingerprint(fingerprint: &str) -> torclient_core::Result<[u8; 20]> {
    use torclient_core::error::TorError as CoreError;
    use base64::Engine;
    let decoded = base64::engine::general_purpose::STANDARD_NO_PAD
        .decode(fingerprint.trim_end_matches('='))
        .or_else(|_| base64::engine::general_purpose::STANDARD.decode(fingerprint))
        .or_else(|_| hex::decode(fingerprint))
        .map_err(|_| CoreError::parse("relay fingerprint is neither base64 nor hex"))?;
    decoded
        .try_into()
        .map_err(|_| CoreError::parse("relay fingerprint must decode to 20 bytes"))
}

fn ipv4_from_hostname(hostname: &str) -> torclient_core::Result<[u8; 4]> {
    use torclient_core::error::TorError as CoreError;
    hostname
        .parse::<std::net::Ipv4Addr>()
        .map(|a| a.octets())
        .map_err(|_| CoreError::parse(format!("unsupported relay address '{hostname}' (IPv4 only)")))
}

async fn build_one_circuit(
    directory_url: &str,
    bridge_url: &str,
    circuit_id: u32,
    path: &[PathEntry],
) -> torclient_core::Result<Circuit> {
    use torclient_core::error::TorError as CoreError;

    let mut resolved = Vec::with_capacity(path.len());
    for entry in path {
        let ntor_key = directory::fetch_ntor_key(directory_url, &entry.digest).await?;
        resolved.push(circuit_builder::RelayDescriptor {
            identity: identity_from_fingerprint(&entry.fingerprint)?,
            ntor_key,
            ipv4: ipv4_from_hostname(&entry.hostname)?,
            port: entry.orport,
        });
    }

    let guard = &path[0];
    let guard_addr = std::net::SocketAddr::new(
        std::net::IpAddr::V4(ipv4_from_hostname(&guard.hostname)?.into()),
        guard.orport,
    );
    let bridge = BridgeConfig::new(bridge_url.to_string());
    let ws_url = bridge.build_url(&guard_addr);

    let stream = transport::WasmTcpStream::connect_with_retry(&ws_url)
        .await
        .map_err(|e| CoreError::transport(format!("bridge connect failed: {e}")))?;

    let mut link = link::CellLink::new(stream);
    let now_unix = web_time::SystemTime::now()
        .duration_since(web_time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0);
    // This bridge doesn't terminate TLS itself (the hop-to-hop TLS
    // library is out of scope here), so there's no leaf SPKI to pin
    // the SIGN_TO_TLS cert against.
    link_handshake::perform_link_handshake(&mut link, None, now_unix).await?;

    let crypto = SystemCryptoProvider;
    circuit_builder::build_circuit(&mut link, circuit_id, &resolved, &crypto).await
}
