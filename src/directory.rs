//! Directory plane glue: fetches the consensus (and individual
//! microdescriptor bodies) over the browser `fetch` API, with
//! exponential backoff, and caches the raw documents through a
//! [`Store`].
//!
//! The very first consensus fetch has no circuit to run a directory
//! stream over, so it goes straight to the configured directory cache's
//! HTTP endpoint; later refreshes would run the same request shape over
//! a circuit's directory stream once one exists.

use js_sys::{Promise, Uint8Array};
use wasm_bindgen::{JsCast, JsValue};
use wasm_bindgen_futures::JsFuture;
use web_sys::{Request, RequestInit, RequestMode, Response};

use torclient_core::consensus::verify::verify_consensus_signatures;
use torclient_core::consensus::{authcert, microdesc, Backoff, Consensus};
use torclient_core::error::{Result, TorError};
use torclient_core::store::Store;

const CONSENSUS_CACHE_KEY: &str = "directory:consensus";
const AUTHORITY_CERTS_CACHE_KEY: &str = "directory:authority-certs";
const CONSENSUS_PATH: &str = "/tor/status-vote/current/consensus-microdesc";
const AUTHORITY_CERTS_PATH: &str = "/tor/keys/all";
const BACKOFF_BASE_SECS: u64 = 2;
const BACKOFF_CAP_SECS: u64 = 60;
const MAX_ATTEMPTS: u32 = 5;

/// Fetches the authorities' signing-key certificates, falling back to
/// the last cached copy if the network request fails (stale signing
/// keys still let an older cached consensus be trusted; only a fresh
/// consensus actually requires fresh keys).
async fn authority_signing_keys<S: Store>(
    directory_base_url: &str,
    store: &S,
) -> Result<std::collections::HashMap<String, rsa::RsaPublicKey>> {
    match http_get(directory_base_url, AUTHORITY_CERTS_PATH).await {
        Ok(raw) => {
            let _ = store.write(AUTHORITY_CERTS_CACHE_KEY, raw.as_bytes()).await;
            Ok(authcert::parse_all_authority_certificates(&raw))
        }
        Err(e) => match store.read(AUTHORITY_CERTS_CACHE_KEY).await {
            Ok(bytes) => {
                let raw = String::from_utf8(bytes).map_err(|e| TorError::parse(e.to_string()))?;
                Ok(authcert::parse_all_authority_certificates(&raw))
            }
            Err(_) => Err(e),
        },
    }
}

async fn http_get(base_url: &str, path: &str) -> Result<String> {
    let mut opts = RequestInit::new();
    opts.method("GET");
    opts.mode(RequestMode::Cors);

    let url = format!("{}{}", base_url.trim_end_matches('/'), path);
    let request = Request::new_with_str_and_init(&url, &opts)
        .map_err(|e| TorError::transport(format!("bad directory request: {e:?}")))?;

    let window = web_sys::window().ok_or_else(|| TorError::transport("no window object"))?;
    let resp_value: JsValue = JsFuture::from(window.fetch_with_request(&request))
        .await
        .map_err(|e| TorError::transport(format!("directory fetch failed: {e:?}")))?;
    let resp: Response = resp_value
        .dyn_into()
        .map_err(|_| TorError::transport("fetch did not return a Response"))?;

    if !resp.ok() {
        return Err(TorError::transport(format!(
            "directory cache returned HTTP {}",
            resp.status()
        )));
    }

    let body_promise: Promise = resp
        .array_buffer()
        .map_err(|e| TorError::transport(format!("reading response body failed: {e:?}")))?;
    let buffer = JsFuture::from(body_promise)
        .await
        .map_err(|e| TorError::transport(format!("reading response body failed: {e:?}")))?;
    let bytes = Uint8Array::new(&buffer).to_vec();
    String::from_utf8(bytes).map_err(|e| TorError::parse(format!("non-utf8 directory response: {e}")))
}

/// Fetches the current consensus from `directory_base_url`, retrying
/// with exponential backoff, then parses and caches it. The `jitter`
/// closure supplies a value in `[-0.25, 0.25]` per retry (production
/// code samples it from the crypto RNG; tests pin it).
pub async fn fetch_consensus<S, ClockSleep, ClockSleepFut, Jitter>(
    directory_base_url: &str,
    store: &S,
    sleep: ClockSleep,
    mut jitter: Jitter,
) -> Result<Consensus>
where
    S: Store,
    ClockSleep: Fn(std::time::Duration) -> ClockSleepFut,
    ClockSleepFut: std::future::Future<Output = ()>,
    Jitter: FnMut() -> f64,
{
    let mut backoff = Backoff::new(
        std::time::Duration::from_secs(BACKOFF_BASE_SECS),
        std::time::Duration::from_secs(BACKOFF_CAP_SECS),
    );

    let mut last_err = None;
    for attempt in 0..MAX_ATTEMPTS {
        match http_get(directory_base_url, CONSENSUS_PATH).await {
            Ok(raw) => {
                let consensus = Consensus::parse(&raw)?;
                let signing_keys = authority_signing_keys(directory_base_url, store).await?;
                verify_consensus_signatures(&raw, &signing_keys)?;
                let _ = store.write(CONSENSUS_CACHE_KEY, raw.as_bytes()).await;
                log::info!(
                    "fetched consensus with {} relays (attempt {})",
                    consensus.microdescs.len(),
                    attempt + 1
                );
                return Ok(consensus);
            }
            Err(e) => {
                log::warn!("consensus fetch attempt {} failed: {e}", attempt + 1);
                last_err = Some(e);
                if attempt + 1 < MAX_ATTEMPTS {
                    sleep(backoff.next_delay(jitter())).await;
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| TorError::transport("consensus fetch exhausted retries")))
}

/// Loads the last cached consensus document, if any, without touching
/// the network. Used to get guards/relays usable immediately on
/// startup while a fresh fetch runs in the background.
pub async fn load_cached_consensus<S: Store>(store: &S) -> Result<Option<Consensus>> {
    let raw = match store.read(CONSENSUS_CACHE_KEY).await {
        Ok(bytes) => String::from_utf8(bytes).map_err(|e| TorError::parse(e.to_string()))?,
        Err(TorError::Closed(_)) => return Ok(None),
        Err(e) => return Err(e),
    };

    let cert_bytes = match store.read(AUTHORITY_CERTS_CACHE_KEY).await {
        Ok(bytes) => bytes,
        Err(TorError::Closed(_)) => {
            return Err(TorError::protocol("no cached authority certificates to verify cached consensus against"));
        }
        Err(e) => return Err(e),
    };
    let cert_doc = String::from_utf8(cert_bytes).map_err(|e| TorError::parse(e.to_string()))?;
    let signing_keys = authcert::parse_all_authority_certificates(&cert_doc);
    verify_consensus_signatures(&raw, &signing_keys)?;

    Ok(Some(Consensus::parse(&raw)?))
}

/// Fetches one microdescriptor body by its consensus-listed digest and
/// extracts the relay's ntor onion key.
pub async fn fetch_ntor_key(directory_base_url: &str, microdesc_digest: &str) -> Result<[u8; 32]> {
    let path = format!("/tor/micro/d/{microdesc_digest}");
    let body = http_get(directory_base_url, &path).await?;
    microdesc::parse_ntor_key(&body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use rsa::pkcs1v15::Pkcs1v15Sign;
    use rsa::traits::PublicKeyParts;
    use rsa::{RsaPrivateKey, RsaPublicKey};
    use torclient_core::consensus::verify::DIRECTORY_AUTHORITIES;
    use torclient_core::crypto::sha256;
    use torclient_core::store::MemStore;

    fn der_encode_rsa_public_key(key: &RsaPublicKey) -> Vec<u8> {
        fn der_integer(v: &num_bigint_dig::BigUint) -> Vec<u8> {
            let mut bytes = v.to_bytes_be();
            if bytes.first().is_some_and(|b| *b & 0x80 != 0) {
                bytes.insert(0, 0);
            }
            let mut out = vec![0x02u8];
            out.push(bytes.len() as u8);
            out.extend_from_slice(&bytes);
            out
        }
        let mut seq = der_integer(key.n());
        seq.extend_from_slice(&der_integer(key.e()));
        let mut out = vec![0x30u8, seq.len() as u8];
        out.extend_from_slice(&seq);
        out
    }

    /// Builds a minimal consensus signed by a strict majority of the
    /// known directory authorities, all (for test convenience) using the
    /// same test signing key.
    fn signed_consensus_fixture() -> (String, String) {
        let priv_key = RsaPrivateKey::new(&mut rand::rngs::OsRng, 512).unwrap();
        let pub_key = RsaPublicKey::from(&priv_key);
        let der = der_encode_rsa_public_key(&pub_key);
        let b64_key = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &der);
        let cert_doc = format!(
            "dir-key-certificate-version 3\ndir-signing-key\n-----BEGIN RSA PUBLIC KEY-----\n{b64_key}\n-----END RSA PUBLIC KEY-----\n"
        );
        let signing_fp = authcert::parse_authority_certificate(&cert_doc).unwrap().fingerprint;

        let preamble = "network-status-version 3 microdesc\n\
                   valid-after 2026-08-01 00:00:00\n\
                   fresh-until 2026-08-01 01:00:00\n\
                   valid-until 2026-08-01 03:00:00\n\
                   r c0der id 2026-08-01 00:00:00 1.2.3.4 443 0\n\
                   directory-signature ";
        let digest = sha256(preamble.as_bytes());
        let signature = priv_key.sign(Pkcs1v15Sign::new_unprefixed(), &digest).unwrap();
        let sig_b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &signature);

        let required = DIRECTORY_AUTHORITIES.len() / 2 + 1;
        let mut doc = preamble.to_string();
        for (i, authority) in DIRECTORY_AUTHORITIES.iter().take(required).enumerate() {
            if i > 0 {
                doc.push_str("directory-signature ");
            }
            doc.push_str(&format!(
                "sha256 {} {signing_fp}\n-----BEGIN SIGNATURE-----\n{sig_b64}\n-----END SIGNATURE-----\n",
                authority.v3ident
            ));
        }
        (doc, cert_doc)
    }

    #[test]
    fn cached_consensus_round_trips_through_store() {
        let store = MemStore::new();
        let (raw, cert_doc) = signed_consensus_fixture();
        block_on(store.write(CONSENSUS_CACHE_KEY, raw.as_bytes())).unwrap();
        block_on(store.write(AUTHORITY_CERTS_CACHE_KEY, cert_doc.as_bytes())).unwrap();

        let loaded = block_on(load_cached_consensus(&store)).unwrap();
        assert!(loaded.is_some());
        assert_eq!(loaded.unwrap().microdescs.len(), 1);
    }

    #[test]
    fn missing_cache_entry_is_not_an_error() {
        let store = MemStore::new();
        let loaded = block_on(load_cached_consensus(&store)).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn cached_consensus_without_cached_keys_is_rejected() {
        let store = MemStore::new();
        let (raw, _cert_doc) = signed_consensus_fixture();
        block_on(store.write(CONSENSUS_CACHE_KEY, raw.as_bytes())).unwrap();
        assert!(block_on(load_cached_consensus(&store)).is_err());
    }
}
