//! IndexedDB-backed `Store`: a single `"tor"` object store keyed by
//! `mangle_key`-escaped strings, persisting consensus, relay, and
//! circuit-pool state across page reloads.

use std::cell::RefCell;
use std::rc::Rc;

use js_sys::{Array, Promise, Uint8Array};
use wasm_bindgen::prelude::*;
use web_sys::{IdbDatabase, IdbRequest, IdbTransactionMode, IdbVersionChangeEvent};

use async_trait::async_trait;
use torclient_core::error::{Result, TorError};
use torclient_core::store::{mangle_key, Store};

const OBJECT_STORE: &str = "tor";
const DB_NAME: &str = "tor-storage";
const DB_VERSION: u32 = 1;

/// Bridges an `IdbRequest`'s `onsuccess`/`onerror` callbacks to a future.
async fn request_to_future(request: &IdbRequest) -> std::result::Result<JsValue, JsValue> {
    let promise = Promise::new(&mut |resolve, reject| {
        let resolve = Rc::new(RefCell::new(Some(resolve)));
        let reject = Rc::new(RefCell::new(Some(reject)));

        let resolve_clone = Rc::clone(&resolve);
        let onsuccess = Closure::once(move |event: web_sys::Event| {
            if let Some(target) = event.target() {
                if let Ok(request) = target.dyn_into::<IdbRequest>() {
                    if let Ok(result) = request.result() {
                        if let Some(resolve_fn) = resolve_clone.borrow_mut().take() {
                            let _ = resolve_fn.call1(&JsValue::NULL, &result);
                        }
                    }
                }
            }
        });

        let reject_clone = Rc::clone(&reject);
        let onerror = Closure::once(move |_event: web_sys::Event| {
            let error = JsValue::from_str("IndexedDB request failed");
            if let Some(reject_fn) = reject_clone.borrow_mut().take() {
                let _ = reject_fn.call1(&JsValue::NULL, &error);
            }
        });

        request.set_onsuccess(Some(onsuccess.as_ref().unchecked_ref()));
        request.set_onerror(Some(onerror.as_ref().unchecked_ref()));
        onsuccess.forget();
        onerror.forget();
    });

    wasm_bindgen_futures::JsFuture::from(promise).await
}

fn storage_err(context: &str, e: JsValue) -> TorError {
    TorError::transport(format!("{context}: {e:?}"))
}

/// `Store` implementation over browser IndexedDB.
#[derive(Clone)]
pub struct WasmStore {
    db: IdbDatabase,
}

impl WasmStore {
    pub async fn open() -> Result<Self> {
        log::info!("opening IndexedDB database {DB_NAME}");

        let window = web_sys::window().ok_or_else(|| TorError::transport("no window object"))?;
        let idb = window
            .indexed_db()
            .map_err(|e| storage_err("indexedDB unavailable", e))?
            .ok_or_else(|| TorError::transport("IndexedDB not supported"))?;

        let open_request = idb
            .open_with_u32(DB_NAME, DB_VERSION)
            .map_err(|e| storage_err("failed to open database", e))?;

        let on_upgrade = Closure::once(move |event: IdbVersionChangeEvent| {
            let Some(target) = event.target() else { return };
            let Ok(request) = target.dyn_into::<IdbRequest>() else { return };
            let Ok(result) = request.result() else { return };
            let Ok(db) = result.dyn_into::<IdbDatabase>() else { return };
            if !db.object_store_names().contains(OBJECT_STORE) {
                let _ = db.create_object_store(OBJECT_STORE);
            }
        });
        open_request.set_onupgradeneeded(Some(on_upgrade.as_ref().unchecked_ref()));
        on_upgrade.forget();

        let db_value = request_to_future(&open_request)
            .await
            .map_err(|e| storage_err("failed to open database", e))?;
        let db = db_value
            .dyn_into::<IdbDatabase>()
            .map_err(|e| storage_err("open result was not a database", e))?;

        Ok(Self { db })
    }

    fn transaction(&self, mode: IdbTransactionMode) -> Result<web_sys::IdbObjectStore> {
        let txn = self
            .db
            .transaction_with_str_and_mode(OBJECT_STORE, mode)
            .map_err(|e| storage_err("failed to open transaction", e))?;
        txn.object_store(OBJECT_STORE)
            .map_err(|e| storage_err("failed to open object store", e))
    }
}

#[async_trait(?Send)]
impl Store for WasmStore {
    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        let store = self.transaction(IdbTransactionMode::Readonly)?;
        let request = store
            .get(&JsValue::from_str(&mangle_key(key)))
            .map_err(|e| storage_err("failed to issue get", e))?;
        let result = request_to_future(&request)
            .await
            .map_err(|e| storage_err("get failed", e))?;
        if result.is_undefined() || result.is_null() {
            return Err(TorError::Closed(format!("not found: {key}")));
        }
        let array = Uint8Array::new(&result);
        let mut buf = vec![0u8; array.length() as usize];
        array.copy_to(&mut buf);
        Ok(buf)
    }

    async fn write(&self, key: &str, value: &[u8]) -> Result<()> {
        let store = self.transaction(IdbTransactionMode::Readwrite)?;
        let array = Uint8Array::from(value);
        let request = store
            .put_with_key(&array, &JsValue::from_str(&mangle_key(key)))
            .map_err(|e| storage_err("failed to issue put", e))?;
        request_to_future(&request)
            .await
            .map_err(|e| storage_err("put failed", e))?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mangled_prefix = mangle_key(prefix);
        let store = self.transaction(IdbTransactionMode::Readonly)?;
        let request = store
            .get_all_keys()
            .map_err(|e| storage_err("failed to issue get_all_keys", e))?;
        let result = request_to_future(&request)
            .await
            .map_err(|e| storage_err("get_all_keys failed", e))?;
        let array = Array::from(&result);
        let mut keys: Vec<String> = (0..array.length())
            .filter_map(|i| array.get(i).as_string())
            .filter(|k| k.starts_with(&mangled_prefix))
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let store = self.transaction(IdbTransactionMode::Readwrite)?;
        let request = store
            .delete(&JsValue::from_str(&mangle_key(key)))
            .map_err(|e| storage_err("failed to issue delete", e))?;
        request_to_future(&request)
            .await
            .map_err(|e| storage_err("delete failed", e))?;
        Ok(())
    }

    async fn remove_all(&self, prefix: &str) -> Result<()> {
        for key in self.list(prefix).await? {
            let store = self.transaction(IdbTransactionMode::Readwrite)?;
            let request = store
                .delete(&JsValue::from_str(&key))
                .map_err(|e| storage_err("failed to issue delete", e))?;
            request_to_future(&request)
                .await
                .map_err(|e| storage_err("delete failed", e))?;
        }
        Ok(())
    }
}

// SAFETY: wasm32 has no real threads; `IdbDatabase` is `!Send` only
// because it wraps a `JsValue`, never because it is shared across workers.
unsafe impl Send for WasmStore {}
unsafe impl Sync for WasmStore {}

#[cfg(test)]
mod tests {
    use super::*;
    use wasm_bindgen_test::*;

    wasm_bindgen_test_configure!(run_in_browser);

    #[wasm_bindgen_test]
    async fn write_then_read_round_trips() {
        let store = WasmStore::open().await.unwrap();
        store.write("consensus:test", b"hello").await.unwrap();
        assert_eq!(store.read("consensus:test").await.unwrap(), b"hello");
        store.remove_all("consensus:").await.unwrap();
    }

    #[wasm_bindgen_test]
    async fn missing_key_is_an_error() {
        let store = WasmStore::open().await.unwrap();
        assert!(store.read("does-not-exist").await.is_err());
    }

    #[wasm_bindgen_test]
    async fn list_respects_prefix() {
        let store = WasmStore::open().await.unwrap();
        store.write("relay:a", b"1").await.unwrap();
        store.write("relay:b", b"2").await.unwrap();
        store.write("other:c", b"3").await.unwrap();
        let keys = store.list("relay:").await.unwrap();
        assert_eq!(keys.len(), 2);
        store.remove_all("relay:").await.unwrap();
        store.remove_all("other:").await.unwrap();
    }
}
