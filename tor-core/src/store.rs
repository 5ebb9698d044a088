//! Key/value storage contract shared by every backend (in-memory, native
//! filesystem, browser IndexedDB). Keys are arbitrary strings; backends
//! that can't store arbitrary bytes as a key must mangle them injectively.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{Result, TorError};

#[async_trait(?Send)]
pub trait Store {
    async fn read(&self, key: &str) -> Result<Vec<u8>>;
    async fn write(&self, key: &str, value: &[u8]) -> Result<()>;
    /// Sorted list of keys with the given prefix.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
    async fn remove(&self, key: &str) -> Result<()>;
    async fn remove_all(&self, prefix: &str) -> Result<()>;
}

/// Escapes a key so it is safe to use as a single path segment / IndexedDB
/// key without colliding across different logical keys: any byte outside
/// `[A-Za-z0-9_]` is percent-escaped as `_XX` (hex), and `_` itself is
/// escaped as `__` so the mapping stays injective.
pub fn mangle_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' => out.push(b as char),
            b'_' => out.push_str("__"),
            _ => out.push_str(&format!("_{b:02X}")),
        }
    }
    out
}

/// A simple in-memory `Store`, the default for tests and for native
/// builds without a persistence requirement.
#[derive(Default)]
pub struct MemStore {
    data: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait(?Send)]
impl Store for MemStore {
    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        self.data
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| TorError::Closed(format!("not found: {key}")))
    }

    async fn write(&self, key: &str, value: &[u8]) -> Result<()> {
        self.data
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .data
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.data.lock().unwrap().remove(key);
        Ok(())
    }

    async fn remove_all(&self, prefix: &str) -> Result<()> {
        self.data.lock().unwrap().retain(|k, _| !k.starts_with(prefix));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    #[test]
    fn write_then_read_round_trips() {
        let store = MemStore::new();
        block_on(store.write("consensus:2026-08-01T00", b"abc")).unwrap();
        assert_eq!(block_on(store.read("consensus:2026-08-01T00")).unwrap(), b"abc");
    }

    #[test]
    fn remove_all_by_prefix() {
        let store = MemStore::new();
        block_on(store.write("consensus:a", b"1")).unwrap();
        block_on(store.write("consensus:b", b"2")).unwrap();
        block_on(store.write("other:c", b"3")).unwrap();
        block_on(store.remove_all("consensus:")).unwrap();
        assert!(block_on(store.read("consensus:a")).is_err());
        assert!(block_on(store.read("consensus:b")).is_err());
        assert_eq!(block_on(store.read("other:c")).unwrap(), b"3");
    }

    #[test]
    fn list_returns_sorted_keys_with_prefix() {
        let store = MemStore::new();
        block_on(store.write("k:b", b"")).unwrap();
        block_on(store.write("k:a", b"")).unwrap();
        block_on(store.write("x:z", b"")).unwrap();
        assert_eq!(block_on(store.list("k:")).unwrap(), vec!["k:a", "k:b"]);
    }

    #[test]
    fn mangle_key_is_injective_for_distinct_inputs() {
        assert_ne!(mangle_key("a:b"), mangle_key("a_b"));
        assert_ne!(mangle_key("a_b"), mangle_key("a__b"));
    }
}
