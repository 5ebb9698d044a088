//! Browser persistence: a single `Store` implementation over IndexedDB,
//! used for the directory cache, guard state, and circuit-pool bookkeeping.

mod indexeddb;

pub use indexeddb::WasmStore;
