//! Platform-agnostic Tor protocol core: binary framing, crypto
//! primitives, the directory and certificate planes, the cell-based
//! circuit protocol, and a bounded-concurrency resource pool.
//!
//! This crate has no browser or OS transport dependency; the `wasm`
//! crate at the workspace root wires it to `web-sys`/`wasm-bindgen`.

pub mod cell;
pub mod cert;
pub mod circuit;
pub mod clock;
pub mod consensus;
pub mod crypto;
pub mod cursor;
pub mod error;
pub mod ntor;
pub mod pool;
pub mod relay;
pub mod store;
pub mod stream;
pub mod transport;

pub use error::{PoolFailureClass, Result, TorError};

use futures::io::{AsyncRead, AsyncWrite};

/// A bidirectional byte stream. Every transport-layer session (WebSocket,
/// Snowflake/KCP/SMUX, the relay-stream duplex exposed to application
/// code) implements this instead of a bespoke per-layer interface.
pub trait Duplex: AsyncRead + AsyncWrite + Unpin {}
impl<T: AsyncRead + AsyncWrite + Unpin> Duplex for T {}
