//! Task spawning implementation for WASM

use futures::task::{FutureObj, Spawn, SpawnError};
use wasm_bindgen_futures::spawn_local;

use super::WasmRuntime;

/// WASM spawner that uses wasm-bindgen-futures
#[derive(Debug, Clone)]
pub struct WasmSpawner;

impl Spawn for WasmSpawner {
    fn spawn_obj(&self, future: FutureObj<'static, ()>) -> Result<(), SpawnError> {
        // spawn_local runs the future to completion in the browser's event loop
        spawn_local(async move {
            future.await;
        });
        
        Ok(())
    }
}

impl Spawn for WasmRuntime {
    fn spawn_obj(&self, future: FutureObj<'static, ()>) -> Result<(), SpawnError> {
        WasmSpawner.spawn_obj(future)
    }
}
