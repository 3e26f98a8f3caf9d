//! WASM bridge exposing the QSS integrators to JavaScript.

mod system;

pub use system::WasmQssSystem;
