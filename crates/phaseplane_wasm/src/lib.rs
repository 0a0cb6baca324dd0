//! WASM bridge for the PhasePlane core library.
//!
//! `WasmPhasePlane` holds one system and its view settings; every analysis
//! result crosses the boundary as a plain JS object via `serde-wasm-bindgen`.

use serde::Serialize;
use serde_wasm_bindgen::to_value;
use wasm_bindgen::prelude::*;

mod analysis;
mod system;

pub use system::WasmPhasePlane;

pub(crate) fn to_js_error(error: impl std::fmt::Display) -> JsValue {
    JsValue::from_str(&error.to_string())
}

pub(crate) fn to_js<T: Serialize>(value: &T) -> Result<JsValue, JsValue> {
    to_value(value).map_err(|e| JsValue::from_str(&format!("Serialization error: {}", e)))
}
