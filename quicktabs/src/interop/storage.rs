//! Wrappers around the `browser.storage.*` APIs.
//! Most fails are represented by
//! [FailedStorageOperation](CustomError::FailedStorageOperation),
//! rejected writes that name the quota become
//! [QuotaExceeded](CustomError::QuotaExceeded).

use js_sys::{Object, Promise, Reflect};
#[cfg(test)]
use mockall::mock;
use serde_json::Value;
use wasm_bindgen::JsCast;
use wasm_bindgen::prelude::*;
use wasm_bindgen_futures::JsFuture;

use crate::interop;
use crate::util::errors::CustomError;

#[wasm_bindgen]
extern "C" {
    #[wasm_bindgen(js_namespace=["browser", "storage", "sync"], js_name="get")]
    fn sync_get(keys: &JsValue) -> Promise;
    #[wasm_bindgen(js_namespace=["browser", "storage", "sync"], js_name="set")]
    fn sync_set(keys: &JsValue) -> Promise;
    #[wasm_bindgen(js_namespace=["browser", "storage", "sync"], js_name="remove")]
    fn sync_remove(keys: &JsValue) -> Promise;
    #[wasm_bindgen(js_namespace=["browser", "storage", "sync"], js_name="clear")]
    fn sync_clear() -> Promise;

    #[wasm_bindgen(js_namespace=["browser", "storage", "local"], js_name="get")]
    fn local_get(keys: &JsValue) -> Promise;
    #[wasm_bindgen(js_namespace=["browser", "storage", "local"], js_name="set")]
    fn local_set(keys: &JsValue) -> Promise;
    #[wasm_bindgen(js_namespace=["browser", "storage", "local"], js_name="remove")]
    fn local_remove(keys: &JsValue) -> Promise;
    #[wasm_bindgen(js_namespace=["browser", "storage", "local"], js_name="clear")]
    fn local_clear() -> Promise;

    #[wasm_bindgen(js_namespace=["browser", "storage", "session"], js_name="get")]
    fn session_get(keys: &JsValue) -> Promise;
    #[wasm_bindgen(js_namespace=["browser", "storage", "session"], js_name="set")]
    fn session_set(keys: &JsValue) -> Promise;
    #[wasm_bindgen(js_namespace=["browser", "storage", "session"], js_name="remove")]
    fn session_remove(keys: &JsValue) -> Promise;
    #[wasm_bindgen(js_namespace=["browser", "storage", "session"], js_name="clear")]
    fn session_clear() -> Promise;
}

/// Which `browser.storage` namespace an area is backed by.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum AreaKind {
    Sync,
    Local,
    Session,
}

/// Capability over a single durable key-value namespace.
/// Values cross the boundary as [serde_json::Value] trees so that callers
/// stay independent of Javascript types.
#[derive(Debug)]
pub struct StorageArea {
    kind: AreaKind,
}

impl StorageArea {
    /// The quota-limited cross-device area.
    pub fn sync() -> Self {
        Self {
            kind: AreaKind::Sync,
        }
    }

    /// The unlimited device-local area.
    pub fn local() -> Self {
        Self {
            kind: AreaKind::Local,
        }
    }

    /// The non-persistent session area.
    pub fn session() -> Self {
        Self {
            kind: AreaKind::Session,
        }
    }

    /// Loads the value stored under a key, [None] if the key is absent.
    /// Fails if the browser indicates so.
    pub async fn load_value(&self, key: &str) -> Result<Option<Value>, CustomError> {
        let request = interop::to_jsvalue(&[key]);
        let got = JsFuture::from(match self.kind {
            AreaKind::Sync => sync_get(&request),
            AreaKind::Local => local_get(&request),
            AreaKind::Session => session_get(&request),
        })
        .await
        .or(Err(CustomError::FailedStorageOperation {
            verb_prep: String::from("load from"),
        }))?;
        let value = Reflect::get(&Object::from(got), &JsValue::from_str(key))
            .expect("type checked to be object");
        if value.is_undefined() || value.is_null() {
            Ok(None)
        } else {
            interop::cast_or_standard_mismatch(value).map(Some)
        }
    }

    /// Stores a value under a key, fails if the browser indicates so.
    /// A rejection that names the quota is reported as
    /// [QuotaExceeded](CustomError::QuotaExceeded) so that callers can
    /// fall back to an unlimited area.
    pub async fn store_value(&self, key: &str, value: &Value) -> Result<(), CustomError> {
        let keys = Object::new();
        Reflect::set(&keys, &JsValue::from_str(key), &interop::to_jsvalue(value))
            .expect("inline construction");
        JsFuture::from(match self.kind {
            AreaKind::Sync => sync_set(&keys),
            AreaKind::Local => local_set(&keys),
            AreaKind::Session => session_set(&keys),
        })
        .await
        .map_err(|rejection| {
            if rejection_names_quota(&rejection) {
                CustomError::QuotaExceeded
            } else {
                CustomError::FailedStorageOperation {
                    verb_prep: String::from("store to"),
                }
            }
        })?;
        Ok(())
    }

    /// Removes the entry stored under a key,
    /// fails if the browser indicates so.
    pub async fn remove_entry(&self, key: &str) -> Result<(), CustomError> {
        JsFuture::from(match self.kind {
            AreaKind::Sync => sync_remove(&interop::to_jsvalue(&[key])),
            AreaKind::Local => local_remove(&interop::to_jsvalue(&[key])),
            AreaKind::Session => session_remove(&interop::to_jsvalue(&[key])),
        })
        .await
        .or(Err(CustomError::FailedStorageOperation {
            verb_prep: String::from("remove from"),
        }))?;
        Ok(())
    }

    /// Removes every entry in the area, fails if the browser indicates so.
    pub async fn clear_all(&self) -> Result<(), CustomError> {
        JsFuture::from(match self.kind {
            AreaKind::Sync => sync_clear(),
            AreaKind::Local => local_clear(),
            AreaKind::Session => session_clear(),
        })
        .await
        .or(Err(CustomError::FailedStorageOperation {
            verb_prep: String::from("clear"),
        }))?;
        Ok(())
    }
}

/// Checks whether a rejected promise value mentions a quota limit,
/// the standard does not define an error shape so this is a string match.
fn rejection_names_quota(rejection: &JsValue) -> bool {
    let message = rejection
        .as_string()
        .or_else(|| {
            rejection
                .dyn_ref::<js_sys::Error>()
                .map(|error| String::from(error.message()))
        })
        .unwrap_or_default();
    message.to_ascii_lowercase().contains("quota")
}

/// A single key's transition reported by the browser's change stream.
#[derive(Clone, Debug, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageChange {
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

#[cfg(test)]
mock! {
    pub StorageArea {
        pub fn sync() -> Self;
        pub fn local() -> Self;
        pub fn session() -> Self;
        pub async fn load_value(&self, key: &str) -> Result<Option<Value>, CustomError>;
        pub async fn store_value(&self, key: &str, value: &Value) -> Result<(), CustomError>;
        pub async fn remove_entry(&self, key: &str) -> Result<(), CustomError>;
        pub async fn clear_all(&self) -> Result<(), CustomError>;
    }
}
