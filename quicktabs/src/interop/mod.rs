//! Components that interact with the browser and Javascript,
//! all types are only minimally wrapped and type-casted.
//! Operations can fail with [StandardMismatch](CustomError::StandardMismatch)
//! if it uses an external API and the API returned an unexpected value.

pub mod broadcast;
pub mod storage;
pub mod tabs;

use std::any;

use serde::{Deserialize, Serialize};
use serde_wasm_bindgen::Serializer;
use wasm_bindgen::prelude::*;

use crate::util::errors::CustomError;

/// Serializes a [Serialize] type to a [JsValue]
/// using a JSON compatible serializer.
pub fn to_jsvalue<T>(value: &T) -> JsValue
where
    T: Serialize + ?Sized,
{
    value
        .serialize(&Serializer::json_compatible())
        .expect("serialization fail unlikely")
}

/// Casts a [JsValue] into a [Deserialize] type.
/// Fails if they are not compatible.
pub fn cast_or_standard_mismatch<T>(target: JsValue) -> Result<T, CustomError>
where
    T: for<'de> Deserialize<'de>,
{
    serde_wasm_bindgen::from_value(target).or(Err(CustomError::StandardMismatch {
        message: format!("`{}` expected", any::type_name::<T>()),
    }))
}
