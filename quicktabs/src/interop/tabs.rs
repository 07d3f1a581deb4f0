//! Wrappers around the `browser.tabs` API.
//! Most fails are represented by
//! [FailedTabOperation](CustomError::FailedTabOperation).

use std::collections::BTreeSet;

use js_sys::{Object, Promise};
use serde::{Deserialize, Serialize};
use wasm_bindgen::prelude::*;
use wasm_bindgen_futures::JsFuture;

use crate::interop;
use crate::util::errors::CustomError;

#[wasm_bindgen]
extern "C" {
    #[wasm_bindgen(js_namespace=["browser", "tabs"], js_name="query")]
    fn tab_query(query_obj: JsValue) -> Promise;
}

/// Unique identifier assigned by the browser to a page context.
/// Not durable across a browser restart.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(transparent)]
pub struct TabId {
    inner: isize,
}

impl TabId {
    /// Creates a new ID by trusting the given value.
    pub fn new(tab_id: isize) -> Self {
        Self { inner: tab_id }
    }

    /// The browser never assigns negative identifiers,
    /// `browser.tabs.TAB_ID_NONE` and friends are negative sentinels.
    pub fn is_valid(&self) -> bool {
        self.inner >= 0
    }
}

impl std::fmt::Display for TabId {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt(formatter)
    }
}

/// Subset of tab properties consumed by the dead reference cleanup.
#[derive(Deserialize)]
struct QueriedTab {
    id: Option<TabId>,
}

/// Queries every open tab and collects the identifiers,
/// fails if the browser indicates so.
pub async fn live_tab_ids() -> Result<BTreeSet<TabId>, CustomError> {
    let queried = JsFuture::from(tab_query(JsValue::from(Object::default())))
        .await
        .or(Err(CustomError::FailedTabOperation {
            verb: String::from("query"),
        }))?;
    let tabs = interop::cast_or_standard_mismatch::<Vec<QueriedTab>>(queried)?;
    Ok(tabs.into_iter().filter_map(|tab| tab.id).collect())
}

#[cfg(test)]
mod test {
    use wasm_bindgen_test::wasm_bindgen_test;

    use super::*;

    #[wasm_bindgen_test]
    fn test_tab_id_validity() {
        assert!(TabId::new(0).is_valid());
        assert!(TabId::new(7).is_valid());
        assert!(!TabId::new(-1).is_valid());
    }

    #[wasm_bindgen_test]
    fn test_tab_id_ordering_is_stable() {
        let set = BTreeSet::from([TabId::new(12), TabId::new(3), TabId::new(7)]);
        let ordered = set.into_iter().collect::<Vec<TabId>>();
        assert_eq!(vec![TabId::new(3), TabId::new(7), TabId::new(12)], ordered);
    }
}
