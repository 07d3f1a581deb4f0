//! User configuration consumed by the synchronization core.
//!
//! Settings live under their own root key so that state writes never race
//! configuration writes. The background context watches the key and
//! re-broadcasts changes to every open replication channel.

use derivative::Derivative;
use serde::{Deserialize, Serialize};

#[mockall_double::double]
use crate::interop::storage::StorageArea;
use crate::util::errors::CustomError;

/// Key under which the user configuration lives.
pub const SETTINGS_KEY: &str = "quick_tabs_settings";

/// The slice of user configuration the core consumes.
/// Everything else in the options page is handled by the UI layer.
#[derive(Clone, Debug, Derivative, Deserialize, Eq, PartialEq, Serialize)]
#[derivative(Default)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    /// Upper bound of quick tabs per container, enforced at creation.
    #[derivative(Default(value = "20"))]
    pub max_quick_tabs: usize,
    /// Lowers the log threshold to debug when set.
    pub debug_logging: bool,
}

impl Settings {
    /// Loads the stored configuration, a missing or unreadable entry
    /// falls back to the defaults. Fails if the browser indicates so.
    pub async fn load(area: &StorageArea) -> Result<Self, CustomError> {
        let Some(stored) = area.load_value(SETTINGS_KEY).await? else {
            return Ok(Self::default());
        };
        Ok(serde_json::from_value(stored).unwrap_or_default())
    }

    /// Persists the configuration, fails if the browser indicates so.
    pub async fn store(&self, area: &StorageArea) -> Result<(), CustomError> {
        let value = serde_json::to_value(self).expect("plain data serialization");
        area.store_value(SETTINGS_KEY, &value).await
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;
    use wasm_bindgen_test::wasm_bindgen_test;

    use super::*;
    use crate::interop::storage::MockStorageArea;

    #[wasm_bindgen_test]
    async fn test_load_defaults_when_absent_or_unreadable() {
        let mut area = MockStorageArea::default();
        area.expect_load_value().times(1).returning(|_| Ok(None));
        assert_eq!(
            Settings::default(),
            Settings::load(&area).await.expect("mocked read")
        );

        let mut area = MockStorageArea::default();
        area.expect_load_value()
            .returning(|_| Ok(Some(json!("gibberish"))));
        assert_eq!(
            Settings::default(),
            Settings::load(&area).await.expect("mocked read")
        );
    }

    #[wasm_bindgen_test]
    async fn test_load_reads_partial_entries() {
        let mut area = MockStorageArea::default();
        area.expect_load_value()
            .returning(|_| Ok(Some(json!({"maxQuickTabs": 5}))));
        let settings = Settings::load(&area).await.expect("mocked read");
        assert_eq!(5, settings.max_quick_tabs);
        assert!(!settings.debug_logging);
    }

    #[wasm_bindgen_test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(20, settings.max_quick_tabs);
        assert!(!settings.debug_logging);
    }
}
