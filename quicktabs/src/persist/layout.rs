//! Stored layout detection and migration.
//!
//! Three layouts have existed on disk over the lifetime of the extension.
//! Every load recognizes all of them, every save writes only the current
//! one, so a single load-then-save cycle upgrades a store in place.
//! Corrupted entries are dropped with a warning and never abort a load.

use std::collections::BTreeMap;

use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::SaveId;
use crate::quick_tab::{ContainerId, QuickTab};

/// Key under which the whole quick tab state lives.
pub const ROOT_KEY: &str = "quick_tabs_state_v2";

/// One container's share of the store.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSlice {
    pub tabs: Vec<QuickTab>,
    #[serde(default)]
    pub last_update: i64,
}

/// The current root layout. Historical layouts are only ever read.
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct StoreRoot {
    containers: BTreeMap<ContainerId, ContainerSlice>,
    save_id: SaveId,
    timestamp: i64,
}

/// Tag identifying which parser applies to a stored root value.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LayoutTag {
    /// Container map nested under a `containers` key.
    Current,
    /// Container map spread directly over the root object.
    Unwrapped,
    /// A flat `tabs` array with no container partitioning.
    Legacy,
    /// Absent, malformed, or not an object.
    Empty,
}

/// Decides which parser applies, purely structural.
pub fn detect_layout(root: Option<&Value>) -> LayoutTag {
    let Some(Value::Object(fields)) = root else {
        return LayoutTag::Empty;
    };
    if fields.get("containers").is_some_and(Value::is_object) {
        LayoutTag::Current
    } else if fields.get("tabs").is_some_and(Value::is_array) {
        LayoutTag::Legacy
    } else {
        LayoutTag::Unwrapped
    }
}

/// Reads a stored root of any layout into the container map.
/// Never fails, unreadable parts degrade to fewer entries.
pub fn read_store(root: Option<&Value>) -> BTreeMap<ContainerId, ContainerSlice> {
    match detect_layout(root) {
        LayoutTag::Current => {
            let containers = root
                .and_then(|value| value.get("containers"))
                .and_then(Value::as_object)
                .expect("layout detected as current");
            parse_container_map(containers)
        }
        LayoutTag::Unwrapped => {
            let containers = root
                .and_then(Value::as_object)
                .expect("layout detected as unwrapped");
            parse_container_map(containers)
        }
        LayoutTag::Legacy => {
            let tabs = root
                .and_then(|value| value.get("tabs"))
                .and_then(Value::as_array)
                .expect("layout detected as legacy");
            let container = ContainerId::default();
            let slice = parse_tabs(&container, tabs);
            if slice.tabs.is_empty() {
                BTreeMap::new()
            } else {
                BTreeMap::from([(container, slice)])
            }
        }
        LayoutTag::Empty => BTreeMap::new(),
    }
}

/// Serializes the container map into the current root layout.
pub fn write_store(
    containers: &BTreeMap<ContainerId, ContainerSlice>,
    save_id: &SaveId,
    timestamp: i64,
) -> Value {
    serde_json::to_value(StoreRoot {
        containers: containers.clone(),
        save_id: save_id.clone(),
        timestamp,
    })
    .expect("plain data serialization")
}

/// The write token of a stored root, [None] for historical layouts
/// that predate write tracking.
pub fn extract_save_id(root: Option<&Value>) -> Option<&str> {
    root?.get("saveId")?.as_str()
}

fn parse_container_map(
    fields: &serde_json::Map<String, Value>,
) -> BTreeMap<ContainerId, ContainerSlice> {
    let mut containers = BTreeMap::new();
    for (key, value) in fields {
        let Some(tabs) = value.get("tabs").and_then(Value::as_array) else {
            warn!("dropping container entry `{key}` without a tabs array");
            continue;
        };
        let container = ContainerId::new(key.clone());
        let mut slice = parse_tabs(&container, tabs);
        slice.last_update = value
            .get("lastUpdate")
            .and_then(Value::as_i64)
            .unwrap_or_default();
        containers.insert(container, slice);
    }
    containers
}

fn parse_tabs(container: &ContainerId, entries: &[Value]) -> ContainerSlice {
    let mut slice = ContainerSlice::default();
    for entry in entries {
        match QuickTab::from_stored(container, entry) {
            Ok(quick_tab) => slice.tabs.push(quick_tab),
            Err(error) => warn!("dropping quick tab entry in `{container}`: {error}"),
        }
    }
    slice
}
