//! Quick tab value object and its visibility rules.
//!
//! A quick tab is a floating window replicated across every page context of
//! one container. All methods here are pure with respect to I/O, mutation of
//! the shared collection and propagation to peers happen elsewhere.

use std::collections::BTreeSet;
use std::fmt::{Display, Formatter, Result as FmtResult};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::interop::tabs::TabId;
use crate::util;
use crate::util::errors::CustomError;

/// Unique identifier that is stable for the lifetime of a quick tab.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct QuickTabId {
    inner: String,
}

impl QuickTabId {
    /// Creates an ID by trusting the given value.
    pub fn new(id: String) -> Self {
        Self { inner: id }
    }

    /// Generates a fresh globally unique ID.
    pub fn generate() -> Self {
        Self {
            inner: format!("qt-{}", util::unique_token()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl Display for QuickTabId {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> FmtResult {
        formatter.write_str(&self.inner)
    }
}

/// Identifier of a cookie-store partition, the replication domain.
/// Two quick tabs in different containers never observe each other.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct ContainerId {
    inner: String,
}

impl ContainerId {
    /// Creates an ID by trusting the given value.
    pub fn new(container_id: String) -> Self {
        Self {
            inner: container_id,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Name of the replication channel for this container.
    /// Isolation between containers rides on the name.
    pub fn channel_name(&self) -> String {
        format!("quick-tabs-sync-{}", self.inner)
    }
}

impl Default for ContainerId {
    /// The canonical partition used when the host cannot provide one.
    fn default() -> Self {
        Self {
            inner: String::from("<default>"),
        }
    }
}

impl Display for ContainerId {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> FmtResult {
        formatter.write_str(&self.inner)
    }
}

/// Window origin in CSS pixels, negative values are off-screen but legal.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Position {
    pub left: i32,
    pub top: i32,
}

/// Window extent in CSS pixels, always positive.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Size {
    pub width: i32,
    pub height: i32,
}

impl Size {
    pub fn is_positive(&self) -> bool {
        self.width > 0 && self.height > 0
    }
}

/// Per-context visibility state of a quick tab.
/// The solo and mute lists are mutually exclusive, at any time at most one
/// of them is non-empty.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Visibility {
    pub soloed_on_tabs: BTreeSet<TabId>,
    pub muted_on_tabs: BTreeSet<TabId>,
    pub minimized: bool,
}

impl Visibility {
    /// Restores mutual exclusion on values of external origin,
    /// the solo list wins when both are populated.
    fn normalized(mut self) -> Self {
        if !self.soloed_on_tabs.is_empty() {
            self.muted_on_tabs.clear();
        }
        self
    }
}

/// Which visibility lists a dead reference sweep actually touched,
/// used to publish only the updates that are needed.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CleanupOutcome {
    pub solo_changed: bool,
    pub mute_changed: bool,
}

impl CleanupOutcome {
    pub fn changed(&self) -> bool {
        self.solo_changed || self.mute_changed
    }
}

/// Validated inputs for constructing a quick tab.
#[derive(Clone, Debug)]
pub struct NewQuickTab {
    pub url: String,
    pub title: Option<String>,
    pub position: Position,
    pub size: Size,
    pub container: ContainerId,
    pub visibility: Option<Visibility>,
}

/// The unit of replication.
/// The identifier and the container are fixed at creation,
/// a quick tab never migrates between containers.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuickTab {
    id: QuickTabId,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub position: Position,
    pub size: Size,
    container: ContainerId,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub z_index: i32,
    #[serde(default = "Utc::now", with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

impl QuickTab {
    /// Creates a quick tab with a freshly generated ID.
    /// Fails with [InvalidArgument](CustomError::InvalidArgument) if the
    /// URL or container is empty, or the size is not positive.
    pub fn create(new: NewQuickTab) -> Result<Self, CustomError> {
        Self::with_id(QuickTabId::generate(), new)
    }

    /// Creates a quick tab under an identifier assigned elsewhere,
    /// used when materializing an entity announced by a peer.
    pub fn with_id(id: QuickTabId, new: NewQuickTab) -> Result<Self, CustomError> {
        validate_fields(&id, &new.url, &new.container, &new.size)?;
        Ok(Self {
            id,
            url: new.url,
            title: new.title,
            position: new.position,
            size: new.size,
            container: new.container,
            visibility: new.visibility.unwrap_or_default().normalized(),
            z_index: 0,
            created_at: Utc::now(),
        })
    }

    pub fn id(&self) -> &QuickTabId {
        &self.id
    }

    pub fn container(&self) -> &ContainerId {
        &self.container
    }

    /// Replaces the window origin.
    pub fn update_position(&mut self, left: i32, top: i32) {
        self.position = Position { left, top };
    }

    /// Replaces the window extent,
    /// fails if either dimension is not positive.
    pub fn update_size(&mut self, width: i32, height: i32) -> Result<(), CustomError> {
        let size = Size { width, height };
        if !size.is_positive() {
            return Err(CustomError::InvalidArgument {
                message: format!("size {width}x{height} is not positive"),
            });
        }
        self.size = size;
        Ok(())
    }

    /// Replaces the solo list and clears the mute list atomically.
    pub fn solo(&mut self, tab_ids: BTreeSet<TabId>) {
        self.visibility.soloed_on_tabs = tab_ids;
        self.visibility.muted_on_tabs.clear();
    }

    /// Replaces the mute list and clears the solo list atomically.
    pub fn mute(&mut self, tab_ids: BTreeSet<TabId>) {
        self.visibility.muted_on_tabs = tab_ids;
        self.visibility.soloed_on_tabs.clear();
    }

    pub fn minimize(&mut self, minimized: bool) {
        self.visibility.minimized = minimized;
    }

    /// Drops references to page contexts that no longer exist.
    /// An emptied solo list makes the quick tab globally visible again.
    pub fn cleanup_dead_tabs(&mut self, alive: &BTreeSet<TabId>) -> CleanupOutcome {
        let solo_before = self.visibility.soloed_on_tabs.len();
        let mute_before = self.visibility.muted_on_tabs.len();
        self.visibility
            .soloed_on_tabs
            .retain(|tab_id| alive.contains(tab_id));
        self.visibility
            .muted_on_tabs
            .retain(|tab_id| alive.contains(tab_id));
        CleanupOutcome {
            solo_changed: solo_before != self.visibility.soloed_on_tabs.len(),
            mute_changed: mute_before != self.visibility.muted_on_tabs.len(),
        }
    }

    /// Derives whether the quick tab shows in the given page context.
    /// Minimization wins, then the solo list, then the mute list.
    pub fn should_be_visible(&self, current_tab: TabId) -> bool {
        if self.visibility.minimized {
            false
        } else if !self.visibility.soloed_on_tabs.is_empty() {
            self.visibility.soloed_on_tabs.contains(&current_tab)
        } else if !self.visibility.muted_on_tabs.is_empty() {
            !self.visibility.muted_on_tabs.contains(&current_tab)
        } else {
            true
        }
    }

    /// Rebuilds a quick tab from a stored entry of any historical layout,
    /// the container is dictated by the slice the entry was found in.
    /// Geometry is accepted both nested and flattened at the entry root.
    /// Fails if the identifier, URL, or geometry is missing or invalid.
    pub fn from_stored(container: &ContainerId, entry: &Value) -> Result<Self, CustomError> {
        let stored = serde_json::from_value::<StoredQuickTab>(entry.clone()).map_err(|error| {
            CustomError::StorageCorruption {
                message: error.to_string(),
            }
        })?;
        let id = stored
            .id
            .filter(|id| !id.is_empty())
            .ok_or(CustomError::StorageCorruption {
                message: String::from("entry has no id"),
            })?;
        let url = stored
            .url
            .filter(|url| !url.is_empty())
            .ok_or(CustomError::StorageCorruption {
                message: format!("entry `{id}` has no url"),
            })?;
        let position = stored
            .position
            .or(match (stored.left, stored.top) {
                (Some(left), Some(top)) => Some(Position { left, top }),
                _ => None,
            })
            .ok_or(CustomError::StorageCorruption {
                message: format!("entry `{id}` has no position"),
            })?;
        let size = stored
            .size
            .or(match (stored.width, stored.height) {
                (Some(width), Some(height)) => Some(Size { width, height }),
                _ => None,
            })
            .filter(Size::is_positive)
            .ok_or(CustomError::StorageCorruption {
                message: format!("entry `{id}` has no positive size"),
            })?;
        let created_at = stored
            .created_at
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
            .unwrap_or_else(Utc::now);
        Ok(Self {
            id: QuickTabId::new(id),
            url,
            title: stored.title,
            position,
            size,
            container: container.clone(),
            visibility: stored.visibility.normalized(),
            z_index: stored.z_index,
            created_at,
        })
    }
}

fn validate_fields(
    id: &QuickTabId,
    url: &str,
    container: &ContainerId,
    size: &Size,
) -> Result<(), CustomError> {
    if id.is_empty() {
        return Err(CustomError::InvalidArgument {
            message: String::from("id must not be empty"),
        });
    }
    if url.is_empty() {
        return Err(CustomError::InvalidArgument {
            message: String::from("url must not be empty"),
        });
    }
    if container.is_empty() {
        return Err(CustomError::InvalidArgument {
            message: String::from("container must not be empty"),
        });
    }
    if !size.is_positive() {
        return Err(CustomError::InvalidArgument {
            message: format!("size {}x{} is not positive", size.width, size.height),
        });
    }
    Ok(())
}

/// Lenient mirror of a stored entry, every field optional so that layout
/// differences and partial corruption surface as [None] instead of a parse
/// abort for the whole container.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredQuickTab {
    id: Option<String>,
    url: Option<String>,
    title: Option<String>,
    position: Option<Position>,
    size: Option<Size>,
    left: Option<i32>,
    top: Option<i32>,
    width: Option<i32>,
    height: Option<i32>,
    #[serde(default)]
    visibility: Visibility,
    #[serde(default)]
    z_index: i32,
    created_at: Option<i64>,
}
