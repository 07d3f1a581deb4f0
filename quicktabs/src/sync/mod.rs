//! Replication of state mutations between page contexts.
//!
//! One logical channel exists per container, the name carries the
//! isolation. Messages are validated before they reach any handler and a
//! context never reacts to its own publishes.

pub mod channel;

use std::collections::BTreeSet;
use std::fmt::{Display, Formatter, Result as FmtResult};

use serde::{Deserialize, Serialize};
use strum_macros::Display as StrumDisplay;

use crate::interop::tabs::TabId;
use crate::quick_tab::{
    ContainerId, NewQuickTab, Position, QuickTab, QuickTabId, Size, Visibility,
};
use crate::settings::Settings;
use crate::util;
use crate::util::errors::CustomError;

/// Identity token of one page context,
/// generated when its channel endpoint opens.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ContextId {
    inner: String,
}

impl ContextId {
    pub fn new(context_id: String) -> Self {
        Self { inner: context_id }
    }

    pub fn generate() -> Self {
        Self {
            inner: format!("ctx-{}", util::unique_token()),
        }
    }
}

impl Display for ContextId {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> FmtResult {
        formatter.write_str(&self.inner)
    }
}

/// Envelope of every value that crosses a replication channel.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMessage {
    #[serde(flatten)]
    pub op: SyncOp,
    pub origin: ContextId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

/// A state mutation announced to peers.
/// Every operation is idempotent on its target field, replaying a stale
/// update cannot corrupt state, only briefly rewind it.
#[derive(Clone, Debug, Deserialize, Serialize, StrumDisplay)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncOp {
    Create(CreatePayload),
    Close {
        id: QuickTabId,
    },
    CloseAll,
    CloseMinimized,
    UpdatePosition {
        id: QuickTabId,
        left: i32,
        top: i32,
    },
    UpdateSize {
        id: QuickTabId,
        width: i32,
        height: i32,
    },
    UpdateMinimize {
        id: QuickTabId,
        minimized: bool,
    },
    UpdateSolo {
        id: QuickTabId,
        soloed_on_tabs: BTreeSet<TabId>,
    },
    UpdateMute {
        id: QuickTabId,
        muted_on_tabs: BTreeSet<TabId>,
    },
    SettingsUpdated(Settings),
}

impl SyncOp {
    /// Field-level validation beyond what deserialization guarantees.
    /// Handlers may assume a validated operation.
    pub fn validate(&self) -> Result<(), CustomError> {
        use SyncOp::*;
        match self {
            Create(payload) => payload.validate(),
            Close { id }
            | UpdatePosition { id, .. }
            | UpdateMinimize { id, .. }
            | UpdateSolo { id, .. }
            | UpdateMute { id, .. } => require_id(id),
            UpdateSize { id, width, height } => {
                require_id(id)?;
                require_positive_size(*width, *height)
            }
            CloseAll | CloseMinimized | SettingsUpdated(_) => Ok(()),
        }
    }
}

/// Everything a peer needs to materialize a freshly created quick tab.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePayload {
    pub id: QuickTabId,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub left: i32,
    pub top: i32,
    pub width: i32,
    pub height: i32,
    pub container: ContainerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<Visibility>,
}

impl CreatePayload {
    pub fn from_quick_tab(quick_tab: &QuickTab) -> Self {
        Self {
            id: quick_tab.id().clone(),
            url: quick_tab.url.clone(),
            title: quick_tab.title.clone(),
            left: quick_tab.position.left,
            top: quick_tab.position.top,
            width: quick_tab.size.width,
            height: quick_tab.size.height,
            container: quick_tab.container().clone(),
            visibility: Some(quick_tab.visibility.clone()),
        }
    }

    /// Materializes the announced entity,
    /// fails if the payload does not describe a valid quick tab.
    pub fn into_quick_tab(self) -> Result<QuickTab, CustomError> {
        QuickTab::with_id(
            self.id,
            NewQuickTab {
                url: self.url,
                title: self.title,
                position: Position {
                    left: self.left,
                    top: self.top,
                },
                size: Size {
                    width: self.width,
                    height: self.height,
                },
                container: self.container,
                visibility: self.visibility,
            },
        )
    }

    fn validate(&self) -> Result<(), CustomError> {
        require_id(&self.id)?;
        if self.url.is_empty() {
            return Err(CustomError::InvalidArgument {
                message: String::from("url must not be empty"),
            });
        }
        if self.container.is_empty() {
            return Err(CustomError::InvalidArgument {
                message: String::from("container must not be empty"),
            });
        }
        require_positive_size(self.width, self.height)
    }
}

fn require_id(id: &QuickTabId) -> Result<(), CustomError> {
    if id.is_empty() {
        Err(CustomError::InvalidArgument {
            message: String::from("id must not be empty"),
        })
    } else {
        Ok(())
    }
}

fn require_positive_size(width: i32, height: i32) -> Result<(), CustomError> {
    if width > 0 && height > 0 {
        Ok(())
    } else {
        Err(CustomError::InvalidArgument {
            message: format!("size {width}x{height} is not positive"),
        })
    }
}
