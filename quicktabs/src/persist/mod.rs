//! Durable persistence of quick tab state.
//!
//! The repository serializes the whole store under one root key and tags
//! every write with a save ID. The ID is remembered for a short window so
//! that the browser's change notification for our own write can be told
//! apart from a foreign context's write. Only foreign writes are surfaced
//! to the caller for re-hydration.

pub mod layout;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_std::sync::Mutex;
use chrono::Utc;
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use wasm_bindgen_futures::spawn_local;

#[mockall_double::double]
use crate::interop::storage::StorageArea;
use crate::quick_tab::{ContainerId, QuickTab, QuickTabId};
use crate::util;
use crate::util::errors::CustomError;

use self::layout::{ContainerSlice, ROOT_KEY};

/// How long a write's save ID stays recognizable as our own.
/// Change notifications normally arrive well within a second,
/// the window only needs to outlive slow storage backends.
const SAVE_ID_TTL: Duration = Duration::from_secs(5);

/// Unique token attached to each durable write.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(transparent)]
pub struct SaveId {
    inner: String,
}

impl SaveId {
    pub fn new(save_id: String) -> Self {
        Self { inner: save_id }
    }

    pub fn generate() -> Self {
        Self {
            inner: util::unique_token(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }
}

/// Adapter over a durable area with an optional unlimited fallback.
/// Cloning shares the pending-save set and the fallback switch, every
/// context holds exactly one logical repository.
pub struct QuickTabRepository {
    area: Arc<StorageArea>,
    fallback: Option<Arc<StorageArea>>,
    using_fallback: Arc<AtomicBool>,
    pending_saves: Arc<Mutex<HashSet<String>>>,
    save_ttl: Duration,
}

impl Clone for QuickTabRepository {
    fn clone(&self) -> Self {
        Self {
            area: Arc::clone(&self.area),
            fallback: self.fallback.as_ref().map(Arc::clone),
            using_fallback: Arc::clone(&self.using_fallback),
            pending_saves: Arc::clone(&self.pending_saves),
            save_ttl: self.save_ttl,
        }
    }
}

impl QuickTabRepository {
    /// The cross-device repository, quota limited with a device-local
    /// fallback that keeps data when the quota is exhausted.
    pub fn durable() -> Self {
        Self::with_areas(StorageArea::sync(), Some(StorageArea::local()))
    }

    /// A repository over the non-persistent session area, unlimited.
    pub fn session_only() -> Self {
        Self::with_areas(StorageArea::session(), None)
    }

    pub fn with_areas(area: StorageArea, fallback: Option<StorageArea>) -> Self {
        Self {
            area: Arc::new(area),
            fallback: fallback.map(Arc::new),
            using_fallback: Arc::new(AtomicBool::new(false)),
            pending_saves: Arc::new(Mutex::new(HashSet::new())),
            save_ttl: SAVE_ID_TTL,
        }
    }

    #[cfg(test)]
    pub fn with_save_ttl(mut self, save_ttl: Duration) -> Self {
        self.save_ttl = save_ttl;
        self
    }

    /// Whether writes were redirected to the fallback area.
    /// Once flipped, cross-device synchronization stays off for the
    /// rest of the session.
    pub fn sync_disabled(&self) -> bool {
        self.using_fallback.load(Ordering::Relaxed)
    }

    /// Loads every container's slice.
    /// Fails only if the browser refuses the read, an unreadable layout
    /// degrades to an empty map instead.
    pub async fn load_all(&self) -> Result<BTreeMap<ContainerId, ContainerSlice>, CustomError> {
        let root = self.read_area().load_value(ROOT_KEY).await?;
        Ok(layout::read_store(root.as_ref()))
    }

    /// Loads one container's slice, [None] if the container has no
    /// quick tabs. Other containers' data never reaches the caller.
    pub async fn load(
        &self,
        container: &ContainerId,
    ) -> Result<Option<ContainerSlice>, CustomError> {
        Ok(self.load_all().await?.remove(container))
    }

    /// Replaces one container's slice and commits the whole root
    /// atomically. Returns the save ID of the write.
    pub async fn save(
        &self,
        container: &ContainerId,
        tabs: &[QuickTab],
    ) -> Result<SaveId, CustomError> {
        let mut containers = self.load_all().await?;
        containers.insert(
            container.clone(),
            ContainerSlice {
                tabs: tabs.to_vec(),
                last_update: Utc::now().timestamp_millis(),
            },
        );
        self.commit(&containers).await
    }

    /// Removes a single quick tab, [None] if there was nothing to remove.
    pub async fn delete(
        &self,
        container: &ContainerId,
        id: &QuickTabId,
    ) -> Result<Option<SaveId>, CustomError> {
        let mut containers = self.load_all().await?;
        let Some(slice) = containers.get_mut(container) else {
            return Ok(None);
        };
        let before = slice.tabs.len();
        slice.tabs.retain(|quick_tab| quick_tab.id() != id);
        if slice.tabs.len() == before {
            return Ok(None);
        }
        slice.last_update = Utc::now().timestamp_millis();
        self.commit(&containers).await.map(Some)
    }

    /// Removes a container's slice entirely,
    /// [None] if the container was already absent.
    pub async fn delete_container(
        &self,
        container: &ContainerId,
    ) -> Result<Option<SaveId>, CustomError> {
        let mut containers = self.load_all().await?;
        if containers.remove(container).is_none() {
            return Ok(None);
        }
        self.commit(&containers).await.map(Some)
    }

    /// Drops the whole store from every involved area.
    pub async fn clear(&self) -> Result<(), CustomError> {
        self.area.remove_entry(ROOT_KEY).await?;
        if let Some(fallback) = &self.fallback {
            fallback.remove_entry(ROOT_KEY).await?;
        }
        Ok(())
    }

    /// Whether the given save ID belongs to a write of this repository
    /// that is still inside the recognition window.
    pub async fn is_own_save(&self, save_id: &str) -> bool {
        self.pending_saves.lock().await.contains(save_id)
    }

    /// Classifies a change notification for the root key.
    /// Our own echo yields [None], a foreign write yields the parsed
    /// container map for re-hydration.
    pub async fn ingest_change(
        &self,
        new_value: Option<&Value>,
    ) -> Option<BTreeMap<ContainerId, ContainerSlice>> {
        if let Some(save_id) = layout::extract_save_id(new_value) {
            if self.is_own_save(save_id).await {
                return None;
            }
        }
        Some(layout::read_store(new_value))
    }

    fn read_area(&self) -> &StorageArea {
        if self.sync_disabled() {
            self.fallback
                .as_deref()
                .expect("fallback engaged only when present")
        } else {
            &self.area
        }
    }

    async fn commit(
        &self,
        containers: &BTreeMap<ContainerId, ContainerSlice>,
    ) -> Result<SaveId, CustomError> {
        let save_id = SaveId::generate();
        let root = layout::write_store(containers, &save_id, Utc::now().timestamp_millis());
        self.track_save(&save_id).await;
        self.write_root(&root).await?;
        Ok(save_id)
    }

    async fn write_root(&self, root: &Value) -> Result<(), CustomError> {
        if self.sync_disabled() {
            return self.read_area().store_value(ROOT_KEY, root).await;
        }
        match self.area.store_value(ROOT_KEY, root).await {
            Err(CustomError::QuotaExceeded) if self.fallback.is_some() => {
                warn!("storage quota exceeded, cross-device sync disabled for this session");
                self.using_fallback.store(true, Ordering::Relaxed);
                self.fallback
                    .as_deref()
                    .expect("fallback checked present")
                    .store_value(ROOT_KEY, root)
                    .await
            }
            other => other,
        }
    }

    async fn track_save(&self, save_id: &SaveId) {
        let token = save_id.as_str().to_owned();
        self.pending_saves.lock().await.insert(token.clone());
        let pending = Arc::clone(&self.pending_saves);
        let ttl = self.save_ttl;
        spawn_local(async move {
            async_std::task::sleep(ttl).await;
            pending.lock().await.remove(&token);
        });
    }
}
