//! Per-context wiring of the store, the repository, and the channel.
//!
//! Every operation follows the same shape: the local store mutates
//! synchronously so the UI can repaint within the same frame, then
//! persistence and publication follow asynchronously. High-frequency
//! geometry updates are debounced before they reach storage or peers.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;
use std::time::Duration;

use log::warn;
use serde_json::Value;
use wasm_bindgen_futures::spawn_local;

use crate::interop::tabs::TabId;
use crate::persist::QuickTabRepository;
use crate::persist::layout::ContainerSlice;
use crate::quick_tab::{ContainerId, QuickTab, QuickTabId};
use crate::settings::Settings;
use crate::state::{QuickTabStore, StateEvent};
use crate::sync::channel::SyncChannel;
use crate::sync::{ContextId, SyncMessage, SyncOp};
use crate::util;
use crate::util::errors::CustomError;

/// How long a burst of geometry updates may grow before it is flushed.
const GEOMETRY_DEBOUNCE: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Default)]
struct DirtyGeometry {
    position: bool,
    size: bool,
}

/// One page context's view of the shared quick tab collection.
pub struct Coordinator {
    container: ContainerId,
    current_tab: TabId,
    store: QuickTabStore,
    repository: QuickTabRepository,
    channel: Option<SyncChannel>,
    settings: Settings,
    dirty: BTreeMap<QuickTabId, DirtyGeometry>,
    flush_generation: u64,
}

impl Coordinator {
    /// Builds the coordinator for one page context and opens its
    /// container's channel. Fails if the browser indicates so.
    pub fn bootstrap(
        container: ContainerId,
        current_tab: TabId,
        repository: QuickTabRepository,
        settings: Settings,
    ) -> Result<Rc<RefCell<Self>>, CustomError> {
        let origin = ContextId::generate();
        let this = Rc::new(RefCell::new(Self {
            container: container.clone(),
            current_tab,
            store: QuickTabStore::new(),
            repository,
            channel: None,
            settings,
            dirty: BTreeMap::new(),
            flush_generation: 0,
        }));
        let weak = Rc::downgrade(&this);
        let channel = SyncChannel::open(container, origin, move |message| {
            if let Some(this) = weak.upgrade() {
                this.borrow_mut().apply_remote(message);
            }
        })?;
        this.borrow_mut().channel = Some(channel);
        Ok(this)
    }

    #[cfg(test)]
    fn for_tests(
        container: ContainerId,
        current_tab: TabId,
        repository: QuickTabRepository,
    ) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            container,
            current_tab,
            store: QuickTabStore::new(),
            repository,
            channel: None,
            settings: Settings::default(),
            dirty: BTreeMap::new(),
            flush_generation: 0,
        }))
    }

    /// Loads the container's slice into the store,
    /// fails if the browser indicates so.
    pub async fn hydrate(this: &Rc<RefCell<Self>>) -> Result<(), CustomError> {
        let (repository, container) = {
            let coordinator = this.borrow();
            (coordinator.repository.clone(), coordinator.container.clone())
        };
        let slice = repository.load(&container).await?.unwrap_or_default();
        let mut coordinator = this.borrow_mut();
        for quick_tab in slice.tabs {
            coordinator.store.add(quick_tab);
        }
        Ok(())
    }

    pub fn container(&self) -> &ContainerId {
        &self.container
    }

    pub fn store(&self) -> &QuickTabStore {
        &self.store
    }

    pub fn repository(&self) -> &QuickTabRepository {
        &self.repository
    }

    /// Registers a UI listener on the store.
    pub fn subscribe(&mut self, listener: impl Fn(&StateEvent) + 'static) {
        self.store.subscribe(listener);
    }

    /// Whether the quick tab shows in this context,
    /// [None] if it is unknown here.
    pub fn is_visible(&self, id: &QuickTabId) -> Option<bool> {
        self.store
            .get(id)
            .map(|quick_tab| quick_tab.should_be_visible(self.current_tab))
    }

    /// Applies a validated operation to the local store.
    /// Unknown IDs on updates are ignored, the entity may have been
    /// closed concurrently in another context.
    pub fn apply_op(&mut self, op: SyncOp) {
        use SyncOp::*;
        match op {
            Create(payload) => {
                if payload.container != self.container {
                    warn!(
                        "dropping creation for foreign container `{}`",
                        payload.container
                    );
                    return;
                }
                match payload.into_quick_tab() {
                    Ok(quick_tab) => {
                        self.store.add(quick_tab);
                    }
                    Err(error) => warn!("dropping unbuildable creation: {error}"),
                }
            }
            Close { id } => {
                self.store.delete(&id);
            }
            CloseAll => self.store.clear(),
            CloseMinimized => {
                let minimized = self
                    .store
                    .get_all()
                    .filter(|quick_tab| quick_tab.visibility.minimized)
                    .map(|quick_tab| quick_tab.id().clone())
                    .collect::<Vec<QuickTabId>>();
                for id in minimized {
                    self.store.delete(&id);
                }
            }
            UpdatePosition { id, left, top } => {
                self.store.update(&id, |quick_tab| {
                    quick_tab.update_position(left, top);
                });
            }
            UpdateSize { id, width, height } => {
                self.store.update(&id, |quick_tab| {
                    if let Err(error) = quick_tab.update_size(width, height) {
                        warn!("ignoring size update for `{}`: {error}", quick_tab.id());
                    }
                });
            }
            UpdateMinimize { id, minimized } => {
                self.store.update(&id, |quick_tab| quick_tab.minimize(minimized));
            }
            UpdateSolo {
                id,
                soloed_on_tabs,
            } => {
                self.store
                    .update(&id, |quick_tab| quick_tab.solo(soloed_on_tabs.clone()));
            }
            UpdateMute { id, muted_on_tabs } => {
                self.store
                    .update(&id, |quick_tab| quick_tab.mute(muted_on_tabs.clone()));
            }
            SettingsUpdated(settings) => {
                util::log::set_debug(settings.debug_logging);
                self.settings = settings;
            }
        }
    }

    fn apply_remote(&mut self, message: SyncMessage) {
        self.apply_op(message.op);
    }

    /// Moves a quick tab locally, deferring persistence and publication.
    pub fn update_position(this: &Rc<RefCell<Self>>, id: &QuickTabId, left: i32, top: i32) {
        let generation = {
            let mut coordinator = this.borrow_mut();
            if !coordinator.store.update(id, |quick_tab| {
                quick_tab.update_position(left, top);
            }) {
                return;
            }
            coordinator.dirty.entry(id.clone()).or_default().position = true;
            coordinator.bump_generation()
        };
        Self::schedule_flush(Rc::clone(this), generation);
    }

    /// Resizes a quick tab locally, deferring persistence and
    /// publication. Non-positive dimensions are dropped.
    pub fn update_size(this: &Rc<RefCell<Self>>, id: &QuickTabId, width: i32, height: i32) {
        let generation = {
            let mut coordinator = this.borrow_mut();
            let mut accepted = false;
            let found = coordinator.store.update(id, |quick_tab| {
                accepted = quick_tab.update_size(width, height).is_ok();
            });
            if !found || !accepted {
                if found {
                    warn!("ignoring size update for `{id}`: {width}x{height}");
                }
                return;
            }
            coordinator.dirty.entry(id.clone()).or_default().size = true;
            coordinator.bump_generation()
        };
        Self::schedule_flush(Rc::clone(this), generation);
    }

    /// Restacks a quick tab within this context. Stacking is a local
    /// concern, the change rides along with the next persisted flush but
    /// is never announced to peers.
    pub fn update_z_index(this: &Rc<RefCell<Self>>, id: &QuickTabId, z_index: i32) {
        let generation = {
            let mut coordinator = this.borrow_mut();
            if !coordinator.store.update(id, |quick_tab| {
                quick_tab.z_index = z_index;
            }) {
                return;
            }
            coordinator.dirty.entry(id.clone()).or_default();
            coordinator.bump_generation()
        };
        Self::schedule_flush(Rc::clone(this), generation);
    }

    fn bump_generation(&mut self) -> u64 {
        self.flush_generation += 1;
        self.flush_generation
    }

    fn schedule_flush(this: Rc<RefCell<Self>>, generation: u64) {
        spawn_local(async move {
            async_std::task::sleep(GEOMETRY_DEBOUNCE).await;
            // a fresh update superseded this flush
            if this.borrow().flush_generation != generation {
                return;
            }
            Self::flush_geometry(&this).await;
        });
    }

    async fn flush_geometry(this: &Rc<RefCell<Self>>) {
        let (repository, container, tabs, dirty) = {
            let mut coordinator = this.borrow_mut();
            let dirty = std::mem::take(&mut coordinator.dirty);
            if dirty.is_empty() {
                return;
            }
            (
                coordinator.repository.clone(),
                coordinator.container.clone(),
                coordinator
                    .store
                    .get_all()
                    .cloned()
                    .collect::<Vec<QuickTab>>(),
                dirty,
            )
        };
        if let Err(error) = repository.save(&container, &tabs).await {
            warn!("geometry persistence failed, converging later: {error}");
        }
        let coordinator = this.borrow();
        for (id, flags) in dirty {
            let Some(quick_tab) = coordinator.store.get(&id) else {
                continue;
            };
            if flags.position {
                coordinator.publish(SyncOp::UpdatePosition {
                    id: id.clone(),
                    left: quick_tab.position.left,
                    top: quick_tab.position.top,
                });
            }
            if flags.size {
                coordinator.publish(SyncOp::UpdateSize {
                    id: id.clone(),
                    width: quick_tab.size.width,
                    height: quick_tab.size.height,
                });
            }
        }
    }

    fn publish(&self, op: SyncOp) {
        let Some(channel) = &self.channel else {
            return;
        };
        if let Err(error) = channel.publish(op) {
            warn!("announcement on `{}` failed: {error}", self.container);
        }
    }

    /// Replaces the store contents with a foreign write's slice.
    /// Entities newly absent are removed, present ones are upserted with
    /// the incoming visibility preserved.
    pub fn reconcile(&mut self, containers: &BTreeMap<ContainerId, ContainerSlice>) {
        let incoming = containers
            .get(&self.container)
            .cloned()
            .unwrap_or_default();
        let keep = incoming
            .tabs
            .iter()
            .map(|quick_tab| quick_tab.id().clone())
            .collect::<BTreeSet<QuickTabId>>();
        for id in self.store.ids() {
            if !keep.contains(&id) {
                self.store.delete(&id);
            }
        }
        for quick_tab in incoming.tabs {
            self.store.add(quick_tab);
        }
    }

    /// Routes a change notification for the state root key.
    /// Our own echo is suppressed by the repository, anything else
    /// re-hydrates the store.
    pub async fn on_storage_change(this: &Rc<RefCell<Self>>, new_value: Option<&Value>) {
        let repository = this.borrow().repository.clone();
        if let Some(containers) = repository.ingest_change(new_value).await {
            this.borrow_mut().reconcile(&containers);
        }
    }

    /// Closes the channel endpoint at context teardown.
    pub fn teardown(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.close();
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::sync::Mutex as StdMutex;

    use serde_json::json;
    use wasm_bindgen_test::wasm_bindgen_test;

    use super::*;
    use crate::interop::storage::MockStorageArea;
    use crate::interop::tabs::TabId;
    use crate::persist::layout::{self, ROOT_KEY};
    use crate::quick_tab::test::sample;
    use crate::sync::CreatePayload;

    fn coordinator_with_writes(
        container: &str,
    ) -> (Rc<RefCell<Coordinator>>, Arc<StdMutex<Vec<Value>>>) {
        let mut area = MockStorageArea::default();
        area.expect_load_value().returning(|_| Ok(None));
        let writes = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&writes);
        area.expect_store_value().returning(move |key, value| {
            assert_eq!(ROOT_KEY, key);
            sink.lock().expect("test sink").push(value.clone());
            Ok(())
        });
        let repository = QuickTabRepository::with_areas(area, None);
        (
            Coordinator::for_tests(
                ContainerId::new(String::from(container)),
                TabId::new(3),
                repository,
            ),
            writes,
        )
    }

    fn create_payload(id: &str, container: &str) -> CreatePayload {
        CreatePayload {
            id: crate::quick_tab::QuickTabId::new(String::from(id)),
            url: String::from("https://example.com/"),
            title: None,
            left: 100,
            top: 100,
            width: 800,
            height: 600,
            container: ContainerId::new(String::from(container)),
            visibility: None,
        }
    }

    #[wasm_bindgen_test]
    fn test_remote_create_is_idempotent_and_container_scoped() {
        let (this, _writes) = coordinator_with_writes("work");
        let mut coordinator = this.borrow_mut();

        coordinator.apply_op(SyncOp::Create(create_payload("qt1", "work")));
        coordinator.apply_op(SyncOp::Create(create_payload("qt1", "work")));
        assert_eq!(1, coordinator.store.count());

        coordinator.apply_op(SyncOp::Create(create_payload("qt2", "personal")));
        assert_eq!(1, coordinator.store.count());
    }

    #[wasm_bindgen_test]
    fn test_remote_update_for_unknown_id_is_ignored() {
        let (this, _writes) = coordinator_with_writes("work");
        let mut coordinator = this.borrow_mut();
        coordinator.apply_op(SyncOp::UpdatePosition {
            id: crate::quick_tab::QuickTabId::new(String::from("gone")),
            left: 1,
            top: 2,
        });
        assert_eq!(0, coordinator.store.count());
    }

    #[wasm_bindgen_test]
    fn test_remote_close_minimized_only_touches_minimized() {
        let (this, _writes) = coordinator_with_writes("work");
        let mut coordinator = this.borrow_mut();
        let container = ContainerId::new(String::from("work"));
        let mut minimized = sample("qt-min", &container);
        minimized.minimize(true);
        coordinator.store.add(minimized);
        coordinator.store.add(sample("qt-keep", &container));

        coordinator.apply_op(SyncOp::CloseMinimized);
        assert_eq!(1, coordinator.store.count());
        assert!(
            coordinator
                .store
                .get(&crate::quick_tab::QuickTabId::new(String::from("qt-keep")))
                .is_some()
        );
    }

    #[wasm_bindgen_test]
    async fn test_geometry_updates_coalesce_into_one_write() {
        let (this, writes) = coordinator_with_writes("work");
        let container = ContainerId::new(String::from("work"));
        let id = crate::quick_tab::QuickTabId::new(String::from("qt1"));
        this.borrow_mut().store.add(sample("qt1", &container));

        Coordinator::update_position(&this, &id, 10, 10);
        Coordinator::update_position(&this, &id, 20, 20);
        Coordinator::update_size(&this, &id, 640, 480);
        Coordinator::update_position(&this, &id, 30, 40);

        async_std::task::sleep(Duration::from_millis(150)).await;

        let writes = writes.lock().expect("test sink");
        assert_eq!(1, writes.len());
        let containers = layout::read_store(Some(&writes[0]));
        let stored = &containers.get(&container).expect("slice written").tabs[0];
        assert_eq!(30, stored.position.left);
        assert_eq!(40, stored.position.top);
        assert_eq!(640, stored.size.width);
    }

    #[wasm_bindgen_test]
    async fn test_geometry_update_for_unknown_id_schedules_nothing() {
        let (this, writes) = coordinator_with_writes("work");
        let id = crate::quick_tab::QuickTabId::new(String::from("gone"));
        Coordinator::update_position(&this, &id, 10, 10);
        async_std::task::sleep(Duration::from_millis(100)).await;
        assert!(writes.lock().expect("test sink").is_empty());
    }

    #[wasm_bindgen_test]
    async fn test_restacking_persists_but_never_publishes() {
        let (this, writes) = coordinator_with_writes("work");
        let container = ContainerId::new(String::from("work"));
        let id = crate::quick_tab::QuickTabId::new(String::from("qt1"));
        this.borrow_mut().store.add(sample("qt1", &container));

        Coordinator::update_z_index(&this, &id, 7);
        async_std::task::sleep(Duration::from_millis(150)).await;

        let writes = writes.lock().expect("test sink");
        assert_eq!(1, writes.len());
        let containers = layout::read_store(Some(&writes[0]));
        assert_eq!(
            7,
            containers.get(&container).expect("slice written").tabs[0].z_index
        );
    }

    #[wasm_bindgen_test]
    fn test_reconcile_adds_updates_and_removes() {
        let (this, _writes) = coordinator_with_writes("work");
        let mut coordinator = this.borrow_mut();
        let container = ContainerId::new(String::from("work"));
        coordinator.store.add(sample("qt-stale", &container));
        coordinator.store.add(sample("qt-kept", &container));

        let mut kept = sample("qt-kept", &container);
        kept.update_position(77, 88);
        kept.solo(std::collections::BTreeSet::from([TabId::new(5)]));
        let fresh = sample("qt-new", &container);
        let incoming = BTreeMap::from([(
            container.clone(),
            ContainerSlice {
                tabs: vec![kept, fresh],
                last_update: 9,
            },
        )]);

        coordinator.reconcile(&incoming);
        assert_eq!(2, coordinator.store.count());
        assert!(
            coordinator
                .store
                .get(&crate::quick_tab::QuickTabId::new(String::from("qt-stale")))
                .is_none()
        );
        let kept = coordinator
            .store
            .get(&crate::quick_tab::QuickTabId::new(String::from("qt-kept")))
            .expect("kept entity");
        assert_eq!(77, kept.position.left);
        assert_eq!(
            std::collections::BTreeSet::from([TabId::new(5)]),
            kept.visibility.soloed_on_tabs
        );
    }

    #[wasm_bindgen_test]
    async fn test_storage_change_rehydrates_only_on_foreign_writes() {
        let (this, writes) = coordinator_with_writes("work");
        let container = ContainerId::new(String::from("work"));
        this.borrow_mut().store.add(sample("qt1", &container));

        Coordinator::update_position(
            &this,
            &crate::quick_tab::QuickTabId::new(String::from("qt1")),
            5,
            5,
        );
        async_std::task::sleep(Duration::from_millis(100)).await;
        let own_write = writes.lock().expect("test sink")[0].clone();

        // the echo of our own save must not clear the store
        Coordinator::on_storage_change(&this, Some(&own_write)).await;
        assert_eq!(1, this.borrow().store.count());

        let foreign = json!({"containers": {}, "saveId": "999-zzzzzz", "timestamp": 2});
        Coordinator::on_storage_change(&this, Some(&foreign)).await;
        assert_eq!(0, this.borrow().store.count());
    }

    #[wasm_bindgen_test]
    fn test_settings_update_is_adopted() {
        let (this, _writes) = coordinator_with_writes("work");
        let mut coordinator = this.borrow_mut();
        coordinator.apply_op(SyncOp::SettingsUpdated(Settings {
            max_quick_tabs: 3,
            debug_logging: true,
        }));
        assert_eq!(3, coordinator.settings.max_quick_tabs);
    }
}
