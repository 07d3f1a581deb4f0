//! Background command router.
//!
//! The router is the only authority for mutations that cross tab
//! boundaries without an existing local entity, or that require knowledge
//! a page context does not have, such as which tabs are alive. Every
//! command is authorized and validated before it can touch state, and
//! every failure leaves the dispatch loop as a value, never as a panic
//! or a thrown exception.

use std::collections::BTreeSet;

use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::interop::tabs::{self, TabId};
use crate::persist::QuickTabRepository;
use crate::quick_tab::{ContainerId, NewQuickTab, Position, QuickTab, QuickTabId, Size};
#[mockall_double::double]
use crate::sync::channel::Publisher;
use crate::sync::{ContextId, CreatePayload, SyncOp};
use crate::settings::Settings;
use crate::util::errors::CustomError;

/// A command envelope received over the runtime message port.
/// Action names are part of the external contract and never change.
#[derive(Clone, Debug, Deserialize)]
#[serde(
    tag = "action",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum Command {
    CreateQuickTab {
        url: String,
        #[serde(default)]
        title: Option<String>,
        left: i32,
        top: i32,
        width: i32,
        height: i32,
        #[serde(default)]
        container: Option<ContainerId>,
    },
    CloseQuickTab {
        id: QuickTabId,
        #[serde(default)]
        container: Option<ContainerId>,
    },
    CloseAll {
        #[serde(default)]
        container: Option<ContainerId>,
    },
    CloseMinimized {
        #[serde(default)]
        container: Option<ContainerId>,
    },
    UpdatePosition {
        id: QuickTabId,
        left: i32,
        top: i32,
        #[serde(default)]
        container: Option<ContainerId>,
    },
    UpdateSize {
        id: QuickTabId,
        width: i32,
        height: i32,
        #[serde(default)]
        container: Option<ContainerId>,
    },
    Minimize {
        id: QuickTabId,
        #[serde(default)]
        container: Option<ContainerId>,
    },
    Restore {
        id: QuickTabId,
        #[serde(default)]
        container: Option<ContainerId>,
    },
    Solo {
        id: QuickTabId,
        tab_id: TabId,
        #[serde(default)]
        container: Option<ContainerId>,
    },
    Unsolo {
        id: QuickTabId,
        tab_id: TabId,
        #[serde(default)]
        container: Option<ContainerId>,
    },
    Mute {
        id: QuickTabId,
        tab_id: TabId,
        #[serde(default)]
        container: Option<ContainerId>,
    },
    Unmute {
        id: QuickTabId,
        tab_id: TabId,
        #[serde(default)]
        container: Option<ContainerId>,
    },
    GetQuickTabs {
        #[serde(default)]
        container: Option<ContainerId>,
    },
    GetQuickTab {
        id: QuickTabId,
        #[serde(default)]
        container: Option<ContainerId>,
    },
    CleanupDeadTabs,
}

impl Command {
    /// Parses a command envelope, mapping an unrecognized action name to
    /// [UnknownAction](CustomError::UnknownAction) and anything else the
    /// deserializer rejects to
    /// [InvalidArgument](CustomError::InvalidArgument).
    pub fn parse(envelope: &Value) -> Result<Self, CustomError> {
        let action = envelope
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        serde_json::from_value(envelope.clone()).map_err(|error| {
            let message = error.to_string();
            if message.contains("unknown variant") || message.contains("missing field `action`") {
                CustomError::UnknownAction { action }
            } else {
                CustomError::InvalidArgument { message }
            }
        })
    }
}

/// Identity of the sender of a command, as reported by the runtime.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CommandSender {
    pub id: Option<String>,
    pub tab: Option<SenderTab>,
}

/// The sending tab for page-context commands.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SenderTab {
    pub id: Option<TabId>,
    pub cookie_store_id: Option<ContainerId>,
}

/// Per-item result of a batch command.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemOutcome {
    pub id: QuickTabId,
    pub success: bool,
}

impl ItemOutcome {
    fn ok(id: QuickTabId) -> Self {
        Self { id, success: true }
    }
}

/// Value returned for every dispatched command,
/// `{ success, ...data }` with `error` and `code` populated on failure.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quick_tab: Option<QuickTab>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quick_tabs: Option<Vec<QuickTab>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcomes: Option<Vec<ItemOutcome>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
}

impl CommandResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            quick_tab: None,
            quick_tabs: None,
            outcomes: None,
            error: None,
            code: None,
        }
    }

    pub fn with_quick_tab(quick_tab: QuickTab) -> Self {
        Self {
            quick_tab: Some(quick_tab),
            ..Self::ok()
        }
    }

    pub fn with_quick_tabs(quick_tabs: Vec<QuickTab>) -> Self {
        Self {
            quick_tabs: Some(quick_tabs),
            ..Self::ok()
        }
    }

    pub fn with_outcomes(outcomes: Vec<ItemOutcome>) -> Self {
        Self {
            outcomes: Some(outcomes),
            ..Self::ok()
        }
    }

    pub fn failure(error: &CustomError) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            code: Some(error.code()),
            ..Self::ok()
        }
    }
}

/// The dispatcher living in the privileged background context.
pub struct CommandRouter {
    extension_id: String,
    repository: QuickTabRepository,
    publisher: Publisher,
    settings: Settings,
}

impl CommandRouter {
    pub fn new(extension_id: String, repository: QuickTabRepository, settings: Settings) -> Self {
        Self::with_publisher(
            extension_id,
            repository,
            Publisher::new(ContextId::generate()),
            settings,
        )
    }

    pub fn with_publisher(
        extension_id: String,
        repository: QuickTabRepository,
        publisher: Publisher,
        settings: Settings,
    ) -> Self {
        Self {
            extension_id,
            repository,
            publisher,
            settings,
        }
    }

    pub fn repository(&self) -> &QuickTabRepository {
        &self.repository
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn apply_settings(&mut self, settings: Settings) {
        self.settings = settings;
    }

    /// Announces the new configuration on every container's channel.
    pub async fn broadcast_settings(&self) {
        let containers = match self.repository.load_all().await {
            Ok(containers) => containers,
            Err(error) => {
                warn!("skipping settings broadcast, {error}");
                return;
            }
        };
        let mut targets = containers.into_keys().collect::<BTreeSet<ContainerId>>();
        targets.insert(ContainerId::default());
        for container in targets {
            self.announce(&container, SyncOp::SettingsUpdated(self.settings.clone()));
        }
    }

    /// Authorizes, executes, and converts failures into a response value.
    pub async fn dispatch(&self, command: Command, sender: &CommandSender) -> CommandResponse {
        if let Err(error) = self.authorize(sender) {
            return CommandResponse::failure(&error);
        }
        match self.execute(command, sender).await {
            Ok(response) => response,
            Err(error) => CommandResponse::failure(&error),
        }
    }

    /// Drops references to tabs that no longer exist from every
    /// container, persisting and announcing only what changed.
    /// `closed` covers the window where the closing tab still shows up
    /// in a live query.
    pub async fn cleanup_dead_tabs(
        &self,
        closed: Option<TabId>,
    ) -> Result<CommandResponse, CustomError> {
        let mut live = tabs::live_tab_ids().await?;
        if let Some(closed) = closed {
            live.remove(&closed);
        }
        self.cleanup_dead_tabs_with(&live).await
    }

    async fn cleanup_dead_tabs_with(
        &self,
        live: &BTreeSet<TabId>,
    ) -> Result<CommandResponse, CustomError> {
        let mut containers = self.repository.load_all().await?;
        let mut outcomes = Vec::new();
        for (container, slice) in containers.iter_mut() {
            let mut announcements = Vec::new();
            for quick_tab in slice.tabs.iter_mut() {
                let outcome = quick_tab.cleanup_dead_tabs(live);
                if !outcome.changed() {
                    continue;
                }
                outcomes.push(ItemOutcome::ok(quick_tab.id().clone()));
                if outcome.solo_changed {
                    announcements.push(SyncOp::UpdateSolo {
                        id: quick_tab.id().clone(),
                        soloed_on_tabs: quick_tab.visibility.soloed_on_tabs.clone(),
                    });
                }
                if outcome.mute_changed {
                    announcements.push(SyncOp::UpdateMute {
                        id: quick_tab.id().clone(),
                        muted_on_tabs: quick_tab.visibility.muted_on_tabs.clone(),
                    });
                }
            }
            if !announcements.is_empty() {
                self.repository.save(container, &slice.tabs).await?;
                for announcement in announcements {
                    self.announce(container, announcement);
                }
            }
        }
        Ok(CommandResponse::with_outcomes(outcomes))
    }

    fn authorize(&self, sender: &CommandSender) -> Result<(), CustomError> {
        if sender.id.as_deref() != Some(self.extension_id.as_str()) {
            return Err(CustomError::Unauthorized {
                reason: String::from("sender is not this extension"),
            });
        }
        if let Some(tab) = &sender.tab {
            if !tab.id.is_some_and(|tab_id| tab_id.is_valid()) {
                return Err(CustomError::Unauthorized {
                    reason: String::from("page sender without a valid tab id"),
                });
            }
        }
        Ok(())
    }

    async fn execute(
        &self,
        command: Command,
        sender: &CommandSender,
    ) -> Result<CommandResponse, CustomError> {
        use Command::*;
        match command {
            CreateQuickTab {
                url,
                title,
                left,
                top,
                width,
                height,
                container,
            } => {
                let container = self.resolve_container(container, sender);
                let slice = self.repository.load(&container).await?.unwrap_or_default();
                if slice.tabs.len() >= self.settings.max_quick_tabs {
                    return Err(CustomError::LimitExceeded {
                        limit: self.settings.max_quick_tabs,
                    });
                }
                let quick_tab = QuickTab::create(NewQuickTab {
                    url,
                    title,
                    position: Position { left, top },
                    size: Size { width, height },
                    container: container.clone(),
                    visibility: None,
                })?;
                let mut tabs = slice.tabs;
                tabs.push(quick_tab.clone());
                self.repository.save(&container, &tabs).await?;
                self.announce(
                    &container,
                    SyncOp::Create(CreatePayload::from_quick_tab(&quick_tab)),
                );
                Ok(CommandResponse::with_quick_tab(quick_tab))
            }

            CloseQuickTab { id, container } => {
                let container = self.resolve_container(container, sender);
                if self.repository.delete(&container, &id).await?.is_some() {
                    self.announce(&container, SyncOp::Close { id });
                }
                Ok(CommandResponse::ok())
            }

            CloseAll { container } => {
                let container = self.resolve_container(container, sender);
                let slice = self.repository.load(&container).await?.unwrap_or_default();
                let outcomes = slice
                    .tabs
                    .iter()
                    .map(|quick_tab| ItemOutcome::ok(quick_tab.id().clone()))
                    .collect::<Vec<ItemOutcome>>();
                if !outcomes.is_empty() {
                    self.repository.save(&container, &[]).await?;
                    self.announce(&container, SyncOp::CloseAll);
                }
                Ok(CommandResponse::with_outcomes(outcomes))
            }

            CloseMinimized { container } => {
                let container = self.resolve_container(container, sender);
                let slice = self.repository.load(&container).await?.unwrap_or_default();
                let (closed, kept): (Vec<QuickTab>, Vec<QuickTab>) = slice
                    .tabs
                    .into_iter()
                    .partition(|quick_tab| quick_tab.visibility.minimized);
                let outcomes = closed
                    .iter()
                    .map(|quick_tab| ItemOutcome::ok(quick_tab.id().clone()))
                    .collect::<Vec<ItemOutcome>>();
                if !closed.is_empty() {
                    self.repository.save(&container, &kept).await?;
                    self.announce(&container, SyncOp::CloseMinimized);
                }
                Ok(CommandResponse::with_outcomes(outcomes))
            }

            UpdatePosition {
                id,
                left,
                top,
                container,
            } => {
                self.mutate(container, sender, &id, |quick_tab| {
                    quick_tab.update_position(left, top);
                    Ok(SyncOp::UpdatePosition { id: quick_tab.id().clone(), left, top })
                })
                .await
            }

            UpdateSize {
                id,
                width,
                height,
                container,
            } => {
                self.mutate(container, sender, &id, |quick_tab| {
                    quick_tab.update_size(width, height)?;
                    Ok(SyncOp::UpdateSize { id: quick_tab.id().clone(), width, height })
                })
                .await
            }

            Minimize { id, container } => {
                self.mutate(container, sender, &id, |quick_tab| {
                    quick_tab.minimize(true);
                    Ok(SyncOp::UpdateMinimize {
                        id: quick_tab.id().clone(),
                        minimized: true,
                    })
                })
                .await
            }

            Restore { id, container } => {
                self.mutate(container, sender, &id, |quick_tab| {
                    quick_tab.minimize(false);
                    Ok(SyncOp::UpdateMinimize {
                        id: quick_tab.id().clone(),
                        minimized: false,
                    })
                })
                .await
            }

            Solo {
                id,
                tab_id,
                container,
            } => {
                self.mutate(container, sender, &id, |quick_tab| {
                    let mut soloed = quick_tab.visibility.soloed_on_tabs.clone();
                    soloed.insert(tab_id);
                    quick_tab.solo(soloed.clone());
                    Ok(SyncOp::UpdateSolo {
                        id: quick_tab.id().clone(),
                        soloed_on_tabs: soloed,
                    })
                })
                .await
            }

            Unsolo {
                id,
                tab_id,
                container,
            } => {
                self.mutate(container, sender, &id, |quick_tab| {
                    let mut soloed = quick_tab.visibility.soloed_on_tabs.clone();
                    soloed.remove(&tab_id);
                    quick_tab.solo(soloed.clone());
                    Ok(SyncOp::UpdateSolo {
                        id: quick_tab.id().clone(),
                        soloed_on_tabs: soloed,
                    })
                })
                .await
            }

            Mute {
                id,
                tab_id,
                container,
            } => {
                self.mutate(container, sender, &id, |quick_tab| {
                    let mut muted = quick_tab.visibility.muted_on_tabs.clone();
                    muted.insert(tab_id);
                    quick_tab.mute(muted.clone());
                    Ok(SyncOp::UpdateMute {
                        id: quick_tab.id().clone(),
                        muted_on_tabs: muted,
                    })
                })
                .await
            }

            Unmute {
                id,
                tab_id,
                container,
            } => {
                self.mutate(container, sender, &id, |quick_tab| {
                    let mut muted = quick_tab.visibility.muted_on_tabs.clone();
                    muted.remove(&tab_id);
                    quick_tab.mute(muted.clone());
                    Ok(SyncOp::UpdateMute {
                        id: quick_tab.id().clone(),
                        muted_on_tabs: muted,
                    })
                })
                .await
            }

            GetQuickTabs { container } => {
                let container = self.resolve_container(container, sender);
                let slice = self.repository.load(&container).await?.unwrap_or_default();
                Ok(CommandResponse::with_quick_tabs(slice.tabs))
            }

            GetQuickTab { id, container } => {
                let container = self.resolve_container(container, sender);
                let slice = self.repository.load(&container).await?.unwrap_or_default();
                slice
                    .tabs
                    .into_iter()
                    .find(|quick_tab| quick_tab.id() == &id)
                    .map(CommandResponse::with_quick_tab)
                    .ok_or(CustomError::NotFound {
                        id: id.to_string(),
                    })
            }

            CleanupDeadTabs => self.cleanup_dead_tabs(None).await,
        }
    }

    /// Shared load-mutate-persist-announce cycle of the single-entity
    /// commands. An unknown ID is benign, the entity may have been
    /// closed concurrently, so the command still succeeds as a no-op.
    async fn mutate(
        &self,
        container: Option<ContainerId>,
        sender: &CommandSender,
        id: &QuickTabId,
        apply: impl FnOnce(&mut QuickTab) -> Result<SyncOp, CustomError>,
    ) -> Result<CommandResponse, CustomError> {
        let container = self.resolve_container(container, sender);
        let Some(mut slice) = self.repository.load(&container).await? else {
            return Ok(CommandResponse::ok());
        };
        let Some(quick_tab) = slice
            .tabs
            .iter_mut()
            .find(|quick_tab| quick_tab.id() == id)
        else {
            return Ok(CommandResponse::ok());
        };
        let announcement = apply(quick_tab)?;
        self.repository.save(&container, &slice.tabs).await?;
        self.announce(&container, announcement);
        Ok(CommandResponse::ok())
    }

    fn resolve_container(
        &self,
        explicit: Option<ContainerId>,
        sender: &CommandSender,
    ) -> ContainerId {
        explicit
            .filter(|container| !container.is_empty())
            .or_else(|| {
                sender
                    .tab
                    .as_ref()
                    .and_then(|tab| tab.cookie_store_id.clone())
            })
            .unwrap_or_default()
    }

    /// Replication is best effort, a lost announcement re-converges
    /// through the next storage change notification.
    fn announce(&self, container: &ContainerId, op: SyncOp) {
        if let Err(error) = self.publisher.publish(container, op) {
            warn!("announcement to `{container}` failed: {error}");
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
    use crate::persist::layout::{self, ROOT_KEY};
    use crate::quick_tab::test::sample;
    use crate::sync::channel::MockPublisher;

    const EXTENSION_ID: &str = "quicktabs@example.org";

    fn page_sender(tab_id: isize, container: &str) -> CommandSender {
        CommandSender {
            id: Some(String::from(EXTENSION_ID)),
            tab: Some(SenderTab {
                id: Some(TabId::new(tab_id)),
                cookie_store_id: Some(ContainerId::new(String::from(container))),
            }),
        }
    }

    fn stored_root(container: &str, tabs: &[QuickTab]) -> Value {
        let slice = layout::ContainerSlice {
            tabs: tabs.to_vec(),
            last_update: 1,
        };
        let containers = std::collections::BTreeMap::from([(
            ContainerId::new(String::from(container)),
            slice,
        )]);
        layout::write_store(
            &containers,
            &crate::persist::SaveId::new(String::from("1-aaaaaa")),
            1,
        )
    }

    fn router_with(
        root: Option<Value>,
        publisher: MockPublisher,
        settings: Settings,
    ) -> (CommandRouter, Arc<StdMutex<Vec<Value>>>) {
        let mut area = MockStorageArea::default();
        area.expect_load_value()
            .returning(move |_| Ok(root.clone()));
        let writes = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&writes);
        area.expect_store_value().returning(move |key, value| {
            assert_eq!(ROOT_KEY, key);
            sink.lock().expect("test sink").push(value.clone());
            Ok(())
        });
        let repository = QuickTabRepository::with_areas(area, None);
        (
            CommandRouter::with_publisher(
                String::from(EXTENSION_ID),
                repository,
                publisher,
                settings,
            ),
            writes,
        )
    }

    fn published_ops(sink: &Arc<StdMutex<Vec<(ContainerId, SyncOp)>>>) -> Vec<String> {
        sink.lock()
            .expect("test sink")
            .iter()
            .map(|(container, op)| format!("{container}:{op}"))
            .collect()
    }

    fn capturing_publisher() -> (MockPublisher, Arc<StdMutex<Vec<(ContainerId, SyncOp)>>>) {
        let mut publisher = MockPublisher::default();
        let published = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&published);
        publisher.expect_publish().returning(move |container, op| {
            sink.lock()
                .expect("test sink")
                .push((container.clone(), op));
            Ok(())
        });
        (publisher, published)
    }

    #[wasm_bindgen_test]
    fn test_parse_maps_unknown_actions() {
        let error = Command::parse(&json!({"action": "FROBNICATE"}))
            .expect_err("unknown action rejected");
        assert!(matches!(error, CustomError::UnknownAction { .. }));
        assert_eq!("Unknown action", error.to_string());

        let error = Command::parse(&json!({"action": "CLOSE_QUICK_TAB"}))
            .expect_err("missing fields rejected");
        assert!(matches!(error, CustomError::InvalidArgument { .. }));

        let command = Command::parse(&json!({
            "action": "CREATE_QUICK_TAB",
            "url": "https://example.com/",
            "left": 100, "top": 100, "width": 800, "height": 600,
        }))
        .expect("well-formed command");
        assert!(matches!(command, Command::CreateQuickTab { .. }));
    }

    #[wasm_bindgen_test]
    async fn test_foreign_sender_is_rejected_without_mutation() {
        let mut publisher = MockPublisher::default();
        publisher.expect_publish().times(0);
        let (router, writes) = router_with(None, publisher, Settings::default());

        let sender = CommandSender {
            id: Some(String::from("evil@example.org")),
            tab: None,
        };
        let response = router
            .dispatch(
                Command::CloseAll { container: None },
                &sender,
            )
            .await;
        assert!(!response.success);
        assert_eq!(Some("UNAUTHORIZED"), response.code);
        assert!(writes.lock().expect("test sink").is_empty());
    }

    #[wasm_bindgen_test]
    async fn test_page_sender_requires_a_valid_tab_id() {
        let mut publisher = MockPublisher::default();
        publisher.expect_publish().times(0);
        let (router, _writes) = router_with(None, publisher, Settings::default());

        let sender = CommandSender {
            id: Some(String::from(EXTENSION_ID)),
            tab: Some(SenderTab {
                id: Some(TabId::new(-1)),
                cookie_store_id: None,
            }),
        };
        let response = router
            .dispatch(Command::GetQuickTabs { container: None }, &sender)
            .await;
        assert!(!response.success);
        assert_eq!(Some("UNAUTHORIZED"), response.code);
    }

    #[wasm_bindgen_test]
    async fn test_create_persists_and_announces() {
        let (publisher, published) = capturing_publisher();
        let (router, writes) = router_with(None, publisher, Settings::default());

        let response = router
            .dispatch(
                Command::parse(&json!({
                    "action": "CREATE_QUICK_TAB",
                    "url": "https://example.com/",
                    "left": 100, "top": 100, "width": 800, "height": 600,
                }))
                .expect("well-formed command"),
                &page_sender(3, "work"),
            )
            .await;

        assert!(response.success);
        let quick_tab = response.quick_tab.expect("created entity returned");
        assert_eq!(
            &ContainerId::new(String::from("work")),
            quick_tab.container()
        );
        assert!(!quick_tab.id().is_empty());

        let written = writes.lock().expect("test sink")[0].clone();
        let containers = layout::read_store(Some(&written));
        assert_eq!(
            1,
            containers
                .get(&ContainerId::new(String::from("work")))
                .expect("slice written")
                .tabs
                .len()
        );
        assert_eq!(vec![String::from("work:CREATE")], published_ops(&published));
    }

    #[wasm_bindgen_test]
    async fn test_create_fails_cleanly_at_the_container_limit() {
        let container = ContainerId::new(String::from("work"));
        let existing = (0..2)
            .map(|index| sample(&format!("qt{index}"), &container))
            .collect::<Vec<QuickTab>>();
        let mut publisher = MockPublisher::default();
        publisher.expect_publish().times(0);
        let (router, writes) = router_with(
            Some(stored_root("work", &existing)),
            publisher,
            Settings {
                max_quick_tabs: 2,
                debug_logging: false,
            },
        );

        let response = router
            .dispatch(
                Command::parse(&json!({
                    "action": "CREATE_QUICK_TAB",
                    "url": "https://example.com/",
                    "left": 0, "top": 0, "width": 800, "height": 600,
                }))
                .expect("well-formed command"),
                &page_sender(3, "work"),
            )
            .await;

        assert!(!response.success);
        assert_eq!(Some("LIMIT_EXCEEDED"), response.code);
        assert!(writes.lock().expect("test sink").is_empty());
    }

    #[wasm_bindgen_test]
    async fn test_close_unknown_id_is_a_quiet_no_op() {
        let mut publisher = MockPublisher::default();
        publisher.expect_publish().times(0);
        let (router, writes) = router_with(None, publisher, Settings::default());

        for _ in 0..2 {
            let response = router
                .dispatch(
                    Command::CloseQuickTab {
                        id: QuickTabId::new(String::from("gone")),
                        container: None,
                    },
                    &page_sender(3, "work"),
                )
                .await;
            assert!(response.success);
        }
        assert!(writes.lock().expect("test sink").is_empty());
    }

    #[wasm_bindgen_test]
    async fn test_solo_composes_the_set_and_clears_mute() {
        let container = ContainerId::new(String::from("work"));
        let mut existing = sample("qt2", &container);
        existing.mute(BTreeSet::from([TabId::new(7)]));
        let (publisher, published) = capturing_publisher();
        let (router, writes) = router_with(
            Some(stored_root("work", &[existing])),
            publisher,
            Settings::default(),
        );

        let response = router
            .dispatch(
                Command::Solo {
                    id: QuickTabId::new(String::from("qt2")),
                    tab_id: TabId::new(3),
                    container: None,
                },
                &page_sender(3, "work"),
            )
            .await;
        assert!(response.success);

        let written = writes.lock().expect("test sink")[0].clone();
        let containers = layout::read_store(Some(&written));
        let stored = &containers.get(&container).expect("slice written").tabs[0];
        assert_eq!(
            BTreeSet::from([TabId::new(3)]),
            stored.visibility.soloed_on_tabs
        );
        assert!(stored.visibility.muted_on_tabs.is_empty());
        assert_eq!(
            vec![String::from("work:UPDATE_SOLO")],
            published_ops(&published)
        );
    }

    #[wasm_bindgen_test]
    async fn test_update_position_is_idempotent() {
        let container = ContainerId::new(String::from("work"));
        let existing = sample("qt1", &container);
        let (publisher, _published) = capturing_publisher();
        let (router, writes) = router_with(
            Some(stored_root("work", &[existing])),
            publisher,
            Settings::default(),
        );

        for _ in 0..3 {
            let response = router
                .dispatch(
                    Command::UpdatePosition {
                        id: QuickTabId::new(String::from("qt1")),
                        left: -40,
                        top: 25,
                        container: None,
                    },
                    &page_sender(3, "work"),
                )
                .await;
            assert!(response.success);
        }

        let last = writes.lock().expect("test sink").last().cloned().expect("written");
        let containers = layout::read_store(Some(&last));
        let stored = &containers.get(&container).expect("slice written").tabs[0];
        assert_eq!(-40, stored.position.left);
        assert_eq!(25, stored.position.top);
    }

    #[wasm_bindgen_test]
    async fn test_close_minimized_only_removes_minimized() {
        let container = ContainerId::new(String::from("work"));
        let mut minimized = sample("qt-min", &container);
        minimized.minimize(true);
        let kept = sample("qt-keep", &container);
        let (publisher, published) = capturing_publisher();
        let (router, writes) = router_with(
            Some(stored_root("work", &[minimized, kept])),
            publisher,
            Settings::default(),
        );

        let response = router
            .dispatch(
                Command::CloseMinimized { container: None },
                &page_sender(3, "work"),
            )
            .await;
        assert!(response.success);
        let outcomes = response.outcomes.expect("batch outcomes");
        assert_eq!(1, outcomes.len());
        assert_eq!("qt-min", outcomes[0].id.as_str());

        let written = writes.lock().expect("test sink")[0].clone();
        let containers = layout::read_store(Some(&written));
        let slice = containers.get(&container).expect("slice written");
        assert_eq!(1, slice.tabs.len());
        assert_eq!("qt-keep", slice.tabs[0].id().as_str());
        assert_eq!(
            vec![String::from("work:CLOSE_MINIMIZED")],
            published_ops(&published)
        );
    }

    #[wasm_bindgen_test]
    async fn test_get_quick_tab_surfaces_not_found() {
        let mut publisher = MockPublisher::default();
        publisher.expect_publish().times(0);
        let (router, _writes) = router_with(None, publisher, Settings::default());

        let response = router
            .dispatch(
                Command::GetQuickTab {
                    id: QuickTabId::new(String::from("gone")),
                    container: None,
                },
                &page_sender(3, "work"),
            )
            .await;
        assert!(!response.success);
        assert_eq!(Some("NOT_FOUND"), response.code);
    }

    #[wasm_bindgen_test]
    async fn test_cleanup_trims_dead_references_and_announces() {
        let container = ContainerId::new(String::from("work"));
        let mut soloed = sample("qt3", &container);
        soloed.solo(BTreeSet::from([TabId::new(11), TabId::new(12)]));
        let untouched = sample("qt-plain", &container);
        let (publisher, published) = capturing_publisher();
        let (router, writes) = router_with(
            Some(stored_root("work", &[soloed, untouched])),
            publisher,
            Settings::default(),
        );

        let response = router
            .cleanup_dead_tabs_with(&BTreeSet::from([TabId::new(12)]))
            .await
            .expect("mocked storage");
        let outcomes = response.outcomes.expect("batch outcomes");
        assert_eq!(1, outcomes.len());
        assert_eq!("qt3", outcomes[0].id.as_str());

        let written = writes.lock().expect("test sink")[0].clone();
        let containers = layout::read_store(Some(&written));
        let stored = containers
            .get(&container)
            .expect("slice written")
            .tabs
            .iter()
            .find(|quick_tab| quick_tab.id().as_str() == "qt3")
            .expect("kept")
            .clone();
        assert_eq!(
            BTreeSet::from([TabId::new(12)]),
            stored.visibility.soloed_on_tabs
        );
        assert_eq!(
            vec![String::from("work:UPDATE_SOLO")],
            published_ops(&published)
        );
    }

    #[wasm_bindgen_test]
    fn test_failure_response_shape() {
        let response = CommandResponse::failure(&CustomError::UnknownAction {
            action: String::from("FROBNICATE"),
        });
        let wire = serde_json::to_value(&response).expect("serializable");
        assert_eq!(
            json!({"success": false, "error": "Unknown action", "code": "UNKNOWN_ACTION"}),
            wire
        );
    }
}
