//! Cross-context synchronization core for floating quick tab windows.
//!
//! One logical collection of quick tabs is replicated across every page
//! context of a container, persisted through an evolving storage layout,
//! and kept convergent with last-writer-wins semantics. The privileged
//! background context routes commands, page contexts hold a coordinator
//! that wires the store, the repository, and the replication channel.

#[cfg(test)]
use wasm_bindgen_test::wasm_bindgen_test_configure;
#[cfg(test)]
wasm_bindgen_test_configure!(run_in_worker);

pub mod command;
pub mod coordinator;
pub mod interop;
pub mod persist;
pub mod quick_tab;
pub mod settings;
pub mod state;
pub mod sync;
pub mod util;

use std::cell::RefCell;
use std::collections::HashMap;
use std::panic;
use std::rc::Rc;

use async_std::sync::Mutex;
use once_cell::sync::Lazy;
use wasm_bindgen::prelude::*;

use crate::command::{Command, CommandResponse, CommandRouter, CommandSender};
use crate::coordinator::Coordinator;
#[mockall_double::double]
use crate::interop::storage::StorageArea;
use crate::interop::storage::StorageChange;
use crate::interop::tabs::TabId;
use crate::persist::{QuickTabRepository, layout};
use crate::quick_tab::{ContainerId, QuickTabId};
use crate::settings::{SETTINGS_KEY, Settings};
use crate::util::errors::CustomError;

/// Authority state of the privileged background context,
/// absent in page contexts.
static ROUTER: Lazy<Mutex<Option<CommandRouter>>> = Lazy::new(|| Mutex::new(None));

thread_local! {
    /// The page context's coordinator, absent in the background context.
    static COORDINATOR: RefCell<Option<Rc<RefCell<Coordinator>>>> = RefCell::new(None);
}

/// Entry point for loading this extension in any context.
#[wasm_bindgen(start)]
fn start() {
    panic::set_hook(Box::new(console_error_panic_hook::hook));
    util::log::init(false);
}

/// Builds the command router for the privileged background context.
/// The extension identity authorizes command senders later.
#[wasm_bindgen(js_name = "initBackground")]
pub async fn init_background(extension_id: String) -> Result<(), JsError> {
    let settings = Settings::load(&StorageArea::local())
        .await
        .map_err(to_js_error)?;
    util::log::set_debug(settings.debug_logging);
    let router = CommandRouter::new(extension_id, QuickTabRepository::durable(), settings);
    *ROUTER.lock().await = Some(router);
    Ok(())
}

/// Builds the coordinator for a page context and hydrates it from
/// storage. The container falls back to the canonical default when the
/// host cannot provide one.
#[wasm_bindgen(js_name = "initContext")]
pub async fn init_context(container_id: Option<String>, tab_id: isize) -> Result<(), JsError> {
    let container = container_id
        .filter(|id| !id.is_empty())
        .map(ContainerId::new)
        .unwrap_or_default();
    let settings = Settings::load(&StorageArea::local())
        .await
        .map_err(to_js_error)?;
    util::log::set_debug(settings.debug_logging);
    let coordinator = Coordinator::bootstrap(
        container,
        TabId::new(tab_id),
        QuickTabRepository::durable(),
        settings,
    )
    .map_err(to_js_error)?;
    Coordinator::hydrate(&coordinator)
        .await
        .map_err(to_js_error)?;
    COORDINATOR.with(|slot| slot.borrow_mut().replace(coordinator));
    Ok(())
}

/// Message passing entry for commands.
/// Failures come back as response values, never as rejections, one bad
/// command must not kill the dispatch loop.
#[wasm_bindgen(js_name = "onCommand")]
pub async fn on_command(message: JsValue, sender: JsValue) -> JsValue {
    interop::to_jsvalue(&dispatch_command(message, sender).await)
}

async fn dispatch_command(message: JsValue, sender: JsValue) -> CommandResponse {
    let envelope = match interop::cast_or_standard_mismatch::<serde_json::Value>(message) {
        Ok(envelope) => envelope,
        Err(error) => {
            return CommandResponse::failure(&CustomError::InvalidArgument {
                message: error.to_string(),
            });
        }
    };
    let sender = match interop::cast_or_standard_mismatch::<CommandSender>(sender) {
        Ok(sender) => sender,
        Err(error) => {
            return CommandResponse::failure(&CustomError::Unauthorized {
                reason: error.to_string(),
            });
        }
    };
    let command = match Command::parse(&envelope) {
        Ok(command) => command,
        Err(error) => return CommandResponse::failure(&error),
    };
    let router = ROUTER.lock().await;
    let Some(router) = router.as_ref() else {
        return CommandResponse::failure(&CustomError::Unauthorized {
            reason: String::from("background context is not initialized"),
        });
    };
    router.dispatch(command, &sender).await
}

/// Cleans up references to a closed tab.
/// Best effort with no error as cleanup re-runs on the next closure.
#[wasm_bindgen(js_name = "onTabRemoved")]
pub async fn on_tab_removed(tab_id: isize) {
    let router = ROUTER.lock().await;
    let Some(router) = router.as_ref() else {
        return;
    };
    if let Err(error) = router.cleanup_dead_tabs(Some(TabId::new(tab_id))).await {
        log::warn!("dead tab cleanup failed: {error}");
    }
}

/// Routes the browser's storage change stream.
/// State changes re-hydrate the page coordinator unless they are our own
/// echo, configuration changes are re-announced by the background router.
#[wasm_bindgen(js_name = "onStorageChanged")]
pub async fn on_storage_changed(changes: JsValue, _area_name: String) {
    let Ok(changes) =
        interop::cast_or_standard_mismatch::<HashMap<String, StorageChange>>(changes)
    else {
        log::warn!("dropping malformed storage change notification");
        return;
    };
    if let Some(change) = changes.get(layout::ROOT_KEY) {
        let coordinator = COORDINATOR.with(|slot| slot.borrow().clone());
        if let Some(coordinator) = coordinator {
            Coordinator::on_storage_change(&coordinator, change.new_value.as_ref()).await;
        }
    }
    if let Some(change) = changes.get(SETTINGS_KEY) {
        let mut router = ROUTER.lock().await;
        if let Some(router) = router.as_mut() {
            let settings = change
                .new_value
                .clone()
                .and_then(|value| serde_json::from_value::<Settings>(value).ok())
                .unwrap_or_default();
            util::log::set_debug(settings.debug_logging);
            router.apply_settings(settings);
            router.broadcast_settings().await;
        }
    }
}

/// Local-first drag handling for the UI layer,
/// persistence and publication are debounced downstream.
#[wasm_bindgen(js_name = "updateQuickTabPosition")]
pub fn update_quick_tab_position(id: String, left: i32, top: i32) {
    with_coordinator(|coordinator| {
        Coordinator::update_position(coordinator, &QuickTabId::new(id), left, top);
    });
}

/// Local-first resize handling for the UI layer.
#[wasm_bindgen(js_name = "updateQuickTabSize")]
pub fn update_quick_tab_size(id: String, width: i32, height: i32) {
    with_coordinator(|coordinator| {
        Coordinator::update_size(coordinator, &QuickTabId::new(id), width, height);
    });
}

/// Restacks a quick tab within this page context only.
#[wasm_bindgen(js_name = "updateQuickTabZIndex")]
pub fn update_quick_tab_z_index(id: String, z_index: i32) {
    with_coordinator(|coordinator| {
        Coordinator::update_z_index(coordinator, &QuickTabId::new(id), z_index);
    });
}

/// Whether the quick tab shows in this page context.
#[wasm_bindgen(js_name = "isQuickTabVisible")]
pub fn is_quick_tab_visible(id: String) -> bool {
    COORDINATOR.with(|slot| {
        slot.borrow().as_ref().is_some_and(|coordinator| {
            coordinator
                .borrow()
                .is_visible(&QuickTabId::new(id))
                .unwrap_or(false)
        })
    })
}

/// Releases the page context's channel endpoint at teardown.
#[wasm_bindgen(js_name = "teardownContext")]
pub fn teardown_context() {
    COORDINATOR.with(|slot| {
        if let Some(coordinator) = slot.borrow_mut().take() {
            coordinator.borrow_mut().teardown();
        }
    });
}

fn with_coordinator(operate: impl FnOnce(&Rc<RefCell<Coordinator>>)) {
    let coordinator = COORDINATOR.with(|slot| slot.borrow().clone());
    if let Some(coordinator) = coordinator {
        operate(&coordinator);
    }
}

fn to_js_error(error: CustomError) -> JsError {
    JsError::new(&error.to_string())
}
