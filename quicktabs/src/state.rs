//! In-context authoritative mapping from quick tab identifier to entity.
//!
//! The store never persists or publishes on its own, sequencing of storage
//! and replication around a mutation belongs to the coordinator. Listeners
//! observe every mutation after it is applied.

use std::collections::HashMap;

use crate::quick_tab::{QuickTab, QuickTabId};

/// A mutation that listeners may react to, emitted after the fact.
#[derive(Clone, Debug)]
pub enum StateEvent {
    Added(QuickTab),
    Updated(QuickTab),
    Deleted(QuickTabId),
    Cleared,
}

type Listener = Box<dyn Fn(&StateEvent)>;

/// The quick tabs known to the current context.
#[derive(Default)]
pub struct QuickTabStore {
    tabs: HashMap<QuickTabId, QuickTab>,
    listeners: Vec<Listener>,
}

impl QuickTabStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a mutation listener for the lifetime of the store.
    pub fn subscribe(&mut self, listener: impl Fn(&StateEvent) + 'static) {
        self.listeners.push(Box::new(listener));
    }

    /// Inserts a quick tab, an existing entity under the same ID is
    /// replaced instead. Creation announcements may arrive at a peer that
    /// already loaded the entity from storage, so a colliding insert is an
    /// update rather than an error.
    /// Returns whether the entity was newly inserted.
    pub fn add(&mut self, quick_tab: QuickTab) -> bool {
        let inserted = self
            .tabs
            .insert(quick_tab.id().clone(), quick_tab.clone())
            .is_none();
        if inserted {
            self.emit(StateEvent::Added(quick_tab));
        } else {
            self.emit(StateEvent::Updated(quick_tab));
        }
        inserted
    }

    /// Mutates the quick tab under the given ID in place.
    /// Returns whether the entity was found, an absent ID is left to the
    /// caller since remote updates may race a concurrent close.
    pub fn update(
        &mut self,
        id: &QuickTabId,
        mutate: impl FnOnce(&mut QuickTab),
    ) -> bool {
        let Some(quick_tab) = self.tabs.get_mut(id) else {
            return false;
        };
        mutate(quick_tab);
        let snapshot = quick_tab.clone();
        self.emit(StateEvent::Updated(snapshot));
        true
    }

    /// Removes and returns the quick tab under the given ID.
    pub fn delete(&mut self, id: &QuickTabId) -> Option<QuickTab> {
        let removed = self.tabs.remove(id);
        if removed.is_some() {
            self.emit(StateEvent::Deleted(id.clone()));
        }
        removed
    }

    pub fn get(&self, id: &QuickTabId) -> Option<&QuickTab> {
        self.tabs.get(id)
    }

    pub fn get_all(&self) -> impl Iterator<Item = &QuickTab> {
        self.tabs.values()
    }

    pub fn ids(&self) -> Vec<QuickTabId> {
        self.tabs.keys().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.tabs.len()
    }

    /// Removes every quick tab at once.
    pub fn clear(&mut self) {
        if self.tabs.is_empty() {
            return;
        }
        self.tabs.clear();
        self.emit(StateEvent::Cleared);
    }

    fn emit(&self, event: StateEvent) {
        for listener in &self.listeners {
            listener(&event);
        }
    }
}

#[cfg(test)]
mod test {
    use std::cell::RefCell;
    use std::rc::Rc;

    use wasm_bindgen_test::wasm_bindgen_test;

    use super::*;
    use crate::quick_tab::{ContainerId, test::sample};

    fn event_name(event: &StateEvent) -> &'static str {
        match event {
            StateEvent::Added(_) => "added",
            StateEvent::Updated(_) => "updated",
            StateEvent::Deleted(_) => "deleted",
            StateEvent::Cleared => "cleared",
        }
    }

    #[wasm_bindgen_test]
    fn test_add_is_idempotent_on_id_collision() {
        let mut store = QuickTabStore::new();
        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&events);
        store.subscribe(move |event| sink.borrow_mut().push(event_name(event)));

        let container = ContainerId::default();
        assert!(store.add(sample("qt1", &container)));
        let mut replacement = sample("qt1", &container);
        replacement.update_position(5, 5);
        assert!(!store.add(replacement));

        assert_eq!(1, store.count());
        assert_eq!(
            5,
            store
                .get(&crate::quick_tab::QuickTabId::new(String::from("qt1")))
                .expect("kept")
                .position
                .left
        );
        assert_eq!(vec!["added", "updated"], *events.borrow());
    }

    #[wasm_bindgen_test]
    fn test_update_reports_missing_entity() {
        let mut store = QuickTabStore::new();
        let missing = crate::quick_tab::QuickTabId::new(String::from("gone"));
        assert!(!store.update(&missing, |quick_tab| quick_tab.minimize(true)));

        store.add(sample("qt1", &ContainerId::default()));
        let id = crate::quick_tab::QuickTabId::new(String::from("qt1"));
        assert!(store.update(&id, |quick_tab| quick_tab.minimize(true)));
        assert!(store.get(&id).expect("kept").visibility.minimized);
    }

    #[wasm_bindgen_test]
    fn test_delete_twice_is_a_no_op() {
        let mut store = QuickTabStore::new();
        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&events);
        store.subscribe(move |event| sink.borrow_mut().push(event_name(event)));

        store.add(sample("qt1", &ContainerId::default()));
        let id = crate::quick_tab::QuickTabId::new(String::from("qt1"));
        assert!(store.delete(&id).is_some());
        assert!(store.delete(&id).is_none());
        assert_eq!(0, store.count());
        assert_eq!(vec!["added", "deleted"], *events.borrow());
    }

    #[wasm_bindgen_test]
    fn test_clear_on_empty_store_emits_nothing() {
        let mut store = QuickTabStore::new();
        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&events);
        store.subscribe(move |event| sink.borrow_mut().push(event_name(event)));

        store.clear();
        assert!(events.borrow().is_empty());

        store.add(sample("qt1", &ContainerId::default()));
        store.clear();
        assert_eq!(vec!["added", "cleared"], *events.borrow());
    }
}
