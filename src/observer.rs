//! Observer surfaces exposed to view collaborators.
//!
//! Listeners are owned `Rc` handles held in [`Listeners`] registries;
//! identity is the allocation (`Rc::ptr_eq`), so the same handle used to
//! register also unregisters. The cache snapshots a registry before
//! fanning out, so a callback may re-register or unregister freely.
//! Callbacks take `&self`; implementors needing mutation use interior
//! mutability, which is safe under the cache's single-thread model.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::contact::{Contact, ContactId, InternalId};

/// Ordered-view observer attached to one filter.
pub trait ListModel {
    /// `count` items were inserted at `index`.
    fn items_inserted(&self, index: usize, count: usize);

    /// `count` items were removed from `index`.
    fn items_removed(&self, index: usize, count: usize);

    /// Role data changed for the range without membership changes.
    fn items_changed(&self, index: usize, count: usize);

    /// The view's population phase completed.
    fn became_populated(&self);

    /// Display label order, sort or group property changed; relabel.
    fn display_config_changed(&self) {}
}

/// Global per-item change feed.
pub trait ChangeListener {
    fn item_updated(&self, contact: &Contact);
    fn item_about_to_be_removed(&self, contact: &Contact);
}

/// Name-bucket-level change feed: which ids moved in or out of which
/// buckets, with the bucket's new population count.
pub trait NameGroupListener {
    fn name_groups_updated(&self, changed: &HashMap<String, HashSet<InternalId>>);
}

/// Callback target of an asynchronous address lookup. Invoked at least
/// once per resolve, with `None` for a not-found; a missed address stays
/// parked and may be answered a second time if a matching contact
/// appears later.
pub trait ResolveListener {
    fn address_resolved(&self, first: &str, second: &str, contact: Option<&Contact>);
}

/// Fine-grained observer attached to a single cached contact, for detail
/// views and aggregation drivers. All methods default to no-ops.
pub trait ItemListener {
    fn item_updated(&self, _contact: &Contact) {}

    /// The record is being evicted; drop any retained state for it.
    fn item_about_to_be_destroyed(&self, _id: ContactId) {}

    fn constituents_fetched(&self, _ids: &[ContactId]) {}

    fn merge_candidates_fetched(&self, _ids: &[ContactId]) {}

    fn aggregation_operation_completed(&self) {}
}

/// Registry of listener handles with `Rc::ptr_eq` identity.
pub struct Listeners<T: ?Sized> {
    entries: Vec<Rc<T>>,
}

impl<T: ?Sized> Listeners<T> {
    pub fn new() -> Self {
        Listeners { entries: Vec::new() }
    }

    /// Register a handle; already-registered handles are not duplicated.
    pub fn add(&mut self, listener: &Rc<T>) {
        if !self.contains(listener) {
            self.entries.push(Rc::clone(listener));
        }
    }

    /// Unregister a handle. Returns whether it was registered.
    pub fn remove(&mut self, listener: &Rc<T>) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| !Rc::ptr_eq(entry, listener));
        self.entries.len() != before
    }

    pub fn contains(&self, listener: &Rc<T>) -> bool {
        self.entries.iter().any(|entry| Rc::ptr_eq(entry, listener))
    }

    /// Clone of the current handles, for fan-out that survives callbacks
    /// mutating the registry.
    pub fn snapshot(&self) -> Vec<Rc<T>> {
        self.entries.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl<T: ?Sized> Default for Listeners<T> {
    fn default() -> Self {
        Listeners::new()
    }
}
