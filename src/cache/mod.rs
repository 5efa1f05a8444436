//! The contact cache engine.
//!
//! `ContactCache` fronts an asynchronous [`ContactStore`] with a record
//! table, live filtered views, address indexes and a prioritized request
//! sequencer. It is single-threaded by contract: all store completions
//! arrive over the event channel and are applied by [`process_events`],
//! which the owning thread must drive.
//!
//! [`process_events`]: ContactCache::process_events

mod aggregate;
mod dispatch;
mod resolve;
mod update;

use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

use crossbeam_channel::Receiver;
use tracing::debug;

use crate::contact::{api_id, internal_id, Contact, ContactId, InternalId};
use crate::index::{AddressIndex, PhoneIndexPolicy};
use crate::name::{
    generate_display_label, DisplayLabelOrder, FirstCharacterGrouper, GroupProperty, NameGrouper,
};
use crate::observer::{
    ChangeListener, ItemListener, Listeners, ListModel, NameGroupListener, ResolveListener,
};
use crate::store::{
    CacheEvent, ContactStore, EventSink, Relationship, RequestKind, SortProperty,
};

use self::aggregate::ContactLinkRequest;
use self::dispatch::{ByIdPurpose, Debounce, FetchPurpose, IdFetchPurpose, PopulateProgress};
use self::resolve::ResolveData;
use self::update::ResultBatch;

/// The live views the cache maintains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterType {
    /// No membership predicate; not backed by a populated id list.
    None,
    All,
    Favorites,
    Online,
}

/// Population-backed views, in population phase order.
pub(crate) const POPULATED_FILTERS: [FilterType; 3] =
    [FilterType::Favorites, FilterType::All, FilterType::Online];

pub(crate) fn view_slot(filter: FilterType) -> usize {
    match filter {
        FilterType::None => 0,
        FilterType::All => 1,
        FilterType::Favorites => 2,
        FilterType::Online => 3,
    }
}

/// How much of a contact's record the cache holds.
///
/// Completeness is monotonic: a record never moves back toward `Absent`
/// while cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ContactState {
    /// Stub created on first reference; no data fetched yet.
    Absent,
    /// Holds a detail subset from a hinted fetch.
    Partial,
    /// A completion fetch has been enqueued.
    Requested,
    /// The full record is cached.
    Complete,
}

/// One cached contact record with its derived presentation data.
pub struct CacheItem {
    pub contact: Contact,
    pub state: ContactState,
    pub display_label: String,
    pub name_group: String,
    pub(crate) listeners: Listeners<dyn ItemListener>,
}

impl CacheItem {
    fn new(contact: Contact, state: ContactState) -> Self {
        CacheItem {
            contact,
            state,
            display_label: String::new(),
            name_group: String::new(),
            listeners: Listeners::new(),
        }
    }

    pub fn id(&self) -> ContactId {
        self.contact.id
    }
}

/// Engine configuration; all fields may also be changed at runtime
/// through the corresponding setters.
pub struct CacheConfig {
    pub display_label_order: DisplayLabelOrder,
    pub sort_property: SortProperty,
    pub group_property: GroupProperty,
    pub phone_index_policy: PhoneIndexPolicy,
    /// `fetch_data` bitmask of address details every fetch must include.
    pub required_fetch_data: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            display_label_order: DisplayLabelOrder::default(),
            sort_property: SortProperty::FirstName,
            group_property: GroupProperty::default(),
            phone_index_policy: PhoneIndexPolicy::default(),
            required_fetch_data: 0,
        }
    }
}

pub(crate) struct View {
    pub(crate) ids: Vec<InternalId>,
    pub(crate) models: Listeners<dyn ListModel>,
    pub(crate) populated: bool,
    /// List-diff cursors, live across incremental id-query chunks.
    pub(crate) cache_index: usize,
    pub(crate) query_index: usize,
    /// Id-query results accumulated across chunks of one refresh.
    pub(crate) query_ids: Vec<InternalId>,
    pub(crate) refresh_required: bool,
}

impl View {
    fn new() -> Self {
        View {
            ids: Vec::new(),
            models: Listeners::new(),
            populated: false,
            cache_index: 0,
            query_index: 0,
            query_ids: Vec::new(),
            refresh_required: false,
        }
    }
}

/// Caching and synchronization engine over an asynchronous contact store.
pub struct ContactCache<S: ContactStore> {
    pub(crate) store: S,
    pub(crate) sink: EventSink,
    receiver: Receiver<CacheEvent>,
    pub(crate) config: CacheConfig,
    pub(crate) grouper: Box<dyn NameGrouper>,
    pub(crate) self_id: InternalId,

    pub(crate) items: HashMap<InternalId, CacheItem>,
    pub(crate) views: [View; 4],
    pub(crate) name_groups: HashMap<String, HashSet<InternalId>>,
    pub(crate) index: AddressIndex,

    pub(crate) change_listeners: Listeners<dyn ChangeListener>,
    pub(crate) name_group_listeners: Listeners<dyn NameGroupListener>,

    // One in-flight operation per kind, with per-kind context
    pub(crate) active: HashSet<RequestKind>,
    pub(crate) fetch_purpose: Option<FetchPurpose>,
    pub(crate) id_fetch_purpose: Option<IdFetchPurpose>,
    pub(crate) by_id_purpose: Option<ByIdPurpose>,
    pub(crate) relationship_fetch_contact: Option<ContactId>,
    pub(crate) fetched_relationships: Vec<Relationship>,
    pub(crate) fetched_ids: Vec<ContactId>,

    // Pending work, one queue per sequencer category
    pub(crate) relationships_to_save: Vec<Relationship>,
    pub(crate) relationships_to_remove: Vec<Relationship>,
    pub(crate) contacts_to_remove: Vec<ContactId>,
    pub(crate) contacts_to_create: Vec<Contact>,
    pub(crate) contacts_to_save: Vec<Contact>,
    /// Per-aggregate constituent record fetches: (aggregate, record ids).
    pub(crate) constituent_ids_to_fetch: Vec<(ContactId, Vec<ContactId>)>,
    pub(crate) contacts_to_fetch_constituents: Vec<ContactId>,
    pub(crate) contacts_to_fetch_candidates: Vec<ContactId>,
    pub(crate) changed_contacts: Vec<ContactId>,
    pub(crate) presence_changed_contacts: Vec<ContactId>,
    pub(crate) pending_results: VecDeque<ResultBatch>,
    pub(crate) resolve_addresses: VecDeque<ResolveData>,
    pub(crate) unknown_addresses: Vec<ResolveData>,
    pub(crate) pending_links: Vec<ContactLinkRequest>,
    pub(crate) aggregated_ids: Vec<ContactId>,
    pub(crate) expired_contacts: HashMap<InternalId, i32>,

    pub(crate) populate_progress: PopulateProgress,
    pub(crate) keep_populated: bool,
    pub(crate) refetch_required: bool,
    pub(crate) debounce: Debounce,
}

impl<S: ContactStore> ContactCache<S> {
    /// Build a cache over `store`. The sink/receiver pair must be the one
    /// the store posts its completions to (see [`event_channel`]).
    ///
    /// [`event_channel`]: crate::store::event_channel
    pub fn new(
        store: S,
        sink: EventSink,
        receiver: Receiver<CacheEvent>,
        config: CacheConfig,
    ) -> Self {
        let self_id = internal_id(store.self_contact_id());
        let index = AddressIndex::new(config.phone_index_policy);
        let grouper = Box::new(FirstCharacterGrouper::new(config.group_property));

        ContactCache {
            store,
            sink,
            receiver,
            config,
            grouper,
            self_id,
            items: HashMap::new(),
            views: [View::new(), View::new(), View::new(), View::new()],
            name_groups: HashMap::new(),
            index,
            change_listeners: Listeners::new(),
            name_group_listeners: Listeners::new(),
            active: HashSet::new(),
            fetch_purpose: None,
            id_fetch_purpose: None,
            by_id_purpose: None,
            relationship_fetch_contact: None,
            fetched_relationships: Vec::new(),
            fetched_ids: Vec::new(),
            relationships_to_save: Vec::new(),
            relationships_to_remove: Vec::new(),
            contacts_to_remove: Vec::new(),
            contacts_to_create: Vec::new(),
            contacts_to_save: Vec::new(),
            constituent_ids_to_fetch: Vec::new(),
            contacts_to_fetch_constituents: Vec::new(),
            contacts_to_fetch_candidates: Vec::new(),
            changed_contacts: Vec::new(),
            presence_changed_contacts: Vec::new(),
            pending_results: VecDeque::new(),
            resolve_addresses: VecDeque::new(),
            unknown_addresses: Vec::new(),
            pending_links: Vec::new(),
            aggregated_ids: Vec::new(),
            expired_contacts: HashMap::new(),
            populate_progress: PopulateProgress::Unpopulated,
            keep_populated: false,
            refetch_required: false,
            debounce: Debounce::default(),
        }
    }

    /// Replace the name-group strategy, regrouping every cached record.
    pub fn set_grouper(&mut self, grouper: Box<dyn NameGrouper>) {
        self.grouper = grouper;
        self.regroup_all();
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    // -- record access -------------------------------------------------

    /// Cached item for `id`, creating an `Absent` stub on first reference.
    /// Returns `None` only for the null id.
    pub fn item_by_id(&mut self, id: ContactId, require_complete: bool) -> Option<&CacheItem> {
        if !id.is_valid() {
            return None;
        }
        let iid = internal_id(id);
        self.items
            .entry(iid)
            .or_insert_with(|| CacheItem::new(Contact::new(id), ContactState::Absent));
        if require_complete {
            self.ensure_completion(id);
        }
        self.items.get(&iid)
    }

    /// Cached item for `id` without creating one.
    pub fn existing_item(&self, id: ContactId) -> Option<&CacheItem> {
        self.items.get(&internal_id(id))
    }

    /// Enqueue a full-record fetch unless one is already pending or the
    /// record is complete. Idempotent.
    pub fn ensure_completion(&mut self, id: ContactId) {
        if !id.is_valid() {
            return;
        }
        let iid = internal_id(id);
        let Some(item) = self.items.get_mut(&iid) else {
            return;
        };
        if item.state < ContactState::Requested {
            item.state = ContactState::Requested;
            if !self.changed_contacts.contains(&id) {
                self.changed_contacts.push(id);
            }
            self.request_update();
        }
    }

    /// Queue a full refetch of a contact's record, regardless of its
    /// current completeness.
    pub fn refresh_contact(&mut self, id: ContactId) {
        if !id.is_valid() {
            return;
        }
        if !self.changed_contacts.contains(&id) {
            self.changed_contacts.push(id);
        }
        self.request_update();
    }

    // -- mutation ------------------------------------------------------

    /// Queue a contact create (null id) or save (valid id).
    pub fn save_contact(&mut self, contact: Contact) {
        if contact.id.is_valid() {
            self.contacts_to_save.push(contact);
        } else {
            self.contacts_to_create.push(contact);
        }
        self.request_update();
    }

    /// Queue removal of a contact. Invalid ids are ignored.
    pub fn remove_contact(&mut self, id: ContactId) {
        if !id.is_valid() {
            debug!("ignoring removal of invalid contact id");
            return;
        }
        self.contacts_to_remove.push(id);
        // The record will fall out of views on the removal signal; make
        // sure an unviewed record is also reclaimed
        let iid = internal_id(id);
        if self.items.contains_key(&iid) && !self.id_in_any_view(iid) {
            *self.expired_contacts.entry(iid).or_insert(0) -= 1;
        }
        self.request_update();
    }

    /// Queue a fetch of the constituents aggregated under `id`, reported
    /// through the item's listeners.
    pub fn fetch_constituents(&mut self, id: ContactId) {
        if !id.is_valid() {
            return;
        }
        if !self.contacts_to_fetch_constituents.contains(&id) {
            self.contacts_to_fetch_constituents.push(id);
        }
        self.request_update();
    }

    /// Queue a merge-candidate query for `id`, reported through the
    /// item's listeners.
    pub fn fetch_merge_candidates(&mut self, id: ContactId) {
        if !id.is_valid() {
            return;
        }
        if !self.contacts_to_fetch_candidates.contains(&id) {
            self.contacts_to_fetch_candidates.push(id);
        }
        self.request_update();
    }

    // -- views ---------------------------------------------------------

    /// Ordered id sequence of a view.
    pub fn contacts(&self, filter: FilterType) -> &[InternalId] {
        &self.views[view_slot(filter)].ids
    }

    pub fn is_populated(&self, filter: FilterType) -> bool {
        self.views[view_slot(filter)].populated
    }

    /// Attach an ordered-view observer to a filter. The first model
    /// registered on a population-backed filter starts population.
    pub fn register_model(&mut self, filter: FilterType, model: &Rc<dyn ListModel>) {
        self.views[view_slot(filter)].models.add(model);
        if filter != FilterType::None {
            self.keep_populated = true;
            self.request_update();
        }
        if self.views[view_slot(filter)].populated {
            model.became_populated();
        }
    }

    pub fn unregister_model(&mut self, filter: FilterType, model: &Rc<dyn ListModel>) {
        self.views[view_slot(filter)].models.remove(model);
    }

    // -- listeners -----------------------------------------------------

    pub fn register_change_listener(&mut self, listener: &Rc<dyn ChangeListener>) {
        self.change_listeners.add(listener);
    }

    pub fn unregister_change_listener(&mut self, listener: &Rc<dyn ChangeListener>) {
        self.change_listeners.remove(listener);
    }

    pub fn register_name_group_listener(&mut self, listener: &Rc<dyn NameGroupListener>) {
        self.name_group_listeners.add(listener);
        if !self.name_groups.is_empty() {
            listener.name_groups_updated(&self.name_groups);
        }
    }

    pub fn unregister_name_group_listener(&mut self, listener: &Rc<dyn NameGroupListener>) {
        self.name_group_listeners.remove(listener);
    }

    /// Attach a fine-grained listener to one contact, creating the stub
    /// record if needed.
    pub fn register_item_listener(&mut self, id: ContactId, listener: &Rc<dyn ItemListener>) {
        if self.item_by_id(id, false).is_none() {
            return;
        }
        if let Some(item) = self.items.get_mut(&internal_id(id)) {
            item.listeners.add(listener);
        }
    }

    pub fn unregister_item_listener(&mut self, id: ContactId, listener: &Rc<dyn ItemListener>) {
        if let Some(item) = self.items.get_mut(&internal_id(id)) {
            item.listeners.remove(listener);
        }
    }

    /// Drop a resolve listener's pending and parked requests. In-flight
    /// store queries run to completion with their results discarded.
    pub fn unregister_resolve_listener(&mut self, listener: &Rc<dyn ResolveListener>) {
        self.resolve_addresses
            .retain(|data| !Rc::ptr_eq(&data.listener, listener));
        self.unknown_addresses
            .retain(|data| !Rc::ptr_eq(&data.listener, listener));
        if let Some(FetchPurpose::Resolve { data, .. }) = &self.fetch_purpose {
            if Rc::ptr_eq(&data.listener, listener) {
                self.fetch_purpose = Some(FetchPurpose::AbandonedResolve);
            }
        }
    }

    // -- runtime configuration -----------------------------------------

    /// Current name-group populations: bucket to member ids.
    pub fn name_groups(&self) -> &HashMap<String, HashSet<InternalId>> {
        &self.name_groups
    }

    pub fn all_name_groups(&self) -> Vec<String> {
        self.grouper.all_groups()
    }

    pub fn display_label_order(&self) -> DisplayLabelOrder {
        self.config.display_label_order
    }

    pub fn set_display_label_order(&mut self, order: DisplayLabelOrder) {
        if self.config.display_label_order == order {
            return;
        }
        self.config.display_label_order = order;
        let iids: Vec<InternalId> = self.items.keys().copied().collect();
        for iid in iids {
            if let Some(item) = self.items.get_mut(&iid) {
                item.display_label =
                    generate_display_label(&item.contact, order);
            }
        }
        self.regroup_all();
        self.notify_display_config_changed();
    }

    pub fn sort_property(&self) -> SortProperty {
        self.config.sort_property
    }

    /// Changing the sort property invalidates view order; a refresh of
    /// every populated view is scheduled.
    pub fn set_sort_property(&mut self, property: SortProperty) {
        if self.config.sort_property == property {
            return;
        }
        self.config.sort_property = property;
        self.mark_all_views_for_refresh();
        self.notify_display_config_changed();
        self.request_update();
    }

    pub fn group_property(&self) -> GroupProperty {
        self.config.group_property
    }

    pub fn set_group_property(&mut self, property: GroupProperty) {
        if self.config.group_property == property {
            return;
        }
        self.config.group_property = property;
        self.grouper = Box::new(FirstCharacterGrouper::new(property));
        self.regroup_all();
        self.notify_display_config_changed();
    }

    /// Widen the address details every fetch must carry. If population
    /// already ran with a narrower projection, a refetch is scheduled.
    pub fn set_required_fetch_data(&mut self, required: u32) {
        let widened = required & !self.config.required_fetch_data != 0;
        self.config.required_fetch_data |= required;
        if widened && self.populate_progress == PopulateProgress::Populated {
            self.refetch_required = true;
            self.request_update();
        }
    }

    // -- event loop ----------------------------------------------------

    /// Drain and apply every queued event. Returns whether any event was
    /// processed. The owning thread calls this whenever the receiver has
    /// data (or after [`poll_timers`] fires).
    ///
    /// [`poll_timers`]: ContactCache::poll_timers
    pub fn process_events(&mut self) -> bool {
        let mut worked = false;
        while let Ok(event) = self.receiver.try_recv() {
            worked = true;
            match event {
                CacheEvent::Store(store_event) => self.handle_store_event(store_event),
                CacheEvent::UpdateRequest => self.dispatch(),
            }
        }
        worked
    }

    /// Earliest instant at which [`poll_timers`] has work, if any.
    ///
    /// [`poll_timers`]: ContactCache::poll_timers
    pub fn next_timer_deadline(&self) -> Option<std::time::Instant> {
        self.debounce.deadline()
    }

    /// Expire debounce windows that have elapsed by `now`, waking the
    /// sequencer if one did.
    pub fn poll_timers(&mut self, now: std::time::Instant) {
        if self.debounce.poll(now) {
            self.request_update();
        }
    }

    // -- internal helpers ----------------------------------------------

    pub(crate) fn request_update(&mut self) {
        self.sink.request_update();
    }

    pub(crate) fn view(&self, filter: FilterType) -> &View {
        &self.views[view_slot(filter)]
    }

    pub(crate) fn view_mut(&mut self, filter: FilterType) -> &mut View {
        &mut self.views[view_slot(filter)]
    }

    pub(crate) fn id_in_any_view(&self, iid: InternalId) -> bool {
        POPULATED_FILTERS
            .iter()
            .any(|filter| self.view(*filter).ids.contains(&iid))
    }

    pub(crate) fn mark_all_views_for_refresh(&mut self) {
        for filter in POPULATED_FILTERS {
            self.view_mut(filter).refresh_required = true;
        }
    }

    fn notify_display_config_changed(&self) {
        for filter in [
            FilterType::None,
            FilterType::All,
            FilterType::Favorites,
            FilterType::Online,
        ] {
            for model in self.view(filter).models.snapshot() {
                model.display_config_changed();
            }
        }
    }

    /// Validity guard used at public entry points.
    pub(crate) fn valid_pair(a: ContactId, b: ContactId) -> bool {
        a.is_valid() && b.is_valid() && a != b
    }
}

pub(crate) fn contact_api_id(iid: InternalId) -> ContactId {
    api_id(iid)
}
