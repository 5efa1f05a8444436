//! Shared test harness: an in-memory contact store double that honors
//! filters, sorts and fetch hints, plus recording observers and an event
//! pump driving the cache to quiescence.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::rc::Rc;
use std::sync::Once;
use std::time::{Duration, Instant};

use rolodex::cache::{CacheConfig, ContactCache};
use rolodex::contact::{
    status_flags, Contact, ContactId, DetailKind, EmailAddress, OnlineAccount, PhoneNumber,
    SyncTarget,
};
use rolodex::error::Result;
use rolodex::contact::InternalId;
use rolodex::observer::{
    ChangeListener, ItemListener, ListModel, NameGroupListener, ResolveListener,
};
use rolodex::phone::minimize_phone_number;
use rolodex::store::{
    event_channel, ContactStore, EventSink, FetchHint, QueryFilter, Relationship, RequestKind,
    SortProperty, SortSpec, StoreEvent, StoreRequest,
};

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// In-memory store double. Requests queue on `begin` and are executed by
/// [`MemoryStore::deliver_all`], so tests control interleaving.
pub struct MemoryStore {
    sink: EventSink,
    contacts: BTreeMap<u32, Contact>,
    relationships: Vec<Relationship>,
    queue: VecDeque<StoreRequest>,
    next_id: u32,
    /// Result rows per `ContactsAvailable`/`ContactIdsAvailable` event;
    /// zero delivers everything in one chunk.
    pub chunk_size: usize,
    /// Every request kind begun, in order, for dispatch assertions.
    pub begun: Vec<RequestKind>,
}

impl MemoryStore {
    pub const SELF_CONTACT: ContactId = ContactId(1);

    pub fn new(sink: EventSink) -> Self {
        MemoryStore {
            sink,
            contacts: BTreeMap::new(),
            relationships: Vec::new(),
            queue: VecDeque::new(),
            next_id: 2,
            chunk_size: 0,
            begun: Vec::new(),
        }
    }

    // -- seeding and signals -------------------------------------------

    /// Insert a record without emitting change signals.
    pub fn seed(&mut self, contact: Contact) {
        self.next_id = self.next_id.max(contact.id.0 + 1);
        self.contacts.insert(contact.id.0, contact);
    }

    pub fn seed_relationship(&mut self, relationship: Relationship) {
        self.relationships.push(relationship);
    }

    /// Replace a record and signal the change.
    pub fn update(&mut self, contact: Contact) {
        let id = contact.id;
        self.contacts.insert(id.0, contact);
        self.sink.post(StoreEvent::ContactsChanged { ids: vec![id] });
    }

    pub fn contact(&self, id: ContactId) -> Option<&Contact> {
        self.contacts.get(&id.0)
    }

    pub fn relationships(&self) -> &[Relationship] {
        &self.relationships
    }

    pub fn notify_presence_changed(&self, ids: Vec<ContactId>) {
        self.sink.post(StoreEvent::ContactsPresenceChanged { ids });
    }

    pub fn notify_data_changed(&self) {
        self.sink.post(StoreEvent::DataChanged);
    }

    // -- execution -----------------------------------------------------

    /// Execute every queued request to completion. Returns whether any
    /// request ran.
    pub fn deliver_all(&mut self) -> bool {
        let mut worked = false;
        while let Some(request) = self.queue.pop_front() {
            worked = true;
            self.execute(request);
        }
        worked
    }

    fn execute(&mut self, request: StoreRequest) {
        match request {
            StoreRequest::FetchContacts { filter, sort, hint } => {
                let results = self.query(&filter, &sort);
                let projected: Vec<Contact> =
                    results.iter().map(|c| project(c, &hint)).collect();
                self.post_contacts(RequestKind::Fetch, projected);
                self.finish(RequestKind::Fetch);
            }
            StoreRequest::FetchContactIds { filter, sort } => {
                let ids: Vec<ContactId> =
                    self.query(&filter, &sort).iter().map(|c| c.id).collect();
                self.post_ids(ids);
                self.finish(RequestKind::IdFetch);
            }
            StoreRequest::FetchContactsById { ids, hint } => {
                let results: Vec<Contact> = ids
                    .iter()
                    .filter_map(|id| self.contacts.get(&id.0))
                    .map(|c| project(c, &hint))
                    .collect();
                self.post_contacts(RequestKind::FetchById, results);
                self.finish(RequestKind::FetchById);
            }
            StoreRequest::FetchRelationships { contact } => {
                let relationships: Vec<Relationship> = self
                    .relationships
                    .iter()
                    .filter(|rel| rel.first == contact || rel.second == contact)
                    .copied()
                    .collect();
                self.sink
                    .post(StoreEvent::RelationshipsAvailable { relationships });
                self.finish(RequestKind::RelationshipFetch);
            }
            StoreRequest::SaveContacts { contacts } => {
                let mut added = Vec::new();
                let mut changed = Vec::new();
                for mut contact in contacts {
                    if contact.id.is_valid() {
                        changed.push(contact.id);
                        self.contacts.insert(contact.id.0, contact);
                    } else {
                        contact.id = ContactId(self.next_id);
                        self.next_id += 1;
                        added.push(contact.id);
                        self.contacts.insert(contact.id.0, contact);
                    }
                }
                self.finish(RequestKind::Save);
                if !added.is_empty() {
                    self.sink.post(StoreEvent::ContactsAdded { ids: added });
                }
                if !changed.is_empty() {
                    self.sink.post(StoreEvent::ContactsChanged { ids: changed });
                }
            }
            StoreRequest::RemoveContacts { ids } => {
                let mut removed = Vec::new();
                for id in ids {
                    if self.contacts.remove(&id.0).is_some() {
                        removed.push(id);
                    }
                    self.relationships
                        .retain(|rel| rel.first != id && rel.second != id);
                }
                self.finish(RequestKind::Remove);
                if !removed.is_empty() {
                    self.sink.post(StoreEvent::ContactsRemoved { ids: removed });
                }
            }
            StoreRequest::SaveRelationships { relationships } => {
                for relationship in relationships {
                    if !self.relationships.contains(&relationship) {
                        self.relationships.push(relationship);
                    }
                }
                self.finish(RequestKind::RelationshipSave);
            }
            StoreRequest::RemoveRelationships { relationships } => {
                self.relationships
                    .retain(|rel| !relationships.contains(rel));
                self.finish(RequestKind::RelationshipRemove);
            }
        }
    }

    fn post_contacts(&self, kind: RequestKind, contacts: Vec<Contact>) {
        for chunk in chunks(contacts, self.chunk_size) {
            self.sink
                .post(StoreEvent::ContactsAvailable { kind, contacts: chunk });
        }
    }

    fn post_ids(&self, ids: Vec<ContactId>) {
        for chunk in chunks(ids, self.chunk_size) {
            self.sink.post(StoreEvent::ContactIdsAvailable { ids: chunk });
        }
    }

    fn finish(&self, kind: RequestKind) {
        self.sink.post(StoreEvent::RequestFinished { kind, error: None });
    }

    // -- query evaluation ----------------------------------------------

    fn query(&self, filter: &QueryFilter, sort: &[SortSpec]) -> Vec<Contact> {
        let mut results: Vec<Contact> = self
            .contacts
            .values()
            .filter(|contact| matches_filter(contact, filter))
            .cloned()
            .collect();

        if let Some(spec) = sort.first() {
            results.sort_by(|a, b| sort_key(a, spec).cmp(&sort_key(b, spec)));
        }
        results
    }
}

impl ContactStore for MemoryStore {
    fn begin(&mut self, request: StoreRequest) -> Result<()> {
        self.begun.push(request.kind());
        self.queue.push_back(request);
        Ok(())
    }

    fn self_contact_id(&self) -> ContactId {
        Self::SELF_CONTACT
    }
}

fn chunks<T>(items: Vec<T>, chunk_size: usize) -> Vec<Vec<T>> {
    if chunk_size == 0 || items.len() <= chunk_size {
        return vec![items];
    }
    let mut out = Vec::new();
    let mut rest = items;
    while !rest.is_empty() {
        let take = rest.len().min(chunk_size);
        let tail = rest.split_off(take);
        out.push(rest);
        rest = tail;
    }
    out
}

fn matches_filter(contact: &Contact, filter: &QueryFilter) -> bool {
    match filter {
        QueryFilter::Aggregates => contact.sync_target == SyncTarget::Aggregate,
        QueryFilter::Favorites => contact.favorite,
        QueryFilter::Online => contact.is_online(),
        QueryFilter::Ids(ids) => ids.contains(&contact.id),
        QueryFilter::PhoneMatch(number) => {
            let Some(target) = minimize_phone_number(number) else {
                return false;
            };
            contact.phone_numbers.iter().any(|phone| {
                minimize_phone_number(&phone.number).as_deref() == Some(target.as_str())
            })
        }
        QueryFilter::Email(address) => contact
            .email_addresses
            .iter()
            .any(|email| email.address.eq_ignore_ascii_case(address)),
        QueryFilter::OnlineAccount {
            account_path,
            account_uri,
        } => contact.online_accounts.iter().any(|account| {
            account.account_uri.eq_ignore_ascii_case(account_uri)
                && account_path
                    .as_ref()
                    .map(|path| &account.account_path == path)
                    .unwrap_or(true)
        }),
        QueryFilter::MergeCandidates(subject) => {
            contact.id != subject.id
                && contact.sync_target == SyncTarget::Aggregate
                && contact.first_name.eq_ignore_ascii_case(&subject.first_name)
                && contact.last_name.eq_ignore_ascii_case(&subject.last_name)
        }
        QueryFilter::And(parts) => parts.iter().all(|part| matches_filter(contact, part)),
    }
}

fn sort_key(contact: &Contact, spec: &SortSpec) -> (String, String, u32) {
    match spec.property {
        SortProperty::FirstName => (
            contact.first_name.to_lowercase(),
            contact.last_name.to_lowercase(),
            contact.id.0,
        ),
        SortProperty::LastName => (
            contact.last_name.to_lowercase(),
            contact.first_name.to_lowercase(),
            contact.id.0,
        ),
    }
}

/// Detail projection honoring a fetch hint, the way a real store would
/// trim payloads for low-tier queries.
fn project(contact: &Contact, hint: &FetchHint) -> Contact {
    if hint.details.is_empty() {
        return contact.clone();
    }
    let mut out = Contact::new(contact.id);
    for kind in &hint.details {
        match kind {
            DetailKind::Name => {
                out.first_name = contact.first_name.clone();
                out.last_name = contact.last_name.clone();
            }
            DetailKind::Nickname => out.nickname = contact.nickname.clone(),
            DetailKind::DisplayLabel => out.backend_label = contact.backend_label.clone(),
            DetailKind::Favorite => out.favorite = contact.favorite,
            DetailKind::Gender => out.gender = contact.gender,
            DetailKind::StatusFlags => out.status_flags = contact.status_flags,
            DetailKind::SyncTarget => out.sync_target = contact.sync_target.clone(),
            DetailKind::Avatar => out.avatars = contact.avatars.clone(),
            DetailKind::GlobalPresence | DetailKind::Presence => {
                out.global_presence = contact.global_presence.clone();
            }
            DetailKind::PhoneNumber => out.phone_numbers = contact.phone_numbers.clone(),
            DetailKind::EmailAddress => out.email_addresses = contact.email_addresses.clone(),
            DetailKind::OnlineAccount => out.online_accounts = contact.online_accounts.clone(),
            DetailKind::Organization => out.organization = contact.organization.clone(),
        }
    }
    out
}

// -- harness -----------------------------------------------------------

pub fn build_cache() -> ContactCache<MemoryStore> {
    build_cache_with_config(CacheConfig::default())
}

pub fn build_cache_with_config(config: CacheConfig) -> ContactCache<MemoryStore> {
    init_tracing();
    let (sink, receiver) = event_channel();
    let store = MemoryStore::new(sink.clone());
    ContactCache::new(store, sink, receiver, config)
}

/// Alternate cache events and store deliveries until both sides go idle.
/// Debounce windows are force-expired so tests stay deterministic.
pub fn run_until_idle(cache: &mut ContactCache<MemoryStore>) {
    for _ in 0..1000 {
        cache.poll_timers(Instant::now() + Duration::from_secs(60));
        let events = cache.process_events();
        let deliveries = cache.store_mut().deliver_all();
        if !events && !deliveries {
            return;
        }
    }
    panic!("cache failed to reach quiescence");
}

// -- fixtures ----------------------------------------------------------

pub fn aggregate(id: u32, first: &str, last: &str) -> Contact {
    let mut contact = Contact::new(ContactId(id));
    contact.first_name = first.to_string();
    contact.last_name = last.to_string();
    contact.sync_target = SyncTarget::Aggregate;
    contact
}

pub fn local(id: u32, first: &str, last: &str) -> Contact {
    let mut contact = Contact::new(ContactId(id));
    contact.first_name = first.to_string();
    contact.last_name = last.to_string();
    contact.sync_target = SyncTarget::Local;
    contact
}

pub fn with_phone(mut contact: Contact, number: &str) -> Contact {
    contact.phone_numbers.push(PhoneNumber {
        number: number.to_string(),
    });
    contact.status_flags |= status_flags::HAS_PHONE_NUMBER;
    contact
}

pub fn with_email(mut contact: Contact, address: &str) -> Contact {
    contact.email_addresses.push(EmailAddress {
        address: address.to_string(),
    });
    contact.status_flags |= status_flags::HAS_EMAIL_ADDRESS;
    contact
}

pub fn with_account(mut contact: Contact, path: &str, uri: &str) -> Contact {
    contact.online_accounts.push(OnlineAccount {
        account_path: path.to_string(),
        account_uri: uri.to_string(),
        nickname: String::new(),
    });
    contact.status_flags |= status_flags::HAS_ONLINE_ACCOUNT;
    contact
}

pub fn favorite(mut contact: Contact) -> Contact {
    contact.favorite = true;
    contact.status_flags |= status_flags::IS_FAVORITE;
    contact
}

pub fn online(mut contact: Contact) -> Contact {
    contact.status_flags |= status_flags::IS_ONLINE;
    contact.global_presence.presence_state = 1;
    contact
}

// -- recording observers -----------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    Inserted(usize, usize),
    Removed(usize, usize),
    Changed(usize, usize),
    Populated,
}

#[derive(Default)]
pub struct RecordingModel {
    pub events: RefCell<Vec<ModelEvent>>,
}

impl RecordingModel {
    pub fn handle(self: &Rc<Self>) -> Rc<dyn ListModel> {
        self.clone()
    }

    pub fn is_populated(&self) -> bool {
        self.events.borrow().contains(&ModelEvent::Populated)
    }
}

impl ListModel for RecordingModel {
    fn items_inserted(&self, index: usize, count: usize) {
        self.events
            .borrow_mut()
            .push(ModelEvent::Inserted(index, count));
    }

    fn items_removed(&self, index: usize, count: usize) {
        self.events
            .borrow_mut()
            .push(ModelEvent::Removed(index, count));
    }

    fn items_changed(&self, index: usize, count: usize) {
        self.events
            .borrow_mut()
            .push(ModelEvent::Changed(index, count));
    }

    fn became_populated(&self) {
        self.events.borrow_mut().push(ModelEvent::Populated);
    }
}

#[derive(Default)]
pub struct RecordingResolveListener {
    pub resolved: RefCell<Vec<(String, String, Option<Contact>)>>,
}

impl RecordingResolveListener {
    pub fn handle(self: &Rc<Self>) -> Rc<dyn ResolveListener> {
        self.clone()
    }

    pub fn last(&self) -> Option<(String, String, Option<Contact>)> {
        self.resolved.borrow().last().cloned()
    }

    pub fn call_count(&self) -> usize {
        self.resolved.borrow().len()
    }
}

impl ResolveListener for RecordingResolveListener {
    fn address_resolved(&self, first: &str, second: &str, contact: Option<&Contact>) {
        self.resolved
            .borrow_mut()
            .push((first.to_string(), second.to_string(), contact.cloned()));
    }
}

#[derive(Default)]
pub struct RecordingChangeListener {
    pub updated: RefCell<Vec<Contact>>,
    pub removed: RefCell<Vec<ContactId>>,
}

impl RecordingChangeListener {
    pub fn handle(self: &Rc<Self>) -> Rc<dyn ChangeListener> {
        self.clone()
    }
}

impl ChangeListener for RecordingChangeListener {
    fn item_updated(&self, contact: &Contact) {
        self.updated.borrow_mut().push(contact.clone());
    }

    fn item_about_to_be_removed(&self, contact: &Contact) {
        self.removed.borrow_mut().push(contact.id);
    }
}

#[derive(Default)]
pub struct RecordingGroupListener {
    pub updates: RefCell<Vec<HashMap<String, HashSet<InternalId>>>>,
}

impl RecordingGroupListener {
    pub fn handle(self: &Rc<Self>) -> Rc<dyn NameGroupListener> {
        self.clone()
    }
}

impl NameGroupListener for RecordingGroupListener {
    fn name_groups_updated(&self, changed: &HashMap<String, HashSet<InternalId>>) {
        self.updates.borrow_mut().push(changed.clone());
    }
}

#[derive(Default)]
pub struct RecordingItemListener {
    pub updates: RefCell<Vec<Contact>>,
    pub constituents: RefCell<Vec<Vec<ContactId>>>,
    pub candidates: RefCell<Vec<Vec<ContactId>>>,
    pub aggregations_completed: RefCell<usize>,
}

impl RecordingItemListener {
    pub fn handle(self: &Rc<Self>) -> Rc<dyn ItemListener> {
        self.clone()
    }
}

impl ItemListener for RecordingItemListener {
    fn item_updated(&self, contact: &Contact) {
        self.updates.borrow_mut().push(contact.clone());
    }

    fn constituents_fetched(&self, ids: &[ContactId]) {
        self.constituents.borrow_mut().push(ids.to_vec());
    }

    fn merge_candidates_fetched(&self, ids: &[ContactId]) {
        self.candidates.borrow_mut().push(ids.to_vec());
    }

    fn aggregation_operation_completed(&self) {
        *self.aggregations_completed.borrow_mut() += 1;
    }
}
