//! Request sequencing.
//!
//! The sequencer is a fixed-priority dispatcher with one store operation
//! of each kind in flight at a time. Every wake-up evaluates the ordered
//! category list in [`DISPATCH_ORDER`] and starts the first ready one;
//! completion handlers re-wake the sequencer, so every enqueued request
//! is eventually dispatched. The order is a correctness requirement:
//! relationship writes must be durable before dependent contact saves,
//! and population must precede general list queries.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::contact::{api_id, internal_id, Contact, ContactId};
use crate::store::{
    ContactStore, FetchHint, QueryFilter, RelationshipType, RequestKind, SortSpec, StoreEvent,
    StoreRequest,
};

use super::resolve::ResolveData;
use super::update::{ResultBatch, ResultOrigin};
use super::{ContactCache, ContactState, FilterType, POPULATED_FILTERS};

/// Most ids per batched refetch, respecting store query parameter limits.
pub(crate) const MAX_BATCH_IDS: usize = 200;

/// Debounce window opened by the first change notification.
const POSTPONEMENT: Duration = Duration::from_millis(500);
/// Window extension applied by further notifications while postponed.
const POSTPONEMENT_EXTENSION: Duration = Duration::from_millis(250);
/// Hard ceiling on total postponement from the first notification.
const MAX_POSTPONEMENT: Duration = Duration::from_millis(5000);

/// Coalesces bursts of change notifications before refetching.
#[derive(Debug, Default)]
pub(crate) struct Debounce {
    postponed_until: Option<Instant>,
    postponed_since: Option<Instant>,
}

impl Debounce {
    pub(crate) fn postpone(&mut self, now: Instant) {
        let since = *self.postponed_since.get_or_insert(now);
        let window = if self.postponed_until.is_some() {
            POSTPONEMENT_EXTENSION
        } else {
            POSTPONEMENT
        };
        let ceiling = since + MAX_POSTPONEMENT;
        self.postponed_until = Some((now + window).min(ceiling));
    }

    /// Expire the window if `now` has reached it. Returns whether it
    /// fired.
    pub(crate) fn poll(&mut self, now: Instant) -> bool {
        match self.postponed_until {
            Some(deadline) if now >= deadline => {
                self.postponed_until = None;
                self.postponed_since = None;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn active(&self) -> bool {
        self.postponed_until.is_some()
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.postponed_until
    }
}

/// Population phases. The refetch arm re-runs the favorites and metadata
/// queries when the fetch projection widens after first population.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PopulateProgress {
    Unpopulated,
    FetchFavorites,
    FetchMetadata,
    FetchOnline,
    Populated,
    RefetchFavorites,
    RefetchOthers,
}

/// What the in-flight contact fetch is for.
pub(crate) enum FetchPurpose {
    /// A population or refetch phase feeding the given view.
    Populate(FilterType),
    /// Batched refetch of changed or presence-changed ids.
    RefetchIds { presence_only: bool },
    /// A single-address resolution query, buffering its results.
    Resolve {
        data: ResolveData,
        results: Vec<Contact>,
    },
    /// Resolve whose listener unregistered; results are discarded.
    AbandonedResolve,
}

pub(crate) enum IdFetchPurpose {
    ViewRefresh(FilterType),
    MergeCandidates(ContactId),
}

pub(crate) enum ByIdPurpose {
    /// Constituent records of an aggregate: (aggregate, fetched ids).
    Constituents(ContactId, Vec<ContactId>),
}

/// Sequencer categories in strict priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkCategory {
    RelationshipWrites,
    ContactRemovals,
    ContactWrites,
    ConstituentRecordFetch,
    ConstituentQuery,
    CandidateQuery,
    Population,
    RequiredRefetch,
    ChangedContacts,
    PresenceChanges,
    ApplyResults,
    AddressResolution,
    ViewRefresh,
}

pub(crate) const DISPATCH_ORDER: [WorkCategory; 13] = [
    WorkCategory::RelationshipWrites,
    WorkCategory::ContactRemovals,
    WorkCategory::ContactWrites,
    WorkCategory::ConstituentRecordFetch,
    WorkCategory::ConstituentQuery,
    WorkCategory::CandidateQuery,
    WorkCategory::Population,
    WorkCategory::RequiredRefetch,
    WorkCategory::ChangedContacts,
    WorkCategory::PresenceChanges,
    WorkCategory::ApplyResults,
    WorkCategory::AddressResolution,
    WorkCategory::ViewRefresh,
];

impl<S: ContactStore> ContactCache<S> {
    fn active(&self, kind: RequestKind) -> bool {
        self.active.contains(&kind)
    }

    /// Whether a category has work it could start right now.
    pub(crate) fn category_ready(&self, category: WorkCategory) -> bool {
        match category {
            WorkCategory::RelationshipWrites => {
                (!self.relationships_to_save.is_empty()
                    && !self.active(RequestKind::RelationshipSave))
                    || (!self.relationships_to_remove.is_empty()
                        && !self.active(RequestKind::RelationshipRemove))
            }
            WorkCategory::ContactRemovals => {
                !self.contacts_to_remove.is_empty() && !self.active(RequestKind::Remove)
            }
            WorkCategory::ContactWrites => {
                (!self.contacts_to_create.is_empty() || !self.contacts_to_save.is_empty())
                    && !self.active(RequestKind::Save)
            }
            WorkCategory::ConstituentRecordFetch => {
                !self.constituent_ids_to_fetch.is_empty() && !self.active(RequestKind::FetchById)
            }
            WorkCategory::ConstituentQuery => {
                !self.contacts_to_fetch_constituents.is_empty()
                    && !self.active(RequestKind::RelationshipFetch)
            }
            WorkCategory::CandidateQuery => {
                !self.contacts_to_fetch_candidates.is_empty()
                    && !self.active(RequestKind::IdFetch)
            }
            WorkCategory::Population => {
                self.populate_progress == PopulateProgress::Unpopulated
                    && self.keep_populated
                    && !self.active(RequestKind::Fetch)
            }
            WorkCategory::RequiredRefetch => {
                self.refetch_required && !self.active(RequestKind::Fetch)
            }
            WorkCategory::ChangedContacts => {
                !self.changed_contacts.is_empty()
                    && !self.active(RequestKind::Fetch)
                    && !self.debounce.active()
            }
            WorkCategory::PresenceChanges => {
                !self.presence_changed_contacts.is_empty()
                    && !self.active(RequestKind::Fetch)
                    && !self.debounce.active()
            }
            WorkCategory::ApplyResults => !self.pending_results.is_empty(),
            WorkCategory::AddressResolution => {
                !self.resolve_addresses.is_empty() && !self.active(RequestKind::Fetch)
            }
            WorkCategory::ViewRefresh => {
                self.populate_progress == PopulateProgress::Populated
                    && !self.active(RequestKind::IdFetch)
                    && POPULATED_FILTERS
                        .iter()
                        .any(|filter| self.view(*filter).refresh_required)
            }
        }
    }

    /// First ready category by priority.
    pub(crate) fn next_ready_category(&self) -> Option<WorkCategory> {
        DISPATCH_ORDER
            .into_iter()
            .find(|category| self.category_ready(*category))
    }

    /// One sequencer cycle: start the highest-priority ready category, or
    /// run quiescent maintenance when nothing is pending or in flight.
    pub(crate) fn dispatch(&mut self) {
        match self.next_ready_category() {
            Some(category) => {
                debug!(?category, "dispatching");
                self.start_category(category);
                // A lower-priority category may also be startable now
                if self.next_ready_category().is_some() {
                    self.request_update();
                }
            }
            None => {
                if self.active.is_empty() {
                    self.perform_quiescent_maintenance();
                }
            }
        }
    }

    fn start_category(&mut self, category: WorkCategory) {
        match category {
            WorkCategory::RelationshipWrites => {
                if !self.relationships_to_save.is_empty()
                    && !self.active(RequestKind::RelationshipSave)
                {
                    let relationships = std::mem::take(&mut self.relationships_to_save);
                    self.begin_request(StoreRequest::SaveRelationships { relationships });
                }
                if !self.relationships_to_remove.is_empty()
                    && !self.active(RequestKind::RelationshipRemove)
                {
                    let relationships = std::mem::take(&mut self.relationships_to_remove);
                    self.begin_request(StoreRequest::RemoveRelationships { relationships });
                }
            }
            WorkCategory::ContactRemovals => {
                let ids = std::mem::take(&mut self.contacts_to_remove);
                self.begin_request(StoreRequest::RemoveContacts { ids });
            }
            WorkCategory::ContactWrites => {
                let mut contacts = std::mem::take(&mut self.contacts_to_create);
                contacts.append(&mut self.contacts_to_save);
                self.begin_request(StoreRequest::SaveContacts { contacts });
            }
            WorkCategory::ConstituentRecordFetch => {
                let (aggregate, ids) = self.constituent_ids_to_fetch.remove(0);
                self.by_id_purpose = Some(ByIdPurpose::Constituents(aggregate, ids.clone()));
                self.begin_request(StoreRequest::FetchContactsById {
                    ids,
                    hint: FetchHint::full(),
                });
            }
            WorkCategory::ConstituentQuery => {
                let contact = self.contacts_to_fetch_constituents.remove(0);
                self.relationship_fetch_contact = Some(contact);
                self.begin_request(StoreRequest::FetchRelationships { contact });
            }
            WorkCategory::CandidateQuery => {
                let id = self.contacts_to_fetch_candidates.remove(0);
                let subject = self
                    .existing_item(id)
                    .map(|item| item.contact.clone())
                    .unwrap_or_else(|| Contact::new(id));
                self.id_fetch_purpose = Some(IdFetchPurpose::MergeCandidates(id));
                self.begin_request(StoreRequest::FetchContactIds {
                    filter: QueryFilter::MergeCandidates(Box::new(subject)),
                    sort: Vec::new(),
                });
            }
            WorkCategory::Population => {
                self.populate_progress = PopulateProgress::FetchFavorites;
                self.begin_populate_phase(FilterType::Favorites);
            }
            WorkCategory::RequiredRefetch => {
                self.refetch_required = false;
                self.populate_progress = PopulateProgress::RefetchFavorites;
                self.begin_populate_phase(FilterType::Favorites);
            }
            WorkCategory::ChangedContacts => {
                let ids = take_batch(&mut self.changed_contacts);
                self.fetch_purpose = Some(FetchPurpose::RefetchIds {
                    presence_only: false,
                });
                self.begin_request(StoreRequest::FetchContacts {
                    filter: QueryFilter::Ids(ids),
                    sort: Vec::new(),
                    hint: FetchHint::full(),
                });
            }
            WorkCategory::PresenceChanges => {
                let ids = take_batch(&mut self.presence_changed_contacts);
                self.fetch_purpose = Some(FetchPurpose::RefetchIds {
                    presence_only: true,
                });
                self.begin_request(StoreRequest::FetchContacts {
                    filter: QueryFilter::Ids(ids),
                    sort: Vec::new(),
                    hint: FetchHint::presence(),
                });
            }
            WorkCategory::ApplyResults => {
                self.apply_pending_results();
            }
            WorkCategory::AddressResolution => {
                if let Some(data) = self.resolve_addresses.pop_front() {
                    let request = self.resolve_fetch_request(&data);
                    self.fetch_purpose = Some(FetchPurpose::Resolve {
                        data,
                        results: Vec::new(),
                    });
                    self.begin_request(request);
                }
            }
            WorkCategory::ViewRefresh => {
                let Some(filter) = POPULATED_FILTERS
                    .into_iter()
                    .find(|filter| self.view(*filter).refresh_required)
                else {
                    return;
                };
                let view = self.view_mut(filter);
                view.refresh_required = false;
                view.cache_index = 0;
                view.query_index = 0;
                view.query_ids.clear();
                self.id_fetch_purpose = Some(IdFetchPurpose::ViewRefresh(filter));
                let request = StoreRequest::FetchContactIds {
                    filter: view_query_filter(filter),
                    sort: self.view_sort(),
                };
                self.begin_request(request);
            }
        }
    }

    fn begin_populate_phase(&mut self, filter: FilterType) {
        let required = self.config.required_fetch_data;
        let (query_filter, hint) = match filter {
            FilterType::Favorites => (view_query_filter(filter), FetchHint::basic(required)),
            FilterType::All => (view_query_filter(filter), FetchHint::metadata(required)),
            FilterType::Online => (view_query_filter(filter), FetchHint::presence()),
            FilterType::None => return,
        };
        self.fetch_purpose = Some(FetchPurpose::Populate(filter));
        self.begin_request(StoreRequest::FetchContacts {
            filter: query_filter,
            sort: self.view_sort(),
            hint,
        });
    }

    /// Projection of the currently-running population or refetch phase.
    fn populate_phase_hint(&self) -> FetchHint {
        let required = self.config.required_fetch_data;
        match self.populate_progress {
            PopulateProgress::FetchFavorites | PopulateProgress::RefetchFavorites => {
                FetchHint::basic(required)
            }
            PopulateProgress::FetchMetadata | PopulateProgress::RefetchOthers => {
                FetchHint::metadata(required)
            }
            PopulateProgress::FetchOnline => FetchHint::presence(),
            _ => FetchHint::full(),
        }
    }

    pub(crate) fn view_sort(&self) -> Vec<SortSpec> {
        vec![SortSpec {
            property: self.config.sort_property,
        }]
    }

    fn begin_request(&mut self, request: StoreRequest) {
        let kind = request.kind();
        match self.store.begin(request) {
            Ok(()) => {
                self.active.insert(kind);
            }
            Err(err) => {
                warn!(?kind, error = %err, "store request failed to start; dropping");
                self.clear_request_context(kind);
            }
        }
    }

    fn clear_request_context(&mut self, kind: RequestKind) {
        match kind {
            RequestKind::Fetch => match self.fetch_purpose.take() {
                Some(FetchPurpose::Resolve { data, .. }) => {
                    // The listener still gets its definitive answer
                    data.notify(None);
                }
                Some(FetchPurpose::Populate(_)) => {
                    // A failed phase still advances; the remaining phases
                    // and view refreshes must not starve behind it
                    self.advance_population();
                }
                _ => {}
            },
            RequestKind::IdFetch => {
                self.id_fetch_purpose = None;
                self.fetched_ids.clear();
            }
            RequestKind::FetchById => {
                self.by_id_purpose = None;
            }
            RequestKind::RelationshipFetch => {
                self.relationship_fetch_contact = None;
                self.fetched_relationships.clear();
            }
            _ => {}
        }
    }

    // -- event handling ------------------------------------------------

    pub(crate) fn handle_store_event(&mut self, event: StoreEvent) {
        match event {
            StoreEvent::ContactsAvailable { kind, contacts } => {
                self.contacts_available(kind, contacts);
            }
            StoreEvent::ContactIdsAvailable { ids } => match &self.id_fetch_purpose {
                Some(IdFetchPurpose::ViewRefresh(filter)) => {
                    let filter = *filter;
                    self.view_sync_chunk(filter, ids);
                }
                Some(IdFetchPurpose::MergeCandidates(_)) => {
                    self.fetched_ids.extend(ids);
                }
                None => debug!("discarding id results with no id fetch active"),
            },
            StoreEvent::RelationshipsAvailable { relationships } => {
                self.fetched_relationships.extend(relationships);
            }
            StoreEvent::RequestFinished { kind, error } => {
                self.active.remove(&kind);
                match error {
                    Some(message) => {
                        warn!(?kind, %message, "store operation failed");
                        self.clear_request_context(kind);
                    }
                    None => self.request_finished(kind),
                }
                self.request_update();
            }
            StoreEvent::ContactsAdded { ids } | StoreEvent::ContactsChanged { ids } => {
                for id in ids {
                    if !self.changed_contacts.contains(&id) {
                        self.changed_contacts.push(id);
                    }
                }
                self.mark_all_views_for_refresh();
                self.debounce.postpone(Instant::now());
                self.request_update();
            }
            StoreEvent::ContactsPresenceChanged { ids } => {
                for id in ids {
                    if !self.presence_changed_contacts.contains(&id) {
                        self.presence_changed_contacts.push(id);
                    }
                }
                // Presence moves contacts in and out of the online view
                self.view_mut(FilterType::Online).refresh_required = true;
                self.debounce.postpone(Instant::now());
                self.request_update();
            }
            StoreEvent::ContactsRemoved { ids } => {
                self.contacts_removed(ids);
            }
            StoreEvent::DataChanged => {
                // Too coarse to diff; refetch every record ever fetched
                // and re-run population and view refreshes
                self.presence_changed_contacts.clear();
                self.changed_contacts = self
                    .items
                    .iter()
                    .filter(|(_, item)| item.state != ContactState::Absent)
                    .map(|(iid, _)| api_id(*iid))
                    .collect();
                if self.populate_progress == PopulateProgress::Populated {
                    self.populate_progress = PopulateProgress::Unpopulated;
                }
                self.mark_all_views_for_refresh();
                self.request_update();
            }
        }
    }

    fn contacts_available(&mut self, kind: RequestKind, contacts: Vec<Contact>) {
        match kind {
            RequestKind::Fetch => match &mut self.fetch_purpose {
                Some(FetchPurpose::Populate(filter)) => {
                    let origin = match self.populate_progress {
                        PopulateProgress::FetchFavorites
                        | PopulateProgress::FetchMetadata
                        | PopulateProgress::FetchOnline => ResultOrigin::Append(*filter),
                        // Refetch phases only merge into existing records
                        _ => ResultOrigin::Update,
                    };
                    let covered = self.populate_phase_hint();
                    self.pending_results.push_back(ResultBatch {
                        origin,
                        covered,
                        contacts,
                    });
                    self.request_update();
                }
                Some(FetchPurpose::RefetchIds { presence_only }) => {
                    let covered = if *presence_only {
                        FetchHint::presence()
                    } else {
                        FetchHint::full()
                    };
                    self.pending_results.push_back(ResultBatch {
                        origin: ResultOrigin::Update,
                        covered,
                        contacts,
                    });
                    self.request_update();
                }
                Some(FetchPurpose::Resolve { results, .. }) => {
                    results.extend(contacts);
                }
                Some(FetchPurpose::AbandonedResolve) => {}
                None => debug!("discarding contact results with no fetch active"),
            },
            RequestKind::FetchById => {
                self.pending_results.push_back(ResultBatch {
                    origin: ResultOrigin::Update,
                    covered: FetchHint::full(),
                    contacts,
                });
                self.request_update();
            }
            _ => debug!(?kind, "unexpected contact results"),
        }
    }

    fn request_finished(&mut self, kind: RequestKind) {
        match kind {
            RequestKind::Fetch => self.fetch_finished(),
            RequestKind::IdFetch => match self.id_fetch_purpose.take() {
                Some(IdFetchPurpose::ViewRefresh(filter)) => {
                    self.finish_view_sync(filter);
                }
                Some(IdFetchPurpose::MergeCandidates(id)) => {
                    let ids = std::mem::take(&mut self.fetched_ids);
                    self.notify_merge_candidates(id, ids);
                }
                None => {}
            },
            RequestKind::RelationshipFetch => {
                if let Some(owner) = self.relationship_fetch_contact.take() {
                    let relationships = std::mem::take(&mut self.fetched_relationships);
                    let constituents: Vec<ContactId> = relationships
                        .iter()
                        .filter(|rel| {
                            rel.kind == RelationshipType::Aggregates && rel.first == owner
                        })
                        .map(|rel| rel.second)
                        .collect();
                    self.constituents_fetched(owner, constituents);
                }
            }
            RequestKind::FetchById => {
                if let Some(ByIdPurpose::Constituents(owner, ids)) = self.by_id_purpose.take() {
                    self.constituent_records_fetched(owner, ids);
                }
            }
            RequestKind::RelationshipSave | RequestKind::RelationshipRemove => {
                self.relationship_writes_finished();
            }
            RequestKind::Save | RequestKind::Remove => {
                // Effects arrive through the store's change signals
            }
        }
    }

    fn fetch_finished(&mut self) {
        match self.fetch_purpose.take() {
            Some(FetchPurpose::Populate(_)) => self.advance_population(),
            Some(FetchPurpose::Resolve { data, results }) => {
                self.complete_resolve(data, results);
            }
            Some(FetchPurpose::RefetchIds { .. }) | Some(FetchPurpose::AbandonedResolve) => {}
            None => {}
        }
    }

    /// Multi-phase population continues directly from each phase's
    /// completion handler rather than waiting for the next wake-up.
    fn advance_population(&mut self) {
        match self.populate_progress {
            PopulateProgress::FetchFavorites => {
                self.make_populated(FilterType::Favorites);
                self.populate_progress = PopulateProgress::FetchMetadata;
                self.begin_populate_phase(FilterType::All);
            }
            PopulateProgress::FetchMetadata => {
                self.make_populated(FilterType::All);
                self.populate_progress = PopulateProgress::FetchOnline;
                self.begin_populate_phase(FilterType::Online);
            }
            PopulateProgress::FetchOnline => {
                self.make_populated(FilterType::Online);
                self.populate_progress = PopulateProgress::Populated;
            }
            PopulateProgress::RefetchFavorites => {
                self.populate_progress = PopulateProgress::RefetchOthers;
                self.begin_populate_phase(FilterType::All);
            }
            PopulateProgress::RefetchOthers => {
                self.populate_progress = PopulateProgress::Populated;
            }
            PopulateProgress::Unpopulated | PopulateProgress::Populated => {}
        }
    }

    fn contacts_removed(&mut self, ids: Vec<ContactId>) {
        for id in &ids {
            self.changed_contacts.retain(|pending| pending != id);
            self.presence_changed_contacts.retain(|pending| pending != id);
            let iid = internal_id(*id);
            if self.items.contains_key(&iid) && !self.id_in_any_view(iid) {
                *self.expired_contacts.entry(iid).or_insert(0) -= 1;
            }
        }
        self.mark_all_views_for_refresh();
        self.request_update();
    }

    /// Category 14: nothing pending, nothing in flight. Reclaim records
    /// that fell out of every view and clear transient bookkeeping.
    fn perform_quiescent_maintenance(&mut self) {
        let expired = std::mem::take(&mut self.expired_contacts);
        for (iid, count) in expired {
            if count <= 0 && !self.id_in_any_view(iid) && self.items.contains_key(&iid) {
                self.destroy_item(iid);
            }
        }
    }
}

fn take_batch(ids: &mut Vec<ContactId>) -> Vec<ContactId> {
    if ids.len() <= MAX_BATCH_IDS {
        std::mem::take(ids)
    } else {
        ids.drain(..MAX_BATCH_IDS).collect()
    }
}

/// Membership predicate backing each view's queries. Every view is
/// scoped to aggregate contacts.
pub(crate) fn view_query_filter(filter: FilterType) -> QueryFilter {
    match filter {
        FilterType::All | FilterType::None => QueryFilter::Aggregates,
        FilterType::Favorites => {
            QueryFilter::And(vec![QueryFilter::Aggregates, QueryFilter::Favorites])
        }
        FilterType::Online => {
            QueryFilter::And(vec![QueryFilter::Aggregates, QueryFilter::Online])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Instant;

    use crate::cache::{CacheConfig, ContactCache};
    use crate::contact::ContactId;
    use crate::error::Result;
    use crate::store::{event_channel, Relationship, StoreEvent};

    /// Records begun requests without ever completing them on its own.
    struct StubStore {
        begun: Rc<RefCell<Vec<StoreRequest>>>,
    }

    impl ContactStore for StubStore {
        fn begin(&mut self, request: StoreRequest) -> Result<()> {
            self.begun.borrow_mut().push(request);
            Ok(())
        }

        fn self_contact_id(&self) -> ContactId {
            ContactId(1)
        }
    }

    fn stub_cache() -> (ContactCache<StubStore>, Rc<RefCell<Vec<StoreRequest>>>) {
        let begun = Rc::new(RefCell::new(Vec::new()));
        let (sink, receiver) = event_channel();
        let store = StubStore {
            begun: begun.clone(),
        };
        let cache = ContactCache::new(store, sink, receiver, CacheConfig::default());
        (cache, begun)
    }

    #[test]
    fn test_debounce_window_extends_up_to_ceiling() {
        let mut debounce = Debounce::default();
        let start = Instant::now();

        debounce.postpone(start);
        assert!(debounce.active());
        assert!(!debounce.poll(start + Duration::from_millis(499)));
        assert!(debounce.poll(start + Duration::from_millis(500)));
        assert!(!debounce.active());

        // Continuous notifications cannot postpone past the ceiling
        debounce.postpone(start);
        let mut now = start;
        for _ in 0..100 {
            now += Duration::from_millis(100);
            debounce.postpone(now);
        }
        assert!(debounce.poll(start + MAX_POSTPONEMENT));
    }

    #[test]
    fn test_relationship_writes_precede_contact_saves() {
        let (mut cache, begun) = stub_cache();
        cache
            .contacts_to_save
            .push(crate::contact::Contact::new(ContactId(5)));
        cache
            .relationships_to_save
            .push(Relationship::aggregates(ContactId(2), ContactId(3)));

        assert_eq!(
            cache.next_ready_category(),
            Some(WorkCategory::RelationshipWrites)
        );
        cache.dispatch();
        assert!(matches!(
            begun.borrow()[0],
            StoreRequest::SaveRelationships { .. }
        ));

        // The save waits until the relationship write completes
        cache.handle_store_event(StoreEvent::RequestFinished {
            kind: RequestKind::RelationshipSave,
            error: None,
        });
        cache.process_events();
        assert!(matches!(
            begun.borrow().last(),
            Some(StoreRequest::SaveContacts { .. })
        ));
    }

    #[test]
    fn test_dispatch_order_is_strict() {
        let (mut cache, _) = stub_cache();
        cache.contacts_to_remove.push(ContactId(4));
        cache.changed_contacts.push(ContactId(9));
        cache.keep_populated = true;

        // Removal outranks population, which outranks changed refetches
        assert_eq!(
            cache.next_ready_category(),
            Some(WorkCategory::ContactRemovals)
        );
        cache.contacts_to_remove.clear();
        assert_eq!(cache.next_ready_category(), Some(WorkCategory::Population));
        cache.populate_progress = PopulateProgress::Populated;
        assert_eq!(
            cache.next_ready_category(),
            Some(WorkCategory::ChangedContacts)
        );
    }

    #[test]
    fn test_debounce_gates_changed_refetch() {
        let (mut cache, _) = stub_cache();
        cache.handle_store_event(StoreEvent::ContactsChanged {
            ids: vec![ContactId(7)],
        });

        assert!(cache.debounce.active());
        assert_eq!(cache.next_ready_category(), None);

        cache.poll_timers(Instant::now() + Duration::from_secs(10));
        assert_eq!(
            cache.next_ready_category(),
            Some(WorkCategory::ChangedContacts)
        );
    }

    #[test]
    fn test_population_phases_run_in_sequence() {
        let (mut cache, begun) = stub_cache();
        cache.keep_populated = true;
        cache.dispatch();

        // Favorites first
        assert!(matches!(
            &begun.borrow()[0],
            StoreRequest::FetchContacts { filter: QueryFilter::And(parts), .. }
                if parts.contains(&QueryFilter::Favorites)
        ));

        cache.handle_store_event(StoreEvent::RequestFinished {
            kind: RequestKind::Fetch,
            error: None,
        });
        assert!(cache.is_populated(FilterType::Favorites));
        assert!(matches!(
            &begun.borrow()[1],
            StoreRequest::FetchContacts { filter: QueryFilter::Aggregates, .. }
        ));

        cache.handle_store_event(StoreEvent::RequestFinished {
            kind: RequestKind::Fetch,
            error: None,
        });
        assert!(cache.is_populated(FilterType::All));

        cache.handle_store_event(StoreEvent::RequestFinished {
            kind: RequestKind::Fetch,
            error: None,
        });
        assert!(cache.is_populated(FilterType::Online));
        assert_eq!(cache.populate_progress, PopulateProgress::Populated);
    }

    #[test]
    fn test_failed_population_phase_still_advances() {
        let (mut cache, begun) = stub_cache();
        cache.keep_populated = true;
        cache.dispatch();

        // The favorites query fails; the metadata phase begins anyway
        cache.handle_store_event(StoreEvent::RequestFinished {
            kind: RequestKind::Fetch,
            error: Some("store offline".to_string()),
        });
        assert!(cache.is_populated(FilterType::Favorites));
        assert!(matches!(
            &begun.borrow()[1],
            StoreRequest::FetchContacts { filter: QueryFilter::Aggregates, .. }
        ));

        cache.handle_store_event(StoreEvent::RequestFinished {
            kind: RequestKind::Fetch,
            error: Some("store offline".to_string()),
        });
        cache.handle_store_event(StoreEvent::RequestFinished {
            kind: RequestKind::Fetch,
            error: None,
        });
        assert!(cache.is_populated(FilterType::All));
        assert!(cache.is_populated(FilterType::Online));
        assert_eq!(cache.populate_progress, PopulateProgress::Populated);
    }

    #[test]
    fn test_changed_ids_batched_to_limit() {
        let (mut cache, begun) = stub_cache();
        cache.populate_progress = PopulateProgress::Populated;
        for i in 0..(MAX_BATCH_IDS as u32 + 50) {
            cache.changed_contacts.push(ContactId(1000 + i));
        }

        cache.dispatch();
        let request = begun.borrow()[0].clone();
        match request {
            StoreRequest::FetchContacts {
                filter: QueryFilter::Ids(ids),
                ..
            } => assert_eq!(ids.len(), MAX_BATCH_IDS),
            other => panic!("unexpected request: {:?}", other),
        }
        // Overflow stays queued for the next cycle
        assert_eq!(cache.changed_contacts.len(), 50);
    }
}
