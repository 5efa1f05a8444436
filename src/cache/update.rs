//! Applying store results to the record table and views.
//!
//! Fetched contacts are queued as [`ResultBatch`]es and merged
//! progressively under a per-cycle budget, so one huge result set cannot
//! starve the event loop. A batch from a population phase also appends
//! its contacts to the phase's view; every other batch only merges.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::contact::{internal_id, Contact, ContactId, DetailKind, InternalId};
use crate::diff::{complete_synchronize_list, synchronize_list, ListMutator};
use crate::name::generate_display_label;
use crate::observer::ListModel;
use crate::store::{ContactStore, FetchHint};

use super::{view_slot, CacheItem, ContactCache, ContactState, FilterType, POPULATED_FILTERS};

/// Contacts merged into the cache per apply cycle before yielding.
const APPLY_BUDGET: usize = 100;

pub(crate) enum ResultOrigin {
    /// Population results: merge and append to the given view.
    Append(FilterType),
    /// Refetch results: merge into existing records only.
    Update,
}

pub(crate) struct ResultBatch {
    pub(crate) origin: ResultOrigin,
    /// The projection the producing fetch ran with; uncovered details are
    /// carried over from the previous snapshot.
    pub(crate) covered: FetchHint,
    pub(crate) contacts: Vec<Contact>,
}

/// Applies range operations to one view's id list, fanning them out to
/// the view's models and maintaining the all-view reference counts.
struct ViewSyncAgent<'a> {
    ids: &'a mut Vec<InternalId>,
    models: Vec<Rc<dyn ListModel>>,
    expired: Option<&'a mut HashMap<InternalId, i32>>,
    self_id: InternalId,
}

impl ListMutator for ViewSyncAgent<'_> {
    type Id = InternalId;

    fn current(&self) -> &[InternalId] {
        self.ids
    }

    fn insert_range(
        &mut self,
        index: usize,
        count: usize,
        source: &[InternalId],
        source_index: usize,
    ) -> usize {
        let mut inserted = 0;
        for offset in 0..count {
            let iid = source[source_index + offset];
            if iid == self.self_id {
                continue;
            }
            self.ids.insert(index + inserted, iid);
            if let Some(expired) = self.expired.as_deref_mut() {
                *expired.entry(iid).or_insert(0) += 1;
            }
            inserted += 1;
        }
        if inserted > 0 {
            for model in &self.models {
                model.items_inserted(index, inserted);
            }
        }
        inserted
    }

    fn remove_range(&mut self, index: usize, count: usize) {
        for iid in self.ids.drain(index..index + count) {
            if let Some(expired) = self.expired.as_deref_mut() {
                *expired.entry(iid).or_insert(0) -= 1;
            }
        }
        for model in &self.models {
            model.items_removed(index, count);
        }
    }
}

impl<S: ContactStore> ContactCache<S> {
    /// Merge queued results under the apply budget; requeue the remainder
    /// and wake the sequencer again if the budget ran out.
    pub(crate) fn apply_pending_results(&mut self) {
        let mut budget = APPLY_BUDGET;
        let mut group_changes: HashMap<String, HashSet<InternalId>> = HashMap::new();

        while budget > 0 {
            let Some(mut batch) = self.pending_results.pop_front() else {
                break;
            };
            let take = budget.min(batch.contacts.len());
            let initial_insert = matches!(batch.origin, ResultOrigin::Append(_));
            let mut applied: Vec<InternalId> = Vec::with_capacity(take);

            for contact in batch.contacts.drain(..take) {
                let iid =
                    self.update_cache(contact, &batch.covered, initial_insert, &mut group_changes);
                applied.push(iid);
            }
            budget -= take;

            if let ResultOrigin::Append(filter) = batch.origin {
                self.append_contacts(filter, &applied);
            }
            if !batch.contacts.is_empty() {
                self.pending_results.push_front(batch);
                break;
            }
        }

        self.notify_name_group_changes(group_changes);
        if !self.pending_results.is_empty() {
            self.request_update();
        }
    }

    /// Merge one fetched snapshot into the record table.
    ///
    /// Completeness moves monotonically: a record covered by a full fetch
    /// becomes `Complete`; a hinted fetch never downgrades it. Display
    /// label, name group and address index entries are recomputed, and
    /// change notifications fire unless this is part of a bulk insert.
    pub(crate) fn update_cache(
        &mut self,
        incoming: Contact,
        covered: &FetchHint,
        initial_insert: bool,
        group_changes: &mut HashMap<String, HashSet<InternalId>>,
    ) -> InternalId {
        let iid = internal_id(incoming.id);
        let full = covered.details.is_empty();

        let old = self.items.get(&iid).map(|item| item.contact.clone());
        let old_state = self
            .items
            .get(&iid)
            .map(|item| item.state)
            .unwrap_or(ContactState::Absent);
        let old_label = self
            .items
            .get(&iid)
            .map(|item| item.display_label.clone())
            .unwrap_or_default();
        let old_group = self
            .items
            .get(&iid)
            .map(|item| item.name_group.clone())
            .unwrap_or_default();

        let merged = match &old {
            Some(previous) if !full => merge_uncovered_details(previous, incoming, covered),
            _ => incoming,
        };

        let fetched_state = if full {
            ContactState::Complete
        } else {
            ContactState::Partial
        };
        let state = old_state.max(fetched_state);

        let display_label = generate_display_label(&merged, self.config.display_label_order);
        let name_group = self.grouper.name_group(&merged, &display_label);

        let outcome = self
            .index
            .update_indexing(old.as_ref(), &merged, iid, None);

        if name_group != old_group {
            if !old_group.is_empty() {
                if let Some(members) = self.name_groups.get_mut(&old_group) {
                    members.remove(&iid);
                    if members.is_empty() {
                        self.name_groups.remove(&old_group);
                    }
                }
                group_changes.entry(old_group).or_default().insert(iid);
            }
            self.name_groups
                .entry(name_group.clone())
                .or_default()
                .insert(iid);
            group_changes
                .entry(name_group.clone())
                .or_default()
                .insert(iid);
        }

        let changed = old
            .as_ref()
            .map(|previous| {
                *previous != merged || old_label != display_label || outcome.modified
            })
            .unwrap_or(false);

        match self.items.get_mut(&iid) {
            Some(item) => {
                item.contact = merged;
                item.state = state;
                item.display_label = display_label;
                item.name_group = name_group;
            }
            None => {
                let mut item = CacheItem::new(merged, state);
                item.display_label = display_label;
                item.name_group = name_group;
                self.items.insert(iid, item);
            }
        }

        self.resolve_new_addresses(&outcome, iid);

        if changed && !initial_insert {
            self.notify_item_changed(iid);
        }

        iid
    }

    fn notify_item_changed(&mut self, iid: InternalId) {
        let Some(item) = self.items.get(&iid) else {
            return;
        };
        let snapshot = item.contact.clone();
        let item_listeners = item.listeners.snapshot();

        for listener in self.change_listeners.snapshot() {
            listener.item_updated(&snapshot);
        }
        for listener in item_listeners {
            listener.item_updated(&snapshot);
        }
        for filter in POPULATED_FILTERS {
            let position = self.view(filter).ids.iter().position(|id| *id == iid);
            if let Some(position) = position {
                for model in self.view(filter).models.snapshot() {
                    model.items_changed(position, 1);
                }
            }
        }
    }

    /// Append population results to a view, excluding the self-contact
    /// and ids the view already holds.
    fn append_contacts(&mut self, filter: FilterType, iids: &[InternalId]) {
        let self_id = self.self_id;
        let is_all = filter == FilterType::All;
        let view = &mut self.views[view_slot(filter)];

        let start = view.ids.len();
        let mut appended = 0;
        for iid in iids {
            if *iid == self_id || view.ids.contains(iid) {
                continue;
            }
            view.ids.push(*iid);
            if is_all {
                *self.expired_contacts.entry(*iid).or_insert(0) += 1;
            }
            appended += 1;
        }

        if appended > 0 {
            for model in view.models.snapshot() {
                model.items_inserted(start, appended);
            }
        }
    }

    pub(crate) fn make_populated(&mut self, filter: FilterType) {
        let view = &mut self.views[view_slot(filter)];
        if view.populated {
            return;
        }
        view.populated = true;
        for model in view.models.snapshot() {
            model.became_populated();
        }
    }

    // -- view refresh synchronization ----------------------------------

    /// Feed one chunk of id-query results into the view's reconciliation.
    pub(crate) fn view_sync_chunk(&mut self, filter: FilterType, ids: Vec<ContactId>) {
        let self_id = self.self_id;
        let is_all = filter == FilterType::All;
        let view = &mut self.views[view_slot(filter)];
        view.query_ids.extend(
            ids.iter()
                .map(|id| internal_id(*id))
                .filter(|iid| *iid != self_id),
        );

        let models = view.models.snapshot();
        let super::View {
            ids,
            query_ids,
            cache_index,
            query_index,
            ..
        } = view;
        let mut agent = ViewSyncAgent {
            ids,
            models,
            expired: is_all.then_some(&mut self.expired_contacts),
            self_id,
        };
        synchronize_list(&mut agent, cache_index, query_ids, query_index);
    }

    /// The id query finished: flush the reconciliation tail and reset the
    /// cursors for the next refresh.
    pub(crate) fn finish_view_sync(&mut self, filter: FilterType) {
        let self_id = self.self_id;
        let is_all = filter == FilterType::All;
        let view = &mut self.views[view_slot(filter)];
        let models = view.models.snapshot();
        let super::View {
            ids,
            query_ids,
            cache_index,
            query_index,
            ..
        } = view;
        let mut agent = ViewSyncAgent {
            ids,
            models,
            expired: is_all.then_some(&mut self.expired_contacts),
            self_id,
        };
        complete_synchronize_list(&mut agent, cache_index, query_ids, query_index);

        query_ids.clear();
        *cache_index = 0;
        *query_index = 0;
    }

    // -- name groups ---------------------------------------------------

    pub(crate) fn notify_name_group_changes(
        &mut self,
        changes: HashMap<String, HashSet<InternalId>>,
    ) {
        if changes.is_empty() {
            return;
        }
        for listener in self.name_group_listeners.snapshot() {
            listener.name_groups_updated(&changes);
        }
    }

    /// Recompute every record's bucket after a grouping config change.
    pub(crate) fn regroup_all(&mut self) {
        let mut changes: HashMap<String, HashSet<InternalId>> = HashMap::new();
        let iids: Vec<InternalId> = self.items.keys().copied().collect();

        for iid in iids {
            let Some(item) = self.items.get(&iid) else {
                continue;
            };
            let group = self.grouper.name_group(&item.contact, &item.display_label);
            let old_group = item.name_group.clone();
            if group == old_group {
                continue;
            }
            if !old_group.is_empty() {
                if let Some(members) = self.name_groups.get_mut(&old_group) {
                    members.remove(&iid);
                    if members.is_empty() {
                        self.name_groups.remove(&old_group);
                    }
                }
                changes.entry(old_group).or_default().insert(iid);
            }
            self.name_groups.entry(group.clone()).or_default().insert(iid);
            changes.entry(group.clone()).or_default().insert(iid);
            if let Some(item) = self.items.get_mut(&iid) {
                item.name_group = group;
            }
        }

        self.notify_name_group_changes(changes);
    }

    // -- record teardown -----------------------------------------------

    /// Evict a fully-expired record: notify listeners, then drop its
    /// index and name-group entries.
    pub(crate) fn destroy_item(&mut self, iid: InternalId) {
        let Some(item) = self.items.remove(&iid) else {
            return;
        };

        for listener in self.change_listeners.snapshot() {
            listener.item_about_to_be_removed(&item.contact);
        }
        for listener in item.listeners.snapshot() {
            listener.item_about_to_be_destroyed(item.contact.id);
        }

        self.index.remove_contact(&item.contact, iid);

        if !item.name_group.is_empty() {
            if let Some(members) = self.name_groups.get_mut(&item.name_group) {
                members.remove(&iid);
                if members.is_empty() {
                    self.name_groups.remove(&item.name_group);
                }
            }
            let mut changes: HashMap<String, HashSet<InternalId>> = HashMap::new();
            changes.entry(item.name_group.clone()).or_default().insert(iid);
            self.notify_name_group_changes(changes);
        }
    }
}

/// Keep the previous snapshot's values for every detail kind the fetch
/// projection did not cover.
fn merge_uncovered_details(old: &Contact, mut new: Contact, covered: &FetchHint) -> Contact {
    if !covered.covers(DetailKind::Name) {
        new.first_name = old.first_name.clone();
        new.last_name = old.last_name.clone();
    }
    if !covered.covers(DetailKind::Nickname) {
        new.nickname = old.nickname.clone();
    }
    if !covered.covers(DetailKind::DisplayLabel) {
        new.backend_label = old.backend_label.clone();
    }
    if !covered.covers(DetailKind::Favorite) {
        new.favorite = old.favorite;
    }
    if !covered.covers(DetailKind::Gender) {
        new.gender = old.gender;
    }
    if !covered.covers(DetailKind::StatusFlags) {
        new.status_flags = old.status_flags;
    }
    if !covered.covers(DetailKind::SyncTarget) {
        new.sync_target = old.sync_target.clone();
    }
    if !covered.covers(DetailKind::Avatar) {
        new.avatars = old.avatars.clone();
    }
    if !covered.covers(DetailKind::GlobalPresence) {
        new.global_presence = old.global_presence.clone();
    }
    if !covered.covers(DetailKind::PhoneNumber) {
        new.phone_numbers = old.phone_numbers.clone();
    }
    if !covered.covers(DetailKind::EmailAddress) {
        new.email_addresses = old.email_addresses.clone();
    }
    if !covered.covers(DetailKind::OnlineAccount) {
        new.online_accounts = old.online_accounts.clone();
    }
    if !covered.covers(DetailKind::Organization) {
        new.organization = old.organization.clone();
    }
    new
}
