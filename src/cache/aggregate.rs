//! Aggregation coordination.
//!
//! Aggregating B into A first fetches both sides' constituent lists; once
//! both are in, the link completes by rewriting the aggregate
//! relationships through the sequencer's relationship queues. A `Local`
//! constituent can sit under only one aggregate, so when both sides own
//! one, B's is demoted to `WasLocal` and restored on disaggregation.

use tracing::debug;

use crate::contact::{internal_id, ContactId, SyncTarget};
use crate::store::{ContactStore, Relationship};

use super::ContactCache;

/// A pending aggregate-contacts operation, waiting for both sides'
/// constituent fetches.
pub(crate) struct ContactLinkRequest {
    pub(crate) first: ContactId,
    pub(crate) second: ContactId,
    pub(crate) first_constituents: Option<Vec<ContactId>>,
    pub(crate) second_constituents: Option<Vec<ContactId>>,
}

impl<S: ContactStore> ContactCache<S> {
    /// Merge the logical contact `second` into `first`. Completion is
    /// reported through `first`'s item listeners. Returns whether the
    /// operation was queued.
    pub fn aggregate_contacts(&mut self, first: ContactId, second: ContactId) -> bool {
        if !Self::valid_pair(first, second) {
            debug!("rejecting aggregation of invalid contact pair");
            return false;
        }
        self.pending_links.push(ContactLinkRequest {
            first,
            second,
            first_constituents: None,
            second_constituents: None,
        });
        self.fetch_constituents(first);
        self.fetch_constituents(second);
        true
    }

    /// Detach constituent `second` from aggregate `first`: drop the
    /// aggregate relationship, record an explicit exclusion, and restore
    /// a previously-demoted constituent to `Local`.
    pub fn disaggregate_contacts(&mut self, first: ContactId, second: ContactId) -> bool {
        if !Self::valid_pair(first, second) {
            debug!("rejecting disaggregation of invalid contact pair");
            return false;
        }

        self.relationships_to_remove
            .push(Relationship::aggregates(first, second));
        self.relationships_to_save
            .push(Relationship::is_not(first, second));

        if let Some(item) = self.items.get_mut(&internal_id(second)) {
            if item.contact.sync_target == SyncTarget::WasLocal {
                item.contact.sync_target = SyncTarget::Local;
                self.contacts_to_save.push(item.contact.clone());
            }
        }

        self.aggregated_ids.push(first);
        self.request_update();
        true
    }

    // -- sequencer integration -----------------------------------------

    /// A relationship query finished: record the aggregate's constituent
    /// ids and queue a fetch of their records.
    pub(crate) fn constituents_fetched(&mut self, owner: ContactId, ids: Vec<ContactId>) {
        for link in &mut self.pending_links {
            if link.first == owner {
                link.first_constituents = Some(ids.clone());
            }
            if link.second == owner {
                link.second_constituents = Some(ids.clone());
            }
        }
        self.constituent_ids_to_fetch.push((owner, ids));
        self.request_update();
    }

    /// The constituent records are cached: report them to the aggregate's
    /// listeners and complete any link requests that now have both sides.
    pub(crate) fn constituent_records_fetched(&mut self, owner: ContactId, ids: Vec<ContactId>) {
        if let Some(item) = self.items.get(&internal_id(owner)) {
            let snapshot = item.listeners.snapshot();
            for listener in snapshot {
                listener.constituents_fetched(&ids);
            }
        }

        let mut ready = Vec::new();
        let mut i = 0;
        while i < self.pending_links.len() {
            let link = &self.pending_links[i];
            if link.first_constituents.is_some() && link.second_constituents.is_some() {
                ready.push(self.pending_links.remove(i));
            } else {
                i += 1;
            }
        }
        for link in ready {
            self.complete_contact_aggregation(link);
        }
    }

    fn complete_contact_aggregation(&mut self, link: ContactLinkRequest) {
        let first_constituents = link.first_constituents.unwrap_or_default();
        let second_constituents = link.second_constituents.unwrap_or_default();

        // At most one side may keep a Local constituent under the merged
        // aggregate; the incorporated side's is demoted and saved
        let first_has_local = self.has_local_constituent(&first_constituents);
        if first_has_local {
            if let Some(local) = self.local_constituent(&second_constituents) {
                if let Some(item) = self.items.get_mut(&internal_id(local)) {
                    item.contact.sync_target = SyncTarget::WasLocal;
                    self.contacts_to_save.push(item.contact.clone());
                }
            }
        }

        for constituent in &second_constituents {
            self.relationships_to_save
                .push(Relationship::aggregates(link.first, *constituent));
            self.relationships_to_remove
                .push(Relationship::aggregates(link.second, *constituent));
        }

        self.aggregated_ids.push(link.first);
        self.request_update();
    }

    fn has_local_constituent(&self, ids: &[ContactId]) -> bool {
        self.local_constituent(ids).is_some()
    }

    fn local_constituent(&self, ids: &[ContactId]) -> Option<ContactId> {
        ids.iter()
            .find(|id| {
                self.items
                    .get(&internal_id(**id))
                    .map(|item| item.contact.sync_target == SyncTarget::Local)
                    .unwrap_or(false)
            })
            .copied()
    }

    /// A relationship save or remove completed. Once both queues have
    /// drained, report completion to the aggregates that were waiting and
    /// refresh view membership.
    pub(crate) fn relationship_writes_finished(&mut self) {
        use crate::store::RequestKind;

        let drained = self.relationships_to_save.is_empty()
            && self.relationships_to_remove.is_empty()
            && !self.active.contains(&RequestKind::RelationshipSave)
            && !self.active.contains(&RequestKind::RelationshipRemove);
        if !drained {
            return;
        }

        let waiting = std::mem::take(&mut self.aggregated_ids);
        if waiting.is_empty() {
            return;
        }
        for id in waiting {
            if let Some(item) = self.items.get(&internal_id(id)) {
                for listener in item.listeners.snapshot() {
                    listener.aggregation_operation_completed();
                }
            }
            // The rewritten aggregate's own record has changed too
            if !self.changed_contacts.contains(&id) {
                self.changed_contacts.push(id);
            }
        }
        self.mark_all_views_for_refresh();
        self.request_update();
    }

    /// Merge-candidate ids arrived for a contact.
    pub(crate) fn notify_merge_candidates(&mut self, id: ContactId, ids: Vec<ContactId>) {
        if let Some(item) = self.items.get(&internal_id(id)) {
            for listener in item.listeners.snapshot() {
                listener.merge_candidates_fetched(&ids);
            }
        }
    }
}
