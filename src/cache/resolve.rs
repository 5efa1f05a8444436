//! Address resolution.
//!
//! `resolve_*` answers synchronously from the address index when it can.
//! Otherwise a single-address store query is queued; its unique match (or
//! best phone match) is reported through the listener. A definitive miss
//! still notifies the listener, and the request is then parked as an
//! unknown address: if a later contact update introduces a matching
//! address key, the original listener is notified retroactively.

use std::collections::HashMap;
use std::rc::Rc;

use crate::contact::{api_id, Contact, InternalId};
use crate::index::{AddressKey, IndexingOutcome};
use crate::observer::ResolveListener;
use crate::phone::{
    best_number_match_length, minimize_phone_number, normalize_phone_number, EXACT_MATCH,
};
use crate::store::{fetch_data, ContactStore, FetchHint, QueryFilter, StoreRequest};

use super::{CacheItem, ContactCache};

/// The address a resolve request is keyed by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ResolveKey {
    PhoneNumber(String),
    EmailAddress(String),
    OnlineAccount { path: String, uri: String },
}

/// An outstanding or parked resolve request, owned by the cache so an
/// unregistering listener can have it purged.
pub(crate) struct ResolveData {
    pub(crate) key: ResolveKey,
    pub(crate) require_complete: bool,
    pub(crate) listener: Rc<dyn ResolveListener>,
}

impl ResolveData {
    /// Deliver the definitive answer. The (first, second) address pair is
    /// (empty, number) for phone, (address, empty) for email and
    /// (path, uri) for account lookups.
    pub(crate) fn notify(&self, contact: Option<&Contact>) {
        let (first, second) = match &self.key {
            ResolveKey::PhoneNumber(number) => (String::new(), number.clone()),
            ResolveKey::EmailAddress(address) => (address.clone(), String::new()),
            ResolveKey::OnlineAccount { path, uri } => (path.clone(), uri.clone()),
        };
        self.listener.address_resolved(&first, &second, contact);
    }

    /// Whether a freshly-indexed address key satisfies this request.
    fn matches(&self, added: &AddressKey) -> bool {
        match (&self.key, added) {
            (ResolveKey::PhoneNumber(number), AddressKey::Phone(full)) => {
                match (minimize_phone_number(number), minimize_phone_number(full)) {
                    (Some(lhs), Some(rhs)) => lhs == rhs,
                    _ => false,
                }
            }
            (ResolveKey::EmailAddress(address), AddressKey::Email(key)) => {
                address.eq_ignore_ascii_case(key)
            }
            (
                ResolveKey::OnlineAccount { path, uri },
                AddressKey::OnlineAccount {
                    path: added_path,
                    uri: added_uri,
                },
            ) => path == added_path && uri.eq_ignore_ascii_case(added_uri),
            _ => false,
        }
    }
}

impl<S: ContactStore> ContactCache<S> {
    // -- synchronous lookups -------------------------------------------

    /// Cached contact whose number best matches `number`, if any.
    pub fn item_by_phone_number(
        &mut self,
        number: &str,
        require_complete: bool,
    ) -> Option<&CacheItem> {
        let iid = self.best_phone_candidate(number)?;
        if require_complete {
            self.ensure_completion(api_id(iid));
        }
        self.items.get(&iid)
    }

    pub fn item_by_email_address(
        &mut self,
        address: &str,
        require_complete: bool,
    ) -> Option<&CacheItem> {
        let iid = self.index.email_id(address)?;
        if require_complete {
            self.ensure_completion(api_id(iid));
        }
        self.items.get(&iid)
    }

    pub fn item_by_online_account(
        &mut self,
        account_path: &str,
        account_uri: &str,
        require_complete: bool,
    ) -> Option<&CacheItem> {
        let iid = self.index.account_id(account_path, account_uri)?;
        if require_complete {
            self.ensure_completion(api_id(iid));
        }
        self.items.get(&iid)
    }

    // -- asynchronous resolution ---------------------------------------

    /// Resolve a number: a cache hit is returned directly, otherwise a
    /// store lookup is queued and the listener answered later.
    pub fn resolve_phone_number(
        &mut self,
        listener: &Rc<dyn ResolveListener>,
        number: &str,
        require_complete: bool,
    ) -> Option<&CacheItem> {
        let key = ResolveKey::PhoneNumber(
            normalize_phone_number(number).unwrap_or_else(|| number.to_string()),
        );
        if self.best_phone_candidate(number).is_some() {
            return self.item_by_phone_number(number, require_complete);
        }
        self.queue_resolve(key, require_complete, listener);
        None
    }

    pub fn resolve_email_address(
        &mut self,
        listener: &Rc<dyn ResolveListener>,
        address: &str,
        require_complete: bool,
    ) -> Option<&CacheItem> {
        if self.index.email_id(address).is_some() {
            return self.item_by_email_address(address, require_complete);
        }
        self.queue_resolve(
            ResolveKey::EmailAddress(address.to_string()),
            require_complete,
            listener,
        );
        None
    }

    pub fn resolve_online_account(
        &mut self,
        listener: &Rc<dyn ResolveListener>,
        account_path: &str,
        account_uri: &str,
        require_complete: bool,
    ) -> Option<&CacheItem> {
        if self.index.account_id(account_path, account_uri).is_some() {
            return self.item_by_online_account(account_path, account_uri, require_complete);
        }
        self.queue_resolve(
            ResolveKey::OnlineAccount {
                path: account_path.to_string(),
                uri: account_uri.to_string(),
            },
            require_complete,
            listener,
        );
        None
    }

    fn queue_resolve(
        &mut self,
        key: ResolveKey,
        require_complete: bool,
        listener: &Rc<dyn ResolveListener>,
    ) {
        self.resolve_addresses.push_back(ResolveData {
            key,
            require_complete,
            listener: Rc::clone(listener),
        });
        self.request_update();
    }

    // -- sequencer integration -----------------------------------------

    pub(crate) fn resolve_fetch_request(&self, data: &ResolveData) -> StoreRequest {
        let filter = match &data.key {
            ResolveKey::PhoneNumber(number) => QueryFilter::PhoneMatch(number.clone()),
            ResolveKey::EmailAddress(address) => QueryFilter::Email(address.clone()),
            ResolveKey::OnlineAccount { path, uri } => QueryFilter::OnlineAccount {
                account_path: Some(path.clone()),
                account_uri: uri.clone(),
            },
        };
        StoreRequest::FetchContacts {
            filter,
            sort: Vec::new(),
            hint: self.resolve_covered_hint(&data.key),
        }
    }

    fn resolve_covered_hint(&self, key: &ResolveKey) -> FetchHint {
        let required = self.config.required_fetch_data;
        let address_data = match key {
            ResolveKey::PhoneNumber(_) => fetch_data::PHONE_NUMBER,
            ResolveKey::EmailAddress(_) => fetch_data::EMAIL_ADDRESS,
            ResolveKey::OnlineAccount { .. } => fetch_data::ACCOUNT_URI,
        };
        FetchHint::basic(required | address_data)
    }

    /// The resolve query finished: merge its results, pick the match and
    /// answer the listener. A miss parks the request for retroactive
    /// resolution.
    pub(crate) fn complete_resolve(&mut self, data: ResolveData, results: Vec<Contact>) {
        let covered = self.resolve_covered_hint(&data.key);
        let mut group_changes = HashMap::new();
        for contact in results {
            self.update_cache(contact, &covered, false, &mut group_changes);
        }
        self.notify_name_group_changes(group_changes);

        let matched = match &data.key {
            ResolveKey::PhoneNumber(number) => self.best_phone_candidate(number),
            ResolveKey::EmailAddress(address) => self.index.email_id(address),
            ResolveKey::OnlineAccount { path, uri } => self.index.account_id(path, uri),
        };

        match matched {
            Some(iid) => {
                if data.require_complete {
                    self.ensure_completion(api_id(iid));
                }
                if let Some(item) = self.items.get(&iid) {
                    let snapshot = item.contact.clone();
                    data.notify(Some(&snapshot));
                }
            }
            None => {
                data.notify(None);
                self.unknown_addresses.push(data);
            }
        }
    }

    /// Retry parked unknown-address requests against addresses that just
    /// entered the index for contact `iid`.
    pub(crate) fn resolve_new_addresses(&mut self, outcome: &IndexingOutcome, iid: InternalId) {
        if outcome.added.is_empty() || self.unknown_addresses.is_empty() {
            return;
        }

        let mut i = 0;
        while i < self.unknown_addresses.len() {
            let satisfied = outcome
                .added
                .iter()
                .any(|key| self.unknown_addresses[i].matches(key));
            if !satisfied {
                i += 1;
                continue;
            }
            let data = self.unknown_addresses.remove(i);
            if data.require_complete {
                self.ensure_completion(api_id(iid));
            }
            if let Some(item) = self.items.get(&iid) {
                let snapshot = item.contact.clone();
                data.notify(Some(&snapshot));
            }
        }
    }

    /// Best-matching cached contact for a number, probing the index keys
    /// by policy and ranking candidates with the backward match. An exact
    /// match short-circuits; ties keep the first candidate found.
    pub(crate) fn best_phone_candidate(&self, number: &str) -> Option<InternalId> {
        let normalized = normalize_phone_number(number)?;
        let mut best: Option<(usize, InternalId)> = None;

        for key in self.index.phone_lookup_keys(number) {
            for &iid in self.index.phone_candidates(&key) {
                let Some(item) = self.items.get(&iid) else {
                    continue;
                };
                let length = best_number_match_length(
                    item.contact.phone_numbers.iter().map(|p| p.number.as_str()),
                    &normalized,
                );
                if length >= EXACT_MATCH {
                    return Some(iid);
                }
                if length > 0 && best.map_or(true, |(b, _)| length > b) {
                    best = Some((length, iid));
                }
            }
        }

        best.map(|(_, iid)| iid)
    }
}
