//! Address index: phone, email and online-account keys mapped to cached
//! contact ids, maintained incrementally by diffing old and new snapshots.

use std::collections::{HashMap, HashSet};

use crate::contact::{Contact, DetailKind, InternalId};
use crate::phone::{minimize_phone_number, normalize_phone_number};

/// Shape of the keys stored for phone numbers.
///
/// `MinimizedOnly` keeps the index small at the cost of more best-match
/// work per lookup; `FullAndMinimized` additionally indexes the full
/// normalized form so exact-form lookups short-circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PhoneIndexPolicy {
    #[default]
    FullAndMinimized,
    MinimizedOnly,
}

/// An address key that entered the index, reported so parked resolve
/// requests for previously-unknown addresses can be retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressKey {
    /// Full normalized number.
    Phone(String),
    /// Lowercased address.
    Email(String),
    /// Account path plus lowercased uri.
    OnlineAccount { path: String, uri: String },
}

/// Outcome of reindexing one contact.
#[derive(Debug, Default)]
pub struct IndexingOutcome {
    /// Whether any index-relevant address changed; callers use this to
    /// decide if dependent view role data needs refreshing.
    pub modified: bool,
    pub added: Vec<AddressKey>,
}

const ADDRESS_KINDS: [DetailKind; 3] = [
    DetailKind::PhoneNumber,
    DetailKind::EmailAddress,
    DetailKind::OnlineAccount,
];

/// Reverse maps from address keys to contact ids.
///
/// Phone keys are multi-valued: distinct numbers can share a minimized
/// form, so lookups return candidates in insertion order and the caller
/// picks the best match. Email and account keys are unique.
#[derive(Debug, Default)]
pub struct AddressIndex {
    policy: PhoneIndexPolicy,
    phone_ids: HashMap<String, Vec<InternalId>>,
    email_ids: HashMap<String, InternalId>,
    account_ids: HashMap<(String, String), InternalId>,
}

impl AddressIndex {
    pub fn new(policy: PhoneIndexPolicy) -> Self {
        AddressIndex {
            policy,
            ..AddressIndex::default()
        }
    }

    /// Candidate ids indexed under a phone key, oldest insertion first.
    pub fn phone_candidates(&self, key: &str) -> &[InternalId] {
        self.phone_ids.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Keys to probe for an incoming number, by policy: the full
    /// normalized form first where indexed, then the minimized form.
    pub fn phone_lookup_keys(&self, number: &str) -> Vec<String> {
        let mut keys = Vec::with_capacity(2);
        if self.policy == PhoneIndexPolicy::FullAndMinimized {
            if let Some(full) = normalize_phone_number(number) {
                keys.push(full);
            }
        }
        if let Some(minimized) = minimize_phone_number(number) {
            if !keys.contains(&minimized) {
                keys.push(minimized);
            }
        }
        keys
    }

    pub fn email_id(&self, address: &str) -> Option<InternalId> {
        self.email_ids.get(&address.to_lowercase()).copied()
    }

    pub fn account_id(&self, account_path: &str, account_uri: &str) -> Option<InternalId> {
        self.account_ids
            .get(&(account_path.to_string(), account_uri.to_lowercase()))
            .copied()
    }

    /// Diff `old` against `new` and update the index for contact `iid`.
    ///
    /// Only the detail kinds named in `changed_kinds` are examined; `None`
    /// means unconstrained (all address-bearing kinds). Keys present in
    /// new-but-not-old are inserted and reported in the outcome; keys in
    /// old-but-not-new are dropped.
    pub fn update_indexing(
        &mut self,
        old: Option<&Contact>,
        new: &Contact,
        iid: InternalId,
        changed_kinds: Option<&HashSet<DetailKind>>,
    ) -> IndexingOutcome {
        let mut outcome = IndexingOutcome::default();

        for kind in ADDRESS_KINDS {
            if let Some(changed) = changed_kinds {
                if !changed.contains(&kind) {
                    continue;
                }
            }

            match kind {
                DetailKind::PhoneNumber => self.update_phone_keys(old, new, iid, &mut outcome),
                DetailKind::EmailAddress => self.update_email_keys(old, new, iid, &mut outcome),
                DetailKind::OnlineAccount => self.update_account_keys(old, new, iid, &mut outcome),
                _ => {}
            }
        }

        outcome
    }

    /// Drop every key a removed contact contributed.
    pub fn remove_contact(&mut self, contact: &Contact, iid: InternalId) {
        for key in self.phone_keys(contact) {
            remove_candidate(&mut self.phone_ids, &key, iid);
        }
        for key in email_keys(contact) {
            if self.email_ids.get(&key) == Some(&iid) {
                self.email_ids.remove(&key);
            }
        }
        for key in account_keys(contact) {
            if self.account_ids.get(&key) == Some(&iid) {
                self.account_ids.remove(&key);
            }
        }
    }

    fn phone_keys(&self, contact: &Contact) -> HashSet<String> {
        let mut keys = HashSet::new();
        for phone in &contact.phone_numbers {
            if let Some(minimized) = minimize_phone_number(&phone.number) {
                keys.insert(minimized);
            }
            if self.policy == PhoneIndexPolicy::FullAndMinimized {
                if let Some(full) = normalize_phone_number(&phone.number) {
                    keys.insert(full);
                }
            }
        }
        keys
    }

    fn update_phone_keys(
        &mut self,
        old: Option<&Contact>,
        new: &Contact,
        iid: InternalId,
        outcome: &mut IndexingOutcome,
    ) {
        let old_keys = old.map(|c| self.phone_keys(c)).unwrap_or_default();
        let new_keys = self.phone_keys(new);

        for key in old_keys.difference(&new_keys) {
            remove_candidate(&mut self.phone_ids, key, iid);
            outcome.modified = true;
        }
        for key in new_keys.difference(&old_keys) {
            let candidates = self.phone_ids.entry(key.clone()).or_default();
            if !candidates.contains(&iid) {
                candidates.push(iid);
            }
            outcome.modified = true;
        }
        // Report full normalized numbers once, not one entry per key shape
        if outcome.modified {
            let old_numbers: HashSet<String> = old
                .iter()
                .flat_map(|c| c.phone_numbers.iter())
                .filter_map(|p| normalize_phone_number(&p.number))
                .collect();
            for phone in &new.phone_numbers {
                if let Some(full) = normalize_phone_number(&phone.number) {
                    if !old_numbers.contains(&full) {
                        outcome.added.push(AddressKey::Phone(full));
                    }
                }
            }
        }
    }

    fn update_email_keys(
        &mut self,
        old: Option<&Contact>,
        new: &Contact,
        iid: InternalId,
        outcome: &mut IndexingOutcome,
    ) {
        let old_keys: HashSet<String> =
            old.map(|c| email_keys(c).into_iter().collect()).unwrap_or_default();
        let new_keys: HashSet<String> = email_keys(new).into_iter().collect();

        for key in old_keys.difference(&new_keys) {
            if self.email_ids.get(key) == Some(&iid) {
                self.email_ids.remove(key);
            }
            outcome.modified = true;
        }
        for key in new_keys.difference(&old_keys) {
            self.email_ids.insert(key.clone(), iid);
            outcome.added.push(AddressKey::Email(key.clone()));
            outcome.modified = true;
        }
    }

    fn update_account_keys(
        &mut self,
        old: Option<&Contact>,
        new: &Contact,
        iid: InternalId,
        outcome: &mut IndexingOutcome,
    ) {
        let old_keys: HashSet<(String, String)> =
            old.map(|c| account_keys(c).into_iter().collect()).unwrap_or_default();
        let new_keys: HashSet<(String, String)> =
            account_keys(new).into_iter().collect();

        for key in old_keys.difference(&new_keys) {
            if self.account_ids.get(key) == Some(&iid) {
                self.account_ids.remove(key);
            }
            outcome.modified = true;
        }
        for key in new_keys.difference(&old_keys) {
            self.account_ids.insert(key.clone(), iid);
            outcome.added.push(AddressKey::OnlineAccount {
                path: key.0.clone(),
                uri: key.1.clone(),
            });
            outcome.modified = true;
        }
    }
}

fn remove_candidate(map: &mut HashMap<String, Vec<InternalId>>, key: &str, iid: InternalId) {
    if let Some(candidates) = map.get_mut(key) {
        candidates.retain(|id| *id != iid);
        if candidates.is_empty() {
            map.remove(key);
        }
    }
}

fn email_keys(contact: &Contact) -> Vec<String> {
    contact
        .email_addresses
        .iter()
        .filter(|e| !e.address.is_empty())
        .map(|e| e.address.to_lowercase())
        .collect()
}

fn account_keys(contact: &Contact) -> Vec<(String, String)> {
    contact
        .online_accounts
        .iter()
        .filter(|a| !a.account_uri.is_empty())
        .map(|a| (a.account_path.clone(), a.account_uri.to_lowercase()))
        .collect()
}
