//! Store-facing contract.
//!
//! The cache drives an asynchronous contact store through
//! [`ContactStore::begin`] and consumes completions and change signals as
//! [`StoreEvent`]s delivered over a channel. All events must be drained on
//! the one thread that owns the cache; the sink side is cloneable so a
//! store running its I/O elsewhere can marshal completions across.

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};

use crate::contact::{Contact, ContactId, DetailKind};
use crate::error::{CacheError, Result};

/// One asynchronous operation kind. At most one request of each kind is
/// in flight at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    Fetch,
    FetchById,
    IdFetch,
    RelationshipFetch,
    Save,
    Remove,
    RelationshipSave,
    RelationshipRemove,
}

/// Extra detail groups a fetch hint must carry beyond its tier's default,
/// as a bitmask.
pub mod fetch_data {
    pub const ACCOUNT_URI: u32 = 1 << 0;
    pub const PHONE_NUMBER: u32 = 1 << 1;
    pub const EMAIL_ADDRESS: u32 = 1 << 2;
}

/// Detail-subset projection attached to fetches, keeping low-tier queries
/// cheap. Stores may over-deliver; they must not under-deliver.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchHint {
    pub details: Vec<DetailKind>,
}

impl FetchHint {
    /// Minimal projection used for favorites and id-only backfills.
    pub fn basic(required_data: u32) -> Self {
        let mut hint = FetchHint {
            details: vec![
                DetailKind::Name,
                DetailKind::DisplayLabel,
                DetailKind::Favorite,
                DetailKind::StatusFlags,
                DetailKind::SyncTarget,
                DetailKind::Avatar,
            ],
        };
        hint.apply_required_data(required_data);
        hint
    }

    /// Projection for the metadata population phase and change refetches.
    pub fn metadata(required_data: u32) -> Self {
        let mut hint = Self::basic(required_data);
        hint.details.push(DetailKind::Nickname);
        hint.details.push(DetailKind::Gender);
        hint.details.push(DetailKind::Organization);
        hint.apply_required_data(required_data);
        hint
    }

    /// Presence-only projection for the online phase and presence updates.
    pub fn presence() -> Self {
        FetchHint {
            details: vec![
                DetailKind::GlobalPresence,
                DetailKind::OnlineAccount,
                DetailKind::StatusFlags,
            ],
        }
    }

    /// Unconstrained projection: the complete record.
    pub fn full() -> Self {
        FetchHint { details: Vec::new() }
    }

    fn apply_required_data(&mut self, required_data: u32) {
        if required_data & fetch_data::ACCOUNT_URI != 0 {
            self.push_unique(DetailKind::OnlineAccount);
        }
        if required_data & fetch_data::PHONE_NUMBER != 0 {
            self.push_unique(DetailKind::PhoneNumber);
        }
        if required_data & fetch_data::EMAIL_ADDRESS != 0 {
            self.push_unique(DetailKind::EmailAddress);
        }
    }

    fn push_unique(&mut self, kind: DetailKind) {
        if !self.details.contains(&kind) {
            self.details.push(kind);
        }
    }

    /// Whether the projection covers a detail kind. An empty hint covers
    /// everything.
    pub fn covers(&self, kind: DetailKind) -> bool {
        self.details.is_empty() || self.details.contains(&kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortProperty {
    FirstName,
    LastName,
}

impl std::str::FromStr for SortProperty {
    type Err = CacheError;

    /// Parse the configuration-file spelling of a sort property.
    fn from_str(value: &str) -> Result<Self> {
        match value {
            "first-name" => Ok(SortProperty::FirstName),
            "last-name" => Ok(SortProperty::LastName),
            other => Err(CacheError::InvalidSortProperty(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    pub property: SortProperty,
}

/// Membership predicate for fetch and id-fetch queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueryFilter {
    /// Aggregate contacts only; the base predicate of every view query.
    Aggregates,
    Favorites,
    Online,
    Ids(Vec<ContactId>),
    /// Best-match phone lookup per the backward-scan algorithm.
    PhoneMatch(String),
    Email(String),
    OnlineAccount {
        account_path: Option<String>,
        account_uri: String,
    },
    /// Contacts the store considers mergeable with the given one.
    MergeCandidates(Box<Contact>),
    And(Vec<QueryFilter>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationshipType {
    /// First aggregates second.
    Aggregates,
    /// Explicit exclusion: first must never aggregate second.
    IsNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Relationship {
    pub kind: RelationshipType,
    pub first: ContactId,
    pub second: ContactId,
}

impl Relationship {
    pub fn aggregates(first: ContactId, second: ContactId) -> Self {
        Relationship {
            kind: RelationshipType::Aggregates,
            first,
            second,
        }
    }

    pub fn is_not(first: ContactId, second: ContactId) -> Self {
        Relationship {
            kind: RelationshipType::IsNot,
            first,
            second,
        }
    }
}

/// A store operation. Exactly one request per [`RequestKind`] may be
/// outstanding; the cache enforces this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoreRequest {
    FetchContacts {
        filter: QueryFilter,
        sort: Vec<SortSpec>,
        hint: FetchHint,
    },
    FetchContactIds {
        filter: QueryFilter,
        sort: Vec<SortSpec>,
    },
    FetchContactsById {
        ids: Vec<ContactId>,
        hint: FetchHint,
    },
    /// All relationships in which the contact participates.
    FetchRelationships { contact: ContactId },
    SaveContacts { contacts: Vec<Contact> },
    RemoveContacts { ids: Vec<ContactId> },
    SaveRelationships { relationships: Vec<Relationship> },
    RemoveRelationships { relationships: Vec<Relationship> },
}

impl StoreRequest {
    pub fn kind(&self) -> RequestKind {
        match self {
            StoreRequest::FetchContacts { .. } => RequestKind::Fetch,
            StoreRequest::FetchContactIds { .. } => RequestKind::IdFetch,
            StoreRequest::FetchContactsById { .. } => RequestKind::FetchById,
            StoreRequest::FetchRelationships { .. } => RequestKind::RelationshipFetch,
            StoreRequest::SaveContacts { .. } => RequestKind::Save,
            StoreRequest::RemoveContacts { .. } => RequestKind::Remove,
            StoreRequest::SaveRelationships { .. } => RequestKind::RelationshipSave,
            StoreRequest::RemoveRelationships { .. } => RequestKind::RelationshipRemove,
        }
    }
}

/// Completions and change notifications emitted by the store.
///
/// Result events may arrive in multiple chunks per request, each carrying
/// only results not yet delivered, followed by exactly one
/// `RequestFinished` for the request's kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoreEvent {
    ContactsAvailable {
        kind: RequestKind,
        contacts: Vec<Contact>,
    },
    ContactIdsAvailable { ids: Vec<ContactId> },
    RelationshipsAvailable { relationships: Vec<Relationship> },
    RequestFinished {
        kind: RequestKind,
        error: Option<String>,
    },
    ContactsAdded { ids: Vec<ContactId> },
    ContactsChanged { ids: Vec<ContactId> },
    ContactsPresenceChanged { ids: Vec<ContactId> },
    ContactsRemoved { ids: Vec<ContactId> },
    /// The store lost track of individual changes; refetch everything.
    DataChanged,
}

/// An event on the cache's single dispatch loop: a store event or a
/// self-posted wake-up.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    Store(StoreEvent),
    /// Re-evaluate the pending-work categories.
    UpdateRequest,
}

/// Cloneable producer half handed to the store (and held by the cache for
/// self-posted wake-ups).
#[derive(Debug, Clone)]
pub struct EventSink {
    sender: Sender<CacheEvent>,
}

impl EventSink {
    pub fn post(&self, event: StoreEvent) {
        // A dropped receiver means the cache is gone; nothing to deliver to
        let _ = self.sender.send(CacheEvent::Store(event));
    }

    pub fn request_update(&self) {
        let _ = self.sender.send(CacheEvent::UpdateRequest);
    }
}

/// Create the event channel connecting a store to the cache loop.
pub fn event_channel() -> (EventSink, Receiver<CacheEvent>) {
    let (sender, receiver) = unbounded();
    (EventSink { sender }, receiver)
}

/// The asynchronous contact store the cache fronts.
///
/// `begin` starts an operation and returns immediately; results and the
/// finish notification arrive later through the [`EventSink`] given to the
/// store at construction.
pub trait ContactStore {
    fn begin(&mut self, request: StoreRequest) -> Result<()>;

    /// Id of the device owner's own contact record, excluded from views.
    fn self_contact_id(&self) -> ContactId;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_kind_mapping() {
        let save = StoreRequest::SaveContacts { contacts: vec![] };
        assert_eq!(save.kind(), RequestKind::Save);

        let rels = StoreRequest::SaveRelationships {
            relationships: vec![Relationship::aggregates(ContactId(1), ContactId(2))],
        };
        assert_eq!(rels.kind(), RequestKind::RelationshipSave);
    }

    #[test]
    fn test_fetch_hint_widening() {
        let hint = FetchHint::basic(0);
        assert!(!hint.covers(DetailKind::PhoneNumber));

        let hint = FetchHint::basic(fetch_data::PHONE_NUMBER | fetch_data::ACCOUNT_URI);
        assert!(hint.covers(DetailKind::PhoneNumber));
        assert!(hint.covers(DetailKind::OnlineAccount));
        assert!(!hint.covers(DetailKind::EmailAddress));

        assert!(FetchHint::full().covers(DetailKind::EmailAddress));
    }

    #[test]
    fn test_sort_property_parsing() {
        assert_eq!("first-name".parse::<SortProperty>().ok(), Some(SortProperty::FirstName));
        assert_eq!("last-name".parse::<SortProperty>().ok(), Some(SortProperty::LastName));
        assert!("middle-name".parse::<SortProperty>().is_err());
    }

    #[test]
    fn test_store_event_serialization_roundtrip() {
        // Stores running out of process ship events as JSON
        let event = StoreEvent::ContactsAvailable {
            kind: RequestKind::Fetch,
            contacts: vec![Contact::new(ContactId(7))],
        };
        let encoded = serde_json::to_string(&event).unwrap();
        let decoded: StoreEvent = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_event_channel_roundtrip() {
        let (sink, receiver) = event_channel();
        sink.post(StoreEvent::DataChanged);
        sink.request_update();

        assert_eq!(
            receiver.try_recv(),
            Ok(CacheEvent::Store(StoreEvent::DataChanged))
        );
        assert_eq!(receiver.try_recv(), Ok(CacheEvent::UpdateRequest));
    }
}
