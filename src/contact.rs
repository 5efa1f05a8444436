//! Contact data model
//!
//! `Contact` is the possibly-partial snapshot of a store record held by the
//! cache. Snapshots are keyed by `InternalId`, a dense numeric alias of the
//! store's own `ContactId`. The model carries only the detail kinds the
//! cache and its views consume; everything else stays in the store.

use serde::{Deserialize, Serialize};

/// Opaque store-side contact identity. Zero is the null id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct ContactId(pub u32);

impl ContactId {
    pub const NULL: ContactId = ContactId(0);

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

/// Dense numeric cache key, aliasing `ContactId` one-to-one.
pub type InternalId = u32;

/// Convert a store id to the cache's internal key.
pub fn internal_id(id: ContactId) -> InternalId {
    id.0
}

/// Convert an internal key back to the store id form.
pub fn api_id(iid: InternalId) -> ContactId {
    ContactId(iid)
}

/// Status flag bitmask values, mirrored from the store's flags detail.
pub mod status_flags {
    pub const HAS_PHONE_NUMBER: u64 = 1 << 0;
    pub const HAS_EMAIL_ADDRESS: u64 = 1 << 1;
    pub const HAS_ONLINE_ACCOUNT: u64 = 1 << 2;
    pub const IS_ONLINE: u64 = 1 << 3;
    pub const IS_FAVORITE: u64 = 1 << 4;
}

/// Sync-source marker on a constituent record.
///
/// A `Local` constituent may be aggregated under at most one aggregate;
/// linking it under a second one demotes it to `WasLocal` (restored to
/// `Local` on disaggregation).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncTarget {
    Local,
    WasLocal,
    Aggregate,
    Other(String),
}

impl Default for SyncTarget {
    fn default() -> Self {
        SyncTarget::Other(String::new())
    }
}

/// Detail kinds used in fetch-hint projections and change descriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DetailKind {
    Name,
    Nickname,
    DisplayLabel,
    Favorite,
    Gender,
    StatusFlags,
    SyncTarget,
    Avatar,
    GlobalPresence,
    Presence,
    PhoneNumber,
    EmailAddress,
    OnlineAccount,
    Organization,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Gender {
    Unspecified,
    Male,
    Female,
}

impl Default for Gender {
    fn default() -> Self {
        Gender::Unspecified
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhoneNumber {
    pub number: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAddress {
    pub address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineAccount {
    /// Local account path identifying the account this uri belongs to.
    pub account_path: String,
    pub account_uri: String,
    pub nickname: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Avatar {
    pub image_url: String,
    /// Metadata discriminator: "local", "cover", or a source-specific tag.
    pub metadata: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalPresence {
    pub nickname: String,
    /// Lower sorts earlier in the online view.
    pub presence_state: i32,
}

/// A cached contact snapshot.
///
/// Fields not covered by the fetch hint that produced a snapshot are left
/// at their defaults; the cache merges unfetched details from the previous
/// snapshot before applying a partial result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub id: ContactId,
    pub first_name: String,
    pub last_name: String,
    pub nickname: String,
    /// Label computed by the store backend, used as a naming fallback.
    pub backend_label: String,
    pub favorite: bool,
    pub gender: Gender,
    pub sync_target: SyncTarget,
    pub status_flags: u64,
    pub organization: String,
    pub avatars: Vec<Avatar>,
    pub phone_numbers: Vec<PhoneNumber>,
    pub email_addresses: Vec<EmailAddress>,
    pub online_accounts: Vec<OnlineAccount>,
    pub global_presence: GlobalPresence,
}

impl Contact {
    pub fn new(id: ContactId) -> Self {
        Contact {
            id,
            ..Contact::default()
        }
    }

    pub fn internal_id(&self) -> InternalId {
        internal_id(self.id)
    }

    pub fn is_online(&self) -> bool {
        self.status_flags & status_flags::IS_ONLINE != 0
    }

    pub fn is_aggregate(&self) -> bool {
        self.sync_target == SyncTarget::Aggregate
    }
}

/// Select the best avatar url, preferring "local" records, then plain
/// file-backed avatars, then remote urls, with "cover" images last.
fn avatar_url_with_metadata(contact: &Contact, metadata_fragment: &str) -> Option<String> {
    let mut fallback_score = 0;
    let mut fallback_url = None;

    for avatar in &contact.avatars {
        if !metadata_fragment.is_empty() && !avatar.metadata.starts_with(metadata_fragment) {
            continue;
        }

        if avatar.metadata == "local" {
            return Some(avatar.image_url.clone());
        }

        let remote = avatar
            .image_url
            .split_once("://")
            .map(|(scheme, _)| scheme != "file")
            .unwrap_or(false);
        let mut score = if remote { 3 } else { 4 };
        if avatar.metadata == "cover" {
            score -= 2;
        }

        if score > fallback_score {
            fallback_url = Some(avatar.image_url.clone());
            fallback_score = score;
        }
    }

    fallback_url.filter(|url| !url.is_empty())
}

/// Resolve an avatar url, trying each metadata fragment in preference
/// order. An empty fragment list matches any avatar.
pub fn filtered_avatar_url(contact: &Contact, metadata_fragments: &[&str]) -> Option<String> {
    if metadata_fragments.is_empty() {
        return avatar_url_with_metadata(contact, "");
    }

    for fragment in metadata_fragments {
        if let Some(url) = avatar_url_with_metadata(contact, fragment) {
            return Some(url);
        }
    }

    None
}
