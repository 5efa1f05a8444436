//! In-process contacts cache.
//!
//! `rolodex` fronts an asynchronous contact store with a transient cache:
//! live filtered views kept in sync by an incremental list diff, address
//! indexes for phone/email/account resolution, a prioritized single-flight
//! request sequencer, and contact aggregation coordination.
//!
//! The engine is single-threaded and event-driven. A store implements
//! [`store::ContactStore`] and posts completions through the
//! [`store::EventSink`] half of [`store::event_channel`]; the thread
//! owning the [`cache::ContactCache`] drains them with
//! [`cache::ContactCache::process_events`]. The cache owns no persistent
//! state and is rebuildable from scratch by replaying population queries.

pub mod cache;
pub mod contact;
pub mod diff;
pub mod error;
pub mod index;
pub mod name;
pub mod observer;
pub mod phone;
pub mod store;

pub use cache::{CacheConfig, CacheItem, ContactCache, ContactState, FilterType};
pub use contact::{Contact, ContactId, InternalId};
pub use error::{CacheError, Result};
pub use store::{event_channel, ContactStore, EventSink, StoreEvent, StoreRequest};
