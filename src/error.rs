//! Error types for the contact cache engine

use thiserror::Error;

use crate::store::RequestKind;

pub type Result<T> = std::result::Result<T, CacheError>;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Invalid contact id")]
    InvalidId,

    #[error("Store operation {kind:?} failed: {message}")]
    StoreOperation { kind: RequestKind, message: String },

    #[error("Invalid sort property: {0}")]
    InvalidSortProperty(String),

    #[error("Invalid group property: {0}")]
    InvalidGroupProperty(String),
}
