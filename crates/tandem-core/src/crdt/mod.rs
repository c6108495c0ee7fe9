//! CRDT-backed element store using Loro.
//!
//! # Schema
//!
//! ```text
//! LoroDoc
//! └── "elements": LoroMap<ElementId, LoroMap>
//!                 └── <field name>: String (JSON-encoded field value)
//! ```
//!
//! Field writes are last-writer-wins registers ordered by Loro's Lamport
//! timestamp with the peer id as tie-break, so every replica settles on the
//! same value for concurrent writes to one field without extra messages.
//! Writes to different fields of one element never conflict.

mod convert;
mod schema;

pub use convert::{element_from_loro, element_to_loro, patch_to_loro};
pub use schema::{ELEMENTS_KEY, ElementStore};

pub use loro::VersionVector;

use thiserror::Error;

/// Element store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("CRDT error: {0}")]
    Crdt(#[from] loro::LoroError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid patch for element {id}: {reason}")]
    InvalidPatch { id: String, reason: String },
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
