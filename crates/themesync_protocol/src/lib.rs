//! # Themesync Protocol
//!
//! Data model and wire types for theme asset synchronization.
//!
//! This crate provides:
//! - `AssetKey`, `Checksum` and `Asset` for versioned theme files
//! - `Operation` and `SyncDirection` for units of sync work
//! - `Conflict` and `BaselinePolicy` for divergent edits
//! - `ChangeEvent` for coalesced filesystem changes
//! - JSON request/response bodies of the theme assets API
//!
//! This is a pure data crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod asset;
mod change;
mod conflict;
mod error;
mod messages;
mod operation;

pub use asset::{Asset, AssetKey, AssetOrigin, Checksum};
pub use change::{ChangeEvent, ChangeKind};
pub use conflict::{BaselinePolicy, Conflict};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    AssetBody, AssetEnvelope, AssetListResponse, AssetRecord, AssetUpload, ErrorBody, ThemeListResponse,
    ThemeRecord,
};
pub use operation::{Operation, OperationKind, SyncDirection};
