//! # attsync-attachments
//!
//! Reconciles a target directory's committed attachments against the list a
//! client claims.
//!
//! ## Features
//!
//! - Storage abstraction (local filesystem, in-memory)
//! - Planning of moves from the holding area and deletions of unclaimed files
//! - Per-file failure classification (fatal or recoverable)
//! - Extension gating by file category
//! - Per-directory locking so concurrent calls on one directory serialize
//!
//! ## Example
//!
//! ```rust,ignore
//! use attsync_attachments::{LocalStorage, ReconcileService};
//! use std::sync::Arc;
//!
//! let storage = Arc::new(LocalStorage::new("assets"));
//! let service = ReconcileService::new(storage, Default::default());
//!
//! // Commit two staged uploads to entity/42
//! let files = service
//!     .reconcile_delimited("entity/42", "uploads/a.png|b.png")
//!     .await?;
//! assert_eq!(files, "entity/42/a.png|entity/42/b.png");
//! ```

pub mod locks;
pub mod model;
pub mod plan;
pub mod service;
pub mod storage;
pub mod validate;

pub use locks::{DirectoryGuard, DirectoryLocks};
pub use model::{
    join_delimited, normalize_name, Claim, ClaimSet, CommittedSet, DirectoryState, Operation,
};
pub use plan::{plan, Plan};
pub use service::{
    normalize_target, OperationOutcome, ReconcileError, ReconcileReport, ReconcileResult,
    ReconcileService,
};
pub use storage::{LocalStorage, MemoryStorage, StagedFile, Storage, StorageError, StorageResult};
pub use validate::{
    admits, extract_file_ext, filter_by_category, filter_delimited, first_entry,
    is_valid_extension,
};
