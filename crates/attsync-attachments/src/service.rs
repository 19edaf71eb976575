//! Reconciliation Service
//!
//! Orchestrates one reconciliation: read the committed set, plan, execute,
//! and re-read the directory to report what actually exists.

use std::ffi::OsString;
use std::io;
use std::sync::Arc;

use attsync_core::{FileCategory, ReconcileConfig, Severity, ValidationMode};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::locks::DirectoryLocks;
use crate::model::{
    join_delimited, normalize_name, Claim, ClaimSet, CommittedSet, DirectoryState, Operation,
};
use crate::plan::{plan, Plan};
use crate::storage::{StagedFile, Storage, StorageError};
use crate::validate::{admits, is_valid_extension};

/// Call-level errors
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Invalid target directory: {0}")]
    InvalidTarget(String),
    #[error("Couldn't bootstrap directory {target}: {source}")]
    Bootstrap {
        target: String,
        #[source]
        source: StorageError,
    },
    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// Result of one attempted operation
#[derive(Debug)]
pub struct OperationOutcome {
    pub operation: Operation,
    pub result: Result<(), StorageError>,
}

impl OperationOutcome {
    /// `None` when the operation succeeded
    pub fn severity(&self) -> Option<Severity> {
        self.result.as_ref().err().map(StorageError::severity)
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Everything one reconciliation did
#[derive(Debug)]
pub struct ReconcileReport {
    /// Normalized target directory
    pub target: String,
    /// The directory did not exist and was created by this call
    pub bootstrapped: bool,
    pub plan: Plan,
    /// Claims kept out of the plan because the holding area has no such file
    pub skipped: Vec<OperationOutcome>,
    /// One outcome per planned operation, in plan order
    pub outcomes: Vec<OperationOutcome>,
    /// Files in the directory after execution, each prefixed with `target/`
    pub files: Vec<String>,
}

impl ReconcileReport {
    /// Skipped claims, then failed operations in plan order
    pub fn failures(&self) -> impl Iterator<Item = &OperationOutcome> {
        self.skipped
            .iter()
            .chain(self.outcomes.iter())
            .filter(|o| !o.is_ok())
    }

    /// Every planned operation succeeded
    pub fn is_clean(&self) -> bool {
        self.failures().next().is_none()
    }
}

/// Attachment reconciliation service
pub struct ReconcileService<S: Storage> {
    storage: Arc<S>,
    config: ReconcileConfig,
    locks: DirectoryLocks,
}

impl<S: Storage> ReconcileService<S> {
    pub fn new(storage: Arc<S>, config: ReconcileConfig) -> Self {
        Self {
            storage,
            config,
            locks: DirectoryLocks::new(),
        }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// Reconcile `target` against a claim, answering in the claim's shape
    pub async fn reconcile(&self, target: &str, claim: &Claim) -> ReconcileResult<Claim> {
        let delimiter = self.config.delimiter;
        let files = self
            .reconcile_files(target, &claim.to_claim_set(delimiter))
            .await?;
        Ok(claim.render_like(files, delimiter))
    }

    /// Reconcile from a delimited claim string (`a.png|uploads/b.png`)
    pub async fn reconcile_delimited(&self, target: &str, claims: &str) -> ReconcileResult<String> {
        let delimiter = self.config.delimiter;
        let files = self
            .reconcile_files(target, &ClaimSet::from_delimited(claims, delimiter))
            .await?;
        Ok(join_delimited(&files, delimiter))
    }

    /// Reconcile from an explicit list of claims
    pub async fn reconcile_list<I, R>(&self, target: &str, claims: I) -> ReconcileResult<Vec<String>>
    where
        I: IntoIterator<Item = R>,
        R: AsRef<str>,
    {
        self.reconcile_files(target, &ClaimSet::from_refs(claims))
            .await
    }

    async fn reconcile_files(&self, target: &str, claims: &ClaimSet) -> ReconcileResult<Vec<String>> {
        let report = self
            .reconcile_report(target, claims, self.config.validation)
            .await?;
        Ok(report.files)
    }

    /// Reconcile and return the full report.
    ///
    /// Fails only when the target is invalid, the directory cannot be
    /// created, or it cannot be listed. Per-file failures are logged and
    /// recorded in the report.
    #[instrument(skip(self, claims), fields(target_dir = %target, claims = claims.len()))]
    pub async fn reconcile_report(
        &self,
        target: &str,
        claims: &ClaimSet,
        mode: ValidationMode,
    ) -> ReconcileResult<ReconcileReport> {
        let target = normalize_target(target)?;
        let _guard = self.locks.acquire(&target).await;

        let state = match self.storage.list(&target).await? {
            Some(names) => DirectoryState::Present(CommittedSet::from_names(names)),
            None => DirectoryState::Absent,
        };

        let bootstrapped = state.is_absent();
        if bootstrapped {
            info!(storage = self.storage.name(), "Directory not found, creating");
            self.storage.ensure_dir(&target).await.map_err(|e| {
                error!(code = e.code(), error = %e, "Failed to create directory");
                ReconcileError::Bootstrap {
                    target: target.clone(),
                    source: e,
                }
            })?;
        }

        let (sourceable, skipped) = self.check_sources(claims, &state, mode).await;
        let plan = plan(&sourceable, &state, mode);
        debug!(
            moves = ?plan.moves().collect::<Vec<_>>(),
            deletes = ?plan.deletes().collect::<Vec<_>>(),
            "Planned reconciliation"
        );
        for name in &plan.rejected {
            warn!(file = %name, mode = ?mode, "Claimed file failed validation, not moved");
        }

        let outcomes = self.execute(&target, &plan).await?;

        let listed = self.storage.list(&target).await?.unwrap_or_default();
        let files = qualify(&target, listed);

        let report = ReconcileReport {
            target,
            bootstrapped,
            plan,
            skipped,
            outcomes,
            files,
        };
        info!(
            files = report.files.len(),
            failed = report.failures().count(),
            "Reconciliation finished"
        );

        Ok(report)
    }

    /// Split off claims that would be moved in but have no holding-area file.
    ///
    /// Such a claim is recorded as a recoverable `SourceMissing` outcome and
    /// never planned, so repeating a call with the same claims plans nothing.
    /// A claim whose lookup itself fails stays in the plan and the move
    /// reports the real error.
    async fn check_sources(
        &self,
        claims: &ClaimSet,
        state: &DirectoryState,
        mode: ValidationMode,
    ) -> (ClaimSet, Vec<OperationOutcome>) {
        let mut sourceable = claims.clone();
        let mut skipped = Vec::new();

        for name in claims.iter() {
            if state.contains(name) || !admits(mode, name) {
                continue;
            }
            if let Ok(false) = self.storage.is_held(name).await {
                sourceable.remove(name);
                let source = StorageError::SourceMissing {
                    path: name.to_string(),
                    source: io::Error::new(io::ErrorKind::NotFound, "not in holding area"),
                };
                warn!(operation = "move_in", file = %name, code = source.code(), error = %source, "Operation skipped");
                skipped.push(OperationOutcome {
                    operation: Operation::MoveIn(name.to_string()),
                    result: Err(source),
                });
            }
        }

        (sourceable, skipped)
    }

    /// Run every planned operation, at most `concurrency` at a time.
    ///
    /// Only a failure to create the target directory stops the batch.
    async fn execute(&self, target: &str, plan: &Plan) -> ReconcileResult<Vec<OperationOutcome>> {
        let mut results = stream::iter(plan.operations.iter().cloned())
            .map(move |operation| async move {
                let result = match &operation {
                    Operation::MoveIn(name) => self.storage.move_in(name, target).await,
                    Operation::DeleteOut(name) => self.storage.remove(name, target).await,
                };
                OperationOutcome { operation, result }
            })
            .buffered(self.config.concurrency.max(1));

        let mut outcomes = Vec::with_capacity(plan.len());
        while let Some(outcome) = results.next().await {
            let file = outcome.operation.name();
            let op = outcome.operation.kind();
            match &outcome.result {
                Ok(()) => info!(operation = op, file = %file, "success"),
                Err(StorageError::DirectoryCreate { .. }) => {}
                Err(e) if e.severity().is_fatal() => {
                    error!(operation = op, file = %file, code = e.code(), error = %e, "Operation failed")
                }
                Err(e) => {
                    warn!(operation = op, file = %file, code = e.code(), error = %e, "Operation skipped")
                }
            }

            if let Err(source @ StorageError::DirectoryCreate { .. }) = outcome.result {
                error!(operation = op, error = %source, "Target directory could not be created, aborting");
                return Err(ReconcileError::Bootstrap {
                    target: target.to_string(),
                    source,
                });
            }
            outcomes.push(outcome);
        }

        Ok(outcomes)
    }

    /// Files currently committed to `target`, each prefixed with `target/`
    pub async fn committed(&self, target: &str) -> ReconcileResult<Vec<String>> {
        let target = normalize_target(target)?;
        let listed = self.storage.list(&target).await?.unwrap_or_default();
        Ok(qualify(&target, listed))
    }

    /// Save an upload into the holding area
    pub async fn stage(&self, original_name: &str, data: Bytes) -> ReconcileResult<StagedFile> {
        let staged = self.storage.stage(original_name, data).await?;
        info!(name = %staged.name, size = staged.size, "File staged");
        Ok(staged)
    }

    /// Remove a file from the holding area
    pub async fn discard(&self, name: &str) -> ReconcileResult<()> {
        let name = normalize_name(name)
            .ok_or_else(|| StorageError::InvalidPath(name.to_string()))?;
        self.storage.discard(name).await?;
        Ok(())
    }

    /// Claims whose file is in the holding area and valid for `category`.
    ///
    /// Each claim is looked up by its bare name, the same file a reconcile
    /// would move in, and only regular files count. Entries are returned as
    /// submitted.
    pub async fn filter_existing<R: AsRef<str>>(
        &self,
        claims: &[R],
        category: FileCategory,
    ) -> ReconcileResult<Vec<String>> {
        let mut kept = Vec::new();
        for claim in claims {
            let claim = claim.as_ref();
            let Some(name) = normalize_name(claim) else {
                continue;
            };
            if is_valid_extension(name, category) && self.storage.is_held(name).await? {
                kept.push(claim.to_string());
            }
        }
        Ok(kept)
    }

    /// [`Self::filter_existing`] over groups of claims.
    ///
    /// Returns an empty list when every group filtered down to nothing.
    pub async fn filter_existing_groups<R: AsRef<str>>(
        &self,
        groups: &[Vec<R>],
        category: FileCategory,
    ) -> ReconcileResult<Vec<Vec<String>>> {
        let mut filtered = Vec::with_capacity(groups.len());
        for group in groups {
            filtered.push(self.filter_existing(group, category).await?);
        }

        if filtered.iter().all(Vec::is_empty) {
            return Ok(Vec::new());
        }
        Ok(filtered)
    }
}

/// Prefix listed names with `target/`; names that are not UTF-8 are converted lossily
fn qualify(target: &str, names: Vec<OsString>) -> Vec<String> {
    names
        .into_iter()
        .map(|name| format!("{}/{}", target, name.to_string_lossy()))
        .collect()
}

/// Validate a target directory and strip redundant slashes.
///
/// Targets are always relative to the storage root.
pub fn normalize_target(target: &str) -> ReconcileResult<String> {
    if target.starts_with('/') || target.contains('\\') {
        return Err(ReconcileError::InvalidTarget(target.to_string()));
    }

    let segments: Vec<&str> = target.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() || segments.iter().any(|s| *s == "." || *s == "..") {
        return Err(ReconcileError::InvalidTarget(target.to_string()));
    }

    Ok(segments.join("/"))
}
