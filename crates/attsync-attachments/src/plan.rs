//! Set Reconciler
//!
//! Computes the operations that converge a target directory onto a claim set.
//! Planning performs no I/O; the service executes the plan afterwards.

use std::ffi::OsStr;

use attsync_core::ValidationMode;

use crate::model::{ClaimSet, DirectoryState, Operation};
use crate::validate::admits;

/// The outcome of planning one reconciliation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    /// Moves first, then deletes; each group sorted by name
    pub operations: Vec<Operation>,
    /// Claimed names kept out of the plan by extension gating
    pub rejected: Vec<String>,
}

impl Plan {
    pub fn moves(&self) -> impl Iterator<Item = &str> {
        self.operations.iter().filter_map(|op| match op {
            Operation::MoveIn(name) => Some(name.as_str()),
            Operation::DeleteOut(_) => None,
        })
    }

    pub fn deletes(&self) -> impl Iterator<Item = &OsStr> {
        self.operations.iter().filter_map(|op| match op {
            Operation::DeleteOut(name) => Some(name.as_os_str()),
            Operation::MoveIn(_) => None,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }
}

/// Diff the claim set against the directory state.
///
/// A name that is both claimed and committed produces no operation, whether
/// or not its holding-area source still exists. Gating only filters moves: a
/// committed name that is still claimed is never deleted, even when it would
/// fail validation today.
pub fn plan(claims: &ClaimSet, state: &DirectoryState, mode: ValidationMode) -> Plan {
    let mut plan = Plan::default();

    let committed = match state {
        DirectoryState::Absent => None,
        DirectoryState::Present(committed) => Some(committed),
    };

    for name in claims.iter() {
        if committed.map_or(false, |c| c.contains(name)) {
            continue;
        }
        if admits(mode, name) {
            plan.operations.push(Operation::MoveIn(name.to_string()));
        } else {
            plan.rejected.push(name.to_string());
        }
    }

    if let Some(committed) = committed {
        for name in committed.iter() {
            // A name that is not UTF-8 can never be claimed
            let claimed = name.to_str().map_or(false, |n| claims.contains(n));
            if !claimed {
                plan.operations.push(Operation::DeleteOut(name.to_os_string()));
            }
        }
    }

    plan
}
