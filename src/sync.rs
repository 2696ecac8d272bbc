//! Value types shared with sync and hook orchestration layers.
//!
//! The cache itself never drives a sync; these tags are the vocabulary that
//! reconcilers attach to operations and results, kept here so that every
//! consumer agrees on the wire strings and the classification predicates.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Phase of a sync operation in which a resource is applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncPhase {
    /// Applied before the main sync wave.
    PreSync,
    /// The main sync wave.
    Sync,
    /// Applied after the main sync wave succeeded.
    PostSync,
    /// Applied only when the main sync wave failed.
    SyncFail,
}

impl SyncPhase {
    /// The wire string for this phase.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::PreSync => "PreSync",
            SyncPhase::Sync => "Sync",
            SyncPhase::PostSync => "PostSync",
            SyncPhase::SyncFail => "SyncFail",
        }
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hook annotation values recognised on resources taking part in a sync.
///
/// Hooks mirror [`SyncPhase`] with the addition of [`HookType::Skip`], which
/// excludes a resource from being applied at all.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookType {
    /// Run before the main sync wave.
    PreSync,
    /// Run as part of the main sync wave.
    Sync,
    /// Do not apply this resource.
    Skip,
    /// Run after the main sync wave succeeded.
    PostSync,
    /// Run only when the main sync wave failed.
    SyncFail,
}

impl HookType {
    /// The wire string for this hook type.
    pub fn as_str(&self) -> &'static str {
        match self {
            HookType::PreSync => "PreSync",
            HookType::Sync => "Sync",
            HookType::Skip => "Skip",
            HookType::PostSync => "PostSync",
            HookType::SyncFail => "SyncFail",
        }
    }

    /// Parse a hook annotation value, `None` for unrecognised strings.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PreSync" => Some(HookType::PreSync),
            "Sync" => Some(HookType::Sync),
            "Skip" => Some(HookType::Skip),
            "PostSync" => Some(HookType::PostSync),
            "SyncFail" => Some(HookType::SyncFail),
            _ => None,
        }
    }
}

impl fmt::Display for HookType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal and non-terminal states of a whole sync operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationPhase {
    /// The operation is in progress.
    Running,
    /// The operation is being torn down.
    Terminating,
    /// The operation completed and at least one resource failed to apply.
    Failed,
    /// The operation was aborted by an unexpected error.
    Error,
    /// The operation completed successfully.
    Succeeded,
}

impl OperationPhase {
    /// The wire string for this phase.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationPhase::Running => "Running",
            OperationPhase::Terminating => "Terminating",
            OperationPhase::Failed => "Failed",
            OperationPhase::Error => "Error",
            OperationPhase::Succeeded => "Succeeded",
        }
    }

    /// True once the operation reached a terminal state.
    pub fn is_completed(&self) -> bool {
        matches!(
            self,
            OperationPhase::Failed | OperationPhase::Error | OperationPhase::Succeeded
        )
    }

    /// True while the operation is still making progress.
    pub fn is_running(&self) -> bool {
        matches!(self, OperationPhase::Running | OperationPhase::Terminating)
    }

    /// True if the operation completed without failures.
    pub fn is_successful(&self) -> bool {
        *self == OperationPhase::Succeeded
    }

    /// True if the operation completed with resource failures.
    pub fn is_failed(&self) -> bool {
        *self == OperationPhase::Failed
    }
}

impl fmt::Display for OperationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-resource outcome recorded in a sync result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultCode {
    /// The resource was applied.
    Synced,
    /// The resource failed to apply.
    SyncFailed,
    /// The resource was pruned.
    Pruned,
    /// The resource was due for pruning but pruning was disabled.
    PruneSkipped,
}

impl ResultCode {
    /// The wire string for this result code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultCode::Synced => "Synced",
            ResultCode::SyncFailed => "SyncFailed",
            ResultCode::Pruned => "Pruned",
            ResultCode::PruneSkipped => "PruneSkipped",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
