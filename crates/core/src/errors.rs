use thiserror::Error;

use crate::domain::workflow::WorkflowStatus;

/// Business outcomes of the approval engine, surfaced to callers verbatim.
///
/// Authorization and state errors are not system failures: the service layer
/// presents them to the user as the reason an action was refused.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("unknown role `{role}`")]
    UnknownRole { role: String },
    #[error("no eligible approver: {detail}")]
    NoEligibleApprover { detail: String },
    #[error("user `{user}` is neither assigned to the active step nor an active holder of its role")]
    NotAssigned { user: String },
    #[error("initiator `{user}` cannot act on their own workflow")]
    SelfApproval { user: String },
    #[error("user `{user}` already signed an earlier step of this workflow")]
    DuplicateApprover { user: String },
    #[error("workflow `{workflow_id}` was modified concurrently")]
    ConcurrentModification { workflow_id: String },
    #[error("workflow `{workflow_id}` already resolved as {status:?}")]
    AlreadyResolved { workflow_id: String, status: WorkflowStatus },
    #[error("workflow `{workflow_id}` is not past its approval deadline")]
    EscalationNotDue { workflow_id: String },
    #[error("workflow invariant violation: {0}")]
    InvariantViolation(String),
}

impl WorkflowError {
    /// A losing concurrent writer should re-read and retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrentModification { .. })
    }

    /// The workflow was resolved, or its deadline refreshed, before the
    /// caller's action landed. Callers treat this as a no-op, not a fault.
    pub fn is_benign_race(&self) -> bool {
        matches!(self, Self::AlreadyResolved { .. } | Self::EscalationNotDue { .. })
    }
}
