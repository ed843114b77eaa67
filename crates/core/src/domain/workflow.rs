use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::role::RoleCode;
use crate::domain::signatory::AccountId;
use crate::errors::WorkflowError;
use crate::registry::RoleMembership;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowType {
    CashAuthorization,
    AccountStatusChange,
    LoanApproval,
    HighValuePayment,
    RiskAlertResolution,
    SignatoryRuleChange,
}

impl WorkflowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CashAuthorization => "cash_authorization",
            Self::AccountStatusChange => "account_status_change",
            Self::LoanApproval => "loan_approval",
            Self::HighValuePayment => "high_value_payment",
            Self::RiskAlertResolution => "risk_alert_resolution",
            Self::SignatoryRuleChange => "signatory_rule_change",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "cash_authorization" => Some(Self::CashAuthorization),
            "account_status_change" => Some(Self::AccountStatusChange),
            "loan_approval" => Some(Self::LoanApproval),
            "high_value_payment" => Some(Self::HighValuePayment),
            "risk_alert_resolution" => Some(Self::RiskAlertResolution),
            "signatory_rule_change" => Some(Self::SignatoryRuleChange),
            _ => None,
        }
    }

    /// Money-movement types must carry an amount so the router can size the
    /// approval ladder.
    pub fn requires_amount(&self) -> bool {
        matches!(self, Self::CashAuthorization | Self::LoanApproval | Self::HighValuePayment)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "high" => Some(Self::High),
            "normal" => Some(Self::Normal),
            "low" => Some(Self::Low),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Initiated,
    InProgress,
    Approved,
    Rejected,
    Cancelled,
    Expired,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initiated => "initiated",
            Self::InProgress => "in_progress",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "initiated" => Some(Self::Initiated),
            "in_progress" => Some(Self::InProgress),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "cancelled" => Some(Self::Cancelled),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    /// Initiated and InProgress are one "open" state for transition purposes;
    /// they differ only in whether any step has been acted on yet.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Initiated | Self::InProgress)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_open()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Approved,
    Rejected,
    Escalated,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Escalated => "escalated",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "escalated" => Some(Self::Escalated),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

/// One link in a workflow's approval chain. Owned by value by the workflow;
/// `step_order` values are unique and contiguous from zero.
///
/// Either `approver_role` is set (any active holder may act) or `assigned_to`
/// pins a specific user (signatory chains). `assigned_to` on a role step
/// narrows it to that user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalStep {
    pub step_order: u32,
    pub approver_role: Option<RoleCode>,
    pub assigned_to: Option<UserId>,
    pub approved_by: Option<UserId>,
    pub status: StepStatus,
    pub approved_at: Option<DateTime<Utc>>,
    pub comments: Option<String>,
    pub is_escalated: bool,
}

impl ApprovalStep {
    pub fn pending(
        step_order: u32,
        approver_role: Option<RoleCode>,
        assigned_to: Option<UserId>,
    ) -> Self {
        Self {
            step_order,
            approver_role,
            assigned_to,
            approved_by: None,
            status: StepStatus::Pending,
            approved_at: None,
            comments: None,
            is_escalated: false,
        }
    }

    fn actionable_by<M: RoleMembership>(&self, user: &UserId, membership: &M) -> bool {
        match (&self.assigned_to, &self.approver_role) {
            (Some(assigned), _) => assigned == user,
            (None, Some(role)) => membership.is_active_holder(user, role),
            (None, None) => false,
        }
    }
}

/// Event emitted by a successful transition. Exactly one per transition;
/// consumed by the notification gateway and, for the terminal outcomes, by the
/// originating business service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowEvent {
    Initiated,
    StepApproved,
    Approved,
    Rejected,
    Escalated,
    Cancelled,
    Expired,
}

impl WorkflowEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initiated => "workflow.initiated",
            Self::StepApproved => "workflow.step_approved",
            Self::Approved => "workflow.approved",
            Self::Rejected => "workflow.rejected",
            Self::Escalated => "workflow.escalated",
            Self::Cancelled => "workflow.cancelled",
            Self::Expired => "workflow.expired",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub event: WorkflowEvent,
    pub status: WorkflowStatus,
    pub acted_step: Option<u32>,
}

/// Construction parameters for a new workflow instance. The step chain comes
/// from the router; the aggregate never invents steps on its own.
#[derive(Clone, Debug)]
pub struct NewWorkflow {
    pub id: WorkflowId,
    pub workflow_type: WorkflowType,
    pub resource_type: String,
    pub resource_id: ResourceId,
    pub account_id: Option<AccountId>,
    pub amount: Option<Decimal>,
    pub priority: Priority,
    pub initiated_by: UserId,
    pub initiated_at: DateTime<Utc>,
    pub approval_deadline: DateTime<Utc>,
    pub required_signatures: Option<u32>,
    pub correlation_id: String,
    pub steps: Vec<ApprovalStep>,
}

/// One pending-or-resolved approval request, the only mutable shared resource
/// in the engine. Always mutated as a whole (workflow plus steps) under one
/// optimistic-concurrency unit: `version` is the token the repository CAS-es
/// on, so a losing concurrent writer observes a version conflict instead of
/// corrupting the chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: WorkflowId,
    pub workflow_type: WorkflowType,
    pub resource_type: String,
    pub resource_id: ResourceId,
    pub account_id: Option<AccountId>,
    pub amount: Option<Decimal>,
    pub priority: Priority,
    pub status: WorkflowStatus,
    pub initiated_by: UserId,
    pub initiated_at: DateTime<Utc>,
    pub approval_deadline: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub completed_by: Option<UserId>,
    pub cancelled_by: Option<UserId>,
    pub rejection_reason: Option<String>,
    pub cancellation_reason: Option<String>,
    pub escalation_reason: Option<String>,
    pub escalated_at: Option<DateTime<Utc>>,
    pub required_signatures: Option<u32>,
    pub correlation_id: String,
    pub version: u32,
    pub steps: Vec<ApprovalStep>,
}

impl WorkflowInstance {
    pub fn new(params: NewWorkflow) -> Result<Self, WorkflowError> {
        if params.steps.is_empty() {
            return Err(WorkflowError::InvariantViolation(
                "a workflow must carry at least one approval step".to_string(),
            ));
        }
        for (index, step) in params.steps.iter().enumerate() {
            if step.step_order != index as u32 {
                return Err(WorkflowError::InvariantViolation(format!(
                    "step orders must be contiguous from zero, found {} at position {index}",
                    step.step_order
                )));
            }
            if step.assigned_to.as_ref() == Some(&params.initiated_by) {
                return Err(WorkflowError::InvariantViolation(format!(
                    "initiator `{}` may not be assigned to step {index}",
                    params.initiated_by.0
                )));
            }
        }

        Ok(Self {
            id: params.id,
            workflow_type: params.workflow_type,
            resource_type: params.resource_type,
            resource_id: params.resource_id,
            account_id: params.account_id,
            amount: params.amount,
            priority: params.priority,
            status: WorkflowStatus::Initiated,
            initiated_by: params.initiated_by,
            initiated_at: params.initiated_at,
            approval_deadline: params.approval_deadline,
            completed_at: None,
            completed_by: None,
            cancelled_by: None,
            rejection_reason: None,
            cancellation_reason: None,
            escalation_reason: None,
            escalated_at: None,
            required_signatures: params.required_signatures,
            correlation_id: params.correlation_id,
            version: 1,
            steps: params.steps,
        })
    }

    /// Steps are resolved strictly in `step_order`: the active step is the
    /// first one still pending.
    pub fn active_step(&self) -> Option<&ApprovalStep> {
        self.steps.iter().find(|step| step.status == StepStatus::Pending)
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status.is_open() && now > self.approval_deadline
    }

    pub fn distinct_approvers(&self) -> usize {
        let mut approvers: Vec<&str> = self
            .steps
            .iter()
            .filter(|step| step.status == StepStatus::Approved)
            .filter_map(|step| step.approved_by.as_ref().map(|user| user.0.as_str()))
            .collect();
        approvers.sort_unstable();
        approvers.dedup();
        approvers.len()
    }

    fn ensure_open(&self) -> Result<(), WorkflowError> {
        if self.status.is_terminal() {
            return Err(WorkflowError::AlreadyResolved {
                workflow_id: self.id.0.clone(),
                status: self.status,
            });
        }
        Ok(())
    }

    fn skip_remaining_pending(&mut self) {
        for step in &mut self.steps {
            if step.status == StepStatus::Pending {
                step.status = StepStatus::Skipped;
            }
        }
    }

    /// Approve the active step. Completing the last step transitions the
    /// workflow to Approved and yields the completion event.
    pub fn approve<M: RoleMembership>(
        &mut self,
        approver: &UserId,
        comments: Option<String>,
        membership: &M,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, WorkflowError> {
        self.ensure_open()?;

        if approver == &self.initiated_by {
            return Err(WorkflowError::SelfApproval { user: approver.0.clone() });
        }
        if self
            .steps
            .iter()
            .any(|step| step.status == StepStatus::Approved && step.approved_by.as_ref() == Some(approver))
        {
            return Err(WorkflowError::DuplicateApprover { user: approver.0.clone() });
        }

        let step = self
            .steps
            .iter_mut()
            .find(|step| step.status == StepStatus::Pending)
            .ok_or_else(|| {
                WorkflowError::InvariantViolation("open workflow has no pending step".to_string())
            })?;
        if !step.actionable_by(approver, membership) {
            return Err(WorkflowError::NotAssigned { user: approver.0.clone() });
        }

        let acted = step.step_order;
        step.status = StepStatus::Approved;
        step.approved_by = Some(approver.clone());
        step.approved_at = Some(now);
        step.comments = comments;

        let finished = self.active_step().is_none();
        if finished {
            if let Some(required) = self.required_signatures {
                let distinct = self.distinct_approvers() as u32;
                if distinct < required {
                    return Err(WorkflowError::InvariantViolation(format!(
                        "joint mandate requires {required} distinct signatures, got {distinct}"
                    )));
                }
            }
            self.status = WorkflowStatus::Approved;
            self.completed_at = Some(now);
            self.completed_by = Some(approver.clone());
            Ok(TransitionOutcome {
                event: WorkflowEvent::Approved,
                status: self.status,
                acted_step: Some(acted),
            })
        } else {
            self.status = WorkflowStatus::InProgress;
            Ok(TransitionOutcome {
                event: WorkflowEvent::StepApproved,
                status: self.status,
                acted_step: Some(acted),
            })
        }
    }

    /// One veto ends the chain: rejection by any pending step's eligible
    /// approver is terminal for the whole workflow.
    pub fn reject<M: RoleMembership>(
        &mut self,
        approver: &UserId,
        reason: &str,
        membership: &M,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, WorkflowError> {
        self.ensure_open()?;

        if approver == &self.initiated_by {
            return Err(WorkflowError::SelfApproval { user: approver.0.clone() });
        }

        let step = self
            .steps
            .iter_mut()
            .filter(|step| step.status == StepStatus::Pending)
            .find(|step| step.actionable_by(approver, membership))
            .ok_or_else(|| WorkflowError::NotAssigned { user: approver.0.clone() })?;

        let acted = step.step_order;
        step.status = StepStatus::Rejected;
        step.approved_by = Some(approver.clone());
        step.approved_at = Some(now);
        step.comments = Some(reason.to_string());

        self.skip_remaining_pending();
        self.status = WorkflowStatus::Rejected;
        self.rejection_reason = Some(reason.to_string());
        self.completed_at = Some(now);
        self.completed_by = Some(approver.clone());

        Ok(TransitionOutcome {
            event: WorkflowEvent::Rejected,
            status: self.status,
            acted_step: Some(acted),
        })
    }

    /// Move the active step one rung up the ladder (`next_role = Some`) or,
    /// when the ladder is exhausted, expire the workflow for manual handling.
    /// The caller computes the next rung; the aggregate owns the transition.
    pub fn escalate(
        &mut self,
        next_role: Option<RoleCode>,
        reason: &str,
        new_deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, WorkflowError> {
        self.ensure_open()?;

        let step = self
            .steps
            .iter_mut()
            .find(|step| step.status == StepStatus::Pending)
            .ok_or_else(|| {
                WorkflowError::InvariantViolation("open workflow has no pending step".to_string())
            })?;
        let acted = step.step_order;

        match next_role {
            Some(role) => {
                step.is_escalated = true;
                step.approver_role = Some(role);
                step.assigned_to = None;
                self.status = WorkflowStatus::InProgress;
                self.escalated_at = Some(now);
                self.escalation_reason = Some(reason.to_string());
                self.approval_deadline = new_deadline;
                Ok(TransitionOutcome {
                    event: WorkflowEvent::Escalated,
                    status: self.status,
                    acted_step: Some(acted),
                })
            }
            None => {
                step.is_escalated = true;
                step.status = StepStatus::Escalated;
                self.skip_remaining_pending();
                self.status = WorkflowStatus::Expired;
                self.escalated_at = Some(now);
                self.escalation_reason = Some(reason.to_string());
                self.completed_at = Some(now);
                Ok(TransitionOutcome {
                    event: WorkflowEvent::Expired,
                    status: self.status,
                    acted_step: Some(acted),
                })
            }
        }
    }

    /// Cooperative cancellation: succeeds only while the workflow is open.
    pub fn cancel(
        &mut self,
        cancelled_by: &UserId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, WorkflowError> {
        self.ensure_open()?;

        self.skip_remaining_pending();
        self.status = WorkflowStatus::Cancelled;
        self.cancelled_by = Some(cancelled_by.clone());
        self.cancellation_reason = Some(reason.to_string());
        self.completed_at = Some(now);

        Ok(TransitionOutcome {
            event: WorkflowEvent::Cancelled,
            status: self.status,
            acted_step: None,
        })
    }
}
