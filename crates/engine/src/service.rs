use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use countersign_core::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink};
use countersign_core::domain::workflow::{
    ApprovalStep, NewWorkflow, TransitionOutcome, UserId, WorkflowEvent, WorkflowId,
    WorkflowInstance,
};
use countersign_core::errors::WorkflowError;
use countersign_core::registry::RoleMembership;
use countersign_core::router::{ChainRequest, WorkflowRouter};
use countersign_db::repositories::{RepositoryError, WorkflowRepository};

use crate::notify::{Notification, NotificationGateway, NotifyTarget};

/// Production sink: every audit event becomes one structured log line.
#[derive(Clone, Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, event: AuditEvent) {
        info!(
            event_name = "audit.recorded",
            event_type = %event.event_type,
            workflow_id = event.workflow_id.as_ref().map(|id| id.0.as_str()).unwrap_or("unknown"),
            correlation_id = %event.correlation_id,
            category = ?event.category,
            actor = %event.actor,
            outcome = ?event.outcome,
            metadata = ?event.metadata,
        );
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
    #[error("storage error: {0}")]
    Repository(#[from] RepositoryError),
    #[error("workflow {workflow_id} not found")]
    NotFound { workflow_id: String },
}

impl EngineError {
    /// A losing concurrent action on an already-finished workflow, not a
    /// caller mistake.
    pub fn is_benign_race(&self) -> bool {
        matches!(self, Self::Workflow(error) if error.is_benign_race())
    }
}

/// Orchestrates the full workflow lifecycle: routes new requests into
/// approval chains, applies caller actions through the state machine, and
/// persists each transition under optimistic concurrency. Conflicting writes
/// are retried against a fresh read, bounded by `conflict_retry_limit`.
pub struct ApprovalService<M> {
    router: WorkflowRouter<M>,
    workflows: Arc<dyn WorkflowRepository>,
    audit: Arc<dyn AuditSink>,
    gateway: Arc<dyn NotificationGateway>,
    conflict_retry_limit: u32,
}

impl<M> ApprovalService<M>
where
    M: RoleMembership + Send + Sync,
{
    pub fn new(
        router: WorkflowRouter<M>,
        workflows: Arc<dyn WorkflowRepository>,
        audit: Arc<dyn AuditSink>,
        gateway: Arc<dyn NotificationGateway>,
        conflict_retry_limit: u32,
    ) -> Self {
        Self { router, workflows, audit, gateway, conflict_retry_limit: conflict_retry_limit.max(1) }
    }

    pub fn router(&self) -> &WorkflowRouter<M> {
        &self.router
    }

    /// Routes the request into an approval chain and persists the new
    /// workflow. Refusals from the router (no eligible approver, missing
    /// amount) surface before anything is written.
    pub async fn request_approval(
        &self,
        request: ChainRequest,
        correlation_id: String,
    ) -> Result<WorkflowInstance, EngineError> {
        let now = Utc::now();
        let plan = self.router.build_chain(&request, now)?;

        let steps = plan
            .steps
            .iter()
            .enumerate()
            .map(|(index, spec)| {
                ApprovalStep::pending(
                    index as u32,
                    spec.approver_role.clone(),
                    spec.assigned_to.clone(),
                )
            })
            .collect();

        let workflow = WorkflowInstance::new(NewWorkflow {
            id: WorkflowId(format!("wf-{}", Uuid::new_v4())),
            workflow_type: request.workflow_type,
            resource_type: request.resource_type,
            resource_id: request.resource_id,
            account_id: request.account,
            amount: request.amount,
            priority: request.priority,
            initiated_by: request.initiated_by.clone(),
            initiated_at: now,
            approval_deadline: plan.approval_deadline,
            required_signatures: plan.required_signatures,
            correlation_id: correlation_id.clone(),
            steps,
        })?;

        self.workflows.insert(&workflow).await?;

        info!(
            event_name = "workflow.initiated",
            workflow_id = %workflow.id.0,
            workflow_type = workflow.workflow_type.as_str(),
            steps = workflow.steps.len(),
            initiated_by = %request.initiated_by.0,
        );
        self.audit.emit(
            AuditEvent::new(
                Some(workflow.id.clone()),
                correlation_id,
                WorkflowEvent::Initiated.as_str(),
                AuditCategory::Routing,
                request.initiated_by.0.clone(),
                AuditOutcome::Success,
            )
            .with_metadata("steps", workflow.steps.len().to_string())
            .with_metadata("deadline", workflow.approval_deadline.to_rfc3339()),
        );

        if let Some(step) = workflow.active_step() {
            self.gateway
                .notify(Notification::for_event(
                    workflow.id.clone(),
                    workflow.correlation_id.clone(),
                    WorkflowEvent::Initiated,
                    step_target(step),
                    "approval requested".to_string(),
                ))
                .await;
        }

        Ok(workflow)
    }

    pub async fn approve(
        &self,
        id: &WorkflowId,
        approver: &UserId,
        comments: Option<String>,
    ) -> Result<(WorkflowInstance, TransitionOutcome), EngineError> {
        self.apply(id, &approver.0, move |workflow, membership| {
            workflow.approve(approver, comments.clone(), membership, Utc::now())
        })
        .await
    }

    pub async fn reject(
        &self,
        id: &WorkflowId,
        approver: &UserId,
        reason: &str,
    ) -> Result<(WorkflowInstance, TransitionOutcome), EngineError> {
        self.apply(id, &approver.0, move |workflow, membership| {
            workflow.reject(approver, reason, membership, Utc::now())
        })
        .await
    }

    pub async fn cancel(
        &self,
        id: &WorkflowId,
        cancelled_by: &UserId,
        reason: &str,
    ) -> Result<(WorkflowInstance, TransitionOutcome), EngineError> {
        self.apply(id, &cancelled_by.0, move |workflow, _membership| {
            workflow.cancel(cancelled_by, reason, Utc::now())
        })
        .await
    }

    /// Moves an overdue workflow one rung up the ladder, or expires it when
    /// the ladder is exhausted. The deadline is refreshed on escalation and
    /// re-checked against every read, so concurrent callers acting on one
    /// breach escalate the workflow at most once: the loser re-reads a
    /// workflow that is no longer overdue and gets `EscalationNotDue`.
    pub async fn escalate(
        &self,
        id: &WorkflowId,
        reason: &str,
        triggered_by: &str,
        now: DateTime<Utc>,
    ) -> Result<(WorkflowInstance, TransitionOutcome), EngineError> {
        let router = &self.router;
        self.apply(id, triggered_by, move |workflow, _membership| {
            if workflow.status.is_terminal() {
                return Err(WorkflowError::AlreadyResolved {
                    workflow_id: workflow.id.0.clone(),
                    status: workflow.status,
                });
            }
            if !workflow.is_overdue(now) {
                return Err(WorkflowError::EscalationNotDue {
                    workflow_id: workflow.id.0.clone(),
                });
            }
            let current_role =
                workflow.active_step().and_then(|step| step.approver_role.clone());
            let target = router.escalation_target(current_role.as_ref(), workflow.amount)?;
            let new_deadline = router.sla().deadline_for(workflow.priority, now);
            workflow.escalate(target, reason, new_deadline, now)
        })
        .await
    }

    async fn apply<F>(
        &self,
        id: &WorkflowId,
        actor: &str,
        transition: F,
    ) -> Result<(WorkflowInstance, TransitionOutcome), EngineError>
    where
        F: Fn(&mut WorkflowInstance, &M) -> Result<TransitionOutcome, WorkflowError>,
    {
        let mut attempt = 0;
        loop {
            let mut workflow = self
                .workflows
                .find_by_id(id)
                .await?
                .ok_or_else(|| EngineError::NotFound { workflow_id: id.0.clone() })?;

            let outcome = match transition(&mut workflow, self.router.membership()) {
                Ok(outcome) => outcome,
                Err(error) => {
                    self.emit_refusal(&workflow, actor, &error);
                    return Err(error.into());
                }
            };

            match self.workflows.update(&workflow).await {
                Ok(()) => {
                    workflow.version += 1;
                    self.emit_applied(&workflow, actor, &outcome).await;
                    return Ok((workflow, outcome));
                }
                Err(RepositoryError::VersionConflict { .. }) if attempt < self.conflict_retry_limit => {
                    attempt += 1;
                    info!(
                        event_name = "workflow.conflict_retry",
                        workflow_id = %id.0,
                        attempt,
                    );
                }
                Err(RepositoryError::VersionConflict { workflow_id }) => {
                    warn!(
                        event_name = "workflow.conflict_retries_exhausted",
                        workflow_id = %workflow_id,
                        attempts = attempt,
                    );
                    return Err(WorkflowError::ConcurrentModification { workflow_id }.into());
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    fn emit_refusal(&self, workflow: &WorkflowInstance, actor: &str, error: &WorkflowError) {
        let outcome =
            if error.is_benign_race() { AuditOutcome::Success } else { AuditOutcome::Rejected };
        self.audit.emit(
            AuditEvent::new(
                Some(workflow.id.clone()),
                workflow.correlation_id.clone(),
                "workflow.action_refused",
                AuditCategory::Workflow,
                actor,
                outcome,
            )
            .with_metadata("reason", error.to_string()),
        );
    }

    async fn emit_applied(
        &self,
        workflow: &WorkflowInstance,
        actor: &str,
        outcome: &TransitionOutcome,
    ) {
        info!(
            event_name = outcome.event.as_str(),
            workflow_id = %workflow.id.0,
            status = workflow.status.as_str(),
            actor,
        );

        let category = match outcome.event {
            WorkflowEvent::Escalated | WorkflowEvent::Expired => AuditCategory::Escalation,
            _ => AuditCategory::Workflow,
        };
        let mut event = AuditEvent::new(
            Some(workflow.id.clone()),
            workflow.correlation_id.clone(),
            outcome.event.as_str(),
            category,
            actor,
            AuditOutcome::Success,
        )
        .with_metadata("status", workflow.status.as_str());
        if let Some(step_order) = outcome.acted_step {
            event = event.with_metadata("step_order", step_order.to_string());
        }
        self.audit.emit(event);

        let target = match outcome.event {
            // pending work moved or arrived at a new target
            WorkflowEvent::StepApproved | WorkflowEvent::Escalated => {
                workflow.active_step().and_then(step_target)
            }
            // terminal outcomes go back to the initiator
            _ => Some(NotifyTarget::User(workflow.initiated_by.clone())),
        };
        self.gateway
            .notify(Notification::for_event(
                workflow.id.clone(),
                workflow.correlation_id.clone(),
                outcome.event,
                target,
                format!("workflow is now {}", workflow.status.as_str()),
            ))
            .await;
    }
}

fn step_target(step: &ApprovalStep) -> Option<NotifyTarget> {
    step.assigned_to
        .clone()
        .map(NotifyTarget::User)
        .or_else(|| step.approver_role.clone().map(NotifyTarget::Role))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use rust_decimal::Decimal;

    use countersign_core::audit::InMemoryAuditSink;
    use countersign_core::config::SlaConfig;
    use countersign_core::domain::role::{Role, RoleAssignment, RoleCode};
    use countersign_core::domain::signatory::{
        AccountId, AccountSignatory, SignatoryRule, SignatoryType,
    };
    use countersign_core::domain::workflow::{
        Priority, ResourceId, UserId, WorkflowEvent, WorkflowStatus, WorkflowType,
    };
    use countersign_core::errors::WorkflowError;
    use countersign_core::registry::{RoleDirectory, RoleRegistry};
    use countersign_core::router::{ChainRequest, WorkflowRouter};
    use countersign_core::signatory::SignatoryEvaluator;
    use countersign_db::repositories::InMemoryWorkflowRepository;

    use super::{ApprovalService, EngineError};
    use crate::notify::test_support::RecordingGateway;

    fn role(code: &str, limit: Option<i64>) -> Role {
        Role {
            code: RoleCode(code.to_string()),
            name: code.to_string(),
            approval_limit: limit.map(|value| Decimal::new(value, 0)),
            active: true,
            created_at: Utc::now(),
        }
    }

    fn assignment(user: &str, role: &str) -> RoleAssignment {
        RoleAssignment {
            user_id: UserId(user.to_string()),
            role: RoleCode(role.to_string()),
            active: true,
            assigned_at: Utc::now(),
        }
    }

    fn service() -> (Arc<ApprovalService<RoleDirectory>>, InMemoryAuditSink, RecordingGateway) {
        service_with(SignatoryEvaluator::default())
    }

    fn service_with(
        evaluator: SignatoryEvaluator,
    ) -> (Arc<ApprovalService<RoleDirectory>>, InMemoryAuditSink, RecordingGateway) {
        let registry = RoleRegistry::new(vec![
            role("teller", Some(10_000)),
            role("supervisor", Some(50_000)),
            role("branch_manager", None),
        ]);
        let directory = RoleDirectory::from_assignments(vec![
            assignment("u-teller", "teller"),
            assignment("u-supervisor", "supervisor"),
            assignment("u-supervisor-2", "supervisor"),
            assignment("u-manager", "branch_manager"),
        ]);
        let router = WorkflowRouter::new(
            registry,
            directory,
            evaluator,
            SlaConfig { high_hours: 4, normal_hours: 24, low_hours: 72 },
            RoleCode("branch_manager".to_string()),
        );
        let audit = InMemoryAuditSink::default();
        let gateway = RecordingGateway::default();
        let service = Arc::new(ApprovalService::new(
            router,
            Arc::new(InMemoryWorkflowRepository::default()),
            Arc::new(audit.clone()),
            Arc::new(gateway.clone()),
            3,
        ));
        (service, audit, gateway)
    }

    fn cash_request(amount: i64, initiator: &str) -> ChainRequest {
        ChainRequest {
            workflow_type: WorkflowType::CashAuthorization,
            resource_type: "till".to_string(),
            resource_id: ResourceId("till-7".to_string()),
            amount: Some(Decimal::new(amount, 0)),
            priority: Priority::Normal,
            initiated_by: UserId(initiator.to_string()),
            account: None,
        }
    }

    #[tokio::test]
    async fn full_chain_approval_completes_the_workflow() {
        let (service, audit, gateway) = service();

        let workflow = service
            .request_approval(cash_request(80_000, "u-teller"), "req-1".to_string())
            .await
            .expect("routed");
        assert_eq!(workflow.steps.len(), 2);

        let (_, first) = service
            .approve(&workflow.id, &UserId("u-supervisor".to_string()), None)
            .await
            .expect("first approval");
        assert_eq!(first.event, WorkflowEvent::StepApproved);

        let (finished, second) = service
            .approve(&workflow.id, &UserId("u-manager".to_string()), Some("ok".to_string()))
            .await
            .expect("final approval");
        assert_eq!(second.event, WorkflowEvent::Approved);
        assert_eq!(finished.status, WorkflowStatus::Approved);
        assert_eq!(finished.distinct_approvers(), 2);

        let trail: Vec<String> =
            audit.events().into_iter().map(|event| event.event_type).collect();
        assert_eq!(
            trail,
            vec!["workflow.initiated", "workflow.step_approved", "workflow.approved"]
        );

        // initiated + step handoff + completion back to the initiator
        assert_eq!(gateway.sent().len(), 3);
    }

    #[tokio::test]
    async fn racing_final_approvals_complete_exactly_once() {
        let (service, _audit, _gateway) = service();

        let workflow = service
            .request_approval(cash_request(30_000, "u-teller"), "req-1".to_string())
            .await
            .expect("routed");
        assert_eq!(workflow.steps.len(), 1);

        let first = {
            let service = Arc::clone(&service);
            let id = workflow.id.clone();
            tokio::spawn(async move {
                service.approve(&id, &UserId("u-supervisor".to_string()), None).await
            })
        };
        let second = {
            let service = Arc::clone(&service);
            let id = workflow.id.clone();
            tokio::spawn(async move {
                service.approve(&id, &UserId("u-supervisor-2".to_string()), None).await
            })
        };

        let results = [first.await.expect("join"), second.await.expect("join")];
        let successes = results.iter().filter(|result| result.is_ok()).count();
        let benign_losses = results
            .iter()
            .filter(|result| {
                matches!(result, Err(error) if error.is_benign_race())
            })
            .count();

        assert_eq!(successes, 1);
        assert_eq!(benign_losses, 1);
    }

    #[tokio::test]
    async fn rejection_is_terminal_and_keeps_the_reason() {
        let (service, _audit, _gateway) = service();

        let workflow = service
            .request_approval(cash_request(80_000, "u-teller"), "req-1".to_string())
            .await
            .expect("routed");

        let (rejected, outcome) = service
            .reject(&workflow.id, &UserId("u-supervisor".to_string()), "docs missing")
            .await
            .expect("reject");
        assert_eq!(outcome.event, WorkflowEvent::Rejected);
        assert_eq!(rejected.status, WorkflowStatus::Rejected);
        assert_eq!(rejected.rejection_reason.as_deref(), Some("docs missing"));

        let error = service
            .approve(&workflow.id, &UserId("u-manager".to_string()), None)
            .await
            .unwrap_err();
        assert!(error.is_benign_race());
    }

    #[tokio::test]
    async fn escalation_climbs_then_expires_at_the_top() {
        let (service, _audit, _gateway) = service();

        let workflow = service
            .request_approval(cash_request(30_000, "u-teller"), "req-1".to_string())
            .await
            .expect("routed");

        let first_breach = Utc::now() + chrono::Duration::hours(25);
        let (escalated, outcome) = service
            .escalate(&workflow.id, "approval SLA breached", "scheduler", first_breach)
            .await
            .expect("escalate");
        assert_eq!(outcome.event, WorkflowEvent::Escalated);
        assert!(escalated.status.is_open());
        assert_eq!(
            escalated.active_step().and_then(|step| step.approver_role.clone()),
            Some(RoleCode("branch_manager".to_string()))
        );
        assert!(escalated.active_step().is_some_and(|step| step.is_escalated));

        let second_breach = first_breach + chrono::Duration::hours(25);
        let (expired, outcome) = service
            .escalate(&workflow.id, "approval SLA breached", "scheduler", second_breach)
            .await
            .expect("expire");
        assert_eq!(outcome.event, WorkflowEvent::Expired);
        assert_eq!(expired.status, WorkflowStatus::Expired);
    }

    #[tokio::test]
    async fn escalation_before_the_deadline_is_a_benign_refusal() {
        let (service, _audit, _gateway) = service();

        let workflow = service
            .request_approval(cash_request(30_000, "u-teller"), "req-1".to_string())
            .await
            .expect("routed");

        let error = service
            .escalate(&workflow.id, "approval SLA breached", "u-admin", Utc::now())
            .await
            .unwrap_err();
        assert!(error.is_benign_race());

        // the refusal left the chain untouched; a real breach still escalates
        let (escalated, outcome) = service
            .escalate(
                &workflow.id,
                "approval SLA breached",
                "u-admin",
                Utc::now() + chrono::Duration::hours(25),
            )
            .await
            .expect("escalate");
        assert_eq!(outcome.event, WorkflowEvent::Escalated);
        assert_eq!(
            escalated.active_step().and_then(|step| step.approver_role.clone()),
            Some(RoleCode("branch_manager".to_string()))
        );
    }

    #[tokio::test]
    async fn racing_escalations_act_once_per_breach() {
        let (service, _audit, _gateway) = service();

        let workflow = service
            .request_approval(cash_request(30_000, "u-teller"), "req-1".to_string())
            .await
            .expect("routed");

        let breach = Utc::now() + chrono::Duration::hours(25);
        let first = {
            let service = Arc::clone(&service);
            let id = workflow.id.clone();
            tokio::spawn(async move {
                service.escalate(&id, "approval SLA breached", "scheduler", breach).await
            })
        };
        let second = {
            let service = Arc::clone(&service);
            let id = workflow.id.clone();
            tokio::spawn(async move {
                service.escalate(&id, "approval SLA breached", "scheduler", breach).await
            })
        };

        let results = [first.await.expect("join"), second.await.expect("join")];
        let successes = results.iter().filter(|result| result.is_ok()).count();
        let benign_losses = results
            .iter()
            .filter(|result| {
                matches!(result, Err(error) if error.is_benign_race())
            })
            .count();
        assert_eq!(successes, 1);
        assert_eq!(benign_losses, 1);

        // one breach moves the workflow one rung, never past the ladder
        let (stored, _) = results.into_iter().flatten().next().expect("winning escalation");
        assert!(stored.status.is_open());
        assert_eq!(
            stored.active_step().and_then(|step| step.approver_role.clone()),
            Some(RoleCode("branch_manager".to_string()))
        );
    }

    fn joint_mandate() -> SignatoryEvaluator {
        let now = Utc::now();
        let account = AccountId("acct-joint-001".to_string());
        let signatory = |user: &str, role: &str, offset: i64| AccountSignatory {
            account_id: account.clone(),
            user_id: UserId(user.to_string()),
            signatory_role: role.to_string(),
            active: true,
            added_at: now + chrono::Duration::seconds(offset),
        };
        SignatoryEvaluator::new(
            vec![SignatoryRule {
                account_id: account.clone(),
                signatory_type: SignatoryType::Joint,
                minimum_signatures: 2,
                maximum_amount: Some(Decimal::new(500_000, 0)),
                active: true,
                created_at: now,
            }],
            vec![
                signatory("u-a", "Director", 0),
                signatory("u-b", "Director", 1),
                signatory("u-c", "Trustee", 2),
            ],
        )
    }

    fn joint_transfer(amount: i64, initiator: &str) -> ChainRequest {
        ChainRequest {
            workflow_type: WorkflowType::HighValuePayment,
            resource_type: "payment".to_string(),
            resource_id: ResourceId("pay-42".to_string()),
            amount: Some(Decimal::new(amount, 0)),
            priority: Priority::Normal,
            initiated_by: UserId(initiator.to_string()),
            account: Some(AccountId("acct-joint-001".to_string())),
        }
    }

    #[tokio::test]
    async fn joint_mandate_collects_distinct_signatures_before_completion() {
        let (service, _audit, _gateway) = service_with(joint_mandate());

        let workflow = service
            .request_approval(joint_transfer(300_000, "u-a"), "req-1".to_string())
            .await
            .expect("routed");
        assert_eq!(workflow.required_signatures, Some(2));
        let assigned: Vec<&str> = workflow
            .steps
            .iter()
            .filter_map(|step| step.assigned_to.as_ref())
            .map(|user| user.0.as_str())
            .collect();
        // the initiator never signs their own payment
        assert_eq!(assigned, vec!["u-b", "u-c"]);

        // the step is pinned to its signatory; nobody else may act on it
        let error = service
            .approve(&workflow.id, &UserId("u-supervisor".to_string()), None)
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            EngineError::Workflow(WorkflowError::NotAssigned { .. })
        ));

        let (_, first) = service
            .approve(&workflow.id, &UserId("u-b".to_string()), None)
            .await
            .expect("first signature");
        assert_eq!(first.event, WorkflowEvent::StepApproved);

        let (finished, second) = service
            .approve(&workflow.id, &UserId("u-c".to_string()), None)
            .await
            .expect("second signature");
        assert_eq!(second.event, WorkflowEvent::Approved);
        assert_eq!(finished.status, WorkflowStatus::Approved);
        assert_eq!(finished.distinct_approvers(), 2);
    }

    #[tokio::test]
    async fn unknown_workflow_is_a_not_found() {
        let (service, _audit, _gateway) = service();
        let error = service
            .approve(
                &countersign_core::domain::workflow::WorkflowId("wf-missing".to_string()),
                &UserId("u-x".to_string()),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(error, EngineError::NotFound { .. }));
    }
}
