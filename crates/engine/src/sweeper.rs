use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use countersign_core::domain::workflow::WorkflowEvent;
use countersign_core::registry::RoleMembership;
use countersign_db::repositories::WorkflowRepository;

use crate::service::{ApprovalService, EngineError};

const SWEEP_BATCH_LIMIT: u32 = 100;
const SWEEP_REASON: &str = "approval SLA breached";
const SWEEP_ACTOR: &str = "scheduler";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub escalated: usize,
    pub expired: usize,
    pub failed: usize,
}

/// Periodically finds open workflows past their approval deadline and pushes
/// each one up the ladder (or into expiry). Escalation refreshes the
/// deadline, so a workflow is acted on at most once per breach even when
/// sweeps overlap.
pub struct EscalationSweeper<M> {
    service: Arc<ApprovalService<M>>,
    workflows: Arc<dyn WorkflowRepository>,
    interval: Duration,
}

impl<M> EscalationSweeper<M>
where
    M: RoleMembership + Send + Sync,
{
    pub fn new(
        service: Arc<ApprovalService<M>>,
        workflows: Arc<dyn WorkflowRepository>,
        interval: Duration,
    ) -> Self {
        Self { service, workflows, interval }
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(error) = self.sweep_once(Utc::now()).await {
                warn!(event_name = "escalation.sweep_failed", error = %error);
            }
        }
    }

    /// One pass over overdue workflows. A failure on one workflow is logged
    /// and does not stop the rest of the batch.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepSummary, EngineError> {
        let overdue = self.workflows.list_open_past_deadline(now, SWEEP_BATCH_LIMIT).await?;
        let mut summary = SweepSummary::default();

        for workflow in overdue {
            match self.service.escalate(&workflow.id, SWEEP_REASON, SWEEP_ACTOR, now).await {
                Ok((_, outcome)) if outcome.event == WorkflowEvent::Expired => {
                    summary.expired += 1;
                }
                Ok(_) => summary.escalated += 1,
                Err(error) if error.is_benign_race() => {}
                Err(error) => {
                    summary.failed += 1;
                    warn!(
                        event_name = "escalation.workflow_failed",
                        workflow_id = %workflow.id.0,
                        error = %error,
                    );
                }
            }
        }

        if summary != SweepSummary::default() {
            info!(
                event_name = "escalation.sweep_completed",
                escalated = summary.escalated,
                expired = summary.expired,
                failed = summary.failed,
            );
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use rust_decimal::Decimal;

    use countersign_core::audit::InMemoryAuditSink;
    use countersign_core::config::SlaConfig;
    use countersign_core::domain::role::{Role, RoleAssignment, RoleCode};
    use countersign_core::domain::workflow::{
        Priority, ResourceId, UserId, WorkflowStatus, WorkflowType,
    };
    use countersign_core::registry::{RoleDirectory, RoleRegistry};
    use countersign_core::router::{ChainRequest, WorkflowRouter};
    use countersign_core::signatory::SignatoryEvaluator;
    use countersign_db::repositories::{InMemoryWorkflowRepository, WorkflowRepository};

    use super::EscalationSweeper;
    use crate::notify::test_support::RecordingGateway;
    use crate::service::ApprovalService;

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

    fn sweeper() -> (EscalationSweeper<RoleDirectory>, Arc<ApprovalService<RoleDirectory>>) {
        let registry = RoleRegistry::new(vec![
            role("supervisor", Some(50_000)),
            role("branch_manager", None),
        ]);
        let directory = RoleDirectory::from_assignments(vec![
            assignment("u-supervisor", "supervisor"),
            assignment("u-manager", "branch_manager"),
        ]);
        let router = WorkflowRouter::new(
            registry,
            directory,
            SignatoryEvaluator::default(),
            SlaConfig { high_hours: 4, normal_hours: 24, low_hours: 72 },
            RoleCode("branch_manager".to_string()),
        );
        let workflows: Arc<InMemoryWorkflowRepository> =
            Arc::new(InMemoryWorkflowRepository::default());
        let service = Arc::new(ApprovalService::new(
            router,
            Arc::clone(&workflows) as Arc<dyn WorkflowRepository>,
            Arc::new(InMemoryAuditSink::default()),
            Arc::new(RecordingGateway::default()),
            3,
        ));
        let sweeper = EscalationSweeper::new(
            Arc::clone(&service),
            workflows as Arc<dyn WorkflowRepository>,
            Duration::from_secs(60),
        );
        (sweeper, service)
    }

    fn cash_request(amount: i64) -> ChainRequest {
        ChainRequest {
            workflow_type: WorkflowType::CashAuthorization,
            resource_type: "till".to_string(),
            resource_id: ResourceId("till-7".to_string()),
            amount: Some(Decimal::new(amount, 0)),
            priority: Priority::Normal,
            initiated_by: UserId("u-clerk".to_string()),
            account: None,
        }
    }

    #[tokio::test]
    async fn sweep_escalates_overdue_and_leaves_fresh_workflows_alone() {
        let (sweeper, service) = sweeper();

        let mut urgent = cash_request(30_000);
        urgent.priority = Priority::High;
        let overdue =
            service.request_approval(urgent, "req-1".to_string()).await.expect("routed");
        let fresh = service
            .request_approval(cash_request(30_000), "req-2".to_string())
            .await
            .expect("routed");

        // high priority (4h) is past its deadline, normal (24h) is not
        let summary = sweeper
            .sweep_once(Utc::now() + chrono::Duration::hours(5))
            .await
            .expect("sweep");
        assert_eq!(summary.escalated, 1);
        assert_eq!(summary.expired, 0);
        assert_eq!(summary.failed, 0);

        let escalated = sweeper
            .workflows
            .find_by_id(&overdue.id)
            .await
            .expect("find")
            .expect("exists");
        assert_eq!(
            escalated.active_step().and_then(|step| step.approver_role.clone()),
            Some(RoleCode("branch_manager".to_string()))
        );

        let untouched =
            sweeper.workflows.find_by_id(&fresh.id).await.expect("find").expect("exists");
        assert!(!untouched.active_step().expect("pending step").is_escalated);
    }

    #[tokio::test]
    async fn repeated_sweeps_do_not_double_escalate() {
        let (sweeper, service) = sweeper();

        let workflow = service
            .request_approval(cash_request(30_000), "req-1".to_string())
            .await
            .expect("routed");

        let after_deadline = Utc::now() + chrono::Duration::hours(25);
        let first = sweeper.sweep_once(after_deadline).await.expect("sweep");
        assert_eq!(first.escalated, 1);

        // the escalation refreshed the deadline, so the same instant finds
        // nothing to do
        let second = sweeper.sweep_once(after_deadline).await.expect("sweep");
        assert_eq!(second, super::SweepSummary::default());

        let stored =
            sweeper.workflows.find_by_id(&workflow.id).await.expect("find").expect("exists");
        assert!(stored.status.is_open());
    }

    #[tokio::test]
    async fn exhausted_ladder_expires_the_workflow() {
        let (sweeper, service) = sweeper();

        let workflow = service
            .request_approval(cash_request(30_000), "req-1".to_string())
            .await
            .expect("routed");

        let first_breach = Utc::now() + chrono::Duration::hours(25);
        sweeper.sweep_once(first_breach).await.expect("first sweep");

        let second_breach = first_breach + chrono::Duration::hours(25);
        let summary = sweeper.sweep_once(second_breach).await.expect("second sweep");
        assert_eq!(summary.expired, 1);

        let stored =
            sweeper.workflows.find_by_id(&workflow.id).await.expect("find").expect("exists");
        assert_eq!(stored.status, WorkflowStatus::Expired);
    }
}
