use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::Row;

use countersign_core::domain::role::RoleCode;
use countersign_core::domain::signatory::AccountId;
use countersign_core::domain::workflow::{
    ApprovalStep, Priority, ResourceId, StepStatus, UserId, WorkflowId, WorkflowInstance,
    WorkflowStatus, WorkflowType,
};

use super::{RepositoryError, WorkflowRepository};
use crate::DbPool;

pub struct SqlWorkflowRepository {
    pool: DbPool,
}

impl SqlWorkflowRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn decode<T>(value: Result<T, sqlx::Error>) -> Result<T, RepositoryError> {
    value.map_err(|e| RepositoryError::Decode(e.to_string()))
}

fn parse_datetime(value: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Decode(format!("bad timestamp `{value}`: {e}")))
}

fn parse_opt_datetime(value: Option<String>) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.as_deref().map(parse_datetime).transpose()
}

fn parse_opt_decimal(value: Option<String>) -> Result<Option<Decimal>, RepositoryError> {
    value
        .as_deref()
        .map(|s| Decimal::from_str(s).map_err(|e| RepositoryError::Decode(format!("bad amount `{s}`: {e}"))))
        .transpose()
}

fn row_to_step(row: &sqlx::sqlite::SqliteRow) -> Result<ApprovalStep, RepositoryError> {
    let step_order: i64 = decode(row.try_get("step_order"))?;
    let approver_role: Option<String> = decode(row.try_get("approver_role"))?;
    let assigned_to: Option<String> = decode(row.try_get("assigned_to"))?;
    let approved_by: Option<String> = decode(row.try_get("approved_by"))?;
    let status_str: String = decode(row.try_get("status"))?;
    let approved_at: Option<String> = decode(row.try_get("approved_at"))?;
    let comments: Option<String> = decode(row.try_get("comments"))?;
    let is_escalated: i64 = decode(row.try_get("is_escalated"))?;

    let status = StepStatus::parse(&status_str)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown step status `{status_str}`")))?;

    Ok(ApprovalStep {
        step_order: step_order as u32,
        approver_role: approver_role.map(RoleCode),
        assigned_to: assigned_to.map(UserId),
        approved_by: approved_by.map(UserId),
        status,
        approved_at: parse_opt_datetime(approved_at)?,
        comments,
        is_escalated: is_escalated != 0,
    })
}

fn row_to_workflow(
    row: &sqlx::sqlite::SqliteRow,
    steps: Vec<ApprovalStep>,
) -> Result<WorkflowInstance, RepositoryError> {
    let id: String = decode(row.try_get("id"))?;
    let workflow_type_str: String = decode(row.try_get("workflow_type"))?;
    let resource_type: String = decode(row.try_get("resource_type"))?;
    let resource_id: String = decode(row.try_get("resource_id"))?;
    let account_id: Option<String> = decode(row.try_get("account_id"))?;
    let amount: Option<String> = decode(row.try_get("amount"))?;
    let priority_str: String = decode(row.try_get("priority"))?;
    let status_str: String = decode(row.try_get("status"))?;
    let initiated_by: String = decode(row.try_get("initiated_by"))?;
    let initiated_at: String = decode(row.try_get("initiated_at"))?;
    let approval_deadline: String = decode(row.try_get("approval_deadline"))?;
    let completed_at: Option<String> = decode(row.try_get("completed_at"))?;
    let completed_by: Option<String> = decode(row.try_get("completed_by"))?;
    let cancelled_by: Option<String> = decode(row.try_get("cancelled_by"))?;
    let rejection_reason: Option<String> = decode(row.try_get("rejection_reason"))?;
    let cancellation_reason: Option<String> = decode(row.try_get("cancellation_reason"))?;
    let escalation_reason: Option<String> = decode(row.try_get("escalation_reason"))?;
    let escalated_at: Option<String> = decode(row.try_get("escalated_at"))?;
    let required_signatures: Option<i64> = decode(row.try_get("required_signatures"))?;
    let correlation_id: String = decode(row.try_get("correlation_id"))?;
    let version: i64 = decode(row.try_get("version"))?;

    let workflow_type = WorkflowType::parse(&workflow_type_str).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown workflow type `{workflow_type_str}`"))
    })?;
    let priority = Priority::parse(&priority_str)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown priority `{priority_str}`")))?;
    let status = WorkflowStatus::parse(&status_str)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown status `{status_str}`")))?;

    Ok(WorkflowInstance {
        id: WorkflowId(id),
        workflow_type,
        resource_type,
        resource_id: ResourceId(resource_id),
        account_id: account_id.map(AccountId),
        amount: parse_opt_decimal(amount)?,
        priority,
        status,
        initiated_by: UserId(initiated_by),
        initiated_at: parse_datetime(&initiated_at)?,
        approval_deadline: parse_datetime(&approval_deadline)?,
        completed_at: parse_opt_datetime(completed_at)?,
        completed_by: completed_by.map(UserId),
        cancelled_by: cancelled_by.map(UserId),
        rejection_reason,
        cancellation_reason,
        escalation_reason,
        escalated_at: parse_opt_datetime(escalated_at)?,
        required_signatures: required_signatures.map(|value| value as u32),
        correlation_id,
        version: version as u32,
        steps,
    })
}

const WORKFLOW_COLUMNS: &str = "id, workflow_type, resource_type, resource_id, account_id, amount,
        priority, status, initiated_by, initiated_at, approval_deadline, completed_at,
        completed_by, cancelled_by, rejection_reason, cancellation_reason, escalation_reason,
        escalated_at, required_signatures, correlation_id, version";

async fn insert_steps(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    workflow_id: &WorkflowId,
    steps: &[ApprovalStep],
) -> Result<(), RepositoryError> {
    for step in steps {
        sqlx::query(
            "INSERT INTO approval_step (workflow_id, step_order, approver_role, assigned_to,
                                        approved_by, status, approved_at, comments, is_escalated)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&workflow_id.0)
        .bind(step.step_order as i64)
        .bind(step.approver_role.as_ref().map(|role| role.0.as_str()))
        .bind(step.assigned_to.as_ref().map(|user| user.0.as_str()))
        .bind(step.approved_by.as_ref().map(|user| user.0.as_str()))
        .bind(step.status.as_str())
        .bind(step.approved_at.map(|dt| dt.to_rfc3339()))
        .bind(step.comments.as_deref())
        .bind(i64::from(step.is_escalated))
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn load_steps(
    pool: &DbPool,
    workflow_id: &str,
) -> Result<Vec<ApprovalStep>, RepositoryError> {
    let rows = sqlx::query(
        "SELECT step_order, approver_role, assigned_to, approved_by, status,
                approved_at, comments, is_escalated
         FROM approval_step WHERE workflow_id = ? ORDER BY step_order ASC",
    )
    .bind(workflow_id)
    .fetch_all(pool)
    .await?;

    rows.iter().map(row_to_step).collect()
}

#[async_trait::async_trait]
impl WorkflowRepository for SqlWorkflowRepository {
    async fn insert(&self, workflow: &WorkflowInstance) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            "INSERT INTO workflow_instance ({WORKFLOW_COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&workflow.id.0)
        .bind(workflow.workflow_type.as_str())
        .bind(&workflow.resource_type)
        .bind(&workflow.resource_id.0)
        .bind(workflow.account_id.as_ref().map(|account| account.0.as_str()))
        .bind(workflow.amount.map(|amount| amount.to_string()))
        .bind(workflow.priority.as_str())
        .bind(workflow.status.as_str())
        .bind(&workflow.initiated_by.0)
        .bind(workflow.initiated_at.to_rfc3339())
        .bind(workflow.approval_deadline.to_rfc3339())
        .bind(workflow.completed_at.map(|dt| dt.to_rfc3339()))
        .bind(workflow.completed_by.as_ref().map(|user| user.0.as_str()))
        .bind(workflow.cancelled_by.as_ref().map(|user| user.0.as_str()))
        .bind(workflow.rejection_reason.as_deref())
        .bind(workflow.cancellation_reason.as_deref())
        .bind(workflow.escalation_reason.as_deref())
        .bind(workflow.escalated_at.map(|dt| dt.to_rfc3339()))
        .bind(workflow.required_signatures.map(|value| value as i64))
        .bind(&workflow.correlation_id)
        .bind(workflow.version as i64)
        .execute(&mut *tx)
        .await?;

        insert_steps(&mut tx, &workflow.id, &workflow.steps).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn find_by_id(
        &self,
        id: &WorkflowId,
    ) -> Result<Option<WorkflowInstance>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflow_instance WHERE id = ?"
        ))
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(ref row) => {
                let steps = load_steps(&self.pool, &id.0).await?;
                Ok(Some(row_to_workflow(row, steps)?))
            }
            None => Ok(None),
        }
    }

    async fn update(&self, workflow: &WorkflowInstance) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE workflow_instance SET
                 status = ?, approval_deadline = ?, completed_at = ?, completed_by = ?,
                 cancelled_by = ?, rejection_reason = ?, cancellation_reason = ?,
                 escalation_reason = ?, escalated_at = ?, version = ?
             WHERE id = ? AND version = ?",
        )
        .bind(workflow.status.as_str())
        .bind(workflow.approval_deadline.to_rfc3339())
        .bind(workflow.completed_at.map(|dt| dt.to_rfc3339()))
        .bind(workflow.completed_by.as_ref().map(|user| user.0.as_str()))
        .bind(workflow.cancelled_by.as_ref().map(|user| user.0.as_str()))
        .bind(workflow.rejection_reason.as_deref())
        .bind(workflow.cancellation_reason.as_deref())
        .bind(workflow.escalation_reason.as_deref())
        .bind(workflow.escalated_at.map(|dt| dt.to_rfc3339()))
        .bind((workflow.version as i64) + 1)
        .bind(&workflow.id.0)
        .bind(workflow.version as i64)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(RepositoryError::VersionConflict { workflow_id: workflow.id.0.clone() });
        }

        sqlx::query("DELETE FROM approval_step WHERE workflow_id = ?")
            .bind(&workflow.id.0)
            .execute(&mut *tx)
            .await?;
        insert_steps(&mut tx, &workflow.id, &workflow.steps).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn list_open_past_deadline(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflow_instance
             WHERE status IN ('initiated', 'in_progress') AND approval_deadline < ?
             ORDER BY approval_deadline ASC
             LIMIT ?"
        ))
        .bind(now.to_rfc3339())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut workflows = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: String = decode(row.try_get("id"))?;
            let steps = load_steps(&self.pool, &id).await?;
            workflows.push(row_to_workflow(row, steps)?);
        }
        Ok(workflows)
    }
}
