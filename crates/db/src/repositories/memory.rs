use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use countersign_core::domain::role::{Role, RoleAssignment};
use countersign_core::domain::signatory::{AccountId, AccountSignatory, SignatoryRule};
use countersign_core::domain::workflow::{WorkflowId, WorkflowInstance};

use super::{
    RepositoryError, RoleRepository, SignatoryRepository, WorkflowRepository,
};

#[derive(Default)]
pub struct InMemoryWorkflowRepository {
    workflows: RwLock<HashMap<String, WorkflowInstance>>,
}

#[async_trait::async_trait]
impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn insert(&self, workflow: &WorkflowInstance) -> Result<(), RepositoryError> {
        let mut workflows = self.workflows.write().await;
        workflows.insert(workflow.id.0.clone(), workflow.clone());
        Ok(())
    }

    async fn find_by_id(
        &self,
        id: &WorkflowId,
    ) -> Result<Option<WorkflowInstance>, RepositoryError> {
        let workflows = self.workflows.read().await;
        Ok(workflows.get(&id.0).cloned())
    }

    async fn update(&self, workflow: &WorkflowInstance) -> Result<(), RepositoryError> {
        let mut workflows = self.workflows.write().await;
        let stored = workflows.get(&workflow.id.0);
        match stored {
            Some(stored) if stored.version == workflow.version => {
                let mut next = workflow.clone();
                next.version += 1;
                workflows.insert(workflow.id.0.clone(), next);
                Ok(())
            }
            _ => Err(RepositoryError::VersionConflict { workflow_id: workflow.id.0.clone() }),
        }
    }

    async fn list_open_past_deadline(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let workflows = self.workflows.read().await;
        let mut due: Vec<WorkflowInstance> = workflows
            .values()
            .filter(|workflow| workflow.status.is_open() && workflow.approval_deadline < now)
            .cloned()
            .collect();
        due.sort_by(|a, b| a.approval_deadline.cmp(&b.approval_deadline));
        due.truncate(limit as usize);
        Ok(due)
    }
}

#[derive(Default)]
pub struct InMemoryRoleRepository {
    roles: RwLock<HashMap<String, Role>>,
    assignments: RwLock<HashMap<(String, String), RoleAssignment>>,
}

#[async_trait::async_trait]
impl RoleRepository for InMemoryRoleRepository {
    async fn list_roles(&self) -> Result<Vec<Role>, RepositoryError> {
        let roles = self.roles.read().await;
        let mut listed: Vec<Role> = roles.values().cloned().collect();
        listed.sort_by(|a, b| a.code.0.cmp(&b.code.0));
        Ok(listed)
    }

    async fn save_role(&self, role: Role) -> Result<(), RepositoryError> {
        let mut roles = self.roles.write().await;
        roles.insert(role.code.0.clone(), role);
        Ok(())
    }

    async fn list_assignments(&self) -> Result<Vec<RoleAssignment>, RepositoryError> {
        let assignments = self.assignments.read().await;
        let mut listed: Vec<RoleAssignment> = assignments.values().cloned().collect();
        listed.sort_by(|a, b| (&a.user_id.0, &a.role.0).cmp(&(&b.user_id.0, &b.role.0)));
        Ok(listed)
    }

    async fn save_assignment(&self, assignment: RoleAssignment) -> Result<(), RepositoryError> {
        let mut assignments = self.assignments.write().await;
        assignments
            .insert((assignment.user_id.0.clone(), assignment.role.0.clone()), assignment);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemorySignatoryRepository {
    rules: RwLock<HashMap<String, SignatoryRule>>,
    signatories: RwLock<HashMap<(String, String), AccountSignatory>>,
}

#[async_trait::async_trait]
impl SignatoryRepository for InMemorySignatoryRepository {
    async fn list_rules(&self) -> Result<Vec<SignatoryRule>, RepositoryError> {
        let rules = self.rules.read().await;
        let mut listed: Vec<SignatoryRule> = rules.values().cloned().collect();
        listed.sort_by(|a, b| a.account_id.0.cmp(&b.account_id.0));
        Ok(listed)
    }

    async fn save_rule(&self, rule: SignatoryRule) -> Result<(), RepositoryError> {
        let mut rules = self.rules.write().await;
        rules.insert(rule.account_id.0.clone(), rule);
        Ok(())
    }

    async fn list_signatories(
        &self,
        account: Option<&AccountId>,
    ) -> Result<Vec<AccountSignatory>, RepositoryError> {
        let signatories = self.signatories.read().await;
        let mut listed: Vec<AccountSignatory> = signatories
            .values()
            .filter(|signatory| account.map_or(true, |account| signatory.account_id == *account))
            .cloned()
            .collect();
        listed.sort_by(|a, b| (a.added_at, &a.user_id.0).cmp(&(b.added_at, &b.user_id.0)));
        Ok(listed)
    }

    async fn save_signatory(&self, signatory: AccountSignatory) -> Result<(), RepositoryError> {
        let mut signatories = self.signatories.write().await;
        signatories
            .insert((signatory.account_id.0.clone(), signatory.user_id.0.clone()), signatory);
        Ok(())
    }
}
