use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use countersign_core::domain::role::{Role, RoleAssignment};
use countersign_core::domain::signatory::{AccountId, AccountSignatory, SignatoryRule};
use countersign_core::domain::workflow::{WorkflowId, WorkflowInstance};

pub mod memory;
pub mod role;
pub mod signatory;
pub mod workflow;

pub use memory::{
    InMemoryRoleRepository, InMemorySignatoryRepository, InMemoryWorkflowRepository,
};
pub use role::SqlRoleRepository;
pub use signatory::SqlSignatoryRepository;
pub use workflow::SqlWorkflowRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("workflow {workflow_id} was modified concurrently")]
    VersionConflict { workflow_id: String },
}

#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    async fn insert(&self, workflow: &WorkflowInstance) -> Result<(), RepositoryError>;

    async fn find_by_id(
        &self,
        id: &WorkflowId,
    ) -> Result<Option<WorkflowInstance>, RepositoryError>;

    /// Compare-and-swap update keyed on `workflow.version`. The stored row
    /// must still carry that version; on success the row is written with
    /// `version + 1`. A stale version surfaces as `VersionConflict`.
    async fn update(&self, workflow: &WorkflowInstance) -> Result<(), RepositoryError>;

    async fn list_open_past_deadline(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError>;
}

#[async_trait]
pub trait RoleRepository: Send + Sync {
    async fn list_roles(&self) -> Result<Vec<Role>, RepositoryError>;
    async fn save_role(&self, role: Role) -> Result<(), RepositoryError>;
    async fn list_assignments(&self) -> Result<Vec<RoleAssignment>, RepositoryError>;
    async fn save_assignment(&self, assignment: RoleAssignment) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait SignatoryRepository: Send + Sync {
    async fn list_rules(&self) -> Result<Vec<SignatoryRule>, RepositoryError>;
    async fn save_rule(&self, rule: SignatoryRule) -> Result<(), RepositoryError>;
    async fn list_signatories(
        &self,
        account: Option<&AccountId>,
    ) -> Result<Vec<AccountSignatory>, RepositoryError>;
    async fn save_signatory(&self, signatory: AccountSignatory) -> Result<(), RepositoryError>;
}
