pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;
pub mod registry;
pub mod router;
pub mod signatory;

pub use audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink, InMemoryAuditSink};
pub use config::{AppConfig, ConfigError, LoadOptions, SlaConfig};
pub use domain::role::{Role, RoleAssignment, RoleCode};
pub use domain::signatory::{AccountId, AccountSignatory, SignatoryRule, SignatoryType};
pub use domain::workflow::{
    ApprovalStep, NewWorkflow, Priority, ResourceId, StepStatus, TransitionOutcome, UserId,
    WorkflowEvent, WorkflowId, WorkflowInstance, WorkflowStatus, WorkflowType,
};
pub use errors::WorkflowError;
pub use registry::{RoleDirectory, RoleMembership, RoleRegistry};
pub use router::{ApprovalStepSpec, ChainPlan, ChainRequest, WorkflowRouter};
pub use signatory::{SignatoryEvaluator, SignatorySpec};
