use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use countersign_core::config::{AppConfig, ConfigError, LoadOptions, NotifierMode};
use countersign_core::domain::role::RoleCode;
use countersign_core::registry::{RoleDirectory, RoleRegistry};
use countersign_core::router::WorkflowRouter;
use countersign_core::signatory::SignatoryEvaluator;
use countersign_db::repositories::{
    RepositoryError, RoleRepository, SignatoryRepository, SqlRoleRepository,
    SqlSignatoryRepository, SqlWorkflowRepository, WorkflowRepository,
};
use countersign_db::{connect, migrations, DbPool};
use countersign_engine::{
    ApprovalService, EscalationSweeper, NotificationGateway, TracingAuditSink,
    TracingNotificationGateway, WebhookNotificationGateway,
};

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub service: Arc<ApprovalService<RoleDirectory>>,
    pub sweeper: EscalationSweeper<RoleDirectory>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("loading reference data failed: {0}")]
    ReferenceData(#[from] RepositoryError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect_and_migrate(&config).await?;
    build_application(config, db_pool).await
}

pub async fn connect_and_migrate(config: &AppConfig) -> Result<DbPool, BootstrapError> {
    let db_pool = connect(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    Ok(db_pool)
}

/// Loads the role ladder and signatory mandates into memory and wires the
/// router, service, and sweeper. Reference data is read once at startup; a
/// restart picks up registry changes.
pub async fn build_application(
    config: AppConfig,
    db_pool: DbPool,
) -> Result<Application, BootstrapError> {
    let role_repo = SqlRoleRepository::new(db_pool.clone());
    let signatory_repo = SqlSignatoryRepository::new(db_pool.clone());

    let roles = role_repo.list_roles().await?;
    let assignments = role_repo.list_assignments().await?;
    let rules = signatory_repo.list_rules().await?;
    let signatories = signatory_repo.list_signatories(None).await?;
    info!(
        event_name = "system.bootstrap.reference_data_loaded",
        correlation_id = "bootstrap",
        roles = roles.len(),
        assignments = assignments.len(),
        signatory_rules = rules.len(),
    );

    let router = WorkflowRouter::new(
        RoleRegistry::new(roles),
        RoleDirectory::from_assignments(assignments),
        SignatoryEvaluator::new(rules, signatories),
        config.sla,
        RoleCode(config.routing.review_role.clone()),
    );

    let gateway: Arc<dyn NotificationGateway> = match config.notifier.mode {
        NotifierMode::Tracing => Arc::new(TracingNotificationGateway),
        NotifierMode::Webhook => {
            let url = config.notifier.webhook_url.clone().ok_or_else(|| {
                ConfigError::Validation(
                    "notifier.webhook_url is required in webhook mode".to_string(),
                )
            })?;
            Arc::new(WebhookNotificationGateway::new(url, config.notifier.auth_token.clone()))
        }
    };

    let workflows: Arc<dyn WorkflowRepository> =
        Arc::new(SqlWorkflowRepository::new(db_pool.clone()));
    let service = Arc::new(ApprovalService::new(
        router,
        Arc::clone(&workflows),
        Arc::new(TracingAuditSink),
        gateway,
        config.routing.conflict_retry_limit,
    ));
    let sweeper = EscalationSweeper::new(
        Arc::clone(&service),
        workflows,
        Duration::from_secs(config.escalation.sweep_interval_secs),
    );

    Ok(Application { config, db_pool, service, sweeper })
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use countersign_core::config::AppConfig;
    use countersign_core::domain::workflow::{
        Priority, ResourceId, UserId, WorkflowEvent, WorkflowStatus, WorkflowType,
    };
    use countersign_core::router::ChainRequest;
    use countersign_db::BranchSeedDataset;

    use crate::bootstrap::{build_application, connect_and_migrate};

    fn memory_config(name: &str) -> AppConfig {
        let mut config = AppConfig::default();
        config.database.url = format!("sqlite:file:{name}?mode=memory&cache=shared");
        config
    }

    #[tokio::test]
    async fn integration_smoke_routes_and_approves_a_seeded_request() {
        let config = memory_config("bootstrap_smoke");
        let pool = connect_and_migrate(&config).await.expect("connect and migrate");
        BranchSeedDataset::load(&pool).await.expect("seed");

        let app = build_application(config, pool).await.expect("build application");

        let workflow = app
            .service
            .request_approval(
                ChainRequest {
                    workflow_type: WorkflowType::CashAuthorization,
                    resource_type: "till".to_string(),
                    resource_id: ResourceId("till-7".to_string()),
                    amount: Some(Decimal::new(80_000, 0)),
                    priority: Priority::Normal,
                    initiated_by: UserId("user-teller-001".to_string()),
                    account: None,
                },
                "req-smoke".to_string(),
            )
            .await
            .expect("routed");
        assert_eq!(workflow.steps.len(), 2);

        app.service
            .approve(&workflow.id, &UserId("user-supervisor-001".to_string()), None)
            .await
            .expect("supervisor approval");
        let (finished, outcome) = app
            .service
            .approve(&workflow.id, &UserId("user-manager-001".to_string()), None)
            .await
            .expect("manager approval");

        assert_eq!(outcome.event, WorkflowEvent::Approved);
        assert_eq!(finished.status, WorkflowStatus::Approved);

        app.db_pool.close().await;
    }

    #[tokio::test]
    async fn bootstrap_without_reference_data_still_starts() {
        let config = memory_config("bootstrap_empty");
        let pool = connect_and_migrate(&config).await.expect("connect and migrate");

        let app = build_application(config, pool).await.expect("build application");

        // routing refuses until a ladder is configured, but the server is up
        let error = app
            .service
            .request_approval(
                ChainRequest {
                    workflow_type: WorkflowType::CashAuthorization,
                    resource_type: "till".to_string(),
                    resource_id: ResourceId("till-1".to_string()),
                    amount: Some(Decimal::new(100, 0)),
                    priority: Priority::Normal,
                    initiated_by: UserId("user-x".to_string()),
                    account: None,
                },
                "req-empty".to_string(),
            )
            .await
            .unwrap_err();
        assert!(error.to_string().contains("no active role"));

        app.db_pool.close().await;
    }
}
