use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::Row;

use countersign_core::domain::role::{Role, RoleAssignment, RoleCode};
use countersign_core::domain::workflow::UserId;

use super::{RepositoryError, RoleRepository};
use crate::DbPool;

pub struct SqlRoleRepository {
    pool: DbPool,
}

impl SqlRoleRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn parse_datetime(value: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Decode(format!("bad timestamp `{value}`: {e}")))
}

fn row_to_role(row: &sqlx::sqlite::SqliteRow) -> Result<Role, RepositoryError> {
    let code: String = row.try_get("code").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let name: String = row.try_get("name").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let approval_limit: Option<String> =
        row.try_get("approval_limit").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let active: i64 =
        row.try_get("active").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let created_at: String =
        row.try_get("created_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    let approval_limit = approval_limit
        .as_deref()
        .map(|s| {
            Decimal::from_str(s)
                .map_err(|e| RepositoryError::Decode(format!("bad approval limit `{s}`: {e}")))
        })
        .transpose()?;

    Ok(Role {
        code: RoleCode(code),
        name,
        approval_limit,
        active: active != 0,
        created_at: parse_datetime(&created_at)?,
    })
}

fn row_to_assignment(row: &sqlx::sqlite::SqliteRow) -> Result<RoleAssignment, RepositoryError> {
    let user_id: String =
        row.try_get("user_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let role_code: String =
        row.try_get("role_code").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let active: i64 =
        row.try_get("active").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let assigned_at: String =
        row.try_get("assigned_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    Ok(RoleAssignment {
        user_id: UserId(user_id),
        role: RoleCode(role_code),
        active: active != 0,
        assigned_at: parse_datetime(&assigned_at)?,
    })
}

#[async_trait::async_trait]
impl RoleRepository for SqlRoleRepository {
    async fn list_roles(&self) -> Result<Vec<Role>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT code, name, approval_limit, active, created_at FROM role ORDER BY code ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_role).collect()
    }

    async fn save_role(&self, role: Role) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO role (code, name, approval_limit, active, created_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(code) DO UPDATE SET
                 name = excluded.name,
                 approval_limit = excluded.approval_limit,
                 active = excluded.active",
        )
        .bind(&role.code.0)
        .bind(&role.name)
        .bind(role.approval_limit.map(|limit| limit.to_string()))
        .bind(i64::from(role.active))
        .bind(role.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_assignments(&self) -> Result<Vec<RoleAssignment>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT user_id, role_code, active, assigned_at
             FROM role_assignment ORDER BY user_id ASC, role_code ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_assignment).collect()
    }

    async fn save_assignment(&self, assignment: RoleAssignment) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO role_assignment (user_id, role_code, active, assigned_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(user_id, role_code) DO UPDATE SET
                 active = excluded.active",
        )
        .bind(&assignment.user_id.0)
        .bind(&assignment.role.0)
        .bind(i64::from(assignment.active))
        .bind(assignment.assigned_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal::Decimal;

    use countersign_core::domain::role::{Role, RoleAssignment, RoleCode};
    use countersign_core::domain::workflow::UserId;

    use super::SqlRoleRepository;
    use crate::repositories::RoleRepository;
    use crate::{connect_with_settings, migrations};

    async fn setup() -> sqlx::SqlitePool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    #[tokio::test]
    async fn save_and_list_roles_round_trips_limits() {
        let pool = setup().await;
        let repo = SqlRoleRepository::new(pool);
        let now = Utc::now();

        repo.save_role(Role {
            code: RoleCode("teller".to_string()),
            name: "Teller".to_string(),
            approval_limit: Some(Decimal::new(10_000, 0)),
            active: true,
            created_at: now,
        })
        .await
        .expect("save teller");
        repo.save_role(Role {
            code: RoleCode("branch_manager".to_string()),
            name: "Branch Manager".to_string(),
            approval_limit: None,
            active: true,
            created_at: now,
        })
        .await
        .expect("save manager");

        let roles = repo.list_roles().await.expect("list");
        assert_eq!(roles.len(), 2);
        let teller = roles.iter().find(|role| role.code.0 == "teller").expect("teller");
        assert_eq!(teller.approval_limit, Some(Decimal::new(10_000, 0)));
        let manager = roles.iter().find(|role| role.code.0 == "branch_manager").expect("manager");
        assert!(manager.approval_limit.is_none());
    }

    #[tokio::test]
    async fn save_assignment_upserts_the_active_flag() {
        let pool = setup().await;
        let repo = SqlRoleRepository::new(pool);
        let now = Utc::now();

        repo.save_role(Role {
            code: RoleCode("teller".to_string()),
            name: "Teller".to_string(),
            approval_limit: Some(Decimal::new(10_000, 0)),
            active: true,
            created_at: now,
        })
        .await
        .expect("save role");

        let mut assignment = RoleAssignment {
            user_id: UserId("u-1".to_string()),
            role: RoleCode("teller".to_string()),
            active: true,
            assigned_at: now,
        };
        repo.save_assignment(assignment.clone()).await.expect("save");

        assignment.active = false;
        repo.save_assignment(assignment).await.expect("upsert");

        let assignments = repo.list_assignments().await.expect("list");
        assert_eq!(assignments.len(), 1);
        assert!(!assignments[0].active);
    }
}
