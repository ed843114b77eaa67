use serde::Serialize;
use sqlx::{Executor, Row};

use crate::connection::DbPool;
use crate::repositories::RepositoryError;

const SEED_ROLE_CODES: &[&str] = &["teller", "supervisor", "branch_manager"];
const SEED_ASSIGNMENT_COUNT: i64 = 4;
const SEED_JOINT_ACCOUNT: &str = "acct-joint-001";
const SEED_SIGNATORY_COUNT: i64 = 3;

/// Deterministic branch dataset: a three-rung approval ladder and one joint
/// account with a 2-of-3 mandate.
pub struct BranchSeedDataset;

#[derive(Clone, Debug, Serialize)]
pub struct SeedCheck {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct SeedVerification {
    pub passed: bool,
    pub checks: Vec<SeedCheck>,
}

impl BranchSeedDataset {
    pub const SQL: &str = include_str!("../../../config/fixtures/branch_seed_data.sql");

    pub async fn load(pool: &DbPool) -> Result<(), RepositoryError> {
        let mut tx = pool.begin().await?;
        tx.execute(sqlx::query(Self::SQL)).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn verify(pool: &DbPool) -> Result<SeedVerification, RepositoryError> {
        let mut checks = Vec::new();

        let role_count = sqlx::query("SELECT COUNT(*) AS count FROM role WHERE active = 1")
            .fetch_one(pool)
            .await?
            .get::<i64, _>("count");
        checks.push(SeedCheck {
            name: "role_ladder",
            passed: role_count == SEED_ROLE_CODES.len() as i64,
            detail: format!("expected {} active roles, found {role_count}", SEED_ROLE_CODES.len()),
        });

        let assignment_count =
            sqlx::query("SELECT COUNT(*) AS count FROM role_assignment WHERE active = 1")
                .fetch_one(pool)
                .await?
                .get::<i64, _>("count");
        checks.push(SeedCheck {
            name: "role_assignments",
            passed: assignment_count == SEED_ASSIGNMENT_COUNT,
            detail: format!(
                "expected {SEED_ASSIGNMENT_COUNT} active assignments, found {assignment_count}"
            ),
        });

        let signatory_count = sqlx::query(
            "SELECT COUNT(*) AS count FROM account_signatory WHERE account_id = ? AND active = 1",
        )
        .bind(SEED_JOINT_ACCOUNT)
        .fetch_one(pool)
        .await?
        .get::<i64, _>("count");
        checks.push(SeedCheck {
            name: "joint_account_signatories",
            passed: signatory_count == SEED_SIGNATORY_COUNT,
            detail: format!(
                "expected {SEED_SIGNATORY_COUNT} signatories on {SEED_JOINT_ACCOUNT}, found {signatory_count}"
            ),
        });

        let passed = checks.iter().all(|check| check.passed);
        Ok(SeedVerification { passed, checks })
    }
}

#[cfg(test)]
mod tests {
    use super::BranchSeedDataset;
    use crate::{connect_with_settings, migrations};

    #[tokio::test]
    async fn seed_loads_and_verifies_against_its_contract() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");

        BranchSeedDataset::load(&pool).await.expect("load seed");
        let verification = BranchSeedDataset::verify(&pool).await.expect("verify seed");

        assert!(verification.passed, "failed checks: {:?}", verification.checks);
    }

    #[tokio::test]
    async fn verify_fails_on_an_unseeded_database() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");

        let verification = BranchSeedDataset::verify(&pool).await.expect("verify");
        assert!(!verification.passed);
    }
}
