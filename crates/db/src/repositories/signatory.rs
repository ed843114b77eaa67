use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::Row;

use countersign_core::domain::signatory::{
    AccountId, AccountSignatory, SignatoryRule, SignatoryType,
};
use countersign_core::domain::workflow::UserId;

use super::{RepositoryError, SignatoryRepository};
use crate::DbPool;

pub struct SqlSignatoryRepository {
    pool: DbPool,
}

impl SqlSignatoryRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn parse_datetime(value: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Decode(format!("bad timestamp `{value}`: {e}")))
}

fn row_to_rule(row: &sqlx::sqlite::SqliteRow) -> Result<SignatoryRule, RepositoryError> {
    let account_id: String =
        row.try_get("account_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let signatory_type_str: String =
        row.try_get("signatory_type").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let minimum_signatures: i64 =
        row.try_get("minimum_signatures").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let maximum_amount: Option<String> =
        row.try_get("maximum_amount").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let active: i64 =
        row.try_get("active").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let created_at: String =
        row.try_get("created_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    let signatory_type = SignatoryType::parse(&signatory_type_str).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown signatory type `{signatory_type_str}`"))
    })?;
    let maximum_amount = maximum_amount
        .as_deref()
        .map(|s| {
            Decimal::from_str(s)
                .map_err(|e| RepositoryError::Decode(format!("bad maximum amount `{s}`: {e}")))
        })
        .transpose()?;

    Ok(SignatoryRule {
        account_id: AccountId(account_id),
        signatory_type,
        minimum_signatures: minimum_signatures as u32,
        maximum_amount,
        active: active != 0,
        created_at: parse_datetime(&created_at)?,
    })
}

fn row_to_signatory(row: &sqlx::sqlite::SqliteRow) -> Result<AccountSignatory, RepositoryError> {
    let account_id: String =
        row.try_get("account_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let user_id: String =
        row.try_get("user_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let signatory_role: String =
        row.try_get("signatory_role").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let active: i64 =
        row.try_get("active").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let added_at: String =
        row.try_get("added_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    Ok(AccountSignatory {
        account_id: AccountId(account_id),
        user_id: UserId(user_id),
        signatory_role,
        active: active != 0,
        added_at: parse_datetime(&added_at)?,
    })
}

#[async_trait::async_trait]
impl SignatoryRepository for SqlSignatoryRepository {
    async fn list_rules(&self) -> Result<Vec<SignatoryRule>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT account_id, signatory_type, minimum_signatures, maximum_amount, active,
                    created_at
             FROM signatory_rule ORDER BY account_id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_rule).collect()
    }

    async fn save_rule(&self, rule: SignatoryRule) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO signatory_rule (account_id, signatory_type, minimum_signatures,
                                         maximum_amount, active, created_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(account_id) DO UPDATE SET
                 signatory_type = excluded.signatory_type,
                 minimum_signatures = excluded.minimum_signatures,
                 maximum_amount = excluded.maximum_amount,
                 active = excluded.active",
        )
        .bind(&rule.account_id.0)
        .bind(rule.signatory_type.as_str())
        .bind(rule.minimum_signatures as i64)
        .bind(rule.maximum_amount.map(|amount| amount.to_string()))
        .bind(i64::from(rule.active))
        .bind(rule.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_signatories(
        &self,
        account: Option<&AccountId>,
    ) -> Result<Vec<AccountSignatory>, RepositoryError> {
        let rows = if let Some(account) = account {
            sqlx::query(
                "SELECT account_id, user_id, signatory_role, active, added_at
                 FROM account_signatory WHERE account_id = ?
                 ORDER BY added_at ASC, user_id ASC",
            )
            .bind(&account.0)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(
                "SELECT account_id, user_id, signatory_role, active, added_at
                 FROM account_signatory ORDER BY added_at ASC, user_id ASC",
            )
            .fetch_all(&self.pool)
            .await?
        };

        rows.iter().map(row_to_signatory).collect()
    }

    async fn save_signatory(&self, signatory: AccountSignatory) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO account_signatory (account_id, user_id, signatory_role, active, added_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(account_id, user_id) DO UPDATE SET
                 signatory_role = excluded.signatory_role,
                 active = excluded.active",
        )
        .bind(&signatory.account_id.0)
        .bind(&signatory.user_id.0)
        .bind(&signatory.signatory_role)
        .bind(i64::from(signatory.active))
        .bind(signatory.added_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use rust_decimal::Decimal;

    use countersign_core::domain::signatory::{
        AccountId, AccountSignatory, SignatoryRule, SignatoryType,
    };
    use countersign_core::domain::workflow::UserId;

    use super::SqlSignatoryRepository;
    use crate::repositories::SignatoryRepository;
    use crate::{connect_with_settings, migrations};

    async fn setup() -> sqlx::SqlitePool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    #[tokio::test]
    async fn save_and_list_rules_round_trips_the_ceiling() {
        let pool = setup().await;
        let repo = SqlSignatoryRepository::new(pool);

        repo.save_rule(SignatoryRule {
            account_id: AccountId("acct-1".to_string()),
            signatory_type: SignatoryType::Joint,
            minimum_signatures: 2,
            maximum_amount: Some(Decimal::new(500_000, 0)),
            active: true,
            created_at: Utc::now(),
        })
        .await
        .expect("save rule");

        let rules = repo.list_rules().await.expect("list");
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].signatory_type, SignatoryType::Joint);
        assert_eq!(rules[0].maximum_amount, Some(Decimal::new(500_000, 0)));
    }

    #[tokio::test]
    async fn list_signatories_filters_by_account_and_orders_by_added_at() {
        let pool = setup().await;
        let repo = SqlSignatoryRepository::new(pool);
        let now = Utc::now();

        for (index, (account, user)) in
            [("acct-1", "u-b"), ("acct-1", "u-a"), ("acct-2", "u-c")].iter().enumerate()
        {
            repo.save_signatory(AccountSignatory {
                account_id: AccountId((*account).to_string()),
                user_id: UserId((*user).to_string()),
                signatory_role: "Director".to_string(),
                active: true,
                added_at: now + Duration::seconds(index as i64),
            })
            .await
            .expect("save signatory");
        }

        let first_account =
            repo.list_signatories(Some(&AccountId("acct-1".to_string()))).await.expect("list");
        assert_eq!(first_account.len(), 2);
        assert_eq!(first_account[0].user_id.0, "u-b");
        assert_eq!(first_account[1].user_id.0, "u-a");

        let all = repo.list_signatories(None).await.expect("list all");
        assert_eq!(all.len(), 3);
    }
}
