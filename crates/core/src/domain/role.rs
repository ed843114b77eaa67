use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::workflow::UserId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoleCode(pub String);

impl RoleCode {
    pub fn normalized(&self) -> String {
        self.0.trim().to_ascii_lowercase()
    }
}

/// A back-office role and the monetary ceiling a single holder may approve
/// alone. `approval_limit = None` means unlimited authority.
///
/// Roles are never deleted, only deactivated, so historical workflows keep a
/// resolvable reference.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub code: RoleCode,
    pub name: String,
    pub approval_limit: Option<Decimal>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Role {
    /// Whether a single holder of this role may clear `amount` on their own.
    pub fn covers(&self, amount: Decimal) -> bool {
        self.approval_limit.map_or(true, |limit| limit >= amount)
    }
}

/// Grants one user one role. Reference data, read-mostly.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub user_id: UserId,
    pub role: RoleCode,
    pub active: bool,
    pub assigned_at: DateTime<Utc>,
}
