use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::workflow::UserId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatoryType {
    Single,
    Joint,
    Either,
}

impl SignatoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Joint => "joint",
            Self::Either => "either",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "single" => Some(Self::Single),
            "joint" => Some(Self::Joint),
            "either" => Some(Self::Either),
            _ => None,
        }
    }
}

/// Per-account signing mandate. `maximum_amount` is the ceiling above which the
/// mandate no longer auto-satisfies and the workflow routes to role-based
/// approval instead, whatever the signatory count.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatoryRule {
    pub account_id: AccountId,
    pub signatory_type: SignatoryType,
    pub minimum_signatures: u32,
    pub maximum_amount: Option<Decimal>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// A named individual entitled to sign for an account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSignatory {
    pub account_id: AccountId,
    pub user_id: UserId,
    pub signatory_role: String,
    pub active: bool,
    pub added_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::SignatoryType;

    #[test]
    fn signatory_type_round_trips_through_storage_codes() {
        for kind in [SignatoryType::Single, SignatoryType::Joint, SignatoryType::Either] {
            assert_eq!(SignatoryType::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(SignatoryType::parse("quorum"), None);
    }
}
