use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::signatory::{AccountId, AccountSignatory, SignatoryRule};

/// What an account's mandate demands for a requested amount.
///
/// `exceeds_ceiling` signals the router to fall back to pure role-based
/// routing rather than signatory counting, so a joint-account rule with a low
/// ceiling cannot silently permit a large transaction. `rule_backed` is false
/// for accounts without a mandate: default single control, role-routed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatorySpec {
    pub required_signatures: u32,
    pub allowed_signatory_roles: Vec<String>,
    pub exceeds_ceiling: bool,
    pub rule_backed: bool,
}

/// Signatory Rule Evaluator over per-account reference data.
#[derive(Clone, Debug, Default)]
pub struct SignatoryEvaluator {
    rules: HashMap<String, SignatoryRule>,
    signatories: HashMap<String, Vec<AccountSignatory>>,
}

impl SignatoryEvaluator {
    pub fn new(rules: Vec<SignatoryRule>, signatories: Vec<AccountSignatory>) -> Self {
        let rules = rules
            .into_iter()
            .filter(|rule| rule.active)
            .map(|rule| (rule.account_id.0.clone(), rule))
            .collect();

        let mut by_account: HashMap<String, Vec<AccountSignatory>> = HashMap::new();
        for signatory in signatories.into_iter().filter(|signatory| signatory.active) {
            by_account.entry(signatory.account_id.0.clone()).or_default().push(signatory);
        }
        // registration order decides signing priority
        for entries in by_account.values_mut() {
            entries.sort_by(|a, b| a.added_at.cmp(&b.added_at).then_with(|| a.user_id.0.cmp(&b.user_id.0)));
        }

        Self { rules, signatories: by_account }
    }

    pub fn evaluate(&self, account: &AccountId, amount: Decimal) -> SignatorySpec {
        let Some(rule) = self.rules.get(&account.0) else {
            return SignatorySpec {
                required_signatures: 1,
                allowed_signatory_roles: Vec::new(),
                exceeds_ceiling: false,
                rule_backed: false,
            };
        };

        let exceeds_ceiling = rule.maximum_amount.is_some_and(|ceiling| amount > ceiling);
        let mut allowed_signatory_roles: Vec<String> = self
            .signatories(account)
            .iter()
            .map(|signatory| signatory.signatory_role.trim().to_ascii_lowercase())
            .collect();
        allowed_signatory_roles.sort();
        allowed_signatory_roles.dedup();

        SignatorySpec {
            required_signatures: rule.minimum_signatures.max(1),
            allowed_signatory_roles,
            exceeds_ceiling,
            rule_backed: true,
        }
    }

    /// Active signatories for the account in signing-priority order.
    pub fn signatories(&self, account: &AccountId) -> &[AccountSignatory] {
        self.signatories.get(&account.0).map(Vec::as_slice).unwrap_or(&[])
    }
}
