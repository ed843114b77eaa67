use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use rust_decimal::Decimal;

use crate::domain::role::{Role, RoleAssignment, RoleCode};
use crate::domain::workflow::UserId;
use crate::errors::WorkflowError;

/// Orders approval limits with `None` (unlimited) above every finite ceiling.
pub(crate) fn limit_cmp(left: &Option<Decimal>, right: &Option<Decimal>) -> Ordering {
    match (left, right) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => a.cmp(b),
    }
}

/// Role & Limit Registry: read-mostly reference data, no state transitions.
/// Roles ordered by approval limit form the implicit escalation ladder.
#[derive(Clone, Debug, Default)]
pub struct RoleRegistry {
    roles: HashMap<String, Role>,
    ladder: Vec<String>,
}

impl RoleRegistry {
    pub fn new(roles: Vec<Role>) -> Self {
        let roles: HashMap<String, Role> =
            roles.into_iter().map(|role| (role.code.normalized(), role)).collect();

        let mut ladder: Vec<&Role> = roles.values().filter(|role| role.active).collect();
        ladder.sort_by(|a, b| {
            limit_cmp(&a.approval_limit, &b.approval_limit)
                .then_with(|| a.code.normalized().cmp(&b.code.normalized()))
        });
        let ladder = ladder.into_iter().map(|role| role.code.normalized()).collect();

        Self { roles, ladder }
    }

    pub fn get(&self, code: &RoleCode) -> Result<&Role, WorkflowError> {
        self.roles
            .get(&code.normalized())
            .ok_or_else(|| WorkflowError::UnknownRole { role: code.0.clone() })
    }

    pub fn approval_limit(&self, code: &RoleCode) -> Result<Option<Decimal>, WorkflowError> {
        Ok(self.get(code)?.approval_limit)
    }

    pub fn is_active(&self, code: &RoleCode) -> Result<bool, WorkflowError> {
        Ok(self.get(code)?.active)
    }

    /// Active roles ascending by approval limit, ties broken by code so the
    /// ladder is deterministic.
    pub fn roles_ordered_by_limit(&self) -> Vec<&Role> {
        self.ladder.iter().filter_map(|key| self.roles.get(key)).collect()
    }

    /// The next rung of the escalation ladder above `code`, or `None` at the
    /// top. A role deactivated since the chain was built is positioned by its
    /// limit instead of its ladder slot.
    pub fn next_rung(&self, code: &RoleCode) -> Result<Option<&Role>, WorkflowError> {
        let current = self.get(code)?;
        if let Some(position) = self.ladder.iter().position(|key| *key == code.normalized()) {
            return Ok(self.ladder.get(position + 1).and_then(|key| self.roles.get(key)));
        }
        Ok(self
            .roles_ordered_by_limit()
            .into_iter()
            .find(|role| limit_cmp(&role.approval_limit, &current.approval_limit) == Ordering::Greater))
    }

    /// The cheapest active role whose limit clears `amount`.
    pub fn cheapest_covering(&self, amount: Decimal) -> Option<&Role> {
        self.roles_ordered_by_limit().into_iter().find(|role| role.covers(amount))
    }
}

/// Who may act for a role. The router uses eligible-holder sets to apply
/// segregation of duties at build time; the state machine uses holder checks
/// on every approve/reject.
pub trait RoleMembership {
    fn is_active_holder(&self, user: &UserId, role: &RoleCode) -> bool;
    fn active_holders(&self, role: &RoleCode) -> Vec<UserId>;
    fn roles_of(&self, user: &UserId) -> Vec<RoleCode>;
}

/// In-memory role membership built from assignment reference data. BTree
/// collections keep holder iteration order stable across runs.
#[derive(Clone, Debug, Default)]
pub struct RoleDirectory {
    by_role: BTreeMap<String, BTreeSet<String>>,
    by_user: BTreeMap<String, BTreeSet<String>>,
}

impl RoleDirectory {
    pub fn from_assignments(assignments: Vec<RoleAssignment>) -> Self {
        let mut by_role: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut by_user: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

        for assignment in assignments.into_iter().filter(|assignment| assignment.active) {
            let role_key = assignment.role.normalized();
            by_role.entry(role_key.clone()).or_default().insert(assignment.user_id.0.clone());
            by_user.entry(assignment.user_id.0).or_default().insert(role_key);
        }

        Self { by_role, by_user }
    }
}

impl RoleMembership for RoleDirectory {
    fn is_active_holder(&self, user: &UserId, role: &RoleCode) -> bool {
        self.by_role.get(&role.normalized()).is_some_and(|holders| holders.contains(&user.0))
    }

    fn active_holders(&self, role: &RoleCode) -> Vec<UserId> {
        self.by_role
            .get(&role.normalized())
            .map(|holders| holders.iter().cloned().map(UserId).collect())
            .unwrap_or_default()
    }

    fn roles_of(&self, user: &UserId) -> Vec<RoleCode> {
        self.by_user
            .get(&user.0)
            .map(|roles| roles.iter().cloned().map(RoleCode).collect())
            .unwrap_or_default()
    }
}
