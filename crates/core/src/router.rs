use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::SlaConfig;
use crate::domain::role::{Role, RoleCode};
use crate::domain::signatory::AccountId;
use crate::domain::workflow::{Priority, ResourceId, UserId, WorkflowType};
use crate::errors::WorkflowError;
use crate::registry::{limit_cmp, RoleMembership, RoleRegistry};
use crate::signatory::SignatoryEvaluator;

/// A requested action that needs dual control before the business service may
/// act on it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainRequest {
    pub workflow_type: WorkflowType,
    pub resource_type: String,
    pub resource_id: ResourceId,
    pub amount: Option<Decimal>,
    pub priority: Priority,
    pub initiated_by: UserId,
    pub account: Option<AccountId>,
}

/// Blueprint for one approval step; the state machine turns these into
/// persisted steps.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalStepSpec {
    pub approver_role: Option<RoleCode>,
    pub assigned_to: Option<UserId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainPlan {
    pub steps: Vec<ApprovalStepSpec>,
    pub approval_deadline: DateTime<Utc>,
    pub required_signatures: Option<u32>,
}

/// Workflow Router: builds the ordered list of required approval steps for a
/// requested action. Pure and deterministic for identical inputs — it holds
/// only read-mostly reference data and never touches the workflow store.
#[derive(Clone, Debug)]
pub struct WorkflowRouter<M> {
    registry: RoleRegistry,
    membership: M,
    evaluator: SignatoryEvaluator,
    sla: SlaConfig,
    review_role: RoleCode,
}

impl<M> WorkflowRouter<M>
where
    M: RoleMembership,
{
    pub fn new(
        registry: RoleRegistry,
        membership: M,
        evaluator: SignatoryEvaluator,
        sla: SlaConfig,
        review_role: RoleCode,
    ) -> Self {
        Self { registry, membership, evaluator, sla, review_role }
    }

    pub fn registry(&self) -> &RoleRegistry {
        &self.registry
    }

    pub fn membership(&self) -> &M {
        &self.membership
    }

    pub fn sla(&self) -> &SlaConfig {
        &self.sla
    }

    pub fn build_chain(
        &self,
        request: &ChainRequest,
        now: DateTime<Utc>,
    ) -> Result<ChainPlan, WorkflowError> {
        if request.amount.is_none() && request.workflow_type.requires_amount() {
            return Err(WorkflowError::InvariantViolation(format!(
                "workflow type `{}` requires an amount",
                request.workflow_type.as_str()
            )));
        }

        let deadline = self.sla.deadline_for(request.priority, now);

        if let (Some(account), Some(amount)) = (&request.account, request.amount) {
            if let Some(plan) =
                self.signatory_chain(account, amount, &request.initiated_by, deadline)?
            {
                return Ok(plan);
            }
        }

        self.role_chain(request, deadline)
    }

    /// The rung the escalation scheduler moves a stalled step to. Role steps
    /// climb the ladder from their current rung; signatory steps fall back to
    /// the cheapest role that covers the amount, mirroring the
    /// ceiling-exceeded routing fallback. `None` means the ladder is
    /// exhausted and the workflow must expire.
    pub fn escalation_target(
        &self,
        current_role: Option<&RoleCode>,
        amount: Option<Decimal>,
    ) -> Result<Option<RoleCode>, WorkflowError> {
        match current_role {
            Some(role) => Ok(self.registry.next_rung(role)?.map(|rung| rung.code.clone())),
            None => {
                let amount = amount.unwrap_or(Decimal::ZERO);
                Ok(self.registry.cheapest_covering(amount).map(|role| role.code.clone()))
            }
        }
    }

    /// Signatory chains do not combine with role-limit chains: a satisfiable
    /// mandate fully decides the chain, anything else falls through to
    /// role-based routing.
    fn signatory_chain(
        &self,
        account: &AccountId,
        amount: Decimal,
        initiator: &UserId,
        deadline: DateTime<Utc>,
    ) -> Result<Option<ChainPlan>, WorkflowError> {
        let spec = self.evaluator.evaluate(account, amount);
        if !spec.rule_backed || spec.exceeds_ceiling {
            return Ok(None);
        }

        let candidates: Vec<&UserId> = self
            .evaluator
            .signatories(account)
            .iter()
            .filter(|signatory| {
                spec.allowed_signatory_roles
                    .iter()
                    .any(|role| role.eq_ignore_ascii_case(signatory.signatory_role.trim()))
            })
            .map(|signatory| &signatory.user_id)
            .filter(|user| *user != initiator)
            .collect();

        let required = spec.required_signatures as usize;
        if candidates.len() < required {
            return Err(WorkflowError::NoEligibleApprover {
                detail: format!(
                    "account `{}` mandate requires {} signatures but only {} eligible signatories remain",
                    account.0,
                    required,
                    candidates.len()
                ),
            });
        }

        let steps = candidates
            .into_iter()
            .take(required)
            .map(|user| ApprovalStepSpec { approver_role: None, assigned_to: Some(user.clone()) })
            .collect();

        Ok(Some(ChainPlan {
            steps,
            approval_deadline: deadline,
            required_signatures: Some(spec.required_signatures),
        }))
    }

    fn role_chain(
        &self,
        request: &ChainRequest,
        deadline: DateTime<Utc>,
    ) -> Result<ChainPlan, WorkflowError> {
        let rungs = match request.amount {
            None => {
                let role = self.registry.get(&self.review_role)?;
                if !role.active {
                    return Err(WorkflowError::NoEligibleApprover {
                        detail: format!("review role `{}` is deactivated", role.code.0),
                    });
                }
                vec![role]
            }
            Some(amount) => self.ladder_rungs(amount, &request.initiated_by)?,
        };

        // Segregation of duties: a rung whose only active holder is the
        // initiator is lifted one rung up at build time.
        let mut steps: Vec<ApprovalStepSpec> = Vec::with_capacity(rungs.len());
        for rung in rungs {
            let placed = self.first_rung_with_checker(rung, &request.initiated_by)?;
            let duplicate = steps
                .last()
                .is_some_and(|step: &ApprovalStepSpec| step.approver_role.as_ref() == Some(&placed.code));
            if !duplicate {
                steps.push(ApprovalStepSpec {
                    approver_role: Some(placed.code.clone()),
                    assigned_to: None,
                });
            }
        }

        Ok(ChainPlan { steps, approval_deadline: deadline, required_signatures: None })
    }

    /// Walk the ladder ascending, skipping rungs that add no control over the
    /// initiator's own authority, appending every rung that cannot clear the
    /// amount alone and stopping at the first one that can.
    fn ladder_rungs(
        &self,
        amount: Decimal,
        initiator: &UserId,
    ) -> Result<Vec<&Role>, WorkflowError> {
        let floor = self.initiator_floor(initiator);
        let ladder = self.registry.roles_ordered_by_limit();

        let mut rungs = Vec::new();
        for role in &ladder {
            if let Some(floor) = &floor {
                if limit_cmp(&role.approval_limit, floor) != Ordering::Greater {
                    continue;
                }
            }
            rungs.push(*role);
            if role.covers(amount) {
                break;
            }
        }

        let covered = rungs.last().is_some_and(|role| role.covers(amount));
        if covered {
            return Ok(rungs);
        }

        // The floor swallowed every sufficient rung (the initiator sits at or
        // near the top of the ladder). Dual control still applies: route a
        // single peer review at the highest rung that covers the amount.
        match ladder.into_iter().rev().find(|role| role.covers(amount)) {
            Some(top) => Ok(vec![top]),
            None => Err(WorkflowError::NoEligibleApprover {
                detail: format!("no active role can approve an amount of {amount}"),
            }),
        }
    }

    fn first_rung_with_checker<'a>(
        &'a self,
        from: &'a Role,
        initiator: &UserId,
    ) -> Result<&'a Role, WorkflowError> {
        let mut current = Some(from);
        while let Some(role) = current {
            let has_checker =
                self.membership.active_holders(&role.code).iter().any(|user| user != initiator);
            if has_checker {
                return Ok(role);
            }
            current = self.registry.next_rung(&role.code)?;
        }
        Err(WorkflowError::NoEligibleApprover {
            detail: format!(
                "no active approver at or above role `{}` other than the initiator",
                from.code.0
            ),
        })
    }

    /// The initiator's own approval authority: the highest limit across the
    /// active roles they hold, or `None` when they hold none.
    fn initiator_floor(&self, initiator: &UserId) -> Option<Option<Decimal>> {
        let mut floor: Option<Option<Decimal>> = None;
        for code in self.membership.roles_of(initiator) {
            let Ok(role) = self.registry.get(&code) else {
                continue;
            };
            if !role.active {
                continue;
            }
            floor = Some(match floor {
                None => role.approval_limit,
                Some(current) => {
                    if limit_cmp(&role.approval_limit, &current) == Ordering::Greater {
                        role.approval_limit
                    } else {
                        current
                    }
                }
            });
        }
        floor
    }
}
