//! Pre-flight quota decisions.
//!
//! This is an estimate-time gate only; the authoritative trial hard-stop is
//! re-run inside the store transaction to close the race between pre-check
//! and execution. Denials are decisions, not errors, so callers can render
//! an upgrade prompt instead of unwinding.

use serde::{Deserialize, Serialize};

use crate::types::{BillingStatus, OrganizationBalance, OrganizationType};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    /// Trial tenants are hard-stopped at their balance; no overdraft.
    TrialLimitReached,
    OrganizationInactive,
    OrganizationNotFound,
    /// Infrastructure failure while reading balance state. Fail closed.
    BalanceCheckFailed,
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TrialLimitReached => write!(f, "trial limit reached"),
            Self::OrganizationInactive => write!(f, "organization is deactivated"),
            Self::OrganizationNotFound => write!(f, "organization not found"),
            Self::BalanceCheckFailed => write!(f, "balance check failed"),
        }
    }
}

/// Outcome of `has_org_sufficient_balance`-style checks.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub balance: i64,
    pub reason: Option<DenialReason>,
    /// Set when the spend is allowed but will take an active tenant into
    /// overdraft.
    pub paygo_triggered: bool,
}

impl QuotaDecision {
    pub fn allow(balance: i64) -> Self {
        Self {
            allowed: true,
            balance,
            reason: None,
            paygo_triggered: false,
        }
    }

    pub fn allow_paygo(balance: i64) -> Self {
        Self {
            allowed: true,
            balance,
            reason: None,
            paygo_triggered: true,
        }
    }

    pub fn deny(balance: i64, reason: DenialReason) -> Self {
        Self {
            allowed: false,
            balance,
            reason: Some(reason),
            paygo_triggered: false,
        }
    }
}

fn balance_covers(balance: i64, tokens: u64) -> bool {
    balance >= 0 && balance as u64 >= tokens
}

/// Evaluates the quota policy against an already-read organization row.
/// Read-only; never writes a ledger entry or touches the balance.
pub fn evaluate(org: &OrganizationBalance, estimated_tokens: u64) -> QuotaDecision {
    if !org.is_active {
        return QuotaDecision::deny(org.balance, DenialReason::OrganizationInactive);
    }

    let is_trial = org.billing_status == BillingStatus::Trial
        || org.organization_type == OrganizationType::Trial;
    let covered = balance_covers(org.balance, estimated_tokens);

    if is_trial && !covered {
        return QuotaDecision::deny(org.balance, DenialReason::TrialLimitReached);
    }

    if !is_trial && org.billing_status == BillingStatus::Active && !covered {
        // Overdraft is permitted only for active, non-trial tenants.
        return QuotaDecision::allow_paygo(org.balance);
    }

    QuotaDecision::allow(org.balance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BillingStatus, OrganizationType};

    fn org(
        balance: i64,
        billing_status: BillingStatus,
        organization_type: OrganizationType,
    ) -> OrganizationBalance {
        OrganizationBalance {
            organization_id: "org-1".into(),
            balance,
            billing_status,
            organization_type,
            is_active: true,
            created_at_ms: 0,
            updated_at_ms: 0,
        }
    }

    #[test]
    fn trial_with_shortfall_is_denied() {
        let decision = evaluate(&org(50, BillingStatus::Trial, OrganizationType::Trial), 100);
        assert!(!decision.allowed);
        assert_eq!(decision.balance, 50);
        assert_eq!(decision.reason, Some(DenialReason::TrialLimitReached));
        assert!(
            decision
                .reason
                .expect("reason")
                .to_string()
                .contains("trial limit")
        );
    }

    #[test]
    fn trial_org_type_hard_stops_even_when_status_active() {
        let decision = evaluate(&org(50, BillingStatus::Active, OrganizationType::Trial), 100);
        assert!(!decision.allowed);
        assert_eq!(decision.reason, Some(DenialReason::TrialLimitReached));
    }

    #[test]
    fn trial_with_coverage_is_allowed() {
        let decision = evaluate(&org(500, BillingStatus::Trial, OrganizationType::Trial), 100);
        assert!(decision.allowed);
        assert!(!decision.paygo_triggered);
    }

    #[test]
    fn active_shortfall_allows_with_paygo_flag() {
        let decision = evaluate(&org(50, BillingStatus::Active, OrganizationType::Paid), 100);
        assert!(decision.allowed);
        assert!(decision.paygo_triggered);
    }

    #[test]
    fn paygo_pending_shortfall_allows_without_refiring() {
        let decision = evaluate(
            &org(-60, BillingStatus::PaygoPending, OrganizationType::Paid),
            100,
        );
        assert!(decision.allowed);
        assert!(!decision.paygo_triggered);
    }

    #[test]
    fn deactivated_org_is_denied() {
        let mut row = org(1_000, BillingStatus::Active, OrganizationType::Paid);
        row.is_active = false;
        let decision = evaluate(&row, 100);
        assert!(!decision.allowed);
        assert_eq!(decision.reason, Some(DenialReason::OrganizationInactive));
    }

    #[test]
    fn negative_balance_never_covers() {
        assert!(!balance_covers(-1, 0));
        assert!(balance_covers(0, 0));
        assert!(balance_covers(100, 100));
        assert!(!balance_covers(99, 100));
    }
}
