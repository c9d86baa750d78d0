//! Storage seam for the billing engine.
//!
//! The engine is a stateless layer over a [`BillingStore`]; the store owns
//! all shared mutable state (the per-organization balance row and its
//! ledger) and executes every debit/credit as one atomic unit. Two backends
//! ship with the crate: [`crate::SqliteStore`] for durability and
//! [`crate::MemoryStore`] for deterministic tests.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::types::{
    BillingStatus, LedgerEntry, LedgerMetadata, LedgerSummary, LegacyTransaction, Margin,
    OrganizationBalance, OrganizationType, SourceType, UserBalance,
};

/// Store-level debit instruction. The billed token count and metadata are
/// already computed; the store's job is the atomic unit: trial re-check,
/// balance delta, legacy record, ledger entry, PAYGO transition.
#[derive(Clone, Debug)]
pub struct DebitRequest {
    pub organization_id: String,
    pub actor_user_id: Option<String>,
    pub billed_tokens: u64,
    pub reason: String,
    pub ref_entity_type: Option<String>,
    pub ref_entity_id: Option<String>,
    pub metadata: LedgerMetadata,
}

#[derive(Clone, Copy, Debug)]
pub struct DebitOutcome {
    pub transaction_id: i64,
    pub ledger_id: i64,
    pub balance_after: i64,
    pub paygo_triggered: bool,
}

#[derive(Clone, Debug)]
pub struct CreditRequest {
    pub organization_id: String,
    pub actor_user_id: Option<String>,
    pub tokens: u64,
    pub reason: String,
    pub ref_entity_type: Option<String>,
    pub ref_entity_id: Option<String>,
    pub metadata: LedgerMetadata,
}

#[derive(Clone, Copy, Debug)]
pub struct CreditOutcome {
    pub transaction_id: i64,
    pub ledger_id: i64,
    pub balance_after: i64,
}

/// Repository contract for billing state.
///
/// Atomicity contract: `debit` and `credit` commit every listed step or none
/// of them. A ledger-write failure inside either operation must roll back
/// the already-staged balance mutation (ledger integrity outranks
/// availability). Implementations must serialize concurrent debits against
/// the same organization; debits against different organizations may run
/// fully in parallel. `StoreError::Busy` marks a transient conflict the
/// caller may retry.
#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn provision_organization(
        &self,
        org_id: &str,
        organization_type: OrganizationType,
        initial_tokens: u64,
    ) -> Result<OrganizationBalance, StoreError>;

    async fn get_organization(&self, org_id: &str) -> Result<OrganizationBalance, StoreError>;

    /// Lifecycle flag only; the row and its ledger are never deleted.
    async fn deactivate_organization(&self, org_id: &str) -> Result<(), StoreError>;

    /// Guarded status transition: applies only when the current status
    /// equals `from`, otherwise fails with `InvalidTransition`.
    async fn transition_billing_status(
        &self,
        org_id: &str,
        from: BillingStatus,
        to: BillingStatus,
    ) -> Result<(), StoreError>;

    /// Atomic debit. See the trait-level atomicity contract.
    async fn debit(&self, request: &DebitRequest) -> Result<DebitOutcome, StoreError>;

    /// Atomic credit: balance increment plus one CREDIT ledger entry.
    async fn credit(&self, request: &CreditRequest) -> Result<CreditOutcome, StoreError>;

    /// Ledger page, newest first. Read-only; takes no locks.
    async fn list_ledger(
        &self,
        org_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<LedgerEntry>, StoreError>;

    async fn ledger_summary(&self, org_id: &str) -> Result<LedgerSummary, StoreError>;

    async fn list_legacy_transactions(
        &self,
        org_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<LegacyTransaction>, StoreError>;

    async fn get_margin(&self, source_type: SourceType) -> Result<Option<Margin>, StoreError>;

    /// Inserts or replaces the margin row for its source type.
    async fn put_margin(&self, margin: &Margin) -> Result<(), StoreError>;

    async fn get_user_balance(&self, user_id: &str) -> Result<Option<UserBalance>, StoreError>;

    /// Applies usage to the legacy per-user tallies, creating the row on
    /// first touch. Platform usage spends bonus tokens before purchased
    /// ones; BYOK/local usage only accumulates its tally.
    async fn apply_user_usage(
        &self,
        user_id: &str,
        source_type: SourceType,
        tokens: u64,
    ) -> Result<UserBalance, StoreError>;

    async fn credit_user_tokens(
        &self,
        user_id: &str,
        tokens: u64,
        bonus: bool,
    ) -> Result<UserBalance, StoreError>;
}
