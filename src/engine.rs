//! The transaction coordinator and caller-facing API surface.
//!
//! `BillingEngine` is stateless over an injected [`BillingStore`]; it owns
//! policy (quota evaluation, fail-closed mapping, bounded retry, margin
//! fallback) while the store owns atomicity. No component outside the store
//! writes ledger entries.

use std::sync::Arc;
use std::time::Duration;

use crate::config::BillingConfig;
use crate::costing::{self, Charge};
use crate::error::{BillingError, StoreError};
use crate::quota::{self, DenialReason, QuotaDecision};
use crate::store::{BillingStore, CreditRequest, DebitRequest};
use crate::types::{
    BillingStatus, CreditOpts, CreditReceipt, DebitParams, DebitReceipt, LedgerEntry,
    LedgerMetadata, LedgerPage, LedgerSummary, LegacyTransaction, Margin, MarginUpdate,
    OrganizationBalance,
    OrganizationType, SourceType, UserBalance,
};

pub struct BillingEngine {
    store: Arc<dyn BillingStore>,
    config: BillingConfig,
}

impl BillingEngine {
    pub fn new(store: Arc<dyn BillingStore>, config: BillingConfig) -> Self {
        Self { store, config }
    }

    pub fn with_defaults(store: Arc<dyn BillingStore>) -> Self {
        Self::new(store, BillingConfig::default())
    }

    pub fn config(&self) -> &BillingConfig {
        &self.config
    }

    /// Pre-flight quota check. Never errors: any infrastructure failure is a
    /// denial (fail closed), and the check itself writes nothing.
    pub async fn has_org_sufficient_balance(
        &self,
        org_id: &str,
        estimated_tokens: u64,
    ) -> QuotaDecision {
        match self.store.get_organization(org_id).await {
            Ok(org) => quota::evaluate(&org, estimated_tokens),
            Err(StoreError::NotFound) => {
                tracing::warn!(org_id, "quota check for unknown organization");
                QuotaDecision::deny(0, DenialReason::OrganizationNotFound)
            }
            Err(err) => {
                tracing::warn!(org_id, error = %err, "balance read failed, denying");
                QuotaDecision::deny(0, DenialReason::BalanceCheckFailed)
            }
        }
    }

    /// Prices one completed call: rounds raw tokens up through the
    /// multiplier and computes the margin from the registry row (or the
    /// zero-markup default when none is configured).
    pub async fn compute_charge(
        &self,
        raw_tokens: u64,
        multiplier: f64,
        source_type: SourceType,
    ) -> Result<Charge, BillingError> {
        let margin = self.get_margin(source_type).await?;
        costing::compute_charge(
            raw_tokens,
            multiplier,
            source_type,
            &margin,
            &self.config,
        )
    }

    /// Atomic debit of billed tokens against the organization balance. One
    /// DEBIT ledger entry per settled debit, plus at most one PAYGO marker
    /// on the ACTIVE -> negative crossing.
    pub async fn deduct_tokens_for_org(
        &self,
        params: DebitParams,
    ) -> Result<DebitReceipt, BillingError> {
        if params.billed_tokens == 0 {
            return Err(BillingError::InvalidRequest {
                reason: "billed_tokens must be > 0".into(),
            });
        }

        let request = DebitRequest {
            organization_id: params.organization_id.clone(),
            actor_user_id: params.user_id.clone(),
            billed_tokens: params.billed_tokens,
            reason: format!("ai usage ({})", params.source_type),
            ref_entity_type: params.ref_entity_type.clone(),
            ref_entity_id: params.ref_entity_id.clone(),
            metadata: LedgerMetadata::DebitV1 {
                source_type: params.source_type,
                provider: params.provider.clone(),
                model: params.model.clone(),
                raw_tokens: params.raw_tokens,
                multiplier: params.multiplier,
                margin_usd_micros: params.margin_usd_micros,
            },
        };

        let outcome = self
            .with_retries(|| {
                let store = Arc::clone(&self.store);
                let request = request.clone();
                async move { store.debit(&request).await }
            })
            .await
            .map_err(|err| BillingError::from_store(err, &params.organization_id))?;

        if outcome.paygo_triggered {
            tracing::info!(
                org_id = %params.organization_id,
                balance_after = outcome.balance_after,
                "organization entered pay-as-you-go"
            );
        }
        tracing::debug!(
            org_id = %params.organization_id,
            tokens = params.billed_tokens,
            ledger_id = outcome.ledger_id,
            balance_after = outcome.balance_after,
            "debit settled"
        );

        Ok(DebitReceipt {
            transaction_id: outcome.transaction_id,
            ledger_id: outcome.ledger_id,
            tokens_billed: params.billed_tokens,
            balance_after: outcome.balance_after,
            paygo_triggered: outcome.paygo_triggered,
        })
    }

    /// Atomic credit: balance increment and CREDIT ledger entry commit
    /// together.
    pub async fn credit_organization(
        &self,
        org_id: &str,
        tokens: u64,
        opts: CreditOpts,
    ) -> Result<CreditReceipt, BillingError> {
        if tokens == 0 {
            return Err(BillingError::InvalidRequest {
                reason: "credit amount must be > 0".into(),
            });
        }

        let request = CreditRequest {
            organization_id: org_id.to_string(),
            actor_user_id: opts.user_id,
            tokens,
            reason: if opts.reason.is_empty() {
                "token credit".into()
            } else {
                opts.reason
            },
            ref_entity_type: opts.ref_entity_type,
            ref_entity_id: opts.ref_entity_id,
            metadata: LedgerMetadata::CreditV1 { note: opts.note },
        };

        let outcome = self
            .with_retries(|| {
                let store = Arc::clone(&self.store);
                let request = request.clone();
                async move { store.credit(&request).await }
            })
            .await
            .map_err(|err| BillingError::from_store(err, org_id))?;

        tracing::debug!(
            org_id,
            tokens,
            ledger_id = outcome.ledger_id,
            balance_after = outcome.balance_after,
            "credit settled"
        );

        Ok(CreditReceipt {
            organization_id: org_id.to_string(),
            ledger_id: outcome.ledger_id,
            tokens,
            balance_after: outcome.balance_after,
        })
    }

    pub async fn get_organization(
        &self,
        org_id: &str,
    ) -> Result<OrganizationBalance, BillingError> {
        self.store
            .get_organization(org_id)
            .await
            .map_err(|err| BillingError::from_store(err, org_id))
    }

    pub async fn provision_organization(
        &self,
        org_id: &str,
        organization_type: OrganizationType,
        initial_tokens: u64,
    ) -> Result<OrganizationBalance, BillingError> {
        self.store
            .provision_organization(org_id, organization_type, initial_tokens)
            .await
            .map_err(|err| BillingError::from_store(err, org_id))
    }

    pub async fn deactivate_organization(&self, org_id: &str) -> Result<(), BillingError> {
        self.store
            .deactivate_organization(org_id)
            .await
            .map_err(|err| BillingError::from_store(err, org_id))
    }

    /// Trial -> Active upgrade (external billing event).
    pub async fn activate_organization(&self, org_id: &str) -> Result<(), BillingError> {
        self.store
            .transition_billing_status(org_id, BillingStatus::Trial, BillingStatus::Active)
            .await
            .map_err(|err| BillingError::from_store(err, org_id))
    }

    /// PaygoPending -> Active once the overdraft is settled (external event).
    pub async fn settle_organization(&self, org_id: &str) -> Result<(), BillingError> {
        self.store
            .transition_billing_status(org_id, BillingStatus::PaygoPending, BillingStatus::Active)
            .await
            .map_err(|err| BillingError::from_store(err, org_id))
    }

    pub async fn get_ledger(
        &self,
        org_id: &str,
        page: LedgerPage,
    ) -> Result<Vec<LedgerEntry>, BillingError> {
        self.store
            .list_ledger(org_id, page.limit, page.offset)
            .await
            .map_err(|err| BillingError::from_store(err, org_id))
    }

    pub async fn get_ledger_summary(&self, org_id: &str) -> Result<LedgerSummary, BillingError> {
        self.store
            .ledger_summary(org_id)
            .await
            .map_err(|err| BillingError::from_store(err, org_id))
    }

    /// Legacy human-readable record of the same events, for
    /// backward-compatible reporting. Not authoritative; reconcile against
    /// the ledger.
    pub async fn get_legacy_transactions(
        &self,
        org_id: &str,
        page: LedgerPage,
    ) -> Result<Vec<LegacyTransaction>, BillingError> {
        self.store
            .list_legacy_transactions(org_id, page.limit, page.offset)
            .await
            .map_err(|err| BillingError::from_store(err, org_id))
    }

    /// Margin row for a source type, substituting the configured zero-markup
    /// default when no active row exists. The substitution is degraded
    /// behavior worth a warning, not an error.
    pub async fn get_margin(&self, source_type: SourceType) -> Result<Margin, BillingError> {
        match self.store.get_margin(source_type).await {
            Ok(Some(margin)) if margin.is_active => Ok(margin),
            Ok(Some(_)) => {
                tracing::warn!(
                    source_type = %source_type,
                    "margin row inactive, billing with default margin"
                );
                Ok(self.config.default_margin.to_margin(source_type))
            }
            Ok(None) => {
                tracing::warn!(
                    source_type = %source_type,
                    "no margin configured, billing with default margin"
                );
                Ok(self.config.default_margin.to_margin(source_type))
            }
            Err(err) => Err(BillingError::Storage(err)),
        }
    }

    /// Applies a partial margin update, seeding a missing row from the
    /// configured default. Rejected with no partial effect when invalid.
    pub async fn update_margin(
        &self,
        source_type: SourceType,
        update: MarginUpdate,
    ) -> Result<Margin, BillingError> {
        if update.is_empty() {
            return Err(BillingError::InvalidRequest {
                reason: "margin update has no fields set".into(),
            });
        }
        if let Some(percent) = update.margin_percent {
            if !percent.is_finite() || percent < 0.0 {
                return Err(BillingError::InvalidRequest {
                    reason: format!("margin_percent must be finite and >= 0, got {percent}"),
                });
            }
        }

        let mut margin = match self.store.get_margin(source_type).await? {
            Some(existing) => existing,
            None => self.config.default_margin.to_margin(source_type),
        };
        update.apply(&mut margin);
        self.store.put_margin(&margin).await?;
        tracing::debug!(source_type = %source_type, "margin updated");
        Ok(margin)
    }

    pub async fn get_user_balance(
        &self,
        user_id: &str,
    ) -> Result<Option<UserBalance>, BillingError> {
        Ok(self.store.get_user_balance(user_id).await?)
    }

    /// Legacy per-user tally for usage outside an organization context.
    pub async fn record_user_usage(
        &self,
        user_id: &str,
        source_type: SourceType,
        tokens: u64,
    ) -> Result<UserBalance, BillingError> {
        Ok(self
            .store
            .apply_user_usage(user_id, source_type, tokens)
            .await?)
    }

    pub async fn credit_user_tokens(
        &self,
        user_id: &str,
        tokens: u64,
        bonus: bool,
    ) -> Result<UserBalance, BillingError> {
        Ok(self.store.credit_user_tokens(user_id, tokens, bonus).await?)
    }

    /// Runs an operation with bounded retries on transient conflicts. After
    /// the budget is spent the `Busy` error surfaces; the operation never
    /// blocks indefinitely and never silently succeeds.
    async fn with_retries<T, F, Fut>(&self, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, StoreError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Err(StoreError::Busy) if attempt < self.config.max_txn_retries => {
                    attempt += 1;
                    tracing::debug!(attempt, "store busy, retrying");
                    tokio::time::sleep(Duration::from_millis(10 * u64::from(attempt))).await;
                }
                other => return other,
            }
        }
    }
}
