//! In-memory billing store for deterministic tests.
//!
//! Mirrors the SQLite backend's atomicity contract: every mutation is staged
//! against copies and published only when the whole operation succeeds, so an
//! injected ledger-write failure leaves no partial state behind. Fault
//! injection knobs cover the rollback and bounded-retry paths that are hard
//! to provoke against a real database.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::store::{
    BillingStore, CreditOutcome, CreditRequest, DebitOutcome, DebitRequest,
};
use crate::types::{
    ActorType, BillingStatus, EntryType, LedgerEntry, LedgerMetadata, LedgerSummary,
    LegacyTransaction, LegacyTxnKind, Margin, OrganizationBalance, OrganizationType, SourceType,
    UserBalance,
};

#[derive(Debug, Default)]
struct Inner {
    organizations: HashMap<String, OrganizationBalance>,
    ledger: Vec<LedgerEntry>,
    legacy: Vec<LegacyTransaction>,
    margins: HashMap<SourceType, Margin>,
    users: HashMap<String, UserBalance>,
    next_ledger_id: i64,
    next_txn_id: i64,
    fail_next_ledger_write: bool,
    busy_failures_remaining: u32,
    clock_ms: u64,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next ledger append fails with `StoreError::LedgerWrite` and the
    /// enclosing operation rolls back.
    pub fn fail_next_ledger_write(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.fail_next_ledger_write = true;
        }
    }

    /// The next `count` operations fail with `StoreError::Busy` before any
    /// state is touched, exercising the engine's bounded retry.
    pub fn inject_busy(&self, count: u32) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.busy_failures_remaining = count;
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".into()))
    }
}

impl Inner {
    fn take_busy(&mut self) -> Result<(), StoreError> {
        if self.busy_failures_remaining > 0 {
            self.busy_failures_remaining -= 1;
            return Err(StoreError::Busy);
        }
        Ok(())
    }

    fn now(&mut self) -> u64 {
        // Monotonic fake clock keeps entry ordering stable in tests.
        self.clock_ms += 1;
        self.clock_ms
    }

    fn alloc_ledger_id(&mut self) -> Result<i64, StoreError> {
        if self.fail_next_ledger_write {
            self.fail_next_ledger_write = false;
            return Err(StoreError::LedgerWrite("injected ledger failure".into()));
        }
        self.next_ledger_id += 1;
        Ok(self.next_ledger_id)
    }

    fn alloc_txn_id(&mut self) -> i64 {
        self.next_txn_id += 1;
        self.next_txn_id
    }

    fn organization(&self, org_id: &str) -> Result<&OrganizationBalance, StoreError> {
        self.organizations.get(org_id).ok_or(StoreError::NotFound)
    }
}

#[async_trait]
impl BillingStore for MemoryStore {
    async fn provision_organization(
        &self,
        org_id: &str,
        organization_type: OrganizationType,
        initial_tokens: u64,
    ) -> Result<OrganizationBalance, StoreError> {
        let mut inner = self.lock()?;
        inner.take_busy()?;
        if inner.organizations.contains_key(org_id) {
            return Err(StoreError::Backend(format!(
                "organization {org_id} already provisioned"
            )));
        }
        let now = inner.now();
        let status = match organization_type {
            OrganizationType::Trial => BillingStatus::Trial,
            OrganizationType::Paid => BillingStatus::Active,
        };
        let balance = tokens_to_balance(initial_tokens);

        let ledger_id = if initial_tokens > 0 {
            Some(inner.alloc_ledger_id()?)
        } else {
            None
        };

        let org = OrganizationBalance {
            organization_id: org_id.to_string(),
            balance,
            billing_status: status,
            organization_type,
            is_active: true,
            created_at_ms: now,
            updated_at_ms: now,
        };
        inner.organizations.insert(org_id.to_string(), org.clone());
        if let Some(id) = ledger_id {
            inner.ledger.push(LedgerEntry {
                id,
                organization_id: org_id.to_string(),
                actor_user_id: None,
                actor_type: ActorType::System,
                entry_type: EntryType::Credit,
                amount: initial_tokens,
                reason: "initial grant".into(),
                ref_entity_type: None,
                ref_entity_id: None,
                metadata: LedgerMetadata::CreditV1 {
                    note: Some("provisioning".into()),
                },
                created_at_ms: now,
            });
        }
        Ok(org)
    }

    async fn get_organization(&self, org_id: &str) -> Result<OrganizationBalance, StoreError> {
        let mut inner = self.lock()?;
        inner.take_busy()?;
        inner.organization(org_id).cloned()
    }

    async fn deactivate_organization(&self, org_id: &str) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.take_busy()?;
        let now = inner.now();
        let org = inner
            .organizations
            .get_mut(org_id)
            .ok_or(StoreError::NotFound)?;
        org.is_active = false;
        org.updated_at_ms = now;
        Ok(())
    }

    async fn transition_billing_status(
        &self,
        org_id: &str,
        from: BillingStatus,
        to: BillingStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.take_busy()?;
        let now = inner.now();
        let org = inner
            .organizations
            .get_mut(org_id)
            .ok_or(StoreError::NotFound)?;
        if org.billing_status != from {
            return Err(StoreError::InvalidTransition {
                expected: from.as_str().to_string(),
                found: org.billing_status.as_str().to_string(),
            });
        }
        org.billing_status = to;
        org.updated_at_ms = now;
        Ok(())
    }

    async fn debit(&self, request: &DebitRequest) -> Result<DebitOutcome, StoreError> {
        let mut inner = self.lock()?;
        inner.take_busy()?;

        // Stage everything against a copy; publish only on full success.
        let mut org = inner.organization(&request.organization_id)?.clone();
        if !org.is_active {
            return Err(StoreError::Backend(format!(
                "organization {} is deactivated",
                request.organization_id
            )));
        }
        let is_trial = org.billing_status == BillingStatus::Trial
            || org.organization_type == OrganizationType::Trial;
        let covered = org.balance >= 0 && org.balance as u64 >= request.billed_tokens;
        if is_trial && !covered {
            return Err(StoreError::InsufficientBalance {
                balance: org.balance,
                requested: request.billed_tokens,
            });
        }

        let now = inner.now();
        let ledger_id = inner.alloc_ledger_id()?;
        let transaction_id = inner.alloc_txn_id();

        org.balance -= tokens_to_balance(request.billed_tokens);
        org.updated_at_ms = now;

        let paygo_triggered = org.organization_type != OrganizationType::Trial
            && org.billing_status == BillingStatus::Active
            && org.balance < 0;
        let paygo_entry = if paygo_triggered {
            org.billing_status = BillingStatus::PaygoPending;
            Some(LedgerEntry {
                id: inner.alloc_ledger_id()?,
                organization_id: request.organization_id.clone(),
                actor_user_id: None,
                actor_type: ActorType::System,
                entry_type: EntryType::Debit,
                amount: 0,
                reason: "PAYGO_TRIGGERED".into(),
                ref_entity_type: None,
                ref_entity_id: None,
                metadata: LedgerMetadata::PaygoTriggerV1 {
                    balance_after: org.balance,
                },
                created_at_ms: now,
            })
        } else {
            None
        };

        let balance_after = org.balance;
        inner
            .organizations
            .insert(request.organization_id.clone(), org);
        inner.legacy.push(LegacyTransaction {
            id: transaction_id,
            organization_id: request.organization_id.clone(),
            user_id: request.actor_user_id.clone(),
            kind: LegacyTxnKind::Usage,
            tokens: request.billed_tokens,
            description: request.reason.clone(),
            created_at_ms: now,
        });
        inner.ledger.push(LedgerEntry {
            id: ledger_id,
            organization_id: request.organization_id.clone(),
            actor_user_id: request.actor_user_id.clone(),
            actor_type: ActorType::User,
            entry_type: EntryType::Debit,
            amount: request.billed_tokens,
            reason: request.reason.clone(),
            ref_entity_type: request.ref_entity_type.clone(),
            ref_entity_id: request.ref_entity_id.clone(),
            metadata: request.metadata.clone(),
            created_at_ms: now,
        });
        if let Some(entry) = paygo_entry {
            inner.ledger.push(entry);
        }

        Ok(DebitOutcome {
            transaction_id,
            ledger_id,
            balance_after,
            paygo_triggered,
        })
    }

    async fn credit(&self, request: &CreditRequest) -> Result<CreditOutcome, StoreError> {
        let mut inner = self.lock()?;
        inner.take_busy()?;

        let mut org = inner.organization(&request.organization_id)?.clone();
        let now = inner.now();
        let ledger_id = inner.alloc_ledger_id()?;
        let transaction_id = inner.alloc_txn_id();

        org.balance += tokens_to_balance(request.tokens);
        org.updated_at_ms = now;
        let balance_after = org.balance;

        inner
            .organizations
            .insert(request.organization_id.clone(), org);
        inner.legacy.push(LegacyTransaction {
            id: transaction_id,
            organization_id: request.organization_id.clone(),
            user_id: request.actor_user_id.clone(),
            kind: LegacyTxnKind::Purchase,
            tokens: request.tokens,
            description: request.reason.clone(),
            created_at_ms: now,
        });
        inner.ledger.push(LedgerEntry {
            id: ledger_id,
            organization_id: request.organization_id.clone(),
            actor_user_id: request.actor_user_id.clone(),
            actor_type: if request.actor_user_id.is_some() {
                ActorType::User
            } else {
                ActorType::System
            },
            entry_type: EntryType::Credit,
            amount: request.tokens,
            reason: request.reason.clone(),
            ref_entity_type: request.ref_entity_type.clone(),
            ref_entity_id: request.ref_entity_id.clone(),
            metadata: request.metadata.clone(),
            created_at_ms: now,
        });

        Ok(CreditOutcome {
            transaction_id,
            ledger_id,
            balance_after,
        })
    }

    async fn list_ledger(
        &self,
        org_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .ledger
            .iter()
            .rev()
            .filter(|entry| entry.organization_id == org_id)
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn ledger_summary(&self, org_id: &str) -> Result<LedgerSummary, StoreError> {
        let inner = self.lock()?;
        let mut total_credits = 0u64;
        let mut total_debits = 0u64;
        let mut transaction_count = 0u64;
        for entry in inner.ledger.iter().filter(|e| e.organization_id == org_id) {
            transaction_count += 1;
            match entry.entry_type {
                EntryType::Credit => total_credits = total_credits.saturating_add(entry.amount),
                EntryType::Debit => total_debits = total_debits.saturating_add(entry.amount),
            }
        }
        Ok(LedgerSummary {
            total_credits,
            total_debits,
            computed_balance: total_credits as i64 - total_debits as i64,
            transaction_count,
        })
    }

    async fn list_legacy_transactions(
        &self,
        org_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<LegacyTransaction>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .legacy
            .iter()
            .rev()
            .filter(|txn| txn.organization_id == org_id)
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn get_margin(&self, source_type: SourceType) -> Result<Option<Margin>, StoreError> {
        let inner = self.lock()?;
        Ok(inner.margins.get(&source_type).cloned())
    }

    async fn put_margin(&self, margin: &Margin) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.margins.insert(margin.source_type, margin.clone());
        Ok(())
    }

    async fn get_user_balance(&self, user_id: &str) -> Result<Option<UserBalance>, StoreError> {
        let inner = self.lock()?;
        Ok(inner.users.get(user_id).cloned())
    }

    async fn apply_user_usage(
        &self,
        user_id: &str,
        source_type: SourceType,
        tokens: u64,
    ) -> Result<UserBalance, StoreError> {
        let mut inner = self.lock()?;
        inner.take_busy()?;
        let balance = inner
            .users
            .entry(user_id.to_string())
            .or_insert_with(|| UserBalance {
                user_id: user_id.to_string(),
                ..UserBalance::default()
            });

        match source_type {
            SourceType::Platform => {
                let from_bonus = balance.platform_tokens_bonus.min(tokens);
                balance.platform_tokens_bonus -= from_bonus;
                balance.platform_tokens =
                    balance.platform_tokens.saturating_sub(tokens - from_bonus);
            }
            SourceType::Byok => {
                balance.byok_usage_tokens = balance.byok_usage_tokens.saturating_add(tokens);
            }
            SourceType::Local => {
                balance.local_usage_tokens = balance.local_usage_tokens.saturating_add(tokens);
            }
        }
        balance.lifetime_used = balance.lifetime_used.saturating_add(tokens);
        Ok(balance.clone())
    }

    async fn credit_user_tokens(
        &self,
        user_id: &str,
        tokens: u64,
        bonus: bool,
    ) -> Result<UserBalance, StoreError> {
        let mut inner = self.lock()?;
        inner.take_busy()?;
        let balance = inner
            .users
            .entry(user_id.to_string())
            .or_insert_with(|| UserBalance {
                user_id: user_id.to_string(),
                ..UserBalance::default()
            });

        if bonus {
            balance.platform_tokens_bonus = balance.platform_tokens_bonus.saturating_add(tokens);
        } else {
            balance.platform_tokens = balance.platform_tokens.saturating_add(tokens);
            balance.lifetime_purchased = balance.lifetime_purchased.saturating_add(tokens);
        }
        Ok(balance.clone())
    }
}

fn tokens_to_balance(tokens: u64) -> i64 {
    if tokens > i64::MAX as u64 {
        i64::MAX
    } else {
        tokens as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn debit_request(org_id: &str, tokens: u64) -> DebitRequest {
        DebitRequest {
            organization_id: org_id.to_string(),
            actor_user_id: None,
            billed_tokens: tokens,
            reason: "ai usage".into(),
            ref_entity_type: None,
            ref_entity_id: None,
            metadata: LedgerMetadata::Empty,
        }
    }

    #[tokio::test]
    async fn injected_ledger_failure_rolls_back_everything() {
        let store = MemoryStore::new();
        store
            .provision_organization("org-1", OrganizationType::Paid, 1_000)
            .await
            .expect("provision");

        store.fail_next_ledger_write();
        let err = store.debit(&debit_request("org-1", 100)).await;
        assert!(matches!(err, Err(StoreError::LedgerWrite(_))));

        // Balance untouched, no debit row, no legacy row.
        let org = store.get_organization("org-1").await.expect("org");
        assert_eq!(org.balance, 1_000);
        let summary = store.ledger_summary("org-1").await.expect("summary");
        assert_eq!(summary.total_debits, 0);
        assert_eq!(summary.transaction_count, 1);
        let legacy = store
            .list_legacy_transactions("org-1", 10, 0)
            .await
            .expect("legacy");
        assert!(legacy.is_empty());

        // The fault is one-shot; the retried action settles normally.
        let outcome = store
            .debit(&debit_request("org-1", 100))
            .await
            .expect("debit");
        assert_eq!(outcome.balance_after, 900);
    }

    #[tokio::test]
    async fn busy_injection_is_consumed_per_operation() {
        let store = MemoryStore::new();
        store
            .provision_organization("org-1", OrganizationType::Paid, 100)
            .await
            .expect("provision");

        store.inject_busy(2);
        assert!(matches!(
            store.get_organization("org-1").await,
            Err(StoreError::Busy)
        ));
        assert!(matches!(
            store.get_organization("org-1").await,
            Err(StoreError::Busy)
        ));
        assert!(store.get_organization("org-1").await.is_ok());
    }

    #[tokio::test]
    async fn trial_recheck_denies_inside_the_operation() {
        let store = MemoryStore::new();
        store
            .provision_organization("org-1", OrganizationType::Trial, 50)
            .await
            .expect("provision");

        let err = store.debit(&debit_request("org-1", 100)).await;
        assert!(matches!(
            err,
            Err(StoreError::InsufficientBalance {
                balance: 50,
                requested: 100
            })
        ));
    }

    #[tokio::test]
    async fn paygo_marker_written_once() {
        let store = MemoryStore::new();
        store
            .provision_organization("org-1", OrganizationType::Paid, 100)
            .await
            .expect("provision");

        let outcome = store
            .debit(&debit_request("org-1", 150))
            .await
            .expect("debit");
        assert!(outcome.paygo_triggered);
        let outcome = store
            .debit(&debit_request("org-1", 10))
            .await
            .expect("debit");
        assert!(!outcome.paygo_triggered);

        let entries = store.list_ledger("org-1", 50, 0).await.expect("ledger");
        assert_eq!(
            entries
                .iter()
                .filter(|entry| entry.reason == "PAYGO_TRIGGERED")
                .count(),
            1
        );
    }
}
