//! Durable SQLite-backed billing store.
//!
//! Every logical operation runs inside one SQL transaction opened with
//! immediate behavior, so the writer lock serializes concurrent debits
//! against the same database while readers proceed under WAL. A busy
//! timeout bounds lock waits; lock contention surfaces as
//! [`StoreError::Busy`] for the engine's bounded retry.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{OptionalExtension, TransactionBehavior};

use crate::error::StoreError;
use crate::store::{
    BillingStore, CreditOutcome, CreditRequest, DebitOutcome, DebitRequest,
};
use crate::types::{
    ActorType, BillingStatus, EntryType, LedgerEntry, LedgerMetadata, LedgerSummary,
    LegacyTransaction, LegacyTxnKind, Margin, OrganizationBalance, OrganizationType, SourceType,
    UserBalance,
};

#[derive(Clone, Debug)]
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        let path = self.path.clone();
        spawn_blocking(move || {
            let conn = open_connection(path)?;
            init_schema(&conn).map_err(map_sqlite_err)?;
            Ok(())
        })
        .await
    }
}

async fn spawn_blocking<T: Send + 'static>(
    work: impl FnOnce() -> Result<T, StoreError> + Send + 'static,
) -> Result<T, StoreError> {
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| StoreError::Backend(format!("join error: {err}")))?
}

#[async_trait]
impl BillingStore for SqliteStore {
    async fn provision_organization(
        &self,
        org_id: &str,
        organization_type: OrganizationType,
        initial_tokens: u64,
    ) -> Result<OrganizationBalance, StoreError> {
        let path = self.path.clone();
        let org_id = org_id.to_string();
        spawn_blocking(move || {
            let mut conn = open_connection(path)?;
            init_schema(&conn).map_err(map_sqlite_err)?;
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(map_sqlite_err)?;
            let now = now_millis();

            let status = match organization_type {
                OrganizationType::Trial => BillingStatus::Trial,
                OrganizationType::Paid => BillingStatus::Active,
            };

            tx.execute(
                "INSERT INTO organizations
                     (id, token_balance, billing_status, organization_type, is_active,
                      created_at_ms, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5)",
                rusqlite::params![
                    org_id,
                    tokens_to_i64(initial_tokens),
                    status.as_str(),
                    organization_type.as_str(),
                    now
                ],
            )
            .map_err(map_sqlite_err)?;

            // The initial grant is a ledger event like any other; a balance
            // must never appear without its CREDIT entry.
            if initial_tokens > 0 {
                insert_ledger_entry(
                    &tx,
                    &org_id,
                    None,
                    ActorType::System,
                    EntryType::Credit,
                    initial_tokens,
                    "initial grant",
                    None,
                    None,
                    &LedgerMetadata::CreditV1 {
                        note: Some("provisioning".into()),
                    },
                    now,
                )?;
            }

            let org = read_organization(&tx, &org_id)?;
            tx.commit().map_err(map_sqlite_err)?;
            Ok(org)
        })
        .await
    }

    async fn get_organization(&self, org_id: &str) -> Result<OrganizationBalance, StoreError> {
        let path = self.path.clone();
        let org_id = org_id.to_string();
        spawn_blocking(move || {
            let conn = open_connection(path)?;
            init_schema(&conn).map_err(map_sqlite_err)?;
            read_organization(&conn, &org_id)
        })
        .await
    }

    async fn deactivate_organization(&self, org_id: &str) -> Result<(), StoreError> {
        let path = self.path.clone();
        let org_id = org_id.to_string();
        spawn_blocking(move || {
            let conn = open_connection(path)?;
            init_schema(&conn).map_err(map_sqlite_err)?;
            let updated = conn
                .execute(
                    "UPDATE organizations SET is_active = 0, updated_at_ms = ?2 WHERE id = ?1",
                    rusqlite::params![org_id, now_millis()],
                )
                .map_err(map_sqlite_err)?;
            if updated == 0 {
                return Err(StoreError::NotFound);
            }
            Ok(())
        })
        .await
    }

    async fn transition_billing_status(
        &self,
        org_id: &str,
        from: BillingStatus,
        to: BillingStatus,
    ) -> Result<(), StoreError> {
        let path = self.path.clone();
        let org_id = org_id.to_string();
        spawn_blocking(move || {
            let mut conn = open_connection(path)?;
            init_schema(&conn).map_err(map_sqlite_err)?;
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(map_sqlite_err)?;

            let org = read_organization(&tx, &org_id)?;
            if org.billing_status != from {
                return Err(StoreError::InvalidTransition {
                    expected: from.as_str().to_string(),
                    found: org.billing_status.as_str().to_string(),
                });
            }
            tx.execute(
                "UPDATE organizations SET billing_status = ?2, updated_at_ms = ?3 WHERE id = ?1",
                rusqlite::params![org_id, to.as_str(), now_millis()],
            )
            .map_err(map_sqlite_err)?;
            tx.commit().map_err(map_sqlite_err)?;
            Ok(())
        })
        .await
    }

    async fn debit(&self, request: &DebitRequest) -> Result<DebitOutcome, StoreError> {
        let path = self.path.clone();
        let request = request.clone();
        spawn_blocking(move || {
            let mut conn = open_connection(path)?;
            init_schema(&conn).map_err(map_sqlite_err)?;
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(map_sqlite_err)?;
            let now = now_millis();

            // Authoritative re-check on a freshly read row. The pre-flight
            // quota decision may be stale by the time we hold the write
            // lock; two racing debits must not both pass the trial ceiling.
            let org = read_organization(&tx, &request.organization_id)?;
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

            tx.execute(
                "UPDATE organizations
                 SET token_balance = token_balance - ?2, updated_at_ms = ?3
                 WHERE id = ?1",
                rusqlite::params![
                    request.organization_id,
                    tokens_to_i64(request.billed_tokens),
                    now
                ],
            )
            .map_err(map_sqlite_err)?;

            tx.execute(
                "INSERT INTO legacy_transactions
                     (organization_id, user_id, kind, tokens, description, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    request.organization_id,
                    request.actor_user_id,
                    LegacyTxnKind::Usage.as_str(),
                    tokens_to_i64(request.billed_tokens),
                    request.reason,
                    now
                ],
            )
            .map_err(map_sqlite_err)?;
            let transaction_id = tx.last_insert_rowid();

            let ledger_id = insert_ledger_entry(
                &tx,
                &request.organization_id,
                request.actor_user_id.as_deref(),
                ActorType::User,
                EntryType::Debit,
                request.billed_tokens,
                &request.reason,
                request.ref_entity_type.as_deref(),
                request.ref_entity_id.as_deref(),
                &request.metadata,
                now,
            )?;

            let after = read_organization(&tx, &request.organization_id)?;
            // Edge-triggered: fires only on the ACTIVE -> negative crossing.
            // Once the status is paygo_pending the guard no longer matches.
            let paygo_triggered = after.organization_type != OrganizationType::Trial
                && after.billing_status == BillingStatus::Active
                && after.balance < 0;
            if paygo_triggered {
                tx.execute(
                    "UPDATE organizations SET billing_status = ?2, updated_at_ms = ?3
                     WHERE id = ?1",
                    rusqlite::params![
                        request.organization_id,
                        BillingStatus::PaygoPending.as_str(),
                        now
                    ],
                )
                .map_err(map_sqlite_err)?;
                insert_ledger_entry(
                    &tx,
                    &request.organization_id,
                    None,
                    ActorType::System,
                    EntryType::Debit,
                    0,
                    "PAYGO_TRIGGERED",
                    None,
                    None,
                    &LedgerMetadata::PaygoTriggerV1 {
                        balance_after: after.balance,
                    },
                    now,
                )?;
            }

            tx.commit().map_err(map_sqlite_err)?;
            Ok(DebitOutcome {
                transaction_id,
                ledger_id,
                balance_after: after.balance,
                paygo_triggered,
            })
        })
        .await
    }

    async fn credit(&self, request: &CreditRequest) -> Result<CreditOutcome, StoreError> {
        let path = self.path.clone();
        let request = request.clone();
        spawn_blocking(move || {
            let mut conn = open_connection(path)?;
            init_schema(&conn).map_err(map_sqlite_err)?;
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(map_sqlite_err)?;
            let now = now_millis();

            // Existence check first so a missing tenant is NotFound, not a
            // silent upsert.
            let _ = read_organization(&tx, &request.organization_id)?;

            tx.execute(
                "UPDATE organizations
                 SET token_balance = token_balance + ?2, updated_at_ms = ?3
                 WHERE id = ?1",
                rusqlite::params![
                    request.organization_id,
                    tokens_to_i64(request.tokens),
                    now
                ],
            )
            .map_err(map_sqlite_err)?;

            tx.execute(
                "INSERT INTO legacy_transactions
                     (organization_id, user_id, kind, tokens, description, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    request.organization_id,
                    request.actor_user_id,
                    LegacyTxnKind::Purchase.as_str(),
                    tokens_to_i64(request.tokens),
                    request.reason,
                    now
                ],
            )
            .map_err(map_sqlite_err)?;
            let transaction_id = tx.last_insert_rowid();

            let actor_type = if request.actor_user_id.is_some() {
                ActorType::User
            } else {
                ActorType::System
            };
            let ledger_id = insert_ledger_entry(
                &tx,
                &request.organization_id,
                request.actor_user_id.as_deref(),
                actor_type,
                EntryType::Credit,
                request.tokens,
                &request.reason,
                request.ref_entity_type.as_deref(),
                request.ref_entity_id.as_deref(),
                &request.metadata,
                now,
            )?;

            let after = read_organization(&tx, &request.organization_id)?;
            tx.commit().map_err(map_sqlite_err)?;
            Ok(CreditOutcome {
                transaction_id,
                ledger_id,
                balance_after: after.balance,
            })
        })
        .await
    }

    async fn list_ledger(
        &self,
        org_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let path = self.path.clone();
        let org_id = org_id.to_string();
        spawn_blocking(move || {
            let conn = open_connection(path)?;
            init_schema(&conn).map_err(map_sqlite_err)?;

            let mut stmt = conn
                .prepare(
                    "SELECT id, organization_id, actor_user_id, actor_type, entry_type,
                            amount, reason, ref_entity_type, ref_entity_id, metadata_json,
                            created_at_ms
                     FROM token_ledger
                     WHERE organization_id = ?1
                     ORDER BY id DESC
                     LIMIT ?2 OFFSET ?3",
                )
                .map_err(map_sqlite_err)?;
            let rows = stmt
                .query_map(rusqlite::params![org_id, limit, offset], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, Option<String>>(7)?,
                        row.get::<_, Option<String>>(8)?,
                        row.get::<_, String>(9)?,
                        row.get::<_, i64>(10)?,
                    ))
                })
                .map_err(map_sqlite_err)?;

            let mut out = Vec::new();
            for row in rows {
                let (
                    id,
                    organization_id,
                    actor_user_id,
                    actor_type,
                    entry_type,
                    amount,
                    reason,
                    ref_entity_type,
                    ref_entity_id,
                    metadata_json,
                    created_at_ms,
                ) = row.map_err(map_sqlite_err)?;
                out.push(LedgerEntry {
                    id,
                    organization_id,
                    actor_user_id,
                    actor_type: parse_column(&actor_type)?,
                    entry_type: parse_column(&entry_type)?,
                    amount: i64_to_u64(amount),
                    reason,
                    ref_entity_type,
                    ref_entity_id,
                    metadata: serde_json::from_str(&metadata_json)
                        .map_err(|err| StoreError::Backend(format!("metadata decode: {err}")))?,
                    created_at_ms: i64_to_u64(created_at_ms),
                });
            }
            Ok(out)
        })
        .await
    }

    async fn ledger_summary(&self, org_id: &str) -> Result<LedgerSummary, StoreError> {
        let path = self.path.clone();
        let org_id = org_id.to_string();
        spawn_blocking(move || {
            let conn = open_connection(path)?;
            init_schema(&conn).map_err(map_sqlite_err)?;

            let (credits, debits, count): (i64, i64, i64) = conn
                .query_row(
                    "SELECT
                         COALESCE(SUM(CASE WHEN entry_type = 'credit' THEN amount END), 0),
                         COALESCE(SUM(CASE WHEN entry_type = 'debit' THEN amount END), 0),
                         COUNT(*)
                     FROM token_ledger
                     WHERE organization_id = ?1",
                    rusqlite::params![org_id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .map_err(map_sqlite_err)?;

            Ok(LedgerSummary {
                total_credits: i64_to_u64(credits),
                total_debits: i64_to_u64(debits),
                computed_balance: credits - debits,
                transaction_count: i64_to_u64(count),
            })
        })
        .await
    }

    async fn list_legacy_transactions(
        &self,
        org_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<LegacyTransaction>, StoreError> {
        let path = self.path.clone();
        let org_id = org_id.to_string();
        spawn_blocking(move || {
            let conn = open_connection(path)?;
            init_schema(&conn).map_err(map_sqlite_err)?;

            let mut stmt = conn
                .prepare(
                    "SELECT id, organization_id, user_id, kind, tokens, description,
                            created_at_ms
                     FROM legacy_transactions
                     WHERE organization_id = ?1
                     ORDER BY id DESC
                     LIMIT ?2 OFFSET ?3",
                )
                .map_err(map_sqlite_err)?;
            let rows = stmt
                .query_map(rusqlite::params![org_id, limit, offset], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, i64>(6)?,
                    ))
                })
                .map_err(map_sqlite_err)?;

            let mut out = Vec::new();
            for row in rows {
                let (id, organization_id, user_id, kind, tokens, description, created_at_ms) =
                    row.map_err(map_sqlite_err)?;
                out.push(LegacyTransaction {
                    id,
                    organization_id,
                    user_id,
                    kind: parse_column(&kind)?,
                    tokens: i64_to_u64(tokens),
                    description,
                    created_at_ms: i64_to_u64(created_at_ms),
                });
            }
            Ok(out)
        })
        .await
    }

    async fn get_margin(&self, source_type: SourceType) -> Result<Option<Margin>, StoreError> {
        let path = self.path.clone();
        spawn_blocking(move || {
            let conn = open_connection(path)?;
            init_schema(&conn).map_err(map_sqlite_err)?;

            conn.query_row(
                "SELECT base_cost_per_1k_usd_micros, margin_percent, min_charge_usd_micros,
                        is_active
                 FROM billing_margins
                 WHERE source_type = ?1",
                rusqlite::params![source_type.as_str()],
                |row| {
                    Ok(Margin {
                        source_type,
                        base_cost_per_1k_usd_micros: row.get::<_, i64>(0).map(i64_to_u64)?,
                        margin_percent: row.get(1)?,
                        min_charge_usd_micros: row.get::<_, i64>(2).map(i64_to_u64)?,
                        is_active: row.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(map_sqlite_err)
        })
        .await
    }

    async fn put_margin(&self, margin: &Margin) -> Result<(), StoreError> {
        let path = self.path.clone();
        let margin = margin.clone();
        spawn_blocking(move || {
            let conn = open_connection(path)?;
            init_schema(&conn).map_err(map_sqlite_err)?;

            conn.execute(
                "INSERT INTO billing_margins
                     (source_type, base_cost_per_1k_usd_micros, margin_percent,
                      min_charge_usd_micros, is_active)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(source_type) DO UPDATE SET
                     base_cost_per_1k_usd_micros = excluded.base_cost_per_1k_usd_micros,
                     margin_percent = excluded.margin_percent,
                     min_charge_usd_micros = excluded.min_charge_usd_micros,
                     is_active = excluded.is_active",
                rusqlite::params![
                    margin.source_type.as_str(),
                    tokens_to_i64(margin.base_cost_per_1k_usd_micros),
                    margin.margin_percent,
                    tokens_to_i64(margin.min_charge_usd_micros),
                    margin.is_active
                ],
            )
            .map_err(map_sqlite_err)?;
            Ok(())
        })
        .await
    }

    async fn get_user_balance(&self, user_id: &str) -> Result<Option<UserBalance>, StoreError> {
        let path = self.path.clone();
        let user_id = user_id.to_string();
        spawn_blocking(move || {
            let conn = open_connection(path)?;
            init_schema(&conn).map_err(map_sqlite_err)?;
            read_user_balance(&conn, &user_id)
        })
        .await
    }

    async fn apply_user_usage(
        &self,
        user_id: &str,
        source_type: SourceType,
        tokens: u64,
    ) -> Result<UserBalance, StoreError> {
        let path = self.path.clone();
        let user_id = user_id.to_string();
        spawn_blocking(move || {
            let mut conn = open_connection(path)?;
            init_schema(&conn).map_err(map_sqlite_err)?;
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(map_sqlite_err)?;

            ensure_user_row(&tx, &user_id)?;
            let mut balance =
                read_user_balance(&tx, &user_id)?.ok_or(StoreError::NotFound)?;

            match source_type {
                SourceType::Platform => {
                    // Bonus tokens are spent before purchased ones.
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

            write_user_balance(&tx, &balance)?;
            tx.commit().map_err(map_sqlite_err)?;
            Ok(balance)
        })
        .await
    }

    async fn credit_user_tokens(
        &self,
        user_id: &str,
        tokens: u64,
        bonus: bool,
    ) -> Result<UserBalance, StoreError> {
        let path = self.path.clone();
        let user_id = user_id.to_string();
        spawn_blocking(move || {
            let mut conn = open_connection(path)?;
            init_schema(&conn).map_err(map_sqlite_err)?;
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(map_sqlite_err)?;

            ensure_user_row(&tx, &user_id)?;
            let mut balance =
                read_user_balance(&tx, &user_id)?.ok_or(StoreError::NotFound)?;

            if bonus {
                balance.platform_tokens_bonus =
                    balance.platform_tokens_bonus.saturating_add(tokens);
            } else {
                balance.platform_tokens = balance.platform_tokens.saturating_add(tokens);
                balance.lifetime_purchased = balance.lifetime_purchased.saturating_add(tokens);
            }

            write_user_balance(&tx, &balance)?;
            tx.commit().map_err(map_sqlite_err)?;
            Ok(balance)
        })
        .await
    }
}

#[allow(clippy::too_many_arguments)]
fn insert_ledger_entry(
    conn: &rusqlite::Connection,
    org_id: &str,
    actor_user_id: Option<&str>,
    actor_type: ActorType,
    entry_type: EntryType,
    amount: u64,
    reason: &str,
    ref_entity_type: Option<&str>,
    ref_entity_id: Option<&str>,
    metadata: &LedgerMetadata,
    now: i64,
) -> Result<i64, StoreError> {
    let metadata_json = serde_json::to_string(metadata)
        .map_err(|err| StoreError::LedgerWrite(format!("metadata encode: {err}")))?;
    conn.execute(
        "INSERT INTO token_ledger
             (organization_id, actor_user_id, actor_type, entry_type, amount, reason,
              ref_entity_type, ref_entity_id, metadata_json, created_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        rusqlite::params![
            org_id,
            actor_user_id,
            actor_type.as_str(),
            entry_type.as_str(),
            tokens_to_i64(amount),
            reason,
            ref_entity_type,
            ref_entity_id,
            metadata_json,
            now
        ],
    )
    .map_err(|err| StoreError::LedgerWrite(err.to_string()))?;
    Ok(conn.last_insert_rowid())
}

fn read_organization(
    conn: &rusqlite::Connection,
    org_id: &str,
) -> Result<OrganizationBalance, StoreError> {
    let row = conn
        .query_row(
            "SELECT token_balance, billing_status, organization_type, is_active,
                    created_at_ms, updated_at_ms
             FROM organizations
             WHERE id = ?1",
            rusqlite::params![org_id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, bool>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            },
        )
        .optional()
        .map_err(map_sqlite_err)?;

    let Some((balance, status, org_type, is_active, created_at_ms, updated_at_ms)) = row else {
        return Err(StoreError::NotFound);
    };
    Ok(OrganizationBalance {
        organization_id: org_id.to_string(),
        balance,
        billing_status: parse_column(&status)?,
        organization_type: parse_column(&org_type)?,
        is_active,
        created_at_ms: i64_to_u64(created_at_ms),
        updated_at_ms: i64_to_u64(updated_at_ms),
    })
}

fn ensure_user_row(conn: &rusqlite::Connection, user_id: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO user_token_balance (user_id) VALUES (?1)",
        rusqlite::params![user_id],
    )
    .map_err(map_sqlite_err)?;
    Ok(())
}

fn read_user_balance(
    conn: &rusqlite::Connection,
    user_id: &str,
) -> Result<Option<UserBalance>, StoreError> {
    conn.query_row(
        "SELECT platform_tokens, platform_tokens_bonus, byok_usage_tokens,
                local_usage_tokens, lifetime_purchased, lifetime_used
         FROM user_token_balance
         WHERE user_id = ?1",
        rusqlite::params![user_id],
        |row| {
            Ok(UserBalance {
                user_id: user_id.to_string(),
                platform_tokens: row.get::<_, i64>(0).map(i64_to_u64)?,
                platform_tokens_bonus: row.get::<_, i64>(1).map(i64_to_u64)?,
                byok_usage_tokens: row.get::<_, i64>(2).map(i64_to_u64)?,
                local_usage_tokens: row.get::<_, i64>(3).map(i64_to_u64)?,
                lifetime_purchased: row.get::<_, i64>(4).map(i64_to_u64)?,
                lifetime_used: row.get::<_, i64>(5).map(i64_to_u64)?,
            })
        },
    )
    .optional()
    .map_err(map_sqlite_err)
}

fn write_user_balance(
    conn: &rusqlite::Connection,
    balance: &UserBalance,
) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE user_token_balance
         SET platform_tokens = ?2, platform_tokens_bonus = ?3, byok_usage_tokens = ?4,
             local_usage_tokens = ?5, lifetime_purchased = ?6, lifetime_used = ?7
         WHERE user_id = ?1",
        rusqlite::params![
            balance.user_id,
            tokens_to_i64(balance.platform_tokens),
            tokens_to_i64(balance.platform_tokens_bonus),
            tokens_to_i64(balance.byok_usage_tokens),
            tokens_to_i64(balance.local_usage_tokens),
            tokens_to_i64(balance.lifetime_purchased),
            tokens_to_i64(balance.lifetime_used)
        ],
    )
    .map_err(map_sqlite_err)?;
    Ok(())
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS organizations (
            id TEXT PRIMARY KEY NOT NULL,
            token_balance INTEGER NOT NULL DEFAULT 0,
            billing_status TEXT NOT NULL,
            organization_type TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at_ms INTEGER NOT NULL,
            updated_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS token_ledger (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            organization_id TEXT NOT NULL,
            actor_user_id TEXT,
            actor_type TEXT NOT NULL,
            entry_type TEXT NOT NULL,
            amount INTEGER NOT NULL CHECK (amount >= 0),
            reason TEXT NOT NULL,
            ref_entity_type TEXT,
            ref_entity_id TEXT,
            metadata_json TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_token_ledger_org_id
            ON token_ledger(organization_id, id);

        CREATE TABLE IF NOT EXISTS legacy_transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            organization_id TEXT NOT NULL,
            user_id TEXT,
            kind TEXT NOT NULL,
            tokens INTEGER NOT NULL,
            description TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_legacy_transactions_org_id
            ON legacy_transactions(organization_id, id);

        CREATE TABLE IF NOT EXISTS billing_margins (
            source_type TEXT PRIMARY KEY NOT NULL,
            base_cost_per_1k_usd_micros INTEGER NOT NULL DEFAULT 0,
            margin_percent REAL NOT NULL DEFAULT 0,
            min_charge_usd_micros INTEGER NOT NULL DEFAULT 0,
            is_active INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS user_token_balance (
            user_id TEXT PRIMARY KEY NOT NULL,
            platform_tokens INTEGER NOT NULL DEFAULT 0,
            platform_tokens_bonus INTEGER NOT NULL DEFAULT 0,
            byok_usage_tokens INTEGER NOT NULL DEFAULT 0,
            local_usage_tokens INTEGER NOT NULL DEFAULT 0,
            lifetime_purchased INTEGER NOT NULL DEFAULT 0,
            lifetime_used INTEGER NOT NULL DEFAULT 0
        );",
    )?;
    Ok(())
}

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, StoreError> {
    let conn = rusqlite::Connection::open(path).map_err(map_sqlite_err)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}

fn map_sqlite_err(err: rusqlite::Error) -> StoreError {
    if let rusqlite::Error::SqliteFailure(inner, _) = &err {
        if inner.code == rusqlite::ErrorCode::DatabaseBusy
            || inner.code == rusqlite::ErrorCode::DatabaseLocked
        {
            return StoreError::Busy;
        }
    }
    StoreError::Backend(err.to_string())
}

fn parse_column<T: FromStr<Err = String>>(raw: &str) -> Result<T, StoreError> {
    raw.parse()
        .map_err(|err: String| StoreError::Backend(err))
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}

fn tokens_to_i64(tokens: u64) -> i64 {
    if tokens > i64::MAX as u64 {
        i64::MAX
    } else {
        tokens as i64
    }
}

fn i64_to_u64(value: i64) -> u64 {
    if value <= 0 { 0 } else { value as u64 }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::new(dir.path().join("billing.sqlite"));
        store.init().await.expect("init");
        (dir, store)
    }

    fn debit_request(org_id: &str, tokens: u64) -> DebitRequest {
        DebitRequest {
            organization_id: org_id.to_string(),
            actor_user_id: Some("user-1".into()),
            billed_tokens: tokens,
            reason: "ai usage".into(),
            ref_entity_type: None,
            ref_entity_id: None,
            metadata: LedgerMetadata::DebitV1 {
                source_type: SourceType::Platform,
                provider: Some("openai".into()),
                model: Some("gpt-4o-mini".into()),
                raw_tokens: tokens,
                multiplier: 1.0,
                margin_usd_micros: 0,
            },
        }
    }

    #[tokio::test]
    async fn provision_writes_initial_grant_to_ledger() {
        let (_dir, store) = open_store().await;
        let org = store
            .provision_organization("org-1", OrganizationType::Trial, 500)
            .await
            .expect("provision");
        assert_eq!(org.balance, 500);
        assert_eq!(org.billing_status, BillingStatus::Trial);

        let summary = store.ledger_summary("org-1").await.expect("summary");
        assert_eq!(summary.total_credits, 500);
        assert_eq!(summary.total_debits, 0);
        assert_eq!(summary.computed_balance, 500);
        assert_eq!(summary.transaction_count, 1);
    }

    #[tokio::test]
    async fn trial_debit_hard_stops_at_balance() {
        let (_dir, store) = open_store().await;
        store
            .provision_organization("org-1", OrganizationType::Trial, 100)
            .await
            .expect("provision");

        let err = store.debit(&debit_request("org-1", 150)).await;
        assert!(matches!(
            err,
            Err(StoreError::InsufficientBalance {
                balance: 100,
                requested: 150
            })
        ));

        // The denied attempt left no trace.
        let org = store.get_organization("org-1").await.expect("org");
        assert_eq!(org.balance, 100);
        let summary = store.ledger_summary("org-1").await.expect("summary");
        assert_eq!(summary.total_debits, 0);
    }

    #[tokio::test]
    async fn debit_of_missing_org_is_not_found() {
        let (_dir, store) = open_store().await;
        let err = store.debit(&debit_request("org-ghost", 10)).await;
        assert!(matches!(err, Err(StoreError::NotFound)));
    }

    #[tokio::test]
    async fn paygo_transition_fires_once() {
        let (_dir, store) = open_store().await;
        store
            .provision_organization("org-1", OrganizationType::Paid, 100)
            .await
            .expect("provision");

        let outcome = store
            .debit(&debit_request("org-1", 150))
            .await
            .expect("debit");
        assert_eq!(outcome.balance_after, -50);
        assert!(outcome.paygo_triggered);

        let org = store.get_organization("org-1").await.expect("org");
        assert_eq!(org.billing_status, BillingStatus::PaygoPending);

        let outcome = store
            .debit(&debit_request("org-1", 10))
            .await
            .expect("second debit");
        assert_eq!(outcome.balance_after, -60);
        assert!(!outcome.paygo_triggered);

        let entries = store.list_ledger("org-1", 50, 0).await.expect("ledger");
        let markers = entries
            .iter()
            .filter(|entry| entry.reason == "PAYGO_TRIGGERED")
            .collect::<Vec<_>>();
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].actor_type, ActorType::System);
        assert_eq!(markers[0].amount, 0);
        assert_eq!(
            markers[0].metadata,
            LedgerMetadata::PaygoTriggerV1 { balance_after: -50 }
        );
    }

    #[tokio::test]
    async fn ledger_is_ordered_by_recency_and_paginates() {
        let (_dir, store) = open_store().await;
        store
            .provision_organization("org-1", OrganizationType::Paid, 1_000)
            .await
            .expect("provision");
        for tokens in [10, 20, 30] {
            store
                .debit(&debit_request("org-1", tokens))
                .await
                .expect("debit");
        }

        let entries = store.list_ledger("org-1", 2, 0).await.expect("page 1");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].amount, 30);
        assert_eq!(entries[1].amount, 20);

        let entries = store.list_ledger("org-1", 2, 2).await.expect("page 2");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].amount, 10);
        assert_eq!(entries[1].entry_type, EntryType::Credit);
    }

    #[tokio::test]
    async fn margin_upsert_round_trips() {
        let (_dir, store) = open_store().await;
        assert!(
            store
                .get_margin(SourceType::Platform)
                .await
                .expect("get")
                .is_none()
        );

        let margin = Margin {
            source_type: SourceType::Platform,
            base_cost_per_1k_usd_micros: 30_000,
            margin_percent: 30.0,
            min_charge_usd_micros: 10_000,
            is_active: true,
        };
        store.put_margin(&margin).await.expect("put");

        let loaded = store
            .get_margin(SourceType::Platform)
            .await
            .expect("get")
            .expect("row");
        assert_eq!(loaded.base_cost_per_1k_usd_micros, 30_000);
        assert_eq!(loaded.margin_percent, 30.0);

        store
            .put_margin(&Margin {
                is_active: false,
                ..margin
            })
            .await
            .expect("replace");
        let loaded = store
            .get_margin(SourceType::Platform)
            .await
            .expect("get")
            .expect("row");
        assert!(!loaded.is_active);
    }

    #[tokio::test]
    async fn status_transition_is_guarded() {
        let (_dir, store) = open_store().await;
        store
            .provision_organization("org-1", OrganizationType::Trial, 0)
            .await
            .expect("provision");

        store
            .transition_billing_status("org-1", BillingStatus::Trial, BillingStatus::Active)
            .await
            .expect("upgrade");

        let err = store
            .transition_billing_status("org-1", BillingStatus::Trial, BillingStatus::Active)
            .await;
        assert!(matches!(err, Err(StoreError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn user_usage_spends_bonus_before_purchased() {
        let (_dir, store) = open_store().await;
        store
            .credit_user_tokens("user-1", 1_000, false)
            .await
            .expect("purchase");
        store
            .credit_user_tokens("user-1", 200, true)
            .await
            .expect("bonus");

        let balance = store
            .apply_user_usage("user-1", SourceType::Platform, 300)
            .await
            .expect("usage");
        assert_eq!(balance.platform_tokens_bonus, 0);
        assert_eq!(balance.platform_tokens, 900);
        assert_eq!(balance.lifetime_purchased, 1_000);
        assert_eq!(balance.lifetime_used, 300);

        let balance = store
            .apply_user_usage("user-1", SourceType::Byok, 50)
            .await
            .expect("byok usage");
        assert_eq!(balance.byok_usage_tokens, 50);
        assert_eq!(balance.platform_tokens, 900);
        assert_eq!(balance.lifetime_used, 350);
    }
}
