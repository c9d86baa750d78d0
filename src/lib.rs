//! Token billing ledger for multi-tenant AI workloads.
//!
//! The crate meters AI token consumption per organization: a pre-flight
//! quota guard (fail closed, trial tenants hard-stopped), an atomic
//! transaction coordinator (balance mutation, legacy record, and immutable
//! ledger entry commit together or not at all), tiered margin computation,
//! and an edge-triggered pay-as-you-go transition for active tenants that
//! overdraft.
//!
//! State lives behind the [`BillingStore`] trait; [`SqliteStore`] is the
//! durable backend and [`MemoryStore`] a deterministic one for tests.

pub mod config;
pub mod costing;
mod engine;
mod error;
pub mod keyvault;
mod memory_store;
pub mod quota;
pub mod store;
mod sqlite_store;
pub mod types;

pub use config::{BillingConfig, ConfigError, DefaultMarginConfig};
pub use costing::Charge;
pub use engine::BillingEngine;
pub use error::{BillingError, StoreError};
pub use keyvault::{KeyVault, KeyVaultError};
pub use memory_store::MemoryStore;
pub use quota::{DenialReason, QuotaDecision};
pub use sqlite_store::SqliteStore;
pub use store::BillingStore;
pub use types::{
    ActorType, BillingStatus, CreditOpts, CreditReceipt, DebitParams, DebitReceipt, EntryType,
    LedgerEntry, LedgerMetadata, LedgerPage, LedgerSummary, LegacyTransaction, LegacyTxnKind,
    Margin, MarginUpdate, OrganizationBalance, OrganizationType, SourceType, UserBalance,
};
