use serde::{Deserialize, Serialize};

/// Where the consumed tokens came from. Pricing differs per source: platform
/// tokens are billed against pooled capacity, BYOK and local usage against a
/// reference valuation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Platform,
    Byok,
    Local,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Platform => "platform",
            Self::Byok => "byok",
            Self::Local => "local",
        }
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "platform" => Ok(Self::Platform),
            "byok" => Ok(Self::Byok),
            "local" => Ok(Self::Local),
            _ => Err(format!("unknown source type: {s}")),
        }
    }
}

/// Billing lifecycle of an organization.
///
/// `Trial -> Active` on upgrade (external event), `Active -> PaygoPending`
/// when a debit takes the balance negative, `PaygoPending -> Active` on
/// settlement (external event). Trial tenants never reach `PaygoPending`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingStatus {
    Trial,
    Active,
    PaygoPending,
}

impl BillingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trial => "trial",
            Self::Active => "active",
            Self::PaygoPending => "paygo_pending",
        }
    }
}

impl std::fmt::Display for BillingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BillingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trial" => Ok(Self::Trial),
            "active" => Ok(Self::Active),
            "paygo_pending" => Ok(Self::PaygoPending),
            _ => Err(format!("unknown billing status: {s}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrganizationType {
    Trial,
    Paid,
}

impl OrganizationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trial => "trial",
            Self::Paid => "paid",
        }
    }
}

impl std::fmt::Display for OrganizationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OrganizationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trial" => Ok(Self::Trial),
            "paid" => Ok(Self::Paid),
            _ => Err(format!("unknown organization type: {s}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    User,
    System,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::System => "system",
        }
    }
}

impl std::str::FromStr for ActorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "system" => Ok(Self::System),
            _ => Err(format!("unknown actor type: {s}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    Credit,
    Debit,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Credit => "credit",
            Self::Debit => "debit",
        }
    }
}

impl std::str::FromStr for EntryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "credit" => Ok(Self::Credit),
            "debit" => Ok(Self::Debit),
            _ => Err(format!("unknown entry type: {s}")),
        }
    }
}

/// One row per tenant. The balance may go negative only for non-trial
/// organizations in `PaygoPending`. Mutated exclusively through the atomic
/// debit/credit operations of a [`crate::store::BillingStore`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrganizationBalance {
    pub organization_id: String,
    pub balance: i64,
    pub billing_status: BillingStatus,
    pub organization_type: OrganizationType,
    /// Lifecycle flag. Organizations are never deleted, only deactivated.
    pub is_active: bool,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

/// Legacy per-user tallies, kept independent of the organization balance.
/// Used when no organization-level billing context exists.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UserBalance {
    pub user_id: String,
    pub platform_tokens: u64,
    pub platform_tokens_bonus: u64,
    pub byok_usage_tokens: u64,
    pub local_usage_tokens: u64,
    pub lifetime_purchased: u64,
    pub lifetime_used: u64,
}

/// Pricing parameters for one source type. Money is USD micros.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Margin {
    pub source_type: SourceType,
    pub base_cost_per_1k_usd_micros: u64,
    pub margin_percent: f64,
    pub min_charge_usd_micros: u64,
    pub is_active: bool,
}

impl Margin {
    /// Zero-markup margin, substituted when no row is configured.
    pub fn zero(source_type: SourceType) -> Self {
        Self {
            source_type,
            base_cost_per_1k_usd_micros: 0,
            margin_percent: 0.0,
            min_charge_usd_micros: 0,
            is_active: true,
        }
    }
}

/// Partial update for a margin row. Unset fields are left untouched.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MarginUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_cost_per_1k_usd_micros: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub margin_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_charge_usd_micros: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
}

impl MarginUpdate {
    pub fn is_empty(&self) -> bool {
        self.base_cost_per_1k_usd_micros.is_none()
            && self.margin_percent.is_none()
            && self.min_charge_usd_micros.is_none()
            && self.is_active.is_none()
    }

    pub fn apply(&self, margin: &mut Margin) {
        if let Some(base) = self.base_cost_per_1k_usd_micros {
            margin.base_cost_per_1k_usd_micros = base;
        }
        if let Some(percent) = self.margin_percent {
            margin.margin_percent = percent;
        }
        if let Some(min_charge) = self.min_charge_usd_micros {
            margin.min_charge_usd_micros = min_charge;
        }
        if let Some(is_active) = self.is_active {
            margin.is_active = is_active;
        }
    }
}

/// Structured, versioned metadata attached to a ledger entry. The schema tag
/// is persisted with the payload so old rows stay decodable after the format
/// evolves.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "schema")]
pub enum LedgerMetadata {
    #[serde(rename = "debit.v1")]
    DebitV1 {
        source_type: SourceType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        raw_tokens: u64,
        multiplier: f64,
        margin_usd_micros: u64,
    },
    #[serde(rename = "credit.v1")]
    CreditV1 {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    #[serde(rename = "paygo_trigger.v1")]
    PaygoTriggerV1 { balance_after: i64 },
    #[serde(rename = "empty.v1")]
    #[default]
    Empty,
}

/// Immutable, append-only record of one balance-affecting event. Entries are
/// never updated or deleted after creation; no API for either exists.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub organization_id: String,
    pub actor_user_id: Option<String>,
    pub actor_type: ActorType,
    pub entry_type: EntryType,
    pub amount: u64,
    pub reason: String,
    pub ref_entity_type: Option<String>,
    pub ref_entity_id: Option<String>,
    pub metadata: LedgerMetadata,
    pub created_at_ms: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegacyTxnKind {
    Purchase,
    Usage,
}

impl LegacyTxnKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Purchase => "purchase",
            Self::Usage => "usage",
        }
    }
}

impl std::str::FromStr for LegacyTxnKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "purchase" => Ok(Self::Purchase),
            "usage" => Ok(Self::Usage),
            _ => Err(format!("unknown transaction kind: {s}")),
        }
    }
}

/// Human-readable secondary record of a purchase or usage event. Kept for
/// backward-compatible reporting; the ledger is authoritative.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LegacyTransaction {
    pub id: i64,
    pub organization_id: String,
    pub user_id: Option<String>,
    pub kind: LegacyTxnKind,
    pub tokens: u64,
    pub description: String,
    pub created_at_ms: u64,
}

/// Pagination window for ledger reads, newest entries first.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct LedgerPage {
    pub limit: u32,
    pub offset: u32,
}

impl Default for LedgerPage {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

/// Aggregate over the full ledger of one organization. `computed_balance`
/// must equal the live balance whenever no transaction is in flight; the
/// engine exposes it as a reconciliation oracle, not as the live balance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSummary {
    pub total_credits: u64,
    pub total_debits: u64,
    pub computed_balance: i64,
    pub transaction_count: u64,
}

/// Caller-facing result of a settled debit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DebitReceipt {
    pub transaction_id: i64,
    pub ledger_id: i64,
    pub tokens_billed: u64,
    pub balance_after: i64,
    pub paygo_triggered: bool,
}

/// Caller-facing result of a settled credit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreditReceipt {
    pub organization_id: String,
    pub ledger_id: i64,
    pub tokens: u64,
    pub balance_after: i64,
}

/// Parameters the AI invocation layer reports after a completed call.
#[derive(Clone, Debug)]
pub struct DebitParams {
    pub organization_id: String,
    pub user_id: Option<String>,
    pub raw_tokens: u64,
    pub billed_tokens: u64,
    pub source_type: SourceType,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub multiplier: f64,
    pub margin_usd_micros: u64,
    pub ref_entity_type: Option<String>,
    pub ref_entity_id: Option<String>,
}

impl DebitParams {
    pub fn new(
        organization_id: impl Into<String>,
        billed_tokens: u64,
        source_type: SourceType,
    ) -> Self {
        Self {
            organization_id: organization_id.into(),
            user_id: None,
            raw_tokens: billed_tokens,
            billed_tokens,
            source_type,
            provider: None,
            model: None,
            multiplier: 1.0,
            margin_usd_micros: 0,
            ref_entity_type: None,
            ref_entity_id: None,
        }
    }
}

/// Options for crediting an organization (purchase, promo, refund).
#[derive(Clone, Debug, Default)]
pub struct CreditOpts {
    pub user_id: Option<String>,
    pub reason: String,
    pub ref_entity_type: Option<String>,
    pub ref_entity_id: Option<String>,
    pub note: Option<String>,
}

impl CreditOpts {
    pub fn with_reason(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            ..Self::default()
        }
    }
}
