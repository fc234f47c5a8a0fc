// 📦 Core Data Model - Purchase records, ledger entries, match results
// All money is integer cents; all record ids are opaque strings.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ============================================================================
// SOURCE RECORDS (upstream purchases)
// ============================================================================

/// Which upstream channel produced a purchase record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Order exports dropped into a watched folder
    DownloadFolder,

    /// Order confirmations pulled from a message inbox
    Inbox,

    /// Hand-curated CSV import
    ManualImport,

    /// Headless automation against a retailer account
    RemoteAutomation,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::DownloadFolder => "download_folder",
            SourceKind::Inbox => "inbox",
            SourceKind::ManualImport => "manual_import",
            SourceKind::RemoteAutomation => "remote_automation",
        }
    }
}

/// One purchased item inside a source record, when the upstream
/// channel exposes an itemized breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub name: String,
    pub qty: u32,
    pub unit_price_cents: i64,
    /// Category declared by the upstream source, if any
    pub category: Option<String>,
}

impl LineItem {
    pub fn subtotal_cents(&self) -> i64 {
        self.unit_price_cents * self.qty as i64
    }
}

/// A candidate purchase observed from an upstream provider.
/// Immutable once created; retained for an audit window then pruned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRecord {
    pub id: String,
    pub order_ref: String,
    pub date: NaiveDate,
    pub amount_cents: i64,
    pub merchant: String,
    #[serde(default)]
    pub items: Vec<LineItem>,
    pub source_kind: SourceKind,
    #[serde(default)]
    pub content_hash: String,
}

impl SourceRecord {
    /// Compute the content hash used for cross-provider deduplication.
    /// NOTE: this is for DEDUPLICATION, not identity - `id` is identity.
    pub fn compute_content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!(
            "{}{}{}{}",
            self.order_ref, self.date, self.amount_cents, self.merchant
        ));
        format!("{:x}", hasher.finalize())
    }

    /// Fill in `content_hash` if the provider left it empty.
    pub fn ensure_content_hash(&mut self) {
        if self.content_hash.is_empty() {
            self.content_hash = self.compute_content_hash();
        }
    }

    pub fn has_items(&self) -> bool {
        !self.items.is_empty()
    }
}

// ============================================================================
// LEDGER ENTRIES (unreconciled transactions in the target ledger)
// ============================================================================

/// An unreconciled transaction fetched fresh from the external ledger
/// each run. Never mutated locally; changes go through
/// `LedgerProvider::apply_update`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: String,
    pub date: NaiveDate,
    pub amount_cents: i64,
    pub payee_name: String,
    #[serde(default)]
    pub memo: String,
    pub account_id: String,
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub cleared: bool,
}

impl LedgerEntry {
    pub fn is_categorized(&self) -> bool {
        self.category_id.is_some()
    }

    /// Absolute amount - ledger outflows are negative, source amounts
    /// positive, so all comparisons happen on magnitudes.
    pub fn abs_amount_cents(&self) -> i64 {
        self.amount_cents.abs()
    }
}

// ============================================================================
// SCORING OUTPUT
// ============================================================================

/// Per-term breakdown of a candidate pair score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub amount_points: u8,
    pub date_points: u8,
    pub exact_amount_bonus: u8,
    pub same_day_bonus: u8,
    pub account_type_bonus: u8,
    /// Sum of all terms, clamped to 100
    pub total: u8,
}

/// Bucketed interpretation of a score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfidenceTier {
    High,
    Medium,
    Low,
}

impl ConfidenceTier {
    pub fn from_score(score: u8) -> Self {
        if score >= 90 {
            ConfidenceTier::High
        } else if score >= 70 {
            ConfidenceTier::Medium
        } else {
            ConfidenceTier::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfidenceTier::High => "high",
            ConfidenceTier::Medium => "medium",
            ConfidenceTier::Low => "low",
        }
    }
}

/// Ephemeral scored pairing of one source record and one ledger entry.
/// Computed per run, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub source_id: String,
    pub ledger_id: String,
    pub score: u8,
    pub breakdown: ScoreBreakdown,
    pub date_delta_days: i64,
    pub amount_delta_cents: i64,
}

/// A confirmed assignment emitted by the selector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchResult {
    pub source_id: String,
    pub ledger_id: String,
    pub score: u8,
    pub tier: ConfidenceTier,
    pub breakdown: ScoreBreakdown,
}

// ============================================================================
// PERSISTED RECONCILIATION STATE
// ============================================================================

/// Persisted record of a matched (source, ledger) pair.
///
/// Invariant: across all live records, source ids are distinct and
/// ledger ids are distinct - strict 1:1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationRecord {
    pub source_id: String,
    pub ledger_id: String,
    pub matched_at: DateTime<Utc>,
    pub score: u8,
}

/// Stable storage key for a source id. Stores index on this hash so
/// raw provider ids never become a schema commitment.
pub fn source_key(source_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_id.as_bytes());
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// SUGGESTION & SPLIT OUTPUT
// ============================================================================

/// Ranked category suggestion for one unmatched ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategorySuggestion {
    pub ledger_id: String,
    pub category_id: String,
    /// 0-100
    pub confidence: u8,
    pub rationale: String,
    /// 1-based position after merging and sorting
    pub rank: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitPart {
    pub category_id: String,
    pub amount_cents: i64,
    pub rationale: String,
}

/// Proposed decomposition of one ledger entry into category-tagged
/// parts summing exactly to the entry amount.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitProposal {
    pub ledger_id: String,
    pub parts: Vec<SplitPart>,
    pub trigger_reason: String,
    #[serde(default)]
    pub needs_manual_split: bool,
}

impl SplitProposal {
    pub fn parts_total_cents(&self) -> i64 {
        self.parts.iter().map(|p| p.amount_cents).sum()
    }

    /// The exact-sum invariant: parts must reconstruct the entry
    /// amount to the cent.
    pub fn sums_to(&self, amount_cents: i64) -> bool {
        self.parts_total_cents() == amount_cents
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_record(order_ref: &str, amount: i64, merchant: &str) -> SourceRecord {
        SourceRecord {
            id: format!("src-{order_ref}"),
            order_ref: order_ref.to_string(),
            date: NaiveDate::from_ymd_opt(2025, 11, 26).unwrap(),
            amount_cents: amount,
            merchant: merchant.to_string(),
            items: Vec::new(),
            source_kind: SourceKind::DownloadFolder,
            content_hash: String::new(),
        }
    }

    #[test]
    fn test_content_hash_is_stable() {
        let a = create_test_record("111-222", 4500, "Amazon");
        let b = create_test_record("111-222", 4500, "Amazon");
        assert_eq!(a.compute_content_hash(), b.compute_content_hash());

        let c = create_test_record("111-223", 4500, "Amazon");
        assert_ne!(a.compute_content_hash(), c.compute_content_hash());
    }

    #[test]
    fn test_ensure_content_hash_fills_once() {
        let mut record = create_test_record("111-222", 4500, "Amazon");
        record.ensure_content_hash();
        let first = record.content_hash.clone();
        assert!(!first.is_empty());

        record.ensure_content_hash();
        assert_eq!(record.content_hash, first);
    }

    #[test]
    fn test_confidence_tiers() {
        assert_eq!(ConfidenceTier::from_score(100), ConfidenceTier::High);
        assert_eq!(ConfidenceTier::from_score(90), ConfidenceTier::High);
        assert_eq!(ConfidenceTier::from_score(89), ConfidenceTier::Medium);
        assert_eq!(ConfidenceTier::from_score(70), ConfidenceTier::Medium);
        assert_eq!(ConfidenceTier::from_score(69), ConfidenceTier::Low);
        assert_eq!(ConfidenceTier::from_score(0), ConfidenceTier::Low);
    }

    #[test]
    fn test_source_key_differs_from_raw_id() {
        let key = source_key("amzn-111-222");
        assert_eq!(key.len(), 64);
        assert_ne!(key, "amzn-111-222");
        assert_eq!(key, source_key("amzn-111-222"));
    }

    #[test]
    fn test_line_item_subtotal() {
        let item = LineItem {
            name: "USB cable".to_string(),
            qty: 3,
            unit_price_cents: 799,
            category: Some("Electronics".to_string()),
        };
        assert_eq!(item.subtotal_cents(), 2397);
    }

    #[test]
    fn test_split_sum_invariant_helper() {
        let proposal = SplitProposal {
            ledger_id: "led-1".to_string(),
            parts: vec![
                SplitPart {
                    category_id: "Dining".to_string(),
                    amount_cents: 4000,
                    rationale: "subtotal".to_string(),
                },
                SplitPart {
                    category_id: "Tips".to_string(),
                    amount_cents: 720,
                    rationale: "tip".to_string(),
                },
            ],
            trigger_reason: "restaurant".to_string(),
            needs_manual_split: false,
        };

        assert!(proposal.sums_to(4720));
        assert!(!proposal.sums_to(4721));
    }
}
