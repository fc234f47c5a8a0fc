// ✂️ Split Detector - Propose multi-category splits for big-basket
// and restaurant entries
// Parts always sum to the entry amount to the cent; any rounding or
// tax/shipping remainder is absorbed by the main part.

use crate::config::{EngineConfig, SplitConfig};
use crate::model::{LedgerEntry, SourceRecord, SplitPart, SplitProposal};
use crate::profiles::MerchantType;

/// Category applied when an itemized group has no declared category,
/// and for single-part manual-split placeholders.
const UNCATEGORIZED: &str = "Uncategorized";

/// Outcome of running the detector over one entry.
#[derive(Debug, Clone, PartialEq)]
pub enum SplitOutcome {
    /// A proposal satisfying the exact-sum invariant
    Proposal(SplitProposal),

    /// Entry is not a split trigger (wrong merchant type or under
    /// the type's threshold)
    NotTriggered,

    /// Defensive path: a constructed proposal failed the sum check
    /// and was discarded; the entry falls back to plain suggestion
    InvariantViolation { detail: String },
}

pub struct SplitDetector {
    config: SplitConfig,
}

impl SplitDetector {
    pub fn new(config: SplitConfig) -> Self {
        SplitDetector { config }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        SplitDetector {
            config: config.split.clone(),
        }
    }

    /// Run detection for one entry. `merchant_type` is the resolved
    /// type (learned profile first, keyword table second);
    /// `matched_source` supplies itemization when the entry matched a
    /// source record this run.
    pub fn detect(
        &self,
        entry: &LedgerEntry,
        merchant_type: Option<MerchantType>,
        matched_source: Option<&SourceRecord>,
    ) -> SplitOutcome {
        let abs_amount = entry.abs_amount_cents();
        if abs_amount == 0 {
            return SplitOutcome::NotTriggered;
        }

        let outcome = match merchant_type {
            Some(MerchantType::Restaurant) if self.config.restaurant_tip_split => {
                self.tip_split(entry, abs_amount)
            }
            Some(MerchantType::OnlineRetail)
                if abs_amount > self.config.online_retail_threshold_cents =>
            {
                self.itemized_split(entry, abs_amount, matched_source, "online_retail")
            }
            Some(MerchantType::WarehouseClub)
                if abs_amount > self.config.warehouse_threshold_cents =>
            {
                self.itemized_split(entry, abs_amount, matched_source, "warehouse_club")
            }
            _ => return SplitOutcome::NotTriggered,
        };

        // The constructions above absorb remainders, so this check
        // should never fire; a proposal that fails it is discarded
        // rather than emitted.
        if let SplitOutcome::Proposal(proposal) = &outcome {
            if !proposal.sums_to(entry.amount_cents) {
                return SplitOutcome::InvariantViolation {
                    detail: format!(
                        "parts sum {} != entry amount {}",
                        proposal.parts_total_cents(),
                        entry.amount_cents
                    ),
                };
            }
        }
        outcome
    }

    /// Restaurant: back out the tip from the total.
    /// tip = round(amount * p / (1 + p)); the rounding remainder lands
    /// in the Dining part via subtraction.
    fn tip_split(&self, entry: &LedgerEntry, abs_amount: i64) -> SplitOutcome {
        let p = self.config.tip_percentage;
        if p <= 0.0 {
            return SplitOutcome::NotTriggered;
        }

        let tip = ((abs_amount as f64) * p / (1.0 + p)).round() as i64;
        if tip == 0 {
            return SplitOutcome::NotTriggered;
        }
        let subtotal = abs_amount - tip;
        let sign = if entry.amount_cents < 0 { -1 } else { 1 };

        SplitOutcome::Proposal(SplitProposal {
            ledger_id: entry.id.clone(),
            parts: vec![
                SplitPart {
                    category_id: "Dining".to_string(),
                    amount_cents: sign * subtotal,
                    rationale: format!("subtotal assuming {:.0}% tip", p * 100.0),
                },
                SplitPart {
                    category_id: "Tips".to_string(),
                    amount_cents: sign * tip,
                    rationale: format!("{:.0}% tip backed out of total", p * 100.0),
                },
            ],
            trigger_reason: "restaurant tip split".to_string(),
            needs_manual_split: false,
        })
    }

    /// Online retail / warehouse: group itemized lines by declared
    /// category. Tax and shipping never appear as items, so the gap
    /// between the item sum and the entry amount is absorbed by the
    /// last group.
    fn itemized_split(
        &self,
        entry: &LedgerEntry,
        abs_amount: i64,
        matched_source: Option<&SourceRecord>,
        trigger: &str,
    ) -> SplitOutcome {
        let sign = if entry.amount_cents < 0 { -1 } else { 1 };
        let trigger_reason = format!("{trigger} over threshold");

        let source = match matched_source {
            Some(source) if source.has_items() => source,
            _ => {
                return SplitOutcome::Proposal(SplitProposal {
                    ledger_id: entry.id.clone(),
                    parts: vec![SplitPart {
                        category_id: UNCATEGORIZED.to_string(),
                        amount_cents: entry.amount_cents,
                        rationale: "no itemized source available".to_string(),
                    }],
                    trigger_reason,
                    needs_manual_split: true,
                });
            }
        };

        // first-seen order keeps the grouping deterministic for a
        // given source record
        let mut groups: Vec<(String, i64)> = Vec::new();
        for item in &source.items {
            let category = item
                .category
                .clone()
                .unwrap_or_else(|| UNCATEGORIZED.to_string());
            match groups.iter_mut().find(|(c, _)| *c == category) {
                Some((_, total)) => *total += item.subtotal_cents(),
                None => groups.push((category, item.subtotal_cents())),
            }
        }

        let items_total: i64 = groups.iter().map(|(_, total)| total).sum();
        let remainder = abs_amount - items_total;

        let last = groups.len() - 1;
        let parts: Vec<SplitPart> = groups
            .into_iter()
            .enumerate()
            .map(|(i, (category, total))| {
                let (amount, rationale) = if i == last && remainder != 0 {
                    (
                        total + remainder,
                        format!(
                            "{} itemized, absorbs {}c tax/shipping remainder",
                            category, remainder
                        ),
                    )
                } else {
                    (total, format!("{category} itemized from order"))
                };
                SplitPart {
                    category_id: category,
                    amount_cents: sign * amount,
                    rationale,
                }
            })
            .collect();

        SplitOutcome::Proposal(SplitProposal {
            ledger_id: entry.id.clone(),
            parts,
            trigger_reason,
            needs_manual_split: false,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LineItem, SourceKind};
    use chrono::NaiveDate;

    fn detector() -> SplitDetector {
        SplitDetector::new(SplitConfig::default())
    }

    fn create_test_entry(id: &str, amount_cents: i64) -> LedgerEntry {
        LedgerEntry {
            id: id.to_string(),
            date: NaiveDate::from_ymd_opt(2025, 11, 26).unwrap(),
            amount_cents,
            payee_name: "Test Payee".to_string(),
            memo: String::new(),
            account_id: "acct-card".to_string(),
            category_id: None,
            cleared: false,
        }
    }

    fn create_itemized_source(items: Vec<LineItem>, amount_cents: i64) -> SourceRecord {
        SourceRecord {
            id: "src-1".to_string(),
            order_ref: "111-222".to_string(),
            date: NaiveDate::from_ymd_opt(2025, 11, 26).unwrap(),
            amount_cents,
            merchant: "Amazon".to_string(),
            items,
            source_kind: SourceKind::DownloadFolder,
            content_hash: String::new(),
        }
    }

    fn item(name: &str, qty: u32, unit_price_cents: i64, category: Option<&str>) -> LineItem {
        LineItem {
            name: name.to_string(),
            qty,
            unit_price_cents,
            category: category.map(str::to_string),
        }
    }

    #[test]
    fn test_restaurant_tip_split_47_20() {
        // $47.20 at 18%: tip = round(4720 * 0.18 / 1.18) = 720,
        // subtotal = 4000; parts sum exactly to 4720.
        let entry = create_test_entry("led-1", 4720);
        let outcome = detector().detect(&entry, Some(MerchantType::Restaurant), None);

        let SplitOutcome::Proposal(proposal) = outcome else {
            panic!("expected a proposal");
        };
        assert_eq!(proposal.parts.len(), 2);
        assert_eq!(proposal.parts[0].category_id, "Dining");
        assert_eq!(proposal.parts[0].amount_cents, 4000);
        assert_eq!(proposal.parts[1].category_id, "Tips");
        assert_eq!(proposal.parts[1].amount_cents, 720);
        assert!(proposal.sums_to(4720));
        assert!(!proposal.needs_manual_split);
    }

    #[test]
    fn test_restaurant_split_preserves_sign_of_outflows() {
        let entry = create_test_entry("led-1", -4720);
        let outcome = detector().detect(&entry, Some(MerchantType::Restaurant), None);

        let SplitOutcome::Proposal(proposal) = outcome else {
            panic!("expected a proposal");
        };
        assert_eq!(proposal.parts[0].amount_cents, -4000);
        assert_eq!(proposal.parts[1].amount_cents, -720);
        assert!(proposal.sums_to(-4720));
    }

    #[test]
    fn test_itemized_split_groups_by_category_and_absorbs_remainder() {
        // items: 2x pantry 1200 + electronics 4500 = 6900, entry 7420
        // -> 520c of tax/shipping lands in the last group
        let entry = create_test_entry("led-1", 7420);
        let source = create_itemized_source(
            vec![
                item("Coffee beans", 2, 600, Some("Groceries")),
                item("USB hub", 1, 4500, Some("Electronics")),
            ],
            7420,
        );

        let outcome = detector().detect(&entry, Some(MerchantType::OnlineRetail), Some(&source));
        let SplitOutcome::Proposal(proposal) = outcome else {
            panic!("expected a proposal");
        };

        assert_eq!(proposal.parts.len(), 2);
        assert_eq!(proposal.parts[0].category_id, "Groceries");
        assert_eq!(proposal.parts[0].amount_cents, 1200);
        assert_eq!(proposal.parts[1].category_id, "Electronics");
        assert_eq!(proposal.parts[1].amount_cents, 4500 + 520);
        assert!(proposal.sums_to(7420));
    }

    #[test]
    fn test_missing_items_flags_manual_split() {
        let entry = create_test_entry("led-1", 15000);
        let outcome = detector().detect(&entry, Some(MerchantType::WarehouseClub), None);

        let SplitOutcome::Proposal(proposal) = outcome else {
            panic!("expected a proposal");
        };
        assert!(proposal.needs_manual_split);
        assert_eq!(proposal.parts.len(), 1);
        assert_eq!(proposal.parts[0].rationale, "no itemized source available");
        assert!(proposal.sums_to(15000));
    }

    #[test]
    fn test_thresholds_gate_triggering() {
        let det = detector();

        // exactly at the online-retail threshold: not exceeded
        let entry = create_test_entry("led-1", 5000);
        assert_eq!(
            det.detect(&entry, Some(MerchantType::OnlineRetail), None),
            SplitOutcome::NotTriggered
        );

        // one cent over
        let entry = create_test_entry("led-2", 5001);
        assert!(matches!(
            det.detect(&entry, Some(MerchantType::OnlineRetail), None),
            SplitOutcome::Proposal(_)
        ));

        // warehouse threshold is higher
        let entry = create_test_entry("led-3", 9000);
        assert_eq!(
            det.detect(&entry, Some(MerchantType::WarehouseClub), None),
            SplitOutcome::NotTriggered
        );
    }

    #[test]
    fn test_non_trigger_merchant_types() {
        let det = detector();
        let entry = create_test_entry("led-1", 25000);

        assert_eq!(
            det.detect(&entry, Some(MerchantType::GasStation), None),
            SplitOutcome::NotTriggered
        );
        assert_eq!(det.detect(&entry, None, None), SplitOutcome::NotTriggered);
    }

    #[test]
    fn test_disabled_tip_split() {
        let config = SplitConfig {
            restaurant_tip_split: false,
            ..SplitConfig::default()
        };
        let entry = create_test_entry("led-1", 4720);
        assert_eq!(
            SplitDetector::new(config).detect(&entry, Some(MerchantType::Restaurant), None),
            SplitOutcome::NotTriggered
        );
    }

    #[test]
    fn test_uncategorized_items_group_together() {
        let entry = create_test_entry("led-1", 6000);
        let source = create_itemized_source(
            vec![
                item("Mystery item A", 1, 2000, None),
                item("Mystery item B", 1, 4000, None),
            ],
            6000,
        );

        let outcome = detector().detect(&entry, Some(MerchantType::OnlineRetail), Some(&source));
        let SplitOutcome::Proposal(proposal) = outcome else {
            panic!("expected a proposal");
        };
        assert_eq!(proposal.parts.len(), 1);
        assert_eq!(proposal.parts[0].category_id, UNCATEGORIZED);
        assert!(proposal.sums_to(6000));
    }
}
