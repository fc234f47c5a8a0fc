// 🎯 Match Scorer - Score one (ledger entry, source record) pair
// Amount term (max 60) + date term (max 40) + bonuses, clamped to 100.

use std::collections::HashMap;

use crate::model::{LedgerEntry, ScoreBreakdown, SourceKind, SourceRecord};

// ============================================================================
// SCORING TERMS
// ============================================================================

/// Amount term: exact match of absolute amounts scores highest, then
/// two tolerance bands.
fn amount_points(delta_cents: i64) -> u8 {
    if delta_cents == 0 {
        60
    } else if delta_cents <= 25 {
        30
    } else if delta_cents <= 50 {
        15
    } else {
        0
    }
}

/// Date term: same calendar day scores highest, then one- and two-day
/// deltas.
fn date_points(delta_days: i64) -> u8 {
    match delta_days {
        0 => 40,
        1 => 20,
        2 => 10,
        _ => 0,
    }
}

// ============================================================================
// MATCH SCORER
// ============================================================================

/// Pure scoring function over candidate pairs.
///
/// Deterministic for identical inputs - no clocks, no randomness -
/// which is what makes the selection tests reproducible.
pub struct MatchScorer {
    /// Expected source kind per ledger account, for the +10 account
    /// type bonus (e.g. the Amazon card account expects
    /// `download_folder` order exports).
    pub account_expectations: HashMap<String, SourceKind>,
}

impl MatchScorer {
    pub fn new() -> Self {
        MatchScorer {
            account_expectations: HashMap::new(),
        }
    }

    pub fn with_expectations(account_expectations: HashMap<String, SourceKind>) -> Self {
        MatchScorer {
            account_expectations,
        }
    }

    /// Score a candidate pair and return the per-term breakdown.
    pub fn score(&self, entry: &LedgerEntry, source: &SourceRecord) -> ScoreBreakdown {
        let amount_delta = (entry.abs_amount_cents() - source.amount_cents.abs()).abs();
        let date_delta = (entry.date - source.date).num_days().abs();

        let amount = amount_points(amount_delta);
        let date = date_points(date_delta);

        let exact_amount_bonus = if amount_delta == 0 { 5 } else { 0 };
        let same_day_bonus = if date_delta == 0 { 5 } else { 0 };
        let account_type_bonus = match self.account_expectations.get(&entry.account_id) {
            Some(expected) if *expected == source.source_kind => 10,
            _ => 0,
        };

        let raw = amount as u16
            + date as u16
            + exact_amount_bonus as u16
            + same_day_bonus as u16
            + account_type_bonus as u16;

        ScoreBreakdown {
            amount_points: amount,
            date_points: date,
            exact_amount_bonus,
            same_day_bonus,
            account_type_bonus,
            total: raw.min(100) as u8,
        }
    }
}

impl Default for MatchScorer {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn create_test_entry(date: (i32, u32, u32), amount_cents: i64) -> LedgerEntry {
        LedgerEntry {
            id: "led-1".to_string(),
            date: NaiveDate::from_ymd_opt(date.0, date.1, date.2).unwrap(),
            amount_cents,
            payee_name: "Amazon".to_string(),
            memo: String::new(),
            account_id: "acct-card".to_string(),
            category_id: None,
            cleared: false,
        }
    }

    fn create_test_source(date: (i32, u32, u32), amount_cents: i64) -> SourceRecord {
        SourceRecord {
            id: "src-1".to_string(),
            order_ref: "111-222".to_string(),
            date: NaiveDate::from_ymd_opt(date.0, date.1, date.2).unwrap(),
            amount_cents,
            merchant: "Amazon".to_string(),
            items: Vec::new(),
            source_kind: SourceKind::DownloadFolder,
            content_hash: String::new(),
        }
    }

    #[test]
    fn test_exact_amount_same_day_scores_100() {
        // $45.00 on 2025-11-26 vs $45.00 on 2025-11-26
        let scorer = MatchScorer::new();
        let entry = create_test_entry((2025, 11, 26), -4500);
        let source = create_test_source((2025, 11, 26), 4500);

        let breakdown = scorer.score(&entry, &source);
        assert_eq!(breakdown.amount_points, 60);
        assert_eq!(breakdown.date_points, 40);
        assert_eq!(breakdown.exact_amount_bonus, 5);
        assert_eq!(breakdown.same_day_bonus, 5);
        assert_eq!(breakdown.total, 100); // clamped from 110
        assert_eq!(
            crate::model::ConfidenceTier::from_score(breakdown.total),
            crate::model::ConfidenceTier::High
        );
    }

    #[test]
    fn test_near_miss_scores_35() {
        // $45.30 on 2025-11-27 vs $45.00 on 2025-11-26:
        // amount within 50c -> 15, one day off -> 20, no bonuses
        let scorer = MatchScorer::new();
        let entry = create_test_entry((2025, 11, 27), -4530);
        let source = create_test_source((2025, 11, 26), 4500);

        let breakdown = scorer.score(&entry, &source);
        assert_eq!(breakdown.amount_points, 15);
        assert_eq!(breakdown.date_points, 20);
        assert_eq!(breakdown.exact_amount_bonus, 0);
        assert_eq!(breakdown.same_day_bonus, 0);
        assert_eq!(breakdown.total, 35);
    }

    #[test]
    fn test_amount_tolerance_bands() {
        let scorer = MatchScorer::new();
        let source = create_test_source((2025, 11, 26), 4500);

        let exact = scorer.score(&create_test_entry((2025, 11, 26), -4500), &source);
        assert_eq!(exact.amount_points, 60);

        let close = scorer.score(&create_test_entry((2025, 11, 26), -4525), &source);
        assert_eq!(close.amount_points, 30);

        let wide = scorer.score(&create_test_entry((2025, 11, 26), -4550), &source);
        assert_eq!(wide.amount_points, 15);

        let miss = scorer.score(&create_test_entry((2025, 11, 26), -4551), &source);
        assert_eq!(miss.amount_points, 0);
    }

    #[test]
    fn test_date_tolerance_bands() {
        let scorer = MatchScorer::new();
        let source = create_test_source((2025, 11, 26), 4500);

        for (day, expected) in [(26, 40), (27, 20), (28, 10), (29, 0)] {
            let entry = create_test_entry((2025, 11, day), -4500);
            assert_eq!(scorer.score(&entry, &source).date_points, expected);
        }

        // delta is symmetric: two days before scores the same as after
        let before = create_test_entry((2025, 11, 24), -4500);
        assert_eq!(scorer.score(&before, &source).date_points, 10);
    }

    #[test]
    fn test_account_type_bonus() {
        let mut expectations = HashMap::new();
        expectations.insert("acct-card".to_string(), SourceKind::DownloadFolder);
        let scorer = MatchScorer::with_expectations(expectations);

        // move the date off by 2 so the total stays under the clamp
        let entry = create_test_entry((2025, 11, 28), -4500);
        let source = create_test_source((2025, 11, 26), 4500);

        let breakdown = scorer.score(&entry, &source);
        assert_eq!(breakdown.account_type_bonus, 10);
        assert_eq!(breakdown.total, 60 + 10 + 5 + 10);

        let mut inbox_source = create_test_source((2025, 11, 26), 4500);
        inbox_source.source_kind = SourceKind::Inbox;
        assert_eq!(scorer.score(&entry, &inbox_source).account_type_bonus, 0);
    }

    #[test]
    fn test_scoring_is_deterministic() {
        let scorer = MatchScorer::new();
        let entry = create_test_entry((2025, 11, 26), -4530);
        let source = create_test_source((2025, 11, 27), 4500);

        let first = scorer.score(&entry, &source);
        for _ in 0..10 {
            assert_eq!(scorer.score(&entry, &source), first);
        }
    }
}
