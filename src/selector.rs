// ⚖️ Match Selector - Greedy 1:1 assignment over scored candidates
// Greedy, not globally optimal: the highest-scoring candidate always
// wins its pair, which keeps every assignment explainable from its
// own score breakdown.

use std::collections::HashSet;

use tracing::debug;

use crate::config::EngineConfig;
use crate::error::{RunIssue, StateStoreError};
use crate::model::{ConfidenceTier, LedgerEntry, MatchCandidate, MatchResult, SourceRecord};
use crate::scorer::MatchScorer;
use crate::state::ReconciliationStateStore;

pub struct MatchSelector {
    pub date_tolerance_days: i64,
    pub amount_tolerance_cents: i64,
    pub match_threshold: u8,
}

impl MatchSelector {
    pub fn from_config(config: &EngineConfig) -> Self {
        MatchSelector {
            date_tolerance_days: config.date_tolerance_days,
            amount_tolerance_cents: config.amount_tolerance_cents,
            match_threshold: config.match_threshold,
        }
    }

    /// Score the cross product of entries and sources, admitting only
    /// pairs inside the date/amount tolerance windows and excluding
    /// ids already present in the state store (unless `force`, used
    /// for backfills).
    ///
    /// Malformed records are skipped and reported, never fatal.
    pub fn build_candidates(
        &self,
        scorer: &MatchScorer,
        entries: &[LedgerEntry],
        sources: &[SourceRecord],
        state: &dyn ReconciliationStateStore,
        force: bool,
    ) -> Result<(Vec<MatchCandidate>, Vec<RunIssue>), StateStoreError> {
        let mut issues = Vec::new();

        let mut usable_sources = Vec::new();
        for source in sources {
            if source.id.is_empty() || source.amount_cents <= 0 {
                issues.push(RunIssue::ScoringInput {
                    record_id: source.id.clone(),
                    detail: format!(
                        "source record rejected (order_ref={}, amount_cents={})",
                        source.order_ref, source.amount_cents
                    ),
                });
                continue;
            }
            if !force && state.has_matched(&source.id)? {
                continue;
            }
            usable_sources.push(source);
        }

        let mut usable_entries = Vec::new();
        for entry in entries {
            if entry.id.is_empty() {
                issues.push(RunIssue::ScoringInput {
                    record_id: entry.id.clone(),
                    detail: format!("ledger entry rejected (payee={})", entry.payee_name),
                });
                continue;
            }
            if !force && state.is_ledger_matched(&entry.id)? {
                continue;
            }
            usable_entries.push(entry);
        }

        let mut candidates = Vec::new();
        for entry in &usable_entries {
            for source in &usable_sources {
                let date_delta = (entry.date - source.date).num_days().abs();
                if date_delta > self.date_tolerance_days {
                    continue;
                }
                let amount_delta = (entry.abs_amount_cents() - source.amount_cents.abs()).abs();
                if amount_delta > self.amount_tolerance_cents {
                    continue;
                }

                let breakdown = scorer.score(entry, source);
                candidates.push(MatchCandidate {
                    source_id: source.id.clone(),
                    ledger_id: entry.id.clone(),
                    score: breakdown.total,
                    breakdown,
                    date_delta_days: date_delta,
                    amount_delta_cents: amount_delta,
                });
            }
        }

        Ok((candidates, issues))
    }

    /// Process candidates best-first, claiming each side at most once.
    /// Ties break by smaller date delta, then smaller amount delta,
    /// then smaller ledger id, then smaller source id - fully
    /// deterministic regardless of input order.
    ///
    /// Every selection writes one reconciliation record; the writes
    /// happen in this single call, which is the run's single-writer
    /// section.
    pub fn select(
        &self,
        mut candidates: Vec<MatchCandidate>,
        state: &dyn ReconciliationStateStore,
    ) -> Result<Vec<MatchResult>, StateStoreError> {
        candidates.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then_with(|| a.date_delta_days.cmp(&b.date_delta_days))
                .then_with(|| a.amount_delta_cents.cmp(&b.amount_delta_cents))
                .then_with(|| a.ledger_id.cmp(&b.ledger_id))
                .then_with(|| a.source_id.cmp(&b.source_id))
        });

        let mut claimed_sources: HashSet<&str> = HashSet::new();
        let mut claimed_ledgers: HashSet<&str> = HashSet::new();
        let mut matches = Vec::new();

        for candidate in &candidates {
            if candidate.score < self.match_threshold {
                // sorted descending: nothing below threshold follows
                break;
            }
            if claimed_sources.contains(candidate.source_id.as_str())
                || claimed_ledgers.contains(candidate.ledger_id.as_str())
            {
                continue;
            }

            state.record_match(&candidate.source_id, &candidate.ledger_id, candidate.score)?;
            claimed_sources.insert(candidate.source_id.as_str());
            claimed_ledgers.insert(candidate.ledger_id.as_str());

            debug!(
                target: "ledger_recon::selector",
                source_id = %candidate.source_id,
                ledger_id = %candidate.ledger_id,
                score = candidate.score,
                "selected match"
            );

            matches.push(MatchResult {
                source_id: candidate.source_id.clone(),
                ledger_id: candidate.ledger_id.clone(),
                score: candidate.score,
                tier: ConfidenceTier::from_score(candidate.score),
                breakdown: candidate.breakdown,
            });
        }

        Ok(matches)
    }
}

// ============================================================================
// TESTS
// ============================================================================
