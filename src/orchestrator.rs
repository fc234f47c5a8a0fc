// 🧭 Reconciliation Orchestrator - One batch pass end to end
// prune state → pull sources → pull ledger → score → select →
// learn profiles → suggest → split → apply updates → report.
//
// Selection and every state-store write happen inside one synchronous
// section of the run; only provider calls are async.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{ProviderError, RunAbort, RunIssue};
use crate::model::{
    CategorySuggestion, LedgerEntry, MatchResult, SourceRecord, SplitProposal,
};
use crate::profiles::{normalize_merchant_key, MerchantProfileStore, MerchantType};
use crate::providers::{LedgerProvider, LedgerUpdate, SourceProvider};
use crate::retry::{with_retry, RequestGate};
use crate::scorer::MatchScorer;
use crate::selector::MatchSelector;
use crate::split::{SplitDetector, SplitOutcome};
use crate::state::{MemoryStateStore, ReconciliationStateStore};
use crate::suggest::CategorySuggestionEngine;

// ============================================================================
// RUN OPTIONS & REPORT
// ============================================================================

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Source records older than this are not pulled
    pub since: NaiveDate,

    /// Restrict the ledger pull to one account
    pub account_filter: Option<String>,

    /// Compute everything, suppress external apply_update calls
    pub dry_run: bool,

    /// Bypass the state-store skip check (backfills)
    pub force: bool,
}

impl RunOptions {
    pub fn new(since: NaiveDate) -> Self {
        RunOptions {
            since,
            account_filter: None,
            dry_run: false,
            force: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub sources_pulled: usize,
    pub entries_pulled: usize,
    pub matched: usize,
    pub suggested: usize,
    pub split_proposed: usize,
    pub skipped_low_confidence: usize,
    pub errored: usize,
}

/// The single user-visible surface of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub force: bool,
    /// True when the state store was unreachable and the run degraded
    /// to stateless mode
    pub degraded_state: bool,
    pub matched: Vec<MatchResult>,
    pub suggestions: Vec<CategorySuggestion>,
    pub splits: Vec<SplitProposal>,
    pub errors: Vec<RunIssue>,
    pub counts: RunCounts,
}

impl RunReport {
    pub fn summary(&self) -> String {
        format!(
            "run {}: {} matched, {} suggested, {} splits, {} low-confidence, {} errors ({} entries / {} sources{}{})",
            self.run_id,
            self.counts.matched,
            self.counts.suggested,
            self.counts.split_proposed,
            self.counts.skipped_low_confidence,
            self.counts.errored,
            self.counts.entries_pulled,
            self.counts.sources_pulled,
            if self.dry_run { ", dry run" } else { "" },
            if self.degraded_state { ", degraded state" } else { "" },
        )
    }
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

pub struct Orchestrator {
    config: EngineConfig,
    scorer: MatchScorer,
    selector: MatchSelector,
    suggester: CategorySuggestionEngine,
    splitter: SplitDetector,
    sources: Vec<Box<dyn SourceProvider>>,
    ledger: Box<dyn LedgerProvider>,
    state: Box<dyn ReconciliationStateStore>,
    profiles: Box<dyn MerchantProfileStore>,
    gate: RequestGate,
}

impl Orchestrator {
    /// Wire the engine. `sources` are consulted in priority order;
    /// records appearing in more than one source are deduplicated by
    /// content hash, first provider wins.
    pub fn new(
        config: EngineConfig,
        sources: Vec<Box<dyn SourceProvider>>,
        ledger: Box<dyn LedgerProvider>,
        state: Box<dyn ReconciliationStateStore>,
        profiles: Box<dyn MerchantProfileStore>,
    ) -> anyhow::Result<Self> {
        let scorer = MatchScorer::with_expectations(config.account_expectations.clone());
        let selector = MatchSelector::from_config(&config);
        let suggester = CategorySuggestionEngine::from_config(&config)?;
        let splitter = SplitDetector::from_config(&config);
        let gate = RequestGate::new(
            config.provider_limits.max_concurrent_requests,
            Duration::from_millis(config.provider_limits.min_request_interval_ms),
        );

        Ok(Orchestrator {
            config,
            scorer,
            selector,
            suggester,
            splitter,
            sources,
            ledger,
            state,
            profiles,
            gate,
        })
    }

    /// Execute one batch pass.
    pub async fn run(&self, opts: &RunOptions) -> Result<RunReport, RunAbort> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(target: "ledger_recon::run", %run_id, dry_run = opts.dry_run, force = opts.force, "starting reconciliation run");

        let mut issues: Vec<RunIssue> = Vec::new();

        // State store probe: if it cannot be read, the run degrades to
        // a stateless pass instead of crashing.
        let fallback_state = MemoryStateStore::new();
        let (state, degraded_state): (&dyn ReconciliationStateStore, bool) =
            match self.state.pruned_view(self.config.retention_days) {
                Ok(_) => (self.state.as_ref(), false),
                Err(err) => {
                    warn!(target: "ledger_recon::run", %err, "state store unreachable, degrading to stateless run");
                    issues.push(RunIssue::StateStoreUnavailable {
                        detail: err.to_string(),
                    });
                    (&fallback_state, true)
                }
            };

        if !degraded_state {
            match state.prune(self.config.retention_days) {
                Ok(removed) if removed > 0 => {
                    info!(target: "ledger_recon::run", removed, "pruned expired reconciliation records");
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(target: "ledger_recon::run", %err, "prune failed, continuing");
                }
            }
        }

        // Pull sources in priority order; dedup across providers by
        // content hash, first provider wins.
        let sources = self.pull_sources(opts, &mut issues).await?;

        // Pull the ledger; a ledger we cannot read is fatal.
        let entries = self.pull_ledger(opts).await?;
        let total_entries = entries.len();

        // Score + select: the run's single-writer section. A state
        // failure mid-selection degrades the same way the probe does.
        let matched = match self.score_and_select(&entries, &sources, state, opts.force, &mut issues)
        {
            Ok(matched) => matched,
            Err(err) => {
                warn!(target: "ledger_recon::run", %err, "state store failed mid-selection, redoing selection statelessly");
                issues.push(RunIssue::StateStoreUnavailable {
                    detail: err.to_string(),
                });
                let stateless = MemoryStateStore::new();
                match self.score_and_select(&entries, &sources, &stateless, opts.force, &mut issues)
                {
                    Ok(matched) => matched,
                    Err(err) => {
                        warn!(target: "ledger_recon::run", %err, "stateless selection failed, emitting no matches");
                        Vec::new()
                    }
                }
            }
        };

        let sources_by_id: HashMap<&str, &SourceRecord> =
            sources.iter().map(|s| (s.id.as_str(), s)).collect();
        let entries_by_id: HashMap<&str, &LedgerEntry> =
            entries.iter().map(|e| (e.id.as_str(), e)).collect();

        // Merchant learning: every confirmed match against an already
        // categorized entry reinforces that merchant's profile.
        for result in &matched {
            let Some(entry) = entries_by_id.get(result.ledger_id.as_str()) else {
                continue;
            };
            if let Some(category) = &entry.category_id {
                let key = normalize_merchant_key(&entry.payee_name);
                let hint = self.suggester.classify_merchant_type(&entry.payee_name);
                if let Err(err) = self.profiles.observe(&key, category, hint) {
                    warn!(target: "ledger_recon::run", %err, merchant = %key, "profile update failed");
                }
            }
        }

        // Suggestions + splits for entries left unclaimed this run.
        let claimed: HashSet<&str> = matched.iter().map(|m| m.ledger_id.as_str()).collect();
        let prior_pairs = self.prior_pairs(state);
        let mut suggestions = Vec::new();
        let mut splits = Vec::new();
        let mut skipped_low_confidence = 0usize;

        for entry in &entries {
            if claimed.contains(entry.id.as_str()) || entry.is_categorized() {
                continue;
            }

            match self.suggester.suggest(entry, self.profiles.as_ref(), &entries) {
                Ok(ranked) if ranked.is_empty() => skipped_low_confidence += 1,
                Ok(ranked) => suggestions.extend(ranked),
                Err(err) => {
                    warn!(target: "ledger_recon::run", %err, ledger_id = %entry.id, "suggestion lookup failed");
                    issues.push(RunIssue::StateStoreUnavailable {
                        detail: err.to_string(),
                    });
                }
            }

            // Itemization can come from a pair recorded in an earlier
            // run whose source showed up in this pull.
            let matched_source = prior_pairs
                .get(entry.id.as_str())
                .and_then(|source_id| sources_by_id.get(source_id.as_str()))
                .copied();
            let merchant_type = self.resolve_merchant_type(entry);

            match self.splitter.detect(entry, merchant_type, matched_source) {
                SplitOutcome::Proposal(proposal) => splits.push(proposal),
                SplitOutcome::NotTriggered => {}
                SplitOutcome::InvariantViolation { detail } => {
                    // discarded proposal; the plain suggestions above
                    // are the fallback
                    issues.push(RunIssue::SplitInvariantViolation {
                        ledger_id: entry.id.clone(),
                        detail,
                    });
                }
            }
        }

        // Push updates for confirmed matches unless dry-running.
        if !opts.dry_run {
            self.apply_match_updates(&matched, &sources_by_id, total_entries, &mut issues)
                .await?;
        }

        let counts = RunCounts {
            sources_pulled: sources.len(),
            entries_pulled: total_entries,
            matched: matched.len(),
            suggested: suggestions.len(),
            split_proposed: splits.len(),
            skipped_low_confidence,
            errored: issues.len(),
        };

        let report = RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            dry_run: opts.dry_run,
            force: opts.force,
            degraded_state,
            matched,
            suggestions,
            splits,
            errors: issues,
            counts,
        };
        info!(target: "ledger_recon::run", %run_id, summary = %report.summary(), "run complete");
        Ok(report)
    }

    async fn pull_sources(
        &self,
        opts: &RunOptions,
        issues: &mut Vec<RunIssue>,
    ) -> Result<Vec<SourceRecord>, RunAbort> {
        let timeout = Duration::from_secs(self.config.provider_limits.timeout_secs);
        let mut records: Vec<SourceRecord> = Vec::new();
        let mut seen_hashes: HashSet<String> = HashSet::new();

        for provider in &self.sources {
            let provider = provider.as_ref();
            let since = opts.since;
            let result = with_retry(&self.config.retry, provider.name(), || async move {
                let _permit = self.gate.admit().await;
                match tokio::time::timeout(timeout, provider.pull(since)).await {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::transient(
                        provider.name().to_string(),
                        format!("pull timed out after {}s", timeout.as_secs()),
                    )),
                }
            })
            .await;

            match result {
                Ok(pulled) => {
                    if pulled.is_empty() && !provider.allow_empty() {
                        issues.push(RunIssue::Ingestion {
                            provider: provider.name().to_string(),
                            detail: "source yielded no records".to_string(),
                        });
                        continue;
                    }
                    for record in pulled {
                        if seen_hashes.insert(record.content_hash.clone()) {
                            records.push(record);
                        }
                    }
                }
                Err(err) if err.is_fatal() => {
                    return Err(RunAbort {
                        provider: provider.name().to_string(),
                        detail: err.to_string(),
                        processed: 0,
                        total: 0,
                    });
                }
                Err(err) => {
                    // this source contributed nothing; the run carries
                    // on with the remaining providers
                    warn!(target: "ledger_recon::run", %err, provider = provider.name(), "source pull failed");
                    issues.push(RunIssue::TransientProvider {
                        provider: provider.name().to_string(),
                        detail: err.to_string(),
                    });
                }
            }
        }

        Ok(records)
    }

    async fn pull_ledger(&self, opts: &RunOptions) -> Result<Vec<LedgerEntry>, RunAbort> {
        let timeout = Duration::from_secs(self.config.provider_limits.timeout_secs);
        let account_filter = opts.account_filter.as_deref();

        with_retry(&self.config.retry, self.ledger.name(), || async move {
            let _permit = self.gate.admit().await;
            match tokio::time::timeout(timeout, self.ledger.pull_unreconciled(account_filter)).await
            {
                Ok(result) => result,
                Err(_) => Err(ProviderError::transient(
                    self.ledger.name().to_string(),
                    format!("ledger pull timed out after {}s", timeout.as_secs()),
                )),
            }
        })
        .await
        .map_err(|err| RunAbort {
            provider: self.ledger.name().to_string(),
            detail: err.to_string(),
            processed: 0,
            total: 0,
        })
    }

    fn score_and_select(
        &self,
        entries: &[LedgerEntry],
        sources: &[SourceRecord],
        state: &dyn ReconciliationStateStore,
        force: bool,
        issues: &mut Vec<RunIssue>,
    ) -> Result<Vec<MatchResult>, crate::error::StateStoreError> {
        let (candidates, scoring_issues) =
            self.selector
                .build_candidates(&self.scorer, entries, sources, state, force)?;
        issues.extend(scoring_issues);
        self.selector.select(candidates, state)
    }

    /// Ledger id → source id pairs already recorded in the store,
    /// read once per run for split itemization.
    fn prior_pairs(&self, state: &dyn ReconciliationStateStore) -> HashMap<String, String> {
        match state.pruned_view(self.config.retention_days) {
            Ok(records) => records
                .into_iter()
                .map(|r| (r.ledger_id, r.source_id))
                .collect(),
            Err(_) => HashMap::new(),
        }
    }

    /// Learned profile type wins; the keyword table is the cold-start
    /// fallback.
    fn resolve_merchant_type(&self, entry: &LedgerEntry) -> Option<MerchantType> {
        let key = normalize_merchant_key(&entry.payee_name);
        if let Ok(Some(profile)) = self.profiles.get(&key) {
            if profile.merchant_type != MerchantType::Other {
                return Some(profile.merchant_type);
            }
        }
        self.suggester.classify_merchant_type(&entry.payee_name)
    }

    async fn apply_match_updates(
        &self,
        matched: &[MatchResult],
        sources_by_id: &HashMap<&str, &SourceRecord>,
        total_entries: usize,
        issues: &mut Vec<RunIssue>,
    ) -> Result<(), RunAbort> {
        let timeout = Duration::from_secs(self.config.provider_limits.timeout_secs);

        for (processed, result) in matched.iter().enumerate() {
            let memo = match sources_by_id.get(result.source_id.as_str()) {
                Some(source) => format!("matched order {}", source.order_ref),
                None => format!("reconciled with source {}", result.source_id),
            };
            let update = LedgerUpdate {
                memo: Some(memo),
                ..LedgerUpdate::default()
            };

            let outcome = with_retry(&self.config.retry, self.ledger.name(), || {
                let update = update.clone();
                async move {
                    let _permit = self.gate.admit().await;
                    match tokio::time::timeout(
                        timeout,
                        self.ledger.apply_update(&result.ledger_id, update),
                    )
                    .await
                    {
                        Ok(outcome) => outcome,
                        Err(_) => Err(ProviderError::transient(
                            self.ledger.name().to_string(),
                            "apply_update timed out".to_string(),
                        )),
                    }
                }
            })
            .await;

            match outcome {
                Ok(()) => {}
                Err(err) if err.is_fatal() => {
                    return Err(RunAbort {
                        provider: self.ledger.name().to_string(),
                        detail: err.to_string(),
                        processed,
                        total: total_entries,
                    });
                }
                Err(err) => {
                    warn!(target: "ledger_recon::run", %err, ledger_id = %result.ledger_id, "apply_update failed");
                    issues.push(RunIssue::TransientProvider {
                        provider: self.ledger.name().to_string(),
                        detail: err.to_string(),
                    });
                }
            }
        }

        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
