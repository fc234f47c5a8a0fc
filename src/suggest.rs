// 💡 Category Suggestion Engine - Rank category candidates for
// unmatched, uncategorized ledger entries
// Four sources merged by category, max confidence wins:
//   1. learned merchant profile   (count / total, floored)
//   2. payee history in window    (grows with samples, capped 95)
//   3. keyword/regex rule table   (fixed, default 90)
//   4. amount buckets             (fixed, default 40 - filler only)

use anyhow::{Context as AnyhowContext, Result};
use regex::Regex;
use std::collections::HashMap;

use crate::config::{AmountBucket, EngineConfig, KeywordRule};
use crate::error::StateStoreError;
use crate::model::{CategorySuggestion, LedgerEntry};
use crate::profiles::{normalize_merchant_key, MerchantProfileStore, MerchantType};

/// Cap for payee-history confidence: repeated observation is strong
/// evidence but never keyword-table strong.
const PAYEE_HISTORY_CAP: u8 = 95;

struct CompiledRule {
    rule: KeywordRule,
    regex: Option<Regex>,
}

impl CompiledRule {
    fn matches(&self, text: &str) -> bool {
        if let Some(regex) = &self.regex {
            return regex.is_match(text);
        }
        if self.rule.pattern.is_empty() {
            return false;
        }
        self.rule.keyword_matches(text)
    }
}

pub struct CategorySuggestionEngine {
    min_confidence: u8,
    max_suggestions: usize,
    rules: Vec<CompiledRule>,
    amount_buckets: Vec<AmountBucket>,
}

impl CategorySuggestionEngine {
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let mut rules = Vec::with_capacity(config.keyword_rules.len());
        for rule in &config.keyword_rules {
            let regex = match &rule.regex {
                Some(pattern) => Some(
                    Regex::new(pattern)
                        .with_context(|| format!("invalid keyword rule regex: {pattern}"))?,
                ),
                None => None,
            };
            rules.push(CompiledRule {
                rule: rule.clone(),
                regex,
            });
        }

        Ok(CategorySuggestionEngine {
            min_confidence: config.min_suggestion_confidence,
            max_suggestions: config.max_suggestions,
            rules,
            amount_buckets: config.amount_buckets.clone(),
        })
    }

    /// Merchant type implied by the first keyword rule hit, for split
    /// triggering when no learned profile exists yet.
    pub fn classify_merchant_type(&self, payee: &str) -> Option<MerchantType> {
        self.rules
            .iter()
            .find(|r| r.matches(payee))
            .and_then(|r| r.rule.merchant_type)
    }

    /// Produce ranked suggestions for one entry. `window` is the
    /// current ledger fetch, used for payee history.
    pub fn suggest(
        &self,
        entry: &LedgerEntry,
        profiles: &dyn MerchantProfileStore,
        window: &[LedgerEntry],
    ) -> Result<Vec<CategorySuggestion>, StateStoreError> {
        // category -> (confidence, rationale); max confidence wins
        let mut merged: HashMap<String, (u8, String)> = HashMap::new();
        let mut offer = |category: &str, confidence: u8, rationale: String| {
            match merged.get(category) {
                Some((existing, _)) if *existing >= confidence => {}
                _ => {
                    merged.insert(category.to_string(), (confidence, rationale));
                }
            }
        };

        let merchant_key = normalize_merchant_key(&entry.payee_name);

        // 1. Learned merchant profile
        if let Some(profile) = profiles.get(&merchant_key)? {
            for category in profile.category_counts.keys() {
                let confidence = profile.confidence_for(category);
                let count = profile.category_counts[category];
                offer(
                    category,
                    confidence,
                    format!(
                        "merchant profile: {} of {} observations",
                        count, profile.total_observations
                    ),
                );
            }
        }

        // 2. Payee history over the current fetch window
        let mut history_counts: HashMap<&str, u32> = HashMap::new();
        for other in window {
            if other.id == entry.id {
                continue;
            }
            if normalize_merchant_key(&other.payee_name) != merchant_key {
                continue;
            }
            if let Some(category) = &other.category_id {
                *history_counts.entry(category.as_str()).or_insert(0) += 1;
            }
        }
        for (category, count) in &history_counts {
            let confidence = (55 + 10 * count).min(PAYEE_HISTORY_CAP as u32) as u8;
            offer(
                category,
                confidence,
                format!("payee history: {count} categorized entries this window"),
            );
        }

        // 3. Keyword / regex rule table
        for compiled in &self.rules {
            if compiled.matches(&entry.payee_name) {
                offer(
                    &compiled.rule.category,
                    compiled.rule.confidence,
                    format!("keyword rule: {}", rule_label(&compiled.rule)),
                );
            }
        }

        // 4. Amount buckets (low-confidence filler)
        for bucket in &self.amount_buckets {
            if bucket.contains(entry.amount_cents) {
                offer(
                    &bucket.category,
                    bucket.confidence,
                    format!(
                        "amount bucket: {}c-{}c",
                        bucket.min_cents, bucket.max_cents
                    ),
                );
            }
        }

        let mut ranked: Vec<(String, u8, String)> = merged
            .into_iter()
            .map(|(category, (confidence, rationale))| (category, confidence, rationale))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(self.max_suggestions);
        ranked.retain(|(_, confidence, _)| *confidence >= self.min_confidence);

        Ok(ranked
            .into_iter()
            .enumerate()
            .map(|(i, (category, confidence, rationale))| CategorySuggestion {
                ledger_id: entry.id.clone(),
                category_id: category,
                confidence,
                rationale,
                rank: (i + 1) as u8,
            })
            .collect())
    }
}

fn rule_label(rule: &KeywordRule) -> String {
    match &rule.regex {
        Some(regex) => regex.clone(),
        None => rule.pattern.clone(),
    }
}

// ============================================================================
// TESTS
// ============================================================================
