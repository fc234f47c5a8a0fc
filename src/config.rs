// ⚙️ Engine Configuration - Rules as data, loaded from JSON
// Every knob has a serde default so a partial config file works.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context as AnyhowContext, Result};
use serde::{Deserialize, Serialize};

use crate::model::SourceKind;
use crate::profiles::MerchantType;
use crate::retry::RetryPolicy;

// ============================================================================
// KEYWORD RULES
// ============================================================================

/// One keyword/regex → category rule. `pattern` uses case-insensitive
/// substring matching with `*` wildcards; `regex` takes precedence
/// when set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordRule {
    pub pattern: String,

    /// Optional explicit regex; overrides the wildcard pattern
    #[serde(default)]
    pub regex: Option<String>,

    pub category: String,

    /// Fixed confidence for a hit (keyword hits are high precision)
    #[serde(default = "default_keyword_confidence")]
    pub confidence: u8,

    /// Merchant type implied by this rule, used for split triggers
    #[serde(default)]
    pub merchant_type: Option<MerchantType>,
}

fn default_keyword_confidence() -> u8 {
    90
}

impl KeywordRule {
    /// Wildcard keyword matching: `SHELL*` matches "SHELL OIL 5523",
    /// a bare keyword matches anywhere in the text.
    pub fn keyword_matches(&self, text: &str) -> bool {
        let pattern_lower = self.pattern.to_lowercase();
        let text_lower = text.to_lowercase();

        if pattern_lower.contains('*') {
            let parts: Vec<&str> = pattern_lower.split('*').collect();

            if parts.is_empty() {
                return false;
            }
            if !parts[0].is_empty() && !text_lower.starts_with(parts[0]) {
                return false;
            }
            if !parts[parts.len() - 1].is_empty() && !text_lower.ends_with(parts[parts.len() - 1])
            {
                return false;
            }

            let mut current_pos = parts[0].len();
            for part in &parts[1..parts.len() - 1] {
                if part.is_empty() {
                    continue;
                }
                match text_lower[current_pos..].find(part) {
                    Some(pos) => current_pos += pos + part.len(),
                    None => return false,
                }
            }
            true
        } else {
            text_lower.contains(&pattern_lower)
        }
    }
}

// ============================================================================
// AMOUNT BUCKETS
// ============================================================================

/// Low-confidence tiebreak filler: an inclusive cents range mapped to
/// a category (e.g. 100-500 → Coffee).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmountBucket {
    pub min_cents: i64,
    pub max_cents: i64,
    pub category: String,

    #[serde(default = "default_bucket_confidence")]
    pub confidence: u8,
}

fn default_bucket_confidence() -> u8 {
    40
}

impl AmountBucket {
    pub fn contains(&self, amount_cents: i64) -> bool {
        let abs = amount_cents.abs();
        abs >= self.min_cents && abs <= self.max_cents
    }
}

// ============================================================================
// SPLIT CONFIG
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitConfig {
    /// Online-retail entries above this propose an itemized split
    #[serde(default = "default_online_retail_threshold")]
    pub online_retail_threshold_cents: i64,

    /// Warehouse-club entries above this propose an itemized split
    #[serde(default = "default_warehouse_threshold")]
    pub warehouse_threshold_cents: i64,

    /// Restaurant entries of any amount get a tip split when enabled
    #[serde(default = "default_true")]
    pub restaurant_tip_split: bool,

    /// Assumed tip share of the subtotal (0.18 = 18%)
    #[serde(default = "default_tip_percentage")]
    pub tip_percentage: f64,
}

fn default_online_retail_threshold() -> i64 {
    5_000
}

fn default_warehouse_threshold() -> i64 {
    10_000
}

fn default_true() -> bool {
    true
}

fn default_tip_percentage() -> f64 {
    0.18
}

impl Default for SplitConfig {
    fn default() -> Self {
        SplitConfig {
            online_retail_threshold_cents: default_online_retail_threshold(),
            warehouse_threshold_cents: default_warehouse_threshold(),
            restaurant_tip_split: default_true(),
            tip_percentage: default_tip_percentage(),
        }
    }
}

// ============================================================================
// PROVIDER LIMITS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderLimits {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_requests: usize,

    #[serde(default = "default_min_interval_ms")]
    pub min_request_interval_ms: u64,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_max_concurrent() -> usize {
    4
}

fn default_min_interval_ms() -> u64 {
    250
}

fn default_timeout_secs() -> u64 {
    20
}

impl Default for ProviderLimits {
    fn default() -> Self {
        ProviderLimits {
            max_concurrent_requests: default_max_concurrent(),
            min_request_interval_ms: default_min_interval_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

// ============================================================================
// ENGINE CONFIG
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Candidate admission window, days
    #[serde(default = "default_date_tolerance")]
    pub date_tolerance_days: i64,

    /// Candidate admission window, cents
    #[serde(default = "default_amount_tolerance")]
    pub amount_tolerance_cents: i64,

    /// Minimum score for the selector to claim a pair
    #[serde(default = "default_match_threshold")]
    pub match_threshold: u8,

    #[serde(default = "default_min_suggestion_confidence")]
    pub min_suggestion_confidence: u8,

    #[serde(default = "default_max_suggestions")]
    pub max_suggestions: usize,

    /// Reconciliation records older than this are pruned at run start
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,

    /// Expected source kind per ledger account (+10 score bonus)
    #[serde(default)]
    pub account_expectations: HashMap<String, SourceKind>,

    #[serde(default)]
    pub keyword_rules: Vec<KeywordRule>,

    #[serde(default)]
    pub amount_buckets: Vec<AmountBucket>,

    #[serde(default)]
    pub split: SplitConfig,

    #[serde(default)]
    pub provider_limits: ProviderLimits,

    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_date_tolerance() -> i64 {
    2
}

fn default_amount_tolerance() -> i64 {
    50
}

fn default_match_threshold() -> u8 {
    80
}

fn default_min_suggestion_confidence() -> u8 {
    60
}

fn default_max_suggestions() -> usize {
    3
}

fn default_retention_days() -> i64 {
    90
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            date_tolerance_days: default_date_tolerance(),
            amount_tolerance_cents: default_amount_tolerance(),
            match_threshold: default_match_threshold(),
            min_suggestion_confidence: default_min_suggestion_confidence(),
            max_suggestions: default_max_suggestions(),
            retention_days: default_retention_days(),
            account_expectations: HashMap::new(),
            keyword_rules: Vec::new(),
            amount_buckets: Vec::new(),
            split: SplitConfig::default(),
            provider_limits: ProviderLimits::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Load config from a JSON file; missing keys fall back to
    /// defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        serde_json::from_str(&content).context("Failed to parse config JSON")
    }

    /// Defaults plus a starter keyword-rule table for the common
    /// merchant families.
    pub fn with_default_rules() -> Self {
        let mut config = EngineConfig::default();
        config.keyword_rules = vec![
            KeywordRule {
                pattern: "SHELL*".to_string(),
                regex: None,
                category: "Auto:Gas".to_string(),
                confidence: 90,
                merchant_type: Some(MerchantType::GasStation),
            },
            KeywordRule {
                pattern: "CHEVRON*".to_string(),
                regex: None,
                category: "Auto:Gas".to_string(),
                confidence: 90,
                merchant_type: Some(MerchantType::GasStation),
            },
            KeywordRule {
                pattern: "AMAZON*".to_string(),
                regex: None,
                category: "Shopping".to_string(),
                confidence: 90,
                merchant_type: Some(MerchantType::OnlineRetail),
            },
            KeywordRule {
                pattern: "COSTCO*".to_string(),
                regex: None,
                category: "Groceries".to_string(),
                confidence: 90,
                merchant_type: Some(MerchantType::WarehouseClub),
            },
            KeywordRule {
                pattern: String::new(),
                regex: Some(r"(?i)netflix|spotify|hulu".to_string()),
                category: "Subscriptions".to_string(),
                confidence: 90,
                merchant_type: Some(MerchantType::Subscription),
            },
        ];
        config
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_pattern_matching() {
        let rule = KeywordRule {
            pattern: "SHELL*".to_string(),
            regex: None,
            category: "Auto:Gas".to_string(),
            confidence: 90,
            merchant_type: Some(MerchantType::GasStation),
        };

        assert!(rule.keyword_matches("SHELL OIL 5523"));
        assert!(rule.keyword_matches("shell station"));
        assert!(!rule.keyword_matches("SEASHELL GIFTS"));
    }

    #[test]
    fn test_bare_keyword_matches_anywhere() {
        let rule = KeywordRule {
            pattern: "STARBUCKS".to_string(),
            regex: None,
            category: "Coffee".to_string(),
            confidence: 90,
            merchant_type: Some(MerchantType::Restaurant),
        };

        assert!(rule.keyword_matches("STARBUCKS #4521"));
        assert!(rule.keyword_matches("TST* STARBUCKS SEATTLE"));
        assert!(!rule.keyword_matches("PEETS COFFEE"));
    }

    #[test]
    fn test_amount_bucket_uses_absolute_value() {
        let bucket = AmountBucket {
            min_cents: 100,
            max_cents: 500,
            category: "Coffee".to_string(),
            confidence: 40,
        };

        assert!(bucket.contains(-450));
        assert!(bucket.contains(100));
        assert!(bucket.contains(500));
        assert!(!bucket.contains(501));
        assert!(!bucket.contains(-99));
    }

    #[test]
    fn test_partial_config_falls_back_to_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"match_threshold": 85}"#).unwrap();

        assert_eq!(config.match_threshold, 85);
        assert_eq!(config.date_tolerance_days, 2);
        assert_eq!(config.amount_tolerance_cents, 50);
        assert_eq!(config.max_suggestions, 3);
        assert_eq!(config.min_suggestion_confidence, 60);
        assert_eq!(config.retention_days, 90);
        assert!((config.split.tip_percentage - 0.18).abs() < f64::EPSILON);
    }
}
