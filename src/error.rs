// 🚨 Error Taxonomy - Record-scoped issues vs run-fatal failures
// Record-scoped errors accumulate in the run report; provider-scoped
// auth failures abort the run.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while talking to an external provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Timeout / 5xx-equivalent - retried with backoff
    #[error("transient provider failure from {provider}: {detail}")]
    Transient { provider: String, detail: String },

    /// Authentication / authorization failure - never retried, aborts
    /// the whole run
    #[error("authentication failed for {provider}: {detail}")]
    Auth { provider: String, detail: String },

    /// Anything else the provider could not express more precisely
    #[error("provider {provider} failed: {source}")]
    Other {
        provider: String,
        #[source]
        source: anyhow::Error,
    },
}

impl ProviderError {
    pub fn transient(provider: impl Into<String>, detail: impl Into<String>) -> Self {
        ProviderError::Transient {
            provider: provider.into(),
            detail: detail.into(),
        }
    }

    pub fn auth(provider: impl Into<String>, detail: impl Into<String>) -> Self {
        ProviderError::Auth {
            provider: provider.into(),
            detail: detail.into(),
        }
    }

    pub fn other(provider: impl Into<String>, source: anyhow::Error) -> Self {
        ProviderError::Other {
            provider: provider.into(),
            source,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Transient { .. })
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ProviderError::Auth { .. })
    }

    pub fn provider(&self) -> &str {
        match self {
            ProviderError::Transient { provider, .. } => provider,
            ProviderError::Auth { provider, .. } => provider,
            ProviderError::Other { provider, .. } => provider,
        }
    }
}

/// Errors surfaced by a state store backend.
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("state store unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Fatal end of a run: an authentication failure (or an unusable
/// ledger) surfaced with a processed-so-far summary.
#[derive(Debug, Error)]
#[error("run aborted by {provider}: {detail} (processed {processed} of {total} entries)")]
pub struct RunAbort {
    pub provider: String,
    pub detail: String,
    pub processed: usize,
    pub total: usize,
}

/// Record-scoped issue collected into `RunReport.errors`. These are
/// isolated per record and never abort the batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunIssue {
    /// A source yielded nothing and is not marked allow-empty
    Ingestion { provider: String, detail: String },

    /// Retries exhausted against a provider
    TransientProvider { provider: String, detail: String },

    /// State store could not be opened; the run degraded to stateless
    StateStoreUnavailable { detail: String },

    /// A single malformed record was skipped
    ScoringInput { record_id: String, detail: String },

    /// A constructed split did not sum to the entry amount and was
    /// discarded in favor of a plain suggestion
    SplitInvariantViolation { ledger_id: String, detail: String },
}

impl RunIssue {
    pub fn kind(&self) -> &'static str {
        match self {
            RunIssue::Ingestion { .. } => "ingestion",
            RunIssue::TransientProvider { .. } => "transient_provider",
            RunIssue::StateStoreUnavailable { .. } => "state_store_unavailable",
            RunIssue::ScoringInput { .. } => "scoring_input",
            RunIssue::SplitInvariantViolation { .. } => "split_invariant_violation",
        }
    }
}
