// 🔌 Providers - Pluggable source and ledger collaborators
// The orchestrator only ever sees these traits; folder exports, CSV
// imports, inboxes and remote automations are interchangeable behind
// `SourceProvider`.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ProviderError;
use crate::model::{LedgerEntry, SourceKind, SourceRecord, SplitPart};

// ============================================================================
// TRAITS
// ============================================================================

#[async_trait]
pub trait SourceProvider: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> SourceKind;

    /// Whether an empty pull is expected (manual imports) or an
    /// ingestion issue (a download folder that should have exports).
    fn allow_empty(&self) -> bool {
        false
    }

    async fn pull(&self, since: NaiveDate) -> Result<Vec<SourceRecord>, ProviderError>;
}

/// Update pushed back to the external ledger for one entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerUpdate {
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub memo: Option<String>,
    #[serde(default)]
    pub splits: Option<Vec<SplitPart>>,
}

#[async_trait]
pub trait LedgerProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn pull_unreconciled(
        &self,
        account_filter: Option<&str>,
    ) -> Result<Vec<LedgerEntry>, ProviderError>;

    async fn apply_update(
        &self,
        ledger_id: &str,
        update: LedgerUpdate,
    ) -> Result<(), ProviderError>;
}

// Shared handles work anywhere a provider does, so callers can keep a
// handle for post-run access (e.g. flushing collected updates).
#[async_trait]
impl<T: LedgerProvider + ?Sized> LedgerProvider for std::sync::Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn pull_unreconciled(
        &self,
        account_filter: Option<&str>,
    ) -> Result<Vec<LedgerEntry>, ProviderError> {
        (**self).pull_unreconciled(account_filter).await
    }

    async fn apply_update(
        &self,
        ledger_id: &str,
        update: LedgerUpdate,
    ) -> Result<(), ProviderError> {
        (**self).apply_update(ledger_id, update).await
    }
}

// ============================================================================
// DOWNLOAD FOLDER SOURCE
// ============================================================================

/// Reads order exports (JSON arrays of records) dropped into a
/// watched folder. Exports are written by the retailer's "download
/// your orders" flow, so an empty folder usually means ingestion
/// broke upstream.
pub struct DownloadFolderSource {
    name: String,
    dir: PathBuf,
}

impl DownloadFolderSource {
    pub fn new(name: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        DownloadFolderSource {
            name: name.into(),
            dir: dir.into(),
        }
    }

    fn read_exports(&self, since: NaiveDate) -> anyhow::Result<Vec<SourceRecord>> {
        let mut records = Vec::new();
        let entries = fs::read_dir(&self.dir)
            .with_context(|| format!("reading export folder {}", self.dir.display()))?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().map(|ext| ext == "json").unwrap_or(false))
            .collect();
        paths.sort();

        for path in paths {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("reading export {}", path.display()))?;
            let batch: Vec<SourceRecord> = serde_json::from_str(&content)
                .with_context(|| format!("parsing export {}", path.display()))?;
            for mut record in batch {
                if record.date < since {
                    continue;
                }
                record.source_kind = SourceKind::DownloadFolder;
                record.ensure_content_hash();
                records.push(record);
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl SourceProvider for DownloadFolderSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::DownloadFolder
    }

    async fn pull(&self, since: NaiveDate) -> Result<Vec<SourceRecord>, ProviderError> {
        let records = self
            .read_exports(since)
            .map_err(|e| ProviderError::other(self.name.clone(), e))?;
        debug!(
            target: "ledger_recon::providers",
            provider = %self.name, count = records.len(), "pulled folder exports"
        );
        Ok(records)
    }
}

// ============================================================================
// MANUAL IMPORT SOURCE (CSV)
// ============================================================================

#[derive(Debug, Deserialize)]
struct ManualImportRow {
    #[serde(default)]
    id: String,
    order_ref: String,
    date: NaiveDate,
    amount_cents: i64,
    merchant: String,
}

/// Hand-curated CSV of purchases, one row per order. Empty files are
/// normal here - people only reach for manual import when something
/// else missed a purchase.
pub struct ManualImportSource {
    name: String,
    path: PathBuf,
}

impl ManualImportSource {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        ManualImportSource {
            name: name.into(),
            path: path.into(),
        }
    }

    fn read_csv(&self, since: NaiveDate) -> anyhow::Result<Vec<SourceRecord>> {
        let mut rdr = csv::Reader::from_path(&self.path)
            .with_context(|| format!("opening manual import {}", self.path.display()))?;

        let mut records = Vec::new();
        for result in rdr.deserialize() {
            let row: ManualImportRow = result.context("deserializing manual import row")?;
            if row.date < since {
                continue;
            }
            let id = if row.id.is_empty() {
                format!("manual-{}", row.order_ref)
            } else {
                row.id
            };
            let mut record = SourceRecord {
                id,
                order_ref: row.order_ref,
                date: row.date,
                amount_cents: row.amount_cents,
                merchant: row.merchant,
                items: Vec::new(),
                source_kind: SourceKind::ManualImport,
                content_hash: String::new(),
            };
            record.ensure_content_hash();
            records.push(record);
        }
        Ok(records)
    }
}

#[async_trait]
impl SourceProvider for ManualImportSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::ManualImport
    }

    fn allow_empty(&self) -> bool {
        true
    }

    async fn pull(&self, since: NaiveDate) -> Result<Vec<SourceRecord>, ProviderError> {
        self.read_csv(since)
            .map_err(|e| ProviderError::other(self.name.clone(), e))
    }
}

// ============================================================================
// FILE-BACKED LEDGER PROVIDER
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedUpdate {
    pub ledger_id: String,
    pub update: LedgerUpdate,
}

/// Ledger entries from a JSON export; updates are collected in memory
/// and flushed to a JSON file at the end of the run for the reporting
/// side to pick up.
pub struct FileLedgerProvider {
    name: String,
    entries_path: PathBuf,
    applied: Mutex<Vec<AppliedUpdate>>,
}

impl FileLedgerProvider {
    pub fn new(name: impl Into<String>, entries_path: impl Into<PathBuf>) -> Self {
        FileLedgerProvider {
            name: name.into(),
            entries_path: entries_path.into(),
            applied: Mutex::new(Vec::new()),
        }
    }

    pub fn applied_updates(&self) -> Vec<AppliedUpdate> {
        self.applied.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn flush_updates(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let applied = self.applied_updates();
        let json = serde_json::to_string_pretty(&applied).context("encoding applied updates")?;
        fs::write(path, json).with_context(|| format!("writing updates to {}", path.display()))
    }
}

#[async_trait]
impl LedgerProvider for FileLedgerProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn pull_unreconciled(
        &self,
        account_filter: Option<&str>,
    ) -> Result<Vec<LedgerEntry>, ProviderError> {
        let content = fs::read_to_string(&self.entries_path)
            .with_context(|| format!("reading ledger export {}", self.entries_path.display()))
            .map_err(|e| ProviderError::other(self.name.clone(), e))?;
        let entries: Vec<LedgerEntry> = serde_json::from_str(&content)
            .context("parsing ledger export")
            .map_err(|e| ProviderError::other(self.name.clone(), e))?;

        Ok(entries
            .into_iter()
            .filter(|e| !e.cleared)
            .filter(|e| account_filter.map(|a| e.account_id == a).unwrap_or(true))
            .collect())
    }

    async fn apply_update(
        &self,
        ledger_id: &str,
        update: LedgerUpdate,
    ) -> Result<(), ProviderError> {
        let mut applied = self.applied.lock().unwrap_or_else(|e| e.into_inner());
        applied.push(AppliedUpdate {
            ledger_id: ledger_id.to_string(),
            update,
        });
        Ok(())
    }
}

// ============================================================================
// MEMORY PROVIDERS (test doubles with failure injection)
// ============================================================================

/// Failure the memory providers inject before succeeding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    Transient,
    Auth,
}

pub struct MemorySourceProvider {
    name: String,
    kind: SourceKind,
    allow_empty: bool,
    records: Vec<SourceRecord>,
    failures_remaining: AtomicU32,
    failure_mode: FailureMode,
}

impl MemorySourceProvider {
    pub fn new(name: impl Into<String>, kind: SourceKind, records: Vec<SourceRecord>) -> Self {
        MemorySourceProvider {
            name: name.into(),
            kind,
            allow_empty: false,
            records,
            failures_remaining: AtomicU32::new(0),
            failure_mode: FailureMode::Transient,
        }
    }

    pub fn allow_empty(mut self, allow: bool) -> Self {
        self.allow_empty = allow;
        self
    }

    /// Fail the first `n` pulls with the given mode, then succeed.
    pub fn failing(mut self, n: u32, mode: FailureMode) -> Self {
        self.failures_remaining = AtomicU32::new(n);
        self.failure_mode = mode;
        self
    }

    fn maybe_fail(&self) -> Result<(), ProviderError> {
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(match self.failure_mode {
                FailureMode::Transient => {
                    ProviderError::transient(self.name.clone(), "injected transient failure")
                }
                FailureMode::Auth => {
                    ProviderError::auth(self.name.clone(), "injected auth failure")
                }
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SourceProvider for MemorySourceProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn allow_empty(&self) -> bool {
        self.allow_empty
    }

    async fn pull(&self, since: NaiveDate) -> Result<Vec<SourceRecord>, ProviderError> {
        self.maybe_fail()?;
        Ok(self
            .records
            .iter()
            .filter(|r| r.date >= since)
            .cloned()
            .map(|mut r| {
                r.ensure_content_hash();
                r
            })
            .collect())
    }
}

pub struct MemoryLedgerProvider {
    name: String,
    entries: Vec<LedgerEntry>,
    applied: Mutex<Vec<AppliedUpdate>>,
    failures_remaining: AtomicU32,
    failure_mode: FailureMode,
}

impl MemoryLedgerProvider {
    pub fn new(entries: Vec<LedgerEntry>) -> Self {
        MemoryLedgerProvider {
            name: "memory-ledger".to_string(),
            entries,
            applied: Mutex::new(Vec::new()),
            failures_remaining: AtomicU32::new(0),
            failure_mode: FailureMode::Transient,
        }
    }

    pub fn failing(mut self, n: u32, mode: FailureMode) -> Self {
        self.failures_remaining = AtomicU32::new(n);
        self.failure_mode = mode;
        self
    }

    pub fn applied_updates(&self) -> Vec<AppliedUpdate> {
        self.applied.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl LedgerProvider for MemoryLedgerProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn pull_unreconciled(
        &self,
        account_filter: Option<&str>,
    ) -> Result<Vec<LedgerEntry>, ProviderError> {
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(match self.failure_mode {
                FailureMode::Transient => {
                    ProviderError::transient(self.name.clone(), "injected transient failure")
                }
                FailureMode::Auth => {
                    ProviderError::auth(self.name.clone(), "injected auth failure")
                }
            });
        }

        Ok(self
            .entries
            .iter()
            .filter(|e| !e.cleared)
            .filter(|e| account_filter.map(|a| e.account_id == a).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn apply_update(
        &self,
        ledger_id: &str,
        update: LedgerUpdate,
    ) -> Result<(), ProviderError> {
        let mut applied = self.applied.lock().unwrap_or_else(|e| e.into_inner());
        applied.push(AppliedUpdate {
            ledger_id: ledger_id.to_string(),
            update,
        });
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
