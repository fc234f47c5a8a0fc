// End-to-end reconciliation runs: idempotent re-runs, dry-run
// suppression, degraded state store, and the strict 1:1 invariant.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::NaiveDate;

use ledger_recon::{
    EngineConfig, KeywordRule, LedgerEntry, LineItem, MemoryLedgerProvider, MemoryProfileStore,
    MemorySourceProvider, MerchantType, Orchestrator, RetryPolicy, RunOptions, SourceKind,
    SourceProvider, SqliteProfileStore, SqliteStateStore, UnavailableStateStore,
};

fn date(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 11, d).unwrap()
}

fn entry(id: &str, d: u32, amount_cents: i64, payee: &str) -> LedgerEntry {
    LedgerEntry {
        id: id.to_string(),
        date: date(d),
        amount_cents,
        payee_name: payee.to_string(),
        memo: String::new(),
        account_id: "acct-card".to_string(),
        category_id: None,
        cleared: false,
    }
}

fn source(id: &str, d: u32, amount_cents: i64, merchant: &str) -> ledger_recon::SourceRecord {
    ledger_recon::SourceRecord {
        id: id.to_string(),
        order_ref: format!("ref-{id}"),
        date: date(d),
        amount_cents,
        merchant: merchant.to_string(),
        items: Vec::new(),
        source_kind: SourceKind::DownloadFolder,
        content_hash: String::new(),
    }
}

fn test_config() -> EngineConfig {
    let mut config = EngineConfig::with_default_rules();
    config.retry = RetryPolicy {
        max_attempts: 2,
        base_delay_ms: 1,
        max_delay_ms: 1,
    };
    config.provider_limits.min_request_interval_ms = 0;
    config
}

fn folder_source(records: Vec<ledger_recon::SourceRecord>) -> Box<dyn SourceProvider> {
    Box::new(MemorySourceProvider::new(
        "orders",
        SourceKind::DownloadFolder,
        records,
    ))
}

#[tokio::test]
async fn second_run_is_idempotent_with_persisted_state() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("recon-state.db");
    let records = vec![
        source("src-1", 26, 4500, "Amazon"),
        source("src-2", 27, 1299, "Costco"),
    ];
    let entries = vec![
        entry("led-1", 26, -4500, "AMAZON.COM"),
        entry("led-2", 27, -1299, "COSTCO WHSE"),
    ];

    // First run: both pairs match and both updates are applied.
    let ledger1 = Arc::new(MemoryLedgerProvider::new(entries.clone()));
    let orch1 = Orchestrator::new(
        test_config(),
        vec![folder_source(records.clone())],
        Box::new(ledger1.clone()),
        Box::new(SqliteStateStore::open(&state_path).unwrap()),
        Box::new(MemoryProfileStore::new()),
    )
    .unwrap();
    let report1 = orch1.run(&RunOptions::new(date(1))).await.unwrap();

    assert_eq!(report1.counts.matched, 2);
    assert_eq!(ledger1.applied_updates().len(), 2);

    // Second run over unchanged input: zero new matches, zero new
    // apply_update calls.
    let ledger2 = Arc::new(MemoryLedgerProvider::new(entries));
    let orch2 = Orchestrator::new(
        test_config(),
        vec![folder_source(records)],
        Box::new(ledger2.clone()),
        Box::new(SqliteStateStore::open(&state_path).unwrap()),
        Box::new(MemoryProfileStore::new()),
    )
    .unwrap();
    let report2 = orch2.run(&RunOptions::new(date(1))).await.unwrap();

    assert_eq!(report2.counts.matched, 0);
    assert!(ledger2.applied_updates().is_empty());
}

#[tokio::test]
async fn force_rematches_previously_matched_pairs() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("recon-state.db");
    let records = vec![source("src-1", 26, 4500, "Amazon")];
    let entries = vec![entry("led-1", 26, -4500, "AMAZON.COM")];

    let run = |force: bool| {
        let records = records.clone();
        let entries = entries.clone();
        let state_path = state_path.clone();
        async move {
            let ledger = Arc::new(MemoryLedgerProvider::new(entries));
            let orch = Orchestrator::new(
                test_config(),
                vec![folder_source(records)],
                Box::new(ledger.clone()),
                Box::new(SqliteStateStore::open(&state_path).unwrap()),
                Box::new(MemoryProfileStore::new()),
            )
            .unwrap();
            let mut opts = RunOptions::new(date(1));
            opts.force = force;
            (orch.run(&opts).await.unwrap(), ledger)
        }
    };

    let (first, _) = run(false).await;
    assert_eq!(first.counts.matched, 1);

    let (second, _) = run(false).await;
    assert_eq!(second.counts.matched, 0);

    // backfill: force bypasses the state-store skip check
    let (forced, _) = run(true).await;
    assert_eq!(forced.counts.matched, 1);
}

#[tokio::test]
async fn dry_run_suppresses_apply_update() {
    let ledger = Arc::new(MemoryLedgerProvider::new(vec![entry(
        "led-1",
        26,
        -4500,
        "AMAZON.COM",
    )]));
    let orch = Orchestrator::new(
        test_config(),
        vec![folder_source(vec![source("src-1", 26, 4500, "Amazon")])],
        Box::new(ledger.clone()),
        Box::new(SqliteStateStore::open_in_memory().unwrap()),
        Box::new(MemoryProfileStore::new()),
    )
    .unwrap();

    let mut opts = RunOptions::new(date(1));
    opts.dry_run = true;
    let report = orch.run(&opts).await.unwrap();

    assert_eq!(report.counts.matched, 1);
    assert!(report.dry_run);
    assert!(ledger.applied_updates().is_empty());
}

#[tokio::test]
async fn unreachable_state_store_degrades_to_stateless_run() {
    let ledger = Arc::new(MemoryLedgerProvider::new(vec![entry(
        "led-1",
        26,
        -4500,
        "AMAZON.COM",
    )]));
    let orch = Orchestrator::new(
        test_config(),
        vec![folder_source(vec![source("src-1", 26, 4500, "Amazon")])],
        Box::new(ledger.clone()),
        Box::new(UnavailableStateStore::new("backing disk offline")),
        Box::new(MemoryProfileStore::new()),
    )
    .unwrap();

    let report = orch.run(&RunOptions::new(date(1))).await.unwrap();

    // the run does not crash, still matches, and reports the condition
    assert!(report.degraded_state);
    assert_eq!(report.counts.matched, 1);
    assert!(report
        .errors
        .iter()
        .any(|e| e.kind() == "state_store_unavailable"));
    assert_eq!(ledger.applied_updates().len(), 1);
}

#[tokio::test]
async fn one_to_one_invariant_holds_across_a_run() {
    // four entries, three sources, overlapping amounts and dates
    let entries = vec![
        entry("led-1", 26, -4500, "AMAZON.COM"),
        entry("led-2", 26, -4500, "AMAZON.COM"),
        entry("led-3", 27, -4500, "AMAZON.COM"),
        entry("led-4", 27, -1299, "COSTCO WHSE"),
    ];
    let records = vec![
        source("src-1", 26, 4500, "Amazon"),
        source("src-2", 27, 4500, "Amazon"),
        source("src-3", 27, 1299, "Costco"),
    ];

    let state = SqliteStateStore::open_in_memory().unwrap();
    let ledger = Arc::new(MemoryLedgerProvider::new(entries));
    let orch = Orchestrator::new(
        test_config(),
        vec![folder_source(records)],
        Box::new(ledger),
        Box::new(state),
        Box::new(MemoryProfileStore::new()),
    )
    .unwrap();

    let report = orch.run(&RunOptions::new(date(1))).await.unwrap();

    assert_eq!(report.counts.matched, 3);
    let source_ids: HashSet<_> = report.matched.iter().map(|m| m.source_id.as_str()).collect();
    let ledger_ids: HashSet<_> = report.matched.iter().map(|m| m.ledger_id.as_str()).collect();
    assert_eq!(source_ids.len(), report.matched.len());
    assert_eq!(ledger_ids.len(), report.matched.len());
}

#[tokio::test]
async fn prior_run_match_supplies_itemization_for_splits() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("recon-state.db");

    let mut order = source("src-1", 26, 7420, "Amazon");
    order.items = vec![
        LineItem {
            name: "Coffee beans".to_string(),
            qty: 2,
            unit_price_cents: 600,
            category: Some("Groceries".to_string()),
        },
        LineItem {
            name: "USB hub".to_string(),
            qty: 1,
            unit_price_cents: 4500,
            category: Some("Electronics".to_string()),
        },
    ];
    let entries = vec![entry("led-1", 26, -7420, "AMAZON.COM")];

    // First run matches the pair (the entry is uncategorized, so it
    // was matched on amount+date alone).
    let orch1 = Orchestrator::new(
        test_config(),
        vec![folder_source(vec![order.clone()])],
        Box::new(Arc::new(MemoryLedgerProvider::new(entries.clone()))),
        Box::new(SqliteStateStore::open(&state_path).unwrap()),
        Box::new(MemoryProfileStore::new()),
    )
    .unwrap();
    let report1 = orch1.run(&RunOptions::new(date(1))).await.unwrap();
    assert_eq!(report1.counts.matched, 1);

    // Second run: the entry is still unreconciled upstream. It cannot
    // re-match, but the recorded pair lets the split detector use the
    // order's items.
    let orch2 = Orchestrator::new(
        test_config(),
        vec![folder_source(vec![order])],
        Box::new(Arc::new(MemoryLedgerProvider::new(entries))),
        Box::new(SqliteStateStore::open(&state_path).unwrap()),
        Box::new(MemoryProfileStore::new()),
    )
    .unwrap();
    let report2 = orch2.run(&RunOptions::new(date(1))).await.unwrap();

    assert_eq!(report2.counts.matched, 0);
    assert_eq!(report2.counts.split_proposed, 1);
    let proposal = &report2.splits[0];
    assert!(!proposal.needs_manual_split);
    assert_eq!(proposal.parts.len(), 2);
    assert!(proposal.sums_to(-7420));
}

#[tokio::test]
async fn matches_feed_merchant_learning_for_later_suggestions() {
    let dir = tempfile::tempdir().unwrap();
    let profiles_path = dir.path().join("profiles.db");

    // Run 1: a categorized restaurant entry matches its receipt; the
    // profile store learns payee → Dining.
    let mut categorized = entry("led-1", 26, -4720, "BISTRO 42");
    categorized.category_id = Some("Dining".to_string());

    let orch1 = Orchestrator::new(
        test_config(),
        vec![folder_source(vec![source("src-1", 26, 4720, "Bistro 42")])],
        Box::new(Arc::new(MemoryLedgerProvider::new(vec![categorized]))),
        Box::new(SqliteStateStore::open_in_memory().unwrap()),
        Box::new(SqliteProfileStore::open(&profiles_path).unwrap()),
    )
    .unwrap();
    let report1 = orch1.run(&RunOptions::new(date(1))).await.unwrap();
    assert_eq!(report1.counts.matched, 1);

    // Run 2: a new uncategorized entry at the same payee gets a
    // profile-backed Dining suggestion at full confidence.
    let orch2 = Orchestrator::new(
        test_config(),
        vec![folder_source(Vec::new())],
        Box::new(Arc::new(MemoryLedgerProvider::new(vec![entry(
            "led-9", 28, -3100, "BISTRO 42",
        )]))),
        Box::new(SqliteStateStore::open_in_memory().unwrap()),
        Box::new(SqliteProfileStore::open(&profiles_path).unwrap()),
    )
    .unwrap();
    let report2 = orch2.run(&RunOptions::new(date(1))).await.unwrap();

    let dining: Vec<_> = report2
        .suggestions
        .iter()
        .filter(|s| s.category_id == "Dining")
        .collect();
    assert_eq!(dining.len(), 1);
    assert_eq!(dining[0].confidence, 100);
}

#[tokio::test]
async fn suggestion_output_respects_floor_and_ordering() {
    let mut config = test_config();
    config.keyword_rules = vec![
        KeywordRule {
            pattern: "MEGAMART".to_string(),
            regex: None,
            category: "Groceries".to_string(),
            confidence: 92,
            merchant_type: None,
        },
        KeywordRule {
            pattern: "MEGAMART".to_string(),
            regex: None,
            category: "Household".to_string(),
            confidence: 85,
            merchant_type: None,
        },
        KeywordRule {
            pattern: "MEGAMART".to_string(),
            regex: None,
            category: "Pharmacy".to_string(),
            confidence: 70,
            merchant_type: Some(MerchantType::Grocery),
        },
    ];

    let orch = Orchestrator::new(
        config,
        vec![folder_source(Vec::new())],
        Box::new(Arc::new(MemoryLedgerProvider::new(vec![entry(
            "led-1", 26, -8000, "MEGAMART 042",
        )]))),
        Box::new(SqliteStateStore::open_in_memory().unwrap()),
        Box::new(MemoryProfileStore::new()),
    )
    .unwrap();

    let report = orch.run(&RunOptions::new(date(1))).await.unwrap();

    assert!(report.suggestions.len() <= 3);
    for pair in report.suggestions.windows(2) {
        assert!(pair[0].confidence > pair[1].confidence);
    }
    for suggestion in &report.suggestions {
        assert!(suggestion.confidence >= 60);
    }
}
