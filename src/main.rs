use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use chrono::{Duration, NaiveDate, Utc};
use tracing_subscriber::EnvFilter;

use ledger_recon::{
    open_state_store, DownloadFolderSource, EngineConfig, FileLedgerProvider, ManualImportSource,
    MemoryProfileStore, MerchantProfileStore, Orchestrator, RunOptions, SourceProvider,
    SqliteProfileStore,
};

struct CliArgs {
    ledger_path: PathBuf,
    orders_dir: Option<PathBuf>,
    manual_csv: Option<PathBuf>,
    config_path: Option<PathBuf>,
    state_path: PathBuf,
    profiles_path: PathBuf,
    updates_out: Option<PathBuf>,
    since: Option<NaiveDate>,
    account: Option<String>,
    dry_run: bool,
    force: bool,
}

fn print_usage() {
    println!("Usage: ledger-recon run --ledger <entries.json> [options]");
    println!();
    println!("Options:");
    println!("  --orders <dir>         download-folder order exports (JSON)");
    println!("  --manual <file.csv>    manual purchase import");
    println!("  --config <file.json>   engine configuration");
    println!("  --state <file.db>      reconciliation state (default recon-state.db)");
    println!("  --profiles <file.db>   merchant profiles (default merchant-profiles.db)");
    println!("  --updates-out <file>   write applied ledger updates as JSON");
    println!("  --since <YYYY-MM-DD>   earliest source date (default 90 days back)");
    println!("  --account <id>         restrict the ledger pull to one account");
    println!("  --dry-run              compute everything, apply nothing");
    println!("  --force                re-match previously matched pairs (backfill)");
}

fn parse_args(args: &[String]) -> Result<CliArgs> {
    let mut parsed = CliArgs {
        ledger_path: PathBuf::new(),
        orders_dir: None,
        manual_csv: None,
        config_path: None,
        state_path: PathBuf::from("recon-state.db"),
        profiles_path: PathBuf::from("merchant-profiles.db"),
        updates_out: None,
        since: None,
        account: None,
        dry_run: false,
        force: false,
    };

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let mut value = |flag: &str| -> Result<String> {
            iter.next()
                .map(|s| s.to_string())
                .with_context(|| format!("missing value for {flag}"))
        };
        match arg.as_str() {
            "--ledger" => parsed.ledger_path = PathBuf::from(value("--ledger")?),
            "--orders" => parsed.orders_dir = Some(PathBuf::from(value("--orders")?)),
            "--manual" => parsed.manual_csv = Some(PathBuf::from(value("--manual")?)),
            "--config" => parsed.config_path = Some(PathBuf::from(value("--config")?)),
            "--state" => parsed.state_path = PathBuf::from(value("--state")?),
            "--profiles" => parsed.profiles_path = PathBuf::from(value("--profiles")?),
            "--updates-out" => parsed.updates_out = Some(PathBuf::from(value("--updates-out")?)),
            "--since" => {
                let raw = value("--since")?;
                parsed.since = Some(
                    NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
                        .with_context(|| format!("invalid --since date: {raw}"))?,
                );
            }
            "--account" => parsed.account = Some(value("--account")?),
            "--dry-run" => parsed.dry_run = true,
            "--force" => parsed.force = true,
            other => bail!("unknown argument: {other}"),
        }
    }

    if parsed.ledger_path.as_os_str().is_empty() {
        bail!("--ledger is required");
    }
    Ok(parsed)
}

async fn run_reconcile(args: CliArgs) -> Result<ExitCode> {
    let config = match &args.config_path {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::with_default_rules(),
    };

    let mut sources: Vec<Box<dyn SourceProvider>> = Vec::new();
    if let Some(dir) = &args.orders_dir {
        sources.push(Box::new(DownloadFolderSource::new("download-folder", dir)));
    }
    if let Some(csv) = &args.manual_csv {
        sources.push(Box::new(ManualImportSource::new("manual-import", csv)));
    }
    if sources.is_empty() {
        bail!("at least one of --orders / --manual is required");
    }

    let ledger = std::sync::Arc::new(FileLedgerProvider::new("file-ledger", &args.ledger_path));
    let state = open_state_store(&args.state_path);
    let profiles: Box<dyn MerchantProfileStore> =
        match SqliteProfileStore::open(&args.profiles_path) {
            Ok(store) => Box::new(store),
            Err(err) => {
                eprintln!("⚠️  profile store unavailable ({err}), learning is off this run");
                Box::new(MemoryProfileStore::new())
            }
        };

    let since = args
        .since
        .unwrap_or_else(|| (Utc::now() - Duration::days(90)).date_naive());
    let opts = RunOptions {
        since,
        account_filter: args.account.clone(),
        dry_run: args.dry_run,
        force: args.force,
    };

    println!("🧾 Ledger Reconciliation - sources → ledger matching");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let orchestrator =
        Orchestrator::new(config, sources, Box::new(ledger.clone()), state, profiles)?;
    let report = match orchestrator.run(&opts).await {
        Ok(report) => report,
        Err(abort) => {
            eprintln!("❌ {abort}");
            return Ok(ExitCode::FAILURE);
        }
    };

    if let Some(out) = &args.updates_out {
        ledger.flush_updates(out)?;
        println!("💾 wrote {} applied updates to {}", ledger.applied_updates().len(), out.display());
    }

    println!("\n📊 {}", report.summary());

    for result in &report.matched {
        println!(
            "  ✓ {} ↔ {} (score {}, {})",
            result.ledger_id,
            result.source_id,
            result.score,
            result.tier.as_str()
        );
    }
    for suggestion in &report.suggestions {
        println!(
            "  💡 {} → {} ({}%, {})",
            suggestion.ledger_id,
            suggestion.category_id,
            suggestion.confidence,
            suggestion.rationale
        );
    }
    for split in &report.splits {
        println!(
            "  ✂️  {} → {} parts ({})",
            split.ledger_id,
            split.parts.len(),
            split.trigger_reason
        );
    }
    for issue in &report.errors {
        println!("  ⚠️  {issue:?}");
    }

    println!(
        "\n{}",
        serde_json::to_string_pretty(&report.counts).context("encoding counts")?
    );
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 || args[1] != "run" {
        print_usage();
        return Ok(ExitCode::FAILURE);
    }

    let parsed = parse_args(&args[2..])?;
    run_reconcile(parsed).await
}
