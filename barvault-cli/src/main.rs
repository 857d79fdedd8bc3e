//! barvault CLI: fetch daily series and manage the market-data cache.
//!
//! Commands:
//! - `fetch`: sync one or more instruments through the cache
//! - `cache status`: entry counts, size and ages
//! - `cache evict` / `cache purge-expired`: shrink the cache
//! - `cache clear`: remove entries by kind or instrument
//! - `cache export` / `cache import`: copy entries between cache roots
//! - `cache verify`: check blobs against the index

use anyhow::{bail, Context, Result};
use barvault_core::cache::{EntryFilter, ImportMode, RecordKind};
use barvault_core::domain::parse_compact_date;
use barvault_core::{
    sync_many, AdjustMode, CacheStore, Config, Instrument, StdoutProgress, SyncEngine, SyncRequest,
};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "barvault",
    about = "barvault: cached daily bars for A-share backtesting"
)]
struct Cli {
    /// Path to a TOML config file. Defaults to the user config dir, then ./barvault.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Cache root, overriding the config file and BARVAULT_CACHE_ROOT.
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync daily bars for the given instruments into the cache.
    Fetch {
        /// Instruments to sync (e.g., 600519.SH 000001.SZ).
        #[arg(required = true)]
        instruments: Vec<String>,

        /// Start date (YYYYMMDD or YYYY-MM-DD).
        #[arg(long)]
        start: String,

        /// End date (YYYYMMDD or YYYY-MM-DD). Defaults to today.
        #[arg(long)]
        end: Option<String>,

        /// Price adjustment: none, qfq or hfq.
        #[arg(long, default_value = "qfq")]
        adj: AdjustMode,

        /// Worker threads.
        #[arg(long, default_value_t = 4)]
        workers: usize,
    },
    /// Cache management commands.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Report entry counts, total size and ages.
    Status,
    /// Evict least recently used range slices until under the size budget.
    Evict {
        /// Budget in MiB. Defaults to cache.max_size_mb.
        #[arg(long)]
        max_mb: Option<u64>,
    },
    /// Remove range slices older than cache.ttl_days.
    PurgeExpired,
    /// Remove entries matching the filters.
    Clear {
        /// Only this kind: full_history, range_slice, trading_calendar_year, suspension_year.
        #[arg(long)]
        kind: Option<RecordKind>,

        /// Only entries for this instrument.
        #[arg(long)]
        instrument: Option<String>,

        /// Actually delete (without this flag, only previews what would be removed).
        #[arg(long, default_value_t = false)]
        confirm: bool,
    },
    /// Copy entries into another directory as a standalone cache.
    Export {
        /// Target directory.
        dir: PathBuf,

        #[arg(long)]
        kind: Option<RecordKind>,

        #[arg(long)]
        instrument: Option<String>,
    },
    /// Copy entries from an exported cache into this one.
    Import {
        /// Source directory.
        dir: PathBuf,

        /// Overwrite existing entries instead of keeping the newer one.
        #[arg(long, default_value_t = false)]
        replace: bool,
    },
    /// Check every blob against the index.
    Verify,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref(), cli.cache_dir)?;

    match cli.command {
        Commands::Fetch {
            instruments,
            start,
            end,
            adj,
            workers,
        } => run_fetch(&config, &instruments, &start, end.as_deref(), adj, workers),
        Commands::Cache { action } => {
            let store = CacheStore::open(config.cache.clone())
                .with_context(|| format!("open cache at {}", config.cache.root.display()))?;
            match action {
                CacheAction::Status => run_cache_status(&store),
                CacheAction::Evict { max_mb } => run_cache_evict(&store, max_mb),
                CacheAction::PurgeExpired => {
                    let removed = store.purge_expired()?;
                    println!("Purged {removed} expired range slice(s).");
                    Ok(())
                }
                CacheAction::Clear {
                    kind,
                    instrument,
                    confirm,
                } => run_cache_clear(&store, EntryFilter { kind, instrument }, confirm),
                CacheAction::Export {
                    dir,
                    kind,
                    instrument,
                } => {
                    let report = store.export(&dir, &EntryFilter { kind, instrument })?;
                    println!(
                        "Exported {} entr(ies) to {} ({} skipped, {} failed)",
                        report.copied,
                        dir.display(),
                        report.skipped,
                        report.failed
                    );
                    Ok(())
                }
                CacheAction::Import { dir, replace } => {
                    let mode = if replace {
                        ImportMode::Replace
                    } else {
                        ImportMode::Merge
                    };
                    let report = store.import(&dir, mode)?;
                    println!(
                        "Imported {} entr(ies) from {} ({} skipped, {} failed)",
                        report.copied,
                        dir.display(),
                        report.skipped,
                        report.failed
                    );
                    Ok(())
                }
                CacheAction::Verify => run_cache_verify(&store),
            }
        }
    }
}

/// Explicit `--config`, else the first config file found, else defaults.
/// Environment overrides apply in every case; `--cache-dir` wins last.
fn load_config(explicit: Option<&Path>, cache_dir: Option<PathBuf>) -> Result<Config> {
    let found = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => default_config_paths().into_iter().find(|p| p.is_file()),
    };

    let mut config = match found {
        Some(path) => Config::from_file(&path)
            .with_context(|| format!("load config {}", path.display()))?,
        None => {
            let mut config = Config::default();
            config.apply_env();
            config
        }
    };
    if let Some(dir) = cache_dir {
        config.cache.root = dir;
    }
    Ok(config)
}

fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join("barvault").join("barvault.toml"));
    }
    paths.push(PathBuf::from("barvault.toml"));
    paths
}

fn run_fetch(
    config: &Config,
    instruments: &[String],
    start: &str,
    end: Option<&str>,
    adj: AdjustMode,
    workers: usize,
) -> Result<()> {
    let start_date = parse_date(start)?;
    let end_date = match end {
        Some(s) => parse_date(s)?,
        None => chrono::Local::now().date_naive(),
    };
    if start_date > end_date {
        bail!("--start {start_date} is after --end {end_date}");
    }

    let requests = instruments
        .iter()
        .map(|code| -> Result<SyncRequest> {
            Ok(SyncRequest {
                instrument: Instrument::parse(code)?,
                start: start_date,
                end: end_date,
                adj,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let engine = SyncEngine::from_config(config)?;
    let summary = sync_many(&engine, &requests, workers, &StdoutProgress)?;

    if summary.failed > 0 {
        for failure in &summary.errors {
            eprintln!("Error for {}: {}", failure.instrument, failure.error);
        }
        std::process::exit(1);
    }
    Ok(())
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    parse_compact_date(s).with_context(|| format!("invalid date '{s}' (expected YYYYMMDD or YYYY-MM-DD)"))
}

fn run_cache_status(store: &CacheStore) -> Result<()> {
    let report = store.report();
    println!("Cache root: {}", store.root().display());
    if report.total_entries == 0 {
        println!("Cache is empty.");
        return Ok(());
    }

    println!();
    println!("{:<24} {:>8}", "Kind", "Entries");
    println!("{}", "-".repeat(33));
    for (kind, count) in &report.counts_by_kind {
        println!("{:<24} {:>8}", kind.as_str(), count);
    }
    println!("{}", "-".repeat(33));
    println!("{:<24} {:>8}", "Total", report.total_entries);

    println!();
    println!("Size:         {}", format_size(report.total_size));
    if let Some(budget) = store.config().max_bytes() {
        println!("Budget:       {}", format_size(budget));
    }
    println!("Instruments:  {}", report.instrument_count);
    println!(
        "Complete:     {} ({} incomplete, {} best effort)",
        report.complete_count, report.incomplete_count, report.best_effort_count
    );
    if let Some(ages) = &report.age_stats {
        println!(
            "Updated:      {} to {}",
            ages.oldest_update.format("%Y-%m-%d %H:%M"),
            ages.newest_update.format("%Y-%m-%d %H:%M")
        );
        println!("Mean age:     {:.1} h", ages.mean_age_hours);
        println!(
            "Least recent: {}",
            ages.least_recent_access.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

fn run_cache_evict(store: &CacheStore, max_mb: Option<u64>) -> Result<()> {
    let Some(budget) = max_mb
        .map(|mb| mb * 1024 * 1024)
        .or_else(|| store.config().max_bytes())
    else {
        bail!("no size budget: pass --max-mb or set cache.max_size_mb");
    };

    let report = store.evict_to_budget(budget)?;
    println!(
        "Evicted {} range slice(s), freed {} ({} remaining)",
        report.removed,
        format_size(report.freed_bytes),
        format_size(report.remaining_bytes)
    );
    if !report.budget_met {
        println!("Budget not met: permanent entries alone exceed {}", format_size(budget));
    }
    Ok(())
}

fn run_cache_clear(store: &CacheStore, filter: EntryFilter, confirm: bool) -> Result<()> {
    let matching: Vec<_> = store
        .entries()
        .into_iter()
        .filter(|e| filter.matches(e))
        .collect();
    if matching.is_empty() {
        println!("No matching entries.");
        return Ok(());
    }

    println!("Found {} matching entr(ies):", matching.len());
    for entry in &matching {
        println!(
            "  {:<22} {} ({})",
            entry.kind.as_str(),
            entry.key,
            format_size(entry.size_bytes)
        );
    }

    if !confirm {
        println!();
        println!("Dry run: pass --confirm to actually delete.");
        return Ok(());
    }

    let removed = store.clear(&filter)?;
    println!("Done. Removed {removed} entr(ies).");
    Ok(())
}

fn run_cache_verify(store: &CacheStore) -> Result<()> {
    let report = store.verify();
    println!("Checked {} entr(ies), {} healthy", report.checked, report.healthy);

    let problems = [
        ("missing blob", &report.missing_blob),
        ("unreadable", &report.unreadable),
        ("duplicate dates", &report.duplicate_dates),
        ("row count mismatch", &report.row_count_mismatch),
        ("hash mismatch", &report.hash_mismatch),
    ];
    for (label, keys) in problems {
        for key in keys {
            println!("  {label}: {key}");
        }
    }

    if !report.is_clean() {
        std::process::exit(1);
    }
    Ok(())
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
