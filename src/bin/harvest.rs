use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use cnpj_harvest::checkpoint::CheckpointManager;
use cnpj_harvest::config::HarvestConfig;
use cnpj_harvest::enumerator::KeySpace;
use cnpj_harvest::identifier;
use cnpj_harvest::logging::{init_tracing, DEFAULT_FILTER};
use cnpj_harvest::pipeline::{Pipeline, PipelineOptions};
use cnpj_harvest::rate_limiter::RateLimiter;
use cnpj_harvest::reference::{self, CsvReferenceData, ReferenceFilter};
use cnpj_harvest::resolver::Resolver;
use cnpj_harvest::storage::{ExistingFilter, MemoryStorage, Storage};
use cnpj_harvest::util::db::Db;
use cnpj_harvest::util::env;

#[derive(Parser, Debug)]
#[command(name = "harvest", version, about = "Resumable CNPJ collection over municipality × CNAE")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Narrows the key space; shared by the commands that enumerate it.
#[derive(clap::Args, Debug, Clone, Default)]
struct ScopeArgs {
    /// Only these states (UF), comma-separated
    #[arg(long, value_delimiter = ',')]
    state: Vec<String>,
    /// Only CNAE codes starting with these digits, comma-separated
    #[arg(long, value_delimiter = ',')]
    category_prefix: Vec<String>,
    /// Override LOCATIONS_CSV
    #[arg(long)]
    locations: Option<PathBuf>,
    /// Override CATEGORIES_CSV
    #[arg(long)]
    categories: Option<PathBuf>,
    /// Override HARVEST_CHECKPOINT_PATH
    #[arg(long)]
    checkpoint: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Enumerate and resolve every unprocessed key, resuming from the checkpoint
    Collect {
        #[command(flatten)]
        scope: ScopeArgs,
        /// Override HARVEST_WORKERS
        #[arg(long)]
        workers: Option<usize>,
        /// Override HARVEST_RPS
        #[arg(long)]
        rps: Option<f64>,
        /// Override HARVEST_BATCH_SIZE
        #[arg(long)]
        batch_size: Option<usize>,
        /// Ignore any existing checkpoint and start over
        #[arg(long, default_value_t = false)]
        fresh: bool,
        /// Keep results in memory instead of writing to Postgres
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Show checkpoint counters and remaining keys
    Status {
        #[command(flatten)]
        scope: ScopeArgs,
    },
    /// Check CNPJ check digits
    Validate {
        #[arg(required = true)]
        identifiers: Vec<String>,
    },
    /// Compute a valid CNPJ from an 8-digit root and a branch
    Generate {
        #[arg(long)]
        root: u32,
        #[arg(long, default_value_t = identifier::HEAD_OFFICE_BRANCH)]
        branch: u32,
    },
    /// Estimate remaining work and, with a database, how many entities exist
    Estimate {
        #[command(flatten)]
        scope: ScopeArgs,
        /// Also count stored entities (needs DATABASE_URL)
        #[arg(long, default_value_t = false)]
        db: bool,
    },
}

fn apply_scope(cfg: &mut HarvestConfig, scope: &ScopeArgs) {
    if let Some(p) = &scope.locations {
        cfg.locations_csv = p.clone();
    }
    if let Some(p) = &scope.categories {
        cfg.categories_csv = p.clone();
    }
    if let Some(p) = &scope.checkpoint {
        cfg.checkpoint_path = p.clone();
    }
}

fn key_space(cfg: &HarvestConfig, scope: &ScopeArgs) -> Result<KeySpace> {
    let source = CsvReferenceData::new(&cfg.locations_csv, &cfg.categories_csv);
    let filter = ReferenceFilter {
        states: scope.state.clone(),
        category_prefixes: scope.category_prefix.clone(),
    };
    let (locations, categories) =
        reference::load(&source, &filter).context("loading reference data")?;
    info!(locations = locations.len(), categories = categories.len(), "reference data loaded");
    Ok(KeySpace::new(locations, categories))
}

/// `read_only` keeps the file untouched for the whole process.
async fn load_checkpoint(cfg: &HarvestConfig, fresh: bool, read_only: bool) -> Result<CheckpointManager> {
    CheckpointManager::open(&cfg.checkpoint_path, cfg.checkpoint_every, fresh, read_only)
        .await
        .with_context(|| {
            format!(
                "reading checkpoint {} (use --fresh to start over)",
                cfg.checkpoint_path.display()
            )
        })
}

async fn connect_db(cfg: &HarvestConfig) -> Result<Db> {
    let Some(url) = cfg.database_url.as_deref() else {
        bail!("DATABASE_URL (or DB_HOST/DB_USERNAME) is required; use --dry-run to skip storage");
    };
    Db::connect(url, cfg.db_max_connections).await
}

async fn wait_for_signal() -> bool {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        if let Ok(mut term) = signal(SignalKind::terminate()) {
            return tokio::select! {
                res = tokio::signal::ctrl_c() => res.is_ok(),
                _ = term.recv() => true,
            };
        }
    }
    tokio::signal::ctrl_c().await.is_ok()
}

/// First signal cancels; a second one exits immediately.
fn install_shutdown_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if !wait_for_signal().await {
            warn!(target: "shutdown", "failed to install signal handler");
            return;
        }
        warn!(target: "shutdown", "interrupt received; finishing in-flight work and saving checkpoint");
        cancel.cancel();
        if wait_for_signal().await {
            warn!(target: "shutdown", "second interrupt; exiting without final checkpoint");
            std::process::exit(130);
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    env::init_env();
    init_tracing(DEFAULT_FILTER)?;
    let cli = Cli::parse();
    let mut cfg = HarvestConfig::from_env();

    match cli.command {
        Commands::Collect {
            scope,
            workers,
            rps,
            batch_size,
            fresh,
            dry_run,
        } => {
            apply_scope(&mut cfg, &scope);
            if let Some(w) = workers {
                cfg.workers = w;
            }
            if let Some(r) = rps {
                cfg.rate_per_sec = r;
            }
            if let Some(b) = batch_size {
                cfg.batch_size = b;
            }
            cfg.validate()?;
            env::log_snapshot(
                "collect",
                &[
                    "HARVEST_WORKERS",
                    "HARVEST_RPS",
                    "PRIMARY_BASE_URL",
                    "PRIMARY_API_KEY",
                    "SECONDARY_BASE_URL",
                    "REGISTRY_BASE_URL",
                    "DATABASE_URL",
                ],
            );

            let space = key_space(&cfg, &scope)?;
            let checkpoint = Arc::new(load_checkpoint(&cfg, fresh, dry_run).await?);
            let storage: Arc<dyn Storage> = if dry_run {
                info!("dry run: results and checkpoint stay in memory");
                Arc::new(MemoryStorage::new())
            } else {
                Arc::new(connect_db(&cfg).await?)
            };
            let limiter = Arc::new(RateLimiter::new(cfg.burst, cfg.rate_per_sec));
            let resolver = Resolver::from_config(&cfg, limiter)?;
            if resolver.is_empty() {
                bail!("no resolution strategy configured");
            }

            let cancel = CancellationToken::new();
            install_shutdown_handler(cancel.clone());
            let summary = Pipeline::new(
                space,
                Arc::new(resolver),
                storage,
                checkpoint,
                PipelineOptions::from(&cfg),
            )
            .run(cancel)
            .await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Status { scope } => {
            apply_scope(&mut cfg, &scope);
            let space = key_space(&cfg, &scope)?;
            let checkpoint = load_checkpoint(&cfg, false, true).await?;
            let snap = checkpoint.snapshot();
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "checkpoint": cfg.checkpoint_path.display().to_string(),
                    "updated_at": snap.updated_at,
                    "counters": snap.counters,
                    "hit_rate": snap.counters.hit_rate(),
                    "last_key": snap.last_key.map(|k| k.to_string()),
                    "total_keys": space.len(),
                    "processed_keys": snap.processed_keys.len(),
                    "remaining_keys": space.remaining(&snap.processed_keys),
                }))?
            );
        }
        Commands::Validate { identifiers } => {
            let mut invalid = 0usize;
            for raw in &identifiers {
                match identifier::validate(raw) {
                    Ok(id) => println!("{raw}\tvalid\t{}", id.formatted()),
                    Err(err) => {
                        invalid += 1;
                        println!("{raw}\tinvalid\t{err}");
                    }
                }
            }
            if invalid > 0 {
                bail!("{invalid} of {} identifiers are invalid", identifiers.len());
            }
        }
        Commands::Generate { root, branch } => {
            let id = identifier::generate(root, branch)?;
            println!("{}\t{}", id.digits(), id.formatted());
        }
        Commands::Estimate { scope, db } => {
            apply_scope(&mut cfg, &scope);
            let space = key_space(&cfg, &scope)?;
            let checkpoint = load_checkpoint(&cfg, false, true).await?;
            let remaining = space.remaining(&checkpoint.processed_keys());
            // One call per key is the floor; fallbacks only add to it.
            let min_secs = remaining as f64 / cfg.rate_per_sec.max(f64::MIN_POSITIVE);
            let stored = if db {
                let db = connect_db(&cfg).await?;
                let filter = ExistingFilter {
                    location: None,
                    states: scope.state.clone(),
                    category_prefixes: scope.category_prefix.clone(),
                };
                Some(db.count_existing(&filter).await?)
            } else {
                None
            };
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "total_keys": space.len(),
                    "remaining_keys": remaining,
                    "rate_per_sec": cfg.rate_per_sec,
                    "min_duration": cnpj_harvest::progress::format_duration(min_secs),
                    "stored_entities": stored,
                }))?
            );
        }
    }
    Ok(())
}
