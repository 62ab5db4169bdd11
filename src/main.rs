use ahash::{HashMap, HashMapExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use weft::cli::{Cli, Commands, ConfigAction, ShardAction};
use weft::config::{try_parse_duration, Config, ConfigValidator};
use weft::embedding::create_provider;
use weft::error::{Result, WeftError};
use weft::retrieval::SearchHit;
use weft::source::{detect_changes, DocumentSource, FsDocumentSource};
use weft::storage::{format_size, ShardKey, ShardStore};
use weft::sync::{LoadReport, SyncOrchestrator};

fn main() -> Result<()> {
    let cli = Cli::parse_args();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Config { action } => cmd_config(cli.config, action),
        Commands::Shards { action } => {
            let config = load_config(cli.config, cli.profile)?;
            let vault = vault_root(cli.vault)?;
            cmd_shards(&config, &vault, action)
        }
        command => {
            let config = load_config(cli.config, cli.profile)?;
            let vault = vault_root(cli.vault)?;
            let runtime = tokio::runtime::Runtime::new().map_err(|e| WeftError::Io {
                source: e,
                context: "Failed to create tokio runtime".to_string(),
            })?;
            runtime.block_on(run(command, config, vault))
        }
    }
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default = if verbose { "weft=debug" } else { "weft=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(command: Commands, config: Config, vault: PathBuf) -> Result<()> {
    let rebuild = matches!(command, Commands::Index { rebuild: true });
    let source: Arc<FsDocumentSource> = Arc::new(FsDocumentSource::new(&vault)?);
    let provider = create_provider(&config.embedding)?;
    let store = ShardStore::open(&config, &vault)?;

    if rebuild {
        let removed = store.delete(ShardKey::for_identity(&provider.identity()).as_str())?;
        tracing::info!("Removed {} stored shard files before rebuilding", removed);
    }

    let (sync, report) =
        SyncOrchestrator::start(config, source.clone(), provider, store).await?;

    let result = match command {
        Commands::Index { .. } => {
            print_load_report(&report);
            sync.save_now().await.map(|saved| {
                if saved.any() {
                    println!("✓ Index saved (cache: {}, portable: {})", saved.cache, saved.portable);
                } else {
                    println!("⚠ Index could not be saved to either tier");
                }
            })
        }
        Commands::Watch { interval } => watch(&sync, source.as_ref(), &interval).await,
        Commands::Query { query, limit, json } => match sync.search(&query, limit).await {
            Ok(hits) => print_hits(&hits, json),
            Err(e) => Err(e),
        },
        Commands::Context {
            query,
            budget,
            limit,
            json,
        } => {
            let budget = budget.unwrap_or(sync.config().context.budget_chars);
            match sync.build_context_with_budget(&query, limit, budget).await {
                Ok(context) if json => to_json(&context).map(|s| println!("{}", s)),
                Ok(context) => {
                    println!("{}", context.text);
                    println!("\n---");
                    println!(
                        "{} of {} characters, {} documents:",
                        context.used_chars,
                        budget,
                        context.used_paths.len()
                    );
                    for path in &context.used_paths {
                        println!("  {}", path);
                    }
                    Ok(())
                }
                Err(e) => Err(e),
            }
        }
        Commands::Status { json } => match sync.status().await {
            Ok(status) if json => to_json(&status).map(|s| println!("{}", s)),
            Ok(status) => {
                println!("Weft Status");
                println!("===========");
                println!("\nVault:    {}", vault.display());
                println!("Model:    {}", status.identity);
                println!("Shard:    {}", status.shard);
                println!("Session:  {}", status.session);
                println!("\nDocuments: {}", status.engine.index.documents);
                println!("Chunks:    {}", status.engine.index.chunks);
                println!("Edges:     {}", status.engine.graph.edges);
                println!("Unresolved links: {}", status.engine.unresolved_links);
                if !status.quarantined.is_empty() {
                    println!("\nQuarantined: {}", status.quarantined.join(", "));
                }
                Ok(())
            }
            Err(e) => Err(e),
        },
        Commands::Shards { .. } | Commands::Config { .. } => Ok(()),
    };

    sync.shutdown().await?;
    result
}

/// Poll the vault for changes until ctrl-c
async fn watch(sync: &SyncOrchestrator, source: &dyn DocumentSource, interval: &str) -> Result<()> {
    let interval = try_parse_duration(interval).ok_or_else(|| WeftError::InvalidConfigValue {
        path: "--interval".to_string(),
        message: format!("expected a duration such as 500ms, 2s or 1m, got {:?}", interval),
    })?;

    let (_, mut known) = detect_changes(source, &HashMap::new())?;
    let mut ticker = tokio::time::interval(interval);
    println!("Watching for changes (ctrl-c to stop)");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\nStopping, saving index...");
                return Ok(());
            }
            _ = ticker.tick() => {
                let (events, current) = match detect_changes(source, &known) {
                    Ok(changes) => changes,
                    Err(e) => {
                        tracing::warn!("Failed to poll vault: {}", e);
                        continue;
                    }
                };
                known = current;
                for event in events {
                    sync.notify(event)?;
                }
            }
        }
    }
}

fn print_load_report(report: &LoadReport) {
    match report.tier {
        Some(tier) => println!("Loaded shard {} from {} tier", report.shard, tier),
        None => println!("Built shard {}", report.shard),
    }
    if report.rebuilt {
        println!("  Stored shard was unusable ({}), rebuilt", report.outcome.as_deref().unwrap_or("unknown"));
    }
    let scan = &report.scan;
    println!(
        "  {} documents: {} indexed, {} unchanged, {} restored, {} removed, {} failed",
        scan.scanned, scan.indexed, scan.skipped, scan.restored, scan.removed, scan.failed
    );
}

fn print_hits(hits: &[SearchHit], json: bool) -> Result<()> {
    if json {
        println!("{}", to_json(&hits)?);
        return Ok(());
    }
    if hits.is_empty() {
        println!("No results");
        return Ok(());
    }
    for (rank, hit) in hits.iter().enumerate() {
        println!("{:>2}. {} ({:.3})", rank + 1, hit.display_title(), hit.score);
        println!("    {}", hit.path);
        if let Some(excerpt) = &hit.excerpt {
            println!("    {}", excerpt);
        }
    }
    Ok(())
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value).map_err(|e| WeftError::Json {
        source: e,
        context: "Failed to serialize output".to_string(),
    })
}

fn cmd_shards(config: &Config, vault: &Path, action: ShardAction) -> Result<()> {
    let store = ShardStore::open(config, vault)?;
    match action {
        ShardAction::List => {
            let shards = store.list_shards()?;
            if shards.is_empty() {
                println!("No stored shards");
            }
            for shard in &shards {
                println!(
                    "{:<9} {:<48} {:>10}  dim {}{}",
                    shard.tier.to_string(),
                    shard.key,
                    format_size(shard.size),
                    shard
                        .dimension
                        .map(|d| d.to_string())
                        .unwrap_or_else(|| "?".to_string()),
                    if shard.slim == Some(true) { ", slim" } else { "" }
                );
            }
            println!("\nTotal: {}", format_size(store.disk_usage()?));
        }
        ShardAction::Prune => {
            let provider = create_provider(&config.embedding)?;
            let keep = ShardKey::for_identity(&provider.identity());
            let removed = store.prune(&keep)?;
            println!("✓ Removed {} stale shard files (kept {})", removed, keep);
        }
    }
    Ok(())
}

fn cmd_config(config_path: Option<PathBuf>, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = load_config(config_path, None)?;
            let toml = toml::to_string_pretty(&config)?;
            println!("{}", toml);
        }
        ConfigAction::Validate { file } => {
            let path = match file.or(config_path) {
                Some(path) => path,
                None => Config::default_path()?,
            };
            let config = Config::load(&path)?;
            ConfigValidator::validate(&config)?;
            println!("✓ Configuration is valid");
            println!("  Schema version: {}", config.meta.schema_version);
        }
        ConfigAction::Init { force } => {
            let path = match config_path {
                Some(path) => path,
                None => Config::default_path()?,
            };

            if path.exists() && !force {
                println!("Configuration file already exists at: {}", path.display());
                println!("Use --force to overwrite");
                return Ok(());
            }

            Config::default().save(&path)?;
            println!("✓ Configuration initialized at: {}", path.display());
        }
    }

    Ok(())
}

fn load_config(config_path: Option<PathBuf>, profile: Option<String>) -> Result<Config> {
    let path = match config_path {
        Some(path) => path,
        None => Config::default_path()?,
    };

    if !path.exists() {
        tracing::warn!("Config file not found, using defaults. Run 'weft config init' to create one.");
        let mut config = Config::default();
        config.apply_env_overrides();
        if let Some(profile) = profile {
            config.apply_profile(&profile)?;
        }
        ConfigValidator::validate(&config)?;
        return Ok(config);
    }

    match profile {
        Some(profile) => Config::load_with_profile(&path, &profile),
        None => Config::load(&path),
    }
}

fn vault_root(vault: Option<PathBuf>) -> Result<PathBuf> {
    match vault {
        Some(path) => Ok(path),
        None => std::env::current_dir().map_err(|e| WeftError::Io {
            source: e,
            context: "Failed to determine current directory".to_string(),
        }),
    }
}
