//! kestrel - taxonomy search for species name lists
//!
//! ```bash
//! kestrel search --input names.csv --output-dir results/ --threads 8
//! kestrel escalate --output-dir results/ --browser firefox
//! kestrel init-config
//! ```

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use kestrel_common::config::{
    default_config_path, load_config, resolve_config_path, write_toml_config, BrowserBackend,
    KestrelConfig,
};
use kestrel_common::logging::init_tracing;
use kestrel_common::SourceId;
use kestrel_search::escalation::{build_backend, EscalationStage};
use kestrel_search::store::{OutputPaths, DEFAULT_MATCHED_FILE};
use kestrel_search::workflow::effective_concurrency;
use kestrel_search::{PipelineOptions, SearchPipeline};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "kestrel", version)]
#[command(about = "Resolve species names to taxonomies from several taxonomy sources")]
struct Cli {
    /// Configuration file (default: $KESTREL_CONFIG, then the user config dir)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve every unprocessed name in the input file
    Search(SearchArgs),
    /// Re-run the web search fallback over the missed store only
    Escalate(EscalateArgs),
    /// Write a configuration file with default settings
    InitConfig {
        /// Destination (default: the user config dir)
        path: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct OutputArgs {
    /// Directory holding the output stores
    #[arg(long, default_value = ".", value_name = "DIR")]
    output_dir: PathBuf,

    /// Matched store file name, relative to the output directory
    #[arg(long, short, default_value = DEFAULT_MATCHED_FILE, value_name = "FILE")]
    output: PathBuf,
}

impl OutputArgs {
    fn paths(&self) -> OutputPaths {
        OutputPaths::for_matched(self.output_dir.join(&self.output))
    }
}

#[derive(Args, Debug)]
struct SearchArgs {
    /// Cleaned name list (`Query,SearchTerm[,Type]`)
    #[arg(long, short, value_name = "FILE")]
    input: PathBuf,

    #[command(flatten)]
    output: OutputArgs,

    /// Worker count, clamped to the available cores
    #[arg(long, short)]
    threads: Option<usize>,

    /// Escalation browser backend: http, chrome or firefox
    #[arg(long)]
    browser: Option<BrowserBackend>,

    /// Skip the web search fallback
    #[arg(long)]
    no_escalation: bool,

    /// Do not retry multi-word misses with leading words dropped
    #[arg(long)]
    no_relax: bool,

    /// API key for one source, as SOURCE=KEY (repeatable)
    #[arg(long = "api-key", value_name = "SOURCE=KEY", value_parser = parse_api_key)]
    api_keys: Vec<(SourceId, String)>,
}

#[derive(Args, Debug)]
struct EscalateArgs {
    #[command(flatten)]
    output: OutputArgs,

    /// Escalation browser backend: http, chrome or firefox
    #[arg(long)]
    browser: Option<BrowserBackend>,
}

fn parse_api_key(raw: &str) -> std::result::Result<(SourceId, String), String> {
    let (source, key) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected SOURCE=KEY, got '{}'", raw))?;
    Ok((source.parse()?, key.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = resolve_config_path(cli.config.as_deref());
    let mut config = load_config(config_path.as_deref()).context("Failed to load configuration")?;

    if let Command::InitConfig { path } = &cli.command {
        return init_config(path.as_deref(), &config);
    }

    init_tracing(&config.logging).context("Failed to initialise logging")?;
    info!(version = env!("CARGO_PKG_VERSION"), "kestrel starting");
    if let Some(path) = &config_path {
        info!(path = %path.display(), "Configuration loaded");
    }

    let cancel = CancellationToken::new();
    spawn_ctrl_c_handler(cancel.clone());

    match cli.command {
        Command::Search(args) => search(args, &mut config, cancel).await,
        Command::Escalate(args) => escalate(args, &mut config, cancel).await,
        Command::InitConfig { .. } => Ok(()),
    }
}

fn spawn_ctrl_c_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight lookups");
            cancel.cancel();
        }
    });
}

async fn search(args: SearchArgs, config: &mut KestrelConfig, cancel: CancellationToken) -> Result<()> {
    if let Some(threads) = args.threads {
        config.search.threads = Some(threads);
    }
    if args.no_relax {
        config.search.relax_terms = false;
    }
    if args.no_escalation {
        config.escalation.enabled = false;
    }
    if let Some(browser) = args.browser {
        config.escalation.backend = browser;
    }

    let options = PipelineOptions {
        input: args.input,
        paths: args.output.paths(),
        concurrency: effective_concurrency(config.search.threads),
        progress_interval: config.search.progress_interval,
    };
    let cli_keys: HashMap<SourceId, String> = args.api_keys.into_iter().collect();

    let pipeline = SearchPipeline::from_config(options, config, &cli_keys, cancel)
        .context("Failed to set up the search pipeline")?;
    let summary = pipeline.run().await.context("Search run failed")?;

    println!(
        "matched {}, missed {}, escalated {}, unresolved {}, rejected {} ({} already done)",
        summary.matched,
        summary.missed,
        summary.escalated,
        summary.unresolved,
        summary.rejected,
        summary.previously_done
    );
    if summary.cancelled {
        println!("run interrupted; re-run the same command to resume");
    }
    Ok(())
}

async fn escalate(args: EscalateArgs, config: &mut KestrelConfig, cancel: CancellationToken) -> Result<()> {
    if let Some(browser) = args.browser {
        config.escalation.backend = browser;
    }
    let backend = build_backend(&config.escalation).context("Failed to set up search backend")?;
    let stage = EscalationStage::new(backend)
        .with_concurrency(config.escalation.concurrency)
        .with_timeout(Duration::from_secs(config.escalation.timeout_secs))
        .with_cancel(cancel);

    let report = stage
        .escalate(&args.output.paths())
        .await
        .context("Escalation failed")?;
    println!(
        "escalated {} of {}, unresolved {}",
        report.newly_matched, report.attempted, report.still_unresolved
    );
    Ok(())
}

fn init_config(path: Option<&Path>, config: &KestrelConfig) -> Result<()> {
    let path = path
        .map(Path::to_path_buf)
        .or_else(default_config_path)
        .context("No configuration directory on this system; pass a path")?;
    if path.exists() {
        anyhow::bail!("{} already exists", path.display());
    }
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    write_toml_config(config, &path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("wrote {}", path.display());
    Ok(())
}
