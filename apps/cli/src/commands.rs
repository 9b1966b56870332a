//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use gridharvest_core::{
    ProgressReporter, RunConfig, RunSummary, SilentProgress, StatusReport, rebuild_cache,
    run_acquisition, status, verify_cache,
};
use gridharvest_fetcher::{HttpUpstream, StopSignal, TokioSleeper};
use gridharvest_shared::{
    AppConfig, ResourceKind, init_config, load_config, load_config_from, read_api_key,
};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// GridHarvest: resumable, consensus-checked bulk acquisition of gridded records.
#[derive(Parser)]
#[command(
    name = "gridharvest",
    version,
    about = "Fetch per-coordinate records for every cell of a spatial mask, validated and cached.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (defaults to ~/.gridharvest/gridharvest.toml).
    #[arg(long, global = true, env = "GRIDHARVEST_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Acquire every required record that is not cached yet.
    Run {
        #[command(flatten)]
        grid: GridArgs,

        #[command(flatten)]
        cache: CacheArgs,

        #[command(flatten)]
        fetch: FetchArgs,

        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show required/cached/pending counts per kind without fetching.
    Status {
        #[command(flatten)]
        grid: GridArgs,

        #[command(flatten)]
        cache: CacheArgs,

        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Regenerate the cache log from the payload directory.
    Rebuild {
        #[command(flatten)]
        cache: CacheArgs,

        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List cached entries whose payload file is missing.
    Verify {
        #[command(flatten)]
        cache: CacheArgs,

        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Working-set selection flags.
#[derive(Args, Debug, Default)]
pub(crate) struct GridArgs {
    /// Mask grid (ESRI ASCII).
    #[arg(long)]
    pub mask: Option<String>,

    /// Region grid restricting the mask.
    #[arg(long)]
    pub region: Option<String>,

    /// Keep every k-th row and column.
    #[arg(long)]
    pub downsample: Option<usize>,

    /// Record kinds, e.g. `siteInfo,species:8` (repeatable).
    #[arg(long = "kind", value_delimiter = ',')]
    pub kinds: Vec<ResourceKind>,
}

/// Cache location flags.
#[derive(Args, Debug, Default)]
pub(crate) struct CacheArgs {
    /// Payload directory.
    #[arg(long)]
    pub data_dir: Option<String>,

    /// Cache log file.
    #[arg(long)]
    pub log_file: Option<String>,

    /// Do not rebuild a missing cache log from the payload directory.
    #[arg(long)]
    pub no_auto_rebuild: bool,
}

/// Fetching flags.
#[derive(Args, Debug, Default)]
pub(crate) struct FetchArgs {
    /// Concurrent fetch workers.
    #[arg(long, short = 'w')]
    pub workers: Option<usize>,

    /// Fetches per consensus round (N).
    #[arg(long)]
    pub samples: Option<u32>,

    /// Matching signatures needed to accept (q).
    #[arg(long)]
    pub quorum: Option<u32>,

    /// Consensus rounds before an item is rejected.
    #[arg(long)]
    pub rounds: Option<u32>,

    /// Attempts per request on transient errors.
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Backoff base in milliseconds.
    #[arg(long)]
    pub base_delay_ms: Option<u64>,

    /// Per-request timeout in seconds.
    #[arg(long)]
    pub timeout: Option<u64>,
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Flag overrides
// ---------------------------------------------------------------------------

impl GridArgs {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(mask) = &self.mask {
            config.grid.mask_path = mask.clone();
        }
        if let Some(region) = &self.region {
            config.grid.region_path = Some(region.clone());
        }
        if let Some(k) = self.downsample {
            config.grid.downsample = k;
        }
        if !self.kinds.is_empty() {
            config.resources.kinds = self.kinds.clone();
        }
    }
}

impl CacheArgs {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(dir) = &self.data_dir {
            config.cache.data_dir = dir.clone();
        }
        if let Some(log) = &self.log_file {
            config.cache.log_file = log.clone();
        }
        if self.no_auto_rebuild {
            config.cache.auto_rebuild = false;
        }
    }
}

impl FetchArgs {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(w) = self.workers {
            config.pool.workers = w;
        }
        if let Some(n) = self.samples {
            config.consensus.samples_per_round = n;
        }
        if let Some(q) = self.quorum {
            config.consensus.quorum = q;
        }
        if let Some(r) = self.rounds {
            config.consensus.round_limit = r;
        }
        if let Some(a) = self.max_attempts {
            config.retry.max_attempts = a;
        }
        if let Some(ms) = self.base_delay_ms {
            config.retry.base_delay_ms = ms;
        }
        if let Some(secs) = self.timeout {
            config.upstream.timeout_secs = secs;
        }
    }
}

fn resolve_config(path: Option<&Path>) -> Result<AppConfig> {
    let config = match path {
        Some(p) => load_config_from(p)?,
        None => load_config()?,
    };
    Ok(config)
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags. Logs go to stderr so `--json`
/// output on stdout stays machine-readable.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "gridharvest=info",
        1 => "gridharvest=debug",
        _ => "gridharvest=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Run {
            grid,
            cache,
            fetch,
            json,
        } => {
            let mut config = resolve_config(config_path)?;
            grid.apply(&mut config);
            cache.apply(&mut config);
            fetch.apply(&mut config);
            cmd_run(config, json).await
        }
        Command::Status { grid, cache, json } => {
            let mut config = resolve_config(config_path)?;
            grid.apply(&mut config);
            cache.apply(&mut config);
            cmd_status(config, json)
        }
        Command::Rebuild { cache, json } => {
            let mut config = resolve_config(config_path)?;
            cache.apply(&mut config);
            cmd_rebuild(config, json)
        }
        Command::Verify { cache, json } => {
            let mut config = resolve_config(config_path)?;
            cache.apply(&mut config);
            cmd_verify(config, json)
        }
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(config_path),
        },
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(config: AppConfig, json: bool) -> Result<()> {
    config.validate()?;
    // Fail before any work if the key is missing.
    let api_key = read_api_key(&config.upstream)?;
    let upstream = Arc::new(HttpUpstream::new(&config.upstream, api_key)?);

    let run_config = RunConfig::from(&config);
    info!(
        mask = %run_config.mask_path.display(),
        workers = run_config.workers,
        downsample = run_config.downsample,
        "starting acquisition"
    );

    let stop = StopSignal::new();
    spawn_interrupt_handler(stop.clone());

    let summary = if json {
        run_acquisition(
            &run_config,
            upstream,
            Arc::new(TokioSleeper),
            stop,
            &SilentProgress,
        )
        .await?
    } else {
        let progress = CliProgress::new();
        run_acquisition(&run_config, upstream, Arc::new(TokioSleeper), stop, &progress).await?
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_run_summary(&summary);
    }

    if !summary.failed.is_empty() {
        return Err(eyre!(
            "{} item(s) failed; they stay uncached and will be retried on the next run",
            summary.failed.len()
        ));
    }
    if summary.abandoned > 0 {
        return Err(eyre!(
            "interrupted with {} item(s) not attempted; re-run to resume",
            summary.abandoned
        ));
    }
    Ok(())
}

/// First Ctrl-C stops dispatch and lets in-flight items finish; a second one
/// exits immediately.
fn spawn_interrupt_handler(stop: StopSignal) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("interrupt received, finishing in-flight items (Ctrl-C again to abort)");
        stop.stop();
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(130);
        }
    });
}

fn print_run_summary(summary: &RunSummary) {
    println!();
    println!("  Acquisition finished");
    if let Some(n) = summary.rebuilt_entries {
        println!("  Log rebuilt:    {n} entries");
    }
    println!("  Required:       {}", summary.required);
    println!("  Already cached: {}", summary.already_cached);
    println!("  Succeeded:      {}", summary.succeeded);
    println!("  Failed:         {}", summary.failed.len());
    if summary.abandoned > 0 {
        println!("  Not attempted:  {}", summary.abandoned);
    }
    println!("  Cache entries:  {}", summary.cache_entries);
    println!("  Elapsed:        {:.1}s", summary.elapsed_secs);

    const SHOWN: usize = 20;
    if !summary.failed.is_empty() {
        println!();
        for failure in summary.failed.iter().take(SHOWN) {
            println!(
                "  {:?} {}: {}",
                failure.kind, failure.entry, failure.message
            );
        }
        if summary.failed.len() > SHOWN {
            println!("  ... and {} more", summary.failed.len() - SHOWN);
        }
    }
    println!();
}

fn cmd_status(config: AppConfig, json: bool) -> Result<()> {
    config.validate()?;
    let report: StatusReport = status(&RunConfig::from(&config))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!();
    if let Some(n) = report.rebuilt_entries {
        println!("  Log rebuilt from storage: {n} entries");
    }
    println!("  Coordinates: {}", report.coordinates);
    println!();
    println!("  {:<16} {:>10} {:>10} {:>10}", "kind", "required", "cached", "pending");
    for k in &report.by_kind {
        println!(
            "  {:<16} {:>10} {:>10} {:>10}",
            k.kind, k.required, k.cached, k.pending
        );
    }
    println!(
        "  {:<16} {:>10} {:>10} {:>10}",
        "total", report.required, report.cached, report.pending
    );
    if report.extraneous > 0 {
        println!();
        println!("  {} cached entries are outside the current working set", report.extraneous);
    }
    println!();
    Ok(())
}

fn cmd_rebuild(config: AppConfig, json: bool) -> Result<()> {
    let report = rebuild_cache(&RunConfig::from(&config))?;

    if json {
        let value = serde_json::json!({
            "entries": report.entries,
            "by_prefix": report.by_prefix,
            "skipped": report.skipped,
            "swept_temp": report.swept_temp,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("Cache log rebuilt: {} entries", report.entries);
    for (prefix, count) in &report.by_prefix {
        println!("  {prefix}: {count}");
    }
    if report.skipped > 0 {
        println!("  skipped {} non-payload file(s)", report.skipped);
    }
    if report.swept_temp > 0 {
        println!("  removed {} stale temp file(s)", report.swept_temp);
    }
    Ok(())
}

fn cmd_verify(config: AppConfig, json: bool) -> Result<()> {
    let report = verify_cache(&RunConfig::from(&config))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if report.missing.is_empty() {
        println!("All {} cached entries have payloads.", report.entries);
    } else {
        for name in &report.missing {
            println!("{name}");
        }
    }

    if report.missing.is_empty() {
        Ok(())
    } else {
        Err(eyre!(
            "{} of {} cached entries have no payload; run `gridharvest rebuild` to resync",
            report.missing.len(),
            report.entries
        ))
    }
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(path: Option<&Path>) -> Result<()> {
    let config = resolve_config(path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Progress display
// ---------------------------------------------------------------------------

struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
            bar.set_style(
                style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
            );
        }
        bar.enable_steady_tick(Duration::from_millis(80));
        Self { bar }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.bar.set_message(name.to_string());
    }

    fn items_planned(&self, total: usize) {
        self.bar.set_length(total as u64);
        self.bar.set_position(0);
        if let Ok(style) = ProgressStyle::with_template(
            "{spinner:.cyan} [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        ) {
            self.bar.set_style(style.progress_chars("=> "));
        }
    }

    fn item_finished(&self, done: usize, _total: usize, entry: &str, succeeded: bool) {
        self.bar.set_position(done as u64);
        if succeeded {
            self.bar.set_message(entry.to_string());
        } else {
            self.bar.set_message(format!("failed: {entry}"));
        }
    }

    fn done(&self, _summary: &RunSummary) {
        self.bar.finish_and_clear();
    }
}
