//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use kernelsync_core::{ProgressReporter, SyncOutcome, run_sync, summarize_state};
use kernelsync_kernel::KernelClient;
use kernelsync_shared::{
    AppConfig, InvalidOrderPolicy, PipelineKind, SyncConfig, init_config, load_config,
};
use kernelsync_storage::Storage;
use tracing::info;
use url::Url;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// kernelsync: keep the website catalog in step with the kernel.
#[derive(Parser)]
#[command(
    name = "kernelsync",
    version,
    about = "Incrementally sync journals, issues, documents and renditions from the kernel.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

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
    /// Run one incremental sync.
    Sync {
        /// Target database path (overrides `[storage] db_path`).
        #[arg(long, env = "KERNELSYNC_DB")]
        db: Option<PathBuf>,

        /// Kernel base URL (overrides `[kernel] base_url`).
        #[arg(long, env = "KERNELSYNC_KERNEL_URL")]
        kernel_url: Option<String>,

        /// Fail the run on an invalid ordering token instead of skipping the document.
        #[arg(long)]
        abort_on_invalid_order: bool,
    },

    /// Show the persisted sync state.
    State {
        /// Target database path (overrides `[storage] db_path`).
        #[arg(long, env = "KERNELSYNC_DB")]
        db: Option<PathBuf>,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize default config at ~/.kernelsync/kernelsync.toml.
    Init,
    /// Show the current configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing subscriber based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "kernelsync=info",
        1 => "kernelsync=debug",
        _ => "kernelsync=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Route the parsed CLI command to its handler.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Sync {
            db,
            kernel_url,
            abort_on_invalid_order,
        } => cmd_sync(db, kernel_url.as_deref(), abort_on_invalid_order).await,
        Command::State { db } => cmd_state(db).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

// ---------------------------------------------------------------------------
// Command implementations
// ---------------------------------------------------------------------------

fn db_path(config: &AppConfig, db: Option<PathBuf>) -> PathBuf {
    db.unwrap_or_else(|| PathBuf::from(&config.storage.db_path))
}

async fn cmd_sync(
    db: Option<PathBuf>,
    kernel_url: Option<&str>,
    abort_on_invalid_order: bool,
) -> Result<()> {
    let config = load_config()?;
    let mut sync_config = SyncConfig::try_from(&config)?;
    if let Some(raw) = kernel_url {
        sync_config.kernel_url =
            Url::parse(raw).map_err(|e| eyre!("invalid kernel URL '{raw}': {e}"))?;
    }
    if abort_on_invalid_order {
        sync_config.invalid_order = InvalidOrderPolicy::Abort;
    }

    let path = db_path(&config, db);
    info!(db = %path.display(), kernel = %sync_config.kernel_url, "starting sync");

    let storage = Storage::open(&path).await?;
    let client = KernelClient::new(&sync_config)?;

    let reporter = CliProgress::new();
    let outcome = match run_sync(&sync_config, &storage, &client, &reporter).await {
        Ok(outcome) => outcome,
        Err(e) => {
            reporter.spinner.finish_and_clear();
            return Err(e.into());
        }
    };

    println!();
    println!("  Sync complete!");
    println!("  Run:       {}", outcome.run_id);
    println!("  Events:    {}", outcome.events);
    println!("  Journals:  {}", outcome.journals_registered);
    for kind in PipelineKind::ALL {
        if let Some(report) = outcome.pipeline(kind) {
            println!(
                "  {:<10} {} registered, {} orphaned, {} skipped",
                format!("{kind}:"),
                report.registered,
                report.orphans.len(),
                report.skipped
            );
        }
    }
    println!(
        "  Cursor:    {}",
        outcome.cursor.as_deref().unwrap_or("(none)")
    );
    println!(
        "  Time:      {:.1}s",
        outcome.elapsed_ms as f64 / 1000.0
    );
    println!();

    Ok(())
}

async fn cmd_state(db: Option<PathBuf>) -> Result<()> {
    let config = load_config()?;
    let path = db_path(&config, db);
    let storage = Storage::open(&path).await?;

    let summary = summarize_state(&storage).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if let Some(run) = storage.last_sync_run().await? {
        println!(
            "last run {} ({}) started {}",
            run.id, run.status, run.started_at
        );
    }
    Ok(())
}

/// Progress reporter that drives an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn candidate_processed(&self, kind: PipelineKind, member_id: &str, current: usize, total: usize) {
        self.spinner
            .set_message(format!("Registering {kind} [{current}/{total}] {member_id}"));
    }

    fn done(&self, _outcome: &SyncOutcome) {
        self.spinner.finish_and_clear();
    }
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
