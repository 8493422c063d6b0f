//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tgkb_core::{
    CancellationToken, EnrichOptions, Enricher, ProgressReporter, StageOutcome, analyze_stage,
    convert_stage, render_stage, run_pipeline,
};
use tgkb_markdown::RenderOptions;
use tgkb_openrouter::OpenRouterClient;
use tgkb_shared::{
    AppConfig, LinkStyle, OutputMeta, PostRecord, RunSummary, api_key, init_config, load_config,
    load_config_from,
};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// tgkb: turn Telegram channel exports into a Markdown knowledge base.
#[derive(Parser)]
#[command(
    name = "tgkb",
    version,
    about = "Turn Telegram channel CSV exports into one titled Markdown knowledge base.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ~/.tgkb/tgkb.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Candidate models in fallback order, comma-separated.
    #[arg(long, env = "TGKB_MODELS", value_delimiter = ',', global = true)]
    pub models: Vec<String>,

    /// Directory with the CSV exports.
    #[arg(long, global = true)]
    pub input_dir: Option<PathBuf>,

    /// Directory for the intermediate JSON Lines files.
    #[arg(long, global = true)]
    pub work_dir: Option<PathBuf>,

    /// Directory for the Markdown output and run report.
    #[arg(long, global = true)]
    pub output_dir: Option<PathBuf>,

    /// Link style of the index: anchor (default from config) or wikilink.
    #[arg(long, global = true)]
    pub link_style: Option<LinkStyleArg>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Stage to run. Without one, all three stages run.
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub(crate) enum LinkStyleArg {
    Anchor,
    Wikilink,
}

impl From<LinkStyleArg> for LinkStyle {
    fn from(arg: LinkStyleArg) -> Self {
        match arg {
            LinkStyleArg::Anchor => LinkStyle::Anchor,
            LinkStyleArg::Wikilink => LinkStyle::Wikilink,
        }
    }
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run convert, analyze and render back to back.
    Run {
        /// Only enrich and render the first N posts.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Combine the CSV exports into combined_posts.jsonl.
    Convert,

    /// Generate titles into analyzed_posts.jsonl.
    Analyze {
        /// Only enrich the first N posts; the rest stay pending.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Render analyzed_posts.jsonl to Markdown.
    Render,

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
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "tgkb=info",
        1 => "tgkb=debug",
        _ => "tgkb=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

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
    match cli.command {
        None => cmd_run(&cli, None).await,
        Some(Command::Run { limit }) => cmd_run(&cli, limit).await,
        Some(Command::Convert) => cmd_convert(&cli),
        Some(Command::Analyze { limit }) => cmd_analyze(&cli, limit).await,
        Some(Command::Render) => cmd_render(&cli),
        Some(Command::Config { ref action }) => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(&cli),
        },
    }
}

/// Config file (or defaults) with CLI and environment overrides applied.
fn resolve_config(cli: &Cli) -> Result<AppConfig> {
    let mut config = match &cli.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };

    config.override_models(&cli.models);
    if let Some(dir) = &cli.input_dir {
        config.paths.input_dir = dir.clone();
    }
    if let Some(dir) = &cli.work_dir {
        config.paths.work_dir = dir.clone();
    }
    if let Some(dir) = &cli.output_dir {
        config.paths.output_dir = dir.clone();
    }
    if let Some(style) = cli.link_style {
        config.render.link_style = style.into();
    }

    config.validate()?;
    Ok(config)
}

/// Fail fast on a missing key, then build the enricher.
fn build_enricher(config: &AppConfig) -> Result<Enricher> {
    let key = api_key(config)?;
    let client = OpenRouterClient::new(&config.openrouter, key, config.enrichment.attempt_timeout())?;

    info!(
        endpoint = %client.endpoint(),
        models = ?config.openrouter.models,
        "OpenRouter client ready"
    );

    Ok(Enricher::new(
        Arc::new(client),
        config.openrouter.models.clone(),
        &config.enrichment,
    ))
}

fn render_options(config: &AppConfig) -> RenderOptions {
    RenderOptions {
        generated_at: Some(chrono::Local::now().format("%Y-%m-%d %H:%M").to_string()),
        ..RenderOptions::from(&config.render)
    }
}

/// Token cancelled on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let handle = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            handle.cancel();
        }
    });
    token
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(cli: &Cli, limit: Option<usize>) -> Result<()> {
    let config = resolve_config(cli)?;
    let enricher = build_enricher(&config)?;
    let opts = EnrichOptions {
        limit,
        ..EnrichOptions::from(&config.enrichment)
    };

    info!(
        input = %config.paths.input_dir.display(),
        output = %config.paths.output_dir.display(),
        limit = ?limit,
        "running full pipeline"
    );

    let reporter = CliProgress::new();
    let token = cancel_on_ctrl_c();
    let result = run_pipeline(
        &config,
        &enricher,
        opts,
        &render_options(&config),
        &token,
        &reporter,
    )
    .await;
    reporter.clear();

    let report = result?;
    print_summary("Pipeline complete", &report.summary, &report.outputs, &config.paths.output_dir);
    println!("  Run ID:    {}", report.run_id);
    println!();
    Ok(())
}

fn cmd_convert(cli: &Cli) -> Result<()> {
    let config = resolve_config(cli)?;
    let reporter = CliProgress::new();
    let result = convert_stage(&config.paths, &reporter);
    reporter.clear();

    let StageOutcome { summary, outputs } = result?;
    print_summary("Convert complete", &summary, &outputs, &config.paths.work_dir);
    Ok(())
}

async fn cmd_analyze(cli: &Cli, limit: Option<usize>) -> Result<()> {
    let config = resolve_config(cli)?;
    let enricher = build_enricher(&config)?;
    let opts = EnrichOptions {
        limit,
        ..EnrichOptions::from(&config.enrichment)
    };

    let reporter = CliProgress::new();
    let token = cancel_on_ctrl_c();
    let result = analyze_stage(&config.paths, &enricher, opts, &token, &reporter).await;
    reporter.clear();

    let StageOutcome { summary, outputs } = result?;
    print_summary("Analyze complete", &summary, &outputs, &config.paths.work_dir);
    Ok(())
}

fn cmd_render(cli: &Cli) -> Result<()> {
    let config = resolve_config(cli)?;
    let reporter = CliProgress::new();
    let result = render_stage(&config.paths, &render_options(&config), &reporter);
    reporter.clear();

    let StageOutcome { summary, outputs } = result?;
    print_summary("Render complete", &summary, &outputs, &config.paths.output_dir);
    Ok(())
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(cli: &Cli) -> Result<()> {
    let config = resolve_config(cli)?;
    let toml_str = toml::to_string_pretty(&config).map_err(|e| eyre!("cannot render config: {e}"))?;
    println!("{toml_str}");
    Ok(())
}

fn print_summary(heading: &str, summary: &RunSummary, outputs: &[OutputMeta], dir: &Path) {
    println!();
    println!("  {heading}");
    println!("  Rows:      {}", summary.total);
    println!("  Posts:     {}", summary.normalized);
    println!("  Skipped:   {}", summary.skipped);
    println!("  Titled:    {}", summary.enrich_success);
    println!("  Failed:    {}", summary.enrich_failed);
    for output in outputs {
        println!(
            "  Wrote:     {} ({} bytes)",
            dir.join(&output.filename).display(),
            output.size_bytes
        );
    }
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
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

    fn clear(&self) {
        if !self.spinner.is_finished() {
            self.spinner.finish_and_clear();
        }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn record_enriched(&self, current: usize, total: usize, record: &PostRecord) {
        self.spinner.set_message(format!(
            "Titling [{current}/{total}] {} #{} ({})",
            record.source,
            record.row,
            record.enrichment_status.as_str()
        ));
    }

    fn done(&self, _summary: &RunSummary) {
        self.spinner.finish_and_clear();
    }
}
