use std::process::ExitCode;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use shareloc_migrator::app::{App, DerivativeCheck, ProgressSink, RunReport, TracingSink};
use shareloc_migrator::artifact::HyphaArtifactClient;
use shareloc_migrator::catalog::{CatalogSource, load_catalog};
use shareloc_migrator::config::{ConfigLoader, Overrides, ResolvedConfig};
use shareloc_migrator::error::MigrateError;
use shareloc_migrator::logging;
use shareloc_migrator::manifest::HttpManifestFetcher;
use shareloc_migrator::migrator::{AbortReason, DatasetMigrator, MigratorSettings};
use shareloc_migrator::output::{JsonOutput, OutputMode};
use shareloc_migrator::scheduler::WorkerPool;
use shareloc_migrator::storage::HttpFileIndex;
use shareloc_migrator::transfer::{HttpTransport, RetryingTransfer};

type HttpApp = App<HttpManifestFetcher, HyphaArtifactClient, HttpFileIndex, HttpTransport>;

#[derive(Parser)]
#[command(name = "shareloc-migrate")]
#[command(about = "Migrate the ShareLoc.XYZ catalog into a Hypha artifact collection")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<String>,

    /// Log filter, e.g. `info` or `shareloc_migrator=debug`; defaults to RUST_LOG.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[arg(long, global = true)]
    log_file: Option<Utf8PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Migrate every catalog entry into the artifact collection")]
    Migrate(MigrateArgs),
    #[command(about = "Re-edit and re-commit every artifact of the collection")]
    Repair(RepairArgs),
    #[command(about = "Generate collection.json/collection.yaml from the catalog")]
    Summarize(SummarizeArgs),
}

#[derive(Args)]
struct MigrateArgs {
    /// Catalog file path or URL.
    #[arg(long)]
    catalog: Option<String>,

    #[arg(long)]
    skip_migrated: bool,

    #[arg(long)]
    concurrency: Option<usize>,

    /// (Re)create the parent collection before migrating.
    #[arg(long)]
    create_collection: bool,

    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct RepairArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct SummarizeArgs {
    #[arg(long, default_value = "collection.yaml")]
    catalog: String,

    #[arg(long, default_value = "dist")]
    output_dir: Utf8PathBuf,

    /// Listing URL of the converted-derivatives store.
    #[arg(long)]
    derivatives_prefix: Option<String>,

    /// Public prefix of converted objects; defaults to the listing URL.
    #[arg(long, requires = "derivatives_prefix")]
    derivatives_url: Option<String>,

    /// Download sources of unconverted derivatives into this directory.
    #[arg(long, requires = "derivatives_prefix")]
    stage_sources: Option<Utf8PathBuf>,

    #[arg(long)]
    json: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<MigrateError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &MigrateError) -> u8 {
    if error.is_configuration() {
        2
    } else if error.is_network() {
        3
    } else {
        1
    }
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();
    let _log_guard = logging::init(cli.log_level.as_deref(), cli.log_file.as_deref())?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .into_diagnostic()?;
    runtime.block_on(run_command(cli.config, cli.command))
}

async fn run_command(config_path: Option<String>, command: Commands) -> miette::Result<()> {
    match command {
        Commands::Migrate(args) => {
            let overrides = Overrides {
                catalog: args.catalog,
                concurrency: args.concurrency,
                skip_migrated: args.skip_migrated.then_some(true),
            };
            let config = ConfigLoader::resolve(config_path.as_deref(), overrides)?;
            config.validate(args.create_collection)?;
            let mode = output_mode(args.json);

            let cancel = shutdown_token();
            let app = build_app(&config, cancel)?;
            if args.create_collection {
                app.ensure_collection(&config).await?;
            }

            let fetcher = HttpManifestFetcher::new(config.timeout)?;
            let catalog = load_catalog(&CatalogSource::parse(&config.catalog), &fetcher).await?;
            let sink: Arc<dyn ProgressSink> = match mode {
                OutputMode::Json => Arc::new(JsonOutput),
                OutputMode::Human => Arc::new(TracingSink),
            };
            let report = app.migrate_collection(catalog.collection, sink).await;
            match mode {
                OutputMode::Json => JsonOutput::print_report(&report).into_diagnostic()?,
                OutputMode::Human => print_run_summary(&report),
            }
            Ok(())
        }
        Commands::Repair(args) => {
            let config = ConfigLoader::resolve(config_path.as_deref(), Overrides::default())?;
            config.validate(false)?;
            let app = build_app(&config, shutdown_token())?;
            let report = app.repair_collection(&config.collection_id()).await?;
            if args.json {
                JsonOutput::print_repair(&report).into_diagnostic()?;
            } else {
                let failed = report.outcomes.iter().filter(|o| !o.repaired).count();
                println!(
                    "Repaired {} of {} artifacts in {}",
                    report.outcomes.len() - failed,
                    report.outcomes.len(),
                    report.collection
                );
            }
            Ok(())
        }
        Commands::Summarize(args) => {
            let config = ConfigLoader::resolve(
                config_path.as_deref(),
                Overrides {
                    catalog: Some(args.catalog),
                    ..Overrides::default()
                },
            )?;
            let app = build_app(&config, shutdown_token())?;
            let fetcher = HttpManifestFetcher::new(config.timeout)?;
            let catalog = load_catalog(&CatalogSource::parse(&config.catalog), &fetcher).await?;
            let derivatives = args.derivatives_prefix.map(|listing_url| DerivativeCheck {
                object_url: args
                    .derivatives_url
                    .unwrap_or_else(|| listing_url.clone()),
                listing_url,
                staging_dir: args.stage_sources,
            });
            let result = app
                .summarize(catalog, &args.output_dir, derivatives.as_ref())
                .await?;
            if args.json {
                JsonOutput::print_summary(&result).into_diagnostic()?;
            } else {
                println!(
                    "Generated {} and {} for {} datasets ({} skipped)",
                    result.json_path,
                    result.yaml_path,
                    result.datasets,
                    result.skipped.len()
                );
                if result.pending_derivatives > 0 {
                    println!(
                        "{} derivatives pending conversion, {} sources staged",
                        result.pending_derivatives, result.staged_sources
                    );
                }
            }
            Ok(())
        }
    }
}

fn output_mode(json: bool) -> OutputMode {
    if json {
        OutputMode::Json
    } else {
        OutputMode::Human
    }
}

fn build_app(config: &ResolvedConfig, cancel: CancellationToken) -> Result<HttpApp, MigrateError> {
    // Summaries only read public records, so a token is optional there.
    let artifacts =
        HyphaArtifactClient::new(&config.server_url, config.token.as_deref(), config.timeout)?;
    let transfer = RetryingTransfer::new(
        HttpTransport::new(config.timeout)?,
        config.retry,
        cancel.clone(),
    );
    let migrator = DatasetMigrator::new(
        HttpManifestFetcher::new(config.timeout)?,
        artifacts,
        HttpFileIndex::new(config.timeout)?,
        transfer,
        MigratorSettings {
            workspace: config.workspace.clone(),
            parent_id: config.collection_id(),
            skip_migrated: config.skip_migrated,
            download_weight: 0.0,
        },
        cancel,
    );
    Ok(App::new(migrator, WorkerPool::new(config.concurrency)))
}

/// Cancelled on Ctrl-C; in-flight transfers finish, nothing new starts.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, draining in-flight transfers");
            trigger.cancel();
        }
    });
    token
}

fn print_run_summary(report: &RunReport) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let cyan = "\x1b[36m";
    let red = "\x1b[31m";
    let reset = "\x1b[0m";

    println!("{cyan}ShareLoc migration summary{reset}");
    println!("{green}Committed: {}{reset}", report.committed);
    println!("{yellow}Already migrated: {}{reset}", report.already_migrated);
    println!("{red}Aborted: {}{reset}", report.aborted);

    for outcome in &report.outcomes {
        let color = match outcome.reason {
            None => green,
            Some(AbortReason::AlreadyMigrated) => yellow,
            Some(_) => red,
        };
        println!(
            "{color}{} {} (reached {}){reset}",
            outcome.id, outcome.state, outcome.reached
        );
        if let Some(error) = &outcome.error {
            println!("{color}   error: {error}{reset}");
        }
        if !outcome.files.failed.is_empty() {
            println!("{red}   failed files: {}{reset}", outcome.files.failed.join(", "));
        }
    }
}
