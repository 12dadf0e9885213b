//! AgriMap - multi-layer geospatial search client for AgriWeb
//!
//! A CLI tool that streams department searches commune by commune,
//! merges the partial results into map layers, and writes reports.
//!
//! Exit codes:
//!   0 - Success
//!   1 - Runtime error (connection, config, interrupted search, etc.)
//!   2 - The server reported an error, or no result was received

mod cli;
mod config;
mod layers;
mod models;
mod report;
mod stream;

use anyhow::{Context, Result};
use chrono::Utc;
use cli::{Args, OutputFormat, SearchSource};
use config::{Config, CONFIG_FILE_NAME};
use indicatif::{ProgressBar, ProgressStyle};
use layers::session::CancellationSignal;
use layers::{ResultAggregator, SearchController, SessionUpdate};
use models::ReportMetadata;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use stream::{ApiClient, StreamError, StreamEvent, StreamOutcome};
use tracing::{debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse_args();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle --init-config early (no logging needed)
    if args.init_config {
        return handle_init_config();
    }

    // Load configuration before logging so the file can set verbosity
    let (mut config, config_source) = match load_config(&args) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    };
    config.merge_with_args(&args);

    // Initialize logging
    init_logging(args.log_level(config.general.verbose));

    info!("AgriMap v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);
    config_source.log();

    match run_search(args, config).await {
        Ok(exit_code) => {
            std::process::exit(exit_code);
        }
        Err(e) => {
            error!("Search failed: {:#}", e);
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Handle --init-config: generate a default .agrimap.toml.
fn handle_init_config() -> Result<()> {
    let path = std::path::Path::new(CONFIG_FILE_NAME);

    if path.exists() {
        eprintln!(
            "⚠️  {} already exists. Remove it first or edit it manually.",
            CONFIG_FILE_NAME
        );
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content)
        .with_context(|| format!("Failed to write {}", CONFIG_FILE_NAME))?;

    println!("✅ Created {} with default settings.", CONFIG_FILE_NAME);
    println!("   Edit it to customize the server, search defaults, and layer catalog.");
    Ok(())
}

/// Initialize logging at the given level.
fn init_logging(level: tracing::Level) {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

/// Run one search and write its report. Returns the exit code.
async fn run_search(args: Args, config: Config) -> Result<i32> {
    let start_time = Instant::now();

    let source = args
        .source()
        .context("One of --department, --commune or --replay is required")?;

    let aggregator = Arc::new(ResultAggregator::new(&config.layers));
    let mut controller = SearchController::new(aggregator);
    let ticket = controller.begin();
    let generation = ticket.generation;

    let progress = if args.quiet {
        None
    } else {
        Some(progress_bar())
    };

    let (result, origin) = match &source {
        SearchSource::Department(code) => {
            let client = ApiClient::new(&config.api)?;
            println!("🛰️  Streaming department {} from {}", code, client.base_url());

            let interrupt = watch_interrupt(Arc::clone(&ticket.cancel));
            let result = client
                .stream_department(code, &config.search, &ticket, |event| {
                    apply_event(&mut controller, generation, event, progress.as_ref())
                })
                .await;
            interrupt.abort();

            (result, client.base_url().to_string())
        }
        SearchSource::Commune(name) => {
            let client = ApiClient::new(&config.api)?;
            println!("🔎 Searching commune {} on {}", name, client.base_url());

            let result = match client.search_commune(name, &config.search).await {
                Ok(partial) => {
                    apply_event(&mut controller, generation, StreamEvent::Result(partial), progress.as_ref());
                    apply_event(
                        &mut controller,
                        generation,
                        StreamEvent::End(format!("Commune {} searched", name)),
                        progress.as_ref(),
                    );
                    Ok(StreamOutcome::Ended)
                }
                Err(StreamError::Api(message)) => {
                    apply_event(&mut controller, generation, StreamEvent::Error(message), progress.as_ref());
                    Ok(StreamOutcome::Failed)
                }
                Err(e) => Err(e),
            };

            (result, client.base_url().to_string())
        }
        SearchSource::Replay(path) => {
            println!("📼 Replaying {}", path.display());

            let transcript = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read transcript {}", path.display()))?;
            let result = stream::replay_transcript(&transcript, &ticket, |event| {
                apply_event(&mut controller, generation, event, progress.as_ref())
            });

            (result, path.display().to_string())
        }
    };

    if let Some(ref pb) = progress {
        if !pb.is_finished() {
            pb.abandon();
        }
    }

    let (status, exit_code) = conclude(&mut controller, result).context("Search failed")?;

    // Build the report
    let duration = start_time.elapsed().as_secs_f64();
    let metadata = ReportMetadata {
        search: source.describe(),
        source: origin,
        generated_at: Utc::now(),
        status: Some(status.clone()),
        duration_seconds: duration,
    };
    let session = controller.session();
    let report = report::build_report(metadata, session);

    let output = match args.format {
        OutputFormat::Json => report::generate_json_report(&report)?,
        OutputFormat::Markdown => report::generate_markdown_report(&report),
    };

    let output_path = args
        .output
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.general.output));
    std::fs::write(&output_path, &output)
        .with_context(|| format!("Failed to write report to {}", output_path.display()))?;

    if let Some(ref geojson_path) = args.geojson {
        let export = report::generate_layer_export(session.layers())?;
        std::fs::write(geojson_path, &export)
            .with_context(|| format!("Failed to write layers to {}", geojson_path.display()))?;
        info!("Layers exported to {}", geojson_path.display());
    }

    // Print summary
    let summary = &report.summary;
    println!("\n📊 Search Summary:");
    println!("   Status: {}", status);
    println!(
        "   Communes: {} | Objects: {} | Éleveurs: {}",
        summary.communes, summary.objects, summary.eleveurs
    );
    println!(
        "   Layers with features: {} of {}",
        session.layers().drawable().count(),
        session.layers().len()
    );
    println!("   Duration: {:.1}s", duration);
    println!("\n✅ Report saved to: {}", output_path.display());

    if exit_code == 2 && summary.communes == 0 {
        eprintln!("\n⛔ No result was received (exit code 2).");
    } else if exit_code == 2 {
        eprintln!("\n⛔ The server reported an error (exit code 2).");
    }

    Ok(exit_code)
}

/// Final status message and exit code of a search whose source has stopped.
///
/// The department stream normally just closes after its last result, so a
/// closed stream with results is a normal completion.
fn conclude(
    controller: &mut SearchController,
    result: Result<StreamOutcome, StreamError>,
) -> Result<(String, i32), StreamError> {
    let received = !controller.session().is_empty();

    let concluded = match result {
        Ok(StreamOutcome::Ended) => {
            let status = controller.status().unwrap_or("Completed").to_string();
            (status, if received { 0 } else { 2 })
        }
        Ok(StreamOutcome::Failed) => {
            let status = format!("Error: {}", controller.status().unwrap_or("unknown error"));
            (status, 2)
        }
        Ok(StreamOutcome::Closed) => {
            if controller.is_active() {
                controller.close();
            }
            if received {
                info!("Stream closed after {} result(s)", controller.session().len());
                ("Completed".to_string(), 0)
            } else {
                warn!("Stream closed without any result");
                ("Stream closed without any result".to_string(), 2)
            }
        }
        Err(StreamError::Cancelled) => {
            controller.close();
            warn!("Search interrupted after {} result(s)", controller.session().len());
            ("Interrupted".to_string(), 1)
        }
        Err(e) if received => {
            controller.close();
            warn!("Stream stopped early: {}", e);
            (format!("Stopped: {}", e), 1)
        }
        Err(e) => return Err(e),
    };

    Ok(concluded)
}

/// Apply one stream event to the controller and reflect it on the progress bar.
fn apply_event(
    controller: &mut SearchController,
    generation: u64,
    event: StreamEvent,
    progress: Option<&ProgressBar>,
) {
    let Some(update) = controller.handle(generation, event) else {
        return;
    };

    match update {
        SessionUpdate::Progress { message, step } => {
            if let Some(pb) = progress {
                if let Some((current, total)) = step {
                    pb.set_length(total as u64);
                    pb.set_position(current.saturating_sub(1) as u64);
                }
                pb.set_message(message);
            } else {
                debug!("{}", message);
            }
        }
        SessionUpdate::Merged { communes, features } => {
            if let Some(pb) = progress {
                if pb.length().is_some_and(|len| len > 0) {
                    pb.set_position(communes as u64);
                }
            }
            debug!("{} commune(s), {} feature(s) merged", communes, features);
        }
        SessionUpdate::Rejected(reason) => {
            if let Some(pb) = progress {
                pb.println(format!("⚠️  Skipped an unreadable result: {}", reason));
            }
        }
        SessionUpdate::Finished(message) => {
            if let Some(pb) = progress {
                pb.finish_with_message(message);
            }
        }
        SessionUpdate::Failed(message) => {
            if let Some(pb) = progress {
                pb.abandon_with_message(format!("Error: {}", message));
            }
        }
    }
}

fn progress_bar() -> ProgressBar {
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb
}

/// Raise the search's cancellation signal on Ctrl-C.
fn watch_interrupt(cancel: CancellationSignal) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, stopping the search");
            cancel.store(true, Ordering::SeqCst);
        }
    })
}

/// Where the configuration came from, logged once logging is up.
enum ConfigSource {
    File(PathBuf),
    Defaults,
    Fallback(String),
}

impl ConfigSource {
    fn log(&self) {
        match self {
            ConfigSource::File(path) => info!("Loaded config from {}", path.display()),
            ConfigSource::Defaults => debug!("No config file found, using defaults"),
            ConfigSource::Fallback(e) => warn!("Failed to load config: {}", e),
        }
    }
}

/// Load configuration from file or use defaults.
fn load_config(args: &Args) -> Result<(Config, ConfigSource)> {
    // Try explicit config path
    if let Some(ref config_path) = args.config {
        let config = Config::load(config_path)?;
        return Ok((config, ConfigSource::File(config_path.clone())));
    }

    // Try default location
    match Config::load_default() {
        Ok(Some(config)) => Ok((config, ConfigSource::File(PathBuf::from(CONFIG_FILE_NAME)))),
        Ok(None) => Ok((Config::default(), ConfigSource::Defaults)),
        Err(e) => Ok((Config::default(), ConfigSource::Fallback(format!("{:#}", e)))),
    }
}
