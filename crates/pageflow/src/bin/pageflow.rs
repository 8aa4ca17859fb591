//! pageflow command-line interface.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;

use pageflow::broker::MessageBroker;
use pageflow::config::load_effective_config;
use pageflow::db::purge;
use pageflow::pipeline::{get_result, get_status, Dispatcher, Submission};
use pageflow::raster::{DocumentRasterizer, Rasterizer};
use pageflow::service::{open_broker, open_store, Service};
use pageflow::{logging, Backend, Config, ModelRegistry};

#[derive(Parser)]
#[command(name = "pageflow")]
#[command(about = "Per-page OCR pipeline with exactly-once aggregation", long_about = None)]
struct Cli {
    /// JSON config file (defaults apply when omitted)
    #[arg(short, long, env = "PAGEFLOW_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Log level or filter directive; RUST_LOG takes precedence
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run page workers, the aggregator and the completion monitor until Ctrl-C
    Serve,
    /// Rasterize a document and dispatch its pages
    Submit {
        /// Image or PDF file
        file: PathBuf,
        /// Logical model name (see `pageflow models`)
        #[arg(short, long)]
        model: String,
    },
    /// Show the status of a job
    Status { job_id: String },
    /// Show the final result of a completed job
    Result {
        job_id: String,
        /// Print only the markdown document
        #[arg(long)]
        markdown: bool,
    },
    /// List the configured models
    Models,
    /// Delete every job, page result and final result
    Purge {
        /// Confirm the purge
        #[arg(long)]
        yes: bool,
        /// Also delete every broker message, dead letters included
        #[arg(long)]
        broker: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level, cli.log_json).context("Failed to initialize logging")?;

    let config = load_effective_config(cli.config.as_deref()).context("Failed to load config")?;

    match cli.command {
        Command::Serve => serve(&config),
        Command::Submit { file, model } => submit(&config, file, model),
        Command::Status { job_id } => {
            let store = open_store(&config)?;
            print_json(&get_status(&store, &job_id)?)
        }
        Command::Result { job_id, markdown } => {
            let store = open_store(&config)?;
            let result = get_result(&store, &job_id)?;
            if markdown {
                println!("{}", result.markdown_content);
                Ok(())
            } else {
                print_json(&result)
            }
        }
        Command::Models => {
            let models = ModelRegistry::from_map(config.models.clone());
            for (name, spec) in models.iter() {
                println!("{:<24} {:<10} {}", name, spec.backend, spec.engine);
            }
            Ok(())
        }
        Command::Purge { yes, broker } => {
            if !yes {
                bail!("Refusing to purge without --yes");
            }
            let store = open_store(&config)?;
            let store_counts = purge::purge_all(&store)?;
            let broker_counts = if broker {
                Some(open_broker(&config)?.purge_all()?)
            } else {
                None
            };
            print_json(&serde_json::json!({
                "store": store_counts,
                "broker": broker_counts,
            }))
        }
    }
}

fn serve(config: &Config) -> anyhow::Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    ctrlc::set_handler(move || {
        running_clone.store(false, Ordering::SeqCst);
    })
    .context("Failed to set signal handler")?;

    let service = Service::start(config).context("Failed to start service")?;
    log::info!(
        "Serving with store {} and broker {}",
        config.store_path().display(),
        config.broker_path().display()
    );

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }

    service.shutdown();
    Ok(())
}

fn submit(config: &Config, file: PathBuf, model: String) -> anyhow::Result<()> {
    let models = Arc::new(ModelRegistry::from_map(config.models.clone()));
    // Fail on an unknown model before rendering anything.
    models.resolve(&model)?;

    let document = DocumentRasterizer::new(config.extraction.dpi)
        .rasterize(&file)
        .with_context(|| format!("Failed to read {}", file.display()))?;

    let store = open_store(config)?;
    let broker: Arc<dyn MessageBroker> = Arc::new(open_broker(config)?);
    let dispatcher = Dispatcher::new(store, broker, models).with_backends(Backend::compiled());

    let receipt = dispatcher.submit(Submission::from_document(document, model))?;
    if receipt.is_partial() {
        log::warn!(
            "Only {}/{} pages were queued; job {} will not complete",
            receipt.published,
            receipt.total_pages,
            receipt.job_id
        );
    }
    print_json(&receipt)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
