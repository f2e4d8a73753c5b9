//! Bucket crawler CLI
//!
//! Local execution entry point. For AWS Lambda, use `bucket-crawler-lambda`.

use std::path::PathBuf;

use bucket_crawler::{
    error::Result,
    models::{BucketReference, Config, QueueItem},
    pipeline::{self, Services},
    utils::CancelSignal,
};
use clap::{Parser, Subcommand};

/// bucket-crawler - keeps a package search index in sync with manifest buckets
#[derive(Parser, Debug)]
#[command(name = "bucket-crawler", version, about)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Discover buckets, then crawl and index all of them
    Run,

    /// Discover buckets and enqueue them only
    Dispatch,

    /// Drain the configured queue with the worker pool
    Work,

    /// Crawl and index a single bucket
    Crawl {
        /// Repository URL of the bucket
        url: String,

        /// Branch to crawl instead of the default branch
        #[arg(long)]
        branch: Option<String>,
    },

    /// Validate the configuration file
    Validate,
}

/// Initialize logging based on verbosity flag.
fn init_logging(verbose: bool, level: &str) {
    let level = if verbose { "debug" } else { level };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}

/// Fire `cancel` on Ctrl-C.
fn cancel_on_ctrl_c(cancel: &CancelSignal) {
    let cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted, finishing in-flight work...");
            cancel.cancel();
        }
    });
}

/// Main entry point for the CLI application.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load_or_default(&cli.config);
    init_logging(cli.verbose, &config.logging.level);
    config.apply_env();

    log::info!("Loaded configuration from {}", cli.config.display());

    if let Command::Validate = cli.command {
        log::info!("Validating configuration...");
        // Load strictly: a broken file must not pass as defaults.
        let mut strict = Config::load(&cli.config)?;
        strict.apply_env();
        if let Err(e) = strict.validate() {
            log::error!("Config validation failed: {}", e);
            return Err(e);
        }
        log::info!("✓ Config OK");
        return Ok(());
    }

    config.validate()?;
    let services = Services::build(&config).await?;
    let cancel = CancelSignal::new();
    cancel_on_ctrl_c(&cancel);

    match cli.command {
        Command::Run => {
            let summary = pipeline::run_pipeline(&config, &services, &cancel).await?;
            log::info!(
                "Run complete: {} buckets enqueued, {} indexed, {} failed",
                summary.dispatch.enqueued,
                summary.pool.succeeded,
                summary.pool.failed
            );
        }

        Command::Dispatch => {
            let summary = pipeline::run_dispatcher(
                &config.discovery,
                services.search.as_ref(),
                services.queue.as_ref(),
                Some(services.index.as_ref()),
                &cancel,
            )
            .await?;
            log::info!("{} buckets enqueued", summary.enqueued);
        }

        Command::Work => {
            let summary = services.worker_pool(&config).run(&cancel).await?;
            log::info!(
                "{} buckets indexed, {} failed",
                summary.succeeded,
                summary.failed
            );
        }

        Command::Crawl { url, branch } => {
            let item = QueueItem::new(BucketReference::from_url(&url, branch)?);
            let outcome = services.crawler.run(&item, &cancel).await?;
            log::info!(
                "{}: {} documents upserted, {} deleted, {} manifests skipped",
                outcome.bucket_id,
                outcome.index.upserted,
                outcome.index.deleted,
                outcome.skipped_manifests
            );
        }

        // Handled before services are built.
        Command::Validate => {}
    }

    log::info!("Done!");

    Ok(())
}
