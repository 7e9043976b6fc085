use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use castline::app::App;
use castline::config::Config;
use castline::scheduler::{reclaim_stale_items, RunRequest};
use castline::server::CastlineServer;

#[derive(Parser)]
#[command(
    name = "castline",
    version,
    about = "Scheduled publish pipeline with lease-guarded runs and idempotent replays",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML); environment variables are used when absent
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json); overrides the configured format
    #[arg(long, global = true)]
    log_format: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the trigger, webhook and management API
    Serve {
        /// Override the bind address
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Run the scheduler once and print the report
    Run {
        /// Source tag recorded on the run
        #[arg(short, long, default_value = "manual")]
        source: String,

        /// Override the maximum number of items
        #[arg(long)]
        max_items: Option<usize>,
    },

    /// Move items stuck in publishing back to retrying
    Reclaim,

    /// Validate configuration and print the effective values
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };

    let log_format = cli
        .log_format
        .clone()
        .unwrap_or_else(|| config.logging.format.clone());
    setup_tracing(&log_format, &config.logging.level, cli.verbose)?;

    if let Err(e) = castline::metrics::init_metrics() {
        tracing::warn!(error = %e, "Metrics registration failed, continuing without metrics");
    }

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind_address = bind;
            }
            serve(config).await?;
        }

        Commands::Run { source, max_items } => {
            if let Some(max_items) = max_items {
                config.scheduler.max_items = max_items;
            }
            tracing::info!(source = %source, "Starting run command");
            run_once(config, source).await?;
        }

        Commands::Reclaim => {
            reclaim(config).await?;
        }

        Commands::CheckConfig => {
            check_config(&config)?;
        }
    }

    Ok(())
}

fn setup_tracing(format: &str, level: &str, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("castline=debug,tower_http=debug,info")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .or_else(|_| tracing_subscriber::EnvFilter::try_new(format!("castline={level},warn")))
            .context("Invalid log level")?
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    Ok(())
}

async fn serve(config: Config) -> Result<()> {
    let app = Arc::new(App::from_config(config).await?);
    let server = CastlineServer::new(app)?;

    server
        .start_with_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutdown signal received");
        })
        .await?;

    Ok(())
}

async fn run_once(config: Config, source: String) -> Result<()> {
    let app = App::from_config(config).await?;
    let request = RunRequest::from_config(source, &app.config.scheduler);
    let report = app.scheduler.run(request).await;

    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.success {
        anyhow::bail!(
            "run failed: {}",
            report.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

async fn reclaim(config: Config) -> Result<()> {
    let app = App::from_config(config).await?;
    let stale_after = std::time::Duration::from_secs(app.config.scheduler.stale_publishing_secs);
    let reclaimed =
        reclaim_stale_items(app.repos.items.as_ref(), app.clock.as_ref(), stale_after).await?;

    println!("Reclaimed {} item(s)", reclaimed.len());
    for id in reclaimed {
        println!("  {id}");
    }
    Ok(())
}

fn check_config(config: &Config) -> Result<()> {
    config.validate()?;

    println!("Configuration OK");
    println!("{:-<40}", "");
    println!("Bind Address:       {}", config.server.bind_address);
    println!("Storage:            {:?}", config.storage.backend);
    println!("Shared State:       {:?}", config.shared_state.backend);
    println!("Upstream:           {}", config.upstream.base_url);
    println!("Lock TTL:           {}s", config.scheduler.lock_ttl_secs);
    println!("Run Budget:         {}s", config.scheduler.max_duration_secs);
    println!("Max Items:          {}", config.scheduler.max_items);
    println!(
        "Worst-case Item:    {}s",
        config.worst_case_item_duration().as_secs()
    );
    println!(
        "Interval Trigger:   {}",
        match config.scheduler.poll_interval_secs {
            0 => "disabled".to_string(),
            secs => format!("every {secs}s"),
        }
    );
    println!(
        "Cron Secret:        {}",
        if config.server.cron_secret.is_some() { "set" } else { "not set" }
    );
    Ok(())
}
