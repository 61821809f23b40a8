use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

use trendwatch::config::{Config, LoggingConfig};
use trendwatch::coordinator::{Engine, RunTrigger};
use trendwatch::ingest::JsonlSource;

#[derive(Parser)]
#[command(
    name = "trendwatch",
    about = "Trend detection and alerting engine",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true, env = "TRENDWATCH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + refresh scheduler)
    Serve {
        /// Bind address, overriding `api.bind`
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run one refresh over a JSON-lines items file
    Refresh {
        /// Items file, one JSON object per line
        #[arg(long)]
        items: PathBuf,

        /// Treat this RFC 3339 instant as the current time
        #[arg(long)]
        now: Option<String>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Show the latest trend ranking
    Trends {
        /// Number of entries to show
        #[arg(long, default_value = "20")]
        limit: usize,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Show recent alerts
    Alerts {
        /// Number of alerts to show
        #[arg(long, default_value = "20")]
        limit: usize,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Validate the configuration and preview the refresh schedule
    CheckConfig {
        /// Hours of schedule to preview
        #[arg(long, default_value = "24")]
        hours: u64,
    },

    /// Delete ranking, alert and run history past retention
    Prune {
        /// Retention in days, overriding `storage.history_days`
        #[arg(long)]
        days: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let path = Config::locate(cli.config.as_deref())?;
    let mut config = Config::load(&path)?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.api.bind = bind;
            }
            tracing::info!(bind = %config.api.bind, config = %path.display(), "Starting trendwatch daemon");
            trendwatch::serve(config).await?;
        }
        Commands::Refresh { items, now, json } => {
            let now = match now {
                Some(s) => DateTime::parse_from_rfc3339(&s)
                    .with_context(|| format!("invalid --now '{}'", s))?
                    .with_timezone(&Utc),
                None => Utc::now(),
            };
            let pool = trendwatch::storage::open_pool(&config.storage.db_path)?;
            let engine = Engine::from_config(&config)?.with_pool(pool)?;
            let report = engine
                .start_run(Arc::new(JsonlSource::new(items)), now, RunTrigger::Manual)
                .await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("\nRefresh {} ({})", report.id, report.status);
                println!(
                    "items {} | late {} | buckets {} | scored {} | insufficient {}",
                    report.items_seen,
                    report.late_discarded,
                    report.buckets_closed,
                    report.entities_scored,
                    report.insufficient_data
                );
                println!(
                    "alerts: {} delivered, {} suppressed, {} failed\n",
                    report.alerts_delivered, report.alerts_suppressed, report.alerts_failed
                );
                print_ranking(&report.ranking, 10);
            }
        }
        Commands::Trends { limit, json } => {
            let pool = trendwatch::storage::open_pool(&config.storage.db_path)?;
            let ranking = trendwatch::trend::history::latest_ranking(&pool, limit)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&ranking)?);
            } else if ranking.is_empty() {
                println!("No trends recorded yet.");
            } else {
                print_ranking(&ranking, limit);
            }
        }
        Commands::Alerts { limit, json } => {
            let pool = trendwatch::storage::open_pool(&config.storage.db_path)?;
            let alerts = trendwatch::alert::list_alerts(&pool, limit)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&alerts)?);
            } else if alerts.is_empty() {
                println!("No alerts recorded yet.");
            } else {
                println!(
                    "{:<25} | {:<20} | {:<8} | {:>8} | {:<20} | Time",
                    "Entity", "Source", "Severity", "Score", "Delivery"
                );
                println!("{:-<25}-|-{:-<20}-|-{:-<8}-|-{:-<8}-|-{:-<20}-|-{:-<25}", "", "", "", "", "", "");
                for a in &alerts {
                    println!(
                        "{:<25} | {:<20} | {:<8} | {:>8.2} | {:<20} | {}",
                        a.entity_id,
                        a.source,
                        a.severity.as_str(),
                        a.score,
                        a.delivery.label(),
                        a.created_at.to_rfc3339()
                    );
                }
            }
        }
        Commands::CheckConfig { hours } => {
            println!("# {}", path.display());
            println!("{}", toml::to_string_pretty(&config)?);

            let scheduler = trendwatch::scheduler::Scheduler::new(&config.schedule.cron)?;
            let runs = scheduler.preview(Utc::now(), hours);
            println!("# Refreshes in the next {} hours: {}", hours, runs.len());
            for t in runs.iter().take(10) {
                println!("#   {}", t.to_rfc3339());
            }
        }
        Commands::Prune { days } => {
            let pool = trendwatch::storage::open_pool(&config.storage.db_path)?;
            let days = days.unwrap_or(config.storage.history_days);
            let report = trendwatch::storage::prune_history(&pool, days)?;
            println!(
                "Pruned {} trend scores, {} alerts, {} runs older than {} days",
                report.trend_scores, report.alert_log, report.run_history, days
            );
        }
    }

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_ranking(ranking: &[trendwatch::trend::TrendScore], limit: usize) {
    println!(
        "{:>4} | {:<25} | {:>7} | {:>8} | {:>8} | {:>8} | {:>8}",
        "Rank", "Entity", "Count", "Z", "Growth", "Velocity", "Score"
    );
    println!("{:->4}-|-{:-<25}-|-{:->7}-|-{:->8}-|-{:->8}-|-{:->8}-|-{:->8}", "", "", "", "", "", "", "");
    for s in ranking.iter().take(limit) {
        println!(
            "{:>4} | {:<25} | {:>7} | {:>8.2} | {:>8.2} | {:>8.2} | {:>8.2}",
            s.rank, s.entity_id, s.count, s.z_score, s.growth_rate, s.velocity, s.combined_score
        );
    }
}
