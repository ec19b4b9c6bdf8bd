//! # Gap Recovery Entry Point
//!
//! Loads the configuration and station list, runs the recovery pipeline over
//! the selected stations and prints one report line per station.
//!
//! Station failures are part of the report, not errors: the process exits
//! non-zero only when it cannot start (bad station file, bad settings).

use anyhow::Context;
use chrono::{Duration, DurationRound, Utc};
use clap::Parser;
use gap_recovery::config::Config;
use gap_recovery::logging::{self, LogFormat};
use gap_recovery::pipeline::{Pipeline, StationReport};
use gap_recovery::station::{FileStationSource, StationDirectory};
use std::path::PathBuf;
use std::process;
use tracing::info;

/// Recover missing tide-gauge readings from station data loggers.
#[derive(Debug, Parser)]
#[command(name = "gap-recovery", version, about)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = gap_recovery::config::CONFIG_FILE)]
    config: PathBuf,

    /// Station list, overriding `stations_file` from the configuration
    #[arg(short, long)]
    stations: Option<PathBuf>,

    /// Hours back from now to search for gaps
    #[arg(long)]
    hours: Option<i64>,

    /// Only run these station codes (repeatable)
    #[arg(long = "station", value_name = "CODE")]
    only: Vec<String>,

    /// Frame messages but do not post them
    #[arg(long)]
    dry_run: bool,

    /// Print reports as JSON
    #[arg(long)]
    json: bool,

    #[arg(long, default_value = "info")]
    log_level: String,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() {
    let args = Args::parse();
    logging::init(&args.log_level, args.log_format);

    let runtime = tokio::runtime::Runtime::new().unwrap_or_else(|e| {
        eprintln!("Failed to create async runtime: {}", e);
        process::exit(1);
    });

    match runtime.block_on(run(args)) {
        Ok(reports) => {
            let failed = reports.iter().filter(|r| r.status.is_failure()).count();
            info!(stations = reports.len(), failed, "run complete");
        }
        Err(error) => {
            eprintln!("Error: {:#}", error);
            process::exit(1);
        }
    }
}

async fn run(args: Args) -> anyhow::Result<Vec<StationReport>> {
    let mut config = Config::load_from_path(&args.config);
    if let Some(stations) = args.stations {
        config.stations_file = stations;
    }
    if let Some(hours) = args.hours {
        config.run.lookback_hours = hours;
    }
    if args.dry_run {
        config.run.dry_run = true;
    }
    if let Ok(token) = std::env::var("IWLS_BEARER_TOKEN") {
        config.iwls.bearer_token = Some(token);
    }

    let mut directory = StationDirectory::new(FileStationSource::new(&config.stations_file));
    let entries = directory
        .all()
        .with_context(|| format!("loading stations from {}", config.stations_file.display()))?;
    let entries: Vec<_> = entries
        .into_iter()
        .filter(|entry| match entry {
            Ok(station) if args.only.is_empty() => station.enabled,
            Ok(station) => args.only.contains(&station.code),
            Err(e) => args.only.is_empty() || args.only.iter().any(|code| e.station().ends_with(code.as_str())),
        })
        .collect();

    let settings = config
        .pipeline_settings()
        .context("invalid [logger] split_frequency")?;
    let client = config.iwls_client().context("building IWLS client")?;
    let pipeline = Pipeline::new(settings, client.clone(), client).with_push_file(config.push_file());

    let to = Utc::now()
        .duration_trunc(Duration::minutes(1))
        .context("truncating run window")?;
    let from = config.run.window_start(to).context("invalid [run] lookback_hours")?;
    info!(
        stations = entries.len(),
        %from,
        %to,
        dry_run = config.run.dry_run,
        "starting gap recovery"
    );

    let reports = pipeline.run_all(entries, from, to).await;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        print_reports(&reports);
    }
    Ok(reports)
}

fn print_reports(reports: &[StationReport]) {
    println!(
        "{:<36} {:>5} {:>7} {:>8} {:>6} {:>4}  status",
        "station", "gaps", "queries", "attempts", "rows", "sent"
    );
    for report in reports {
        println!(
            "{:<36} {:>5} {:>7} {:>8} {:>6} {:>4}  {}",
            report.station,
            report.gaps,
            report.queries,
            report.attempts,
            report.rows,
            report.messages_sent,
            report.status
        );
    }
}
