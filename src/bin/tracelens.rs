//! Tracelens CLI
//!
//! Commands:
//! - replay: Feed a recorded raw-event stream through a full tracker and
//!   print the resulting metrics snapshot
//! - validate: Check a raw-event stream against the event schema

use clap::{Parser, Subcommand, ValueEnum};
use std::cell::RefCell;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::rc::Rc;

use thiserror::Error;
use tracelens::analyzers::{
    ClickAnalyzer, MutationAggregator, ScrollAnalyzer, VisibilityAnalyzer,
};
use tracelens::config::{
    ClickConfig, MutationConfig, ScrollConfig, TrackerConfig, VisibilityConfig,
};
use tracelens::engine::TrackerEngine;
use tracelens::events::RawEvent;
use tracelens::transport::JsonLinesSink;
use tracelens::{TrackError, VERSION};

/// Tracelens - derive behavioral signals from raw user-interaction streams
#[derive(Parser)]
#[command(name = "tracelens")]
#[command(version = VERSION)]
#[command(about = "Replay interaction event streams into behavioral metrics", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Feed a recorded event stream through a full tracker
    Replay {
        /// Input file path (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Input format
        #[arg(long, default_value = "ndjson")]
        input_format: InputFormat,

        /// Print derived summaries instead of the full snapshot
        #[arg(long)]
        summary: bool,

        /// Publish auto-export snapshots on this interval (ms)
        #[arg(long)]
        export_interval: Option<i64>,

        /// Append auto-exported snapshots to this file, one JSON per line
        #[arg(long)]
        export_file: Option<PathBuf>,

        /// Force pretty-printed output (defaults to pretty on a terminal)
        #[arg(long)]
        pretty: bool,
    },

    /// Validate a raw-event stream against the event schema
    Validate {
        /// Input file path (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Input format
        #[arg(long, default_value = "ndjson")]
        input_format: InputFormat,
    },
}

#[derive(Clone, ValueEnum)]
enum InputFormat {
    /// Newline-delimited JSON (one event per line)
    Ndjson,
    /// JSON array of events
    Json,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid input: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Track(#[from] TrackError),

    #[error("Input contains no events")]
    NoEvents,

    #[error("{0} events failed validation")]
    InvalidEvents(usize),
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        Commands::Replay {
            input,
            input_format,
            summary,
            export_interval,
            export_file,
            pretty,
        } => cmd_replay(
            &input,
            input_format,
            summary,
            export_interval,
            export_file.as_deref(),
            pretty,
        ),
        Commands::Validate {
            input,
            input_format,
        } => cmd_validate(&input, input_format),
    }
}

fn read_input(path: &Path) -> Result<String, CliError> {
    if path.to_string_lossy() == "-" {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        Ok(buffer)
    } else {
        Ok(fs::read_to_string(path)?)
    }
}

fn parse_events(data: &str, format: InputFormat) -> Result<Vec<RawEvent>, CliError> {
    let events = match format {
        InputFormat::Ndjson => {
            let mut events = Vec::new();
            for line in data.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                events.push(serde_json::from_str(line)?);
            }
            events
        }
        InputFormat::Json => serde_json::from_str(data)?,
    };
    Ok(events)
}

fn cmd_replay(
    input: &Path,
    input_format: InputFormat,
    summary: bool,
    export_interval: Option<i64>,
    export_file: Option<&Path>,
    pretty: bool,
) -> Result<(), CliError> {
    let data = read_input(input)?;
    let mut events = parse_events(&data, input_format)?;
    if events.is_empty() {
        return Err(CliError::NoEvents);
    }
    events.sort_by_key(|e| e.timestamp());

    let config = TrackerConfig {
        auto_export: export_interval.is_some(),
        export_interval_ms: export_interval.unwrap_or(30_000),
        ..Default::default()
    };
    let mut engine = TrackerEngine::new(config)?;

    let clicks = Rc::new(RefCell::new(ClickAnalyzer::new(ClickConfig::default())?));
    let scroll = Rc::new(RefCell::new(ScrollAnalyzer::new(ScrollConfig::default())?));
    let visibility = Rc::new(RefCell::new(VisibilityAnalyzer::new(
        VisibilityConfig::default(),
    )?));
    let mutations = Rc::new(RefCell::new(MutationAggregator::new(
        MutationConfig::default(),
    )?));
    engine
        .attach(clicks.clone())
        .attach(scroll.clone())
        .attach(visibility.clone())
        .attach(mutations.clone());

    if let Some(path) = export_file {
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        engine.set_sink(Box::new(JsonLinesSink::new(file)))?;
    }

    let start = events[0].timestamp();
    let end = events[events.len() - 1].timestamp();

    engine.start(start);
    let total = events.len();
    for event in events {
        engine.ingest(event);
    }
    engine.stop(end);
    log::info!("replayed {} events", total);

    let use_pretty = pretty || atty::is(atty::Stream::Stdout);
    let output = if summary {
        let report = serde_json::json!({
            "session": engine.get_metrics(end).session,
            "clicks": clicks.borrow().stats(),
            "top_zones": clicks.borrow().top_zones(5),
            "scroll": scroll.borrow().stats(),
            "behavior_pattern": scroll.borrow().behavior_pattern(),
            "visibility": visibility.borrow().stats(),
            "top_viewed": visibility.borrow().top_viewed(5),
            "mutations": mutations.borrow().stats(),
        });
        to_json(&report, use_pretty)?
    } else {
        to_json(&engine.get_metrics(end), use_pretty)?
    };
    println!("{}", output);
    Ok(())
}

fn cmd_validate(input: &Path, input_format: InputFormat) -> Result<(), CliError> {
    let data = read_input(input)?;

    let (valid, invalid) = match input_format {
        InputFormat::Ndjson => {
            let mut valid = 0usize;
            let mut invalid = 0usize;
            for line in data.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<RawEvent>(line) {
                    Ok(_) => valid += 1,
                    Err(e) => {
                        invalid += 1;
                        eprintln!("invalid event: {}", e);
                    }
                }
            }
            (valid, invalid)
        }
        InputFormat::Json => {
            let events: Vec<RawEvent> = serde_json::from_str(&data)?;
            (events.len(), 0)
        }
    };

    println!("{} valid, {} invalid", valid, invalid);
    if invalid > 0 {
        return Err(CliError::InvalidEvents(invalid));
    }
    Ok(())
}

fn to_json<T: serde::Serialize>(value: &T, pretty: bool) -> Result<String, CliError> {
    let json = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    Ok(json)
}
