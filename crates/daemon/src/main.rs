//! snapreport daemon
//!
//! Reads runner events as JSON lines and writes the report, or merges
//! existing reports.

use clap::{Parser, Subcommand};
use snapreport_common::Error;
use snapreport_daemon::events::EventReader;
use snapreport_daemon::merge::merge_reports;
use snapreport_daemon::{ClientEvent, ReportOrchestrator, ReporterConfig, ReporterError};
use std::path::PathBuf;
use tokio::io::{AsyncBufRead, AsyncWriteExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "snapreportd")]
#[command(about = "snapreport daemon - screenshot test report builder")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "snapreport.toml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build a report from runner events
    Run {
        /// JSON lines event file, stdin when omitted
        #[arg(short, long)]
        events: Option<PathBuf>,

        /// Report output directory
        #[arg(short, long)]
        report_path: Option<PathBuf>,

        /// Continue the existing report in the output directory
        #[arg(long)]
        reuse: bool,

        /// Host substituted into result urls
        #[arg(long)]
        base_host: Option<String>,

        /// Print live stream frames to stdout as server-sent events
        #[arg(long)]
        sse: bool,
    },

    /// Merge reports into one directory
    Merge {
        /// Destination report directory
        #[arg(short, long)]
        destination: PathBuf,

        /// Source report directories
        #[arg(required = true)]
        sources: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging; stdout is reserved for stream frames
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    info!("snapreport daemon v{}", snapreport_common::VERSION);

    match cli.command {
        Command::Run {
            events,
            report_path,
            reuse,
            base_host,
            sse,
        } => {
            let mut config = ReporterConfig::load(&cli.config)?;
            if let Some(report_path) = report_path {
                config.report_path = report_path;
            }
            if reuse {
                config.reuse = true;
            }
            if base_host.is_some() {
                config.base_host = base_host;
            }
            run(config, events, sse).await
        }
        Command::Merge { destination, sources } => {
            merge_reports(&destination, &sources).await?;
            Ok(())
        }
    }
}

async fn run(config: ReporterConfig, events: Option<PathBuf>, sse: bool) -> anyhow::Result<()> {
    let mut orchestrator = ReportOrchestrator::new(config.clone())?;
    if config.reuse {
        orchestrator.hydrate()?;
    }

    let printer = sse.then(|| {
        let mut frames = orchestrator.subscribe();
        tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            loop {
                match frames.recv().await {
                    Ok(frame) => {
                        if stdout.write_all(frame.to_sse().as_bytes()).await.is_err() {
                            break;
                        }
                        let _ = stdout.flush().await;
                        if frame.event == ClientEvent::End {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(missed)) => warn!("Stream lagged, {} frame(s) dropped", missed),
                    Err(RecvError::Closed) => break,
                }
            }
        })
    });

    let input: Box<dyn AsyncBufRead + Unpin + Send> = match &events {
        Some(path) => Box::new(BufReader::new(tokio::fs::File::open(path).await?)),
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };
    let mut reader = EventReader::new(input);

    loop {
        let event = match reader.next_event().await {
            Ok(Some(event)) => event,
            Ok(None) => break,
            Err(e @ ReporterError::EventParse { .. }) => {
                warn!("{}", e);
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        match orchestrator.handle_event(event).await {
            Ok(()) => {}
            Err(e) if e.is_persistence() => return Err(e.into()),
            Err(ReporterError::Core(Error::MalformedResult(reason))) => {
                warn!("Skipping malformed result: {}", reason);
            }
            Err(e) => warn!("Skipping event: {}", e),
        }
    }

    let outcome = orchestrator.finish().await;
    if let Some(printer) = printer {
        let _ = printer.await;
    }

    match outcome {
        Ok(report) => {
            info!(
                "Done: {} suite(s), {} result(s), {} skipped",
                report.tree.suites.all_ids.len(),
                report.tree.results.all_ids.len(),
                report.skips.len()
            );
            Ok(())
        }
        Err(e) => {
            error!("Report generation failed: {}", e);
            Err(e.into())
        }
    }
}
