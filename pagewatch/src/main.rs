//! pagewatch - CLI for the client-side telemetry pipeline
//!
//! This tool provides commands for:
//! - Checking delivery, blank-screen and frame-sampler configuration
//! - Probing the collector's health endpoint
//! - Replaying recorded page signals through the capture and delivery pipeline
//!
//! Uses XDG Base Directory specification for file locations:
//! - Config: $XDG_CONFIG_HOME/pagewatch/config.toml (~/.config/pagewatch/config.toml)
//! - Logs: $XDG_STATE_HOME/pagewatch/pagewatch.log (~/.local/state/pagewatch/)

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pagewatch_core::{Config, FlushOutcome, HttpTransport, Monitor, Signal, StaticPage};

#[derive(Parser)]
#[command(name = "pagewatch")]
#[command(about = "Client-side fault and rendering telemetry")]
#[command(version)]
struct Args {
    /// Verbose output (writes a debug log to the state directory, as does
    /// `debug = true` in the config)
    #[arg(short, long)]
    verbose: bool,

    /// Config file to use instead of the XDG default
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show configuration and delivery status
    Status,

    /// Check that the collector answers its health endpoint
    Ping,

    /// Replay a JSONL file of page signals through the pipeline
    Replay {
        /// File with one signal per line
        file: PathBuf,

        /// Page URL attached to replayed records
        #[arg(long, default_value = "about:blank")]
        url: String,

        /// Capture only, never post to the collector
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => Config::load().context("failed to load configuration")?,
    };

    // Either switch turns on the debug-level file log.
    let debug = args.verbose || config.debug;
    let _log_guard = if debug {
        Some(
            pagewatch_core::logging::init(&config.logging, debug)
                .context("failed to initialize logging")?,
        )
    } else {
        None
    };

    match args.command {
        Command::Status => cmd_status(&config),
        Command::Ping => cmd_ping(&config).await,
        Command::Replay { file, url, dry_run } => cmd_replay(config, &file, url, dry_run).await,
    }
}

fn enabled(flag: bool) -> &'static str {
    if flag {
        "enabled"
    } else {
        "disabled"
    }
}

fn cmd_status(config: &Config) -> Result<()> {
    println!("Pagewatch Configuration");
    println!("=======================");
    println!();
    println!("Auto Capture:    {}", config.auto_capture);
    println!("Queue Size:      {}", config.max_queue_size);
    println!();

    let delivery = &config.delivery;
    println!("Delivery");
    println!("--------");
    if !delivery.is_ready() {
        println!("Endpoint:        <not set>");
        println!();
        println!("Delivery is disabled. Set an endpoint in config.toml:");
        println!();
        println!("  [delivery]");
        println!("  endpoint = \"https://collector.example.com/api/errors\"");
        println!("  api_key = \"pw_live_xxxxxxxxxxxx\"");
    } else {
        println!(
            "Endpoint:        {}",
            delivery.endpoint.as_deref().unwrap_or("<not set>")
        );
        println!(
            "API Key:         {}",
            if delivery.api_key.is_some() {
                "<set>"
            } else {
                "<not set>"
            }
        );
        println!("Timeout:         {}ms", delivery.timeout_ms);
        println!("Max Retries:     {}", delivery.max_retries);
        println!("Retry Delay:     {}ms", delivery.retry_base_delay_ms);
        println!("Flush Interval:  {}ms", delivery.flush_interval_ms);
    }
    println!();

    let blank = &config.blank_screen;
    println!("Blank Screen:    {}", enabled(blank.enabled));
    if blank.enabled {
        println!("  Delay:         {}ms", blank.delay_ms);
        println!("  Sample Count:  {}", blank.sample_count);
        println!("  Threshold:     {}", blank.threshold);
        if let Some(interval) = blank.recheck_interval_ms {
            println!("  Recheck:       {}ms", interval);
        }
    }

    let sampler = &config.frame_sampler;
    println!("Frame Sampler:   {}", enabled(sampler.enabled));
    if sampler.enabled {
        println!("  Update:        {}ms", sampler.update_interval_ms);
        println!(
            "  Long/Severe:   {}ms / {}ms",
            sampler.long_frame_threshold, sampler.severe_frame_threshold
        );
        println!("  Scroll:        {}", enabled(sampler.monitor_scroll));
        if sampler.auto_report {
            println!("  Auto Report:   every {}ms", sampler.report_interval_ms);
        }
    }

    println!();
    if delivery.is_ready() {
        println!("Status: Ready to deliver");
    } else {
        println!("Status: Capture only (no delivery endpoint)");
    }

    Ok(())
}

async fn cmd_ping(config: &Config) -> Result<()> {
    if !config.delivery.is_ready() {
        println!("Delivery is not configured. Run 'status' for details.");
        return Ok(());
    }

    let transport =
        HttpTransport::new(&config.delivery).context("failed to create HTTP transport")?;
    let healthy = transport.health_check().await?;

    if healthy {
        println!("Collector at {} is healthy", transport.endpoint());
        Ok(())
    } else {
        anyhow::bail!("collector at {} did not answer /health", transport.endpoint())
    }
}

/// Parse one signal per non-empty line
fn read_signals(path: &Path) -> Result<Vec<Signal>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;

    let mut signals = Vec::new();
    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let signal: Signal = serde_json::from_str(line)
            .with_context(|| format!("{}:{}: invalid signal", path.display(), index + 1))?;
        signals.push(signal);
    }
    Ok(signals)
}

async fn cmd_replay(mut config: Config, file: &Path, url: String, dry_run: bool) -> Result<()> {
    let signals = read_signals(file)?;

    // Replay has no live page to watch.
    config.auto_capture = true;
    config.blank_screen.enabled = false;
    config.frame_sampler.enabled = false;
    if dry_run {
        config.delivery.endpoint = None;
    }
    let deliver = config.delivery.is_ready();

    let monitor = Monitor::builder()
        .config(config)
        .page(Arc::new(StaticPage::new(url)))
        .build()
        .context("failed to build monitor")?;
    monitor.start().context("failed to start monitor")?;

    let count = signals.len();
    for signal in signals {
        if let Some(unhooked) = monitor.hooks().raise(signal) {
            monitor.capture(unhooked);
        }
    }
    tracing::info!(signals = count, "Replay complete");

    println!("Replayed {} signal(s)", count);
    println!();
    for record in monitor.errors() {
        println!("  [{}] {}", record.kind.as_str(), record.message);
    }

    if deliver {
        println!();
        match monitor.report_now().await? {
            FlushOutcome::Delivered { count, receipt } => {
                println!("Delivered {} record(s)", count);
                if let Some(id) = receipt.id {
                    println!("Batch ID: {}", id);
                }
            }
            FlushOutcome::Requeued { count } => {
                println!("Delivery failed; {} record(s) still pending", count);
            }
            FlushOutcome::Skipped => println!("Nothing to deliver"),
        }
    }

    let stats = monitor.stats();
    println!();
    println!("Captured:        {}", stats.total_errors);
    println!("Queue Size:      {}", stats.queue_size);
    println!("Pending:         {}", stats.pending_reports);
    println!("Delivered:       {}", stats.delivered);

    monitor.stop();
    Ok(())
}
