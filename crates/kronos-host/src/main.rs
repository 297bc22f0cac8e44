//! Kronos host - runs the Kronos service worker from the command line.
//!
//! The worker is installed against a live origin over HTTP. Page commands
//! are read from stdin one per line, notifications are printed to stdout,
//! and logs go to stderr.

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use kronos_core::api::{ScreenshotParser, VisionClient};
use kronos_core::models::Request;
use kronos_core::platform::{HttpNetwork, MemoryClients, MemoryNotifications};
use kronos_core::{FetchOutcome, Platform, Registration, ServiceWorker, WorkerConfig, WorkerEvent};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use url::Url;

/// How often `wait` checks whether scheduled notifications have fired
const WAIT_POLL_MS: u64 = 100;

const USAGE: &str = "\
usage: kronos                        run the worker, reading commands from stdin
       kronos parse-timetable <image>  parse a timetable screenshot to JSON

commands:
  {\"type\": ...}     post a message to the worker
  fetch <path>       fetch a path through the worker
  push [json]        deliver a push message
  click              click the most recent notification
  pending            count scheduled notifications
  wait               wait until every scheduled notification has fired
  quit";

/// Initialize the tracing subscriber for logging
fn init_tracing() {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = WorkerConfig::load().context("Failed to load configuration")?;

    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        None => run_worker(config).await,
        Some("parse-timetable") => {
            let path = args
                .get(2)
                .ok_or_else(|| anyhow::anyhow!("missing image path\n\n{}", USAGE))?;
            parse_timetable(&config, Path::new(path)).await
        }
        Some("-h" | "--help") => {
            println!("{}", USAGE);
            Ok(())
        }
        Some(other) => anyhow::bail!("unknown command: {}\n\n{}", other, USAGE),
    }
}

fn media_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        _ => "image/png",
    }
}

async fn parse_timetable(config: &WorkerConfig, path: &Path) -> Result<()> {
    let image = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let parser = VisionClient::new(&config.vision)?;
    let periods = parser
        .parse_screenshot(&image, Some(media_type_for(path)))
        .await
        .context("Failed to parse timetable")?;
    println!("{}", serde_json::to_string_pretty(&periods)?);
    Ok(())
}

async fn run_worker(config: WorkerConfig) -> Result<()> {
    let origin = config.origin_url()?;
    let notifications = Arc::new(MemoryNotifications::new());
    let platform = Platform::new(
        Arc::new(HttpNetwork::new()?),
        notifications.clone(),
        Arc::new(MemoryClients::new()),
    );

    let mut shown = notifications.subscribe();
    tokio::spawn(async move {
        while let Ok(record) = shown.recv().await {
            println!("[notification {}] {}: {}", record.tag(), record.title, record.body());
        }
    });

    let worker = ServiceWorker::new(config, platform, Registration::new());
    info!(origin = %origin, "Kronos host starting");
    match worker.start().await {
        Ok(Some(report)) => println!(
            "worker active, cache {}, {} page(s) claimed",
            worker.config().cache_version,
            report.claimed_clients
        ),
        Ok(None) => println!("worker installed, waiting"),
        Err(e) => warn!(error = %e, "Worker did not install, serving without a cache"),
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "quit" {
            break;
        }
        if let Err(e) = run_command(&worker, &notifications, line, &origin).await {
            eprintln!("error: {:#}", e);
        }
    }

    let report = worker.terminate().await;
    info!(
        settled = report.settled,
        aborted = report.aborted_timers,
        "Kronos host shutting down"
    );
    Ok(())
}

async fn run_command(
    worker: &ServiceWorker,
    notifications: &MemoryNotifications,
    line: &str,
    origin: &Url,
) -> Result<()> {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    match command {
        _ if line.starts_with('{') => {
            let message: serde_json::Value =
                serde_json::from_str(line).context("Message is not valid JSON")?;
            worker.dispatch(WorkerEvent::Message(message)).await?;
        }
        "fetch" => {
            let url = origin.join(rest.trim()).context("Invalid path")?;
            let request = Request::get(url);
            match worker.on_fetch(&request).await? {
                FetchOutcome::Responded(response) => println!(
                    "{} {}{} ({} bytes)",
                    response.status,
                    response.status_text,
                    if response.from_cache { " [cache]" } else { "" },
                    response.body.len()
                ),
                FetchOutcome::NotIntercepted => println!("not intercepted"),
            }
        }
        "push" => {
            let data = Some(rest.trim()).filter(|d| !d.is_empty());
            worker
                .dispatch(WorkerEvent::Push(data.map(|d| d.as_bytes().to_vec())))
                .await?;
        }
        "click" => {
            let record = notifications
                .visible()
                .await
                .pop()
                .ok_or_else(|| anyhow::anyhow!("no notification to click"))?;
            let client = worker.on_notification_click(&record).await?;
            println!("focused {} at {}", client.id, client.url);
        }
        "pending" => println!("{} scheduled", worker.pending_notifications().await),
        "wait" => {
            while worker.pending_notifications().await > 0 {
                tokio::time::sleep(Duration::from_millis(WAIT_POLL_MS)).await;
            }
        }
        _ => anyhow::bail!("unknown command: {}", command),
    }
    Ok(())
}
