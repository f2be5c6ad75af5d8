mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{debug, info};

use buildscope_api::{ApiClient, ApiError};
use buildscope_logs::{BuildLog, BuildLogSession, BuildLogsView};
use buildscope_types::{ReadyState, epoch_millis};

use crate::config::Config;

/// Buildscope - Follow a deployment's build logs from the terminal
#[derive(Parser, Debug)]
#[command(name = "buildscope")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Deployment id or URL
    #[arg(value_name = "DEPLOYMENT")]
    deployment: String,

    /// TOML configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Platform API endpoint
    #[arg(long)]
    api_url: Option<String>,

    /// API token (defaults to $VERCEL_TOKEN)
    #[arg(long)]
    token: Option<String>,

    /// Seconds between deployment status checks
    #[arg(long, value_name = "SECS")]
    poll_interval: Option<u64>,

    /// Maximum number of log lines kept
    #[arg(long)]
    max_logs: Option<usize>,
}

impl Args {
    /// Command-line flags win over every other layer
    fn apply_to(&self, config: &mut Config) {
        if let Some(url) = &self.api_url {
            config.api_url = url.clone();
        }
        if let Some(token) = &self.token {
            config.token = Some(token.clone());
        }
        if let Some(secs) = self.poll_interval {
            config.poll_interval_secs = secs;
        }
        if let Some(max) = self.max_logs {
            config.max_displayed_logs = max;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing for debugging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = run(args).await;

    if let Err(e) = &result {
        eprintln!("Error: {:#}", e);
    }

    result
}

async fn run(args: Args) -> Result<()> {
    let mut config = Config::load(args.config.as_deref())?;
    args.apply_to(&mut config);
    debug!(api_url = %config.api_url, "configuration loaded");

    let client = Arc::new(ApiClient::new(config.api_config()).context("Failed to create API client")?);
    let deployment = client
        .get_deployment(&args.deployment)
        .await
        .with_context(|| format!("Failed to fetch deployment '{}'", args.deployment))?;
    info!(id = %deployment.id, state = %deployment.ready_state, "following build logs");

    let mut session = BuildLogSession::new(client.clone(), config.session_options());
    let mut status_rx = session.subscribe();
    session.observe(Some(deployment.clone())).await;

    // Status polling publishes every observed deployment state
    let (updates_tx, mut updates_rx) = watch::channel(Some(deployment.clone()));
    let mut poll = if deployment.is_finished() {
        None
    } else {
        let client = client.clone();
        let id = deployment.id.clone();
        let options = config.poll_options();
        Some(tokio::spawn(async move {
            client.poll_deployment(&id, &options, &updates_tx).await
        }))
    };

    let mut printer = LinePrinter::default();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let finished = session.deployment().is_some_and(|d| d.is_finished());
        if finished && !session.status().connected {
            break;
        }

        tokio::select! {
            _ = &mut ctrl_c => {
                debug!("interrupted");
                if let Some(handle) = poll.take() {
                    handle.abort();
                }
                session.stop().await;
                eprintln!("Cancelled");
                return Ok(());
            }

            changed = updates_rx.changed(), if poll.is_some() => {
                if changed.is_ok() {
                    let latest = updates_rx.borrow_and_update().clone();
                    session.observe(latest).await;
                    continue;
                }

                // Poller exited; a failed deployment is reported by its final state
                if let Some(handle) = poll.take() {
                    match handle.await? {
                        Ok(_) | Err(ApiError::DeploymentFailed(_)) => {}
                        Err(e) => {
                            session.stop().await;
                            return Err(e).context("Failed to check deployment status");
                        }
                    }
                }
            }

            changed = status_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                printer.print(&session.snapshot());
            }
        }
    }

    // Pick up anything that landed after the last notification
    printer.print(&session.snapshot());

    let counts = session.store().level_counts();
    eprintln!(
        "{} lines, {} warnings, {} errors",
        counts.total(),
        counts.warning,
        counts.error
    );

    match session.deployment().map(|d| d.ready_state) {
        Some(ReadyState::Ready) => Ok(()),
        Some(state) => anyhow::bail!("Deployment finished in state {}", state),
        None => anyhow::bail!("Deployment disappeared"),
    }
}

/// Prints the latest line whenever it changes
#[derive(Default)]
struct LinePrinter {
    /// Id and creation time of the last printed line
    last: Option<(String, i64)>,
}

impl LinePrinter {
    fn print(&mut self, view: &BuildLogsView) {
        let (Some(step), Some(log)) = (view.steps.first(), view.latest_log()) else {
            return;
        };
        let key = (log.id.clone(), log.created);
        if self.last.as_ref() == Some(&key) {
            return;
        }
        println!("{}", format_line(step.name.label(), log));
        self.last = Some(key);
    }
}

fn format_line(step: &str, log: &BuildLog) -> String {
    let time = epoch_millis(log.created)
        .map(|t| t.with_timezone(&chrono::Local).format("%H:%M:%S").to_string())
        .unwrap_or_default();
    let tag = log.level.map_or("   ", |level| level.as_str());
    format!("{} {} [{}] {}", time, tag, step, log.text().unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildscope_types::{LogBody, LogLevel};

    fn log(level: Option<LogLevel>, text: &str) -> BuildLog {
        BuildLog {
            id: "1".to_string(),
            created: 0,
            date: None,
            deployment_id: None,
            serial: None,
            level,
            body: LogBody::stdout(text),
        }
    }

    #[test]
    fn test_format_line_tags_level() {
        let line = format_line("Building", &log(Some(LogLevel::Error), "Error: boom"));
        assert!(line.ends_with("ERR [Building] Error: boom"));

        let line = format_line("Building", &log(None, "Done"));
        assert!(line.ends_with("    [Building] Done"));
    }

    #[test]
    fn test_cli_overrides_config() {
        let args = Args::parse_from([
            "buildscope",
            "dpl_123",
            "--api-url",
            "http://localhost:3000",
            "--max-logs",
            "50",
        ]);
        let mut config = Config {
            token: Some("file".to_string()),
            ..Config::default()
        };
        args.apply_to(&mut config);

        assert_eq!(args.deployment, "dpl_123");
        assert_eq!(config.api_url, "http://localhost:3000");
        assert_eq!(config.max_displayed_logs, 50);
        assert_eq!(config.token.as_deref(), Some("file"));
        assert_eq!(config.poll_interval_secs, 3);
    }
}
