use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use helpdesk_bridge::channels::{ImapConfig, ImapMailbox, SmtpConfig, SmtpMailer};
use helpdesk_bridge::config::ReconcileConfig;
use helpdesk_bridge::error::{ConfigError, Error};
use helpdesk_bridge::pipeline::types::OutboundOutcome;
use helpdesk_bridge::pipeline::{InboundReconciler, OutboundReconciler};
use helpdesk_bridge::tracker::github::read_comment_event;
use helpdesk_bridge::tracker::{GithubConfig, GithubTracker};

const USAGE: &str = "usage: helpdesk-bridge <inbound | outbound [EVENT_PATH]>";

#[tokio::main]
async fn main() -> ExitCode {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let result = match args.first().map(String::as_str) {
        Some("inbound") if args.len() == 1 => run_inbound().await,
        Some("outbound") if args.len() <= 2 => run_outbound(args.get(1).map(PathBuf::from)).await,
        _ => {
            eprintln!("{USAGE}");
            return ExitCode::from(2);
        }
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e:#}");
            if is_config_error(&e) {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn is_config_error(e: &anyhow::Error) -> bool {
    e.chain().any(|cause| {
        cause.downcast_ref::<ConfigError>().is_some()
            || matches!(cause.downcast_ref::<Error>(), Some(Error::Config(_)))
    })
}

async fn run_inbound() -> anyhow::Result<ExitCode> {
    let config = ReconcileConfig::from_env()?;
    let github = GithubTracker::new(&GithubConfig::from_env()?)?;
    let tracker = Arc::new(github);
    let mailbox = Arc::new(ImapMailbox::new(ImapConfig::from_env()?));

    let reconciler =
        InboundReconciler::new(mailbox, tracker.clone(), config).with_attachments(tracker);
    let report = reconciler.run().await.context("inbound run aborted")?;

    Ok(if report.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn run_outbound(event_path: Option<PathBuf>) -> anyhow::Result<ExitCode> {
    let config = ReconcileConfig::from_env()?;
    let github_config = GithubConfig::from_env()?;

    let event_path = match event_path {
        Some(path) => path,
        None => std::env::var("GITHUB_EVENT_PATH")
            .map(PathBuf::from)
            .map_err(|_| ConfigError::MissingEnvVar("GITHUB_EVENT_PATH".into()))?,
    };
    let event = read_comment_event(&event_path, &github_config.system_logins)
        .with_context(|| format!("reading event {}", event_path.display()))?;

    let tracker = Arc::new(GithubTracker::new(&github_config)?);
    let mailer = Arc::new(SmtpMailer::new(SmtpConfig::from_env()?));

    let reconciler = OutboundReconciler::new(tracker, mailer, config);
    match reconciler.reconcile(&event).await? {
        OutboundOutcome::Sent { to, message_id } => {
            tracing::info!(ticket = event.ticket.number, to = %to, message_id = %message_id, "Reply sent");
        }
        OutboundOutcome::Skipped(reason) => {
            tracing::info!(ticket = event.ticket.number, reason = reason.label(), "No email sent");
        }
    }
    Ok(ExitCode::SUCCESS)
}
