//! `cash-acceptor` command-line host.
//!
//! Usage:
//!   cash-acceptor --list-ports
//!   cash-acceptor --operator <id>
//!
//! Configuration comes from the JSON file named by `CASH_ACCEPTOR_CONFIG`
//! (optional) overlaid with environment variables. The session runs until
//! Ctrl-C; the ledger summary is then printed to stdout as JSON.

use anyhow::{bail, Context};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use cash_acceptor::acceptor::SessionManager;
use cash_acceptor::notifier::{EventNotifier, NoopNotifier, WebhookNotifier};
use cash_acceptor::{logging, serial, AcceptorConfig};

fn load_config() -> anyhow::Result<AcceptorConfig> {
    let mut config = match std::env::var("CASH_ACCEPTOR_CONFIG") {
        Ok(path) => AcceptorConfig::from_file(Path::new(&path))
            .with_context(|| format!("loading config from {path}"))?,
        Err(_) => AcceptorConfig::default(),
    };
    config.apply_env(|key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

fn operator_from_args(args: &[String]) -> anyhow::Result<String> {
    if let Some(i) = args.iter().position(|a| a == "--operator") {
        return match args.get(i + 1) {
            Some(id) => Ok(id.clone()),
            None => bail!("--operator needs a value"),
        };
    }
    std::env::var("OPERATOR_ID").context("operator id required (--operator <id> or OPERATOR_ID)")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = load_config()?;
    let _log_guard = logging::init_logging(&config.log)?;

    info!(
        "Starting cash-acceptor v{} ({} {})",
        env!("CARGO_PKG_VERSION"),
        env!("CASH_ACCEPTOR_GIT_SHA"),
        env!("CASH_ACCEPTOR_BUILD_PROFILE")
    );

    if args.iter().any(|a| a == "--list-ports") {
        let ports = serial::available_ports()?;
        println!("{}", serde_json::to_string_pretty(&ports)?);
        return Ok(());
    }

    let operator_id = operator_from_args(&args)?;
    let notifier: Arc<dyn EventNotifier> = match &config.webhook {
        Some(webhook) => {
            info!(url = %webhook.url, "Relaying events to webhook");
            Arc::new(WebhookNotifier::new(webhook)?)
        }
        None => Arc::new(NoopNotifier),
    };

    let port = config.serial.port.clone();
    let manager = SessionManager::new(notifier);
    let session_id = manager
        .start_session(config, &operator_id)
        .await
        .with_context(|| format!("starting session on {port}"))?;
    info!(%session_id, %port, "Accepting notes; press Ctrl-C to finish");

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("Ctrl-C received, stopping");

    let summary = manager.stop_session(&port).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
