//! Bank server binary
//!
//! Usage: `bank-server [config.toml]`. Without a path the configuration
//! comes from `BANK_*` environment variables.

use anyhow::Context;
use bank_core::{Config, Ledger};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("Starting bank server");

    let config = match std::env::args().nth(1) {
        Some(path) => {
            let mut config = Config::from_file(&path)
                .with_context(|| format!("loading config from {}", path))?;
            config.apply_env();
            config.validate()?;
            config
        }
        None => Config::from_env()?,
    };

    let ledger = Ledger::open(config).context("opening ledger")?;

    let group = &ledger.config().outbox.consumer_group;
    let pending = ledger.outbox().pending(group)?;
    tracing::info!(
        data_dir = ?ledger.config().data_dir,
        exports_total = ledger.outbox().len()?,
        last_export_id = ?ledger.outbox().last_id()?,
        consumer_group = %group,
        pending = pending.len(),
        "Ledger opened successfully"
    );
    for entry in &pending {
        tracing::info!(
            export_id = %entry.id,
            consumer = %entry.consumer,
            delivery_count = entry.delivery_count,
            idle_ms = entry.idle.as_millis() as u64,
            released = entry.released,
            "Export awaiting ack"
        );
    }

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down bank server");
    ledger.close()?;
    Ok(())
}
