//! Helios Guard Admin
//!
//! Operator CLI for the tenant guard: schema setup, tenant and membership
//! provisioning, access checks, audit delivery and compliance reports.

mod commands;
mod config;

use clap::Parser;
use helios_tenant_guard::GuardConfig;
use tracing::info;

use crate::commands::Admin;
use crate::config::AdminConfig;

/// Initializes tracing, honouring `RUST_LOG` when set.
fn init_logging(level: &str) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("helios_tenant_guard={},guard_admin={}", level, level))
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn load_guard_config(path: Option<&str>) -> anyhow::Result<GuardConfig> {
    match path {
        Some(path) => {
            info!(path, "Loading guard configuration");
            Ok(GuardConfig::load(path)?)
        }
        None => Ok(GuardConfig::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AdminConfig::parse();
    init_logging(&config.log_level);

    let guard_config = load_guard_config(config.config.as_deref())?;
    if let Err(errors) = guard_config.validate() {
        for error in &errors {
            eprintln!("Configuration error: {}", error);
        }
        std::process::exit(1);
    }

    let admin = Admin::open(&config.database, &guard_config, &config.actor)?;
    let output = admin.run(&config.command).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}
