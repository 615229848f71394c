use crate::cli_options::{CliCommand, CliOptions};
use anyhow::{Context, Result, anyhow};
use clap::Parser;
use feast_serving_core::config::ServingConfig;
use feast_serving_core::serving::build_serving_service;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod cli_options;

#[tokio::main]
async fn main() -> Result<()> {
    let CliOptions {
        chdir,
        log_level,
        serving_yaml,
        command,
    } = CliOptions::parse();

    tracing_subscriber::registry()
        .with(
            EnvFilter::builder()
                .with_default_directive(tracing::Level::from(log_level).into())
                .from_env_lossy(),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cwd = match chdir {
        Some(path) => PathBuf::from(path),
        None => std::env::current_dir()?,
    };
    let cwd_str = cwd
        .to_str()
        .ok_or_else(|| anyhow!("Serving directory path contains invalid UTF-8"))?;

    let config_path = cwd.join(&serving_yaml);
    let yaml_str = fs::read_to_string(&config_path)
        .with_context(|| format!("Failed to read serving configuration {:?}", config_path))?;
    let config = ServingConfig::from_yaml_str(&yaml_str)?;

    match command {
        CliCommand::Validate => {
            let service = build_serving_service(&config, Some(cwd_str)).await?;
            let info = service.get_feast_serving_info().await?;
            tracing::info!(
                "Configuration {:?} is valid for {} serving",
                config_path,
                info.serving_type
            );
            service.shutdown().await;
        }
        CliCommand::Serve {
            host,
            port,
            key,
            cert,
            metrics_enabled,
        } => {
            if key.is_some() != cert.is_some() {
                return Err(anyhow!(
                    "Both --key and --cert must be provided to enable TLS"
                ));
            }
            let tls_enabled = key.is_some() && cert.is_some();
            tracing::info!(
                "Start {} serving on {}:{}",
                config.serving_type,
                host,
                port
            );
            let service = build_serving_service(&config, Some(cwd_str)).await?;
            let server_config = rest_server::server::ServerConfig {
                host,
                port,
                tls_enabled,
                tls_cert_path: cert,
                tls_key_path: key,
            };
            let handler = axum_server::Handle::new();
            let signals = tokio::spawn(shutdown_on_signal(handler.clone()));
            let result = rest_server::server::start_server(
                server_config,
                service.clone(),
                metrics_enabled,
                handler,
            )
            .await;
            signals.abort();
            service.shutdown().await;
            result?;
        }
    }
    Ok(())
}

async fn shutdown_on_signal(handler: axum_server::Handle) {
    let mut sigterm =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                tracing::warn!("Cannot listen for SIGTERM: {}", err);
                let _ = tokio::signal::ctrl_c().await;
                handler.graceful_shutdown(Some(Duration::from_secs(5)));
                return;
            }
        };
    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM, shutting down...");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C, shutting down...");
        }
    }
    handler.graceful_shutdown(Some(Duration::from_secs(5)));
}
