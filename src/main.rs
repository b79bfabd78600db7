//! Instagram puppet bridge entry point.
//!
//! Provides `start` to serve the bridge hooks and provisioning endpoints, and
//! `check-config` to validate configuration without starting anything.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use clap::{Parser, Subcommand};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use instagram_puppet::bridge::http::HttpBridgeHost;
use instagram_puppet::bridge::routes::{self as hook_routes, HookState};
use instagram_puppet::bridge::BridgeAdapter;
use instagram_puppet::config::BridgeConfig;
use instagram_puppet::platform::sidecar::SidecarConnector;
use instagram_puppet::provisioning::routes::{self as provisioning_routes, ProvisioningState};
use instagram_puppet::provisioning::Provisioner;

/// Matrix puppet bridge for Instagram direct messages.
#[derive(Parser)]
#[command(name = "instagram-puppet", version, about)]
struct Cli {
    /// Config file; defaults to `$IGPUPPET_CONFIG_PATH` or `./config.toml`.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Serve the bridge hooks and provisioning endpoints.
    Start,
    /// Load and validate the configuration, then exit.
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("warning: failed to load .env: {e}");
        }
    }

    let config = BridgeConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Command::Start => handle_start(config).await,
        Command::CheckConfig => handle_check_config(&config),
    }
}

/// Validate the configuration and print a summary.
fn handle_check_config(config: &BridgeConfig) -> anyhow::Result<()> {
    instagram_puppet::logging::init_cli(&config.logging.level);
    config.validate().context("configuration is invalid")?;
    println!("configuration OK");
    println!("  listen:       {}", config.listen_addr()?);
    println!("  sidecar:      {}", config.platform.sidecar_url);
    println!("  bridge hooks: {}", config.bridge.hooks_prefix);
    if config.provisioning.enabled {
        println!("  provisioning: {}", config.provisioning.prefix);
    } else {
        println!("  provisioning: disabled");
    }
    Ok(())
}

/// Serve until interrupted.
async fn handle_start(config: BridgeConfig) -> anyhow::Result<()> {
    let _logging_guard = match &config.logging.logs_dir {
        Some(dir) => Some(instagram_puppet::logging::init_production(
            dir,
            &config.logging.level,
        )?),
        None => {
            instagram_puppet::logging::init_cli(&config.logging.level);
            None
        }
    };

    config.validate().context("configuration is invalid")?;
    let addr = config.listen_addr()?;

    let connector = Arc::new(SidecarConnector::new(
        config.platform.sidecar_url.clone(),
        config.platform.request_timeout(),
    ));
    let host = Arc::new(HttpBridgeHost::new(
        config.bridge.callback_url.clone(),
        config.bridge.token.clone(),
    ));
    let adapter = Arc::new(BridgeAdapter::new(
        host.clone(),
        connector.clone(),
        config.bridge.event_buffer,
    ));

    let mut app = Router::new().nest(
        &config.bridge.hooks_prefix,
        hook_routes::router(Arc::new(HookState {
            adapter: Arc::clone(&adapter),
            token: config.bridge.token.clone(),
        })),
    );

    if config.provisioning.enabled {
        let provisioner = Arc::new(Provisioner::new(
            connector.clone(),
            host.clone(),
        ));
        app = app.nest(
            &config.provisioning.prefix,
            provisioning_routes::router(Arc::new(ProvisioningState {
                provisioner,
                shared_secret: config.provisioning.shared_secret.clone(),
            })),
        );
    } else {
        warn!("provisioning endpoints disabled");
    }

    let app = app.layer(TraceLayer::new_for_http());
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(
        %addr,
        sidecar = %connector.base_url(),
        bridge = %host.base_url(),
        "instagram puppet bridge started"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shutting down, disconnecting puppets");
    adapter.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
