#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # fleetd
//!
//! Device agent for a fleet-management server.
//!
//! fleetd registers the device with the server using a signed request, keeps a
//! management WebSocket open with exponential-backoff reconnect, opens remote
//! shell tunnels on request, and periodically checks for and applies OTA
//! updates through the platform apply engine.
//!
//! ## Subcommands
//!
//! - `fleetd run` (default) — run the agent
//! - `fleetd register` — send one registration request and report the result
//!
//! ## Server endpoints used
//!
//! | Method | Path                                          | Purpose                 |
//! |--------|-----------------------------------------------|-------------------------|
//! | POST   | `/api/v1/auth/device`                         | Registration, token     |
//! | GET    | `/api/v1/devices/ws`                          | Management channel (WS) |
//! | GET    | `/api/v1/devices/{mac}/shell/attach/{uuid}`   | Shell tunnel (WS)       |
//! | POST   | `/api/v1/update/check`                        | Update check            |
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap subcommands, task wiring, graceful shutdown
//! config.rs        — TOML + env-var configuration
//! error.rs         — error enums per concern
//! auth.rs          — signed registration, token cache
//! backoff.rs       — reconnect delay counter
//! device/
//!   mod.rs         — device identity and metadata
//!   keys.rs        — RSA key store, request signing
//! tunnel/
//!   proto.rs       — management message codec
//!   client.rs      — management channel, reconnect loop, dispatch
//! shell/
//!   mod.rs         — attach handler, session registry
//!   process.rs     — shell process spawning
//!   tunnel.rs      — per-session WS bridge, teardown gate
//! update/
//!   check.rs       — update check, download, checksum
//!   payload.rs     — payload location inside the package
//!   engine.rs      — apply engine adapter, reboot
//!   coordinator.rs — check/apply serialization, engine events
//! ```

use std::error::Error;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use fleetd::auth::DeviceTokenProvider;
use fleetd::config::Config;
use fleetd::device::keys::{DeviceKey, FileKeyStore};
use fleetd::device::DeviceInfo;
use fleetd::shell::ShellAttachHandler;
use fleetd::tunnel::client::ManagementChannel;
use fleetd::update::check::UpdateChecker;
use fleetd::update::coordinator::UpdateCoordinator;
use fleetd::update::engine::{CommandRebooter, UpdateEngineClient};
use fleetd::util::{http_base_url, now_millis, ws_base_url};

/// How long shell sessions get to tear down on shutdown.
const SHELL_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Device agent for fleet management.
#[derive(Parser)]
#[command(name = "fleetd", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent (default when no subcommand given).
    Run {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Send one registration request and print the token lifetime.
    Register {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

type BoxError = Box<dyn Error + Send + Sync>;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let (config_path, register_only) = match cli.command {
        Some(Commands::Run { config }) => (config, false),
        Some(Commands::Register { config }) => (config, true),
        None => (None, false),
    };

    let config = match Config::load(config_path.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("fleetd: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    let result = if register_only {
        register_once(config).await
    } else {
        run_agent(config).await
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

/// Resolve identity, load the key and build the token provider.
async fn build_token_provider(
    config: &Config,
    http_base: &str,
) -> Result<(Arc<DeviceInfo>, Arc<DeviceTokenProvider>), BoxError> {
    let device = Arc::new(DeviceInfo::from_config(&config.device)?);
    info!(
        "Device {} ({}, software {})",
        device.mac_address, device.device_type, device.software_version
    );

    let key_path = config.device.key_path.clone();
    let bits = config.device.key_bits;
    let key = tokio::task::spawn_blocking(move || {
        FileKeyStore::load_or_generate(Path::new(&key_path), bits)
    })
    .await??;
    info!("Using device key {}", key.path().display());
    let key: Arc<dyn DeviceKey> = Arc::new(key);

    let tokens = Arc::new(DeviceTokenProvider::new(
        http_base,
        device.clone(),
        key,
        Duration::from_millis(config.auth.token_grace_ms),
        Duration::from_millis(config.auth.request_timeout_ms),
    )?);
    Ok((device, tokens))
}

async fn register_once(config: Config) -> Result<(), BoxError> {
    let http_base = http_base_url(&config.server.url)?;
    let (_device, tokens) = build_token_provider(&config, &http_base).await?;
    let token = tokens.register().await?;
    let remaining_secs = token.expires_at_ms.saturating_sub(now_millis()) / 1000;
    println!("Device authorized, token usable for {remaining_secs}s");
    Ok(())
}

async fn run_agent(config: Config) -> Result<(), BoxError> {
    info!("fleetd v{} starting", env!("CARGO_PKG_VERSION"));
    let http_base = http_base_url(&config.server.url)?;
    let ws_base = ws_base_url(&config.server.url)?;
    info!("Management server: {http_base}");

    let (device, tokens) = build_token_provider(&config, &http_base).await?;
    let shutdown = CancellationToken::new();

    // Management channel + shell handler
    let handler = Arc::new(ShellAttachHandler::new(
        &ws_base,
        config.shell.clone(),
        Duration::from_secs(config.management.ping_interval_secs.max(1)),
        tokens.clone(),
        shutdown.clone(),
    ));
    let channel = Arc::new(ManagementChannel::new(
        &ws_base,
        config.management.clone(),
        tokens.clone(),
        handler.clone(),
    ));
    let channel_task = channel.spawn();

    // Updates
    let mut update_tasks = Vec::new();
    let coordinator = if config.update.enabled {
        let checker = UpdateChecker::new(
            &http_base,
            device.clone(),
            tokens.clone(),
            &config.update.package_dir,
            Duration::from_millis(config.auth.request_timeout_ms),
        )?;
        let coordinator = Arc::new(UpdateCoordinator::new(
            Arc::new(UpdateEngineClient::new(&config.update.engine_client)),
            Arc::new(checker),
            Arc::new(CommandRebooter::new(config.update.reboot_command.clone())),
        ));
        match coordinator.bind().await {
            Ok(pump) => update_tasks.push(pump),
            Err(e) => warn!("Apply engine unavailable, update checks stay paused: {e}"),
        }

        let timer_coordinator = coordinator.clone();
        let interval_secs = config.update.check_interval_secs.max(1);
        update_tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
            loop {
                interval.tick().await;
                match timer_coordinator.check_and_apply().await {
                    Ok(outcome) => info!("Update check: {outcome:?}"),
                    Err(e) => warn!("Update check failed: {e}"),
                }
            }
        }));
        Some(coordinator)
    } else {
        info!("Update checks disabled");
        None
    };

    // Graceful shutdown
    wait_for_shutdown_signal().await?;
    info!("Shutting down...");
    channel_task.abort();
    for task in &update_tasks {
        task.abort();
    }

    shutdown.cancel();
    let registry = handler.registry().clone();
    let drained = tokio::time::timeout(SHELL_DRAIN_TIMEOUT, async {
        while registry.live_count() > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    if drained.is_err() {
        warn!("{} shell session(s) still open at exit", registry.live_count());
    }

    if let Some(coordinator) = coordinator {
        coordinator.unbind().await;
    }
    info!("Goodbye");
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<(), BoxError> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        r = tokio::signal::ctrl_c() => {
            r?;
            info!("Received SIGINT");
        }
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }
    Ok(())
}
