//! GPUd
//!
//! Node-resident daemon that continuously diagnoses the health of a GPU
//! machine and recommends remediation actions. Every checker runs as its own
//! component on its own schedule; recurring failures are correlated with the
//! reboot history to escalate from a reboot to a hardware inspection.

mod checkers;
mod cli;
mod config;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use checkers::{CommandChecker, EscalationPolicy, OsChecker};
use cli::Cli;
use config::Config;
use gpud_core::component::{CheckPolicy, Component, GpudInstance, PeriodicComponent, Registry};
use gpud_core::escalation::aggregate_suggested_actions;
use gpud_core::{
    EventStore, HealthState, HealthStateType, RepairActionType, SuggestedActionsStore,
};

/// Initialize the tracing/logging subsystem
fn init_logging(log_level: &str, json_format: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
}

/// Register a component unless it cannot run on this machine
fn register_supported(registry: &Registry, component: Arc<dyn Component>) -> Result<()> {
    if !component.is_supported() {
        info!(component = component.name(), "Component not supported on this machine, skipping");
        return Ok(());
    }
    let name = component.name().to_string();
    registry
        .register(component)
        .with_context(|| format!("Failed to register component {}", name))
}

/// Build the registry with every configured component
fn build_registry(config: &Config, instance: GpudInstance) -> Result<Registry> {
    let registry = Registry::new(instance);
    let instance = registry.instance().clone();

    let policy = CheckPolicy {
        interval: config.check_interval,
        check_on_start: config.run_check_on_start,
    };

    if config.os.enabled {
        let checker = OsChecker::new(instance.event_store.clone());
        register_supported(
            &registry,
            Arc::new(PeriodicComponent::new(&instance, checker, policy)),
        )?;
    }

    let escalation = EscalationPolicy {
        lookback: config.escalation.lookback,
        sequence_threshold: config.escalation.sequence_threshold,
        suggestion_ttl: config.escalation.suggestion_ttl,
    };
    for check in &config.checks {
        let checker = CommandChecker::new(
            &check.name,
            &check.command,
            check.args.clone(),
            check.timeout,
            check.failure_threshold,
            escalation,
        )
        .with_event_store(instance.event_store.clone())
        .with_suggested_actions(instance.suggested_actions.clone());

        let policy = CheckPolicy {
            interval: check.interval.unwrap_or(config.check_interval),
            ..policy
        };
        register_supported(
            &registry,
            Arc::new(PeriodicComponent::new(&instance, checker, policy)),
        )?;
    }

    info!(count = registry.all().len(), "Registered components");
    Ok(registry)
}

/// Log the node-wide health and remediation summary
fn report_status(registry: &Registry, suggested: &SuggestedActionsStore) {
    let mut unhealthy = Vec::new();
    let mut suggestions = Vec::new();

    for component in registry.all() {
        for state in component.last_health_states() {
            if matches!(
                state.health,
                HealthStateType::Unhealthy | HealthStateType::Degraded
            ) {
                unhealthy.push(format!("{}: {}", component.name(), state.reason));
            }
            suggestions.push(state.suggested_actions);
        }
    }

    match aggregate_suggested_actions(&suggestions) {
        Some(actions) => warn!(
            actions = ?actions.repair_actions,
            description = %actions.description,
            unhealthy = ?unhealthy,
            "Node requires remediation"
        ),
        None if unhealthy.is_empty() => info!("Node healthy"),
        None => warn!(unhealthy = ?unhealthy, "Node has unhealthy components"),
    }

    for action in RepairActionType::ALL {
        let components = suggested.has_suggested(action);
        if !components.is_empty() {
            info!(action = %action, components = ?components, "Live repair suggestion");
        }
    }
}

/// Drop events older than `retention`, returning how many were removed
fn purge_expired_events(events: &EventStore, retention: chrono::Duration) -> usize {
    match Utc::now().checked_sub_signed(retention) {
        Some(cutoff) => events.purge_all(cutoff),
        None => 0,
    }
}

/// Run the daemon until the root token is cancelled
async fn run(config: Config, instance: GpudInstance) -> Result<()> {
    let token = instance.root_token.clone();
    let events = instance
        .event_store
        .clone()
        .context("Daemon requires an event store")?;
    let suggested = instance
        .suggested_actions
        .clone()
        .context("Daemon requires a suggested actions store")?;

    let registry = build_registry(&config, instance)?;
    for component in registry.all() {
        component
            .start()
            .with_context(|| format!("Failed to start component {}", component.name()))?;
    }

    // Start metrics server if enabled
    if config.metrics.enabled {
        let port = config.metrics.port;
        let token = token.clone();
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(port, token).await {
                error!(error = %e, "Metrics server failed");
            }
        });
    }

    let retention = chrono::Duration::from_std(config.event_retention)
        .context("event_retention out of range")?;
    let mut ticker = tokio::time::interval(config.status_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                report_status(&registry, &suggested);
                purge_expired_events(&events, retention);
            }
        }
    }

    info!("Stopping components");
    registry.stop_all();
    info!("GPUd shutdown complete");
    Ok(())
}

/// Run every check once and print the health states as JSON
async fn run_once(config: Config, instance: GpudInstance) -> Result<()> {
    info!("Running single check pass (--once mode)");
    let registry = build_registry(&config, instance)?;

    let mut states: BTreeMap<String, Vec<HealthState>> = BTreeMap::new();
    for result in registry.check_all().await {
        states.insert(result.component_name().to_string(), result.health_states());
    }
    registry.stop_all();

    let output = serde_json::to_string_pretty(&states).context("Failed to encode health states")?;
    println!("{}", output);
    Ok(())
}

/// Start the Prometheus metrics HTTP server
async fn start_metrics_server(port: u16, token: CancellationToken) -> Result<()> {
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind metrics port {}", port))?;
    info!(port = port, "Metrics server listening");

    loop {
        let (mut socket, _) = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted?,
        };

        tokio::spawn(async move {
            let mut buf = [0; 1024];
            let _ = socket.read(&mut buf).await;

            let metrics_output = gpud_core::metrics::gather_text();
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\n\r\n{}",
                metrics_output.len(),
                metrics_output
            );

            let _ = socket.write_all(response.as_bytes()).await;
        });
    }
}

/// Cancel `token` on Ctrl+C or SIGTERM
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown");
        }
    }

    token.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse_args();

    // Initialize logging
    init_logging(&cli.log_level, cli.log_json);

    info!(version = env!("CARGO_PKG_VERSION"), "GPUd starting");

    // Load configuration
    let config = if cli.config.exists() {
        Config::from_file(&cli.config)
            .with_context(|| format!("Failed to load config from {:?}", cli.config))?
    } else {
        warn!(path = ?cli.config, "Config file not found, using defaults");
        Config::default()
    };

    let config = cli.apply_to(config).with_machine_id_from_env();

    // Validate configuration
    config.validate().context("Invalid configuration")?;

    let machine_id = config.machine_id.clone().unwrap_or_else(|| "unknown".to_string());
    info!(machine_id = %machine_id, checks = config.checks.len(), "Configuration loaded");

    let root_token = CancellationToken::new();
    tokio::spawn(shutdown_signal(root_token.clone()));

    let instance = GpudInstance::new(root_token, machine_id)
        .with_event_store(Arc::new(EventStore::new()))
        .with_suggested_actions(Arc::new(SuggestedActionsStore::new()));

    if cli.once {
        return run_once(config, instance).await;
    }

    run(config, instance).await
}
