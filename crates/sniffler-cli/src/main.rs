//! Supervisor binary: wires every crate together, boots persisted proxies,
//! optionally creates proxies declared on the command line, then waits for
//! `ctrl_c` and shuts everything down gracefully (§4.9, [AMBIENT] 1/3).

mod cli;
mod config;

use std::sync::Arc;

use clap::Parser;
use sniffler_core::config::Settings;
use sniffler_core::events::EventBus;
use sniffler_core::logging::{init_logging, LoggingConfig};
use sniffler_core::persistence::PersistenceStore;
use sniffler_mocks::MockStore;
use sniffler_proxy::ca::{default_ca_storage_dir, RootCa};
use sniffler_recorder::RequestRecorder;
use sniffler_registry::ProxyRegistry;

use crate::cli::Cli;
use crate::config::apply_cli_overrides;

const SETTINGS_KEY: &str = "settings";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();

    init_logging(LoggingConfig {
        level: cli.log_level.clone(),
        json_format: cli.json_logs,
    })?;

    let data_dir = cli.data_dir.clone().unwrap_or_else(|| {
        dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("sniffler")
    });

    let persistence = match PersistenceStore::open(data_dir.clone()).await {
        Ok(store) => Arc::new(store),
        Err(err) => {
            tracing::error!(error = %err, path = %data_dir.display(), "failed to open persistence store");
            std::process::exit(1);
        }
    };

    let mut settings = persistence.load::<Settings>(SETTINGS_KEY).await?.unwrap_or_default();
    apply_cli_overrides(&cli, &mut settings);
    persistence.save(SETTINGS_KEY, &settings).await?;

    let mocks = Arc::new(MockStore::new(settings.max_mock_history));
    let events = Arc::new(EventBus::new());
    let recorder = RequestRecorder::new(settings.max_request_history, events.clone());
    let _sweeper = recorder.spawn_sweeper();

    let ca_dir = default_ca_storage_dir(persistence.root());
    let ca = Arc::new(RootCa::load_or_generate(&ca_dir, settings.tls_cert_cache_capacity)?);

    let registry = ProxyRegistry::new(persistence.clone(), mocks.clone(), recorder.clone(), events.clone(), ca.clone(), settings.clone());
    let _persistence_bridge = registry.spawn_persistence_bridge();

    let boot_results = registry.boot().await;
    for result in &boot_results {
        if !result.ok {
            tracing::warn!(message = %result.message, "proxy failed to start during boot");
        }
    }

    for spec in cli.proxies.clone() {
        let port = spec.port;
        let already_configured = registry.list().await.iter().any(|c| c.port == port);
        if already_configured {
            tracing::info!(port, "skipping --proxy spec, port already configured");
            continue;
        }
        let result = registry.create(spec.into_config()).await;
        if !result.ok {
            tracing::error!(port, message = %result.message, "failed to create proxy from --proxy flag");
        }
    }

    if !cli.hidden {
        let configs = registry.list().await;
        println!("sniffler supervisor running, {} proxies configured:", configs.len());
        for config in &configs {
            println!("  [{}] {} :{} (disabled={})", config.kind, config.name, config.port, config.disabled);
        }
        println!("press ctrl-c to stop");
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested, stopping proxies");

    for config in registry.list().await {
        let result = registry.stop(config.port).await;
        if !result.ok {
            tracing::warn!(port = config.port, message = %result.message, "error stopping proxy during shutdown");
        }
    }

    tracing::info!("shutdown complete");
    Ok(())
}
