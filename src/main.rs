use std::sync::Arc;

use anyhow::Context;
use cardapio_sync::{
    credentials, logging, CrossTabChannel, EngineSettings, HttpRemoteStore, LocalCache, Notifier,
    RefreshOutcome, SyncConfig, SyncedData, ToastLevel,
};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Keep the local menu in sync until interrupted (default).
    Watch,
    /// Refresh once and print the public catalog as JSON.
    Snapshot,
    /// Save the endpoint and admin session token in the OS credential store.
    Login {
        #[arg(long)]
        endpoint: String,
        #[arg(long)]
        token: String,
    },
    /// Forget stored credentials.
    Logout,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command.unwrap_or(Command::Watch) {
        Command::Login { endpoint, token } => {
            credentials::set_credential(credentials::KEY_ENDPOINT_URL, &endpoint)?;
            credentials::store_session(&token)?;
            println!("Credentials saved");
            Ok(())
        }
        Command::Logout => {
            credentials::reset()?;
            println!("Credentials removed");
            Ok(())
        }
        Command::Snapshot => snapshot().await,
        Command::Watch => watch().await,
    }
}

fn build_engine(config: &SyncConfig) -> anyhow::Result<SyncedData<HttpRemoteStore>> {
    let store = HttpRemoteStore::new(config).context("building menu server client")?;
    let cache = LocalCache::open(&config.cache_path());
    match cache.path() {
        Some(path) => info!(path = %path.display(), "menu cache ready"),
        None => warn!("running without a menu cache"),
    }
    Ok(SyncedData::new(
        Arc::new(store),
        cache,
        CrossTabChannel::new(),
        Notifier::new(),
        EngineSettings::from(config),
    ))
}

async fn snapshot() -> anyhow::Result<()> {
    let _log_guard = logging::init(&SyncConfig::env_log_dir())?;
    let config = SyncConfig::from_env().context("loading configuration")?;
    let engine = build_engine(&config)?;
    engine.hydrate_from_cache();
    if engine.refresh().await == RefreshOutcome::Degraded {
        eprintln!("warning: showing cached menu");
    }

    let state = engine.snapshot();
    let catalog: Vec<serde_json::Value> = state
        .catalog()
        .into_iter()
        .map(|section| {
            serde_json::json!({
                "category": section.category,
                "products": section.products,
            })
        })
        .collect();
    let out = serde_json::json!({
        "catalog": catalog,
        "logo": state.logo,
        "siteConfig": state.site_config,
        "lastSync": state.last_sync,
        "error": state.error,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

async fn watch() -> anyhow::Result<()> {
    let _log_guard = logging::init(&SyncConfig::env_log_dir())?;
    info!("Starting cardapio-sync v{}", env!("CARGO_PKG_VERSION"));
    let config = SyncConfig::from_env().context("loading configuration")?;
    info!(?config, "configuration loaded");

    let engine = build_engine(&config)?;
    let _toasts = engine.notifier().subscribe(|toast| match toast.level {
        ToastLevel::Success => info!(message = %toast.message, "notice"),
        ToastLevel::Warning => warn!(message = %toast.message, "notice"),
        ToastLevel::Error => error!(message = %toast.message, "notice"),
    });

    let mut changes = engine.subscribe();
    let handle = engine.start();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            res = &mut shutdown => {
                res.context("waiting for shutdown signal")?;
                info!("shutdown requested");
                break;
            }
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = changes.borrow_and_update().clone();
                info!(
                    phase = ?state.phase,
                    categories = state.categories.len(),
                    products = state.products.len(),
                    error = state.error.as_deref().unwrap_or(""),
                    "menu state changed"
                );
            }
        }
    }

    handle.shutdown();
    Ok(())
}
