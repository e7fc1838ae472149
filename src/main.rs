//! mail-telegram-relay: supervised IMAP listeners with a REST control plane
//!
//! One process hosts three things: the control API the chat bot talks to,
//! one long-lived IMAP IDLE worker per tracked mailbox, and the periodic
//! retry drain for undelivered Telegram payloads. Cross-task coordination
//! happens exclusively through the key-value store.
//!
//! # Architecture
//!
//! - [`main`]: process entry point; wiring and background task spawns
//! - [`config`]: environment-driven configuration
//! - [`errors`]: application error model with HTTP response mapping
//! - [`crypto`]: credential cipher for mailbox passwords at rest
//! - [`models`]: persistent rows and API DTOs
//! - [`kv`]: key-value store client and cache combinators
//! - [`status`]: per-mailbox worker status slot
//! - [`store`]: repositories with read-through caching
//! - [`imap`]: IMAPS connection management and session operations
//! - [`decoder`]: email decoding and canonical HTML rendering
//! - [`render`]: HTML to PNG rasterization
//! - [`dispatch`]: Telegram delivery with retry-list capture
//! - [`retry`]: periodic retry-queue drain
//! - [`worker`]: per-mailbox IDLE state machine
//! - [`supervisor`]: worker lifecycle orchestration
//! - [`server`]: control API router and handlers

mod config;
mod crypto;
mod decoder;
mod dispatch;
mod errors;
mod imap;
mod kv;
mod models;
mod render;
mod retry;
mod server;
mod status;
mod store;
mod supervisor;
mod worker;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use secrecy::SecretString;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use config::Config;
use crypto::CredentialCipher;
use dispatch::Dispatcher;
use kv::KvStore;
use server::AppState;
use store::Store;
use supervisor::Supervisor;

/// Command-line overrides; everything else comes from the environment
#[derive(Parser)]
#[command(name = "mail-telegram-relay", version, about)]
struct Cli {
    /// Listen address for the control API (overrides BIND_ADDR)
    #[arg(long)]
    bind: Option<String>,
    /// Load environment from this file instead of ./.env
    #[arg(long)]
    env_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Encrypt a mailbox password into its stored form (uses CRYPTO_KEY)
    EncryptPassword { plaintext: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    match &cli.env_file {
        Some(path) => {
            dotenvy::from_path(path)?;
        }
        None => {
            dotenvy::dotenv().ok();
        }
    }
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    if let Some(Command::EncryptPassword { plaintext }) = cli.command {
        let key = SecretString::new(std::env::var("CRYPTO_KEY")?.into());
        let cipher = CredentialCipher::from_hex_key(&key)?;
        println!("{}", cipher.encrypt_password(&plaintext)?);
        return Ok(());
    }

    let mut config = Config::load_from_env()?;
    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }
    let config = Arc::new(config);

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await?;
    sqlx::migrate!().run(&pool).await?;

    let kv = KvStore::connect(&config.redis_url()).await?;
    let cipher = CredentialCipher::from_hex_key(&config.crypto_key)?;
    let store = Store::new(pool, kv.clone(), config.cache_ttl_seconds);
    let dispatcher = Dispatcher::new(&config, kv.clone());
    let supervisor = Supervisor::new(
        config.clone(),
        store.clone(),
        kv.clone(),
        dispatcher.clone(),
        cipher,
    );

    // Startup convergence runs alongside serving; launches are staggered and
    // must not delay the API coming up.
    {
        let supervisor = supervisor.clone();
        tokio::spawn(async move {
            if let Err(e) = supervisor.restart_workers().await {
                error!(error = %e, "worker restart sweep failed");
            }
        });
    }
    tokio::spawn(retry::run(dispatcher, kv, config.retry_interval_ms));

    let state = AppState {
        config: config.clone(),
        store,
        supervisor,
    };
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, "control api listening");
    axum::serve(listener, server::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
