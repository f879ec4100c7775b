//! DTSN core service entry point.
//!
//! One process runs every engine: the calendar writer, the anchor engine,
//! the audit producer and worker, the reward consumer, the inbound
//! dispatcher, and the HTTP registry surface. Multi-stack deployments run
//! several of these against a shared bus and lock backend; leadership and
//! the calendar lock keep the write paths single-writer either way.
//!
//! ## Configuration
//!
//! `--config <path>` loads a TOML file (see `dtsn_common::config`); without
//! it the defaults apply. Env overrides:
//!
//! - `DTSN_SIGNING_SECRET`: Base64 32-byte Ed25519 secret (required here or
//!   in the config file)
//! - `DTSN_TOKEN_URI`: token service base URI
//! - `RUST_LOG`: tracing filter (default `info`)
//!
//! ## Startup sequence
//!
//! 1. Load config, init tracing
//! 2. Open the block store and registry databases
//! 3. Load the signing identity
//! 4. Ensure the genesis block exists
//! 5. Spawn engines (writer, anchor, audit producer + worker, dispatcher)
//! 6. Serve the HTTP surface

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use dtsn_audit::{
    AuditEngine, ChallengeManager, HttpNodeClient, HttpTokenService, NodeRegistry, RegistryStore,
    RewardEngine, TokenService,
};
use dtsn_calendar::{
    ensure_genesis, AnchorEngine, BlockAppender, BlockStore, CalendarWriter, Signer,
};
use dtsn_common::bus::{MemoryBus, MessageBus};
use dtsn_common::config::Config;
use dtsn_common::leader::{LeaderState, ROLE_AUDIT_PRODUCER, ROLE_CALENDAR};
use dtsn_common::lock::LockService;
use dtsn_node::{router, AppState, InboundDispatcher};

#[derive(Parser, Debug)]
#[command(name = "dtsn-node", about = "DTSN calendar core service")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let cfg = match &args.config {
        Some(path) => Config::load_from_file(path).context("loading config")?,
        None => {
            let mut cfg = Config::default();
            cfg.apply_env();
            cfg
        }
    };
    info!(stack_id = %cfg.stack_id, "starting dtsn core");

    // storage
    let store = Arc::new(
        BlockStore::open(Path::new(&cfg.data_dir).join("calendar"))
            .context("opening block store")?,
    );
    let reg_store =
        RegistryStore::open(Path::new(&cfg.data_dir).join("registry")).context("opening registry")?;

    // signing identity
    let secret = cfg
        .signing_secret
        .clone()
        .ok_or_else(|| anyhow!("no signing secret: set DTSN_SIGNING_SECRET or config"))?;
    let signer = Arc::new(Signer::from_base64_secret(&secret).context("loading signing secret")?);
    info!(fingerprint = %signer.fingerprint(), "signing identity loaded");

    // coordination + collaborators
    let locks = LockService::with_ttl(Duration::from_secs(cfg.calendar.lock_ttl_secs));
    let leader = Arc::new(LeaderState::holding(&[ROLE_CALENDAR, ROLE_AUDIT_PRODUCER]));
    let bus: Arc<dyn MessageBus> = Arc::new(MemoryBus::new());
    let token: Arc<dyn TokenService> =
        Arc::new(HttpTokenService::new(cfg.token_service_uri.clone())?);

    let appender = BlockAppender::new(Arc::clone(&store), Arc::clone(&signer), cfg.stack_id.clone());
    ensure_genesis(&appender, &locks).await?;

    // engines
    let writer = Arc::new(CalendarWriter::new(
        appender.clone(),
        Arc::clone(&bus),
        locks.clone(),
        Arc::clone(&leader),
        cfg.calendar.tick_secs,
    ));
    let anchor = Arc::new(AnchorEngine::new(
        appender.clone(),
        Arc::clone(&bus),
        locks.clone(),
        Arc::clone(&leader),
    ));
    let challenge = Arc::new(ChallengeManager::new(Arc::clone(&store), reg_store.clone()));
    let audit = Arc::new(AuditEngine::new(
        reg_store.clone(),
        challenge,
        Arc::clone(&bus),
        Arc::clone(&leader),
        Arc::clone(&token),
        Arc::new(HttpNodeClient::new()?),
        cfg.audit.clone(),
    ));
    let reward = Arc::new(RewardEngine::new(
        appender,
        locks.clone(),
        Arc::clone(&bus),
        Arc::clone(&token),
    ));
    let dispatcher = Arc::new(InboundDispatcher::new(
        Arc::clone(&bus),
        Arc::clone(&writer),
        Arc::clone(&anchor),
        reward,
    ));

    tokio::spawn(Arc::clone(&writer).run());
    tokio::spawn(Arc::clone(&anchor).run());
    tokio::spawn(Arc::clone(&audit).run_producer());
    tokio::spawn(Arc::clone(&audit).run_worker());
    tokio::spawn(Arc::clone(&dispatcher).run());

    // HTTP surface
    let state = Arc::new(AppState {
        registry: NodeRegistry::new(reg_store, token, cfg.audit.clone()),
        store,
        blacklist: cfg.blacklist.clone(),
    });
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr)
        .await
        .with_context(|| format!("binding {}", cfg.bind_addr))?;
    info!(bind_addr = %cfg.bind_addr, "http surface listening");
    axum::serve(listener, app).await.context("http server")?;

    Ok(())
}
