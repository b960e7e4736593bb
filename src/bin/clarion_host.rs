//! Local development host for the call orchestrator.
//!
//! Runs the bot start endpoint against in-memory stores. The managed
//! platform drives the same `CallSession` through its own runner; this
//! binary exists so workflows can be exercised end to end on a laptop.

use std::path::PathBuf;
use std::sync::Arc;

use clarion::server::{DEFAULT_BOT_PORT, HostState, serve};
use clarion::store::MemoryStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    clarion::logging::setup_logging();

    let port = std::env::var("BOT_PORT")
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(DEFAULT_BOT_PORT);
    let workflows_root = std::env::var("WORKFLOWS_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("workflows"));

    if !workflows_root.is_dir() {
        anyhow::bail!(
            "workflows directory not found: {} (set WORKFLOWS_DIR)",
            workflows_root.display()
        );
    }

    let store = MemoryStore::shared();
    let state = Arc::new(HostState {
        workflows_root,
        sessions: store.clone(),
        patients: store,
    });

    tracing::info!("local development mode, press Ctrl+C to stop");
    serve(state, port).await?;
    Ok(())
}
