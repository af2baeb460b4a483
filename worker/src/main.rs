//! Waypoint Replay - drains a recorded mutation log through the sync processor.
//!
//! Reads a JSON array of mutations, pushes them against the in-memory remote
//! and prints the final upload state. Useful for checking coalescing and
//! retry behavior without a device.
//!
//! ```text
//! waypoint-replay mutations.json
//! ```
//!
//! Each entry looks like
//! `{"table": "entries", "recordId": "e1", "operation": "update", "payload": {...}}`.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use waypoint_engine::Operation;
use waypoint_sync::memory::{MemoryBlobStore, MemoryRecordStore, MemoryRemoteStore};
use waypoint_sync::{Collaborators, Config, StaticNetwork, SyncEvent, SyncProcessor};

/// One recorded local mutation.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Mutation {
    table: String,
    record_id: String,
    operation: Operation,
    #[serde(default)]
    payload: Option<Value>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "waypoint_sync=debug,waypoint_replay=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    let path = std::env::args()
        .nth(1)
        .ok_or("usage: waypoint-replay <mutations.json>")?;
    let mutations: Vec<Mutation> = serde_json::from_slice(&tokio::fs::read(&path).await?)?;
    tracing::info!("Replaying {} mutations from {}", mutations.len(), path);

    let remote = Arc::new(MemoryRemoteStore::new());
    let collaborators = Collaborators {
        store: Arc::new(MemoryRecordStore::new()),
        remote: remote.clone(),
        network: Arc::new(StaticNetwork::wifi()),
        blobs: Some(Arc::new(MemoryBlobStore::new())),
    };
    let processor = SyncProcessor::new(config, collaborators);

    let mut subscription = processor.subscribe();
    let subscription_id = subscription.id.clone();
    let printer = tokio::spawn(async move {
        while let Some(event) = subscription.recv().await {
            if matches!(event, SyncEvent::StateChanged { .. }) {
                continue;
            }
            if let Ok(line) = serde_json::to_string(&event) {
                println!("{}", line);
            }
        }
    });

    for mutation in mutations {
        processor
            .enqueue(
                &mutation.table,
                &mutation.record_id,
                mutation.operation,
                mutation.payload,
            )
            .await?;
    }

    let queued = processor.state().await.pending_count;
    tracing::info!("{} items queued after coalescing", queued);

    processor.start();
    processor.wait_idle().await;

    let state = processor.state().await;
    processor.unsubscribe(&subscription_id);
    printer.await?;

    tracing::info!("{} remote calls made", remote.call_count());
    println!("{}", serde_json::to_string_pretty(&state)?);

    Ok(())
}
