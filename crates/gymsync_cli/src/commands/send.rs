//! Send command implementation.

use super::Endpoint;
use gymsync_engine::{StatusEvent, SyncEngine};
use gymsync_protocol::OperationType;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Runs the send command.
pub async fn run(
    endpoint: &Endpoint,
    table: &str,
    operation: &str,
    data: &str,
    timeout: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let operation: OperationType = operation.parse()?;
    let data: Value = serde_json::from_str(data)?;

    let engine = endpoint.engine(Vec::new())?;
    engine.add_status_callback(|event| match event {
        StatusEvent::StateChanged(state) => info!(%state, "connection state"),
        StatusEvent::ReconnectExhausted { attempts } => {
            warn!(attempts, "server unreachable, giving up")
        }
        StatusEvent::ConnectionRejected { reason } => warn!(%reason, "server rejected the session"),
        StatusEvent::DeliveryExhausted {
            operation_id,
            attempts,
            ..
        } => warn!(%operation_id, attempts, "operation dropped"),
    });
    engine.start()?;

    let id = engine.send_operation(table, operation, data)?;
    info!(operation_id = %id, table, "operation queued");

    let delivered = wait_for_delivery(&engine, timeout).await;
    let stats = engine.get_stats();
    engine.stop().await;

    let report = json!({
        "operation_id": id,
        "delivered": delivered,
        "stats": stats,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !delivered {
        return Err(format!("operation {id} was not delivered within {timeout:?}").into());
    }
    Ok(())
}

async fn wait_for_delivery(engine: &SyncEngine, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        let stats = engine.get_stats();
        if stats.operations_sent > 0 {
            return true;
        }
        if stats.delivery_failures > 0 || Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
