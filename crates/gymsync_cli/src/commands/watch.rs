//! Watch command implementation.

use super::Endpoint;
use gymsync_engine::{DataChange, StatusEvent, ALL_TABLES};
use serde_json::json;
use std::time::Duration;
use tracing::{error, info, warn};

fn change_line(change: &DataChange) -> String {
    json!({
        "table": change.table,
        "operation": change.operation,
        "operation_id": change.operation_id,
        "resolved_with": change.resolved_with,
        "data": change.data,
    })
    .to_string()
}

/// Runs the watch command.
pub async fn run(
    endpoint: &Endpoint,
    tables: Vec<String>,
    duration: Option<Duration>,
) -> Result<(), Box<dyn std::error::Error>> {
    let engine = endpoint.engine(tables)?;

    engine.add_data_callback(ALL_TABLES, |change| println!("{}", change_line(change)));
    engine.add_conflict_callback(|conflict| match serde_json::to_string(conflict) {
        Ok(line) => println!("{{\"conflict\":{line}}}"),
        Err(err) => error!(error = %err, "failed to render conflict"),
    });
    engine.add_status_callback(|event| match event {
        StatusEvent::StateChanged(state) => info!(%state, "connection state"),
        StatusEvent::ReconnectExhausted { attempts } => {
            warn!(attempts, "server unreachable, run again to retry")
        }
        StatusEvent::ConnectionRejected { reason } => {
            warn!(%reason, "server rejected the session, check the token")
        }
        StatusEvent::DeliveryExhausted { operation_id, .. } => {
            warn!(%operation_id, "operation dropped")
        }
    });
    engine.start()?;

    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => tokio::signal::ctrl_c().await?,
    }

    let stats = engine.get_stats();
    engine.stop().await;
    eprintln!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
