//! Terminal tail of one execution, built on the monitor's public API.
//!
//! [`run`] subscribes to a single execution, reports every update through
//! `tracing`, and returns once the execution finishes or the process is
//! interrupted.

use flowwatch_core::execution::ExecutionStatus;
use flowwatch_monitor::events::completion_status;
use flowwatch_monitor::{ExecutionHandlers, MonitorConfig, SubscriptionCoordinator};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Default log filter when `RUST_LOG` is unset.
const DEFAULT_FILTER: &str = "flowwatch=info,flowwatch_watch=info,flowwatch_monitor=info";

/// Install the global subscriber. `FLOWWATCH_LOG_JSON=1` selects JSON
/// output.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_FILTER.into());
    let json = std::env::var("FLOWWATCH_LOG_JSON").is_ok_and(|v| v == "1" || v == "true");

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Short human summary of a node-state payload.
pub fn describe_node(node_state: &serde_json::Value) -> String {
    let status = node_state
        .get("status")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("updated");
    match node_state.get("error").and_then(serde_json::Value::as_str) {
        Some(error) => format!("{status}: {error}"),
        None => status.to_string(),
    }
}

/// Handlers that log every update and publish the terminal status to
/// `finished`.
pub fn watch_handlers(
    execution_id: &str,
    finished: watch::Sender<Option<ExecutionStatus>>,
) -> ExecutionHandlers {
    let finished = std::sync::Arc::new(finished);
    let (on_status, on_completion) = (finished.clone(), finished);
    let (id_log, id_status, id_node, id_done, id_error) = (
        execution_id.to_string(),
        execution_id.to_string(),
        execution_id.to_string(),
        execution_id.to_string(),
        execution_id.to_string(),
    );

    ExecutionHandlers::new()
        .on_log(move |entry| {
            tracing::info!(
                execution_id = %id_log,
                level = entry.level.as_deref().unwrap_or("info"),
                node_id = entry.node_id.as_deref().unwrap_or("-"),
                "{}",
                entry.message,
            );
        })
        .on_status(move |status| {
            tracing::info!(execution_id = %id_status, status = %status, "Status changed");
            if let Ok(status) = status.parse::<ExecutionStatus>() {
                if status.is_terminal() {
                    on_status.send_replace(Some(status));
                }
            }
        })
        .on_node_update(move |node_id, node_state| {
            tracing::info!(
                execution_id = %id_node,
                node_id = %node_id,
                state = %describe_node(&node_state),
                "Node updated",
            );
        })
        .on_completion(move |result| {
            let status = completion_status(&result);
            tracing::info!(
                execution_id = %id_done,
                status = %status,
                result = %result,
                "Execution finished",
            );
            on_completion.send_replace(Some(status));
        })
        .on_error(move |error| {
            tracing::error!(execution_id = %id_error, error = %error, "Execution error");
        })
}

/// Follow `execution_id` until it finishes or Ctrl-C is pressed.
///
/// Returns the terminal status, or `None` when interrupted.
pub async fn run(
    execution_id: &str,
    config: MonitorConfig,
) -> anyhow::Result<Option<ExecutionStatus>> {
    let (tx, mut rx) = watch::channel(None);
    let coordinator = SubscriptionCoordinator::from_config(config);

    coordinator
        .subscribe(execution_id, watch_handlers(execution_id, tx))
        .await?;

    let outcome = tokio::select! {
        changed = rx.wait_for(Option::is_some) => match changed {
            Ok(status) => *status,
            Err(_) => None,
        },
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, shutting down");
            None
        }
    };

    coordinator.shutdown().await;
    Ok(outcome)
}
