//! `flowwatch` -- follow one execution from the terminal.
//!
//! Usage: `flowwatch <execution-id>`
//!
//! Streams logs, status changes, node updates, and errors for the
//! execution until it completes or fails, then exits. Exit status is 0 on
//! completion, 1 on failure or error, and 130 when interrupted.
//!
//! # Environment variables
//!
//! | Variable                           | Default                     |
//! |------------------------------------|-----------------------------|
//! | `FLOWWATCH_API_URL`                | `http://localhost:8000/api` |
//! | `FLOWWATCH_WS_URL`                 | derived from the API URL    |
//! | `FLOWWATCH_POLL_INTERVAL_MS`       | `2000`                      |
//! | `FLOWWATCH_MAX_RECONNECT_ATTEMPTS` | `5`                         |
//! | `FLOWWATCH_ENABLE_PUSH`            | `true`                      |
//! | `FLOWWATCH_ENABLE_POLLING`         | `true`                      |
//! | `FLOWWATCH_LOG_JSON`               | unset (human-readable logs) |

use anyhow::Context;

use flowwatch_core::execution::ExecutionStatus;
use flowwatch_monitor::MonitorConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    flowwatch_watch::init_tracing();

    let execution_id = std::env::args()
        .nth(1)
        .context("usage: flowwatch <execution-id>")?;
    let config = MonitorConfig::from_env().context("invalid configuration")?;

    tracing::info!(
        execution_id = %execution_id,
        api_url = %config.api_url,
        ws_url = %config.ws_url,
        poll_interval_ms = config.poll.interval.as_millis() as u64,
        "Starting flowwatch",
    );

    let outcome = flowwatch_watch::run(&execution_id, config).await?;

    let code = match outcome {
        Some(ExecutionStatus::Completed) => 0,
        Some(status) => {
            tracing::warn!(execution_id = %execution_id, status = %status, "Execution did not complete");
            1
        }
        None => 130,
    };
    std::process::exit(code);
}
