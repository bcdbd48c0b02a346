use std::sync::Arc;
use std::time::Duration;

use durable_fanout::config::ConnectionConfig;
use durable_fanout::providers::fs::FsHistoryStore;
use durable_fanout::providers::in_memory::InMemoryHistoryStore;
use durable_fanout::providers::HistoryStore;
use durable_fanout::runtime::{ActivityRegistry, OrchestrationRegistry, Runtime};
use durable_fanout::workloads::{self, CharCounts, PrimesInput};
use durable_fanout::{client::RuntimeStatus, logging};
use tracing::{error, info, warn};

const WORK_ITEMS: [&str; 5] = ["Task1", "Task2", "Task3", "LongerTask4", "VeryLongTask5"];
const WAIT_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_tracing();

    let cfg = ConnectionConfig::from_env();
    if cfg.is_local_emulator() {
        info!("using local emulator with no authentication");
    } else {
        info!("using remote endpoint with default credential authentication");
    }
    info!(endpoint = %cfg.endpoint, task_hub = %cfg.task_hub, host = %cfg.host_address, "connection settings");
    info!(connection_string = %cfg.connection_string());

    let store: Arc<dyn HistoryStore> = match std::env::var("FANOUT_DATA_DIR") {
        Ok(dir) => {
            info!(dir = %dir, "using filesystem history store");
            Arc::new(FsHistoryStore::new(dir, false))
        }
        Err(_) => Arc::new(InMemoryHistoryStore::default()),
    };

    let activities = workloads::register_activities(ActivityRegistry::builder()).build_result()?;
    let orchestrations = workloads::register_orchestrations(OrchestrationRegistry::builder()).build_result()?;
    let rt = Runtime::start_with_store(store, Arc::new(activities), orchestrations).await;
    let client = rt.client();

    let items: Vec<String> = WORK_ITEMS.iter().map(|s| s.to_string()).collect();
    info!(count = items.len(), items = ?items, "starting parallel processing orchestration");
    let id = client
        .schedule_new_orchestration_typed(workloads::char_count::PARALLEL_PROCESSING_ORCHESTRATION, &items)
        .await?;
    info!(instance = %id, "waiting for orchestration to complete");
    let inst = client.wait_for_instance(&id, true, WAIT_TIMEOUT).await?;
    info!(status = %inst.status, "orchestration finished");
    match inst.status {
        RuntimeStatus::Completed => {
            let results: CharCounts = inst.read_output()?;
            if results.is_empty() {
                warn!("no results were returned from the orchestration");
            }
            for (item, len) in &results {
                info!(work_item = %item, result = len, "processing result");
            }
            info!(count = results.len(), "total items processed");
        }
        RuntimeStatus::Failed => {
            let message = inst.failure.as_ref().map(|f| f.message().to_string()).unwrap_or_default();
            error!(error = %message, "orchestration failed");
        }
        other => warn!(status = %other, "orchestration ended without output"),
    }

    let input = PrimesInput {
        max: 100_000,
        parallel: 8,
        clamp_last: false,
    };
    let id = client
        .schedule_new_orchestration_typed(workloads::primes::PRIMES_ORCHESTRATION, &input)
        .await?;
    let inst = client.wait_for_completion(&id, WAIT_TIMEOUT).await?;
    match inst.read_output::<u64>() {
        Ok(total) => info!(total, max = input.max, "primes orchestration completed"),
        Err(e) => error!(error = %e, failure = ?inst.failure, "primes orchestration did not complete"),
    }

    rt.shutdown().await;
    Ok(())
}
