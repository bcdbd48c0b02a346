//! Character-count fan-out: one activity per work item, then a single
//! aggregation activity over all results in scheduling order.

use std::collections::BTreeMap;

use tracing::info;

use crate::OrchestrationContext;

pub const PARALLEL_PROCESSING_ORCHESTRATION: &str = "ParallelProcessingOrchestration";
pub const PROCESS_WORK_ITEM_ACTIVITY: &str = "ProcessWorkItem";
pub const AGGREGATE_RESULTS_ACTIVITY: &str = "AggregateResults";

/// Work item -> character count.
pub type CharCounts = BTreeMap<String, u64>;

/// Map an item to a one-entry result keyed by itself. Counts characters,
/// not bytes.
pub fn process_work_item(item: &str) -> CharCounts {
    let mut out = CharCounts::new();
    out.insert(item.to_string(), item.chars().count() as u64);
    out
}

/// Merge all maps; for a repeated key the later map wins.
pub fn aggregate_results(results: &[CharCounts]) -> CharCounts {
    let mut merged = CharCounts::new();
    for result in results {
        for (k, v) in result {
            merged.insert(k.clone(), *v);
        }
    }
    merged
}

pub(crate) async fn process_work_item_activity(item: String) -> Result<String, String> {
    info!(work_item = %item, "processing work item");
    let result = process_work_item(&item);
    serde_json::to_string(&result).map_err(|e| e.to_string())
}

pub(crate) async fn aggregate_results_activity(results: Vec<CharCounts>) -> Result<CharCounts, String> {
    info!(count = results.len(), "aggregating results");
    let merged = aggregate_results(&results);
    info!(count = merged.len(), "aggregated work items into final result");
    Ok(merged)
}

/// Fan out `ProcessWorkItem` over `work_items`, wait for all, then fan in
/// through `AggregateResults`. The first failed item fails the instance.
pub async fn parallel_processing(ctx: OrchestrationContext, work_items: Vec<String>) -> Result<CharCounts, String> {
    crate::durable_info!(ctx, items = work_items.len(), "fanning out work items");
    let tasks = work_items
        .iter()
        .map(|item| ctx.schedule_activity(PROCESS_WORK_ITEM_ACTIVITY, item.clone()))
        .collect();
    let results: Vec<CharCounts> = match ctx.join_typed(tasks).await {
        Ok(results) => results,
        Err(error) => {
            crate::durable_error!(ctx, error = %error, "work item failed, skipping aggregation");
            return Err(error);
        }
    };
    ctx.schedule_activity_typed(AGGREGATE_RESULTS_ACTIVITY, &results)
        .into_activity_typed::<CharCounts>()
        .await
}
