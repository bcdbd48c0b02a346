//! End-to-end samples: start a runtime, drive the reference fan-out
//! workloads through the client, and inspect the resulting history.
//!
//! Each test doubles as usage documentation for the public API.

use durable_fanout::client::RuntimeStatus;
use durable_fanout::providers::HistoryStore;
use durable_fanout::runtime::{ActivityRegistry, OrchestrationRegistry, Runtime};
use durable_fanout::workloads::primes::Boundary;
use durable_fanout::workloads::{self, CharCounts, PrimesInput};
use durable_fanout::{ClientError, ErrorDetails, Event, OrchestrationContext};
use std::sync::Arc;
use std::sync::Arc as StdArc;
use std::time::Duration;
mod common;

const WAIT: Duration = Duration::from_secs(5);

async fn sample_runtime(store: StdArc<dyn HistoryStore>) -> Arc<Runtime> {
    let activities = workloads::register_activities(ActivityRegistry::builder())
        .build_result()
        .unwrap();
    let orchestrations = workloads::register_orchestrations(OrchestrationRegistry::builder())
        .build_result()
        .unwrap();
    Runtime::start_with_store(store, Arc::new(activities), orchestrations).await
}

/// Fan out one `ProcessWorkItem` per item and fan in through `AggregateResults`.
///
/// Highlights:
/// - one `ActivityScheduled` per item plus one for the aggregation
/// - the output maps each item to its character count
async fn char_count_sample_with(store: StdArc<dyn HistoryStore>) {
    let rt = sample_runtime(store.clone()).await;
    let client = rt.client();

    let items = vec!["x".to_string(), "yy".to_string(), "zzz".to_string()];
    let id = client
        .schedule_new_orchestration_typed(workloads::char_count::PARALLEL_PROCESSING_ORCHESTRATION, &items)
        .await
        .unwrap();
    let inst = client.wait_for_completion(&id, WAIT).await.unwrap();
    assert_eq!(inst.status, RuntimeStatus::Completed, "failure: {:?}", inst.failure);

    let counts: CharCounts = inst.read_output().unwrap();
    let expected = CharCounts::from([("x".to_string(), 1), ("yy".to_string(), 2), ("zzz".to_string(), 3)]);
    assert_eq!(counts, expected);

    let hist = store.read(&id).await;
    let scheduled: Vec<&str> = hist
        .iter()
        .filter_map(|e| match e {
            Event::ActivityScheduled { name, .. } => Some(name.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(
        scheduled,
        vec!["ProcessWorkItem", "ProcessWorkItem", "ProcessWorkItem", "AggregateResults"]
    );
    assert_eq!(common::count_completions(&hist), 4);
    assert!(matches!(hist.last(), Some(Event::OrchestrationCompleted { .. })));
    assert_eq!(inst.history_len, hist.len() as u64);

    rt.shutdown().await;
}

#[tokio::test]
async fn char_count_sample_fs() {
    let (store, _td) = common::fs_store();
    char_count_sample_with(store).await;
}

#[tokio::test]
async fn char_count_sample_in_memory() {
    char_count_sample_with(common::mem_store()).await;
}

#[tokio::test]
async fn char_count_default_work_items() {
    let rt = sample_runtime(common::mem_store()).await;
    let client = rt.client();
    let items: Vec<String> = ["Task1", "Task2", "Task3", "LongerTask4", "VeryLongTask5"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let id = client
        .schedule_new_orchestration_typed(workloads::char_count::PARALLEL_PROCESSING_ORCHESTRATION, &items)
        .await
        .unwrap();
    let counts: CharCounts = client.wait_for_completion(&id, WAIT).await.unwrap().read_output().unwrap();
    assert_eq!(counts.len(), 5);
    assert_eq!(counts["Task1"], 5);
    assert_eq!(counts["LongerTask4"], 11);
    assert_eq!(counts["VeryLongTask5"], 13);
    rt.shutdown().await;
}

/// An empty fan-out resolves immediately and aggregates nothing.
#[tokio::test]
async fn char_count_with_no_items() {
    let rt = sample_runtime(common::mem_store()).await;
    let client = rt.client();
    let id = client
        .schedule_new_orchestration_typed(
            workloads::char_count::PARALLEL_PROCESSING_ORCHESTRATION,
            &Vec::<String>::new(),
        )
        .await
        .unwrap();
    let counts: CharCounts = client.wait_for_completion(&id, WAIT).await.unwrap().read_output().unwrap();
    assert!(counts.is_empty());
    rt.shutdown().await;
}

/// Count primes in [1, 100] over four partitions.
///
/// Highlights:
/// - four `CalculatePrimes` activities, one per boundary
/// - the sum across boundaries is 25
#[tokio::test]
async fn primes_sample_fs() {
    let (store, _td) = common::fs_store();
    let rt = sample_runtime(store.clone()).await;
    let client = rt.client();
    let input = PrimesInput {
        max: 100,
        parallel: 4,
        clamp_last: false,
    };
    let id = client
        .schedule_new_orchestration_typed(workloads::primes::PRIMES_ORCHESTRATION, &input)
        .await
        .unwrap();
    let inst = client.wait_for_completion(&id, WAIT).await.unwrap();
    assert_eq!(inst.read_output::<u64>().unwrap(), 25);

    let hist = store.read(&id).await;
    let boundaries: Vec<Boundary> = hist
        .iter()
        .filter_map(|e| match e {
            Event::ActivityScheduled { name, input, .. } if name == "CalculatePrimes" => {
                Some(serde_json::from_str(input).unwrap())
            }
            _ => None,
        })
        .collect();
    assert_eq!(boundaries.len(), 4);
    assert_eq!(boundaries[0], Boundary { start: 1, end: 25 });
    assert_eq!(boundaries[3], Boundary { start: 76, end: 100 });
    rt.shutdown().await;
}

#[tokio::test]
async fn primes_clamped_covers_remainder() {
    let rt = sample_runtime(common::mem_store()).await;
    let client = rt.client();
    // 101 is prime but falls in the uncovered remainder unless the last boundary is clamped
    let faithful = client
        .schedule_new_orchestration_typed(
            workloads::primes::PRIMES_ORCHESTRATION,
            &PrimesInput {
                max: 101,
                parallel: 4,
                clamp_last: false,
            },
        )
        .await
        .unwrap();
    let clamped = client
        .schedule_new_orchestration_typed(
            workloads::primes::PRIMES_ORCHESTRATION,
            &PrimesInput {
                max: 101,
                parallel: 4,
                clamp_last: true,
            },
        )
        .await
        .unwrap();
    let a = client.wait_for_completion(&faithful, WAIT).await.unwrap();
    let b = client.wait_for_completion(&clamped, WAIT).await.unwrap();
    assert_eq!(a.read_output::<u64>().unwrap(), 25);
    assert_eq!(b.read_output::<u64>().unwrap(), 26);
    rt.shutdown().await;
}

#[tokio::test]
async fn primes_with_zero_parallelism_fails() {
    let rt = sample_runtime(common::mem_store()).await;
    let client = rt.client();
    let id = client
        .schedule_new_orchestration_typed(
            workloads::primes::PRIMES_ORCHESTRATION,
            &PrimesInput {
                max: 100,
                parallel: 0,
                clamp_last: false,
            },
        )
        .await
        .unwrap();
    let inst = client.wait_for_completion(&id, WAIT).await.unwrap();
    assert_eq!(inst.status, RuntimeStatus::Failed);
    assert_eq!(
        inst.failure,
        Some(ErrorDetails::Application {
            message: "parallel must be at least 1".to_string()
        })
    );
    assert!(matches!(inst.read_output::<u64>(), Err(ClientError::NotCompleted { .. })));
    rt.shutdown().await;
}

/// One failing member fails the whole fan-out.
///
/// Highlights:
/// - every member still runs and records an outcome
/// - the instance fails with the member's error and never schedules the aggregation
#[tokio::test]
async fn failure_in_fan_out_fails_instance() {
    let store = common::mem_store();
    let activities = ActivityRegistry::builder()
        .register("Check", |input: String| async move {
            if input == "bad" {
                Err(format!("rejected: {input}"))
            } else {
                Ok(input.len().to_string())
            }
        })
        .register("Sum", |_input: String| async move { Ok("unused".to_string()) })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("Validate", |ctx: OrchestrationContext, _input: String| async move {
            let tasks = ["a", "bad", "ccc"]
                .iter()
                .map(|i| ctx.schedule_activity("Check", *i))
                .collect();
            let lens: Vec<u64> = ctx.join_typed(tasks).await?;
            ctx.schedule_activity_typed("Sum", &lens).into_activity().await
        })
        .build();
    let rt = Runtime::start_with_store(store.clone(), Arc::new(activities), orchestrations).await;
    let client = rt.client();

    let id = client.schedule_new_orchestration("Validate", "").await.unwrap();
    let inst = client.wait_for_completion(&id, WAIT).await.unwrap();
    assert_eq!(inst.status, RuntimeStatus::Failed);
    let failure = inst.failure.unwrap();
    assert_eq!(failure.kind(), "application");
    assert_eq!(failure.message(), "rejected: bad");

    let hist = store.read(&id).await;
    assert_eq!(common::count_completions(&hist), 3);
    assert!(!hist
        .iter()
        .any(|e| matches!(e, Event::ActivityScheduled { name, .. } if name == "Sum")));
    rt.shutdown().await;
}

/// A wait that times out leaves the instance running; a later wait sees it finish.
#[tokio::test]
async fn wait_timeout_then_completion() {
    let activities = ActivityRegistry::builder()
        .register("Slow", |input: String| async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(format!("slow:{input}"))
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("SlowOrch", |ctx: OrchestrationContext, input: String| async move {
            ctx.schedule_activity("Slow", input).into_activity().await
        })
        .build();
    let rt = Runtime::start(Arc::new(activities), orchestrations).await;
    let client = rt.client();

    let id = client.schedule_new_orchestration("SlowOrch", "1").await.unwrap();
    match client.wait_for_instance(&id, false, Duration::from_millis(20)).await {
        Err(ClientError::Timeout { instance, .. }) => assert_eq!(instance, id),
        other => panic!("expected timeout, got {other:?}"),
    }
    let snapshot = client.get_instance(&id, false).await.unwrap().unwrap();
    assert!(!snapshot.status.is_terminal());

    let inst = client.wait_for_completion(&id, WAIT).await.unwrap();
    assert_eq!(inst.status, RuntimeStatus::Completed);
    assert_eq!(inst.output.as_deref(), Some("slow:1"));
    rt.shutdown().await;
}

/// Terminate a fan-out while its activities are still running.
///
/// Highlights:
/// - the instance ends `Terminated` with the given reason
/// - late activity completions are discarded
#[tokio::test]
async fn terminate_running_instance() {
    let (store, _td) = common::fs_store();
    let activities = ActivityRegistry::builder()
        .register("Sleep", |input: String| async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(input)
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("Sleepy", |ctx: OrchestrationContext, _input: String| async move {
            let a = ctx.schedule_activity("Sleep", "a");
            let b = ctx.schedule_activity("Sleep", "b");
            let out = ctx.join(vec![a, b]).await;
            Ok(format!("{}", out.len()))
        })
        .build();
    let rt = Runtime::start_with_store(store.clone(), Arc::new(activities), orchestrations).await;
    let client = rt.client();

    let id = client.schedule_new_orchestration("Sleepy", "").await.unwrap();
    assert!(
        common::wait_for_history(
            store.clone(),
            &id,
            |h| h.iter().any(|e| matches!(e, Event::ActivityScheduled { .. })),
            2_000
        )
        .await
    );
    client.terminate_instance(&id, "operator request").await.unwrap();

    let inst = client.wait_for_completion(&id, WAIT).await.unwrap();
    assert_eq!(inst.status, RuntimeStatus::Terminated);
    assert_eq!(inst.termination_reason.as_deref(), Some("operator request"));

    // Let the sleeping activities report back
    tokio::time::sleep(Duration::from_millis(400)).await;
    let hist = store.read(&id).await;
    assert!(matches!(hist.last(), Some(Event::OrchestrationTerminated { .. })));
    assert!(hist
        .iter()
        .any(|e| matches!(e, Event::OrchestrationCancelRequested { reason } if reason == "operator request")));
    assert_eq!(common::count_completions(&hist), 0);

    // Terminating a finished instance changes nothing
    client.terminate_instance(&id, "again").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.read(&id).await, hist);
    rt.shutdown().await;
}

#[tokio::test]
async fn unknown_instances_are_reported() {
    let rt = sample_runtime(common::mem_store()).await;
    let client = rt.client();
    assert!(client.get_instance("nope", true).await.unwrap().is_none());
    assert!(matches!(
        client.wait_for_instance("nope", false, Duration::from_millis(50)).await,
        Err(ClientError::NotFound(_))
    ));
    assert!(matches!(
        client.terminate_instance("nope", "x").await,
        Err(ClientError::NotFound(_))
    ));
    rt.shutdown().await;
}

#[tokio::test]
async fn duplicate_instance_id_is_rejected() {
    let store = common::mem_store();
    let client = durable_fanout::Client::new(store.clone());
    client
        .schedule_new_orchestration_with_id("inst-dup", "PrimesOrchestration", "{}")
        .await
        .unwrap();
    let err = client
        .schedule_new_orchestration_with_id("inst-dup", "PrimesOrchestration", "{}")
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Rejected(_)), "got {err:?}");

    // Without a runtime the instance never leaves NotStarted
    let inst = client.get_instance("inst-dup", true).await.unwrap().unwrap();
    assert_eq!(inst.status, RuntimeStatus::NotStarted);
    assert_eq!(inst.name, "PrimesOrchestration");
    assert_eq!(inst.input.as_deref(), Some("{}"));
    assert_eq!(inst.history_len, 1);
    assert_eq!(client.list_instances().await, vec!["inst-dup".to_string()]);
}

#[tokio::test]
async fn system_activities_are_recorded() {
    let store = common::mem_store();
    let orchestrations = OrchestrationRegistry::builder()
        .register("Stamp", |ctx: OrchestrationContext, _input: String| async move {
            let now = ctx.system_now_ms().await?;
            let guid = ctx.system_new_guid().await?;
            Ok(format!("{}:{}", now > 0, guid.len()))
        })
        .build();
    let rt = Runtime::start_with_store(store.clone(), Arc::new(ActivityRegistry::builder().build()), orchestrations)
        .await;
    let client = rt.client();
    let id = client.schedule_new_orchestration("Stamp", "").await.unwrap();
    let inst = client.wait_for_completion(&id, WAIT).await.unwrap();
    assert_eq!(inst.output.as_deref(), Some("true:36"));
    assert_eq!(common::count_completions(&store.read(&id).await), 2);
    rt.shutdown().await;
}
