#![allow(dead_code)]

use durable_fanout::providers::fs::FsHistoryStore;
use durable_fanout::providers::in_memory::InMemoryHistoryStore;
use durable_fanout::providers::HistoryStore;
use durable_fanout::Event;
use std::sync::Arc as StdArc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

pub async fn wait_for_history<F>(store: StdArc<dyn HistoryStore>, instance: &str, predicate: F, timeout_ms: u64) -> bool
where
    F: Fn(&Vec<Event>) -> bool,
{
    wait_for_history_event(
        store,
        instance,
        |hist| if predicate(hist) { Some(()) } else { None },
        timeout_ms,
    )
    .await
    .is_some()
}

pub async fn wait_for_history_event<T, F>(
    store: StdArc<dyn HistoryStore>,
    instance: &str,
    selector: F,
    timeout_ms: u64,
) -> Option<T>
where
    F: Fn(&Vec<Event>) -> Option<T>,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        let hist = store.read(instance).await;
        if let Some(v) = selector(&hist) {
            return Some(v);
        }
        if Instant::now() > deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn fs_store() -> (StdArc<dyn HistoryStore>, TempDir) {
    let td = tempfile::tempdir().unwrap();
    let store = StdArc::new(FsHistoryStore::new(td.path(), true)) as StdArc<dyn HistoryStore>;
    (store, td)
}

pub fn mem_store() -> StdArc<dyn HistoryStore> {
    StdArc::new(InMemoryHistoryStore::default()) as StdArc<dyn HistoryStore>
}

pub fn count_completions(hist: &[Event]) -> usize {
    hist.iter().filter(|e| e.completion_id().is_some()).count()
}
