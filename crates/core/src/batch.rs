use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use crate::checkpoint::{CheckpointEntry, CheckpointStore, ItemStatus};
use crate::error::Result;

/// One unit of processing: a video, a transcript, or a comment.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub id: String,
    pub payload: String,
}

impl WorkItem {
    pub fn new(id: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
        }
    }
}

/// Per-item outcome, in input order. `output` holds the transform's result
/// for done items (fresh or replayed from the checkpoint), `error` the
/// failure text for failed ones.
#[derive(Debug, Clone)]
pub struct ItemOutcome {
    pub id: String,
    pub status: ItemStatus,
    pub output: Option<String>,
    pub error: Option<String>,
    pub from_checkpoint: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub failed_ids: Vec<String>,
}

#[derive(Debug)]
pub struct BatchReport {
    pub outcomes: Vec<ItemOutcome>,
    pub summary: RunSummary,
    pub interrupted: bool,
}

impl BatchReport {
    /// Outputs of all done items, in input order.
    pub fn done_outputs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.outcomes.iter().filter_map(|o| {
            (o.status == ItemStatus::Done)
                .then(|| o.output.as_deref().map(|out| (o.id.as_str(), out)))
                .flatten()
        })
    }
}

/// Drives sequential, checkpointed iteration over a set of work items.
///
/// Items already `Done` in the checkpoint are replayed from their stored
/// result and never reprocessed. Per-item failures are recorded and the run
/// continues, unless the error is fatal or `fail_fast` is set. A shutdown
/// signal is honored at the item boundary: the in-flight item's checkpoint
/// write completes, then the run stops without starting new items.
pub struct BatchProcessor {
    checkpoint: CheckpointStore,
    fail_fast: bool,
    shutdown: broadcast::Receiver<()>,
}

impl BatchProcessor {
    pub fn new(
        checkpoint: CheckpointStore,
        fail_fast: bool,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            checkpoint,
            fail_fast,
            shutdown,
        }
    }

    pub fn checkpoint(&self) -> &CheckpointStore {
        &self.checkpoint
    }

    /// Compact the checkpoint log; called by stages after a clean run.
    pub fn compact_checkpoint(&mut self) -> Result<()> {
        self.checkpoint.compact()
    }

    pub async fn run<F, Fut>(&mut self, items: &[WorkItem], mut transform: F) -> Result<BatchReport>
    where
        F: FnMut(WorkItem) -> Fut,
        Fut: Future<Output = Result<String>>,
    {
        let mut outcomes = Vec::with_capacity(items.len());
        let mut summary = RunSummary::default();
        let mut interrupted = false;

        for item in items {
            if let Some(entry) = self.checkpoint.get(&item.id)
                && entry.status == ItemStatus::Done
            {
                debug!(id = %item.id, "skipping checkpointed item");
                outcomes.push(ItemOutcome {
                    id: item.id.clone(),
                    status: ItemStatus::Done,
                    output: entry.result.clone(),
                    error: None,
                    from_checkpoint: true,
                });
                summary.skipped += 1;
                continue;
            }

            if self.shutdown_requested() {
                warn!("interrupt received, draining before new items");
                interrupted = true;
                break;
            }

            match transform(item.clone()).await {
                Ok(output) => {
                    self.checkpoint
                        .save(CheckpointEntry::done(&item.id, &output))?;
                    debug!(id = %item.id, "item done");
                    outcomes.push(ItemOutcome {
                        id: item.id.clone(),
                        status: ItemStatus::Done,
                        output: Some(output),
                        error: None,
                        from_checkpoint: false,
                    });
                    summary.succeeded += 1;
                }
                Err(err) if err.is_fatal() => {
                    // Halt immediately; completed items stay checkpointed.
                    error!(id = %item.id, %err, "fatal error, aborting run");
                    return Err(err);
                }
                Err(err) => {
                    self.checkpoint
                        .save(CheckpointEntry::failed(&item.id, err.to_string()))?;
                    warn!(id = %item.id, %err, "item failed");
                    if self.fail_fast {
                        return Err(err);
                    }
                    outcomes.push(ItemOutcome {
                        id: item.id.clone(),
                        status: ItemStatus::Failed,
                        output: None,
                        error: Some(err.to_string()),
                        from_checkpoint: false,
                    });
                    summary.failed += 1;
                    summary.failed_ids.push(item.id.clone());
                }
            }
        }

        Ok(BatchReport {
            outcomes,
            summary,
            interrupted,
        })
    }

    fn shutdown_requested(&mut self) -> bool {
        use broadcast::error::TryRecvError;
        match self.shutdown.try_recv() {
            Ok(()) | Err(TryRecvError::Lagged(_)) => true,
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointStore;
    use crate::error::PipelineError;
    use std::path::Path;

    fn processor(path: &Path, fail_fast: bool) -> (broadcast::Sender<()>, BatchProcessor) {
        let (tx, rx) = broadcast::channel(1);
        let store = CheckpointStore::open(path).unwrap();
        (tx, BatchProcessor::new(store, fail_fast, rx))
    }

    fn items(ids: &[&str]) -> Vec<WorkItem> {
        ids.iter()
            .map(|id| WorkItem::new(*id, format!("payload for {id}")))
            .collect()
    }

    async fn upper(item: WorkItem) -> Result<String> {
        Ok(item.payload.to_uppercase())
    }

    async fn forbidden(item: WorkItem) -> Result<String> {
        panic!("item {} was reprocessed", item.id)
    }

    #[tokio::test]
    async fn outputs_preserve_input_order() {
        let dir = tempfile::tempdir().unwrap();
        let (_tx, mut processor) = processor(&dir.path().join("cp.jsonl"), false);

        let report = processor.run(&items(&["a", "b", "c"]), upper).await.unwrap();

        let ids: Vec<&str> = report.outcomes.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
        assert_eq!(report.summary.succeeded, 3);
        assert!(!report.interrupted);
    }

    #[tokio::test]
    async fn rerun_skips_done_items_and_reuses_results() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cp.jsonl");
        let work = items(&["a", "b"]);

        let (_tx, mut first) = processor(&path, false);
        let before = first.run(&work, upper).await.unwrap();

        // Second run must not call the transform at all.
        let (_tx2, mut second) = processor(&path, false);
        let after = second.run(&work, forbidden).await.unwrap();

        assert_eq!(after.summary.skipped, 2);
        assert_eq!(after.summary.succeeded, 0);
        let outputs: Vec<_> = after.done_outputs().collect();
        let originals: Vec<_> = before.done_outputs().collect();
        assert_eq!(outputs, originals);
    }

    #[tokio::test]
    async fn failure_is_isolated_to_one_item() {
        let dir = tempfile::tempdir().unwrap();
        let (_tx, mut processor) = processor(&dir.path().join("cp.jsonl"), false);

        let report = processor
            .run(&items(&["a", "b", "c"]), |item| async move {
                if item.id == "b" {
                    Err(PipelineError::TokenBudgetExceeded {
                        model: "gpt-4o-mini".into(),
                        estimated: 200_000,
                        limit: 128_000,
                    })
                } else {
                    upper(item).await
                }
            })
            .await
            .unwrap();

        assert_eq!(report.summary.succeeded, 2);
        assert_eq!(report.summary.failed, 1);
        assert_eq!(report.summary.failed_ids, ["b"]);
        let done_ids: Vec<&str> = report.done_outputs().map(|(id, _)| id).collect();
        assert_eq!(done_ids, ["a", "c"]);
    }

    #[tokio::test]
    async fn fail_fast_stops_on_first_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (_tx, mut processor) = processor(&dir.path().join("cp.jsonl"), true);

        let err = processor
            .run(&items(&["a", "b", "c"]), |item| async move {
                if item.id == "b" {
                    Err(PipelineError::DataFormat {
                        id: item.id.clone(),
                        reason: "empty".into(),
                    })
                } else {
                    upper(item).await
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::DataFormat { .. }));
    }

    #[tokio::test]
    async fn fatal_error_aborts_and_keeps_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cp.jsonl");
        let work = items(&["a", "b", "c"]);

        let (_tx, mut runner) = processor(&path, false);
        let err = runner
            .run(&work, |item| async move {
                if item.id == "b" {
                    Err(PipelineError::FatalApi {
                        status: 401,
                        reason: "auth".into(),
                    })
                } else {
                    upper(item).await
                }
            })
            .await
            .unwrap_err();
        assert!(err.is_fatal());

        // 'a' survived; resuming processes only b and c.
        let store = CheckpointStore::open(&path).unwrap();
        assert!(store.is_done("a"));
        assert!(!store.is_done("b"));

        let (_tx2, mut resumed) = processor(&path, false);
        let report = resumed.run(&work, upper).await.unwrap();
        assert_eq!(report.summary.skipped, 1);
        assert_eq!(report.summary.succeeded, 2);
    }

    #[tokio::test]
    async fn interrupt_drains_current_item_then_stops() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cp.jsonl");
        let work = items(&["a", "b", "c"]);

        let (tx, rx) = broadcast::channel(1);
        let store = CheckpointStore::open(&path).unwrap();
        let mut processor = BatchProcessor::new(store, false, rx);

        // Signal during the first item: it must still complete and persist.
        let report = processor
            .run(&work, |item| {
                let tx = tx.clone();
                async move {
                    if item.id == "a" {
                        let _ = tx.send(());
                    }
                    upper(item).await
                }
            })
            .await
            .unwrap();

        assert!(report.interrupted);
        assert_eq!(report.summary.succeeded, 1);
        assert_eq!(report.outcomes.len(), 1);

        let store = CheckpointStore::open(&path).unwrap();
        assert!(store.is_done("a"));
        assert!(!store.is_done("b"));

        // Rerun finishes exactly the remaining items.
        let (_tx2, mut resumed) = {
            let (tx2, rx2) = broadcast::channel(1);
            let store = CheckpointStore::open(&path).unwrap();
            (tx2, BatchProcessor::new(store, false, rx2))
        };
        let report = resumed.run(&work, upper).await.unwrap();
        assert_eq!(report.summary.skipped, 1);
        assert_eq!(report.summary.succeeded, 2);
        let ids: Vec<&str> = report.outcomes.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn failed_items_are_retried_on_rerun() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cp.jsonl");
        let work = items(&["a"]);

        let (_tx, mut first) = processor(&path, false);
        first
            .run(&work, |item| async move {
                Err(PipelineError::TransientApi {
                    reason: format!("{} unreachable", item.id),
                })
            })
            .await
            .unwrap();

        let (_tx2, mut second) = processor(&path, false);
        let report = second.run(&work, upper).await.unwrap();
        assert_eq!(report.summary.succeeded, 1);
        assert!(second.checkpoint().is_done("a"));
    }
}
