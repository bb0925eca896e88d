//! End-to-end runs of the bounded scheduler against a scripted encoder.

mod common;

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;

use common::{count_named, drain, requests, Harness, Script, ScriptedEncoder};
use mf_core::config::SchedulerConfig;
use mf_core::stream::Frame;
use mf_core::{
    Batch, BatchId, BatchStatus, EncodeError, EncodingOptions, Error, EventPayload,
    FailureDetail, FailureKind, ItemStatus, Result,
};
use mf_engine::{BatchCounts, BatchPage, ConversionService, InMemoryJobStore, JobStore};

#[tokio::test]
async fn all_items_succeed() {
    let h = Harness::new();
    let reqs = requests(5);
    let (batch_id, mut sub) = h.prepare(&reqs);
    let encoder = Arc::new(ScriptedEncoder::new());

    let outcome = h
        .scheduler
        .run(batch_id, reqs, 2, encoder.clone())
        .await
        .unwrap();

    assert_eq!(outcome.status, BatchStatus::Completed);
    assert_eq!(outcome.completed, 5);
    assert_eq!(outcome.failed, 0);
    assert!(outcome.error.is_none());

    let batch = h.store.get_batch(batch_id).unwrap();
    assert_eq!(batch.status, BatchStatus::Completed);
    assert_eq!(batch.completed_count, 5);
    assert_eq!(batch.failed_count, 0);
    assert!((batch.overall_progress - 1.0).abs() < 1e-9);
    assert!(batch
        .items
        .iter()
        .all(|item| item.status == ItemStatus::Completed));

    let events = drain(&mut sub);
    assert_eq!(count_named(&events, "item_completed"), 5);
    assert_eq!(count_named(&events, "batch_completed"), 1);
    assert_matches!(
        &events.last().unwrap().payload,
        EventPayload::BatchCompleted {
            status: BatchStatus::Completed,
            total: 5,
            completed: 5,
            failed: 0,
            ..
        }
    );
}

#[tokio::test]
async fn partial_failure_still_completes() {
    let h = Harness::new();
    let reqs = requests(4);
    let (batch_id, mut sub) = h.prepare(&reqs);
    let encoder = Arc::new(
        ScriptedEncoder::new()
            .failing("item1.mp4")
            .failing("item2.mp4"),
    );

    let outcome = h.scheduler.run(batch_id, reqs, 3, encoder).await.unwrap();

    assert_eq!(outcome.status, BatchStatus::Completed);
    assert_eq!(outcome.completed, 2);
    assert_eq!(outcome.failed, 2);
    assert_eq!(outcome.error.as_deref(), Some("2 item(s) failed"));

    let batch = h.store.get_batch(batch_id).unwrap();
    assert_eq!(batch.items[1].status, ItemStatus::Failed);
    assert_eq!(batch.items[2].status, ItemStatus::Failed);
    assert_eq!(
        batch.items[1].error.as_ref().unwrap().kind,
        FailureKind::ConversionFailure
    );

    let events = drain(&mut sub);
    let failed_items: Vec<_> = events
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::Error { item, kind, .. } => {
                assert_eq!(*kind, FailureKind::ConversionFailure);
                item.clone()
            }
            _ => None,
        })
        .collect();
    assert_eq!(failed_items.len(), 2);
    assert!(failed_items.contains(&"item1.mp4".to_string()));
    assert!(failed_items.contains(&"item2.mp4".to_string()));
    assert_eq!(count_named(&events, "batch_completed"), 1);
}

#[tokio::test]
async fn all_items_failing_fails_the_batch() {
    let h = Harness::new();
    let reqs = requests(3);
    let (batch_id, _sub) = h.prepare(&reqs);
    let encoder = Arc::new(
        ScriptedEncoder::new()
            .failing("item0.mp4")
            .failing("item1.mp4")
            .failing("item2.mp4"),
    );

    let outcome = h.scheduler.run(batch_id, reqs, 1, encoder).await.unwrap();

    assert_eq!(outcome.status, BatchStatus::Failed);
    assert_eq!(outcome.completed, 0);
    assert_eq!(outcome.failed, 3);
    assert_eq!(outcome.error.as_deref(), Some("All items failed"));

    let batch = h.store.get_batch(batch_id).unwrap();
    assert_eq!(batch.status, BatchStatus::Failed);
    assert_eq!(batch.failed_count, 3);
}

#[tokio::test]
async fn cancel_abandons_items_not_yet_admitted() {
    let h = Harness::new();
    let reqs = requests(3);
    let (batch_id, mut sub) = h.prepare(&reqs);

    let controller = h.scheduler.cancellation().clone();
    let encoder = Arc::new(ScriptedEncoder::new().on_start(move |file| {
        if file == "item0.mp4" {
            controller.mark_cancelled(batch_id).unwrap();
        }
    }));

    let outcome = h
        .scheduler
        .run(batch_id, reqs, 1, encoder.clone())
        .await
        .unwrap();

    assert_eq!(outcome.status, BatchStatus::Cancelled);
    assert_eq!(outcome.completed, 1);
    assert_eq!(outcome.abandoned, 2);
    assert_eq!(encoder.stats.attempted(), vec!["item0.mp4"]);

    let batch = h.store.get_batch(batch_id).unwrap();
    assert_eq!(batch.status, BatchStatus::Cancelled);
    assert_eq!(batch.completed_count, 1);
    for item in &batch.items[1..] {
        assert_eq!(item.status, ItemStatus::Queued);
        assert!(item.started_at.is_none());
    }

    let events = drain(&mut sub);
    assert!(!events.iter().any(|e| matches!(
        &e.payload,
        EventPayload::ItemProgress { index, .. } | EventPayload::ItemCompleted { index, .. }
            if *index > 0
    )));
    assert_matches!(
        &events.last().unwrap().payload,
        EventPayload::BatchCompleted {
            status: BatchStatus::Cancelled,
            ..
        }
    );
}

#[tokio::test]
async fn in_flight_items_never_exceed_the_limit() {
    let h = Harness::new();
    let reqs = requests(8);
    let (batch_id, _sub) = h.prepare(&reqs);
    let encoder = Arc::new(ScriptedEncoder::new().with_delay(Duration::from_millis(30)));

    let outcome = h
        .scheduler
        .run(batch_id, reqs, 3, encoder.clone())
        .await
        .unwrap();

    assert_eq!(outcome.completed, 8);
    assert!(encoder.stats.max_concurrent() <= 3);
    assert!(encoder.stats.max_concurrent() >= 2);
}

#[tokio::test]
async fn items_are_admitted_in_input_order() {
    let h = Harness::new();
    let reqs = requests(4);
    let (batch_id, _sub) = h.prepare(&reqs);
    let encoder = Arc::new(ScriptedEncoder::new());

    h.scheduler
        .run(batch_id, reqs, 1, encoder.clone())
        .await
        .unwrap();

    assert_eq!(
        encoder.stats.attempted(),
        vec!["item0.mp4", "item1.mp4", "item2.mp4", "item3.mp4"]
    );
}

#[tokio::test]
async fn progress_events_are_monotonic_per_item() {
    let h = Harness::new();
    let reqs = requests(2);
    let (batch_id, mut sub) = h.prepare(&reqs);
    let encoder = Arc::new(
        ScriptedEncoder::new()
            .with_delay(Duration::from_millis(40))
            .with_progress(40),
    );

    h.scheduler.run(batch_id, reqs, 2, encoder).await.unwrap();

    let events = drain(&mut sub);
    for wanted in 0..2 {
        let fractions: Vec<f64> = events
            .iter()
            .filter_map(|e| match &e.payload {
                EventPayload::ItemProgress {
                    index, progress, ..
                } if *index == wanted => Some(*progress),
                _ => None,
            })
            .collect();
        assert!(!fractions.is_empty());
        assert!(fractions.windows(2).all(|w| w[1] > w[0]));
        assert!(*fractions.last().unwrap() >= 0.99);
        assert!(fractions.len() <= 22);
    }

    let batch = h.store.get_batch(batch_id).unwrap();
    assert!(batch.items.iter().all(|item| item.progress >= 0.99));
}

#[tokio::test]
async fn encoder_panic_is_an_unexpected_item_failure() {
    let h = Harness::new();
    let reqs = requests(3);
    let (batch_id, mut sub) = h.prepare(&reqs);
    let encoder = Arc::new(ScriptedEncoder::new().script("item1.mp4", Script::Panic));

    let outcome = h.scheduler.run(batch_id, reqs, 2, encoder).await.unwrap();

    assert_eq!(outcome.status, BatchStatus::Completed);
    assert_eq!(outcome.completed, 2);
    assert_eq!(outcome.failed, 1);
    assert_eq!(outcome.failures[0].kind, FailureKind::Unexpected);
    assert!(outcome.failures[0].message.contains("encoder exploded"));

    let events = drain(&mut sub);
    assert_eq!(count_named(&events, "error"), 1);
}

#[tokio::test]
async fn failure_kinds_are_preserved() {
    let h = Harness::new();
    let reqs = requests(2);
    let (batch_id, _sub) = h.prepare(&reqs);
    let encoder = Arc::new(
        ScriptedEncoder::new()
            .script(
                "item0.mp4",
                Script::Fail(EncodeError::InsufficientSpace("12.0MB required".into())),
            )
            .script(
                "item1.mp4",
                Script::Fail(EncodeError::InvalidInput("no audio stream".into())),
            ),
    );

    h.scheduler.run(batch_id, reqs, 2, encoder).await.unwrap();

    let batch = h.store.get_batch(batch_id).unwrap();
    assert_eq!(
        batch.items[0].error.as_ref().unwrap().kind,
        FailureKind::InsufficientSpace
    );
    assert_eq!(
        batch.items[1].error.as_ref().unwrap().kind,
        FailureKind::InvalidInput
    );
}

#[tokio::test]
async fn second_run_of_an_active_batch_conflicts() {
    let h = Harness::new();
    let reqs = requests(1);
    let (batch_id, _sub) = h.prepare(&reqs);
    let _active = h.scheduler.cancellation().activate(batch_id).unwrap();

    let result = h
        .scheduler
        .run(batch_id, reqs, 1, Arc::new(ScriptedEncoder::new()))
        .await;
    assert_matches!(result, Err(Error::Conflict(_)));
}

#[tokio::test]
async fn cancel_after_the_run_is_not_active() {
    let h = Harness::new();
    let reqs = requests(1);
    let (batch_id, _sub) = h.prepare(&reqs);

    h.scheduler
        .run(batch_id, reqs, 1, Arc::new(ScriptedEncoder::new()))
        .await
        .unwrap();

    assert!(!h.scheduler.cancellation().is_active(batch_id));
    assert_matches!(
        h.scheduler.cancellation().mark_cancelled(batch_id),
        Err(Error::NotActive { .. })
    );
}

#[tokio::test]
async fn zero_limit_is_rejected() {
    let h = Harness::new();
    let reqs = requests(1);
    let (batch_id, _sub) = h.prepare(&reqs);

    let result = h
        .scheduler
        .run(batch_id, reqs, 0, Arc::new(ScriptedEncoder::new()))
        .await;
    assert_matches!(result, Err(Error::Validation(_)));
    assert_eq!(
        h.store.get_batch(batch_id).unwrap().status,
        BatchStatus::Failed
    );
}

#[tokio::test]
async fn run_that_cannot_start_still_reports_completion() {
    let h = Harness::new();
    let (batch_id, mut sub) = h.prepare(&requests(3));

    // Fewer requests than recorded items.
    let result = h
        .scheduler
        .run(batch_id, requests(2), 2, Arc::new(ScriptedEncoder::new()))
        .await;
    assert_matches!(result, Err(Error::Validation(_)));

    let batch = h.store.get_batch(batch_id).unwrap();
    assert_eq!(batch.status, BatchStatus::Failed);
    assert!(batch.error.is_some());
    assert!(!h.scheduler.cancellation().is_active(batch_id));

    let events = drain(&mut sub);
    assert_eq!(count_named(&events, "item_completed"), 0);
    assert_matches!(
        events.last().map(|e| &e.payload),
        Some(EventPayload::BatchCompleted {
            status: BatchStatus::Failed,
            ..
        })
    );
}

/// Store whose `complete_item` blows up for one index, outside the
/// scheduler's per-item panic recovery.
struct ExplodingCommitStore {
    inner: InMemoryJobStore,
    explode_at: usize,
}

impl JobStore for ExplodingCommitStore {
    fn create_batch(
        &self,
        id: BatchId,
        options: EncodingOptions,
        item_names: Vec<String>,
    ) -> Result<Batch> {
        self.inner.create_batch(id, options, item_names)
    }

    fn get_batch(&self, id: BatchId) -> Result<Batch> {
        self.inner.get_batch(id)
    }

    fn transition(&self, id: BatchId, next: BatchStatus, error: Option<String>) -> Result<Batch> {
        self.inner.transition(id, next, error)
    }

    fn start_item(&self, id: BatchId, index: usize) -> Result<()> {
        self.inner.start_item(id, index)
    }

    fn update_item_progress(&self, id: BatchId, index: usize, progress: f64) -> Result<()> {
        self.inner.update_item_progress(id, index, progress)
    }

    fn complete_item(
        &self,
        id: BatchId,
        index: usize,
        output: String,
        output_size: u64,
    ) -> Result<BatchCounts> {
        if index == self.explode_at {
            panic!("commit exploded for item {index}");
        }
        self.inner.complete_item(id, index, output, output_size)
    }

    fn fail_item(&self, id: BatchId, index: usize, detail: FailureDetail) -> Result<BatchCounts> {
        self.inner.fail_item(id, index, detail)
    }

    fn list_batches(
        &self,
        page: usize,
        page_size: usize,
        status: Option<BatchStatus>,
    ) -> Result<BatchPage> {
        self.inner.list_batches(page, page_size, status)
    }

    fn delete_batch(&self, id: BatchId) -> Result<()> {
        self.inner.delete_batch(id)
    }

    fn clear_old_batches(&self, days: u32) -> Result<usize> {
        self.inner.clear_old_batches(days)
    }
}

#[tokio::test]
async fn lost_item_task_is_recorded_as_failed() {
    let h = Harness::with_store(Arc::new(ExplodingCommitStore {
        inner: InMemoryJobStore::new(),
        explode_at: 1,
    }));
    let reqs = requests(3);
    let (batch_id, mut sub) = h.prepare(&reqs);

    let outcome = h
        .scheduler
        .run(batch_id, reqs, 2, Arc::new(ScriptedEncoder::new()))
        .await
        .unwrap();

    assert_eq!(outcome.status, BatchStatus::Completed);
    assert_eq!(outcome.completed, 2);
    assert_eq!(outcome.failed, 1);
    assert_eq!(outcome.failures[0].item, "item1.mp4");
    assert_eq!(outcome.failures[0].kind, FailureKind::Unexpected);

    let batch = h.store.get_batch(batch_id).unwrap();
    assert_eq!(batch.items[1].status, ItemStatus::Failed);
    assert_eq!(batch.completed_count, outcome.completed);
    assert_eq!(batch.failed_count, outcome.failed);

    let events = drain(&mut sub);
    assert!(events.iter().any(|e| matches!(
        &e.payload,
        EventPayload::Error { index: Some(1), kind: FailureKind::Unexpected, .. }
    )));
}

#[tokio::test]
async fn empty_batch_completes_immediately() {
    let h = Harness::new();
    let (batch_id, mut sub) = h.prepare(&[]);

    let outcome = h
        .scheduler
        .run(batch_id, Vec::new(), 2, Arc::new(ScriptedEncoder::new()))
        .await
        .unwrap();

    assert_eq!(outcome.status, BatchStatus::Completed);
    assert_eq!(count_named(&drain(&mut sub), "batch_completed"), 1);
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

fn service(encoder: ScriptedEncoder) -> ConversionService {
    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
    ConversionService::new(SchedulerConfig::default(), store, Arc::new(encoder))
}

#[tokio::test]
async fn submitted_batch_streams_until_completion() {
    let svc = service(ScriptedEncoder::new().with_progress(4));
    let submitted = svc
        .submit(Default::default(), requests(3), Some(2))
        .unwrap();
    let mut stream = svc.subscribe(submitted.batch_id).unwrap();

    let mut names = Vec::new();
    while let Some(frame) = stream.next_frame().await {
        if let Frame::Event(event) = frame {
            names.push(event.name());
        }
    }

    assert_eq!(names.first(), Some(&"connected"));
    assert_eq!(names.last(), Some(&"batch_completed"));

    let outcome = submitted.wait().await.unwrap();
    assert_eq!(outcome.status, BatchStatus::Completed);
    assert_eq!(
        svc.status(outcome.batch_id).unwrap().status,
        BatchStatus::Completed
    );
}

#[tokio::test]
async fn submitted_batch_can_be_cancelled() {
    let svc = service(ScriptedEncoder::new().with_delay(Duration::from_millis(50)));
    let submitted = svc
        .submit(Default::default(), requests(4), Some(1))
        .unwrap();

    assert!(svc.is_active(submitted.batch_id));
    svc.cancel(submitted.batch_id).unwrap();

    let outcome = submitted.wait().await.unwrap();
    assert_eq!(outcome.status, BatchStatus::Cancelled);
    assert!(outcome.completed + outcome.abandoned == 4);
    assert!(outcome.abandoned >= 3);
    assert!(!svc.is_active(outcome.batch_id));
}

#[tokio::test]
async fn submit_rejects_bad_options() {
    let svc = service(ScriptedEncoder::new());
    let options = mf_core::EncodingOptions {
        bitrate: "999k".into(),
        ..Default::default()
    };
    assert_matches!(
        svc.submit(options, requests(1), None),
        Err(Error::Validation(_))
    );
    assert_eq!(svc.list(1, 10, None).unwrap().total, 0);
}

#[tokio::test]
async fn finished_batches_can_be_listed_and_deleted() {
    let svc = service(ScriptedEncoder::new());
    let first = svc.submit(Default::default(), requests(1), None).unwrap();
    let first = first.wait().await.unwrap();
    let second = svc.submit(Default::default(), requests(2), None).unwrap();
    second.wait().await.unwrap();

    let page = svc.list(1, 10, Some(BatchStatus::Completed)).unwrap();
    assert_eq!(page.total, 2);

    svc.delete(first.batch_id).unwrap();
    assert_matches!(svc.status(first.batch_id), Err(Error::NotFound { .. }));
    assert_eq!(svc.list(1, 10, None).unwrap().total, 1);
}

#[tokio::test]
async fn subscribing_to_an_unknown_batch_is_not_found() {
    let svc = service(ScriptedEncoder::new());
    let result = svc.subscribe(BatchId::new());
    assert!(matches!(result, Err(Error::NotFound { .. })));
}

#[tokio::test]
async fn running_batch_cannot_be_deleted() {
    let svc = service(ScriptedEncoder::new().with_delay(Duration::from_millis(50)));
    let submitted = svc
        .submit(Default::default(), requests(2), Some(1))
        .unwrap();
    let batch_id = submitted.batch_id;

    assert_matches!(svc.delete(batch_id), Err(Error::Conflict(_)));

    let outcome = submitted.wait().await.unwrap();
    assert_eq!(outcome.status, BatchStatus::Completed);
    assert_eq!(outcome.completed, 2);

    svc.delete(batch_id).unwrap();
    assert_matches!(svc.status(batch_id), Err(Error::NotFound { .. }));
}
