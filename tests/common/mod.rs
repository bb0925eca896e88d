//! Shared test harness for integration tests.
//!
//! Provides [`ScriptedEncoder`], an [`Encoder`] whose behaviour per input
//! file is decided by the test, plus helpers for building a scheduler over
//! an in-memory store and draining the events it published.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use mf_core::{
    BatchId, EncodeError, EncodeOutput, EncodeRequest, Encoder, EncodingOptions, Event, EventBus,
    ProgressFn, Subscription, WorkRequest,
};
use mf_engine::{BoundedScheduler, CancellationController, InMemoryJobStore, JobStore};

/// What the encoder does for one input.
#[derive(Debug, Clone)]
pub enum Script {
    Succeed,
    Fail(EncodeError),
    Panic,
}

type StartHook = Box<dyn Fn(&str) + Send + Sync>;

/// Counters shared between a [`ScriptedEncoder`] and the test.
#[derive(Debug, Default)]
pub struct EncoderStats {
    pub current: AtomicUsize,
    pub max_concurrent: AtomicUsize,
    pub attempted: Mutex<Vec<String>>,
}

impl EncoderStats {
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }

    pub fn attempted(&self) -> Vec<String> {
        self.attempted.lock().unwrap().clone()
    }
}

pub struct ScriptedEncoder {
    scripts: HashMap<String, Script>,
    delays: HashMap<String, Duration>,
    delay: Duration,
    progress_steps: u64,
    on_start: Option<StartHook>,
    pub stats: Arc<EncoderStats>,
}

impl ScriptedEncoder {
    pub fn new() -> Self {
        Self {
            scripts: HashMap::new(),
            delays: HashMap::new(),
            delay: Duration::from_millis(10),
            progress_steps: 0,
            on_start: None,
            stats: Arc::new(EncoderStats::default()),
        }
    }

    /// Make `file` fail with a conversion failure.
    pub fn failing(self, file: &str) -> Self {
        self.script(
            file,
            Script::Fail(EncodeError::ConversionFailure(format!(
                "Conversion failed for {file}"
            ))),
        )
    }

    pub fn script(mut self, file: &str, script: Script) -> Self {
        self.scripts.insert(file.to_string(), script);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn delay_for(mut self, file: &str, delay: Duration) -> Self {
        self.delays.insert(file.to_string(), delay);
        self
    }

    /// Report `steps + 1` evenly spaced progress samples per item.
    pub fn with_progress(mut self, steps: u64) -> Self {
        self.progress_steps = steps;
        self
    }

    /// Called with the file name as each encode starts.
    pub fn on_start(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_start = Some(Box::new(hook));
        self
    }
}

#[async_trait]
impl Encoder for ScriptedEncoder {
    async fn encode(
        &self,
        request: &EncodeRequest,
        on_progress: &mut ProgressFn<'_>,
    ) -> Result<EncodeOutput, EncodeError> {
        let file = file_name(&request.input);
        self.stats.attempted.lock().unwrap().push(file.clone());
        if let Some(hook) = &self.on_start {
            hook(&file);
        }

        let now = self.stats.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max_concurrent.fetch_max(now, Ordering::SeqCst);

        let delay = self.delays.get(&file).copied().unwrap_or(self.delay);
        if self.progress_steps > 0 {
            let step_delay = delay / self.progress_steps as u32;
            for step in 0..=self.progress_steps {
                on_progress(step * 1000, self.progress_steps * 1000);
                tokio::time::sleep(step_delay).await;
            }
        } else {
            tokio::time::sleep(delay).await;
        }

        self.stats.current.fetch_sub(1, Ordering::SeqCst);

        match self.scripts.get(&file).cloned().unwrap_or(Script::Succeed) {
            Script::Succeed => Ok(EncodeOutput {
                output_path: request.output.clone(),
                output_size: 4096,
            }),
            Script::Fail(e) => Err(e),
            Script::Panic => panic!("encoder exploded on {file}"),
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// `item0.mp4`, `item1.mp4`, ...
pub fn requests(count: usize) -> Vec<WorkRequest> {
    (0..count)
        .map(|i| {
            WorkRequest::new(
                format!("item{i}.mp4"),
                format!("/videos/item{i}.mp4"),
                format!("/out/item{i}.mp3"),
            )
        })
        .collect()
}

/// Scheduler over an in-memory store with a roomy event bus.
pub struct Harness {
    pub store: Arc<dyn JobStore>,
    pub bus: Arc<EventBus>,
    pub scheduler: BoundedScheduler,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(Arc::new(InMemoryJobStore::new()))
    }

    pub fn with_store(store: Arc<dyn JobStore>) -> Self {
        let bus = Arc::new(EventBus::new(1024));
        let scheduler = BoundedScheduler::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            CancellationController::new(),
        );
        Self {
            store,
            bus,
            scheduler,
        }
    }

    /// Record a batch for `requests` and subscribe to it.
    pub fn prepare(&self, requests: &[WorkRequest]) -> (BatchId, Subscription) {
        let batch_id = BatchId::new();
        let names = requests.iter().map(|r| r.name.clone()).collect();
        self.store
            .create_batch(batch_id, EncodingOptions::default(), names)
            .expect("create batch");
        let sub = self.bus.subscribe(batch_id);
        (batch_id, sub)
    }
}

/// Everything published so far, minus the `connected` ack.
pub fn drain(sub: &mut Subscription) -> Vec<Event> {
    let mut events = Vec::new();
    while let Some(event) = sub.try_recv() {
        if event.name() != "connected" {
            events.push(event);
        }
    }
    events
}

pub fn count_named(events: &[Event], name: &str) -> usize {
    events.iter().filter(|e| e.name() == name).count()
}
