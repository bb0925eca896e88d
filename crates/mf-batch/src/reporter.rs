//! Batch progress display.
//!
//! The display style is picked once when the reporter is built. The overall
//! position is driven by finished tasks through [`ProgressReporter::report`];
//! live encoder samples go through an [`ItemProgress`] handle per task, which
//! throttles them with the shared [`ProgressAggregator`] before drawing.

use std::sync::atomic::{AtomicUsize, Ordering};

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use mf_core::config::ProgressMode;
use mf_core::progress::{Emit, ProgressAggregator, ProgressState};

const BAR_TEMPLATE: &str = "[{elapsed_precise}] {wide_bar} {pos}/{len} files ({eta})";
const ITEM_TEMPLATE: &str = "  {bar:30} {percent:>3}% {wide_msg}";

/// Resolution of an item bar.
const ITEM_UNITS: u64 = 1000;

pub enum ProgressReporter {
    /// Interactive terminal: one overall bar plus a bar per running task.
    Rich {
        multi: MultiProgress,
        overall: ProgressBar,
    },
    /// One line every 10%.
    Plain { last_decile: AtomicUsize },
    Disabled,
}

impl ProgressReporter {
    pub fn new(mode: ProgressMode, total: usize) -> Self {
        match mode {
            ProgressMode::Rich => {
                let multi = MultiProgress::new();
                let overall = multi.add(ProgressBar::new(total as u64));
                apply_style(&overall, BAR_TEMPLATE);
                ProgressReporter::Rich { multi, overall }
            }
            ProgressMode::Plain => ProgressReporter::Plain {
                last_decile: AtomicUsize::new(0),
            },
            ProgressMode::None => ProgressReporter::Disabled,
        }
    }

    /// Handle for the live progress of task `index`.
    pub fn item(&self, index: usize, name: &str) -> ItemProgress {
        let sink = match self {
            ProgressReporter::Rich { multi, .. } => {
                let bar = multi.add(ProgressBar::new(ITEM_UNITS));
                apply_style(&bar, ITEM_TEMPLATE);
                bar.set_message(name.to_string());
                ItemSink::Bar(bar)
            }
            ProgressReporter::Plain { .. } => ItemSink::Log,
            ProgressReporter::Disabled => ItemSink::Hidden,
        };
        ItemProgress {
            index,
            name: name.to_string(),
            sink,
            aggregator: ProgressAggregator::default(),
            state: ProgressState::default(),
        }
    }

    /// Report overall completion in `[0, 1]`.
    pub fn report(&self, fraction: f64) {
        let fraction = fraction.clamp(0.0, 1.0);
        match self {
            ProgressReporter::Rich { overall, .. } => {
                let len = overall.length().unwrap_or(0);
                overall.set_position((fraction * len as f64).round() as u64);
            }
            ProgressReporter::Plain { last_decile } => {
                if let Some(decile) = next_decile(last_decile, fraction) {
                    eprintln!("Progress: {}%", decile * 10);
                }
            }
            ProgressReporter::Disabled => {}
        }
    }

    pub fn finish(&self) {
        if let ProgressReporter::Rich { overall, .. } = self {
            overall.finish();
        }
    }
}

fn apply_style(bar: &ProgressBar, template: &str) {
    match ProgressStyle::with_template(template) {
        Ok(style) => bar.set_style(style),
        Err(e) => tracing::debug!("Falling back to default bar style: {e}"),
    }
}

enum ItemSink {
    Bar(ProgressBar),
    Log,
    Hidden,
}

/// Live progress of one task. Dropping an unfinished handle clears its bar.
pub struct ItemProgress {
    index: usize,
    name: String,
    sink: ItemSink,
    aggregator: ProgressAggregator,
    state: ProgressState,
}

impl ItemProgress {
    /// Feed one raw encoder sample.
    pub fn sample(&mut self, current: u64, total: u64) {
        let sample = self.aggregator.on_sample(self.state, current, total);
        self.state = sample.state;
        if let Some(emit) = sample.emit {
            self.show(emit);
        }
    }

    /// Last fraction that made it past throttling.
    pub fn fraction(&self) -> f64 {
        self.state.last_emitted()
    }

    /// Close the handle. A successful task is topped up to 100%.
    pub fn finish(&mut self, success: bool) {
        if success {
            let sample = self.aggregator.on_complete(self.state);
            self.state = sample.state;
            if let Some(emit) = sample.emit {
                self.show(emit);
            }
        }
        if let ItemSink::Bar(bar) = &self.sink {
            bar.finish_and_clear();
        }
    }

    fn show(&self, emit: Emit) {
        match &self.sink {
            ItemSink::Bar(bar) => {
                bar.set_position((emit.fraction * ITEM_UNITS as f64).round() as u64);
            }
            ItemSink::Log => {
                tracing::debug!(
                    index = self.index,
                    item = %self.name,
                    progress = emit.fraction,
                    "Item progress"
                );
            }
            ItemSink::Hidden => {}
        }
    }
}

impl Drop for ItemProgress {
    fn drop(&mut self) {
        if let ItemSink::Bar(bar) = &self.sink {
            if !bar.is_finished() {
                bar.finish_and_clear();
            }
        }
    }
}

/// Advance the stored decile if `fraction` crossed a new 10% boundary.
fn next_decile(last: &AtomicUsize, fraction: f64) -> Option<usize> {
    let decile = (fraction * 10.0).floor() as usize;
    let prev = last.fetch_max(decile, Ordering::Relaxed);
    (decile > prev).then_some(decile)
}
