//! Job state machine.
//!
//! - `CancellationToken`: cooperative cancellation flag shared with callers
//! - `SharedProgress`: the published snapshot cell readers clone from
//! - `JobStateMachine`: the single writer of a job's `JobProgress`
//!
//! Every mutation goes through `JobStateMachine`, which owns the working copy,
//! publishes a full snapshot into the shared cell after each change and hands
//! it to the throttled reporter. Once a terminal state is reached all mutators
//! are no-ops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{DocumentError, EngineError};
use crate::model::{JobProgress, JobState, TransferOutcome, UNKNOWN};
use crate::progress::{ListenerSet, ProgressReporter};

/// Cooperative cancellation flag, checked between documents and chunks.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Read side of a job's progress. Readers always get a whole snapshot.
#[derive(Debug, Clone)]
pub struct SharedProgress(Arc<Mutex<JobProgress>>);

impl SharedProgress {
    pub fn new(initial: JobProgress) -> Self {
        SharedProgress(Arc::new(Mutex::new(initial)))
    }

    pub fn get(&self) -> JobProgress {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set(&self, progress: &JobProgress) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = progress.clone();
    }
}

pub struct JobStateMachine {
    progress: JobProgress,
    base_msg: String,
    verb: &'static str,
    started: Option<Instant>,
    sample_interval: Duration,
    shared: SharedProgress,
    reporter: ProgressReporter,
}

impl JobStateMachine {
    /// A machine in the Queued state.
    ///
    /// `base_msg` is the operation message ("Copying a.txt to Docs") and `verb`
    /// the word used when the job fails ("Copy").
    pub fn new(
        id: Uuid,
        base_msg: String,
        verb: &'static str,
        listeners: ListenerSet,
        interval: Duration,
    ) -> Self {
        let progress = JobProgress::queued(id, base_msg.clone());
        JobStateMachine {
            shared: SharedProgress::new(progress.clone()),
            progress,
            base_msg,
            verb,
            started: None,
            sample_interval: interval,
            reporter: ProgressReporter::new(listeners, interval),
        }
    }

    pub fn snapshot(&self) -> &JobProgress {
        &self.progress
    }

    pub fn state(&self) -> JobState {
        self.progress.state
    }

    pub fn is_terminal(&self) -> bool {
        self.progress.state.is_terminal()
    }

    pub fn shared(&self) -> SharedProgress {
        self.shared.clone()
    }

    pub fn listeners(&self) -> &ListenerSet {
        self.reporter.listeners()
    }

    /// Queued -> Running.
    pub fn start(&mut self) {
        if self.progress.state != JobState::Queued {
            return;
        }
        self.progress.state = JobState::Running;
        self.started = Some(Instant::now());
        info!(job = %self.progress.id, "{}", self.base_msg);
        self.publish(true);
    }

    /// Record the planned totals. `bytes = None` turns byte accounting off.
    pub fn set_totals(&mut self, files: u64, bytes: Option<u64>) {
        if self.is_terminal() {
            return;
        }
        self.progress.total_files = self.progress.total_files.max(files);
        match bytes {
            Some(bytes) => {
                self.progress.required_bytes = clamp_i64(bytes);
                if self.progress.current_bytes == UNKNOWN {
                    self.progress.current_bytes = 0;
                }
            }
            None => {
                self.progress.required_bytes = UNKNOWN;
                self.progress.current_bytes = UNKNOWN;
            }
        }
        self.publish(true);
    }

    /// Count bytes written to a destination. Ignored when accounting is off.
    pub fn add_bytes(&mut self, bytes: u64) {
        if self.is_terminal() || !self.progress.bytes_known() || bytes == 0 {
            return;
        }
        self.progress.current_bytes = self.progress.current_bytes.saturating_add(clamp_i64(bytes));
        if self.progress.current_bytes > self.progress.required_bytes {
            self.progress.required_bytes = self.progress.current_bytes;
        }
        self.progress.ms_remaining = self.estimate_remaining();
        self.publish(false);
    }

    /// Fold one document's outcome into the counters.
    pub(crate) fn document_finished(&mut self, outcome: &TransferOutcome) {
        if self.is_terminal() {
            return;
        }
        self.progress.processed_files += 1;
        if let TransferOutcome::Failed(err) = outcome {
            warn!(job = %self.progress.id, "{}", err);
            self.progress.failed_files += 1;
            self.progress.has_failures = true;
        }
        self.grow_total();
        self.publish(false);
    }

    /// Record a failure that is not tied to a counted document, such as a
    /// directory that was created but could not be listed.
    pub(crate) fn note_failure(&mut self, err: &DocumentError) {
        if self.is_terminal() {
            return;
        }
        warn!(job = %self.progress.id, "{}", err);
        self.progress.failed_files += 1;
        self.progress.has_failures = true;
        self.publish(false);
    }

    /// Count `count` documents as failed without a detailed outcome, such as
    /// sources that no longer resolve or the rest of an unreadable archive.
    pub fn documents_failed(&mut self, count: u64) {
        if self.is_terminal() || count == 0 {
            return;
        }
        self.progress.processed_files += count;
        self.progress.failed_files += count;
        self.progress.has_failures = true;
        self.grow_total();
        self.publish(false);
    }

    /// Count a whole subtree handled in one provider call.
    pub fn documents_succeeded(&mut self, count: u64, bytes: u64) {
        if self.is_terminal() {
            return;
        }
        self.progress.processed_files += count;
        self.grow_total();
        if self.progress.bytes_known() && bytes > 0 {
            self.add_bytes(bytes);
        } else {
            self.publish(false);
        }
    }

    /// Running -> Completed. `has_failures` tells whether anything went wrong.
    pub fn finish(&mut self) {
        if self.is_terminal() {
            return;
        }
        self.progress.state = JobState::Completed;
        self.grow_total();
        self.progress.msg = if self.progress.has_failures {
            format!(
                "{}; {} of {} failed",
                self.base_msg, self.progress.failed_files, self.progress.total_files
            )
        } else {
            self.base_msg.clone()
        };
        self.settle();
        info!(
            job = %self.progress.id,
            processed = self.progress.processed_files,
            failed = self.progress.failed_files,
            "{}",
            self.progress.msg
        );
        self.publish(true);
    }

    /// Running (or Queued) -> Canceled.
    pub fn cancel(&mut self) {
        if self.is_terminal() {
            return;
        }
        self.progress.state = JobState::Canceled;
        self.progress.msg = format!("Canceled: {}", self.base_msg);
        self.settle();
        info!(job = %self.progress.id, "{}", self.progress.msg);
        self.publish(true);
    }

    /// Abort on a job-level error. The error itself stays out of `msg`.
    pub fn fail(&mut self, err: &EngineError) {
        if self.is_terminal() {
            return;
        }
        self.progress.state = JobState::Failed;
        self.progress.msg = format!("{} failed", self.verb);
        self.settle();
        error!(job = %self.progress.id, "{}: {}", self.progress.msg, err);
        self.publish(true);
    }

    fn grow_total(&mut self) {
        if self.progress.processed_files > self.progress.total_files {
            self.progress.total_files = self.progress.processed_files;
        }
    }

    fn settle(&mut self) {
        self.progress.ms_remaining = if self.progress.bytes_known() { 0 } else { UNKNOWN };
    }

    fn estimate_remaining(&self) -> i64 {
        let Some(started) = self.started else {
            return UNKNOWN;
        };
        let elapsed = started.elapsed();
        if elapsed < self.sample_interval || self.progress.current_bytes <= 0 {
            return UNKNOWN;
        }
        let remaining = (self.progress.required_bytes - self.progress.current_bytes).max(0);
        let elapsed_ms = elapsed.as_millis() as f64;
        let rate = self.progress.current_bytes as f64 / elapsed_ms;
        (remaining as f64 / rate) as i64
    }

    fn publish(&mut self, force: bool) {
        self.shared.set(&self.progress);
        self.reporter.publish(&self.progress, force);
    }
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
