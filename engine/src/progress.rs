//! Progress reporting.
//!
//! This module defines the ProgressListener trait, which decouples the engine
//! from any specific UI technology, and the throttled ProgressReporter that
//! feeds listeners from a job's worker thread.
//!
//! Listeners are called synchronously on the worker thread and must not block.

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::model::{JobProgress, JobState};

/// Receives job progress snapshots.
pub trait ProgressListener: Send + Sync {
    fn on_progress(&self, progress: &JobProgress);
}

impl<F> ProgressListener for F
where
    F: Fn(&JobProgress) + Send + Sync,
{
    fn on_progress(&self, progress: &JobProgress) {
        self(progress)
    }
}

/// A listener that forwards snapshots into a channel.
///
/// Useful for UIs that poll from their own event loop. Send errors (the
/// receiver is gone) are ignored.
pub struct ChannelListener {
    sender: Sender<JobProgress>,
}

impl ChannelListener {
    pub fn new(sender: Sender<JobProgress>) -> Self {
        ChannelListener { sender }
    }

    /// A listener together with the receiving end of its channel.
    pub fn channel() -> (Self, Receiver<JobProgress>) {
        let (tx, rx) = unbounded();
        (ChannelListener::new(tx), rx)
    }
}

impl ProgressListener for ChannelListener {
    fn on_progress(&self, progress: &JobProgress) {
        let _ = self.sender.send(progress.clone());
    }
}

/// The set of listeners subscribed to one job. Cloning shares the set.
#[derive(Clone, Default)]
pub struct ListenerSet {
    inner: Arc<Mutex<Vec<Arc<dyn ProgressListener>>>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<dyn ProgressListener>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a listener and hand it the snapshot returned by `current`.
    ///
    /// `current` is read and delivered under the set's lock. A snapshot
    /// published after that read is delivered to the new listener as well, so
    /// a terminal update is never missed.
    pub fn subscribe<F>(&self, listener: Arc<dyn ProgressListener>, current: F)
    where
        F: FnOnce() -> JobProgress,
    {
        let mut listeners = self.lock();
        listener.on_progress(&current());
        listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn deliver(&self, progress: &JobProgress) {
        let listeners: Vec<Arc<dyn ProgressListener>> = self.lock().clone();
        for listener in listeners {
            listener.on_progress(progress);
        }
    }
}

/// Publishes snapshots to a job's listeners at a bounded rate.
///
/// A snapshot goes out immediately when the state differs from the last
/// delivered one or when `force` is set; otherwise only if `interval` has
/// passed since the last delivery.
pub struct ProgressReporter {
    listeners: ListenerSet,
    interval: Duration,
    last_sent: Option<Instant>,
    last_state: Option<JobState>,
}

impl ProgressReporter {
    pub fn new(listeners: ListenerSet, interval: Duration) -> Self {
        ProgressReporter {
            listeners,
            interval,
            last_sent: None,
            last_state: None,
        }
    }

    pub fn listeners(&self) -> &ListenerSet {
        &self.listeners
    }

    /// Deliver `progress` if due. Returns whether it was delivered.
    pub fn publish(&mut self, progress: &JobProgress, force: bool) -> bool {
        let state_changed = self.last_state != Some(progress.state);
        let due = self
            .last_sent
            .map_or(true, |sent| sent.elapsed() >= self.interval);
        if !(force || state_changed || due) {
            return false;
        }
        self.listeners.deliver(progress);
        self.last_sent = Some(Instant::now());
        self.last_state = Some(progress.state);
        true
    }
}

/// Combined progress of several jobs, for a single progress indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateProgress {
    /// No jobs to show
    Hidden,
    /// Jobs are running but none reports byte totals
    Indeterminate,
    /// Percentage complete, 0 to 100
    Percent(u8),
}

/// Fold job snapshots into one indicator value.
///
/// Byte counts are summed over jobs that know both counters. When none do,
/// the result is 100% once every job has reached a terminal state.
pub fn aggregate_progress<'a, I>(jobs: I) -> AggregateProgress
where
    I: IntoIterator<Item = &'a JobProgress>,
{
    let mut any = false;
    let mut all_finished = true;
    let mut required: i128 = 0;
    let mut current: i128 = 0;

    for job in jobs {
        any = true;
        if !job.state.is_terminal() {
            all_finished = false;
        }
        if job.bytes_known() {
            required += i128::from(job.required_bytes);
            current += i128::from(job.current_bytes);
        }
    }

    if !any {
        AggregateProgress::Hidden
    } else if required != 0 {
        let percent = (current * 100 / required).clamp(0, 100);
        AggregateProgress::Percent(percent as u8)
    } else if all_finished {
        AggregateProgress::Percent(100)
    } else {
        AggregateProgress::Indeterminate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn snapshot(state: JobState, current: i64, required: i64) -> JobProgress {
        let mut progress = JobProgress::queued(Uuid::new_v4(), "job".to_string());
        progress.state = state;
        progress.current_bytes = current;
        progress.required_bytes = required;
        progress
    }

    #[test]
    fn test_reporter_throttles_within_interval() {
        let (listener, rx) = ChannelListener::channel();
        let listeners = ListenerSet::new();
        listeners.subscribe(Arc::new(listener), || snapshot(JobState::Queued, -1, -1));
        assert_eq!(rx.try_iter().count(), 1);

        let mut reporter = ProgressReporter::new(listeners, Duration::from_secs(60));
        let running = snapshot(JobState::Running, 0, 100);
        assert!(reporter.publish(&running, false));
        assert!(!reporter.publish(&snapshot(JobState::Running, 10, 100), false));
        assert!(!reporter.publish(&snapshot(JobState::Running, 20, 100), false));
        assert!(reporter.publish(&snapshot(JobState::Running, 30, 100), true));
        assert!(reporter.publish(&snapshot(JobState::Completed, 100, 100), false));

        let delivered: Vec<_> = rx.try_iter().collect();
        assert_eq!(delivered.len(), 3);
        assert_eq!(delivered[2].state, JobState::Completed);
    }

    #[test]
    fn test_reporter_publishes_after_interval() {
        let mut reporter = ProgressReporter::new(ListenerSet::new(), Duration::from_millis(10));
        assert!(reporter.publish(&snapshot(JobState::Running, 0, 10), false));
        std::thread::sleep(Duration::from_millis(20));
        assert!(reporter.publish(&snapshot(JobState::Running, 5, 10), false));
    }

    #[test]
    fn test_closure_listener() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listeners = ListenerSet::new();
        listeners.subscribe(
            Arc::new(move |p: &JobProgress| sink.lock().unwrap().push(p.state)),
            || snapshot(JobState::Running, 0, 0),
        );
        assert_eq!(listeners.len(), 1);
        assert_eq!(*seen.lock().unwrap(), vec![JobState::Running]);
    }

    #[test]
    fn test_aggregate_no_jobs() {
        assert_eq!(aggregate_progress(&[]), AggregateProgress::Hidden);
    }

    #[test]
    fn test_aggregate_single_job_bytes() {
        let jobs = [snapshot(JobState::Running, 40, 100)];
        assert_eq!(aggregate_progress(&jobs), AggregateProgress::Percent(40));
    }

    #[test]
    fn test_aggregate_multiple_jobs_ignores_unknown_bytes() {
        let jobs = [
            snapshot(JobState::Running, 10, 100),
            snapshot(JobState::Running, 10, 25),
            snapshot(JobState::Running, -1, -1),
        ];
        assert_eq!(aggregate_progress(&jobs), AggregateProgress::Percent(16));
    }

    #[test]
    fn test_aggregate_unknown_bytes() {
        let running = [snapshot(JobState::Running, -1, -1)];
        assert_eq!(aggregate_progress(&running), AggregateProgress::Indeterminate);

        let done = [snapshot(JobState::Completed, -1, -1)];
        assert_eq!(aggregate_progress(&done), AggregateProgress::Percent(100));
    }
}
