//! Job submission and tracking.
//!
//! `FileOperationService` runs each job on its own worker thread. Callers
//! interact through job ids: submit, cancel, subscribe, poll, wait.
//!
//! Finished jobs stay visible until waited on, but only the most recent
//! `MAX_FINISHED_JOBS` of them are kept.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Utc};
use tracing::{debug, error};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::job::{create_job, run_job};
use crate::model::{DocumentRef, JobProgress, OperationKind};
use crate::progress::{aggregate_progress, AggregateProgress, ListenerSet, ProgressListener};
use crate::provider::ProviderRegistry;
use crate::state::{CancellationToken, SharedProgress};

type WorkerResult = Result<JobProgress, EngineError>;

/// Finished jobs retained for `wait` and `progress` after their worker exits.
pub const MAX_FINISHED_JOBS: usize = 64;

struct JobHandle {
    kind: OperationKind,
    created_at: DateTime<Utc>,
    progress: SharedProgress,
    listeners: ListenerSet,
    cancel: CancellationToken,
    /// `None` once the worker has been joined
    worker: Option<JoinHandle<WorkerResult>>,
    result: Option<WorkerResult>,
}

impl JobHandle {
    fn is_finished(&self) -> bool {
        self.worker.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Join an exited worker and keep its result.
    fn collect(&mut self, id: Uuid) {
        if let Some(worker) = self.worker.take() {
            self.result = Some(join_worker(id, worker));
            self.listeners = ListenerSet::new();
        }
    }
}

fn join_worker(id: Uuid, worker: JoinHandle<WorkerResult>) -> WorkerResult {
    match worker.join() {
        Ok(result) => result,
        Err(_) => Err(EngineError::Worker(io::Error::new(
            io::ErrorKind::Other,
            format!("worker for job {} panicked", id),
        ))),
    }
}

/// Collect exited workers and drop the oldest finished jobs beyond the limit.
fn reap(jobs: &mut HashMap<Uuid, JobHandle>) {
    let mut finished: Vec<(DateTime<Utc>, Uuid)> = Vec::new();
    for (id, handle) in jobs.iter_mut() {
        if handle.is_finished() {
            handle.collect(*id);
            finished.push((handle.created_at, *id));
        }
    }
    if finished.len() <= MAX_FINISHED_JOBS {
        return;
    }
    finished.sort();
    let excess = finished.len() - MAX_FINISHED_JOBS;
    for (_, id) in finished.into_iter().take(excess) {
        jobs.remove(&id);
        debug!(job = %id, "Dropped finished job");
    }
}

pub struct FileOperationService {
    registry: Arc<ProviderRegistry>,
    config: Arc<EngineConfig>,
    jobs: Mutex<HashMap<Uuid, JobHandle>>,
}

impl FileOperationService {
    /// # Errors
    /// Returns EngineError::Config if the configuration is invalid.
    pub fn new(registry: ProviderRegistry, config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(FileOperationService {
            registry: Arc::new(registry),
            config: Arc::new(config),
            jobs: Mutex::new(HashMap::new()),
        })
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<Uuid, JobHandle>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Submit a job and start it on a worker thread.
    ///
    /// Sources and destination are resolved and pre-flighted before this
    /// returns, so a recursive copy is rejected here without any write.
    pub fn submit(
        &self,
        kind: OperationKind,
        sources: &[DocumentRef],
        destination: Option<&DocumentRef>,
    ) -> Result<Uuid, EngineError> {
        let mut job = create_job(
            Arc::clone(&self.registry),
            kind,
            sources,
            destination,
            &self.config,
        )?;
        let id = job.id;
        let handle_progress = job.shared_progress();
        let listeners = job.listeners();
        let cancel = job.cancel_token();
        let created_at = job.created_at;
        let config = Arc::clone(&self.config);

        let worker = thread::Builder::new()
            .name(format!("docjobs-{}", &id.simple().to_string()[..8]))
            .spawn(move || {
                let result = run_job(&mut job, &config);
                if let Err(e) = &result {
                    error!(job = %job.id, "Job aborted: {}", e);
                }
                result
            })
            .map_err(EngineError::Worker)?;

        let mut jobs = self.jobs();
        reap(&mut jobs);
        jobs.insert(
            id,
            JobHandle {
                kind,
                created_at,
                progress: handle_progress,
                listeners,
                cancel,
                worker: Some(worker),
                result: None,
            },
        );
        drop(jobs);
        debug!(job = %id, "Submitted {} job", kind);
        Ok(id)
    }

    /// Request cancellation. Returns false for unknown or finished jobs.
    pub fn cancel(&self, id: Uuid) -> bool {
        match self.jobs().get(&id) {
            Some(handle) if !handle.progress.get().state.is_terminal() => {
                handle.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Register a listener. It receives the current snapshot immediately and
    /// every later published snapshot, the terminal one included.
    pub fn subscribe(&self, id: Uuid, listener: Arc<dyn ProgressListener>) -> bool {
        let (listeners, progress) = match self.jobs().get(&id) {
            Some(handle) => (handle.listeners.clone(), handle.progress.clone()),
            None => return false,
        };
        listeners.subscribe(listener, || progress.get());
        true
    }

    /// Latest snapshot of a job.
    pub fn progress(&self, id: Uuid) -> Option<JobProgress> {
        self.jobs().get(&id).map(|handle| handle.progress.get())
    }

    /// Operation kind of a job.
    pub fn kind(&self, id: Uuid) -> Option<OperationKind> {
        self.jobs().get(&id).map(|handle| handle.kind)
    }

    /// Snapshots of every tracked job, oldest first.
    pub fn snapshots(&self) -> Vec<JobProgress> {
        let mut jobs = self.jobs();
        reap(&mut jobs);
        let mut handles: Vec<&JobHandle> = jobs.values().collect();
        handles.sort_by_key(|handle| handle.created_at);
        handles.iter().map(|handle| handle.progress.get()).collect()
    }

    /// Combined progress over every tracked job.
    pub fn aggregate(&self) -> AggregateProgress {
        aggregate_progress(&self.snapshots())
    }

    /// Block until a job finishes and stop tracking it.
    ///
    /// # Errors
    /// Returns EngineError::UnknownJob for an id that is not tracked, or the
    /// job-level error that aborted the job.
    pub fn wait(&self, id: Uuid) -> Result<JobProgress, EngineError> {
        let handle = self.jobs().remove(&id).ok_or(EngineError::UnknownJob(id))?;
        match (handle.worker, handle.result) {
            (Some(worker), _) => join_worker(id, worker),
            (None, Some(result)) => result,
            (None, None) => Err(EngineError::UnknownJob(id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::JobState;
    use crate::progress::ChannelListener;
    use crate::provider::MemoryProvider;
    use std::time::Duration;

    fn service() -> (Arc<MemoryProvider>, FileOperationService) {
        let provider = Arc::new(MemoryProvider::new("mem", "Root"));
        let mut registry = ProviderRegistry::new();
        registry.register(provider.clone());
        let service = FileOperationService::new(registry, EngineConfig::default())
            .expect("Failed to create service");
        (provider, service)
    }

    #[test]
    fn test_submit_and_wait() {
        let (provider, service) = service();
        let root = provider.root();
        let file = provider
            .create_file(&root, "a.txt", "text/plain", b"hello")
            .expect("Failed to create file");
        let dest = provider.create_dir(&root, "dest").expect("Failed to create dir");

        let id = service
            .submit(OperationKind::Copy, &[file], Some(&dest))
            .expect("Failed to submit");
        let progress = service.wait(id).expect("Job failed");

        assert_eq!(progress.state, JobState::Completed);
        assert_eq!(progress.msg, "Copying a.txt to dest");
        assert_eq!((progress.current_bytes, progress.required_bytes), (5, 5));
        assert_eq!(provider.children_names(&dest), vec!["a.txt"]);
        assert!(service.progress(id).is_none());
    }

    fn wait_until_finished(service: &FileOperationService, id: Uuid) {
        for _ in 0..500 {
            if service.jobs().get(&id).map_or(true, JobHandle::is_finished) {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("Job {} did not finish", id);
    }

    #[test]
    fn test_finished_jobs_are_reaped() {
        let (provider, service) = service();
        let root = provider.root();
        let mut ids = Vec::new();
        for index in 0..MAX_FINISHED_JOBS + 5 {
            let file = provider
                .create_file(&root, &format!("{}.txt", index), "text/plain", b"x")
                .expect("Failed to create file");
            let id = service
                .submit(OperationKind::Delete, &[file], None)
                .expect("Failed to submit");
            wait_until_finished(&service, id);
            ids.push(id);
        }

        let snapshots = service.snapshots();
        assert_eq!(snapshots.len(), MAX_FINISHED_JOBS);
        assert!(snapshots.iter().all(|p| p.state == JobState::Completed));
        assert!(service.progress(ids[0]).is_none());
        assert!(matches!(service.wait(ids[0]), Err(EngineError::UnknownJob(_))));

        let last = ids[ids.len() - 1];
        let progress = service.wait(last).expect("Job failed");
        assert_eq!(progress.state, JobState::Completed);
        assert_eq!(service.snapshots().len(), MAX_FINISHED_JOBS - 1);
    }

    #[test]
    fn test_unknown_job() {
        let (_, service) = service();
        let id = Uuid::new_v4();
        assert!(!service.cancel(id));
        assert!(service.progress(id).is_none());
        assert!(matches!(service.wait(id), Err(EngineError::UnknownJob(_))));
        assert_eq!(service.aggregate(), AggregateProgress::Hidden);
    }

    #[test]
    fn test_subscribe_sees_terminal_update() {
        let (provider, service) = service();
        let file = provider
            .create_file(&provider.root(), "a.txt", "text/plain", b"a")
            .expect("Failed to create file");
        let id = service
            .submit(OperationKind::Delete, &[file], None)
            .expect("Failed to submit");

        let (listener, rx) = ChannelListener::channel();
        assert!(service.subscribe(id, Arc::new(listener)));
        service.wait(id).expect("Job failed");

        let updates: Vec<JobProgress> = rx.try_iter().collect();
        assert!(!updates.is_empty());
        assert_eq!(updates.last().map(|p| p.state), Some(JobState::Completed));
    }

    #[test]
    fn test_cancel_running_job() {
        let (provider, service) = service();
        let root = provider.root();
        let dir = provider.create_dir(&root, "slow").expect("Failed to create dir");
        provider
            .create_file(&dir, "a.txt", "text/plain", b"a")
            .expect("Failed to create file");
        let dest = provider.create_dir(&root, "dest").expect("Failed to create dir");
        provider.set_loading_duration(Duration::from_secs(5));

        let id = service
            .submit(OperationKind::Copy, &[dir], Some(&dest))
            .expect("Failed to submit");
        assert!(service.cancel(id));
        let progress = service.wait(id).expect("Job failed");

        assert_eq!(progress.state, JobState::Canceled);
        assert!(progress.msg.starts_with("Canceled: "));
    }
}
