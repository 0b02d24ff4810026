//! Job orchestration module.
//!
//! This module provides the main job lifecycle functions:
//! - Creating a job from source and destination documents (with pre-flight checks)
//! - Planning a job (measuring the source trees)
//! - Running a job (executing the operation)
//!
//! Compress and extract live in `archive`; they run through the same `JobRun`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{DocumentError, EngineError};
use crate::model::{DocumentRef, JobProgress, JobState, OperationKind, TransferOutcome};
use crate::progress::{ListenerSet, ProgressListener};
use crate::provider::{DocumentsProvider, ProviderRegistry};
use crate::state::{CancellationToken, JobStateMachine, SharedProgress};
use crate::transfer::TransferExecutor;
use crate::walker::{check_recursion, measure, TreeMeasure, TreeWalker, WalkEntry, WalkFailure};

/// One requested operation over a set of documents.
pub struct Job {
    pub id: Uuid,
    pub kind: OperationKind,
    /// Sources that resolved at creation, in request order
    pub sources: Vec<DocumentRef>,
    pub destination: Option<DocumentRef>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    unresolved: u64,
    registry: Arc<ProviderRegistry>,
    cancel: CancellationToken,
    state: JobStateMachine,
    plan: Option<Vec<TreeMeasure>>,
}

impl Job {
    /// Current progress snapshot.
    pub fn progress(&self) -> JobProgress {
        self.state.snapshot().clone()
    }

    pub fn state(&self) -> JobState {
        self.state.state()
    }

    /// Read handle for other threads.
    pub fn shared_progress(&self) -> SharedProgress {
        self.state.shared()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request cancellation; honored at the next document or chunk boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Number of requested sources that could not be resolved.
    pub fn unresolved_sources(&self) -> u64 {
        self.unresolved
    }

    /// Register a listener. It receives the current snapshot immediately.
    pub fn subscribe(&self, listener: Arc<dyn ProgressListener>) {
        let shared = self.state.shared();
        self.state.listeners().subscribe(listener, || shared.get());
    }

    pub(crate) fn listeners(&self) -> ListenerSet {
        self.state.listeners().clone()
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("sources", &self.sources.len())
            .field("state", &self.state.state())
            .finish()
    }
}

/// Create a new job.
///
/// Re-resolves every source and the destination, then runs the pre-flight
/// checks. Nothing is written to any provider.
///
/// # Arguments
/// * `registry` - Providers the documents are resolved through
/// * `kind` - Operation to perform
/// * `sources` - Documents to operate on
/// * `destination` - Target directory; ignored for Delete
/// * `config` - Engine configuration
///
/// # Returns
/// A new Job in Queued state
///
/// # Errors
/// Returns EngineError if the destination is missing or not a directory, if no
/// source resolves, or if a source would be copied into itself.
pub fn create_job(
    registry: Arc<ProviderRegistry>,
    kind: OperationKind,
    sources: &[DocumentRef],
    destination: Option<&DocumentRef>,
    config: &EngineConfig,
) -> Result<Job, EngineError> {
    config.validate()?;

    let destination = if kind.needs_destination() {
        let requested = destination.ok_or(EngineError::DestinationRequired(kind))?;
        let resolved = registry.refresh(requested)?;
        if !resolved.is_directory() {
            return Err(EngineError::DestinationNotDirectory(resolved.display_name));
        }
        Some(resolved)
    } else {
        None
    };

    let mut resolved = Vec::with_capacity(sources.len());
    let mut unresolved = 0u64;
    for source in sources {
        match registry.refresh(source) {
            Ok(document) => resolved.push(document),
            Err(e) => {
                debug!("Source {} did not resolve: {}", source, e);
                unresolved += 1;
            }
        }
    }
    if resolved.is_empty() {
        return Err(EngineError::NoSources);
    }

    if let Some(destination) = &destination {
        if kind.checks_recursion() {
            for source in &resolved {
                let provider = registry.get(&source.authority)?;
                check_recursion(kind, source, destination, provider.as_ref())?;
            }
        }
    }

    let id = Uuid::new_v4();
    let msg = operation_message(kind, &resolved, unresolved, destination.as_ref());
    let state = JobStateMachine::new(
        id,
        msg,
        verb(kind),
        ListenerSet::new(),
        config.progress_interval(),
    );
    info!(job = %id, "Created {} job with {} sources", kind, resolved.len());

    Ok(Job {
        id,
        kind,
        sources: resolved,
        destination,
        created_at: Utc::now(),
        finished_at: None,
        unresolved,
        registry,
        cancel: CancellationToken::new(),
        state,
        plan: None,
    })
}

/// Plan a job by measuring its sources.
///
/// Records the expected document count and, when every size is known up
/// front, the expected byte count. Delete and extract jobs count sources only.
///
/// # Errors
/// Returns EngineError::InvalidState if the job is not Queued.
pub fn plan_job(job: &mut Job, config: &EngineConfig) -> Result<(), EngineError> {
    expect_queued(job)?;

    let measures: Vec<TreeMeasure> = job
        .sources
        .iter()
        .map(|source| match job.kind {
            OperationKind::Copy | OperationKind::Move | OperationKind::Compress
                if config.compute_totals =>
            {
                match job.registry.get(&source.authority) {
                    Ok(provider) => {
                        measure(provider, source.clone(), config, job.cancel.clone())
                    }
                    Err(_) => unmeasured(),
                }
            }
            _ => unmeasured(),
        })
        .collect();

    let documents = measures.iter().map(|m| m.documents).sum::<u64>() + job.unresolved;
    let bytes = match job.kind {
        OperationKind::Delete | OperationKind::Extract => None,
        _ => measures
            .iter()
            .try_fold(0u64, |total, m| m.bytes.map(|b| total.saturating_add(b))),
    };
    debug!(job = %job.id, documents, ?bytes, "Planned job");

    job.state.set_totals(documents, bytes);
    job.plan = Some(measures);
    Ok(())
}

/// Run a job, executing its operation.
///
/// Transitions the job from Queued to Running and then to a terminal state.
/// Plans the job first if `plan_job` was not called. Per-document errors are
/// recorded in the progress counters and do NOT stop the job.
///
/// # Returns
/// The terminal progress snapshot
///
/// # Errors
/// Returns EngineError if the job is not Queued, or if a job-level error
/// (such as losing a provider) aborted it. The job is Failed in that case.
pub fn run_job(job: &mut Job, config: &EngineConfig) -> Result<JobProgress, EngineError> {
    expect_queued(job)?;
    if job.plan.is_none() {
        plan_job(job, config)?;
    }

    if job.cancel.is_canceled() {
        job.state.cancel();
        job.finished_at = Some(Utc::now());
        return Ok(job.progress());
    }

    let measures = job.plan.take().unwrap_or_default();
    if let Err(e) = check_free_space(job, &measures) {
        job.plan = Some(measures);
        job.finished_at = Some(Utc::now());
        job.state.fail(&e);
        return Err(e);
    }

    job.state.start();
    job.state.documents_failed(job.unresolved);

    let mut run = JobRun {
        kind: job.kind,
        registry: &job.registry,
        config,
        cancel: &job.cancel,
        state: &mut job.state,
    };
    let result = match job.kind {
        OperationKind::Copy | OperationKind::Move => match &job.destination {
            Some(destination) => run.transfer(&job.sources, &measures, destination),
            None => Err(EngineError::DestinationRequired(job.kind)),
        },
        OperationKind::Delete => run.delete(&job.sources),
        OperationKind::Compress => match &job.destination {
            Some(destination) => run.compress(&job.sources, destination),
            None => Err(EngineError::DestinationRequired(job.kind)),
        },
        OperationKind::Extract => match &job.destination {
            Some(destination) => run.extract(&job.sources, destination),
            None => Err(EngineError::DestinationRequired(job.kind)),
        },
    };
    job.plan = Some(measures);
    job.finished_at = Some(Utc::now());

    match result {
        Ok(()) if job.cancel.is_canceled() => {
            job.state.cancel();
            Ok(job.progress())
        }
        Ok(()) => {
            job.state.finish();
            Ok(job.progress())
        }
        Err(e) => {
            job.state.fail(&e);
            Err(e)
        }
    }
}

/// The display message for an operation.
///
/// A single source is named; several are counted ("Copying 3 files to Docs").
pub fn operation_message(
    kind: OperationKind,
    sources: &[DocumentRef],
    unresolved: u64,
    destination: Option<&DocumentRef>,
) -> String {
    let subject = match sources {
        [only] if unresolved == 0 => only.display_name.clone(),
        _ => format!("{} files", sources.len() as u64 + unresolved),
    };
    match (kind, destination) {
        (OperationKind::Copy | OperationKind::Move | OperationKind::Extract, Some(dest)) => {
            format!("{} {} to {}", kind.progressive(), subject, dest.display_name)
        }
        _ => format!("{} {}", kind.progressive(), subject),
    }
}

/// Refuse a copy or move whose planned bytes exceed the destination's free
/// space. Sources a same-provider move relocates without copying are left out,
/// as are compress jobs, whose archive size is not known ahead.
fn check_free_space(job: &Job, measures: &[TreeMeasure]) -> Result<(), EngineError> {
    if !matches!(job.kind, OperationKind::Copy | OperationKind::Move) {
        return Ok(());
    }
    let Some(destination) = &job.destination else {
        return Ok(());
    };
    let mut required = 0u64;
    for (source, measured) in job.sources.iter().zip(measures) {
        if job.kind == OperationKind::Move && moves_in_place(source, destination) {
            continue;
        }
        let Some(bytes) = measured.bytes else {
            return Ok(());
        };
        required = required.saturating_add(bytes);
    }
    if required == 0 {
        return Ok(());
    }

    let provider = job.registry.get(&destination.authority)?;
    let available = match provider.free_bytes(&destination.document_id) {
        Ok(Some(available)) => available,
        Ok(None) => return Ok(()),
        Err(e) if e.is_unavailable() => {
            return Err(EngineError::from_provider(&destination.authority, e))
        }
        Err(e) => {
            debug!("Free space of {} unknown: {}", destination.display_name, e);
            return Ok(());
        }
    };
    if required > available {
        return Err(EngineError::InsufficientSpace {
            name: destination.display_name.clone(),
            required,
            available,
        });
    }
    Ok(())
}

/// True when a move of `source` can be handed to its own provider.
fn moves_in_place(source: &DocumentRef, destination: &DocumentRef) -> bool {
    source.authority == destination.authority && source.flags.supports_move
}

fn verb(kind: OperationKind) -> &'static str {
    match kind {
        OperationKind::Copy => "Copy",
        OperationKind::Move => "Move",
        OperationKind::Compress => "Compress",
        OperationKind::Extract => "Extract",
        OperationKind::Delete => "Delete",
    }
}

fn expect_queued(job: &Job) -> Result<(), EngineError> {
    if job.state.state() != JobState::Queued {
        return Err(EngineError::InvalidState {
            id: job.id,
            actual: job.state.state(),
            expected: JobState::Queued,
        });
    }
    Ok(())
}

fn unmeasured() -> TreeMeasure {
    TreeMeasure {
        documents: 1,
        bytes: None,
    }
}

/// Borrowed view of a running job, shared by every operation.
pub(crate) struct JobRun<'a> {
    pub(crate) kind: OperationKind,
    pub(crate) registry: &'a ProviderRegistry,
    pub(crate) config: &'a EngineConfig,
    pub(crate) cancel: &'a CancellationToken,
    pub(crate) state: &'a mut JobStateMachine,
}

impl<'a> JobRun<'a> {
    pub(crate) fn provider(&self, authority: &str) -> Result<Arc<dyn DocumentsProvider>, EngineError> {
        self.registry.get(authority)
    }

    /// Fold a document outcome into the job, escalating loss of a provider.
    pub(crate) fn record(
        &mut self,
        authority: &str,
        outcome: TransferOutcome,
    ) -> Result<(), EngineError> {
        self.record_transfer(authority, authority, outcome)
    }

    /// Like `record`, for outcomes that involve a destination provider too.
    pub(crate) fn record_transfer(
        &mut self,
        source_authority: &str,
        destination_authority: &str,
        outcome: TransferOutcome,
    ) -> Result<(), EngineError> {
        match outcome {
            TransferOutcome::Failed(DocumentError::Canceled) => {}
            TransferOutcome::Failed(err) => {
                let err = err.escalate_transfer(source_authority, destination_authority)?;
                self.state.document_finished(&TransferOutcome::Failed(err));
            }
            other => self.state.document_finished(&other),
        }
        Ok(())
    }

    /// Record a directory that was reached but could not be listed.
    pub(crate) fn walk_failed(&mut self, failure: WalkFailure) -> Result<(), EngineError> {
        if matches!(failure.error, DocumentError::Canceled) {
            return Ok(());
        }
        let err = failure.error.escalate(&failure.document.authority)?;
        self.state.note_failure(&err);
        Ok(())
    }

    fn transfer(
        &mut self,
        sources: &[DocumentRef],
        measures: &[TreeMeasure],
        destination: &DocumentRef,
    ) -> Result<(), EngineError> {
        for (index, source) in sources.iter().enumerate() {
            if self.cancel.is_canceled() {
                return Ok(());
            }
            let measured = measures.get(index).copied().unwrap_or_else(unmeasured);
            self.transfer_source(source, measured, destination)?;
        }
        Ok(())
    }

    /// True if `destination` is the directory `source` already lives in.
    fn already_in(
        &self,
        source: &DocumentRef,
        destination: &DocumentRef,
    ) -> Result<bool, EngineError> {
        if source.authority != destination.authority {
            return Ok(false);
        }
        match self.provider(&source.authority)?.parent_id(&source.document_id) {
            Ok(parent) => Ok(parent.as_deref() == Some(destination.document_id.as_str())),
            Err(e) if e.is_unavailable() => Err(EngineError::from_provider(&source.authority, e)),
            Err(e) => {
                debug!("No parent for {}: {}", source.display_name, e);
                Ok(false)
            }
        }
    }

    fn transfer_source(
        &mut self,
        source: &DocumentRef,
        measured: TreeMeasure,
        destination: &DocumentRef,
    ) -> Result<(), EngineError> {
        let source_provider = self.provider(&source.authority)?;
        let dest_provider = self.provider(&destination.authority)?;

        if self.kind == OperationKind::Move && self.already_in(source, destination)? {
            debug!("{} is already in {}", source.display_name, destination.display_name);
            self.record(&source.authority, TransferOutcome::Skipped)?;
            self.state.documents_succeeded(
                measured.documents.saturating_sub(1),
                measured.bytes.unwrap_or(0),
            );
            return Ok(());
        }

        if self.kind == OperationKind::Move && moves_in_place(source, destination) {
            match source_provider.move_document(&source.document_id, &destination.document_id) {
                Ok(moved) => {
                    debug!("Moved {} to {}", source.display_name, moved);
                    self.state
                        .documents_succeeded(measured.documents, measured.bytes.unwrap_or(0));
                    return Ok(());
                }
                Err(e) if e.is_unavailable() => {
                    return Err(EngineError::from_provider(&source.authority, e));
                }
                Err(e) => debug!("Falling back to copy for {}: {}", source.display_name, e),
            }
        }

        let executor = TransferExecutor::new(self.config, self.cancel);
        let walker = TreeWalker::new(
            Arc::clone(&source_provider),
            source.clone(),
            self.config,
            self.cancel.clone(),
        );
        // parents[d] is the destination directory for documents at depth d
        let mut parents: Vec<Option<DocumentRef>> = vec![Some(destination.clone())];
        let mut subtree_failed = false;

        for entry in walker {
            if self.cancel.is_canceled() {
                return Ok(());
            }
            let WalkEntry { document, depth } = match entry {
                Ok(entry) => entry,
                Err(failure) => {
                    subtree_failed = true;
                    self.walk_failed(failure)?;
                    continue;
                }
            };
            parents.truncate(depth + 1);
            let parent = parents.last().cloned().flatten();

            let result: Result<Option<DocumentRef>, DocumentError> = match parent {
                None => Err(DocumentError::ParentFailed {
                    name: document.display_name.clone(),
                }),
                Some(parent) if document.is_directory() => executor
                    .create_directory(dest_provider.as_ref(), &parent, &document.display_name)
                    .map(Some),
                Some(_) if self.kind == OperationKind::Move && document.is_virtual() => {
                    Err(DocumentError::ConversionUnsupported {
                        name: document.display_name.clone(),
                        required: self.config.export_mime_type.clone(),
                    })
                }
                Some(parent) => {
                    let state = &mut *self.state;
                    executor
                        .copy_document(
                            source_provider.as_ref(),
                            &document,
                            dest_provider.as_ref(),
                            &parent,
                            &mut |bytes| state.add_bytes(bytes),
                        )
                        .map(|_| None)
                }
            };

            let created = match result {
                Ok(created) => {
                    self.record(&document.authority, TransferOutcome::Success)?;
                    created
                }
                Err(err) => {
                    if !matches!(err, DocumentError::Canceled) {
                        subtree_failed = true;
                    }
                    self.record_transfer(
                        &document.authority,
                        &destination.authority,
                        TransferOutcome::Failed(err),
                    )?;
                    None
                }
            };
            if document.is_directory() {
                parents.push(created);
            }
        }

        if self.kind == OperationKind::Move && !subtree_failed && !self.cancel.is_canceled() {
            if let Err(e) = source_provider.delete(&source.document_id) {
                let err = DocumentError::provider(&source.display_name, e)
                    .escalate(&source.authority)?;
                self.state.note_failure(&err);
            }
        }
        Ok(())
    }

    fn delete(&mut self, sources: &[DocumentRef]) -> Result<(), EngineError> {
        for source in sources {
            if self.cancel.is_canceled() {
                return Ok(());
            }
            let result = if source.flags.supports_delete {
                self.provider(&source.authority)?
                    .delete(&source.document_id)
                    .map_err(|e| DocumentError::provider(&source.display_name, e))
            } else {
                Err(DocumentError::Unsupported {
                    name: source.display_name.clone(),
                    operation: "delete",
                })
            };
            if result.is_ok() {
                debug!("Deleted {}", source.display_name);
            }
            self.record(&source.authority, result.into())?;
        }
        Ok(())
    }
}
