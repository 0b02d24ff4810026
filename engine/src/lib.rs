//! # docjobs - Document Operation Engine
//!
//! A headless, cancellable file-operation engine over provider-backed documents.
//! Designed as the foundation for multiple front ends (CLI, GUI, automation).
//!
//! ## Overview
//!
//! Documents are addressed through storage providers rather than raw paths.
//! The engine copies, moves, deletes, compresses and extracts them. It features:
//! - Lazy depth-first tree walking that tolerates slow ("loading") listings
//! - Pre-flight rejection of copying a directory into itself
//! - Export of virtual documents to a concrete format (e.g. PDF)
//! - Chunked streaming with bounded read retries
//! - Per-document error isolation; only the loss of a provider aborts a job
//! - Throttled progress snapshots pushed to listeners
//!
//! ## Basic Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use docjobs::{
//!     create_job, run_job, EngineConfig, LocalProvider, OperationKind, ProviderRegistry,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let provider = Arc::new(LocalProvider::new("local", "/data"));
//! let mut registry = ProviderRegistry::new();
//! registry.register(provider.clone());
//! let registry = Arc::new(registry);
//!
//! let source = registry.resolve("local", "photos")?;
//! let destination = registry.resolve("local", "backup")?;
//!
//! let config = EngineConfig::default();
//! let mut job = create_job(registry, OperationKind::Copy, &[source], Some(&destination), &config)?;
//! let progress = run_job(&mut job, &config)?;
//! println!("{} ({} files)", progress.msg, progress.processed_files);
//! # Ok(())
//! # }
//! ```
//!
//! For background execution use `FileOperationService`, which runs every job
//! on its own thread and exposes submit / cancel / subscribe / wait.
//!
//! ## Modules
//!
//! - **model**: Core data structures (DocumentRef, JobProgress, enums)
//! - **error**: Error types and handling
//! - **config**: Engine configuration (TOML)
//! - **provider**: Storage provider trait, registry, memory and local providers
//! - **convert**: Export type negotiation for virtual documents
//! - **walker**: Source tree enumeration and recursion checks
//! - **transfer**: Per-document streaming
//! - **state**: Job state machine and cancellation
//! - **progress**: Progress listeners, throttling and aggregation
//! - **job**: Job orchestration (create, plan, run)
//! - **archive**: Compress and extract
//! - **service**: Threaded job service

pub mod archive;
pub mod config;
pub mod convert;
pub mod error;
pub mod job;
pub mod model;
pub mod progress;
pub mod provider;
pub mod service;
pub mod state;
pub mod transfer;
pub mod walker;

// Re-export main types and functions
pub use config::EngineConfig;
pub use error::{DocumentError, EngineError, ProviderError, ProviderResult};
pub use job::{create_job, plan_job, run_job, Job};
pub use model::{DocumentFlags, DocumentRef, JobProgress, JobState, OperationKind, UNKNOWN};
pub use progress::{aggregate_progress, AggregateProgress, ChannelListener, ProgressListener};
pub use provider::{DocumentsProvider, Listing, LocalProvider, MemoryProvider, ProviderRegistry};
pub use service::FileOperationService;
pub use state::CancellationToken;
