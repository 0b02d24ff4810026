//! Source tree enumeration.
//!
//! `TreeWalker` yields a source document and all of its descendants lazily in
//! depth-first pre-order, so a directory always comes before its children.
//! Listings that report "loading" are polled until complete.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::EngineConfig;
use crate::error::{DocumentError, EngineError};
use crate::model::{DocumentRef, OperationKind};
use crate::provider::DocumentsProvider;
use crate::state::CancellationToken;

/// One document reached by the walk. The walk root has depth 0.
#[derive(Debug, Clone)]
pub struct WalkEntry {
    pub document: DocumentRef,
    pub depth: usize,
}

/// A directory whose children could not be listed.
#[derive(Debug)]
pub struct WalkFailure {
    pub document: DocumentRef,
    pub depth: usize,
    pub error: DocumentError,
}

/// Planned size of one source tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeMeasure {
    /// Documents in the tree, directories included
    pub documents: u64,
    /// Sum of file sizes; `None` when any size is unknown ahead of the transfer
    pub bytes: Option<u64>,
}

/// Reject a destination that is the source itself or lies below it.
///
/// Only consults the source's provider; nothing is written.
pub fn check_recursion(
    operation: OperationKind,
    source: &DocumentRef,
    destination: &DocumentRef,
    provider: &dyn DocumentsProvider,
) -> Result<(), EngineError> {
    if source.authority != destination.authority {
        return Ok(());
    }
    let recursive = source.same_document(destination)
        || (source.is_directory()
            && provider
                .is_descendant(&source.document_id, &destination.document_id)
                .map_err(|e| EngineError::from_provider(&source.authority, e))?);
    if recursive {
        return Err(EngineError::RecursiveOperation {
            operation,
            source_name: source.display_name.clone(),
        });
    }
    Ok(())
}

/// List a directory, re-querying while the provider reports it as loading.
pub(crate) fn list_directory(
    provider: &dyn DocumentsProvider,
    directory: &DocumentRef,
    poll_interval: Duration,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Vec<DocumentRef>, DocumentError> {
    let deadline = Instant::now() + timeout;
    loop {
        let listing = provider
            .list_children(&directory.document_id)
            .map_err(|e| DocumentError::provider(&directory.display_name, e))?;
        if !listing.loading {
            return Ok(listing.children);
        }
        if cancel.is_canceled() {
            return Err(DocumentError::Canceled);
        }
        if Instant::now() >= deadline {
            return Err(DocumentError::ListingTimedOut {
                name: directory.display_name.clone(),
            });
        }
        debug!("Listing of {} still loading", directory.display_name);
        thread::sleep(poll_interval);
    }
}

pub struct TreeWalker {
    provider: Arc<dyn DocumentsProvider>,
    cancel: CancellationToken,
    poll_interval: Duration,
    timeout: Duration,
    root: Option<DocumentRef>,
    pending: Option<(DocumentRef, usize)>,
    stack: Vec<(std::vec::IntoIter<DocumentRef>, usize)>,
}

impl TreeWalker {
    pub fn new(
        provider: Arc<dyn DocumentsProvider>,
        root: DocumentRef,
        config: &EngineConfig,
        cancel: CancellationToken,
    ) -> Self {
        TreeWalker {
            provider,
            cancel,
            poll_interval: config.listing_poll_interval(),
            timeout: config.listing_timeout(),
            root: Some(root),
            pending: None,
            stack: Vec::new(),
        }
    }

    fn visit(&mut self, document: DocumentRef, depth: usize) -> WalkEntry {
        if document.is_directory() {
            self.pending = Some((document.clone(), depth));
        }
        WalkEntry { document, depth }
    }
}

impl Iterator for TreeWalker {
    type Item = Result<WalkEntry, WalkFailure>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cancel.is_canceled() {
            return None;
        }
        if let Some(root) = self.root.take() {
            return Some(Ok(self.visit(root, 0)));
        }
        // Children are listed only once the caller has handled the directory.
        if let Some((directory, depth)) = self.pending.take() {
            match list_directory(
                self.provider.as_ref(),
                &directory,
                self.poll_interval,
                self.timeout,
                &self.cancel,
            ) {
                Ok(children) => self.stack.push((children.into_iter(), depth + 1)),
                Err(error) => {
                    return Some(Err(WalkFailure {
                        document: directory,
                        depth,
                        error,
                    }))
                }
            }
        }
        loop {
            let (children, depth) = self.stack.last_mut()?;
            let depth = *depth;
            match children.next() {
                Some(child) => return Some(Ok(self.visit(child, depth))),
                None => {
                    self.stack.pop();
                }
            }
        }
    }
}

/// Count documents and sum sizes below `root`.
///
/// Directories that cannot be listed contribute only themselves.
pub fn measure(
    provider: Arc<dyn DocumentsProvider>,
    root: DocumentRef,
    config: &EngineConfig,
    cancel: CancellationToken,
) -> TreeMeasure {
    let mut documents = 0u64;
    let mut bytes = Some(0u64);
    for entry in TreeWalker::new(provider, root, config, cancel) {
        let Ok(entry) = entry else { continue };
        documents += 1;
        if entry.document.is_directory() {
            continue;
        }
        bytes = match (bytes, entry.document.size) {
            (Some(total), Some(size)) if !entry.document.is_virtual() => {
                Some(total.saturating_add(size))
            }
            _ => None,
        };
    }
    TreeMeasure { documents, bytes }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MemoryProvider;

    fn tree() -> (Arc<MemoryProvider>, DocumentRef) {
        let provider = Arc::new(MemoryProvider::new("mem", "Root"));
        let top = provider
            .create_dir(&provider.root(), "top")
            .expect("Failed to create dir");
        provider
            .create_file(&top, "a.txt", "text/plain", b"aaaa")
            .expect("Failed to create file");
        let sub = provider.create_dir(&top, "sub").expect("Failed to create dir");
        provider
            .create_file(&sub, "b.txt", "text/plain", b"bb")
            .expect("Failed to create file");
        provider
            .create_file(&top, "c.txt", "text/plain", b"c")
            .expect("Failed to create file");
        (provider, top)
    }

    fn names(walker: TreeWalker) -> Vec<(String, usize)> {
        walker
            .map(|e| e.expect("Walk failed"))
            .map(|e| (e.document.display_name, e.depth))
            .collect()
    }

    #[test]
    fn test_pre_order_walk() {
        let (provider, top) = tree();
        let walker = TreeWalker::new(
            provider,
            top,
            &EngineConfig::default(),
            CancellationToken::new(),
        );
        assert_eq!(
            names(walker),
            vec![
                ("top".to_string(), 0),
                ("a.txt".to_string(), 1),
                ("sub".to_string(), 1),
                ("b.txt".to_string(), 2),
                ("c.txt".to_string(), 1),
            ]
        );
    }

    #[test]
    fn test_walk_waits_for_loading_listing() {
        let (provider, top) = tree();
        provider.set_loading_duration(Duration::from_millis(60));
        let config = EngineConfig {
            listing_poll_interval_ms: 10,
            ..EngineConfig::default()
        };
        let walker = TreeWalker::new(provider, top, &config, CancellationToken::new());
        assert_eq!(names(walker).len(), 5);
    }

    #[test]
    fn test_listing_timeout_is_a_walk_failure() {
        let (provider, top) = tree();
        provider.set_loading_duration(Duration::from_secs(60));
        let config = EngineConfig {
            listing_poll_interval_ms: 5,
            listing_timeout_ms: 30,
            ..EngineConfig::default()
        };
        let mut walker = TreeWalker::new(provider, top, &config, CancellationToken::new());
        assert!(walker.next().expect("Missing root").is_ok());
        let failure = walker
            .next()
            .expect("Missing failure")
            .expect_err("Listing should time out");
        assert!(matches!(failure.error, DocumentError::ListingTimedOut { .. }));
        assert!(walker.next().is_none());
    }

    #[test]
    fn test_canceled_walk_stops() {
        let (provider, top) = tree();
        let cancel = CancellationToken::new();
        let mut walker = TreeWalker::new(provider, top, &EngineConfig::default(), cancel.clone());
        assert!(walker.next().is_some());
        cancel.cancel();
        assert!(walker.next().is_none());
    }

    #[test]
    fn test_measure_counts_documents_and_bytes() {
        let (provider, top) = tree();
        let measured = measure(
            provider,
            top,
            &EngineConfig::default(),
            CancellationToken::new(),
        );
        assert_eq!(measured.documents, 5);
        assert_eq!(measured.bytes, Some(7));
    }

    #[test]
    fn test_measure_with_virtual_document_has_unknown_bytes() {
        let (provider, top) = tree();
        provider
            .create_virtual_file(&top, "doc.sth", "application/sth", &["application/pdf"], b"%PDF")
            .expect("Failed to create virtual file");
        let measured = measure(
            provider,
            top,
            &EngineConfig::default(),
            CancellationToken::new(),
        );
        assert_eq!(measured.documents, 6);
        assert_eq!(measured.bytes, None);
    }

    #[test]
    fn test_recursion_into_self_and_descendant() {
        let (provider, top) = tree();
        let sub = provider.find_child(&top, "sub").expect("Missing sub");
        let root = provider.root();

        assert!(matches!(
            check_recursion(OperationKind::Copy, &top, &top, provider.as_ref()),
            Err(EngineError::RecursiveOperation { .. })
        ));
        assert!(matches!(
            check_recursion(OperationKind::Copy, &top, &sub, provider.as_ref()),
            Err(EngineError::RecursiveOperation { .. })
        ));
        assert!(check_recursion(OperationKind::Copy, &sub, &root, provider.as_ref()).is_ok());
        assert_eq!(provider.write_calls(), 0);
    }

    #[test]
    fn test_recursion_check_ignores_other_authorities() {
        let (provider, top) = tree();
        let other = MemoryProvider::new("other", "Elsewhere");
        assert!(check_recursion(OperationKind::Move, &top, &other.root(), provider.as_ref()).is_ok());
    }
}
