//! Storage provider abstraction.
//!
//! Documents are never raw paths: they are `(authority, document_id)` pairs
//! resolved through the `DocumentsProvider` registered for the authority.
//! All calls are blocking and are only made from job worker threads.

mod local;
mod memory;

pub use local::LocalProvider;
pub use memory::MemoryProvider;

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;

use crate::error::{EngineError, ProviderError, ProviderResult};
use crate::model::DocumentRef;

/// One answer to a directory listing query.
///
/// Providers with slow enumeration may answer with `loading = true` and an
/// incomplete (often empty) `children`; callers query again later.
#[derive(Debug, Clone, Default)]
pub struct Listing {
    pub children: Vec<DocumentRef>,
    pub loading: bool,
}

impl Listing {
    pub fn complete(children: Vec<DocumentRef>) -> Self {
        Listing {
            children,
            loading: false,
        }
    }

    pub fn loading(children: Vec<DocumentRef>) -> Self {
        Listing {
            children,
            loading: true,
        }
    }
}

/// A storage backend exposing documents by opaque identifier.
pub trait DocumentsProvider: Send + Sync {
    /// Key under which this provider is registered.
    fn authority(&self) -> &str;

    /// Resolve a document's current metadata.
    fn resolve(&self, document_id: &str) -> ProviderResult<DocumentRef>;

    /// List the direct children of a directory.
    fn list_children(&self, parent_id: &str) -> ProviderResult<Listing>;

    /// Open the document's own byte stream.
    fn open_read(&self, document_id: &str) -> ProviderResult<Box<dyn Read + Send>>;

    /// Export types offered for a virtual document.
    fn export_mime_types(&self, _document_id: &str) -> ProviderResult<Vec<String>> {
        Ok(Vec::new())
    }

    /// Open a stream of the document exported as `mime_type`.
    fn open_typed_read(
        &self,
        document_id: &str,
        mime_type: &str,
    ) -> ProviderResult<Box<dyn Read + Send>> {
        Err(ProviderError::Unsupported(format!(
            "export of {} as {}",
            document_id, mime_type
        )))
    }

    /// Create a document (or a directory, for `MIME_TYPE_DIR`) under a parent.
    ///
    /// When the name is taken the provider picks a free variant of it, so the
    /// returned display name may differ from the requested one.
    fn create_document(
        &self,
        parent_id: &str,
        mime_type: &str,
        display_name: &str,
    ) -> ProviderResult<DocumentRef>;

    /// Open a created document for writing, truncating existing content.
    fn open_write(&self, document_id: &str) -> ProviderResult<Box<dyn Write + Send>>;

    /// Delete a document; directories are deleted with their contents.
    fn delete(&self, document_id: &str) -> ProviderResult<()>;

    /// True if `document_id` lies strictly below `ancestor_id`.
    fn is_descendant(&self, ancestor_id: &str, document_id: &str) -> ProviderResult<bool>;

    /// Identifier of the directory holding `document_id`.
    ///
    /// `None` for a root, or when the provider cannot tell.
    fn parent_id(&self, _document_id: &str) -> ProviderResult<Option<String>> {
        Ok(None)
    }

    /// Bytes that can still be written below `root_id`, if the provider knows.
    fn free_bytes(&self, _root_id: &str) -> ProviderResult<Option<u64>> {
        Ok(None)
    }

    /// Move a document under another parent of the same provider.
    fn move_document(
        &self,
        document_id: &str,
        _target_parent_id: &str,
    ) -> ProviderResult<DocumentRef> {
        Err(ProviderError::Unsupported(format!("move of {}", document_id)))
    }

    /// Record a modification time on a written document. Best effort.
    fn set_last_modified(&self, _document_id: &str, _millis: i64) -> ProviderResult<()> {
        Ok(())
    }
}

/// Providers by authority.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn DocumentsProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under its own authority, replacing any previous one.
    pub fn register(&mut self, provider: Arc<dyn DocumentsProvider>) {
        self.providers
            .insert(provider.authority().to_string(), provider);
    }

    pub fn get(&self, authority: &str) -> Result<Arc<dyn DocumentsProvider>, EngineError> {
        self.providers
            .get(authority)
            .cloned()
            .ok_or_else(|| EngineError::UnknownAuthority(authority.to_string()))
    }

    /// Resolve a document by authority and identifier.
    pub fn resolve(&self, authority: &str, document_id: &str) -> Result<DocumentRef, EngineError> {
        let provider = self.get(authority)?;
        provider
            .resolve(document_id)
            .map_err(|e| EngineError::from_provider(authority, e))
    }

    /// Re-resolve a possibly stale reference.
    pub fn refresh(&self, document: &DocumentRef) -> Result<DocumentRef, EngineError> {
        self.resolve(&document.authority, &document.document_id)
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut authorities: Vec<&String> = self.providers.keys().collect();
        authorities.sort();
        f.debug_struct("ProviderRegistry")
            .field("authorities", &authorities)
            .finish()
    }
}

/// Pick a display name not rejected by `taken`.
///
/// `report.pdf` becomes `report (1).pdf`, `report (2).pdf`, and so on;
/// names without an extension get the counter at the end.
pub fn unique_display_name(name: &str, taken: impl Fn(&str) -> bool) -> String {
    if !taken(name) {
        return name.to_string();
    }
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    };
    let mut counter = 1u32;
    loop {
        let candidate = match ext {
            Some(ext) => format!("{} ({}).{}", stem, counter, ext),
            None => format!("{} ({})", stem, counter),
        };
        if !taken(&candidate) {
            return candidate;
        }
        counter += 1;
    }
}
