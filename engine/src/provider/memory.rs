//! In-memory provider.
//!
//! Holds a document tree in memory. Besides serving as a lightweight backend
//! for embedders, it can simulate the awkward behaviors real providers show:
//! listings that report "loading" for a while, virtual documents that only
//! export to certain types, read errors part-way through a stream, and a
//! backend that disappears.

use std::collections::HashMap;
use std::io::{self, Cursor, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::{unique_display_name, DocumentsProvider, Listing};
use crate::error::{ProviderError, ProviderResult};
use crate::model::{DocumentFlags, DocumentRef, MIME_TYPE_DIR};

const ROOT_ID: &str = "root";

#[derive(Debug, Clone)]
struct Node {
    parent: Option<String>,
    name: String,
    mime_type: String,
    flags: DocumentFlags,
    data: Vec<u8>,
    children: Vec<String>,
    export_types: Vec<String>,
    last_modified: Option<i64>,
}

/// Injected read failure: the next `remaining` opens fail after `after_bytes`.
#[derive(Debug, Clone, Copy)]
struct ReadFault {
    after_bytes: u64,
    remaining: u32,
}

#[derive(Debug)]
struct MemoryState {
    nodes: HashMap<String, Node>,
    next_id: u64,
    loading_duration: Option<Duration>,
    loading_started: HashMap<String, Instant>,
    read_faults: HashMap<String, ReadFault>,
    available: bool,
    move_supported: bool,
    free_bytes: Option<u64>,
    write_calls: u64,
}

impl MemoryState {
    fn node(&self, id: &str) -> ProviderResult<&Node> {
        self.nodes
            .get(id)
            .ok_or_else(|| ProviderError::NotFound(id.to_string()))
    }

    fn check_available(&self) -> ProviderResult<()> {
        if self.available {
            Ok(())
        } else {
            Err(ProviderError::Unavailable("memory provider is offline".to_string()))
        }
    }

    fn is_descendant(&self, ancestor_id: &str, id: &str) -> bool {
        let mut current = self.nodes.get(id).and_then(|n| n.parent.clone());
        while let Some(parent) = current {
            if parent == ancestor_id {
                return true;
            }
            current = self.nodes.get(&parent).and_then(|n| n.parent.clone());
        }
        false
    }

    fn insert(
        &mut self,
        parent_id: &str,
        name: &str,
        mime_type: &str,
        flags: DocumentFlags,
        data: Vec<u8>,
        export_types: Vec<String>,
    ) -> ProviderResult<String> {
        let parent = self.node(parent_id)?;
        if !parent.flags.is_directory {
            return Err(ProviderError::Unsupported(format!(
                "{} is not a directory",
                parent_id
            )));
        }
        let siblings: Vec<String> = parent
            .children
            .iter()
            .filter_map(|c| self.nodes.get(c).map(|n| n.name.clone()))
            .collect();
        let name = unique_display_name(name, |candidate| siblings.iter().any(|s| s == candidate));

        self.next_id += 1;
        let id = format!("doc{}", self.next_id);
        self.nodes.insert(
            id.clone(),
            Node {
                parent: Some(parent_id.to_string()),
                name,
                mime_type: mime_type.to_string(),
                flags,
                data,
                children: Vec::new(),
                export_types,
                last_modified: None,
            },
        );
        if let Some(parent) = self.nodes.get_mut(parent_id) {
            parent.children.push(id.clone());
        }
        Ok(id)
    }

    fn remove_tree(&mut self, id: &str) {
        if let Some(node) = self.nodes.remove(id) {
            for child in node.children {
                self.remove_tree(&child);
            }
        }
    }

    fn detach(&mut self, id: &str) {
        let parent = self.nodes.get(id).and_then(|n| n.parent.clone());
        if let Some(parent) = parent.and_then(|p| self.nodes.get_mut(&p)) {
            parent.children.retain(|c| c != id);
        }
    }
}

/// A provider backed by an in-memory tree.
#[derive(Debug, Clone)]
pub struct MemoryProvider {
    authority: String,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryProvider {
    /// Create an empty provider whose root directory is titled `root_title`.
    pub fn new(authority: &str, root_title: &str) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            ROOT_ID.to_string(),
            Node {
                parent: None,
                name: root_title.to_string(),
                mime_type: MIME_TYPE_DIR.to_string(),
                flags: DocumentFlags::directory(),
                data: Vec::new(),
                children: Vec::new(),
                export_types: Vec::new(),
                last_modified: None,
            },
        );
        MemoryProvider {
            authority: authority.to_string(),
            state: Arc::new(Mutex::new(MemoryState {
                nodes,
                next_id: 0,
                loading_duration: None,
                loading_started: HashMap::new(),
                read_faults: HashMap::new(),
                available: true,
                move_supported: true,
                free_bytes: None,
                write_calls: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn to_ref(&self, id: &str, node: &Node) -> DocumentRef {
        let size = if node.flags.is_directory || node.flags.is_virtual {
            None
        } else {
            Some(node.data.len() as u64)
        };
        DocumentRef {
            authority: self.authority.clone(),
            document_id: id.to_string(),
            display_name: node.name.clone(),
            mime_type: node.mime_type.clone(),
            size,
            last_modified: node.last_modified,
            flags: node.flags,
        }
    }

    fn resolve_locked(&self, state: &MemoryState, id: &str) -> ProviderResult<DocumentRef> {
        let node = state.node(id)?;
        Ok(self.to_ref(id, node))
    }

    /// The root directory.
    pub fn root(&self) -> DocumentRef {
        let state = self.lock();
        let node = &state.nodes[ROOT_ID];
        self.to_ref(ROOT_ID, node)
    }

    /// Create a directory without counting it as a write call.
    pub fn create_dir(&self, parent: &DocumentRef, name: &str) -> ProviderResult<DocumentRef> {
        let mut state = self.lock();
        let id = state.insert(
            &parent.document_id,
            name,
            MIME_TYPE_DIR,
            DocumentFlags::directory(),
            Vec::new(),
            Vec::new(),
        )?;
        self.resolve_locked(&state, &id)
    }

    /// Create a regular file without counting it as a write call.
    pub fn create_file(
        &self,
        parent: &DocumentRef,
        name: &str,
        mime_type: &str,
        contents: &[u8],
    ) -> ProviderResult<DocumentRef> {
        self.create_with_flags(parent, name, mime_type, DocumentFlags::file(), &[], contents)
    }

    /// Create a virtual document exportable to `export_types`.
    ///
    /// Typed reads in any of those types return `exported`.
    pub fn create_virtual_file(
        &self,
        parent: &DocumentRef,
        name: &str,
        mime_type: &str,
        export_types: &[&str],
        exported: &[u8],
    ) -> ProviderResult<DocumentRef> {
        self.create_with_flags(
            parent,
            name,
            mime_type,
            DocumentFlags::virtual_file(),
            export_types,
            exported,
        )
    }

    /// Create a document with explicit flags.
    pub fn create_with_flags(
        &self,
        parent: &DocumentRef,
        name: &str,
        mime_type: &str,
        flags: DocumentFlags,
        export_types: &[&str],
        contents: &[u8],
    ) -> ProviderResult<DocumentRef> {
        let mut state = self.lock();
        let id = state.insert(
            &parent.document_id,
            name,
            mime_type,
            flags,
            contents.to_vec(),
            export_types.iter().map(|t| t.to_string()).collect(),
        )?;
        self.resolve_locked(&state, &id)
    }

    /// Make the first listing of every directory report "loading" for `duration`.
    pub fn set_loading_duration(&self, duration: Duration) {
        let mut state = self.lock();
        state.loading_duration = Some(duration);
        state.loading_started.clear();
    }

    /// Make the next `times` opens of `document` fail after `after_bytes`.
    ///
    /// `u32::MAX` makes every open fail.
    pub fn fail_reads(&self, document: &DocumentRef, after_bytes: u64, times: u32) {
        self.lock().read_faults.insert(
            document.document_id.clone(),
            ReadFault {
                after_bytes,
                remaining: times,
            },
        );
    }

    /// Simulate the backend going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    /// Enable or disable the optimized move path.
    pub fn set_move_supported(&self, supported: bool) {
        self.lock().move_supported = supported;
    }

    /// Report `bytes` of free space; `None` means unknown.
    pub fn set_free_bytes(&self, bytes: Option<u64>) {
        self.lock().free_bytes = bytes;
    }

    /// Number of mutating calls made through the provider interface.
    pub fn write_calls(&self) -> u64 {
        self.lock().write_calls
    }

    /// Display names of a directory's children, in creation order.
    pub fn children_names(&self, parent: &DocumentRef) -> Vec<String> {
        let state = self.lock();
        state
            .nodes
            .get(&parent.document_id)
            .map(|node| {
                node.children
                    .iter()
                    .filter_map(|c| state.nodes.get(c).map(|n| n.name.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Find a direct child by display name.
    pub fn find_child(&self, parent: &DocumentRef, name: &str) -> Option<DocumentRef> {
        let state = self.lock();
        let node = state.nodes.get(&parent.document_id)?;
        node.children.iter().find_map(|c| {
            let child = state.nodes.get(c)?;
            (child.name == name).then(|| self.to_ref(c, child))
        })
    }

    /// Current contents of a document.
    pub fn read_bytes(&self, document: &DocumentRef) -> Option<Vec<u8>> {
        self.lock()
            .nodes
            .get(&document.document_id)
            .map(|n| n.data.clone())
    }

    /// Whether a document still exists.
    pub fn exists(&self, document: &DocumentRef) -> bool {
        self.lock().nodes.contains_key(&document.document_id)
    }

    fn reader_for(&self, state: &mut MemoryState, id: &str, data: Vec<u8>) -> Box<dyn Read + Send> {
        if let Some(fault) = state.read_faults.get_mut(id) {
            if fault.remaining > 0 {
                if fault.remaining != u32::MAX {
                    fault.remaining -= 1;
                }
                return Box::new(FaultyReader {
                    inner: Cursor::new(data),
                    fail_at: fault.after_bytes,
                });
            }
        }
        Box::new(Cursor::new(data))
    }
}

impl DocumentsProvider for MemoryProvider {
    fn authority(&self) -> &str {
        &self.authority
    }

    fn resolve(&self, document_id: &str) -> ProviderResult<DocumentRef> {
        let state = self.lock();
        state.check_available()?;
        self.resolve_locked(&state, document_id)
    }

    fn list_children(&self, parent_id: &str) -> ProviderResult<Listing> {
        let mut state = self.lock();
        state.check_available()?;
        let node = state.node(parent_id)?;
        if !node.flags.is_directory {
            return Err(ProviderError::Unsupported(format!(
                "{} is not a directory",
                parent_id
            )));
        }
        let children = node.children.clone();

        if let Some(duration) = state.loading_duration {
            let started = *state
                .loading_started
                .entry(parent_id.to_string())
                .or_insert_with(Instant::now);
            if started.elapsed() < duration {
                return Ok(Listing::loading(Vec::new()));
            }
        }

        let children = children
            .iter()
            .filter_map(|c| state.nodes.get(c).map(|n| self.to_ref(c, n)))
            .collect();
        Ok(Listing::complete(children))
    }

    fn open_read(&self, document_id: &str) -> ProviderResult<Box<dyn Read + Send>> {
        let mut state = self.lock();
        state.check_available()?;
        let node = state.node(document_id)?;
        if node.flags.is_directory || node.flags.is_virtual {
            return Err(ProviderError::Unsupported(format!(
                "{} has no byte stream",
                document_id
            )));
        }
        let data = node.data.clone();
        Ok(self.reader_for(&mut state, document_id, data))
    }

    fn export_mime_types(&self, document_id: &str) -> ProviderResult<Vec<String>> {
        let state = self.lock();
        state.check_available()?;
        let node = state.node(document_id)?;
        if node.flags.is_virtual {
            Ok(node.export_types.clone())
        } else {
            Ok(vec![node.mime_type.clone()])
        }
    }

    fn open_typed_read(
        &self,
        document_id: &str,
        mime_type: &str,
    ) -> ProviderResult<Box<dyn Read + Send>> {
        let mut state = self.lock();
        state.check_available()?;
        let node = state.node(document_id)?;
        let offered = if node.flags.is_virtual {
            node.export_types.iter().any(|t| t.eq_ignore_ascii_case(mime_type))
        } else {
            node.mime_type.eq_ignore_ascii_case(mime_type)
        };
        if !offered {
            return Err(ProviderError::Unsupported(format!(
                "export of {} as {}",
                document_id, mime_type
            )));
        }
        let data = node.data.clone();
        Ok(self.reader_for(&mut state, document_id, data))
    }

    fn create_document(
        &self,
        parent_id: &str,
        mime_type: &str,
        display_name: &str,
    ) -> ProviderResult<DocumentRef> {
        let mut state = self.lock();
        state.check_available()?;
        state.write_calls += 1;
        let flags = if mime_type == MIME_TYPE_DIR {
            DocumentFlags::directory()
        } else {
            DocumentFlags::file()
        };
        let id = state.insert(parent_id, display_name, mime_type, flags, Vec::new(), Vec::new())?;
        self.resolve_locked(&state, &id)
    }

    fn open_write(&self, document_id: &str) -> ProviderResult<Box<dyn Write + Send>> {
        let mut state = self.lock();
        state.check_available()?;
        state.write_calls += 1;
        let node = state
            .nodes
            .get_mut(document_id)
            .ok_or_else(|| ProviderError::NotFound(document_id.to_string()))?;
        if node.flags.is_directory {
            return Err(ProviderError::Unsupported(format!(
                "{} is a directory",
                document_id
            )));
        }
        node.data.clear();
        Ok(Box::new(MemoryWriter {
            state: Arc::clone(&self.state),
            document_id: document_id.to_string(),
        }))
    }

    fn delete(&self, document_id: &str) -> ProviderResult<()> {
        let mut state = self.lock();
        state.check_available()?;
        state.write_calls += 1;
        if document_id == ROOT_ID {
            return Err(ProviderError::Unsupported("deleting the root".to_string()));
        }
        state.node(document_id)?;
        state.detach(document_id);
        state.remove_tree(document_id);
        state.read_faults.remove(document_id);
        Ok(())
    }

    fn is_descendant(&self, ancestor_id: &str, document_id: &str) -> ProviderResult<bool> {
        let state = self.lock();
        state.check_available()?;
        Ok(state.is_descendant(ancestor_id, document_id))
    }

    fn parent_id(&self, document_id: &str) -> ProviderResult<Option<String>> {
        let state = self.lock();
        state.check_available()?;
        Ok(state.node(document_id)?.parent.clone())
    }

    fn free_bytes(&self, _root_id: &str) -> ProviderResult<Option<u64>> {
        let state = self.lock();
        state.check_available()?;
        Ok(state.free_bytes)
    }

    fn move_document(
        &self,
        document_id: &str,
        target_parent_id: &str,
    ) -> ProviderResult<DocumentRef> {
        let mut state = self.lock();
        state.check_available()?;
        if !state.move_supported {
            return Err(ProviderError::Unsupported(format!("move of {}", document_id)));
        }
        state.write_calls += 1;

        let target = state.node(target_parent_id)?;
        if !target.flags.is_directory {
            return Err(ProviderError::Unsupported(format!(
                "{} is not a directory",
                target_parent_id
            )));
        }
        if document_id == target_parent_id || state.is_descendant(document_id, target_parent_id) {
            return Err(ProviderError::Unsupported(format!(
                "move of {} into itself",
                document_id
            )));
        }
        let name = state.node(document_id)?.name.clone();
        let siblings: Vec<String> = target
            .children
            .iter()
            .filter_map(|c| state.nodes.get(c).map(|n| n.name.clone()))
            .collect();
        let name = unique_display_name(&name, |c| siblings.iter().any(|s| s == c));

        state.detach(document_id);
        if let Some(node) = state.nodes.get_mut(document_id) {
            node.parent = Some(target_parent_id.to_string());
            node.name = name;
        }
        if let Some(target) = state.nodes.get_mut(target_parent_id) {
            target.children.push(document_id.to_string());
        }
        self.resolve_locked(&state, document_id)
    }

    fn set_last_modified(&self, document_id: &str, millis: i64) -> ProviderResult<()> {
        let mut state = self.lock();
        state.check_available()?;
        let node = state
            .nodes
            .get_mut(document_id)
            .ok_or_else(|| ProviderError::NotFound(document_id.to_string()))?;
        node.last_modified = Some(millis);
        Ok(())
    }
}

/// Appends written bytes straight into the document node.
struct MemoryWriter {
    state: Arc<Mutex<MemoryState>>,
    document_id: String,
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.available {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "memory provider is offline",
            ));
        }
        let node = state.nodes.get_mut(&self.document_id).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "document deleted while writing")
        })?;
        node.data.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Serves bytes normally up to `fail_at`, then errors.
struct FaultyReader {
    inner: Cursor<Vec<u8>>,
    fail_at: u64,
}

impl Read for FaultyReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let position = self.inner.position();
        if position >= self.fail_at {
            return Err(io::Error::new(io::ErrorKind::Other, "injected read error"));
        }
        let allowed = ((self.fail_at - position) as usize).min(buf.len());
        self.inner.read(&mut buf[..allowed])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_list() {
        let provider = MemoryProvider::new("mem", "Root");
        let root = provider.root();
        provider.create_file(&root, "a.txt", "text/plain", b"hello").expect("Failed to create a");
        provider.create_dir(&root, "sub").expect("Failed to create sub");

        let listing = provider.list_children(&root.document_id).expect("Failed to list");
        assert!(!listing.loading);
        let names: Vec<_> = listing.children.iter().map(|d| d.display_name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "sub"]);
        assert_eq!(provider.write_calls(), 0);
    }

    #[test]
    fn test_duplicate_names_get_suffix() {
        let provider = MemoryProvider::new("mem", "Root");
        let root = provider.root();
        provider.create_file(&root, "a.txt", "text/plain", b"1").expect("Failed to create");
        let second = provider
            .create_document(&root.document_id, "text/plain", "a.txt")
            .expect("Failed to create duplicate");
        assert_eq!(second.display_name, "a (1).txt");
    }

    #[test]
    fn test_loading_listing_then_results() {
        let provider = MemoryProvider::new("mem", "Root");
        let root = provider.root();
        provider.create_file(&root, "a.txt", "text/plain", b"x").expect("Failed to create");
        provider.set_loading_duration(Duration::from_millis(50));

        let first = provider.list_children(&root.document_id).expect("Failed to list");
        assert!(first.loading);
        assert!(first.children.is_empty());

        std::thread::sleep(Duration::from_millis(80));
        let second = provider.list_children(&root.document_id).expect("Failed to list");
        assert!(!second.loading);
        assert_eq!(second.children.len(), 1);
    }

    #[test]
    fn test_injected_read_error_then_recovery() {
        let provider = MemoryProvider::new("mem", "Root");
        let root = provider.root();
        let file = provider
            .create_file(&root, "a.bin", "application/octet-stream", &[7u8; 100])
            .expect("Failed to create");
        provider.fail_reads(&file, 10, 1);

        let mut first = provider.open_read(&file.document_id).expect("Failed to open");
        let mut buf = Vec::new();
        assert!(first.read_to_end(&mut buf).is_err());
        assert_eq!(buf.len(), 10);

        let mut second = provider.open_read(&file.document_id).expect("Failed to reopen");
        let mut buf = Vec::new();
        second.read_to_end(&mut buf).expect("Second open should succeed");
        assert_eq!(buf.len(), 100);
    }

    #[test]
    fn test_virtual_document_exports() {
        let provider = MemoryProvider::new("mem", "Root");
        let root = provider.root();
        let doc = provider
            .create_virtual_file(&root, "tokyo.sth", "virtual/mime-type", &["application/pdf"], b"%PDF")
            .expect("Failed to create");
        assert_eq!(doc.size, None);
        assert!(provider.open_read(&doc.document_id).is_err());
        assert!(provider.open_typed_read(&doc.document_id, "image/png").is_err());

        let mut reader = provider
            .open_typed_read(&doc.document_id, "application/pdf")
            .expect("Export should be offered");
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).expect("Failed to read export");
        assert_eq!(buf, b"%PDF");
    }

    #[test]
    fn test_descendant_and_move() {
        let provider = MemoryProvider::new("mem", "Root");
        let root = provider.root();
        let a = provider.create_dir(&root, "a").expect("Failed to create a");
        let b = provider.create_dir(&a, "b").expect("Failed to create b");
        let other = provider.create_dir(&root, "other").expect("Failed to create other");

        assert!(provider.is_descendant(&a.document_id, &b.document_id).expect("query"));
        assert!(!provider.is_descendant(&b.document_id, &a.document_id).expect("query"));
        assert!(!provider.is_descendant(&a.document_id, &a.document_id).expect("query"));

        assert!(provider.move_document(&a.document_id, &b.document_id).is_err());
        let moved = provider
            .move_document(&b.document_id, &other.document_id)
            .expect("Failed to move");
        assert_eq!(moved.display_name, "b");
        assert_eq!(provider.children_names(&other), vec!["b"]);
        assert!(provider.children_names(&a).is_empty());
    }

    #[test]
    fn test_unavailable_provider() {
        let provider = MemoryProvider::new("mem", "Root");
        provider.set_available(false);
        let result = provider.resolve(ROOT_ID);
        assert!(matches!(result, Err(ProviderError::Unavailable(_))));
    }
}
