//! Local filesystem provider.
//!
//! Exposes one directory tree. Document ids are `/`-separated paths relative
//! to the root; the root itself is the empty id.

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sysinfo::Disks;

use super::{unique_display_name, DocumentsProvider, Listing};
use crate::convert::mime_for_name;
use crate::error::{ProviderError, ProviderResult};
use crate::model::{DocumentFlags, DocumentRef, MIME_TYPE_DIR};

/// A provider rooted at a local directory.
#[derive(Debug, Clone)]
pub struct LocalProvider {
    authority: String,
    root: PathBuf,
    root_title: String,
}

impl LocalProvider {
    pub fn new<P: AsRef<Path>>(authority: &str, root: P) -> Self {
        let root = root.as_ref().to_path_buf();
        let root_title = root
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("/")
            .to_string();
        LocalProvider {
            authority: authority.to_string(),
            root,
            root_title,
        }
    }

    /// Document id for a path below the root.
    pub fn document_id_for<P: AsRef<Path>>(&self, path: P) -> ProviderResult<String> {
        let path = path.as_ref();
        let relative = if path.is_absolute() {
            path.strip_prefix(&self.root)
                .map_err(|_| ProviderError::NotFound(path.display().to_string()))?
        } else {
            path
        };
        let mut parts = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
                Component::CurDir => {}
                _ => return Err(ProviderError::NotFound(path.display().to_string())),
            }
        }
        Ok(parts.join("/"))
    }

    /// Resolve a path below the root.
    pub fn resolve_path<P: AsRef<Path>>(&self, path: P) -> ProviderResult<DocumentRef> {
        let id = self.document_id_for(path)?;
        self.resolve(&id)
    }

    fn path_for(&self, document_id: &str) -> ProviderResult<PathBuf> {
        let mut path = self.root.clone();
        for part in document_id.split('/').filter(|p| !p.is_empty()) {
            if part == ".." || part == "." {
                return Err(ProviderError::NotFound(document_id.to_string()));
            }
            path.push(part);
        }
        Ok(path)
    }

    fn child_id(parent_id: &str, name: &str) -> String {
        if parent_id.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", parent_id, name)
        }
    }

    fn to_ref(&self, document_id: &str, metadata: &fs::Metadata) -> DocumentRef {
        let display_name = if document_id.is_empty() {
            self.root_title.clone()
        } else {
            document_id
                .rsplit('/')
                .next()
                .unwrap_or(document_id)
                .to_string()
        };
        let is_directory = metadata.is_dir();
        let last_modified = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64);
        DocumentRef {
            authority: self.authority.clone(),
            document_id: document_id.to_string(),
            mime_type: if is_directory {
                MIME_TYPE_DIR.to_string()
            } else {
                mime_for_name(&display_name).to_string()
            },
            display_name,
            size: (!is_directory).then(|| metadata.len()),
            last_modified,
            flags: if is_directory {
                DocumentFlags::directory()
            } else {
                DocumentFlags::file()
            },
        }
    }
}

fn not_found_or_io(id: &str, err: io::Error) -> ProviderError {
    if err.kind() == io::ErrorKind::NotFound {
        ProviderError::NotFound(id.to_string())
    } else {
        ProviderError::Io(err)
    }
}

impl DocumentsProvider for LocalProvider {
    fn authority(&self) -> &str {
        &self.authority
    }

    fn resolve(&self, document_id: &str) -> ProviderResult<DocumentRef> {
        let path = self.path_for(document_id)?;
        let metadata = fs::metadata(&path).map_err(|e| not_found_or_io(document_id, e))?;
        Ok(self.to_ref(document_id, &metadata))
    }

    fn list_children(&self, parent_id: &str) -> ProviderResult<Listing> {
        let path = self.path_for(parent_id)?;
        let entries = fs::read_dir(&path).map_err(|e| not_found_or_io(parent_id, e))?;

        let mut children = Vec::new();
        for entry in entries {
            let entry = entry?;
            let metadata = entry.metadata()?;
            let name = entry.file_name().to_string_lossy().into_owned();
            children.push(self.to_ref(&Self::child_id(parent_id, &name), &metadata));
        }
        children.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        Ok(Listing::complete(children))
    }

    fn open_read(&self, document_id: &str) -> ProviderResult<Box<dyn Read + Send>> {
        let path = self.path_for(document_id)?;
        let file = fs::File::open(&path).map_err(|e| not_found_or_io(document_id, e))?;
        Ok(Box::new(file))
    }

    fn export_mime_types(&self, document_id: &str) -> ProviderResult<Vec<String>> {
        let document = self.resolve(document_id)?;
        Ok(vec![document.mime_type])
    }

    fn open_typed_read(
        &self,
        document_id: &str,
        mime_type: &str,
    ) -> ProviderResult<Box<dyn Read + Send>> {
        let document = self.resolve(document_id)?;
        if document.mime_type.eq_ignore_ascii_case(mime_type) {
            self.open_read(document_id)
        } else {
            Err(ProviderError::Unsupported(format!(
                "export of {} as {}",
                document_id, mime_type
            )))
        }
    }

    fn create_document(
        &self,
        parent_id: &str,
        mime_type: &str,
        display_name: &str,
    ) -> ProviderResult<DocumentRef> {
        if display_name.is_empty() || display_name.contains('/') || display_name == ".." {
            return Err(ProviderError::Unsupported(format!(
                "invalid display name '{}'",
                display_name
            )));
        }
        let parent = self.path_for(parent_id)?;
        if !parent.is_dir() {
            return Err(ProviderError::NotFound(parent_id.to_string()));
        }
        let name = unique_display_name(display_name, |candidate| parent.join(candidate).exists());
        let path = parent.join(&name);

        if mime_type == MIME_TYPE_DIR {
            fs::create_dir(&path)?;
        } else {
            fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .map_err(|e| {
                    if e.kind() == io::ErrorKind::AlreadyExists {
                        ProviderError::AlreadyExists(name.clone())
                    } else {
                        ProviderError::Io(e)
                    }
                })?;
        }
        self.resolve(&Self::child_id(parent_id, &name))
    }

    fn open_write(&self, document_id: &str) -> ProviderResult<Box<dyn Write + Send>> {
        let path = self.path_for(document_id)?;
        let file = fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| not_found_or_io(document_id, e))?;
        Ok(Box::new(io::BufWriter::new(file)))
    }

    fn delete(&self, document_id: &str) -> ProviderResult<()> {
        if document_id.is_empty() {
            return Err(ProviderError::Unsupported("deleting the root".to_string()));
        }
        let path = self.path_for(document_id)?;
        let metadata = fs::symlink_metadata(&path).map_err(|e| not_found_or_io(document_id, e))?;
        if metadata.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
        Ok(())
    }

    fn is_descendant(&self, ancestor_id: &str, document_id: &str) -> ProviderResult<bool> {
        let ancestor = self.path_for(ancestor_id)?;
        let document = self.path_for(document_id)?;
        Ok(document != ancestor && document.starts_with(&ancestor))
    }

    fn parent_id(&self, document_id: &str) -> ProviderResult<Option<String>> {
        if document_id.is_empty() {
            return Ok(None);
        }
        let parent = document_id
            .rsplit_once('/')
            .map_or("", |(parent, _)| parent);
        Ok(Some(parent.to_string()))
    }

    /// Free space of the disk whose mount point holds the directory.
    fn free_bytes(&self, root_id: &str) -> ProviderResult<Option<u64>> {
        let path = self.path_for(root_id)?;
        let path = fs::canonicalize(&path).map_err(|e| not_found_or_io(root_id, e))?;
        let disks = Disks::new_with_refreshed_list();
        let available = disks
            .list()
            .iter()
            .filter(|disk| path.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space());
        Ok(available)
    }

    fn move_document(
        &self,
        document_id: &str,
        target_parent_id: &str,
    ) -> ProviderResult<DocumentRef> {
        let source = self.path_for(document_id)?;
        let target_parent = self.path_for(target_parent_id)?;
        if target_parent.starts_with(&source) {
            return Err(ProviderError::Unsupported(format!(
                "move of {} into itself",
                document_id
            )));
        }
        let name = source
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ProviderError::NotFound(document_id.to_string()))?;
        let name = unique_display_name(name, |candidate| target_parent.join(candidate).exists());

        // rename fails across filesystems; the engine then copies and deletes
        fs::rename(&source, target_parent.join(&name)).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                ProviderError::NotFound(document_id.to_string())
            } else {
                ProviderError::Unsupported(format!("move of {}: {}", document_id, e))
            }
        })?;
        self.resolve(&Self::child_id(target_parent_id, &name))
    }

    fn set_last_modified(&self, document_id: &str, millis: i64) -> ProviderResult<()> {
        let path = self.path_for(document_id)?;
        let Ok(millis) = u64::try_from(millis) else {
            return Ok(());
        };
        let mtime = SystemTime::UNIX_EPOCH + Duration::from_millis(millis);
        filetime::set_file_mtime(&path, filetime::FileTime::from_system_time(mtime))?;
        Ok(())
    }
}
