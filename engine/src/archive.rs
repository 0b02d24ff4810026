//! Compress and extract.
//!
//! Archives are gzip-compressed tar streams written to and read from provider
//! documents. Compress walks every source in tree order; each file is spooled
//! to a temporary file first because tar needs the entry size before the data.
//! Extract recreates entries under the destination, creating directories on
//! demand.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder, EntryType, Header};
use tracing::{debug, info};

use crate::convert::mime_for_name;
use crate::error::{DocumentError, EngineError, ProviderError};
use crate::job::JobRun;
use crate::model::{DocumentRef, TransferOutcome, MIME_TYPE_DIR};
use crate::provider::DocumentsProvider;
use crate::transfer::{discard_partial, TransferExecutor};
use crate::walker::{TreeWalker, WalkEntry};

pub const ARCHIVE_MIME: &str = "application/gzip";
pub const ARCHIVE_EXTENSION: &str = "tar.gz";

/// Name of the archive created for `sources`.
pub fn archive_name(sources: &[DocumentRef]) -> String {
    match sources {
        [only] => format!("{}.{}", only.display_name, ARCHIVE_EXTENSION),
        _ => format!("archive.{}", ARCHIVE_EXTENSION),
    }
}

/// Split an entry path into the names to create, rejecting anything that
/// would land outside the destination.
pub fn entry_components(path: &Path) -> Result<Vec<String>, DocumentError> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(DocumentError::InvalidEntry(path.display().to_string()));
            }
        }
    }
    if parts.is_empty() {
        return Err(DocumentError::InvalidEntry(path.display().to_string()));
    }
    Ok(parts)
}

/// Writes a `.tar.gz` stream into a provider document.
pub struct ArchiveWriter {
    name: String,
    builder: Builder<GzEncoder<Box<dyn Write + Send>>>,
}

impl ArchiveWriter {
    pub fn new(sink: Box<dyn Write + Send>, name: &str) -> Self {
        ArchiveWriter {
            name: name.to_string(),
            builder: Builder::new(GzEncoder::new(sink, Compression::default())),
        }
    }

    pub fn append_directory(&mut self, path: &str, modified: Option<i64>) -> Result<(), EngineError> {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Directory);
        header.set_mode(0o755);
        header.set_size(0);
        header.set_mtime(mtime_seconds(modified));
        self.builder
            .append_data(&mut header, format!("{}/", path), io::empty())
            .map_err(|source| archive_error(&self.name, source))
    }

    pub fn append_file(
        &mut self,
        path: &str,
        data: &mut File,
        len: u64,
        modified: Option<i64>,
    ) -> Result<(), EngineError> {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_mode(0o644);
        header.set_size(len);
        header.set_mtime(mtime_seconds(modified));
        self.builder
            .append_data(&mut header, path, data)
            .map_err(|source| archive_error(&self.name, source))
    }

    /// Write the tar trailer and the gzip footer.
    pub fn finish(self) -> Result<(), EngineError> {
        let name = self.name;
        let encoder = self
            .builder
            .into_inner()
            .map_err(|source| archive_error(&name, source))?;
        let mut sink = encoder
            .finish()
            .map_err(|source| archive_error(&name, source))?;
        sink.flush().map_err(|source| archive_error(&name, source))
    }
}

fn archive_error(name: &str, source: io::Error) -> EngineError {
    EngineError::ArchiveWrite {
        name: name.to_string(),
        source,
    }
}

fn mtime_seconds(modified: Option<i64>) -> u64 {
    modified.map_or(0, |millis| (millis / 1000).max(0) as u64)
}

/// Copy a source document into an anonymous temporary file.
fn spool(
    executor: &TransferExecutor<'_>,
    provider: &dyn DocumentsProvider,
    document: &DocumentRef,
    on_written: &mut dyn FnMut(u64),
) -> Result<(String, File, u64), DocumentError> {
    let format = executor.source_format(provider, document)?;
    let write_error = |source: io::Error| DocumentError::Write {
        name: document.display_name.clone(),
        source,
    };
    let mut file = tempfile::tempfile().map_err(write_error)?;
    let len = executor.stream(
        &document.display_name,
        || format.open(provider, document),
        &mut file,
        on_written,
    )?;
    file.seek(SeekFrom::Start(0)).map_err(write_error)?;
    Ok((format.display_name, file, len))
}

/// Create (or reuse) the destination directory for `components`.
fn ensure_directory(
    provider: &dyn DocumentsProvider,
    directories: &mut HashMap<Vec<String>, DocumentRef>,
    components: &[String],
) -> Result<DocumentRef, DocumentError> {
    if let Some(existing) = directories.get(components) {
        return Ok(existing.clone());
    }
    let Some((name, parent_path)) = components.split_last() else {
        return Err(DocumentError::InvalidEntry(String::new()));
    };
    let parent = ensure_directory(provider, directories, parent_path)?;
    let created = provider
        .create_document(&parent.document_id, MIME_TYPE_DIR, name)
        .map_err(|e| DocumentError::destination(name, e))?;
    directories.insert(components.to_vec(), created.clone());
    Ok(created)
}

impl<'a> JobRun<'a> {
    pub(crate) fn compress(
        &mut self,
        sources: &[DocumentRef],
        destination: &DocumentRef,
    ) -> Result<(), EngineError> {
        let dest_provider = self.provider(&destination.authority)?;
        let name = archive_name(sources);
        let archive = dest_provider
            .create_document(&destination.document_id, ARCHIVE_MIME, &name)
            .map_err(|e| EngineError::from_provider(&destination.authority, e))?;

        let result = self.write_archive(sources, dest_provider.as_ref(), &archive);
        match result {
            Ok(()) if !self.cancel.is_canceled() => {
                info!("Wrote archive {}", archive.display_name);
                Ok(())
            }
            other => {
                discard_partial(dest_provider.as_ref(), &archive);
                other
            }
        }
    }

    fn write_archive(
        &mut self,
        sources: &[DocumentRef],
        dest_provider: &dyn DocumentsProvider,
        archive: &DocumentRef,
    ) -> Result<(), EngineError> {
        let sink = dest_provider
            .open_write(&archive.document_id)
            .map_err(|e| EngineError::from_provider(&archive.authority, e))?;
        let mut writer = ArchiveWriter::new(sink, &archive.display_name);
        let executor = TransferExecutor::new(self.config, self.cancel);

        for source in sources {
            if self.cancel.is_canceled() {
                return Ok(());
            }
            let provider = self.provider(&source.authority)?;
            let walker = TreeWalker::new(
                provider.clone(),
                source.clone(),
                self.config,
                self.cancel.clone(),
            );
            let mut path: Vec<String> = Vec::new();

            for entry in walker {
                if self.cancel.is_canceled() {
                    return Ok(());
                }
                let WalkEntry { document, depth } = match entry {
                    Ok(entry) => entry,
                    Err(failure) => {
                        self.walk_failed(failure)?;
                        continue;
                    }
                };
                path.truncate(depth);

                let outcome = if document.is_directory() {
                    path.push(document.display_name.clone());
                    writer.append_directory(&path.join("/"), document.last_modified)?;
                    TransferOutcome::Success
                } else {
                    let state = &mut *self.state;
                    match spool(&executor, provider.as_ref(), &document, &mut |bytes| {
                        state.add_bytes(bytes)
                    }) {
                        Ok((name, mut file, len)) => {
                            path.push(name);
                            writer.append_file(&path.join("/"), &mut file, len, document.last_modified)?;
                            debug!("Archived {}", path.join("/"));
                            TransferOutcome::Success
                        }
                        Err(err) => TransferOutcome::Failed(err),
                    }
                };
                self.record(&document.authority, outcome)?;
            }
        }

        if self.cancel.is_canceled() {
            return Ok(());
        }
        writer.finish()
    }

    pub(crate) fn extract(
        &mut self,
        sources: &[DocumentRef],
        destination: &DocumentRef,
    ) -> Result<(), EngineError> {
        let dest_provider = self.provider(&destination.authority)?;
        for archive in sources {
            if self.cancel.is_canceled() {
                return Ok(());
            }
            let provider = self.provider(&archive.authority)?;
            self.extract_archive(provider.as_ref(), archive, dest_provider.as_ref(), destination)?;
        }
        Ok(())
    }

    fn extract_archive(
        &mut self,
        provider: &dyn DocumentsProvider,
        archive: &DocumentRef,
        dest_provider: &dyn DocumentsProvider,
        destination: &DocumentRef,
    ) -> Result<(), EngineError> {
        let read_failure = |source: io::Error| DocumentError::TransferRead {
            name: archive.display_name.clone(),
            attempts: 1,
            source,
        };

        let reader = match provider.open_read(&archive.document_id) {
            Ok(reader) => reader,
            Err(e) => {
                let err = DocumentError::provider(&archive.display_name, e);
                return self.record(&archive.authority, TransferOutcome::Failed(err));
            }
        };
        let mut tar = Archive::new(GzDecoder::new(reader));
        let entries = match tar.entries() {
            Ok(entries) => entries,
            Err(e) => {
                return self.record(&archive.authority, TransferOutcome::Failed(read_failure(e)))
            }
        };

        let executor = TransferExecutor::new(self.config, self.cancel);
        let mut directories: HashMap<Vec<String>, DocumentRef> = HashMap::new();
        directories.insert(Vec::new(), destination.clone());

        for entry in entries {
            if self.cancel.is_canceled() {
                return Ok(());
            }
            // A broken stream leaves nothing readable behind it.
            let mut entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    return self.record(&archive.authority, TransferOutcome::Failed(read_failure(e)))
                }
            };
            let outcome =
                extract_entry(&executor, &mut entry, dest_provider, &mut directories);
            self.record(&destination.authority, outcome)?;
        }
        debug!("Extracted {}", archive.display_name);
        Ok(())
    }
}

fn extract_entry<R: Read>(
    executor: &TransferExecutor<'_>,
    entry: &mut tar::Entry<'_, R>,
    dest_provider: &dyn DocumentsProvider,
    directories: &mut HashMap<Vec<String>, DocumentRef>,
) -> TransferOutcome {
    let path = match entry.path() {
        Ok(path) => path.into_owned(),
        Err(e) => return TransferOutcome::Failed(DocumentError::InvalidEntry(e.to_string())),
    };
    let components = match entry_components(&path) {
        Ok(components) => components,
        Err(err) => return TransferOutcome::Failed(err),
    };

    let entry_type = entry.header().entry_type();
    if entry_type.is_dir() {
        return ensure_directory(dest_provider, directories, &components)
            .map(|_| ())
            .into();
    }
    if !entry_type.is_file() {
        debug!("Skipping {} ({:?})", path.display(), entry_type);
        return TransferOutcome::Skipped;
    }

    let Some((name, parent_path)) = components.split_last() else {
        return TransferOutcome::Failed(DocumentError::InvalidEntry(path.display().to_string()));
    };
    let parent = match ensure_directory(dest_provider, directories, parent_path) {
        Ok(parent) => parent,
        Err(err) => return TransferOutcome::Failed(err),
    };
    let modified = entry.header().mtime().ok();

    let target = match dest_provider.create_document(&parent.document_id, mime_for_name(name), name) {
        Ok(target) => target,
        Err(e) => return TransferOutcome::Failed(DocumentError::destination(name, e)),
    };
    let mut once = Some(entry);
    let result = dest_provider
        .open_write(&target.document_id)
        .map_err(|e| DocumentError::destination(name, e))
        .and_then(|mut sink| {
            executor.stream(
                name,
                || {
                    once.take().ok_or_else(|| {
                        ProviderError::Io(io::Error::new(
                            io::ErrorKind::Other,
                            "archive entries cannot be reopened",
                        ))
                    })
                },
                &mut sink,
                &mut |_| {},
            )
        });

    match result {
        Ok(_) => {
            if let Some(seconds) = modified {
                let millis = i64::try_from(seconds).unwrap_or(i64::MAX).saturating_mul(1000);
                if let Err(e) = dest_provider.set_last_modified(&target.document_id, millis) {
                    debug!("Could not set modification time on {}: {}", target.display_name, e);
                }
            }
            TransferOutcome::Success
        }
        Err(err) => {
            discard_partial(dest_provider, &target);
            TransferOutcome::Failed(err)
        }
    }
}
