//! Per-document byte transfer.
//!
//! Streams a source document into a newly created destination document in
//! chunks of `EngineConfig::chunk_size`. A read error reopens the source,
//! skips what was already written and carries on, up to
//! `EngineConfig::max_read_retries` times. Cancellation is checked at every
//! chunk boundary, so a chunk is always either fully written or not at all.

use std::io::{self, Read, Write};

use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::convert::{converted_display_name, select_export_type};
use crate::error::{DocumentError, ProviderResult};
use crate::model::{DocumentRef, MIME_TYPE_DIR};
use crate::provider::DocumentsProvider;
use crate::state::CancellationToken;

pub struct TransferExecutor<'a> {
    config: &'a EngineConfig,
    cancel: &'a CancellationToken,
}

impl<'a> TransferExecutor<'a> {
    pub fn new(config: &'a EngineConfig, cancel: &'a CancellationToken) -> Self {
        TransferExecutor { config, cancel }
    }

    /// Copy `open`'s stream into `sink`.
    ///
    /// `on_written` is told about every chunk once it has been written. Returns
    /// the total number of bytes written.
    pub fn stream<R, F>(
        &self,
        name: &str,
        mut open: F,
        sink: &mut dyn Write,
        on_written: &mut dyn FnMut(u64),
    ) -> Result<u64, DocumentError>
    where
        R: Read,
        F: FnMut() -> ProviderResult<R>,
    {
        let mut buffer = vec![0u8; self.config.chunk_size.max(1)];
        let mut written = 0u64;
        let mut failed_reads = 0u32;
        let mut reader = open().map_err(|e| DocumentError::provider(name, e))?;

        loop {
            if self.cancel.is_canceled() {
                return Err(DocumentError::Canceled);
            }
            let read = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(read) => read,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(mut error) => loop {
                    failed_reads += 1;
                    if failed_reads > self.config.max_read_retries {
                        return Err(DocumentError::TransferRead {
                            name: name.to_string(),
                            attempts: failed_reads,
                            source: error,
                        });
                    }
                    warn!("Read error on {} at byte {}, reopening: {}", name, written, error);
                    let mut fresh = open().map_err(|e| DocumentError::provider(name, e))?;
                    match skip_exact(&mut fresh, written) {
                        Ok(()) => {
                            reader = fresh;
                            break 0;
                        }
                        Err(e) => error = e,
                    }
                },
            };
            if read == 0 {
                continue;
            }
            sink.write_all(&buffer[..read])
                .map_err(|source| DocumentError::Write {
                    name: name.to_string(),
                    source,
                })?;
            written += read as u64;
            on_written(read as u64);
        }

        sink.flush().map_err(|source| DocumentError::Write {
            name: name.to_string(),
            source,
        })?;
        Ok(written)
    }

    /// Decide how `source` is read and what the copy is called.
    ///
    /// Documents that do not support copying are rejected.
    /// Virtual documents are exported to the configured type and named with
    /// its extension; everything else keeps its name and mime type.
    pub fn source_format(
        &self,
        provider: &dyn DocumentsProvider,
        source: &DocumentRef,
    ) -> Result<SourceFormat, DocumentError> {
        if !source.flags.supports_copy {
            return Err(DocumentError::Unsupported {
                name: source.display_name.clone(),
                operation: "copy",
            });
        }
        if !source.is_virtual() {
            return Ok(SourceFormat {
                display_name: source.display_name.clone(),
                mime_type: source.mime_type.clone(),
                export: None,
            });
        }
        let offered = provider
            .export_mime_types(&source.document_id)
            .map_err(|e| DocumentError::provider(&source.display_name, e))?;
        let Some(export) = select_export_type(&self.config.export_mime_type, &offered) else {
            return Err(DocumentError::ConversionUnsupported {
                name: source.display_name.clone(),
                required: self.config.export_mime_type.clone(),
            });
        };
        debug!("Converting {} to {}", source.display_name, export);
        Ok(SourceFormat {
            display_name: converted_display_name(&source.display_name, export),
            mime_type: export.to_string(),
            export: Some(export.to_string()),
        })
    }

    /// Copy one non-directory document into `dest_parent`.
    ///
    /// The destination document is removed again if anything fails after it
    /// was created.
    pub fn copy_document(
        &self,
        source_provider: &dyn DocumentsProvider,
        source: &DocumentRef,
        dest_provider: &dyn DocumentsProvider,
        dest_parent: &DocumentRef,
        on_written: &mut dyn FnMut(u64),
    ) -> Result<DocumentRef, DocumentError> {
        let format = self.source_format(source_provider, source)?;
        let target = dest_provider
            .create_document(&dest_parent.document_id, &format.mime_type, &format.display_name)
            .map_err(|e| DocumentError::destination(&format.display_name, e))?;

        let result = dest_provider
            .open_write(&target.document_id)
            .map_err(|e| DocumentError::destination(&target.display_name, e))
            .and_then(|mut sink| {
                self.stream(
                    &source.display_name,
                    || format.open(source_provider, source),
                    &mut sink,
                    on_written,
                )
            });

        match result {
            Ok(bytes) => {
                debug!("Copied {} ({} bytes)", target.display_name, bytes);
                if let Some(millis) = source.last_modified {
                    if let Err(e) = dest_provider.set_last_modified(&target.document_id, millis) {
                        debug!("Could not set modification time on {}: {}", target.display_name, e);
                    }
                }
                Ok(target)
            }
            Err(err) => {
                discard_partial(dest_provider, &target);
                Err(err)
            }
        }
    }

    /// Create a directory called `name` under `dest_parent`.
    pub fn create_directory(
        &self,
        dest_provider: &dyn DocumentsProvider,
        dest_parent: &DocumentRef,
        name: &str,
    ) -> Result<DocumentRef, DocumentError> {
        dest_provider
            .create_document(&dest_parent.document_id, MIME_TYPE_DIR, name)
            .map_err(|e| DocumentError::destination(name, e))
    }
}

/// How a source document is read and named at the destination.
#[derive(Debug, Clone)]
pub struct SourceFormat {
    pub display_name: String,
    pub mime_type: String,
    /// Export type for a virtual document
    pub export: Option<String>,
}

impl SourceFormat {
    /// Open the source stream in this format.
    pub fn open(
        &self,
        provider: &dyn DocumentsProvider,
        source: &DocumentRef,
    ) -> ProviderResult<Box<dyn Read + Send>> {
        match &self.export {
            Some(mime_type) => provider.open_typed_read(&source.document_id, mime_type),
            None => provider.open_read(&source.document_id),
        }
    }
}

/// Delete a destination document left incomplete. Best effort.
pub(crate) fn discard_partial(provider: &dyn DocumentsProvider, document: &DocumentRef) {
    if let Err(e) = provider.delete(&document.document_id) {
        warn!("Failed to remove partial {}: {}", document.display_name, e);
    }
}

fn skip_exact<R: Read>(reader: &mut R, bytes: u64) -> io::Result<()> {
    let skipped = io::copy(&mut reader.by_ref().take(bytes), &mut io::sink())?;
    if skipped < bytes {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "source shrank while reopening",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DocumentFlags;
    use crate::provider::MemoryProvider;
    use std::io::Cursor;

    fn config(chunk_size: usize) -> EngineConfig {
        EngineConfig {
            chunk_size,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn test_stream_counts_written_chunks() {
        let config = config(4);
        let cancel = CancellationToken::new();
        let executor = TransferExecutor::new(&config, &cancel);
        let mut sink = Vec::new();
        let mut chunks = Vec::new();

        let written = executor
            .stream(
                "data",
                || Ok(Cursor::new(b"0123456789".to_vec())),
                &mut sink,
                &mut |n| chunks.push(n),
            )
            .expect("Stream failed");

        assert_eq!(written, 10);
        assert_eq!(sink, b"0123456789");
        assert_eq!(chunks, vec![4, 4, 2]);
    }

    #[test]
    fn test_stream_recovers_from_read_error() {
        let provider = MemoryProvider::new("mem", "Root");
        let file = provider
            .create_file(&provider.root(), "a.bin", "application/octet-stream", b"abcdefgh")
            .expect("Failed to create file");
        provider.fail_reads(&file, 3, 2);

        let config = config(2);
        let cancel = CancellationToken::new();
        let executor = TransferExecutor::new(&config, &cancel);
        let mut sink = Vec::new();
        let written = executor
            .stream(
                "a.bin",
                || provider.open_read(&file.document_id),
                &mut sink,
                &mut |_| {},
            )
            .expect("Stream should recover");

        assert_eq!(written, 8);
        assert_eq!(sink, b"abcdefgh");
    }

    #[test]
    fn test_stream_gives_up_after_retries() {
        let provider = MemoryProvider::new("mem", "Root");
        let file = provider
            .create_file(&provider.root(), "a.bin", "application/octet-stream", b"abcdefgh")
            .expect("Failed to create file");
        provider.fail_reads(&file, 0, u32::MAX);

        let config = config(2);
        let cancel = CancellationToken::new();
        let executor = TransferExecutor::new(&config, &cancel);
        let err = executor
            .stream(
                "a.bin",
                || provider.open_read(&file.document_id),
                &mut Vec::new(),
                &mut |_| {},
            )
            .expect_err("Stream should fail");

        match err {
            DocumentError::TransferRead { attempts, .. } => {
                assert_eq!(attempts, config.max_read_retries + 1)
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_stream_stops_when_canceled() {
        let config = config(2);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let executor = TransferExecutor::new(&config, &cancel);
        let mut sink = Vec::new();
        let err = executor
            .stream("x", || Ok(Cursor::new(vec![1u8; 8])), &mut sink, &mut |_| {})
            .expect_err("Stream should be canceled");
        assert!(matches!(err, DocumentError::Canceled));
        assert!(sink.is_empty());
    }

    #[test]
    fn test_copy_virtual_document_converts_to_pdf() {
        let source = MemoryProvider::new("src", "Source");
        let dest = MemoryProvider::new("dst", "Dest");
        let doc = source
            .create_virtual_file(
                &source.root(),
                "tokyo.sth",
                "application/sth",
                &["application/pdf"],
                b"%PDF-1.4",
            )
            .expect("Failed to create virtual file");

        let config = EngineConfig::default();
        let cancel = CancellationToken::new();
        let executor = TransferExecutor::new(&config, &cancel);
        let copied = executor
            .copy_document(&source, &doc, &dest, &dest.root(), &mut |_| {})
            .expect("Copy failed");

        assert_eq!(copied.display_name, "tokyo.sth.pdf");
        assert_eq!(copied.mime_type, "application/pdf");
        assert_eq!(dest.children_names(&dest.root()), vec!["tokyo.sth.pdf"]);
        assert_eq!(dest.read_bytes(&copied).as_deref(), Some(&b"%PDF-1.4"[..]));
    }

    #[test]
    fn test_copy_virtual_document_without_matching_export() {
        let source = MemoryProvider::new("src", "Source");
        let dest = MemoryProvider::new("dst", "Dest");
        let doc = source
            .create_virtual_file(&source.root(), "sheet", "application/sth", &["image/png"], b"png")
            .expect("Failed to create virtual file");

        let config = EngineConfig {
            export_mime_type: "application/pdf".to_string(),
            ..EngineConfig::default()
        };
        let cancel = CancellationToken::new();
        let executor = TransferExecutor::new(&config, &cancel);
        let err = executor
            .copy_document(&source, &doc, &dest, &dest.root(), &mut |_| {})
            .expect_err("Conversion should fail");

        assert!(matches!(err, DocumentError::ConversionUnsupported { .. }));
        assert!(dest.children_names(&dest.root()).is_empty());
        assert_eq!(dest.write_calls(), 0);
    }

    #[test]
    fn test_failed_copy_removes_partial_destination() {
        let source = MemoryProvider::new("src", "Source");
        let dest = MemoryProvider::new("dst", "Dest");
        let file = source
            .create_file(&source.root(), "big.bin", "application/octet-stream", &[7u8; 64])
            .expect("Failed to create file");
        source.fail_reads(&file, 16, u32::MAX);

        let config = config(8);
        let cancel = CancellationToken::new();
        let executor = TransferExecutor::new(&config, &cancel);
        let mut counted = 0u64;
        let result =
            executor.copy_document(&source, &file, &dest, &dest.root(), &mut |n| counted += n);

        assert!(result.is_err());
        assert_eq!(counted, 16);
        assert!(dest.children_names(&dest.root()).is_empty());
    }

    #[test]
    fn test_copy_refused_without_copy_support() {
        let source = MemoryProvider::new("src", "Source");
        let dest = MemoryProvider::new("dst", "Dest");
        let flags = DocumentFlags {
            supports_copy: false,
            ..DocumentFlags::file()
        };
        let file = source
            .create_with_flags(&source.root(), "locked.txt", "text/plain", flags, &[], b"secret")
            .expect("Failed to create file");

        let config = EngineConfig::default();
        let cancel = CancellationToken::new();
        let executor = TransferExecutor::new(&config, &cancel);
        let err = executor
            .copy_document(&source, &file, &dest, &dest.root(), &mut |_| {})
            .expect_err("Copy should be refused");

        assert!(matches!(err, DocumentError::Unsupported { operation: "copy", .. }));
        assert_eq!(dest.write_calls(), 0);
    }

    #[test]
    fn test_unavailable_destination_is_a_destination_error() {
        let source = MemoryProvider::new("src", "Source");
        let dest = MemoryProvider::new("dst", "Dest");
        let file = source
            .create_file(&source.root(), "a.txt", "text/plain", b"alpha")
            .expect("Failed to create file");
        dest.set_available(false);

        let config = EngineConfig::default();
        let cancel = CancellationToken::new();
        let executor = TransferExecutor::new(&config, &cancel);
        let err = executor
            .copy_document(&source, &file, &dest, &dest.root(), &mut |_| {})
            .expect_err("Copy should fail");

        assert!(matches!(err, DocumentError::Destination { .. }));
        assert!(err.is_provider_unavailable());
    }
}
