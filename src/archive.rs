//! ZIP packaging of batch outputs.

use std::collections::HashSet;
use std::io::{Cursor, Write};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::ArchiveError;

/// Streams `(filename, bytes)` pairs into a single ZIP archive.
///
/// Entries are written as they arrive; an existing entry is never
/// overwritten, a second entry with the same name is rejected with
/// [`ArchiveError::Duplicate`].
pub struct ArchiveBuilder {
    writer: Option<ZipWriter<Cursor<Vec<u8>>>>,
    names: HashSet<String>,
    method: CompressionMethod,
}

impl ArchiveBuilder {
    /// Deflate-compressed entries.
    pub fn new() -> Self {
        Self::with_method(CompressionMethod::Deflated)
    }

    /// Uncompressed entries, for payloads that are already compressed
    /// (PDF streams, PNG).
    pub fn stored() -> Self {
        Self::with_method(CompressionMethod::Stored)
    }

    fn with_method(method: CompressionMethod) -> Self {
        Self {
            writer: Some(ZipWriter::new(Cursor::new(Vec::new()))),
            names: HashSet::new(),
            method,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn add(&mut self, name: &str, bytes: &[u8]) -> Result<(), ArchiveError> {
        if self.names.contains(name) {
            return Err(ArchiveError::Duplicate(name.to_string()));
        }
        let writer = self.writer.as_mut().ok_or(ArchiveError::Finished)?;

        let options = SimpleFileOptions::default().compression_method(self.method);
        writer.start_file(name, options)?;
        writer.write_all(bytes)?;

        self.names.insert(name.to_string());
        Ok(())
    }

    /// Adds an entry, renaming it on collision.
    ///
    /// A duplicate `name` is retried as `stem-{suffix}.ext`, then with a
    /// counter appended until a free name is found. Returns the stored name.
    pub fn add_unique(
        &mut self,
        name: &str,
        suffix: &str,
        bytes: &[u8],
    ) -> Result<String, ArchiveError> {
        let mut candidate = name.to_string();
        let mut attempt = 0usize;
        loop {
            match self.add(&candidate, bytes) {
                Ok(()) => return Ok(candidate),
                Err(ArchiveError::Duplicate(_)) => {
                    attempt += 1;
                    let tag = if attempt == 1 {
                        suffix.to_string()
                    } else {
                        format!("{}-{}", suffix, attempt)
                    };
                    candidate = with_suffix(name, &tag);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Finalizes the archive and returns its bytes.
    pub fn finish(&mut self) -> Result<Vec<u8>, ArchiveError> {
        let writer = self.writer.take().ok_or(ArchiveError::Finished)?;
        Ok(writer.finish()?.into_inner())
    }
}

impl Default for ArchiveBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn with_suffix(name: &str, suffix: &str) -> String {
    match name.rfind('.') {
        Some(dot) if dot > 0 => format!("{}-{}{}", &name[..dot], suffix, &name[dot..]),
        _ => format!("{}-{}", name, suffix),
    }
}
