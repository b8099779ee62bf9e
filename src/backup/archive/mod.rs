pub mod walk;

use crate::backup::archive::walk::{walk_source_tree, SourceEntry};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::{convert_error_vec, Result};
use bon::Builder;
use getset::CopyGetters;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

/// What the archiver does when a source entry cannot be read
#[derive(Clone, Copy, Default, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceErrorPolicy {
    /// Stop at the first unreadable entry
    #[default]
    Abort,
    /// Skip unreadable entries, archive the rest, then fail with every collected error
    Continue,
}

/// Configuration of the tar archiving stage
#[derive(Clone, Copy, Default, Debug, Serialize, Deserialize, Builder, CopyGetters, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
#[getset(get_copy = "pub")]
pub struct ArchiveConfig {
    #[serde(default)]
    #[builder(default)]
    on_source_error: SourceErrorPolicy,
}

impl ArchiveConfig {
    /// Writes a tar stream of the whole tree under `source` into `sink`.
    ///
    /// Every entry name starts with the base name of `source`. Returns the sink once
    /// the end-of-archive marker has been written.
    pub fn write_archive<W: Write>(&self, source: &Path, sink: W) -> Result<W> {
        // Walk first: a bad root must fail before a single byte reaches the sink
        let entries = walk_source_tree(source)?;
        let mut builder = tar::Builder::new(sink);
        builder.follow_symlinks(false);

        let mut errors = vec![];
        let mut entry_count = 0;
        for entry in entries {
            let res = entry.and_then(|entry| append_entry(&mut builder, entry));
            match res {
                Ok(()) => entry_count += 1,
                Err(e @ Error::SourceRead { .. })
                    if self.on_source_error == SourceErrorPolicy::Continue =>
                {
                    tracing::warn!("Skipping unreadable entry: {e}");
                    errors.push(e);
                }
                Err(e) => return Err(e),
            }
        }
        tracing::info!("Archived {} entries from {:?}", entry_count, source);
        convert_error_vec(errors)?;

        Ok(builder.into_inner()?)
    }
}

fn append_entry<W: Write>(builder: &mut tar::Builder<W>, entry: SourceEntry) -> Result<()> {
    let SourceEntry {
        src,
        name,
        metadata,
    } = entry;
    let file_type = metadata.file_type();

    let mut header = tar::Header::new_gnu();
    header.set_metadata(&metadata);

    if file_type.is_file() {
        let file = File::open(&src).map_err(|e| Error::source_read(&src, e))?;
        let mut content = ExactLenReader::new(file, metadata.len());
        builder
            .append_data(&mut header, &name, &mut content)
            .map_err(|e| {
                if content.failed {
                    Error::source_read(&src, e)
                } else {
                    Error::from(e)
                }
            })?;
    } else if file_type.is_dir() {
        header.set_size(0);
        builder.append_data(&mut header, &name, std::io::empty())?;
    } else if file_type.is_symlink() {
        let target = std::fs::read_link(&src).map_err(|e| Error::source_read(&src, e))?;
        header.set_size(0);
        builder.append_link(&mut header, &name, target)?;
    } else {
        tracing::warn!("Skipping special file {:?}", src);
        return Ok(());
    }

    tracing::trace!("Appended {:?} as {:?}", src, name);
    Ok(())
}

/// Yields exactly `len` bytes of `inner`, the size already written into the tar header.
///
/// Growth after the stat is cut off. Shrinkage fails the read, since a short entry
/// would misalign every entry after it.
struct ExactLenReader<R> {
    inner: io::Take<R>,
    remaining: u64,
    failed: bool,
}

impl<R: Read> ExactLenReader<R> {
    fn new(inner: R, len: u64) -> Self {
        Self {
            inner: inner.take(len),
            remaining: len,
            failed: false,
        }
    }
}

impl<R: Read> Read for ExactLenReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.inner.read(buf) {
            Ok(0) if self.remaining > 0 => {
                self.failed = true;
                Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("file shrank while archived, {} bytes missing", self.remaining),
                ))
            }
            Ok(n) => {
                self.remaining -= n as u64;
                Ok(n)
            }
            Err(e) => {
                if e.kind() != io::ErrorKind::Interrupted {
                    self.failed = true;
                }
                Err(e)
            }
        }
    }
}
