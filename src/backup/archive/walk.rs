use crate::backup::function_path;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;

use dyn_iter::{DynIter, IntoDynIterator};
use function_name::named;
use walkdir::{DirEntry, WalkDir};

use std::fs::Metadata;
use std::path::{Path, PathBuf};

/// One filesystem entry of the source tree, ready to be archived
#[derive(Debug)]
pub struct SourceEntry {
    /// Path on the local filesystem
    pub src: PathBuf,
    /// Path inside the archive, prefixed with the base name of the walked root
    pub name: PathBuf,
    /// Metadata of the entry itself (symlinks are not followed)
    pub metadata: Metadata,
}

/// Name the root directory gets inside the archive
pub fn archive_root_name<P: AsRef<Path>>(root: P) -> PathBuf {
    root.as_ref()
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Lazily walks `root` in pre-order, parents before children and siblings sorted by name.
///
/// Failures for individual entries are yielded as `Err` items so the caller decides
/// whether to keep walking. A missing or non-directory root fails up front.
#[named]
pub fn walk_source_tree<'a>(root: &Path) -> Result<DynIter<'a, Result<SourceEntry>>> {
    let root_metadata = std::fs::metadata(root)
        .map_err(|e| Error::source_read(root, e))
        .with_msg(function_path!())?;
    if !root_metadata.is_dir() {
        tracing::error!("Source is not a directory: {:?}", root);
        return Err(Error::source_read(
            root,
            std::io::Error::other("source is not a directory"),
        ));
    }

    let base_name = archive_root_name(root);
    tracing::debug!("Walking {:?} as {:?}", root, base_name);

    let root = root.to_path_buf();
    let entries = WalkDir::new(&root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .map(move |res| match res {
            Ok(de) => to_source_entry(de, &root, &base_name),
            Err(e) => {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone());
                Err(Error::source_read(path, e))
            }
        });

    Ok(entries.into_dyn_iter())
}

fn to_source_entry(de: DirEntry, root: &Path, base_name: &Path) -> Result<SourceEntry> {
    let metadata = de
        .metadata()
        .map_err(|e| Error::source_read(de.path(), e))?;
    let relative = de
        .path()
        .strip_prefix(root)
        .map_err(|e| Error::source_read(de.path(), e))?;
    let name = if relative.as_os_str().is_empty() {
        base_name.to_path_buf()
    } else {
        base_name.join(relative)
    };
    let entry = SourceEntry {
        src: de.into_path(),
        name,
        metadata,
    };
    tracing::trace!("Found {:?} -> {:?}", entry.src, entry.name);
    Ok(entry)
}
