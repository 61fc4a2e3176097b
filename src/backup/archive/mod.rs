pub mod sqlite;

use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

/// A single file or directory to be written into a backup archive.
///
/// `dst` is the relative name inside the archive. `delete_src` marks
/// temporary sources, such as database snapshots, that are removed once the
/// archive has been written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub src: Arc<Path>,
    pub dst: Arc<Path>,
    pub delete_src: bool,
}

impl ArchiveEntry {
    fn new<A: Into<Arc<Path>>, B: Into<Arc<Path>>>(src: A, dst: B, delete_src: bool) -> Self {
        Self {
            src: src.into(),
            dst: dst.into(),
            delete_src,
        }
    }

    pub fn keep_src<A: Into<Arc<Path>>, B: Into<Arc<Path>>>(src: A, dst: B) -> Self {
        Self::new(src, dst, false)
    }

    pub fn delete_src<A: Into<Arc<Path>>, B: Into<Arc<Path>>>(src: A, dst: B) -> Self {
        Self::new(src, dst, true)
    }
}

/// Expands `path` into archive entries rooted at its base name.
///
/// A file yields one entry named after the file. A directory yields itself
/// and every descendant, keeping the relative layout below the base name.
/// Symlinks are followed.
pub fn path_entries<P: AsRef<Path>>(path: P) -> Result<Vec<ArchiveEntry>> {
    let path = path.as_ref();
    let base = path.file_name().map(PathBuf::from).ok_or_else(|| {
        Error::from(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{path:?} has no base name"),
        ))
    })?;

    let mut entries = Vec::new();
    for dir_entry in WalkDir::new(path).follow_links(true).sort_by_file_name() {
        let dir_entry = dir_entry?;
        let relative = dir_entry.path().strip_prefix(path)?;
        let dst = if relative.as_os_str().is_empty() {
            base.clone()
        } else {
            base.join(relative)
        };
        tracing::trace!("Including {:?} -> {:?}", dir_entry.path(), dst);
        entries.push(ArchiveEntry::keep_src(dir_entry.path(), dst));
    }

    Ok(entries)
}
