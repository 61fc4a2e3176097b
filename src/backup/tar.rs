//! Archive codec: packs files and directory trees into a (compressed) tar
//! archive and extracts such archives back into a directory.

use crate::backup::archive::{path_entries, ArchiveEntry};
use crate::backup::compress::{CompressorBuilder, CompressorConfig, Decompressor};
use crate::backup::file_ext::FileExtProvider;
use crate::backup::finish::Finish;
use crate::backup::function_path;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddFunctionName;
use function_name::named;
use itertools::Itertools;
use std::ffi::OsString;
use std::fs::File;
use std::io::{BufReader, BufWriter, IntoInnerError};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tar::EntryType;

static TAR_FILE_EXT: OnceLock<Arc<str>> = OnceLock::new();

#[derive(Clone, Debug, Default)]
pub struct ArchiveCodec {
    compressor: CompressorConfig,
}

impl FileExtProvider for ArchiveCodec {
    fn file_ext(&self) -> Option<Arc<str>> {
        Some(
            std::iter::once(TAR_FILE_EXT.get_or_init(|| "tar".into()).clone())
                .chain(self.compressor.file_ext())
                .join(".")
                .into(),
        )
    }
}

impl ArchiveCodec {
    pub fn new(compressor: CompressorConfig) -> Self {
        Self { compressor }
    }

    /// Packs each path, rooted at its base name, into one archive at `destination`.
    #[named]
    pub fn pack<P: AsRef<Path>, D: AsRef<Path>>(&self, paths: &[P], destination: D) -> Result<()> {
        let destination = destination.as_ref();
        let entries = paths
            .iter()
            .map(|p| path_entries(p))
            .flatten_ok()
            .collect::<Result<Vec<_>>>()
            .map_err(|e| Error::archive_write(destination, e.add_fn_name(function_path!())))?;

        self.pack_entries(entries, destination)
    }

    /// Writes `entries` into an archive at `destination`.
    ///
    /// The archive is written to a `.tmp` sibling first and renamed into place
    /// once complete, the temp file is removed on any later failure. An
    /// existing `destination` is never replaced. Sources marked `delete_src`
    /// are removed either way.
    #[named]
    pub fn pack_entries<D: AsRef<Path>>(&self, entries: Vec<ArchiveEntry>, destination: D) -> Result<()> {
        let destination = destination.as_ref();
        let tmp_path = tmp_path(destination);

        let res = match File::create_new(&tmp_path) {
            Ok(file) => self
                .write_archive(&entries, file)
                .and_then(|_| {
                    if destination.exists() {
                        return Err(Error::from(std::io::Error::new(
                            std::io::ErrorKind::AlreadyExists,
                            format!("{destination:?} already exists"),
                        )));
                    }
                    std::fs::rename(&tmp_path, destination).map_err(Error::from)
                })
                .map_err(|e| match remove_file_if_exists(&tmp_path) {
                    Ok(()) => e,
                    Err(e2) => e.chain(e2.into()),
                }),
            // Not ours to remove.
            Err(e) => Err(e.into()),
        };

        for entry in entries.iter().filter(|e| e.delete_src) {
            if let Err(e) = remove_file_if_exists(&entry.src) {
                tracing::warn!("Removing temporary source {:?} failed: {e}", entry.src);
            }
        }

        match res {
            Ok(()) => {
                tracing::info!("Wrote archive {:?} with {} entries", destination, entries.len());
                Ok(())
            }
            Err(e) => Err(Error::archive_write(destination, e.add_fn_name(function_path!()))),
        }
    }

    fn write_archive(&self, entries: &[ArchiveEntry], file: File) -> Result<()> {
        let compressor = self.compressor.build_compressor(BufWriter::new(file))?;
        let mut writer = tar::Builder::new(BufWriter::new(compressor));
        writer.follow_symlinks(true);

        for entry in entries {
            writer.append_path_with_name(&entry.src, &entry.dst)?;
        }

        writer
            .into_inner()?
            .into_inner()
            .map_err(IntoInnerError::into_error)?
            .finish()?
            .into_inner()
            .map_err(IntoInnerError::into_error)?
            .sync_all()?;

        Ok(())
    }

    /// Extracts every entry of `archive` below `destination`, creating it if absent.
    ///
    /// Entries with absolute paths, `..` components or link types are rejected
    /// before anything is written for them.
    #[named]
    pub fn unpack<A: AsRef<Path>, D: AsRef<Path>>(&self, archive: A, destination: D) -> Result<()> {
        let archive = archive.as_ref();
        let destination = destination.as_ref();

        let res = (|| -> Result<()> {
            let file = File::open(archive)?;
            std::fs::create_dir_all(destination)?;
            let mut reader = tar::Archive::new(Decompressor::for_path(archive, BufReader::new(file)));
            reader.set_overwrite(true);

            let mut count = 0usize;
            for entry in reader.entries()? {
                let mut entry = entry?;
                let path = entry.path()?.into_owned();
                validate_entry_path(&path)?;
                let entry_type = entry.header().entry_type();
                if matches!(entry_type, EntryType::Symlink | EntryType::Link) {
                    return Err(Error::InvalidArchive(format!(
                        "link entry {path:?} is not allowed"
                    )));
                }
                if !entry.unpack_in(destination)? {
                    return Err(Error::InvalidArchive(format!(
                        "entry {path:?} escapes the destination"
                    )));
                }
                count += 1;
            }
            tracing::info!("Extracted {} entries from {:?} into {:?}", count, archive, destination);
            Ok(())
        })();

        res.map_err(|e| Error::archive_read(archive, e.add_fn_name(function_path!())))
    }
}

fn validate_entry_path(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(Error::InvalidArchive("entry with empty path".into()));
    }
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::InvalidArchive(format!(
                    "entry {path:?} escapes the destination"
                )))
            }
        }
    }
    Ok(())
}

fn tmp_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(OsString::from)
        .unwrap_or_default();
    name.push(".tmp");
    destination.with_file_name(name)
}

fn remove_file_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        res => res,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::compress::xz::XzConfig;
    use crate::backup::result_error::error::ErrorKind;
    use tempfile::TempDir;
    use walkdir::WalkDir;

    fn xz_codec() -> ArchiveCodec {
        ArchiveCodec::new(CompressorConfig::Xz(XzConfig {
            level: Some(1),
            thread: Some(1),
        }))
    }

    fn plain_codec() -> ArchiveCodec {
        ArchiveCodec::new(CompressorConfig::None)
    }

    fn create_test_tree(root: &Path) {
        std::fs::create_dir_all(root.join("volumes/db")).unwrap();
        std::fs::create_dir_all(root.join("volumes/empty")).unwrap();
        std::fs::write(root.join("docker-compose.yml"), "services: {}").unwrap();
        std::fs::write(root.join("volumes/db/roles.sql"), "create role anon;").unwrap();
        std::fs::write(root.join("volumes/db/blob.bin"), [0u8, 1, 2, 255]).unwrap();
    }

    fn snapshot(root: &Path) -> Vec<(PathBuf, Option<Vec<u8>>)> {
        WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .map(|e| e.unwrap())
            .map(|e| {
                let rel = e.path().strip_prefix(root).unwrap().to_path_buf();
                let content = e.file_type().is_file().then(|| std::fs::read(e.path()).unwrap());
                (rel, content)
            })
            .collect()
    }

    fn write_raw_tar(path: &Path, name: &[u8], data: &[u8]) {
        let mut header = tar::Header::new_gnu();
        header.as_gnu_mut().unwrap().name[..name.len()].copy_from_slice(name);
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(EntryType::Regular);
        header.set_cksum();

        let mut builder = tar::Builder::new(File::create(path).unwrap());
        builder.append(&header, data).unwrap();
        builder.finish().unwrap();
    }

    #[test]
    fn test_file_ext() {
        assert_eq!(xz_codec().file_ext().unwrap().as_ref(), "tar.xz");
        assert_eq!(plain_codec().file_ext().unwrap().as_ref(), "tar");
    }

    #[test]
    fn test_pack_unpack_reproduces_tree() {
        for codec in [xz_codec(), plain_codec()] {
            let src = TempDir::new().unwrap();
            let instance = src.path().join("alpha");
            create_test_tree(&instance);
            let db = src.path().join("dashboard.db");
            std::fs::write(&db, "sqlite bytes").unwrap();

            let out = TempDir::new().unwrap();
            let archive = out
                .path()
                .join(format!("b.{}", codec.file_ext().unwrap()));
            codec.pack(&[&db, &instance], &archive).unwrap();
            assert!(archive.is_file());
            assert!(!tmp_path(&archive).exists());

            let extracted = TempDir::new().unwrap();
            let target = extracted.path().join("nested/target");
            codec.unpack(&archive, &target).unwrap();

            assert_eq!(snapshot(&target.join("alpha")), snapshot(&instance));
            assert_eq!(std::fs::read(target.join("dashboard.db")).unwrap(), b"sqlite bytes");
        }
    }

    #[test]
    fn test_pack_missing_source_leaves_no_file() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let archive = out.path().join("b.tar.xz");

        let err = xz_codec()
            .pack(&[src.path().join("missing")], &archive)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArchiveWrite);
        assert!(!archive.exists());
        assert_eq!(std::fs::read_dir(out.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_pack_unwritable_destination() {
        let src = TempDir::new().unwrap();
        std::fs::write(src.path().join("a.txt"), "a").unwrap();
        let blocker = src.path().join("not-a-dir");
        std::fs::write(&blocker, "file").unwrap();

        let err = xz_codec()
            .pack(&[src.path().join("a.txt")], blocker.join("b.tar.xz"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArchiveWrite);
    }

    #[test]
    fn test_pack_refuses_to_overwrite_existing_archive() {
        let src = TempDir::new().unwrap();
        let file = src.path().join("a.txt");
        std::fs::write(&file, "a").unwrap();
        let archive = src.path().join("b.tar");
        std::fs::write(&archive, "existing").unwrap();

        assert!(plain_codec().pack(&[&file], &archive).is_err());
        assert_eq!(std::fs::read(&archive).unwrap(), b"existing");
        assert!(!tmp_path(&archive).exists());
    }

    #[test]
    fn test_pack_entries_removes_temporary_sources() {
        let src = TempDir::new().unwrap();
        let snapshot = src.path().join("snapshot");
        std::fs::write(&snapshot, "db").unwrap();
        let archive = src.path().join("b.tar");

        plain_codec()
            .pack_entries(
                vec![ArchiveEntry::delete_src(snapshot.clone(), PathBuf::from("dashboard.db"))],
                &archive,
            )
            .unwrap();
        assert!(!snapshot.exists());

        let out = TempDir::new().unwrap();
        plain_codec().unpack(&archive, out.path()).unwrap();
        assert_eq!(std::fs::read(out.path().join("dashboard.db")).unwrap(), b"db");
    }

    #[test]
    fn test_unpack_rejects_parent_dir_entry() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("evil.tar");
        write_raw_tar(&archive, b"../evil.txt", b"evil");

        let dest = dir.path().join("dest");
        let err = plain_codec().unpack(&archive, &dest).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArchiveRead);
        assert!(!dir.path().join("evil.txt").exists());
        assert_eq!(std::fs::read_dir(&dest).unwrap().count(), 0);
    }

    #[test]
    fn test_unpack_rejects_absolute_entry() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("evil.tar");
        let outside = dir.path().join("outside.txt");
        write_raw_tar(&archive, outside.to_string_lossy().as_bytes(), b"evil");

        let err = plain_codec()
            .unpack(&archive, dir.path().join("dest"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArchiveRead);
        assert!(!outside.exists());
    }

    #[test]
    fn test_unpack_missing_archive() {
        let dir = TempDir::new().unwrap();
        let err = xz_codec()
            .unpack(dir.path().join("missing.tar.xz"), dir.path().join("dest"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArchiveRead);
        assert!(!dir.path().join("dest").exists());
    }

    #[test]
    fn test_unpack_corrupt_archive() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("corrupt.tar.xz");
        std::fs::write(&archive, b"definitely not xz").unwrap();

        let err = xz_codec()
            .unpack(&archive, dir.path().join("dest"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArchiveRead);
    }

    #[test]
    fn test_validate_entry_path() {
        assert!(validate_entry_path(Path::new("alpha/volumes/db")).is_ok());
        assert!(validate_entry_path(Path::new("./alpha")).is_ok());
        assert!(validate_entry_path(Path::new("alpha/../../etc")).is_err());
        assert!(validate_entry_path(Path::new("/etc/passwd")).is_err());
        assert!(validate_entry_path(Path::new("")).is_err());
    }
}
