use crate::backup::archive::ArchiveEntry;
use crate::backup::result_error::result::Result;
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::sync::Arc;
use tempfile::Builder;

/// Takes a consistent copy of a live SQLite database with `VACUUM INTO`.
///
/// The snapshot lands in a temp file that is deleted after it has been
/// archived under `dst`.
pub fn snapshot_entry<P: AsRef<Path>, D: Into<Arc<Path>>>(src: P, dst: D) -> Result<ArchiveEntry> {
    let conn = Connection::open_with_flags(
        src.as_ref(),
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;

    let temp_file_path = Builder::new()
        .prefix("kbackupd-db-")
        .keep(true)
        .tempfile()?
        .path()
        .to_path_buf();
    tracing::debug!("Snapshotting {:?} into {:?}", src.as_ref(), temp_file_path);

    if let Err(e) = conn.execute("VACUUM INTO ?1", [temp_file_path.to_string_lossy().into_owned()]) {
        let _ = std::fs::remove_file(&temp_file_path);
        return Err(e.into());
    }

    Ok(ArchiveEntry::delete_src(temp_file_path, dst))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_snapshot_contains_rows() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("dashboard.db");
        let conn = Connection::open(&db).unwrap();
        conn.execute_batch("CREATE TABLE t (v TEXT); INSERT INTO t VALUES ('kept');")
            .unwrap();

        let entry = snapshot_entry(&db, Path::new("dashboard.db")).unwrap();
        assert!(entry.delete_src);
        assert_eq!(entry.dst.as_ref(), Path::new("dashboard.db"));

        let snapshot = Connection::open(entry.src.as_ref()).unwrap();
        let v: String = snapshot
            .query_row("SELECT v FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(v, "kept");
        drop(snapshot);
        std::fs::remove_file(entry.src.as_ref()).unwrap();
    }

    #[test]
    fn test_snapshot_of_non_database_fails() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("missing.db");
        assert!(snapshot_entry(&db, Path::new("missing.db")).is_err());
    }
}
