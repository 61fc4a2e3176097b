use crate::backup::result_error::{AddFunctionName, AddMsg};
use itertools::Itertools;
use std::fmt::Debug;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Rusqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    LiblzmaStream(#[from] liblzma::stream::Error),
    #[error(transparent)]
    ValidationError(#[from] validator::ValidationErrors),
    #[error(transparent)]
    SerdeYml(#[from] serde_yml::Error),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error(transparent)]
    WalkDir(#[from] walkdir::Error),
    #[error(transparent)]
    StripPrefix(#[from] std::path::StripPrefixError),
    #[error("Invalid cron expression {expr:?}: {reason}")]
    InvalidCronFormat { expr: String, reason: String },
    #[error("Unsupported backup type {0:?}, expected one of: full, instance, database")]
    UnsupportedBackupType(String),
    #[error("Instance id is required for {0}")]
    MissingInstanceId(&'static str),
    #[error("{what} {id:?} not found")]
    NotFound { what: &'static str, id: String },
    #[error("Invalid backup name {0:?}")]
    InvalidBackupName(String),
    #[error("Invalid archive: {0}")]
    InvalidArchive(String),
    #[error("Writing archive {path:?} failed, nothing was changed:\n{}", indent::indent_all_with("  ", error.to_string()))]
    ArchiveWrite { path: PathBuf, error: Box<Error> },
    #[error("Reading archive {path:?} failed, nothing was changed:\n{}", indent::indent_all_with("  ", error.to_string()))]
    ArchiveRead { path: PathBuf, error: Box<Error> },
    #[error("Restoring backup {backup_id:?} failed while replacing live files, live state may be partially modified:\n{}", indent::indent_all_with("  ", error.to_string()))]
    RestorePlacement { backup_id: String, error: Box<Error> },
    #[error("Execution timed out after {0:?}")]
    Timeout(Duration),
    #[error("Backup {0:?} was abandoned before it was recorded")]
    Abandoned(String),
    #[error("{}:\n{}", msg, indent::indent_all_with("  ", error.to_string()))]
    WithMsg { msg: String, error: Box<Error> },
    #[error("{} failed:\n{}", fn_name, indent::indent_all_with("  ", error.to_string()))]
    WithFunctionName { fn_name: String, error: Box<Error> },
    #[error("{}", itertools::join(.0, "\n\n"))]
    LotsOfError(Vec<Error>),
}

/// Coarse classification used by callers to map errors to responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidCronFormat,
    UnsupportedBackupType,
    MissingInstanceId,
    InvalidBackupName,
    NotFound,
    ArchiveWrite,
    ArchiveRead,
    Filesystem,
    Catalog,
    Config,
    Serialization,
    Timeout,
    Abandoned,
}

impl ErrorKind {
    /// Errors caused by the request itself rather than by the system.
    pub fn is_client_error(self) -> bool {
        matches!(
            self,
            ErrorKind::InvalidCronFormat
                | ErrorKind::UnsupportedBackupType
                | ErrorKind::MissingInstanceId
                | ErrorKind::InvalidBackupName
                | ErrorKind::NotFound
        )
    }
}

impl<S: Into<String>> AddFunctionName<S> for Error {
    fn add_fn_name(self, fn_name: S) -> Self {
        Error::WithFunctionName {
            fn_name: fn_name.into(),
            error: Box::new(self),
        }
    }
}

impl<S: Into<String>> AddMsg<S> for Error {
    fn add_msg(self, msg: S) -> Self {
        Self::WithMsg {
            msg: msg.into(),
            error: Box::new(self),
        }
    }
}

impl Error {
    pub fn into_iter(self) -> Box<dyn Iterator<Item = Error>> {
        match self {
            Error::LotsOfError(v) => Box::new(v.into_iter().flat_map(|e| e.into_iter())),
            e => Box::new(std::iter::once(e)),
        }
    }

    pub fn chain(self, other: Error) -> Error {
        Error::LotsOfError(self.into_iter().chain(other.into_iter()).collect_vec())
    }

    pub fn not_found<S: Into<String>>(what: &'static str, id: S) -> Error {
        Error::NotFound {
            what,
            id: id.into(),
        }
    }

    pub fn archive_write<P: Into<PathBuf>>(path: P, error: Error) -> Error {
        Error::ArchiveWrite {
            path: path.into(),
            error: Box::new(error),
        }
    }

    pub fn archive_read<P: Into<PathBuf>>(path: P, error: Error) -> Error {
        Error::ArchiveRead {
            path: path.into(),
            error: Box::new(error),
        }
    }

    /// Kind of the innermost meaningful error, looking through context wrappers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) | Error::WalkDir(_) | Error::StripPrefix(_) => ErrorKind::Filesystem,
            Error::Rusqlite(_) => ErrorKind::Catalog,
            Error::LiblzmaStream(_) => ErrorKind::ArchiveWrite,
            Error::ValidationError(_) | Error::SerdeYml(_) => ErrorKind::Config,
            Error::SerdeJson(_) => ErrorKind::Serialization,
            Error::InvalidCronFormat { .. } => ErrorKind::InvalidCronFormat,
            Error::UnsupportedBackupType(_) => ErrorKind::UnsupportedBackupType,
            Error::MissingInstanceId(_) => ErrorKind::MissingInstanceId,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::InvalidBackupName(_) => ErrorKind::InvalidBackupName,
            Error::InvalidArchive(_) | Error::ArchiveRead { .. } => ErrorKind::ArchiveRead,
            Error::ArchiveWrite { .. } => ErrorKind::ArchiveWrite,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Abandoned(_) => ErrorKind::Abandoned,
            Error::RestorePlacement { error, .. }
            | Error::WithMsg { error, .. }
            | Error::WithFunctionName { error, .. } => error.kind(),
            Error::LotsOfError(v) => v.first().map_or(ErrorKind::Filesystem, Error::kind),
        }
    }

    /// Whether the failure happened after live files started being overwritten.
    pub fn live_state_modified(&self) -> bool {
        match self {
            Error::RestorePlacement { .. } => true,
            Error::WithMsg { error, .. } | Error::WithFunctionName { error, .. } => {
                error.live_state_modified()
            }
            Error::LotsOfError(v) => v.iter().any(Error::live_state_modified),
            _ => false,
        }
    }
}
