use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failures of the on-device library store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("iPod database not found at {0}")]
    NotFound(PathBuf),

    #[error("failed to parse iPod database {path}: {reason}")]
    ParseFailure { path: PathBuf, reason: String },

    #[error("failed to write iPod database {path}: {source}")]
    WriteFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("an iPod database already exists at {0}")]
    AlreadyExists(PathBuf),

    #[error("database has been closed")]
    UseAfterClose,

    #[error("a save is already in progress")]
    SaveInProgress,

    #[error("database lock poisoned")]
    LockPoisoned,

    #[error("track {0} not found")]
    TrackNotFound(u32),

    #[error("playlist {0} not found")]
    PlaylistNotFound(u32),

    #[error("the master playlist cannot be removed or renamed")]
    MasterPlaylistProtected,

    #[error("artwork rejected: {0}")]
    Artwork(String),

    #[error("{0} is not supported")]
    Unsupported(&'static str),
}

/// Failures of the on-device path allocator.
#[derive(Debug, Error)]
pub enum AllocError {
    #[error("all {0} four-letter file codes are in use")]
    CodeSpaceExhausted(u32),

    #[error("could not find a free file name after {tries} attempts (last tried {last})")]
    Collision { tries: u32, last: PathBuf },

    #[error("device path {0} exceeds the legacy path length limit")]
    PathTooLong(String),
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("device path {0} is not inside /iPod_Control/")]
    InvalidDevicePath(String),
}

/// Failures surfaced by the sync orchestrator.
///
/// Per-file variants (`CopyFailure`, `BuildFailure`, `Allocation`) are absorbed
/// into the batch statistics by tree syncs and only propagate out of
/// single-file syncs.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("path does not exist: {0}")]
    NotFound(PathBuf),

    #[error("not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("not a regular file: {0}")]
    NotAFile(PathBuf),

    #[error("unsupported file type: {0}")]
    Unsupported(PathBuf),

    #[error("failed to copy {source_path} to {dest}: {source}")]
    CopyFailure {
        source_path: PathBuf,
        dest: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to build track for {path}: {source}")]
    BuildFailure {
        path: PathBuf,
        #[source]
        source: BuildError,
    },

    #[error(transparent)]
    Allocation(#[from] AllocError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
