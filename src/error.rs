//! Error types shared by the scanner, diff engine, artifact codec and apply engine.

use std::fmt;
use std::io;
use std::path::PathBuf;

use crate::codec::CodecError;

/// Result type for dirpatch operations
pub type Result<T> = std::result::Result<T, Error>;

/// What occupies a path in a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
    /// Symlink, socket, FIFO or device.
    Special,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::File => f.write_str("file"),
            NodeKind::Directory => f.write_str("directory"),
            NodeKind::Special => f.write_str("special file"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The scan root is missing, not a directory, or holds an unrepresentable path.
    #[error("cannot scan {}: {reason}", root.display())]
    Scan { root: PathBuf, reason: String },

    #[error("failed to {action} {}: {source}", path.display())]
    Io {
        path: PathBuf,
        action: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("type conflict at {path}: expected {expected}, found {found}")]
    TypeConflict {
        path: String,
        expected: NodeKind,
        found: NodeKind,
    },

    #[error("corrupt patch: {reason}")]
    CorruptPatch { reason: String },

    #[error("patch mismatch at {path}: {check} check failed (expected {expected}, found {found})")]
    PatchMismatch {
        path: String,
        check: &'static str,
        expected: String,
        found: String,
    },

    #[error("delta codec failed for {path}: {source}")]
    Codec {
        path: String,
        #[source]
        source: CodecError,
    },

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, action: &'static str, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            action,
            source,
        }
    }

    pub fn corrupt(reason: impl Into<String>) -> Self {
        Self::CorruptPatch {
            reason: reason.into(),
        }
    }

    pub fn mismatch(
        path: impl Into<String>,
        check: &'static str,
        expected: impl fmt::Display,
        found: impl fmt::Display,
    ) -> Self {
        Self::PatchMismatch {
            path: path.into(),
            check,
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }

    /// True for I/O failures caused by a missing file.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Io { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}
