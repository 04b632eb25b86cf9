use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Error, Result};
use crate::path::RelPath;
use crate::util;

pub const MAGIC: &[u8; 8] = b"DIRPATCH";
pub const FORMAT_VERSION: u32 = 1;
/// File extension for patch artifacts.
pub const PATCH_EXTENSION: &str = "dpatch";

/// How MODIFY payloads are interpreted; fixed for a whole manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
pub enum DiffMode {
    /// MODIFY carries a delta against the pre-image.
    Binary,
    /// MODIFY carries the full replacement content.
    File,
}

impl DiffMode {
    pub fn to_byte(self) -> u8 {
        match self {
            DiffMode::Binary => 0,
            DiffMode::File => 1,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(DiffMode::Binary),
            1 => Some(DiffMode::File),
            _ => None,
        }
    }
}

impl fmt::Display for DiffMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiffMode::Binary => f.write_str("binary"),
            DiffMode::File => f.write_str("file"),
        }
    }
}

/// Size plus BLAKE3 digest of a file's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    pub size: u64,
    pub hash: [u8; 32],
}

impl Fingerprint {
    pub fn of(data: &[u8]) -> Self {
        Self {
            size: data.len() as u64,
            hash: util::hash_bytes(data),
        }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} bytes/{}", self.size, util::short_hex(&self.hash))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    Add,
    Modify,
    Delete,
    Unchanged,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OpKind::Add => "ADD",
            OpKind::Modify => "MODIFY",
            OpKind::Delete => "DELETE",
            OpKind::Unchanged => "UNCHANGED",
        };
        f.write_str(s)
    }
}

/// One per-path step of a manifest. ADD and MODIFY payloads live beside the
/// manifest in a [`PayloadSource`], keyed by path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Add {
        path: RelPath,
        target: Fingerprint,
    },
    Modify {
        path: RelPath,
        base: Fingerprint,
        target: Fingerprint,
    },
    Delete {
        path: RelPath,
        base: Fingerprint,
    },
    Unchanged {
        path: RelPath,
        fingerprint: Fingerprint,
    },
}

impl Operation {
    pub fn path(&self) -> &RelPath {
        match self {
            Operation::Add { path, .. }
            | Operation::Modify { path, .. }
            | Operation::Delete { path, .. }
            | Operation::Unchanged { path, .. } => path,
        }
    }

    pub fn kind(&self) -> OpKind {
        match self {
            Operation::Add { .. } => OpKind::Add,
            Operation::Modify { .. } => OpKind::Modify,
            Operation::Delete { .. } => OpKind::Delete,
            Operation::Unchanged { .. } => OpKind::Unchanged,
        }
    }

    pub fn has_payload(&self) -> bool {
        matches!(self, Operation::Add { .. } | Operation::Modify { .. })
    }

    /// Fingerprint the path has after this operation, if it still exists.
    pub fn target_fingerprint(&self) -> Option<Fingerprint> {
        match self {
            Operation::Add { target, .. } | Operation::Modify { target, .. } => Some(*target),
            Operation::Delete { .. } => None,
            Operation::Unchanged { fingerprint, .. } => Some(*fingerprint),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub version: u32,
    pub mode: DiffMode,
    operations: Vec<Operation>,
}

impl Manifest {
    /// Build a manifest, rejecting operations that are not strictly ordered by path.
    pub fn new(mode: DiffMode, operations: Vec<Operation>) -> Result<Self> {
        for pair in operations.windows(2) {
            let (prev, next) = (pair[0].path(), pair[1].path());
            if prev == next {
                return Err(Error::corrupt(format!("duplicate path {next}")));
            }
            if prev > next {
                return Err(Error::corrupt(format!(
                    "path {next} is out of order after {prev}"
                )));
            }
        }
        Ok(Self {
            version: FORMAT_VERSION,
            mode,
            operations,
        })
    }

    /// For callers that build operations in path order by construction.
    pub(crate) fn from_sorted(mode: DiffMode, operations: Vec<Operation>) -> Self {
        debug_assert!(operations.windows(2).all(|w| w[0].path() < w[1].path()));
        Self {
            version: FORMAT_VERSION,
            mode,
            operations,
        }
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Operations that mutate the tree (everything except UNCHANGED).
    pub fn changes(&self) -> impl Iterator<Item = &Operation> {
        self.operations
            .iter()
            .filter(|op| op.kind() != OpKind::Unchanged)
    }

    pub fn is_noop(&self) -> bool {
        self.changes().next().is_none()
    }

    pub fn summary(&self) -> Summary {
        let mut summary = Summary::default();
        for op in &self.operations {
            summary.record(op.kind());
        }
        summary
    }
}

/// Resolves the payload bytes of ADD and MODIFY operations by path.
pub trait PayloadSource {
    fn payload(&self, path: &RelPath) -> Result<Cow<'_, [u8]>>;
}

/// In-memory payloads, as produced by the diff engine and the reverse builder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payloads(BTreeMap<RelPath, Vec<u8>>);

impl Payloads {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: RelPath, data: Vec<u8>) {
        self.0.insert(path, data);
    }

    pub fn get(&self, path: &RelPath) -> Option<&[u8]> {
        self.0.get(path).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.0.values().map(|v| v.len() as u64).sum()
    }
}

impl PayloadSource for Payloads {
    fn payload(&self, path: &RelPath) -> Result<Cow<'_, [u8]>> {
        self.get(path)
            .map(Cow::Borrowed)
            .ok_or_else(|| Error::corrupt(format!("no payload for {path}")))
    }
}

/// A manifest together with the payloads it refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch {
    pub manifest: Manifest,
    pub payloads: Payloads,
}

impl Patch {
    pub fn summary(&self) -> Summary {
        Summary {
            payload_bytes: self.payloads.total_bytes(),
            ..self.manifest.summary()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    pub files_added: usize,
    pub files_modified: usize,
    pub files_deleted: usize,
    pub files_unchanged: usize,
    pub payload_bytes: u64,
}

impl Summary {
    pub fn record(&mut self, kind: OpKind) {
        match kind {
            OpKind::Add => self.files_added += 1,
            OpKind::Modify => self.files_modified += 1,
            OpKind::Delete => self.files_deleted += 1,
            OpKind::Unchanged => self.files_unchanged += 1,
        }
    }

    pub fn changes(&self) -> usize {
        self.files_added + self.files_modified + self.files_deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> RelPath {
        RelPath::new(s).unwrap()
    }

    #[test]
    fn test_manifest_rejects_duplicates_and_disorder() {
        let fp = Fingerprint::of(b"x");
        let dup = vec![
            Operation::Delete { path: p("a"), base: fp },
            Operation::Add { path: p("a"), target: fp },
        ];
        assert!(Manifest::new(DiffMode::Binary, dup)
            .unwrap_err()
            .to_string()
            .contains("duplicate path a"));

        let unordered = vec![
            Operation::Delete { path: p("b"), base: fp },
            Operation::Add { path: p("a"), target: fp },
        ];
        assert!(Manifest::new(DiffMode::Binary, unordered).is_err());
    }

    #[test]
    fn test_summary_and_noop() {
        let fp = Fingerprint::of(b"x");
        let manifest = Manifest::new(
            DiffMode::File,
            vec![
                Operation::Unchanged { path: p("a"), fingerprint: fp },
                Operation::Unchanged { path: p("b"), fingerprint: fp },
            ],
        )
        .unwrap();
        assert!(manifest.is_noop());
        assert_eq!(manifest.summary().files_unchanged, 2);
        assert_eq!(manifest.summary().changes(), 0);
    }

    #[test]
    fn test_missing_payload_is_reported() {
        let payloads = Payloads::new();
        let err = payloads.payload(&p("gone.bin")).unwrap_err();
        assert!(matches!(err, Error::CorruptPatch { .. }));
    }

    #[test]
    fn test_mode_byte_mapping() {
        for mode in [DiffMode::Binary, DiffMode::File] {
            assert_eq!(DiffMode::from_byte(mode.to_byte()), Some(mode));
        }
        assert_eq!(DiffMode::from_byte(7), None);
    }
}
