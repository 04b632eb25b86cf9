//! Apply Engine: replay a manifest against a live tree, optionally recording
//! the reverse patch as it goes.
//!
//! Operations run one at a time in manifest order. Before each mutation the
//! engine captures whatever it needs to undo it, so the reverse patch built so
//! far always restores the already-applied prefix. On the first failure the
//! engine stops and hands that partial reverse back with the error.

use std::borrow::Cow;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::artifact::{PatchReader, PatchWriter};
use crate::codec::{BlockCodec, DeltaCodec};
use crate::error::{Error, NodeKind, Result};
use crate::patch_format::{
    DiffMode, Fingerprint, Manifest, Operation, Patch, PayloadSource, Payloads, Summary,
};
use crate::path::RelPath;
use crate::scan::{self, PathState};
use crate::util;

/// Accumulates the inverse of each applied operation, in manifest order.
#[derive(Debug)]
pub struct ReverseBuilder {
    mode: DiffMode,
    operations: Vec<Operation>,
    payloads: Payloads,
}

impl ReverseBuilder {
    pub fn new(mode: DiffMode) -> Self {
        Self {
            mode,
            operations: Vec::new(),
            payloads: Payloads::new(),
        }
    }

    fn push(&mut self, op: Operation, payload: Option<Vec<u8>>) {
        if let Some(data) = payload {
            self.payloads.insert(op.path().clone(), data);
        }
        self.operations.push(op);
    }

    pub fn finish(self) -> Patch {
        Patch {
            manifest: Manifest::from_sorted(self.mode, self.operations),
            payloads: self.payloads,
        }
    }
}

#[derive(Debug)]
pub struct Applied {
    pub summary: Summary,
    /// Present when backup was requested.
    pub reverse: Option<Patch>,
}

/// An apply run that stopped early.
#[derive(Debug, thiserror::Error)]
#[error("apply stopped after {applied} completed operation(s)")]
pub struct ApplyError {
    #[source]
    pub source: Error,
    pub applied: usize,
    /// Undoes the `applied` operations that completed. Present when backup was requested.
    pub reverse: Option<Patch>,
    /// Where the partial reverse patch was written, if anywhere.
    pub backup: Option<PathBuf>,
}

impl From<Error> for ApplyError {
    fn from(source: Error) -> Self {
        Self {
            source,
            applied: 0,
            reverse: None,
            backup: None,
        }
    }
}

pub struct ApplyEngine<'a> {
    root: PathBuf,
    codec: &'a dyn DeltaCodec,
}

impl<'a> ApplyEngine<'a> {
    pub fn new(root: &Path, codec: &'a dyn DeltaCodec) -> Result<Self> {
        let bad_root = |reason: String| Error::Scan {
            root: root.to_path_buf(),
            reason,
        };
        let meta = std::fs::metadata(root).map_err(|e| bad_root(e.to_string()))?;
        if !meta.is_dir() {
            return Err(bad_root("not a directory".into()));
        }
        let root = root.canonicalize().map_err(|e| bad_root(e.to_string()))?;
        Ok(Self { root, codec })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Verify every operation's pre-state and payload without touching the tree.
    pub fn check(&self, manifest: &Manifest, payloads: &dyn PayloadSource) -> Result<Summary> {
        let mut summary = Summary::default();
        for op in manifest.operations() {
            self.check_one(manifest.mode, op, payloads)?;
            summary.record(op.kind());
        }
        debug!(root = %self.root.display(), operations = manifest.operations().len(), "patch applies cleanly");
        Ok(summary)
    }

    /// Apply `manifest` in order. With `backup`, the returned (or failed) run
    /// carries the reverse patch for everything that was applied.
    pub fn apply(
        &self,
        manifest: &Manifest,
        payloads: &dyn PayloadSource,
        backup: bool,
    ) -> std::result::Result<Applied, ApplyError> {
        let mut reverse = backup.then(|| ReverseBuilder::new(manifest.mode));
        let mut summary = Summary::default();

        for (index, op) in manifest.operations().iter().enumerate() {
            match self.apply_one(manifest.mode, op, payloads, reverse.as_mut()) {
                Ok(payload_len) => {
                    summary.record(op.kind());
                    summary.payload_bytes += payload_len;
                }
                Err(source) => {
                    warn!(path = %op.path(), kind = %op.kind(), error = %source, "apply stopped");
                    return Err(ApplyError {
                        source,
                        applied: index,
                        reverse: reverse.map(ReverseBuilder::finish),
                        backup: None,
                    });
                }
            }
        }

        info!(
            root = %self.root.display(),
            added = summary.files_added,
            modified = summary.files_modified,
            deleted = summary.files_deleted,
            "patch applied"
        );
        Ok(Applied {
            summary,
            reverse: reverse.map(ReverseBuilder::finish),
        })
    }

    /// Returns the number of payload bytes consumed.
    fn apply_one(
        &self,
        mode: DiffMode,
        op: &Operation,
        payloads: &dyn PayloadSource,
        reverse: Option<&mut ReverseBuilder>,
    ) -> Result<u64> {
        let backup = reverse.is_some();
        let (undo, undo_payload, consumed) = match op {
            Operation::Add { path, target } => {
                let payload = payloads.payload(path)?;
                verify(path, "added content", *target, &payload)?;
                match self.read_current(path)? {
                    Some(existing) if Fingerprint::of(&existing) == *target => {
                        debug!(%path, "already present with expected content");
                        let undo = Operation::Unchanged {
                            path: path.clone(),
                            fingerprint: *target,
                        };
                        (undo, None, 0)
                    }
                    Some(existing) => {
                        return Err(Error::mismatch(
                            path.as_str(),
                            "pre-existing file",
                            format!("absent or {target}"),
                            Fingerprint::of(&existing),
                        ))
                    }
                    None => {
                        util::write_atomic(&path.to_native(&self.root), &payload)?;
                        debug!(%path, bytes = payload.len(), "added");
                        let undo = Operation::Delete {
                            path: path.clone(),
                            base: *target,
                        };
                        (undo, None, payload.len() as u64)
                    }
                }
            }

            Operation::Delete { path, base } => {
                let pre = self.read_required(path)?;
                verify(path, "delete pre-image", *base, &pre)?;
                let full = path.to_native(&self.root);
                std::fs::remove_file(&full).map_err(|e| Error::io(&full, "delete", e))?;
                if let Some(parent) = full.parent() {
                    util::prune_empty_dirs(&self.root, parent)?;
                }
                debug!(%path, "deleted");
                let undo = Operation::Add {
                    path: path.clone(),
                    target: *base,
                };
                (undo, backup.then_some(pre), 0)
            }

            Operation::Modify { path, base, target } => {
                let pre = self.read_required(path)?;
                let payload = payloads.payload(path)?;
                let consumed = payload.len() as u64;
                let (new, undo_payload) = match mode {
                    DiffMode::Binary => {
                        verify(path, "base fingerprint", *base, &pre)?;
                        let new = self
                            .codec
                            .reconstruct(&pre, &payload)
                            .map_err(|source| codec_error(path, source))?;
                        verify(path, "reconstructed fingerprint", *target, &new)?;
                        let undo_payload = if backup {
                            let delta = self
                                .codec
                                .delta(&new, &pre)
                                .map_err(|source| codec_error(path, source))?;
                            Some(delta)
                        } else {
                            None
                        };
                        (Cow::Owned(new), undo_payload)
                    }
                    DiffMode::File => {
                        verify(path, "replacement fingerprint", *target, &payload)?;
                        (payload, None)
                    }
                };
                let pre_fingerprint = Fingerprint::of(&pre);
                util::write_atomic(&path.to_native(&self.root), &new)?;
                debug!(%path, %mode, bytes = new.len(), "modified");
                let undo = Operation::Modify {
                    path: path.clone(),
                    base: *target,
                    target: pre_fingerprint,
                };
                let undo_payload = match mode {
                    DiffMode::Binary => undo_payload,
                    DiffMode::File => backup.then_some(pre),
                };
                (undo, undo_payload, consumed)
            }

            Operation::Unchanged { path, fingerprint } => {
                self.expect_file(path, *fingerprint, "unchanged fingerprint")?;
                let undo = Operation::Unchanged {
                    path: path.clone(),
                    fingerprint: *fingerprint,
                };
                (undo, None, 0)
            }
        };

        if let Some(reverse) = reverse {
            reverse.push(undo, undo_payload);
        }
        Ok(consumed)
    }

    fn check_one(&self, mode: DiffMode, op: &Operation, payloads: &dyn PayloadSource) -> Result<()> {
        match op {
            Operation::Add { path, target } => {
                let payload = payloads.payload(path)?;
                verify(path, "added content", *target, &payload)?;
                match scan::probe(&self.root, path)?.state {
                    PathState::Absent => Ok(()),
                    PathState::File(fp) if fp == *target => Ok(()),
                    PathState::File(fp) => Err(Error::mismatch(
                        path.as_str(),
                        "pre-existing file",
                        format!("absent or {target}"),
                        fp,
                    )),
                }
            }
            Operation::Delete { path, base } => {
                self.expect_file(path, *base, "delete pre-image")
            }
            Operation::Modify { path, base, target } => {
                let payload = payloads.payload(path)?;
                match mode {
                    DiffMode::Binary => self.expect_file(path, *base, "base fingerprint"),
                    DiffMode::File => {
                        verify(path, "replacement fingerprint", *target, &payload)?;
                        self.read_required(path).map(|_| ())
                    }
                }
            }
            Operation::Unchanged { path, fingerprint } => {
                self.expect_file(path, *fingerprint, "unchanged fingerprint")
            }
        }
    }

    /// The path must hold a regular file with exactly `expected` content.
    fn expect_file(&self, path: &RelPath, expected: Fingerprint, check: &'static str) -> Result<()> {
        match scan::probe(&self.root, path)?.state {
            PathState::File(fp) if fp == expected => Ok(()),
            PathState::File(fp) => Err(Error::mismatch(path.as_str(), check, expected, fp)),
            PathState::Absent => Err(missing(&path.to_native(&self.root))),
        }
    }

    /// Runs before every mutation, so writes and deletes never pass through a symlink.
    fn read_current(&self, path: &RelPath) -> Result<Option<Vec<u8>>> {
        scan::check_ancestors(&self.root, path)?;
        let full = path.to_native(&self.root);
        match scan::node_kind(&full)? {
            None => Ok(None),
            Some(NodeKind::File) => std::fs::read(&full)
                .map(Some)
                .map_err(|e| Error::io(&full, "read", e)),
            Some(found) => Err(Error::TypeConflict {
                path: path.to_string(),
                expected: NodeKind::File,
                found,
            }),
        }
    }

    fn read_required(&self, path: &RelPath) -> Result<Vec<u8>> {
        self.read_current(path)?
            .ok_or_else(|| missing(&path.to_native(&self.root)))
    }
}

fn verify(path: &RelPath, check: &'static str, expected: Fingerprint, data: &[u8]) -> Result<()> {
    let actual = Fingerprint::of(data);
    if actual == expected {
        Ok(())
    } else {
        Err(Error::mismatch(path.as_str(), check, expected, actual))
    }
}

fn missing(full: &Path) -> Error {
    Error::io(
        full,
        "read pre-image of",
        std::io::Error::new(std::io::ErrorKind::NotFound, "file does not exist"),
    )
}

fn codec_error(path: &RelPath, source: crate::codec::CodecError) -> Error {
    Error::Codec {
        path: path.to_string(),
        source,
    }
}

#[derive(Debug)]
pub struct ApplyReport {
    pub summary: Summary,
    /// Where the reverse patch was written, and what it contains.
    pub reverse: Option<(PathBuf, Summary)>,
}

/// Apply the artifact at `artifact` to `target_dir`.
///
/// With `backup`, the reverse patch is written there, including when the run
/// fails part-way (then it undoes only the completed prefix).
pub async fn apply_patch(
    artifact: &Path,
    target_dir: &Path,
    backup: Option<&Path>,
) -> std::result::Result<ApplyReport, ApplyError> {
    let artifact = artifact.to_path_buf();
    let target_dir = target_dir.to_path_buf();
    let backup = backup.map(Path::to_path_buf);
    tokio::task::spawn_blocking(move || apply_blocking(&artifact, &target_dir, backup.as_deref()))
        .await
        .map_err(|e| ApplyError::from(Error::from(e)))?
}

fn apply_blocking(
    artifact: &Path,
    target_dir: &Path,
    backup: Option<&Path>,
) -> std::result::Result<ApplyReport, ApplyError> {
    let reader = PatchReader::open(artifact)?;
    info!(
        patch = %artifact.display(),
        target = %target_dir.display(),
        mode = %reader.mode(),
        operations = reader.manifest().operations().len(),
        "applying patch"
    );
    let codec = BlockCodec::default();
    let engine = ApplyEngine::new(target_dir, &codec)?;

    match engine.apply(reader.manifest(), &reader, backup.is_some()) {
        Ok(applied) => {
            let mut report = ApplyReport {
                summary: applied.summary,
                reverse: None,
            };
            if let (Some(path), Some(reverse)) = (backup, applied.reverse) {
                if let Err(source) = write_reverse(&reverse, path) {
                    return Err(ApplyError {
                        source,
                        applied: reader.manifest().operations().len(),
                        reverse: Some(reverse),
                        backup: None,
                    });
                }
                report.reverse = Some((path.to_path_buf(), reverse.summary()));
            }
            Ok(report)
        }
        Err(mut failure) => {
            if let (Some(path), Some(reverse)) = (backup, &failure.reverse) {
                match write_reverse(reverse, path) {
                    Ok(()) => failure.backup = Some(path.to_path_buf()),
                    Err(e) => warn!(path = %path.display(), error = %e, "could not write partial reverse patch"),
                }
            }
            Err(failure)
        }
    }
}

fn write_reverse(reverse: &Patch, path: &Path) -> Result<()> {
    let size = PatchWriter::default().write_file(&reverse.manifest, &reverse.payloads, path)?;
    info!(path = %path.display(), bytes = size, "wrote reverse patch");
    Ok(())
}

/// Validate that the artifact applies cleanly to `target_dir` without changing it.
pub async fn check_patch(artifact: &Path, target_dir: &Path) -> Result<Summary> {
    let artifact = artifact.to_path_buf();
    let target_dir = target_dir.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<Summary> {
        let reader = PatchReader::open(&artifact)?;
        let codec = BlockCodec::default();
        ApplyEngine::new(&target_dir, &codec)?.check(reader.manifest(), &reader)
    })
    .await?
}
