//! Diff Engine: merge-join two sorted scans into a manifest plus payloads.

use rayon::prelude::*;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, info};

use crate::codec::DeltaCodec;
use crate::error::{Error, NodeKind, Result};
use crate::patch_format::{DiffMode, Fingerprint, Manifest, Operation, Patch, Payloads};
use crate::path::RelPath;
use crate::scan::{PathEntry, TreeScan};
use crate::util;

/// A path classified by the merge-join, before any payload is computed.
#[derive(Debug)]
enum Classified {
    Added(RelPath, Fingerprint),
    Modified(RelPath, Fingerprint, Fingerprint),
    Deleted(RelPath, Fingerprint),
    Unchanged(RelPath, Fingerprint),
}

/// Compare two scanned trees and build the patch turning `base` into `target`.
///
/// Nothing partial escapes: any unreadable file or type conflict fails the
/// whole diff.
pub fn diff_trees(
    base: &TreeScan,
    target: &TreeScan,
    mode: DiffMode,
    codec: &dyn DeltaCodec,
) -> Result<Patch> {
    check_type_conflicts(base, target)?;

    let (base_entries, target_entries) = rayon::join(
        || base.fingerprint_all(),
        || target.fingerprint_all(),
    );
    let classified = merge_join(&base_entries?, &target_entries?)?;

    // Payload computation is independent per path; collect() keeps manifest order.
    let built: Vec<(Operation, Option<Vec<u8>>)> = classified
        .into_par_iter()
        .map(|c| build_operation(c, base.root(), target.root(), mode, codec))
        .collect::<Result<_>>()?;

    let mut payloads = Payloads::new();
    let mut operations = Vec::with_capacity(built.len());
    for (op, payload) in built {
        if let Some(data) = payload {
            payloads.insert(op.path().clone(), data);
        }
        operations.push(op);
    }

    let manifest = Manifest::new(mode, operations)?;
    let patch = Patch { manifest, payloads };
    let summary = patch.summary();
    info!(
        %mode,
        added = summary.files_added,
        modified = summary.files_modified,
        deleted = summary.files_deleted,
        unchanged = summary.files_unchanged,
        payload_bytes = summary.payload_bytes,
        "diff complete"
    );
    Ok(patch)
}

/// A file in one tree sitting where the other tree has a directory.
fn check_type_conflicts(base: &TreeScan, target: &TreeScan) -> Result<()> {
    let base_dirs = directory_set(base);
    let target_dirs = directory_set(target);

    if let Some(path) = base.paths().find(|p| target_dirs.contains(p.as_str())) {
        return Err(Error::TypeConflict {
            path: path.to_string(),
            expected: NodeKind::File,
            found: NodeKind::Directory,
        });
    }
    if let Some(path) = target.paths().find(|p| base_dirs.contains(p.as_str())) {
        return Err(Error::TypeConflict {
            path: path.to_string(),
            expected: NodeKind::Directory,
            found: NodeKind::File,
        });
    }
    Ok(())
}

fn directory_set(scan: &TreeScan) -> BTreeSet<&str> {
    scan.paths().flat_map(|p| p.ancestors()).collect()
}

fn merge_join(base: &[PathEntry], target: &[PathEntry]) -> Result<Vec<Classified>> {
    let mut out = Vec::with_capacity(base.len().max(target.len()));
    let (mut i, mut j) = (0, 0);

    loop {
        let order = match (base.get(i), target.get(j)) {
            (None, None) => break,
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some(b), Some(t)) => b.path.cmp(&t.path),
        };
        let classified = match order {
            Ordering::Less => {
                let b = &base[i];
                i += 1;
                Classified::Deleted(b.path.clone(), present(b)?)
            }
            Ordering::Greater => {
                let t = &target[j];
                j += 1;
                Classified::Added(t.path.clone(), present(t)?)
            }
            Ordering::Equal => {
                let (b, t) = (&base[i], &target[j]);
                i += 1;
                j += 1;
                let (bf, tf) = (present(b)?, present(t)?);
                if bf == tf {
                    Classified::Unchanged(t.path.clone(), tf)
                } else {
                    Classified::Modified(t.path.clone(), bf, tf)
                }
            }
        };
        out.push(classified);
    }
    Ok(out)
}

fn present(entry: &PathEntry) -> Result<Fingerprint> {
    entry.fingerprint().ok_or_else(|| {
        Error::corrupt(format!("scan produced an absent entry for {}", entry.path))
    })
}

fn build_operation(
    classified: Classified,
    base_root: &Path,
    target_root: &Path,
    mode: DiffMode,
    codec: &dyn DeltaCodec,
) -> Result<(Operation, Option<Vec<u8>>)> {
    match classified {
        Classified::Added(path, target) => {
            let data = read_expected(target_root, &path, target)?;
            debug!(%path, bytes = data.len(), "add");
            Ok((Operation::Add { path, target }, Some(data)))
        }
        Classified::Deleted(path, base) => {
            debug!(%path, "delete");
            Ok((Operation::Delete { path, base }, None))
        }
        Classified::Unchanged(path, fingerprint) => {
            Ok((Operation::Unchanged { path, fingerprint }, None))
        }
        Classified::Modified(path, base, target) => {
            let payload = match mode {
                DiffMode::File => read_expected(target_root, &path, target)?,
                DiffMode::Binary => {
                    let base_path = path.to_native(base_root);
                    let target_path = path.to_native(target_root);
                    util::with_file_bytes(&base_path, |old| -> Result<Vec<u8>> {
                        util::with_file_bytes(&target_path, |new| -> Result<Vec<u8>> {
                            check_unchanged(&path, base, old)?;
                            check_unchanged(&path, target, new)?;
                            codec.delta(old, new).map_err(|source| Error::Codec {
                                path: path.to_string(),
                                source,
                            })
                        })?
                    })??
                }
            };
            debug!(%path, payload = payload.len(), "modify");
            Ok((Operation::Modify { path, base, target }, Some(payload)))
        }
    }
}

/// Read a file whose fingerprint was taken earlier in this run, failing if it
/// changed underneath us.
fn read_expected(root: &Path, path: &RelPath, expected: Fingerprint) -> Result<Vec<u8>> {
    let full = path.to_native(root);
    let data = std::fs::read(&full).map_err(|e| Error::io(&full, "read", e))?;
    check_unchanged(path, expected, &data)?;
    Ok(data)
}

fn check_unchanged(path: &RelPath, expected: Fingerprint, data: &[u8]) -> Result<()> {
    let actual = Fingerprint::of(data);
    if actual != expected {
        return Err(Error::mismatch(
            path.as_str(),
            "file changed during diff",
            expected,
            actual,
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BlockCodec;
    use crate::patch_format::{OpKind, PayloadSource};
    use tempfile::TempDir;

    fn tree(files: &[(&str, &[u8])]) -> TempDir {
        let temp = TempDir::new().unwrap();
        for (rel, content) in files {
            let full = temp.path().join(rel);
            std::fs::create_dir_all(full.parent().unwrap()).unwrap();
            std::fs::write(full, content).unwrap();
        }
        temp
    }

    fn diff(base: &TempDir, target: &TempDir, mode: DiffMode) -> Result<Patch> {
        let base = TreeScan::open(base.path())?;
        let target = TreeScan::open(target.path())?;
        diff_trees(&base, &target, mode, &BlockCodec::default())
    }

    fn kinds(patch: &Patch) -> Vec<(String, OpKind)> {
        patch
            .manifest
            .operations()
            .iter()
            .map(|op| (op.path().to_string(), op.kind()))
            .collect()
    }

    #[test]
    fn test_classifies_in_lexicographic_order() {
        let base = tree(&[("a.txt", b"hello"), ("b.txt", b"world")]);
        let target = tree(&[("a.txt", b"hello!"), ("c.txt", b"new")]);
        let patch = diff(&base, &target, DiffMode::Binary).unwrap();
        assert_eq!(
            kinds(&patch),
            vec![
                ("a.txt".to_string(), OpKind::Modify),
                ("b.txt".to_string(), OpKind::Delete),
                ("c.txt".to_string(), OpKind::Add),
            ]
        );
        let c = RelPath::new("c.txt").unwrap();
        assert_eq!(patch.payloads.payload(&c).unwrap().as_ref(), b"new");
        assert_eq!(patch.payloads.len(), 2);
    }

    #[test]
    fn test_file_mode_payload_is_full_content() {
        let base = tree(&[("cfg.json", b"{\"v\":1}")]);
        let target = tree(&[("cfg.json", b"{\"v\":2}")]);
        let patch = diff(&base, &target, DiffMode::File).unwrap();
        let path = RelPath::new("cfg.json").unwrap();
        assert_eq!(patch.payloads.get(&path).unwrap(), b"{\"v\":2}");
    }

    #[test]
    fn test_binary_mode_payload_is_codec_delta() {
        let old: Vec<u8> = (0..64 * 1024u32).map(|i| (i % 253) as u8).collect();
        let mut new = old.clone();
        new[100] ^= 0xFF;
        let base = tree(&[("big.bin", &old)]);
        let target = tree(&[("big.bin", &new)]);
        let patch = diff(&base, &target, DiffMode::Binary).unwrap();
        let path = RelPath::new("big.bin").unwrap();
        let delta = patch.payloads.get(&path).unwrap();
        assert!(delta.len() < new.len() / 4);
        assert_eq!(BlockCodec::default().reconstruct(&old, delta).unwrap(), new);
    }

    #[test]
    fn test_identical_trees_are_all_unchanged() {
        let files: &[(&str, &[u8])] = &[("a", b"1"), ("sub/b", b"2"), ("empty", b"")];
        let patch = diff(&tree(files), &tree(files), DiffMode::Binary).unwrap();
        assert!(patch.manifest.is_noop());
        assert_eq!(patch.manifest.operations().len(), 3);
        assert!(patch.payloads.is_empty());
    }

    #[test]
    fn test_file_becoming_directory_is_type_conflict() {
        let base = tree(&[("lib", b"file")]);
        let target = tree(&[("lib/mod.rs", b"dir now")]);
        let err = diff(&base, &target, DiffMode::Binary).unwrap_err();
        assert!(matches!(
            err,
            Error::TypeConflict {
                expected: NodeKind::File,
                found: NodeKind::Directory,
                ..
            }
        ));

        let err = diff(&target, &base, DiffMode::Binary).unwrap_err();
        assert!(matches!(err, Error::TypeConflict { .. }));
    }

    #[test]
    fn test_diff_is_deterministic() {
        let base = tree(&[("x/1", b"one"), ("x/2", b"two"), ("y", b"why")]);
        let target = tree(&[("x/1", b"uno"), ("y", b"why"), ("z", b"zed")]);
        let first = diff(&base, &target, DiffMode::Binary).unwrap();
        let second = diff(&base, &target, DiffMode::Binary).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_binary_modify_rejects_file_changed_since_scan() {
        let base = tree(&[("data.bin", b"base content")]);
        let target = tree(&[("data.bin", b"target content")]);
        let path = RelPath::new("data.bin").unwrap();
        let scanned_base = Fingerprint::of(b"base content");
        let scanned_target = Fingerprint::of(b"target content");
        let codec = BlockCodec::default();

        std::fs::write(base.path().join("data.bin"), b"rewritten after scan").unwrap();
        let err = build_operation(
            Classified::Modified(path.clone(), scanned_base, scanned_target),
            base.path(),
            target.path(),
            DiffMode::Binary,
            &codec,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::PatchMismatch {
                check: "file changed during diff",
                ..
            }
        ));

        std::fs::write(base.path().join("data.bin"), b"base content").unwrap();
        std::fs::write(target.path().join("data.bin"), b"also rewritten").unwrap();
        let err = build_operation(
            Classified::Modified(path, scanned_base, scanned_target),
            base.path(),
            target.path(),
            DiffMode::Binary,
            &codec,
        )
        .unwrap_err();
        assert!(matches!(err, Error::PatchMismatch { .. }));
    }
}
