//! Tree Scanner: ordered, fingerprinted listings of the regular files under a root.
//!
//! Directories are implied by file paths and never listed on their own.
//! Symbolic links, sockets, FIFOs and devices are skipped with a warning;
//! links are never followed.

use rayon::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{Error, NodeKind, Result};
use crate::patch_format::Fingerprint;
use crate::path::RelPath;
use crate::util;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathState {
    Absent,
    File(Fingerprint),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathEntry {
    pub path: RelPath,
    pub state: PathState,
}

impl PathEntry {
    pub fn exists(&self) -> bool {
        matches!(self.state, PathState::File(_))
    }

    pub fn fingerprint(&self) -> Option<Fingerprint> {
        match self.state {
            PathState::File(fp) => Some(fp),
            PathState::Absent => None,
        }
    }
}

#[derive(Debug, Clone)]
struct Listed {
    path: RelPath,
    size: u64,
}

/// The sorted file listing of one tree. Fingerprints are computed on demand.
#[derive(Debug, Clone)]
pub struct TreeScan {
    root: PathBuf,
    files: Vec<Listed>,
}

impl TreeScan {
    /// List every regular file under `root`, sorted byte-wise by relative path.
    pub fn open(root: &Path) -> Result<Self> {
        let meta = std::fs::metadata(root).map_err(|e| Error::Scan {
            root: root.to_path_buf(),
            reason: e.to_string(),
        })?;
        if !meta.is_dir() {
            return Err(Error::Scan {
                root: root.to_path_buf(),
                reason: "not a directory".into(),
            });
        }
        let root = root.canonicalize().map_err(|e| Error::Scan {
            root: root.to_path_buf(),
            reason: e.to_string(),
        })?;

        let mut files = Vec::new();
        for entry in WalkDir::new(&root).min_depth(1).follow_links(false) {
            let entry = entry.map_err(|e| {
                let path = e
                    .path()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| root.clone());
                match e.into_io_error() {
                    Some(source) => Error::io(path, "read directory entry", source),
                    None => Error::Scan {
                        root: root.clone(),
                        reason: format!("filesystem loop at {}", path.display()),
                    },
                }
            })?;

            let file_type = entry.file_type();
            if file_type.is_dir() {
                continue;
            }
            if !file_type.is_file() {
                warn!(path = %entry.path().display(), "skipping symlink or special file");
                continue;
            }

            let relative = entry
                .path()
                .strip_prefix(&root)
                .map_err(|_| Error::Scan {
                    root: root.clone(),
                    reason: format!("{} escapes the root", entry.path().display()),
                })?;
            let path = RelPath::from_relative(relative).map_err(|e| Error::Scan {
                root: root.clone(),
                reason: e.to_string(),
            })?;
            let size = entry
                .metadata()
                .map_err(|e| Error::Scan {
                    root: root.clone(),
                    reason: format!("metadata of {}: {e}", entry.path().display()),
                })?
                .len();
            files.push(Listed { path, size });
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        debug!(root = %root.display(), files = files.len(), "listed tree");
        Ok(Self { root, files })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Relative paths in scan order, without touching file contents.
    pub fn paths(&self) -> impl Iterator<Item = &RelPath> {
        self.files.iter().map(|f| &f.path)
    }

    /// Sum of listed file sizes as seen at listing time.
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    /// Lazily fingerprint each file in order. Each call starts from the first path.
    pub fn entries(&self) -> impl Iterator<Item = Result<PathEntry>> + '_ {
        self.files.iter().map(move |f| self.fingerprint(&f.path))
    }

    /// Fingerprint the whole listing in parallel, preserving scan order.
    pub fn fingerprint_all(&self) -> Result<Vec<PathEntry>> {
        self.files
            .par_iter()
            .map(|f| self.fingerprint(&f.path))
            .collect()
    }

    fn fingerprint(&self, path: &RelPath) -> Result<PathEntry> {
        let (size, hash) = util::hash_file_streaming(&path.to_native(&self.root))?;
        Ok(PathEntry {
            path: path.clone(),
            state: PathState::File(Fingerprint { size, hash }),
        })
    }
}

/// Inspect a single path in a live tree without reading it fully.
///
/// Returns `Absent` when nothing is there and a `TypeConflict` when a
/// directory or special file occupies the path or one of its ancestors.
pub fn probe(root: &Path, path: &RelPath) -> Result<PathEntry> {
    check_ancestors(root, path)?;
    let full = path.to_native(root);
    let kind = node_kind(&full)?;
    let state = match kind {
        None => PathState::Absent,
        Some(NodeKind::File) => {
            let (size, hash) = util::hash_file_streaming(&full)?;
            PathState::File(Fingerprint { size, hash })
        }
        Some(found) => {
            return Err(Error::TypeConflict {
                path: path.to_string(),
                expected: NodeKind::File,
                found,
            })
        }
    };
    Ok(PathEntry {
        path: path.clone(),
        state,
    })
}

/// Every ancestor of `path` under `root` must be a real directory or absent.
/// A symlinked ancestor would resolve outside the root.
pub fn check_ancestors(root: &Path, path: &RelPath) -> Result<()> {
    for ancestor in path.ancestors() {
        let mut full = root.to_path_buf();
        full.extend(ancestor.split('/'));
        match node_kind(&full)? {
            None => break,
            Some(NodeKind::Directory) => {}
            Some(found) => {
                return Err(Error::TypeConflict {
                    path: ancestor.to_string(),
                    expected: NodeKind::Directory,
                    found,
                })
            }
        }
    }
    Ok(())
}

/// What occupies `full`, without following symlinks. `None` if nothing does.
pub fn node_kind(full: &Path) -> Result<Option<NodeKind>> {
    match std::fs::symlink_metadata(full) {
        Ok(meta) => {
            let ft = meta.file_type();
            Ok(Some(if ft.is_file() {
                NodeKind::File
            } else if ft.is_dir() {
                NodeKind::Directory
            } else {
                NodeKind::Special
            }))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        // A file where a parent directory should be also means "nothing here".
        Err(e) if e.kind() == std::io::ErrorKind::NotADirectory => Ok(None),
        Err(e) => Err(Error::io(full, "inspect", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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

    #[test]
    fn test_listing_is_byte_wise_sorted() {
        let temp = tree(&[("a/b", b"1"), ("a.txt", b"2"), ("B", b"3"), ("a/a", b"4")]);
        std::fs::create_dir_all(temp.path().join("empty/dir")).unwrap();
        let scan = TreeScan::open(temp.path()).unwrap();
        let paths: Vec<&str> = scan.paths().map(RelPath::as_str).collect();
        assert_eq!(paths, vec!["B", "a.txt", "a/a", "a/b"]);
    }

    #[test]
    fn test_scanning_twice_is_identical() {
        let temp = tree(&[("x/y.bin", &[1, 2, 3]), ("z", b""), ("m.txt", b"hello")]);
        let scan = TreeScan::open(temp.path()).unwrap();
        let lazy: Vec<PathEntry> = scan.entries().collect::<Result<_>>().unwrap();
        let again: Vec<PathEntry> = scan.entries().collect::<Result<_>>().unwrap();
        let parallel = TreeScan::open(temp.path()).unwrap().fingerprint_all().unwrap();
        assert_eq!(lazy, again);
        assert_eq!(lazy, parallel);
        assert_eq!(lazy[2].fingerprint(), Some(Fingerprint::of(b"")));
    }

    #[test]
    fn test_bad_roots() {
        let temp = tree(&[("file.txt", b"x")]);
        assert!(matches!(
            TreeScan::open(&temp.path().join("missing")),
            Err(Error::Scan { .. })
        ));
        assert!(matches!(
            TreeScan::open(&temp.path().join("file.txt")),
            Err(Error::Scan { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_are_skipped() {
        let temp = tree(&[("real.txt", b"x")]);
        std::os::unix::fs::symlink(temp.path().join("real.txt"), temp.path().join("link.txt"))
            .unwrap();
        let scan = TreeScan::open(temp.path()).unwrap();
        let paths: Vec<&str> = scan.paths().map(RelPath::as_str).collect();
        assert_eq!(paths, vec!["real.txt"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_ancestor_is_type_conflict() {
        let temp = tree(&[("inside.txt", b"x")]);
        let outside = tree(&[("secret.txt", b"s")]);
        std::os::unix::fs::symlink(outside.path(), temp.path().join("link")).unwrap();

        let err = probe(temp.path(), &RelPath::new("link/secret.txt").unwrap()).unwrap_err();
        match err {
            Error::TypeConflict { path, found, .. } => {
                assert_eq!(path, "link");
                assert_eq!(found, NodeKind::Special);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_probe_states() {
        let temp = tree(&[("dir/file", b"abc")]);
        let file = probe(temp.path(), &RelPath::new("dir/file").unwrap()).unwrap();
        assert_eq!(file.fingerprint(), Some(Fingerprint::of(b"abc")));

        let missing = probe(temp.path(), &RelPath::new("nope/file").unwrap()).unwrap();
        assert!(!missing.exists());

        let err = probe(temp.path(), &RelPath::new("dir/file/child").unwrap()).unwrap_err();
        assert!(matches!(
            err,
            Error::TypeConflict {
                expected: NodeKind::Directory,
                found: NodeKind::File,
                ..
            }
        ));

        let err = probe(temp.path(), &RelPath::new("dir").unwrap()).unwrap_err();
        assert!(matches!(
            err,
            Error::TypeConflict {
                found: NodeKind::Directory,
                ..
            }
        ));
    }
}
