use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// A normalized relative path inside a tree.
///
/// Always slash-separated, never empty, never absolute, and free of `.`/`..`
/// components. Ordering is byte-wise on the string, which is the order every
/// manifest is kept in.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RelPath(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid relative path {path:?}: {reason}")]
pub struct InvalidPath {
    pub path: String,
    pub reason: &'static str,
}

impl RelPath {
    pub fn new(path: impl Into<String>) -> Result<Self, InvalidPath> {
        let path = path.into();
        let reason = if path.is_empty() {
            Some("empty path")
        } else if path.starts_with('/') {
            Some("absolute path")
        } else if path.contains('\\') {
            Some("backslash in path")
        } else if path.contains('\0') {
            Some("NUL byte in path")
        } else if path
            .split('/')
            .any(|c| c.is_empty() || c == "." || c == "..")
        {
            Some("empty, '.' or '..' component")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(InvalidPath { path, reason }),
            None => Ok(Self(path)),
        }
    }

    /// Build from a path relative to a scan root, joining components with `/`.
    pub fn from_relative(relative: &Path) -> Result<Self, InvalidPath> {
        let mut parts = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => match part.to_str() {
                    Some(s) => parts.push(s),
                    None => {
                        return Err(InvalidPath {
                            path: relative.to_string_lossy().into_owned(),
                            reason: "non-UTF-8 path",
                        })
                    }
                },
                _ => {
                    return Err(InvalidPath {
                        path: relative.to_string_lossy().into_owned(),
                        reason: "not a plain relative path",
                    })
                }
            }
        }
        Self::new(parts.join("/"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Resolve against a root directory using native separators.
    pub fn to_native(&self, root: &Path) -> PathBuf {
        let mut full = root.to_path_buf();
        full.extend(self.0.split('/'));
        full
    }

    /// Proper ancestors, outermost first: `a/b/c` yields `a`, `a/b`.
    pub fn ancestors(&self) -> impl Iterator<Item = &str> {
        self.0
            .match_indices('/')
            .map(move |(idx, _)| &self.0[..idx])
    }
}

impl fmt::Display for RelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RelPath {
    type Error = InvalidPath;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RelPath> for String {
    fn from(value: RelPath) -> Self {
        value.0
    }
}
