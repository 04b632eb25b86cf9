use memmap2::Mmap;
use std::io::{Read, Write};
use std::path::Path;

use crate::error::{Error, Result};

/// Run `f` over the contents of a file without copying it into a `Vec`.
///
/// Non-empty files are memory-mapped; empty files are passed as an empty
/// slice since zero-length mappings are rejected on some platforms.
pub fn with_file_bytes<T>(path: &Path, f: impl FnOnce(&[u8]) -> T) -> Result<T> {
    let file = std::fs::File::open(path).map_err(|e| Error::io(path, "open", e))?;
    let len = file
        .metadata()
        .map_err(|e| Error::io(path, "read metadata of", e))?
        .len();
    if len == 0 {
        return Ok(f(&[]));
    }
    let mmap = map_file(&file, path)?;
    Ok(f(&mmap))
}

/// Memory-map an open file for read-only access.
///
/// # Safety
/// The mapping is read-only. Callers must not concurrently truncate or replace
/// the underlying file while the `Mmap` is live.
pub fn map_file(file: &std::fs::File, path: &Path) -> Result<Mmap> {
    // SAFETY: read-only mapping; nothing in this crate modifies a file while it is mapped.
    unsafe { Mmap::map(file) }.map_err(|e| Error::io(path, "memory-map", e))
}

/// Compute the BLAKE3 hash of a byte slice.
pub fn hash_bytes(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Stream-hash a file using BLAKE3, returning its length and digest.
/// Uses a 256 KB BufReader to reduce syscall overhead vs the default 8 KB.
pub fn hash_file_streaming(path: &Path) -> Result<(u64, [u8; 32])> {
    let file = std::fs::File::open(path).map_err(|e| Error::io(path, "open", e))?;
    let mut reader = std::io::BufReader::with_capacity(256 * 1024, file);
    let mut hasher = blake3::Hasher::new();
    let len = std::io::copy(&mut reader, &mut hasher).map_err(|e| Error::io(path, "hash", e))?;
    Ok((len, *hasher.finalize().as_bytes()))
}

/// Returns true for file types that are already compressed or otherwise incompressible,
/// where running them through zstd would yield no meaningful savings.
pub fn is_incompressible(name: &str) -> bool {
    let ext = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    matches!(
        ext.as_deref(),
        Some(
            // Images
            "jpg" | "jpeg" | "png" | "gif" | "webp" | "avif"
            // Video
            | "mp4" | "mkv" | "mov" | "webm" | "m4v"
            // Audio
            | "mp3" | "aac" | "ogg" | "flac" | "opus" | "m4a"
            // Archives
            | "zip" | "gz" | "bz2" | "xz" | "zst" | "7z" | "rar"
            // Office (zip-based containers)
            | "docx" | "xlsx" | "pptx" | "odt" | "ods" | "odp"
            // Fonts
            | "woff" | "woff2"
            // Other
            | "pdf" | "jar" | "dpatch"
        )
    )
}

/// Write `data` to `path` via a temp file in the same directory and a rename,
/// creating parent directories as needed. Readers never observe a partial file.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, "create directory", e))?;

    let mut temp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| Error::io(parent, "create temp file in", e))?;
    temp.write_all(data)
        .map_err(|e| Error::io(temp.path(), "write", e))?;
    temp.as_file()
        .sync_all()
        .map_err(|e| Error::io(temp.path(), "sync", e))?;
    temp.persist(path)
        .map_err(|e| Error::io(path, "replace", e.error))?;
    Ok(())
}

/// Remove directories left empty under `root`, walking up from `start`.
/// Stops at the first non-empty directory and never removes `root` itself.
pub fn prune_empty_dirs(root: &Path, start: &Path) -> Result<usize> {
    let mut removed = 0;
    let mut current = start;
    while current != root && current.starts_with(root) {
        match std::fs::remove_dir(current) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            // Not empty (the exact error kind differs between platforms).
            Err(_) if std::fs::read_dir(current).map(|mut d| d.next().is_some()).unwrap_or(false) => {
                break
            }
            Err(e) => return Err(Error::io(current, "remove directory", e)),
        }
        match current.parent() {
            Some(parent) => current = parent,
            None => break,
        }
    }
    Ok(removed)
}

/// Decompress a zstd stream, failing once the output would exceed `limit` bytes.
pub fn zstd_decode_bounded(data: &[u8], limit: u64) -> std::io::Result<Vec<u8>> {
    let mut decoder = zstd::stream::read::Decoder::with_buffer(data)?;
    let mut out = Vec::new();
    (&mut decoder).take(limit.saturating_add(1)).read_to_end(&mut out)?;
    if out.len() as u64 > limit {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("decompressed size exceeds {limit} bytes"),
        ));
    }
    Ok(out)
}

/// Convert a number of bytes to a human-readable string.
pub fn human_bytes(num: u64) -> String {
    const UNITS: [&str; 5] = ["bytes", "KB", "MB", "GB", "TB"];
    let mut value = num as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{num} bytes")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

/// Short hex rendering of a digest for log and error messages.
pub fn short_hex(hash: &[u8]) -> String {
    hash.iter().take(8).map(|b| format!("{b:02x}")).collect()
}
