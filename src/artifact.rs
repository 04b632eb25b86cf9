//! Patch Writer and Patch Reader: the single-file artifact format.
//!
//! ```text
//! offset  size  field
//! 0       8     magic "DIRPATCH"
//! 8       4     format version (u32 LE)
//! 12      1     diff mode (0 = binary, 1 = file)
//! 13      8     operation table length N (u64 LE)
//! 21      N     zstd(bincode(Vec<Record>))
//! 21+N    ...   payloads, concatenated in manifest order
//! ```
//!
//! Each record carries its payload's offset (relative to the payload region),
//! stored length, encoding and BLAKE3 checksum of the stored bytes.

use bincode::Options;
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::codec::DEFAULT_COMPRESSION_LEVEL;
use crate::error::{Error, Result};
use crate::patch_format::{
    DiffMode, Fingerprint, Manifest, OpKind, Operation, Patch, PayloadSource, Payloads,
    FORMAT_VERSION, MAGIC, PATCH_EXTENSION,
};
use crate::path::RelPath;
use crate::util;

const HEADER_LEN: usize = 21;
/// Payloads smaller than this are always stored as-is.
const MIN_COMPRESS_LEN: usize = 64;
/// Largest decompressed operation table the reader will accept.
const MAX_TABLE_LEN: u64 = 256 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadEncoding {
    Stored,
    Zstd,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct PayloadRef {
    offset: u64,
    len: u64,
    encoding: PayloadEncoding,
    checksum: [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Record {
    path: RelPath,
    kind: OpKind,
    base: Option<Fingerprint>,
    target: Option<Fingerprint>,
    payload: Option<PayloadRef>,
}

fn table_options() -> impl Options {
    bincode::options().with_fixint_encoding()
}

#[derive(Debug, Clone, Copy)]
pub struct PatchWriter {
    compression_level: i32,
}

impl Default for PatchWriter {
    fn default() -> Self {
        Self {
            compression_level: DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

impl PatchWriter {
    pub fn new(compression_level: i32) -> Self {
        Self { compression_level }
    }

    /// Serialize `manifest` and the payloads it references into artifact bytes.
    pub fn to_bytes(&self, manifest: &Manifest, payloads: &dyn PayloadSource) -> Result<Vec<u8>> {
        let mut records = Vec::with_capacity(manifest.operations().len());
        let mut region: Vec<u8> = Vec::new();

        for op in manifest.operations() {
            let payload = if op.has_payload() {
                let raw = payloads.payload(op.path())?;
                let (encoding, stored) = self.encode_payload(manifest.mode, op, &raw)?;
                let reference = PayloadRef {
                    offset: region.len() as u64,
                    len: stored.len() as u64,
                    encoding,
                    checksum: util::hash_bytes(&stored),
                };
                region.extend_from_slice(&stored);
                Some(reference)
            } else {
                None
            };
            records.push(record_for(op, payload));
        }

        let encoded = table_options()
            .serialize(&records)
            .map_err(|e| Error::corrupt(format!("failed to encode operation table: {e}")))?;
        let table = zstd::bulk::compress(&encoded, self.compression_level)
            .map_err(|e| Error::corrupt(format!("failed to compress operation table: {e}")))?;

        let mut out = Vec::with_capacity(HEADER_LEN + table.len() + region.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&manifest.version.to_le_bytes());
        out.push(manifest.mode.to_byte());
        out.extend_from_slice(&(table.len() as u64).to_le_bytes());
        out.extend_from_slice(&table);
        out.extend_from_slice(&region);
        Ok(out)
    }

    /// Write the artifact to `path` atomically. Returns the artifact size.
    pub fn write_file(
        &self,
        manifest: &Manifest,
        payloads: &dyn PayloadSource,
        path: &Path,
    ) -> Result<u64> {
        let bytes = self.to_bytes(manifest, payloads)?;
        util::write_atomic(path, &bytes)?;
        debug!(path = %path.display(), bytes = bytes.len(), "wrote patch artifact");
        Ok(bytes.len() as u64)
    }

    fn encode_payload<'a>(
        &self,
        mode: DiffMode,
        op: &Operation,
        raw: &'a [u8],
    ) -> Result<(PayloadEncoding, Cow<'a, [u8]>)> {
        // Binary deltas come out of the codec already compressed.
        let is_delta = mode == DiffMode::Binary && op.kind() == OpKind::Modify;
        if is_delta || raw.len() < MIN_COMPRESS_LEN || util::is_incompressible(op.path().as_str())
        {
            return Ok((PayloadEncoding::Stored, Cow::Borrowed(raw)));
        }
        let compressed = zstd::bulk::compress(raw, self.compression_level)
            .map_err(|e| Error::io(op.path().as_str(), "compress payload of", e))?;
        if compressed.len() < raw.len() {
            Ok((PayloadEncoding::Zstd, Cow::Owned(compressed)))
        } else {
            Ok((PayloadEncoding::Stored, Cow::Borrowed(raw)))
        }
    }
}

fn record_for(op: &Operation, payload: Option<PayloadRef>) -> Record {
    let path = op.path().clone();
    let kind = op.kind();
    match *op {
        Operation::Add { target, .. } => Record {
            path,
            kind,
            base: None,
            target: Some(target),
            payload,
        },
        Operation::Modify { base, target, .. } => Record {
            path,
            kind,
            base: Some(base),
            target: Some(target),
            payload,
        },
        Operation::Delete { base, .. } => Record {
            path,
            kind,
            base: Some(base),
            target: None,
            payload,
        },
        Operation::Unchanged { fingerprint, .. } => Record {
            path,
            kind,
            base: Some(fingerprint),
            target: None,
            payload,
        },
    }
}

/// Where one payload lives inside the artifact bytes.
#[derive(Debug, Clone, Copy)]
struct Span {
    start: usize,
    len: usize,
    encoding: PayloadEncoding,
    checksum: [u8; 32],
    /// Upper bound on the decoded size: the target fingerprint's size.
    decoded_limit: u64,
}

enum Backing {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl Backing {
    fn bytes(&self) -> &[u8] {
        match self {
            Backing::Mapped(mmap) => &mmap[..],
            Backing::Owned(bytes) => bytes.as_slice(),
        }
    }
}

/// A parsed artifact: the manifest plus lazy, checksum-verified payload access.
pub struct PatchReader {
    manifest: Manifest,
    spans: BTreeMap<RelPath, Span>,
    backing: Backing,
}

impl std::fmt::Debug for PatchReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatchReader")
            .field("manifest", &self.manifest)
            .field("payloads", &self.spans.len())
            .finish()
    }
}

impl PatchReader {
    /// Memory-map and parse an artifact file.
    pub fn open(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| Error::io(path, "open patch", e))?;
        let len = file
            .metadata()
            .map_err(|e| Error::io(path, "read metadata of", e))?
            .len();
        if len == 0 {
            return Err(Error::corrupt("truncated header: artifact is empty"));
        }
        let mmap = util::map_file(&file, path)?;
        Self::parse(Backing::Mapped(mmap))
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        Self::parse(Backing::Owned(bytes))
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn mode(&self) -> DiffMode {
        self.manifest.mode
    }

    pub fn version(&self) -> u32 {
        self.manifest.version
    }

    /// Stored (possibly compressed) size of a path's payload.
    pub fn stored_len(&self, path: &RelPath) -> Option<usize> {
        self.spans.get(path).map(|s| s.len)
    }

    pub fn stored_payload_bytes(&self) -> u64 {
        self.spans.values().map(|s| s.len as u64).sum()
    }

    /// Decode every payload into memory.
    pub fn into_patch(self) -> Result<Patch> {
        let mut payloads = Payloads::new();
        for path in self.spans.keys() {
            payloads.insert(path.clone(), self.payload(path)?.into_owned());
        }
        Ok(Patch {
            manifest: self.manifest,
            payloads,
        })
    }

    fn parse(backing: Backing) -> Result<Self> {
        let bytes = backing.bytes();
        if bytes.len() < MAGIC.len() || &bytes[..MAGIC.len()] != MAGIC {
            return Err(Error::corrupt("bad magic: not a dirpatch artifact"));
        }
        if bytes.len() < HEADER_LEN {
            return Err(Error::corrupt(format!(
                "truncated header: {} of {HEADER_LEN} bytes",
                bytes.len()
            )));
        }

        let version = u32::from_le_bytes(read_array(&bytes[8..12]));
        if version != FORMAT_VERSION {
            return Err(Error::corrupt(format!(
                "unsupported format version {version} (expected {FORMAT_VERSION})"
            )));
        }
        let mode = DiffMode::from_byte(bytes[12])
            .ok_or_else(|| Error::corrupt(format!("unknown diff mode byte {}", bytes[12])))?;
        let table_len = u64::from_le_bytes(read_array(&bytes[13..21]));
        let available = (bytes.len() - HEADER_LEN) as u64;
        if table_len > available {
            return Err(Error::corrupt(format!(
                "operation table length {table_len} overruns artifact ({available} bytes after header)"
            )));
        }
        let payload_start = HEADER_LEN + table_len as usize;

        let table = util::zstd_decode_bounded(&bytes[HEADER_LEN..payload_start], MAX_TABLE_LEN)
            .map_err(|e| Error::corrupt(format!("undecodable operation table: {e}")))?;
        let records: Vec<Record> = table_options()
            .with_limit(table.len() as u64)
            .deserialize(&table)
            .map_err(|e| Error::corrupt(format!("undecodable operation table: {e}")))?;

        let region_len = bytes.len() - payload_start;
        let mut operations = Vec::with_capacity(records.len());
        let mut spans = BTreeMap::new();
        let mut expected_offset: u64 = 0;
        let mut previous: Option<&RelPath> = None;

        for record in &records {
            if let Some(prev) = previous {
                if prev == &record.path {
                    return Err(Error::corrupt(format!("duplicate path {}", record.path)));
                }
                if prev > &record.path {
                    return Err(Error::corrupt(format!(
                        "path {} is out of order after {prev}",
                        record.path
                    )));
                }
            }
            previous = Some(&record.path);

            let operation = operation_from(record)?;

            if let Some(payload) = &record.payload {
                if payload.encoding == PayloadEncoding::Zstd
                    && mode == DiffMode::Binary
                    && record.kind == OpKind::Modify
                {
                    return Err(Error::corrupt(format!(
                        "delta payload for {} is zstd-encoded",
                        record.path
                    )));
                }
                if payload.offset != expected_offset {
                    return Err(Error::corrupt(format!(
                        "payload for {} starts at offset {}, expected {expected_offset}",
                        record.path, payload.offset
                    )));
                }
                let end = payload
                    .offset
                    .checked_add(payload.len)
                    .filter(|end| *end <= region_len as u64)
                    .ok_or_else(|| {
                        Error::corrupt(format!(
                            "payload for {} ({} bytes at offset {}) overruns the {region_len}-byte payload region",
                            record.path, payload.len, payload.offset
                        ))
                    })?;
                spans.insert(
                    record.path.clone(),
                    Span {
                        start: payload_start + payload.offset as usize,
                        len: payload.len as usize,
                        encoding: payload.encoding,
                        checksum: payload.checksum,
                        decoded_limit: operation.target_fingerprint().map_or(0, |fp| fp.size),
                    },
                );
                expected_offset = end;
            }
            operations.push(operation);
        }

        if expected_offset != region_len as u64 {
            return Err(Error::corrupt(format!(
                "{} trailing bytes after the last payload",
                region_len as u64 - expected_offset
            )));
        }

        let manifest = Manifest::new(mode, operations)?;
        debug!(
            version,
            %mode,
            operations = manifest.operations().len(),
            payloads = spans.len(),
            "parsed patch artifact"
        );
        Ok(Self {
            manifest,
            spans,
            backing,
        })
    }
}

fn read_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

fn operation_from(record: &Record) -> Result<Operation> {
    let path = record.path.clone();
    let missing = |what: &str| {
        Error::corrupt(format!(
            "{} record for {} is missing its {what}",
            record.kind, record.path
        ))
    };
    let unexpected = |what: &str| {
        Error::corrupt(format!(
            "{} record for {} carries an unexpected {what}",
            record.kind, record.path
        ))
    };

    let wants_payload = matches!(record.kind, OpKind::Add | OpKind::Modify);
    match (&record.payload, wants_payload) {
        (None, true) => return Err(missing("payload")),
        (Some(_), false) => return Err(unexpected("payload")),
        _ => {}
    }

    Ok(match record.kind {
        OpKind::Add => {
            if record.base.is_some() {
                return Err(unexpected("base fingerprint"));
            }
            Operation::Add {
                path,
                target: record.target.ok_or_else(|| missing("target fingerprint"))?,
            }
        }
        OpKind::Modify => Operation::Modify {
            path,
            base: record.base.ok_or_else(|| missing("base fingerprint"))?,
            target: record.target.ok_or_else(|| missing("target fingerprint"))?,
        },
        OpKind::Delete | OpKind::Unchanged => {
            if record.target.is_some() {
                return Err(unexpected("target fingerprint"));
            }
            let base = record.base.ok_or_else(|| missing("base fingerprint"))?;
            if record.kind == OpKind::Delete {
                Operation::Delete { path, base }
            } else {
                Operation::Unchanged {
                    path,
                    fingerprint: base,
                }
            }
        }
    })
}

impl PayloadSource for PatchReader {
    fn payload(&self, path: &RelPath) -> Result<Cow<'_, [u8]>> {
        let span = self
            .spans
            .get(path)
            .ok_or_else(|| Error::corrupt(format!("no payload for {path}")))?;
        let stored = &self.backing.bytes()[span.start..span.start + span.len];
        let actual = util::hash_bytes(stored);
        if actual != span.checksum {
            return Err(Error::mismatch(
                path.as_str(),
                "payload checksum",
                util::short_hex(&span.checksum),
                util::short_hex(&actual),
            ));
        }
        match span.encoding {
            PayloadEncoding::Stored => Ok(Cow::Borrowed(stored)),
            PayloadEncoding::Zstd => util::zstd_decode_bounded(stored, span.decoded_limit)
                .map(Cow::Owned)
                .map_err(|e| Error::corrupt(format!("payload for {path} does not decompress: {e}"))),
        }
    }
}

/// Patch artifacts (`*_patch.dpatch`) directly inside `dir`, sorted by name.
pub fn discover_patches(dir: &Path) -> Result<Vec<PathBuf>> {
    let suffix = format!("_patch.{PATCH_EXTENSION}");
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(|e| Error::io(dir, "list", e))? {
        let entry = entry.map_err(|e| Error::io(dir, "list", e))?;
        let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
        if is_file && entry.file_name().to_string_lossy().ends_with(&suffix) {
            found.push(entry.path());
        }
    }
    found.sort();
    Ok(found)
}

/// `<target>_patch.dpatch`, placed next to the target directory.
pub fn default_output_for(target: &Path) -> PathBuf {
    let resolved = target
        .canonicalize()
        .unwrap_or_else(|_| target.to_path_buf());
    let name = resolved
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "tree".to_string());
    let dir = resolved.parent().map(Path::to_path_buf).unwrap_or_default();
    dir.join(format!("{name}_patch.{PATCH_EXTENSION}"))
}

/// `<stem>_revert.dpatch` beside the artifact it undoes.
pub fn revert_path_for(artifact: &Path) -> PathBuf {
    let stem = artifact
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "patch".to_string());
    artifact.with_file_name(format!("{stem}_revert.{PATCH_EXTENSION}"))
}
