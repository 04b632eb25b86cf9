use std::path::Path;
use tracing::info;

use crate::artifact::PatchWriter;
use crate::codec::{BlockCodec, DEFAULT_BLOCK_SIZE, DEFAULT_COMPRESSION_LEVEL};
use crate::diff::diff_trees;
use crate::error::Result;
use crate::patch_format::{DiffMode, Summary};
use crate::scan::TreeScan;

/// Knobs for patch creation. Defaults produce binary-mode patches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateOptions {
    pub mode: DiffMode,
    /// zstd level for the operation table and compressible payloads.
    pub compression_level: i32,
    /// Block size for binary deltas.
    pub block_size: usize,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            mode: DiffMode::Binary,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateReport {
    pub summary: Summary,
    /// Size of the written artifact on disk.
    pub artifact_bytes: u64,
}

/// Diff `base_dir` against `target_dir` and write the artifact to `output`.
/// Both trees are listed concurrently; hashing and deltas run on rayon.
pub async fn create_patch(
    base_dir: &Path,
    target_dir: &Path,
    output: &Path,
    options: &CreateOptions,
) -> Result<CreateReport> {
    let base_owned = base_dir.to_path_buf();
    let target_owned = target_dir.to_path_buf();
    let (base, target) = tokio::try_join!(
        tokio::task::spawn_blocking(move || TreeScan::open(&base_owned)),
        tokio::task::spawn_blocking(move || TreeScan::open(&target_owned)),
    )?;
    let (base, target) = (base?, target?);
    info!(
        base = %base.root().display(),
        base_files = base.len(),
        base_bytes = base.total_size(),
        target = %target.root().display(),
        target_files = target.len(),
        target_bytes = target.total_size(),
        "scanned trees"
    );

    let options = *options;
    let output = output.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<CreateReport> {
        let codec = BlockCodec::new(options.block_size, options.compression_level);
        let patch = diff_trees(&base, &target, options.mode, &codec)?;
        let writer = PatchWriter::new(options.compression_level);
        let artifact_bytes = writer.write_file(&patch.manifest, &patch.payloads, &output)?;
        info!(path = %output.display(), bytes = artifact_bytes, "wrote patch");
        Ok(CreateReport {
            summary: patch.summary(),
            artifact_bytes,
        })
    })
    .await?
}
