//! Directory tree diffing and patching.
//!
//! A patch is built by scanning two trees ([`scan`]), classifying every path
//! ([`diff`]) and serializing the resulting [`Manifest`] with its payloads into
//! a single artifact ([`artifact`]). Applying replays the manifest against a
//! live tree ([`apply`]) and can record a reverse patch that undoes it.
//!
//! MODIFY payloads are either full replacement content or a binary delta
//! produced by a [`DeltaCodec`]; the choice is fixed per manifest by
//! [`DiffMode`].

pub mod apply;
pub mod artifact;
pub mod binary_diff;
pub mod binary_patch;
pub mod codec;
pub mod create;
pub mod diff;
pub mod error;
pub mod logging;
pub mod patch_format;
pub mod path;
pub mod rolling_hash;
pub mod scan;
pub mod util;

pub use apply::{apply_patch, check_patch, ApplyEngine, ApplyError, ApplyReport, ReverseBuilder};
pub use artifact::{PatchReader, PatchWriter};
pub use codec::{BlockCodec, DeltaCodec};
pub use create::{create_patch, CreateOptions, CreateReport};
pub use diff::diff_trees;
pub use error::{Error, Result};
pub use patch_format::{
    DiffMode, Fingerprint, Manifest, OpKind, Operation, Patch, PayloadSource, Payloads, Summary,
};
pub use path::RelPath;
pub use scan::TreeScan;
