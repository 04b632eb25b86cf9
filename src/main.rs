use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Instant;

use dirpatch::artifact::{self, PatchReader};
use dirpatch::codec::{DEFAULT_BLOCK_SIZE, DEFAULT_COMPRESSION_LEVEL};
use dirpatch::util::human_bytes;
use dirpatch::{logging, CreateOptions, DiffMode, Operation, Summary};

#[derive(Parser)]
#[command(name = "dirpatch", version, about = "Directory tree patch creator and applier")]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a patch that turns the base directory into the target directory
    Create {
        /// Path to the base (original) directory
        #[arg(long)]
        base: PathBuf,
        /// Path to the target (updated) directory
        #[arg(long)]
        target: PathBuf,
        /// Output path for the patch file [default: <target>_patch.dpatch]
        #[arg(long, short)]
        output: Option<PathBuf>,
        /// How modified files are stored
        #[arg(long, value_enum, env = "DIRPATCH_MODE", default_value_t = DiffMode::Binary)]
        mode: DiffMode,
        /// zstd compression level
        #[arg(long, env = "DIRPATCH_LEVEL", default_value_t = DEFAULT_COMPRESSION_LEVEL)]
        level: i32,
        /// Block size for binary deltas
        #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
        block_size: usize,
    },
    /// Apply a patch to a target directory
    Apply {
        /// Path to the target directory to patch
        #[arg(long)]
        target: PathBuf,
        /// Patch file; without it every *_patch.dpatch in the working directory is applied in order
        #[arg(long, short)]
        patch: Option<PathBuf>,
        /// Write a reverse patch that undoes this apply
        #[arg(long)]
        backup: bool,
        /// Where to write the reverse patch [default: <patch>_revert.dpatch]
        #[arg(long, requires = "backup")]
        backup_output: Option<PathBuf>,
    },
    /// Verify that a patch applies cleanly without changing anything
    Check {
        #[arg(long)]
        target: PathBuf,
        #[arg(long, short)]
        patch: PathBuf,
    },
    /// Print a patch's header and operation table
    Inspect {
        #[arg(long, short)]
        patch: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if let Err(e) = logging::init(cli.verbose, cli.quiet) {
        eprintln!("warning: logging disabled: {e}");
    }

    match cli.command {
        Commands::Create {
            base,
            target,
            output,
            mode,
            level,
            block_size,
        } => {
            let output = output.unwrap_or_else(|| artifact::default_output_for(&target));
            println!("Creating patch...");
            println!("  Base: {}", base.display());
            println!("  Target: {}", target.display());
            println!("  Output: {}", output.display());
            println!("  Mode: {mode}");

            let options = CreateOptions {
                mode,
                compression_level: level,
                block_size,
            };
            let start = Instant::now();
            let report = dirpatch::create_patch(&base, &target, &output, &options)
                .await
                .with_context(|| format!("Failed to create patch {}", output.display()))?;
            let elapsed = start.elapsed();

            println!("\nPatch created successfully!");
            print_summary(&report.summary);
            println!("  Patch size: {}", human_bytes(report.artifact_bytes));
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
        }
        Commands::Apply {
            target,
            patch,
            backup,
            backup_output,
        } => {
            let patches = match patch {
                Some(patch) => vec![patch],
                None => {
                    let cwd = std::env::current_dir().context("Failed to read working directory")?;
                    let found = artifact::discover_patches(&cwd)?;
                    if found.is_empty() {
                        bail!("No *_patch.dpatch files found in {}", cwd.display());
                    }
                    found
                }
            };
            if backup_output.is_some() && patches.len() > 1 {
                bail!("--backup-output needs a single --patch");
            }

            if patches.len() > 1 {
                println!("Validating {} patches...", patches.len());
                // Later patches expect the tree the earlier ones produce, so only the first can be
                // checked against the live tree; the rest must at least parse.
                dirpatch::check_patch(&patches[0], &target)
                    .await
                    .with_context(|| format!("Patch {} does not apply", patches[0].display()))?;
                for patch in &patches[1..] {
                    PatchReader::open(patch)
                        .with_context(|| format!("Patch {} is unreadable", patch.display()))?;
                }
            }

            for patch in &patches {
                let reverse_path = backup.then(|| {
                    backup_output
                        .clone()
                        .unwrap_or_else(|| artifact::revert_path_for(patch))
                });
                apply_one(patch, &target, reverse_path.as_deref()).await?;
            }
        }
        Commands::Check { target, patch } => {
            let start = Instant::now();
            let summary = dirpatch::check_patch(&patch, &target)
                .await
                .with_context(|| format!("Patch {} does not apply to {}", patch.display(), target.display()))?;
            println!("Patch applies cleanly.");
            print_summary(&summary);
            println!("  Time elapsed: {:.3}s", start.elapsed().as_secs_f64());
        }
        Commands::Inspect { patch } => {
            let reader = PatchReader::open(&patch)
                .with_context(|| format!("Failed to read patch {}", patch.display()))?;
            inspect(&patch, &reader);
        }
    }

    Ok(())
}

async fn apply_one(patch: &Path, target: &Path, reverse_path: Option<&Path>) -> anyhow::Result<()> {
    println!("Applying patch...");
    println!("  Target: {}", target.display());
    println!("  Patch: {}", patch.display());

    let start = Instant::now();
    match dirpatch::apply_patch(patch, target, reverse_path).await {
        Ok(report) => {
            println!("\nPatch applied successfully!");
            print_summary(&report.summary);
            if let Some((path, _)) = &report.reverse {
                println!("  Reverse patch: {}", path.display());
            }
            println!("  Time elapsed: {:.3}s", start.elapsed().as_secs_f64());
            Ok(())
        }
        Err(failure) => {
            if let Some(path) = &failure.backup {
                eprintln!("Partial reverse patch written to {}", path.display());
            }
            Err(anyhow::Error::new(failure)
                .context(format!("Failed to apply patch {}", patch.display())))
        }
    }
}

fn print_summary(summary: &Summary) {
    println!("  Files added: {}", summary.files_added);
    println!("  Files modified: {}", summary.files_modified);
    println!("  Files deleted: {}", summary.files_deleted);
    println!("  Files unchanged: {}", summary.files_unchanged);
    println!("  Payload bytes: {}", human_bytes(summary.payload_bytes));
}

fn inspect(path: &Path, reader: &PatchReader) {
    let manifest = reader.manifest();
    println!("Patch: {}", path.display());
    println!("  Format version: {}", reader.version());
    println!("  Mode: {}", reader.mode());
    println!("  Operations: {}", manifest.operations().len());
    println!("  Stored payloads: {}", human_bytes(reader.stored_payload_bytes()));
    println!();
    for op in manifest.operations() {
        let detail = match op {
            Operation::Add { target, .. } => format!("-> {target}"),
            Operation::Modify { base, target, .. } => format!("{base} -> {target}"),
            Operation::Delete { base, .. } => format!("{base} ->"),
            Operation::Unchanged { fingerprint, .. } => fingerprint.to_string(),
        };
        let stored = reader
            .stored_len(op.path())
            .map(|len| format!(" [{}]", human_bytes(len as u64)))
            .unwrap_or_default();
        println!("  {:<9} {}  {detail}{stored}", op.kind().to_string(), op.path());
    }
}
