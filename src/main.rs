use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use packpatch::fsload;
use packpatch::{
    apply, compile, diff, ByteStore, Digest, Drift, FsStore, GovernanceRecord, PatchDocument,
    Snapshot,
};

const GOVERNANCE_KEY: &str = "governance.json";
const LOCKED_BYTES_KEY: &str = "locked.zip";

#[derive(Parser)]
#[command(name = "packpatch", about = "Deterministic pack diff/patch/lock tool")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a deterministic pack archive from a directory
    Pack {
        /// Directory to snapshot
        #[arg(long)]
        dir: PathBuf,
        /// Project identifier recorded in the manifest
        #[arg(long, default_value = "pack")]
        project_id: String,
        /// Output path for the archive
        #[arg(long, short)]
        output: PathBuf,
    },
    /// Diff a base against a proposal and optionally compile a patch document
    Diff {
        /// Base: a directory or a pack archive
        #[arg(long)]
        base: PathBuf,
        /// Proposal: a directory or a pack archive
        #[arg(long)]
        proposal: PathBuf,
        /// Project identifier for sides loaded from directories
        #[arg(long, default_value = "pack")]
        project_id: String,
        /// Write a compiled patch document to this path
        #[arg(long)]
        patch: Option<PathBuf>,
        /// Summary recorded in the patch document
        #[arg(long, default_value = "")]
        summary: String,
    },
    /// Apply a patch document to a base archive
    Apply {
        /// Base pack archive
        #[arg(long)]
        base: PathBuf,
        /// Patch document (JSON)
        #[arg(long, short)]
        patch: PathBuf,
        /// Output path for the patched archive
        #[arg(long, short)]
        output: PathBuf,
    },
    /// Lock an archive as truth, recording provenance
    Lock {
        /// Archive to lock
        #[arg(long)]
        archive: PathBuf,
        /// Per-project state directory
        #[arg(long)]
        state: PathBuf,
        /// Archive the locked one was derived from (defaults to the archive itself)
        #[arg(long)]
        base_zip: Option<PathBuf>,
    },
    /// Unlock the project (the lock record stays as history)
    Unlock {
        /// Per-project state directory
        #[arg(long)]
        state: PathBuf,
    },
    /// Check the archive against the last lock record
    Drift {
        /// Currently stored archive
        #[arg(long)]
        archive: PathBuf,
        /// Per-project state directory
        #[arg(long)]
        state: PathBuf,
    },
}

/// Load one diff side: a pack archive if the path is a file, otherwise a
/// directory tree.
fn load_side(path: &Path, project_id: &str) -> Result<Snapshot> {
    if path.is_file() {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read archive: {}", path.display()))?;
        Ok(Snapshot::parse(&bytes)?)
    } else {
        let files = fsload::load_tree(path)?;
        Ok(Snapshot::from_files(project_id, files)?)
    }
}

fn load_governance(store: &FsStore) -> Result<GovernanceRecord> {
    match store.get(GOVERNANCE_KEY)? {
        Some(bytes) => Ok(GovernanceRecord::from_json(&bytes)?),
        None => Ok(GovernanceRecord::new()),
    }
}

fn save_governance(store: &mut FsStore, record: &GovernanceRecord) -> Result<()> {
    store
        .set(GOVERNANCE_KEY, record.to_json().as_bytes())
        .context("Failed to persist governance record")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Pack {
            dir,
            project_id,
            output,
        } => {
            println!("Packing...");
            println!("  Dir: {}", dir.display());
            println!("  Output: {}", output.display());

            let start = Instant::now();
            let files = fsload::load_tree(&dir)?;
            let snapshot = Snapshot::from_files(&project_id, files)?;
            let bytes = snapshot.to_archive_bytes()?;
            std::fs::write(&output, &bytes)
                .with_context(|| format!("Failed to write archive: {}", output.display()))?;
            let elapsed = start.elapsed();

            println!("\nPack created!");
            println!("  Files: {}", snapshot.len());
            println!("  Pack hash: {}", snapshot.pack_hash());
            println!("  Archive hash: {}", Digest::of(&bytes));
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
        }
        Commands::Diff {
            base,
            proposal,
            project_id,
            patch,
            summary,
        } => {
            let start = Instant::now();

            // Load both sides concurrently
            let base_path = base.clone();
            let proposal_path = proposal.clone();
            let base_id = project_id.clone();
            let proposal_id = project_id.clone();
            let (base_snap, proposal_snap) = tokio::try_join!(
                tokio::task::spawn_blocking(move || load_side(&base_path, &base_id)),
                tokio::task::spawn_blocking(move || load_side(&proposal_path, &proposal_id)),
            )?;
            let base_snap = base_snap?;
            let proposal_snap = proposal_snap?;

            let report = diff(&base_snap, &proposal_snap);
            let elapsed = start.elapsed();

            print!("{}", report.full_patch_text);
            println!();
            println!(
                "  {} added, {} removed, {} modified, {} unchanged",
                report.stats.added,
                report.stats.removed,
                report.stats.modified,
                report.stats.unchanged
            );
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());

            if let Some(patch_path) = patch {
                let doc = compile(&base_snap, &proposal_snap, &report, &summary);
                std::fs::write(&patch_path, doc.to_json()).with_context(|| {
                    format!("Failed to write patch document: {}", patch_path.display())
                })?;
                println!("  Patch document: {}", patch_path.display());
            }
        }
        Commands::Apply {
            base,
            patch,
            output,
        } => {
            println!("Applying patch...");
            println!("  Base: {}", base.display());
            println!("  Patch: {}", patch.display());

            let start = Instant::now();
            let base_bytes = std::fs::read(&base)
                .with_context(|| format!("Failed to read base archive: {}", base.display()))?;
            let base_snap = Snapshot::parse(&base_bytes)?;
            let patch_bytes = std::fs::read(&patch)
                .with_context(|| format!("Failed to read patch document: {}", patch.display()))?;
            let doc = PatchDocument::from_json(&patch_bytes)?;

            match apply(&base_snap, &doc) {
                Ok(next) => {
                    let bytes = next.to_archive_bytes()?;
                    std::fs::write(&output, &bytes).with_context(|| {
                        format!("Failed to write archive: {}", output.display())
                    })?;
                    let elapsed = start.elapsed();

                    println!("\nPatch applied!");
                    println!("  Ops: {}", doc.ops.len());
                    println!("  Pack hash: {}", next.pack_hash());
                    println!("  Output: {}", output.display());
                    println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
                }
                Err(rejection) => {
                    eprintln!("\nPatch rejected; base left untouched.");
                    for failure in &rejection.failures {
                        eprintln!("  {failure}");
                    }
                    bail!("{} precondition failure(s)", rejection.failures.len());
                }
            }
        }
        Commands::Lock {
            archive,
            state,
            base_zip,
        } => {
            let bytes = std::fs::read(&archive)
                .with_context(|| format!("Failed to read archive: {}", archive.display()))?;
            let snapshot = Snapshot::parse(&bytes)?;
            // Truth gets the strict treatment.
            snapshot.validate_manifest(true)?;

            let base_zip_sha256 = match base_zip {
                Some(path) => {
                    let base_bytes = std::fs::read(&path).with_context(|| {
                        format!("Failed to read base archive: {}", path.display())
                    })?;
                    Digest::of(&base_bytes)
                }
                None => Digest::of(&bytes),
            };

            let mut store = FsStore::new(&state);
            let mut record = load_governance(&store)?;
            record.lock(&snapshot, &bytes, base_zip_sha256);
            store
                .set(LOCKED_BYTES_KEY, &bytes)
                .context("Failed to persist locked bytes")?;
            save_governance(&mut store, &record)?;

            println!("Locked.");
            println!("  Pack hash: {}", snapshot.pack_hash());
            println!("  State: {}", state.display());
        }
        Commands::Unlock { state } => {
            let mut store = FsStore::new(&state);
            let mut record = load_governance(&store)?;
            record.unlock();
            save_governance(&mut store, &record)?;
            println!("Unlocked. Lock history retained.");
        }
        Commands::Drift { archive, state } => {
            let bytes = std::fs::read(&archive)
                .with_context(|| format!("Failed to read archive: {}", archive.display()))?;
            let store = FsStore::new(&state);
            let record = load_governance(&store)?;

            match record.check_drift(&bytes)? {
                Drift::None => println!("No drift: archive matches the lock record."),
                Drift::Metadata { expected, actual } => {
                    println!("Metadata drift: content matches but the archive bytes differ.");
                    println!("  Recorded zip hash: {expected}");
                    println!("  Current zip hash:  {actual}");
                    println!("  Re-lock to refresh the recorded metadata.");
                }
                Drift::Content { expected, actual } => {
                    eprintln!("Content drift: the locked artifact changed after locking.");
                    eprintln!("  Recorded pack hash: {expected}");
                    eprintln!("  Current pack hash:  {actual}");
                    bail!("treat as real drift");
                }
            }
        }
    }

    Ok(())
}
