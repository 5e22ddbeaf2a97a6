use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Instant;

use mergepatch::{apply_manifest, build_repository, MergeManifest, PatchRepository};

#[derive(Parser)]
#[command(name = "mergepatch", about = "Checksum-verified binary patch repository builder and applier")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the patch repository and merge manifest from two product trees
    Build {
        /// Path to the old (installed) product tree
        #[arg(long)]
        old: PathBuf,
        /// Path to the new (merged) product tree
        #[arg(long)]
        new: PathBuf,
        /// Root directory of the patch repository to populate
        #[arg(long)]
        repo: PathBuf,
        /// Output path for the merge manifest
        #[arg(long, short)]
        manifest: PathBuf,
    },
    /// Apply a merge manifest to a target installation, in place
    Apply {
        /// Path to the target installation to patch
        #[arg(long)]
        target: PathBuf,
        /// Root directory of the patch repository
        #[arg(long)]
        repo: PathBuf,
        /// Path to the merge manifest
        #[arg(long, short)]
        manifest: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Build {
            old,
            new,
            repo,
            manifest,
        } => {
            println!("Building patch repository...");
            println!("  Old: {}", old.display());
            println!("  New: {}", new.display());
            println!("  Repository: {}", repo.display());
            println!("  Manifest: {}", manifest.display());

            let repo = PatchRepository::open(repo);

            let start = Instant::now();
            let summary = build_repository(&old, &new, &repo, &manifest).await?;
            let elapsed = start.elapsed();

            println!("\nRepository built successfully!");
            println!("  Patches built: {}", summary.patches_built);
            println!("  Files unchanged: {}", summary.files_unchanged);
            println!("  Files only in new tree (skipped): {}", summary.files_only_in_new);
            println!("  Files only in old tree (skipped): {}", summary.files_only_in_old);
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
        }
        Commands::Apply {
            target,
            repo,
            manifest,
        } => {
            println!("Applying merge manifest...");
            println!("  Target: {}", target.display());
            println!("  Repository: {}", repo.display());
            println!("  Manifest: {}", manifest.display());

            let repo = PatchRepository::open(repo);
            let manifest = MergeManifest::read_from(&manifest)?;

            let start = Instant::now();
            let report = apply_manifest(&target, &repo, manifest).await?;
            let elapsed = start.elapsed();

            println!("\nManifest applied.");
            println!("  Files already at target: {}", report.files_unchanged);
            println!("  Files patched: {}", report.files_patched);
            println!("  Files with issues: {}", report.issues.len());
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());

            if !report.is_clean() {
                for issue in &report.issues {
                    eprintln!("  {}: {}", issue.identity, issue.kind);
                }
                anyhow::bail!("{} file(s) could not be patched", report.issues.len());
            }
        }
    }

    Ok(())
}
