//! Install mode: apply a merge manifest to a target tree in place.
//!
//! Every file's application is independent, so the manifest entries run in
//! parallel. Per-file problems never abort the run; they are collected into
//! the report so the caller (or operator) can decide retry/skip/abort per
//! file, exactly once each.

use anyhow::{Context, Result};
use rayon::prelude::*;
use std::fmt;
use std::path::Path;
use tracing::debug;

use crate::engine::PatchEngine;
use crate::manifest::MergeManifest;
use crate::model::{FileIdentity, PatchOutcome, VerifyFailure};
use crate::repo::PatchRepository;
use crate::util;

pub struct InstallReport {
    pub files_unchanged: usize,
    pub files_patched: usize,
    pub issues: Vec<FileIssue>,
}

impl InstallReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

/// One file that could not be brought to its target version.
pub struct FileIssue {
    pub identity: FileIdentity,
    pub kind: IssueKind,
}

pub enum IssueKind {
    /// No stored diff for this transition; the file differs from the
    /// target but the repository has nothing for it.
    NoPatchAvailable,
    /// The on-disk file matches no known source version.
    SourceMismatch { expected: String, actual: String },
    /// The stored patch was corrupt or produced the wrong bytes.
    VerificationFailed(VerifyFailure),
    /// Reading or writing the file itself failed.
    Io(String),
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IssueKind::NoPatchAvailable => f.write_str("no patch available for this transition"),
            IssueKind::SourceMismatch { expected, actual } => {
                write!(f, "source mismatch: expected {expected}, found {actual}")
            }
            IssueKind::VerificationFailed(failure) => write!(f, "verification failed: {failure}"),
            IssueKind::Io(detail) => write!(f, "i/o error: {detail}"),
        }
    }
}

enum FileResult {
    Unchanged,
    Patched,
    Issue(IssueKind),
}

/// Apply `manifest` against the installation at `target_root`, in place.
/// Files are patched independently and in parallel; the repository is
/// read-only throughout.
pub async fn apply_manifest(
    target_root: &Path,
    repo: &PatchRepository,
    manifest: MergeManifest,
) -> Result<InstallReport> {
    let target_root = target_root
        .canonicalize()
        .with_context(|| format!("Failed to canonicalize target: {}", target_root.display()))?;

    let repo_root = repo.root().to_path_buf();
    let results = tokio::task::spawn_blocking(move || {
        let repo = PatchRepository::open(repo_root);
        let engine = PatchEngine::new(&repo);

        manifest
            .entries
            .par_iter()
            .map(|entry| {
                let result = apply_entry(&engine, &target_root, entry);
                (entry.identity.clone(), result)
            })
            .collect::<Vec<_>>()
    })
    .await?;

    let mut report = InstallReport {
        files_unchanged: 0,
        files_patched: 0,
        issues: Vec::new(),
    };
    for (identity, result) in results {
        match result {
            FileResult::Unchanged => report.files_unchanged += 1,
            FileResult::Patched => report.files_patched += 1,
            FileResult::Issue(kind) => report.issues.push(FileIssue { identity, kind }),
        }
    }

    Ok(report)
}

fn apply_entry(
    engine: &PatchEngine<'_>,
    target_root: &Path,
    entry: &crate::manifest::ManifestEntry,
) -> FileResult {
    let full = target_root.join(entry.identity.relative_path());

    // Scope the mmap so it is dropped before we write back to the same
    // file. On Windows, writing to a file with an open mapping is an error
    // (os error 1224).
    let (outcome, already_at_target) = {
        let source = match util::mmap_file(&full) {
            Ok(mmap) => mmap,
            Err(e) => return FileResult::Issue(IssueKind::Io(format!("{e:#}"))),
        };
        let outcome = match engine.apply(&entry.identity, &source, &entry.target) {
            Ok(outcome) => outcome,
            Err(e) => return FileResult::Issue(IssueKind::Io(format!("{e:#}"))),
        };
        // The engine's direct-copy shortcut is the only path where Applied
        // hands back the input bytes verbatim. Detect it from the file's
        // actual state, not the manifest entry: a file already brought to
        // its target version earlier must count as unchanged on a re-run.
        let already_at_target = matches!(
            &outcome,
            PatchOutcome::Applied { bytes } if bytes[..] == source[..]
        );
        (outcome, already_at_target)
    };

    match outcome {
        PatchOutcome::Applied { bytes } => {
            if already_at_target {
                debug!(file = %entry.identity, "already at target version");
                return FileResult::Unchanged;
            }
            if let Err(e) = std::fs::write(&full, &bytes) {
                return FileResult::Issue(IssueKind::Io(format!(
                    "failed to write patched file {}: {e}",
                    full.display()
                )));
            }
            FileResult::Patched
        }
        PatchOutcome::NoPatchAvailable => FileResult::Issue(IssueKind::NoPatchAvailable),
        PatchOutcome::SourceMismatch { expected, actual } => {
            FileResult::Issue(IssueKind::SourceMismatch {
                expected: expected.to_string(),
                actual: actual.to_string(),
            })
        }
        PatchOutcome::VerificationFailed { failure } => {
            FileResult::Issue(IssueKind::VerificationFailed(failure))
        }
    }
}
