//! Content-addressed binary patch repository and application engine.
//!
//! Authoring mode builds a repository of checksum-keyed diffs between two
//! product trees plus a merge manifest; install mode applies that manifest
//! to an existing installation, verifying every file before and after.

pub mod build;
pub mod checksum;
pub mod delta;
pub mod engine;
pub mod install;
pub mod manifest;
pub mod model;
pub mod repo;
pub mod rolling_hash;
pub mod util;

pub use build::{build_repository, BuildSummary, PatchBuilder};
pub use checksum::{ContentChecksum, DigestAlgorithm};
pub use delta::{DeltaError, DeltaPayload};
pub use engine::PatchEngine;
pub use install::{apply_manifest, FileIssue, InstallReport, IssueKind};
pub use manifest::{ManifestEntry, MergeManifest};
pub use model::{FileIdentity, PatchKey, PatchOutcome, PatchRecord, VerifyFailure};
pub use repo::{PatchRepository, RepoError};
