use std::fmt;

use serde::{Deserialize, Serialize};

use crate::checksum::ContentChecksum;

/// Logical identity of a file within its product tree, independent of the
/// root install directory. `prefix` is the relative directory (empty for
/// files at the product root) using forward slashes; `name` is the base
/// file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileIdentity {
    pub prefix: String,
    pub name: String,
}

impl FileIdentity {
    pub fn new(prefix: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            name: name.into(),
        }
    }

    /// Split a forward-slash relative path into (prefix, name).
    pub fn from_relative(path: &str) -> Self {
        match path.rsplit_once('/') {
            Some((prefix, name)) => Self::new(prefix, name),
            None => Self::new("", path),
        }
    }

    /// Reassemble the forward-slash relative path.
    pub fn relative_path(&self) -> String {
        if self.prefix.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.prefix, self.name)
        }
    }
}

impl fmt::Display for FileIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.relative_path())
    }
}

/// Composite address of one stored diff: which file, from which source
/// version, to which target version. Constructed transiently per lookup or
/// store; it is never persisted as an object, only encoded into the
/// repository's entry path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchKey {
    pub identity: FileIdentity,
    pub source: ContentChecksum,
    pub target: ContentChecksum,
}

impl PatchKey {
    pub fn new(identity: FileIdentity, source: ContentChecksum, target: ContentChecksum) -> Self {
        Self {
            identity,
            source,
            target,
        }
    }
}

/// A stored patch: the checksum of the source version it applies to, and the
/// diff payload. An absent payload means "known source, deliberately no
/// diff" (e.g. a file excluded from the merge), which the engine reports as
/// no patch available.
#[derive(Debug, Clone)]
pub struct PatchRecord {
    pub metadata: ContentChecksum,
    pub data: Option<Vec<u8>>,
}

/// Terminal result of one file-application attempt. Produced exactly once
/// per engine call; the caller decides retry/skip/abort.
#[derive(Debug)]
pub enum PatchOutcome {
    /// The file now matches the desired target; carries the verified bytes.
    Applied { bytes: Vec<u8> },
    /// No repository entry exists for this (identity, source, target), or the
    /// entry deliberately carries no diff. Expected for most files in a tree.
    NoPatchAvailable,
    /// The file on disk does not match any known source version. Indicates a
    /// corrupted or previously-modified base installation; not retryable
    /// without replacing the source file.
    SourceMismatch {
        expected: ContentChecksum,
        actual: ContentChecksum,
    },
    /// The stored patch failed to produce the desired bytes.
    VerificationFailed { failure: VerifyFailure },
}

/// Why verification failed, so a corrupted repository entry and a wrong
/// result never look the same to the operator.
#[derive(Debug, Clone)]
pub enum VerifyFailure {
    /// The payload itself is malformed (bad magic, truncated, out-of-range
    /// copy). Retryable if the repository on disk might be damaged.
    CorruptPayload { detail: String },
    /// The patch applied cleanly but produced bytes whose checksum differs
    /// from the desired target.
    TargetMismatch {
        expected: ContentChecksum,
        actual: ContentChecksum,
    },
}

impl fmt::Display for VerifyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyFailure::CorruptPayload { detail } => {
                write!(f, "corrupt patch data: {}", detail)
            }
            VerifyFailure::TargetMismatch { expected, actual } => {
                write!(f, "patched bytes hash to {} but {} was expected", actual, expected)
            }
        }
    }
}
