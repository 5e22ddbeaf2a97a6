//! Per-file patch application state machine.
//!
//! One call walks a single file through load -> identify -> lookup ->
//! apply -> verify and produces exactly one terminal [`PatchOutcome`].
//! The engine never retries internally; retry, skip, and abort are the
//! caller's explicit decisions.

use tracing::{debug, warn};

use crate::checksum::ContentChecksum;
use crate::delta::DeltaPayload;
use crate::model::{FileIdentity, PatchKey, PatchOutcome, VerifyFailure};
use crate::repo::{PatchRepository, RepoError};

pub struct PatchEngine<'a> {
    repo: &'a PatchRepository,
}

impl<'a> PatchEngine<'a> {
    pub fn new(repo: &'a PatchRepository) -> Self {
        Self { repo }
    }

    /// Transform `source` into the version identified by `desired_target`.
    ///
    /// Separating identification (can we find a patch) from application
    /// (did it run) from verification (did it produce the right bytes)
    /// lets the caller tell a corrupted repository entry apart from a
    /// corrupted base installation.
    ///
    /// `Err` is reserved for repository I/O faults; every expected outcome
    /// of the state machine is a [`PatchOutcome`] variant.
    pub fn apply(
        &self,
        identity: &FileIdentity,
        source: &[u8],
        desired_target: &ContentChecksum,
    ) -> Result<PatchOutcome, RepoError> {
        let source_sum = ContentChecksum::compute(source);

        // Direct-copy shortcut: the file already matches the target, so no
        // transformation is needed and the repository is never consulted.
        if source_sum == *desired_target {
            debug!(file = %identity, "source already matches target");
            return Ok(PatchOutcome::Applied {
                bytes: source.to_vec(),
            });
        }

        let key = PatchKey::new(identity.clone(), source_sum.clone(), desired_target.clone());
        let record = match self.repo.lookup(&key)? {
            Some(record) => record,
            None => {
                debug!(file = %identity, "no patch for this transition");
                return Ok(PatchOutcome::NoPatchAvailable);
            }
        };

        let Some(raw_payload) = record.data else {
            // Known source version with a deliberately omitted diff.
            debug!(file = %identity, "entry exists but carries no diff");
            return Ok(PatchOutcome::NoPatchAvailable);
        };

        // The lookup key embeds the source checksum, so a metadata mismatch
        // should be unreachable under a correct repository. If observed,
        // refuse to apply.
        if record.metadata != source_sum {
            warn!(file = %identity, "record metadata disagrees with computed source checksum");
            return Ok(PatchOutcome::SourceMismatch {
                expected: record.metadata,
                actual: source_sum,
            });
        }

        let payload = match DeltaPayload::decode(&raw_payload) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(file = %identity, error = %e, "patch payload failed to decode");
                return Ok(PatchOutcome::VerificationFailed {
                    failure: VerifyFailure::CorruptPayload {
                        detail: e.to_string(),
                    },
                });
            }
        };

        // Tamper check against the checksum embedded in the payload body.
        // A foreign digest algorithm means "unknown version", not mismatch.
        if !payload.source.same_algorithm(&source_sum) {
            debug!(file = %identity, "payload uses an unknown digest algorithm");
            return Ok(PatchOutcome::NoPatchAvailable);
        }
        if payload.source != source_sum {
            warn!(file = %identity, "payload header names a different source version");
            return Ok(PatchOutcome::SourceMismatch {
                expected: payload.source,
                actual: source_sum,
            });
        }

        let candidate = match payload.apply(source) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(file = %identity, error = %e, "patch payload failed to apply");
                return Ok(PatchOutcome::VerificationFailed {
                    failure: VerifyFailure::CorruptPayload {
                        detail: e.to_string(),
                    },
                });
            }
        };

        // Verify against the caller-supplied target checksum, not anything
        // stored in the record: one source may map to several targets
        // depending on install configuration.
        let candidate_sum = ContentChecksum::compute(&candidate);
        if candidate_sum == *desired_target {
            debug!(file = %identity, "patch applied and verified");
            Ok(PatchOutcome::Applied { bytes: candidate })
        } else {
            warn!(
                file = %identity,
                expected = %desired_target,
                actual = %candidate_sum,
                "patched bytes failed verification"
            );
            Ok(PatchOutcome::VerificationFailed {
                failure: VerifyFailure::TargetMismatch {
                    expected: desired_target.clone(),
                    actual: candidate_sum,
                },
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::PatchBuilder;
    use crate::model::PatchRecord;

    fn identity() -> FileIdentity {
        FileIdentity::new("data", "sample.esm")
    }

    fn repo_in(dir: &tempfile::TempDir) -> PatchRepository {
        PatchRepository::open(dir.path())
    }

    #[test]
    fn test_identity_shortcut_skips_repository() {
        // Repository root does not even exist; the shortcut must not care.
        let repo = PatchRepository::open("/nonexistent/repo/root");
        let engine = PatchEngine::new(&repo);
        let source = b"unchanged contents";
        let target_sum = ContentChecksum::compute(source);

        let outcome = engine.apply(&identity(), source, &target_sum).unwrap();
        match outcome {
            PatchOutcome::Applied { bytes } => assert_eq!(bytes, source),
            other => panic!("expected Applied, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_patch_reports_no_patch_available() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repo_in(&dir);
        let engine = PatchEngine::new(&repo);

        let source = b"version one".to_vec();
        let target_sum = ContentChecksum::compute(b"version two");

        let outcome = engine.apply(&identity(), &source, &target_sum).unwrap();
        assert!(matches!(outcome, PatchOutcome::NoPatchAvailable));
        // Source buffer untouched.
        assert_eq!(source, b"version one");
    }

    #[test]
    fn test_build_then_apply_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repo_in(&dir);
        let builder = PatchBuilder::new(&repo);
        let engine = PatchEngine::new(&repo);

        let source = b"AAAA";
        let target = b"AAAB";
        let key = builder.build(&identity(), source, target).unwrap();

        let outcome = engine.apply(&identity(), source, &key.target).unwrap();
        match outcome {
            PatchOutcome::Applied { bytes } => assert_eq!(bytes, target),
            other => panic!("expected Applied, got {other:?}"),
        }

        // Same diff, same source, second time: no hidden state.
        let outcome = engine.apply(&identity(), source, &key.target).unwrap();
        match outcome {
            PatchOutcome::Applied { bytes } => assert_eq!(bytes, target),
            other => panic!("expected Applied, got {other:?}"),
        }
    }

    #[test]
    fn test_deliberately_omitted_diff() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repo_in(&dir);
        let engine = PatchEngine::new(&repo);

        let source = b"excluded from merge";
        let source_sum = ContentChecksum::compute(source);
        let target_sum = ContentChecksum::compute(b"whatever the merge would hold");

        let key = PatchKey::new(identity(), source_sum.clone(), target_sum.clone());
        repo.store(
            &key,
            &PatchRecord {
                metadata: source_sum,
                data: None,
            },
        )
        .unwrap();

        let outcome = engine.apply(&identity(), source, &target_sum).unwrap();
        assert!(matches!(outcome, PatchOutcome::NoPatchAvailable));
    }

    #[test]
    fn test_corrupt_payload_is_verification_failure() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repo_in(&dir);
        let engine = PatchEngine::new(&repo);

        let source = b"plain source";
        let source_sum = ContentChecksum::compute(source);
        let target_sum = ContentChecksum::compute(b"plain target");
        let key = PatchKey::new(identity(), source_sum.clone(), target_sum.clone());

        repo.store(
            &key,
            &PatchRecord {
                metadata: source_sum,
                data: Some(b"garbage, not a payload".to_vec()),
            },
        )
        .unwrap();

        let outcome = engine.apply(&identity(), source, &target_sum).unwrap();
        match outcome {
            PatchOutcome::VerificationFailed {
                failure: VerifyFailure::CorruptPayload { .. },
            } => {}
            other => panic!("expected CorruptPayload, got {other:?}"),
        }
    }

    #[test]
    fn test_flipped_payload_byte_never_silently_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repo_in(&dir);
        let builder = PatchBuilder::new(&repo);
        let engine = PatchEngine::new(&repo);

        let source = vec![0x11u8; 9000];
        let mut target = source.clone();
        target[4500] = 0x99;
        let key = builder.build(&identity(), &source, &target).unwrap();

        // Flip one byte of the stored payload on disk.
        let entry = repo.entry_path(&key);
        let mut bytes = std::fs::read(&entry).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        std::fs::write(&entry, &bytes).unwrap();

        let outcome = engine.apply(&identity(), &source, &key.target).unwrap();
        assert!(
            matches!(outcome, PatchOutcome::VerificationFailed { .. }),
            "corruption must surface as VerificationFailed, got {outcome:?}"
        );
    }

    #[test]
    fn test_wrong_source_version_finds_no_patch() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repo_in(&dir);
        let builder = PatchBuilder::new(&repo);
        let engine = PatchEngine::new(&repo);

        let target = b"the merged version";
        let key = builder.build(&identity(), b"the real source", target).unwrap();

        // A tampered base file hashes differently, so the lookup key misses.
        let outcome = engine
            .apply(&identity(), b"a tampered source", &key.target)
            .unwrap();
        assert!(matches!(outcome, PatchOutcome::NoPatchAvailable));
    }

    #[test]
    fn test_payload_under_wrong_key_reports_source_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repo_in(&dir);
        let builder = PatchBuilder::new(&repo);
        let engine = PatchEngine::new(&repo);

        let real_source = b"the real source bytes";
        let target = b"the merged target bytes";
        let key = builder.build(&identity(), real_source, target).unwrap();
        let payload_bytes = std::fs::read(repo.entry_path(&key)).unwrap();

        // Copy the valid payload to the address of a different source
        // version, as if a repository entry had been misplaced.
        let other_source = b"a different source version";
        let other_sum = ContentChecksum::compute(other_source);
        let wrong_key = PatchKey::new(identity(), other_sum.clone(), key.target.clone());
        repo.store(
            &wrong_key,
            &PatchRecord {
                metadata: other_sum.clone(),
                data: Some(payload_bytes),
            },
        )
        .unwrap();

        // The payload header names the real source, so the engine refuses
        // to apply instead of failing verification late.
        let outcome = engine
            .apply(&identity(), other_source, &key.target)
            .unwrap();
        match outcome {
            PatchOutcome::SourceMismatch { expected, actual } => {
                assert_eq!(expected, ContentChecksum::compute(real_source));
                assert_eq!(actual, other_sum);
            }
            other => panic!("expected SourceMismatch, got {other:?}"),
        }
    }
}
