//! Authoring mode: building the patch repository and the merge manifest.
//!
//! [`PatchBuilder`] handles one (source, target) pair; [`build_repository`]
//! scans two whole product trees, builds a patch for every changed file,
//! and writes the manifest the install side consumes.

use anyhow::{Context, Result};
use rayon::prelude::*;
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

use crate::checksum::ContentChecksum;
use crate::delta::DeltaPayload;
use crate::manifest::{ManifestEntry, MergeManifest};
use crate::model::{FileIdentity, PatchKey, PatchRecord};
use crate::repo::PatchRepository;
use crate::util;

/// Builds and stores one patch at a time. Shares the key/record data model
/// with the install-time engine but is otherwise independent of it.
pub struct PatchBuilder<'a> {
    repo: &'a PatchRepository,
}

impl<'a> PatchBuilder<'a> {
    pub fn new(repo: &'a PatchRepository) -> Self {
        Self { repo }
    }

    /// Compute both checksums, produce the diff payload, and persist the
    /// record. Returns the key the record was stored under.
    pub fn build(&self, identity: &FileIdentity, source: &[u8], target: &[u8]) -> Result<PatchKey> {
        let payload = if is_incompressible(Path::new(&identity.name)) {
            DeltaPayload::build_whole_file(source, target)
        } else {
            DeltaPayload::build(source, target)
        };
        self.store_payload(identity, payload)
    }

    /// Store an entry whose diff is deliberately omitted: the source
    /// version is known but excluded from the merge.
    pub fn build_excluded(
        &self,
        identity: &FileIdentity,
        source: &[u8],
        target: &ContentChecksum,
    ) -> Result<PatchKey> {
        let source_sum = ContentChecksum::compute(source);
        let key = PatchKey::new(identity.clone(), source_sum.clone(), target.clone());
        let record = PatchRecord {
            metadata: source_sum,
            data: None,
        };
        self.repo
            .store(&key, &record)
            .with_context(|| format!("Failed to store excluded entry for {}", identity))?;
        Ok(key)
    }

    fn store_payload(&self, identity: &FileIdentity, payload: DeltaPayload) -> Result<PatchKey> {
        let key = PatchKey::new(
            identity.clone(),
            payload.source.clone(),
            payload.target.clone(),
        );
        let record = PatchRecord {
            metadata: payload.source.clone(),
            data: Some(payload.encode()?),
        };
        self.repo
            .store(&key, &record)
            .with_context(|| format!("Failed to store patch for {}", identity))?;
        Ok(key)
    }
}

pub struct BuildSummary {
    pub patches_built: usize,
    pub files_unchanged: usize,
    /// Present only in the new tree; no source exists, so out of scope for
    /// the per-file engine and skipped.
    pub files_only_in_new: usize,
    /// Present only in the old tree; dropped from the merged product.
    pub files_only_in_old: usize,
}

/// Returns true for file types that are already compressed or otherwise
/// incompressible, where computing a binary diff would yield no meaningful
/// savings.
fn is_incompressible(path: &Path) -> bool {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    matches!(
        ext.as_deref(),
        Some(
            // Images
            "jpg" | "jpeg" | "png" | "gif" | "bmp" | "webp" | "ico" | "tiff" | "tif" | "avif"
            // Video
            | "mp4" | "mkv" | "avi" | "mov" | "wmv" | "flv" | "webm" | "m4v"
            // Audio
            | "mp3" | "aac" | "ogg" | "flac" | "opus" | "m4a" | "wma"
            // Archives
            | "zip" | "gz" | "bz2" | "xz" | "zst" | "7z" | "rar"
            // Fonts
            | "woff" | "woff2"
            // Other
            | "pdf"
        )
    )
}

/// Scan the old and new product trees, build a patch for every file whose
/// content changed, and write the merge manifest covering every file
/// present in both trees. Files present on only one side are counted and
/// skipped; the engine always needs an existing source.
pub async fn build_repository(
    old_root: &Path,
    new_root: &Path,
    repo: &PatchRepository,
    manifest_path: &Path,
) -> Result<BuildSummary> {
    // Walk both trees concurrently.
    let old_root_owned = old_root.to_path_buf();
    let new_root_owned = new_root.to_path_buf();

    let (old_entries, new_entries) = tokio::try_join!(
        tokio::task::spawn_blocking(move || util::walk_files(&old_root_owned)),
        tokio::task::spawn_blocking(move || util::walk_files(&new_root_owned)),
    )?;
    let old_entries = old_entries?;
    let new_entries = new_entries?;

    let old_map: HashMap<String, usize> = old_entries
        .iter()
        .enumerate()
        .map(|(i, e)| (e.relative_path.clone(), i))
        .collect();

    // Pair up files present in both trees; count the rest.
    struct PairInput {
        identity: FileIdentity,
        old_path: std::path::PathBuf,
        new_path: std::path::PathBuf,
    }

    let mut pairs: Vec<PairInput> = Vec::new();
    let mut files_only_in_new = 0usize;
    for entry in &new_entries {
        match old_map.get(&entry.relative_path) {
            Some(&old_idx) => pairs.push(PairInput {
                identity: FileIdentity::from_relative(&entry.relative_path),
                old_path: old_entries[old_idx].full_path.clone(),
                new_path: entry.full_path.clone(),
            }),
            None => {
                debug!(file = %entry.relative_path, "only in new tree, skipped");
                files_only_in_new += 1;
            }
        }
    }

    let new_paths: std::collections::HashSet<&str> = new_entries
        .iter()
        .map(|e| e.relative_path.as_str())
        .collect();
    let files_only_in_old = old_entries
        .iter()
        .filter(|e| !new_paths.contains(e.relative_path.as_str()))
        .count();

    // Hash every pair, then diff only the changed ones. Rayon inside
    // spawn_blocking, as both stages are CPU- and read-bound.
    struct PairOutput {
        entry: ManifestEntry,
        payload: Option<DeltaPayload>,
    }

    let outputs = tokio::task::spawn_blocking(move || -> Result<Vec<PairOutput>> {
        pairs
            .par_iter()
            .map(|pair| -> Result<PairOutput> {
                let source_sum = ContentChecksum::from_file(&pair.old_path)?;
                let target_sum = ContentChecksum::from_file(&pair.new_path)?;

                let payload = if source_sum == target_sum {
                    None
                } else if is_incompressible(&pair.new_path) {
                    let new_data = util::mmap_file(&pair.new_path)?;
                    let old_data = util::mmap_file(&pair.old_path)?;
                    Some(DeltaPayload::build_whole_file(&old_data, &new_data))
                } else {
                    let old_data = util::mmap_file(&pair.old_path)?;
                    let new_data = util::mmap_file(&pair.new_path)?;
                    Some(DeltaPayload::build(&old_data, &new_data))
                };

                Ok(PairOutput {
                    entry: ManifestEntry {
                        identity: pair.identity.clone(),
                        source: source_sum,
                        target: target_sum,
                    },
                    payload,
                })
            })
            .collect()
    })
    .await??;

    let builder = PatchBuilder::new(repo);
    let mut entries: Vec<ManifestEntry> = Vec::with_capacity(outputs.len());
    let mut patches_built = 0usize;
    let mut files_unchanged = 0usize;

    for output in outputs {
        match output.payload {
            Some(payload) => {
                builder.store_payload(&output.entry.identity, payload)?;
                patches_built += 1;
            }
            None => files_unchanged += 1,
        }
        entries.push(output.entry);
    }

    entries.sort_by(|a, b| a.identity.relative_path().cmp(&b.identity.relative_path()));
    MergeManifest::new(entries).write_to(manifest_path)?;

    Ok(BuildSummary {
        patches_built,
        files_unchanged,
        files_only_in_new,
        files_only_in_old,
    })
}
