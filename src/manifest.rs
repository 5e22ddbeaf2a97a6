//! Merge manifest: the list of what the merged product should contain,
//! one entry per file present in both product trees, carrying the source
//! and desired target checksums the engine needs.
//!
//! Same framing as the repository payloads and for the same reason:
//! magic header, then zstd-compressed bincode.

use std::io::Write;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::checksum::ContentChecksum;
use crate::model::FileIdentity;
use crate::util;

pub const MANIFEST_MAGIC: &[u8; 8] = b"MRGMAN01";
pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
pub struct MergeManifest {
    pub version: u32,
    pub entries: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub identity: FileIdentity,
    pub source: ContentChecksum,
    pub target: ContentChecksum,
}

impl ManifestEntry {
    /// True when this file is identical in both products and needs no
    /// transformation at all.
    pub fn is_unchanged(&self) -> bool {
        self.source == self.target
    }
}

impl MergeManifest {
    pub fn new(entries: Vec<ManifestEntry>) -> Self {
        Self {
            version: MANIFEST_VERSION,
            entries,
        }
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        let encoded = bincode::serialize(self).context("Failed to serialize manifest")?;
        let compressed =
            zstd::bulk::compress(&encoded, 3).context("Failed to compress manifest")?;

        let mut file = std::fs::File::create(path)
            .with_context(|| format!("Failed to create manifest file: {}", path.display()))?;
        file.write_all(MANIFEST_MAGIC)?;
        file.write_all(&compressed)?;
        file.flush()?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let raw = util::mmap_file(path)?;

        if raw.len() < MANIFEST_MAGIC.len() || &raw[..MANIFEST_MAGIC.len()] != MANIFEST_MAGIC {
            bail!("Invalid manifest file: missing magic header");
        }

        let decoder = zstd::Decoder::new(&raw[MANIFEST_MAGIC.len()..])
            .context("Failed to create zstd decoder")?;
        let manifest: MergeManifest =
            bincode::deserialize_from(decoder).context("Failed to deserialize manifest")?;

        if manifest.version != MANIFEST_VERSION {
            bail!(
                "Unsupported manifest version: {} (expected {})",
                manifest.version,
                MANIFEST_VERSION
            );
        }

        Ok(manifest)
    }
}
