use anyhow::{Context, Result};
use memmap2::Mmap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Forward-slash relative path within the tree, for cross-platform
    /// consistency in manifests and repository addressing.
    pub relative_path: String,
    pub full_path: PathBuf,
    /// File size in bytes. Free from the OS directory scan.
    pub size: u64,
}

/// Walk a product tree and collect every regular file with its relative
/// path. Directories themselves are not recorded; the repository and
/// manifest address files only.
pub fn walk_files(root: &Path) -> Result<Vec<FileEntry>> {
    let root = root
        .canonicalize()
        .with_context(|| format!("Failed to canonicalize path: {}", root.display()))?;

    let mut entries = Vec::new();

    for entry in WalkDir::new(&root).min_depth(1) {
        let entry = entry
            .with_context(|| format!("Failed to read directory entry in {}", root.display()))?;

        if !entry.file_type().is_file() {
            continue;
        }

        let full_path = entry.path().to_path_buf();
        let relative = full_path
            .strip_prefix(&root)
            .with_context(|| "Failed to compute relative path")?;

        let relative_str = relative
            .to_str()
            .with_context(|| format!("Non-UTF8 path: {}", relative.display()))?
            .replace('\\', "/");

        let size = entry
            .metadata()
            .with_context(|| format!("Failed to read metadata: {}", full_path.display()))?
            .len();

        entries.push(FileEntry {
            relative_path: relative_str,
            full_path,
            size,
        });
    }

    Ok(entries)
}

/// Memory-map a file for read-only access.
///
/// # Safety
/// The mapping is read-only. Callers must not concurrently truncate or
/// replace the underlying file while the `Mmap` is live.
pub fn mmap_file(path: &Path) -> Result<Mmap> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open file: {}", path.display()))?;
    // SAFETY: We only read from this mapping; no concurrent modification of these files.
    unsafe {
        Mmap::map(&file).with_context(|| format!("Failed to memory-map file: {}", path.display()))
    }
}
