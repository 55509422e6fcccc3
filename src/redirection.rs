//! The configuration records the engine is built from.

use std::io;
use std::path::Path;
use std::sync::Arc;

use crate::path;
use crate::pool::StringPool;
use crate::scanner::{self, DirectoryGroup};
use crate::strmap::StrMap;

/// The on-disk destination of a redirect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// The uppercased directory containing the destination.
    ///
    /// Shared between all targets under the same subfolder via the string
    /// pool.
    pub directory: Arc<str>,
    /// The uppercased destination file or directory name.
    pub file_name: Box<str>,
    /// Whether the destination is a directory.
    pub is_directory: bool,
}

impl Target {
    /// The full destination path.
    pub fn full_path(&self) -> String {
        path::join(&self.directory, &self.file_name)
    }
}

/// A single-file redirect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRedirection {
    /// The uppercased path the application asks for.
    pub source: String,
    /// The uppercased path it receives instead.
    pub target: String,
}

impl FileRedirection {
    /// Creates a redirect from raw configuration paths.
    pub fn new(old_path: &str, new_path: &str) -> Self {
        Self {
            source: path::normalize(old_path),
            target: path::normalize(new_path),
        }
    }
}

/// A folder overlay: the contents of `target_folder` layered over
/// `source_folder`.
///
/// Holds the prescanned contents of the target folder, grouped by
/// subfolder, so applying the overlay to a tree never touches the disk.
#[derive(Debug, Clone)]
pub struct FolderRedirection {
    /// The uppercased folder being overlaid.
    pub source_folder: String,
    /// The uppercased folder providing the replacement contents.
    pub target_folder: String,
    /// Subfolder path relative to `target_folder` (empty for the root) to
    /// the targets found there.
    pub subfolder_files: StrMap<Vec<Target>>,
}

// Two registrations of the same folder pair are the same overlay, whatever
// the disk contents were at scan time.
impl PartialEq for FolderRedirection {
    fn eq(&self, other: &Self) -> bool {
        self.source_folder == other.source_folder && self.target_folder == other.target_folder
    }
}

impl Eq for FolderRedirection {}

impl FolderRedirection {
    /// Scans `target_folder` on disk and builds the overlay record.
    pub fn from_disk(
        source_folder: &str,
        target_folder: &str,
        pool: &mut StringPool,
    ) -> io::Result<Self> {
        let groups = scanner::scan_folder(Path::new(target_folder))?;
        Ok(Self::from_groups(source_folder, target_folder, groups, pool))
    }

    /// Builds the overlay record from already-scanned groups.
    pub fn from_groups(
        source_folder: &str,
        target_folder: &str,
        groups: Vec<DirectoryGroup>,
        pool: &mut StringPool,
    ) -> Self {
        let source_folder = path::normalize(source_folder);
        let target_folder = path::normalize(target_folder);

        let mut subfolder_files = StrMap::with_capacity(groups.len());
        for group in groups {
            let directory = if group.relative_key.is_empty() {
                pool.intern(&target_folder)
            } else {
                pool.intern(&path::join(&target_folder, &group.relative_key))
            };

            let targets = group
                .entries
                .into_iter()
                .map(|entry| Target {
                    directory: Arc::clone(&directory),
                    file_name: entry.name.into_boxed_str(),
                    is_directory: entry.is_directory,
                })
                .collect();

            subfolder_files.insert(group.relative_key, targets);
        }

        Self {
            source_folder,
            target_folder,
            subfolder_files,
        }
    }
}
