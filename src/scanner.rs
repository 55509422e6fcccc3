//! Scans overlay directories on disk.
//!
//! The scan groups everything it finds by immediate containing directory,
//! keyed by the directory's path relative to the overlay root (the empty
//! string for the root itself). Subdirectories are recorded alongside
//! files so that folders existing only inside an overlay can still be
//! opened and enumerated by the application.

use std::collections::HashMap;
use std::io;
use std::path::Path;

use tracing::warn;

use crate::path;

/// One entry found inside an overlay directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedEntry {
    /// The uppercased file or directory name.
    pub name: String,
    /// Whether the entry is a directory.
    pub is_directory: bool,
}

/// All entries of one directory inside an overlay.
#[derive(Debug, Clone)]
pub struct DirectoryGroup {
    /// The uppercased path of the directory relative to the overlay root;
    /// empty for the root itself.
    pub relative_key: String,
    /// The entries directly inside the directory.
    pub entries: Vec<ScannedEntry>,
}

/// Walks `root` and returns its contents grouped by containing directory.
///
/// Unreadable entries below the root are skipped with a warning; an
/// unreadable root is an error.
pub fn scan_folder(root: &Path) -> io::Result<Vec<DirectoryGroup>> {
    // Fail early on a missing or unreadable overlay root.
    std::fs::metadata(root)?;

    let mut groups: Vec<DirectoryGroup> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for entry in walkdir::WalkDir::new(root).min_depth(1) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(error = %err, "skipping unreadable overlay entry");
                continue;
            }
        };

        let relative = entry
            .path()
            .strip_prefix(root)
            .expect("walkdir yields paths below its root");

        let parent_key = match relative.parent() {
            Some(parent) => path::normalize(&parent.to_string_lossy()),
            None => String::new(),
        };
        let name = path::normalize(&entry.file_name().to_string_lossy());

        let group = match index.get(&parent_key) {
            Some(&position) => &mut groups[position],
            None => {
                index.insert(parent_key.clone(), groups.len());
                groups.push(DirectoryGroup {
                    relative_key: parent_key,
                    entries: Vec::new(),
                });
                groups.last_mut().unwrap()
            }
        };

        group.entries.push(ScannedEntry {
            name,
            is_directory: entry.file_type().is_dir(),
        });
    }

    Ok(groups)
}
