//! The redirect manifest consumed by the probe binary.

use serde::{Deserialize, Serialize};

use std::{fs, io, path::Path};

use crate::manager::RedirectionManager;

/// A declarative set of redirects.
#[derive(Debug, Default, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// Folder overlays, applied in order (later overlays win).
    #[serde(default)]
    pub folders: Vec<FolderEntry>,
    /// Individual file redirects; these beat any folder overlay.
    #[serde(default)]
    pub files: Vec<FileEntry>,
}

/// One folder overlay in a manifest.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct FolderEntry {
    /// The folder being overlaid.
    pub source: String,
    /// The folder providing the replacement contents.
    pub target: String,
}

/// One file redirect in a manifest.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    /// The path the application asks for.
    pub old: String,
    /// The path it receives instead.
    pub new: String,
}

impl Manifest {
    /// Reads a manifest from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> io::Result<Self> {
        let contents = fs::read_to_string(path)?;
        serde_json::from_str(&contents)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }

    /// Registers every redirect of the manifest with `manager`.
    pub fn apply(&self, manager: &RedirectionManager) -> io::Result<()> {
        for folder in &self.folders {
            manager.add_redirect_folder(&folder.source, &folder.target)?;
        }
        for file in &self.files {
            manager.add_redirect(&file.old, &file.new);
        }
        Ok(())
    }
}
