//! The mutable redirection trie used while the engine is being configured.
//!
//! Each node maps one path segment to its child node and carries the file
//! redirects registered directly below it. The trie supports incremental
//! inserts only; removals go through a full rebuild by the manager, which
//! is also the only place overlays and file redirects are ordered against
//! each other.

use crate::path;
use crate::pool::StringPool;
use crate::redirection::{FolderRedirection, Target};
use crate::strmap::StrMap;

pub mod lookup;

/// One segment of the trie.
#[derive(Debug, Clone)]
pub(crate) struct Node {
    /// Child nodes by path segment.
    pub(crate) children: StrMap<Node>,
    /// File redirects registered directly in this directory, by file name.
    pub(crate) files: StrMap<Target>,
}

impl Default for Node {
    fn default() -> Self {
        Self {
            children: StrMap::new(),
            files: StrMap::new(),
        }
    }
}

/// The mutable per-segment redirection trie.
#[derive(Debug, Clone, Default)]
pub struct RedirectionTree {
    root: Node,
}

impl RedirectionTree {
    /// Creates an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn root(&self) -> &Node {
        &self.root
    }

    /// Descends to the node for `directory`, creating missing segments.
    fn node_at_mut(&mut self, directory: &str) -> &mut Node {
        let mut node = &mut self.root;
        for segment in path::segments(directory) {
            node = node.children.get_or_insert_with(segment, Node::default);
        }
        node
    }

    /// Registers a single-file redirect.
    ///
    /// Both paths must be in canonical uppercase form. The final segment of
    /// `old_path` becomes the lookup key; `new_path` is split into its
    /// pooled directory and file name.
    pub fn add_file(
        &mut self,
        old_path: &str,
        new_path: &str,
        is_directory: bool,
        pool: &mut StringPool,
    ) {
        let (old_directory, old_name) = match path::last_separator(old_path) {
            Some(position) => (&old_path[..position], &old_path[position + 1..]),
            None => ("", old_path),
        };
        let (new_directory, new_name) = match path::last_separator(new_path) {
            Some(position) => (&new_path[..position], &new_path[position + 1..]),
            None => ("", new_path),
        };

        let target = Target {
            directory: pool.intern(new_directory),
            file_name: Box::from(new_name),
            is_directory,
        };

        self.node_at_mut(old_directory)
            .files
            .insert(old_name.to_string(), target);
    }

    /// Merges a folder overlay into the trie.
    ///
    /// Every scanned subfolder group lands under `source\<subfolder>`;
    /// entries replace earlier ones with the same name, so overlays applied
    /// later win.
    pub fn add_folder_overlay(&mut self, overlay: &FolderRedirection) {
        for (relative, targets) in overlay.subfolder_files.iter() {
            let directory = if relative.is_empty() {
                overlay.source_folder.clone()
            } else {
                path::join(&overlay.source_folder, relative)
            };

            let node = self.node_at_mut(&directory);
            for target in targets {
                node.files
                    .insert(target.file_name.to_string(), target.clone());
            }
        }
    }

    /// Walks the trie to the node for `directory`, without creating nodes.
    fn node_at(&self, directory: &str) -> Option<&Node> {
        let mut node = &self.root;
        for segment in path::segments(directory) {
            node = node.children.get(segment)?;
        }
        Some(node)
    }

    /// Looks up the redirect for a file path in canonical uppercase form.
    ///
    /// Build-mode counterpart of the compiled lookup; used until the
    /// manager optimises.
    pub fn try_get_file(&self, file_path: &str) -> Option<&Target> {
        let position = path::last_separator(file_path)?;
        self.node_at(&file_path[..position])?
            .files
            .get(&file_path[position + 1..])
    }

    /// Looks up the overlay entries for a directory path in canonical
    /// uppercase form.
    pub fn try_get_folder(&self, directory: &str) -> Option<&StrMap<Target>> {
        self.node_at(directory).map(|node| &node.files)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn add_file_is_queryable_by_segments() {
        let mut pool = StringPool::new();
        let mut tree = RedirectionTree::new();
        tree.add_file("C:\\GAME\\DATA\\A.BIN", "C:\\MOD\\A.BIN", false, &mut pool);

        let target = tree.try_get_file("C:\\GAME\\DATA\\A.BIN").unwrap();
        assert_eq!(target.full_path(), "C:\\MOD\\A.BIN");
        assert!(tree.try_get_file("C:\\GAME\\DATA\\B.BIN").is_none());
        assert!(tree.try_get_file("C:\\GAME\\A.BIN").is_none());
    }

    #[test]
    fn later_file_adds_win() {
        let mut pool = StringPool::new();
        let mut tree = RedirectionTree::new();
        tree.add_file("C:\\G\\A.BIN", "C:\\MOD1\\A.BIN", false, &mut pool);
        tree.add_file("C:\\G\\A.BIN", "C:\\MOD2\\A.BIN", false, &mut pool);

        let target = tree.try_get_file("C:\\G\\A.BIN").unwrap();
        assert_eq!(target.full_path(), "C:\\MOD2\\A.BIN");
    }

    #[test]
    fn folder_overlay_lands_under_the_source() {
        use crate::scanner::{DirectoryGroup, ScannedEntry};

        let mut pool = StringPool::new();
        let overlay = FolderRedirection::from_groups(
            "C:\\GAME\\DATA",
            "C:\\MOD",
            vec![
                DirectoryGroup {
                    relative_key: String::new(),
                    entries: vec![ScannedEntry {
                        name: "A.BIN".to_string(),
                        is_directory: false,
                    }],
                },
                DirectoryGroup {
                    relative_key: "SUB".to_string(),
                    entries: vec![ScannedEntry {
                        name: "B.BIN".to_string(),
                        is_directory: false,
                    }],
                },
            ],
            &mut pool,
        );

        let mut tree = RedirectionTree::new();
        tree.add_folder_overlay(&overlay);

        assert_eq!(
            tree.try_get_file("C:\\GAME\\DATA\\A.BIN").unwrap().full_path(),
            "C:\\MOD\\A.BIN"
        );
        assert_eq!(
            tree.try_get_file("C:\\GAME\\DATA\\SUB\\B.BIN")
                .unwrap()
                .full_path(),
            "C:\\MOD\\SUB\\B.BIN"
        );

        let folder = tree.try_get_folder("C:\\GAME\\DATA").unwrap();
        assert!(folder.get("A.BIN").is_some());
    }
}
