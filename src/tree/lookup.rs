//! The immutable, compiled form of the redirection trie.
//!
//! Games keep their assets under one deep common prefix, so the compiled
//! tree stores that prefix once and keys everything below it by relative
//! subfolder. A query is then a prefix compare, one outer map lookup and
//! one inner map lookup. A two-step variant measured slightly slower due
//! to cache behavior; the three-step form is kept.

use crate::path;
use crate::redirection::Target;
use crate::strmap::StrMap;
use crate::tree::{Node, RedirectionTree};

/// The compiled, query-only redirection table.
#[derive(Debug, Clone)]
pub struct LookupTree {
    /// The longest directory prefix shared by every entry, uppercased,
    /// without a trailing separator.
    prefix: String,
    /// Subfolder path relative to `prefix` (empty for the prefix itself)
    /// to the file redirects inside that subfolder.
    subfolders: StrMap<StrMap<Target>>,
}

impl LookupTree {
    /// Compiles a redirection trie.
    pub fn build(tree: &RedirectionTree) -> Self {
        let mut prefix = String::new();
        let mut node = tree.root();

        // Follow the spine while it neither branches nor carries files.
        while node.children.len() == 1 && node.files.is_empty() {
            let (segment, child) = node.children.first().unwrap();
            prefix.push_str(segment);
            prefix.push(path::SEPARATOR);
            node = child;
        }
        if prefix.ends_with(path::SEPARATOR) {
            prefix.pop();
        }

        let mut subfolders = StrMap::with_capacity(count_nodes(node));
        collect(node, String::new(), &mut subfolders);

        Self { prefix, subfolders }
    }

    /// The common directory prefix of every entry.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Looks up the redirects for a directory.
    ///
    /// `directory` must be uppercase with canonical separators and no NT
    /// prefix. Never allocates.
    pub fn try_get_folder(&self, directory: &str) -> Option<&StrMap<Target>> {
        firestorm::profile_method!(try_get_folder);

        if !directory.starts_with(&self.prefix) {
            return None;
        }

        let prefix_len = self.prefix.len();
        let relative = if directory.len() == prefix_len {
            ""
        } else if prefix_len == 0 {
            directory
        } else if directory.as_bytes()[prefix_len] == b'\\' {
            // A prefix match only counts on a segment boundary; C:\GAMEX
            // must not match the prefix C:\GAME.
            &directory[prefix_len + 1..]
        } else {
            return None;
        };

        self.subfolders.get(relative)
    }

    /// Looks up the redirect for a file.
    ///
    /// `file_path` must be uppercase with canonical separators and no NT
    /// prefix. Never allocates.
    pub fn try_get_file(&self, file_path: &str) -> Option<&Target> {
        firestorm::profile_method!(try_get_file);

        let position = path::last_separator(file_path)?;
        self.try_get_folder(&file_path[..position])?
            .get(&file_path[position + 1..])
    }
}

/// Counts `node` and everything below it, for map presizing.
fn count_nodes(node: &Node) -> usize {
    1 + node
        .children
        .iter()
        .map(|(_, child)| count_nodes(child))
        .sum::<usize>()
}

/// Inserts `node` and its descendants keyed by subfolder relative to the
/// prefix.
fn collect(node: &Node, relative: String, out: &mut StrMap<StrMap<Target>>) {
    for (segment, child) in node.children.iter() {
        let child_relative = if relative.is_empty() {
            segment.to_string()
        } else {
            path::join(&relative, segment)
        };
        collect(child, child_relative, out);
    }

    out.insert(relative, node.files.clone());
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::pool::StringPool;

    fn tree_with(files: &[(&str, &str)]) -> RedirectionTree {
        let mut pool = StringPool::new();
        let mut tree = RedirectionTree::new();
        for (old, new) in files {
            tree.add_file(old, new, false, &mut pool);
        }
        tree
    }

    // With a single overlay everything shares the deepest directory as the
    // prefix and the subfolder keys are relative.
    #[test]
    fn prefix_is_the_longest_common_directory() {
        let tree = tree_with(&[
            ("C:\\GAME\\DATA\\TEXTURES\\A.DDS", "C:\\MOD\\A.DDS"),
            ("C:\\GAME\\DATA\\TEXTURES\\SUB\\B.DDS", "C:\\MOD\\SUB\\B.DDS"),
        ]);
        let lookup = LookupTree::build(&tree);

        assert_eq!(lookup.prefix(), "C:\\GAME\\DATA\\TEXTURES");
        assert!(lookup.try_get_folder("C:\\GAME\\DATA\\TEXTURES").is_some());
        assert!(lookup
            .try_get_folder("C:\\GAME\\DATA\\TEXTURES\\SUB")
            .is_some());
    }

    #[test]
    fn queries_resolve_to_the_registered_targets() {
        let tree = tree_with(&[
            ("C:\\GAME\\DATA\\A.BIN", "C:\\MOD\\A.BIN"),
            ("C:\\GAME\\DATA\\SUB\\B.BIN", "C:\\MOD\\SUB\\B.BIN"),
        ]);
        let lookup = LookupTree::build(&tree);

        assert_eq!(
            lookup.try_get_file("C:\\GAME\\DATA\\A.BIN").unwrap().full_path(),
            "C:\\MOD\\A.BIN"
        );
        assert_eq!(
            lookup
                .try_get_file("C:\\GAME\\DATA\\SUB\\B.BIN")
                .unwrap()
                .full_path(),
            "C:\\MOD\\SUB\\B.BIN"
        );
        assert!(lookup.try_get_file("C:\\GAME\\DATA\\C.BIN").is_none());
    }

    // A path that extends the prefix without a separator boundary is a
    // different directory entirely.
    #[test]
    fn prefix_match_requires_a_segment_boundary() {
        let tree = tree_with(&[("C:\\GAME\\A.BIN", "C:\\MOD\\A.BIN")]);
        let lookup = LookupTree::build(&tree);

        assert_eq!(lookup.prefix(), "C:\\GAME");
        assert!(lookup.try_get_folder("C:\\GAMEX").is_none());
        assert!(lookup.try_get_file("C:\\GAMEX\\A.BIN").is_none());
    }

    #[test]
    fn empty_tree_misses_everything() {
        let lookup = LookupTree::build(&RedirectionTree::new());

        assert_eq!(lookup.prefix(), "");
        assert!(lookup.try_get_file("C:\\GAME\\DATA\\A.BIN").is_none());
    }

    // Queries are pure; asking twice gives the same answer.
    #[test]
    fn queries_are_idempotent() {
        let tree = tree_with(&[("C:\\GAME\\A.BIN", "C:\\MOD\\A.BIN")]);
        let lookup = LookupTree::build(&tree);

        let first = lookup.try_get_file("C:\\GAME\\A.BIN").map(Target::full_path);
        let second = lookup.try_get_file("C:\\GAME\\A.BIN").map(Target::full_path);
        assert_eq!(first, second);
    }
}
