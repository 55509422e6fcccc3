//! Interning of directory strings.
//!
//! Big overlays contain thousands of files spread over few directories;
//! every target stores its directory, so equal directory strings are
//! deduplicated into shared `Arc<str>` instances instead of owning a copy
//! per file.

use std::collections::HashSet;
use std::sync::Arc;

/// Deduplicates equal strings into shared allocations.
#[derive(Debug, Default)]
pub struct StringPool {
    entries: HashSet<Arc<str>>,
}

impl StringPool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the shared instance for `value`, inserting it on first use.
    pub fn intern(&mut self, value: &str) -> Arc<str> {
        match self.entries.get(value) {
            Some(shared) => Arc::clone(shared),
            None => {
                let shared: Arc<str> = Arc::from(value);
                self.entries.insert(Arc::clone(&shared));
                shared
            }
        }
    }

    /// The number of distinct strings in the pool.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing has been interned yet.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // Equal values must intern to the same allocation, not just equal
    // contents.
    #[test]
    fn equal_values_share_one_allocation() {
        let mut pool = StringPool::new();

        let first = pool.intern("C:\\MOD\\TEXTURES");
        let second = pool.intern("C:\\MOD\\TEXTURES");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn distinct_values_stay_distinct() {
        let mut pool = StringPool::new();

        let first = pool.intern("C:\\MOD\\A");
        let second = pool.intern("C:\\MOD\\B");

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(pool.len(), 2);
    }
}
