//! Path canonicalization for the redirection engine.
//!
//! Windows paths are case-insensitive, so the engine works exclusively in
//! uppercase: every stored path is folded once at configuration time and
//! every queried path is folded into a stack buffer before lookup. The NT
//! device prefix (`\??\`) is stripped at the boundary and re-applied when a
//! path is handed back to the syscall; it is never stored or compared.

use smallvec::SmallVec;

/// The canonical separator of every stored path.
pub const SEPARATOR: char = '\\';

/// The NT device prefix stripped from incoming syscall paths.
pub const NT_PREFIX: &str = "\\??\\";

/// Inline capacity of [`PathBuffer`]; longer paths spill to the heap.
const INLINE_PATH_LEN: usize = 512;

/// An extension trait for `char` case folding.
trait CharExt {
    /// Folds `self` to its invariant uppercase form.
    fn fold_case(self) -> Self;
}

impl CharExt for char {
    fn fold_case(self) -> Self {
        if self.is_ascii() {
            self.to_ascii_uppercase()
        } else {
            // Only simple (1:1) mappings are applied; multi-character
            // expansions would change the segment length and Windows does
            // not apply them when comparing paths either.
            let mut upper = self.to_uppercase();
            match (upper.next(), upper.next()) {
                (Some(folded), None) => folded,
                _ => self,
            }
        }
    }
}

/// Folds one character to its invariant uppercase form.
pub(crate) fn fold_char(ch: char) -> char {
    ch.fold_case()
}

/// Splits the NT device prefix off a path.
///
/// Returns the remainder and whether the prefix was present, so the caller
/// can re-apply it to the redirected path.
pub fn strip_nt_prefix(path: &str) -> (&str, bool) {
    match path.strip_prefix(NT_PREFIX) {
        Some(rest) => (rest, true),
        None => (path, false),
    }
}

/// Canonicalizes a configuration-time path into its stored form.
///
/// Folds separators to `\`, uppercases, strips the NT prefix and any
/// trailing separators.
pub fn normalize(path: &str) -> String {
    let (path, _) = strip_nt_prefix(path);

    let mut normalized = String::with_capacity(path.len());
    for ch in path.chars() {
        if ch == '/' {
            normalized.push(SEPARATOR);
        } else {
            normalized.push(ch.fold_case());
        }
    }

    while normalized.ends_with(SEPARATOR) {
        normalized.pop();
    }

    normalized
}

/// The byte offset of the last separator in `path`, if any.
pub fn last_separator(path: &str) -> Option<usize> {
    path.rfind(SEPARATOR)
}

/// Iterates over the non-empty segments of a canonical path.
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split(SEPARATOR).filter(|segment| !segment.is_empty())
}

/// Joins a directory and a file name with the canonical separator.
pub fn join(directory: &str, name: &str) -> String {
    if directory.is_empty() {
        name.to_string()
    } else {
        format!("{directory}{SEPARATOR}{name}")
    }
}

/// An uppercase copy of a queried path, stack-allocated for typical lengths.
///
/// Lookups happen on every intercepted syscall, so the fold must not touch
/// the heap: paths up to 512 bytes stay inline, longer ones spill.
pub struct PathBuffer {
    buf: SmallVec<[u8; INLINE_PATH_LEN]>,
}

impl PathBuffer {
    /// Folds `path` to uppercase canonical form.
    ///
    /// Expects the NT prefix to be stripped already; separators are
    /// canonicalized but nothing is trimmed.
    pub fn uppercase(path: &str) -> Self {
        firestorm::profile_method!(uppercase);

        let mut buf = SmallVec::new();

        for ch in path.chars() {
            if ch == '/' {
                buf.push(b'\\');
            } else if ch.is_ascii() {
                buf.push(ch.to_ascii_uppercase() as u8);
            } else {
                let mut utf8 = [0u8; 4];
                buf.extend_from_slice(ch.fold_case().encode_utf8(&mut utf8).as_bytes());
            }
        }

        Self { buf }
    }

    /// Borrows the folded path.
    pub fn as_str(&self) -> &str {
        // Safety: the buffer is built exclusively from `char`s encoded via
        // `encode_utf8` and single ASCII bytes.
        unsafe { std::str::from_utf8_unchecked(&self.buf) }
    }

    /// Returns `true` if the copy spilled to the heap.
    pub fn spilled(&self) -> bool {
        self.buf.spilled()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn normalize_folds_case_and_separators() {
        assert_eq!(normalize("C:/game/data/a.bin"), "C:\\GAME\\DATA\\A.BIN");
        assert_eq!(normalize("c:\\Game\\Data\\"), "C:\\GAME\\DATA");
    }

    #[test]
    fn normalize_strips_the_nt_prefix() {
        assert_eq!(normalize("\\??\\C:\\game\\a.bin"), "C:\\GAME\\A.BIN");
    }

    #[test]
    fn nt_prefix_presence_is_reported() {
        assert_eq!(strip_nt_prefix("\\??\\C:\\X"), ("C:\\X", true));
        assert_eq!(strip_nt_prefix("C:\\X"), ("C:\\X", false));
    }

    // Uppercasing must agree between the owned and the stack-buffered fold,
    // including for non-ASCII BMP characters.
    #[test]
    fn owned_and_buffered_folds_agree() {
        for path in ["c:\\game\\ä\\straße.bin", "C:\\ГДЕ\\файл.bin", "c:\\a"] {
            assert_eq!(PathBuffer::uppercase(path).as_str(), normalize(path));
        }
    }

    #[test]
    fn short_paths_stay_inline() {
        let buffer = PathBuffer::uppercase("C:\\GAME\\DATA\\TEXTURES\\ROCK.DDS");
        assert!(!buffer.spilled());
    }

    #[test]
    fn long_paths_spill_but_stay_correct() {
        let long = format!("C:\\{}", "A\\".repeat(400));
        let buffer = PathBuffer::uppercase(&long);
        assert!(buffer.spilled());
        assert_eq!(buffer.as_str(), long);
    }

    #[test]
    fn segments_skip_empty_parts() {
        let parts: Vec<&str> = segments("C:\\GAME\\\\DATA").collect();
        assert_eq!(parts, ["C:", "GAME", "DATA"]);
    }

    #[test]
    fn join_handles_the_empty_directory() {
        assert_eq!(join("", "A.BIN"), "A.BIN");
        assert_eq!(join("C:\\MOD", "A.BIN"), "C:\\MOD\\A.BIN");
    }
}
