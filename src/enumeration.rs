//! Splices overlay entries into directory enumeration results.
//!
//! The application enumerates a base directory through the original
//! syscall; the merger then appends records for overlay files the base
//! directory does not contain, in the same on-wire layout the caller asked
//! for. Names the base filesystem already reported are remembered per
//! handle so an overlay file shadowing a base file is never returned
//! twice, and a batch that fills the buffer resumes exactly where it
//! stopped on the next call.
//!
//! The ten `FILE_*_DIR_INFORMATION` layouts share a common shape (next
//! entry offset, file index, an optional timestamp/size/attributes block,
//! a name length and a trailing UTF-16 name); the differences are captured
//! in a per-class layout table and dispatched by match, which keeps the
//! record writer free of trait objects.

use smallvec::SmallVec;

use crate::handles::{HandleState, HandleTable, RawHandle};
use crate::manager::RedirectionManager;
use crate::path;
use crate::redirection::Target;

/// Records are aligned to 8 bytes within an enumeration buffer.
const RECORD_ALIGN: usize = 8;

/// Offset of the timestamp/size block shared by every class that has one.
const TIMES_OFFSET: usize = 8;

/// Offset of the attributes word in classes that carry one.
const ATTRIBUTES_OFFSET: usize = 56;

/// Seconds between the NT epoch (1601) and the UNIX epoch (1970).
const NT_EPOCH_DELTA_SECS: u64 = 11_644_473_600;

bitflags::bitflags! {
    /// The Windows file-attribute word carried in enumeration records.
    #[derive(Default)]
    pub struct FileAttributes: u32 {
        const READONLY            = 0x0001;
        const HIDDEN              = 0x0002;
        const SYSTEM              = 0x0004;
        const DIRECTORY           = 0x0010;
        const ARCHIVE             = 0x0020;
        const DEVICE              = 0x0040;
        const NORMAL              = 0x0080;
        const TEMPORARY           = 0x0100;
        const SPARSE              = 0x0200;
        const REPARSE_POINT       = 0x0400;
        const COMPRESSED          = 0x0800;
        const OFFLINE             = 0x1000;
        const NOT_CONTENT_INDEXED = 0x2000;
        const ENCRYPTED           = 0x4000;
    }
}

/// The subset of NT statuses the merger distinguishes.
///
/// Anything else travels through [`NtStatus::Other`] untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NtStatus {
    Success,
    NoMoreFiles,
    NoSuchFile,
    ObjectNameNotFound,
    BufferOverflow,
    Other(i32),
}

impl NtStatus {
    /// Whether the status reports actual enumeration data.
    fn has_data(self) -> bool {
        self == NtStatus::Success
    }

    /// Whether the underlying call failed in a way the merger must not
    /// paper over.
    fn is_hard_error(self) -> bool {
        matches!(self, NtStatus::Other(_))
    }
}

/// The metadata written into a synthesized enumeration record.
#[derive(Debug, Clone, Copy, Default)]
pub struct EntryMetadata {
    /// NT timestamps, 100ns ticks since 1601.
    pub creation_time: i64,
    pub last_access_time: i64,
    pub last_write_time: i64,
    pub change_time: i64,
    pub end_of_file: u64,
    pub allocation_size: u64,
    pub attributes: FileAttributes,
    pub file_id: u64,
}

/// Fetches metadata for overlay targets when their records are
/// synthesized.
///
/// The hook backs this with the underlying query-attributes syscall; off
/// the hook path [`FsMetadataSource`] reads through `std::fs`.
pub trait MetadataSource {
    fn metadata_for(&self, target_path: &str) -> Option<EntryMetadata>;
}

/// [`MetadataSource`] backed by the standard library.
pub struct FsMetadataSource;

impl MetadataSource for FsMetadataSource {
    fn metadata_for(&self, target_path: &str) -> Option<EntryMetadata> {
        let meta = std::fs::metadata(target_path).ok()?;

        let attributes = if meta.is_dir() {
            FileAttributes::DIRECTORY
        } else {
            FileAttributes::NORMAL
        };

        Some(EntryMetadata {
            creation_time: meta.created().ok().map_or(0, to_nt_time),
            last_access_time: meta.accessed().ok().map_or(0, to_nt_time),
            last_write_time: meta.modified().ok().map_or(0, to_nt_time),
            change_time: meta.modified().ok().map_or(0, to_nt_time),
            end_of_file: meta.len(),
            allocation_size: meta.len(),
            attributes,
            file_id: 0,
        })
    }
}

/// Converts a system time to NT 100ns ticks.
fn to_nt_time(time: std::time::SystemTime) -> i64 {
    match time.duration_since(std::time::UNIX_EPOCH) {
        Ok(since) => ((since.as_secs() + NT_EPOCH_DELTA_SECS) as i64)
            .saturating_mul(10_000_000)
            .saturating_add(i64::from(since.subsec_nanos() / 100)),
        Err(_) => 0,
    }
}

/// One of the `FILE_*_DIR_INFORMATION` record layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoClass {
    Directory,
    FullDirectory,
    BothDirectory,
    Names,
    IdBothDirectory,
    IdFullDirectory,
    IdGlobalTxDirectory,
    IdExtdDirectory,
    IdExtdBothDirectory,
    Id64ExtdDirectory,
}

/// The per-class facts the writer and the walker need.
struct Layout {
    /// Byte offset of the trailing UTF-16 name; also the fixed record
    /// size.
    base_len: usize,
    /// Byte offset of the name length field.
    name_length_offset: usize,
    /// Whether the timestamp/size/attributes block at offset 8 exists.
    has_times: bool,
    /// Byte offset of a 64-bit file id, where the class carries one.
    file_id_offset: Option<usize>,
}

impl InfoClass {
    /// Every supported class, in `FILE_INFORMATION_CLASS` order.
    pub const ALL: [InfoClass; 10] = [
        InfoClass::Directory,
        InfoClass::FullDirectory,
        InfoClass::BothDirectory,
        InfoClass::Names,
        InfoClass::IdBothDirectory,
        InfoClass::IdFullDirectory,
        InfoClass::IdGlobalTxDirectory,
        InfoClass::IdExtdDirectory,
        InfoClass::IdExtdBothDirectory,
        InfoClass::Id64ExtdDirectory,
    ];

    fn layout(self) -> Layout {
        match self {
            InfoClass::Directory => Layout {
                base_len: 64,
                name_length_offset: 60,
                has_times: true,
                file_id_offset: None,
            },
            InfoClass::FullDirectory => Layout {
                base_len: 68,
                name_length_offset: 60,
                has_times: true,
                file_id_offset: None,
            },
            InfoClass::BothDirectory => Layout {
                base_len: 94,
                name_length_offset: 60,
                has_times: true,
                file_id_offset: None,
            },
            InfoClass::Names => Layout {
                base_len: 12,
                name_length_offset: 8,
                has_times: false,
                file_id_offset: None,
            },
            InfoClass::IdBothDirectory => Layout {
                base_len: 104,
                name_length_offset: 60,
                has_times: true,
                file_id_offset: Some(96),
            },
            InfoClass::IdFullDirectory => Layout {
                base_len: 80,
                name_length_offset: 60,
                has_times: true,
                file_id_offset: Some(72),
            },
            InfoClass::IdGlobalTxDirectory => Layout {
                base_len: 92,
                name_length_offset: 60,
                has_times: true,
                file_id_offset: Some(64),
            },
            InfoClass::IdExtdDirectory => Layout {
                base_len: 88,
                name_length_offset: 60,
                has_times: true,
                // Low half of the 128-bit id.
                file_id_offset: Some(72),
            },
            InfoClass::IdExtdBothDirectory => Layout {
                base_len: 114,
                name_length_offset: 60,
                has_times: true,
                file_id_offset: Some(72),
            },
            InfoClass::Id64ExtdDirectory => Layout {
                base_len: 80,
                name_length_offset: 60,
                has_times: true,
                file_id_offset: Some(72),
            },
        }
    }

    /// The unaligned record size for a name of `name_utf16_units` UTF-16
    /// code units.
    pub fn record_size(self, name_utf16_units: usize) -> usize {
        self.layout().base_len + name_utf16_units * 2
    }
}

fn align_record(offset: usize) -> usize {
    (offset + RECORD_ALIGN - 1) & !(RECORD_ALIGN - 1)
}

fn write_u32(buffer: &mut [u8], offset: usize, value: u32) {
    buffer[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn write_u64(buffer: &mut [u8], offset: usize, value: u64) {
    buffer[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn write_i64(buffer: &mut [u8], offset: usize, value: i64) {
    buffer[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn read_u32(buffer: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buffer[offset..offset + 4].try_into().unwrap())
}

/// Writes one record at the start of `buffer`.
///
/// Returns the record size, or `None` if it does not fit. The next-entry
/// offset is left 0; the caller links records.
pub fn write_entry(
    class: InfoClass,
    buffer: &mut [u8],
    name: &str,
    meta: &EntryMetadata,
) -> Option<usize> {
    let layout = class.layout();
    let name_units: usize = name.encode_utf16().count();
    let size = layout.base_len + name_units * 2;
    if buffer.len() < size {
        return None;
    }

    buffer[..size].fill(0);

    write_u32(buffer, layout.name_length_offset, (name_units * 2) as u32);
    if layout.has_times {
        write_i64(buffer, TIMES_OFFSET, meta.creation_time);
        write_i64(buffer, TIMES_OFFSET + 8, meta.last_access_time);
        write_i64(buffer, TIMES_OFFSET + 16, meta.last_write_time);
        write_i64(buffer, TIMES_OFFSET + 24, meta.change_time);
        write_u64(buffer, TIMES_OFFSET + 32, meta.end_of_file);
        write_u64(buffer, TIMES_OFFSET + 40, meta.allocation_size);
        write_u32(buffer, ATTRIBUTES_OFFSET, meta.attributes.bits());
    }
    if let Some(offset) = layout.file_id_offset {
        write_u64(buffer, offset, meta.file_id);
    }

    let mut position = layout.base_len;
    for unit in name.encode_utf16() {
        buffer[position..position + 2].copy_from_slice(&unit.to_le_bytes());
        position += 2;
    }

    Some(size)
}

/// Writes a linked batch of records, the way the underlying enumeration
/// fills a caller's buffer.
///
/// Returns the bytes used and how many entries were consumed; writing
/// stops at the first entry that does not fit.
pub fn write_batch(
    class: InfoClass,
    buffer: &mut [u8],
    entries: &[(&str, EntryMetadata)],
) -> (usize, usize) {
    let mut position = 0;
    let mut previous: Option<usize> = None;
    let mut count = 0;

    for (name, meta) in entries {
        let aligned = align_record(position);
        if aligned > buffer.len() {
            break;
        }
        let size = match write_entry(class, &mut buffer[aligned..], name, meta) {
            Some(size) => size,
            None => break,
        };

        buffer[position..aligned].fill(0);
        if let Some(previous) = previous {
            write_u32(buffer, previous, (aligned - previous) as u32);
        }
        previous = Some(aligned);
        position = aligned + size;
        count += 1;
    }

    (position, count)
}

/// Decodes the names of an enumeration buffer.
///
/// A debugging aid for hosts validating merged batches; not used on the
/// hook path.
pub fn decode_names(class: InfoClass, buffer: &[u8], bytes: usize) -> Vec<String> {
    let layout = class.layout();
    let mut names = Vec::new();
    if bytes == 0 {
        return names;
    }

    let mut offset = 0;
    loop {
        if offset + layout.base_len > bytes {
            break;
        }
        let next = read_u32(buffer, offset) as usize;
        let name_length = read_u32(buffer, offset + layout.name_length_offset) as usize;
        let name_end = offset + layout.base_len + name_length;
        if name_end > bytes {
            break;
        }

        let units: Vec<u16> = buffer[offset + layout.base_len..name_end]
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        names.push(String::from_utf16_lossy(&units));

        if next == 0 {
            break;
        }
        offset += next;
    }

    names
}

/// Decodes and case-folds the UTF-16 name of a record into `out`.
fn fold_record_name(name_bytes: &[u8], out: &mut SmallVec<[u8; 512]>) {
    out.clear();

    let units = name_bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]));

    for ch in char::decode_utf16(units) {
        let ch = path::fold_char(ch.unwrap_or(char::REPLACEMENT_CHARACTER));
        let mut utf8 = [0u8; 4];
        out.extend_from_slice(ch.encode_utf8(&mut utf8).as_bytes());
    }
}

/// DOS-style wildcard match of an uppercase `name` against an uppercase
/// `pattern` (`*` and `?`).
pub fn matches_pattern(pattern: &str, name: &str) -> bool {
    if pattern == "*" {
        return true;
    }

    let pattern: SmallVec<[char; 64]> = pattern.chars().collect();
    let name: SmallVec<[char; 64]> = name.chars().collect();

    // Classic backtracking matcher: remember the last `*` and retry from
    // there when a literal run fails.
    let (mut p, mut n) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while n < name.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == name[n]) {
            p += 1;
            n += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, n));
            p += 1;
        } else if let Some((star_p, star_n)) = star {
            p = star_p + 1;
            n = star_n + 1;
            star = Some((star_p, star_n + 1));
        } else {
            return false;
        }
    }

    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}

/// What the underlying syscall produced for one call.
#[derive(Debug, Clone, Copy)]
pub struct NativeBatch {
    pub status: NtStatus,
    pub bytes: usize,
}

/// The result handed back to the caller after merging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Merged {
    pub status: NtStatus,
    pub bytes: usize,
    /// Overlay records appended by this call.
    pub injected: usize,
}

impl Merged {
    fn passthrough(batch: NativeBatch) -> Self {
        Self {
            status: batch.status,
            bytes: batch.bytes,
            injected: 0,
        }
    }
}

/// Applies a new filter pattern and materializes the overlay items for a
/// handle, if not done yet.
///
/// A pattern differing from the previous one resets the merge progress
/// and forces the underlying scan to restart.
pub fn prepare_state(
    state: &mut HandleState,
    pattern: Option<&str>,
    overlay: impl FnOnce() -> Option<Vec<(String, Target)>>,
) {
    if let Some(pattern) = pattern {
        let folded = path::PathBuffer::uppercase(pattern);
        if folded.as_str() != state.query_pattern {
            state.query_pattern = folded.as_str().to_string();
            state.reset_enumeration();
        }
    }

    if state.items.is_none() {
        let mut items = overlay().unwrap_or_default();
        if state.query_pattern != "*" {
            items.retain(|(name, _)| matches_pattern(&state.query_pattern, name));
        }
        state.items = Some(items);
    }
}

/// Merges the overlay items of `state` into the batch the underlying
/// syscall wrote to `buffer`.
pub fn merge_batch(
    state: &mut HandleState,
    class: InfoClass,
    buffer: &mut [u8],
    native: NativeBatch,
    metadata: &dyn MetadataSource,
) -> Merged {
    firestorm::profile_fn!(merge_batch);

    if native.status.is_hard_error() {
        return Merged::passthrough(native);
    }

    let layout = class.layout();
    let native_has_data = native.status.has_data() && native.bytes > 0;

    // Walk the native records: remember every reported name so it is not
    // injected on top, and find where the batch ends.
    let mut write_pos = 0;
    let mut last_record: Option<usize> = None;
    if native_has_data {
        let mut folded = SmallVec::new();
        let mut offset = 0;

        loop {
            if offset + layout.base_len > native.bytes {
                // Malformed record; leave the batch untouched rather than
                // risk corrupting it.
                debug_assert!(false, "native record overruns its batch");
                return Merged::passthrough(native);
            }

            let next = read_u32(buffer, offset) as usize;
            let name_length = read_u32(buffer, offset + layout.name_length_offset) as usize;
            let name_end = offset + layout.base_len + name_length;
            if name_end > native.bytes {
                debug_assert!(false, "native name overruns its batch");
                return Merged::passthrough(native);
            }

            fold_record_name(
                &buffer[offset + layout.base_len..name_end],
                &mut folded,
            );
            // Safety: `fold_record_name` emits `encode_utf8` output only.
            let name = unsafe { std::str::from_utf8_unchecked(&folded) };
            state.already_injected.insert(name.to_string(), ());

            last_record = Some(offset);
            if next == 0 {
                write_pos = name_end;
                break;
            }
            offset += next;
        }
    }

    // Append overlay records while they fit.
    let items = state.items.take().unwrap_or_default();
    let mut injected = 0;

    while state.current_item < items.len() {
        let (name, target) = &items[state.current_item];
        if state.already_injected.get(name).is_some() {
            state.current_item += 1;
            continue;
        }

        let aligned = align_record(write_pos);
        let size = class.record_size(name.encode_utf16().count());
        if aligned + size > buffer.len() {
            if write_pos == 0 && injected == 0 {
                // Not even one record fits; the caller must grow the
                // buffer.
                state.items = Some(items);
                return Merged {
                    status: NtStatus::BufferOverflow,
                    bytes: 0,
                    injected: 0,
                };
            }
            break;
        }

        let mut meta = metadata.metadata_for(&target.full_path()).unwrap_or_default();
        if target.is_directory {
            meta.attributes |= FileAttributes::DIRECTORY;
        }

        buffer[write_pos..aligned].fill(0);
        write_entry(class, &mut buffer[aligned..], name, &meta)
            .expect("record size was checked against the buffer");
        if let Some(previous) = last_record {
            write_u32(buffer, previous, (aligned - previous) as u32);
        }
        last_record = Some(aligned);
        write_pos = aligned + size;

        state.already_injected.insert(name.clone(), ());
        state.current_item += 1;
        state.num_injected += 1;
        injected += 1;
    }

    state.items = Some(items);

    if injected > 0 || native_has_data {
        Merged {
            status: NtStatus::Success,
            bytes: write_pos.max(native.bytes),
            injected,
        }
    } else {
        // Nothing to add and nothing native: the underlying outcome
        // (typically end-of-enumeration) stands.
        Merged::passthrough(native)
    }
}

/// Full merge flow for one intercepted directory-query call.
///
/// `native` runs the original syscall; its first argument is whether the
/// underlying scan must restart. Untracked handles pass straight through.
pub fn query_directory<F>(
    table: &HandleTable,
    manager: &RedirectionManager,
    handle: RawHandle,
    class: InfoClass,
    pattern: Option<&str>,
    restart: bool,
    buffer: &mut [u8],
    metadata: &dyn MetadataSource,
    mut native: F,
) -> Merged
where
    F: FnMut(bool, &mut [u8]) -> NativeBatch,
{
    table.drain_closed();

    let mut state = match table.take_state(handle) {
        Some(state) => state,
        None => return Merged::passthrough(native(restart, buffer)),
    };

    if restart {
        state.reset_enumeration();
    }

    let overlay_path = state.path.clone();
    prepare_state(&mut state, pattern, || {
        manager.overlay_entries(&overlay_path)
    });

    let run_restart = state.take_restart() || restart;
    let batch = native(run_restart, buffer);
    let merged = merge_batch(&mut state, class, buffer, batch, metadata);

    table.put_state(handle, state);
    merged
}

/// Full open flow for one intercepted directory open.
///
/// Directory handles open against the requested path, so the base
/// contents stay enumerable and the merger splices the overlay on top.
/// When the requested path does not exist in the base, the open retries
/// against the redirected path; either way a successful handle is tracked
/// under the requested path.
pub fn open_directory<F>(
    table: &HandleTable,
    manager: &RedirectionManager,
    requested: &str,
    mut native: F,
) -> (NtStatus, Option<RawHandle>)
where
    F: FnMut(&str) -> (NtStatus, Option<RawHandle>),
{
    table.drain_closed();

    let (mut status, mut handle) = native(requested);
    if let Some(redirected) = directory_open_fallback(manager, requested, status) {
        (status, handle) = native(&redirected);
    }

    if status == NtStatus::Success {
        if let Some(handle) = handle {
            table.register(handle, requested.to_string());
        }
    }

    (status, handle)
}

/// Retry policy for directory opens: when the original open fails with
/// name-not-found but a redirect exists, the open is retried against the
/// redirected path so a directory living only inside an overlay becomes
/// visible.
pub fn directory_open_fallback(
    manager: &RedirectionManager,
    requested: &str,
    status: NtStatus,
) -> Option<String> {
    if status != NtStatus::ObjectNameNotFound {
        return None;
    }
    manager.resolve_file(requested)
}
