//! Per-open-handle bookkeeping and the hook-side concurrency primitives.
//!
//! Hooks run on arbitrary application threads and must never wait: the
//! recursion guards are single atomic words, the closed-handle queue is a
//! fixed ring of atomic slots, and the handle table is only locked from
//! normal hook entries (never from the close interceptor, which runs on
//! thread-teardown paths where taking a lock is not an option).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::redirection::Target;
use crate::strmap::StrMap;

/// A raw OS handle value. Never 0 for an open handle.
pub type RawHandle = usize;

/// Default slot count of the closed-handle queue.
const CLOSED_QUEUE_CAPACITY: usize = 64;

static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// A process-unique, nonzero identity for the current thread.
    static THREAD_TOKEN: u64 = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
}

/// The calling thread's nonzero identity token.
pub(crate) fn thread_token() -> u64 {
    THREAD_TOKEN.with(|token| *token)
}

/// A re-entrancy latch for one hooked-call family.
///
/// Holds the owning thread's token, 0 when unlocked. Acquired with a CAS,
/// released with a plain store when the token drops.
pub struct ReentryGuard {
    owner: AtomicU64,
}

/// Outcome of entering a hooked-call family.
#[must_use]
pub enum GuardEntry<'guard> {
    /// First entry on this thread; redirection proceeds and the token
    /// releases the guard on drop.
    Entered(GuardToken<'guard>),
    /// The current thread is already inside this family; the hook must
    /// defer to the original call without redirection.
    Nested,
    /// Another thread holds the word. Recursion is a same-thread
    /// phenomenon, so redirection still proceeds, just without cover.
    Contended,
}

/// Releases a [`ReentryGuard`] on drop.
pub struct GuardToken<'guard> {
    guard: &'guard ReentryGuard,
}

impl Drop for GuardToken<'_> {
    fn drop(&mut self) {
        self.guard.owner.store(0, Ordering::Release);
    }
}

impl ReentryGuard {
    pub const fn new() -> Self {
        Self {
            owner: AtomicU64::new(0),
        }
    }

    /// Attempts to enter the family on the current thread.
    pub fn enter(&self) -> GuardEntry<'_> {
        let token = thread_token();

        if self.owner.load(Ordering::Acquire) == token {
            return GuardEntry::Nested;
        }

        match self
            .owner
            .compare_exchange(0, token, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => GuardEntry::Entered(GuardToken { guard: self }),
            Err(_) => GuardEntry::Contended,
        }
    }
}

impl Default for ReentryGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// One guard per hooked syscall family.
///
/// The directory-query guard is shared between the standard and the Ex
/// variant, which layer on each other inside the kernel.
pub struct RecursionGuards {
    pub create: ReentryGuard,
    pub open: ReentryGuard,
    pub delete: ReentryGuard,
    pub query_directory: ReentryGuard,
    pub query_attributes: ReentryGuard,
    pub query_full_attributes: ReentryGuard,
}

impl RecursionGuards {
    pub const fn new() -> Self {
        Self {
            create: ReentryGuard::new(),
            open: ReentryGuard::new(),
            delete: ReentryGuard::new(),
            query_directory: ReentryGuard::new(),
            query_attributes: ReentryGuard::new(),
            query_full_attributes: ReentryGuard::new(),
        }
    }
}

impl Default for RecursionGuards {
    fn default() -> Self {
        Self::new()
    }
}

/// A fixed-capacity ring written by the close interceptor and drained
/// from normal hook entries.
///
/// Slots are claimed by CAS scan so a full queue refuses the push instead
/// of overwriting; drains are serialized through the `current_thread`
/// slot and scan every slot, so entries pushed mid-drain are picked up by
/// the next drain.
pub struct ClosedHandleQueue {
    /// Token of the draining thread, 0 when no drain is running.
    current_thread: AtomicU64,
    /// Occupied slot count.
    num_items: AtomicUsize,
    /// Handle values; 0 marks a free slot.
    items: Box<[AtomicUsize]>,
}

impl ClosedHandleQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        let mut items = Vec::with_capacity(capacity);
        items.resize_with(capacity, || AtomicUsize::new(0));

        Self {
            current_thread: AtomicU64::new(0),
            num_items: AtomicUsize::new(0),
            items: items.into_boxed_slice(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.items.len()
    }

    /// Records a closed handle. Wait-free; returns `false` when the queue
    /// is full and the close must be picked up by a later full sweep.
    pub fn push(&self, handle: RawHandle) -> bool {
        debug_assert_ne!(handle, 0, "0 is the free-slot sentinel");

        for slot in self.items.iter() {
            if slot
                .compare_exchange(0, handle, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.num_items.fetch_add(1, Ordering::Release);
                return true;
            }
        }

        false
    }

    /// Drains all recorded handles into `consume`.
    ///
    /// Returns immediately when the queue is empty or another thread is
    /// already draining.
    pub fn drain(&self, mut consume: impl FnMut(RawHandle)) {
        if self.num_items.load(Ordering::Acquire) == 0 {
            return;
        }

        let token = thread_token();
        if self
            .current_thread
            .compare_exchange(0, token, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        for slot in self.items.iter() {
            let handle = slot.swap(0, Ordering::AcqRel);
            if handle != 0 {
                self.num_items.fetch_sub(1, Ordering::Release);
                consume(handle);
            }
        }

        self.current_thread.store(0, Ordering::Release);
    }
}

/// Per-open-directory-handle state for the enumeration merger.
#[derive(Debug)]
pub struct HandleState {
    /// The original, pre-redirection path the handle was opened with.
    pub path: String,
    /// The filter pattern of the last enumeration call.
    pub query_pattern: String,
    /// Overlay entries to inject, as `(uppercase name, target)` pairs;
    /// materialized on the first enumeration call.
    pub items: Option<Vec<(String, Target)>>,
    /// Names already emitted in this enumeration.
    pub already_injected: StrMap<()>,
    /// Index of the next item to inject.
    pub current_item: usize,
    /// How many overlay records have been injected on this handle.
    pub num_injected: usize,
    /// Tells the next call to restart the underlying scan.
    pub force_restart: bool,
}

impl HandleState {
    /// Creates the state for a freshly opened handle.
    pub fn new(path: String) -> Self {
        Self {
            path,
            query_pattern: "*".to_string(),
            items: None,
            already_injected: StrMap::new(),
            current_item: 0,
            num_injected: 0,
            force_restart: false,
        }
    }

    /// Resets the merge progress, forcing the underlying scan to restart.
    ///
    /// Used when the caller changes the filter pattern mid-enumeration.
    pub fn reset_enumeration(&mut self) {
        self.items = None;
        self.already_injected.clear();
        self.current_item = 0;
        self.force_restart = true;
    }

    /// Clears and returns the restart flag.
    pub fn take_restart(&mut self) -> bool {
        std::mem::take(&mut self.force_restart)
    }
}

/// All live handle states, keyed by raw handle value.
pub struct HandleTable {
    entries: Mutex<HashMap<RawHandle, HandleState>>,
    closed: ClosedHandleQueue,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::with_queue_capacity(CLOSED_QUEUE_CAPACITY)
    }

    pub fn with_queue_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            closed: ClosedHandleQueue::with_capacity(capacity),
        }
    }

    /// Tracks a successfully opened handle.
    pub fn register(&self, handle: RawHandle, path: String) {
        self.entries.lock().insert(handle, HandleState::new(path));
    }

    /// Runs `operate` on the state of `handle`, if tracked.
    ///
    /// A single OS handle is used by one thread at a time for a given
    /// syscall, so the short table lock is the only synchronization
    /// needed.
    pub fn with_state<R>(
        &self,
        handle: RawHandle,
        operate: impl FnOnce(&mut HandleState) -> R,
    ) -> Option<R> {
        self.entries.lock().get_mut(&handle).map(operate)
    }

    /// Removes and returns the state of `handle` for exclusive use.
    ///
    /// The enumeration path owns the state for the duration of a call so
    /// that no lock is held across the underlying syscall; it is returned
    /// with [`HandleTable::put_state`].
    pub fn take_state(&self, handle: RawHandle) -> Option<HandleState> {
        self.entries.lock().remove(&handle)
    }

    /// Returns a state taken with [`HandleTable::take_state`].
    pub fn put_state(&self, handle: RawHandle, state: HandleState) {
        self.entries.lock().insert(handle, state);
    }

    /// Whether `handle` is currently tracked.
    pub fn contains(&self, handle: RawHandle) -> bool {
        self.entries.lock().contains_key(&handle)
    }

    /// The number of tracked handles.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Records a close from the close interceptor. Never locks.
    pub fn note_closed(&self, handle: RawHandle) -> bool {
        self.closed.push(handle)
    }

    /// Removes every handle the close interceptor has recorded.
    ///
    /// Called from normal hook entries, so a close is always processed
    /// before the next drain point observes its entry.
    pub fn drain_closed(&self) {
        let mut entries = None;
        self.closed.drain(|handle| {
            entries
                .get_or_insert_with(|| self.entries.lock())
                .remove(&handle);
        });
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn nested_entry_is_detected() {
        let guard = ReentryGuard::new();

        let outer = guard.enter();
        assert!(matches!(outer, GuardEntry::Entered(_)));

        assert!(matches!(guard.enter(), GuardEntry::Nested));

        drop(outer);
        assert!(matches!(guard.enter(), GuardEntry::Entered(_)));
    }

    #[test]
    fn a_foreign_owner_reads_as_contended() {
        let guard = ReentryGuard::new();
        let token = guard.enter();
        assert!(matches!(token, GuardEntry::Entered(_)));

        std::thread::scope(|scope| {
            scope
                .spawn(|| {
                    assert!(matches!(guard.enter(), GuardEntry::Contended));
                })
                .join()
                .unwrap();
        });
    }

    #[test]
    fn queue_refuses_pushes_when_full() {
        let queue = ClosedHandleQueue::with_capacity(2);

        assert!(queue.push(10));
        assert!(queue.push(11));
        assert!(!queue.push(12));

        let mut drained = Vec::new();
        queue.drain(|handle| drained.push(handle));
        drained.sort_unstable();
        assert_eq!(drained, [10, 11]);

        // Slots are free again after the drain.
        assert!(queue.push(12));
    }

    #[test]
    fn drain_on_an_empty_queue_is_a_noop() {
        let queue = ClosedHandleQueue::with_capacity(4);
        queue.drain(|_| panic!("nothing to drain"));
    }

    // Open, enumerate, close: the entry must be gone once a drain point
    // runs after the close.
    #[test]
    fn closed_handles_are_removed_at_the_next_drain() {
        let table = HandleTable::new();
        table.register(0x40, "C:\\GAME\\DATA".to_string());
        assert!(table.contains(0x40));

        assert!(table.note_closed(0x40));
        // Not removed yet; the close interceptor cannot touch the table.
        assert!(table.contains(0x40));

        table.drain_closed();
        assert!(!table.contains(0x40));
    }

    #[test]
    fn with_state_mutates_in_place() {
        let table = HandleTable::new();
        table.register(7, "C:\\GAME".to_string());

        table.with_state(7, |state| {
            assert_eq!(state.query_pattern, "*");
            state.current_item = 3;
        });
        let current = table.with_state(7, |state| state.current_item);
        assert_eq!(current, Some(3));

        assert_eq!(table.with_state(8, |_| ()), None);
    }

    #[test]
    fn resetting_enumeration_forces_a_restart() {
        let mut state = HandleState::new("C:\\GAME\\DATA".to_string());
        state.items = Some(Vec::new());
        state.already_injected.insert("A.BIN".to_string(), ());
        state.current_item = 2;

        state.reset_enumeration();

        assert!(state.items.is_none());
        assert_eq!(state.already_injected.len(), 0);
        assert_eq!(state.current_item, 0);
        assert!(state.force_restart);
    }
}
