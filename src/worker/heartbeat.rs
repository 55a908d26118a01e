//! Shared heartbeat counters.
//!
//! Each worker owns one counter ("tick") in a page of anonymous shared memory.
//! Pages are mapped `MAP_SHARED` so a worker forked after the page exists
//! writes to the same memory the master reads. Pages are allocated lazily and
//! are never unmapped while the store or any slot still references them.
//!
//! ```text
//!   index:    0   1   2   3 | 4   5   6   7 | 8 ...
//!   page:     0             | 1             | 2
//!   offset:   0   1   2   3 | 0   1   2   3 | 0
//! ```

use crate::error::{PreforkError, Result};
use nix::sys::mman::{MapFlags, ProtFlags, mmap_anonymous, munmap};
use nix::unistd::{SysconfVar, sysconf};
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Fallback when the platform page size cannot be queried.
const FALLBACK_PAGE_SIZE: usize = 4096;

/// Upper bound on slots per page (64 MiB of counters per page).
pub const MAX_SLOTS_PER_PAGE: usize = 1 << 20;

/// One counter, padded to a cache line so neighbouring workers never share one.
#[repr(C, align(64))]
struct Cell {
    value: AtomicU64,
}

/// Bytes occupied by one slot.
pub const SLOT_SIZE: usize = std::mem::size_of::<Cell>();

/// Default number of slots per page for this platform.
pub fn default_slots_per_page() -> usize {
    let page_size = sysconf(SysconfVar::PAGE_SIZE)
        .ok()
        .flatten()
        .and_then(|size| usize::try_from(size).ok())
        .unwrap_or(FALLBACK_PAGE_SIZE);
    (page_size / SLOT_SIZE).max(1)
}

/// Where a worker's counter lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotLocation {
    pub page: usize,
    pub offset: usize,
}

/// A mapped page of counters.
struct Page {
    base: NonNull<Cell>,
    len: usize,
    slots: usize,
}

// Cells are atomics; the mapping itself is never moved or resized.
unsafe impl Send for Page {}
unsafe impl Sync for Page {}

impl Page {
    fn map(slots: usize) -> std::result::Result<Self, nix::errno::Errno> {
        let len = slots
            .checked_mul(SLOT_SIZE)
            .ok_or(nix::errno::Errno::ENOMEM)?;
        let length = NonZeroUsize::new(len).ok_or(nix::errno::Errno::EINVAL)?;
        // Anonymous mappings come back zero-filled and page aligned.
        let base = unsafe {
            mmap_anonymous(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
            )?
        };
        Ok(Self {
            base: base.cast(),
            len,
            slots,
        })
    }

    fn cell(&self, offset: usize) -> &Cell {
        assert!(offset < self.slots, "heartbeat offset out of range");
        unsafe { &*self.base.as_ptr().add(offset) }
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        if let Err(e) = unsafe { munmap(self.base.cast(), self.len) } {
            debug!(error = %e, "Failed to unmap heartbeat page");
        }
    }
}

/// Paged store of heartbeat counters, indexed by worker number.
///
/// Pages are keyed by page number, so a large index maps only its own page.
pub struct HeartbeatStore {
    slots_per_page: usize,
    pages: BTreeMap<usize, Arc<Page>>,
}

impl HeartbeatStore {
    /// Create a store using the platform page geometry.
    pub fn new() -> Self {
        Self {
            slots_per_page: default_slots_per_page().min(MAX_SLOTS_PER_PAGE),
            pages: BTreeMap::new(),
        }
    }

    /// Create a store with an explicit number of slots per page.
    pub fn with_slots_per_page(slots_per_page: usize) -> Result<Self> {
        check_slots_per_page(slots_per_page)?;
        Ok(Self {
            slots_per_page,
            pages: BTreeMap::new(),
        })
    }

    pub fn slots_per_page(&self) -> usize {
        self.slots_per_page
    }

    /// Map a worker index to its page and offset.
    pub fn location(&self, index: usize) -> SlotLocation {
        SlotLocation {
            page: index / self.slots_per_page,
            offset: index % self.slots_per_page,
        }
    }

    /// Number of pages mapped so far.
    pub fn pages_allocated(&self) -> usize {
        self.pages.len()
    }

    /// Return the counter for `index`, mapping its page on first use.
    pub fn slot_for(&mut self, index: usize) -> Result<HeartbeatSlot> {
        let location = self.location(index);

        let page = match self.pages.get(&location.page) {
            Some(page) => Arc::clone(page),
            None => {
                let page = Arc::new(
                    Page::map(self.slots_per_page)
                        .map_err(|source| PreforkError::Heartbeat { index, source })?,
                );
                debug!(
                    page = location.page,
                    slots = self.slots_per_page,
                    "Mapped heartbeat page"
                );
                self.pages.insert(location.page, Arc::clone(&page));
                page
            }
        };

        Ok(HeartbeatSlot { page, location })
    }
}

/// Reject page geometries that are empty or too large to map.
pub fn check_slots_per_page(slots_per_page: usize) -> Result<()> {
    if slots_per_page == 0 {
        return Err(PreforkError::Config(
            "heartbeat slots per page must be non-zero".into(),
        ));
    }
    if slots_per_page > MAX_SLOTS_PER_PAGE {
        return Err(PreforkError::Config(format!(
            "heartbeat slots per page must be at most {}, got {}",
            MAX_SLOTS_PER_PAGE, slots_per_page
        )));
    }
    Ok(())
}

impl Default for HeartbeatStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HeartbeatStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatStore")
            .field("slots_per_page", &self.slots_per_page)
            .field("pages_allocated", &self.pages_allocated())
            .finish()
    }
}

/// Handle to one worker's counter.
///
/// Single writer (the worker), many readers (the master). Loads and stores
/// are relaxed: readers only care whether the value changed.
#[derive(Clone)]
pub struct HeartbeatSlot {
    page: Arc<Page>,
    location: SlotLocation,
}

impl HeartbeatSlot {
    pub fn location(&self) -> SlotLocation {
        self.location
    }

    pub fn get(&self) -> u64 {
        self.page
            .cell(self.location.offset)
            .value
            .load(Ordering::Relaxed)
    }

    pub fn set(&self, value: u64) {
        self.page
            .cell(self.location.offset)
            .value
            .store(value, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for HeartbeatSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatSlot")
            .field("location", &self.location)
            .field("tick", &self.get())
            .finish()
    }
}

/// Master-side staleness tracking for one worker's tick.
#[derive(Debug, Clone)]
pub struct TickWatch {
    last_tick: u64,
    changed_at: Instant,
}

impl TickWatch {
    pub fn new(tick: u64, now: Instant) -> Self {
        Self {
            last_tick: tick,
            changed_at: now,
        }
    }

    /// Record an observation. Returns true if the tick moved.
    pub fn observe(&mut self, tick: u64, now: Instant) -> bool {
        if tick != self.last_tick {
            self.last_tick = tick;
            self.changed_at = now;
            true
        } else {
            false
        }
    }

    /// Whether the tick has not moved for longer than `timeout`.
    pub fn is_stale(&self, timeout: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.changed_at) > timeout
    }

    pub fn last_tick(&self) -> u64 {
        self.last_tick
    }
}
