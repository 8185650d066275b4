#![forbid(unsafe_code)]
//! Segment metadata for EmberFS.
//!
//! Owns the state the garbage collector reads and claims through: the
//! per-segment SIT entries (validity bitmaps, valid counts, mtimes), the
//! dirty seglists with their victim bitmaps and scan cursors, the curseg
//! table, and the free-space counters. The victim-selection policy itself
//! lives in `ember-gc`; this crate holds the registration point and takes
//! the sentry lock around each selection.
//!
//! ## Locking
//!
//! Two locks, always taken in this order:
//!
//! 1. `SitInfo`'s sentry lock — segment entries and the mtime range.
//! 2. `DirtySeglists`' seglist lock — dirty segmaps, victim bitmaps, and
//!    the `last_victim` cursors.

use ember_error::{EmberError, Result};
use ember_types::{Geometry, Secno, Segno, SummaryBlock};
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Segment number that never names a real segment.
pub const NULL_SEGNO: u32 = u32::MAX;

/// Number of dirty seglist categories.
pub const NR_DIRTY_TYPE: usize = 8;

/// Number of active log heads.
pub const DEFAULT_CURSEGS: usize = 6;

/// Background GC triggers only once invalid blocks exceed this share of
/// the user area (percent).
pub const LIMIT_INVALID_BLOCK: u64 = 40;

/// ... and free space has shrunk below this share of the reclaimable
/// area (percent).
pub const LIMIT_FREE_BLOCK: u64 = 40;

// ── Bitmap helpers ──────────────────────────────────────────────────────────

/// Bytes needed to hold `bits` bits.
#[must_use]
pub fn bitmap_bytes(bits: u32) -> usize {
    (bits as usize).div_ceil(8)
}

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx` in a bitmap byte slice. Returns the previous value.
pub fn bitmap_set(bitmap: &mut [u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    let was = (bitmap[byte_idx] >> bit_idx) & 1 == 1;
    bitmap[byte_idx] |= 1 << bit_idx;
    was
}

/// Clear bit `idx` in a bitmap byte slice. Returns the previous value.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    let was = (bitmap[byte_idx] >> bit_idx) & 1 == 1;
    bitmap[byte_idx] &= !(1 << bit_idx);
    was
}

/// Count set bits in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_weight(bitmap: &[u8], count: u32) -> u32 {
    let full_bytes = (count / 8) as usize;
    let remainder = count % 8;
    let mut weight = 0_u32;

    for &byte in bitmap.iter().take(full_bytes) {
        weight += byte.count_ones();
    }
    if remainder > 0 && full_bytes < bitmap.len() {
        let byte = bitmap[full_bytes];
        for bit in 0..remainder {
            if (byte >> bit) & 1 == 1 {
                weight += 1;
            }
        }
    }
    weight
}

/// Find the next set bit at or after `start` in the first `count` bits.
#[must_use]
pub fn bitmap_find_next(bitmap: &[u8], count: u32, start: u32) -> Option<u32> {
    let mut idx = start;
    while idx < count {
        let byte_idx = (idx / 8) as usize;
        if byte_idx >= bitmap.len() {
            return None;
        }
        // Skip whole zero bytes when aligned.
        if idx % 8 == 0 && bitmap[byte_idx] == 0 {
            idx += 8;
            continue;
        }
        if bitmap_get(bitmap, idx) {
            return Some(idx);
        }
        idx += 1;
    }
    None
}

// ── SIT entries ─────────────────────────────────────────────────────────────

/// Per-segment entry: validity bitmap and counts, plus the modification
/// time hint used by the cost-benefit policy.
#[derive(Debug, Clone)]
pub struct SegEntry {
    valid_map: Vec<u8>,
    cur_valid_count: u32,
    ckpt_valid_count: u32,
    mtime: u64,
}

impl SegEntry {
    #[must_use]
    pub fn new(blocks_per_seg: u32) -> Self {
        Self {
            valid_map: vec![0_u8; bitmap_bytes(blocks_per_seg)],
            cur_valid_count: 0,
            ckpt_valid_count: 0,
            mtime: 0,
        }
    }

    #[must_use]
    pub fn is_valid(&self, off: u32) -> bool {
        bitmap_get(&self.valid_map, off)
    }

    /// Mark block `off` valid or invalid, keeping the live count in step.
    pub fn set_valid(&mut self, off: u32, valid: bool) {
        let was = if valid {
            bitmap_set(&mut self.valid_map, off)
        } else {
            bitmap_clear(&mut self.valid_map, off)
        };
        if valid && !was {
            self.cur_valid_count += 1;
        } else if !valid && was {
            self.cur_valid_count -= 1;
        }
    }

    #[must_use]
    pub fn cur_valid_count(&self) -> u32 {
        self.cur_valid_count
    }

    #[must_use]
    pub fn ckpt_valid_count(&self) -> u32 {
        self.ckpt_valid_count
    }

    /// Record the checkpoint-stable valid count.
    pub fn set_ckpt_valid_count(&mut self, count: u32) {
        self.ckpt_valid_count = count;
    }

    #[must_use]
    pub fn mtime(&self) -> u64 {
        self.mtime
    }

    pub fn set_mtime(&mut self, mtime: u64) {
        self.mtime = mtime;
    }

    #[must_use]
    pub fn valid_map_bytes(&self) -> usize {
        self.valid_map.len()
    }
}

/// State behind the sentry lock.
#[derive(Debug)]
pub struct SitState {
    entries: Vec<SegEntry>,
    /// Observed mtime range. Widened when out-of-range values appear
    /// (the system clock may move backward), never narrowed.
    pub min_mtime: u64,
    pub max_mtime: u64,
}

impl SitState {
    #[must_use]
    pub fn entry(&self, segno: Segno) -> &SegEntry {
        &self.entries[segno.0 as usize]
    }

    pub fn entry_mut(&mut self, segno: Segno) -> &mut SegEntry {
        &mut self.entries[segno.0 as usize]
    }

    /// Valid blocks over the aligned group of `1 << log_unit` segments
    /// containing `segno`.
    #[must_use]
    pub fn valid_blocks(&self, geometry: &Geometry, segno: Segno, log_unit: u32) -> u32 {
        let start = (segno.0 >> log_unit) << log_unit;
        let mut total = 0;
        for i in 0..(1 << log_unit) {
            total += self.entries[(start + i) as usize].cur_valid_count();
        }
        total
    }

    /// Widen the observed mtime range to cover `mtime`.
    pub fn update_mtime_range(&mut self, mtime: u64) {
        if mtime < self.min_mtime {
            self.min_mtime = mtime;
        }
        if mtime > self.max_mtime {
            self.max_mtime = mtime;
        }
    }
}

/// Segment information table. The mutex is the sentry lock.
#[derive(Debug)]
pub struct SitInfo {
    state: Mutex<SitState>,
}

impl SitInfo {
    #[must_use]
    pub fn new(geometry: &Geometry) -> Self {
        let entries = (0..geometry.total_segs())
            .map(|_| SegEntry::new(geometry.blocks_per_seg()))
            .collect();
        Self {
            state: Mutex::new(SitState {
                entries,
                min_mtime: u64::MAX,
                max_mtime: 0,
            }),
        }
    }

    /// Take the sentry lock.
    pub fn lock(&self) -> MutexGuard<'_, SitState> {
        self.state.lock()
    }

    /// Whether block `off` of `segno` is still valid. Takes the sentry
    /// lock for the duration of the check.
    #[must_use]
    pub fn check_valid_map(&self, segno: Segno, off: u32) -> bool {
        self.state.lock().entry(segno).is_valid(off)
    }

    /// Valid blocks over the section unit containing `segno`.
    #[must_use]
    pub fn valid_blocks(&self, geometry: &Geometry, segno: Segno, log_unit: u32) -> u32 {
        self.state.lock().valid_blocks(geometry, segno, log_unit)
    }
}

// ── Dirty seglists ──────────────────────────────────────────────────────────

/// Dirty seglist categories: one bitmap per data/node temperature, the
/// plain dirty list scanned by LFS reclamation, and the prefree list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DirtyType {
    HotData = 0,
    WarmData = 1,
    ColdData = 2,
    HotNode = 3,
    WarmNode = 4,
    ColdNode = 5,
    Dirty = 6,
    Prefree = 7,
}

impl DirtyType {
    pub const ALL: [Self; NR_DIRTY_TYPE] = [
        Self::HotData,
        Self::WarmData,
        Self::ColdData,
        Self::HotNode,
        Self::WarmNode,
        Self::ColdNode,
        Self::Dirty,
        Self::Prefree,
    ];

    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Whether this is one of the per-temperature sub-dirty categories.
    #[must_use]
    pub fn is_temperature(self) -> bool {
        (self as usize) < DirtyType::Dirty as usize
    }
}

/// Which path is collecting: the background worker or a caller that ran
/// out of free sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GcKind {
    Background = 0,
    Foreground = 1,
}

impl GcKind {
    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// State behind the seglist lock.
///
/// `last_victim` is indexed by the selection algorithm (greedy = 0,
/// cost-benefit = 1) and is only read or written under this lock.
#[derive(Debug)]
pub struct DirtyState {
    pub dirty_segmap: [Vec<u8>; NR_DIRTY_TYPE],
    pub nr_dirty: [usize; NR_DIRTY_TYPE],
    pub victim_segmap: [Vec<u8>; 2],
    pub last_victim: [u32; 2],
}

/// Dirty segment lists and victim bitmaps. The mutex is the seglist lock.
#[derive(Debug)]
pub struct DirtySeglists {
    total_segs: u32,
    state: Mutex<DirtyState>,
}

impl DirtySeglists {
    #[must_use]
    pub fn new(geometry: &Geometry) -> Self {
        let total_segs = geometry.total_segs();
        let bytes = bitmap_bytes(total_segs);
        Self {
            total_segs,
            state: Mutex::new(DirtyState {
                dirty_segmap: std::array::from_fn(|_| vec![0_u8; bytes]),
                nr_dirty: [0; NR_DIRTY_TYPE],
                victim_segmap: std::array::from_fn(|_| vec![0_u8; bytes]),
                last_victim: [0; 2],
            }),
        }
    }

    /// Take the seglist lock.
    pub fn lock(&self) -> MutexGuard<'_, DirtyState> {
        self.state.lock()
    }

    #[must_use]
    pub fn total_segs(&self) -> u32 {
        self.total_segs
    }

    /// Add `segno` to a temperature list and the plain dirty list.
    pub fn mark_dirty(&self, segno: Segno, temperature: DirtyType) {
        let mut state = self.state.lock();
        for ty in [temperature, DirtyType::Dirty] {
            if !bitmap_set(&mut state.dirty_segmap[ty.index()], segno.0) {
                state.nr_dirty[ty.index()] += 1;
            }
            if !temperature.is_temperature() {
                break;
            }
        }
        trace!(
            target: "ember::segment",
            event = "segment_dirtied",
            segno = segno.0,
            temperature = ?temperature
        );
    }

    /// Remove `segno` from every dirty list (it became free or prefree).
    pub fn clear_dirty(&self, segno: Segno) {
        let mut state = self.state.lock();
        for ty in DirtyType::ALL {
            if ty == DirtyType::Prefree {
                continue;
            }
            if bitmap_clear(&mut state.dirty_segmap[ty.index()], segno.0) {
                state.nr_dirty[ty.index()] -= 1;
            }
        }
    }

    /// Move `segno` to the prefree list.
    pub fn mark_prefree(&self, segno: Segno) {
        let mut state = self.state.lock();
        if !bitmap_set(
            &mut state.dirty_segmap[DirtyType::Prefree.index()],
            segno.0,
        ) {
            state.nr_dirty[DirtyType::Prefree.index()] += 1;
        }
    }

    #[must_use]
    pub fn nr_dirty(&self, ty: DirtyType) -> usize {
        self.state.lock().nr_dirty[ty.index()]
    }

    #[must_use]
    pub fn is_victim(&self, kind: GcKind, segno: Segno) -> bool {
        bitmap_get(&self.state.lock().victim_segmap[kind.index()], segno.0)
    }

    /// Release a claimed victim (the segment was freed, or the claim is
    /// being handed over).
    pub fn clear_victim(&self, kind: GcKind, segno: Segno) {
        bitmap_clear(&mut self.state.lock().victim_segmap[kind.index()], segno.0);
    }
}

// ── Curseg table ────────────────────────────────────────────────────────────

/// Active log heads, one per data/node temperature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CursegType {
    HotData = 0,
    WarmData = 1,
    ColdData = 2,
    HotNode = 3,
    WarmNode = 4,
    ColdNode = 5,
}

impl CursegType {
    pub const ALL: [Self; DEFAULT_CURSEGS] = [
        Self::HotData,
        Self::WarmData,
        Self::ColdData,
        Self::HotNode,
        Self::WarmNode,
        Self::ColdNode,
    ];

    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Current segment per log head. Sections holding a curseg are never
/// victim candidates.
#[derive(Debug)]
pub struct CursegTable {
    segnos: [AtomicU32; DEFAULT_CURSEGS],
}

impl CursegTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            segnos: std::array::from_fn(|_| AtomicU32::new(NULL_SEGNO)),
        }
    }

    #[must_use]
    pub fn curseg(&self, ty: CursegType) -> Option<Segno> {
        let raw = self.segnos[ty.index()].load(Ordering::Acquire);
        (raw != NULL_SEGNO).then_some(Segno(raw))
    }

    pub fn set_curseg(&self, ty: CursegType, segno: Segno) {
        self.segnos[ty.index()].store(segno.0, Ordering::Release);
    }

    /// Whether `secno` holds any active log head.
    #[must_use]
    pub fn is_cur_sec(&self, geometry: &Geometry, secno: Secno) -> bool {
        CursegType::ALL
            .iter()
            .filter_map(|ty| self.curseg(*ty))
            .any(|segno| geometry.secno_of(segno) == secno)
    }
}

impl Default for CursegTable {
    fn default() -> Self {
        Self::new()
    }
}

// ── Free-space accounting ───────────────────────────────────────────────────

/// Free segment/section counters maintained by the allocation and
/// checkpoint paths, read by GC.
#[derive(Debug)]
pub struct FreeInfo {
    free_segments: AtomicU32,
    free_sections: AtomicU32,
}

impl FreeInfo {
    #[must_use]
    pub fn new(free_segments: u32, free_sections: u32) -> Self {
        Self {
            free_segments: AtomicU32::new(free_segments),
            free_sections: AtomicU32::new(free_sections),
        }
    }

    #[must_use]
    pub fn free_segments(&self) -> u32 {
        self.free_segments.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn free_sections(&self) -> u32 {
        self.free_sections.load(Ordering::Acquire)
    }

    pub fn set_free_segments(&self, count: u32) {
        self.free_segments.store(count, Ordering::Release);
    }

    pub fn set_free_sections(&self, count: u32) {
        self.free_sections.store(count, Ordering::Release);
    }

    pub fn add_free_sections(&self, count: u32) {
        self.free_sections.fetch_add(count, Ordering::AcqRel);
        self.free_segments.fetch_add(count, Ordering::AcqRel);
    }
}

// ── Victim selection seam ───────────────────────────────────────────────────

/// What the caller wants a victim for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VictimTarget {
    /// LFS reclamation: scan the plain dirty list a section at a time.
    Reclaim,
    /// Slack-space recycling into a specific temperature list, a segment
    /// at a time.
    Ssr(DirtyType),
}

/// Victim-selection policy dispatch. The GC core registers its default
/// greedy/cost-benefit implementation at manager build time; alternative
/// policies can be swapped in.
pub trait VictimSelection: Send + Sync {
    /// Pick a victim. Called with the sentry lock held (`sit` is the
    /// guarded state); takes the seglist lock internally.
    fn get_victim(
        &self,
        seg: &SegManager,
        sit: &mut SitState,
        kind: GcKind,
        target: VictimTarget,
    ) -> Option<Segno>;
}

// ── Segment manager ─────────────────────────────────────────────────────────

/// The segment manager handle: geometry plus every metadata structure
/// the GC core consults.
pub struct SegManager {
    geometry: Geometry,
    sit: SitInfo,
    dirty: DirtySeglists,
    cursegs: CursegTable,
    free: FreeInfo,
    written_blocks: AtomicU64,
    valid_user_blocks: AtomicU64,
    summaries: Mutex<HashMap<u32, Arc<SummaryBlock>>>,
    v_ops: RwLock<Option<Arc<dyn VictimSelection>>>,
}

impl std::fmt::Debug for SegManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegManager")
            .field("geometry", &self.geometry)
            .field("free_segments", &self.free.free_segments())
            .field("free_sections", &self.free.free_sections())
            .finish_non_exhaustive()
    }
}

impl SegManager {
    #[must_use]
    pub fn new(geometry: Geometry) -> Self {
        let sit = SitInfo::new(&geometry);
        let dirty = DirtySeglists::new(&geometry);
        let free = FreeInfo::new(geometry.total_segs(), geometry.total_sections());
        Self {
            geometry,
            sit,
            dirty,
            cursegs: CursegTable::new(),
            free,
            written_blocks: AtomicU64::new(0),
            valid_user_blocks: AtomicU64::new(0),
            summaries: Mutex::new(HashMap::new()),
            v_ops: RwLock::new(None),
        }
    }

    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    #[must_use]
    pub fn sit(&self) -> &SitInfo {
        &self.sit
    }

    #[must_use]
    pub fn dirty(&self) -> &DirtySeglists {
        &self.dirty
    }

    #[must_use]
    pub fn cursegs(&self) -> &CursegTable {
        &self.cursegs
    }

    #[must_use]
    pub fn free(&self) -> &FreeInfo {
        &self.free
    }

    // ── Victim selection ────────────────────────────────────────────────

    /// Install the victim-selection policy.
    pub fn register_victim_selector(&self, ops: Arc<dyn VictimSelection>) {
        debug!(target: "ember::segment", event = "victim_selector_registered");
        *self.v_ops.write() = Some(ops);
    }

    /// Remove the installed policy (manager teardown).
    pub fn unregister_victim_selector(&self) {
        *self.v_ops.write() = None;
    }

    /// Pick a victim under the sentry lock via the registered policy.
    #[must_use]
    pub fn get_victim(&self, kind: GcKind, target: VictimTarget) -> Option<Segno> {
        let ops = self.v_ops.read().clone()?;
        let mut sit = self.sit.lock();
        let victim = ops.get_victim(self, &mut sit, kind, target);
        trace!(
            target: "ember::segment",
            event = "victim_selected",
            kind = ?kind,
            victim = victim.map_or(NULL_SEGNO, |s| s.0)
        );
        victim
    }

    // ── Summary blocks ──────────────────────────────────────────────────

    /// Install the summary block for `segno` (log allocation path).
    pub fn set_summary(&self, segno: Segno, summary: Arc<SummaryBlock>) {
        self.summaries.lock().insert(segno.0, summary);
    }

    /// Read the summary block of `segno`. A missing or short summary is
    /// fatal to the reclaimer.
    pub fn read_summary(&self, segno: Segno) -> Result<Arc<SummaryBlock>> {
        let summaries = self.summaries.lock();
        let summary = summaries
            .get(&segno.0)
            .ok_or_else(|| EmberError::SummaryCorrupt {
                segno: segno.0,
                detail: "summary block unreadable".to_owned(),
            })?;
        if summary.len() != self.geometry.blocks_per_seg() as usize {
            return Err(EmberError::SummaryCorrupt {
                segno: segno.0,
                detail: format!(
                    "summary holds {} entries, segment has {}",
                    summary.len(),
                    self.geometry.blocks_per_seg()
                ),
            });
        }
        Ok(Arc::clone(summary))
    }

    #[must_use]
    pub fn summary_count(&self) -> usize {
        self.summaries.lock().len()
    }

    // ── Block accounting ────────────────────────────────────────────────

    #[must_use]
    pub fn written_block_count(&self) -> u64 {
        self.written_blocks.load(Ordering::Acquire)
    }

    pub fn set_written_block_count(&self, count: u64) {
        self.written_blocks.store(count, Ordering::Release);
    }

    #[must_use]
    pub fn valid_user_blocks(&self) -> u64 {
        self.valid_user_blocks.load(Ordering::Acquire)
    }

    pub fn set_valid_user_blocks(&self, count: u64) {
        self.valid_user_blocks.store(count, Ordering::Release);
    }

    /// Percent of the user area holding valid blocks.
    #[must_use]
    pub fn utilization(&self) -> u64 {
        self.valid_user_blocks() * 100 / self.geometry.user_block_count()
    }

    // ── Free-space queries ──────────────────────────────────────────────

    #[must_use]
    pub fn free_segments(&self) -> u32 {
        self.free.free_segments()
    }

    #[must_use]
    pub fn free_sections(&self) -> u32 {
        self.free.free_sections()
    }

    #[must_use]
    pub fn reserved_sections(&self) -> u32 {
        self.geometry.reserved_sections()
    }

    /// Blocks usable for new data once overprovisioning is set aside.
    #[must_use]
    pub fn free_user_blocks(&self) -> u64 {
        let free_segments = u64::from(self.free.free_segments());
        let overprovision = u64::from(self.geometry.overprovision_segments());
        if free_segments < overprovision {
            0
        } else {
            (free_segments - overprovision) << self.geometry.log_blocks_per_seg()
        }
    }

    fn limit_invalid_user_blocks(&self) -> u64 {
        self.geometry.user_block_count() * LIMIT_INVALID_BLOCK / 100
    }

    fn limit_free_user_blocks(&self) -> u64 {
        let reclaimable = self
            .geometry
            .user_block_count()
            .saturating_sub(self.written_block_count());
        reclaimable * LIMIT_FREE_BLOCK / 100
    }

    /// Background GC trigger: a meaningful share of the user area is
    /// invalidated and free space is running low.
    #[must_use]
    pub fn has_enough_invalid_blocks(&self) -> bool {
        let invalid = self
            .geometry
            .user_block_count()
            .saturating_sub(self.written_block_count());
        invalid > self.limit_invalid_user_blocks()
            && self.free_user_blocks() < self.limit_free_user_blocks()
    }

    #[must_use]
    pub fn dirty_segments(&self) -> usize {
        self.dirty.nr_dirty(DirtyType::Dirty)
    }

    #[must_use]
    pub fn prefree_segments(&self) -> usize {
        self.dirty.nr_dirty(DirtyType::Prefree)
    }
}
