#![forbid(unsafe_code)]
//! Garbage collector core for EmberFS.
//!
//! Segments fill append-only and accumulate invalidated blocks as user
//! writes supersede them; this crate reclaims that space. A victim
//! segment is chosen under a pluggable policy, its still-valid blocks are
//! marked dirty so the writeback path relocates them, and the segment
//! eventually returns to the free pool at the next checkpoint.
//!
//! The pieces:
//!
//! - the default victim-selection policy (greedy for foreground,
//!   cost-benefit for background),
//! - per-segment reclaimers for node and data segments,
//! - the reclamation loop ([`run_gc`]) that interleaves reclamation with
//!   checkpointing to honor free-space reservations,
//! - the background worker ([`start_gc_thread`]) and its adaptive sleep
//!   controller,
//! - the operator statistics surface ([`render_status_report`]).
//!
//! Collaborators (node manager, page cache, checkpoint, writeback) are
//! reached through the traits defined here; [`Mount`] bundles them with
//! the segment manager.

mod daemon;
mod stats;
mod victim;

pub use daemon::{
    decrease_sleep_time, increase_sleep_time, start_gc_thread, GcDaemon, GcDaemonConfig,
    MAX_SLEEP, MIN_SLEEP, NOGC_SLEEP,
};
pub use stats::{
    render_mem_report, render_sit_report, render_status_report, update_gc_metric, update_stats,
    GcStatSnapshot, SitStat,
};
pub use victim::DefaultVictimSelector;

use ember_error::{EmberError, Result};
use ember_segment::{GcKind, SegManager, VictimTarget};
use ember_types::{
    indirect_node_span, BlockAddr, Geometry, Ino, Nid, NodeInfo, Segno, Summary, SummaryBlock,
    SummaryType, ADDRS_PER_BLOCK, ADDRS_PER_INODE, NIDS_PER_BLOCK,
};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, trace, warn};

/// Cost-evaluated candidates examined per selector call before the scan
/// cursor is persisted and the search yields.
pub const MAX_VICTIM_SEARCH: u32 = 4096;

// ── Collaborator interfaces ─────────────────────────────────────────────────

/// Handle to a node page held in the node manager's cache.
///
/// Dropping the handle releases the page reference.
pub trait NodePage: Send + Sync {
    fn nid(&self) -> Nid;
    fn is_under_writeback(&self) -> bool;
    fn set_dirty(&self);
    /// Offset of this node within its inode's node tree.
    fn ofs_of_node(&self) -> u32;
    /// Data block address stored in this dnode at `ofs_in_node`.
    fn data_blkaddr(&self, ofs_in_node: u16) -> BlockAddr;
}

/// Node manager (NAT + node page cache) as seen by the collector.
pub trait NodeManager: Send + Sync {
    /// Start an asynchronous read of the node page.
    fn ra_node_page(&self, nid: Nid);
    /// Fetch the node page, waiting for I/O. `None` on a transient read
    /// failure; the caller skips the block.
    fn get_node_page(&self, nid: Nid) -> Option<Arc<dyn NodePage>>;
    /// Resolve the current owner and version of `nid`.
    fn get_node_info(&self, nid: Nid) -> Option<NodeInfo>;
    /// Write back dirty node pages; `ino = None` selects every inode.
    /// Returns the number of pages written.
    fn sync_node_pages(&self, ino: Option<Ino>, sync_all: bool, max_pages: u64) -> u64;
    /// Dirty node pages currently outstanding.
    fn dirty_node_pages(&self) -> u64;
}

/// Live inode handle. Dropping it releases the reference.
pub trait Inode: Send + Sync {
    fn ino(&self) -> Ino;
    fn is_dir(&self) -> bool;
}

/// Handle to a data page pinned in the page cache.
pub trait DataPage: Send + Sync {
    /// Whether the page still belongs to `ino`'s mapping.
    fn is_mapped_to(&self, ino: Ino) -> bool;
    fn is_under_writeback(&self) -> bool;
    fn set_dirty(&self);
    /// Clear the dirty bit for writeback. Returns whether it was dirty.
    fn clear_dirty_for_io(&self) -> bool;
    fn set_cold(&self);
    fn clear_cold(&self);
    /// Write the page out through the data path, relocating it.
    fn write_data(&self) -> Result<()>;
}

/// Page cache and inode cache as seen by the collector.
pub trait PageCache: Send + Sync {
    /// Grab an inode handle without waiting on one that is still loading.
    fn iget_nowait(&self, ino: Ino) -> Option<Arc<dyn Inode>>;
    /// Look up a data page, reading it in if necessary, without locking it.
    fn find_data_page(&self, ino: Ino, bidx: u64) -> Option<Arc<dyn DataPage>>;
    /// Look up a data page and return it locked for relocation.
    fn get_lock_data_page(&self, ino: Ino, bidx: u64) -> Option<Arc<dyn DataPage>>;
    /// A dirty dentry page of `ino` was cleaned outside writeback.
    fn dec_dirty_dents(&self, ino: Ino);
    fn dirty_dent_pages(&self) -> u64;
    fn dirty_meta_pages(&self) -> u64;
}

/// Checkpoint subsystem as seen by the collector.
pub trait CheckpointOps: Send + Sync {
    /// Whether the dirty-node budget for the next checkpoint is spent.
    fn should_do_checkpoint(&self) -> bool;
    /// Take the checkpoint mutex and freeze filesystem operations. A
    /// reclaimer calls this exactly once before reporting
    /// [`GcStatus::Blocked`]; the paired
    /// `write_checkpoint(blocked = true, ..)` releases the mutex.
    fn block_operations(&self);
    fn write_checkpoint(&self, blocked: bool, unmount: bool);
    /// Let the filesystem rebalance itself (may trigger a checkpoint).
    fn balance_fs(&self);
}

/// Writeback and block-layer state as seen by the collector.
pub trait IoState: Send + Sync {
    fn writeback_pages(&self) -> u64;
    fn pending_requests(&self) -> u64;
    /// Submit the accumulated data bio.
    fn submit_data_bio(&self, sync: bool);
}

// ── Mount ───────────────────────────────────────────────────────────────────

/// Mount options consulted by the collector.
#[derive(Debug, Clone)]
pub struct MountOptions {
    /// Run the background worker's reclamation cycles.
    pub background_gc: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self { background_gc: true }
    }
}

/// GC activity counters, exported through the statistics surface.
#[derive(Debug, Default)]
pub struct GcCounters {
    call_count: AtomicU64,
    bg_gc_runs: AtomicU64,
    node_segs: AtomicU64,
    data_segs: AtomicU64,
    node_blocks_moved: AtomicU64,
    data_blocks_moved: AtomicU64,
}

impl GcCounters {
    #[must_use]
    pub fn call_count(&self) -> u64 {
        self.call_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn bg_gc_runs(&self) -> u64 {
        self.bg_gc_runs.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn node_segs(&self) -> u64 {
        self.node_segs.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn data_segs(&self) -> u64 {
        self.data_segs.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn node_blocks_moved(&self) -> u64 {
        self.node_blocks_moved.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn data_blocks_moved(&self) -> u64 {
        self.data_blocks_moved.load(Ordering::Relaxed)
    }

    pub(crate) fn inc_call_count(&self) {
        self.call_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_bg_gc(&self) {
        self.bg_gc_runs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_seg(&self, footer: SummaryType) {
        match footer {
            SummaryType::Node => self.node_segs.fetch_add(1, Ordering::Relaxed),
            SummaryType::Data => self.data_segs.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub(crate) fn inc_node_blocks(&self, count: u64) {
        self.node_blocks_moved.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn inc_data_blocks(&self, count: u64) {
        self.data_blocks_moved.fetch_add(count, Ordering::Relaxed);
    }
}

/// Recorded result of the most recent reclamation-loop call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LastGcStatus {
    #[default]
    None,
    NoVictim,
    Done,
    Blocked,
    Error,
}

/// The mounted filesystem as the collector sees it: geometry, segment
/// metadata, collaborator handles, and the GC locks.
pub struct Mount {
    seg: Arc<SegManager>,
    nodes: Arc<dyn NodeManager>,
    pages: Arc<dyn PageCache>,
    checkpoint: Arc<dyn CheckpointOps>,
    io: Arc<dyn IoState>,
    options: MountOptions,
    gc_mutex: Mutex<()>,
    data_write_lock: Mutex<()>,
    mounted: AtomicBool,
    counters: GcCounters,
    last_gc_status: Mutex<LastGcStatus>,
}

impl Mount {
    #[must_use]
    pub fn new(
        seg: Arc<SegManager>,
        nodes: Arc<dyn NodeManager>,
        pages: Arc<dyn PageCache>,
        checkpoint: Arc<dyn CheckpointOps>,
        io: Arc<dyn IoState>,
        options: MountOptions,
    ) -> Self {
        Self {
            seg,
            nodes,
            pages,
            checkpoint,
            io,
            options,
            gc_mutex: Mutex::new(()),
            data_write_lock: Mutex::new(()),
            mounted: AtomicBool::new(true),
            counters: GcCounters::default(),
            last_gc_status: Mutex::new(LastGcStatus::None),
        }
    }

    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        self.seg.geometry()
    }

    #[must_use]
    pub fn seg(&self) -> &SegManager {
        &self.seg
    }

    #[must_use]
    pub fn nodes(&self) -> &dyn NodeManager {
        self.nodes.as_ref()
    }

    #[must_use]
    pub fn pages(&self) -> &dyn PageCache {
        self.pages.as_ref()
    }

    #[must_use]
    pub fn checkpoint(&self) -> &dyn CheckpointOps {
        self.checkpoint.as_ref()
    }

    #[must_use]
    pub fn io(&self) -> &dyn IoState {
        self.io.as_ref()
    }

    #[must_use]
    pub fn options(&self) -> &MountOptions {
        &self.options
    }

    #[must_use]
    pub fn counters(&self) -> &GcCounters {
        &self.counters
    }

    #[must_use]
    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::Acquire)
    }

    /// Stop new reclamation rounds (unmount in progress).
    pub fn set_unmounted(&self) {
        self.mounted.store(false, Ordering::Release);
    }

    /// Serialize all GC activity, blocking.
    pub fn lock_gc(&self) -> MutexGuard<'_, ()> {
        self.gc_mutex.lock()
    }

    /// Serialize all GC activity without blocking.
    pub fn try_lock_gc(&self) -> Option<MutexGuard<'_, ()>> {
        self.gc_mutex.try_lock()
    }

    /// Whether the I/O subsystem is quiet enough for background GC.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.io.writeback_pages() == 0 && self.io.pending_requests() == 0
    }

    /// Whether free sections no longer cover the dirty node and dentry
    /// pages the next checkpoint must be able to write, plus the reserve.
    #[must_use]
    pub fn has_not_enough_free_secs(&self) -> bool {
        let geometry = self.geometry();
        let node_secs = geometry.sections_for_pages(self.nodes.dirty_node_pages());
        let dent_secs = geometry.sections_for_pages(self.pages.dirty_dent_pages());
        self.seg.free_sections() <= node_secs + 2 * dent_secs + geometry.reserved_sections()
    }

    #[must_use]
    pub fn last_gc_status(&self) -> LastGcStatus {
        *self.last_gc_status.lock()
    }

    fn set_last_gc_status(&self, status: LastGcStatus) {
        *self.last_gc_status.lock() = status;
    }
}

// ── Reclamation status ──────────────────────────────────────────────────────

/// Per-segment reclaim result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcStatus {
    /// Every valid block was scheduled for relocation (or was already
    /// invalidated).
    Done,
    /// The dirty-node budget ran out; the reclaimer holds the checkpoint
    /// mutex and the loop must checkpoint before retrying.
    Blocked,
}

/// Result of one reclamation-loop call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcOutcome {
    /// No suitable victim was found.
    NoVictim,
    Done,
    Blocked,
}

impl From<GcOutcome> for LastGcStatus {
    fn from(outcome: GcOutcome) -> Self {
        match outcome {
            GcOutcome::NoVictim => Self::NoVictim,
            GcOutcome::Done => Self::Done,
            GcOutcome::Blocked => Self::Blocked,
        }
    }
}

// ── Inode work-list ─────────────────────────────────────────────────────────

/// Live inode references gathered during a data-segment pass.
///
/// Each inode appears at most once; the list lives for one reclamation-
/// loop call and must be drained before the call returns.
#[derive(Default)]
pub struct InodeWorkList {
    entries: Vec<Arc<dyn Inode>>,
}

impl InodeWorkList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `inode`, dropping the handle if the inode is already here.
    pub fn add(&mut self, inode: Arc<dyn Inode>) {
        if self.entries.iter().any(|entry| entry.ino() == inode.ino()) {
            return;
        }
        self.entries.push(inode);
    }

    /// Borrow an extra handle to a listed inode.
    #[must_use]
    pub fn find(&self, ino: Ino) -> Option<Arc<dyn Inode>> {
        self.entries
            .iter()
            .find(|entry| entry.ino() == ino)
            .map(Arc::clone)
    }

    /// Release every reference.
    pub fn drain(&mut self) {
        self.entries.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ── Node offset → block index ───────────────────────────────────────────────

/// First data block index addressed by the node at `node_ofs` within its
/// inode's node tree.
///
/// The inode itself (`node_ofs = 0`) addresses its embedded block range
/// starting at 0; every other dnode covers `ADDRS_PER_BLOCK` indices
/// after the inode's `ADDRS_PER_INODE`. Indirect positions interleave
/// with the dnodes they own, hence the correction terms.
#[must_use]
pub fn start_bidx_of_node(node_ofs: u32) -> u64 {
    if node_ofs == 0 {
        return 0;
    }
    let node_ofs = i64::from(node_ofs);
    let indirect_blks = i64::from(indirect_node_span());
    let nids = i64::from(NIDS_PER_BLOCK);

    let bidx = if node_ofs <= 2 {
        node_ofs - 1
    } else if node_ofs <= indirect_blks {
        let dec = (node_ofs - 4) / (nids + 1);
        node_ofs - 2 - dec
    } else {
        let dec = (node_ofs - indirect_blks - 3) / (nids + 1);
        node_ofs - 5 - dec
    };
    u64::try_from(bidx).unwrap_or(0) * u64::from(ADDRS_PER_BLOCK) + u64::from(ADDRS_PER_INODE)
}

// ── Node-segment reclaimer ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodePhase {
    /// Warm the node cache with asynchronous reads.
    Readahead,
    /// Fetch each valid node page and mark it dirty for relocation.
    Dirty,
}

/// Reclaim a node segment: every node the summary names that is still
/// valid gets marked dirty, so the next node writeback cycle rewrites it
/// into an active segment.
fn gc_node_segment(
    mount: &Mount,
    sum: &SummaryBlock,
    segno: Segno,
    kind: GcKind,
) -> Result<GcStatus> {
    for phase in [NodePhase::Readahead, NodePhase::Dirty] {
        for (off, entry) in (0_u32..).zip(sum.entries()) {
            // Free segments must still be able to absorb all dirty node
            // pages before the next checkpoint.
            if mount.checkpoint().should_do_checkpoint() {
                mount.checkpoint().block_operations();
                return Ok(GcStatus::Blocked);
            }
            if !mount.seg().sit().check_valid_map(segno, off) {
                continue;
            }
            match phase {
                NodePhase::Readahead => mount.nodes().ra_node_page(entry.nid),
                NodePhase::Dirty => {
                    let Some(page) = mount.nodes().get_node_page(entry.nid) else {
                        continue;
                    };
                    if !page.is_under_writeback() {
                        page.set_dirty();
                    }
                    mount.counters().inc_node_blocks(1);
                }
            }
        }
    }

    if kind == GcKind::Foreground {
        mount.nodes().sync_node_pages(None, true, u64::MAX);
    }
    Ok(GcStatus::Done)
}

// ── Data-segment reclaimer ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DataPhase {
    /// Warm the node cache with the dnodes the summary names.
    NodeReadahead,
    /// Validate each dnode and warm its inode's node page.
    DnodeCheck,
    /// Pin inodes and pull the data pages into cache.
    CacheWarm,
    /// Re-lock each data page and relocate it.
    Relocate,
}

/// Compare the summary entry against the live dnode. A version bump or a
/// re-pointed block address means the block was already superseded.
fn check_dnode(mount: &Mount, entry: &Summary, blkaddr: BlockAddr) -> Option<(NodeInfo, u32)> {
    let node_page = mount.nodes().get_node_page(entry.nid)?;
    let dni = mount.nodes().get_node_info(entry.nid)?;

    if entry.version != dni.version {
        return None;
    }
    let nofs = node_page.ofs_of_node();
    let source_blkaddr = node_page.data_blkaddr(entry.ofs_in_node);
    if source_blkaddr != blkaddr {
        return None;
    }
    Some((dni, nofs))
}

/// Schedule one data page for relocation.
///
/// Background GC only dirties the page and flags it cold so writeback
/// steers it into a cold segment; foreground GC writes it out on the
/// spot under the data-write lock.
fn move_data_page(mount: &Mount, inode: &Arc<dyn Inode>, page: &Arc<dyn DataPage>, kind: GcKind) {
    if !page.is_mapped_to(inode.ino()) {
        return;
    }
    if page.is_under_writeback() {
        return;
    }
    match kind {
        GcKind::Background => {
            page.set_dirty();
            page.set_cold();
        }
        GcKind::Foreground => {
            let _write = mount.data_write_lock.lock();
            if page.clear_dirty_for_io() && inode.is_dir() {
                mount.pages().dec_dirty_dents(inode.ino());
            }
            page.set_cold();
            if let Err(err) = page.write_data() {
                warn!(
                    target: "ember::gc",
                    event = "data_page_write_failed",
                    ino = inode.ino().0,
                    error = %err
                );
            }
            page.clear_cold();
        }
    }
}

/// Reclaim a data segment: resolve each block's parent dnode, verify it
/// still points here, then relocate the page through the writeback path.
fn gc_data_segment(
    mount: &Mount,
    sum: &SummaryBlock,
    ilist: &mut InodeWorkList,
    segno: Segno,
    kind: GcKind,
) -> Result<GcStatus> {
    let start_addr = mount.geometry().start_block(segno);

    let status = 'phases: {
        for phase in [
            DataPhase::NodeReadahead,
            DataPhase::DnodeCheck,
            DataPhase::CacheWarm,
            DataPhase::Relocate,
        ] {
            for (off, entry) in (0_u32..).zip(sum.entries()) {
                if mount.checkpoint().should_do_checkpoint() {
                    mount.checkpoint().block_operations();
                    break 'phases GcStatus::Blocked;
                }
                if !mount.seg().sit().check_valid_map(segno, off) {
                    continue;
                }
                if phase == DataPhase::NodeReadahead {
                    mount.nodes().ra_node_page(entry.nid);
                    continue;
                }
                let Some((dni, nofs)) = check_dnode(mount, entry, BlockAddr(start_addr.0 + off))
                else {
                    continue;
                };
                if phase == DataPhase::DnodeCheck {
                    // The inode's node block shares its number.
                    mount.nodes().ra_node_page(Nid(dni.ino.0));
                    continue;
                }
                let bidx = start_bidx_of_node(nofs) + u64::from(entry.ofs_in_node);

                if phase == DataPhase::CacheWarm {
                    let Some(inode) = mount.pages().iget_nowait(dni.ino) else {
                        continue;
                    };
                    let Some(_page) = mount.pages().find_data_page(dni.ino, bidx) else {
                        continue;
                    };
                    // Page handle dropped immediately: the read warmed
                    // the cache, relocation happens next phase.
                    ilist.add(inode);
                } else if let Some(inode) = ilist.find(dni.ino) {
                    let Some(page) = mount.pages().get_lock_data_page(dni.ino, bidx) else {
                        continue;
                    };
                    move_data_page(mount, &inode, &page, kind);
                    mount.counters().inc_data_blocks(1);
                }
            }
        }
        GcStatus::Done
    };

    if kind == GcKind::Foreground {
        mount.io().submit_data_bio(true);
    }
    Ok(status)
}

// ── Reclamation loop ────────────────────────────────────────────────────────

/// Reclaim one victim segment, dispatching on its summary type.
fn do_garbage_collect(
    mount: &Mount,
    segno: Segno,
    ilist: &mut InodeWorkList,
    kind: GcKind,
) -> Result<GcStatus> {
    let sum = mount.seg().read_summary(segno)?;

    let status = match sum.footer() {
        SummaryType::Node => gc_node_segment(mount, &sum, segno, kind)?,
        SummaryType::Data => gc_data_segment(mount, &sum, ilist, segno, kind)?,
    };
    mount.counters().inc_seg(sum.footer());
    mount.counters().inc_call_count();

    trace!(
        target: "ember::gc",
        event = "segment_collected",
        segno = segno.0,
        footer = ?sum.footer(),
        status = ?status
    );
    Ok(status)
}

fn gc_rounds(mount: &Mount, ilist: &mut InodeWorkList, needed: u32) -> Result<GcOutcome> {
    let segs_per_sec = mount.geometry().segs_per_sec();
    let mut kind = GcKind::Background;

    loop {
        let mut nfree: u32 = 0;
        let mut outcome = GcOutcome::NoVictim;
        let mut failure: Option<EmberError> = None;

        let old_free_secs = if mount.has_not_enough_free_secs() {
            mount.seg().reserved_sections()
        } else {
            mount.seg().free_sections()
        };

        'collect: while mount.is_mounted() {
            if mount.has_not_enough_free_secs() {
                kind = GcKind::Foreground;
            }

            let gained = i64::from(mount.seg().free_sections()) + i64::from(nfree)
                - i64::from(old_free_secs);
            if gained >= i64::from(needed) {
                break;
            }

            let Some(victim) = mount.seg().get_victim(kind, VictimTarget::Reclaim) else {
                break;
            };

            for i in 0..segs_per_sec {
                match do_garbage_collect(mount, Segno(victim.0 + i), ilist, kind) {
                    Ok(GcStatus::Done) => {
                        nfree += 1;
                        outcome = GcOutcome::Done;
                    }
                    Ok(GcStatus::Blocked) => {
                        outcome = GcOutcome::Blocked;
                        break 'collect;
                    }
                    Err(err) => {
                        failure = Some(err);
                        break 'collect;
                    }
                }
            }
        }

        // A blocked reclaimer already holds the checkpoint mutex and has
        // frozen operations: the checkpoint below is what releases it.
        // Skipping it would deadlock the dirty-node budget.
        if mount.has_not_enough_free_secs() || outcome == GcOutcome::Blocked {
            mount
                .checkpoint()
                .write_checkpoint(outcome == GcOutcome::Blocked, false);
            if failure.is_none() && nfree > 0 {
                continue;
            }
        }

        return match failure {
            Some(err) => Err(err),
            None => Ok(outcome),
        };
    }
}

/// Run the reclamation loop until at least `needed` sections are gained
/// or no victim remains.
///
/// Consumes the GC-mutex guard: on every path the lock is released and
/// the inode work-list is drained before returning.
pub fn run_gc(mount: &Mount, lock: MutexGuard<'_, ()>, needed: u32) -> Result<GcOutcome> {
    let mut ilist = InodeWorkList::new();

    let result = gc_rounds(mount, &mut ilist, needed);
    mount.set_last_gc_status(match &result {
        Ok(outcome) => LastGcStatus::from(*outcome),
        Err(_) => LastGcStatus::Error,
    });

    drop(lock);
    ilist.drain();
    result
}

/// Foreground entry point: take the GC lock and reclaim at least
/// `needed` sections.
pub fn trigger_gc(mount: &Mount, needed: u32) -> Result<GcOutcome> {
    let lock = mount.lock_gc();
    run_gc(mount, lock, needed)
}

// ── Manager lifecycle ───────────────────────────────────────────────────────

/// Builds the GC side of a mount: installs the default victim-selection
/// policy and anchors the statistics surface. Dropping the manager
/// deregisters the policy.
pub struct GcManager {
    mount: Arc<Mount>,
}

impl GcManager {
    #[must_use]
    pub fn build(mount: Arc<Mount>) -> Self {
        mount
            .seg()
            .register_victim_selector(Arc::new(DefaultVictimSelector));
        info!(
            target: "ember::gc",
            event = "gc_manager_built",
            total_segs = mount.geometry().total_segs(),
            segs_per_sec = mount.geometry().segs_per_sec()
        );
        Self { mount }
    }

    #[must_use]
    pub fn mount(&self) -> &Arc<Mount> {
        &self.mount
    }

    /// Spawn the background GC worker.
    pub fn start_gc_thread(&self, config: GcDaemonConfig) -> Result<GcDaemon> {
        daemon::start_gc_thread(Arc::clone(&self.mount), config)
    }
}

impl Drop for GcManager {
    fn drop(&mut self) {
        self.mount.seg().unregister_victim_selector();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_bidx_of_inode() {
        assert_eq!(start_bidx_of_node(0), 0);
    }

    #[test]
    fn test_start_bidx_direct_nodes() {
        let inode = u64::from(ADDRS_PER_INODE);
        let per_block = u64::from(ADDRS_PER_BLOCK);
        assert_eq!(start_bidx_of_node(1), inode);
        assert_eq!(start_bidx_of_node(2), inode + per_block);
    }

    #[test]
    fn test_start_bidx_indirect_layers() {
        let inode = u64::from(ADDRS_PER_INODE);
        let per_block = u64::from(ADDRS_PER_BLOCK);
        // Dnodes under the first indirect node start at offset 4 and
        // continue the direct range.
        assert_eq!(start_bidx_of_node(4), inode + 2 * per_block);
        assert_eq!(start_bidx_of_node(5), inode + 3 * per_block);
        // Last dnode under the first indirect node.
        assert_eq!(
            start_bidx_of_node(3 + NIDS_PER_BLOCK),
            inode + (u64::from(NIDS_PER_BLOCK) + 1) * per_block
        );
        // Dnodes under the second indirect node stay contiguous.
        assert_eq!(
            start_bidx_of_node(3 + NIDS_PER_BLOCK + 2),
            inode + (u64::from(NIDS_PER_BLOCK) + 2) * per_block
        );
        assert_eq!(
            start_bidx_of_node(indirect_node_span()),
            inode + (2 * u64::from(NIDS_PER_BLOCK) + 1) * per_block
        );
    }

    #[test]
    fn test_start_bidx_double_indirect() {
        let inode = u64::from(ADDRS_PER_INODE);
        let per_block = u64::from(ADDRS_PER_BLOCK);
        assert_eq!(
            start_bidx_of_node(indirect_node_span() + 1),
            inode + u64::from(indirect_node_span() - 4) * per_block
        );
        // First dnode of the double-indirect tree: the span is followed
        // by the double-indirect node itself, then its first indirect
        // child, then the dnode — which continues the data range.
        assert_eq!(
            start_bidx_of_node(indirect_node_span() + 3),
            inode + (2 * u64::from(NIDS_PER_BLOCK) + 2) * per_block
        );
    }

    struct DummyInode {
        ino: Ino,
    }

    impl Inode for DummyInode {
        fn ino(&self) -> Ino {
            self.ino
        }

        fn is_dir(&self) -> bool {
            false
        }
    }

    #[test]
    fn test_worklist_dedup() {
        let mut list = InodeWorkList::new();
        let first: Arc<dyn Inode> = Arc::new(DummyInode { ino: Ino(10) });
        let dup: Arc<dyn Inode> = Arc::new(DummyInode { ino: Ino(10) });
        let other: Arc<dyn Inode> = Arc::new(DummyInode { ino: Ino(11) });

        list.add(Arc::clone(&first));
        list.add(dup);
        list.add(Arc::clone(&other));
        assert_eq!(list.len(), 2);

        assert!(list.find(Ino(10)).is_some());
        assert!(list.find(Ino(12)).is_none());

        list.drain();
        assert!(list.is_empty());
        // Only the bindings in this test keep the inodes alive now.
        assert_eq!(Arc::strong_count(&first), 1);
        assert_eq!(Arc::strong_count(&other), 1);
    }
}
