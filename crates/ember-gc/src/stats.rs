//! Operator-facing GC statistics.
//!
//! Snapshots of the segment manager and GC counters, rendered as the
//! human-readable reports exposed through the mount's status files: the
//! main status report, the section-utilization bimodality report, and
//! the memory-footprint breakdown.

use crate::Mount;
use ember_segment::{
    bitmap_bytes, CursegTable, CursegType, DirtySeglists, SegEntry, SegManager, SitInfo,
    DEFAULT_CURSEGS, NR_DIRTY_TYPE,
};
use ember_types::{Segno, Summary};
use serde::Serialize;
use std::fmt::Write as _;
use std::mem::size_of;

/// Position of one active log head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CursegStat {
    pub segno: u32,
    pub secno: u32,
    pub zoneno: u32,
}

/// Point-in-time view of the collector and the space it manages.
#[derive(Debug, Clone, Serialize)]
pub struct GcStatSnapshot {
    pub main_area_segs: u32,
    pub main_area_sections: u32,
    pub main_area_zones: u32,
    pub reserved_sections: u32,
    pub overprovision_segments: u32,
    pub utilization: u64,
    pub valid_blocks: u64,
    pub free_segs: u32,
    pub free_secs: u32,
    pub dirty_count: usize,
    pub prefree_count: usize,
    pub cursegs: [Option<CursegStat>; DEFAULT_CURSEGS],
    pub call_count: u64,
    pub bg_gc: u64,
    pub node_segs: u64,
    pub data_segs: u64,
    pub node_blocks_moved: u64,
    pub data_blocks_moved: u64,
    pub ndirty_node: u64,
    pub ndirty_dent: u64,
    pub ndirty_meta: u64,
    pub util_free: u64,
    pub util_valid: u64,
    pub util_invalid: i64,
}

/// Collect the status snapshot from live state.
#[must_use]
pub fn update_stats(mount: &Mount) -> GcStatSnapshot {
    let geometry = mount.geometry();
    let seg = mount.seg();
    let counters = mount.counters();

    let cursegs = std::array::from_fn(|i| {
        seg.cursegs().curseg(CursegType::ALL[i]).map(|segno| {
            let secno = geometry.secno_of(segno);
            CursegStat {
                segno: segno.0,
                secno: secno.0,
                zoneno: geometry.zone_of(secno),
            }
        })
    });

    let log = geometry.log_blocks_per_seg();
    let user_segs = geometry.user_block_count() >> log;
    let util_free = if user_segs == 0 {
        0
    } else {
        (seg.free_user_blocks() >> log) * 100 / user_segs / 2
    };
    let util_valid = if user_segs == 0 {
        0
    } else {
        (seg.written_block_count() >> log) * 100 / user_segs / 2
    };
    let util_invalid = 50 - i64::try_from(util_free).unwrap_or(50)
        - i64::try_from(util_valid).unwrap_or(0);

    GcStatSnapshot {
        main_area_segs: geometry.total_segs(),
        main_area_sections: geometry.total_sections(),
        main_area_zones: geometry.total_zones(),
        reserved_sections: geometry.reserved_sections(),
        overprovision_segments: geometry.overprovision_segments(),
        utilization: seg.utilization(),
        valid_blocks: seg.valid_user_blocks(),
        free_segs: seg.free_segments(),
        free_secs: seg.free_sections(),
        dirty_count: seg.dirty_segments(),
        prefree_count: seg.prefree_segments(),
        cursegs,
        call_count: counters.call_count(),
        bg_gc: counters.bg_gc_runs(),
        node_segs: counters.node_segs(),
        data_segs: counters.data_segs(),
        node_blocks_moved: counters.node_blocks_moved(),
        data_blocks_moved: counters.data_blocks_moved(),
        ndirty_node: mount.nodes().dirty_node_pages(),
        ndirty_dent: mount.pages().dirty_dent_pages(),
        ndirty_meta: mount.pages().dirty_meta_pages(),
        util_free,
        util_valid,
        util_invalid,
    }
}

/// Bimodality of section utilization. Sections tend to be either nearly
/// full or nearly empty on a healthy log; a flat distribution makes
/// every victim expensive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SitStat {
    /// `Σ (vblocks − blks_per_sec/2)²` normalized by the section count.
    pub bimodal: u64,
    /// Average valid blocks across partially valid sections.
    pub avg_vblocks: u64,
}

/// Walk every section under the sentry lock and compute the bimodality
/// metric.
#[must_use]
pub fn update_gc_metric(mount: &Mount) -> SitStat {
    let geometry = mount.geometry();
    let blks_per_sec = u64::from(geometry.blocks_per_sec());
    let hblks_per_sec = blks_per_sec / 2;
    let log_unit = geometry.log_segs_per_sec();

    let mut bimodal: u64 = 0;
    let mut total_vblocks: u64 = 0;
    let mut ndirty: u64 = 0;

    let sit = mount.seg().sit().lock();
    for secno in 0..geometry.total_sections() {
        let segno = Segno(secno << log_unit);
        let vblocks = u64::from(sit.valid_blocks(geometry, segno, log_unit));
        let dist = hblks_per_sec.abs_diff(vblocks);
        bimodal += dist * dist;

        if vblocks > 0 && vblocks < blks_per_sec {
            total_vblocks += vblocks;
            ndirty += 1;
        }
    }
    drop(sit);

    let denom = u64::from(geometry.total_sections()) * hblks_per_sec * hblks_per_sec / 100;
    SitStat {
        bimodal: if denom == 0 { 0 } else { bimodal / denom },
        avg_vblocks: if ndirty == 0 {
            0
        } else {
            total_vblocks / ndirty
        },
    }
}

fn write_curseg_line(out: &mut String, label: &str, curseg: Option<CursegStat>) {
    match curseg {
        Some(c) => {
            let _ = writeln!(out, " - {label}: {}, {}, {}", c.segno, c.secno, c.zoneno);
        }
        None => {
            let _ = writeln!(out, " - {label}: -, -, -");
        }
    }
}

/// Render the main status report.
#[must_use]
pub fn render_status_report(mount: &Mount) -> String {
    let si = update_stats(mount);
    let mut out = String::new();

    let _ = writeln!(out, "=====[ emberfs main area ]=====");
    let _ = writeln!(
        out,
        "[MAIN: {} segs, {} secs, {} zones (OverProv: {} segs, Resv: {} secs)]",
        si.main_area_segs,
        si.main_area_sections,
        si.main_area_zones,
        si.overprovision_segments,
        si.reserved_sections
    );
    let _ = writeln!(
        out,
        "Utilization: {}% ({} valid blocks)",
        si.utilization, si.valid_blocks
    );

    write_curseg_line(&mut out, "COLD data", si.cursegs[CursegType::ColdData.index()]);
    write_curseg_line(&mut out, "WARM data", si.cursegs[CursegType::WarmData.index()]);
    write_curseg_line(&mut out, "HOT  data", si.cursegs[CursegType::HotData.index()]);
    write_curseg_line(&mut out, "Dir  dnode", si.cursegs[CursegType::HotNode.index()]);
    write_curseg_line(&mut out, "File dnode", si.cursegs[CursegType::WarmNode.index()]);
    write_curseg_line(&mut out, "Indir nodes", si.cursegs[CursegType::ColdNode.index()]);

    let valid_segs = i64::from(si.main_area_segs)
        - i64::try_from(si.dirty_count).unwrap_or(0)
        - i64::try_from(si.prefree_count).unwrap_or(0)
        - i64::from(si.free_segs);
    let _ = writeln!(out, "\n - Valid: {valid_segs}\n - Dirty: {}", si.dirty_count);
    let _ = writeln!(
        out,
        " - Prefree: {}\n - Free: {} ({})\n",
        si.prefree_count, si.free_segs, si.free_secs
    );
    let _ = writeln!(out, "GC calls: {} (BG: {})", si.call_count, si.bg_gc);
    let _ = writeln!(out, " - data segments : {}", si.data_segs);
    let _ = writeln!(out, " - node segments : {}", si.node_segs);
    let _ = writeln!(
        out,
        "Try to move {} blocks",
        si.node_blocks_moved + si.data_blocks_moved
    );
    let _ = writeln!(out, " - data blocks : {}", si.data_blocks_moved);
    let _ = writeln!(out, " - node blocks : {}", si.node_blocks_moved);
    let _ = writeln!(out, "\nBalancing emberfs async:");
    let _ = writeln!(out, " - dirty node pages: {}", si.ndirty_node);
    let _ = writeln!(out, " - dirty dent pages: {}", si.ndirty_dent);
    let _ = writeln!(out, " - dirty meta pages: {}", si.ndirty_meta);

    let _ = writeln!(out, "\nDistribution of User Blocks: [ valid | invalid | free ]");
    let _ = write!(out, "  [");
    for _ in 0..si.util_valid {
        let _ = write!(out, "-");
    }
    let _ = write!(out, "|");
    for _ in 0..si.util_invalid.max(0) {
        let _ = write!(out, "-");
    }
    let _ = write!(out, "|");
    for _ in 0..si.util_free {
        let _ = write!(out, "-");
    }
    let _ = writeln!(out, "]");

    out
}

/// Render the section-utilization report.
#[must_use]
pub fn render_sit_report(mount: &Mount) -> String {
    let sit = update_gc_metric(mount);
    format!("BDF: {}, avg. vblocks: {}\n", sit.bimodal, sit.avg_vblocks)
}

/// Render the memory-footprint breakdown: static metadata vs cached
/// summary blocks.
#[must_use]
pub fn render_mem_report(mount: &Mount) -> String {
    let geometry = mount.geometry();
    let seg = mount.seg();
    let total_segs = geometry.total_segs();
    let seg_bitmap = bitmap_bytes(total_segs);

    let mut base_mem = size_of::<Mount>() + size_of::<SegManager>();
    base_mem += size_of::<SitInfo>();
    base_mem += total_segs as usize
        * (size_of::<SegEntry>() + bitmap_bytes(geometry.blocks_per_seg()));
    base_mem += size_of::<DirtySeglists>();
    base_mem += NR_DIRTY_TYPE * seg_bitmap;
    base_mem += 2 * seg_bitmap;
    base_mem += size_of::<CursegTable>();

    let cache_mem =
        seg.summary_count() * geometry.blocks_per_seg() as usize * size_of::<Summary>();

    format!(
        "{} KB = static: {} + cached: {}\n",
        (base_mem + cache_mem) >> 10,
        base_mem >> 10,
        cache_mem >> 10
    )
}
