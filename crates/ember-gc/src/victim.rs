//! Default victim-selection policy.
//!
//! Foreground reclamation is greedy: the section with the fewest valid
//! blocks costs the least copying right now. Background reclamation uses
//! the cost-benefit form, preferring old under-utilized sections whose
//! remaining blocks have settled. Slack-space recycling reuses the
//! greedy scan at segment granularity against the checkpoint-stable
//! counts.

use crate::MAX_VICTIM_SEARCH;
use ember_segment::{
    bitmap_clear, bitmap_find_next, bitmap_get, bitmap_set, DirtyState, DirtyType, GcKind,
    SegManager, SitState, VictimSelection, VictimTarget,
};
use ember_types::{Geometry, Segno};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AllocMode {
    /// Log-structured reclamation: whole sections at a time.
    Lfs,
    /// Slack-space recycling: single segments.
    Ssr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GcAlgorithm {
    Greedy = 0,
    CostBenefit = 1,
}

impl GcAlgorithm {
    fn index(self) -> usize {
        self as usize
    }
}

/// Ephemeral per-call selection policy.
struct VictimPolicy {
    alloc_mode: AllocMode,
    gc_algo: GcAlgorithm,
    dirty_type: DirtyType,
    log_ofs_unit: u32,
    offset: u32,
    min_cost: u32,
    min_segno: Option<u32>,
}

fn select_policy(
    geometry: &Geometry,
    dirty: &DirtyState,
    kind: GcKind,
    target: VictimTarget,
) -> VictimPolicy {
    let (alloc_mode, gc_algo, dirty_type, log_ofs_unit) = match target {
        VictimTarget::Ssr(ty) => (AllocMode::Ssr, GcAlgorithm::Greedy, ty, 0),
        VictimTarget::Reclaim => {
            let algo = match kind {
                GcKind::Background => GcAlgorithm::CostBenefit,
                GcKind::Foreground => GcAlgorithm::Greedy,
            };
            (
                AllocMode::Lfs,
                algo,
                DirtyType::Dirty,
                geometry.log_segs_per_sec(),
            )
        }
    };
    VictimPolicy {
        alloc_mode,
        gc_algo,
        dirty_type,
        log_ofs_unit,
        offset: dirty.last_victim[gc_algo.index()],
        min_cost: 0,
        min_segno: None,
    }
}

/// Worst acceptable cost: one past a full unit for greedy, the skip
/// sentinel for cost-benefit.
fn max_cost(geometry: &Geometry, policy: &VictimPolicy) -> u32 {
    match policy.gc_algo {
        GcAlgorithm::Greedy => 1 << (geometry.log_blocks_per_seg() + policy.log_ofs_unit),
        GcAlgorithm::CostBenefit => u32::MAX,
    }
}

/// Cost-benefit cost over the section containing `segno`. Lower is
/// better; the subtraction from `u32::MAX` keeps the minimum-search
/// shape shared with greedy.
fn cb_cost(sit: &mut SitState, geometry: &Geometry, segno: Segno) -> u32 {
    let secno = geometry.secno_of(segno);
    let start = geometry.sec_start_segno(secno);

    let mut mtime: u64 = 0;
    for i in 0..geometry.segs_per_sec() {
        mtime += sit.entry(Segno(start.0 + i)).mtime();
    }
    let vblocks = sit.valid_blocks(geometry, segno, geometry.log_segs_per_sec());

    let mtime = mtime >> geometry.log_segs_per_sec();
    let vblocks = u64::from(vblocks) >> geometry.log_segs_per_sec();

    let u = (vblocks * 100) >> geometry.log_blocks_per_seg();

    // The system clock may have been changed by the user.
    sit.update_mtime_range(mtime);
    let age = if sit.max_mtime == sit.min_mtime {
        0
    } else {
        100 - (100 * (mtime - sit.min_mtime)) / (sit.max_mtime - sit.min_mtime)
    };

    let benefit = (100 * (100_u64.saturating_sub(u)) * age) / (100 + u);
    #[allow(clippy::cast_possible_truncation)] // benefit <= 10_000
    let benefit = benefit as u32;
    u32::MAX - benefit
}

fn gc_cost(sit: &mut SitState, geometry: &Geometry, segno: Segno, policy: &VictimPolicy) -> u32 {
    if policy.alloc_mode == AllocMode::Ssr {
        return sit.entry(segno).ckpt_valid_count();
    }
    match policy.gc_algo {
        GcAlgorithm::Greedy => sit.valid_blocks(geometry, segno, geometry.log_segs_per_sec()),
        GcAlgorithm::CostBenefit => cb_cost(sit, geometry, segno),
    }
}

/// Foreground reclamation can adopt a segment the background pass
/// already picked: it is known to carry few valid blocks.
fn check_bg_victims(dirty: &mut DirtyState, total_segs: u32) -> Option<u32> {
    let map = &mut dirty.victim_segmap[GcKind::Background.index()];
    let segno = bitmap_find_next(map, total_segs, 0)?;
    bitmap_clear(map, segno);
    Some(segno)
}

/// The greedy/cost-benefit hybrid installed by `GcManager::build`.
#[derive(Debug, Default)]
pub struct DefaultVictimSelector;

impl VictimSelection for DefaultVictimSelector {
    fn get_victim(
        &self,
        seg: &SegManager,
        sit: &mut SitState,
        kind: GcKind,
        target: VictimTarget,
    ) -> Option<Segno> {
        let geometry = seg.geometry();
        let total_segs = geometry.total_segs();
        let mut dirty = seg.dirty().lock();

        let mut policy = select_policy(geometry, &dirty, kind, target);
        policy.min_cost = max_cost(geometry, &policy);
        let worst = policy.min_cost;

        let mut adopted = false;
        if policy.alloc_mode == AllocMode::Lfs && kind == GcKind::Foreground {
            if let Some(segno) = check_bg_victims(&mut dirty, total_segs) {
                policy.min_segno = Some(segno);
                adopted = true;
            }
        }

        if !adopted {
            let mut nsearched = 0_u32;
            loop {
                let Some(segno) = bitmap_find_next(
                    &dirty.dirty_segmap[policy.dirty_type.index()],
                    total_segs,
                    policy.offset,
                ) else {
                    if dirty.last_victim[policy.gc_algo.index()] != 0 {
                        dirty.last_victim[policy.gc_algo.index()] = 0;
                        policy.offset = 0;
                        continue;
                    }
                    break;
                };
                // Jump past this unit so one section yields one candidate.
                policy.offset = ((segno >> policy.log_ofs_unit) << policy.log_ofs_unit)
                    + (1 << policy.log_ofs_unit);

                if bitmap_get(&dirty.victim_segmap[GcKind::Foreground.index()], segno) {
                    continue;
                }
                if kind == GcKind::Background
                    && bitmap_get(&dirty.victim_segmap[GcKind::Background.index()], segno)
                {
                    continue;
                }
                if seg
                    .cursegs()
                    .is_cur_sec(geometry, geometry.secno_of(Segno(segno)))
                {
                    continue;
                }

                let cost = gc_cost(sit, geometry, Segno(segno), &policy);
                if cost < policy.min_cost {
                    policy.min_segno = Some(segno);
                    policy.min_cost = cost;
                }
                // No-progress candidates do not spend search budget.
                if cost == worst {
                    continue;
                }
                if nsearched >= MAX_VICTIM_SEARCH {
                    dirty.last_victim[policy.gc_algo.index()] = segno;
                    break;
                }
                nsearched += 1;
            }
        }

        let min_segno = policy.min_segno?;
        let result = (min_segno >> policy.log_ofs_unit) << policy.log_ofs_unit;
        if policy.alloc_mode == AllocMode::Lfs {
            for i in 0..(1_u32 << policy.log_ofs_unit) {
                bitmap_set(&mut dirty.victim_segmap[kind.index()], result + i);
            }
        }
        trace!(
            target: "ember::gc::victim",
            event = "victim_claimed",
            segno = result,
            kind = ?kind,
            adopted = adopted,
            cost = policy.min_cost
        );
        Some(Segno(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_segment::SitInfo;
    use ember_types::BlockAddr;

    fn geometry() -> Geometry {
        Geometry::new(9, 0, 64, BlockAddr(0), 1, 2, 8, 64 * 512).expect("geometry")
    }

    fn sit_with(valid: &[(u32, u32)], mtimes: &[(u32, u64)]) -> SitInfo {
        let geometry = geometry();
        let sit = SitInfo::new(&geometry);
        {
            let mut state = sit.lock();
            for &(segno, count) in valid {
                for off in 0..count {
                    state.entry_mut(Segno(segno)).set_valid(off, true);
                }
            }
            for &(segno, mtime) in mtimes {
                state.entry_mut(Segno(segno)).set_mtime(mtime);
                state.update_mtime_range(mtime);
            }
        }
        sit
    }

    #[test]
    fn test_cb_cost_prefers_older_sections() {
        let geometry = geometry();
        // Same utilization, different ages.
        let sit = sit_with(&[(1, 100), (2, 100)], &[(1, 10), (2, 900), (3, 1000)]);
        let mut state = sit.lock();
        let old = cb_cost(&mut state, &geometry, Segno(1));
        let young = cb_cost(&mut state, &geometry, Segno(2));
        assert!(old < young, "older section must cost less");
    }

    #[test]
    fn test_cb_cost_prefers_empty_sections() {
        let geometry = geometry();
        // Same age, different utilization.
        let sit = sit_with(&[(1, 50), (2, 400)], &[(1, 10), (2, 10), (3, 1000)]);
        let mut state = sit.lock();
        let sparse = cb_cost(&mut state, &geometry, Segno(1));
        let dense = cb_cost(&mut state, &geometry, Segno(2));
        assert!(sparse < dense, "emptier section must cost less");
    }

    #[test]
    fn test_cb_cost_degenerate_age_is_skip_sentinel() {
        let geometry = geometry();
        let sit = sit_with(&[(1, 100)], &[]);
        let mut state = sit.lock();
        // min == max: age 0, no benefit, cost pins to the skip value.
        assert_eq!(cb_cost(&mut state, &geometry, Segno(1)), u32::MAX);
    }

    #[test]
    fn test_cb_cost_widens_mtime_range() {
        let geometry = geometry();
        let sit = sit_with(&[(1, 100)], &[(2, 500), (3, 1000)]);
        let mut state = sit.lock();
        state.min_mtime = 500;
        state.max_mtime = 1000;
        // Segment 1 has mtime 0, below the recorded minimum.
        let _ = cb_cost(&mut state, &geometry, Segno(1));
        assert_eq!(state.min_mtime, 0);
        assert_eq!(state.max_mtime, 1000);
    }

    #[test]
    fn test_max_cost_greedy_unit() {
        let geometry = geometry();
        let dirty = ember_segment::DirtySeglists::new(&geometry);
        let state = dirty.lock();
        let policy = select_policy(&geometry, &state, GcKind::Foreground, VictimTarget::Reclaim);
        assert_eq!(max_cost(&geometry, &policy), 512);

        let policy = select_policy(&geometry, &state, GcKind::Background, VictimTarget::Reclaim);
        assert_eq!(max_cost(&geometry, &policy), u32::MAX);
    }
}
