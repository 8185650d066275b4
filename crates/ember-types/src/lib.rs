#![forbid(unsafe_code)]
//! Core identifier types and on-media geometry for EmberFS.
//!
//! EmberFS divides its main area into fixed-size segments grouped into
//! sections; everything above the block layer addresses storage through
//! the newtypes defined here. `Geometry` validates the power-of-two
//! shape once at mount time so the rest of the workspace can shift and
//! mask without re-checking.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ── Node address space ──────────────────────────────────────────────────────

/// Number of node ids held by one indirect node block.
pub const NIDS_PER_BLOCK: u32 = 1018;
/// Number of data block addresses held by one direct node block.
pub const ADDRS_PER_BLOCK: u32 = 1018;
/// Number of data block addresses embedded in the inode itself.
pub const ADDRS_PER_INODE: u32 = 923;

/// Highest node offset reachable through the two single-indirect trees.
///
/// Offsets beyond this belong to the double-indirect tree.
#[must_use]
pub const fn indirect_node_span() -> u32 {
    2 * NIDS_PER_BLOCK + 4
}

// ── Identifier newtypes ─────────────────────────────────────────────────────

/// Segment number within the main area, `[0, total_segs)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Segno(pub u32);

/// Section number, `[0, total_sections)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Secno(pub u32);

/// Absolute block address on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockAddr(pub u32);

impl BlockAddr {
    /// Address that never refers to a real block.
    pub const NULL: Self = Self(0);
}

/// Node identifier resolved through the node manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Nid(pub u32);

/// Inode number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ino(pub u32);

/// Node version counter; a summary entry whose version no longer matches
/// the node manager's is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(pub u8);

impl fmt::Display for Segno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Secno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Nid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Ino {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Geometry ────────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GeometryError {
    #[error("invalid geometry field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

/// Validated main-area geometry.
///
/// Segment and section sizes are powers of two carried as shift counts,
/// so section alignment is a mask and block math never overflows `u64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    log_blocks_per_seg: u32,
    log_segs_per_sec: u32,
    total_segs: u32,
    main_blkaddr: BlockAddr,
    secs_per_zone: u32,
    reserved_sections: u32,
    overprovision_segments: u32,
    user_block_count: u64,
}

impl Geometry {
    /// Validate and build a geometry.
    ///
    /// `total_segs` must be a non-zero multiple of the section size, and
    /// the shift counts must stay small enough that a section's block
    /// count fits in `u32`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        log_blocks_per_seg: u32,
        log_segs_per_sec: u32,
        total_segs: u32,
        main_blkaddr: BlockAddr,
        secs_per_zone: u32,
        reserved_sections: u32,
        overprovision_segments: u32,
        user_block_count: u64,
    ) -> Result<Self, GeometryError> {
        if log_blocks_per_seg == 0 || log_blocks_per_seg > 16 {
            return Err(GeometryError::InvalidField {
                field: "log_blocks_per_seg",
                reason: "must be in 1..=16",
            });
        }
        if log_blocks_per_seg + log_segs_per_sec > 30 {
            return Err(GeometryError::InvalidField {
                field: "log_segs_per_sec",
                reason: "section block count must fit in u32",
            });
        }
        if total_segs == 0 {
            return Err(GeometryError::InvalidField {
                field: "total_segs",
                reason: "must be non-zero",
            });
        }
        if total_segs & ((1 << log_segs_per_sec) - 1) != 0 {
            return Err(GeometryError::InvalidField {
                field: "total_segs",
                reason: "must be a multiple of segs_per_sec",
            });
        }
        if secs_per_zone == 0 {
            return Err(GeometryError::InvalidField {
                field: "secs_per_zone",
                reason: "must be non-zero",
            });
        }
        if user_block_count == 0 {
            return Err(GeometryError::InvalidField {
                field: "user_block_count",
                reason: "must be non-zero",
            });
        }
        Ok(Self {
            log_blocks_per_seg,
            log_segs_per_sec,
            total_segs,
            main_blkaddr,
            secs_per_zone,
            reserved_sections,
            overprovision_segments,
            user_block_count,
        })
    }

    #[must_use]
    pub fn log_blocks_per_seg(&self) -> u32 {
        self.log_blocks_per_seg
    }

    #[must_use]
    pub fn log_segs_per_sec(&self) -> u32 {
        self.log_segs_per_sec
    }

    #[must_use]
    pub fn blocks_per_seg(&self) -> u32 {
        1 << self.log_blocks_per_seg
    }

    #[must_use]
    pub fn segs_per_sec(&self) -> u32 {
        1 << self.log_segs_per_sec
    }

    #[must_use]
    pub fn blocks_per_sec(&self) -> u32 {
        1 << (self.log_blocks_per_seg + self.log_segs_per_sec)
    }

    #[must_use]
    pub fn total_segs(&self) -> u32 {
        self.total_segs
    }

    #[must_use]
    pub fn total_sections(&self) -> u32 {
        self.total_segs >> self.log_segs_per_sec
    }

    #[must_use]
    pub fn secs_per_zone(&self) -> u32 {
        self.secs_per_zone
    }

    #[must_use]
    pub fn total_zones(&self) -> u32 {
        self.total_sections() / self.secs_per_zone
    }

    #[must_use]
    pub fn reserved_sections(&self) -> u32 {
        self.reserved_sections
    }

    #[must_use]
    pub fn overprovision_segments(&self) -> u32 {
        self.overprovision_segments
    }

    #[must_use]
    pub fn user_block_count(&self) -> u64 {
        self.user_block_count
    }

    /// Section containing `segno`.
    #[must_use]
    pub fn secno_of(&self, segno: Segno) -> Secno {
        Secno(segno.0 >> self.log_segs_per_sec)
    }

    /// First segment of `secno`.
    #[must_use]
    pub fn sec_start_segno(&self, secno: Secno) -> Segno {
        Segno(secno.0 << self.log_segs_per_sec)
    }

    /// Zone containing `secno`.
    #[must_use]
    pub fn zone_of(&self, secno: Secno) -> u32 {
        secno.0 / self.secs_per_zone
    }

    /// Align `segno` down to the start of its section.
    #[must_use]
    pub fn section_align(&self, segno: Segno) -> Segno {
        Segno((segno.0 >> self.log_segs_per_sec) << self.log_segs_per_sec)
    }

    /// First block address of `segno` in the main area.
    #[must_use]
    pub fn start_block(&self, segno: Segno) -> BlockAddr {
        BlockAddr(self.main_blkaddr.0 + (segno.0 << self.log_blocks_per_seg))
    }

    /// Whether `segno` addresses a segment inside the main area.
    #[must_use]
    pub fn contains_segno(&self, segno: Segno) -> bool {
        segno.0 < self.total_segs
    }

    /// Sections needed to hold `pages` dirty pages, rounded up.
    #[must_use]
    pub fn sections_for_pages(&self, pages: u64) -> u32 {
        let blocks_per_sec = u64::from(self.blocks_per_sec());
        let secs = pages.div_ceil(blocks_per_sec);
        u32::try_from(secs).unwrap_or(u32::MAX)
    }
}

// ── Summary model ───────────────────────────────────────────────────────────

/// What a segment's blocks hold, recorded in the summary footer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SummaryType {
    Node,
    Data,
}

/// One summary entry: the owner of a block slot within a segment.
///
/// For a node segment `nid` names the node stored in the slot; for a
/// data segment it names the dnode whose `ofs_in_node`-th address points
/// at the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub nid: Nid,
    pub ofs_in_node: u16,
    pub version: Version,
}

impl Summary {
    #[must_use]
    pub fn new(nid: Nid, ofs_in_node: u16, version: Version) -> Self {
        Self {
            nid,
            ofs_in_node,
            version,
        }
    }
}

/// Per-segment summary block: one entry per block slot plus the footer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryBlock {
    footer: SummaryType,
    entries: Vec<Summary>,
}

impl SummaryBlock {
    #[must_use]
    pub fn new(footer: SummaryType, entries: Vec<Summary>) -> Self {
        Self { footer, entries }
    }

    /// Summary for a node segment with every slot owned by `entries`.
    #[must_use]
    pub fn node(entries: Vec<Summary>) -> Self {
        Self::new(SummaryType::Node, entries)
    }

    /// Summary for a data segment.
    #[must_use]
    pub fn data(entries: Vec<Summary>) -> Self {
        Self::new(SummaryType::Data, entries)
    }

    #[must_use]
    pub fn footer(&self) -> SummaryType {
        self.footer
    }

    #[must_use]
    pub fn entries(&self) -> &[Summary] {
        &self.entries
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

/// Dnode info resolved from the node manager for a given nid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub nid: Nid,
    pub ino: Ino,
    pub version: Version,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> Geometry {
        Geometry::new(9, 0, 64, BlockAddr(1024), 1, 2, 8, 64 * 512).expect("geometry")
    }

    #[test]
    fn test_geometry_accessors() {
        let g = geometry();
        assert_eq!(g.blocks_per_seg(), 512);
        assert_eq!(g.segs_per_sec(), 1);
        assert_eq!(g.blocks_per_sec(), 512);
        assert_eq!(g.total_sections(), 64);
        assert_eq!(g.start_block(Segno(0)), BlockAddr(1024));
        assert_eq!(g.start_block(Segno(3)), BlockAddr(1024 + 3 * 512));
    }

    #[test]
    fn test_geometry_sections() {
        let g = Geometry::new(9, 2, 64, BlockAddr(0), 2, 2, 8, 64 * 512).expect("geometry");
        assert_eq!(g.segs_per_sec(), 4);
        assert_eq!(g.total_sections(), 16);
        assert_eq!(g.secno_of(Segno(7)), Secno(1));
        assert_eq!(g.sec_start_segno(Secno(1)), Segno(4));
        assert_eq!(g.section_align(Segno(7)), Segno(4));
        assert_eq!(g.zone_of(Secno(5)), 2);
    }

    #[test]
    fn test_geometry_validation() {
        assert!(Geometry::new(0, 0, 64, BlockAddr(0), 1, 2, 8, 1).is_err());
        assert!(Geometry::new(17, 0, 64, BlockAddr(0), 1, 2, 8, 1).is_err());
        assert!(Geometry::new(9, 0, 0, BlockAddr(0), 1, 2, 8, 1).is_err());
        // 64 segments is not a multiple of 128 segs/sec.
        assert!(Geometry::new(9, 7, 64, BlockAddr(0), 1, 2, 8, 1).is_err());
        assert!(Geometry::new(9, 0, 64, BlockAddr(0), 0, 2, 8, 1).is_err());
        assert!(Geometry::new(9, 0, 64, BlockAddr(0), 1, 2, 8, 0).is_err());
    }

    #[test]
    fn test_sections_for_pages() {
        let g = geometry();
        assert_eq!(g.sections_for_pages(0), 0);
        assert_eq!(g.sections_for_pages(1), 1);
        assert_eq!(g.sections_for_pages(512), 1);
        assert_eq!(g.sections_for_pages(513), 2);
    }

    #[test]
    fn test_summary_block() {
        let entries = vec![Summary::new(Nid(1), 0, Version(0)); 4];
        let sum = SummaryBlock::node(entries.clone());
        assert_eq!(sum.footer(), SummaryType::Node);
        assert_eq!(sum.len(), 4);
        let sum = SummaryBlock::data(entries);
        assert_eq!(sum.footer(), SummaryType::Data);
    }

    #[test]
    fn test_indirect_node_span() {
        assert_eq!(indirect_node_span(), 2040);
    }

    #[test]
    fn test_display() {
        assert_eq!(Segno(7).to_string(), "7");
        assert_eq!(Nid(42).to_string(), "42");
        assert_eq!(Version(3).to_string(), "3");
    }
}
