//! Step/block residual cache for the transformer.
//!
//! On steps the schedule marks as "compute", every block runs and the
//! residual (`output - input`) of each run of consecutive non-exempt blocks
//! is recorded. On the remaining steps those runs are skipped and the
//! recorded residual is added instead. Exempt blocks always run.

use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::ops::Range;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSchedule {
    /// Steps on which every block is recomputed.
    pub no_cache_steps: BTreeSet<usize>,
    /// Double-stream block indices that are never skipped.
    pub exempt_double: BTreeSet<usize>,
    /// Single-stream block indices that are never skipped.
    pub exempt_single: BTreeSet<usize>,
    /// First step the schedule applies to. Earlier steps are always fully
    /// computed and `no_cache_steps` is counted from here.
    pub start_step: usize,
}

impl Default for CacheSchedule {
    fn default() -> Self {
        Self::panorama()
    }
}

impl CacheSchedule {
    /// Dense at both ends of the trajectory, every third step in between.
    pub fn panorama() -> Self {
        Self {
            no_cache_steps: (0..10).chain((10..40).step_by(3)).chain(40..50).collect(),
            exempt_double: BTreeSet::new(),
            exempt_single: BTreeSet::from([38]),
            start_step: 0,
        }
    }

    pub fn computes_step(&self, step: usize) -> bool {
        step
            .checked_sub(self.start_step)
            .map_or(true, |offset| self.no_cache_steps.contains(&offset))
    }

    /// Splits the block stack into runs; exempt blocks form their own
    /// non-cacheable single-block runs.
    pub fn segments(&self, depth: usize, single_depth: usize) -> Vec<Segment> {
        let mut segments = split(BlockKind::Double, depth, &self.exempt_double);
        segments.extend(split(BlockKind::Single, single_depth, &self.exempt_single));
        segments
    }
}

fn split(kind: BlockKind, len: usize, exempt: &BTreeSet<usize>) -> Vec<Segment> {
    let mut out = Vec::new();
    let mut start = 0;
    for idx in 0..len {
        if exempt.contains(&idx) {
            if start < idx {
                out.push(Segment::new(kind, start..idx, true));
            }
            out.push(Segment::new(kind, idx..idx + 1, false));
            start = idx + 1;
        }
    }
    if start < len {
        out.push(Segment::new(kind, start..len, true));
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKind {
    Double,
    Single,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub kind: BlockKind,
    pub blocks: Range<usize>,
    pub cacheable: bool,
}

impl Segment {
    fn new(kind: BlockKind, blocks: Range<usize>, cacheable: bool) -> Self {
        Self {
            kind,
            blocks,
            cacheable,
        }
    }

    /// One non-cacheable run per block kind.
    pub fn uncached(depth: usize, single_depth: usize) -> Vec<Self> {
        vec![
            Self::new(BlockKind::Double, 0..depth, false),
            Self::new(BlockKind::Single, 0..single_depth, false),
        ]
    }
}

/// Per-generation cache state. One instance per guidance branch.
#[derive(Debug)]
pub struct BlockCache {
    schedule: CacheSchedule,
    segments: Vec<Segment>,
    residuals: HashMap<usize, Vec<Tensor>>,
    full_step: bool,
}

impl BlockCache {
    pub fn new(schedule: CacheSchedule, depth: usize, single_depth: usize) -> Self {
        for &idx in schedule.exempt_double.iter().filter(|&&i| i >= depth) {
            warn!(block = idx, depth, "exempt double block is out of range, ignoring");
        }
        for &idx in schedule.exempt_single.iter().filter(|&&i| i >= single_depth) {
            warn!(block = idx, depth = single_depth, "exempt single block is out of range, ignoring");
        }
        let segments = schedule.segments(depth, single_depth);
        Self {
            schedule,
            segments,
            residuals: HashMap::new(),
            full_step: true,
        }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn begin_step(&mut self, step: usize) {
        self.full_step = self.schedule.computes_step(step) || self.residuals.is_empty();
    }

    pub fn is_full_step(&self) -> bool {
        self.full_step
    }

    /// Recorded residual for `segment` if it may be skipped on this step.
    pub fn reusable(&self, segment: usize) -> Option<&[Tensor]> {
        if self.full_step || !self.segments.get(segment)?.cacheable {
            return None;
        }
        self.residuals.get(&segment).map(Vec::as_slice)
    }

    pub fn wants(&self, segment: usize) -> bool {
        self.full_step && self.segments.get(segment).is_some_and(|s| s.cacheable)
    }

    pub fn record(&mut self, segment: usize, residual: Vec<Tensor>) {
        if self.wants(segment) {
            self.residuals.insert(segment, residual);
        }
    }
}
