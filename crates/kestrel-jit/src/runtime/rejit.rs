//! When repeated bailouts relax a speculation

use crate::bailout::{BailoutReason, BailoutRecord, FrameTable};

use super::stats::{Relax, SiteKey, SiteStats, SpeculationOverrides};

/// Relaxation decided for one bailout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relaxed {
    pub site: SiteKey,
    pub relax: Relax,
    pub count: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct RejitPolicy {
    threshold: u32,
}

impl RejitPolicy {
    pub fn new(threshold: u32) -> Self {
        RejitPolicy {
            threshold: threshold.max(1),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Count a bailout through `record`. `reported` is the reason the
    /// failing guard gave, if more precise than the record's.
    ///
    /// Returns the newly added override once the site reaches the
    /// threshold; the caller schedules the rejit.
    pub fn on_bailout(
        &self,
        stats: &SiteStats,
        overrides: &SpeculationOverrides,
        frames: &FrameTable,
        record: &BailoutRecord,
        reported: Option<BailoutReason>,
    ) -> Option<Relaxed> {
        let reason = reported.unwrap_or(record.reason);
        if !reason.counts_toward_rejit() {
            return None;
        }
        // Speculation sites belong to the innermost logical frame
        let site = SiteKey::new(frames.get(record.frame).func, record.site);
        let count = stats.record(site);
        if count < self.threshold {
            return None;
        }
        let relax = Relax::for_reason(reason)?;
        overrides.add(site, relax).then_some(Relaxed { site, relax, count })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bailout::{BailoutInfo, BailoutKind};
    use crate::bytecode::FuncId;
    use crate::ir::FrameIdx;

    fn record(reason: BailoutReason) -> BailoutRecord {
        let info = BailoutInfo::new(6, BailoutKind::Eager, reason, FrameIdx::ROOT);
        BailoutRecord::freeze(0, FuncId(3), &info)
    }

    #[test]
    fn test_threshold_relaxes_once() {
        let policy = RejitPolicy::new(3);
        let stats = SiteStats::new();
        let overrides = SpeculationOverrides::new();
        let frames = FrameTable::new(FuncId(3), vec![]);
        let rec = record(BailoutReason::ShapeMismatch);

        assert_eq!(policy.on_bailout(&stats, &overrides, &frames, &rec, None), None);
        assert_eq!(policy.on_bailout(&stats, &overrides, &frames, &rec, None), None);
        let relaxed = policy.on_bailout(&stats, &overrides, &frames, &rec, None).unwrap();
        assert_eq!(relaxed.site, SiteKey::new(FuncId(3), 6));
        assert_eq!(relaxed.relax, Relax::NoShapeSpec);
        assert_eq!(relaxed.count, 3);
        // Already relaxed: later bailouts from stale code schedule nothing
        assert_eq!(policy.on_bailout(&stats, &overrides, &frames, &rec, None), None);
        assert_eq!(stats.count(relaxed.site), 4);
    }

    #[test]
    fn test_reported_reason_wins() {
        let policy = RejitPolicy::new(1);
        let stats = SiteStats::new();
        let overrides = SpeculationOverrides::new();
        let frames = FrameTable::new(FuncId(3), vec![]);
        let rec = record(BailoutReason::NotAnInt);
        let relaxed = policy
            .on_bailout(&stats, &overrides, &frames, &rec, Some(BailoutReason::CallTargetMismatch))
            .unwrap();
        assert_eq!(relaxed.relax, Relax::NoInline);
    }

    #[test]
    fn test_loop_exits_are_not_counted() {
        let policy = RejitPolicy::new(1);
        let stats = SiteStats::new();
        let overrides = SpeculationOverrides::new();
        let frames = FrameTable::new(FuncId(3), vec![]);
        let rec = record(BailoutReason::LoopExit);
        assert_eq!(policy.on_bailout(&stats, &overrides, &frames, &rec, None), None);
        assert_eq!(stats.total(), 0);
    }
}
