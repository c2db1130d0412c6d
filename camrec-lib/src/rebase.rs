//! Per-stream timestamp rebasing.
//!
//! Source timestamps from a live RTSP feed start at an arbitrary (often
//! large) offset and may violate MP4 ordering rules. Each elementary stream
//! gets its own [`TimestampRebase`] that shifts timestamps to a near-zero
//! base, repairs PTS/DTS ordering, and keeps values inside the MOV muxer's
//! signed 32-bit DTS range.

/// Maximum DTS value FFmpeg's MOV muxer supports (signed 32-bit integer).
/// Exceeding this triggers an assertion failure in movenc.c.
pub(crate) const MOV_DTS_MAX: i64 = i32::MAX as i64;

/// Reset threshold applied before the hard limit (~75% of it), so a segment
/// running at a high time-base rate survives without corrupting the file.
pub(crate) const MOV_DTS_SAFETY: i64 = 0x7000_0000;

/// Value timestamps restart from after an overflow reset.
const OVERFLOW_RESET_DTS: i64 = 1000;

/// Rebasing state for one elementary stream. Reset (recreated) at the start
/// of every segment.
pub struct TimestampRebase {
    /// Audio additionally enforces strict monotonicity against the previous
    /// written packet; video relies on the source's decode order.
    strict_monotonic: bool,
    first_dts: Option<i64>,
    first_pts: Option<i64>,
    last_dts: i64,
    last_pts: i64,
    count: u64,
}

impl TimestampRebase {
    pub fn video() -> Self {
        Self::new(false)
    }

    pub fn audio() -> Self {
        Self::new(true)
    }

    fn new(strict_monotonic: bool) -> Self {
        TimestampRebase {
            strict_monotonic,
            first_dts: None,
            first_pts: None,
            last_dts: 0,
            last_pts: 0,
            count: 0,
        }
    }

    /// Packets processed so far.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Rebase one packet's timestamps. `None` inputs (missing timestamps)
    /// pass through unchanged.
    ///
    /// Segment 0 maps timestamps to `max(in - first, 0)`. Later segments use
    /// `in - first + 1`: the single-tick offset splices neighboring files
    /// without carrying a growing base that would eventually overflow the
    /// container's 32-bit offset field.
    pub fn apply(
        &mut self,
        segment_index: u32,
        dts_in: Option<i64>,
        pts_in: Option<i64>,
    ) -> (Option<i64>, Option<i64>) {
        if self.first_dts.is_none() {
            if let Some(dts) = dts_in {
                self.first_dts = Some(dts);
                self.first_pts = Some(pts_in.unwrap_or(dts));
                log::debug!(
                    "first DTS: {}, PTS: {}",
                    dts,
                    self.first_pts.unwrap_or(dts)
                );
            }
        }

        let mut dts = dts_in
            .zip(self.first_dts)
            .map(|(v, first)| rebase_value(v - first, segment_index));
        let mut pts = pts_in
            .zip(self.first_pts)
            .map(|(v, first)| rebase_value(v - first, segment_index));

        // MP4 requires PTS >= DTS.
        if let (Some(p), Some(d)) = (pts, dts) {
            if p < d {
                log::debug!("fixing packet with PTS < DTS: PTS={p}, DTS={d}");
                pts = Some(d);
            }
        }

        if self.strict_monotonic && self.count > 0 {
            if let Some(d) = dts {
                if d <= self.last_dts {
                    dts = Some(self.last_dts + 1);
                }
            }
            if let Some(p) = pts {
                if p <= self.last_pts {
                    pts = Some(self.last_pts + 1);
                }
            }
            if let (Some(p), Some(d)) = (pts, dts) {
                if p < d {
                    pts = Some(d);
                }
            }
        }

        if let Some(d) = dts {
            if d > MOV_DTS_MAX {
                log::warn!("DTS value exceeds MP4 format limit: {d}, resetting to safe value");
                (dts, pts) = reset_overflow(d, pts);
            } else if d > MOV_DTS_SAFETY {
                log::info!("DTS value approaching MP4 format limit: {d}, resetting to prevent overflow");
                (dts, pts) = reset_overflow(d, pts);
            }
        }

        if let Some(d) = dts {
            self.last_dts = d;
        }
        if let Some(p) = pts {
            self.last_pts = p;
        }
        self.count += 1;

        (dts, pts)
    }
}

fn rebase_value(relative: i64, segment_index: u32) -> i64 {
    if segment_index == 0 {
        relative.max(0)
    } else {
        relative + 1
    }
}

/// Restart from a small base, keeping a non-negative PTS-DTS gap.
fn reset_overflow(dts: i64, pts: Option<i64>) -> (Option<i64>, Option<i64>) {
    let gap = pts.map(|p| p - dts).filter(|gap| *gap >= 0).unwrap_or(0);
    (Some(OVERFLOW_RESET_DTS), Some(OVERFLOW_RESET_DTS + gap))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_segment_rebases_to_zero() {
        let mut rebase = TimestampRebase::video();
        assert_eq!(
            rebase.apply(0, Some(90_000), Some(90_000)),
            (Some(0), Some(0))
        );
        assert_eq!(
            rebase.apply(0, Some(93_000), Some(96_000)),
            (Some(3_000), Some(6_000))
        );
    }

    #[test]
    fn first_segment_clamps_negative_relative() {
        // A packet before the latched base must not go negative.
        let mut rebase = TimestampRebase::video();
        rebase.apply(0, Some(90_000), Some(90_000));
        assert_eq!(
            rebase.apply(0, Some(89_000), Some(89_000)),
            (Some(0), Some(0))
        );
    }

    #[test]
    fn later_segments_add_one_tick() {
        let mut rebase = TimestampRebase::video();
        assert_eq!(
            rebase.apply(3, Some(500_000), Some(500_000)),
            (Some(1), Some(1))
        );
        assert_eq!(
            rebase.apply(3, Some(503_000), Some(503_000)),
            (Some(3_001), Some(3_001))
        );
    }

    #[test]
    fn well_formed_input_passes_through_relative() {
        // Monotonic input with PTS >= DTS only gets the base shift.
        let mut rebase = TimestampRebase::video();
        let inputs = [(1000, 1100), (1033, 1133), (1066, 1166)];
        for (dts, pts) in inputs {
            let (out_dts, out_pts) = rebase.apply(0, Some(dts), Some(pts));
            assert_eq!(out_dts, Some(dts - 1000));
            assert_eq!(out_pts, Some(pts - 1100));
        }
    }

    #[test]
    fn pts_never_below_dts() {
        let mut rebase = TimestampRebase::video();
        rebase.apply(0, Some(0), Some(0));
        // B-frame-ish reordering artifact: PTS falls behind DTS after rebase.
        let (dts, pts) = rebase.apply(0, Some(200), Some(100));
        assert!(pts.unwrap() >= dts.unwrap());
    }

    #[test]
    fn missing_pts_latches_dts_as_base() {
        let mut rebase = TimestampRebase::video();
        let (dts, pts) = rebase.apply(0, Some(5000), None);
        assert_eq!(dts, Some(0));
        assert_eq!(pts, None);
        let (dts, pts) = rebase.apply(0, Some(5100), Some(5100));
        assert_eq!(dts, Some(100));
        assert_eq!(pts, Some(100));
    }

    #[test]
    fn audio_is_strictly_monotonic() {
        let mut rebase = TimestampRebase::audio();
        assert_eq!(
            rebase.apply(0, Some(1000), Some(1000)),
            (Some(0), Some(0))
        );
        // Duplicate timestamp bumps by one tick.
        assert_eq!(
            rebase.apply(0, Some(1000), Some(1000)),
            (Some(1), Some(1))
        );
        // Going backwards bumps past the last written value.
        assert_eq!(
            rebase.apply(0, Some(900), Some(900)),
            (Some(2), Some(2))
        );
    }

    #[test]
    fn video_is_not_forced_monotonic() {
        let mut rebase = TimestampRebase::video();
        rebase.apply(0, Some(1000), Some(1000));
        rebase.apply(0, Some(2000), Some(2000));
        // Source hands decode order; a repeated DTS is passed through.
        assert_eq!(
            rebase.apply(0, Some(2000), Some(2000)),
            (Some(1000), Some(1000))
        );
    }

    #[test]
    fn large_first_dts_starts_at_zero() {
        // First packet near the 32-bit limit must come out at 0, and
        // subsequent packets stay bounded.
        let start = (1i64 << 31) - 1000;
        let mut rebase = TimestampRebase::video();
        assert_eq!(
            rebase.apply(0, Some(start), Some(start)),
            (Some(0), Some(0))
        );
        let (dts, _) = rebase.apply(0, Some(start + 3000), Some(start + 3000));
        assert_eq!(dts, Some(3000));
    }

    #[test]
    fn overflow_resets_to_safe_value() {
        let mut rebase = TimestampRebase::video();
        rebase.apply(0, Some(0), Some(0));
        let huge = MOV_DTS_MAX + 500;
        let (dts, pts) = rebase.apply(0, Some(huge), Some(huge + 40));
        assert_eq!(dts, Some(1000));
        // PTS-DTS gap preserved across the reset.
        assert_eq!(pts, Some(1040));
    }

    #[test]
    fn near_limit_resets_preemptively() {
        let mut rebase = TimestampRebase::video();
        rebase.apply(0, Some(0), Some(0));
        let near = MOV_DTS_SAFETY + 1;
        let (dts, pts) = rebase.apply(0, Some(near), Some(near));
        assert_eq!(dts, Some(1000));
        assert_eq!(pts, Some(1000));
        assert!(dts.unwrap() <= MOV_DTS_MAX);
    }

    #[test]
    fn overflow_reset_drops_negative_gap() {
        let mut rebase = TimestampRebase::video();
        rebase.apply(0, Some(0), Some(0));
        let huge = MOV_DTS_MAX + 500;
        // PTS < DTS is fixed to PTS = DTS before the guard, so the preserved
        // gap is zero.
        let (dts, pts) = rebase.apply(0, Some(huge), Some(huge - 40));
        assert_eq!(dts, Some(1000));
        assert_eq!(pts, Some(1000));
    }

    #[test]
    fn audio_monotonic_recovers_after_reset() {
        let mut rebase = TimestampRebase::audio();
        rebase.apply(0, Some(0), Some(0));
        let huge = MOV_DTS_MAX + 1;
        let (dts, _) = rebase.apply(0, Some(huge), Some(huge));
        assert_eq!(dts, Some(1000));
        // Next packet continues from the reset base, not the huge value.
        let (dts, _) = rebase.apply(0, Some(huge + 10), Some(huge + 10));
        assert!(dts.unwrap() <= MOV_DTS_MAX);
    }
}
