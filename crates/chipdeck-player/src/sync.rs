//! Position synchronizer - one coherent display position from many clocks
//!
//! Backends report position at wildly different cadences: the sync-pull
//! source updates atomics every audio quantum, the message worker pushes at
//! ~20 Hz, the shared-memory record is polled at the UI's own rate. The
//! synchronizer keeps the latest report of the single active backend and
//! extrapolates display *time* between reports using the backend's clock:
//!
//! `displayed_time = report.time + max(0, clock_now - report.clock)`
//!
//! Order and row are never interpolated; they hold until the next discrete
//! report. A seek or engine switch replaces the whole snapshot atomically so
//! display time can never jump backward across the switch.

use chipdeck_core::PlaybackPosition;

/// How the active backend delivers position reports.
///
/// The distinction is kept visible here because extrapolation is only
/// meaningful against the clock domain that produced the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportMode {
    /// Derived synchronously after each render quantum (audio clock)
    #[default]
    Pull,
    /// Pushed over a channel at a throttled rate (worker monotonic clock)
    Push,
    /// Read from shared memory on a wall-clock poll timer
    Poll,
}

/// Position as presented to the UI
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DisplayPosition {
    pub order: usize,
    pub row: usize,
    pub time_seconds: f64,
}

/// Merges one backend's position reports into a display position
#[derive(Debug, Default)]
pub struct PositionSynchronizer {
    last: Option<PlaybackPosition>,
    mode: ReportMode,
}

impl PositionSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// The report mode of the current session
    pub fn mode(&self) -> ReportMode {
        self.mode
    }

    /// Start a new report session (backend activation or engine switch).
    /// Clears the snapshot and the mode in one step.
    pub fn reset(&mut self, mode: ReportMode) {
        self.last = None;
        self.mode = mode;
    }

    /// Record a report from the active backend.
    ///
    /// Reports that carry no new audio position (same time and row as the
    /// current snapshot) are ignored so re-observing an unchanged record
    /// cannot rebase the extrapolation and walk display time backward.
    pub fn observe(&mut self, report: PlaybackPosition) {
        if let Some(last) = &self.last {
            if report.time_seconds == last.time_seconds
                && report.order == last.order
                && report.row == last.row
            {
                return;
            }
        }
        self.last = Some(report);
    }

    /// Overwrite the displayed order/row immediately (responsive seek UI).
    ///
    /// Display time restarts extrapolating from the seek instant; the next
    /// real report corrects it.
    pub fn force(&mut self, order: usize, row: usize, time_seconds: f64, clock_now: f64) {
        self.last = Some(PlaybackPosition {
            order,
            row,
            time_seconds,
            report_clock: clock_now,
        });
    }

    /// The last reported position without extrapolation (paused display)
    pub fn current(&self) -> Option<DisplayPosition> {
        self.last.map(|last| DisplayPosition {
            order: last.order,
            row: last.row,
            time_seconds: last.time_seconds,
        })
    }

    /// The extrapolated position for a running session.
    ///
    /// `clock_now` must come from the same clock the active backend stamps
    /// its reports with.
    pub fn displayed(&self, clock_now: f64) -> Option<DisplayPosition> {
        self.last.map(|last| DisplayPosition {
            order: last.order,
            row: last.row,
            time_seconds: last.time_seconds + (clock_now - last.report_clock).max(0.0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    #[test]
    fn test_extrapolates_time_between_reports() {
        let mut sync = PositionSynchronizer::new();
        sync.reset(ReportMode::Push);
        sync.observe(PlaybackPosition {
            order: 0,
            row: 10,
            time_seconds: 5.0,
            report_clock: 100.0,
        });

        let shown = sync.displayed(100.2).unwrap();
        assert!((shown.time_seconds - 5.2).abs() < EPS);
        // Row is held, never interpolated
        assert_eq!(shown.row, 10);
    }

    #[test]
    fn test_clock_regression_never_rewinds_time() {
        let mut sync = PositionSynchronizer::new();
        sync.reset(ReportMode::Poll);
        sync.observe(PlaybackPosition {
            order: 1,
            row: 3,
            time_seconds: 2.0,
            report_clock: 50.0,
        });

        let shown = sync.displayed(49.5).unwrap();
        assert!((shown.time_seconds - 2.0).abs() < EPS);
    }

    #[test]
    fn test_duplicate_report_does_not_rebase() {
        let mut sync = PositionSynchronizer::new();
        sync.reset(ReportMode::Poll);
        let report = PlaybackPosition {
            order: 0,
            row: 7,
            time_seconds: 1.0,
            report_clock: 10.0,
        };
        sync.observe(report);

        // Same audio position polled again later must not move the base
        sync.observe(PlaybackPosition {
            report_clock: 10.5,
            ..report
        });
        let shown = sync.displayed(10.5).unwrap();
        assert!((shown.time_seconds - 1.5).abs() < EPS);
    }

    #[test]
    fn test_reset_clears_snapshot() {
        let mut sync = PositionSynchronizer::new();
        sync.reset(ReportMode::Push);
        sync.observe(PlaybackPosition::default());
        assert!(sync.current().is_some());

        sync.reset(ReportMode::Pull);
        assert!(sync.current().is_none());
        assert_eq!(sync.mode(), ReportMode::Pull);
    }

    #[test]
    fn test_force_overrides_row_immediately() {
        let mut sync = PositionSynchronizer::new();
        sync.reset(ReportMode::Push);
        sync.observe(PlaybackPosition {
            order: 0,
            row: 10,
            time_seconds: 5.0,
            report_clock: 100.0,
        });

        sync.force(2, 0, 5.0, 101.0);
        let shown = sync.current().unwrap();
        assert_eq!((shown.order, shown.row), (2, 0));
    }
}
