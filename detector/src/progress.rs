use tracing::warn;

/// Why progress figures are partly unavailable. Never fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DegenerateInput {
    /// The stream did not report a frame count.
    UnknownFrameCount,
    /// The stream did not report a usable frame rate.
    UnknownFrameRate,
}

/// Progress snapshot published after every processed frame.
#[derive(Debug, Clone, PartialEq)]
pub struct RunProgress {
    /// Frames processed so far.
    pub frame_index: u64,
    pub total_frames: u64,
    pub percent_complete: f64,
    /// Seconds of video content processed, if the frame rate is known.
    pub current_media_time: Option<f64>,
    pub elapsed_seconds: f64,
    pub estimated_remaining_seconds: f64,
    pub degenerate: Option<DegenerateInput>,
}

impl RunProgress {
    pub fn initial(total_frames: u64) -> Self {
        Self {
            frame_index: 0,
            total_frames,
            percent_complete: 0.0,
            current_media_time: None,
            elapsed_seconds: 0.0,
            estimated_remaining_seconds: 0.0,
            degenerate: None,
        }
    }
}

/// Turns frame position and wall-clock time into completion and ETA figures.
///
/// The remaining-time estimate is a plain linear extrapolation of the average
/// per-frame time observed so far.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    total_frames: u64,
    frame_rate: Option<f64>,
}

impl ProgressReporter {
    pub fn new(total_frames: u64, frame_rate: Option<f64>) -> Self {
        let frame_rate = frame_rate.filter(|r| r.is_finite() && *r > 0.0);
        if total_frames == 0 {
            warn!("stream reports no frame count; percent and remaining time will read 0");
        }
        if frame_rate.is_none() {
            warn!("stream reports no frame rate; media time unavailable");
        }
        Self {
            total_frames,
            frame_rate,
        }
    }

    pub fn degenerate(&self) -> Option<DegenerateInput> {
        if self.total_frames == 0 {
            Some(DegenerateInput::UnknownFrameCount)
        } else if self.frame_rate.is_none() {
            Some(DegenerateInput::UnknownFrameRate)
        } else {
            None
        }
    }

    /// `frame_index` counts frames processed, so the last frame of an
    /// `n`-frame stream reports `n` and 100%.
    pub fn update(&self, frame_index: u64, elapsed_seconds: f64) -> RunProgress {
        let total = self.total_frames;

        let percent_complete = if total == 0 {
            0.0
        } else {
            (100.0 * frame_index as f64 / total as f64).min(100.0)
        };

        let estimated_remaining_seconds = if total == 0 || frame_index == 0 {
            0.0
        } else {
            let per_frame = elapsed_seconds / frame_index as f64;
            per_frame * total.saturating_sub(frame_index) as f64
        };

        RunProgress {
            frame_index,
            total_frames: total,
            percent_complete,
            current_media_time: self.frame_rate.map(|fps| frame_index as f64 / fps),
            elapsed_seconds,
            estimated_remaining_seconds,
            degenerate: self.degenerate(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn halfway_extrapolates_linearly() {
        let reporter = ProgressReporter::new(100, Some(10.0));
        let p = reporter.update(50, 5.0);
        assert_eq!(p.percent_complete, 50.0);
        assert_eq!(p.estimated_remaining_seconds, 5.0);
        assert_eq!(p.current_media_time, Some(5.0));
        assert_eq!(p.degenerate, None);
    }

    #[test]
    fn last_frame_is_complete() {
        let reporter = ProgressReporter::new(100, Some(25.0));
        let p = reporter.update(100, 12.0);
        assert_eq!(p.percent_complete, 100.0);
        assert_eq!(p.estimated_remaining_seconds, 0.0);
        assert_eq!(p.current_media_time, Some(4.0));
    }

    #[test]
    fn zero_total_frames_reports_zero() {
        let reporter = ProgressReporter::new(0, Some(30.0));
        let p = reporter.update(17, 3.0);
        assert_eq!(p.percent_complete, 0.0);
        assert_eq!(p.estimated_remaining_seconds, 0.0);
        assert_eq!(p.degenerate, Some(DegenerateInput::UnknownFrameCount));
    }

    #[test]
    fn first_update_has_no_estimate() {
        let reporter = ProgressReporter::new(10, Some(30.0));
        let p = reporter.update(0, 0.4);
        assert_eq!(p.estimated_remaining_seconds, 0.0);
        assert_eq!(p.percent_complete, 0.0);
    }

    #[test]
    fn missing_frame_rate_drops_media_time() {
        let reporter = ProgressReporter::new(10, None);
        let p = reporter.update(5, 1.0);
        assert_eq!(p.current_media_time, None);
        assert_eq!(p.degenerate, Some(DegenerateInput::UnknownFrameRate));
        assert_eq!(p.percent_complete, 50.0);

        let nan_rate = ProgressReporter::new(10, Some(f64::NAN));
        assert_eq!(nan_rate.update(5, 1.0).current_media_time, None);
    }

    #[test]
    fn overrun_is_clamped() {
        // container frame counts can undershoot the decoded count
        let reporter = ProgressReporter::new(10, Some(30.0));
        let p = reporter.update(12, 2.0);
        assert_eq!(p.percent_complete, 100.0);
        assert_eq!(p.estimated_remaining_seconds, 0.0);
    }
}
