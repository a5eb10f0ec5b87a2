use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

/// Lifecycle of one processing run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

impl RunState {
    fn to_u8(self) -> u8 {
        match self {
            RunState::Idle => 0,
            RunState::Running => 1,
            RunState::Paused => 2,
            RunState::Completed => 3,
            RunState::Cancelled => 4,
            RunState::Failed => 5,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => RunState::Running,
            2 => RunState::Paused,
            3 => RunState::Completed,
            4 => RunState::Cancelled,
            5 => RunState::Failed,
            _ => RunState::Idle,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Completed | RunState::Cancelled | RunState::Failed)
    }
}

#[derive(Debug)]
struct Shared {
    paused: AtomicBool,
    stop: AtomicBool,
    min_contour_area: AtomicU32,
    state: AtomicU8,
}

/// Signals shared between a running pipeline and whoever observes it.
///
/// The pipeline samples the flags once per loop iteration, so a pause, stop
/// or sensitivity change takes effect at most one frame late. Only
/// visibility is needed, hence relaxed ordering throughout.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    shared: Arc<Shared>,
}

impl ControlHandle {
    pub fn new(min_contour_area: u32) -> Self {
        Self {
            shared: Arc::new(Shared {
                paused: AtomicBool::new(false),
                stop: AtomicBool::new(false),
                min_contour_area: AtomicU32::new(min_contour_area),
                state: AtomicU8::new(RunState::Idle.to_u8()),
            }),
        }
    }

    /// Flip the pause flag and return the new value.
    pub fn toggle_pause(&self) -> bool {
        !self.shared.paused.fetch_xor(true, Ordering::Relaxed)
    }

    pub fn set_paused(&self, paused: bool) {
        self.shared.paused.store(paused, Ordering::Relaxed);
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Relaxed)
    }

    pub fn request_stop(&self) {
        self.shared.stop.store(true, Ordering::Relaxed);
    }

    pub fn stop_requested(&self) -> bool {
        self.shared.stop.load(Ordering::Relaxed)
    }

    /// Applies to frames processed after the change.
    pub fn set_min_contour_area(&self, area: u32) {
        self.shared.min_contour_area.store(area, Ordering::Relaxed);
    }

    pub fn min_contour_area(&self) -> u32 {
        self.shared.min_contour_area.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> RunState {
        RunState::from_u8(self.shared.state.load(Ordering::Relaxed))
    }

    pub(crate) fn set_state(&self, state: RunState) {
        self.shared.state.store(state.to_u8(), Ordering::Relaxed);
    }
}
