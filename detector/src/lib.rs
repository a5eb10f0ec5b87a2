//! Offline scan of a recorded video for human-shaped moving figures.
//!
//! A [`Pipeline`] pulls frames from a [`FrameSource`], separates foreground
//! with a per-pixel mixture model, keeps upright blob contours and saves an
//! annotated copy of a qualifying frame at most once per cooldown window.

pub mod background;
pub mod contour;
pub mod control;
pub mod pipeline;
pub mod progress;
pub mod selector;
pub mod source;

pub use control::{ControlHandle, RunState};
pub use pipeline::{
    InputError, Pipeline, PipelineError, PipelineEvent, RunOutcome, RunSummary,
};
pub use progress::{DegenerateInput, RunProgress};
pub use source::{FfmpegSource, FrameSource, StreamInfo};
