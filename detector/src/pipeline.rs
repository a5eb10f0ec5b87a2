use std::path::PathBuf;
use std::time::Duration;

use figwatch_common::config::{BackgroundConfig, Config};
use figwatch_common::frame::Frame;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::background::BackgroundModel;
use crate::contour::{Candidate, ContourDetector};
use crate::control::{ControlHandle, RunState};
use crate::progress::{ProgressReporter, RunProgress};
use crate::selector::{FrameSelector, SavedFrameRecord, SelectionState, WriteError};
use crate::source::{FfmpegSource, FrameSource, SourceError};

/// How a run that did not fail ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The source ran out of frames.
    Completed,
    /// A stop was requested before the end of the stream.
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    pub saved_count: u64,
    pub frames_processed: u64,
    pub output_dir: PathBuf,
    pub saved: Vec<SavedFrameRecord>,
}

/// Notifications for an observer, in the order they happen.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    StateChanged(RunState),
    FrameSaved(SavedFrameRecord),
}

/// One processing run: decode, segment, filter, select, report.
///
/// Frames are handled strictly one at a time: the task that awaits
/// [`Pipeline::run`] decodes and saves, and hands segmentation of each frame
/// to the blocking pool in between. Pause, stop and sensitivity come in through the
/// [`ControlHandle`]; progress goes out on a watch channel and saves on the
/// event channel.
pub struct Pipeline<S> {
    source: S,
    background: BackgroundConfig,
    detector: ContourDetector,
    selector: FrameSelector,
    reporter: ProgressReporter,
    control: ControlHandle,
    pause_poll: Duration,
    max_images_per_scene: u32,
    progress_tx: watch::Sender<RunProgress>,
    event_tx: Option<mpsc::UnboundedSender<PipelineEvent>>,
}

impl Pipeline<FfmpegSource> {
    /// Open the configured video and prepare the output directory.
    pub async fn open(config: &Config, control: ControlHandle) -> Result<Self, PipelineError> {
        let source = FfmpegSource::open(&config.input)
            .await
            .map_err(InputError::Source)?;
        Self::new(source, config, control).await
    }
}

impl<S: FrameSource> Pipeline<S> {
    pub async fn new(source: S, config: &Config, control: ControlHandle) -> Result<Self, PipelineError> {
        let selector = FrameSelector::new(&config.output, config.selection.min_frame_gap)
            .map_err(InputError::Output)?;

        tokio::fs::create_dir_all(&config.output.dir)
            .await
            .map_err(|source| InputError::OutputDir {
                path: config.output.dir.clone(),
                source,
            })?;

        let info = source.info();
        let reporter = ProgressReporter::new(info.total_frames, info.frame_rate);
        let (progress_tx, _) = watch::channel(RunProgress::initial(info.total_frames));

        Ok(Self {
            source,
            background: config.background.clone(),
            detector: ContourDetector::new(&config.detection),
            selector,
            reporter,
            control,
            pause_poll: Duration::from_millis(config.control.pause_poll_ms.max(1)),
            max_images_per_scene: config.selection.max_images_per_scene,
            progress_tx,
            event_tx: None,
        })
    }

    /// Latest progress, updated after every processed frame.
    pub fn progress(&self) -> watch::Receiver<RunProgress> {
        self.progress_tx.subscribe()
    }

    /// Event stream for this run. Calling it again replaces the previous stream.
    pub fn events(&mut self) -> mpsc::UnboundedReceiver<PipelineEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.event_tx = Some(tx);
        rx
    }

    pub async fn run(mut self) -> Result<RunSummary, PipelineError> {
        let info = self.source.info();
        info!(
            width = info.width,
            height = info.height,
            total_frames = info.total_frames,
            frame_rate = info.frame_rate,
            output_dir = %self.selector.output_dir().display(),
            min_contour_area = self.control.min_contour_area(),
            max_images_per_scene = self.max_images_per_scene,
            "run started"
        );
        self.transition(RunState::Running);

        let started = Instant::now();
        let mut segmenter = Segmenter {
            background: BackgroundModel::new(self.background.clone()),
            detector: self.detector.clone(),
        };
        let mut selection = SelectionState::default();
        let mut saved = Vec::new();
        let mut processed: u64 = 0;

        let outcome = loop {
            if self.control.stop_requested() {
                break RunOutcome::Cancelled;
            }

            if self.control.is_paused() {
                if self.control.state() != RunState::Paused {
                    info!(frames = processed, "run paused");
                    self.transition(RunState::Paused);
                }
                tokio::time::sleep(self.pause_poll).await;
                continue;
            }
            if self.control.state() == RunState::Paused {
                info!(frames = processed, "run resumed");
                self.transition(RunState::Running);
            }

            let frame = match self.source.next_frame().await {
                Ok(Some(frame)) => frame,
                Ok(None) => break RunOutcome::Completed,
                Err(e) if processed == 0 => return Err(self.fail(InputError::Source(e).into())),
                Err(e) => return Err(self.fail(PipelineError::Source(e))),
            };

            let min_area = self.control.min_contour_area();
            let segmented = tokio::task::spawn_blocking(move || {
                let candidates = segmenter.process(&frame, min_area);
                (segmenter, frame, candidates)
            })
            .await;
            let (frame, candidates) = match segmented {
                Ok((returned, frame, candidates)) => {
                    segmenter = returned;
                    (frame, candidates)
                }
                Err(e) => return Err(self.fail(PipelineError::Segmentation(e))),
            };

            match self.selector.consider(&frame, &candidates, &mut selection).await {
                Ok(Some(record)) => {
                    self.emit(PipelineEvent::FrameSaved(record.clone()));
                    saved.push(record);
                }
                Ok(None) => {}
                Err(source) => {
                    let saved_count = selection.saved_count;
                    return Err(self.fail(PipelineError::Write { saved_count, source }));
                }
            }

            processed += 1;
            let progress = self
                .reporter
                .update(processed, started.elapsed().as_secs_f64());
            debug!(
                frame = frame.index,
                percent = progress.percent_complete,
                remaining_secs = progress.estimated_remaining_seconds,
                "frame processed"
            );
            self.progress_tx.send_replace(progress);
        };

        let final_state = match outcome {
            RunOutcome::Completed => RunState::Completed,
            RunOutcome::Cancelled => RunState::Cancelled,
        };
        let output_dir = self.selector.output_dir().to_path_buf();
        info!(
            outcome = ?outcome,
            frames = processed,
            saved = selection.saved_count,
            output_dir = %output_dir.display(),
            elapsed_secs = started.elapsed().as_secs_f64(),
            "run finished"
        );
        self.transition(final_state);

        Ok(RunSummary {
            outcome,
            saved_count: selection.saved_count,
            frames_processed: processed,
            output_dir,
            saved,
        })
    }

    fn transition(&self, state: RunState) {
        self.control.set_state(state);
        self.emit(PipelineEvent::StateChanged(state));
    }

    fn emit(&self, event: PipelineEvent) {
        if let Some(tx) = &self.event_tx {
            // a departed observer must not stop the run
            let _ = tx.send(event);
        }
    }

    fn fail(&self, err: PipelineError) -> PipelineError {
        error!(error = %err, "run failed");
        self.transition(RunState::Failed);
        err
    }
}

/// Background model and contour filter for one run. Moved onto the blocking
/// pool for every frame since a full-resolution update is pure CPU work.
struct Segmenter {
    background: BackgroundModel,
    detector: ContourDetector,
}

impl Segmenter {
    fn process(&mut self, frame: &Frame, min_area: u32) -> Vec<Candidate> {
        let mask = self.background.apply(frame);
        self.detector.detect(&mask, min_area)
    }
}

/// Failures that prevent a run from starting. Nothing has been processed or
/// written when one of these is returned.
#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error(transparent)]
    Source(SourceError),
    #[error("cannot create output directory {}: {source}", path.display())]
    OutputDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Output(WriteError),
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("input error: {0}")]
    Input(#[from] InputError),
    #[error("failed to save frame ({saved_count} saved before the failure): {source}")]
    Write {
        saved_count: u64,
        source: WriteError,
    },
    #[error("decoding failed mid-run: {0}")]
    Source(SourceError),
    #[error("segmentation worker failed: {0}")]
    Segmentation(tokio::task::JoinError),
}
