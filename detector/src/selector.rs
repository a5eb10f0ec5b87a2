use std::io::Cursor;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use figwatch_common::config::OutputConfig;
use figwatch_common::frame::Frame;
use image::{ImageFormat, Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use tracing::{debug, info};

use crate::contour::{BoundingBox, Candidate};

/// Box colour drawn on saved frames.
pub const HIGHLIGHT: Rgb<u8> = Rgb([0, 255, 0]);
/// Box stroke width in pixels, drawn inward from the bounding box edge.
pub const STROKE_WIDTH: u32 = 2;

/// Per-run save bookkeeping. Only the selector mutates it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionState {
    /// `None` until the first save.
    pub last_saved_frame_index: Option<u64>,
    pub saved_count: u64,
}

/// A frame that was annotated and written to disk.
#[derive(Debug, Clone, PartialEq)]
pub struct SavedFrameRecord {
    pub path: PathBuf,
    pub frame_index: u64,
    pub captured_at: DateTime<Local>,
    pub boxes: Vec<BoundingBox>,
}

/// Cooldown gate in front of frame persistence.
///
/// A frame with at least one candidate is saved when no frame has been saved
/// yet, or when it lies at least `min_frame_gap` frames after the last save.
/// Everything else is dropped without touching the state.
#[derive(Debug, Clone)]
pub struct FrameSelector {
    output_dir: PathBuf,
    extension: String,
    format: ImageFormat,
    min_frame_gap: u64,
}

impl FrameSelector {
    pub fn new(output: &OutputConfig, min_frame_gap: u64) -> Result<Self, WriteError> {
        let format = output
            .image_format()
            .ok_or_else(|| WriteError::UnsupportedFormat(output.extension.clone()))?;
        Ok(Self {
            output_dir: output.dir.clone(),
            extension: output.extension.clone(),
            format,
            min_frame_gap,
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Whether the cooldown since the last save has elapsed at `frame_index`.
    pub fn is_ready(&self, state: &SelectionState, frame_index: u64) -> bool {
        match state.last_saved_frame_index {
            None => true,
            Some(last) => frame_index.saturating_sub(last) >= self.min_frame_gap,
        }
    }

    /// Save `frame` with its candidates boxed if the gate allows it.
    ///
    /// The write completes before this returns, so the caller can never run
    /// more than one frame ahead of the disk.
    pub async fn consider(
        &self,
        frame: &Frame,
        candidates: &[Candidate],
        state: &mut SelectionState,
    ) -> Result<Option<SavedFrameRecord>, WriteError> {
        if candidates.is_empty() {
            return Ok(None);
        }
        if !self.is_ready(state, frame.index) {
            debug!(
                frame = frame.index,
                last_saved = state.last_saved_frame_index,
                candidates = candidates.len(),
                "candidates in cooldown, not saving"
            );
            return Ok(None);
        }

        let captured_at = Local::now();
        let path = self
            .output_dir
            .join(frame_file_name(frame.index, &captured_at, &self.extension));
        let annotated = annotate(&frame.image, candidates);

        let mut bytes = Vec::new();
        annotated
            .write_to(&mut Cursor::new(&mut bytes), self.format)
            .map_err(|source| WriteError::Encode {
                path: path.clone(),
                source,
            })?;
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|source| WriteError::Io {
                path: path.clone(),
                source,
            })?;

        state.last_saved_frame_index = Some(frame.index);
        state.saved_count += 1;

        info!(
            frame = frame.index,
            path = %path.display(),
            boxes = candidates.len(),
            bytes = bytes.len(),
            saved = state.saved_count,
            "saved annotated frame"
        );

        Ok(Some(SavedFrameRecord {
            path,
            frame_index: frame.index,
            captured_at,
            boxes: candidates.iter().map(|c| c.bbox).collect(),
        }))
    }
}

/// Copy of `image` with a highlight rectangle around every candidate.
pub fn annotate(image: &RgbImage, candidates: &[Candidate]) -> RgbImage {
    let mut canvas = image.clone();
    for candidate in candidates {
        let b = candidate.bbox;
        for inset in 0..STROKE_WIDTH {
            let (w, h) = (b.width.saturating_sub(2 * inset), b.height.saturating_sub(2 * inset));
            if w == 0 || h == 0 {
                break;
            }
            let rect = Rect::at(b.x + inset as i32, b.y + inset as i32).of_size(w, h);
            draw_hollow_rect_mut(&mut canvas, rect, HIGHLIGHT);
        }
    }
    canvas
}

/// `frame_<index:04>_<YYYYMMDD-HHMMSS>.<ext>`
pub fn frame_file_name(frame_index: u64, captured_at: &DateTime<Local>, extension: &str) -> String {
    format!(
        "frame_{frame_index:04}_{ts}.{extension}",
        ts = captured_at.format("%Y%m%d-%H%M%S")
    )
}

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("output extension {0:?} is not a writable image format")]
    UnsupportedFormat(String),
    #[error("failed to encode {}: {source}", path.display())]
    Encode {
        path: PathBuf,
        source: image::ImageError,
    },
    #[error("failed to write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}
