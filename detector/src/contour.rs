use figwatch_common::config::DetectionConfig;
use figwatch_common::frame::ForegroundMask;
use imageproc::contours::{find_contours, BorderType};
use imageproc::point::Point;
use tracing::debug;

/// Axis-aligned box enclosing a region, inclusive of its extreme pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    /// Width over height, or `None` for a zero-height box.
    pub fn aspect_ratio(&self) -> Option<f64> {
        if self.height == 0 {
            return None;
        }
        Some(self.width as f64 / self.height as f64)
    }
}

/// Outer boundary of one connected foreground region.
#[derive(Debug, Clone, PartialEq)]
pub struct Contour {
    pub points: Vec<Point<i32>>,
}

impl Contour {
    pub fn new(points: Vec<Point<i32>>) -> Self {
        Self { points }
    }

    /// Area enclosed by the boundary polygon (shoelace formula).
    pub fn area(&self) -> f64 {
        let n = self.points.len();
        if n < 3 {
            return 0.0;
        }
        let twice: i64 = (0..n)
            .map(|i| {
                let a = self.points[i];
                let b = self.points[(i + 1) % n];
                a.x as i64 * b.y as i64 - b.x as i64 * a.y as i64
            })
            .sum();
        twice.abs() as f64 / 2.0
    }

    pub fn bounding_box(&self) -> BoundingBox {
        let Some(first) = self.points.first() else {
            return BoundingBox { x: 0, y: 0, width: 0, height: 0 };
        };
        let (mut min_x, mut min_y, mut max_x, mut max_y) = (first.x, first.y, first.x, first.y);
        for p in &self.points[1..] {
            min_x = min_x.min(p.x);
            min_y = min_y.min(p.y);
            max_x = max_x.max(p.x);
            max_y = max_y.max(p.y);
        }
        BoundingBox {
            x: min_x,
            y: min_y,
            width: (max_x - min_x + 1) as u32,
            height: (max_y - min_y + 1) as u32,
        }
    }
}

/// A contour that passed the size and shape filter.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub contour: Contour,
    pub bbox: BoundingBox,
    pub area: f64,
}

/// Extracts region boundaries from a mask and keeps the plausibly
/// person-shaped ones.
#[derive(Debug, Clone)]
pub struct ContourDetector {
    aspect_ratio_min: f64,
    aspect_ratio_max: f64,
}

impl ContourDetector {
    pub fn new(config: &DetectionConfig) -> Self {
        Self {
            aspect_ratio_min: config.aspect_ratio_min,
            aspect_ratio_max: config.aspect_ratio_max,
        }
    }

    /// Outer boundaries of every top-level foreground region, in raster order
    /// of their first pixel. Holes and regions nested inside holes are skipped.
    pub fn extract(&self, mask: &ForegroundMask) -> Vec<Contour> {
        find_contours::<i32>(mask.as_image())
            .into_iter()
            .filter(|c| matches!(c.border_type, BorderType::Outer) && c.parent.is_none())
            .map(|c| Contour::new(c.points))
            .collect()
    }

    /// Keep contours with `area >= min_area` and an aspect ratio strictly
    /// inside the configured bounds. Input order is preserved.
    pub fn filter(&self, contours: &[Contour], min_area: u32) -> Vec<Candidate> {
        let candidates: Vec<Candidate> = contours
            .iter()
            .filter_map(|contour| {
                let area = contour.area();
                if area < min_area as f64 {
                    return None;
                }
                let bbox = contour.bounding_box();
                let ratio = bbox.aspect_ratio()?;
                if ratio <= self.aspect_ratio_min || ratio >= self.aspect_ratio_max {
                    return None;
                }
                Some(Candidate {
                    contour: contour.clone(),
                    bbox,
                    area,
                })
            })
            .collect();

        debug!(
            contours = contours.len(),
            candidates = candidates.len(),
            min_area,
            "contours filtered"
        );
        candidates
    }

    pub fn detect(&self, mask: &ForegroundMask, min_area: u32) -> Vec<Candidate> {
        let contours = self.extract(mask);
        self.filter(&contours, min_area)
    }
}
