use figwatch_common::config::BackgroundConfig;
use figwatch_common::frame::{ForegroundMask, Frame};
use image::imageops;
use tracing::{debug, warn};

/// One Gaussian component of a pixel's background distribution.
#[derive(Debug, Clone, Copy, Default)]
struct Mode {
    weight: f32,
    mean: f32,
    variance: f32,
}

/// Adaptive per-pixel Gaussian mixture model of the static scene.
///
/// Each pixel keeps up to `max_modes` weighted Gaussians over its luma value,
/// ordered by weight. The heaviest modes whose weights add up to
/// `background_ratio` describe the background; a pixel matching one of them
/// is background, anything else is foreground. Every call to [`apply`]
/// updates the model, so frames must be fed once each, in stream order.
///
/// The first frame seeds one mode per pixel and produces an empty mask.
///
/// [`apply`]: BackgroundModel::apply
pub struct BackgroundModel {
    params: BackgroundConfig,
    width: u32,
    height: u32,
    /// `width * height * max_modes` slots, pixel-major.
    modes: Vec<Mode>,
    /// Live modes per pixel.
    mode_counts: Vec<u8>,
    frames_seen: u64,
}

impl BackgroundModel {
    pub fn new(params: BackgroundConfig) -> Self {
        Self {
            params,
            width: 0,
            height: 0,
            modes: Vec::new(),
            mode_counts: Vec::new(),
            frames_seen: 0,
        }
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }

    /// Classify the frame against the learned background, then learn from it.
    pub fn apply(&mut self, frame: &Frame) -> ForegroundMask {
        let luma = imageops::grayscale(&frame.image);
        let (width, height) = luma.dimensions();

        if self.frames_seen == 0 || (width, height) != (self.width, self.height) {
            if self.frames_seen > 0 {
                warn!(
                    old_width = self.width,
                    old_height = self.height,
                    width,
                    height,
                    frame = frame.index,
                    "frame size changed, reseeding background model"
                );
            }
            self.seed(width, height, luma.as_raw());
            self.frames_seen = 1;
            return ForegroundMask::empty(width, height);
        }

        self.frames_seen += 1;
        let alpha = self.learning_rate();
        let max_modes = self.params.max_modes;

        let mut mask = ForegroundMask::empty(width, height);
        let out = mask.as_mut_raw();
        let mut foreground = 0usize;

        for (i, &value) in luma.as_raw().iter().enumerate() {
            let slots = &mut self.modes[i * max_modes..(i + 1) * max_modes];
            let is_background =
                update_pixel(slots, &mut self.mode_counts[i], value as f32, alpha, &self.params);
            if !is_background {
                out[i] = 255;
                foreground += 1;
            }
        }

        debug!(
            frame = frame.index,
            alpha,
            foreground,
            "background model applied"
        );
        mask
    }

    fn seed(&mut self, width: u32, height: u32, luma: &[u8]) {
        let max_modes = self.params.max_modes;
        let pixels = width as usize * height as usize;
        self.width = width;
        self.height = height;
        self.modes = vec![Mode::default(); pixels * max_modes];
        self.mode_counts = vec![1; pixels];
        for (i, &value) in luma.iter().enumerate() {
            self.modes[i * max_modes] = Mode {
                weight: 1.0,
                mean: value as f32,
                variance: self.params.var_init,
            };
        }
    }

    fn learning_rate(&self) -> f32 {
        self.params
            .learning_rate
            .unwrap_or_else(|| 1.0 / self.params.history.max(1) as f32)
    }
}

/// Update one pixel's mixture with `value`. Returns `true` if the value was
/// explained by a background mode before the update.
fn update_pixel(
    modes: &mut [Mode],
    count: &mut u8,
    value: f32,
    alpha: f32,
    p: &BackgroundConfig,
) -> bool {
    let prune = -alpha * p.complexity_reduction;
    let mut live = *count as usize;
    let mut matched = false;
    let mut background = false;
    let mut cumulative = 0.0f32;

    for mode in modes[..live].iter_mut() {
        let mut weight = (1.0 - alpha) * mode.weight + prune;

        if !matched {
            let diff = value - mode.mean;
            let dist2 = diff * diff;

            if cumulative < p.background_ratio && dist2 < p.var_threshold * mode.variance {
                background = true;
            }

            if dist2 < p.var_threshold_gen * mode.variance {
                matched = true;
                weight += alpha;
                let k = alpha / weight;
                mode.mean += k * diff;
                mode.variance = (mode.variance + k * (dist2 - mode.variance)).clamp(p.var_min, p.var_max);
            }
        }

        mode.weight = weight;
        cumulative += weight.max(0.0);
    }

    let mut kept = 0;
    for i in 0..live {
        if modes[i].weight > 0.0 {
            modes[kept] = modes[i];
            kept += 1;
        }
    }
    live = kept;

    if !matched {
        let slot = if live == modes.len() { live - 1 } else { live };
        live = slot + 1;
        modes[slot] = Mode {
            weight: if live == 1 { 1.0 } else { alpha },
            mean: value,
            variance: p.var_init,
        };
    }

    let active = &mut modes[..live];
    active.sort_by(|a, b| b.weight.total_cmp(&a.weight));

    let total: f32 = active.iter().map(|m| m.weight).sum();
    if total > 0.0 {
        for mode in active.iter_mut() {
            mode.weight /= total;
        }
    }

    *count = live as u8;
    background
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn solid(index: u64, value: u8) -> Frame {
        Frame::new(index, RgbImage::from_pixel(32, 24, Rgb([value, value, value])))
    }

    fn with_block(index: u64, bg: u8, fg: u8) -> Frame {
        let mut frame = solid(index, bg);
        for y in 4..14 {
            for x in 6..12 {
                frame.image.put_pixel(x, y, Rgb([fg, fg, fg]));
            }
        }
        frame
    }

    #[test]
    fn first_frame_seeds_empty_mask() {
        let mut model = BackgroundModel::new(BackgroundConfig::default());
        let mask = model.apply(&with_block(0, 30, 220));
        assert_eq!(mask.foreground_count(), 0);
        assert_eq!(model.frames_seen(), 1);
    }

    #[test]
    fn static_scene_stays_background() {
        let mut model = BackgroundModel::new(BackgroundConfig::default());
        for i in 0..20 {
            let mask = model.apply(&solid(i, 80));
            assert_eq!(mask.foreground_count(), 0, "frame {i}");
        }
    }

    #[test]
    fn new_object_is_foreground() {
        let mut model = BackgroundModel::new(BackgroundConfig::default());
        for i in 0..10 {
            model.apply(&solid(i, 30));
        }
        let mask = model.apply(&with_block(10, 30, 220));
        assert_eq!(mask.foreground_count(), 6 * 10);
        assert!(mask.is_foreground(6, 4));
        assert!(mask.is_foreground(11, 13));
        assert!(!mask.is_foreground(5, 4));
        assert!(!mask.is_foreground(12, 13));
    }

    #[test]
    fn small_noise_is_absorbed() {
        let mut model = BackgroundModel::new(BackgroundConfig::default());
        model.apply(&solid(0, 100));
        // well inside 4 sigma of the initial variance
        let mask = model.apply(&solid(1, 103));
        assert_eq!(mask.foreground_count(), 0);
    }

    #[test]
    fn object_leaving_restores_background() {
        let mut model = BackgroundModel::new(BackgroundConfig::default());
        for i in 0..10 {
            model.apply(&solid(i, 30));
        }
        for i in 10..15 {
            assert!(model.apply(&with_block(i, 30, 220)).foreground_count() > 0);
        }
        let mask = model.apply(&solid(15, 30));
        assert_eq!(mask.foreground_count(), 0);
    }

    #[test]
    fn stationary_object_is_learned_over_time() {
        let mut model = BackgroundModel::new(BackgroundConfig {
            learning_rate: Some(0.05),
            ..BackgroundConfig::default()
        });
        model.apply(&solid(0, 30));
        let mut last = usize::MAX;
        for i in 1..60 {
            last = model.apply(&with_block(i, 30, 220)).foreground_count();
        }
        assert_eq!(last, 0);
    }

    #[test]
    fn identical_input_gives_identical_masks() {
        let run = || {
            let mut model = BackgroundModel::new(BackgroundConfig::default());
            (0..12)
                .map(|i| {
                    let frame = if i % 3 == 0 { with_block(i, 40, 200) } else { solid(i, 40) };
                    model.apply(&frame).as_image().as_raw().clone()
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn resize_reseeds() {
        let mut model = BackgroundModel::new(BackgroundConfig::default());
        model.apply(&solid(0, 30));
        model.apply(&solid(1, 30));
        let bigger = Frame::new(2, RgbImage::from_pixel(40, 30, Rgb([200, 200, 200])));
        let mask = model.apply(&bigger);
        assert_eq!((mask.width(), mask.height()), (40, 30));
        assert_eq!(mask.foreground_count(), 0);
        assert_eq!(model.frames_seen(), 1);
    }

    #[test]
    fn default_learning_rate_follows_history() {
        let model = BackgroundModel::new(BackgroundConfig {
            history: 10,
            ..BackgroundConfig::default()
        });
        assert_eq!(model.learning_rate(), 0.1);
        let model = BackgroundModel::new(BackgroundConfig::default());
        assert_eq!(model.learning_rate(), 0.002);
    }

    #[test]
    fn moving_block_stays_foreground_with_defaults() {
        // an 8x10 block sliding one pixel per frame keeps covering some
        // pixels for 8 frames; none of them may fade into the background
        let mut model = BackgroundModel::new(BackgroundConfig::default());
        for i in 0..10 {
            model.apply(&solid(i, 30));
        }
        for step in 0..20u32 {
            let mut frame = solid(10 + step as u64, 30);
            for y in 4..14 {
                for x in step..step + 8 {
                    frame.image.put_pixel(x, y, Rgb([220, 220, 220]));
                }
            }
            assert_eq!(model.apply(&frame).foreground_count(), 80, "step {step}");
        }
    }
}
