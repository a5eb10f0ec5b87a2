use image::{GrayImage, Luma, RgbImage};

/// A decoded video frame and its 0-based position in the stream.
#[derive(Debug, Clone)]
pub struct Frame {
    pub index: u64,
    pub image: RgbImage,
}

impl Frame {
    pub fn new(index: u64, image: RgbImage) -> Self {
        Self { index, image }
    }

    /// Build a frame from packed `rgb24` bytes as produced by a raw video decoder.
    pub fn from_rgb24(index: u64, width: u32, height: u32, data: Vec<u8>) -> Result<Self, FrameError> {
        let expected = width as usize * height as usize * 3;
        let got = data.len();
        let image = RgbImage::from_raw(width, height, data)
            .ok_or(FrameError::SizeMismatch { got, expected })?;
        Ok(Self { index, image })
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

const FOREGROUND: u8 = 255;

/// Binary mask the size of a frame. Foreground pixels are stored as 255 so the
/// mask can be dumped as a viewable image; everything else is 0.
#[derive(Debug, Clone)]
pub struct ForegroundMask {
    image: GrayImage,
}

impl ForegroundMask {
    /// An all-background mask.
    pub fn empty(width: u32, height: u32) -> Self {
        Self {
            image: GrayImage::new(width, height),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn set_foreground(&mut self, x: u32, y: u32) {
        self.image.put_pixel(x, y, Luma([FOREGROUND]));
    }

    pub fn is_foreground(&self, x: u32, y: u32) -> bool {
        self.image.get_pixel(x, y).0[0] != 0
    }

    pub fn foreground_count(&self) -> usize {
        self.image.pixels().filter(|p| p.0[0] != 0).count()
    }

    /// Mutable access to the raw mask bytes, row-major.
    pub fn as_mut_raw(&mut self) -> &mut [u8] {
        &mut self.image
    }

    pub fn as_image(&self) -> &GrayImage {
        &self.image
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("raw frame has {got} bytes, expected {expected}")]
    SizeMismatch { got: usize, expected: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_rgb24_checks_length() {
        let frame = Frame::from_rgb24(3, 4, 2, vec![0; 4 * 2 * 3]).unwrap();
        assert_eq!(frame.index, 3);
        assert_eq!((frame.width(), frame.height()), (4, 2));

        let err = Frame::from_rgb24(0, 4, 2, vec![0; 10]).unwrap_err();
        assert!(matches!(err, FrameError::SizeMismatch { got: 10, expected: 24 }));
    }

    #[test]
    fn mask_stores_foreground_as_255() {
        let mut mask = ForegroundMask::empty(3, 1);
        mask.set_foreground(1, 0);
        assert!(!mask.is_foreground(0, 0));
        assert!(mask.is_foreground(1, 0));
        assert_eq!(mask.as_image().get_pixel(1, 0).0[0], 255);
    }

    #[test]
    fn empty_mask_has_no_foreground() {
        let mut mask = ForegroundMask::empty(5, 5);
        assert_eq!(mask.foreground_count(), 0);
        mask.set_foreground(4, 4);
        assert_eq!(mask.foreground_count(), 1);
    }
}
