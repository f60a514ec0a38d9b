//! HWC float image buffer shared by the transform engine and the batch assembler.

use crate::types::{ImageShape, PreprocessError, PreprocessResult};
use image::{DynamicImage, ImageBuffer, Luma};

pub type PlaneBuffer = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Row-major `[height, width, channels]` image. Decoded images hold values in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    height: usize,
    width: usize,
    channels: usize,
    data: Vec<f32>,
}

impl ImageTensor {
    pub fn new(
        height: usize,
        width: usize,
        channels: usize,
        data: Vec<f32>,
    ) -> PreprocessResult<Self> {
        if height == 0 || width == 0 || channels == 0 {
            return Err(PreprocessError::Shape(format!(
                "image dimensions must be non-zero, got {height}x{width}x{channels}"
            )));
        }
        if data.len() != height * width * channels {
            return Err(PreprocessError::Shape(format!(
                "buffer of {} values does not match {height}x{width}x{channels}",
                data.len()
            )));
        }
        Ok(Self {
            height,
            width,
            channels,
            data,
        })
    }

    pub fn filled(height: usize, width: usize, channels: usize, value: f32) -> Self {
        Self {
            height,
            width,
            channels,
            data: vec![value; height * width * channels],
        }
    }

    /// Decodes a `DynamicImage` into one (luma) or three (rgb) float channels.
    pub fn from_dynamic(img: &DynamicImage, channels: usize) -> PreprocessResult<Self> {
        let (w, h) = (img.width() as usize, img.height() as usize);
        match channels {
            1 => Self::new(h, w, 1, img.to_luma32f().into_raw()),
            3 => Self::new(h, w, 3, img.to_rgb32f().into_raw()),
            other => Err(PreprocessError::ImageFormat(format!(
                "cannot decode an image into {other} channels"
            ))),
        }
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn shape(&self) -> ImageShape {
        ImageShape::new(self.height, self.width, self.channels)
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    #[inline]
    pub fn index(&self, y: usize, x: usize, c: usize) -> usize {
        (y * self.width + x) * self.channels + c
    }

    pub fn at(&self, y: usize, x: usize, c: usize) -> f32 {
        self.data[self.index(y, x, c)]
    }

    pub fn pixels_mut(&mut self) -> std::slice::ChunksExactMut<'_, f32> {
        self.data.chunks_exact_mut(self.channels)
    }

    pub fn map_in_place(&mut self, f: impl Fn(f32) -> f32) {
        for v in &mut self.data {
            *v = f(*v);
        }
    }

    pub fn mean(&self) -> f32 {
        let sum: f64 = self.data.iter().map(|v| *v as f64).sum();
        (sum / self.data.len() as f64) as f32
    }

    pub fn channel_means(&self) -> Vec<f32> {
        let mut sums = vec![0f64; self.channels];
        for px in self.data.chunks_exact(self.channels) {
            for (s, v) in sums.iter_mut().zip(px) {
                *s += *v as f64;
            }
        }
        let n = (self.height * self.width) as f64;
        sums.into_iter().map(|s| (s / n) as f32).collect()
    }

    /// Copies the window starting at `(top, left)`.
    pub fn crop(
        &self,
        top: usize,
        left: usize,
        height: usize,
        width: usize,
    ) -> PreprocessResult<Self> {
        if height == 0 || width == 0 || top + height > self.height || left + width > self.width {
            return Err(PreprocessError::Shape(format!(
                "crop {height}x{width} at ({top}, {left}) exceeds image {}x{}",
                self.height, self.width
            )));
        }
        let row_len = width * self.channels;
        let mut data = Vec::with_capacity(height * row_len);
        for y in top..top + height {
            let start = self.index(y, left, 0);
            data.extend_from_slice(&self.data[start..start + row_len]);
        }
        Self::new(height, width, self.channels, data)
    }

    /// Places the image at `(top, left)` inside a zero canvas of `height x width`.
    pub fn pad(
        &self,
        top: usize,
        left: usize,
        height: usize,
        width: usize,
    ) -> PreprocessResult<Self> {
        if top + self.height > height || left + self.width > width {
            return Err(PreprocessError::Shape(format!(
                "cannot pad {}x{} image at ({top}, {left}) into {height}x{width}",
                self.height, self.width
            )));
        }
        let mut out = Self::filled(height, width, self.channels, 0.0);
        let row_len = self.width * self.channels;
        for y in 0..self.height {
            let src = self.index(y, 0, 0);
            let dst = out.index(top + y, left, 0);
            out.data[dst..dst + row_len].copy_from_slice(&self.data[src..src + row_len]);
        }
        Ok(out)
    }

    pub fn flip_horizontal(&self) -> Self {
        let mut data = Vec::with_capacity(self.data.len());
        for y in 0..self.height {
            for x in (0..self.width).rev() {
                let start = self.index(y, x, 0);
                data.extend_from_slice(&self.data[start..start + self.channels]);
            }
        }
        Self {
            data,
            ..*self
        }
    }

    /// Copies one channel out as a row-major plane.
    pub fn plane(&self, channel: usize) -> Vec<f32> {
        self.data
            .iter()
            .skip(channel)
            .step_by(self.channels)
            .copied()
            .collect()
    }

    /// Interleaves equally sized planes back into HWC order.
    pub fn from_planes(height: usize, width: usize, planes: &[Vec<f32>]) -> PreprocessResult<Self> {
        let channels = planes.len();
        if planes.iter().any(|p| p.len() != height * width) {
            return Err(PreprocessError::Shape(format!(
                "planes do not all hold {height}x{width} values"
            )));
        }
        let mut data = Vec::with_capacity(height * width * channels);
        for i in 0..height * width {
            data.extend(planes.iter().map(|p| p[i]));
        }
        Self::new(height, width, channels, data)
    }

    /// Selects channels by index; `order` may repeat or drop channels.
    pub fn select_channels(&self, order: &[usize]) -> PreprocessResult<Self> {
        if let Some(bad) = order.iter().find(|c| **c >= self.channels) {
            return Err(PreprocessError::Shape(format!(
                "channel index {bad} out of range for {} channels",
                self.channels
            )));
        }
        let mut data = Vec::with_capacity(self.height * self.width * order.len());
        for px in self.data.chunks_exact(self.channels) {
            data.extend(order.iter().map(|c| px[*c]));
        }
        Self::new(self.height, self.width, order.len(), data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(h: usize, w: usize, c: usize) -> ImageTensor {
        let data = (0..h * w * c).map(|v| v as f32).collect();
        ImageTensor::new(h, w, c, data).unwrap()
    }

    #[test]
    fn rejects_mismatched_buffer() {
        assert!(ImageTensor::new(2, 2, 3, vec![0.0; 11]).is_err());
    }

    #[test]
    fn crop_then_pad_restores_window() {
        let img = ramp(4, 5, 2);
        let window = img.crop(1, 2, 2, 3).unwrap();
        assert_eq!(window.at(0, 0, 1), img.at(1, 2, 1));
        let padded = window.pad(1, 1, 4, 5).unwrap();
        assert_eq!(padded.at(1, 1, 1), img.at(1, 2, 1));
        assert_eq!(padded.at(0, 0, 0), 0.0);
        assert!(img.crop(3, 0, 2, 1).is_err());
    }

    #[test]
    fn planes_interleave_back() {
        let img = ramp(3, 2, 3);
        let planes: Vec<_> = (0..3).map(|c| img.plane(c)).collect();
        let rebuilt = ImageTensor::from_planes(3, 2, &planes).unwrap();
        assert_eq!(rebuilt, img);
    }

    #[test]
    fn flip_mirrors_columns() {
        let img = ramp(2, 3, 1);
        let flipped = img.flip_horizontal();
        assert_eq!(flipped.at(0, 0, 0), img.at(0, 2, 0));
        assert_eq!(flipped.flip_horizontal(), img);
    }

    #[test]
    fn select_channels_checks_range() {
        let img = ramp(1, 1, 3);
        assert_eq!(img.select_channels(&[2, 0]).unwrap().data(), &[2.0, 0.0]);
        assert!(img.select_channels(&[3]).is_err());
    }
}
