//! Per-image transformation engine.
//!
//! An [`ImagePreprocess`] belongs to one lane: it owns that lane's rng, and the
//! lane id picks the resize filter and colour-op order so concurrent lanes
//! see different distortions.

use crate::actions::Action;
use crate::tensor::{ImageTensor, PlaneBuffer};
use crate::types::{ImageShape, Moment, PreprocessError, PreprocessResult};
use image::imageops::{self, FilterType};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::trace;

pub const MAX_BRIGHTNESS_DELTA: f32 = 32.0 / 255.0;
pub const SATURATION_RANGE: (f32, f32) = (0.5, 1.5);
pub const MAX_HUE_DELTA: f32 = 0.2;
pub const CONTRAST_RANGE: (f32, f32) = (0.5, 1.5);
pub const DEFAULT_CENTRAL_FRACTION: f32 = 0.875;
pub const DEFAULT_CHANNEL_MEAN: f32 = 0.5;
pub const GRAYSCALE_WEIGHTS: [f32; 3] = [0.2989, 0.5870, 0.1140];

/// Resize filter, numbered the way lanes select them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResizeMethod {
    Bilinear,
    Nearest,
    Bicubic,
    Area,
}

impl ResizeMethod {
    pub fn for_lane(lane_id: usize) -> Self {
        match lane_id % 4 {
            0 => ResizeMethod::Bilinear,
            1 => ResizeMethod::Nearest,
            2 => ResizeMethod::Bicubic,
            _ => ResizeMethod::Area,
        }
    }

    /// Area averaging only applies when shrinking; enlarging falls back to bilinear.
    fn filter(self) -> FilterType {
        match self {
            ResizeMethod::Bilinear | ResizeMethod::Area => FilterType::Triangle,
            ResizeMethod::Nearest => FilterType::Nearest,
            ResizeMethod::Bicubic => FilterType::CatmullRom,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorOp {
    Brightness,
    Saturation,
    Hue,
    Contrast,
}

/// Order in which `distort_color` applies its random adjustments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorOrder {
    SaturationFirst,
    ContrastFirst,
}

impl ColorOrder {
    pub fn for_lane(lane_id: usize) -> Self {
        if lane_id % 2 == 0 {
            ColorOrder::SaturationFirst
        } else {
            ColorOrder::ContrastFirst
        }
    }

    /// Grayscale images only get brightness and contrast.
    pub fn ops(self, channels: usize) -> PreprocessResult<&'static [ColorOp]> {
        use ColorOp::*;
        match (channels, self) {
            (1, _) => Ok(&[Brightness, Contrast]),
            (3, ColorOrder::SaturationFirst) => Ok(&[Brightness, Saturation, Hue, Contrast]),
            (3, ColorOrder::ContrastFirst) => Ok(&[Brightness, Contrast, Saturation, Hue]),
            (other, _) => Err(PreprocessError::ImageFormat(format!(
                "colour distortion needs 1 or 3 channels, got {other}"
            ))),
        }
    }
}

/// Bounds for `distort_bbox` crop sampling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BboxDistortion {
    pub min_object_covered: f32,
    pub aspect_ratio_range: (f32, f32),
    pub area_range: (f32, f32),
    pub max_attempts: usize,
}

impl Default for BboxDistortion {
    fn default() -> Self {
        Self {
            min_object_covered: 0.1,
            aspect_ratio_range: (0.75, 1.33),
            area_range: (0.05, 1.0),
            max_attempts: 100,
        }
    }
}

/// Pixel window inside an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropWindow {
    pub top: usize,
    pub left: usize,
    pub height: usize,
    pub width: usize,
}

impl CropWindow {
    pub fn full(height: usize, width: usize) -> Self {
        Self {
            top: 0,
            left: 0,
            height,
            width,
        }
    }

    pub fn area_ratio(&self, height: usize, width: usize) -> f32 {
        (self.height * self.width) as f32 / (height * width) as f32
    }
}

/// Samples a crop window that covers at least `min_object_covered` of some
/// candidate box; falls back to the whole image when every attempt fails.
pub fn sample_distorted_crop<R: Rng + ?Sized>(
    rng: &mut R,
    height: usize,
    width: usize,
    bboxes: &[[f32; 4]],
    params: &BboxDistortion,
) -> CropWindow {
    let whole = [[0.0, 0.0, 1.0, 1.0]];
    let candidates: &[[f32; 4]] = if bboxes.is_empty() { &whole } else { bboxes };
    let (lo, hi) = params.aspect_ratio_range;
    for _ in 0..params.max_attempts {
        let aspect = rng.random_range(lo..=hi);
        let Some(window) = random_crop_window(rng, height, width, params.area_range, aspect) else {
            continue;
        };
        if covers_any(&window, candidates, height, width, params.min_object_covered) {
            return window;
        }
    }
    CropWindow::full(height, width)
}

fn random_crop_window<R: Rng + ?Sized>(
    rng: &mut R,
    height: usize,
    width: usize,
    area_range: (f32, f32),
    aspect: f32,
) -> Option<CropWindow> {
    let (h, w) = (height as i64, width as i64);
    let area = (height * width) as f32;
    let min_area = area_range.0 * area;
    let max_area = area_range.1 * area;

    let mut crop_h = (min_area / aspect).sqrt().round() as i64;
    let mut max_h = (max_area / aspect).sqrt().round() as i64;
    if ((max_h as f32) * aspect).round() as i64 > w {
        max_h = ((w as f32 + 0.5 - 1e-7) / aspect).floor() as i64;
    }
    max_h = max_h.min(h);
    if crop_h >= max_h {
        crop_h = max_h;
    }
    if crop_h < max_h {
        crop_h += rng.random_range(0..=max_h - crop_h);
    }

    let width_for = |ch: i64| ((ch as f32) * aspect).round() as i64;
    let mut crop_w = width_for(crop_h);
    let mut crop_area = (crop_w * crop_h) as f32;
    if crop_area < min_area {
        crop_h += 1;
        crop_w = width_for(crop_h);
        crop_area = (crop_w * crop_h) as f32;
    }
    if crop_area > max_area {
        crop_h -= 1;
        crop_w = width_for(crop_h);
        crop_area = (crop_w * crop_h) as f32;
    }
    if crop_area < min_area
        || crop_area > max_area
        || crop_w > w
        || crop_h > h
        || crop_w <= 0
        || crop_h <= 0
    {
        return None;
    }

    let top = if crop_h >= h { 0 } else { rng.random_range(0..h - crop_h) };
    let left = if crop_w >= w { 0 } else { rng.random_range(0..w - crop_w) };
    Some(CropWindow {
        top: top as usize,
        left: left as usize,
        height: crop_h as usize,
        width: crop_w as usize,
    })
}

fn covers_any(
    window: &CropWindow,
    candidates: &[[f32; 4]],
    height: usize,
    width: usize,
    min_covered: f32,
) -> bool {
    let (h, w) = (height as f32, width as f32);
    let (wy0, wx0) = (window.top as f32, window.left as f32);
    let (wy1, wx1) = (wy0 + window.height as f32, wx0 + window.width as f32);
    candidates.iter().any(|[ymin, xmin, ymax, xmax]| {
        let (by0, bx0, by1, bx1) = (ymin * h, xmin * w, ymax * h, xmax * w);
        let object_area = (by1 - by0) * (bx1 - bx0);
        if object_area <= 0.0 {
            return false;
        }
        let ih = (wy1.min(by1) - wy0.max(by0)).max(0.0);
        let iw = (wx1.min(bx1) - wx0.max(bx0)).max(0.0);
        ih * iw / object_area >= min_covered
    })
}

/// Resizes every channel plane with the image crate's filters.
///
/// Planes are mapped onto `[0, 1]` before filtering and back afterwards since
/// float pixels are clamped by the resampler.
pub fn resize_image(
    image: &ImageTensor,
    height: usize,
    width: usize,
    method: ResizeMethod,
) -> PreprocessResult<ImageTensor> {
    if height == 0 || width == 0 {
        return Err(PreprocessError::Shape(format!(
            "cannot resize to {height}x{width}"
        )));
    }
    if image.height() == height && image.width() == width {
        return Ok(image.clone());
    }
    let downscale = height <= image.height() && width <= image.width();
    let planes = (0..image.channels())
        .map(|c| resize_plane(image, c, height, width, method, downscale))
        .collect::<PreprocessResult<Vec<_>>>()?;
    ImageTensor::from_planes(height, width, &planes)
}

fn resize_plane(
    image: &ImageTensor,
    channel: usize,
    height: usize,
    width: usize,
    method: ResizeMethod,
    downscale: bool,
) -> PreprocessResult<Vec<f32>> {
    let raw = image.plane(channel);
    let lo = raw.iter().copied().fold(f32::INFINITY, f32::min);
    let hi = raw.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let span = hi - lo;
    if !span.is_finite() || span <= f32::EPSILON {
        return Ok(vec![if lo.is_finite() { lo } else { 0.0 }; height * width]);
    }
    let scaled = raw.into_iter().map(|v| (v - lo) / span).collect();
    let buf = PlaneBuffer::from_raw(image.width() as u32, image.height() as u32, scaled)
        .ok_or_else(|| PreprocessError::Shape("plane buffer size mismatch".to_string()))?;
    let (w, h) = (width as u32, height as u32);
    let out = if method == ResizeMethod::Area && downscale {
        imageops::thumbnail(&buf, w, h)
    } else {
        imageops::resize(&buf, w, h, method.filter())
    };
    Ok(out.into_raw().into_iter().map(|v| v * span + lo).collect())
}

pub fn adjust_brightness(image: &mut ImageTensor, delta: f32) {
    image.map_in_place(|v| v + delta);
}

/// Scales each channel's deviation from its own mean.
pub fn adjust_contrast(image: &mut ImageTensor, factor: f32) {
    let means = image.channel_means();
    for px in image.pixels_mut() {
        for (v, m) in px.iter_mut().zip(&means) {
            *v = (*v - m) * factor + m;
        }
    }
}

pub fn adjust_saturation(image: &mut ImageTensor, factor: f32) {
    map_hsv(image, |h, s, v| (h, (s * factor).clamp(0.0, 1.0), v));
}

/// Rotates hue by `delta` turns, wrapping around.
pub fn adjust_hue(image: &mut ImageTensor, delta: f32) {
    map_hsv(image, |h, s, v| ((h + delta).rem_euclid(1.0), s, v));
}

fn map_hsv(image: &mut ImageTensor, f: impl Fn(f32, f32, f32) -> (f32, f32, f32)) {
    if image.channels() != 3 {
        return;
    }
    for px in image.pixels_mut() {
        let (h, s, v) = rgb_to_hsv(px[0], px[1], px[2]);
        let (h, s, v) = f(h, s, v);
        let (r, g, b) = hsv_to_rgb(h, s, v);
        px[0] = r;
        px[1] = g;
        px[2] = b;
    }
}

pub fn rgb_to_hsv(r: f32, g: f32, b: f32) -> (f32, f32, f32) {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;
    let s = if max > 0.0 { delta / max } else { 0.0 };
    let h = if delta <= 0.0 {
        0.0
    } else if max == r {
        ((g - b) / delta).rem_euclid(6.0) / 6.0
    } else if max == g {
        ((b - r) / delta + 2.0) / 6.0
    } else {
        ((r - g) / delta + 4.0) / 6.0
    };
    (h, s, max)
}

pub fn hsv_to_rgb(h: f32, s: f32, v: f32) -> (f32, f32, f32) {
    let h6 = h.rem_euclid(1.0) * 6.0;
    let sector = h6.floor();
    let f = h6 - sector;
    let p = v * (1.0 - s);
    let q = v * (1.0 - s * f);
    let t = v * (1.0 - s * (1.0 - f));
    match sector as u32 % 6 {
        0 => (v, t, p),
        1 => (q, v, p),
        2 => (p, v, t),
        3 => (p, q, v),
        4 => (t, p, v),
        _ => (v, p, q),
    }
}

pub fn to_grayscale(image: &ImageTensor) -> PreprocessResult<ImageTensor> {
    if image.channels() != 3 {
        return Err(PreprocessError::ImageFormat(format!(
            "grayscale conversion needs 3 channels, got {}",
            image.channels()
        )));
    }
    let data = image
        .data()
        .chunks_exact(3)
        .map(|px| px.iter().zip(GRAYSCALE_WEIGHTS).map(|(v, w)| v * w).sum::<f32>())
        .collect();
    ImageTensor::new(image.height(), image.width(), 1, data)
}

/// One lane's transform state.
#[derive(Debug)]
pub struct ImagePreprocess {
    shape: ImageShape,
    moment: Moment,
    lane_id: usize,
    bboxes: Vec<[f32; 4]>,
    bbox_distortion: BboxDistortion,
    rng: StdRng,
}

impl ImagePreprocess {
    pub fn new(
        shape: ImageShape,
        moment: Option<Moment>,
        lane_id: usize,
        seed: Option<u64>,
    ) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed ^ lane_id as u64),
            None => StdRng::from_rng(&mut rand::rng()),
        };
        Self {
            shape,
            moment: moment.unwrap_or_default(),
            lane_id,
            bboxes: Vec::new(),
            bbox_distortion: BboxDistortion::default(),
            rng,
        }
    }

    pub fn with_bbox_distortion(mut self, params: BboxDistortion) -> Self {
        self.bbox_distortion = params;
        self
    }

    /// Candidate boxes for the next `distort_bbox`, `[y_min, x_min, y_max, x_max]`.
    pub fn set_bboxes(&mut self, bboxes: Vec<[f32; 4]>) {
        self.bboxes = bboxes;
    }

    pub fn lane_id(&self) -> usize {
        self.lane_id
    }

    pub fn shape(&self) -> ImageShape {
        self.shape
    }

    /// Runs `actions` in order, then forces the target shape.
    pub fn preprocess(
        &mut self,
        image: ImageTensor,
        actions: &[Action],
    ) -> PreprocessResult<ImageTensor> {
        let mut image = image;
        for action in actions {
            trace!(lane = self.lane_id, action = action.name(), "apply");
            image = action.apply(self, image)?;
        }
        self.ensure_shape(image)
    }

    pub fn distort_bbox(&mut self, image: ImageTensor) -> PreprocessResult<ImageTensor> {
        let window = sample_distorted_crop(
            &mut self.rng,
            image.height(),
            image.width(),
            &self.bboxes,
            &self.bbox_distortion,
        );
        let cropped = image.crop(window.top, window.left, window.height, window.width)?;
        resize_image(
            &cropped,
            self.shape.height,
            self.shape.width,
            ResizeMethod::for_lane(self.lane_id),
        )
    }

    pub fn distort_color(&mut self, image: ImageTensor) -> PreprocessResult<ImageTensor> {
        let mut image = image;
        let ops = ColorOrder::for_lane(self.lane_id).ops(image.channels())?;
        for op in ops {
            match op {
                ColorOp::Brightness => {
                    let delta = self.rng.random_range(-MAX_BRIGHTNESS_DELTA..=MAX_BRIGHTNESS_DELTA);
                    adjust_brightness(&mut image, delta);
                }
                ColorOp::Saturation => {
                    let factor = self.rng.random_range(SATURATION_RANGE.0..=SATURATION_RANGE.1);
                    adjust_saturation(&mut image, factor);
                }
                ColorOp::Hue => {
                    let delta = self.rng.random_range(-MAX_HUE_DELTA..=MAX_HUE_DELTA);
                    adjust_hue(&mut image, delta);
                }
                ColorOp::Contrast => {
                    let factor = self.rng.random_range(CONTRAST_RANGE.0..=CONTRAST_RANGE.1);
                    adjust_contrast(&mut image, factor);
                }
            }
        }
        image.map_in_place(|v| v.clamp(0.0, 1.0));
        Ok(image)
    }

    pub fn central_crop(
        &mut self,
        image: ImageTensor,
        fraction: f32,
    ) -> PreprocessResult<ImageTensor> {
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(PreprocessError::Config(format!(
                "central crop fraction must be in (0, 1], got {fraction}"
            )));
        }
        if fraction == 1.0 {
            return Ok(image);
        }
        let (h, w) = (image.height(), image.width());
        let top = ((h as f32 - h as f32 * fraction) / 2.0) as usize;
        let left = ((w as f32 - w as f32 * fraction) / 2.0) as usize;
        image.crop(top, left, h - 2 * top, w - 2 * left)
    }

    pub fn random_crop(
        &mut self,
        image: ImageTensor,
        height: Option<usize>,
        width: Option<usize>,
    ) -> PreprocessResult<ImageTensor> {
        let h = height.unwrap_or(self.shape.height);
        let w = width.unwrap_or(self.shape.width);
        if image.height() < h || image.width() < w {
            return Err(PreprocessError::Shape(format!(
                "random crop {h}x{w} larger than image {}x{}",
                image.height(),
                image.width()
            )));
        }
        let top = self.rng.random_range(0..=image.height() - h);
        let left = self.rng.random_range(0..=image.width() - w);
        image.crop(top, left, h, w)
    }

    /// Center-crops dimensions that are too large and zero-pads ones that are too small.
    pub fn crop_or_pad(
        &mut self,
        image: ImageTensor,
        height: Option<usize>,
        width: Option<usize>,
    ) -> PreprocessResult<ImageTensor> {
        let th = height.unwrap_or(self.shape.height);
        let tw = width.unwrap_or(self.shape.width);
        let (h, w) = (image.height(), image.width());
        let crop_top = h.saturating_sub(th) / 2;
        let crop_left = w.saturating_sub(tw) / 2;
        let cropped = image.crop(crop_top, crop_left, h.min(th), w.min(tw))?;
        if cropped.height() == th && cropped.width() == tw {
            return Ok(cropped);
        }
        let pad_top = th.saturating_sub(h) / 2;
        let pad_left = tw.saturating_sub(w) / 2;
        cropped.pad(pad_top, pad_left, th, tw)
    }

    /// Bilinear resize; with `fill` the image is first cropped to the target aspect ratio.
    pub fn resize(
        &mut self,
        image: ImageTensor,
        height: Option<usize>,
        width: Option<usize>,
        fill: bool,
    ) -> PreprocessResult<ImageTensor> {
        let h = height.unwrap_or(self.shape.height);
        let w = width.unwrap_or(self.shape.width);
        let image = if fill {
            let aspect = w as f32 / h as f32;
            let (ih, iw) = (image.height() as f32, image.width() as f32);
            let crop_w = (ih * aspect).round().min(iw).max(1.0);
            let crop_h = (crop_w / aspect).round().min(ih).max(1.0);
            self.crop_or_pad(image, Some(crop_h as usize), Some(crop_w as usize))?
        } else {
            image
        };
        resize_image(&image, h, w, ResizeMethod::Bilinear)
    }

    pub fn random_flip(&mut self, image: ImageTensor) -> PreprocessResult<ImageTensor> {
        if self.rng.random_bool(0.5) {
            Ok(image.flip_horizontal())
        } else {
            Ok(image)
        }
    }

    pub fn linear_map(
        &mut self,
        image: ImageTensor,
        scale: f32,
        shift: f32,
    ) -> PreprocessResult<ImageTensor> {
        let mut image = image;
        image.map_in_place(|v| v * scale + shift);
        Ok(image)
    }

    pub fn subtract_channel_means(&mut self, image: ImageTensor) -> PreprocessResult<ImageTensor> {
        let means = match &self.moment.mean {
            Some(means) => means.clone(),
            None => vec![DEFAULT_CHANNEL_MEAN; image.channels()],
        };
        let mut image = image;
        per_channel(&mut image, &means, "mean", |v, m| v - m)?;
        Ok(image)
    }

    /// Subtracts channel means, then divides by channel stds when configured.
    pub fn normalize_channels(&mut self, image: ImageTensor) -> PreprocessResult<ImageTensor> {
        let mut image = self.subtract_channel_means(image)?;
        if let Some(stds) = self.moment.std.clone() {
            per_channel(&mut image, &stds, "std", |v, s| v / s)?;
        }
        Ok(image)
    }

    pub fn subtract_image_mean(&mut self, image: ImageTensor) -> PreprocessResult<ImageTensor> {
        let mut image = image;
        let mean = image.mean();
        image.map_in_place(|v| v - mean);
        Ok(image)
    }

    /// `(x - mean) / max(std, 1 / sqrt(N))` over every element.
    pub fn standardize_image(&mut self, image: ImageTensor) -> PreprocessResult<ImageTensor> {
        let mut image = image;
        let n = image.data().len() as f64;
        let mean = image.data().iter().map(|v| *v as f64).sum::<f64>() / n;
        let var = image
            .data()
            .iter()
            .map(|v| (*v as f64 - mean).powi(2))
            .sum::<f64>()
            / n;
        let adjusted = var.sqrt().max(1.0 / n.sqrt());
        image.map_in_place(|v| ((v as f64 - mean) / adjusted) as f32);
        Ok(image)
    }

    pub fn permute_channels(
        &mut self,
        image: ImageTensor,
        order: &[usize],
    ) -> PreprocessResult<ImageTensor> {
        image.select_channels(order)
    }

    /// Converts channels (3 to 1 by luminance, 1 to c by duplication), then
    /// fill-resizes unless both spatial dimensions already match.
    pub fn ensure_shape(&mut self, image: ImageTensor) -> PreprocessResult<ImageTensor> {
        let target = self.shape;
        let mut image = image;
        if image.channels() != target.channels {
            image = match (image.channels(), target.channels) {
                (3, 1) => to_grayscale(&image)?,
                (1, c) => image.select_channels(&vec![0; c])?,
                (from, to) => {
                    return Err(PreprocessError::ImageFormat(format!(
                        "cannot convert {from} channels to {to}"
                    )))
                }
            };
        }
        if image.height() != target.height || image.width() != target.width {
            image = self.resize(image, Some(target.height), Some(target.width), true)?;
        }
        Ok(image)
    }
}

fn per_channel(
    image: &mut ImageTensor,
    values: &[f32],
    what: &str,
    f: impl Fn(f32, f32) -> f32,
) -> PreprocessResult<()> {
    if values.len() != image.channels() {
        return Err(PreprocessError::Shape(format!(
            "{} channel {what} values for a {}-channel image",
            values.len(),
            image.channels()
        )));
    }
    for px in image.pixels_mut() {
        for (v, c) in px.iter_mut().zip(values) {
            *v = f(*v, *c);
        }
    }
    Ok(())
}
