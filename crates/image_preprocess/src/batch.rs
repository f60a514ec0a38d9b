//! Lanes, the join queue, and fixed-size batch assembly.

use crate::actions::Action;
use crate::aug::ImagePreprocess;
use crate::coordinator::{recv_or_stop, send_or_stop, Coordinator};
use crate::decode::{decode_image, decode_record};
use crate::reader::{spawn_named, RecordSource};
use crate::tensor::ImageTensor;
use crate::types::{ImageShape, Moment, PreprocessError, PreprocessResult};
use crossbeam_channel::{Receiver, Sender};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const ENV_LOG_EVERY: &str = "PREPROCESS_LOG_EVERY";
pub const ENV_TRACE: &str = "PREPROCESS_TRACE";
const DEFAULT_LOG_EVERY_SAMPLES: usize = 1000;

/// Lanes must come in groups covering every resize method.
pub const LANE_MULTIPLE: usize = 4;

/// Number of lanes a pipeline runs.
pub fn lane_count(concurrent: bool, num_threads: usize) -> PreprocessResult<usize> {
    if !concurrent {
        return Ok(1);
    }
    if num_threads == 0 || num_threads % LANE_MULTIPLE != 0 {
        return Err(PreprocessError::Config(format!(
            "num_threads must be a positive multiple of {LANE_MULTIPLE}, got {num_threads}"
        )));
    }
    Ok(num_threads)
}

pub fn join_capacity(num_lanes: usize, batch_size: usize) -> usize {
    2 * num_lanes * batch_size
}

/// One preprocessed sample on its way to the batch join.
#[derive(Debug, Clone)]
pub struct LaneOutput {
    pub image: ImageTensor,
    pub label: i32,
}

/// Decode and transform state for one lane.
pub struct Lane {
    engine: ImagePreprocess,
    program: Arc<[Action]>,
    label_offset: i32,
}

impl Lane {
    pub fn new(
        id: usize,
        shape: ImageShape,
        moment: Option<Moment>,
        program: Arc<[Action]>,
        label_offset: i32,
        seed: Option<u64>,
    ) -> Self {
        Self {
            engine: ImagePreprocess::new(shape, moment, id, seed),
            program,
            label_offset,
        }
    }

    pub fn id(&self) -> usize {
        self.engine.lane_id()
    }

    pub fn process(&mut self, record: &[u8]) -> PreprocessResult<LaneOutput> {
        let sample = decode_record(record)?;
        let image = decode_image(&sample.encoded, self.engine.shape().channels)?;
        self.engine.set_bboxes(sample.bboxes);
        let image = self.engine.preprocess(image, &self.program)?;
        Ok(LaneOutput {
            image,
            label: sample.label + self.label_offset,
        })
    }
}

/// Runs each lane on its own thread until the source is exhausted or the coordinator stops.
pub fn spawn_lanes(
    lanes: Vec<Lane>,
    source: &RecordSource,
    tx: &Sender<LaneOutput>,
    coord: &Coordinator,
) -> PreprocessResult<Vec<JoinHandle<()>>> {
    let mut handles = Vec::with_capacity(lanes.len());
    for mut lane in lanes {
        let source = source.clone();
        let tx = tx.clone();
        let worker_coord = coord.clone();
        let id = lane.id();
        let handle = spawn_named(format!("preprocess-lane-{id}"), move || {
            debug!(lane = id, "lane started");
            let mut produced = 0u64;
            loop {
                let record = match source.next_record(&worker_coord) {
                    Ok(Some(record)) => record,
                    Ok(None) => break,
                    Err(err) => {
                        worker_coord.report_error(err);
                        break;
                    }
                };
                match lane.process(&record) {
                    Ok(out) => {
                        if !send_or_stop(&tx, out, &worker_coord) {
                            break;
                        }
                        produced += 1;
                    }
                    Err(err) => {
                        worker_coord.report_error(err);
                        break;
                    }
                }
            }
            debug!(lane = id, samples = produced, "lane finished");
        });
        match handle {
            Ok(h) => handles.push(h),
            Err(err) => {
                coord.request_stop();
                return Err(err);
            }
        }
    }
    Ok(handles)
}

/// `N` images stacked as a flat `[N, H, W, C]` buffer with their labels.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub images: Vec<f32>,
    pub labels: Vec<i32>,
    pub shape: ImageShape,
}

impl Batch {
    pub fn new(images: Vec<f32>, labels: Vec<i32>, shape: ImageShape) -> PreprocessResult<Self> {
        if images.len() != labels.len() * shape.elems() {
            return Err(PreprocessError::Shape(format!(
                "{} image values for {} samples of {shape}",
                images.len(),
                labels.len()
            )));
        }
        Ok(Self {
            images,
            labels,
            shape,
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn dims(&self) -> [usize; 4] {
        [self.len(), self.shape.height, self.shape.width, self.shape.channels]
    }

    pub fn image(&self, index: usize) -> Option<&[f32]> {
        let n = self.shape.elems();
        self.images.get(index * n..(index + 1) * n)
    }

    pub fn add_label_offset(&mut self, offset: i32) {
        if offset != 0 {
            for l in &mut self.labels {
                *l += offset;
            }
        }
    }

    /// Splits into `parts` equal consecutive batches, one per device.
    pub fn split(self, parts: usize) -> PreprocessResult<Vec<Batch>> {
        if parts == 0 || self.len() % parts != 0 {
            return Err(PreprocessError::Config(format!(
                "batch of {} cannot be split evenly across {parts} devices",
                self.len()
            )));
        }
        if parts == 1 {
            return Ok(vec![self]);
        }
        let per = self.len() / parts;
        let stride = per * self.shape.elems();
        let shape = self.shape;
        Ok(self
            .images
            .chunks(stride)
            .zip(self.labels.chunks(per))
            .map(|(images, labels)| Batch {
                images: images.to_vec(),
                labels: labels.to_vec(),
                shape,
            })
            .collect())
    }
}

#[cfg(feature = "burn-runtime")]
pub struct BurnBatch<B: burn::tensor::backend::Backend> {
    /// `[N, H, W, C]`.
    pub images: burn::tensor::Tensor<B, 4>,
    pub labels: burn::tensor::Tensor<B, 1, burn::tensor::Int>,
}

#[cfg(feature = "burn-runtime")]
impl Batch {
    pub fn to_burn<B: burn::tensor::backend::Backend>(&self, device: &B::Device) -> BurnBatch<B> {
        let images = burn::tensor::Tensor::<B, 1>::from_floats(self.images.as_slice(), device)
            .reshape(self.dims());
        let labels = burn::tensor::Tensor::<B, 1, burn::tensor::Int>::from_ints(
            self.labels.as_slice(),
            device,
        );
        BurnBatch { images, labels }
    }
}

/// Periodic progress lines and the optional JSONL batch trace.
struct ProgressLog {
    log_every: Option<usize>,
    started: Instant,
    last_log: Instant,
    last_logged_samples: usize,
    samples: usize,
    batches: usize,
    total_wait: Duration,
    trace_path: Option<PathBuf>,
    trace_file: Option<std::fs::File>,
}

impl ProgressLog {
    fn from_env() -> Self {
        let log_every = match std::env::var(ENV_LOG_EVERY) {
            Ok(val) => {
                if val.eq_ignore_ascii_case("off") || val.trim() == "0" {
                    None
                } else {
                    val.trim().parse::<usize>().ok().filter(|v| *v > 0)
                }
            }
            Err(_) => Some(DEFAULT_LOG_EVERY_SAMPLES),
        };
        let trace_path = std::env::var(ENV_TRACE)
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);
        let now = Instant::now();
        Self {
            log_every,
            started: now,
            last_log: now,
            last_logged_samples: 0,
            samples: 0,
            batches: 0,
            total_wait: Duration::ZERO,
            trace_path,
            trace_file: None,
        }
    }

    fn record(&mut self, batch_len: usize, shape: ImageShape, wait: Duration) {
        self.samples += batch_len;
        self.batches += 1;
        self.total_wait += wait;
        self.maybe_log_progress();
        self.maybe_trace(batch_len, shape, wait);
    }

    fn maybe_log_progress(&mut self) {
        let Some(threshold) = self.log_every else {
            return;
        };
        let since = self.samples.saturating_sub(self.last_logged_samples);
        if since < threshold && self.last_log.elapsed() < Duration::from_secs(30) {
            return;
        }
        let secs = self.started.elapsed().as_secs_f32().max(0.001);
        let avg_wait_ms = self.total_wait.as_secs_f64() * 1000.0 / self.batches.max(1) as f64;
        info!(
            batches = self.batches,
            samples = self.samples,
            elapsed_s = format_args!("{secs:.1}"),
            rate = format_args!("{:.1} img/s", self.samples as f32 / secs),
            avg_wait_ms = format_args!("{avg_wait_ms:.2}"),
            "preprocess progress"
        );
        self.last_logged_samples = self.samples;
        self.last_log = Instant::now();
    }

    fn maybe_trace(&mut self, batch_len: usize, shape: ImageShape, wait: Duration) {
        let Some(path) = &self.trace_path else {
            return;
        };
        if self.trace_file.is_none() {
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            match std::fs::OpenOptions::new().create(true).append(true).open(path) {
                Ok(f) => self.trace_file = Some(f),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to open trace file");
                    self.trace_path = None;
                    return;
                }
            }
        }
        let Some(file) = self.trace_file.as_mut() else {
            return;
        };
        let record = serde_json::json!({
            "batch": self.batches,
            "samples": batch_len,
            "height": shape.height,
            "width": shape.width,
            "channels": shape.channels,
            "wait_ms": wait.as_secs_f64() * 1000.0,
            "timestamp_ms": self.started.elapsed().as_millis() as u64
        });
        if let Err(e) = writeln!(file, "{record}") {
            warn!(error = %e, "failed to write trace record");
            self.trace_path = None;
            self.trace_file = None;
        }
    }
}

/// Consumer side of the join queue: yields full batches, drops a trailing
/// partial one, and surfaces the first worker error.
pub struct BatchStream {
    rx: Receiver<LaneOutput>,
    coord: Coordinator,
    batch_size: usize,
    shape: ImageShape,
    finished: bool,
    progress: ProgressLog,
}

impl BatchStream {
    pub fn new(
        rx: Receiver<LaneOutput>,
        coord: Coordinator,
        batch_size: usize,
        shape: ImageShape,
    ) -> Self {
        Self {
            rx,
            coord,
            batch_size,
            shape,
            finished: false,
            progress: ProgressLog::from_env(),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn end(&mut self, pending: usize) -> Option<PreprocessResult<Batch>> {
        self.finished = true;
        if let Some(err) = self.coord.take_error() {
            return Some(Err(err));
        }
        if pending > 0 {
            debug!(pending, batch_size = self.batch_size, "discarding partial batch");
        }
        info!(
            batches = self.progress.batches,
            samples = self.progress.samples,
            "preprocess stream ended"
        );
        None
    }
}

impl Iterator for BatchStream {
    type Item = PreprocessResult<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let started = Instant::now();
        let mut images = Vec::with_capacity(self.batch_size * self.shape.elems());
        let mut labels = Vec::with_capacity(self.batch_size);
        while labels.len() < self.batch_size {
            match recv_or_stop(&self.rx, &self.coord) {
                Some(out) => {
                    if out.image.shape() != self.shape {
                        self.finished = true;
                        return Some(Err(PreprocessError::Shape(format!(
                            "lane produced {} instead of {}",
                            out.image.shape(),
                            self.shape
                        ))));
                    }
                    images.extend_from_slice(out.image.data());
                    labels.push(out.label);
                }
                None => return self.end(labels.len()),
            }
        }
        self.progress.record(labels.len(), self.shape, started.elapsed());
        Some(Batch::new(images, labels, self.shape))
    }
}

/// Batches split evenly across `num_devices`.
pub struct DeviceBatches {
    inner: BatchStream,
    num_devices: usize,
}

impl DeviceBatches {
    pub fn new(inner: BatchStream, num_devices: usize) -> PreprocessResult<Self> {
        if num_devices == 0 || inner.batch_size() % num_devices != 0 {
            return Err(PreprocessError::Config(format!(
                "batch size {} is not divisible by {num_devices} devices",
                inner.batch_size()
            )));
        }
        Ok(Self { inner, num_devices })
    }

    pub fn num_devices(&self) -> usize {
        self.num_devices
    }
}

impl Iterator for DeviceBatches {
    type Item = PreprocessResult<Vec<Batch>>;

    fn next(&mut self) -> Option<Self::Item> {
        let n = self.num_devices;
        self.inner.next().map(|b| b.and_then(|b| b.split(n)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crossbeam_channel::bounded;
    use data_contracts::ImageRecord;
    use image::{GrayImage, ImageFormat, Luma};
    use std::io::Cursor;

    fn shape() -> ImageShape {
        ImageShape::new(2, 2, 1)
    }

    fn output(label: i32) -> LaneOutput {
        LaneOutput {
            image: ImageTensor::filled(2, 2, 1, label as f32),
            label,
        }
    }

    #[test]
    fn lane_count_rules() {
        assert_eq!(lane_count(false, 7).unwrap(), 1);
        assert_eq!(lane_count(true, 8).unwrap(), 8);
        assert!(matches!(lane_count(true, 6), Err(PreprocessError::Config(_))));
        assert!(lane_count(true, 0).is_err());
        assert_eq!(join_capacity(4, 32), 256);
    }

    #[test]
    fn stream_drops_partial_tail() {
        let (tx, rx) = bounded(16);
        for l in 0..7 {
            tx.send(output(l)).unwrap();
        }
        drop(tx);
        let stream = BatchStream::new(rx, Coordinator::new(), 3, shape());
        let batches: Vec<_> = stream.collect::<PreprocessResult<_>>().unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1].labels, vec![3, 4, 5]);
        assert_eq!(batches[0].dims(), [3, 2, 2, 1]);
        assert_eq!(batches[1].image(0).unwrap(), &[3.0; 4]);
    }

    #[test]
    fn stream_surfaces_worker_error() {
        let (tx, rx) = bounded::<LaneOutput>(4);
        let coord = Coordinator::new();
        coord.report_error(PreprocessError::ImageFormat("bad".into()));
        drop(tx);
        let mut stream = BatchStream::new(rx, coord, 2, shape());
        assert!(matches!(stream.next(), Some(Err(PreprocessError::ImageFormat(_)))));
        assert!(stream.next().is_none());
    }

    #[test]
    fn split_evenly_or_fail() {
        let batch =
            Batch::new((0..16).map(|v| v as f32).collect(), vec![0, 1, 2, 3], shape()).unwrap();
        let parts = batch.clone().split(2).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1].labels, vec![2, 3]);
        assert_eq!(parts[1].images[0], 8.0);
        assert!(matches!(batch.split(3), Err(PreprocessError::Config(_))));
    }

    #[test]
    fn device_batches_check_divisibility() {
        let (_tx, rx) = bounded::<LaneOutput>(1);
        let stream = BatchStream::new(rx, Coordinator::new(), 6, shape());
        assert!(DeviceBatches::new(stream, 4).is_err());
    }

    fn record(label: i64, w: u32, h: u32) -> Bytes {
        let img = GrayImage::from_pixel(w, h, Luma([200]));
        let mut png = Cursor::new(Vec::new());
        img.write_to(&mut png, ImageFormat::Png).unwrap();
        Bytes::from(ImageRecord::new(png.into_inner(), label, "gray").encode_to_vec())
    }

    #[test]
    fn spawned_lanes_drain_source_and_shift_labels() {
        let (record_tx, record_rx) = bounded(16);
        for l in 0..10 {
            record_tx.send(record(l, 3 + l as u32, 5)).unwrap();
        }
        drop(record_tx);
        let source = RecordSource::Fifo(record_rx);
        let program: Arc<[Action]> = Vec::<Action>::new().into();
        let lanes = (0..2)
            .map(|id| Lane::new(id, shape(), None, Arc::clone(&program), 1, Some(3)))
            .collect();
        let coord = Coordinator::new();
        let (tx, rx) = bounded(16);
        let handles = spawn_lanes(lanes, &source, &tx, &coord).unwrap();
        assert_eq!(handles.len(), 2);
        drop(tx);
        let mut labels: Vec<i32> = rx
            .iter()
            .map(|out| {
                assert_eq!(out.image.shape(), shape());
                out.label
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        labels.sort_unstable();
        assert_eq!(labels, (1..=10).collect::<Vec<_>>());
        assert!(coord.take_error().is_none());
    }

    #[test]
    fn spawned_lane_reports_undecodable_record() {
        let (record_tx, record_rx) = bounded(4);
        record_tx.send(Bytes::from_static(b"not a record")).unwrap();
        drop(record_tx);
        let lanes = vec![Lane::new(0, shape(), None, Vec::<Action>::new().into(), 0, None)];
        let coord = Coordinator::new();
        let (tx, rx) = bounded(4);
        let handles = spawn_lanes(lanes, &RecordSource::Fifo(record_rx), &tx, &coord).unwrap();
        drop(tx);
        for h in handles {
            h.join().unwrap();
        }
        assert!(rx.try_recv().is_err());
        assert!(coord.take_error().is_some());
    }

    #[test]
    fn label_offset_applies_to_every_sample() {
        let mut batch = Batch::new(vec![0.0; 8], vec![1, 5], shape()).unwrap();
        batch.add_label_offset(-1);
        assert_eq!(batch.labels, vec![0, 4]);
    }
}
