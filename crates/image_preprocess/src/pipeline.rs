//! Pipeline lifecycle: wires readers, lanes and the join queue, and tears them down.

use crate::actions::{warn_missing_moments, Action};
use crate::batch::{
    join_capacity, lane_count, spawn_lanes, BatchStream, DeviceBatches, Lane, LaneOutput,
};
use crate::config::PreprocessConfig;
use crate::coordinator::{Coordinator, JoinReport};
use crate::queue::ShuffleQueue;
use crate::reader::{
    spawn_fifo_reader, spawn_filename_producer, spawn_shuffle_readers, FilenameQueuePolicy,
    RecordQueuePolicy, RecordSource, ShardCursor,
};
use crate::types::{Mode, PreprocessError, PreprocessResult};
use crossbeam_channel::{bounded, Receiver};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info};

/// How long `stop` waits for threads before leaving them behind.
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Owns one mode's background threads. Dropping it stops them.
pub struct Preprocess {
    mode: Mode,
    config: PreprocessConfig,
    files: Vec<PathBuf>,
    program: Arc<[Action]>,
    num_lanes: usize,
    coord: Coordinator,
    threads: Vec<JoinHandle<()>>,
    output: Option<Receiver<LaneOutput>>,
}

impl Preprocess {
    /// Validates the configuration, file list and action program. No threads start yet.
    pub fn new(mode: Mode, concurrent: bool, config: PreprocessConfig) -> PreprocessResult<Self> {
        config.validate()?;
        let num_lanes = lane_count(concurrent, config.system.num_threads)?;
        let files = config.data_files(mode)?;
        let program: Arc<[Action]> = config.dataset.preprocess.program(mode)?.into();
        warn_missing_moments(&program, config.dataset.moment.as_ref(), &config.image_shape());
        debug!(
            %mode,
            lanes = num_lanes,
            files = files.len(),
            actions = ?program.iter().map(Action::name).collect::<Vec<_>>(),
            "preprocess pipeline configured"
        );
        Ok(Self {
            mode,
            config,
            files,
            program,
            num_lanes,
            coord: Coordinator::new(),
            threads: Vec::new(),
            output: None,
        })
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn num_lanes(&self) -> usize {
        self.num_lanes
    }

    pub fn program(&self) -> &[Action] {
        &self.program
    }

    pub fn config(&self) -> &PreprocessConfig {
        &self.config
    }

    pub fn is_started(&self) -> bool {
        self.output.is_some()
    }

    /// Background threads created by the current run.
    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Spawns the filename producer, readers and lanes. A no-op when already started.
    pub fn start(&mut self) -> PreprocessResult<()> {
        if self.is_started() {
            return Ok(());
        }
        let coord = Coordinator::new();
        let mut threads = Vec::new();
        match self.spawn_all(&coord, &mut threads) {
            Ok(rx) => {
                info!(
                    mode = %self.mode,
                    threads = threads.len(),
                    lanes = self.num_lanes,
                    batch_size = self.config.system.batch_size,
                    "preprocess pipeline started"
                );
                self.coord = coord;
                self.threads = threads;
                self.output = Some(rx);
                Ok(())
            }
            Err(err) => {
                coord.request_stop();
                coord.join(threads, STOP_GRACE_PERIOD);
                Err(err)
            }
        }
    }

    fn spawn_all(
        &self,
        coord: &Coordinator,
        threads: &mut Vec<JoinHandle<()>>,
    ) -> PreprocessResult<Receiver<LaneOutput>> {
        let sys = &self.config.system;
        let (filenames, producer) = spawn_filename_producer(
            self.files.clone(),
            FilenameQueuePolicy::for_mode(self.mode),
            sys.num_epochs,
            sys.seed,
            coord.clone(),
        )?;
        threads.push(producer);

        let source = if sys.num_readers > 1 {
            match RecordQueuePolicy::for_mode(
                self.mode,
                self.config.dataset.images_per_shard,
                sys.queue_memory_factor,
                sys.batch_size,
            ) {
                RecordQueuePolicy::Shuffle {
                    capacity,
                    min_after_dequeue,
                } => {
                    let queue = Arc::new(ShuffleQueue::new(capacity, min_after_dequeue, sys.seed)?);
                    threads.extend(spawn_shuffle_readers(
                        sys.num_readers,
                        &filenames,
                        &queue,
                        coord,
                    )?);
                    RecordSource::Shuffled(queue)
                }
                RecordQueuePolicy::Fifo { capacity } => {
                    let (records, reader) = spawn_fifo_reader(filenames, capacity, coord)?;
                    threads.push(reader);
                    RecordSource::Fifo(records)
                }
            }
        } else {
            RecordSource::Direct(Arc::new(Mutex::new(ShardCursor::new(filenames))))
        };

        let shape = self.config.image_shape();
        let lanes = (0..self.num_lanes)
            .map(|id| {
                Lane::new(
                    id,
                    shape,
                    self.config.dataset.moment.clone(),
                    Arc::clone(&self.program),
                    self.config.dataset.label_offset,
                    sys.seed,
                )
            })
            .collect();
        let (tx, rx) = bounded(join_capacity(self.num_lanes, sys.batch_size));
        threads.extend(spawn_lanes(lanes, &source, &tx, coord)?);
        Ok(rx)
    }

    /// Signals every thread and waits up to [`STOP_GRACE_PERIOD`]. A no-op when not started.
    pub fn stop(&mut self) -> JoinReport {
        if !self.is_started() {
            return JoinReport::default();
        }
        self.output = None;
        self.coord.request_stop();
        let threads = std::mem::take(&mut self.threads);
        let report = self.coord.join(threads, STOP_GRACE_PERIOD);
        info!(
            mode = %self.mode,
            joined = report.joined,
            still_running = report.still_running,
            "preprocess pipeline stopped"
        );
        report
    }

    /// Starts if needed and returns the stream of whole batches.
    pub fn batches(&mut self) -> PreprocessResult<BatchStream> {
        self.start()?;
        let rx = self
            .output
            .clone()
            .ok_or_else(|| PreprocessError::Config("pipeline has no output queue".into()))?;
        Ok(BatchStream::new(
            rx,
            self.coord.clone(),
            self.config.system.batch_size,
            self.config.image_shape(),
        ))
    }

    /// Starts if needed and returns batches split across `num_devices`.
    pub fn preprocess(&mut self, num_devices: usize) -> PreprocessResult<DeviceBatches> {
        let batch_size = self.config.system.batch_size;
        if num_devices == 0 || batch_size % num_devices != 0 {
            return Err(PreprocessError::Config(format!(
                "batch size {batch_size} is not divisible by {num_devices} devices"
            )));
        }
        DeviceBatches::new(self.batches()?, num_devices)
    }
}

impl Drop for Preprocess {
    fn drop(&mut self) {
        self.stop();
    }
}
