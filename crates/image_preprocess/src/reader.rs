//! Filename producer, shard readers and the record sources lanes pull from.

use crate::coordinator::{recv_or_stop, send_or_stop, Coordinator};
use crate::queue::ShuffleQueue;
use crate::tfrecord::RecordReader;
use crate::types::{Mode, PreprocessError, PreprocessResult};
use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info};

pub const TRAIN_FILENAME_CAPACITY: usize = 16;

/// How the list of shard paths is fed to readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilenameQueuePolicy {
    pub shuffle: bool,
    pub capacity: usize,
}

impl FilenameQueuePolicy {
    pub fn for_mode(mode: Mode) -> Self {
        match mode {
            Mode::Train => Self {
                shuffle: true,
                capacity: TRAIN_FILENAME_CAPACITY,
            },
            Mode::Validate => Self {
                shuffle: false,
                capacity: 1,
            },
        }
    }
}

/// Buffer between reader threads and lanes when more than one reader runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordQueuePolicy {
    Shuffle {
        capacity: usize,
        min_after_dequeue: usize,
    },
    Fifo {
        capacity: usize,
    },
}

impl RecordQueuePolicy {
    pub fn for_mode(
        mode: Mode,
        images_per_shard: usize,
        queue_memory_factor: usize,
        batch_size: usize,
    ) -> Self {
        match mode {
            Mode::Train => {
                let min_after_dequeue = images_per_shard * queue_memory_factor;
                Self::Shuffle {
                    capacity: min_after_dequeue + 3 * batch_size,
                    min_after_dequeue,
                }
            }
            Mode::Validate => Self::Fifo {
                capacity: images_per_shard + 3 * batch_size,
            },
        }
    }
}

pub(crate) fn spawn_named<F>(name: String, f: F) -> PreprocessResult<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.clone())
        .spawn(f)
        .map_err(|source| PreprocessError::Spawn { name, source })
}

/// Emits the file list once per epoch (reshuffled each time when `policy.shuffle`).
/// `num_epochs = None` keeps going until the coordinator stops.
pub fn spawn_filename_producer(
    files: Vec<PathBuf>,
    policy: FilenameQueuePolicy,
    num_epochs: Option<usize>,
    seed: Option<u64>,
    coord: Coordinator,
) -> PreprocessResult<(Receiver<PathBuf>, JoinHandle<()>)> {
    let (tx, rx) = bounded(policy.capacity);
    let handle = spawn_named("preprocess-filenames".to_string(), move || {
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(&mut rand::rng()),
        };
        let mut epoch = 0usize;
        while num_epochs.map_or(true, |n| epoch < n) {
            let mut order = files.clone();
            if policy.shuffle {
                order.shuffle(&mut rng);
            }
            for path in order {
                if !send_or_stop(&tx, path, &coord) {
                    debug!(epoch, "filename producer stopped");
                    return;
                }
            }
            epoch += 1;
        }
        debug!(epochs = epoch, "filename producer finished");
    })?;
    Ok((rx, handle))
}

/// Reads records shard by shard, pulling the next path when a shard runs out.
pub struct ShardCursor {
    filenames: Receiver<PathBuf>,
    current: Option<RecordReader<BufReader<File>>>,
}

impl ShardCursor {
    pub fn new(filenames: Receiver<PathBuf>) -> Self {
        Self {
            filenames,
            current: None,
        }
    }

    /// `None` once the filename queue is exhausted or the coordinator stops.
    pub fn next_record(&mut self, coord: &Coordinator) -> PreprocessResult<Option<Bytes>> {
        loop {
            if let Some(reader) = self.current.as_mut() {
                if let Some(record) = reader.read_record()? {
                    return Ok(Some(record));
                }
                debug!(
                    path = %reader.path().display(),
                    records = reader.records_read(),
                    "shard exhausted"
                );
                self.current = None;
            }
            match recv_or_stop(&self.filenames, coord) {
                Some(path) => self.current = Some(RecordReader::open(&path)?),
                None => return Ok(None),
            }
        }
    }
}

/// Where a lane gets its next serialized record.
#[derive(Clone)]
pub enum RecordSource {
    /// Lanes share one cursor and read in turn.
    Direct(Arc<Mutex<ShardCursor>>),
    /// Reader threads fill a shuffle queue.
    Shuffled(Arc<ShuffleQueue<Bytes>>),
    /// One background reader fills an ordered queue.
    Fifo(Receiver<Bytes>),
}

impl RecordSource {
    pub fn next_record(&self, coord: &Coordinator) -> PreprocessResult<Option<Bytes>> {
        match self {
            RecordSource::Direct(cursor) => cursor.lock().next_record(coord),
            RecordSource::Shuffled(queue) => Ok(queue.pop(coord)),
            RecordSource::Fifo(rx) => Ok(recv_or_stop(rx, coord)),
        }
    }
}

/// Closes the queue when the last reader holding a guard exits, panics included.
struct CloseOnLastExit {
    remaining: Arc<AtomicUsize>,
    queue: Arc<ShuffleQueue<Bytes>>,
}

impl Drop for CloseOnLastExit {
    fn drop(&mut self) {
        if self.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.queue.close();
        }
    }
}

/// Starts `num_readers` threads that move records from shards into `queue`.
pub fn spawn_shuffle_readers(
    num_readers: usize,
    filenames: &Receiver<PathBuf>,
    queue: &Arc<ShuffleQueue<Bytes>>,
    coord: &Coordinator,
) -> PreprocessResult<Vec<JoinHandle<()>>> {
    let remaining = Arc::new(AtomicUsize::new(num_readers));
    let mut handles = Vec::with_capacity(num_readers);
    for id in 0..num_readers {
        let guard = CloseOnLastExit {
            remaining: Arc::clone(&remaining),
            queue: Arc::clone(queue),
        };
        let mut cursor = ShardCursor::new(filenames.clone());
        let queue = Arc::clone(queue);
        let worker_coord = coord.clone();
        let spawned = spawn_named(format!("preprocess-reader-{id}"), move || {
            let _guard = guard;
            let mut pushed = 0u64;
            loop {
                match cursor.next_record(&worker_coord) {
                    Ok(Some(record)) => {
                        if !queue.push(record, &worker_coord) {
                            break;
                        }
                        pushed += 1;
                    }
                    Ok(None) => break,
                    Err(err) => {
                        worker_coord.report_error(err);
                        break;
                    }
                }
            }
            debug!(reader = id, records = pushed, "reader exiting");
        });
        match spawned {
            Ok(handle) => handles.push(handle),
            Err(err) => {
                coord.request_stop();
                return Err(err);
            }
        }
    }
    info!(readers = num_readers, capacity = queue.capacity(), "shuffle readers started");
    Ok(handles)
}

/// Starts one reader that keeps shard order and overlaps I/O with decoding.
pub fn spawn_fifo_reader(
    filenames: Receiver<PathBuf>,
    capacity: usize,
    coord: &Coordinator,
) -> PreprocessResult<(Receiver<Bytes>, JoinHandle<()>)> {
    let (tx, rx) = bounded(capacity);
    let coord = coord.clone();
    let handle = spawn_named("preprocess-reader-fifo".to_string(), move || {
        let mut cursor = ShardCursor::new(filenames);
        loop {
            match cursor.next_record(&coord) {
                Ok(Some(record)) => {
                    if !send_or_stop(&tx, record, &coord) {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    coord.report_error(err);
                    break;
                }
            }
        }
    })?;
    Ok((rx, handle))
}
