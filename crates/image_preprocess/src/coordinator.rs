//! Shared cancellation and error propagation for pipeline threads.

use crate::types::PreprocessError;
use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How long blocking queue operations wait before re-checking the stop flag.
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);
const JOIN_POLL: Duration = Duration::from_millis(10);

/// Cloneable handle to one pipeline run's stop flag and first error.
#[derive(Clone, Default)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    stop: AtomicBool,
    error: Mutex<Option<PreprocessError>>,
}

/// Outcome of [`Coordinator::join`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JoinReport {
    pub joined: usize,
    pub panicked: usize,
    pub still_running: usize,
}

impl Coordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.inner.stop.store(true, Ordering::SeqCst);
    }

    pub fn should_stop(&self) -> bool {
        self.inner.stop.load(Ordering::SeqCst)
    }

    /// Keeps the first error and stops every thread.
    pub fn report_error(&self, err: PreprocessError) {
        {
            let mut slot = self.inner.error.lock();
            if slot.is_none() {
                warn!(error = %err, "pipeline worker failed; stopping");
                *slot = Some(err);
            } else {
                debug!(error = %err, "additional worker error after stop");
            }
        }
        self.request_stop();
    }

    pub fn take_error(&self) -> Option<PreprocessError> {
        self.inner.error.lock().take()
    }

    pub fn has_error(&self) -> bool {
        self.inner.error.lock().is_some()
    }

    /// Waits up to `grace` for `handles` to finish. Threads still running after
    /// that are detached and counted, not waited for.
    pub fn join(&self, handles: Vec<JoinHandle<()>>, grace: Duration) -> JoinReport {
        let deadline = Instant::now() + grace;
        let mut pending = handles;
        let mut report = JoinReport::default();
        loop {
            let (finished, running): (Vec<_>, Vec<_>) =
                pending.into_iter().partition(|h| h.is_finished());
            for handle in finished {
                match handle.join() {
                    Ok(()) => report.joined += 1,
                    Err(_) => report.panicked += 1,
                }
            }
            pending = running;
            if pending.is_empty() || Instant::now() >= deadline {
                break;
            }
            thread::sleep(JOIN_POLL);
        }
        report.still_running = pending.len();
        if report.still_running > 0 {
            warn!(
                still_running = report.still_running,
                grace_secs = grace.as_secs_f32(),
                "pipeline threads did not stop in time; leaving them running"
            );
        }
        if report.panicked > 0 {
            warn!(panicked = report.panicked, "pipeline threads panicked");
        }
        report
    }
}

/// Sends `item`, giving up when the coordinator stops or the receiver is gone.
pub fn send_or_stop<T>(tx: &Sender<T>, item: T, coord: &Coordinator) -> bool {
    let mut item = item;
    loop {
        match tx.send_timeout(item, POLL_INTERVAL) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(back)) => {
                if coord.should_stop() {
                    return false;
                }
                item = back;
            }
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}

/// Receives the next item; `None` once the coordinator stops or all senders are gone.
pub fn recv_or_stop<T>(rx: &Receiver<T>, coord: &Coordinator) -> Option<T> {
    loop {
        if coord.should_stop() {
            return None;
        }
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(item) => return Some(item),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    #[test]
    fn first_error_wins_and_stops() {
        let coord = Coordinator::new();
        coord.report_error(PreprocessError::Parse("first".into()));
        coord.report_error(PreprocessError::Parse("second".into()));
        assert!(coord.should_stop());
        match coord.take_error() {
            Some(PreprocessError::Parse(msg)) => assert_eq!(msg, "first"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(coord.take_error().is_none());
    }

    #[test]
    fn blocked_sender_exits_on_stop() {
        let coord = Coordinator::new();
        let (tx, _rx) = bounded::<u32>(1);
        assert!(send_or_stop(&tx, 1, &coord));
        let worker = {
            let coord = coord.clone();
            thread::spawn(move || send_or_stop(&tx, 2, &coord))
        };
        thread::sleep(Duration::from_millis(20));
        coord.request_stop();
        let report = coord.join(vec![thread::spawn(move || {
            assert!(!worker.join().unwrap());
        })], Duration::from_secs(5));
        assert_eq!(report.joined, 1);
    }

    #[test]
    fn join_gives_up_after_grace() {
        let coord = Coordinator::new();
        let (_tx, rx) = bounded::<()>(0);
        let stuck = thread::spawn(move || {
            let _ = rx.recv_timeout(Duration::from_millis(500));
        });
        let report = coord.join(vec![stuck], Duration::from_millis(30));
        assert_eq!(report.still_running, 1);
        assert_eq!(report.joined, 0);
    }

    #[test]
    fn receiver_sees_disconnect() {
        let coord = Coordinator::new();
        let (tx, rx) = bounded::<u8>(2);
        tx.send(9).unwrap();
        drop(tx);
        assert_eq!(recv_or_stop(&rx, &coord), Some(9));
        assert_eq!(recv_or_stop(&rx, &coord), None);
    }
}
