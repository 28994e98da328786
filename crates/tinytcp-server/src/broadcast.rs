//! Fan-out of one payload to many streams.
//!
//! [`BulkBroadcaster`] splits the target list into contiguous segments and
//! deals them round-robin to a fixed set of worker tasks. Each worker writes
//! the payload to its targets one at a time under a short write deadline
//! (the write quantum), so a slow peer costs at most one quantum per pass.
//!
//! The write deadline is cleared again after every attempt.
//!
//! A write that runs out of time is re-queued for that single target with
//! only the unwritten suffix, in a retry queue local to the worker. Retries
//! are drained before new work, and give up after `max_retries` attempts.
//! Closed targets are skipped.

use std::{collections::VecDeque, ops::Range, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use bytes::Bytes;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, error, warn};

use crate::{
    BroadcastError, Closer, DeadlineSetter, SocketError, Writer,
    util::{lock, panic_message},
};

/// Broadcaster sizing and timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcasterConfig {
    /// Worker tasks.
    pub workers: usize,
    /// Targets per segment.
    pub segment_size: usize,
    /// Write deadline per target and attempt.
    pub write_quantum: Duration,
    /// Pending segments per worker before `broadcast` waits.
    pub queue_capacity: usize,
    /// Pending retries per worker before new retries are dropped.
    pub retry_capacity: usize,
    /// Retries per target before the payload is dropped for it.
    pub max_retries: u32,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            segment_size: 64,
            write_quantum: Duration::from_millis(50),
            queue_capacity: 32,
            retry_capacity: 32,
            max_retries: 16,
        }
    }
}

struct Segment<S: ?Sized> {
    payload: Bytes,
    targets: Vec<Arc<S>>,
    attempt: u32,
}

/// Worker pool writing payloads to many targets.
pub struct BulkBroadcaster<S: ?Sized> {
    queues: Vec<mpsc::Sender<Segment<S>>>,
    segment_size: usize,
    stop: watch::Sender<bool>,
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl<S> BulkBroadcaster<S>
where
    S: Writer + Closer + DeadlineSetter + ?Sized + 'static,
{
    /// Spawn the workers.
    ///
    /// # Errors
    ///
    /// [`BroadcastError::InvalidConfig`] if `workers`, `segment_size` or
    /// `queue_capacity` is zero.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn start(config: BroadcasterConfig) -> Result<Self, BroadcastError> {
        if config.workers == 0 {
            return Err(BroadcastError::InvalidConfig("workers must be non-zero".to_string()));
        }
        if config.segment_size == 0 {
            return Err(BroadcastError::InvalidConfig("segment size must be non-zero".to_string()));
        }
        if config.queue_capacity == 0 {
            return Err(BroadcastError::InvalidConfig("queue capacity must be non-zero".to_string()));
        }

        let (stop, stop_rx) = watch::channel(false);
        let mut queues = Vec::with_capacity(config.workers);
        let mut handles = Vec::with_capacity(config.workers);
        for id in 0..config.workers {
            let (tx, rx) = mpsc::channel(config.queue_capacity);
            let worker = Worker {
                id,
                queue: rx,
                stop: stop_rx.clone(),
                retries: VecDeque::with_capacity(config.retry_capacity),
                config,
            };
            queues.push(tx);
            handles.push(tokio::spawn(worker.run()));
        }

        Ok(Self {
            queues,
            segment_size: config.segment_size,
            stop,
            handles: std::sync::Mutex::new(handles),
        })
    }

    /// Number of worker tasks.
    pub fn workers(&self) -> usize {
        self.queues.len()
    }

    /// Queue `payload` for every target.
    ///
    /// Returns once every segment is queued, not once it is written. Waits
    /// while a worker queue is full.
    ///
    /// # Errors
    ///
    /// [`BroadcastError::Stopped`] after [`BulkBroadcaster::stop`].
    pub async fn broadcast(
        &self,
        payload: impl Into<Bytes>,
        targets: &[Arc<S>],
    ) -> Result<(), BroadcastError> {
        if *self.stop.borrow() {
            return Err(BroadcastError::Stopped);
        }

        let payload = payload.into();
        for (worker, range) in segments(targets.len(), self.segment_size, self.queues.len()) {
            let segment =
                Segment { payload: payload.clone(), targets: targets[range].to_vec(), attempt: 0 };
            self.queues[worker].send(segment).await.map_err(|_| BroadcastError::Stopped)?;
        }
        Ok(())
    }

    /// Stop the workers and wait for them to exit. Idempotent.
    ///
    /// Queued but unprocessed segments are dropped.
    pub async fn stop(&self) {
        self.stop.send_replace(true);
        let handles = std::mem::take(&mut *lock(&self.handles));
        for handle in handles {
            let _ = handle.await;
        }
    }
}

/// Split `len` targets into segments of `segment_size`, dealt round-robin
/// over `workers` starting at worker 0.
///
/// Yields `(worker, target range)` pairs in target order.
pub fn segments(
    len: usize,
    segment_size: usize,
    workers: usize,
) -> impl Iterator<Item = (usize, Range<usize>)> {
    let segment_size = segment_size.max(1);
    let workers = workers.max(1);
    (0..len)
        .step_by(segment_size)
        .enumerate()
        .map(move |(k, start)| (k % workers, start..(start + segment_size).min(len)))
}

struct Worker<S: ?Sized> {
    id: usize,
    queue: mpsc::Receiver<Segment<S>>,
    stop: watch::Receiver<bool>,
    retries: VecDeque<Segment<S>>,
    config: BroadcasterConfig,
}

impl<S> Worker<S>
where
    S: Writer + Closer + DeadlineSetter + ?Sized + 'static,
{
    async fn run(mut self) {
        loop {
            if *self.stop.borrow() {
                break;
            }

            let segment = match self.retries.pop_front() {
                Some(segment) => segment,
                None => tokio::select! {
                    biased;
                    _ = self.stop.changed() => break,
                    segment = self.queue.recv() => match segment {
                        Some(segment) => segment,
                        None => break,
                    },
                },
            };

            let delivered = AssertUnwindSafe(self.deliver(&segment)).catch_unwind().await;
            if let Err(panic) = delivered {
                error!(worker = self.id, panic = %panic_message(&*panic), "Panic inside BulkBroadcaster worker");
            }
        }
        debug!(worker = self.id, "BulkBroadcaster worker stopped");
    }

    async fn deliver(&mut self, segment: &Segment<S>) {
        for target in &segment.targets {
            if target.is_closed() {
                continue;
            }
            let deadline = Instant::now() + self.config.write_quantum;
            if target.set_write_deadline(Some(deadline)).is_err() {
                continue;
            }

            let written = target.write(&segment.payload).await;
            // The quantum only bounds this attempt; later writes by the
            // connection's own handler must not inherit it.
            let _ = target.set_write_deadline(None);

            match written {
                Ok(_) => {},
                Err(_) if target.is_closed() => {},
                Err(SocketError::DeadlineExceeded { transferred }) => {
                    self.retry(segment, target, transferred);
                },
                Err(err) => warn!(worker = self.id, error = %err, "Error while broadcasting to TCP socket"),
            }
        }
    }

    fn retry(&mut self, segment: &Segment<S>, target: &Arc<S>, transferred: usize) {
        if transferred >= segment.payload.len() {
            return;
        }
        if segment.attempt >= self.config.max_retries {
            warn!(worker = self.id, attempts = segment.attempt, "Giving up on slow broadcast target");
            return;
        }
        if self.retries.len() >= self.config.retry_capacity {
            warn!(worker = self.id, "Broadcast retry queue full, dropping payload for target");
            return;
        }
        self.retries.push_back(Segment {
            payload: segment.payload.slice(transferred..),
            targets: vec![Arc::clone(target)],
            attempt: segment.attempt + 1,
        });
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        #[test]
        fn segments_cover_targets_in_order(len in 0usize..500, size in 1usize..40, workers in 1usize..9) {
            let parts: Vec<_> = segments(len, size, workers).collect();

            let mut next = 0;
            for (k, (worker, range)) in parts.iter().enumerate() {
                prop_assert_eq!(*worker, k % workers);
                prop_assert_eq!(range.start, next);
                prop_assert!(range.end > range.start);
                prop_assert!(range.len() <= size);
                next = range.end;
            }
            prop_assert_eq!(next, len);
            prop_assert_eq!(parts.len(), len.div_ceil(size));
        }
    }

    #[test]
    fn ten_targets_over_two_workers() {
        let parts: Vec<_> = segments(10, 3, 2).collect();
        assert_eq!(parts, vec![(0, 0..3), (1, 3..6), (0, 6..9), (1, 9..10)]);
    }

    #[tokio::test]
    async fn zero_sizes_are_rejected() {
        for config in [
            BroadcasterConfig { workers: 0, ..BroadcasterConfig::default() },
            BroadcasterConfig { segment_size: 0, ..BroadcasterConfig::default() },
            BroadcasterConfig { queue_capacity: 0, ..BroadcasterConfig::default() },
        ] {
            let result = BulkBroadcaster::<crate::Socket>::start(config);
            assert!(matches!(result, Err(BroadcastError::InvalidConfig(_))));
        }
    }
}
