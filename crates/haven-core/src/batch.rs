//! Send-side batching.
//!
//! Outgoing records accumulate per channel and are handed to the
//! synchronizer as one batch when either the count threshold is reached
//! or a one-shot timer fires, whichever comes first. The timer is armed
//! exactly once per non-empty buffer: when the first record lands in an
//! empty queue.
//!
//! A flush drains the queue before any store I/O, so records enqueued
//! while a publish is in flight land in the next batch. A failed publish
//! does not restore the taken batch; those records are lost and the error
//! surfaces to the caller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::engine::MessengerEvent;
use crate::error::HavenResult;
use crate::message::MessageRecord;
use crate::store::LogStore;
use crate::sync::LogSynchronizer;
use crate::types::ChannelId;

/// An armed flush timer for one channel.
///
/// The generation ties a wakeup to the arming that scheduled it: a timer
/// whose slot has been replaced or removed wakes into a no-op instead of
/// taking a batch it was never armed for.
struct TimerSlot {
    handle: JoinHandle<()>,
    generation: u64,
}

struct BufferInner {
    pending: HashMap<ChannelId, Vec<MessageRecord>>,
    timers: HashMap<ChannelId, TimerSlot>,
    next_generation: u64,
}

/// Per-channel batching in front of a [`LogSynchronizer`].
///
/// Cheap to clone; clones share the same queues and timers. Must be used
/// within a tokio runtime, since arming a timer spawns a task.
pub struct BatchBuffer<S: LogStore> {
    synchronizer: Arc<LogSynchronizer<S>>,
    inner: Arc<Mutex<BufferInner>>,
    batch_size: usize,
    batch_timeout: Duration,
    events: broadcast::Sender<MessengerEvent>,
}

impl<S: LogStore> Clone for BatchBuffer<S> {
    fn clone(&self) -> Self {
        Self {
            synchronizer: Arc::clone(&self.synchronizer),
            inner: Arc::clone(&self.inner),
            batch_size: self.batch_size,
            batch_timeout: self.batch_timeout,
            events: self.events.clone(),
        }
    }
}

impl<S: LogStore + 'static> BatchBuffer<S> {
    pub fn new(
        synchronizer: Arc<LogSynchronizer<S>>,
        batch_size: usize,
        batch_timeout: Duration,
        events: broadcast::Sender<MessengerEvent>,
    ) -> Self {
        Self {
            synchronizer,
            inner: Arc::new(Mutex::new(BufferInner {
                pending: HashMap::new(),
                timers: HashMap::new(),
                next_generation: 0,
            })),
            batch_size,
            batch_timeout,
            events,
        }
    }

    /// Queue a record for the channel.
    ///
    /// The first record into an empty queue arms the flush timer; hitting
    /// the count threshold flushes immediately and cancels it.
    ///
    /// # Errors
    ///
    /// Propagates the publish error when a threshold flush fails. The
    /// batch, including this record, is lost in that case.
    pub async fn enqueue(&self, channel: &ChannelId, record: MessageRecord) -> HavenResult<()> {
        let reached_threshold = {
            let mut inner = self.inner.lock();
            let queue = inner.pending.entry(channel.clone()).or_default();
            queue.push(record);
            let len = queue.len();

            if len == 1 {
                let generation = inner.next_generation;
                inner.next_generation += 1;

                let buffer = self.clone();
                let timer_channel = channel.clone();
                let handle = tokio::spawn(async move {
                    tokio::time::sleep(buffer.batch_timeout).await;
                    if let Err(e) = buffer.flush_timed(&timer_channel, generation).await {
                        warn!(channel = %timer_channel, error = %e, "Timed batch flush failed");
                    }
                });

                inner.timers.insert(
                    channel.clone(),
                    TimerSlot {
                        handle,
                        generation,
                    },
                );
                debug!(channel = %channel, generation, "Armed batch flush timer");
            }

            len >= self.batch_size
        };

        if reached_threshold {
            self.flush(channel).await?;
        }
        Ok(())
    }

    /// Flush the channel's pending batch now.
    ///
    /// Cancels any armed timer. An empty queue is a no-op returning zero.
    pub async fn flush(&self, channel: &ChannelId) -> HavenResult<usize> {
        match self.take_batch(channel, None) {
            Some(batch) => self.publish_batch(channel, batch).await,
            None => Ok(0),
        }
    }

    /// Number of records currently pending for the channel.
    pub fn pending_len(&self, channel: &ChannelId) -> usize {
        self.inner
            .lock()
            .pending
            .get(channel)
            .map_or(0, |queue| queue.len())
    }

    /// Entry point for fired timers.
    async fn flush_timed(&self, channel: &ChannelId, generation: u64) -> HavenResult<usize> {
        match self.take_batch(channel, Some(generation)) {
            Some(batch) => self.publish_batch(channel, batch).await,
            None => Ok(0),
        }
    }

    /// Drain the channel's queue and retire its timer slot atomically.
    ///
    /// With `required_generation`, the take only proceeds if the installed
    /// slot is the caller's own arming; otherwise the batch now belongs to
    /// whoever flushed in between. Without it, any installed timer is
    /// still sleeping and gets aborted.
    fn take_batch(
        &self,
        channel: &ChannelId,
        required_generation: Option<u64>,
    ) -> Option<Vec<MessageRecord>> {
        let mut inner = self.inner.lock();

        match required_generation {
            Some(generation) => match inner.timers.get(channel) {
                Some(slot) if slot.generation == generation => {
                    inner.timers.remove(channel);
                }
                _ => return None,
            },
            None => {
                if let Some(slot) = inner.timers.remove(channel) {
                    slot.handle.abort();
                }
            }
        }

        inner.pending.remove(channel).filter(|batch| !batch.is_empty())
    }

    async fn publish_batch(
        &self,
        channel: &ChannelId,
        batch: Vec<MessageRecord>,
    ) -> HavenResult<usize> {
        let count = batch.len();
        match self.synchronizer.append_batch(channel, batch).await {
            Ok(_) => {
                debug!(channel = %channel, count, "Flushed batch to log store");
                let _ = self.events.send(MessengerEvent::BatchFlushed {
                    channel: channel.clone(),
                    count,
                });
                Ok(count)
            }
            Err(e) => {
                warn!(
                    channel = %channel,
                    lost = count,
                    error = %e,
                    "Batch publish failed; batch is lost"
                );
                Err(e)
            }
        }
    }
}
