//! Frame delivery to the consumer.
//!
//! Boundary handling runs on the interrupt path and must never block on a
//! slow consumer, so delivery goes through a bounded FIFO per channel: the
//! boundary side does a non-blocking `try_send`, and an async worker drains
//! the queue into the [`FrameSink`]. When the FIFO is full the frame's buffer
//! goes straight back to the pool and the drop is counted; losing one frame
//! is recoverable, stalling the interrupt path is not.

use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::buffer::{CaptureBuffer, DeliveredFrame};
use crate::channel::{ChannelCounters, ChannelId};
use crate::hal::FrameSink;
use capture_pool::FrameQueue;

/// Non-blocking producer half of one channel's delivery FIFO.
pub struct Notifier {
    channel: ChannelId,
    tx: mpsc::Sender<DeliveredFrame>,
    pool: Arc<FrameQueue<CaptureBuffer>>,
    counters: Arc<ChannelCounters>,
}

/// Consumer half; drains the FIFO into a [`FrameSink`].
pub struct DeliveryWorker {
    channel: ChannelId,
    rx: mpsc::Receiver<DeliveredFrame>,
}

/// Build the FIFO for one channel. The [`DeliveryWorker`] must be spawned
/// onto a runtime for frames to flow.
pub(crate) fn delivery_pair(
    channel: ChannelId,
    depth: usize,
    pool: Arc<FrameQueue<CaptureBuffer>>,
    counters: Arc<ChannelCounters>,
) -> (Notifier, DeliveryWorker) {
    let (tx, rx) = mpsc::channel(depth.max(1));
    (
        Notifier {
            channel,
            tx,
            pool,
            counters,
        },
        DeliveryWorker { channel, rx },
    )
}

impl Notifier {
    /// Queue one frame for delivery. Never blocks: on a full FIFO the
    /// buffer is returned to the pool and the drop counted.
    pub fn offer(&self, frame: DeliveredFrame) {
        match self.tx.try_send(frame) {
            Ok(()) => ChannelCounters::bump(&self.counters.delivered),
            Err(TrySendError::Full(frame)) => {
                warn!(
                    channel = %self.channel,
                    sequence = frame.buffer.sequence,
                    "delivery FIFO full, recycling frame"
                );
                self.pool.push(frame.buffer);
                ChannelCounters::bump(&self.counters.dropped_deliveries);
            }
            Err(TrySendError::Closed(frame)) => {
                // Worker is gone (shutdown): recycle rather than leak.
                self.pool.push(frame.buffer);
                ChannelCounters::bump(&self.counters.dropped_deliveries);
            }
        }
    }
}

impl DeliveryWorker {
    /// Drain the FIFO until the [`Notifier`] is dropped.
    pub async fn run(mut self, sink: Arc<dyn FrameSink>) {
        while let Some(frame) = self.rx.recv().await {
            sink.deliver(self.channel, frame).await;
        }
        debug!(channel = %self.channel, "delivery worker finished");
    }
}
