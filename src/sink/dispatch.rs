use thiserror::Error;
use tokio::sync::mpsc;
use tracing::trace;

use crate::record::MetricRecord;

/// Errors returned when handing a record to the aggregation worker.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DispatchError {
    #[error("aggregation worker has shut down")]
    Closed,
}

/// Cloneable write end of the single record queue.
///
/// Every source holds its own clone; the aggregation worker owns the only
/// receiver. The queue is bounded, so a slow worker stalls ingestion instead
/// of buffering without limit. Order is preserved per clone.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    tx: mpsc::Sender<MetricRecord>,
}

impl Dispatcher {
    /// Creates a dispatcher and the receiver for the aggregation worker.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<MetricRecord>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Queues `record`, waiting while the queue is full.
    pub async fn dispatch(&self, record: MetricRecord) -> Result<(), DispatchError> {
        if self.available() == 0 {
            trace!(topic = %record.topic, "record queue full, waiting for the worker");
        }
        self.tx.send(record).await.map_err(|_| DispatchError::Closed)
    }

    /// Number of records that can be queued before senders block.
    pub fn available(&self) -> usize {
        self.tx.capacity()
    }
}
