use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use diskqueue::{DiskQueue, QueueConfig, QueueError};
use metrics::gauge;

/// Hand-off point between the replay handler and the upload workers.
#[async_trait]
pub trait ReplayQueue {
    /// Returns once the record is durable.
    async fn put(&self, record: Vec<u8>) -> Result<(), QueueError>;
    /// Pops the oldest record, `QueueError::Eof` when there is none.
    async fn get(&self) -> Result<Vec<u8>, QueueError>;
}

fn join_error(err: tokio::task::JoinError) -> QueueError {
    QueueError::Io(io::Error::other(err))
}

pub struct DiskReplayQueue {
    inner: Arc<DiskQueue>,
}

impl DiskReplayQueue {
    pub fn open(config: QueueConfig) -> Result<Self, QueueError> {
        let inner = DiskQueue::open(config)?;
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    fn report_size(&self) {
        gauge!("rum_replay_queue_bytes").set(self.inner.stats().bytes as f64);
    }
}

#[async_trait]
impl ReplayQueue for DiskReplayQueue {
    async fn put(&self, record: Vec<u8>) -> Result<(), QueueError> {
        let queue = self.inner.clone();
        tokio::task::spawn_blocking(move || queue.put(&record))
            .await
            .map_err(join_error)??;
        self.report_size();
        Ok(())
    }

    async fn get(&self) -> Result<Vec<u8>, QueueError> {
        let queue = self.inner.clone();
        let record = tokio::task::spawn_blocking(move || queue.get(|record| record.to_vec()))
            .await
            .map_err(join_error)??;
        self.report_size();
        Ok(record)
    }
}

/// Unbounded in-process queue, for tests and for running without a disk.
#[derive(Clone, Default)]
pub struct MemoryReplayQueue {
    records: Arc<Mutex<VecDeque<Vec<u8>>>>,
}

impl MemoryReplayQueue {
    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ReplayQueue for MemoryReplayQueue {
    async fn put(&self, record: Vec<u8>) -> Result<(), QueueError> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(record);
        Ok(())
    }

    async fn get(&self) -> Result<Vec<u8>, QueueError> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
            .ok_or(QueueError::Eof)
    }
}
