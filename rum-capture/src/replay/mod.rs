//! Session replay uploads: accepted on the HTTP path, parked in a disk queue
//! and forwarded upstream by a pool of upload workers.

pub mod envelope;
pub mod filter;
pub mod handler;
pub mod queue;
pub mod supervisor;
pub mod worker;

pub use envelope::{Envelope, FormValues, ReplayLabels};
pub use filter::{FilterError, ReplayFilter};
pub use handler::ReplayIngest;
pub use queue::{DiskReplayQueue, MemoryReplayQueue, ReplayQueue};
pub use supervisor::{GroupState, WorkerGroup};
pub use worker::{UploadConfig, UploadError, UploadWorker};
