mod batch;
mod resumable;

pub use batch::{BatchItem, UploadBatcher};
pub use resumable::{
    plan_chunks, ChunkRange, ResumableUploader, TransferRequest, TransferSource, UploadCheckpoint,
    UploadOutcome,
};

use std::time::Instant;

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}
