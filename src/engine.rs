//! The contract between the dashboard and whatever moves the bytes.

use crate::error::Error;
use crate::job::JobDescriptor;
use std::path::Path;

/// One read of a job's progress. Cheap to produce, never mutated after.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusSnapshot {
    /// Parts per million done, `0..=1_000_000`.
    pub progress_ppm: u32,
    /// Payload bytes/s received.
    pub download_rate: f64,
    /// Payload bytes/s sent.
    pub upload_rate: f64,
    pub total_done: u64,
    pub total_wanted: u64,
    pub num_peers: u32,
    pub name: String,
}

impl StatusSnapshot {
    pub fn percent(&self) -> f64 {
        f64::from(self.progress_ppm.min(1_000_000)) / 10_000.0
    }

    pub fn remaining(&self) -> u64 {
        self.total_wanted.saturating_sub(self.total_done)
    }

    /// Seconds left at the current rate, or -1 when unknown.
    pub fn eta_seconds(&self) -> f64 {
        let remaining = self.remaining();
        if self.download_rate > 0.0 && remaining > 0 {
            remaining as f64 / self.download_rate
        } else {
            -1.0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Something went wrong but the job keeps going.
    Error(String),
    /// Every wanted piece is on disk and verified.
    Finished,
}

pub trait JobHandle {
    fn status(&self) -> StatusSnapshot;
    fn set_sequential(&self, enabled: bool);
}

/// A transfer engine session. Rate limits and trackers are fixed when the
/// session is built.
pub trait Session {
    type Handle: JobHandle;

    /// Starts a job. Errors are fatal to the caller; the engine does not retry.
    fn add_job(&mut self, job: JobDescriptor, save_path: &Path) -> Result<Self::Handle, Error>;

    /// Returns every event queued since the last call without waiting.
    fn drain_events(&mut self) -> Vec<EngineEvent>;
}
