//! In-memory transmitter for tests: records jobs, plays until told to
//! finish.

use crate::{AudioSource, BackendError, BackendStatus, TransmitJob, Transmitter};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// What the mock remembers about one started job.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedJob {
    pub frequency: f64,
    pub ps: String,
    pub rt: String,
    pub pi: String,
    pub loop_play: bool,
    pub wav_path: Option<PathBuf>,
    pub live: bool,
}

#[derive(Debug, Default)]
struct MockInner {
    status: BackendStatus,
    jobs: Vec<RecordedJob>,
    stops: usize,
}

/// Shared handle for inspecting and steering a [`MockTransmitter`] from a
/// test while the runtime under test owns the transmitter itself.
#[derive(Debug, Clone, Default)]
pub struct MockHandle {
    inner: Arc<Mutex<MockInner>>,
}

impl MockHandle {
    pub fn jobs(&self) -> Vec<RecordedJob> {
        self.inner.lock().unwrap().jobs.clone()
    }

    pub fn stop_count(&self) -> usize {
        self.inner.lock().unwrap().stops
    }

    pub fn is_playing(&self) -> bool {
        self.inner.lock().unwrap().status.is_playing
    }

    /// Simulate the audio reaching end-of-track.
    pub fn finish_playback(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.status = BackendStatus::default();
    }
}

#[derive(Debug, Default)]
pub struct MockTransmitter {
    handle: MockHandle,
}

impl MockTransmitter {
    pub fn new() -> (Self, MockHandle) {
        let tx = MockTransmitter::default();
        let handle = tx.handle.clone();
        (tx, handle)
    }
}

impl Transmitter for MockTransmitter {
    fn start(&mut self, job: TransmitJob) -> Result<(), BackendError> {
        let mut inner = self.handle.inner.lock().unwrap();
        let (wav_path, live) = match &job.source {
            AudioSource::WavFile(path) => (Some(path.clone()), false),
            AudioSource::Pcm(_) => (None, true),
        };
        inner.jobs.push(RecordedJob {
            frequency: job.frequency,
            ps: job.ps,
            rt: job.rt,
            pi: job.pi,
            loop_play: job.loop_play,
            wav_path,
            live,
        });
        inner.status = BackendStatus {
            is_playing: true,
            is_live_streaming: live,
        };
        Ok(())
    }

    fn stop(&mut self) -> Result<(), BackendError> {
        let mut inner = self.handle.inner.lock().unwrap();
        inner.stops += 1;
        inner.status = BackendStatus::default();
        Ok(())
    }

    fn status(&mut self) -> BackendStatus {
        self.handle.inner.lock().unwrap().status
    }
}
