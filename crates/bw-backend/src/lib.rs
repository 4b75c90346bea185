// bw-backend: the seam between the control plane and the FM hardware.
//
// The actual modulation executable is a collaborator, not part of this
// workspace.  [`Transmitter`] is the contract the client runtime drives —
// always from the owning process's main thread — and [`PcmSource`] is the
// contract for live audio feeds (the ALSA loopback capture in production,
// canned silence in tests).

pub mod capture;
pub mod external;
pub mod mock;

use std::io;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("no broadcast running")]
    NotRunning,
    #[error("backend failed: {0}")]
    Failed(String),
}

/// Snapshot of the backend's activity, polled at 1 Hz by the playback
/// monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BackendStatus {
    pub is_playing: bool,
    pub is_live_streaming: bool,
}

/// A raw PCM feed: interleaved signed 16-bit little-endian samples.
///
/// `next_chunk` may block until audio is available; it runs on a dedicated
/// feeder thread, never on the async runtime.
pub trait PcmSource {
    fn sample_rate(&self) -> u32;
    fn channels(&self) -> u16;
    /// The next chunk of raw bytes, or `None` at end of feed.
    fn next_chunk(&mut self) -> io::Result<Option<Vec<u8>>>;
}

/// What to modulate.
pub enum AudioSource {
    WavFile(PathBuf),
    Pcm(Box<dyn PcmSource + Send>),
}

impl std::fmt::Debug for AudioSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AudioSource::WavFile(path) => f.debug_tuple("WavFile").field(path).finish(),
            AudioSource::Pcm(_) => f.write_str("Pcm(..)"),
        }
    }
}

/// One armed broadcast: carrier, RDS fields, and the audio to play.
#[derive(Debug)]
pub struct TransmitJob {
    pub frequency: f64,
    pub ps: String,
    pub rt: String,
    pub pi: String,
    pub loop_play: bool,
    pub source: AudioSource,
}

/// The transmitter seam.
///
/// Implementations are singletons per client and must only be driven from
/// the process main thread; starting a new job while one is active stops the
/// current one first (callers enforce this ordering).
pub trait Transmitter: Send {
    fn start(&mut self, job: TransmitJob) -> Result<(), BackendError>;
    fn stop(&mut self) -> Result<(), BackendError>;
    fn status(&mut self) -> BackendStatus;
}
