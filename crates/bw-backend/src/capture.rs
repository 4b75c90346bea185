//! PCM sources: the ALSA loopback capture used for live streaming, plus a
//! canned source for tests.

use crate::PcmSource;
use std::io::{self, Read};
use std::process::{Child, Command, Stdio};
use tracing::debug;

/// Default loopback device set up by the installer.
pub const LOOPBACK_DEVICE: &str = "hw:BotWave,1";
pub const SAMPLE_RATE: u32 = 48_000;
pub const CHANNELS: u16 = 2;
const READ_CHUNK: usize = 4096;

/// Captures the loopback device by piping `arecord` raw S16_LE output.
///
/// Blocks in `next_chunk` until a full period is available, which is exactly
/// what the stream feeder wants.
pub struct LoopbackCapture {
    child: Child,
    rate: u32,
    channels: u16,
}

impl LoopbackCapture {
    pub fn open(device: &str, rate: u32, channels: u16) -> io::Result<Self> {
        debug!(device, rate, channels, "opening loopback capture");
        let child = Command::new("arecord")
            .arg("-D")
            .arg(device)
            .arg("-f")
            .arg("S16_LE")
            .arg("-r")
            .arg(rate.to_string())
            .arg("-c")
            .arg(channels.to_string())
            .arg("-t")
            .arg("raw")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        Ok(LoopbackCapture {
            child,
            rate,
            channels,
        })
    }

    pub fn open_default() -> io::Result<Self> {
        LoopbackCapture::open(LOOPBACK_DEVICE, SAMPLE_RATE, CHANNELS)
    }
}

impl PcmSource for LoopbackCapture {
    fn sample_rate(&self) -> u32 {
        self.rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn next_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        let Some(stdout) = self.child.stdout.as_mut() else {
            return Ok(None);
        };
        let mut buf = vec![0_u8; READ_CHUNK];
        let n = stdout.read(&mut buf)?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(buf))
    }
}

impl Drop for LoopbackCapture {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Fixed-length silent feed for tests: yields `chunks` buffers of zeros,
/// then EOF.
pub struct SilenceSource {
    remaining: usize,
    chunk_len: usize,
    rate: u32,
    channels: u16,
}

impl SilenceSource {
    pub fn new(chunks: usize, chunk_len: usize) -> Self {
        SilenceSource {
            remaining: chunks,
            chunk_len,
            rate: SAMPLE_RATE,
            channels: CHANNELS,
        }
    }
}

impl PcmSource for SilenceSource {
    fn sample_rate(&self) -> u32 {
        self.rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn next_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        Ok(Some(vec![0_u8; self.chunk_len]))
    }
}
