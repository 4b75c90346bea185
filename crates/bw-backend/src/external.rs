//! Subprocess-backed transmitter.
//!
//! Wraps the external modulation executable.  WAV jobs pass the file path as
//! the final argument; live jobs pass `-` and pump the PCM feed into the
//! child's stdin from a feeder thread.  The child must stay attached to the
//! process main thread, which is why all calls here are blocking.

use crate::{AudioSource, BackendError, BackendStatus, TransmitJob, Transmitter};
use std::io::Write;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread::JoinHandle;
use tracing::{debug, warn};

pub struct ExternalTransmitter {
    program: PathBuf,
    child: Option<Child>,
    feeder: Option<JoinHandle<()>>,
    live: bool,
}

impl ExternalTransmitter {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        ExternalTransmitter {
            program: program.into(),
            child: None,
            feeder: None,
            live: false,
        }
    }

    fn base_command(&self, job: &TransmitJob) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("--freq")
            .arg(job.frequency.to_string())
            .arg("--ps")
            .arg(&job.ps)
            .arg("--rt")
            .arg(&job.rt)
            .arg("--pi")
            .arg(&job.pi);
        if job.loop_play {
            cmd.arg("--loop");
        }
        cmd
    }
}

impl Transmitter for ExternalTransmitter {
    fn start(&mut self, job: TransmitJob) -> Result<(), BackendError> {
        if self.child.is_some() {
            self.stop()?;
        }

        let mut cmd = self.base_command(&job);
        match job.source {
            AudioSource::WavFile(ref path) => {
                cmd.arg(path);
                debug!(program = %self.program.display(), file = %path.display(), "starting transmitter");
                self.child = Some(cmd.spawn()?);
                self.live = false;
            }
            AudioSource::Pcm(mut source) => {
                cmd.arg("--rate")
                    .arg(source.sample_rate().to_string())
                    .arg("--channels")
                    .arg(source.channels().to_string())
                    .arg("-")
                    .stdin(Stdio::piped());
                debug!(program = %self.program.display(), "starting live transmitter");
                let mut child = cmd.spawn()?;
                let mut stdin = child
                    .stdin
                    .take()
                    .ok_or_else(|| BackendError::Failed("no stdin on live backend".to_owned()))?;
                self.feeder = Some(std::thread::spawn(move || loop {
                    match source.next_chunk() {
                        Ok(Some(chunk)) => {
                            if stdin.write_all(&chunk).is_err() {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(%e, "pcm feed error");
                            break;
                        }
                    }
                }));
                self.child = Some(child);
                self.live = true;
            }
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), BackendError> {
        let Some(mut child) = self.child.take() else {
            return Err(BackendError::NotRunning);
        };
        // Closing stdin (feeder gone) is not enough for looped playback.
        if let Err(e) = child.kill() {
            warn!(%e, "error killing transmitter backend");
        }
        let _ = child.wait();
        if let Some(feeder) = self.feeder.take() {
            let _ = feeder.join();
        }
        self.live = false;
        Ok(())
    }

    fn status(&mut self) -> BackendStatus {
        let playing = match self.child.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(None) => true,
                Ok(Some(_)) | Err(_) => {
                    self.child = None;
                    false
                }
            },
            None => false,
        };
        BackendStatus {
            is_playing: playing,
            is_live_streaming: playing && self.live,
        }
    }
}

impl Drop for ExternalTransmitter {
    fn drop(&mut self) {
        if self.child.is_some() {
            let _ = self.stop();
        }
    }
}
