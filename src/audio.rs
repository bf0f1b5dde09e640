use crate::error::{CaptureError, Result};

use chrono::{DateTime, Local};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{getpgid, Pid};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, Command};

// Audio Configuration (ReSpeaker far-field array)
pub const DEFAULT_RECORDER: &str = "arecord";
pub const DEFAULT_DEVICE: &str = "plughw:1";
pub const SAMPLE_FORMAT: &str = "S16_LE";
pub const SAMPLE_RATE: u32 = 16000;
pub const CHANNELS: u32 = 8;

#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub program: PathBuf,
    pub device: String,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from(DEFAULT_RECORDER),
            device: DEFAULT_DEVICE.to_string(),
        }
    }
}

impl RecorderConfig {
    pub fn args(&self, output: &Path) -> Vec<String> {
        vec![
            "-M".to_string(),
            "-D".to_string(),
            self.device.clone(),
            "-v".to_string(),
            "-f".to_string(),
            SAMPLE_FORMAT.to_string(),
            format!("-c{}", CHANNELS),
            format!("-r{}", SAMPLE_RATE),
            output.to_string_lossy().into_owned(),
        ]
    }
}

pub fn mic_filename(at: &DateTime<Local>) -> String {
    format!("mic-data-{}.wav", at.format("%Y%m%d-%H%M%S"))
}

// --- External Recorder Process ---

/// A running recorder process, leader of its own process group.
pub struct Recording {
    child: Child,
    path: PathBuf,
}

impl Recording {
    /// Launches the recorder writing to a timestamped file in `dir`.
    pub fn start(config: &RecorderConfig, dir: &Path, at: &DateTime<Local>) -> Result<Self> {
        let path = dir.join(mic_filename(at));

        let child = Command::new(&config.program)
            .args(config.args(&path))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .map_err(|source| CaptureError::RecorderSpawn {
                program: config.program.display().to_string(),
                source,
            })?;

        tracing::info!(
            "Started recording mic: {:?} (pid {:?})",
            path,
            child.id()
        );
        Ok(Self { child, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sends SIGTERM to the recorder's whole process group without waiting.
    /// A recorder that already exited on its own is reported, not signalled.
    pub fn terminate(&mut self) -> Result<()> {
        if let Some(status) = self.child.try_wait().map_err(CaptureError::RecorderWait)? {
            return Err(CaptureError::RecorderExited(status));
        }
        let pid = self.child.id().ok_or(CaptureError::RecorderGone)?;
        let pid = Pid::from_raw(pid as i32);
        let pgid = getpgid(Some(pid)).map_err(|source| CaptureError::RecorderSignal {
            pgid: pid.as_raw(),
            source,
        })?;

        killpg(pgid, Signal::SIGTERM).map_err(|source| CaptureError::RecorderSignal {
            pgid: pgid.as_raw(),
            source,
        })?;
        tracing::info!("Stopped recording mic: {:?}", self.path);
        Ok(())
    }

    /// Waits for the recorder to exit, returning the finished file's path.
    pub async fn wait(mut self) -> (PathBuf, std::io::Result<ExitStatus>) {
        let status = self.child.wait().await;
        (self.path, status)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::os::unix::process::ExitStatusExt;

    #[test]
    fn test_mic_filename() {
        let at = Local.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(mic_filename(&at), "mic-data-20240101-000000.wav");
    }

    #[test]
    fn test_arecord_arguments() {
        let config = RecorderConfig::default();
        let args = config.args(Path::new("out.wav"));
        assert_eq!(
            args,
            vec!["-M", "-D", "plughw:1", "-v", "-f", "S16_LE", "-c8", "-r16000", "out.wav"]
        );
    }

    #[tokio::test]
    async fn test_terminate_signals_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let config = RecorderConfig {
            program: testing::fake_recorder(dir.path()),
            ..RecorderConfig::default()
        };
        let mut recording = Recording::start(&config, dir.path(), &Local::now()).unwrap();
        assert!(recording.path().starts_with(dir.path()));

        recording.terminate().unwrap();
        let (_, status) = recording.wait().await;
        assert_eq!(status.unwrap().signal(), Some(Signal::SIGTERM as i32));
    }

    #[tokio::test]
    async fn test_terminate_reports_recorder_that_already_exited() {
        let dir = tempfile::tempdir().unwrap();
        let config = RecorderConfig {
            program: testing::failing_recorder(dir.path()),
            ..RecorderConfig::default()
        };
        let mut recording = Recording::start(&config, dir.path(), &Local::now()).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;

        let err = recording.terminate().unwrap_err();
        assert!(matches!(err, CaptureError::RecorderExited(status) if status.code() == Some(1)));
    }

    #[tokio::test]
    async fn test_missing_recorder_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let config = RecorderConfig {
            program: dir.path().join("no-such-recorder"),
            ..RecorderConfig::default()
        };
        let err = Recording::start(&config, dir.path(), &Local::now()).err().unwrap();
        assert!(matches!(err, CaptureError::RecorderSpawn { .. }));
    }
}
