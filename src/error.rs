use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the capture controller and its collaborators
#[derive(Debug, Error)]
pub enum CaptureError {
    /// Session lifecycle
    #[error("A recording session is already active")]
    AlreadyRecording,

    #[error("No recording session is active")]
    NotRecording,

    /// Recorder process
    #[error("Failed to launch recorder '{program}': {source}")]
    RecorderSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Recorder process has already been reaped")]
    RecorderGone,

    #[error("Recorder process already exited: {0}")]
    RecorderExited(std::process::ExitStatus),

    #[error("Failed to check recorder process: {0}")]
    RecorderWait(#[source] std::io::Error),

    #[error("Failed to signal recorder process group {pgid}: {source}")]
    RecorderSignal {
        pgid: i32,
        #[source]
        source: nix::Error,
    },

    /// GPS logging
    #[error("GPS log {path:?}: {source}")]
    GpsLog {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("GPS logging thread panicked")]
    GpsTaskPanicked,

    /// Channel split
    #[error("Unsupported WAV format in {path:?}: {reason}")]
    UnsupportedWav { path: PathBuf, reason: String },

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    /// Hardware
    #[error("USB device {vid:04x}:{pid:04x} not found")]
    IndicatorNotFound { vid: u16, pid: u16 },

    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    #[error("GPIO error: {0}")]
    Gpio(#[from] rppal::gpio::Error),
}

/// Convenience type alias for Results using CaptureError
pub type Result<T> = std::result::Result<T, CaptureError>;

impl CaptureError {
    /// Errors after which the service should not keep accepting button presses.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CaptureError::RecorderSpawn { .. })
    }
}
