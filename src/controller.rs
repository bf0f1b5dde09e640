//! Capture toggle controller: one button, two sinks.
//!
//! Each accepted press flips the session between idle and recording. Entering
//! a session lights the indicator, launches the recorder process and starts
//! the GPS logging thread; leaving it undoes the three in the same order.
//! Only the recorder decides whether a session starts: GPS trouble ends up in
//! the CSV file or the log, never in the audio.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use tokio::task::JoinHandle;

use crate::audio::{RecorderConfig, Recording};
use crate::button::{Debouncer, DEFAULT_DEBOUNCE};
use crate::error::{CaptureError, Result};
use crate::gps::GpsOpener;
use crate::gps_log::{self, GpsLog, GpsLogTask, DEFAULT_WRITE_INTERVAL};
use crate::indicator::Indicator;
use crate::split;
use crate::state::SessionState;

/// Bound on each wait during shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub output_dir: PathBuf,
    pub recorder: RecorderConfig,
    pub debounce: Duration,
    pub gps_write_interval: Duration,
    pub split_on_stop: bool,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            recorder: RecorderConfig::default(),
            debounce: DEFAULT_DEBOUNCE,
            gps_write_interval: DEFAULT_WRITE_INTERVAL,
            split_on_stop: false,
        }
    }
}

struct Session {
    recording: Recording,
    // None when the CSV file could not be created
    gps: Option<GpsLogTask>,
}

pub struct CaptureController {
    settings: CaptureSettings,
    indicator: Box<dyn Indicator>,
    open_gps: GpsOpener,
    clock: fn() -> DateTime<Local>,
    debouncer: Debouncer,
    state: SessionState,
    session: Option<Session>,
    // stopped GPS threads that may still be closing their file
    stopping: Vec<GpsLogTask>,
    // recorder reaping and optional channel splits
    background: Vec<JoinHandle<()>>,
}

impl CaptureController {
    pub fn new(settings: CaptureSettings, indicator: Box<dyn Indicator>, open_gps: GpsOpener) -> Self {
        let debouncer = Debouncer::new(settings.debounce);
        Self {
            settings,
            indicator,
            open_gps,
            clock: Local::now,
            debouncer,
            state: SessionState::Idle,
            session: None,
            stopping: Vec::new(),
            background: Vec::new(),
        }
    }

    #[cfg(test)]
    fn with_clock(mut self, clock: fn() -> DateTime<Local>) -> Self {
        self.clock = clock;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Handles one rising edge. Returns the new state, or `None` when the
    /// edge fell inside the debounce window.
    pub fn on_edge(&mut self, at: Instant) -> Result<Option<SessionState>> {
        if !self.debouncer.accept(at) {
            tracing::debug!("Ignoring bounce");
            return Ok(None);
        }

        let outcome = match self.state {
            SessionState::Idle => self.start(),
            SessionState::Recording => self.stop().map(|_| ()),
        };
        tracing::info!("Button pressed, now is {}", self.state);
        outcome?;
        Ok(Some(self.state))
    }

    /// Enters a recording session. Fails only when the recorder cannot be
    /// launched, in which case nothing is left running.
    pub fn start(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Err(CaptureError::AlreadyRecording);
        }
        self.reap_stopped();

        let now = (self.clock)();
        self.indicator.set_active();

        let recording = match Recording::start(&self.settings.recorder, &self.settings.output_dir, &now) {
            Ok(recording) => recording,
            Err(e) => {
                self.indicator.set_inactive();
                return Err(e);
            }
        };

        let gps = match GpsLog::create(&self.settings.output_dir, &now) {
            Ok(log) => Some(gps_log::spawn_gps_logger(
                log,
                self.open_gps.clone(),
                self.settings.gps_write_interval,
            )),
            Err(e) => {
                tracing::error!("Recording audio without GPS: {}", e);
                None
            }
        };

        self.session = Some(Session { recording, gps });
        self.state = SessionState::Recording;
        Ok(())
    }

    /// Leaves the recording session. Returns the path of the audio file.
    ///
    /// The GPS thread is only asked to stop; it closes its file on its next
    /// loop iteration. A failure to signal the recorder is returned after the
    /// session has been torn down.
    pub fn stop(&mut self) -> Result<PathBuf> {
        let Session { mut recording, gps } = self.session.take().ok_or(CaptureError::NotRecording)?;
        self.state = SessionState::Idle;

        self.indicator.set_inactive();

        let audio_path = recording.path().to_path_buf();
        let signalled = recording.terminate();

        if let Some(gps) = gps {
            gps.stop();
            self.stopping.push(gps);
        }

        let split_after_exit = self.settings.split_on_stop && signalled.is_ok();
        self.background.push(tokio::spawn(reap_recorder(recording, split_after_exit)));

        signalled.map(|_| audio_path)
    }

    /// Joins stopped GPS threads that have already exited, reporting their outcome.
    fn reap_stopped(&mut self) {
        let (finished, running): (Vec<_>, Vec<_>) =
            self.stopping.drain(..).partition(GpsLogTask::is_finished);
        self.stopping = running;
        for task in finished {
            report_gps_outcome(task.join());
        }
        self.background.retain(|job| !job.is_finished());
    }

    /// Stops an active session and waits, bounded, for background work.
    pub async fn shutdown(mut self) {
        if self.session.is_some() {
            if let Err(e) = self.stop() {
                tracing::error!("Error while stopping session: {}", e);
            }
        }

        for task in self.stopping.drain(..) {
            let path = task.path().to_path_buf();
            let joined = tokio::task::spawn_blocking(move || task.join());
            match tokio::time::timeout(SHUTDOWN_GRACE, joined).await {
                Ok(Ok(outcome)) => report_gps_outcome(outcome),
                Ok(Err(e)) => tracing::error!("GPS join task failed: {}", e),
                Err(_) => tracing::warn!("GPS logging for {:?} still blocked on a read; leaving it", path),
            }
        }

        for job in self.background.drain(..) {
            if tokio::time::timeout(SHUTDOWN_GRACE, job).await.is_err() {
                tracing::warn!("Background recorder job did not finish in time");
            }
        }
    }
}

fn report_gps_outcome(outcome: Result<gps_log::GpsLogSummary>) {
    match outcome {
        Ok(summary) => tracing::debug!("GPS log closed: {:?}", summary),
        Err(e) => tracing::error!("GPS logging failed: {}", e),
    }
}

async fn reap_recorder(recording: Recording, split_after_exit: bool) {
    let (path, status) = recording.wait().await;
    match status {
        Ok(status) => tracing::info!("Recorder for {:?} exited: {}", path, status),
        Err(e) => {
            tracing::error!("Failed to wait for recorder of {:?}: {}", path, e);
            return;
        }
    }

    if split_after_exit {
        schedule_split(path).await;
    }
}

async fn schedule_split(path: PathBuf) {
    let source = path.clone();
    match tokio::task::spawn_blocking(move || split::split_channels(&source)).await {
        Ok(Ok(report)) => log_split_report(&path, &report),
        Ok(Err(e)) => tracing::error!("Failed to split {:?}: {}", path, e),
        Err(e) => tracing::error!("Split task for {:?} failed: {}", path, e),
    }
}

pub fn log_split_report(path: &Path, report: &split::SplitReport) {
    for (channel, reason) in &report.failed {
        tracing::error!("Channel {} of {:?} not written: {}", channel, path, reason);
    }
    if let Some(reason) = &report.truncated {
        tracing::warn!("{:?} ended early: {}", path, reason);
    }
    if report.is_complete() {
        tracing::info!("Split {} channels of {:?}", report.written.len(), path);
    }
}
