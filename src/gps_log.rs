use crate::error::{CaptureError, Result};
use crate::gps::{Fix, FixSource, GpsError, GpsOpener};
use crate::state::RunFlag;

use chrono::{DateTime, Local};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub const GPS_HEADER: &str =
    "Date (RPi), Time (RPi), Date (GPS), UTC (GPS), Latitude, Longitude, Validity";
pub const DEFAULT_WRITE_INTERVAL: Duration = Duration::from_millis(1000);
const REOPEN_PAUSE: Duration = Duration::from_millis(100);

pub fn gps_log_filename(at: &DateTime<Local>) -> String {
    format!("gps-data-{}.csv", at.format("%Y%m%d-%H%M%S"))
}

pub fn format_fix_row(local: &DateTime<Local>, fix: &Fix) -> String {
    let coordinate = |c: Option<f64>| c.map(|v| format!("{:.6}", v)).unwrap_or_default();
    format!(
        "{},{},{},{},{},{}",
        local.format("%d/%m/%Y,%H:%M:%S"),
        fix.date,
        fix.utc,
        coordinate(fix.latitude),
        coordinate(fix.longitude),
        fix.data_valid
    )
}

/// Allows one write per elapsed interval; the first call always passes.
/// A zero interval lets every call through.
#[derive(Debug)]
pub struct WriteThrottle {
    interval: Duration,
    last_write: Option<Instant>,
}

impl WriteThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_write: None,
        }
    }

    pub fn ready(&mut self, now: Instant) -> bool {
        match self.last_write {
            Some(prev) if now.saturating_duration_since(prev) < self.interval => false,
            _ => {
                self.last_write = Some(now);
                true
            }
        }
    }
}

// --- CSV Log File ---

pub struct GpsLog {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl GpsLog {
    /// Creates the log and writes the header row.
    pub fn create(dir: &Path, at: &DateTime<Local>) -> Result<Self> {
        let path = dir.join(gps_log_filename(at));
        let file = File::create(&path).map_err(|source| CaptureError::GpsLog {
            path: path.clone(),
            source,
        })?;
        let mut log = Self {
            path,
            writer: Some(BufWriter::new(file)),
        };
        log.append(GPS_HEADER)?;
        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes one line and forces it to disk.
    pub fn append(&mut self, line: &str) -> Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(CaptureError::GpsLog {
                path: self.path.clone(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "log already closed"),
            });
        };
        writeln!(writer, "{}", line)
            .and_then(|_| writer.flush())
            .and_then(|_| writer.get_ref().sync_data())
            .map_err(|source| CaptureError::GpsLog {
                path: self.path.clone(),
                source,
            })
    }

    /// Closes the file. Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.flush() {
                tracing::warn!("Failed to flush {:?} on close: {}", self.path, e);
            }
        }
    }
}

impl Drop for GpsLog {
    fn drop(&mut self) {
        self.close();
    }
}

// --- Background Logging Thread ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpsLogSummary {
    pub path: PathBuf,
    pub fixes: usize,
    pub errors: usize,
}

/// Handle to a running (or winding down) GPS logging thread.
pub struct GpsLogTask {
    path: PathBuf,
    run_flag: RunFlag,
    handle: JoinHandle<Result<GpsLogSummary>>,
}

impl GpsLogTask {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Asks the thread to exit after its current iteration; does not wait.
    pub fn stop(&self) {
        self.run_flag.lower();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn join(self) -> Result<GpsLogSummary> {
        self.handle
            .join()
            .map_err(|_| CaptureError::GpsTaskPanicked)?
    }
}

pub fn spawn_gps_logger(log: GpsLog, open_gps: GpsOpener, interval: Duration) -> GpsLogTask {
    let run_flag = RunFlag::raised();
    let path = log.path().to_path_buf();
    let thread_flag = run_flag.clone();

    tracing::info!("Started writing GPS data: {:?}", path);
    let handle = thread::spawn(move || record_gps_loop(log, open_gps, thread_flag, interval));

    GpsLogTask {
        path,
        run_flag,
        handle,
    }
}

/// Error text as one CSV field.
pub fn error_row(err: &GpsError) -> String {
    err.to_string().replace(',', ";")
}

fn record_gps_loop(
    mut log: GpsLog,
    open_gps: GpsOpener,
    run_flag: RunFlag,
    interval: Duration,
) -> Result<GpsLogSummary> {
    let mut summary = GpsLogSummary {
        path: log.path().to_path_buf(),
        fixes: 0,
        errors: 0,
    };
    let outcome = pump(&mut log, &open_gps, &run_flag, interval, &mut summary);
    log.close();

    tracing::info!(
        "Stopped writing GPS data: {:?} ({} fixes, {} errors)",
        summary.path,
        summary.fixes,
        summary.errors
    );
    outcome.map(|_| summary)
}

fn pump(
    log: &mut GpsLog,
    open_gps: &GpsOpener,
    run_flag: &RunFlag,
    interval: Duration,
    summary: &mut GpsLogSummary,
) -> Result<()> {
    let mut throttle = WriteThrottle::new(interval);
    let mut source: Option<Box<dyn FixSource>> = None;

    while run_flag.is_raised() {
        // always read as often as the receiver allows
        let reading = match source.as_mut() {
            Some(receiver) => receiver.read_fix(),
            None => match open_gps() {
                Ok(mut receiver) => {
                    let reading = receiver.read_fix();
                    source = Some(receiver);
                    reading
                }
                Err(e) => {
                    // no receiver to block on; don't spin on the port
                    thread::sleep(REOPEN_PAUSE);
                    Err(e)
                }
            },
        };

        if matches!(reading, Err(GpsError::Disconnected)) && source.take().is_some() {
            thread::sleep(REOPEN_PAUSE);
        }

        if !throttle.ready(Instant::now()) {
            continue;
        }

        let line = match reading {
            Ok(fix) => {
                summary.fixes += 1;
                format_fix_row(&Local::now(), &fix)
            }
            Err(e) => {
                tracing::warn!("GPS read error: {}", e);
                summary.errors += 1;
                error_row(&e)
            }
        };
        log.append(&line)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gps::testing::{opener, sample_fix, ScriptedSource};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use chrono::TimeZone;

    fn new_year() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn read_lines(path: &Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_filename_from_timestamp() {
        assert_eq!(gps_log_filename(&new_year()), "gps-data-20240101-000000.csv");
    }

    #[test]
    fn test_fix_row_has_seven_fields() {
        let at = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        let row = format_fix_row(&at, &sample_fix());
        assert_eq!(row, "09/03/2024,14:05:07,010124,000000.000,51.500000,-0.125000,A");
        assert_eq!(row.split(',').count(), GPS_HEADER.split(',').count());
    }

    #[test]
    fn test_throttle_first_write_is_immediate() {
        let mut throttle = WriteThrottle::new(Duration::from_millis(1000));
        let t0 = Instant::now();
        assert!(throttle.ready(t0));
        assert!(!throttle.ready(t0 + Duration::from_millis(400)));
        assert!(!throttle.ready(t0 + Duration::from_millis(999)));
        assert!(throttle.ready(t0 + Duration::from_millis(1000)));
        assert!(!throttle.ready(t0 + Duration::from_millis(1500)));
    }

    #[test]
    fn test_zero_interval_is_unthrottled() {
        let mut throttle = WriteThrottle::new(Duration::ZERO);
        let t0 = Instant::now();
        assert!((0..5).all(|_| throttle.ready(t0)));
    }

    #[test]
    fn test_log_header_and_idempotent_close() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = GpsLog::create(dir.path(), &new_year()).unwrap();
        assert!(log.path().ends_with("gps-data-20240101-000000.csv"));
        log.close();
        log.close();
        assert!(log.writer.is_none());
        assert!(log.append("late").is_err());
        assert_eq!(read_lines(log.path()), vec![GPS_HEADER.to_string()]);
    }

    #[test]
    fn test_logger_rate_limits_fast_source() {
        let dir = tempfile::tempdir().unwrap();
        let log = GpsLog::create(dir.path(), &new_year()).unwrap();
        let source = opener(|| ScriptedSource::always_fix(Duration::from_millis(2)));

        let task = spawn_gps_logger(log, source, Duration::from_millis(100));
        thread::sleep(Duration::from_millis(550));
        task.stop();
        let summary = task.join().unwrap();

        let lines = read_lines(&summary.path);
        assert_eq!(lines[0], GPS_HEADER);
        let rows = &lines[1..];
        // ~5.5 intervals elapsed, reads happened ~250 times
        assert!((4..=7).contains(&rows.len()), "got {} rows", rows.len());
        assert_eq!(summary.fixes, rows.len());
        assert!(rows.iter().all(|r| r.split(',').count() == 7));
    }

    #[test]
    fn test_logger_records_errors_as_rows() {
        let dir = tempfile::tempdir().unwrap();
        let log = GpsLog::create(dir.path(), &new_year()).unwrap();
        let source = opener(|| ScriptedSource::always_err("receiver offline", Duration::from_millis(2)));

        let task = spawn_gps_logger(log, source, Duration::from_millis(100));
        thread::sleep(Duration::from_millis(250));
        assert!(!task.is_finished());
        task.stop();
        let summary = task.join().unwrap();

        let lines = read_lines(&summary.path);
        let rows = &lines[1..];
        assert!(rows.len() >= 2);
        assert_eq!(summary.fixes, 0);
        assert_eq!(summary.errors, rows.len());
        assert!(rows
            .iter()
            .all(|r| r == "Malformed RMC sentence: receiver offline"));
    }

    #[test]
    fn test_logger_mixes_fixes_and_errors_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = GpsLog::create(dir.path(), &new_year()).unwrap();
        let source = opener(|| {
            ScriptedSource::new(
                vec![Ok(sample_fix()), Err("checksum".into()), Ok(sample_fix())],
                Duration::from_millis(5),
            )
        });

        let task = spawn_gps_logger(log, source, Duration::ZERO);
        thread::sleep(Duration::from_millis(60));
        task.stop();
        let summary = task.join().unwrap();

        let lines = read_lines(&summary.path);
        assert_eq!(lines[1].split(',').count(), 7);
        assert_eq!(lines[2], "Malformed RMC sentence: checksum");
        assert_eq!(lines[3].split(',').count(), 7);
    }

    #[test]
    fn test_unopenable_receiver_is_logged_and_retried() {
        let dir = tempfile::tempdir().unwrap();
        let log = GpsLog::create(dir.path(), &new_year()).unwrap();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counted = attempts.clone();
        let source: GpsOpener = Arc::new(move || -> std::result::Result<Box<dyn FixSource>, GpsError> {
            counted.fetch_add(1, Ordering::SeqCst);
            Err(GpsError::Malformed("port busy, try later".into()))
        });

        let task = spawn_gps_logger(log, source, Duration::from_millis(100));
        thread::sleep(Duration::from_millis(350));
        assert!(!task.is_finished());
        task.stop();
        let summary = task.join().unwrap();

        let rows = read_lines(&summary.path)[1..].to_vec();
        assert!(rows.len() >= 2, "got {} rows", rows.len());
        assert!(rows.len() <= 5, "got {} rows", rows.len());
        assert!(rows
            .iter()
            .all(|r| r == "Malformed RMC sentence: port busy; try later"));
        assert!(attempts.load(Ordering::SeqCst) >= rows.len());
    }

    struct DropsOut;

    impl FixSource for DropsOut {
        fn read_fix(&mut self) -> std::result::Result<Fix, GpsError> {
            thread::sleep(Duration::from_millis(2));
            Err(GpsError::Disconnected)
        }
    }

    #[test]
    fn test_receiver_is_reopened_after_disconnect() {
        let dir = tempfile::tempdir().unwrap();
        let log = GpsLog::create(dir.path(), &new_year()).unwrap();
        let opened = Arc::new(AtomicUsize::new(0));
        let counted = opened.clone();
        let source: GpsOpener = Arc::new(move || -> std::result::Result<Box<dyn FixSource>, GpsError> {
            counted.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(DropsOut) as Box<dyn FixSource>)
        });

        let task = spawn_gps_logger(log, source, Duration::from_millis(100));
        thread::sleep(Duration::from_millis(250));
        task.stop();
        let summary = task.join().unwrap();

        assert!(opened.load(Ordering::SeqCst) >= 2);
        assert_eq!(read_lines(&summary.path)[1], "GPS stream closed");
    }
}
