//! GPS fix source: NMEA `RMC` sentences read from the L80 module's UART.

use std::fmt;
use std::io::{BufRead, BufReader};
use std::sync::Arc;
use std::time::Duration;

use serialport::SerialPort;
use thiserror::Error;

// Serial Configuration
pub const DEFAULT_PORT: &str = "/dev/ttyAMA0";
pub const DEFAULT_BAUD: u32 = 9600;
const SERIAL_TIMEOUT: Duration = Duration::from_secs(1);

// The L80 emits GGA/GSA/GSV/VTG/RMC bursts at 1 Hz; one burst is well under this.
const MAX_LINES_PER_FIX: usize = 32;

#[derive(Debug, Error)]
pub enum GpsError {
    #[error("GPS read failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("GPS port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("GPS stream closed")]
    Disconnected,

    #[error("No RMC sentence within {0} lines")]
    NoSentence(usize),

    #[error("NMEA checksum mismatch: expected {expected:02X} got {computed:02X}")]
    Checksum { expected: u8, computed: u8 },

    #[error("Malformed RMC sentence: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    Valid,
    Void,
}

impl fmt::Display for Validity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Validity::Valid => write!(f, "A"),
            Validity::Void => write!(f, "V"),
        }
    }
}

/// One GPS reading. Date and UTC are kept exactly as the receiver sent them.
#[derive(Debug, Clone, PartialEq)]
pub struct Fix {
    pub date: String,
    pub utc: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub data_valid: Validity,
}

/// Blocking source of GPS fixes.
pub trait FixSource: Send {
    fn read_fix(&mut self) -> Result<Fix, GpsError>;
}

/// Opens a fresh source; called from the logging thread, again after a failure.
pub type GpsOpener = Arc<dyn Fn() -> Result<Box<dyn FixSource>, GpsError> + Send + Sync>;

/// Reads fixes from a line-oriented NMEA stream.
pub struct NmeaReceiver<R> {
    reader: R,
    line: Vec<u8>,
}

impl<R: BufRead> NmeaReceiver<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: Vec::with_capacity(96),
        }
    }
}

impl<R: BufRead + Send> FixSource for NmeaReceiver<R> {
    fn read_fix(&mut self) -> Result<Fix, GpsError> {
        for _ in 0..MAX_LINES_PER_FIX {
            self.line.clear();
            if self.reader.read_until(b'\n', &mut self.line)? == 0 {
                return Err(GpsError::Disconnected);
            }
            let line = String::from_utf8_lossy(&self.line);
            let sentence = line.trim();
            if is_rmc(sentence) {
                return parse_rmc(sentence);
            }
        }
        Err(GpsError::NoSentence(MAX_LINES_PER_FIX))
    }
}

pub type SerialReceiver = NmeaReceiver<BufReader<Box<dyn SerialPort>>>;

pub fn open_serial(path: &str, baud: u32) -> Result<SerialReceiver, GpsError> {
    let port = serialport::new(path, baud)
        .timeout(SERIAL_TIMEOUT)
        .open()?;
    tracing::debug!("Opened GPS port {} at {} baud", path, baud);
    Ok(NmeaReceiver::new(BufReader::new(port)))
}

fn is_rmc(sentence: &str) -> bool {
    // $GPRMC, $GNRMC, ...
    sentence.len() > 7 && sentence.starts_with('$') && sentence.get(3..7) == Some("RMC,")
}

pub fn parse_rmc(sentence: &str) -> Result<Fix, GpsError> {
    let body = sentence
        .strip_prefix('$')
        .ok_or_else(|| GpsError::Malformed(sentence.to_string()))?;
    let (payload, checksum) = body
        .split_once('*')
        .ok_or_else(|| GpsError::Malformed(sentence.to_string()))?;

    let expected = u8::from_str_radix(checksum.trim(), 16)
        .map_err(|_| GpsError::Malformed(sentence.to_string()))?;
    let computed = payload.bytes().fold(0u8, |acc, b| acc ^ b);
    if expected != computed {
        return Err(GpsError::Checksum { expected, computed });
    }

    let fields: Vec<&str> = payload.split(',').collect();
    if fields.len() < 10 {
        return Err(GpsError::Malformed(sentence.to_string()));
    }

    let data_valid = match fields[2] {
        "A" => Validity::Valid,
        "V" => Validity::Void,
        other => return Err(GpsError::Malformed(format!("status '{}'", other))),
    };

    Ok(Fix {
        date: fields[9].to_string(),
        utc: fields[1].to_string(),
        latitude: parse_coordinate(fields[3], fields[4], 2)?,
        longitude: parse_coordinate(fields[5], fields[6], 3)?,
        data_valid,
    })
}

/// `ddmm.mmmm` / `dddmm.mmmm` plus hemisphere into signed decimal degrees.
fn parse_coordinate(value: &str, hemisphere: &str, degree_digits: usize) -> Result<Option<f64>, GpsError> {
    if value.is_empty() {
        return Ok(None);
    }
    let malformed = || GpsError::Malformed(format!("coordinate '{}{}'", value, hemisphere));

    if value.len() <= degree_digits || !value.is_char_boundary(degree_digits) {
        return Err(malformed());
    }
    let (deg, min) = value.split_at(degree_digits);
    let deg: f64 = deg.parse().map_err(|_| malformed())?;
    let min: f64 = min.parse().map_err(|_| malformed())?;
    let decimal = deg + min / 60.0;

    match hemisphere {
        "N" | "E" => Ok(Some(decimal)),
        "S" | "W" => Ok(Some(-decimal)),
        _ => Err(malformed()),
    }
}
