use crate::error::{CaptureError, Result};

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

type ChannelWriter = WavWriter<BufWriter<File>>;

/// Outcome of a split: every channel is attempted, failures are collected.
#[derive(Debug, Default)]
pub struct SplitReport {
    pub written: Vec<PathBuf>,
    pub failed: Vec<(u16, String)>,
    /// Set when the source ended early; channel files hold what was read.
    pub truncated: Option<String>,
}

impl SplitReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.truncated.is_none()
    }
}

/// `<stem>-ch-<N>.wav` next to the source file, channels numbered from 1.
pub fn channel_path(source: &Path, channel: u16) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    source.with_file_name(format!("{}-ch-{}.wav", stem, channel))
}

/// Writes one mono file per channel of an interleaved integer PCM WAV.
pub fn split_channels(source: &Path) -> Result<SplitReport> {
    tracing::info!("Splitting written mic channels: {:?}", source);

    let mut reader = WavReader::open(source)?;
    let spec = reader.spec();
    if spec.sample_format != SampleFormat::Int {
        return Err(CaptureError::UnsupportedWav {
            path: source.to_path_buf(),
            reason: "float samples".into(),
        });
    }
    if spec.channels == 0 {
        return Err(CaptureError::UnsupportedWav {
            path: source.to_path_buf(),
            reason: "no channels".into(),
        });
    }

    let mono = WavSpec {
        channels: 1,
        ..spec
    };

    let mut report = SplitReport::default();
    let mut writers: Vec<Option<(PathBuf, ChannelWriter)>> = (1..=spec.channels)
        .map(|channel| {
            let path = channel_path(source, channel);
            match WavWriter::create(&path, mono) {
                Ok(writer) => Some((path, writer)),
                Err(e) => {
                    report.failed.push((channel, e.to_string()));
                    None
                }
            }
        })
        .collect();

    let channels = spec.channels as usize;
    for (index, sample) in reader.samples::<i32>().enumerate() {
        let sample = match sample {
            Ok(s) => s,
            Err(e) => {
                report.truncated = Some(e.to_string());
                break;
            }
        };
        let slot = &mut writers[index % channels];
        if let Some((_, writer)) = slot {
            if let Err(e) = writer.write_sample(sample) {
                report.failed.push(((index % channels) as u16 + 1, e.to_string()));
                *slot = None;
            }
        }
    }

    for (channel, slot) in (1u16..).zip(writers) {
        if let Some((path, writer)) = slot {
            match writer.finalize() {
                Ok(()) => report.written.push(path),
                Err(e) => report.failed.push((channel, e.to_string())),
            }
        }
    }
    report.failed.sort_by_key(|(channel, _)| *channel);

    tracing::info!(
        "Split {} of {} channels from {:?}",
        report.written.len(),
        spec.channels,
        source
    );
    Ok(report)
}
