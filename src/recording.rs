//! Recording I/O.
//!
//! Recordings are tab-separated tables with one named column per channel,
//! optionally gzip-compressed, with a JSON sidecar carrying the sampling
//! rate (`SamplingFrequency`). A `Recording` is immutable once loaded.

use crate::error::{Error, Result};
use crate::segment::RunSegment;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Deserialize;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug)]
pub struct Recording {
    pub sampling_rate: f64,
    pub channel_names: Vec<String>,
    /// One column per channel, all of equal length.
    pub channels: Vec<Vec<f64>>,
}

#[derive(Debug, Deserialize)]
struct RecordingSidecar {
    #[serde(rename = "SamplingFrequency")]
    sampling_frequency: f64,
}

impl Recording {
    /// Load a `.tsv` / `.tsv.gz` recording and its `.json` sidecar.
    pub fn open(path: &Path) -> Result<Recording> {
        let sidecar_path = sidecar_for(path);
        let sidecar_file = File::open(&sidecar_path).map_err(|e| {
            Error::Other(format!(
                "cannot read sampling-rate sidecar {}: {}",
                sidecar_path.display(),
                e
            ))
        })?;
        let sidecar: RecordingSidecar = serde_json::from_reader(BufReader::new(sidecar_file))?;
        if sidecar.sampling_frequency <= 0.0 {
            return Err(Error::InvalidSamplingRate(sidecar.sampling_frequency));
        }

        let file = File::open(path)?;
        let reader: Box<dyn Read> = if is_gzipped(path) {
            Box::new(GzDecoder::new(file))
        } else {
            Box::new(file)
        };
        let mut csv_reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(true)
            .from_reader(BufReader::new(reader));

        let channel_names: Vec<String> = csv_reader
            .headers()?
            .iter()
            .map(|h| h.to_string())
            .collect();
        let mut channels: Vec<Vec<f64>> = vec![Vec::new(); channel_names.len()];

        for record in csv_reader.records() {
            let record = record?;
            for (i, field) in record.iter().enumerate().take(channels.len()) {
                let value: f64 = field.parse().map_err(|_| {
                    Error::Other(format!(
                        "non-numeric sample '{}' in {}",
                        field,
                        path.display()
                    ))
                })?;
                channels[i].push(value);
            }
        }

        debug!(
            "loaded {} ({} channels, {} samples at {} Hz)",
            path.display(),
            channel_names.len(),
            channels.first().map(|c| c.len()).unwrap_or(0),
            sidecar.sampling_frequency,
        );

        Ok(Recording {
            sampling_rate: sidecar.sampling_frequency,
            channel_names,
            channels,
        })
    }

    pub fn len(&self) -> usize {
        self.channels.first().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn channel(&self, name: &str) -> Result<&[f64]> {
        self.channel_names
            .iter()
            .position(|n| n == name)
            .map(|i| self.channels[i].as_slice())
            .ok_or_else(|| Error::MissingChannel(name.to_string()))
    }

    /// Write one segment of all channels as a gzipped TSV.
    pub fn write_slice(&self, segment: &RunSegment, path: &Path) -> Result<()> {
        let end = segment.end.min(self.len());
        let file = File::create(path)?;
        let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_writer(encoder);

        writer.write_record(&self.channel_names)?;
        for row in segment.start..end {
            let record: Vec<String> = self
                .channels
                .iter()
                .map(|c| c[row].to_string())
                .collect();
            writer.write_record(&record)?;
        }
        writer.flush()?;
        let encoder = writer
            .into_inner()
            .map_err(|e| Error::Other(format!("flush failed for {}: {}", path.display(), e)))?;
        encoder.finish()?;
        Ok(())
    }
}

fn is_gzipped(path: &Path) -> bool {
    path.extension().map(|e| e == "gz").unwrap_or(false)
}

/// `rec.tsv` → `rec.json`, `rec.tsv.gz` → `rec.json`.
fn sidecar_for(path: &Path) -> PathBuf {
    let mut stem = path.to_path_buf();
    stem.set_extension("");
    if stem.extension().map(|e| e == "tsv").unwrap_or(false) {
        stem.set_extension("");
    }
    let mut sidecar = stem.into_os_string();
    sidecar.push(".json");
    PathBuf::from(sidecar)
}
