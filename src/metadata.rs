//! Acquisition metadata.
//!
//! Expected volume counts come from the imaging `_bold.json` sidecars
//! (`time.samples.AcquisitionNumber`, last element = total acquired
//! volumes). When a sidecar lacks the field, an optional scanning sheet is
//! the fallback. Everything learned about a subject is persisted to a single
//! `{sub}_volumes_all-ses-runs.json` consumed by the align step.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Source recording(s) behind one session. Most sessions are a single
/// acquisition file; interrupted sessions produce several.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum InFile {
    Single(String),
    Multiple(Vec<String>),
}

impl InFile {
    pub fn from_names(mut names: Vec<String>) -> Option<InFile> {
        match names.len() {
            0 => None,
            1 => Some(InFile::Single(names.remove(0))),
            _ => Some(InFile::Multiple(names)),
        }
    }

    pub fn names(&self) -> Vec<&str> {
        match self {
            InFile::Single(name) => vec![name.as_str()],
            InFile::Multiple(names) => names.iter().map(|n| n.as_str()).collect(),
        }
    }
}

/// One session's entry in the per-subject metadata file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionInfo {
    /// Expected volume count per run, keyed by zero-padded run index
    /// ("01", "02", ...). Runs with no resolvable metadata are absent.
    #[serde(flatten)]
    pub expected_volumes: BTreeMap<String, u32>,
    /// Number of imaging sidecars discovered. Defined whether or not they
    /// could all be read.
    pub expected_runs: usize,
    /// Number of sidecars successfully read.
    pub processed_runs: usize,
    /// Task label per run, in sidecar order.
    pub task: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_file: Option<InFile>,
    /// Volumes counted from the trigger channel, keyed "run-01", "run-02"...
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recorded_triggers: Option<BTreeMap<String, u32>>,
}

/// Sessions keyed by session label.
pub type SubjectInfo = BTreeMap<String, SessionInfo>;

/// "01", "02", ... for the flattened expected-volume keys.
pub fn run_index_key(idx: usize) -> String {
    format!("{:02}", idx + 1)
}

/// "run-01", "run-02", ... for recorded-trigger keys.
pub fn run_key(idx: usize) -> String {
    format!("run-{:02}", idx + 1)
}

/// Zero-based run index from a "run-NN" key. The metadata file is an
/// external interface, so its keys are parsed rather than assumed to be
/// contiguous from run-01.
pub fn run_index_from_key(key: &str) -> Option<usize> {
    let number: usize = key.strip_prefix("run-")?.parse().ok()?;
    number.checked_sub(1)
}

pub fn subject_info_path(dir: &Path, sub: &str) -> PathBuf {
    dir.join(sub)
        .join(format!("{}_volumes_all-ses-runs.json", sub))
}

pub fn load_subject_info(dir: &Path, sub: &str) -> Result<SubjectInfo> {
    let path = subject_info_path(dir, sub);
    let file = File::open(&path).map_err(|e| {
        Error::Other(format!("cannot read metadata {}: {}", path.display(), e))
    })?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

pub fn save_subject_info(dir: &Path, sub: &str, info: &SubjectInfo) -> Result<()> {
    let path = subject_info_path(dir, sub);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::create(&path)?;
    serde_json::to_writer_pretty(BufWriter::new(file), info)?;
    debug!("wrote {}", path.display());
    Ok(())
}

#[derive(Debug, Deserialize, Default)]
struct BoldSidecar {
    #[serde(default)]
    time: Option<SidecarTime>,
}

#[derive(Debug, Deserialize, Default)]
struct SidecarTime {
    #[serde(default)]
    samples: Option<SidecarSamples>,
}

#[derive(Debug, Deserialize, Default)]
struct SidecarSamples {
    #[serde(rename = "AcquisitionNumber", default)]
    acquisition_number: Option<Vec<u32>>,
}

/// Total acquired volumes from a `_bold.json` sidecar, or `None` when the
/// acquisition-number series is absent.
pub fn read_expected_volumes(path: &Path) -> Result<Option<u32>> {
    let file = File::open(path)?;
    let sidecar: BoldSidecar = serde_json::from_reader(BufReader::new(file))?;
    Ok(sidecar
        .time
        .and_then(|t| t.samples)
        .and_then(|s| s.acquisition_number)
        .and_then(|series| series.last().copied()))
}

/// Task label from a sidecar filename: the entities between `{ses}_` and the
/// final `_bold.json` suffix, e.g.
/// `sub-01_ses-003_task-friends-s01e02a_bold.json` → `task-friends-s01e02a`.
pub fn task_label(filename: &str, ses: &str) -> Option<String> {
    let marker = format!("{}_", ses);
    let start = filename.rfind(&marker)? + marker.len();
    let end = filename.rfind('_')?;
    if end <= start {
        return None;
    }
    Some(filename[start..end].to_string())
}

/// Fallback scanning sheet: one column per subject holding composite
/// `p{sub}_friends{ses}` keys, and a `#volumes` column.
#[derive(Debug)]
pub struct ScanningSheet {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl ScanningSheet {
    pub fn load(path: &Path) -> Result<ScanningSheet> {
        let mut reader = csv::Reader::from_path(path)?;
        let headers = reader.headers()?.iter().map(|h| h.to_string()).collect();
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            rows.push(record.iter().map(|f| f.to_string()).collect());
        }
        Ok(ScanningSheet { headers, rows })
    }

    /// Expected volumes for run `run_idx` of `sub`/`ses`: find the row whose
    /// subject-column value matches the session's composite key, then step
    /// `run_idx` rows down.
    pub fn fallback_volumes(&self, sub: &str, ses: &str, run_idx: usize) -> Option<u32> {
        let sub_col = self.headers.iter().position(|h| h == sub)?;
        let vol_col = self.headers.iter().position(|h| h == "#volumes")?;
        let key = format!(
            "p{}_friends{}",
            sub.strip_prefix("sub-").unwrap_or(sub),
            ses.strip_prefix("ses-").unwrap_or(ses)
        );

        let anchor = self
            .rows
            .iter()
            .position(|row| row.get(sub_col).map(|v| v == &key).unwrap_or(false))?;
        let row = self.rows.get(anchor + run_idx)?;
        let raw = row.get(vol_col)?;
        match raw.parse::<f64>() {
            Ok(v) if v >= 0.0 => Some(v.round() as u32),
            _ => {
                warn!("unparseable #volumes value '{}' in scanning sheet", raw);
                None
            }
        }
    }
}
