//! Per-subject batch pipelines.
//!
//! Three phases mirror the acquisition workflow: `count` builds the
//! per-subject metadata file from imaging sidecars and trigger counting,
//! `align` reconciles it against converted artifacts and mutates the
//! filesystem, `slice` cuts raw recordings into per-run signal files.
//!
//! Sessions are independent (no shared files, no shared mutable state), so
//! `count` fans out across them with rayon and accumulates results in a
//! DashMap before the final ordered collection. Session-scoped errors are
//! logged and skip only that session; nothing aborts the whole subject.

use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::listing::list_sub;
use crate::matcher::{align_session, AlignOutcome};
use crate::metadata::{
    self, run_index_key, run_key, InFile, ScanningSheet, SessionInfo, SubjectInfo,
};
use crate::recording::Recording;
use crate::reconcile::{reconcile_session, session_warnings};
use crate::segment::TriggerSegmenter;
use dashmap::DashMap;
use glob::glob;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

pub struct Engine {
    config: AppConfig,
}

/// What happened to one session during `align`.
#[derive(Debug)]
pub struct SessionSummary {
    pub session: String,
    pub warnings: Vec<String>,
    pub outcomes: Vec<AlignOutcome>,
    /// Reason the session was skipped wholesale, if it was.
    pub skipped: Option<String>,
}

impl Engine {
    pub fn new(config: AppConfig) -> Self {
        Engine { config }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Build the per-subject metadata file: expected volumes per run from
    /// imaging sidecars (scanning-sheet fallback), task labels, source
    /// recordings, and optionally the trigger counts recorded in the
    /// physiological files.
    pub fn count(
        &self,
        root: &Path,
        sub: &str,
        sessions: &[String],
        count_vol: bool,
        scanning_sheet: Option<&ScanningSheet>,
        save: Option<&Path>,
    ) -> Result<SubjectInfo> {
        let physio_root = root.join("sourcedata").join("physio");
        let ses_filter = single_session(sessions);
        let recordings = list_sub(&physio_root, sub, ses_filter, ".tsv.gz")?;

        let selected: Vec<&String> = recordings
            .keys()
            .filter(|ses| sessions.is_empty() || sessions.iter().any(|s| s == *ses))
            .collect();

        let results: DashMap<String, SessionInfo> = DashMap::new();
        selected.par_iter().for_each(|ses| {
            match self.count_session(
                root,
                &physio_root,
                sub,
                ses,
                &recordings[*ses],
                count_vol,
                scanning_sheet,
            ) {
                Ok(info) => {
                    results.insert((*ses).clone(), info);
                }
                Err(e) => {
                    error!("{} {}: skipping session: {}", sub, ses, e);
                }
            }
        });

        let mut info: SubjectInfo = BTreeMap::new();
        for (ses, session_info) in results {
            info.insert(ses, session_info);
        }

        if let Some(save) = save {
            metadata::save_subject_info(save, sub, &info)?;
        }
        Ok(info)
    }

    fn count_session(
        &self,
        root: &Path,
        physio_root: &Path,
        sub: &str,
        ses: &str,
        in_files: &[String],
        count_vol: bool,
        scanning_sheet: Option<&ScanningSheet>,
    ) -> Result<SessionInfo> {
        info!("{} {}: reading imaging metadata", sub, ses);
        let sidecars = bold_sidecars(root, sub, ses)?;

        let mut expected_volumes = BTreeMap::new();
        let mut tasks = Vec::with_capacity(sidecars.len());
        let mut processed_runs = 0usize;

        for (idx, sidecar) in sidecars.iter().enumerate() {
            let filename = sidecar
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if let Some(task) = metadata::task_label(&filename, ses) {
                tasks.push(task);
            }

            let volumes = match metadata::read_expected_volumes(sidecar) {
                Ok(Some(v)) => Some(v),
                Ok(None) => {
                    warn!(
                        "{} {}: no AcquisitionNumber in {}, checking scanning sheet",
                        sub, ses, filename
                    );
                    scanning_sheet.and_then(|sheet| sheet.fallback_volumes(sub, ses, idx))
                }
                Err(e) => {
                    warn!("{} {}: unreadable sidecar {}: {}", sub, ses, filename, e);
                    None
                }
            };
            if let Some(v) = volumes {
                expected_volumes.insert(run_index_key(idx), v);
                processed_runs += 1;
            }
        }

        let mut session_info = SessionInfo {
            expected_volumes,
            expected_runs: sidecars.len(),
            processed_runs,
            task: tasks,
            in_file: InFile::from_names(in_files.to_vec()),
            recorded_triggers: None,
        };
        session_warnings(&session_info, ses);

        if count_vol {
            match self.count_triggers(physio_root, sub, ses, in_files) {
                Ok(triggers) if !triggers.is_empty() => {
                    session_info.recorded_triggers = Some(triggers);
                }
                Ok(_) => {
                    warn!("{} {}: no runs counted in this session", sub, ses);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(session_info)
    }

    /// Recorded volumes per run across a session's recordings. With several
    /// recordings (interrupted acquisition), each contributes its runs in
    /// filename order and run numbering continues across files.
    fn count_triggers(
        &self,
        physio_root: &Path,
        sub: &str,
        ses: &str,
        in_files: &[String],
    ) -> Result<BTreeMap<String, u32>> {
        let segmenter = TriggerSegmenter::new(&self.config);
        let mut triggers = BTreeMap::new();
        let mut run_idx = 0usize;

        for file in in_files {
            let path = physio_root.join(sub).join(ses).join(file);
            let recording = Recording::open(&path)?;
            let trigger = recording.channel(&self.config.trigger_channel)?;
            // flat or truncated trigger channels are recoverable per file:
            // skip this recording, keep the runs counted so far
            let volumes = match segmenter.count_volumes(trigger, recording.sampling_rate) {
                Ok(v) => v,
                Err(e @ Error::EmptyTrigger { .. })
                | Err(e @ Error::InsufficientTriggerData { .. }) => {
                    warn!("{} {}: no runs counted in {}: {}", sub, ses, file, e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            info!(
                "{} {}: {} run(s) in {} ({} Hz)",
                sub,
                ses,
                volumes.len(),
                file,
                recording.sampling_rate
            );
            for count in volumes {
                triggers.insert(run_key(run_idx), count);
                run_idx += 1;
            }
        }
        Ok(triggers)
    }

    /// Reconcile the persisted metadata against converted artifacts and
    /// rename/delete them. Returns one summary per session, every skip and
    /// mismatch attributed.
    pub fn align(
        &self,
        scratch: &Path,
        sub: &str,
        sessions: &[String],
        scanning_sheet: Option<&ScanningSheet>,
    ) -> Result<Vec<SessionSummary>> {
        let info = metadata::load_subject_info(scratch, sub)?;

        let selected: Vec<(&String, &SessionInfo)> = info
            .iter()
            .filter(|(ses, _)| sessions.is_empty() || sessions.iter().any(|s| &s == ses))
            .collect();

        let mut summaries = Vec::with_capacity(selected.len());
        for (ses, session_info) in selected {
            summaries.push(self.align_one(scratch, sub, ses, session_info, scanning_sheet));
        }

        let skipped = summaries.iter().filter(|s| s.skipped.is_some()).count();
        info!(
            "{}: aligned {} session(s), {} skipped",
            sub,
            summaries.len() - skipped,
            skipped
        );
        Ok(summaries)
    }

    fn align_one(
        &self,
        scratch: &Path,
        sub: &str,
        ses: &str,
        session_info: &SessionInfo,
        scanning_sheet: Option<&ScanningSheet>,
    ) -> SessionSummary {
        let warnings = session_warnings(session_info, ses);

        if session_info.recorded_triggers.is_none() {
            return SessionSummary {
                session: ses.to_string(),
                warnings,
                outcomes: Vec::new(),
                skipped: Some("no recorded trigger information".to_string()),
            };
        }

        let results = reconcile_session(session_info, &self.config, sub, ses, scanning_sheet);
        let session_dir = scratch.join(sub).join(ses);
        match align_session(&session_dir, sub, ses, &session_info.task, &results) {
            Ok(outcomes) => SessionSummary {
                session: ses.to_string(),
                warnings,
                outcomes,
                skipped: None,
            },
            Err(e) => {
                error!("{} {}: {}", sub, ses, e);
                SessionSummary {
                    session: ses.to_string(),
                    warnings,
                    outcomes: Vec::new(),
                    skipped: Some(e.to_string()),
                }
            }
        }
    }

    /// Cut each raw recording into padded per-run slices plus the pre-scan
    /// block, written as gzipped TSVs next to a sampling-rate sidecar.
    pub fn slice(
        &self,
        root: &Path,
        sub: &str,
        session: Option<&str>,
        save: &Path,
    ) -> Result<()> {
        let recordings = list_sub(root, sub, session, ".tsv.gz")?;
        let segmenter = TriggerSegmenter::new(&self.config);

        for (ses, files) in &recordings {
            for file in files {
                let path = root.join(sub).join(ses).join(file);
                let recording = match Recording::open(&path) {
                    Ok(r) => r,
                    Err(e) => {
                        error!("{} {}: cannot read {}: {}", sub, ses, file, e);
                        continue;
                    }
                };
                let trigger = match recording.channel(&self.config.trigger_channel) {
                    Ok(t) => t,
                    Err(e) => {
                        error!("{} {}: {}", sub, ses, e);
                        continue;
                    }
                };
                let plan = match segmenter.slice_plan(trigger, recording.sampling_rate) {
                    Ok(plan) => plan,
                    Err(e) => {
                        warn!("{} {}: not sliceable: {}", sub, ses, e);
                        continue;
                    }
                };

                let out_dir = save.join(sub).join(ses);
                std::fs::create_dir_all(&out_dir)?;

                let pre_scan_name = format!("{}_{}_prep-before-scan.tsv.gz", sub, ses);
                self.write_slice_with_sidecar(
                    &recording,
                    &plan.pre_scan,
                    &out_dir.join(pre_scan_name),
                )?;

                for (idx, run) in plan.runs.iter().enumerate() {
                    let name = format!("{}_{}_task-run{:02}_physio.tsv.gz", sub, ses, idx + 1);
                    self.write_slice_with_sidecar(&recording, run, &out_dir.join(name))?;
                }
                info!(
                    "{} {}: wrote {} run slice(s) from {}",
                    sub,
                    ses,
                    plan.runs.len(),
                    file
                );
            }
        }
        Ok(())
    }

    fn write_slice_with_sidecar(
        &self,
        recording: &Recording,
        segment: &crate::segment::RunSegment,
        path: &Path,
    ) -> Result<()> {
        recording.write_slice(segment, path)?;
        let sidecar = path
            .to_string_lossy()
            .trim_end_matches(".tsv.gz")
            .to_string()
            + ".json";
        let body = serde_json::json!({
            "SamplingFrequency": recording.sampling_rate,
            "Columns": recording.channel_names,
        });
        std::fs::write(PathBuf::from(sidecar), serde_json::to_vec_pretty(&body)?)?;
        Ok(())
    }
}

/// `list_sub` takes at most one explicit session; more than one is handled
/// by filtering afterwards.
fn single_session(sessions: &[String]) -> Option<&str> {
    match sessions {
        [one] => Some(one.as_str()),
        _ => None,
    }
}

/// Sorted `*_bold.json` sidecars for one session's functional scans.
fn bold_sidecars(root: &Path, sub: &str, ses: &str) -> Result<Vec<PathBuf>> {
    let pattern = root.join(sub).join(ses).join("func").join("*_bold.json");
    let pattern = pattern
        .to_str()
        .ok_or_else(|| Error::Other(format!("non-UTF8 path under {}", root.display())))?;
    let mut paths: Vec<PathBuf> = glob(pattern)
        .map_err(|e| Error::Other(format!("bad glob pattern '{}': {}", pattern, e)))?
        .filter_map(|p| p.ok())
        .collect();
    paths.sort();
    Ok(paths)
}
