//! Artifact alignment.
//!
//! The external conversion step leaves four files per run: the signal table
//! (`.tsv.gz`), its JSON sidecar, a conversion log and a preview image. Each
//! carries a `run-NN` entity in its filename. Artifacts are joined to
//! reconciled runs by that key, never by list position, so files that carry
//! no run key (already-renamed outputs, stray JSON) simply do not
//! participate and re-running the matcher is a no-op.
//!
//! Planned renames/deletes are journaled to a per-session manifest before
//! being applied and the manifest is removed afterwards, so an interrupted
//! session leaves an inspectable record instead of a half-renamed tree.

use crate::error::{Error, Result};
use crate::reconcile::{ReconciliationResult, Validity};
use glob::glob;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

pub const MANIFEST_NAME: &str = ".physioseg-manifest.json";

/// The four files sharing one run's identity. Any of them may be missing;
/// actions apply to whatever is present.
#[derive(Debug, Default, Clone)]
pub struct ArtifactSet {
    pub table: Option<PathBuf>,
    pub sidecar: Option<PathBuf>,
    pub log: Option<PathBuf>,
    pub preview: Option<PathBuf>,
}

impl ArtifactSet {
    /// Present files with their canonical renamed suffix.
    fn files(&self) -> Vec<(&PathBuf, &'static str)> {
        let mut out = Vec::new();
        if let Some(p) = &self.table {
            out.push((p, "physio.tsv.gz"));
        }
        if let Some(p) = &self.sidecar {
            out.push((p, "physio.json"));
        }
        if let Some(p) = &self.log {
            out.push((p, "physio.log"));
        }
        if let Some(p) = &self.preview {
            out.push((p, "physio.png"));
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.files().is_empty()
    }
}

/// Extract and normalize the `run-NN` entity from a filename.
pub fn parse_run_key(filename: &str) -> Option<String> {
    let pos = filename.find("run-")?;
    let digits: String = filename[pos + 4..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    let number: usize = digits.parse().ok()?;
    Some(format!("run-{:02}", number))
}

/// Discover a session's artifact sets, keyed by run.
///
/// Tables and sidecars live in the session directory, conversion logs and
/// previews under `code/conversion/`. Each list is globbed independently
/// (alphabetical order) and joined by parsed run key.
pub fn collect_artifacts(session_dir: &Path) -> Result<BTreeMap<String, ArtifactSet>> {
    let mut sets: BTreeMap<String, ArtifactSet> = BTreeMap::new();

    let kinds: [(&str, fn(&mut ArtifactSet, PathBuf)); 4] = [
        ("*.tsv.gz", |s, p| s.table = Some(p)),
        ("*.json", |s, p| s.sidecar = Some(p)),
        ("code/conversion/*.log", |s, p| s.log = Some(p)),
        ("code/conversion/*.png", |s, p| s.preview = Some(p)),
    ];

    for (pattern, assign) in kinds {
        let full_pattern = session_dir.join(pattern);
        let full_pattern = full_pattern
            .to_str()
            .ok_or_else(|| Error::Other(format!("non-UTF8 path {}", session_dir.display())))?;
        let paths = glob(full_pattern)
            .map_err(|e| Error::Other(format!("bad glob pattern '{}': {}", full_pattern, e)))?;
        for path in paths.filter_map(|p| p.ok()) {
            let name = match path.file_name() {
                Some(name) => name.to_string_lossy().into_owned(),
                None => continue,
            };
            if let Some(key) = parse_run_key(&name) {
                assign(sets.entry(key).or_default(), path);
            }
        }
    }

    Ok(sets)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum PlannedAction {
    Rename { from: PathBuf, to: PathBuf },
    Delete { path: PathBuf },
}

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    created_at: String,
    actions: Vec<PlannedAction>,
}

/// How one run's artifacts were handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Disposition {
    Renamed,
    Deleted,
    MismatchKept,
    UnresolvedSkipped,
    NoArtifacts,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlignOutcome {
    pub run: String,
    pub disposition: Disposition,
    pub detail: String,
}

/// Apply reconciliation decisions to a session's artifacts.
///
/// Valid runs are renamed to `{sub}_{ses}_{task}_physio.{ext}` using the
/// run's task label, Invalid runs are deleted, mismatched and unresolved
/// runs are left untouched. A failure on one artifact set never blocks the
/// remaining runs.
pub fn align_session(
    session_dir: &Path,
    sub: &str,
    ses: &str,
    tasks: &[String],
    results: &[ReconciliationResult],
) -> Result<Vec<AlignOutcome>> {
    if !session_dir.is_dir() {
        return Err(Error::MissingDirectory(session_dir.to_path_buf()));
    }

    let manifest_path = session_dir.join(MANIFEST_NAME);
    if manifest_path.exists() {
        warn!(
            "leftover manifest {} from an interrupted session; re-planning",
            manifest_path.display()
        );
    }

    let artifacts = collect_artifacts(session_dir)?;
    let mut outcomes = Vec::with_capacity(results.len());
    let mut actions: Vec<(usize, Vec<PlannedAction>)> = Vec::new();

    for result in results {
        let key = crate::metadata::run_key(result.run_idx);
        let set = match artifacts.get(&key) {
            Some(set) if !set.is_empty() => set,
            _ => {
                outcomes.push(AlignOutcome {
                    run: key,
                    disposition: Disposition::NoArtifacts,
                    detail: "no artifact files joined this run".to_string(),
                });
                continue;
            }
        };

        match result.validity {
            Validity::Valid => {
                let task = match tasks.get(result.run_idx) {
                    Some(task) => task,
                    None => {
                        outcomes.push(AlignOutcome {
                            run: key,
                            disposition: Disposition::Failed,
                            detail: "no task label for this run index".to_string(),
                        });
                        continue;
                    }
                };
                let planned = set
                    .files()
                    .iter()
                    .map(|(path, suffix)| PlannedAction::Rename {
                        from: (*path).clone(),
                        to: renamed_target(path, sub, ses, task, suffix),
                    })
                    .collect();
                actions.push((outcomes.len(), planned));
                outcomes.push(AlignOutcome {
                    run: key,
                    disposition: Disposition::Renamed,
                    detail: format!("renamed to {}_{}_{}_physio.*", sub, ses, task),
                });
            }
            Validity::Invalid => {
                let planned = set
                    .files()
                    .iter()
                    .map(|(path, _)| PlannedAction::Delete {
                        path: (*path).clone(),
                    })
                    .collect();
                actions.push((outcomes.len(), planned));
                outcomes.push(AlignOutcome {
                    run: key,
                    disposition: Disposition::Deleted,
                    detail: format!(
                        "{} recorded volumes below validity cutoff",
                        result.recorded
                    ),
                });
            }
            Validity::Mismatch => {
                outcomes.push(AlignOutcome {
                    run: key,
                    disposition: Disposition::MismatchKept,
                    detail: format!(
                        "recorded {} != expected {}; artifacts kept",
                        result.recorded,
                        result.expected.unwrap_or(0)
                    ),
                });
            }
            Validity::Unresolved => {
                outcomes.push(AlignOutcome {
                    run: key,
                    disposition: Disposition::UnresolvedSkipped,
                    detail: "no expected volume count could be resolved".to_string(),
                });
            }
        }
    }

    if actions.is_empty() {
        debug!("{} {}: nothing to rename or delete", sub, ses);
        return Ok(outcomes);
    }

    let manifest = Manifest {
        created_at: chrono::Utc::now().to_rfc3339(),
        actions: actions.iter().flat_map(|(_, a)| a.clone()).collect(),
    };
    fs::write(&manifest_path, serde_json::to_vec_pretty(&manifest)?)?;

    for (outcome_idx, planned) in &actions {
        if let Err(e) = apply_actions(planned) {
            error!(
                "{} {} {}: {}",
                sub, ses, outcomes[*outcome_idx].run, e
            );
            let outcome = &mut outcomes[*outcome_idx];
            outcome.disposition = Disposition::Failed;
            outcome.detail = e.to_string();
        }
    }

    fs::remove_file(&manifest_path)?;

    let renamed = outcomes
        .iter()
        .filter(|o| o.disposition == Disposition::Renamed)
        .count();
    let deleted = outcomes
        .iter()
        .filter(|o| o.disposition == Disposition::Deleted)
        .count();
    info!("{} {}: {} run(s) renamed, {} deleted", sub, ses, renamed, deleted);

    Ok(outcomes)
}

fn apply_actions(actions: &[PlannedAction]) -> Result<()> {
    for action in actions {
        match action {
            PlannedAction::Rename { from, to } => {
                fs::rename(from, to).map_err(|e| {
                    Error::Other(format!(
                        "rename {} -> {}: {}",
                        from.display(),
                        to.display(),
                        e
                    ))
                })?;
                debug!("renamed {} -> {}", from.display(), to.display());
            }
            PlannedAction::Delete { path } => {
                fs::remove_file(path).map_err(|e| {
                    Error::Other(format!("delete {}: {}", path.display(), e))
                })?;
                debug!("deleted {}", path.display());
            }
        }
    }
    Ok(())
}

/// Renamed file next to the original: `{sub}_{ses}_{task}_physio.{ext}`.
fn renamed_target(original: &Path, sub: &str, ses: &str, task: &str, suffix: &str) -> PathBuf {
    let parent = original.parent().unwrap_or_else(|| Path::new("."));
    parent.join(format!("{}_{}_{}_{}", sub, ses, task, suffix))
}
