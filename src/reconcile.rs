//! Recorded-vs-expected volume reconciliation.
//!
//! Reconciliation is a pure per-run computation: every run gets an immutable
//! [`ReconciliationResult`] and session-level aggregation happens only after
//! all runs are decided. Nothing here touches the filesystem.

use crate::config::AppConfig;
use crate::metadata::{run_index_from_key, run_index_key, ScanningSheet, SessionInfo};
use serde::Serialize;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Validity {
    /// Recorded count equals expected count; artifacts may be renamed.
    Valid,
    /// Counts disagree but the run is long enough to keep; artifacts stay
    /// untouched and the discrepancy is reported.
    Mismatch,
    /// Too few recorded volumes; artifacts are deleted.
    Invalid,
    /// No expected count could be resolved; the run is skipped.
    Unresolved,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationResult {
    /// Zero-based run index within the session.
    pub run_idx: usize,
    pub recorded: u32,
    pub expected: Option<u32>,
    pub validity: Validity,
}

impl ReconciliationResult {
    pub fn matches(&self) -> bool {
        self.validity == Validity::Valid
    }
}

/// Decide one run. Metadata absence is checked before the length cutoff so a
/// short run with no corroborating expectation is skipped, not deleted.
pub fn reconcile_run(
    run_idx: usize,
    recorded: u32,
    expected: Option<u32>,
    min_valid_volumes: u32,
) -> ReconciliationResult {
    let validity = match expected {
        None => Validity::Unresolved,
        Some(_) if recorded < min_valid_volumes => Validity::Invalid,
        Some(expected) if recorded == expected => Validity::Valid,
        Some(_) => Validity::Mismatch,
    };
    ReconciliationResult {
        run_idx,
        recorded,
        expected,
        validity,
    }
}

/// Reconcile every run of a session that has a recorded trigger count.
///
/// Expected counts come from the session's persisted metadata; when a run's
/// entry is missing, the scanning sheet (if supplied) is consulted before
/// marking the run `Unresolved`.
pub fn reconcile_session(
    info: &SessionInfo,
    config: &AppConfig,
    sub: &str,
    ses: &str,
    sheet: Option<&ScanningSheet>,
) -> Vec<ReconciliationResult> {
    let recorded = match &info.recorded_triggers {
        Some(recorded) => recorded,
        None => return Vec::new(),
    };

    let mut results = Vec::with_capacity(recorded.len());
    // BTreeMap keeps "run-01" < "run-02" < ... so results stay ordered.
    // The run index comes from the key itself, never from map position:
    // recorded_triggers is external input and its keys may have gaps.
    for (key, &count) in recorded.iter() {
        let run_idx = match run_index_from_key(key) {
            Some(idx) => idx,
            None => {
                warn!("{} {}: unrecognized recorded-trigger key '{}', skipping", sub, ses, key);
                continue;
            }
        };
        let expected = info
            .expected_volumes
            .get(&run_index_key(run_idx))
            .copied()
            .or_else(|| {
                let fallback = sheet.and_then(|s| s.fallback_volumes(sub, ses, run_idx));
                if fallback.is_some() {
                    debug!("{} {} {}: expected volumes from scanning sheet", sub, ses, key);
                }
                fallback
            });
        results.push(reconcile_run(run_idx, count, expected, config.min_valid_volumes));
    }
    results
}

/// Non-fatal sanity checks on a session's metadata. Each returned string is
/// one attributable inconsistency; processing continues regardless.
pub fn session_warnings(info: &SessionInfo, ses: &str) -> Vec<String> {
    let mut warnings = Vec::new();
    if info.expected_runs != info.processed_runs {
        warnings.push(format!(
            "{}: expected {} runs but processed {} from imaging metadata",
            ses, info.expected_runs, info.processed_runs
        ));
    }
    if info.task.len() != info.expected_runs {
        warnings.push(format!(
            "{}: {} task labels for {} expected runs",
            ses,
            info.task.len(),
            info.expected_runs
        ));
    }
    for w in &warnings {
        warn!("{}", w);
    }
    warnings
}
