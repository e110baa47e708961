//! Per-subject session discovery.
//!
//! A subject directory holds one sub-directory per session; each session
//! holds the raw recordings. Listing returns one entry per session with the
//! filenames of the requested extension, stably sorted.

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::warn;

/// List a subject's files per session, filtered by filename suffix.
///
/// When `ses` is given only that session is returned, and a missing session
/// directory is an error. Otherwise every session directory under the
/// subject is listed; stray files at the subject level (e.g. the metadata
/// JSON) are skipped.
pub fn list_sub(
    root: &Path,
    sub: &str,
    ses: Option<&str>,
    extension: &str,
) -> Result<BTreeMap<String, Vec<String>>> {
    let sub_dir = root.join(sub);
    if !sub_dir.is_dir() {
        return Err(Error::MissingDirectory(sub_dir));
    }

    let mut sessions = BTreeMap::new();

    if let Some(ses) = ses {
        let ses_dir = sub_dir.join(ses);
        if !ses_dir.is_dir() {
            return Err(Error::MissingDirectory(ses_dir));
        }
        sessions.insert(ses.to_string(), files_with_suffix(&ses_dir, extension)?);
        return Ok(sessions);
    }

    for entry in fs::read_dir(&sub_dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        match files_with_suffix(&path, extension) {
            Ok(files) => {
                sessions.insert(name, files);
            }
            Err(e) => {
                warn!("skipping session directory {}: {}", path.display(), e);
            }
        }
    }

    Ok(sessions)
}

fn files_with_suffix(dir: &Path, suffix: &str) -> Result<Vec<String>> {
    let mut files: Vec<String> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_file())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(suffix))
        .collect();
    files.sort();
    Ok(files)
}
