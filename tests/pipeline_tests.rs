use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::tempdir;

use physioseg::metadata::{self, InFile, ScanningSheet};
use physioseg::{AppConfig, Engine};

/// Write a single-channel TTL recording as `.tsv.gz` + sampling-rate sidecar.
///
/// `bursts` are (start, end, step) in samples; every listed sample is an
/// active (5.0) trigger, everything else idles at 0.
fn write_recording(dir: &Path, stem: &str, n_samples: usize, fs: f64, bursts: &[(usize, usize, usize)]) {
    let mut signal = vec![0.0f64; n_samples];
    for &(start, end, step) in bursts {
        let mut i = start;
        while i <= end {
            signal[i] = 5.0;
            i += step;
        }
        signal[end] = 5.0;
    }

    let file = fs::File::create(dir.join(format!("{}.tsv.gz", stem))).unwrap();
    let mut encoder = GzEncoder::new(file, Compression::default());
    writeln!(encoder, "TTL").unwrap();
    for v in &signal {
        writeln!(encoder, "{}", v).unwrap();
    }
    encoder.finish().unwrap();

    fs::write(
        dir.join(format!("{}.json", stem)),
        format!(r#"{{"SamplingFrequency": {}}}"#, fs),
    )
    .unwrap();
}

fn write_sidecar(dir: &Path, name: &str, volumes: Option<u32>) {
    let body = match volumes {
        Some(v) => format!(
            r#"{{"time": {{"samples": {{"AcquisitionNumber": [1, 2, {}]}}}}}}"#,
            v
        ),
        None => r#"{"RepetitionTime": 1.49}"#.to_string(),
    };
    fs::write(dir.join(name), body).unwrap();
}

/// Dataset with one subject/session: two trigger bursts (39 and 41 volumes
/// at 100 Hz) and two functional sidecars, the second missing its
/// acquisition numbers.
fn create_count_tree(root: &Path) {
    let physio = root.join("sourcedata/physio/sub-01/ses-001");
    fs::create_dir_all(&physio).unwrap();
    // burst 1: 300..6000 → 57 s → round(57/1.49)+1 = 39 volumes
    // burst 2: 7000..12960 → 59.6 s → round(40)+1 = 41 volumes
    write_recording(
        &physio,
        "sub-01_ses-001_physio",
        13_000,
        100.0,
        &[(300, 6_000, 100), (7_000, 12_960, 40)],
    );

    let func = root.join("sub-01/ses-001/func");
    fs::create_dir_all(&func).unwrap();
    write_sidecar(&func, "sub-01_ses-001_task-friends-a_bold.json", Some(39));
    write_sidecar(&func, "sub-01_ses-001_task-friends-b_bold.json", None);
}

#[test]
fn count_builds_subject_metadata() {
    let tmp = tempdir().unwrap();
    let root = tmp.path();
    create_count_tree(root);

    let engine = Engine::new(AppConfig::default());
    let info = engine
        .count(root, "sub-01", &[], true, None, Some(root))
        .unwrap();

    let ses = &info["ses-001"];
    assert_eq!(ses.expected_runs, 2);
    // second sidecar has no AcquisitionNumber and no sheet to fall back on
    assert_eq!(ses.processed_runs, 1);
    assert_eq!(
        ses.task,
        vec!["task-friends-a".to_string(), "task-friends-b".to_string()]
    );
    assert_eq!(
        ses.in_file,
        Some(InFile::Single("sub-01_ses-001_physio.tsv.gz".to_string()))
    );
    assert_eq!(ses.expected_volumes.get("01"), Some(&39));
    assert_eq!(ses.expected_volumes.get("02"), None);

    let triggers = ses.recorded_triggers.as_ref().unwrap();
    assert_eq!(triggers["run-01"], 39);
    assert_eq!(triggers["run-02"], 41);

    // persisted and reloadable
    let reloaded = metadata::load_subject_info(root, "sub-01").unwrap();
    assert_eq!(reloaded["ses-001"].expected_volumes.get("01"), Some(&39));
}

#[test]
fn count_uses_scanning_sheet_fallback() {
    let tmp = tempdir().unwrap();
    let root = tmp.path();
    create_count_tree(root);

    let sheet_path = root.join("sheet.csv");
    let mut f = fs::File::create(&sheet_path).unwrap();
    writeln!(f, "sub-01,#volumes").unwrap();
    writeln!(f, "p01_friends001,39").unwrap();
    writeln!(f, ",41").unwrap();
    let sheet = ScanningSheet::load(&sheet_path).unwrap();

    let engine = Engine::new(AppConfig::default());
    let info = engine
        .count(root, "sub-01", &[], false, Some(&sheet), None)
        .unwrap();

    let ses = &info["ses-001"];
    assert_eq!(ses.processed_runs, 2);
    assert_eq!(ses.expected_volumes.get("02"), Some(&41));
}

#[test]
fn count_survives_a_triggerless_session() {
    let tmp = tempdir().unwrap();
    let root = tmp.path();
    create_count_tree(root);

    // a second session whose recording never goes active
    let physio = root.join("sourcedata/physio/sub-01/ses-002");
    fs::create_dir_all(&physio).unwrap();
    write_recording(&physio, "sub-01_ses-002_physio", 1_000, 100.0, &[]);
    let func = root.join("sub-01/ses-002/func");
    fs::create_dir_all(&func).unwrap();
    write_sidecar(&func, "sub-01_ses-002_task-rest_bold.json", Some(200));

    let engine = Engine::new(AppConfig::default());
    let info = engine
        .count(root, "sub-01", &[], true, None, None)
        .unwrap();

    // both sessions present; the triggerless one keeps its imaging metadata
    assert_eq!(info.len(), 2);
    assert!(info["ses-001"].recorded_triggers.is_some());
    assert!(info["ses-002"].recorded_triggers.is_none());
    assert_eq!(info["ses-002"].expected_volumes.get("01"), Some(&200));
}

#[test]
fn count_keeps_runs_from_earlier_recordings_when_one_is_flat() {
    let tmp = tempdir().unwrap();
    let root = tmp.path();
    let physio = root.join("sourcedata/physio/sub-01/ses-001");
    fs::create_dir_all(&physio).unwrap();
    // interrupted acquisition: a real burst in the first file, then a
    // recording whose trigger channel never goes active
    write_recording(
        &physio,
        "sub-01_ses-001_part-01_physio",
        7_000,
        100.0,
        &[(300, 6_000, 100)],
    );
    write_recording(&physio, "sub-01_ses-001_part-02_physio", 1_000, 100.0, &[]);
    let func = root.join("sub-01/ses-001/func");
    fs::create_dir_all(&func).unwrap();
    write_sidecar(&func, "sub-01_ses-001_task-friends-a_bold.json", Some(39));

    let engine = Engine::new(AppConfig::default());
    let info = engine
        .count(root, "sub-01", &[], true, None, None)
        .unwrap();

    let ses = &info["ses-001"];
    assert_eq!(
        ses.in_file,
        Some(InFile::Multiple(vec![
            "sub-01_ses-001_part-01_physio.tsv.gz".to_string(),
            "sub-01_ses-001_part-02_physio.tsv.gz".to_string(),
        ]))
    );
    // the dead second file contributes nothing but does not discard run-01
    let triggers = ses.recorded_triggers.as_ref().unwrap();
    assert_eq!(triggers.len(), 1);
    assert_eq!(triggers["run-01"], 39);
}

#[test]
fn count_missing_subject_directory_is_fatal() {
    let tmp = tempdir().unwrap();
    fs::create_dir_all(tmp.path().join("sourcedata/physio")).unwrap();

    let engine = Engine::new(AppConfig::default());
    let err = engine
        .count(tmp.path(), "sub-42", &[], true, None, None)
        .unwrap_err();
    assert!(matches!(err, physioseg::Error::MissingDirectory(_)));
}

/// Converted-session tree for align: artifacts for three runs, with
/// reconciliation outcomes valid / invalid / mismatch.
fn create_align_tree(scratch: &Path) {
    let ses_dir = scratch.join("sub-01/ses-001");
    let conv_dir = ses_dir.join("code/conversion");
    fs::create_dir_all(&conv_dir).unwrap();

    for run in ["run-01", "run-02", "run-03"] {
        fs::write(
            ses_dir.join(format!("sub-01_ses-001_{}_physio.tsv.gz", run)),
            b"signal",
        )
        .unwrap();
        fs::write(
            ses_dir.join(format!("sub-01_ses-001_{}_physio.json", run)),
            b"{}",
        )
        .unwrap();
        fs::write(conv_dir.join(format!("sub-01_ses-001_{}.log", run)), b"log").unwrap();
        fs::write(conv_dir.join(format!("sub-01_ses-001_{}.png", run)), b"png").unwrap();
    }

    let mut info = metadata::SubjectInfo::new();
    let mut ses = metadata::SessionInfo {
        expected_runs: 3,
        processed_runs: 3,
        task: vec![
            "task-a".to_string(),
            "task-b".to_string(),
            "task-c".to_string(),
        ],
        in_file: Some(InFile::Single("rec.tsv.gz".to_string())),
        ..metadata::SessionInfo::default()
    };
    for (key, vols) in [("01", 440u32), ("02", 440), ("03", 440)] {
        ses.expected_volumes.insert(key.to_string(), vols);
    }
    let mut triggers = std::collections::BTreeMap::new();
    triggers.insert("run-01".to_string(), 440); // matches → rename
    triggers.insert("run-02".to_string(), 350); // below cutoff → delete
    triggers.insert("run-03".to_string(), 430); // long but off → keep
    ses.recorded_triggers = Some(triggers);
    info.insert("ses-001".to_string(), ses);
    metadata::save_subject_info(scratch, "sub-01", &info).unwrap();
}

#[test]
fn align_renames_deletes_and_reports() {
    let tmp = tempdir().unwrap();
    let scratch = tmp.path();
    create_align_tree(scratch);

    let engine = Engine::new(AppConfig::default());
    let summaries = engine.align(scratch, "sub-01", &[], None).unwrap();
    assert_eq!(summaries.len(), 1);
    let summary = &summaries[0];
    assert!(summary.skipped.is_none());
    assert!(summary.warnings.is_empty());

    let ses_dir = scratch.join("sub-01/ses-001");
    let conv_dir = ses_dir.join("code/conversion");

    // run-01 renamed to its task label, all four files
    assert!(ses_dir.join("sub-01_ses-001_task-a_physio.tsv.gz").exists());
    assert!(ses_dir.join("sub-01_ses-001_task-a_physio.json").exists());
    assert!(conv_dir.join("sub-01_ses-001_task-a_physio.log").exists());
    assert!(conv_dir.join("sub-01_ses-001_task-a_physio.png").exists());
    assert!(!ses_dir.join("sub-01_ses-001_run-01_physio.tsv.gz").exists());

    // run-02 deleted
    assert!(!ses_dir.join("sub-01_ses-001_run-02_physio.tsv.gz").exists());
    assert!(!ses_dir.join("sub-01_ses-001_run-02_physio.json").exists());
    assert!(!conv_dir.join("sub-01_ses-001_run-02.log").exists());
    assert!(!conv_dir.join("sub-01_ses-001_run-02.png").exists());

    // run-03 untouched, reported as mismatch
    assert!(ses_dir.join("sub-01_ses-001_run-03_physio.tsv.gz").exists());
    let mismatch = summary
        .outcomes
        .iter()
        .find(|o| o.run == "run-03")
        .unwrap();
    assert_eq!(
        mismatch.disposition,
        physioseg::matcher::Disposition::MismatchKept
    );

    // journal cleaned up
    assert!(!ses_dir.join(physioseg::matcher::MANIFEST_NAME).exists());
}

#[test]
fn align_joins_gapped_trigger_keys_to_the_right_artifacts() {
    let tmp = tempdir().unwrap();
    let scratch = tmp.path();
    let ses_dir = scratch.join("sub-01/ses-001");
    let conv_dir = ses_dir.join("code/conversion");
    fs::create_dir_all(&conv_dir).unwrap();
    for run in ["run-01", "run-02"] {
        fs::write(
            ses_dir.join(format!("sub-01_ses-001_{}_physio.tsv.gz", run)),
            b"signal",
        )
        .unwrap();
        fs::write(
            ses_dir.join(format!("sub-01_ses-001_{}_physio.json", run)),
            b"{}",
        )
        .unwrap();
    }

    // run-01 has no recorded count at all; only run-02 was counted, short
    let mut info = metadata::SubjectInfo::new();
    let mut ses = metadata::SessionInfo {
        expected_runs: 2,
        processed_runs: 2,
        task: vec!["task-a".to_string(), "task-b".to_string()],
        ..metadata::SessionInfo::default()
    };
    ses.expected_volumes.insert("01".to_string(), 440);
    ses.expected_volumes.insert("02".to_string(), 440);
    let mut triggers = std::collections::BTreeMap::new();
    triggers.insert("run-02".to_string(), 350);
    ses.recorded_triggers = Some(triggers);
    info.insert("ses-001".to_string(), ses);
    metadata::save_subject_info(scratch, "sub-01", &info).unwrap();

    let engine = Engine::new(AppConfig::default());
    let summaries = engine.align(scratch, "sub-01", &[], None).unwrap();

    // run-01 was never counted, so its artifacts must survive
    assert!(
        ses_dir.join("sub-01_ses-001_run-01_physio.tsv.gz").exists(),
        "run-01 artifacts removed although run-01 had no recorded count"
    );
    assert!(ses_dir.join("sub-01_ses-001_run-01_physio.json").exists());
    // the genuinely invalid run-02 is the one deleted
    assert!(!ses_dir.join("sub-01_ses-001_run-02_physio.tsv.gz").exists());
    assert!(!ses_dir.join("sub-01_ses-001_run-02_physio.json").exists());

    let deleted = summaries[0]
        .outcomes
        .iter()
        .find(|o| o.disposition == physioseg::matcher::Disposition::Deleted)
        .unwrap();
    assert_eq!(deleted.run, "run-02");
}

#[test]
fn align_is_idempotent() {
    let tmp = tempdir().unwrap();
    let scratch = tmp.path();
    create_align_tree(scratch);

    let engine = Engine::new(AppConfig::default());
    engine.align(scratch, "sub-01", &[], None).unwrap();

    let ses_dir = scratch.join("sub-01/ses-001");
    let mut before: Vec<_> = fs::read_dir(&ses_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name())
        .collect();
    before.sort();

    // renamed files carry no run key, so nothing joins a second time
    let summaries = engine.align(scratch, "sub-01", &[], None).unwrap();
    let mut after: Vec<_> = fs::read_dir(&ses_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name())
        .collect();
    after.sort();
    assert_eq!(before, after);

    let run1 = summaries[0]
        .outcomes
        .iter()
        .find(|o| o.run == "run-01")
        .unwrap();
    assert_eq!(
        run1.disposition,
        physioseg::matcher::Disposition::NoArtifacts
    );
}

#[test]
fn align_session_consistency_warning_does_not_block() {
    let tmp = tempdir().unwrap();
    let scratch = tmp.path();
    create_align_tree(scratch);

    // claim five expected runs while only three were processed
    let mut info = metadata::load_subject_info(scratch, "sub-01").unwrap();
    {
        let ses = info.get_mut("ses-001").unwrap();
        ses.expected_runs = 5;
        ses.processed_runs = 3;
        ses.task = vec![
            "task-a".to_string(),
            "task-b".to_string(),
            "task-c".to_string(),
            "task-d".to_string(),
            "task-e".to_string(),
        ];
    }
    metadata::save_subject_info(scratch, "sub-01", &info).unwrap();

    let engine = Engine::new(AppConfig::default());
    let summaries = engine.align(scratch, "sub-01", &[], None).unwrap();
    let summary = &summaries[0];
    assert!(!summary.warnings.is_empty());
    assert!(summary.skipped.is_none());
    // the matched run is still renamed
    assert!(scratch
        .join("sub-01/ses-001/sub-01_ses-001_task-a_physio.tsv.gz")
        .exists());
}

#[test]
fn align_falls_back_to_scanning_sheet_for_missing_expectations() {
    let tmp = tempdir().unwrap();
    let scratch = tmp.path();
    create_align_tree(scratch);

    // drop the persisted expectation for run-01; the sheet supplies it
    let mut info = metadata::load_subject_info(scratch, "sub-01").unwrap();
    info.get_mut("ses-001").unwrap().expected_volumes.remove("01");
    metadata::save_subject_info(scratch, "sub-01", &info).unwrap();

    let sheet_path = scratch.join("sheet.csv");
    let mut f = fs::File::create(&sheet_path).unwrap();
    writeln!(f, "sub-01,#volumes").unwrap();
    writeln!(f, "p01_friends001,440").unwrap();
    let sheet = ScanningSheet::load(&sheet_path).unwrap();

    let engine = Engine::new(AppConfig::default());
    let summaries = engine.align(scratch, "sub-01", &[], Some(&sheet)).unwrap();

    let ses_dir = scratch.join("sub-01/ses-001");
    assert!(ses_dir.join("sub-01_ses-001_task-a_physio.tsv.gz").exists());
    let renamed = summaries[0]
        .outcomes
        .iter()
        .find(|o| o.run == "run-01")
        .unwrap();
    assert_eq!(
        renamed.disposition,
        physioseg::matcher::Disposition::Renamed
    );
}

#[test]
fn align_without_trigger_info_skips_session() {
    let tmp = tempdir().unwrap();
    let scratch = tmp.path();
    create_align_tree(scratch);

    let mut info = metadata::load_subject_info(scratch, "sub-01").unwrap();
    info.get_mut("ses-001").unwrap().recorded_triggers = None;
    metadata::save_subject_info(scratch, "sub-01", &info).unwrap();

    let engine = Engine::new(AppConfig::default());
    let summaries = engine.align(scratch, "sub-01", &[], None).unwrap();
    assert!(summaries[0].skipped.is_some());
    // nothing touched
    assert!(scratch
        .join("sub-01/ses-001/sub-01_ses-001_run-01_physio.tsv.gz")
        .exists());
}

#[test]
fn slice_writes_per_run_files_and_pre_scan() {
    let tmp = tempdir().unwrap();
    let root = tmp.path();
    let ses_dir = root.join("sub-01/ses-001");
    fs::create_dir_all(&ses_dir).unwrap();
    write_recording(
        &ses_dir,
        "sub-01_ses-001_physio",
        13_000,
        100.0,
        &[(1_000, 6_000, 100), (7_000, 12_000, 100)],
    );

    let out = tempdir().unwrap();
    let engine = Engine::new(AppConfig::default());
    engine.slice(root, "sub-01", None, out.path()).unwrap();

    let out_ses = out.path().join("sub-01/ses-001");
    assert!(out_ses.join("sub-01_ses-001_prep-before-scan.tsv.gz").exists());
    assert!(out_ses.join("sub-01_ses-001_task-run01_physio.tsv.gz").exists());
    assert!(out_ses.join("sub-01_ses-001_task-run01_physio.json").exists());
    assert!(out_ses.join("sub-01_ses-001_task-run02_physio.tsv.gz").exists());

    // slices reopen as recordings; run 1 spans its padded boundaries
    let sliced =
        physioseg::recording::Recording::open(&out_ses.join("sub-01_ses-001_task-run01_physio.tsv.gz"))
            .unwrap();
    assert_eq!(sliced.sampling_rate, 100.0);
    // 1000 - 9 s * 100 Hz = 100 through 6000 + 900 = 6900
    assert_eq!(sliced.len(), 6_900 - 100);
}
