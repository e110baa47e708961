use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "physioseg")]
#[command(about = "Segment physiological recordings per fMRI run and align converted artifacts", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Count recorded volumes per run and write the per-subject metadata file
    Count(CountArgs),
    /// Rename valid converted runs to task names, delete invalid ones
    Align(AlignArgs),
    /// Slice raw recordings into per-run signal files
    Slice(SliceArgs),
    /// Print configuration values
    PrintConfig,
}

#[derive(Debug, Args)]
pub struct CountArgs {
    /// Root directory of the dataset (contains sourcedata/physio)
    #[arg(short = 'r', long = "root")]
    pub root: PathBuf,
    /// Subject label, e.g. sub-01
    #[arg(short = 's', long = "sub")]
    pub sub: String,
    /// Restrict to specific sessions, e.g. ses-001 ses-002
    #[arg(long = "ses", num_args = 0..)]
    pub sessions: Vec<String>,
    /// Also count trigger pulses in the physiological recordings
    #[arg(long = "count-vol")]
    pub count_vol: bool,
    /// Scanning sheet CSV used when sidecar metadata is missing
    #[arg(long = "scanning-sheet")]
    pub scanning_sheet: Option<PathBuf>,
    /// Where to write {sub}_volumes_all-ses-runs.json (defaults to root)
    #[arg(long = "save")]
    pub save: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct AlignArgs {
    /// Directory holding converted sessions and the per-subject metadata file
    #[arg(short = 'i', long = "indir")]
    pub scratch: PathBuf,
    /// Subject label, e.g. sub-01
    #[arg(short = 's', long = "sub")]
    pub sub: String,
    /// Restrict to specific sessions
    #[arg(long = "ses", num_args = 0..)]
    pub sessions: Vec<String>,
    /// Scanning sheet CSV used when persisted metadata lacks a run's
    /// expected volume count
    #[arg(long = "scanning-sheet")]
    pub scanning_sheet: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct SliceArgs {
    /// Root directory containing the raw physiological recordings
    #[arg(short = 'r', long = "root")]
    pub root: PathBuf,
    /// Subject label, e.g. sub-01
    #[arg(short = 's', long = "sub")]
    pub sub: String,
    /// Restrict to a specific session
    #[arg(long = "ses")]
    pub session: Option<String>,
    /// Where to write per-run slices (defaults to root)
    #[arg(long = "save")]
    pub save: Option<PathBuf>,
}
