use config::{Config, ConfigError, File as ConfigFile};
use serde::Deserialize;

/// Tunable parameters for segmentation, reconciliation and matching.
///
/// Every value that was a magic number in the original acquisition scripts is
/// a field here, overridable from an optional `Config.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Name of the scanner trigger channel in the recording.
    pub trigger_channel: String,
    /// A sample is an active trigger when its value exceeds this (the TTL
    /// line idles near 0 and pulses near 5).
    pub trigger_threshold: f64,
    /// Nominal repetition time of the functional sequence, in seconds.
    pub tr_seconds: f64,
    /// Inter-trigger silence longer than this marks a run boundary, in
    /// seconds. Fixed at 2 s in the acquisition protocol, independent of
    /// `tr_seconds`.
    pub gap_seconds: f64,
    /// Padding applied around run boundaries when slicing raw signal, in
    /// seconds.
    pub pad_seconds: f64,
    /// Runs with fewer recorded volumes than this are invalid and their
    /// artifacts are deleted. Dataset-specific; 400 matches one fixed
    /// whole-session design and is not universal.
    pub min_valid_volumes: u32,
    /// Apply `pad_seconds` to boundaries before estimating volume counts.
    /// The acquisition scripts counted on unpadded boundaries.
    pub pad_when_counting: bool,
    /// Apply `pad_seconds` to boundaries before slicing raw signal to disk.
    pub pad_when_slicing: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            trigger_channel: "TTL".to_string(),
            trigger_threshold: 4.0,
            tr_seconds: 1.49,
            gap_seconds: 2.0,
            pad_seconds: 9.0,
            min_valid_volumes: 400,
            pad_when_counting: false,
            pad_when_slicing: true,
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<AppConfig, ConfigError> {
        let builder = Config::builder()
            .add_source(ConfigFile::with_name("Config").required(false))
            .build()?;
        builder.try_deserialize::<AppConfig>()
    }
}
