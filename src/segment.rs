//! Trigger-gap run segmentation.
//!
//! The scanner emits one TTL pulse per acquired volume. Within a run the
//! pulses arrive every TR; between runs the line goes quiet for much longer.
//! Segmentation scans successive active-trigger sample indices and splits
//! wherever the inter-trigger distance exceeds the configured gap.

use crate::config::AppConfig;
use crate::error::{Error, Result};
use tracing::debug;

/// A maximal contiguous span of the recording covering one functional run,
/// in sample indices. Segments are ordered by `start` and never overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSegment {
    pub start: usize,
    pub end: usize,
}

impl RunSegment {
    pub fn duration_seconds(&self, sampling_rate: f64) -> f64 {
        (self.end - self.start) as f64 / sampling_rate
    }

    /// Volumes acquired over this span: one per TR, plus the volume whose
    /// trigger opened the span.
    pub fn estimated_volumes(&self, sampling_rate: f64, tr_seconds: f64) -> u32 {
        (self.duration_seconds(sampling_rate) / tr_seconds).round() as u32 + 1
    }

    /// Widen outward by `pad` samples, clamped to `[0, max_index]`.
    fn padded(&self, pad: usize, max_index: usize) -> RunSegment {
        RunSegment {
            start: self.start.saturating_sub(pad),
            end: (self.end + pad).min(max_index),
        }
    }
}

/// A between-run silence: `end_of_run` is the last trigger before the gap,
/// `start_of_next` the first trigger after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Boundary {
    pub end_of_run: usize,
    pub start_of_next: usize,
}

/// The slicing variant's output: what to cut out of the raw signal for
/// storage. Distinct from volume counting, which never pads by default.
#[derive(Debug, Clone)]
pub struct SlicePlan {
    /// Everything before the first (padded) run start. Not a run; retained
    /// so the pre-scan baseline is inspectable.
    pub pre_scan: RunSegment,
    pub runs: Vec<RunSegment>,
}

pub struct TriggerSegmenter<'a> {
    config: &'a AppConfig,
}

impl<'a> TriggerSegmenter<'a> {
    pub fn new(config: &'a AppConfig) -> Self {
        TriggerSegmenter { config }
    }

    /// Sample indices where the trigger channel is active. Strictly
    /// increasing by construction.
    pub fn trigger_indices(&self, trigger_signal: &[f64]) -> Result<Vec<usize>> {
        let threshold = self.config.trigger_threshold;
        let indices: Vec<usize> = trigger_signal
            .iter()
            .enumerate()
            .filter(|(_, &v)| v > threshold)
            .map(|(i, _)| i)
            .collect();

        if indices.is_empty() {
            return Err(Error::EmptyTrigger {
                channel: self.config.trigger_channel.clone(),
                threshold,
            });
        }
        Ok(indices)
    }

    /// Ordered run segments on unpadded trigger boundaries.
    pub fn segment(&self, trigger_signal: &[f64], sampling_rate: f64) -> Result<Vec<RunSegment>> {
        if sampling_rate <= 0.0 {
            return Err(Error::InvalidSamplingRate(sampling_rate));
        }
        let triggers = self.trigger_indices(trigger_signal)?;
        let boundaries = self.find_boundaries(&triggers, sampling_rate)?;
        debug!(
            "{} trigger samples, {} run boundaries",
            triggers.len(),
            boundaries.len()
        );
        Ok(build_segments(&triggers, &boundaries))
    }

    /// Recorded volumes per run, ordered by run onset.
    ///
    /// Counts on unpadded boundaries unless `pad_when_counting` is set; the
    /// two padding knobs are deliberately independent because padding changes
    /// the numeric result.
    pub fn count_volumes(&self, trigger_signal: &[f64], sampling_rate: f64) -> Result<Vec<u32>> {
        let mut segments = self.segment(trigger_signal, sampling_rate)?;
        if self.config.pad_when_counting {
            let pad = (self.config.pad_seconds * sampling_rate) as usize;
            let max_index = trigger_signal.len().saturating_sub(1);
            segments = segments.iter().map(|s| s.padded(pad, max_index)).collect();
        }
        Ok(segments
            .iter()
            .map(|s| s.estimated_volumes(sampling_rate, self.config.tr_seconds))
            .collect())
    }

    /// Padded spans to cut from the raw signal, plus the pre-scan block.
    pub fn slice_plan(&self, trigger_signal: &[f64], sampling_rate: f64) -> Result<SlicePlan> {
        let segments = self.segment(trigger_signal, sampling_rate)?;
        let max_index = trigger_signal.len().saturating_sub(1);
        let pad = if self.config.pad_when_slicing {
            (self.config.pad_seconds * sampling_rate) as usize
        } else {
            0
        };

        let runs: Vec<RunSegment> = segments.iter().map(|s| s.padded(pad, max_index)).collect();
        let pre_scan = RunSegment {
            start: 0,
            end: runs.first().map(|r| r.start).unwrap_or(0),
        };
        Ok(SlicePlan { pre_scan, runs })
    }

    fn find_boundaries(&self, triggers: &[usize], sampling_rate: f64) -> Result<Vec<Boundary>> {
        if triggers.len() < 2 {
            return Err(Error::InsufficientTriggerData {
                count: triggers.len(),
            });
        }
        let gap_threshold = sampling_rate * self.config.gap_seconds;

        let mut boundaries = Vec::new();
        for pair in triggers.windows(2) {
            let delta = (pair[1] - pair[0]) as f64;
            if delta > gap_threshold {
                boundaries.push(Boundary {
                    end_of_run: pair[0],
                    start_of_next: pair[1],
                });
            }
        }
        Ok(boundaries)
    }
}

/// Assemble ordered segments from active-trigger extremes and gap boundaries.
/// With no boundary, the whole active span is a single run.
fn build_segments(triggers: &[usize], boundaries: &[Boundary]) -> Vec<RunSegment> {
    let first = *triggers.first().unwrap_or(&0);
    let last = *triggers.last().unwrap_or(&0);

    if boundaries.is_empty() {
        return vec![RunSegment {
            start: first,
            end: last,
        }];
    }

    let mut segments = Vec::with_capacity(boundaries.len() + 1);
    segments.push(RunSegment {
        start: first,
        end: boundaries[0].end_of_run,
    });
    for pair in boundaries.windows(2) {
        segments.push(RunSegment {
            start: pair[0].start_of_next,
            end: pair[1].end_of_run,
        });
    }
    segments.push(RunSegment {
        start: boundaries[boundaries.len() - 1].start_of_next,
        end: last,
    });
    segments
}
