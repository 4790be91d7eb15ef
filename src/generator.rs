//! Training windows over the complete, contiguous part of the numeric channels.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::channel::ValueType;
use crate::store::{ChannelStore, StoreError};
use crate::timestamp::{Timestamp, TimestampError};

const MAX_REPORTED_GAP_RANGES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GapPolicy {
    Strict,
    ReportAndSkip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratorConfig {
    pub sequence_length: usize,
    pub stride: usize,
    pub gap_policy: GapPolicy,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            sequence_length: 50,
            stride: 1,
            gap_policy: GapPolicy::Strict,
        }
    }
}

/// One timestamp with a value per channel, in channel order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Frame {
    pub timestamp: Timestamp,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingWindow {
    pub start: Timestamp,
    pub end: Timestamp,
    pub frames: Vec<Frame>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeneratorReport {
    pub channels: Vec<String>,
    pub frames: u64,
    pub windows: u64,
    pub skipped_points: u64,
    /// Inclusive ranges of missing points, capped in length.
    pub gap_ranges: Vec<(Timestamp, Timestamp)>,
    pub first_error: Option<String>,
}

#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("invalid generator config: {0}")]
    InvalidConfig(String),
    #[error("no active numeric channels to generate windows from")]
    NoChannels,
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("timestamp error: {0}")]
    Timestamp(#[from] TimestampError),
    #[error("continuity gap after {last}: next complete point is {next} ({missing_points} missing points)")]
    ContinuityGap {
        last: Timestamp,
        next: Timestamp,
        missing_points: u64,
    },
}

/// Builds fixed-length windows over all active numeric channels of `store`.
pub fn build_windows(
    store: &ChannelStore,
    cfg: &GeneratorConfig,
) -> Result<(Vec<TrainingWindow>, GeneratorReport), GeneratorError> {
    validate_config(cfg)?;

    let channels: Vec<String> = store
        .get_all_channels(true)?
        .into_iter()
        .filter(|channel| channel.value_type == ValueType::Numeric)
        .map(|channel| channel.id)
        .collect();
    if channels.is_empty() {
        return Err(GeneratorError::NoChannels);
    }

    info!(
        component = "generator",
        event = "generator.build.start",
        channels = channels.len(),
        sequence_length = cfg.sequence_length,
        stride = cfg.stride,
        gap_policy = ?cfg.gap_policy
    );

    let mut series: Vec<HashMap<Timestamp, f64>> = Vec::with_capacity(channels.len());
    let mut complete: Option<BTreeSet<Timestamp>> = None;
    for id in &channels {
        let values: HashMap<Timestamp, f64> = store
            .get(id)?
            .into_iter()
            .filter_map(|entry| entry.value.as_f64().map(|v| (entry.timestamp, v)))
            .collect();
        let stamps: BTreeSet<Timestamp> = values.keys().copied().collect();
        complete = Some(match complete {
            Some(acc) => acc.intersection(&stamps).copied().collect(),
            None => stamps,
        });
        series.push(values);
    }

    let mut report = GeneratorReport {
        channels: channels.clone(),
        frames: 0,
        windows: 0,
        skipped_points: 0,
        gap_ranges: Vec::new(),
        first_error: None,
    };
    let mut windows = Vec::new();
    let mut segment: Vec<Frame> = Vec::new();

    for ts in complete.unwrap_or_default() {
        if let Some(last) = segment.last().map(|frame| frame.timestamp) {
            let expected = last.offset_steps(1)?;
            if ts != expected {
                handle_gap(last, ts, cfg, &mut report)?;
                push_windows(&segment, cfg, &mut windows);
                segment.clear();
            }
        }

        let values = series
            .iter()
            .map(|values| values.get(&ts).copied().unwrap_or_default())
            .collect();
        segment.push(Frame {
            timestamp: ts,
            values,
        });
        report.frames += 1;
    }
    push_windows(&segment, cfg, &mut windows);

    report.windows = windows.len() as u64;
    info!(
        component = "generator",
        event = "generator.build.finish",
        frames = report.frames,
        windows = report.windows,
        skipped_points = report.skipped_points,
        gap_ranges_reported = report.gap_ranges.len()
    );

    Ok((windows, report))
}

fn validate_config(cfg: &GeneratorConfig) -> Result<(), GeneratorError> {
    if cfg.sequence_length == 0 {
        return Err(GeneratorError::InvalidConfig(
            "sequence_length must be > 0".to_string(),
        ));
    }
    if cfg.stride == 0 {
        return Err(GeneratorError::InvalidConfig(
            "stride must be > 0".to_string(),
        ));
    }
    Ok(())
}

fn push_windows(segment: &[Frame], cfg: &GeneratorConfig, out: &mut Vec<TrainingWindow>) {
    if segment.len() < cfg.sequence_length {
        return;
    }
    for begin in (0..=segment.len() - cfg.sequence_length).step_by(cfg.stride) {
        let frames = segment[begin..begin + cfg.sequence_length].to_vec();
        out.push(TrainingWindow {
            start: frames[0].timestamp,
            end: frames[frames.len() - 1].timestamp,
            frames,
        });
    }
}

fn handle_gap(
    last: Timestamp,
    next: Timestamp,
    cfg: &GeneratorConfig,
    report: &mut GeneratorReport,
) -> Result<(), GeneratorError> {
    let missing_points = (last.steps_until(&next) - 1).max(0) as u64;
    match cfg.gap_policy {
        GapPolicy::Strict => Err(GeneratorError::ContinuityGap {
            last,
            next,
            missing_points,
        }),
        GapPolicy::ReportAndSkip => {
            warn!(
                component = "generator",
                event = "generator.build.gap_detected",
                last = %last,
                next = %next,
                missing_points
            );
            report.skipped_points = report.skipped_points.saturating_add(missing_points);
            if report.gap_ranges.len() < MAX_REPORTED_GAP_RANGES {
                report
                    .gap_ranges
                    .push((last.offset_steps(1)?, next.offset_steps(-1)?));
            }
            if report.first_error.is_none() {
                report.first_error = Some(format!("continuity gap between {last} and {next}"));
            }
            Ok(())
        }
    }
}
