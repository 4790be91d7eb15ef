//! Gap detection and source orchestration.
//!
//! For every source the acquirer intersects the stored timestamps of all its
//! channels, shrinks the requested interval from both ends past points that are
//! already complete and hands the remaining range to the source. Only the two
//! ends are examined, so complete points between two missing ones are fetched
//! again.
//!
//! A source whose channels cannot be registered is rejected and a source whose
//! run fails is recorded as failed; either way the remaining sources still run.
//! Only database and I/O errors end the pass.

use std::collections::BTreeSet;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::channel::{Channel, ValidationError};
use crate::config::AcquisitionConfig;
use crate::source::{ProgressLog, Source};
use crate::store::{ChannelStore, StoreError};
use crate::timestamp::{Granularity, Timestamp, TimestampError};

#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("timestamp error: {0}")]
    Timestamp(#[from] TimestampError),
    #[error("acquirer is configured for {configured} granularity but the store uses {store}")]
    GranularityMismatch {
        configured: Granularity,
        store: Granularity,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SourceOutcome {
    /// Every point of the requested interval was already complete.
    Satisfied,
    Fetched {
        start: Timestamp,
        end: Timestamp,
    },
    Failed {
        start: Timestamp,
        end: Timestamp,
        error: String,
    },
    /// The source's channels could not be registered or read; it was not run.
    Rejected {
        error: String,
    },
    NoChannels,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceReport {
    pub source: String,
    #[serde(flatten)]
    pub outcome: SourceOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AcquisitionReport {
    pub start: Timestamp,
    pub end: Timestamp,
    pub sources: Vec<SourceReport>,
}

impl AcquisitionReport {
    pub fn failed(&self) -> impl Iterator<Item = &SourceReport> {
        self.sources
            .iter()
            .filter(|report| {
                matches!(
                    report.outcome,
                    SourceOutcome::Failed { .. } | SourceOutcome::Rejected { .. }
                )
            })
    }

    pub fn fetched_count(&self) -> usize {
        self.sources
            .iter()
            .filter(|report| matches!(report.outcome, SourceOutcome::Fetched { .. }))
            .count()
    }
}

pub struct Acquirer {
    config: AcquisitionConfig,
    sources: Vec<Box<dyn Source>>,
}

impl Acquirer {
    pub fn new(config: AcquisitionConfig, sources: Vec<Box<dyn Source>>) -> Self {
        Self { config, sources }
    }

    pub fn source_names(&self) -> Vec<&str> {
        self.sources.iter().map(|source| source.name()).collect()
    }

    /// Backfills from the configured start date up to now.
    pub fn run_default(
        &mut self,
        store: &mut ChannelStore,
        log: &ProgressLog,
    ) -> Result<AcquisitionReport, AcquireError> {
        let start = Timestamp::new(self.config.start, self.config.granularity)?;
        let end = Timestamp::now(store.granularity());
        self.run(store, start, end, log)
    }

    pub fn run(
        &mut self,
        store: &mut ChannelStore,
        start: Timestamp,
        end: Timestamp,
        log: &ProgressLog,
    ) -> Result<AcquisitionReport, AcquireError> {
        let granularity = store.granularity();
        if self.config.granularity != granularity {
            return Err(AcquireError::GranularityMismatch {
                configured: self.config.granularity,
                store: granularity,
            });
        }
        let start = Timestamp::new(start, granularity)?;
        let end = Timestamp::new(end, granularity)?;

        if start == end {
            return Err(ValidationError::InvalidInterval(format!(
                "zero-width interval at {start}"
            ))
            .into());
        }
        if start > end {
            return Err(ValidationError::InvalidInterval(format!(
                "start {start} is after end {end}"
            ))
            .into());
        }

        info!(
            component = "acquirer",
            event = "acquire.run.start",
            start = %start,
            end = %end,
            sources = self.sources.len()
        );

        let mut reports = Vec::with_capacity(self.sources.len());
        for source in &mut self.sources {
            let outcome = acquire_source(source.as_mut(), store, start, end, log)?;
            reports.push(SourceReport {
                source: source.name().to_string(),
                outcome,
            });
        }

        let report = AcquisitionReport {
            start,
            end,
            sources: reports,
        };
        info!(
            component = "acquirer",
            event = "acquire.run.complete",
            fetched = report.fetched_count(),
            failed = report.failed().count()
        );
        Ok(report)
    }
}

fn acquire_source(
    source: &mut dyn Source,
    store: &mut ChannelStore,
    start: Timestamp,
    end: Timestamp,
    log: &ProgressLog,
) -> Result<SourceOutcome, AcquireError> {
    let name = source.name().to_string();
    let channels = source.channels();
    if channels.is_empty() {
        warn!(
            component = "acquirer",
            event = "acquire.source.no_channels",
            source = %name
        );
        return Ok(SourceOutcome::NoChannels);
    }

    let complete = match complete_timestamps(store, &channels) {
        Ok(complete) => complete,
        Err(err @ (StoreError::Sqlite(_) | StoreError::Io(_))) => return Err(err.into()),
        Err(err) => {
            warn!(
                component = "acquirer",
                event = "acquire.source.rejected",
                source = %name,
                error = %err
            );
            log.emit(&format!("{name}: rejected: {err}"));
            return Ok(SourceOutcome::Rejected {
                error: err.to_string(),
            });
        }
    };

    let Some((gap_start, gap_end)) = shrink_to_gap(&complete, start, end)? else {
        debug!(
            component = "acquirer",
            event = "acquire.source.satisfied",
            source = %name
        );
        return Ok(SourceOutcome::Satisfied);
    };

    info!(
        component = "acquirer",
        event = "acquire.source.fetch",
        source = %name,
        start = %gap_start,
        end = %gap_end
    );
    log.emit(&format!("{name}: fetching {gap_start} .. {gap_end}"));

    match source.run(store, gap_start, gap_end, log) {
        Ok(()) => Ok(SourceOutcome::Fetched {
            start: gap_start,
            end: gap_end,
        }),
        Err(err) => {
            warn!(
                component = "acquirer",
                event = "acquire.source.failed",
                source = %name,
                start = %gap_start,
                end = %gap_end,
                error = %err
            );
            log.emit(&format!("{name}: failed: {err}"));
            Ok(SourceOutcome::Failed {
                start: gap_start,
                end: gap_end,
                error: err.to_string(),
            })
        }
    }
}

/// Registers `channels` and returns the timestamps stored in all of them.
fn complete_timestamps(
    store: &mut ChannelStore,
    channels: &[Channel],
) -> Result<BTreeSet<Timestamp>, StoreError> {
    for channel in channels {
        channel.validate()?;
    }
    for channel in channels {
        store.ensure_channel(channel)?;
    }

    let mut complete: Option<BTreeSet<Timestamp>> = None;
    for channel in channels {
        let stamps = store.timestamps(&channel.id)?;
        complete = Some(match complete {
            Some(acc) => acc.intersection(&stamps).copied().collect(),
            None => stamps,
        });
    }
    Ok(complete.unwrap_or_default())
}

/// Narrows `[start, end]` to the part that still needs data.
///
/// `start` moves forward while it is complete and before `end`; `end` then moves
/// backward while it is complete and after `start`. Returns `None` when the
/// bounds meet on a complete point, i.e. nothing needs to be fetched.
pub fn shrink_to_gap(
    complete: &BTreeSet<Timestamp>,
    start: Timestamp,
    end: Timestamp,
) -> Result<Option<(Timestamp, Timestamp)>, TimestampError> {
    let mut start = start;
    let mut end = end;

    while start < end && complete.contains(&start) {
        start.advance_steps(1)?;
    }
    while end > start && complete.contains(&end) {
        end.advance_steps(-1)?;
    }

    if start == end && complete.contains(&start) {
        return Ok(None);
    }
    Ok(Some((start, end)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hour(h: u32) -> Timestamp {
        Timestamp::new(format!("2017-06-01 {h:02}:00"), Granularity::Hour).unwrap()
    }

    fn covered(hours: &[u32]) -> BTreeSet<Timestamp> {
        hours.iter().map(|h| hour(*h)).collect()
    }

    #[test]
    fn shrinks_both_ends_past_complete_points() {
        let complete = covered(&[14, 15, 16, 17]);

        assert_eq!(
            shrink_to_gap(&complete, hour(12), hour(16)).unwrap(),
            Some((hour(12), hour(13)))
        );
        assert_eq!(
            shrink_to_gap(&complete, hour(12), hour(17)).unwrap(),
            Some((hour(12), hour(13)))
        );
        assert_eq!(
            shrink_to_gap(&complete, hour(14), hour(19)).unwrap(),
            Some((hour(18), hour(19)))
        );
        assert_eq!(shrink_to_gap(&complete, hour(14), hour(17)).unwrap(), None);
    }

    #[test]
    fn empty_coverage_keeps_the_full_range() {
        assert_eq!(
            shrink_to_gap(&BTreeSet::new(), hour(3), hour(9)).unwrap(),
            Some((hour(3), hour(9)))
        );
    }

    #[test]
    fn single_missing_point_is_still_requested() {
        let complete = covered(&[10, 11, 13]);
        assert_eq!(
            shrink_to_gap(&complete, hour(10), hour(13)).unwrap(),
            Some((hour(12), hour(12)))
        );
    }

    #[test]
    fn covered_stretch_between_missing_ends_is_requested_again() {
        let complete = covered(&[11, 12, 13]);
        assert_eq!(
            shrink_to_gap(&complete, hour(10), hour(14)).unwrap(),
            Some((hour(10), hour(14)))
        );
    }
}
