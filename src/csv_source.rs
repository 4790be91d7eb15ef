//! Numeric source backed by a local CSV file.
//!
//! Expected layout: a header row `timestamp,<token>,<token>...` followed by one
//! row per sample. Every token column becomes the numeric channel
//! `{name}::{token}`. Empty cells are treated as missing samples.

use std::fs::File;
use std::path::{Path, PathBuf};

use csv::StringRecord;
use tracing::info;

use crate::channel::{channel_id, Channel, Entry};
use crate::source::{ProgressLog, Source, SourceError};
use crate::store::ChannelStore;
use crate::timestamp::{Granularity, Timestamp};

const TIMESTAMP_COLUMN: &str = "timestamp";

#[derive(Debug, Clone)]
pub struct CsvFileSource {
    name: String,
    path: PathBuf,
    tokens: Vec<String>,
}

impl CsvFileSource {
    /// Reads the header of `path` to learn the channel layout.
    pub fn open(name: impl Into<String>, path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let name = name.into();
        let path = path.as_ref().to_path_buf();
        let mut reader = reader_for(&path)?;
        let header = reader.headers()?.clone();

        match header.get(0) {
            Some(first) if first.eq_ignore_ascii_case(TIMESTAMP_COLUMN) => {}
            other => {
                return Err(SourceError::Parse {
                    line: 1,
                    field: "header".to_string(),
                    value: other.unwrap_or_default().to_string(),
                });
            }
        }

        let tokens: Vec<String> = header.iter().skip(1).map(str::to_string).collect();
        if let Some(blank) = tokens.iter().find(|token| token.is_empty()) {
            return Err(SourceError::Parse {
                line: 1,
                field: "header".to_string(),
                value: blank.clone(),
            });
        }

        Ok(Self { name, path, tokens })
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// First and last timestamp in the file, if it has any rows.
    pub fn time_bounds(
        &self,
        granularity: Granularity,
    ) -> Result<Option<(Timestamp, Timestamp)>, SourceError> {
        let mut bounds: Option<(Timestamp, Timestamp)> = None;
        self.for_each_row(granularity, |_, ts, _| {
            bounds = Some(match bounds {
                Some((first, last)) => (first.min(ts), last.max(ts)),
                None => (ts, ts),
            });
            Ok(())
        })?;
        Ok(bounds)
    }

    fn for_each_row(
        &self,
        granularity: Granularity,
        mut f: impl FnMut(u64, Timestamp, &StringRecord) -> Result<(), SourceError>,
    ) -> Result<(), SourceError> {
        let mut reader = reader_for(&self.path)?;
        for record in reader.records() {
            let record = record?;
            let line = record.position().map(|pos| pos.line()).unwrap_or_default();
            let raw = record.get(0).unwrap_or_default();
            let ts = Timestamp::new(raw, granularity).map_err(|_| SourceError::Parse {
                line,
                field: TIMESTAMP_COLUMN.to_string(),
                value: raw.to_string(),
            })?;
            f(line, ts, &record)?;
        }
        Ok(())
    }
}

impl Source for CsvFileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn channels(&self) -> Vec<Channel> {
        let file_name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.tokens
            .iter()
            .map(|token| {
                Channel::numeric(
                    channel_id(&self.name, token),
                    format!("{token} column of {file_name}"),
                )
            })
            .collect()
    }

    fn run(
        &mut self,
        store: &mut ChannelStore,
        start: Timestamp,
        end: Timestamp,
        log: &ProgressLog,
    ) -> Result<(), SourceError> {
        let mut per_token: Vec<Vec<Entry>> = vec![Vec::new(); self.tokens.len()];

        self.for_each_row(store.granularity(), |line, ts, record| {
            if ts < start || ts > end {
                return Ok(());
            }
            for (idx, token) in self.tokens.iter().enumerate() {
                let raw = record.get(idx + 1).unwrap_or_default();
                if raw.is_empty() {
                    continue;
                }
                let value = raw.parse::<f64>().map_err(|_| SourceError::Parse {
                    line,
                    field: token.clone(),
                    value: raw.to_string(),
                })?;
                per_token[idx].push(Entry::new(ts, value));
            }
            Ok(())
        })?;

        let mut total = 0;
        for (token, entries) in self.tokens.iter().zip(&per_token) {
            let id = channel_id(&self.name, token);
            let written = store.add(&id, entries)?;
            log.emit(&format!("{id}: {written} entries between {start} and {end}"));
            total += written;
        }
        store.commit()?;

        info!(
            component = "csv_source",
            event = "source.csv.loaded",
            source = %self.name,
            path = %self.path.display(),
            entries = total
        );
        Ok(())
    }
}

fn reader_for(path: &Path) -> Result<csv::Reader<File>, SourceError> {
    let file = File::open(path)?;
    Ok(csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(file))
}
