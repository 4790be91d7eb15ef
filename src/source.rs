//! Pluggable data sources driven by the acquirer.

use std::fmt;

use thiserror::Error;
use tracing::debug;

use crate::channel::Channel;
use crate::store::{ChannelStore, StoreError};
use crate::timestamp::Timestamp;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("failed to parse {field} value '{value}' on line {line}")]
    Parse {
        line: u64,
        field: String,
        value: String,
    },
}

/// A named producer of entries for a fixed set of channels.
///
/// `run` must write every entry it fetches through [`ChannelStore::add`] and
/// should finish with [`ChannelStore::commit`]. The acquirer only asks for
/// ranges that are not fully covered yet, so implementations do not need to
/// deduplicate against the store themselves.
pub trait Source {
    fn name(&self) -> &str;

    fn channels(&self) -> Vec<Channel>;

    fn run(
        &mut self,
        store: &mut ChannelStore,
        start: Timestamp,
        end: Timestamp,
        log: &ProgressLog,
    ) -> Result<(), SourceError>;
}

/// Optional progress callback handed to sources.
#[derive(Default)]
pub struct ProgressLog {
    callback: Option<Box<dyn Fn(&str)>>,
}

impl ProgressLog {
    pub fn new(callback: impl Fn(&str) + 'static) -> Self {
        Self {
            callback: Some(Box::new(callback)),
        }
    }

    pub fn silent() -> Self {
        Self::default()
    }

    pub fn emit(&self, message: &str) {
        debug!(component = "source", event = "source.progress", message);
        if let Some(callback) = &self.callback {
            callback(message);
        }
    }
}

impl fmt::Debug for ProgressLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressLog")
            .field("callback", &self.callback.is_some())
            .finish()
    }
}
