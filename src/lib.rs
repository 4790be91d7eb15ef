//! gapfill core crate.
//!
//! Incremental, resumable collection of time-stamped numeric and text data:
//! - quantized timestamps and password-based value encryption
//! - a SQLite channel store keyed by `(channel, timestamp)`
//! - pluggable sources and the gap-detecting acquirer that drives them
//! - fixed-length training windows over the collected numeric channels

mod acquirer;
mod channel;
mod config;
mod csv_source;
mod encryption;
mod generator;
mod observability;
mod source;
mod store;
mod timestamp;

pub use acquirer::{
    shrink_to_gap, AcquireError, Acquirer, AcquisitionReport, SourceOutcome, SourceReport,
};
pub use channel::{
    channel_id, parse_value_type, validate_identifier, Channel, Entry, ValidationError, Value,
    ValueType, MAX_ID_LEN,
};
pub use config::{
    acquisition_config_from_env, sampling_interval_from_env, AcquisitionConfig, ConfigError,
    SAMPLING_INTERVAL_ENV, START_DATE_ENV,
};
pub use csv_source::CsvFileSource;
pub use encryption::{decrypt, encrypt, generate_password, CipherKey, EncryptionError};
pub use generator::{
    build_windows, Frame, GapPolicy, GeneratorConfig, GeneratorError, GeneratorReport,
    TrainingWindow,
};
pub use observability::{
    init_logging, log_acquisition_config, log_acquisition_summary, log_app_start,
    logging_config_from_env, LogFormat, LoggingConfig, LoggingInitError,
};
pub use source::{ProgressLog, Source, SourceError};
pub use store::{ChannelStore, ChannelSummary, StoreError, MIN_PASSWORD_LEN};
pub use timestamp::{parse_granularity, Granularity, TimeValue, Timestamp, TimestampError};
