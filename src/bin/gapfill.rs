use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use gapfill::{
    acquisition_config_from_env, build_windows, init_logging, log_acquisition_config,
    log_acquisition_summary, log_app_start, logging_config_from_env, parse_granularity,
    sampling_interval_from_env, Acquirer, AcquisitionConfig, ChannelStore, CsvFileSource,
    GapPolicy, GeneratorConfig, Granularity, ProgressLog, Source, SourceOutcome, Timestamp,
    ValueType,
};

#[derive(Parser)]
#[command(version, about = "Incremental time-series collection into a local channel store")]
struct Cli {
    /// Password for encrypted channels and credentials.
    #[arg(long, global = true, env = "GAPFILL_PASSWORD", hide_env_values = true)]
    password: Option<String>,
    /// Sampling granularity (day, hour, minute) for new stores; overrides
    /// GAPFILL_SAMPLING_INTERVAL. Existing stores keep theirs and reject a different one.
    #[arg(long, global = true)]
    granularity: Option<String>,
    /// Print source progress messages to stderr.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Create a new, empty store.
    Create { store: PathBuf },
    /// Print the entries of the given channels, or of every channel with `all`.
    List {
        store: PathBuf,
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// One row per channel with entry counts and covered range.
    Summary {
        store: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Fill missing ranges from CSV sources.
    Acquire(AcquireCmd),
    /// Import a whole CSV file.
    Import {
        store: PathBuf,
        #[arg(long)]
        name: String,
        file: PathBuf,
    },
    /// Training windows over all numeric channels.
    Windows {
        store: PathBuf,
        #[arg(long, default_value_t = 50)]
        sequence_length: usize,
        #[arg(long, default_value_t = 1)]
        stride: usize,
        /// Report gaps and continue instead of failing.
        #[arg(long)]
        skip_gaps: bool,
    },
    Credential(CredentialCmd),
}

#[derive(Args)]
struct AcquireCmd {
    store: PathBuf,
    /// `NAME=FILE.csv`, repeatable; sources run in the given order.
    #[arg(long = "source", value_name = "NAME=FILE", required = true, value_parser = parse_source_arg)]
    sources: Vec<(String, PathBuf)>,
    #[arg(long)]
    start: Option<String>,
    #[arg(long)]
    end: Option<String>,
}

#[derive(Args)]
struct CredentialCmd {
    #[command(subcommand)]
    sub: CredentialSub,
}

#[derive(Subcommand)]
enum CredentialSub {
    Set {
        store: PathBuf,
        id: String,
        value: String,
    },
    Get {
        store: PathBuf,
        id: String,
    },
}

impl Cmd {
    fn name(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::List { .. } => "list",
            Self::Summary { .. } => "summary",
            Self::Acquire(_) => "acquire",
            Self::Import { .. } => "import",
            Self::Windows { .. } => "windows",
            Self::Credential(_) => "credential",
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let logging = logging_config_from_env();
    init_logging(&logging)?;
    log_app_start(&logging, cli.cmd.name());

    let mut config = acquisition_config_from_env()?;
    let requested = match &cli.granularity {
        Some(raw) => Some(parse_granularity(raw)?),
        None => sampling_interval_from_env()?,
    };
    if let Some(granularity) = requested {
        config = at_granularity(&config, granularity)?;
    }
    log_acquisition_config(&config);

    let password = cli.password.as_deref();
    let progress = if cli.verbose {
        ProgressLog::new(|msg| eprintln!("{msg}"))
    } else {
        ProgressLog::silent()
    };

    match cli.cmd {
        Cmd::Create { store } => {
            ChannelStore::create(&store, password, config.granularity)?;
            println!(
                "Created store {} ({} granularity)",
                store.display(),
                config.granularity
            );
        }
        Cmd::List { store, ids } => {
            let store = ChannelStore::open_existing(&store, password, requested)?;
            let ids = if ids.iter().any(|id| id == "all") {
                store
                    .get_all_channels(false)?
                    .into_iter()
                    .map(|channel| channel.id)
                    .collect()
            } else {
                ids
            };

            for id in ids {
                println!("{id}");
                for entry in store.get(&id)? {
                    println!("  {}  {}", entry.timestamp, entry.value);
                }
            }
        }
        Cmd::Summary { store, json } => {
            let store = ChannelStore::open_existing(&store, password, requested)?;
            let rows = store.summary()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                println!(
                    "{:<40} {:<8} {:<9} {:>8}  {:<16}  {:<16}  description",
                    "channel", "type", "encrypted", "entries", "first", "last"
                );
                for row in rows {
                    println!(
                        "{:<40} {:<8} {:<9} {:>8}  {:<16}  {:<16}  {}",
                        row.channel.id,
                        row.channel.value_type.as_str(),
                        row.channel.encrypted,
                        row.entries,
                        display_or_dash(row.first),
                        display_or_dash(row.last),
                        row.channel.description
                    );
                }
            }
        }
        Cmd::Acquire(cmd) => {
            let mut store = open_or_create(&cmd.store, password, requested, &config)?;
            let config = at_granularity(&config, store.granularity())?;
            let start = match cmd.start {
                Some(raw) => Timestamp::new(raw, config.granularity)?,
                None => config.start,
            };
            let end = match cmd.end {
                Some(raw) => Timestamp::new(raw, config.granularity)?,
                None => Timestamp::now(config.granularity),
            };

            let mut sources: Vec<Box<dyn Source>> = Vec::with_capacity(cmd.sources.len());
            for (name, path) in cmd.sources {
                sources.push(Box::new(CsvFileSource::open(name, path)?));
            }

            let mut acquirer = Acquirer::new(config, sources);
            let report = acquirer.run(&mut store, start, end, &progress)?;
            log_acquisition_summary(&report);

            for row in &report.sources {
                match &row.outcome {
                    SourceOutcome::Satisfied => println!("{}: up to date", row.source),
                    SourceOutcome::Fetched { start, end } => {
                        println!("{}: fetched {start} .. {end}", row.source)
                    }
                    SourceOutcome::Failed { start, end, error } => {
                        println!("{}: FAILED {start} .. {end}: {error}", row.source)
                    }
                    SourceOutcome::Rejected { error } => {
                        println!("{}: REJECTED: {error}", row.source)
                    }
                    SourceOutcome::NoChannels => println!("{}: no channels", row.source),
                }
            }

            let failed = report.failed().count();
            if failed > 0 {
                return Err(format!("{failed} source(s) failed").into());
            }
        }
        Cmd::Import { store, name, file } => {
            let mut store = open_or_create(&store, password, requested, &config)?;
            let mut source = CsvFileSource::open(name, &file)?;
            let Some((first, last)) = source.time_bounds(store.granularity())? else {
                println!("{}: no rows to import", file.display());
                return Ok(());
            };

            for channel in source.channels() {
                store.ensure_channel(&channel)?;
            }
            source.run(&mut store, first, last, &progress)?;
            println!(
                "Imported {} channel(s) from {} ({first} .. {last})",
                source.tokens().len(),
                file.display()
            );
        }
        Cmd::Windows {
            store,
            sequence_length,
            stride,
            skip_gaps,
        } => {
            let mut store = ChannelStore::open_existing(&store, password, requested)?;
            for channel in store.get_all_channels(false)? {
                if channel.value_type == ValueType::Numeric {
                    store.ensure_channel(&channel)?;
                }
            }

            let generator = GeneratorConfig {
                sequence_length,
                stride,
                gap_policy: if skip_gaps {
                    GapPolicy::ReportAndSkip
                } else {
                    GapPolicy::Strict
                },
            };
            let (_, report) = build_windows(&store, &generator)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Cmd::Credential(CredentialCmd { sub }) => match sub {
            // Credentials are independent of sampling, so only a new store uses `requested`.
            CredentialSub::Set { store, id, value } => {
                let mut store = if store.exists() {
                    ChannelStore::open_existing(&store, password, None)?
                } else {
                    ChannelStore::open(&store, password, config.granularity)?
                };
                store.add_credential(&id, &value)?;
                store.commit()?;
                println!("Stored credential {id}");
            }
            CredentialSub::Get { store, id } => {
                let store = ChannelStore::open_existing(&store, password, None)?;
                match store.get_credential(&id)? {
                    Some(value) => println!("{value}"),
                    None => return Err(format!("no credential named {id}").into()),
                }
            }
        },
    }

    Ok(())
}

/// Existing stores keep their recorded granularity; new ones use the configured one.
fn open_or_create(
    path: &Path,
    password: Option<&str>,
    requested: Option<Granularity>,
    config: &AcquisitionConfig,
) -> Result<ChannelStore, Box<dyn std::error::Error>> {
    if path.exists() {
        Ok(ChannelStore::open_existing(path, password, requested)?)
    } else {
        Ok(ChannelStore::open(path, password, config.granularity)?)
    }
}

fn at_granularity(
    config: &AcquisitionConfig,
    granularity: Granularity,
) -> Result<AcquisitionConfig, Box<dyn std::error::Error>> {
    Ok(AcquisitionConfig::new(
        granularity,
        Timestamp::new(config.start, granularity)?,
    ))
}

fn parse_source_arg(raw: &str) -> Result<(String, PathBuf), String> {
    let (name, file) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=FILE, got '{raw}'"))?;
    if name.trim().is_empty() || file.trim().is_empty() {
        return Err(format!("expected NAME=FILE, got '{raw}'"));
    }
    Ok((name.trim().to_string(), PathBuf::from(file.trim())))
}

fn display_or_dash(ts: Option<Timestamp>) -> String {
    ts.map(|ts| ts.to_string()).unwrap_or_else(|| "-".to_string())
}
