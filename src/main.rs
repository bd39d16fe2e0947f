//! embedfan CLI: prepare, split, inspect and benchmark embedded collections.

use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use embedfan::{EmbedfanConfig, bench, fanout, io as jsonl, prepare, split};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// YAML configuration file. Defaults reproduce the sample_mflix run
    /// against `embedfan.redb` in the working directory.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Store backend, overriding the config file.
    #[arg(long, value_parser = ["redb", "mongo"])]
    backend: Option<String>,

    /// redb file path, overriding the config file.
    #[arg(long)]
    path: Option<String>,

    /// MongoDB connection string, overriding the config file.
    #[arg(long)]
    uri: Option<String>,

    /// Database name, overriding the config file.
    #[arg(long)]
    database: Option<String>,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fan out the source collection, then split the result.
    Prepare,
    /// Fan out the source collection only.
    Fanout,
    /// Split an already fanned-out collection.
    Split,
    /// Load newline-delimited JSON into a collection.
    Import {
        #[arg(long)]
        file: PathBuf,
        /// Target collection; defaults to the fanout source collection.
        #[arg(long)]
        collection: Option<String>,
    },
    /// Write a collection as newline-delimited JSON.
    Export {
        #[arg(long)]
        collection: String,
        /// Output file; stdout when omitted.
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Run the aggregation speed test from the `bench` config section.
    Bench,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(args: &Args) -> Result<EmbedfanConfig> {
    let mut config = match &args.config {
        Some(path) => EmbedfanConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => EmbedfanConfig::default(),
    };
    if let Some(backend) = &args.backend {
        config.store.backend = backend.clone();
    }
    if let Some(path) = &args.path {
        config.store.path = Some(path.clone());
    }
    if let Some(uri) = &args.uri {
        config.store.uri = Some(uri.clone());
    }
    if let Some(database) = &args.database {
        config.store.database = database.clone();
    }
    config.validate().context("invalid configuration")?;
    // Each command is its own process, so an in-memory store would forget
    // everything between `import` and `prepare`.
    if config.store.backend == "in_memory" {
        bail!("store.backend 'in_memory' does not persist between commands; use redb or mongo");
    }
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let config = load_config(&args)?;
    let store_cfg = config.store.store_config()?;
    let store = store_cfg
        .open(&config.store.database)
        .with_context(|| format!("opening {} store", store_cfg.kind()))?;
    let store = store.as_ref();

    match args.command {
        Command::Prepare => {
            let report = prepare(store, &config.fanout_config(), &config.split_config())?;
            println!(
                "{} source rows -> {} rows; {} vector rows, {} metadata rows",
                report.fanout.source_rows,
                report.fanout.output_rows,
                report.split.vectors_rows,
                report.split.metadata_rows
            );
        }
        Command::Fanout => {
            let report = fanout::run(store, &config.fanout_config())?;
            println!(
                "{} source rows -> {} rows in {:?}",
                report.source_rows, report.output_rows, report.elapsed
            );
        }
        Command::Split => {
            let report = split::run(store, &config.split_config())?;
            println!(
                "{} vector rows, {} metadata rows in {:?}",
                report.vectors_rows, report.metadata_rows, report.elapsed
            );
        }
        Command::Import { file, collection } => {
            let collection = collection.unwrap_or_else(|| config.fanout.source_collection.clone());
            let reader = BufReader::new(
                File::open(&file).with_context(|| format!("opening {}", file.display()))?,
            );
            let rows = jsonl::import_jsonl(store, &collection, reader)?;
            println!("imported {rows} rows into {collection}");
        }
        Command::Export { collection, file } => {
            let rows = match file {
                Some(path) => {
                    let writer = BufWriter::new(
                        File::create(&path)
                            .with_context(|| format!("creating {}", path.display()))?,
                    );
                    jsonl::export_jsonl(store, &collection, writer)?
                }
                None => jsonl::export_jsonl(store, &collection, io::stdout().lock())?,
            };
            tracing::info!(rows, collection = %collection, "export_done");
        }
        Command::Bench => {
            let report = bench::run(store, &config.bench_config()?)?;
            println!(
                "Time: {} ms Operations/s = {:.0} ({} failed)",
                report.elapsed.as_millis(),
                report.ops_per_sec,
                report.failures
            );
        }
    }

    Ok(())
}
