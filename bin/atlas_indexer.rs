//! # Atlas Indexer CLI
//!
//! Indexes RIPE Atlas results into Elasticsearch.
//!
//! ## Usage
//!
//! ```bash
//! # latest result of every probe
//! atlas-indexer latest 1001 1004
//!
//! # replay a time range, one day per request
//! atlas-indexer bulk 1001 --start-time 1400000000 --stop-time 1400864000
//!
//! # follow the live stream
//! atlas-indexer -vv stream 1001
//! ```
//!
//! Settings come from `Config.toml` and `ATLAS__*` variables; flags win.

use anyhow::Result;
use atlas_indexer::{
    lookup::{MetadataLookup, RipeStatLookup},
    normalizer::ResultNormalizer,
    pipeline::{historical::HistoricalDriver, live::LiveDriver, snapshot::SnapshotDriver, Ingestor, RunStats},
    registry::ProbeRegistry,
    settings::{parse_string_list, Settings},
    sink::{BatchSink, ElasticsearchSink, SubmitOptions},
    source::{AtlasApi, AtlasClient, AtlasStream},
};
use clap::{ArgAction, Parser, Subcommand};
use log::info;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "atlas-indexer", version, about = "Index RIPE Atlas measurement results")]
struct Cli {
    /// -v info, -vv debug (RUST_LOG overrides)
    #[arg(short = 'v', long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Target index
    #[arg(short = 'I', long, global = true)]
    index: Option<String>,

    /// Document type; derived from the measurement type when empty
    #[arg(short = 'D', long = "doc-type", global = true)]
    doc_type: Option<String>,

    /// Elasticsearch hosts, comma separated `host[:port]`
    #[arg(short = 'H', long, global = true)]
    hosts: Option<String>,

    /// Rebuild the probe registry from the archive before indexing
    #[arg(long, global = true)]
    refresh_probes: bool,

    /// Serve Prometheus metrics on this address
    #[cfg(feature = "observability")]
    #[arg(long, global = true)]
    metrics_addr: Option<std::net::SocketAddr>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Index the latest result of every probe
    Latest {
        #[arg(required = true)]
        msm_ids: Vec<u64>,
        /// Latest-results endpoint
        #[arg(short = 'U', long)]
        url: Option<String>,
    },
    /// Replay a time range of results
    Bulk {
        #[arg(required = true)]
        msm_ids: Vec<u64>,
        /// Measurement endpoint
        #[arg(short = 'U', long)]
        url: Option<String>,
        #[arg(long)]
        start_time: Option<i64>,
        #[arg(long)]
        stop_time: Option<i64>,
        /// Window size in seconds
        #[arg(long)]
        chunk_period: Option<i64>,
    },
    /// Follow the live result stream
    Stream {
        #[arg(required = true)]
        msm_ids: Vec<u64>,
    },
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn apply_overrides(settings: &mut Settings, cli: &Cli) {
    if let Some(index) = &cli.index {
        settings.sink.index = index.clone();
    }
    if let Some(doc_type) = &cli.doc_type {
        settings.sink.doc_type = doc_type.clone();
    }
    if let Some(hosts) = cli.hosts.as_deref().and_then(parse_string_list) {
        if !hosts.is_empty() {
            settings.sink.hosts = hosts;
        }
    }
    if let Command::Bulk {
        start_time,
        stop_time,
        chunk_period,
        ..
    } = &cli.command
    {
        if let Some(start) = start_time {
            settings.pipeline.start_time = *start;
        }
        if let Some(stop) = stop_time {
            settings.pipeline.stop_time = *stop;
        }
        if let Some(period) = chunk_period {
            settings.pipeline.chunk_period = *period;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut settings = Settings::new()?;
    apply_overrides(&mut settings, &cli);
    info!("Settings loaded: index={} hosts={:?}", settings.sink.index, settings.sink.hosts);

    #[cfg(feature = "observability")]
    if let Some(addr) = cli.metrics_addr {
        atlas_indexer::metrics::install_exporter(addr)?;
        info!("Metrics exporter listening on {}", addr);
    }

    let (latest_url, measurement_url) = match &cli.command {
        Command::Latest { url, .. } => (url.clone(), None),
        Command::Bulk { url, .. } => (None, url.clone()),
        Command::Stream { .. } => (None, None),
    };
    let source: Arc<dyn AtlasApi> =
        Arc::new(AtlasClient::new(&settings.atlas)?.with_measurement_urls(latest_url, measurement_url));
    let lookup: Arc<dyn MetadataLookup> = Arc::new(RipeStatLookup::new(&settings.lookup)?);

    let registry = Arc::new(ProbeRegistry::new(
        Arc::clone(&source),
        Arc::clone(&lookup),
        &settings.probes.cache_file,
        settings.probes.workers,
    ));
    let loaded = registry.load();
    if cli.refresh_probes || loaded == 0 {
        let added = registry.refresh(cli.refresh_probes).await?;
        info!("Probe registry: {} added, {} total", added, registry.len());
    }

    let sink: Arc<dyn BatchSink> = Arc::new(ElasticsearchSink::new(settings.sink_base_urls())?);
    let normalizer = ResultNormalizer::new(lookup, settings.sink.index.clone(), settings.sink.doc_type.clone());
    let options = SubmitOptions {
        index: settings.sink.index.clone(),
        doc_type: settings.sink.doc_type.clone(),
        chunk_size: settings.sink.chunk_size,
        timeout: settings.submit_timeout(),
    };
    let ingestor = Arc::new(
        Ingestor::new(registry, normalizer, sink, options).with_progress_every(settings.pipeline.progress_every),
    );

    let stats: RunStats = match &cli.command {
        Command::Latest { msm_ids, .. } => SnapshotDriver::new(source, ingestor).run(msm_ids).await?,
        Command::Bulk { msm_ids, .. } => {
            HistoricalDriver::new(
                source,
                ingestor,
                settings.pipeline.start_time,
                settings.pipeline.stop_time,
                settings.pipeline.chunk_period,
            )
            .run(msm_ids)
            .await?
        }
        Command::Stream { msm_ids } => {
            LiveDriver::new(Arc::new(AtlasStream::new(&settings.atlas)), ingestor)
                .run(msm_ids)
                .await?
        }
    };

    println!(
        "processed={} documents={} indexed={} failed_items={} failed_batches={} unresolved={} parse_errors={}",
        stats.processed,
        stats.documents,
        stats.indexed,
        stats.failed_items,
        stats.failed_batches,
        stats.unresolved,
        stats.parse_errors
    );
    Ok(())
}
