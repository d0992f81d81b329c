use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use trawl_core::config::IndexEngine;
use trawl_core::pipeline::spawn as spawn_scheduler;
use trawl_core::{
    Config, DocumentArchive, MemoryIndex, Pipeline, ProxyContext, ProxyServer, QueueDirectory,
    Result, SearchIndex, SequenceCounter, Shutdown,
};

/// Recording HTTP proxy that archives and indexes the pages it serves.
#[derive(Parser, Debug)]
#[command(version)]
struct Args {
    /// TOML configuration file. Built-in defaults apply when omitted.
    #[arg(long, short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Root directory for capture logs, archive shards and the index.
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    #[arg(long)]
    port: Option<u16>,

    /// Forward every request through this `host:port` proxy.
    #[arg(long, value_name = "HOST:PORT")]
    upstream: Option<String>,

    /// Keep an `.mlog` copy of every exchange.
    #[arg(long)]
    debug_mlog: bool,

    /// Print the effective configuration and exit.
    #[arg(long)]
    print_config: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing();

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }
    if let Some(port) = args.port {
        config.proxy.port = port;
    }
    if args.upstream.is_some() {
        config.proxy.upstream = args.upstream;
    }
    config.capture.debug_mlog |= args.debug_mlog;

    if args.print_config {
        let text = toml::to_string_pretty(&config).map_err(|err| trawl_core::TrawlError::Config {
            path: args.config.unwrap_or_default(),
            reason: err.to_string(),
        })?;
        print!("{text}");
        return Ok(());
    }

    run(&config)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn run(config: &Config) -> Result<()> {
    tracing::info!(
        version = trawl_core::TRAWL_CORE_VERSION,
        data_dir = %config.data_dir.display(),
        "starting"
    );
    let queue = QueueDirectory::open(config.logs_dir())?;
    let counter = Arc::new(SequenceCounter::new(queue));
    let archive = DocumentArchive::open(config.archive_dir())?;
    let index = open_index(config)?;

    let shutdown = Shutdown::new();
    shutdown.trigger_on_signal()?;
    let pipeline = Pipeline::new(
        counter.clone(),
        Box::new(config.distiller()),
        index,
        archive,
        config.scheduler_settings(),
    );
    let scheduler = spawn_scheduler(pipeline, shutdown.clone())?;

    let ctx = ProxyContext::new(counter, config.capture_settings()).with_upstream(config.upstream()?);
    let served = ProxyServer::bind(config.listen_addr(), ctx, config.proxy.workers, shutdown)
        .and_then(ProxyServer::run);

    scheduler.shutdown();
    scheduler.join()?;
    served
}

fn open_index(config: &Config) -> Result<Box<dyn SearchIndex + Send>> {
    match config.index.engine {
        #[cfg(feature = "lex")]
        IndexEngine::Tantivy => Ok(Box::new(trawl_core::TantivyIndex::open(&config.index_dir())?)),
        #[cfg(not(feature = "lex"))]
        IndexEngine::Tantivy => {
            tracing::warn!("built without the lex feature; using the in-memory index");
            Ok(Box::new(MemoryIndex::new()))
        }
        IndexEngine::Memory => Ok(Box::new(MemoryIndex::new())),
    }
}
