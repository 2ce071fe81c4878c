//! ELB log ingestor - main entry point

use anyhow::Result;
use elb_common::logging::{init_logging, LogConfig};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use elb_ingestor::{
    config::{Config, FetchMode},
    health,
    pipeline::{Coordinator, LineParser},
    source::{FixedListSource, LocalSource, ObjectStoreSource, Prefixes, SourceAdapter, SourceBackend},
    stats::Stats,
    storage::Storage,
    store::ElasticsearchStore,
};

/// Filter applied when `LOG_FILTER` is unset; the AWS SDK is chatty at info.
const DEFAULT_LOG_FILTER: &str = "aws_smithy_runtime=warn,aws_config=warn,hyper=warn";

#[tokio::main]
async fn main() -> Result<()> {
    let mut log_config = LogConfig::from_env()?;
    if log_config.filter_directives.is_none() {
        log_config.filter_directives = Some(DEFAULT_LOG_FILTER.to_string());
    }
    let _log_guard = init_logging(&log_config)?;

    info!("Starting ELB log ingestor");

    let config = Config::load()?;
    info!(
        fetch_mode = config.fetch.name(),
        elasticsearch_hosts = ?config.elasticsearch.hosts,
        "Configuration loaded"
    );

    let source = build_source(&config).await?;
    let source_kind = source.kind();
    let store = ElasticsearchStore::new(
        config.elasticsearch.hosts.clone(),
        config.elasticsearch.request_timeout,
    )?;
    let parser = LineParser::new(config.log_format()?);
    let stats = Arc::new(Stats::new());

    let coordinator = Arc::new(Coordinator::new(
        Arc::new(source),
        Arc::new(store),
        parser,
        config.pipeline.clone(),
        Arc::clone(&stats),
    ));

    let shutdown = CancellationToken::new();

    let listener = tokio::net::TcpListener::bind(config.server.bind_addr()).await?;
    let server = tokio::spawn(health::serve(
        listener,
        health::router(Arc::clone(&stats), source_kind),
        shutdown.clone(),
    ));

    let pipeline = tokio::spawn(coordinator.run(shutdown.clone()));

    shutdown_signal().await;
    shutdown.cancel();

    if let Err(e) = pipeline.await? {
        error!(error = %e, "Pipeline stopped with error");
    }
    server.await??;

    let snapshot = stats.snapshot();
    info!(
        files_completed = snapshot.fetcher.files_completed,
        documents_written = snapshot.shipper.documents_written,
        documents_failed = snapshot.shipper.documents_failed,
        parse_errors = snapshot.parser.parse_errors,
        "ELB log ingestor shut down gracefully"
    );

    Ok(())
}

async fn build_source(config: &Config) -> Result<SourceBackend> {
    match &config.fetch {
        FetchMode::LocalFile {
            input_dir,
            processing_dir,
            processed_dir,
        } => {
            let source = LocalSource::new(input_dir, processing_dir, processed_dir);
            source.ensure_dirs().await?;
            info!(input = %input_dir.display(), "Using local directory source");
            Ok(SourceBackend::Local(source))
        },
        FetchMode::ObjectStore {
            storage,
            search_prefix,
            working_prefix,
            done_prefix,
        } => {
            let client = Storage::new(storage.clone()).await?;
            let source = ObjectStoreSource::new(
                Arc::new(client),
                Prefixes::new(search_prefix, working_prefix, done_prefix),
            )?;
            info!(bucket = %storage.bucket, prefix = %search_prefix, "Using object store source");
            Ok(SourceBackend::ObjectStore(source))
        },
        FetchMode::FixedList {
            storage,
            list_file,
            work_dir,
        } => {
            let client = Storage::new(storage.clone()).await?;
            let targets = FixedListSource::load_targets(list_file).await?;
            let source = FixedListSource::new(Arc::new(client), targets, work_dir)?;
            source.ensure_dirs().await?;
            info!(
                bucket = %storage.bucket,
                targets = source.targets().len(),
                work_dir = %work_dir.display(),
                "Using fixed-list backfill source"
            );
            Ok(SourceBackend::FixedList(source))
        },
    }
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, draining pipeline");
        },
        _ = terminate => {
            info!("Received terminate signal, draining pipeline");
        },
    }
}
