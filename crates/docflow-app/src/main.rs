use std::process;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt;

use docflow_app::api::ApiService;
use docflow_app::cli::{Cli, Commands};
use docflow_app::config::{self, AppConfig};
use docflow_app::extract::word::WORD_MIME_TYPES;
use docflow_app::extract::{
    ExtractorRegistry, LocalImageExtractor, PdfExtractor, TextractExtractor, WordExtractor,
};
use docflow_app::ingest::IngestService;
use docflow_app::queue::{RedisQueue, TaskQueue};
use docflow_app::service::DocumentPipeline;
use docflow_app::storage::{self, BlobStore};
use docflow_app::worker::DocumentWorker;
use docflow_app::AppError;

const IMAGE_MIME_TYPES: [&str; 3] = ["image/jpeg", "image/png", "image/tiff"];

#[tokio::main]
async fn main() {
    // Environment overrides may live in a local .env during development.
    dotenvy::dotenv().ok();

    let cli = Cli::parse_args();
    init_tracing(match cli.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    });

    if let Err(err) = run(cli).await {
        eprintln!("{err}");
        process::exit(1);
    }
}

fn init_tracing(level: LevelFilter) {
    let subscriber = fmt().with_max_level(level).with_target(false).finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::warn!("tracing subscriber already set; skipping re-initialization");
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    match cli.command {
        Some(Commands::Serve) => {
            let cfg = config::load()?;
            let (pipeline, _queue) = build_pipeline(&cfg).await?;
            let service = Arc::new(ApiService::new(pipeline));
            docflow_server::serve(
                &cfg.server.listen_addr,
                service,
                docflow_server::DEFAULT_MAX_UPLOAD_BYTES,
            )
            .await?;
        }
        Some(Commands::Work) => {
            let cfg = config::load()?;
            let (pipeline, queue) = build_pipeline(&cfg).await?;
            let worker = DocumentWorker::new(
                queue,
                pipeline.clone(),
                cfg.queue.concurrency,
                cfg.queue.process_timeout(),
            );

            let shutdown = CancellationToken::new();
            tokio::spawn({
                let shutdown = shutdown.clone();
                async move {
                    wait_for_signal().await;
                    tracing::info!("shutdown signal received; stopping worker");
                    shutdown.cancel();
                }
            });

            worker.run(shutdown).await;
            pipeline.registry().close_all().await;
        }
        Some(Commands::Cleanup) => {
            let cfg = config::load()?;
            let (pipeline, _queue) = build_pipeline(&cfg).await?;
            let deleted = pipeline.ingest().cleanup().await?;
            tracing::info!(deleted, "retention sweep finished");
        }
        None => {
            use clap::CommandFactory;
            Cli::command().print_help().ok();
        }
    }

    Ok(())
}

/// Wire storage, broker, extractors, and the pipeline from config.
async fn build_pipeline(cfg: &AppConfig) -> Result<(DocumentPipeline, RedisQueue), AppError> {
    let storage: Arc<dyn BlobStore> = Arc::from(storage::connect(&cfg.storage).await?);
    let queue = RedisQueue::connect(&cfg.queue).await?;
    let queue_handle: Arc<dyn TaskQueue> = Arc::new(queue.clone());

    let mut registry = ExtractorRegistry::new();
    registry.register(&["application/pdf"], Arc::new(PdfExtractor::new()));
    if cfg.extract.textract.enabled {
        let textract = TextractExtractor::connect(&cfg.extract.textract).await;
        registry.register(&IMAGE_MIME_TYPES, Arc::new(textract));
    } else {
        registry.register(
            &IMAGE_MIME_TYPES,
            Arc::new(LocalImageExtractor::new(&cfg.extract)),
        );
    }
    registry.register(&WORD_MIME_TYPES, Arc::new(WordExtractor::new()));

    let ingest = IngestService::new(
        Arc::clone(&storage),
        Arc::clone(&queue_handle),
        cfg.ingest.clone(),
    );
    let pipeline = DocumentPipeline::new(Arc::new(registry), storage, queue_handle, ingest);

    Ok((pipeline, queue))
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::warn!(%error, "failed to capture Ctrl+C signal");
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(error) => {
                tracing::warn!(%error, "failed to capture SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = sigterm => {}
    }
}
