use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use telsink::api::{start_server, AppState, ServerConfig};
use telsink::config::SinkConfig;
use telsink::flusher::{PipelineConfig, RetryPolicy, SinkPipeline};
use telsink::metrics::SinkMetrics;
use telsink::partition::PartitionTemplate;
use telsink::queue::IntakeQueue;
use telsink::session::{RollingPolicy, SessionConfig, SessionManager};
use telsink::store::{ParquetStore, StoreConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("telsink=info".parse()?))
        .init();

    tracing::info!("telsink starting...");

    let config = SinkConfig::from_env();
    config.validate()?;
    let template = PartitionTemplate::parse(&config.partition_template)?;

    let metrics = Arc::new(SinkMetrics::new());

    let store = Arc::new(
        ParquetStore::connect(
            StoreConfig {
                root: config.store_root.clone(),
                connect_timeout: config.connect_timeout,
                connect_retries: config.connect_retries,
                connect_retry_interval: config.connect_retry_interval,
                replication: config.replication,
                auth: config.auth.clone(),
            },
            Arc::clone(&metrics.store),
        )
        .await,
    );

    let queue = Arc::new(match config.queue_capacity {
        Some(capacity) => {
            tracing::info!(capacity, overflow = ?config.overflow, "intake queue bounded");
            IntakeQueue::bounded(capacity, config.overflow, Arc::clone(&metrics.intake))
        }
        None => IntakeQueue::new(Arc::clone(&metrics.intake)),
    });

    let sessions = Arc::new(SessionManager::new(
        Arc::clone(&store),
        template,
        SessionConfig {
            output_path: config.output_path.clone(),
            file_prefix: config.file_prefix.clone(),
            file_extension: config.file_extension.clone(),
            force_immediate_flush: config.force_immediate_flush,
        },
        Arc::clone(&metrics),
    ));

    let pipeline = Arc::new(SinkPipeline::new(
        Arc::clone(&queue),
        Arc::clone(&sessions),
        PipelineConfig {
            flush_interval: config.flush_interval,
            roll_interval: config.roll_interval,
            batch_size: config.batch_size,
            retry: RetryPolicy {
                max_retries: config.max_retries,
                interval: config.retry_interval,
            },
            rolling: RollingPolicy {
                max_age: config.max_session_age,
                max_rows: config.max_rows,
            },
            shutdown_timeout: config.shutdown_timeout,
        },
        Arc::clone(&metrics),
    ));
    pipeline.start();
    tracing::info!(
        flush_interval = ?config.flush_interval,
        roll_interval = ?config.roll_interval,
        batch_size = config.batch_size,
        "sink pipeline started"
    );

    let state = Arc::new(AppState {
        queue,
        sessions,
        metrics,
    });

    let server_config = ServerConfig {
        host: config.http_host.clone(),
        port: config.http_port,
    };

    let shutdown_pipeline = Arc::clone(&pipeline);
    let shutdown = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for shutdown signal");
        }
        shutdown_pipeline.shutdown().await;
    };

    start_server(server_config, state, shutdown).await?;

    Ok(())
}
