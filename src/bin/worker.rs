use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;

use vayam::{
    config::AppConfig,
    services::{
        batch_store::RedisBatchStore,
        mailer::ResendMailer,
        queue::RedisJobQueue,
        redis_conn::RedisHandle,
        worker::{InviteWorker, WorkerRuntime},
    },
    telemetry,
};

#[tokio::main]
async fn main() {
    telemetry::init_tracing();

    tracing::info!("Starting invitation worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");

    let metrics_addr: SocketAddr = config
        .worker_metrics_addr
        .parse()
        .expect("Invalid WORKER_METRICS_ADDR");
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .expect("Failed to install Prometheus exporter");
    telemetry::describe_metrics();

    tracing::info!("Initializing services");
    let redis = RedisHandle::open(&config.redis_url).expect("Invalid Redis URL");
    redis.ping().await.expect("Failed to connect to Redis");

    let queue = Arc::new(RedisJobQueue::new(redis.clone()).with_lease(config.lease()));
    let batches = Arc::new(RedisBatchStore::new(redis));
    let mailer = ResendMailer::new(
        &config.resend_base_url,
        &config.resend_api_key,
        &config.email_from,
    )
    .expect("Failed to initialize Resend client");

    let worker = InviteWorker::new(batches, Arc::new(mailer), &config.platform_url);
    let runtime = WorkerRuntime::new(
        queue,
        worker,
        config.worker_concurrency,
        config.worker_rate_per_second,
        config.poll_interval(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Shutdown signal received, finishing in-flight jobs");
        shutdown_tx.send(true).ok();
    });

    tracing::info!(
        concurrency = config.worker_concurrency,
        rate_per_second = config.worker_rate_per_second,
        "Worker ready, starting job processing loop"
    );

    runtime.run(shutdown_rx).await;
}
