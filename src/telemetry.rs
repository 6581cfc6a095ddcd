use tracing_subscriber::EnvFilter;

/// Initialize structured JSON logging, filtered by `RUST_LOG` (default `info`).
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();
}

/// Register descriptions for the pipeline's metrics.
pub fn describe_metrics() {
    metrics::describe_counter!("invites_enqueued_total", "Invitation jobs queued by dispatch");
    metrics::describe_counter!("invites_sent_total", "Invitation emails accepted by the mail provider");
    metrics::describe_counter!("invites_failed_total", "Invitations that failed on their final attempt");
    metrics::describe_counter!("invites_retried_total", "Failed invitation attempts scheduled for retry");
    metrics::describe_histogram!("invite_send_seconds", "Time spent calling the mail provider");
    metrics::describe_gauge!("invite_queue_depth", "Invitation jobs waiting or delayed");
}
