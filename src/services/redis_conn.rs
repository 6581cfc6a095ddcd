use redis::aio::ConnectionManager;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Process-wide Redis handle. The managed connection is opened on first use,
/// shared by every clone, and re-established by redis after a dropped socket
/// or server restart.
#[derive(Clone)]
pub struct RedisHandle {
    client: redis::Client,
    conn: Arc<OnceCell<ConnectionManager>>,
}

impl RedisHandle {
    pub fn open(redis_url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            conn: Arc::new(OnceCell::new()),
        })
    }

    pub async fn connection(&self) -> Result<ConnectionManager, redis::RedisError> {
        self.conn
            .get_or_try_init(|| async {
                tracing::debug!("Opening managed Redis connection");
                ConnectionManager::new(self.client.clone()).await
            })
            .await
            .cloned()
    }

    /// Check Redis connectivity (for health checks).
    pub async fn ping(&self) -> Result<(), redis::RedisError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}
