//! Redis service used as the outbound notification queue

use redis::{AsyncCommands, Client};

use crate::error::{AppError, AppResult};

/// Explicitly injected Redis handle; there is no process-wide client
#[derive(Clone)]
pub struct RedisService {
    client: Client,
}

impl RedisService {
    /// Create a new Redis service and verify connectivity
    pub async fn new(url: &str) -> AppResult<Self> {
        let client = Client::open(url)
            .map_err(|e| AppError::Internal(format!("Failed to create Redis client: {}", e)))?;

        let service = Self { client };
        service.ping().await?;
        Ok(service)
    }

    /// Round-trip a PING
    pub async fn ping(&self) -> AppResult<()> {
        let mut conn = self.get_connection().await?;
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| AppError::Internal(format!("Redis connection test failed: {}", e)))?;
        Ok(())
    }

    /// Append a payload to the tail of a list, returning the new list length
    pub async fn push(&self, queue: &str, payload: &str) -> AppResult<i64> {
        let mut conn = self.get_connection().await?;
        let len: i64 = conn.rpush(queue, payload).await?;
        Ok(len)
    }

    /// Get a Redis connection
    pub async fn get_connection(&self) -> AppResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| AppError::Internal(format!("Failed to get Redis connection: {}", e)))
    }
}
