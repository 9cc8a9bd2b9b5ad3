//! Outbound reservation notices
//!
//! The lending core only produces [`ReservationNotice`] events. Delivering them
//! to readers (mail, SMS, push) is the job of whatever consumes the channel.

use async_trait::async_trait;

use super::redis::RedisService;
use crate::{error::AppResult, models::ReservationNotice};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn publish(&self, notice: &ReservationNotice) -> AppResult<()>;
}

/// Writes notices to the log only
#[derive(Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn publish(&self, notice: &ReservationNotice) -> AppResult<()> {
        tracing::info!(
            event_id = %notice.event_id,
            reservation_id = notice.reservation_id,
            user_id = notice.user_id,
            book_id = notice.book_id,
            expires_at = %notice.expires_at,
            "Reserved book \"{}\" is ready for pickup",
            notice.book_title
        );
        Ok(())
    }
}

/// Pushes JSON-encoded notices onto a Redis list
#[derive(Clone)]
pub struct RedisNotifier {
    redis: RedisService,
    queue: String,
}

impl RedisNotifier {
    pub fn new(redis: RedisService, queue: impl Into<String>) -> Self {
        Self {
            redis,
            queue: queue.into(),
        }
    }
}

#[async_trait]
impl NotificationSink for RedisNotifier {
    async fn publish(&self, notice: &ReservationNotice) -> AppResult<()> {
        let payload = serde_json::to_string(notice)
            .map_err(|e| crate::error::AppError::Internal(format!("Failed to encode notice: {}", e)))?;
        let depth = self.redis.push(&self.queue, &payload).await?;
        tracing::debug!(queue = %self.queue, depth, reservation_id = notice.reservation_id, "Notice queued");
        Ok(())
    }
}

/// Publish notices produced by a committed transaction.
///
/// Failures are logged and swallowed; the state change is already durable.
pub async fn publish_all(sink: &dyn NotificationSink, notices: &[ReservationNotice]) {
    for notice in notices {
        if let Err(e) = sink.publish(notice).await {
            tracing::warn!(
                error = %e,
                reservation_id = notice.reservation_id,
                user_id = notice.user_id,
                "Failed to publish reservation notice"
            );
        }
    }
}
