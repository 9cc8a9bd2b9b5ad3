//! Reservation (waitlist) model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Decode, Encode, FromRow, Postgres};
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    /// Queued behind other readers
    Waiting,
    /// A copy is held for this reader until `expires_at`
    Available,
    Fulfilled,
    Expired,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Waiting => "waiting",
            ReservationStatus::Available => "available",
            ReservationStatus::Fulfilled => "fulfilled",
            ReservationStatus::Expired => "expired",
            ReservationStatus::Cancelled => "cancelled",
        }
    }

    /// Waiting or holding an offer
    pub fn is_open(&self) -> bool {
        matches!(self, ReservationStatus::Waiting | ReservationStatus::Available)
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ReservationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "waiting" => Ok(ReservationStatus::Waiting),
            "available" => Ok(ReservationStatus::Available),
            "fulfilled" => Ok(ReservationStatus::Fulfilled),
            "expired" => Ok(ReservationStatus::Expired),
            "cancelled" => Ok(ReservationStatus::Cancelled),
            _ => Err(format!("Invalid reservation status: {}", s)),
        }
    }
}

// SQLx conversion for ReservationStatus
impl sqlx::Type<Postgres> for ReservationStatus {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        <String as sqlx::Type<Postgres>>::type_info()
    }

    fn compatible(ty: &sqlx::postgres::PgTypeInfo) -> bool {
        <String as sqlx::Type<Postgres>>::compatible(ty)
    }
}

impl<'r> Decode<'r, Postgres> for ReservationStatus {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s: String = Decode::<Postgres>::decode(value)?;
        s.parse().map_err(|e: String| e.into())
    }
}

impl Encode<'_, Postgres> for ReservationStatus {
    fn encode_by_ref(&self, buf: &mut sqlx::postgres::PgArgumentBuffer) -> sqlx::encode::IsNull {
        <&str as Encode<Postgres>>::encode(self.as_str(), buf)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Reservation {
    pub id: i64,
    pub book_id: i64,
    pub user_id: i64,
    pub status: ReservationStatus,
    pub reserved_at: DateTime<Utc>,
    pub notified_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub fulfilled_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Reservation {
    /// FIFO ordering key; ties on `reserved_at` fall back to insertion order
    pub fn queue_key(&self) -> (DateTime<Utc>, i64) {
        (self.reserved_at, self.id)
    }
}

/// Create reservation request
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CreateReservationRequest {
    pub book_id: i64,
}

/// Reservation with its live place in the queue
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct QueuedReservation {
    #[serde(flatten)]
    pub reservation: Reservation,
    pub book_title: String,
    /// 1-based position among waiting readers; 0 once an offer has been made
    pub queue_position: i64,
}

/// Event emitted when a reservation is promoted to `available`.
///
/// Delivery (mail, SMS, push) belongs to the notification channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ReservationNotice {
    pub event_id: Uuid,
    pub reservation_id: i64,
    pub user_id: i64,
    pub book_id: i64,
    pub book_title: String,
    pub expires_at: DateTime<Utc>,
}
