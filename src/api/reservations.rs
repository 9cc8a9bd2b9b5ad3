//! Reservation (waitlist) endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use utoipa::ToSchema;

use crate::{
    error::AppResult,
    models::{
        reservation::{CreateReservationRequest, QueuedReservation},
        Reservation,
    },
    AppState,
};

use super::AuthenticatedUser;

/// Live queue position of a reservation
#[derive(Serialize, ToSchema)]
pub struct QueuePositionResponse {
    pub reservation_id: i64,
    /// 1-based; 0 when the reservation is no longer waiting
    pub position: i64,
}

/// Join the waitlist for an out-of-stock book
#[utoipa::path(
    post,
    path = "/reservations",
    tag = "reservations",
    security(("bearer_auth" = [])),
    request_body = CreateReservationRequest,
    responses(
        (status = 201, description = "Reservation queued", body = QueuedReservation),
        (status = 404, description = "Book not found"),
        (status = 409, description = "Book is available or already reserved")
    )
)]
pub async fn create_reservation(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Json(request): Json<CreateReservationRequest>,
) -> AppResult<(StatusCode, Json<QueuedReservation>)> {
    let queued = state
        .services
        .reservations
        .create_reservation(claims.user_id, request.book_id)
        .await?;
    Ok((StatusCode::CREATED, Json(queued)))
}

/// List the caller's open reservations
#[utoipa::path(
    get,
    path = "/reservations/mine",
    tag = "reservations",
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Open reservations, oldest first", body = Vec<QueuedReservation>)
    )
)]
pub async fn list_my_reservations(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
) -> AppResult<Json<Vec<QueuedReservation>>> {
    let reservations = state
        .services
        .reservations
        .list_user_reservations(claims.user_id)
        .await?;
    Ok(Json(reservations))
}

/// Get a reservation's place in its queue
#[utoipa::path(
    get,
    path = "/reservations/{id}/position",
    tag = "reservations",
    security(("bearer_auth" = [])),
    params(
        ("id" = i64, Path, description = "Reservation ID")
    ),
    responses(
        (status = 200, description = "Queue position", body = QueuePositionResponse),
        (status = 404, description = "Reservation not found")
    )
)]
pub async fn queue_position(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(reservation_id): Path<i64>,
) -> AppResult<Json<QueuePositionResponse>> {
    let reservation = state.services.reservations.get_reservation(reservation_id).await?;
    claims.require_self_or_staff(reservation.user_id)?;

    let position = state.services.reservations.queue_position(reservation_id).await?;
    Ok(Json(QueuePositionResponse {
        reservation_id,
        position,
    }))
}

/// Cancel one of the caller's reservations
#[utoipa::path(
    delete,
    path = "/reservations/{id}",
    tag = "reservations",
    security(("bearer_auth" = [])),
    params(
        ("id" = i64, Path, description = "Reservation ID")
    ),
    responses(
        (status = 200, description = "Reservation cancelled", body = Reservation),
        (status = 403, description = "Reservation belongs to another user"),
        (status = 404, description = "Reservation not found"),
        (status = 409, description = "Reservation is no longer open")
    )
)]
pub async fn cancel_reservation(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(reservation_id): Path<i64>,
) -> AppResult<Json<Reservation>> {
    let reservation = state
        .services
        .reservations
        .cancel_reservation(claims.user_id, reservation_id)
        .await?;
    Ok(Json(reservation))
}
