//! Staff-triggered sweeps

use axum::{extract::State, Json};
use serde::Serialize;
use utoipa::ToSchema;

use crate::{error::AppResult, AppState};

use super::AuthenticatedUser;

#[derive(Serialize, ToSchema)]
pub struct SweepResponse {
    /// Number of records transitioned by the sweep
    pub count: usize,
}

/// Flag past-due loans as overdue
#[utoipa::path(
    post,
    path = "/sweeps/overdue",
    tag = "sweeps",
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Loans marked overdue", body = SweepResponse),
        (status = 403, description = "Librarian rights required")
    )
)]
pub async fn refresh_overdue(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
) -> AppResult<Json<SweepResponse>> {
    claims.require_staff()?;

    let count = state.services.overdue.refresh_all().await?;
    Ok(Json(SweepResponse { count }))
}

/// Expire unclaimed reservation offers
#[utoipa::path(
    post,
    path = "/sweeps/reservations",
    tag = "sweeps",
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Offers expired", body = SweepResponse),
        (status = 403, description = "Librarian rights required")
    )
)]
pub async fn expire_reservations(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
) -> AppResult<Json<SweepResponse>> {
    claims.require_staff()?;

    let count = state.services.reservations.expire_stale().await?;
    Ok(Json(SweepResponse { count }))
}
