//! OpenAPI documentation

use axum::Router;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::api::{health, loans, reservations, sweeps};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Lending API",
        version = "1.0.0",
        description = "Book lending core: loans, overdue sweeps and reservation waitlists",
        license(name = "AGPL-3.0", url = "https://www.gnu.org/licenses/agpl-3.0.html")
    ),
    servers(
        (url = "/api/v1", description = "API v1")
    ),
    paths(
        // Health
        health::health_check,
        // Loans
        loans::borrow_book,
        loans::get_loan,
        loans::return_book,
        loans::renew_borrow,
        loans::list_user_loans,
        loans::search_loans,
        // Reservations
        reservations::create_reservation,
        reservations::list_my_reservations,
        reservations::queue_position,
        reservations::cancel_reservation,
        // Sweeps
        sweeps::refresh_overdue,
        sweeps::expire_reservations,
    ),
    components(
        schemas(
            // Loans
            crate::models::Loan,
            crate::models::LoanStatus,
            crate::models::LoanDetails,
            crate::models::loan::BorrowRequest,
            crate::models::loan::ReturnRequest,
            crate::models::loan::RenewRequest,
            crate::models::loan::ReturnCondition,
            crate::models::loan::BorrowReceipt,
            crate::models::loan::ReturnReceipt,
            crate::models::loan::RenewReceipt,
            crate::models::loan::UserLoans,
            crate::models::loan::LoanPage,
            crate::models::loan::LoanSortBy,
            crate::models::loan::SortOrder,
            loans::LoanListQuery,
            loans::LoanSearchQuery,
            // Reservations
            crate::models::Reservation,
            crate::models::ReservationStatus,
            crate::models::reservation::CreateReservationRequest,
            crate::models::reservation::QueuedReservation,
            crate::models::ReservationNotice,
            reservations::QueuePositionResponse,
            // Sweeps
            sweeps::SweepResponse,
            // Health
            health::HealthResponse,
            // Errors
            crate::error::ErrorResponse,
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "loans", description = "Borrow, return and renew"),
        (name = "reservations", description = "Waitlists for out-of-stock books"),
        (name = "sweeps", description = "Overdue and expiry sweeps")
    )
)]
pub struct ApiDoc;

/// Create the OpenAPI documentation router
pub fn create_openapi_router() -> Router {
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
}
