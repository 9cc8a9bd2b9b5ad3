//! Loan endpoints

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Days, NaiveDate, NaiveTime, Utc};
use serde::Deserialize;
use utoipa::{IntoParams, ToSchema};
use validator::Validate;

use crate::{
    error::{AppError, AppResult},
    models::{
        loan::{
            BorrowReceipt, BorrowRequest, LoanPage, LoanSortBy, RenewReceipt, RenewRequest,
            ReturnReceipt, ReturnRequest, SortOrder, UserLoans,
        },
        LoanDetails, LoanFilter, LoanStatus,
    },
    services::loans::DEFAULT_PER_PAGE,
    AppState,
};

use super::{AuthenticatedUser, OptionalJson};

/// Filter for a user's loan list
#[derive(Debug, Default, Deserialize, IntoParams, ToSchema)]
#[into_params(parameter_in = Query)]
pub struct LoanListQuery {
    /// Only loans in this state (`active`, `overdue`, `returned`)
    pub status: Option<LoanStatus>,
}

/// Loan search parameters
#[derive(Debug, Default, Deserialize, IntoParams, ToSchema)]
#[into_params(parameter_in = Query)]
pub struct LoanSearchQuery {
    /// Borrower (staff only; readers always search their own loans)
    pub user_id: Option<i64>,
    pub book_id: Option<i64>,
    pub status: Option<LoanStatus>,
    /// Earliest borrow day, `YYYY-MM-DD`
    pub start_date: Option<String>,
    /// Latest borrow day, `YYYY-MM-DD`, inclusive
    pub end_date: Option<String>,
    /// `borrow_date` (default), `due_date` or `return_date`
    pub sort_by: Option<LoanSortBy>,
    /// `asc` or `desc` (default)
    pub order: Option<SortOrder>,
    /// Page number (default: 1)
    pub page: Option<i64>,
    /// Items per page (default: 10, max: 100)
    pub per_page: Option<i64>,
}

fn parse_day(value: &str, field: &str) -> AppResult<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|_| AppError::Validation(format!("{} must be a YYYY-MM-DD date", field)))
}

fn midnight(day: NaiveDate) -> DateTime<Utc> {
    day.and_time(NaiveTime::MIN).and_utc()
}

/// Borrow a book
#[utoipa::path(
    post,
    path = "/loans",
    tag = "loans",
    security(("bearer_auth" = [])),
    request_body = BorrowRequest,
    responses(
        (status = 201, description = "Loan created", body = BorrowReceipt),
        (status = 400, description = "Invalid duration"),
        (status = 403, description = "Cannot borrow for another user"),
        (status = 404, description = "User or book not found"),
        (status = 422, description = "Out of stock, limit reached, overdue loans or book reserved by another reader")
    )
)]
pub async fn borrow_book(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Json(request): Json<BorrowRequest>,
) -> AppResult<(StatusCode, Json<BorrowReceipt>)> {
    request.validate()?;

    let user_id = request.user_id.unwrap_or(claims.user_id);
    claims.require_self_or_staff(user_id)?;

    let receipt = state
        .services
        .loans
        .borrow_book(user_id, request.book_id, request.borrow_days)
        .await?;

    Ok((StatusCode::CREATED, Json(receipt)))
}

/// Get a loan
#[utoipa::path(
    get,
    path = "/loans/{id}",
    tag = "loans",
    security(("bearer_auth" = [])),
    params(
        ("id" = i64, Path, description = "Loan ID")
    ),
    responses(
        (status = 200, description = "Loan details", body = LoanDetails),
        (status = 404, description = "Loan not found")
    )
)]
pub async fn get_loan(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(loan_id): Path<i64>,
) -> AppResult<Json<LoanDetails>> {
    let loan = state.services.loans.get_loan(loan_id).await?;
    claims.require_self_or_staff(loan.loan.user_id)?;
    Ok(Json(loan))
}

/// Return a borrowed book
#[utoipa::path(
    post,
    path = "/loans/{id}/return",
    tag = "loans",
    security(("bearer_auth" = [])),
    params(
        ("id" = i64, Path, description = "Loan ID")
    ),
    request_body = ReturnRequest,
    responses(
        (status = 200, description = "Book returned", body = ReturnReceipt),
        (status = 400, description = "Malformed body, unknown condition or remark too long"),
        (status = 404, description = "Loan not found"),
        (status = 409, description = "Already returned")
    )
)]
pub async fn return_book(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(loan_id): Path<i64>,
    OptionalJson(request): OptionalJson<ReturnRequest>,
) -> AppResult<Json<ReturnReceipt>> {
    request.validate()?;

    let loan = state.services.loans.get_loan(loan_id).await?;
    claims.require_self_or_staff(loan.loan.user_id)?;

    let receipt = state
        .services
        .loans
        .return_book(loan_id, request.condition, request.remark)
        .await?;
    Ok(Json(receipt))
}

/// Renew a loan
#[utoipa::path(
    post,
    path = "/loans/{id}/renew",
    tag = "loans",
    security(("bearer_auth" = [])),
    params(
        ("id" = i64, Path, description = "Loan ID")
    ),
    request_body = RenewRequest,
    responses(
        (status = 200, description = "Loan renewed", body = RenewReceipt),
        (status = 400, description = "Malformed body or invalid duration"),
        (status = 404, description = "Loan not found"),
        (status = 409, description = "Renewal limit reached, loan overdue or already returned")
    )
)]
pub async fn renew_borrow(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(loan_id): Path<i64>,
    OptionalJson(request): OptionalJson<RenewRequest>,
) -> AppResult<Json<RenewReceipt>> {
    request.validate()?;

    let loan = state.services.loans.get_loan(loan_id).await?;
    claims.require_self_or_staff(loan.loan.user_id)?;

    let receipt = state
        .services
        .loans
        .renew_borrow(loan_id, request.renew_days)
        .await?;
    Ok(Json(receipt))
}

/// List a user's loans
#[utoipa::path(
    get,
    path = "/users/{id}/loans",
    tag = "loans",
    security(("bearer_auth" = [])),
    params(
        ("id" = i64, Path, description = "User ID"),
        LoanListQuery
    ),
    responses(
        (status = 200, description = "User's loans with borrowing summary", body = UserLoans),
        (status = 404, description = "User not found")
    )
)]
pub async fn list_user_loans(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(user_id): Path<i64>,
    Query(query): Query<LoanListQuery>,
) -> AppResult<Json<UserLoans>> {
    claims.require_self_or_staff(user_id)?;

    let loans = state.services.loans.list_user_loans(user_id, query.status).await?;
    Ok(Json(loans))
}

/// Search loans with filters, sorting and paging
#[utoipa::path(
    get,
    path = "/loans",
    tag = "loans",
    security(("bearer_auth" = [])),
    params(LoanSearchQuery),
    responses(
        (status = 200, description = "One page of matching loans", body = LoanPage),
        (status = 400, description = "Bad date, page or page size"),
        (status = 403, description = "Readers cannot search other users' loans")
    )
)]
pub async fn search_loans(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Query(query): Query<LoanSearchQuery>,
) -> AppResult<Json<LoanPage>> {
    let user_id = match query.user_id {
        Some(user_id) => {
            claims.require_self_or_staff(user_id)?;
            Some(user_id)
        }
        None if claims.is_staff() => None,
        None => Some(claims.user_id),
    };

    let borrowed_from = query
        .start_date
        .as_deref()
        .map(|d| parse_day(d, "start_date").map(midnight))
        .transpose()?;
    let borrowed_before = query
        .end_date
        .as_deref()
        .map(|d| {
            parse_day(d, "end_date")?
                .checked_add_days(Days::new(1))
                .map(midnight)
                .ok_or_else(|| AppError::Validation("end_date is out of range".to_string()))
        })
        .transpose()?;

    let filter = LoanFilter {
        user_id,
        book_id: query.book_id,
        status: query.status,
        borrowed_from,
        borrowed_before,
        sort_by: query.sort_by.unwrap_or_default(),
        order: query.order.unwrap_or_default(),
    };

    let page = state
        .services
        .loans
        .search_loans(
            filter,
            query.page.unwrap_or(1),
            query.per_page.unwrap_or(DEFAULT_PER_PAGE),
        )
        .await?;
    Ok(Json(page))
}
