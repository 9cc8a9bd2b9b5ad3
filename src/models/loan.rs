//! Loan (borrow) model and related types

use std::cmp::Ordering;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{Decode, Encode, FromRow, Postgres};
use utoipa::ToSchema;
use validator::Validate;

/// Loan lifecycle: `active` -> `overdue` -> `returned`, or `active` -> `returned`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum LoanStatus {
    Active,
    Overdue,
    Returned,
}

impl LoanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoanStatus::Active => "active",
            LoanStatus::Overdue => "overdue",
            LoanStatus::Returned => "returned",
        }
    }
}

impl std::fmt::Display for LoanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for LoanStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" | "borrowed" => Ok(LoanStatus::Active),
            "overdue" => Ok(LoanStatus::Overdue),
            "returned" => Ok(LoanStatus::Returned),
            _ => Err(format!("Invalid loan status: {}", s)),
        }
    }
}

// SQLx conversion for LoanStatus
impl sqlx::Type<Postgres> for LoanStatus {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        <String as sqlx::Type<Postgres>>::type_info()
    }

    fn compatible(ty: &sqlx::postgres::PgTypeInfo) -> bool {
        <String as sqlx::Type<Postgres>>::compatible(ty)
    }
}

impl<'r> Decode<'r, Postgres> for LoanStatus {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s: String = Decode::<Postgres>::decode(value)?;
        s.parse().map_err(|e: String| e.into())
    }
}

impl Encode<'_, Postgres> for LoanStatus {
    fn encode_by_ref(&self, buf: &mut sqlx::postgres::PgArgumentBuffer) -> sqlx::encode::IsNull {
        <&str as Encode<Postgres>>::encode(self.as_str(), buf)
    }
}

/// Loan record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Loan {
    pub id: i64,
    pub book_id: i64,
    pub user_id: i64,
    pub borrow_date: DateTime<Utc>,
    pub due_date: DateTime<Utc>,
    pub return_date: Option<DateTime<Utc>>,
    pub status: LoanStatus,
    pub renew_count: i32,
    pub fine: Decimal,
}

impl Loan {
    pub fn is_returned(&self) -> bool {
        self.return_date.is_some() || self.status == LoanStatus::Returned
    }

    /// Derived overdue flag, independent of the stored status
    pub fn is_past_due(&self, now: DateTime<Utc>) -> bool {
        !self.is_returned() && now > self.due_date
    }
}

/// Values for a loan about to be inserted
#[derive(Debug, Clone)]
pub struct NewLoan {
    pub book_id: i64,
    pub user_id: i64,
    pub borrow_date: DateTime<Utc>,
    pub due_date: DateTime<Utc>,
}

/// Whole days elapsed past the due date, truncated (`floor(hours / 24)`)
pub fn overdue_days(due_date: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    if now <= due_date {
        return 0;
    }
    (now - due_date).num_hours() / 24
}

/// Fine accrued for a loan that is `overdue_days` late
pub fn compute_fine(overdue_days: i64, daily_fine: Decimal) -> Decimal {
    Decimal::from(overdue_days.max(0)) * daily_fine
}

/// Signed calendar-day distance from `now` to `date` (negative when in the past)
pub fn calendar_days_from(now: DateTime<Utc>, date: DateTime<Utc>) -> i64 {
    let today: NaiveDate = now.date_naive();
    (date.date_naive() - today).num_days()
}

/// Condition of a returned copy, echoed back to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ReturnCondition {
    Good,
    Damaged,
    Lost,
}

/// Borrow request
#[derive(Debug, Clone, Default, Deserialize, Validate, ToSchema)]
pub struct BorrowRequest {
    /// Book to borrow
    pub book_id: i64,
    /// Loan duration in days (defaults to the configured loan period)
    #[validate(range(min = 1, message = "borrow_days must be at least 1"))]
    pub borrow_days: Option<i64>,
    /// Borrower; only librarians may borrow on behalf of someone else
    pub user_id: Option<i64>,
}

/// Return request
#[derive(Debug, Clone, Default, Deserialize, Validate, ToSchema)]
pub struct ReturnRequest {
    pub condition: Option<ReturnCondition>,
    /// Free-text note from the desk, echoed back
    #[validate(length(max = 255, message = "remark must be at most 255 characters"))]
    pub remark: Option<String>,
}

/// Renewal request
#[derive(Debug, Clone, Default, Deserialize, Validate, ToSchema)]
pub struct RenewRequest {
    /// Extension in days (defaults to the configured renewal period)
    #[validate(range(min = 1, message = "renew_days must be at least 1"))]
    pub renew_days: Option<i64>,
}

/// Result of a successful borrow
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct BorrowReceipt {
    pub loan: Loan,
    pub book_title: String,
    pub max_renewals: i32,
}

/// Result of a successful return
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ReturnReceipt {
    pub loan: Loan,
    pub is_overdue: bool,
    pub overdue_days: i64,
    pub fine: Decimal,
    pub condition: Option<ReturnCondition>,
    pub remark: Option<String>,
}

/// Result of a successful renewal
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RenewReceipt {
    pub loan_id: i64,
    pub book_id: i64,
    pub original_due_date: DateTime<Utc>,
    pub new_due_date: DateTime<Utc>,
    pub renew_count: i32,
    pub max_renewals: i32,
}

/// Loan with derived display fields
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct LoanDetails {
    #[serde(flatten)]
    pub loan: Loan,
    pub is_overdue: bool,
    /// Calendar days until the due date (active loans only)
    pub days_until_due: Option<i64>,
    /// Calendar days since the due date (overdue loans only)
    pub overdue_days: Option<i64>,
    pub can_renew: bool,
}

impl LoanDetails {
    pub fn new(loan: Loan, now: DateTime<Utc>, max_renewals: i32) -> Self {
        let (days_until_due, overdue_days) = match loan.status {
            LoanStatus::Active => (Some(calendar_days_from(now, loan.due_date)), None),
            LoanStatus::Overdue => (None, Some(-calendar_days_from(now, loan.due_date))),
            LoanStatus::Returned => (None, None),
        };
        Self {
            is_overdue: loan.status == LoanStatus::Overdue || loan.is_past_due(now),
            can_renew: loan.status == LoanStatus::Active && loan.renew_count < max_renewals,
            days_until_due,
            overdue_days,
            loan,
        }
    }
}

/// A user's loans plus their counters
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct UserLoans {
    pub borrowing_count: i32,
    pub borrow_limit: i32,
    pub overdue_count: i32,
    pub total_fine: Decimal,
    pub loans: Vec<LoanDetails>,
}

/// Column a loan search is ordered by
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum LoanSortBy {
    #[default]
    BorrowDate,
    DueDate,
    ReturnDate,
}

impl LoanSortBy {
    pub fn column(&self) -> &'static str {
        match self {
            LoanSortBy::BorrowDate => "borrow_date",
            LoanSortBy::DueDate => "due_date",
            LoanSortBy::ReturnDate => "return_date",
        }
    }

    fn key(&self, loan: &Loan) -> Option<DateTime<Utc>> {
        match self {
            LoanSortBy::BorrowDate => Some(loan.borrow_date),
            LoanSortBy::DueDate => Some(loan.due_date),
            LoanSortBy::ReturnDate => loan.return_date,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

/// Criteria for a loan search. Every `None` matches all loans.
#[derive(Debug, Clone, Default)]
pub struct LoanFilter {
    pub user_id: Option<i64>,
    pub book_id: Option<i64>,
    pub status: Option<LoanStatus>,
    /// Inclusive lower bound on `borrow_date`
    pub borrowed_from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `borrow_date`
    pub borrowed_before: Option<DateTime<Utc>>,
    pub sort_by: LoanSortBy,
    pub order: SortOrder,
}

impl LoanFilter {
    pub fn for_user(user_id: i64, status: Option<LoanStatus>) -> Self {
        Self {
            user_id: Some(user_id),
            status,
            ..Self::default()
        }
    }

    pub fn matches(&self, loan: &Loan) -> bool {
        self.user_id.map_or(true, |u| loan.user_id == u)
            && self.book_id.map_or(true, |b| loan.book_id == b)
            && self.status.map_or(true, |s| loan.status == s)
            && self.borrowed_from.map_or(true, |from| loan.borrow_date >= from)
            && self.borrowed_before.map_or(true, |before| loan.borrow_date < before)
    }

    /// Sort order of the search: missing dates last whatever the direction,
    /// ties broken by id in the same direction
    pub fn compare(&self, a: &Loan, b: &Loan) -> Ordering {
        let directed = |o: Ordering| match self.order {
            SortOrder::Asc => o,
            SortOrder::Desc => o.reverse(),
        };
        let by_key = match (self.sort_by.key(a), self.sort_by.key(b)) {
            (Some(x), Some(y)) => directed(x.cmp(&y)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        by_key.then_with(|| directed(a.id.cmp(&b.id)))
    }
}

/// Window of a paged search
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: i64,
    pub limit: i64,
}

/// One page of a loan search
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct LoanPage {
    pub items: Vec<LoanDetails>,
    pub total: i64,
    pub page: i64,
    pub per_page: i64,
    pub total_pages: i64,
}

/// Due date for a new loan or renewal, falling back to `default` when no days are given
pub fn extend(from: DateTime<Utc>, days: Option<i64>, default: Duration) -> DateTime<Utc> {
    from + days.map(Duration::days).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overdue_days_truncate_partial_days() {
        let due = Utc::now();
        assert_eq!(overdue_days(due, due + Duration::hours(71)), 2);
        assert_eq!(overdue_days(due, due + Duration::hours(72)), 3);
        assert_eq!(overdue_days(due, due - Duration::hours(5)), 0);
    }

    #[test]
    fn fine_scales_with_daily_rate() {
        assert_eq!(compute_fine(3, Decimal::ONE), Decimal::from(3));
        assert_eq!(compute_fine(4, Decimal::new(25, 2)), Decimal::ONE);
        assert_eq!(compute_fine(-1, Decimal::ONE), Decimal::ZERO);
    }

    #[test]
    fn status_parses_legacy_names() {
        assert_eq!("borrowed".parse::<LoanStatus>(), Ok(LoanStatus::Active));
        assert_eq!("OVERDUE".parse::<LoanStatus>(), Ok(LoanStatus::Overdue));
        assert!("lost".parse::<LoanStatus>().is_err());
    }

    fn loan_at(id: i64, borrow_date: DateTime<Utc>, return_date: Option<DateTime<Utc>>) -> Loan {
        Loan {
            id,
            book_id: 1,
            user_id: 1,
            borrow_date,
            due_date: borrow_date + Duration::days(30),
            return_date,
            status: if return_date.is_some() { LoanStatus::Returned } else { LoanStatus::Active },
            renew_count: 0,
            fine: Decimal::ZERO,
        }
    }

    #[test]
    fn filter_orders_missing_return_dates_last() {
        let now = Utc::now();
        let mut loans = vec![
            loan_at(1, now, None),
            loan_at(2, now, Some(now + Duration::days(1))),
            loan_at(3, now, Some(now + Duration::days(2))),
        ];

        let filter = LoanFilter {
            sort_by: LoanSortBy::ReturnDate,
            order: SortOrder::Desc,
            ..LoanFilter::default()
        };
        loans.sort_by(|a, b| filter.compare(a, b));
        assert_eq!(loans.iter().map(|l| l.id).collect::<Vec<_>>(), vec![3, 2, 1]);

        let filter = LoanFilter { order: SortOrder::Asc, ..filter };
        loans.sort_by(|a, b| filter.compare(a, b));
        assert_eq!(loans.iter().map(|l| l.id).collect::<Vec<_>>(), vec![2, 3, 1]);
    }

    #[test]
    fn filter_bounds_borrow_date() {
        let now = Utc::now();
        let filter = LoanFilter {
            borrowed_from: Some(now),
            borrowed_before: Some(now + Duration::days(1)),
            ..LoanFilter::default()
        };
        assert!(filter.matches(&loan_at(1, now, None)));
        assert!(!filter.matches(&loan_at(2, now - Duration::seconds(1), None)));
        assert!(!filter.matches(&loan_at(3, now + Duration::days(1), None)));
    }

    #[test]
    fn details_flag_renewable_active_loans() {
        let now = Utc::now();
        let loan = Loan {
            id: 1,
            book_id: 1,
            user_id: 1,
            borrow_date: now,
            due_date: now + Duration::days(10),
            return_date: None,
            status: LoanStatus::Active,
            renew_count: 1,
            fine: Decimal::ZERO,
        };
        let details = LoanDetails::new(loan.clone(), now, 2);
        assert!(details.can_renew);
        assert!(!details.is_overdue);
        assert_eq!(details.days_until_due, Some(10));

        let exhausted = LoanDetails::new(Loan { renew_count: 2, ..loan }, now, 2);
        assert!(!exhausted.can_renew);
    }
}
