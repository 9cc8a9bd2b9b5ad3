//! Borrow coordinator: lending, returning and renewing copies

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use super::{
    notifications::{publish_all, NotificationSink},
    overdue::OverdueService,
    reservations::promote_next_waiter,
};
use crate::{
    config::LendingPolicy,
    error::{AppError, AppResult},
    models::{
        loan::{
            compute_fine, extend, overdue_days, BorrowReceipt, LoanPage, RenewReceipt,
            ReturnCondition, ReturnReceipt, UserLoans,
        },
        Loan, LoanDetails, LoanFilter, LoanStatus, NewLoan, Page, ReservationStatus,
    },
    repository::Repository,
};

const PROMOTION_SAVEPOINT: &str = "promote_next_waiter";

pub const DEFAULT_PER_PAGE: i64 = 10;
pub const MAX_PER_PAGE: i64 = 100;

#[derive(Clone)]
pub struct LoansService {
    repository: Repository,
    policy: LendingPolicy,
    overdue: OverdueService,
    notifier: Arc<dyn NotificationSink>,
}

impl LoansService {
    pub fn new(
        repository: Repository,
        policy: LendingPolicy,
        overdue: OverdueService,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            repository,
            policy,
            overdue,
            notifier,
        }
    }

    fn check_requested_days(&self, days: Option<i64>) -> AppResult<()> {
        match days {
            Some(d) if d < 1 || d > self.policy.max_request_days => Err(AppError::Validation(
                format!("Duration must be between 1 and {} days", self.policy.max_request_days),
            )),
            _ => Ok(()),
        }
    }

    /// Lend a copy of `book_id` to `user_id`.
    ///
    /// A reader holding the book's open offer claims it here; anyone else is
    /// refused while a waitlist exists for the book.
    pub async fn borrow_book(
        &self,
        user_id: i64,
        book_id: i64,
        borrow_days: Option<i64>,
    ) -> AppResult<BorrowReceipt> {
        self.check_requested_days(borrow_days)?;
        self.overdue.refresh_user_best_effort(user_id).await;

        let now = Utc::now();
        let mut tx = self.repository.begin().await?;

        let user = tx.lock_user(user_id).await?;
        let book = tx.lock_book(book_id).await?;
        let own = tx.lock_open_reservation(user_id, book_id).await?;

        let mut claimed_offer = false;
        let mut own_waiting = None;
        match own {
            Some(mut offer) if offer.status == ReservationStatus::Available => {
                offer.status = ReservationStatus::Fulfilled;
                offer.fulfilled_at = Some(now);
                tx.update_reservation(&offer).await?;
                claimed_offer = true;
            }
            other => {
                if tx.has_open_reservation_by_others(book_id, user_id).await? {
                    return Err(AppError::ReservationConflict);
                }
                own_waiting = other;
            }
        }

        if user.at_borrow_limit() {
            return Err(AppError::BorrowLimitReached {
                current: user.borrowing_count,
                limit: user.borrow_limit,
            });
        }
        if user.overdue_count > 0 {
            return Err(AppError::HasOverdueLoans(user.overdue_count));
        }
        if !book.has_available_copy() {
            return Err(AppError::OutOfStock);
        }

        let loan = tx
            .insert_loan(&NewLoan {
                book_id,
                user_id,
                borrow_date: now,
                due_date: extend(now, borrow_days, self.policy.default_loan),
            })
            .await?;
        tx.add_on_loan(book_id, 1).await?;
        tx.add_borrowing(user_id, 1).await?;

        // Nobody else is queued, so the reader's own place in line is moot
        if let Some(mut waiting) = own_waiting {
            waiting.status = ReservationStatus::Fulfilled;
            waiting.fulfilled_at = Some(now);
            tx.update_reservation(&waiting).await?;
        }

        // The claimed offer may have been holding back a queue behind a spare copy
        let mut notices = Vec::new();
        if claimed_offer {
            if let Some(notice) = promote_next_waiter(tx.as_mut(), &self.policy, book_id, now).await? {
                notices.push(notice);
            }
        }

        tx.commit().await?;
        publish_all(self.notifier.as_ref(), &notices).await;

        tracing::info!(
            loan_id = loan.id,
            user_id,
            book_id,
            due_date = %loan.due_date,
            claimed_offer,
            "Book borrowed"
        );

        Ok(BorrowReceipt {
            loan,
            book_title: book.title,
            max_renewals: self.policy.max_renewals,
        })
    }

    /// Close a loan and hand the freed copy to the head of the waitlist.
    ///
    /// The promotion runs under a savepoint: if it fails the return still commits.
    pub async fn return_book(
        &self,
        loan_id: i64,
        condition: Option<ReturnCondition>,
        remark: Option<String>,
    ) -> AppResult<ReturnReceipt> {
        let now = Utc::now();
        let mut tx = self.repository.begin().await?;

        let mut loan = tx.lock_loan(loan_id).await?;
        if loan.is_returned() {
            return Err(AppError::AlreadyReturned);
        }
        tx.lock_user(loan.user_id).await?;
        tx.lock_book(loan.book_id).await?;

        let is_overdue = now > loan.due_date;
        let days = overdue_days(loan.due_date, now);
        let fine = if is_overdue {
            compute_fine(days, self.policy.daily_fine).max(loan.fine)
        } else {
            loan.fine
        };

        if loan.status == LoanStatus::Overdue {
            tx.add_overdue(loan.user_id, -1).await?;
        }
        tx.add_borrowing(loan.user_id, -1).await?;
        tx.add_on_loan(loan.book_id, -1).await?;

        loan.status = LoanStatus::Returned;
        loan.return_date = Some(now);
        loan.fine = fine;
        tx.update_loan(&loan).await?;

        tx.savepoint(PROMOTION_SAVEPOINT).await?;
        let notice = match promote_next_waiter(tx.as_mut(), &self.policy, loan.book_id, now).await {
            Ok(notice) => notice,
            Err(e) => {
                tracing::warn!(
                    loan_id,
                    book_id = loan.book_id,
                    error = %e,
                    "Waitlist promotion failed, return kept"
                );
                tx.rollback_to_savepoint(PROMOTION_SAVEPOINT).await?;
                None
            }
        };
        tx.release_savepoint(PROMOTION_SAVEPOINT).await?;

        tx.commit().await?;
        if let Some(notice) = &notice {
            publish_all(self.notifier.as_ref(), std::slice::from_ref(notice)).await;
        }

        tracing::info!(
            loan_id,
            user_id = loan.user_id,
            book_id = loan.book_id,
            overdue_days = days,
            %fine,
            ?condition,
            remark = remark.as_deref(),
            "Book returned"
        );

        Ok(ReturnReceipt {
            loan,
            is_overdue,
            overdue_days: days,
            fine,
            condition,
            remark,
        })
    }

    /// Push a loan's due date back.
    ///
    /// The borrower's overdue state is refreshed and committed first, so it is
    /// kept even when the renewal is refused. The refresh locks the user's due
    /// loans in id order before this transaction takes its single loan row.
    pub async fn renew_borrow(&self, loan_id: i64, extra_days: Option<i64>) -> AppResult<RenewReceipt> {
        self.check_requested_days(extra_days)?;

        let user_id = self.get_loan(loan_id).await?.loan.user_id;
        self.overdue.refresh_user(user_id).await?;

        let now = Utc::now();
        let mut tx = self.repository.begin().await?;
        let mut loan = tx.lock_loan(loan_id).await?;
        self.check_renewable(&loan, now)?;

        let original_due_date = loan.due_date;
        loan.due_date = extend(loan.due_date, extra_days, self.policy.default_renew);
        loan.renew_count += 1;
        tx.update_loan(&loan).await?;
        tx.commit().await?;

        tracing::info!(
            loan_id,
            user_id = loan.user_id,
            renew_count = loan.renew_count,
            new_due_date = %loan.due_date,
            "Loan renewed"
        );

        Ok(RenewReceipt {
            loan_id,
            book_id: loan.book_id,
            original_due_date,
            new_due_date: loan.due_date,
            renew_count: loan.renew_count,
            max_renewals: self.policy.max_renewals,
        })
    }

    fn check_renewable(&self, loan: &Loan, now: DateTime<Utc>) -> AppResult<()> {
        if loan.renew_count >= self.policy.max_renewals {
            return Err(AppError::RenewLimitReached(self.policy.max_renewals));
        }
        // A loan that tipped past due after the refresh is treated as overdue
        if loan.status == LoanStatus::Overdue || loan.is_past_due(now) {
            return Err(AppError::CannotRenewOverdue);
        }
        if loan.is_returned() {
            return Err(AppError::AlreadyReturned);
        }
        Ok(())
    }

    pub async fn get_loan(&self, loan_id: i64) -> AppResult<LoanDetails> {
        let mut tx = self.repository.begin().await?;
        let loan = tx.get_loan(loan_id).await?;
        tx.commit().await?;
        Ok(LoanDetails::new(loan, Utc::now(), self.policy.max_renewals))
    }

    /// A user's loans, newest first, with their borrowing summary
    pub async fn list_user_loans(
        &self,
        user_id: i64,
        status: Option<LoanStatus>,
    ) -> AppResult<UserLoans> {
        self.overdue.refresh_user_best_effort(user_id).await;

        let mut tx = self.repository.begin().await?;
        let user = tx.get_user(user_id).await?;
        let (loans, _) = tx
            .search_loans(&LoanFilter::for_user(user_id, status), None)
            .await?;
        tx.commit().await?;

        let now = Utc::now();
        let total_fine: Decimal = loans.iter().map(|l| l.fine).sum();
        Ok(UserLoans {
            borrowing_count: user.borrowing_count,
            borrow_limit: user.borrow_limit,
            overdue_count: user.overdue_count,
            total_fine,
            loans: loans
                .into_iter()
                .map(|l| LoanDetails::new(l, now, self.policy.max_renewals))
                .collect(),
        })
    }

    /// Paged loan search across all users
    pub async fn search_loans(
        &self,
        filter: LoanFilter,
        page: i64,
        per_page: i64,
    ) -> AppResult<LoanPage> {
        if page < 1 {
            return Err(AppError::Validation("page must be at least 1".to_string()));
        }
        if !(1..=MAX_PER_PAGE).contains(&per_page) {
            return Err(AppError::Validation(format!(
                "per_page must be between 1 and {}",
                MAX_PER_PAGE
            )));
        }
        if let Some(user_id) = filter.user_id {
            self.overdue.refresh_user_best_effort(user_id).await;
        }

        let mut tx = self.repository.begin().await?;
        let (loans, total) = tx
            .search_loans(
                &filter,
                Some(Page {
                    offset: (page - 1) * per_page,
                    limit: per_page,
                }),
            )
            .await?;
        tx.commit().await?;

        let now = Utc::now();
        Ok(LoanPage {
            items: loans
                .into_iter()
                .map(|l| LoanDetails::new(l, now, self.policy.max_renewals))
                .collect(),
            total,
            page,
            per_page,
            total_pages: (total + per_page - 1) / per_page,
        })
    }
}
