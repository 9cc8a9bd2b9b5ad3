//! Repository layer: the transactional ledger of books, users, loans and reservations
//!
//! Every mutation of the shared counters (`books.on_loan_count`,
//! `users.borrowing_count`, `users.overdue_count`) happens inside a [`LedgerTx`]
//! that holds the corresponding row lock. Row locks are always taken in the
//! order loan -> user -> book -> reservation.

pub mod memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres};

use crate::{
    error::AppResult,
    models::{Book, Loan, LoanFilter, NewLoan, Page, Reservation, User},
};

/// Source of transactions
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn begin(&self) -> AppResult<Box<dyn LedgerTx>>;
    /// Cheap reachability check for health reporting
    async fn ping(&self) -> AppResult<()>;
}

/// One all-or-nothing unit of work. Dropping it without [`LedgerTx::commit`]
/// rolls every write back.
#[async_trait]
pub trait LedgerTx: Send {
    // Books
    async fn get_book(&mut self, id: i64) -> AppResult<Book>;
    async fn lock_book(&mut self, id: i64) -> AppResult<Book>;
    async fn add_on_loan(&mut self, book_id: i64, delta: i32) -> AppResult<()>;

    // Users
    async fn get_user(&mut self, id: i64) -> AppResult<User>;
    async fn lock_user(&mut self, id: i64) -> AppResult<User>;
    async fn add_borrowing(&mut self, user_id: i64, delta: i32) -> AppResult<()>;
    async fn add_overdue(&mut self, user_id: i64, delta: i32) -> AppResult<()>;

    // Loans
    async fn get_loan(&mut self, id: i64) -> AppResult<Loan>;
    async fn lock_loan(&mut self, id: i64) -> AppResult<Loan>;
    async fn insert_loan(&mut self, loan: &NewLoan) -> AppResult<Loan>;
    async fn update_loan(&mut self, loan: &Loan) -> AppResult<()>;
    /// Active, unreturned loans with `due_date < now`, locked for update
    async fn lock_due_loans(
        &mut self,
        now: DateTime<Utc>,
        user_id: Option<i64>,
    ) -> AppResult<Vec<Loan>>;
    /// Loans matching `filter` in its sort order, cut to `page` when given,
    /// together with the total number of matches
    async fn search_loans(
        &mut self,
        filter: &LoanFilter,
        page: Option<Page>,
    ) -> AppResult<(Vec<Loan>, i64)>;

    // Reservations
    async fn get_reservation(&mut self, id: i64) -> AppResult<Reservation>;
    async fn lock_reservation(&mut self, id: i64) -> AppResult<Reservation>;
    /// The user's `waiting` or `available` reservation for a book, locked
    async fn lock_open_reservation(
        &mut self,
        user_id: i64,
        book_id: i64,
    ) -> AppResult<Option<Reservation>>;
    async fn has_open_reservation_by_others(&mut self, book_id: i64, user_id: i64)
        -> AppResult<bool>;
    async fn has_offer(&mut self, book_id: i64) -> AppResult<bool>;
    /// Earliest `waiting` reservation for a book, locked
    async fn lock_next_waiting(&mut self, book_id: i64) -> AppResult<Option<Reservation>>;
    async fn insert_reservation(
        &mut self,
        book_id: i64,
        user_id: i64,
        reserved_at: DateTime<Utc>,
    ) -> AppResult<Reservation>;
    async fn update_reservation(&mut self, reservation: &Reservation) -> AppResult<()>;
    /// Number of `waiting` reservations queued before this one on the same book
    async fn count_waiting_ahead(&mut self, reservation: &Reservation) -> AppResult<i64>;
    /// `available` reservations with `expires_at < now`, locked
    async fn lock_expired_offers(&mut self, now: DateTime<Utc>) -> AppResult<Vec<Reservation>>;
    async fn user_open_reservations(&mut self, user_id: i64) -> AppResult<Vec<Reservation>>;
    /// Books with a copy on the shelf, waiting readers and no outstanding offer
    async fn stalled_queues(&mut self) -> AppResult<Vec<i64>>;

    // Transaction control
    async fn savepoint(&mut self, name: &str) -> AppResult<()>;
    async fn rollback_to_savepoint(&mut self, name: &str) -> AppResult<()>;
    async fn release_savepoint(&mut self, name: &str) -> AppResult<()>;
    async fn commit(&mut self) -> AppResult<()>;
}

/// Main repository handle, cheap to clone
#[derive(Clone)]
pub struct Repository {
    store: Arc<dyn LedgerStore>,
}

impl Repository {
    /// Create a repository backed by PostgreSQL
    pub fn new(pool: Pool<Postgres>, lock_timeout_ms: u64) -> Self {
        Self::with_store(postgres::PgLedger::new(pool, lock_timeout_ms))
    }

    pub fn with_store(store: impl LedgerStore + 'static) -> Self {
        Self {
            store: Arc::new(store),
        }
    }

    /// Open a new ledger transaction
    pub async fn begin(&self) -> AppResult<Box<dyn LedgerTx>> {
        self.store.begin().await
    }

    pub async fn ping(&self) -> AppResult<()> {
        self.store.ping().await
    }
}
