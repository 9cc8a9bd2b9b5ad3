//! In-process ledger
//!
//! Transactions are serialized by a single async mutex, so every unit of work
//! observes and produces a consistent state. Writes go to a working copy that
//! replaces the committed state only on `commit`. The same integrity rules as
//! the SQL schema are enforced on every write.

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{LedgerStore, LedgerTx};
use crate::{
    error::{AppError, AppResult},
    models::{
        Book, Loan, LoanFilter, LoanStatus, NewLoan, Page, Reservation, ReservationStatus, User,
    },
};

/// Committed contents of the ledger
#[derive(Debug, Clone, Default)]
pub struct LedgerState {
    pub books: BTreeMap<i64, Book>,
    pub users: BTreeMap<i64, User>,
    pub loans: BTreeMap<i64, Loan>,
    pub reservations: BTreeMap<i64, Reservation>,
    /// Fault injection for tests: reject every reservation write
    #[doc(hidden)]
    pub fail_reservation_writes: bool,
    next_id: i64,
}

impl LedgerState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn book_mut(&mut self, id: i64) -> AppResult<&mut Book> {
        self.books
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("Book with id {} not found", id)))
    }

    fn user_mut(&mut self, id: i64) -> AppResult<&mut User> {
        self.users
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("User with id {} not found", id)))
    }

    fn has_open_twin(&self, reservation: &Reservation) -> bool {
        reservation.status.is_open()
            && self.reservations.values().any(|other| {
                other.id != reservation.id
                    && other.status.is_open()
                    && other.user_id == reservation.user_id
                    && other.book_id == reservation.book_id
            })
    }

    fn has_second_offer(&self, reservation: &Reservation) -> bool {
        reservation.status == ReservationStatus::Available
            && self.reservations.values().any(|other| {
                other.id != reservation.id
                    && other.status == ReservationStatus::Available
                    && other.book_id == reservation.book_id
            })
    }

    fn check_reservation_write(&self, reservation: &Reservation) -> AppResult<()> {
        if self.fail_reservation_writes {
            return Err(AppError::Internal("reservation writes are disabled".to_string()));
        }
        if self.has_open_twin(reservation) || self.has_second_offer(reservation) {
            return Err(AppError::Internal(format!(
                "unique constraint violated by reservation {}",
                reservation.id
            )));
        }
        Ok(())
    }
}

/// Shared in-memory ledger
#[derive(Clone, Default)]
pub struct MemoryLedger {
    state: Arc<Mutex<LedgerState>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a catalog entry with `stock` copies
    pub async fn insert_book(&self, title: &str, stock: i32) -> Book {
        let mut state = self.state.lock().await;
        let book = Book {
            id: state.next_id(),
            title: title.to_string(),
            stock,
            on_loan_count: 0,
        };
        state.books.insert(book.id, book.clone());
        book
    }

    /// Register a borrower with the given limit
    pub async fn insert_user(&self, username: &str, borrow_limit: i32) -> User {
        let mut state = self.state.lock().await;
        let user = User {
            id: state.next_id(),
            username: username.to_string(),
            borrowing_count: 0,
            borrow_limit,
            overdue_count: 0,
        };
        state.users.insert(user.id, user.clone());
        user
    }

    /// Copy of the committed state
    pub async fn snapshot(&self) -> LedgerState {
        self.state.lock().await.clone()
    }

    /// Edit committed state directly, outside any transaction. Test fixtures only.
    #[doc(hidden)]
    pub async fn edit<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut LedgerState) -> R,
    {
        let mut state = self.state.lock().await;
        f(&mut state)
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn begin(&self) -> AppResult<Box<dyn LedgerTx>> {
        let guard = self.state.clone().lock_owned().await;
        let work = guard.clone();
        Ok(Box::new(MemoryTx {
            guard: Some(guard),
            work,
            savepoints: Vec::new(),
        }))
    }

    async fn ping(&self) -> AppResult<()> {
        Ok(())
    }
}

pub struct MemoryTx {
    guard: Option<OwnedMutexGuard<LedgerState>>,
    work: LedgerState,
    savepoints: Vec<(String, LedgerState)>,
}

impl MemoryTx {
    fn state(&mut self) -> AppResult<&mut LedgerState> {
        if self.guard.is_none() {
            return Err(AppError::Internal("Transaction already committed".to_string()));
        }
        Ok(&mut self.work)
    }

    fn savepoint_index(&self, name: &str) -> AppResult<usize> {
        self.savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| AppError::Internal(format!("No savepoint named {}", name)))
    }
}

fn by_queue_order(reservations: &mut [Reservation]) {
    reservations.sort_by_key(Reservation::queue_key);
}

#[async_trait]
impl LedgerTx for MemoryTx {
    async fn get_book(&mut self, id: i64) -> AppResult<Book> {
        self.state()?.book_mut(id).map(|b| b.clone())
    }

    async fn lock_book(&mut self, id: i64) -> AppResult<Book> {
        self.get_book(id).await
    }

    async fn add_on_loan(&mut self, book_id: i64, delta: i32) -> AppResult<()> {
        let book = self.state()?.book_mut(book_id)?;
        let next = book.on_loan_count + delta;
        if next < 0 || next > book.stock {
            return Err(AppError::Internal(format!(
                "check constraint books_on_loan_bounds violated for book {}",
                book_id
            )));
        }
        book.on_loan_count = next;
        Ok(())
    }

    async fn get_user(&mut self, id: i64) -> AppResult<User> {
        self.state()?.user_mut(id).map(|u| u.clone())
    }

    async fn lock_user(&mut self, id: i64) -> AppResult<User> {
        self.get_user(id).await
    }

    async fn add_borrowing(&mut self, user_id: i64, delta: i32) -> AppResult<()> {
        let user = self.state()?.user_mut(user_id)?;
        if user.borrowing_count + delta < 0 {
            return Err(AppError::Internal(format!(
                "check constraint users_counters_non_negative violated for user {}",
                user_id
            )));
        }
        user.borrowing_count += delta;
        Ok(())
    }

    async fn add_overdue(&mut self, user_id: i64, delta: i32) -> AppResult<()> {
        let user = self.state()?.user_mut(user_id)?;
        if user.overdue_count + delta < 0 {
            return Err(AppError::Internal(format!(
                "check constraint users_counters_non_negative violated for user {}",
                user_id
            )));
        }
        user.overdue_count += delta;
        Ok(())
    }

    async fn get_loan(&mut self, id: i64) -> AppResult<Loan> {
        self.state()?
            .loans
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Loan with id {} not found", id)))
    }

    async fn lock_loan(&mut self, id: i64) -> AppResult<Loan> {
        self.get_loan(id).await
    }

    async fn insert_loan(&mut self, loan: &NewLoan) -> AppResult<Loan> {
        let state = self.state()?;
        state.book_mut(loan.book_id)?;
        state.user_mut(loan.user_id)?;
        let created = Loan {
            id: state.next_id(),
            book_id: loan.book_id,
            user_id: loan.user_id,
            borrow_date: loan.borrow_date,
            due_date: loan.due_date,
            return_date: None,
            status: LoanStatus::Active,
            renew_count: 0,
            fine: Decimal::ZERO,
        };
        state.loans.insert(created.id, created.clone());
        Ok(created)
    }

    async fn update_loan(&mut self, loan: &Loan) -> AppResult<()> {
        let stored = self
            .state()?
            .loans
            .get_mut(&loan.id)
            .ok_or_else(|| AppError::NotFound(format!("Loan with id {} not found", loan.id)))?;
        *stored = loan.clone();
        Ok(())
    }

    async fn lock_due_loans(
        &mut self,
        now: DateTime<Utc>,
        user_id: Option<i64>,
    ) -> AppResult<Vec<Loan>> {
        Ok(self
            .state()?
            .loans
            .values()
            .filter(|l| {
                l.status == LoanStatus::Active
                    && l.return_date.is_none()
                    && l.due_date < now
                    && user_id.map_or(true, |u| l.user_id == u)
            })
            .cloned()
            .collect())
    }

    async fn search_loans(
        &mut self,
        filter: &LoanFilter,
        page: Option<Page>,
    ) -> AppResult<(Vec<Loan>, i64)> {
        let mut loans: Vec<Loan> = self
            .state()?
            .loans
            .values()
            .filter(|l| filter.matches(l))
            .cloned()
            .collect();
        loans.sort_by(|a, b| filter.compare(a, b));

        let total = loans.len() as i64;
        if let Some(page) = page {
            loans = loans
                .into_iter()
                .skip(page.offset.max(0) as usize)
                .take(page.limit.max(0) as usize)
                .collect();
        }
        Ok((loans, total))
    }

    async fn get_reservation(&mut self, id: i64) -> AppResult<Reservation> {
        self.state()?
            .reservations
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Reservation with id {} not found", id)))
    }

    async fn lock_reservation(&mut self, id: i64) -> AppResult<Reservation> {
        self.get_reservation(id).await
    }

    async fn lock_open_reservation(
        &mut self,
        user_id: i64,
        book_id: i64,
    ) -> AppResult<Option<Reservation>> {
        Ok(self
            .state()?
            .reservations
            .values()
            .find(|r| r.user_id == user_id && r.book_id == book_id && r.status.is_open())
            .cloned())
    }

    async fn has_open_reservation_by_others(
        &mut self,
        book_id: i64,
        user_id: i64,
    ) -> AppResult<bool> {
        Ok(self
            .state()?
            .reservations
            .values()
            .any(|r| r.book_id == book_id && r.user_id != user_id && r.status.is_open()))
    }

    async fn has_offer(&mut self, book_id: i64) -> AppResult<bool> {
        Ok(self
            .state()?
            .reservations
            .values()
            .any(|r| r.book_id == book_id && r.status == ReservationStatus::Available))
    }

    async fn lock_next_waiting(&mut self, book_id: i64) -> AppResult<Option<Reservation>> {
        Ok(self
            .state()?
            .reservations
            .values()
            .filter(|r| r.book_id == book_id && r.status == ReservationStatus::Waiting)
            .min_by_key(|r| r.queue_key())
            .cloned())
    }

    async fn insert_reservation(
        &mut self,
        book_id: i64,
        user_id: i64,
        reserved_at: DateTime<Utc>,
    ) -> AppResult<Reservation> {
        let state = self.state()?;
        state.book_mut(book_id)?;
        state.user_mut(user_id)?;
        let reservation = Reservation {
            id: 0,
            book_id,
            user_id,
            status: ReservationStatus::Waiting,
            reserved_at,
            notified_at: None,
            expires_at: None,
            fulfilled_at: None,
            cancelled_at: None,
        };
        if state.has_open_twin(&reservation) {
            return Err(AppError::AlreadyReserved);
        }
        state.check_reservation_write(&reservation)?;
        let reservation = Reservation {
            id: state.next_id(),
            ..reservation
        };
        state.reservations.insert(reservation.id, reservation.clone());
        Ok(reservation)
    }

    async fn update_reservation(&mut self, reservation: &Reservation) -> AppResult<()> {
        let state = self.state()?;
        if !state.reservations.contains_key(&reservation.id) {
            return Err(AppError::NotFound(format!(
                "Reservation with id {} not found",
                reservation.id
            )));
        }
        state.check_reservation_write(reservation)?;
        state.reservations.insert(reservation.id, reservation.clone());
        Ok(())
    }

    async fn count_waiting_ahead(&mut self, reservation: &Reservation) -> AppResult<i64> {
        let key = reservation.queue_key();
        Ok(self
            .state()?
            .reservations
            .values()
            .filter(|r| {
                r.book_id == reservation.book_id
                    && r.id != reservation.id
                    && r.status == ReservationStatus::Waiting
                    && r.queue_key() < key
            })
            .count() as i64)
    }

    async fn lock_expired_offers(&mut self, now: DateTime<Utc>) -> AppResult<Vec<Reservation>> {
        let mut offers: Vec<Reservation> = self
            .state()?
            .reservations
            .values()
            .filter(|r| {
                r.status == ReservationStatus::Available && r.expires_at.map_or(false, |e| e < now)
            })
            .cloned()
            .collect();
        offers.sort_by_key(|r| (r.expires_at, r.id));
        Ok(offers)
    }

    async fn user_open_reservations(&mut self, user_id: i64) -> AppResult<Vec<Reservation>> {
        let mut reservations: Vec<Reservation> = self
            .state()?
            .reservations
            .values()
            .filter(|r| r.user_id == user_id && r.status.is_open())
            .cloned()
            .collect();
        by_queue_order(&mut reservations);
        Ok(reservations)
    }

    async fn stalled_queues(&mut self) -> AppResult<Vec<i64>> {
        let state = self.state()?;
        Ok(state
            .books
            .values()
            .filter(|b| b.has_available_copy())
            .filter(|b| {
                let mut queue = state.reservations.values().filter(|r| r.book_id == b.id);
                queue.clone().any(|r| r.status == ReservationStatus::Waiting)
                    && !queue.any(|r| r.status == ReservationStatus::Available)
            })
            .map(|b| b.id)
            .collect())
    }

    async fn savepoint(&mut self, name: &str) -> AppResult<()> {
        let snapshot = self.state()?.clone();
        self.savepoints.push((name.to_string(), snapshot));
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> AppResult<()> {
        let index = self.savepoint_index(name)?;
        // The savepoint itself survives a rollback, as in SQL
        self.savepoints.truncate(index + 1);
        self.work = self.savepoints[index].1.clone();
        Ok(())
    }

    async fn release_savepoint(&mut self, name: &str) -> AppResult<()> {
        let index = self.savepoint_index(name)?;
        self.savepoints.truncate(index);
        Ok(())
    }

    async fn commit(&mut self) -> AppResult<()> {
        let mut guard = self
            .guard
            .take()
            .ok_or_else(|| AppError::Internal("Transaction already committed".to_string()))?;
        *guard = std::mem::take(&mut self.work);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dropped_transaction_rolls_back() {
        let ledger = MemoryLedger::new();
        let book = ledger.insert_book("Dune", 2).await;

        {
            let mut tx = ledger.begin().await.unwrap();
            tx.add_on_loan(book.id, 1).await.unwrap();
        }
        assert_eq!(ledger.snapshot().await.books[&book.id].on_loan_count, 0);

        let mut tx = ledger.begin().await.unwrap();
        tx.add_on_loan(book.id, 1).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(ledger.snapshot().await.books[&book.id].on_loan_count, 1);
    }

    #[tokio::test]
    async fn on_loan_count_stays_within_stock() {
        let ledger = MemoryLedger::new();
        let book = ledger.insert_book("Dune", 1).await;

        let mut tx = ledger.begin().await.unwrap();
        tx.add_on_loan(book.id, 1).await.unwrap();
        assert!(tx.add_on_loan(book.id, 1).await.is_err());
        assert!(tx.add_on_loan(book.id, -2).await.is_err());
    }

    #[tokio::test]
    async fn rollback_to_savepoint_discards_later_writes() {
        let ledger = MemoryLedger::new();
        let user = ledger.insert_user("alice", 5).await;

        let mut tx = ledger.begin().await.unwrap();
        tx.add_borrowing(user.id, 1).await.unwrap();
        tx.savepoint("sp").await.unwrap();
        tx.add_borrowing(user.id, 1).await.unwrap();
        tx.rollback_to_savepoint("sp").await.unwrap();
        tx.release_savepoint("sp").await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(ledger.snapshot().await.users[&user.id].borrowing_count, 1);
    }

    #[tokio::test]
    async fn second_open_reservation_for_same_pair_is_rejected() {
        let ledger = MemoryLedger::new();
        let book = ledger.insert_book("Dune", 0).await;
        let user = ledger.insert_user("alice", 5).await;

        let mut tx = ledger.begin().await.unwrap();
        tx.insert_reservation(book.id, user.id, Utc::now()).await.unwrap();
        let err = tx
            .insert_reservation(book.id, user.id, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::AlreadyReserved));
    }
}
