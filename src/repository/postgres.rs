//! PostgreSQL ledger using row-level `FOR UPDATE` locks

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, Pool, Postgres, Transaction};

use super::{LedgerStore, LedgerTx};
use crate::{
    error::{AppError, AppResult},
    models::{Book, Loan, LoanFilter, NewLoan, Page, Reservation, ReservationStatus, User},
};

const LOAN_COLUMNS: &str =
    "id, book_id, user_id, borrow_date, due_date, return_date, status, renew_count, fine";
const RESERVATION_COLUMNS: &str = "id, book_id, user_id, status, reserved_at, notified_at, \
     expires_at, fulfilled_at, cancelled_at";

#[derive(Clone)]
pub struct PgLedger {
    pool: Pool<Postgres>,
    lock_timeout_ms: u64,
}

impl PgLedger {
    pub fn new(pool: Pool<Postgres>, lock_timeout_ms: u64) -> Self {
        Self {
            pool,
            lock_timeout_ms,
        }
    }
}

#[async_trait]
impl LedgerStore for PgLedger {
    async fn begin(&self) -> AppResult<Box<dyn LedgerTx>> {
        let mut tx = self.pool.begin().await?;
        if self.lock_timeout_ms > 0 {
            sqlx::query(&format!(
                "SET LOCAL lock_timeout = '{}ms'",
                self.lock_timeout_ms
            ))
            .execute(&mut *tx)
            .await?;
        }
        Ok(Box::new(PgLedgerTx { tx: Some(tx) }))
    }

    async fn ping(&self) -> AppResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

pub struct PgLedgerTx {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgLedgerTx {
    fn conn(&mut self) -> AppResult<&mut PgConnection> {
        self.tx
            .as_deref_mut()
            .ok_or_else(|| AppError::Internal("Transaction already committed".to_string()))
    }

    async fn fetch_book(&mut self, id: i64, lock: bool) -> AppResult<Book> {
        let sql = format!(
            "SELECT id, title, stock, on_loan_count FROM books WHERE id = $1{}",
            if lock { " FOR UPDATE" } else { "" }
        );
        sqlx::query_as::<_, Book>(&sql)
            .bind(id)
            .fetch_optional(self.conn()?)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Book with id {} not found", id)))
    }

    async fn fetch_user(&mut self, id: i64, lock: bool) -> AppResult<User> {
        let sql = format!(
            "SELECT id, username, borrowing_count, borrow_limit, overdue_count \
             FROM users WHERE id = $1{}",
            if lock { " FOR UPDATE" } else { "" }
        );
        sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .fetch_optional(self.conn()?)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("User with id {} not found", id)))
    }

    async fn fetch_loan(&mut self, id: i64, lock: bool) -> AppResult<Loan> {
        let sql = format!(
            "SELECT {} FROM loans WHERE id = $1{}",
            LOAN_COLUMNS,
            if lock { " FOR UPDATE" } else { "" }
        );
        sqlx::query_as::<_, Loan>(&sql)
            .bind(id)
            .fetch_optional(self.conn()?)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Loan with id {} not found", id)))
    }

    async fn fetch_reservation(&mut self, id: i64, lock: bool) -> AppResult<Reservation> {
        let sql = format!(
            "SELECT {} FROM reservations WHERE id = $1{}",
            RESERVATION_COLUMNS,
            if lock { " FOR UPDATE" } else { "" }
        );
        sqlx::query_as::<_, Reservation>(&sql)
            .bind(id)
            .fetch_optional(self.conn()?)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Reservation with id {} not found", id)))
    }
}

/// Savepoint names are interpolated into SQL, keep them to identifiers
fn savepoint_name(name: &str) -> AppResult<&str> {
    if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(name)
    } else {
        Err(AppError::Internal(format!("Invalid savepoint name: {}", name)))
    }
}

#[async_trait]
impl LedgerTx for PgLedgerTx {
    async fn get_book(&mut self, id: i64) -> AppResult<Book> {
        self.fetch_book(id, false).await
    }

    async fn lock_book(&mut self, id: i64) -> AppResult<Book> {
        self.fetch_book(id, true).await
    }

    async fn add_on_loan(&mut self, book_id: i64, delta: i32) -> AppResult<()> {
        sqlx::query("UPDATE books SET on_loan_count = on_loan_count + $1 WHERE id = $2")
            .bind(delta)
            .bind(book_id)
            .execute(self.conn()?)
            .await?;
        Ok(())
    }

    async fn get_user(&mut self, id: i64) -> AppResult<User> {
        self.fetch_user(id, false).await
    }

    async fn lock_user(&mut self, id: i64) -> AppResult<User> {
        self.fetch_user(id, true).await
    }

    async fn add_borrowing(&mut self, user_id: i64, delta: i32) -> AppResult<()> {
        sqlx::query("UPDATE users SET borrowing_count = borrowing_count + $1 WHERE id = $2")
            .bind(delta)
            .bind(user_id)
            .execute(self.conn()?)
            .await?;
        Ok(())
    }

    async fn add_overdue(&mut self, user_id: i64, delta: i32) -> AppResult<()> {
        sqlx::query("UPDATE users SET overdue_count = overdue_count + $1 WHERE id = $2")
            .bind(delta)
            .bind(user_id)
            .execute(self.conn()?)
            .await?;
        Ok(())
    }

    async fn get_loan(&mut self, id: i64) -> AppResult<Loan> {
        self.fetch_loan(id, false).await
    }

    async fn lock_loan(&mut self, id: i64) -> AppResult<Loan> {
        self.fetch_loan(id, true).await
    }

    async fn insert_loan(&mut self, loan: &NewLoan) -> AppResult<Loan> {
        let sql = format!(
            r#"
            INSERT INTO loans (book_id, user_id, borrow_date, due_date, status, renew_count, fine)
            VALUES ($1, $2, $3, $4, 'active', 0, 0)
            RETURNING {}
            "#,
            LOAN_COLUMNS
        );
        let created = sqlx::query_as::<_, Loan>(&sql)
            .bind(loan.book_id)
            .bind(loan.user_id)
            .bind(loan.borrow_date)
            .bind(loan.due_date)
            .fetch_one(self.conn()?)
            .await?;
        Ok(created)
    }

    async fn update_loan(&mut self, loan: &Loan) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE loans
            SET due_date = $1, return_date = $2, status = $3, renew_count = $4, fine = $5
            WHERE id = $6
            "#,
        )
        .bind(loan.due_date)
        .bind(loan.return_date)
        .bind(loan.status)
        .bind(loan.renew_count)
        .bind(loan.fine)
        .bind(loan.id)
        .execute(self.conn()?)
        .await?;
        Ok(())
    }

    async fn lock_due_loans(
        &mut self,
        now: DateTime<Utc>,
        user_id: Option<i64>,
    ) -> AppResult<Vec<Loan>> {
        let sql = format!(
            r#"
            SELECT {} FROM loans
            WHERE status = 'active' AND return_date IS NULL AND due_date < $1
              AND ($2::BIGINT IS NULL OR user_id = $2)
            ORDER BY id
            FOR UPDATE
            "#,
            LOAN_COLUMNS
        );
        let loans = sqlx::query_as::<_, Loan>(&sql)
            .bind(now)
            .bind(user_id)
            .fetch_all(self.conn()?)
            .await?;
        Ok(loans)
    }

    async fn search_loans(
        &mut self,
        filter: &LoanFilter,
        page: Option<Page>,
    ) -> AppResult<(Vec<Loan>, i64)> {
        let mut conditions = Vec::new();
        let mut idx = 1;

        if filter.user_id.is_some() {
            conditions.push(format!("user_id = ${}", idx));
            idx += 1;
        }
        if filter.book_id.is_some() {
            conditions.push(format!("book_id = ${}", idx));
            idx += 1;
        }
        if filter.status.is_some() {
            conditions.push(format!("status = ${}", idx));
            idx += 1;
        }
        if filter.borrowed_from.is_some() {
            conditions.push(format!("borrow_date >= ${}", idx));
            idx += 1;
        }
        if filter.borrowed_before.is_some() {
            conditions.push(format!("borrow_date < ${}", idx));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let count_q = format!("SELECT COUNT(*) FROM loans {}", where_clause);
        let mut count_builder = sqlx::query_scalar::<_, i64>(&count_q);
        if let Some(v) = filter.user_id { count_builder = count_builder.bind(v); }
        if let Some(v) = filter.book_id { count_builder = count_builder.bind(v); }
        if let Some(v) = filter.status { count_builder = count_builder.bind(v); }
        if let Some(v) = filter.borrowed_from { count_builder = count_builder.bind(v); }
        if let Some(v) = filter.borrowed_before { count_builder = count_builder.bind(v); }
        let total = count_builder.fetch_one(self.conn()?).await?;

        let direction = filter.order.as_sql();
        let window = match page {
            Some(p) => format!("LIMIT {} OFFSET {}", p.limit, p.offset),
            None => String::new(),
        };
        let select_q = format!(
            "SELECT {} FROM loans {} ORDER BY {} {} NULLS LAST, id {} {}",
            LOAN_COLUMNS,
            where_clause,
            filter.sort_by.column(),
            direction,
            direction,
            window
        );
        let mut builder = sqlx::query_as::<_, Loan>(&select_q);
        if let Some(v) = filter.user_id { builder = builder.bind(v); }
        if let Some(v) = filter.book_id { builder = builder.bind(v); }
        if let Some(v) = filter.status { builder = builder.bind(v); }
        if let Some(v) = filter.borrowed_from { builder = builder.bind(v); }
        if let Some(v) = filter.borrowed_before { builder = builder.bind(v); }
        let loans = builder.fetch_all(self.conn()?).await?;

        Ok((loans, total))
    }

    async fn get_reservation(&mut self, id: i64) -> AppResult<Reservation> {
        self.fetch_reservation(id, false).await
    }

    async fn lock_reservation(&mut self, id: i64) -> AppResult<Reservation> {
        self.fetch_reservation(id, true).await
    }

    async fn lock_open_reservation(
        &mut self,
        user_id: i64,
        book_id: i64,
    ) -> AppResult<Option<Reservation>> {
        let sql = format!(
            r#"
            SELECT {} FROM reservations
            WHERE user_id = $1 AND book_id = $2 AND status IN ('waiting', 'available')
            FOR UPDATE
            "#,
            RESERVATION_COLUMNS
        );
        let reservation = sqlx::query_as::<_, Reservation>(&sql)
            .bind(user_id)
            .bind(book_id)
            .fetch_optional(self.conn()?)
            .await?;
        Ok(reservation)
    }

    async fn has_open_reservation_by_others(
        &mut self,
        book_id: i64,
        user_id: i64,
    ) -> AppResult<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM reservations
                WHERE book_id = $1 AND user_id <> $2 AND status IN ('waiting', 'available')
            )
            "#,
        )
        .bind(book_id)
        .bind(user_id)
        .fetch_one(self.conn()?)
        .await?;
        Ok(exists)
    }

    async fn has_offer(&mut self, book_id: i64) -> AppResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM reservations WHERE book_id = $1 AND status = 'available')",
        )
        .bind(book_id)
        .fetch_one(self.conn()?)
        .await?;
        Ok(exists)
    }

    async fn lock_next_waiting(&mut self, book_id: i64) -> AppResult<Option<Reservation>> {
        let sql = format!(
            r#"
            SELECT {} FROM reservations
            WHERE book_id = $1 AND status = 'waiting'
            ORDER BY reserved_at, id
            LIMIT 1
            FOR UPDATE
            "#,
            RESERVATION_COLUMNS
        );
        let reservation = sqlx::query_as::<_, Reservation>(&sql)
            .bind(book_id)
            .fetch_optional(self.conn()?)
            .await?;
        Ok(reservation)
    }

    async fn insert_reservation(
        &mut self,
        book_id: i64,
        user_id: i64,
        reserved_at: DateTime<Utc>,
    ) -> AppResult<Reservation> {
        let sql = format!(
            r#"
            INSERT INTO reservations (book_id, user_id, status, reserved_at)
            VALUES ($1, $2, 'waiting', $3)
            RETURNING {}
            "#,
            RESERVATION_COLUMNS
        );
        let result = sqlx::query_as::<_, Reservation>(&sql)
            .bind(book_id)
            .bind(user_id)
            .bind(reserved_at)
            .fetch_one(self.conn()?)
            .await;

        match result {
            Ok(reservation) => Ok(reservation),
            // uniq_reservations_open lost a race against a concurrent request
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(AppError::AlreadyReserved)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update_reservation(&mut self, reservation: &Reservation) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE reservations
            SET status = $1, notified_at = $2, expires_at = $3, fulfilled_at = $4, cancelled_at = $5
            WHERE id = $6
            "#,
        )
        .bind(reservation.status)
        .bind(reservation.notified_at)
        .bind(reservation.expires_at)
        .bind(reservation.fulfilled_at)
        .bind(reservation.cancelled_at)
        .bind(reservation.id)
        .execute(self.conn()?)
        .await?;
        Ok(())
    }

    async fn count_waiting_ahead(&mut self, reservation: &Reservation) -> AppResult<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM reservations
            WHERE book_id = $1 AND status = 'waiting' AND id <> $3
              AND (reserved_at, id) < ($2, $3)
            "#,
        )
        .bind(reservation.book_id)
        .bind(reservation.reserved_at)
        .bind(reservation.id)
        .fetch_one(self.conn()?)
        .await?;
        Ok(count)
    }

    async fn lock_expired_offers(&mut self, now: DateTime<Utc>) -> AppResult<Vec<Reservation>> {
        let sql = format!(
            r#"
            SELECT {} FROM reservations
            WHERE status = $1 AND expires_at < $2
            ORDER BY expires_at, id
            FOR UPDATE
            "#,
            RESERVATION_COLUMNS
        );
        let reservations = sqlx::query_as::<_, Reservation>(&sql)
            .bind(ReservationStatus::Available)
            .bind(now)
            .fetch_all(self.conn()?)
            .await?;
        Ok(reservations)
    }

    async fn user_open_reservations(&mut self, user_id: i64) -> AppResult<Vec<Reservation>> {
        let sql = format!(
            r#"
            SELECT {} FROM reservations
            WHERE user_id = $1 AND status IN ('waiting', 'available')
            ORDER BY reserved_at, id
            "#,
            RESERVATION_COLUMNS
        );
        let reservations = sqlx::query_as::<_, Reservation>(&sql)
            .bind(user_id)
            .fetch_all(self.conn()?)
            .await?;
        Ok(reservations)
    }

    async fn stalled_queues(&mut self) -> AppResult<Vec<i64>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT b.id FROM books b
            WHERE b.stock > b.on_loan_count
              AND EXISTS (SELECT 1 FROM reservations r WHERE r.book_id = b.id AND r.status = 'waiting')
              AND NOT EXISTS (SELECT 1 FROM reservations r WHERE r.book_id = b.id AND r.status = 'available')
            ORDER BY b.id
            "#,
        )
        .fetch_all(self.conn()?)
        .await?;
        Ok(ids)
    }

    async fn savepoint(&mut self, name: &str) -> AppResult<()> {
        let sql = format!("SAVEPOINT {}", savepoint_name(name)?);
        sqlx::query(&sql).execute(self.conn()?).await?;
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> AppResult<()> {
        let sql = format!("ROLLBACK TO SAVEPOINT {}", savepoint_name(name)?);
        sqlx::query(&sql).execute(self.conn()?).await?;
        Ok(())
    }

    async fn release_savepoint(&mut self, name: &str) -> AppResult<()> {
        let sql = format!("RELEASE SAVEPOINT {}", savepoint_name(name)?);
        sqlx::query(&sql).execute(self.conn()?).await?;
        Ok(())
    }

    async fn commit(&mut self) -> AppResult<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| AppError::Internal("Transaction already committed".to_string()))?;
        tx.commit().await?;
        Ok(())
    }
}
