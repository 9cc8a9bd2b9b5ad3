//! Reservation queue: FIFO waitlists for out-of-stock books

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::notifications::{publish_all, NotificationSink};
use crate::{
    config::LendingPolicy,
    error::{AppError, AppResult},
    models::{
        reservation::QueuedReservation, Reservation, ReservationNotice, ReservationStatus,
    },
    repository::{LedgerTx, Repository},
};

#[derive(Clone)]
pub struct ReservationsService {
    repository: Repository,
    policy: LendingPolicy,
    notifier: Arc<dyn NotificationSink>,
}

impl ReservationsService {
    pub fn new(
        repository: Repository,
        policy: LendingPolicy,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            repository,
            policy,
            notifier,
        }
    }

    /// Join the waitlist of a book that has no copy on the shelf
    pub async fn create_reservation(
        &self,
        user_id: i64,
        book_id: i64,
    ) -> AppResult<QueuedReservation> {
        let mut tx = self.repository.begin().await?;

        // Locking the book serializes against a concurrent return of the last copy
        let book = tx.lock_book(book_id).await?;
        tx.get_user(user_id).await?;

        if book.has_available_copy() {
            return Err(AppError::ReservationFailed);
        }
        if tx.lock_open_reservation(user_id, book_id).await?.is_some() {
            return Err(AppError::AlreadyReserved);
        }

        let reservation = tx.insert_reservation(book_id, user_id, Utc::now()).await?;
        let position = tx.count_waiting_ahead(&reservation).await? + 1;
        tx.commit().await?;

        tracing::info!(
            reservation_id = reservation.id,
            user_id,
            book_id,
            position,
            "Reservation queued"
        );

        Ok(QueuedReservation {
            reservation,
            book_title: book.title,
            queue_position: position,
        })
    }

    /// 1-based place among waiting readers, computed at read time.
    /// Reservations that are no longer waiting report 0.
    pub async fn queue_position(&self, reservation_id: i64) -> AppResult<i64> {
        let mut tx = self.repository.begin().await?;
        let reservation = tx.get_reservation(reservation_id).await?;
        let position = queue_position_of(tx.as_mut(), &reservation).await?;
        tx.commit().await?;
        Ok(position)
    }

    pub async fn get_reservation(&self, reservation_id: i64) -> AppResult<Reservation> {
        let mut tx = self.repository.begin().await?;
        let reservation = tx.get_reservation(reservation_id).await?;
        tx.commit().await?;
        Ok(reservation)
    }

    /// Offer a freed copy to the head of the book's queue in its own transaction
    pub async fn promote_next_waiter(&self, book_id: i64) -> AppResult<Option<ReservationNotice>> {
        let mut tx = self.repository.begin().await?;
        let notice = promote_next_waiter(tx.as_mut(), &self.policy, book_id, Utc::now()).await?;
        tx.commit().await?;

        if let Some(notice) = &notice {
            publish_all(self.notifier.as_ref(), std::slice::from_ref(notice)).await;
        }
        Ok(notice)
    }

    /// Expire unclaimed offers and pass each copy on to the next reader.
    /// Returns the number of reservations expired.
    pub async fn expire_stale(&self) -> AppResult<usize> {
        let now = Utc::now();
        let mut tx = self.repository.begin().await?;

        let offers = tx.lock_expired_offers(now).await?;
        let mut notices = Vec::new();
        for mut offer in offers.iter().cloned() {
            offer.status = ReservationStatus::Expired;
            tx.update_reservation(&offer).await?;
            tracing::info!(
                reservation_id = offer.id,
                user_id = offer.user_id,
                book_id = offer.book_id,
                "Reservation offer expired"
            );

            if let Some(notice) =
                promote_next_waiter(tx.as_mut(), &self.policy, offer.book_id, now).await?
            {
                notices.push(notice);
            }
        }
        tx.commit().await?;
        publish_all(self.notifier.as_ref(), &notices).await;

        let resumed = self.resume_stalled_queues().await?;
        if resumed > 0 {
            tracing::info!(count = resumed, "Stalled waitlists resumed");
        }

        Ok(offers.len())
    }

    /// Promote waiters on books that have a free copy but no open offer,
    /// e.g. after an offer was cancelled
    async fn resume_stalled_queues(&self) -> AppResult<usize> {
        let now = Utc::now();
        let mut tx = self.repository.begin().await?;
        let mut notices = Vec::new();
        for book_id in tx.stalled_queues().await? {
            if let Some(notice) = promote_next_waiter(tx.as_mut(), &self.policy, book_id, now).await? {
                notices.push(notice);
            }
        }
        tx.commit().await?;
        publish_all(self.notifier.as_ref(), &notices).await;
        Ok(notices.len())
    }

    /// Withdraw a waiting reservation or decline an offer.
    ///
    /// A declined offer is not cascaded here; the copy is picked up by the next
    /// expiry sweep or return.
    pub async fn cancel_reservation(
        &self,
        user_id: i64,
        reservation_id: i64,
    ) -> AppResult<Reservation> {
        let mut tx = self.repository.begin().await?;
        let mut reservation = tx.lock_reservation(reservation_id).await?;

        if reservation.user_id != user_id {
            return Err(AppError::Authorization(
                "Reservation belongs to another user".to_string(),
            ));
        }
        if !reservation.status.is_open() {
            return Err(AppError::NotCancellable(reservation.status.to_string()));
        }

        reservation.status = ReservationStatus::Cancelled;
        reservation.cancelled_at = Some(Utc::now());
        tx.update_reservation(&reservation).await?;
        tx.commit().await?;

        tracing::info!(reservation_id, user_id, "Reservation cancelled");
        Ok(reservation)
    }

    /// The user's open reservations, oldest first, with live queue positions
    pub async fn list_user_reservations(&self, user_id: i64) -> AppResult<Vec<QueuedReservation>> {
        let mut tx = self.repository.begin().await?;
        tx.get_user(user_id).await?;

        let mut result = Vec::new();
        for reservation in tx.user_open_reservations(user_id).await? {
            let book = tx.get_book(reservation.book_id).await?;
            let queue_position = queue_position_of(tx.as_mut(), &reservation).await?;
            result.push(QueuedReservation {
                reservation,
                book_title: book.title,
                queue_position,
            });
        }
        tx.commit().await?;
        Ok(result)
    }
}

async fn queue_position_of(tx: &mut dyn LedgerTx, reservation: &Reservation) -> AppResult<i64> {
    if reservation.status != ReservationStatus::Waiting {
        return Ok(0);
    }
    Ok(tx.count_waiting_ahead(reservation).await? + 1)
}

/// Turn the earliest waiting reservation for `book_id` into an offer.
///
/// No-op when the queue is empty, when an offer is already outstanding (at
/// most one per book), or when no copy is actually on the shelf. The returned
/// notice must only be published once the surrounding transaction commits.
pub async fn promote_next_waiter(
    tx: &mut dyn LedgerTx,
    policy: &LendingPolicy,
    book_id: i64,
    now: DateTime<Utc>,
) -> AppResult<Option<ReservationNotice>> {
    if tx.has_offer(book_id).await? {
        return Ok(None);
    }
    let Some(mut next) = tx.lock_next_waiting(book_id).await? else {
        return Ok(None);
    };
    let book = tx.get_book(book_id).await?;
    if !book.has_available_copy() {
        return Ok(None);
    }

    let expires_at = now + policy.claim_window;
    next.status = ReservationStatus::Available;
    next.notified_at = Some(now);
    next.expires_at = Some(expires_at);
    tx.update_reservation(&next).await?;

    tracing::info!(
        reservation_id = next.id,
        user_id = next.user_id,
        book_id,
        %expires_at,
        "Reservation promoted"
    );

    Ok(Some(ReservationNotice {
        event_id: Uuid::new_v4(),
        reservation_id: next.id,
        user_id: next.user_id,
        book_id,
        book_title: book.title,
        expires_at,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{repository::memory::MemoryLedger, services::notifications::MockNotificationSink};

    #[tokio::test]
    async fn promotion_publishes_one_notice_after_commit() {
        let ledger = MemoryLedger::new();
        let book = ledger.insert_book("Dune", 1).await;
        let alice = ledger.insert_user("alice", 5).await;
        ledger
            .edit(|s| s.books.get_mut(&book.id).unwrap().on_loan_count = 1)
            .await;

        let alice_id = alice.id;
        let mut sink = MockNotificationSink::new();
        sink.expect_publish()
            .withf(move |n| n.user_id == alice_id && n.book_title == "Dune")
            .times(1)
            .returning(|_| Ok(()));

        let service = ReservationsService::new(
            Repository::with_store(ledger.clone()),
            LendingPolicy::default(),
            Arc::new(sink),
        );
        service.create_reservation(alice.id, book.id).await.unwrap();

        ledger
            .edit(|s| s.books.get_mut(&book.id).unwrap().on_loan_count = 0)
            .await;
        let notice = service.promote_next_waiter(book.id).await.unwrap().unwrap();
        assert_eq!(notice.user_id, alice.id);

        // The outstanding offer blocks a second promotion
        assert!(service.promote_next_waiter(book.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_publication_does_not_undo_promotion() {
        let ledger = MemoryLedger::new();
        let book = ledger.insert_book("Dune", 1).await;
        let alice = ledger.insert_user("alice", 5).await;
        ledger
            .edit(|s| s.books.get_mut(&book.id).unwrap().on_loan_count = 1)
            .await;

        let mut sink = MockNotificationSink::new();
        sink.expect_publish()
            .returning(|_| Err(AppError::Internal("queue unavailable".to_string())));

        let service = ReservationsService::new(
            Repository::with_store(ledger.clone()),
            LendingPolicy::default(),
            Arc::new(sink),
        );
        let queued = service.create_reservation(alice.id, book.id).await.unwrap();
        ledger
            .edit(|s| s.books.get_mut(&book.id).unwrap().on_loan_count = 0)
            .await;

        assert!(service.promote_next_waiter(book.id).await.unwrap().is_some());
        let stored = service.get_reservation(queued.reservation.id).await.unwrap();
        assert_eq!(stored.status, ReservationStatus::Available);
    }
}
