//! Business logic services

pub mod loans;
pub mod notifications;
pub mod overdue;
pub mod redis;
pub mod reservations;
pub mod scheduler;

use std::sync::Arc;

use crate::{config::LendingPolicy, error::AppResult, repository::Repository};

use notifications::NotificationSink;

/// Container for all services
#[derive(Clone)]
pub struct Services {
    pub loans: loans::LoansService,
    pub overdue: overdue::OverdueService,
    pub reservations: reservations::ReservationsService,
    repository: Repository,
}

impl Services {
    /// Create all services over one repository and notification sink
    pub fn new(
        repository: Repository,
        policy: LendingPolicy,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        let overdue = overdue::OverdueService::new(repository.clone(), policy.clone());
        Self {
            loans: loans::LoansService::new(
                repository.clone(),
                policy.clone(),
                overdue.clone(),
                notifier.clone(),
            ),
            reservations: reservations::ReservationsService::new(
                repository.clone(),
                policy,
                notifier,
            ),
            overdue,
            repository,
        }
    }

    /// Whether the ledger backing every service answers
    pub async fn ledger_ping(&self) -> AppResult<()> {
        self.repository.ping().await
    }
}
