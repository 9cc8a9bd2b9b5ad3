//! Overdue sweeper: flips past-due loans to `overdue` and accrues their fines

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::{
    config::LendingPolicy,
    error::AppResult,
    models::{
        loan::{compute_fine, overdue_days},
        LoanStatus,
    },
    repository::{LedgerTx, Repository},
};

#[derive(Clone)]
pub struct OverdueService {
    repository: Repository,
    policy: LendingPolicy,
}

impl OverdueService {
    pub fn new(repository: Repository, policy: LendingPolicy) -> Self {
        Self { repository, policy }
    }

    /// Sweep every user. Returns the number of loans transitioned.
    pub async fn refresh_all(&self) -> AppResult<usize> {
        self.refresh(None, Utc::now()).await
    }

    /// Sweep a single user's loans
    pub async fn refresh_user(&self, user_id: i64) -> AppResult<usize> {
        self.refresh(Some(user_id), Utc::now()).await
    }

    /// Opportunistic refresh ahead of a user action; a failure is logged and ignored
    pub async fn refresh_user_best_effort(&self, user_id: i64) {
        if let Err(e) = self.refresh_user(user_id).await {
            tracing::warn!(user_id, error = %e, "Overdue refresh failed");
        }
    }

    async fn refresh(&self, user_id: Option<i64>, now: DateTime<Utc>) -> AppResult<usize> {
        let mut tx = self.repository.begin().await?;
        let count = mark_overdue(tx.as_mut(), &self.policy, user_id, now).await?;
        tx.commit().await?;

        if count > 0 {
            tracing::info!(?user_id, count, "Loans marked overdue");
        } else {
            tracing::debug!(?user_id, "No newly overdue loans");
        }
        Ok(count)
    }
}

/// Transition due loans inside an open transaction.
///
/// Loans already `overdue` are excluded by the status filter, so repeated runs
/// only touch loans that became due since the previous one.
pub async fn mark_overdue(
    tx: &mut dyn LedgerTx,
    policy: &LendingPolicy,
    user_id: Option<i64>,
    now: DateTime<Utc>,
) -> AppResult<usize> {
    let due = tx.lock_due_loans(now, user_id).await?;
    if due.is_empty() {
        return Ok(0);
    }

    let mut per_user: BTreeMap<i64, i32> = BTreeMap::new();
    for mut loan in due.iter().cloned() {
        loan.status = LoanStatus::Overdue;
        loan.fine = compute_fine(overdue_days(loan.due_date, now), policy.daily_fine);
        tx.update_loan(&loan).await?;
        *per_user.entry(loan.user_id).or_default() += 1;
    }

    // Ascending user id keeps the user-row lock order stable across sweeps
    for (user_id, count) in per_user {
        tx.add_overdue(user_id, count).await?;
    }

    Ok(due.len())
}
