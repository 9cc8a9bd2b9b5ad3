//! Book stock as seen by the lending core

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;

/// Catalog entry reduced to the columns lending reads and writes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Book {
    pub id: i64,
    pub title: String,
    /// Total copies owned
    pub stock: i32,
    /// Copies currently lent out
    pub on_loan_count: i32,
}

impl Book {
    pub fn available(&self) -> i32 {
        self.stock - self.on_loan_count
    }

    pub fn has_available_copy(&self) -> bool {
        self.available() > 0
    }
}
