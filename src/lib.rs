//! Book lending core
//!
//! Lends a finite stock of book copies to borrowers under capacity, fairness
//! and time constraints: the loan lifecycle (borrow, return, renew), the
//! overdue sweep, and FIFO reservation waitlists for out-of-stock books.

use std::sync::Arc;

pub mod api;
pub mod config;
pub mod error;
pub mod models;
pub mod repository;
pub mod services;

pub use config::AppConfig;
pub use error::{AppError, AppResult};

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub services: Arc<services::Services>,
}
