//! Data models for the lending core

pub mod book;
pub mod loan;
pub mod reservation;
pub mod user;

// Re-export commonly used types
pub use book::Book;
pub use loan::{Loan, LoanDetails, LoanFilter, LoanStatus, NewLoan, Page};
pub use reservation::{Reservation, ReservationNotice, ReservationStatus};
pub use user::{User, UserClaims};
