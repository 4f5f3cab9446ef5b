//! Book and loan records held by every storage engine.

use serde::{Deserialize, Serialize};

/// Upper bound on renewals for a single loan.
pub const MAX_RENEWALS: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Book {
    pub code: String,
    pub title: String,
    pub author: String,
    pub available_copies: u32,
}

impl Book {
    pub fn new(
        code: impl Into<String>,
        title: impl Into<String>,
        author: impl Into<String>,
        available_copies: u32,
    ) -> Self {
        Self {
            code: code.into(),
            title: title.into(),
            author: author.into(),
            available_copies,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoanStatus {
    Active,
    Returned,
}

/// A single loan of one copy of a book.
///
/// Dates are opaque strings: the store only checks that they are present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Loan {
    pub id: String,
    pub user_id: String,
    pub book_code: String,
    pub start_date: String,
    pub end_date: String,
    pub renewal_count: u8,
    pub status: LoanStatus,
}

impl Loan {
    pub fn is_active(&self) -> bool {
        self.status == LoanStatus::Active
    }

    pub fn can_renew(&self) -> bool {
        self.is_active() && self.renewal_count < MAX_RENEWALS
    }
}

/// The demo catalogue seeded into a fresh primary.
pub fn demo_catalogue() -> Vec<Book> {
    vec![
        Book::new("L1", "El Quijote", "Cervantes", 2),
        Book::new("L2", "1984", "Orwell", 1),
    ]
}
