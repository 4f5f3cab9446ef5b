//! Single-node storage engine for books and loans.
//!
//! A [`StorageEngine`] is the unit of truth for one replica. Every operation
//! takes the engine-wide lock, so mutations on one engine never interleave.
//! The engine can be file-backed (see [`crate::tables`]) or purely in memory.
//!
//! Availability is explicit state: an engine that has been switched off (by an
//! operator or by the armed fault plan) answers every call with
//! [`StoreError::Unavailable`] instead of a soft `false`, which is what lets
//! callers tell a rejected operation apart from a dead store.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::command::ReplicatedWrite;
use crate::error::StoreError;
use crate::model::{Book, Loan, LoanStatus};
use crate::tables::TableFiles;

/// Point-in-time copy of an engine's tables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreSnapshot {
    pub books: BTreeMap<String, Book>,
    pub loans: BTreeMap<String, Loan>,
}

impl StoreSnapshot {
    pub fn total_available_copies(&self) -> u64 {
        self.books.values().map(|b| u64::from(b.available_copies)).sum()
    }
}

struct EngineState {
    books: BTreeMap<String, Book>,
    loans: BTreeMap<String, Loan>,
    available: bool,
    /// Successful writes left before the engine switches itself off.
    writes_until_failure: Option<u64>,
    write_latency: Option<Duration>,
}

impl EngineState {
    fn new(books: BTreeMap<String, Book>, loans: BTreeMap<String, Loan>) -> Self {
        Self {
            books,
            loans,
            available: true,
            writes_until_failure: None,
            write_latency: None,
        }
    }

    fn simulate_latency(&self) {
        if let Some(latency) = self.write_latency {
            thread::sleep(latency);
        }
    }
}

/// Books and loans of one replica behind a single lock.
///
/// Every write is staged on copies of the tables, persisted, and only then
/// swapped into memory, so a persistence error leaves the engine exactly as
/// it was.
pub struct StorageEngine {
    name: String,
    tables: Option<TableFiles>,
    state: Mutex<EngineState>,
}

impl StorageEngine {
    /// Creates an engine that keeps its tables only in memory.
    pub fn in_memory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tables: None,
            state: Mutex::new(EngineState::new(BTreeMap::new(), BTreeMap::new())),
        }
    }

    /// Opens a file-backed engine rooted at `dir`, reloading whatever was
    /// last persisted there.
    pub fn open(name: impl Into<String>, dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        let tables = TableFiles::open(&dir).map_err(|source| StoreError::Load {
            table: "directory",
            path: dir.clone(),
            source,
        })?;
        let books = tables.load_books()?;
        let loans = tables.load_loans()?;
        let name = name.into();
        info!(
            engine = %name,
            dir = %dir.display(),
            books = books.len(),
            loans = loans.len(),
            "opened storage engine"
        );
        Ok(Self {
            name,
            tables: Some(tables),
            state: Mutex::new(EngineState::new(books, loans)),
        })
    }

    /// Name used in logs and to order locks during resync.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Backing files, or `None` for an in-memory engine.
    pub fn tables(&self) -> Option<&TableFiles> {
        self.tables.as_ref()
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_available(&self, state: &EngineState) -> Result<(), StoreError> {
        if state.available {
            Ok(())
        } else {
            Err(StoreError::Unavailable(self.name.clone()))
        }
    }

    // ---- administrative surface ------------------------------------------

    pub fn is_available(&self) -> bool {
        self.lock().available
    }

    pub fn set_available(&self, available: bool) {
        let mut state = self.lock();
        if state.available != available {
            info!(engine = %self.name, available, "availability changed");
        }
        state.available = available;
    }

    /// Arms the fault plan: after `writes` more successful writes the engine
    /// switches itself off. `0` switches it off immediately.
    pub fn fail_after_writes(&self, writes: u64) {
        let mut state = self.lock();
        if writes == 0 {
            state.available = false;
            state.writes_until_failure = None;
            warn!(engine = %self.name, "fault plan fired immediately");
        } else {
            state.writes_until_failure = Some(writes);
        }
    }

    /// Adds a fixed delay to every write, taken while the engine lock is held.
    pub fn inject_latency(&self, latency: Option<Duration>) {
        self.lock().write_latency = latency;
    }

    /// Inserts the given books unless a book with the same code exists.
    /// Returns how many were added.
    pub fn seed<I>(&self, books: I) -> Result<usize, StoreError>
    where
        I: IntoIterator<Item = Book>,
    {
        let mut state = self.lock();
        let mut staged = state.books.clone();
        let mut added = 0;
        for book in books {
            if !staged.contains_key(&book.code) {
                staged.insert(book.code.clone(), book);
                added += 1;
            }
        }
        if added > 0 {
            if let Some(tables) = &self.tables {
                tables.save_books(&staged)?;
            }
            state.books = staged;
        }
        Ok(added)
    }

    pub fn book(&self, code: &str) -> Option<Book> {
        self.lock().books.get(code).cloned()
    }

    pub fn loan(&self, id: &str) -> Option<Loan> {
        self.lock().loans.get(id).cloned()
    }

    /// Clones both tables under the lock.
    pub fn snapshot(&self) -> StoreSnapshot {
        let state = self.lock();
        StoreSnapshot {
            books: state.books.clone(),
            loans: state.loans.clone(),
        }
    }

    // ---- operations ------------------------------------------------------

    /// True iff the book exists and has at least one copy on the shelf.
    pub fn check_availability(&self, book_code: &str) -> Result<bool, StoreError> {
        let state = self.lock();
        self.ensure_available(&state)?;
        Ok(has_copies(&state.books, book_code))
    }

    /// Lends one copy of `book_code` to `user_id`.
    ///
    /// Returns `Ok(None)` when the book is unknown or has no copies left.
    pub fn grant_loan(
        &self,
        user_id: &str,
        book_code: &str,
        start_date: &str,
        end_date: &str,
    ) -> Result<Option<Loan>, StoreError> {
        let mut state = self.lock();
        self.ensure_available(&state)?;
        state.simulate_latency();

        if !has_copies(&state.books, book_code) {
            debug!(engine = %self.name, book_code, "no copies available");
            return Ok(None);
        }

        let loan = Loan {
            id: nanoid::nanoid!(),
            user_id: user_id.to_string(),
            book_code: book_code.to_string(),
            start_date: start_date.to_string(),
            end_date: end_date.to_string(),
            renewal_count: 0,
            status: LoanStatus::Active,
        };
        self.insert_loan(&mut state, loan.clone())?;
        debug!(engine = %self.name, loan_id = %loan.id, book_code, "loan granted");
        Ok(Some(loan))
    }

    /// Marks a loan as returned and puts the copy back on the shelf.
    ///
    /// Returns `false` for unknown or already returned loans.
    pub fn register_return(&self, loan_id: &str) -> Result<bool, StoreError> {
        let mut state = self.lock();
        self.ensure_available(&state)?;
        state.simulate_latency();
        self.apply_return(&mut state, loan_id)
    }

    /// Extends a loan to `new_end_date`.
    ///
    /// Returns `false` for unknown or returned loans and once the loan has
    /// been renewed [`crate::model::MAX_RENEWALS`] times.
    pub fn register_renewal(&self, loan_id: &str, new_end_date: &str) -> Result<bool, StoreError> {
        let mut state = self.lock();
        self.ensure_available(&state)?;
        state.simulate_latency();
        self.apply_renewal(&mut state, loan_id, new_end_date)
    }

    /// Replays a write committed on another engine.
    ///
    /// Grants are idempotent by loan id. Returns whether anything changed.
    pub fn apply_replicated(&self, write: &ReplicatedWrite) -> Result<bool, StoreError> {
        let mut state = self.lock();
        self.ensure_available(&state)?;
        match write {
            ReplicatedWrite::Grant { loan } => {
                if state.loans.contains_key(&loan.id) {
                    return Ok(false);
                }
                if !has_copies(&state.books, &loan.book_code) {
                    warn!(
                        engine = %self.name,
                        loan_id = %loan.id,
                        book_code = %loan.book_code,
                        "replicated grant has no copy to take, skipping"
                    );
                    return Ok(false);
                }
                self.insert_loan(&mut state, loan.clone())?;
                Ok(true)
            }
            ReplicatedWrite::Return { loan_id } => self.apply_return(&mut state, loan_id),
            ReplicatedWrite::Renewal {
                loan_id,
                new_end_date,
            } => self.apply_renewal(&mut state, loan_id, new_end_date),
        }
    }

    /// Replaces this engine's tables with the last-known-good data of
    /// `source`.
    ///
    /// Both engine locks are taken in name order so two racing callers can
    /// never deadlock. File-backed sources are copied file by file; otherwise
    /// the source's in-memory tables are cloned. Availability of either side
    /// is ignored: resync is how data is rescued from a failed primary.
    pub fn resync_from(&self, source: &StorageEngine) -> Result<(), StoreError> {
        if std::ptr::eq(self, source) || self.name == source.name {
            return Err(StoreError::SelfResync(self.name.clone()));
        }

        let self_first = self.name < source.name;
        let (first, second) = if self_first {
            (self, source)
        } else {
            (source, self)
        };
        let first_guard = first.lock();
        let second_guard = second.lock();
        let (mut target, origin) = if self_first {
            (first_guard, second_guard)
        } else {
            (second_guard, first_guard)
        };

        match (&source.tables, &self.tables) {
            (Some(src), Some(dst)) => {
                let reloaded = dst
                    .copy_from(src)
                    .and_then(|copied| Ok((copied, dst.load_books()?, dst.load_loans()?)));
                let (copied, books, loans) = match reloaded {
                    Ok(reloaded) => reloaded,
                    Err(err) => {
                        // Files on disk must keep matching what this engine serves.
                        if let Err(restore) = dst
                            .save_books(&target.books)
                            .and_then(|()| dst.save_loans(&target.loans))
                        {
                            warn!(engine = %self.name, error = %restore, "failed to restore tables after resync");
                        }
                        return Err(err);
                    }
                };
                target.books = books;
                target.loans = loans;
                info!(from = %source.name, to = %self.name, files = copied, "resynchronized table files");
            }
            (_, dst) => {
                let books = origin.books.clone();
                let loans = origin.loans.clone();
                if let Some(dst) = dst {
                    dst.save_books(&books)?;
                    dst.save_loans(&loans)?;
                }
                target.books = books;
                target.loans = loans;
                info!(from = %source.name, to = %self.name, "resynchronized in-memory tables");
            }
        }
        Ok(())
    }

    // ---- internals -------------------------------------------------------

    fn insert_loan(&self, state: &mut EngineState, loan: Loan) -> Result<(), StoreError> {
        let mut books = state.books.clone();
        if let Some(book) = books.get_mut(&loan.book_code) {
            book.available_copies -= 1;
        }
        let mut loans = state.loans.clone();
        loans.insert(loan.id.clone(), loan);
        self.commit(state, Some(books), Some(loans))
    }

    fn apply_return(&self, state: &mut EngineState, loan_id: &str) -> Result<bool, StoreError> {
        let Some(loan) = state.loans.get(loan_id).filter(|l| l.is_active()) else {
            debug!(engine = %self.name, loan_id, "return rejected: unknown or returned loan");
            return Ok(false);
        };

        let mut loans = state.loans.clone();
        let mut books = None;
        if let Some(book) = state.books.get(&loan.book_code) {
            let mut staged = state.books.clone();
            staged.insert(
                book.code.clone(),
                Book {
                    available_copies: book.available_copies + 1,
                    ..book.clone()
                },
            );
            books = Some(staged);
        }
        if let Some(loan) = loans.get_mut(loan_id) {
            loan.status = LoanStatus::Returned;
        }
        self.commit(state, books, Some(loans))?;
        Ok(true)
    }

    fn apply_renewal(
        &self,
        state: &mut EngineState,
        loan_id: &str,
        new_end_date: &str,
    ) -> Result<bool, StoreError> {
        if !state.loans.get(loan_id).is_some_and(Loan::can_renew) {
            debug!(engine = %self.name, loan_id, "renewal rejected");
            return Ok(false);
        }
        let mut loans = state.loans.clone();
        if let Some(loan) = loans.get_mut(loan_id) {
            loan.renewal_count += 1;
            loan.end_date = new_end_date.to_string();
        }
        self.commit(state, None, Some(loans))?;
        Ok(true)
    }

    /// Persists staged tables, then swaps them in. In-memory state only
    /// changes once every touched table is durable.
    fn commit(
        &self,
        state: &mut EngineState,
        books: Option<BTreeMap<String, Book>>,
        loans: Option<BTreeMap<String, Loan>>,
    ) -> Result<(), StoreError> {
        if let Some(tables) = &self.tables {
            if let Some(books) = &books {
                tables.save_books(books)?;
            }
            if let Some(loans) = &loans {
                if let Err(err) = tables.save_loans(loans) {
                    if books.is_some() {
                        if let Err(restore) = tables.save_books(&state.books) {
                            warn!(engine = %self.name, error = %restore, "failed to restore books table");
                        }
                    }
                    return Err(err);
                }
            }
        }
        if let Some(books) = books {
            state.books = books;
        }
        if let Some(loans) = loans {
            state.loans = loans;
        }
        self.record_write(state);
        Ok(())
    }

    fn record_write(&self, state: &mut EngineState) {
        let Some(remaining) = state.writes_until_failure.as_mut() else {
            return;
        };
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            state.writes_until_failure = None;
            state.available = false;
            warn!(engine = %self.name, "fault plan fired, engine now unavailable");
        }
    }
}

fn has_copies(books: &BTreeMap<String, Book>, code: &str) -> bool {
    books.get(code).is_some_and(|b| b.available_copies > 0)
}
