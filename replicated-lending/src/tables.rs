//! On-disk tables for a file-backed storage engine.
//!
//! Each table is a single JSON document. Writes go to `<file>.tmp`, are
//! fsynced, then renamed over the live file, so a reader either sees the
//! previous document or the new one, never a torn record.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Serialize, de::DeserializeOwned};

use crate::error::StoreError;
use crate::model::{Book, Loan};

pub const BOOKS_FILE: &str = "books.json";
pub const LOANS_FILE: &str = "loans.json";

/// Directory holding `books.json` and `loans.json` for one engine.
#[derive(Debug, Clone)]
pub struct TableFiles {
    dir: PathBuf,
}

impl TableFiles {
    /// Opens (creating if needed) the directory holding both tables.
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn books_path(&self) -> PathBuf {
        self.dir.join(BOOKS_FILE)
    }

    pub fn loans_path(&self) -> PathBuf {
        self.dir.join(LOANS_FILE)
    }

    pub fn load_books(&self) -> Result<BTreeMap<String, Book>, StoreError> {
        let books: Vec<Book> = load_table(&self.books_path(), "books")?;
        Ok(books.into_iter().map(|b| (b.code.clone(), b)).collect())
    }

    pub fn load_loans(&self) -> Result<BTreeMap<String, Loan>, StoreError> {
        let loans: Vec<Loan> = load_table(&self.loans_path(), "loans")?;
        Ok(loans.into_iter().map(|l| (l.id.clone(), l)).collect())
    }

    pub fn save_books(&self, books: &BTreeMap<String, Book>) -> Result<(), StoreError> {
        save_table(&self.books_path(), "books", books.values())
    }

    pub fn save_loans(&self, loans: &BTreeMap<String, Loan>) -> Result<(), StoreError> {
        save_table(&self.loans_path(), "loans", loans.values())
    }

    /// Copies both table files from `source` into this directory.
    ///
    /// Every file is staged as `<file>.tmp` and fsynced first. Nothing is
    /// renamed into place unless all copies staged, so a failed copy leaves
    /// the live tables untouched. Missing source files are skipped. Returns
    /// how many files were copied.
    pub fn copy_from(&self, source: &TableFiles) -> Result<usize, StoreError> {
        let mut staged = Vec::with_capacity(2);
        for (table, name) in [("books", BOOKS_FILE), ("loans", LOANS_FILE)] {
            let src = source.dir.join(name);
            if !src.exists() {
                continue;
            }
            let dst = self.dir.join(name);
            if let Err(source) = stage_copy(&src, &dst) {
                discard_staged(&staged);
                return Err(StoreError::Persist {
                    table,
                    path: dst,
                    source,
                });
            }
            staged.push((table, dst));
        }

        for (index, (table, dst)) in staged.iter().enumerate() {
            if let Err(source) = fs::rename(tmp_path(dst), dst) {
                discard_staged(&staged[index..]);
                return Err(StoreError::Persist {
                    table: *table,
                    path: dst.clone(),
                    source,
                });
            }
        }
        sync_parent_dir(&self.books_path());
        Ok(staged.len())
    }
}

fn load_table<T: DeserializeOwned>(path: &Path, table: &'static str) -> Result<Vec<T>, StoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(StoreError::Load {
                table,
                path: path.to_path_buf(),
                source,
            });
        }
    };
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
        table,
        path: path.to_path_buf(),
        source,
    })
}

fn save_table<'a, T, I>(path: &Path, table: &'static str, rows: I) -> Result<(), StoreError>
where
    T: Serialize + 'a,
    I: Iterator<Item = &'a T>,
{
    let rows: Vec<&T> = rows.collect();
    let persist_err = |source: io::Error| StoreError::Persist {
        table,
        path: path.to_path_buf(),
        source,
    };
    let bytes = serde_json::to_vec_pretty(&rows).map_err(|err| persist_err(err.into()))?;
    write_atomic(path, &bytes).map_err(persist_err)
}

/// Path of the scratch file used while replacing `path`.
pub fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Replaces `path` with `bytes` via write-to-temp, fsync, rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = tmp_path(path);
    let result = (|| {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, path)?;
        sync_parent_dir(path);
        Ok(())
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

fn stage_copy(src: &Path, dst: &Path) -> io::Result<()> {
    let tmp = tmp_path(dst);
    let result = fs::copy(src, &tmp).and_then(|_| File::open(&tmp)?.sync_all());
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

fn discard_staged(staged: &[(&'static str, PathBuf)]) {
    for (_, dst) in staged {
        let _ = fs::remove_file(tmp_path(dst));
    }
}

/// Makes a rename inside the directory durable. Best effort.
pub fn sync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}
