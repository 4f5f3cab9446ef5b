//! Crash-safe, file-backed queues of operations waiting to be applied.
//!
//! Each queue is a text file with one pending payload per line. Appends are
//! fsynced before `enqueue` returns. Only newline-terminated lines count as
//! items: a tail torn by a crash mid-append is ignored by readers and cut off
//! before the next append. `process_all` rewrites the file through a
//! temp file and an atomic rename, so a crash mid-rewrite leaves the previous
//! queue intact and a reader never sees a half-written file.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::tables::write_atomic;

/// Outcome of one [`DurableQueue::process_all`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessReport {
    pub processed: usize,
    pub kept: usize,
    /// Items whose processor returned an error (also counted in `kept`).
    pub errors: usize,
}

impl ProcessReport {
    fn merge(&mut self, other: ProcessReport) {
        self.processed += other.processed;
        self.kept += other.kept;
        self.errors += other.errors;
    }
}

/// A single crash-safe queue file.
///
/// All operations on one queue are serialized by its own lock; separate
/// queues never block each other.
pub struct DurableQueue {
    path: PathBuf,
    lock: Mutex<()>,
}

impl DurableQueue {
    /// Opens the queue at `path`, creating parent directories and an empty
    /// file when missing.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    /// Location of the queue file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends one item. Durable once this returns `Ok`.
    pub fn enqueue(&self, item: &str) -> io::Result<()> {
        let _guard = self.lock();
        let line = flatten(item);
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&self.path)?;
        self.discard_torn_tail(&mut file)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_data()?;
        debug!(queue = %self.path.display(), "enqueued pending operation");
        Ok(())
    }

    /// Every queued item, oldest first, without removing anything.
    pub fn snapshot(&self) -> io::Result<Vec<String>> {
        let _guard = self.lock();
        self.read_items()
    }

    /// Number of queued items.
    pub fn len(&self) -> io::Result<usize> {
        Ok(self.snapshot()?.len())
    }

    pub fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }

    fn read_items(&self) -> io::Result<Vec<String>> {
        let contents = match fs::read(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        Ok(contents
            .split_inclusive(|byte| *byte == b'\n')
            .filter(|line| line.ends_with(b"\n"))
            .map(|line| String::from_utf8_lossy(line).trim().to_string())
            .filter(|line| !line.is_empty())
            .collect())
    }

    /// Truncates a last line that lacks its newline, left by a crash
    /// mid-append, so the next item cannot merge into it.
    fn discard_torn_tail(&self, file: &mut File) -> io::Result<()> {
        let len = file.metadata()?.len();
        if len == 0 {
            return Ok(());
        }
        let mut last = [0u8; 1];
        file.seek(SeekFrom::Start(len - 1))?;
        file.read_exact(&mut last)?;
        if last[0] == b'\n' {
            return Ok(());
        }

        let mut contents = Vec::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut contents)?;
        let keep = contents
            .iter()
            .rposition(|byte| *byte == b'\n')
            .map_or(0, |newline| newline + 1);
        warn!(
            queue = %self.path.display(),
            discarded = contents.len() - keep,
            "discarding torn record at end of retry queue"
        );
        file.set_len(keep as u64)?;
        file.sync_data()
    }

    /// Runs `processor` over every queued item and removes the ones it
    /// reports as done.
    ///
    /// `Ok(false)` and `Err(_)` both keep the item, in its original position
    /// relative to the other kept items. The processor may block: the queue
    /// lock is held for the whole pass, but only this queue is affected.
    pub fn process_all<F>(&self, mut processor: F) -> io::Result<ProcessReport>
    where
        F: FnMut(&str) -> Result<bool>,
    {
        let _guard = self.lock();
        let items = self.read_items()?;
        if items.is_empty() {
            return Ok(ProcessReport::default());
        }

        let mut report = ProcessReport::default();
        let mut remaining = Vec::with_capacity(items.len());
        for item in items {
            match processor(&item) {
                Ok(true) => report.processed += 1,
                Ok(false) => remaining.push(item),
                Err(err) => {
                    warn!(queue = %self.path.display(), error = ?err, "processor failed, keeping item");
                    report.errors += 1;
                    remaining.push(item);
                }
            }
        }
        report.kept = remaining.len();

        if report.processed > 0 {
            let mut contents = remaining.join("\n");
            if !contents.is_empty() {
                contents.push('\n');
            }
            write_atomic(&self.path, contents.as_bytes())?;
            info!(
                queue = %self.path.display(),
                processed = report.processed,
                kept = report.kept,
                "rewrote retry queue"
            );
        }
        Ok(report)
    }
}

fn flatten(item: &str) -> String {
    item.trim().replace(['\r', '\n'], " ")
}

/// Category of a pending operation; each has its own queue file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RetryCategory {
    Return,
    Renewal,
    Control,
}

impl RetryCategory {
    pub const ALL: [RetryCategory; 3] = [
        RetryCategory::Return,
        RetryCategory::Renewal,
        RetryCategory::Control,
    ];

    pub fn file_name(self) -> &'static str {
        match self {
            RetryCategory::Return => "returns.queue",
            RetryCategory::Renewal => "renewals.queue",
            RetryCategory::Control => "control.queue",
        }
    }

    /// Name used by the `ENQUEUE;type=...` envelope.
    pub fn wire_name(self) -> &'static str {
        match self {
            RetryCategory::Return => "Devolucion",
            RetryCategory::Renewal => "Renovacion",
            RetryCategory::Control => "Control",
        }
    }

    pub fn from_wire(name: &str) -> Option<Self> {
        RetryCategory::ALL
            .into_iter()
            .find(|category| category.wire_name() == name)
    }
}

impl fmt::Display for RetryCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// One durable queue per [`RetryCategory`], all under one directory.
pub struct RetryQueues {
    returns: DurableQueue,
    renewals: DurableQueue,
    control: DurableQueue,
}

impl RetryQueues {
    /// Opens (creating if needed) every category's queue under `dir`.
    pub fn open(dir: impl AsRef<Path>) -> io::Result<Self> {
        let dir = dir.as_ref();
        Ok(Self {
            returns: DurableQueue::open(dir.join(RetryCategory::Return.file_name()))?,
            renewals: DurableQueue::open(dir.join(RetryCategory::Renewal.file_name()))?,
            control: DurableQueue::open(dir.join(RetryCategory::Control.file_name()))?,
        })
    }

    pub fn queue(&self, category: RetryCategory) -> &DurableQueue {
        match category {
            RetryCategory::Return => &self.returns,
            RetryCategory::Renewal => &self.renewals,
            RetryCategory::Control => &self.control,
        }
    }

    pub fn enqueue(&self, category: RetryCategory, payload: &str) -> io::Result<()> {
        self.queue(category).enqueue(payload)
    }

    /// Total items across all categories. Unreadable queues count as empty.
    pub fn depth(&self) -> usize {
        RetryCategory::ALL
            .into_iter()
            .map(|category| self.queue(category).len().unwrap_or(0))
            .sum()
    }

    /// Runs `processor` over every category in turn.
    ///
    /// A category whose file cannot be read or rewritten is logged and
    /// skipped for this pass; the others are still processed. The error is
    /// returned only when every category failed.
    pub fn process_all<F>(&self, mut processor: F) -> io::Result<ProcessReport>
    where
        F: FnMut(RetryCategory, &str) -> Result<bool>,
    {
        let mut total = ProcessReport::default();
        let mut last_err = None;
        let mut succeeded = 0;
        for category in RetryCategory::ALL {
            match self
                .queue(category)
                .process_all(|item| processor(category, item))
            {
                Ok(report) => {
                    total.merge(report);
                    succeeded += 1;
                }
                Err(err) => {
                    warn!(%category, error = %err, "retry queue pass failed, skipping category");
                    last_err = Some(err);
                }
            }
        }
        match last_err {
            Some(err) if succeeded == 0 => Err(err),
            _ => Ok(total),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::tmp_path;
    use anyhow::anyhow;

    fn queue() -> (tempfile::TempDir, DurableQueue) {
        let dir = tempfile::tempdir().unwrap();
        let queue = DurableQueue::open(dir.path().join("nested/returns.queue")).unwrap();
        (dir, queue)
    }

    #[test]
    fn enqueue_is_visible_in_snapshot_in_order() {
        let (_dir, queue) = queue();
        queue.enqueue("DEVOLUCION;prestamoId=a").unwrap();
        queue.enqueue("DEVOLUCION;prestamoId=b").unwrap();
        assert_eq!(
            queue.snapshot().unwrap(),
            vec!["DEVOLUCION;prestamoId=a", "DEVOLUCION;prestamoId=b"]
        );
    }

    #[test]
    fn embedded_newlines_are_flattened() {
        let (_dir, queue) = queue();
        queue.enqueue("RENOVACION;prestamoId=a\n;nuevaFecha=x").unwrap();
        assert_eq!(queue.len().unwrap(), 1);
    }

    #[test]
    fn process_all_removes_successes_and_keeps_order_of_the_rest() {
        let (_dir, queue) = queue();
        for id in ["a", "b", "c", "d"] {
            queue.enqueue(&format!("DEVOLUCION;prestamoId={id}")).unwrap();
        }

        let report = queue
            .process_all(|item| match item {
                "DEVOLUCION;prestamoId=b" => Ok(true),
                "DEVOLUCION;prestamoId=c" => Err(anyhow!("remote call failed")),
                _ => Ok(false),
            })
            .unwrap();

        assert_eq!(
            report,
            ProcessReport {
                processed: 1,
                kept: 3,
                errors: 1
            }
        );
        assert_eq!(
            queue.snapshot().unwrap(),
            vec![
                "DEVOLUCION;prestamoId=a",
                "DEVOLUCION;prestamoId=c",
                "DEVOLUCION;prestamoId=d"
            ]
        );
    }

    #[test]
    fn processed_items_are_never_seen_again() {
        let (_dir, queue) = queue();
        queue.enqueue("x").unwrap();
        let mut calls = 0;
        queue
            .process_all(|_| {
                calls += 1;
                Ok(true)
            })
            .unwrap();
        queue
            .process_all(|_| {
                calls += 1;
                Ok(true)
            })
            .unwrap();
        assert_eq!(calls, 1);
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn empty_queue_pass_is_a_noop() {
        let (_dir, queue) = queue();
        let report = queue.process_all(|_| unreachable!()).unwrap();
        assert_eq!(report, ProcessReport::default());
    }

    #[test]
    fn torn_tail_never_merges_with_the_next_item() {
        let (_dir, queue) = queue();
        fs::write(queue.path(), b"DEVO").unwrap();
        assert!(queue.is_empty().unwrap());

        queue.enqueue("DEVOLUCION;prestamoId=good").unwrap();
        assert_eq!(queue.snapshot().unwrap(), vec!["DEVOLUCION;prestamoId=good"]);
        assert_eq!(fs::read(queue.path()).unwrap(), b"DEVOLUCION;prestamoId=good\n");
    }

    #[test]
    fn torn_tail_after_complete_items_is_ignored() {
        let (_dir, queue) = queue();
        queue.enqueue("DEVOLUCION;prestamoId=a").unwrap();
        let mut file = OpenOptions::new().append(true).open(queue.path()).unwrap();
        file.write_all(b"DEVOLUCION;pres").unwrap();
        drop(file);

        assert_eq!(queue.snapshot().unwrap(), vec!["DEVOLUCION;prestamoId=a"]);
        queue.enqueue("DEVOLUCION;prestamoId=b").unwrap();
        assert_eq!(
            queue.snapshot().unwrap(),
            vec!["DEVOLUCION;prestamoId=a", "DEVOLUCION;prestamoId=b"]
        );
    }

    #[test]
    fn queue_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.queue");
        DurableQueue::open(&path).unwrap().enqueue("site=1;event=FAILOVER").unwrap();
        let reopened = DurableQueue::open(&path).unwrap();
        assert_eq!(reopened.snapshot().unwrap(), vec!["site=1;event=FAILOVER"]);
    }

    #[test]
    fn categories_use_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let queues = RetryQueues::open(dir.path()).unwrap();
        queues.enqueue(RetryCategory::Return, "DEVOLUCION;prestamoId=a").unwrap();
        queues
            .enqueue(RetryCategory::Renewal, "RENOVACION;prestamoId=a;nuevaFecha=b")
            .unwrap();
        assert_eq!(queues.depth(), 2);
        assert!(queues.queue(RetryCategory::Control).is_empty().unwrap());

        let mut seen = Vec::new();
        let report = queues
            .process_all(|category, _| {
                seen.push(category);
                Ok(category == RetryCategory::Return)
            })
            .unwrap();
        assert_eq!(seen, vec![RetryCategory::Return, RetryCategory::Renewal]);
        assert_eq!(report.processed, 1);
        assert_eq!(queues.depth(), 1);
    }

    #[test]
    fn broken_category_does_not_hold_back_the_others() {
        let dir = tempfile::tempdir().unwrap();
        let queues = RetryQueues::open(dir.path()).unwrap();
        queues.enqueue(RetryCategory::Return, "DEVOLUCION;prestamoId=a").unwrap();
        queues
            .enqueue(RetryCategory::Renewal, "RENOVACION;prestamoId=a;nuevaFecha=b")
            .unwrap();
        // The returns rewrite cannot rename over a directory.
        fs::create_dir(tmp_path(queues.queue(RetryCategory::Return).path())).unwrap();

        let report = queues.process_all(|_, _| Ok(true)).unwrap();

        assert_eq!(report.processed, 1);
        assert!(queues.queue(RetryCategory::Renewal).is_empty().unwrap());
        assert_eq!(queues.queue(RetryCategory::Return).len().unwrap(), 1);
    }

    #[test]
    fn wire_names_round_trip() {
        for category in RetryCategory::ALL {
            assert_eq!(RetryCategory::from_wire(category.wire_name()), Some(category));
        }
        assert_eq!(RetryCategory::from_wire("Prestamo"), None);
    }
}
