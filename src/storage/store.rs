use crate::storage::LogEntry;
use log::{info, warn};
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Ordered, append-optimized entry store persisted as JSON lines.
///
/// Indices in `[first_index, last_index]` are contiguous. The
/// `backup`/`commit`/`restore` triple stages the whole store for compaction:
/// between `backup` and `commit` every mutation can be rolled back with
/// `restore`, and a crash inside the window is rolled back at `open`.
#[derive(Debug)]
pub struct LogStore {
    log_path: PathBuf,
    backup_path: PathBuf,
    entries: Vec<LogEntry>,
    bytes: u64,
    staged: Option<Staged>,
}

#[derive(Debug)]
struct Staged {
    entries: Vec<LogEntry>,
    bytes: u64,
}

impl LogStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LogError> {
        let log_path = path.into();
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let backup_path = log_path.with_extension("bak");

        // A leftover backup means a compaction window never committed;
        // the backup is the authoritative state.
        if backup_path.exists() {
            warn!(
                "event=replica_log_recover path={} reason=stale_backup",
                log_path.display()
            );
            fs::rename(&backup_path, &log_path)?;
        }
        if !log_path.exists() {
            File::create(&log_path)?;
        }

        let entries = Self::load_entries(&log_path)?;
        let bytes = entries
            .iter()
            .map(|entry| line_len(entry))
            .sum::<Result<u64, LogError>>()?;
        Ok(Self {
            log_path,
            backup_path,
            entries,
            bytes,
            staged: None,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total serialized size of the stored entries, in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.bytes
    }

    pub fn first_index(&self) -> u64 {
        self.entries.first().map(|entry| entry.index).unwrap_or(0)
    }

    pub fn last_index(&self) -> u64 {
        self.entries.last().map(|entry| entry.index).unwrap_or(0)
    }

    /// `(term, index)` of the last entry, `(0, 0)` when empty.
    pub fn last_entry_id(&self) -> (u64, u64) {
        self.entries
            .last()
            .map(|entry| (entry.term, entry.index))
            .unwrap_or((0, 0))
    }

    pub fn entry(&self, index: u64) -> Option<&LogEntry> {
        let first = self.first_index();
        if first == 0 || index < first {
            return None;
        }
        self.entries.get((index - first) as usize)
    }

    pub fn term_at(&self, index: u64) -> Option<u64> {
        self.entry(index).map(|entry| entry.term)
    }

    /// Clones entries from `start` onward, at most `max` of them.
    pub fn entries_from(&self, start: u64, max: usize) -> Vec<LogEntry> {
        let first = self.first_index();
        if first == 0 || start > self.last_index() {
            return Vec::new();
        }
        let offset = start.max(first) - first;
        self.entries
            .iter()
            .skip(offset as usize)
            .take(max)
            .cloned()
            .collect()
    }

    pub fn append(&mut self, entry: LogEntry) -> Result<(), LogError> {
        match self.entries.last() {
            Some(last) if entry.index != last.index + 1 => {
                return Err(LogError::NonSequentialAppend {
                    expected: last.index + 1,
                    attempted: entry.index,
                });
            }
            Some(last) if entry.term < last.term => {
                return Err(LogError::TermRegression {
                    previous: last.term,
                    attempted: entry.term,
                });
            }
            None if entry.index == 0 => {
                return Err(LogError::NonSequentialAppend {
                    expected: 1,
                    attempted: 0,
                });
            }
            _ => {}
        }

        let line = serde_json::to_string(&entry)?;
        Self::append_line(&self.log_path, &line)?;
        self.bytes += line.len() as u64 + 1;
        self.entries.push(entry);
        Ok(())
    }

    /// Appends a batch, skipping entries already present with the same term.
    pub fn append_batch(&mut self, entries: &[LogEntry]) -> Result<(), LogError> {
        for entry in entries {
            if self
                .entry(entry.index)
                .map(|existing| existing.term == entry.term)
                .unwrap_or(false)
            {
                continue;
            }
            self.append(entry.clone())?;
        }
        Ok(())
    }

    /// Truncates the suffix so `last_index` becomes `index`.
    pub fn remove_after(&mut self, index: u64) -> Result<(), LogError> {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.index <= index);
        if self.entries.len() == before {
            return Ok(());
        }
        info!(
            "event=replica_log_truncate_suffix last_index={} removed={}",
            index,
            before - self.entries.len()
        );
        self.rewrite()
    }

    /// Drops the prefix so `first_index` becomes `index`.
    pub fn remove_before(&mut self, index: u64) -> Result<(), LogError> {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.index >= index);
        if self.entries.len() == before {
            return Ok(());
        }
        info!(
            "event=replica_log_drop_prefix first_index={} removed={}",
            index,
            before - self.entries.len()
        );
        self.rewrite()
    }

    /// Inserts `entries` ahead of the current first entry. The batch must be
    /// internally contiguous and end exactly one index below `first_index`.
    pub fn prepend(&mut self, entries: Vec<LogEntry>) -> Result<(), LogError> {
        if entries.is_empty() {
            return Ok(());
        }
        for pair in entries.windows(2) {
            if pair[1].index != pair[0].index + 1 {
                return Err(LogError::PrependGap {
                    expected: pair[0].index + 1,
                    attempted: pair[1].index,
                });
            }
        }
        let incoming_last = entries.last().map(|entry| entry.index).unwrap_or(0);
        let first = self.first_index();
        if first > 0 && incoming_last + 1 != first {
            return Err(LogError::PrependGap {
                expected: first.saturating_sub(1),
                attempted: incoming_last,
            });
        }
        let mut combined = entries;
        combined.append(&mut self.entries);
        self.entries = combined;
        self.rewrite()
    }

    /// Stages the current state. Mutations until `commit` can be undone
    /// with `restore`; a crash before `commit` is undone at `open`.
    pub fn backup(&mut self) -> Result<(), LogError> {
        fs::copy(&self.log_path, &self.backup_path)?;
        self.staged = Some(Staged {
            entries: self.entries.clone(),
            bytes: self.bytes,
        });
        Ok(())
    }

    /// Discards the staged state, making all mutations since `backup` final.
    pub fn commit(&mut self) -> Result<(), LogError> {
        if self.staged.take().is_none() {
            return Err(LogError::NoBackup);
        }
        if self.backup_path.exists() {
            fs::remove_file(&self.backup_path)?;
        }
        Ok(())
    }

    /// Rolls the store back to the last `backup`.
    pub fn restore(&mut self) -> Result<(), LogError> {
        let staged = self.staged.take().ok_or(LogError::NoBackup)?;
        self.entries = staged.entries;
        self.bytes = staged.bytes;
        self.rewrite()?;
        if self.backup_path.exists() {
            fs::remove_file(&self.backup_path)?;
        }
        Ok(())
    }

    pub fn has_staged_backup(&self) -> bool {
        self.staged.is_some()
    }

    fn rewrite(&mut self) -> Result<(), LogError> {
        let tmp = self.log_path.with_extension("rewrite");
        let mut file = File::create(&tmp)?;
        let mut total = 0u64;
        for entry in &self.entries {
            let line = serde_json::to_string(entry)?;
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")?;
            total += line.len() as u64 + 1;
        }
        file.sync_all()?;
        fs::rename(tmp, &self.log_path)?;
        self.bytes = total;
        Ok(())
    }

    fn append_line(path: &Path, line: &str) -> Result<(), LogError> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_all()?;
        Ok(())
    }

    fn load_entries(path: &Path) -> Result<Vec<LogEntry>, LogError> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line)?);
        }
        Ok(entries)
    }
}

fn line_len<T: Serialize>(value: &T) -> Result<u64, LogError> {
    Ok(serde_json::to_string(value)?.len() as u64 + 1)
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("expected next index {expected}, attempted {attempted}")]
    NonSequentialAppend { expected: u64, attempted: u64 },
    #[error("term regression: previous={previous}, attempted={attempted}")]
    TermRegression { previous: u64, attempted: u64 },
    #[error("prepend leaves a gap: expected {expected}, attempted {attempted}")]
    PrependGap { expected: u64, attempted: u64 },
    #[error("no staged backup")]
    NoBackup,
}
