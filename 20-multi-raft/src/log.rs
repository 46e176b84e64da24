//! Per-group log storage.
//!
//! A [`LogStore`] keeps the ordered `(term, payload)` entries of one group
//! together with the persistent election state (current term and vote). The
//! consensus core is its only writer; every mutation goes through the group's
//! actor, so implementations need no internal locking.

use thiserror::Error;

use crate::types::{Entry, LogIndex, ServerId, Term};

#[derive(Debug, Error)]
pub enum LogError {
    #[error("append at index {index} would leave a gap after {latest}")]
    Gap { index: LogIndex, latest: LogIndex },

    #[error("entry {index} is committed and cannot be replaced")]
    Committed { index: LogIndex },

    #[error("log io: {0}")]
    Io(#[from] std::io::Error),
}

pub trait LogStore: Send + 'static {
    fn current_term(&self) -> Term;

    /// Moves to `term` and forgets any vote cast in an earlier term.
    fn set_current_term(&mut self, term: Term) -> Result<(), LogError>;

    fn voted_for(&self) -> Option<ServerId>;

    fn set_voted_for(&mut self, candidate: Option<ServerId>) -> Result<(), LogError>;

    fn latest_index(&self) -> LogIndex;

    fn entry(&self, index: LogIndex) -> Option<&Entry>;

    /// Appends at `latest_index() + 1` and returns the new index.
    fn append(&mut self, entry: Entry) -> Result<LogIndex, LogError>;

    /// Drops every entry at or after `from`.
    fn truncate(&mut self, from: LogIndex) -> Result<(), LogError>;

    /// Term of the entry at `index`; index 0 has term 0.
    fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        self.entry(index).map(|entry| entry.term)
    }

    fn latest_term(&self) -> Term {
        self.term_at(self.latest_index()).unwrap_or(0)
    }

    /// Clones entries in `[from, until)`.
    fn entries(&self, from: LogIndex, until: LogIndex) -> Vec<Entry> {
        (from.max(1)..until)
            .map_while(|index| self.entry(index).cloned())
            .collect()
    }

    /// Places `entries` right after `prev_index`, replacing only what conflicts.
    ///
    /// Entries already present with the same term are kept; at the first term
    /// mismatch the tail is truncated and the rest appended. Nothing at or below
    /// `committed` is ever replaced. Returns `prev_index + entries.len()`.
    fn append_entries(
        &mut self,
        prev_index: LogIndex,
        entries: &[Entry],
        committed: LogIndex,
    ) -> Result<LogIndex, LogError> {
        let latest = self.latest_index();
        if prev_index > latest {
            return Err(LogError::Gap {
                index: prev_index + 1,
                latest,
            });
        }

        for (offset, entry) in entries.iter().enumerate() {
            let index = prev_index + 1 + offset as LogIndex;
            match self.term_at(index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    if index <= committed {
                        return Err(LogError::Committed { index });
                    }
                    self.truncate(index)?;
                    self.append(entry.clone())?;
                }
                None => {
                    self.append(entry.clone())?;
                }
            }
        }

        Ok(prev_index + entries.len() as LogIndex)
    }
}

/// Volatile log kept in memory.
#[derive(Debug, Default, Clone)]
pub struct MemLog {
    current_term: Term,
    voted_for: Option<ServerId>,
    entries: Vec<Entry>,
}

impl MemLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogStore for MemLog {
    fn current_term(&self) -> Term {
        self.current_term
    }

    fn set_current_term(&mut self, term: Term) -> Result<(), LogError> {
        if term != self.current_term {
            self.voted_for = None;
        }
        self.current_term = term;
        Ok(())
    }

    fn voted_for(&self) -> Option<ServerId> {
        self.voted_for
    }

    fn set_voted_for(&mut self, candidate: Option<ServerId>) -> Result<(), LogError> {
        self.voted_for = candidate;
        Ok(())
    }

    fn latest_index(&self) -> LogIndex {
        self.entries.len() as LogIndex
    }

    fn entry(&self, index: LogIndex) -> Option<&Entry> {
        let slot = usize::try_from(index).ok()?.checked_sub(1)?;
        self.entries.get(slot)
    }

    fn append(&mut self, entry: Entry) -> Result<LogIndex, LogError> {
        self.entries.push(entry);
        Ok(self.latest_index())
    }

    fn truncate(&mut self, from: LogIndex) -> Result<(), LogError> {
        let keep = from.saturating_sub(1) as usize;
        self.entries.truncate(keep);
        Ok(())
    }
}
