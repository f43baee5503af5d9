// src/core/history.rs

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::core::errors::Error;

/// Persisted record of each output's last-known script digest.
///
/// Timestamps only say whether an output is newer than its inputs; the digest
/// says whether the script that produces it actually changed, which catches
/// content edits that do not advance the clock. The store is a JSON object
/// mapping output path to digest-or-null, read before a run and written back
/// when the run scope ends. An absent backing file is an empty history.
#[derive(Debug, Default)]
pub struct History {
    path: Option<PathBuf>,
    entries: Mutex<HashMap<String, Option<String>>>,
}

impl History {
    /// Loads the history from `path`, or an empty in-memory history when no
    /// path is given. Missing files are not an error.
    pub fn load(path: Option<PathBuf>) -> Result<Self, Error> {
        let mut entries = HashMap::new();
        if let Some(backing) = &path
            && backing.exists()
        {
            let text = fs::read_to_string(backing)?;
            entries = serde_json::from_str(&text).map_err(|e| {
                Error::Decode(format!("history file `{}`: {e}", backing.display()))
            })?;
        }
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// True when the recorded digest for `target` matches `digest`. An absent
    /// entry counts as a mismatch, so unseen outputs are considered stale.
    pub fn up_to_date(&self, target: &Path, digest: Option<&str>) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key(target))
            .is_some_and(|recorded| recorded.as_deref() == digest)
    }

    pub fn record(&self, target: &Path, digest: Option<&str>) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key(target), digest.map(str::to_owned));
    }

    /// Writes the history back to its backing file, if any.
    pub fn save(&self) -> Result<(), Error> {
        let Some(backing) = &self.path else {
            return Ok(());
        };
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let text = serde_json::to_string_pretty(&*entries)
            .map_err(|e| Error::Decode(format!("history: {e}")))?;
        fs::write(backing, text)?;
        Ok(())
    }

    /// Scopes persistence to a run: the returned guard saves the history when
    /// dropped, logging instead of panicking on failure.
    pub fn persist(&self) -> HistoryGuard<'_> {
        HistoryGuard(self)
    }
}

pub struct HistoryGuard<'a>(&'a History);

impl Drop for HistoryGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.0.save() {
            log::warn!("could not persist history: {e}");
        }
    }
}

fn key(target: &Path) -> String {
    target.display().to_string()
}
