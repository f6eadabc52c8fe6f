//! Durable record of which payloads exist on disk
//!
//! The index is an append-only JSONL journal mapping cache keys to the
//! locator and fingerprint that produced them, with access times for
//! diagnostics and future pruning. It is strictly advisory: a missing or
//! corrupt journal never fails a request, it only forces recomputation. On
//! corruption the journal is discarded and restarted empty, and the affected
//! payloads are recomputed on their next miss.

use crate::attribute::CacheKey;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

/// One live index row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
  pub locator: String,
  pub fingerprint: String,
  pub recorded_at: u64,
  pub last_access: u64,
}

/// Durable (locator, fingerprint) bookkeeping for the disk tier.
///
/// All operations are best-effort: implementations log and degrade rather
/// than propagate I/O errors, because index loss is always recoverable by
/// recomputing payloads.
pub trait IndexStore: Send + Sync {
  /// Look up a key, updating its last-access time on hit.
  fn find(&self, key: &CacheKey) -> Option<IndexEntry>;

  /// Record that a payload for `key` exists. Idempotent: recording an
  /// already-present key only refreshes its access time.
  fn record(&self, key: &CacheKey, locator: &str, fingerprint: &str);

  /// Drop the row for `key`, if any.
  fn remove(&self, key: &CacheKey);

  /// Number of live rows.
  fn len(&self) -> usize;

  fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalRecord {
  Insert {
    key: String,
    locator: String,
    fingerprint: String,
    at: u64,
  },
  Touch {
    key: String,
    at: u64,
  },
  Remove {
    key: String,
  },
}

#[derive(Default)]
struct IndexState {
  loaded: bool,
  entries: HashMap<String, IndexEntry>,
}

/// JSONL-journal-backed [`IndexStore`].
pub struct JournalIndex {
  journal_path: PathBuf,
  state: Mutex<IndexState>,
}

impl JournalIndex {
  /// Open (or create) the journal under `dir`. The directory is created if
  /// missing; replay happens lazily on first use.
  pub fn open(dir: impl AsRef<Path>) -> Self {
    let dir = dir.as_ref();
    let _ = fs::create_dir_all(dir);
    Self {
      journal_path: dir.join("index.jsonl"),
      state: Mutex::new(IndexState::default()),
    }
  }

  fn now() -> u64 {
    SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .map(|d| d.as_secs())
      .unwrap_or(0)
  }

  fn ensure_loaded(&self, state: &mut IndexState) {
    if state.loaded {
      return;
    }
    state.loaded = true;
    match self.replay(state) {
      Ok(lines) => {
        // Touch and remove records accumulate across runs; rewrite the
        // journal to its live rows whenever it carries dead lines.
        let live = state.entries.len()
          + state
            .entries
            .values()
            .filter(|e| e.last_access != e.recorded_at)
            .count();
        if lines > live {
          self.write_full_journal(state);
        }
      }
      Err(reason) => {
        warn!(journal = %self.journal_path.display(), %reason, "index journal corrupt, starting empty");
        state.entries.clear();
        // Truncating drops rows for payloads that still exist on disk; they
        // get recomputed and re-recorded on their next miss.
        let _ = fs::remove_file(&self.journal_path);
      }
    }
  }

  /// Replay the journal into `state`, returning the number of records read.
  fn replay(&self, state: &mut IndexState) -> Result<usize, String> {
    let file = match fs::File::open(&self.journal_path) {
      Ok(file) => file,
      // No journal yet is a normal first run.
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
      Err(e) => return Err(e.to_string()),
    };
    let mut lines = 0;
    for line in BufReader::new(file).lines() {
      let line = line.map_err(|e| e.to_string())?;
      if line.trim().is_empty() {
        continue;
      }
      lines += 1;
      let record: JournalRecord = serde_json::from_str(&line).map_err(|e| e.to_string())?;
      match record {
        JournalRecord::Insert {
          key,
          locator,
          fingerprint,
          at,
        } => {
          state.entries.insert(
            key,
            IndexEntry {
              locator,
              fingerprint,
              recorded_at: at,
              last_access: at,
            },
          );
        }
        JournalRecord::Touch { key, at } => {
          if let Some(entry) = state.entries.get_mut(&key) {
            entry.last_access = at;
          }
        }
        JournalRecord::Remove { key } => {
          state.entries.remove(&key);
        }
      }
    }
    Ok(lines)
  }

  /// Rewrite the journal to the live entry set, through a temp file and a
  /// rename so a crash mid-compaction leaves one intact journal behind.
  fn write_full_journal(&self, state: &IndexState) {
    let mut out = String::new();
    for (key, entry) in &state.entries {
      let insert = JournalRecord::Insert {
        key: key.clone(),
        locator: entry.locator.clone(),
        fingerprint: entry.fingerprint.clone(),
        at: entry.recorded_at,
      };
      let Ok(line) = serde_json::to_string(&insert) else {
        return;
      };
      out.push_str(&line);
      out.push('\n');
      if entry.last_access != entry.recorded_at {
        let touch = JournalRecord::Touch {
          key: key.clone(),
          at: entry.last_access,
        };
        let Ok(line) = serde_json::to_string(&touch) else {
          return;
        };
        out.push_str(&line);
        out.push('\n');
      }
    }
    let tmp = self.journal_path.with_extension("jsonl.tmp");
    let result = fs::write(&tmp, out).and_then(|_| fs::rename(&tmp, &self.journal_path));
    if let Err(e) = result {
      warn!(journal = %self.journal_path.display(), reason = %e, "failed to compact index journal");
    }
  }

  fn append(&self, record: &JournalRecord) {
    let line = match serde_json::to_string(record) {
      Ok(line) => line,
      Err(e) => {
        warn!(reason = %e, "failed to serialize index record");
        return;
      }
    };
    let result = OpenOptions::new()
      .create(true)
      .append(true)
      .open(&self.journal_path)
      .and_then(|mut file| writeln!(file, "{line}"));
    if let Err(e) = result {
      warn!(journal = %self.journal_path.display(), reason = %e, "failed to append index record");
    }
  }
}

impl IndexStore for JournalIndex {
  fn find(&self, key: &CacheKey) -> Option<IndexEntry> {
    let mut state = self.state.lock().unwrap();
    self.ensure_loaded(&mut state);
    let at = Self::now();
    let entry = state.entries.get_mut(key.as_str())?;
    entry.last_access = at;
    let found = entry.clone();
    drop(state);
    self.append(&JournalRecord::Touch {
      key: key.as_str().to_string(),
      at,
    });
    Some(found)
  }

  fn record(&self, key: &CacheKey, locator: &str, fingerprint: &str) {
    let mut state = self.state.lock().unwrap();
    self.ensure_loaded(&mut state);
    let at = Self::now();
    if let Some(entry) = state.entries.get_mut(key.as_str()) {
      entry.last_access = at;
      drop(state);
      self.append(&JournalRecord::Touch {
        key: key.as_str().to_string(),
        at,
      });
      return;
    }
    state.entries.insert(
      key.as_str().to_string(),
      IndexEntry {
        locator: locator.to_string(),
        fingerprint: fingerprint.to_string(),
        recorded_at: at,
        last_access: at,
      },
    );
    drop(state);
    self.append(&JournalRecord::Insert {
      key: key.as_str().to_string(),
      locator: locator.to_string(),
      fingerprint: fingerprint.to_string(),
      at,
    });
  }

  fn remove(&self, key: &CacheKey) {
    let mut state = self.state.lock().unwrap();
    self.ensure_loaded(&mut state);
    if state.entries.remove(key.as_str()).is_none() {
      return;
    }
    drop(state);
    self.append(&JournalRecord::Remove {
      key: key.as_str().to_string(),
    });
  }

  fn len(&self) -> usize {
    let mut state = self.state.lock().unwrap();
    self.ensure_loaded(&mut state);
    state.entries.len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::attribute::ImageAttributes;
  use crate::locator::SourceLocator;

  fn key(raw: &str) -> CacheKey {
    CacheKey::derive(&SourceLocator::parse(raw).unwrap(), &ImageAttributes::new())
  }

  #[test]
  fn record_then_find_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let index = JournalIndex::open(dir.path());
    let k = key("https://example.com/a.png");
    assert!(index.find(&k).is_none());

    index.record(&k, "https://example.com/a.png", "w0h0");
    let entry = index.find(&k).unwrap();
    assert_eq!(entry.locator, "https://example.com/a.png");
    assert_eq!(entry.fingerprint, "w0h0");
  }

  #[test]
  fn record_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let index = JournalIndex::open(dir.path());
    let k = key("https://example.com/a.png");
    index.record(&k, "loc", "fp");
    index.record(&k, "loc", "fp");
    assert_eq!(index.len(), 1);
  }

  #[test]
  fn journal_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let k = key("https://example.com/a.png");
    {
      let index = JournalIndex::open(dir.path());
      index.record(&k, "loc", "fp");
    }
    let index = JournalIndex::open(dir.path());
    assert!(index.find(&k).is_some());
  }

  #[test]
  fn remove_is_durable() {
    let dir = tempfile::tempdir().unwrap();
    let k = key("https://example.com/a.png");
    {
      let index = JournalIndex::open(dir.path());
      index.record(&k, "loc", "fp");
      index.remove(&k);
    }
    let index = JournalIndex::open(dir.path());
    assert!(index.find(&k).is_none());
    assert_eq!(index.len(), 0);
  }

  #[test]
  fn reopen_compacts_accumulated_touches() {
    let dir = tempfile::tempdir().unwrap();
    let journal = dir.path().join("index.jsonl");
    let k = key("https://example.com/a.png");
    {
      let index = JournalIndex::open(dir.path());
      index.record(&k, "loc", "fp");
      for _ in 0..20 {
        index.find(&k);
      }
    }
    let before = fs::read_to_string(&journal).unwrap().lines().count();
    assert_eq!(before, 21, "one insert plus one touch per read");

    let index = JournalIndex::open(dir.path());
    assert!(index.find(&k).is_some());
    let after = fs::read_to_string(&journal).unwrap().lines().count();
    assert!(after <= 3, "journal should shrink to live rows, found {after} lines");
  }

  #[test]
  fn corrupt_journal_starts_empty() {
    let dir = tempfile::tempdir().unwrap();
    let k = key("https://example.com/a.png");
    {
      let index = JournalIndex::open(dir.path());
      index.record(&k, "loc", "fp");
    }
    fs::write(dir.path().join("index.jsonl"), b"{not json at all\n").unwrap();

    let index = JournalIndex::open(dir.path());
    assert!(index.find(&k).is_none());
    // The store keeps working after recovery.
    index.record(&k, "loc", "fp");
    assert!(index.find(&k).is_some());
  }
}
