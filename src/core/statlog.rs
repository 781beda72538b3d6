// src/core/statlog.rs

//! Append-only CSV observability files: mirror queue depth, periodic sync
//! session summaries, and blob copy delays. Every record is appended as one
//! whole-line `write` so concurrent writers never interleave fields.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use tracing::warn;

/// One append-only CSV file. Disabled (all appends are no-ops) when the
/// configured path is empty or cannot be opened.
#[derive(Debug)]
pub struct StatLogger {
    file: Option<Mutex<File>>,
}

impl StatLogger {
    pub fn open(path: &str) -> Self {
        if path.is_empty() {
            return Self { file: None };
        }
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Self {
                file: Some(Mutex::new(file)),
            },
            Err(e) => {
                warn!("Cannot open stat log file {path}: {e}");
                Self { file: None }
            }
        }
    }

    pub fn disabled() -> Self {
        Self { file: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.file.is_some()
    }

    /// Appends one CSV line. The trailing newline is added here; the line
    /// goes out in a single write call.
    pub fn append(&self, line: &str) {
        if let Some(file) = &self.file {
            let mut owned = String::with_capacity(line.len() + 1);
            owned.push_str(line);
            owned.push('\n');
            let mut file = file.lock();
            if let Err(e) = file.write_all(owned.as_bytes()) {
                warn!("Stat log append failed: {e}");
            }
        }
    }
}
