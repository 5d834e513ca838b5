//! Append-only fault log for postmortem diagnosis.
//!
//! One line per event. Field order is fixed (`cpu= ts= file= line= msg=`)
//! because downstream tooling greps these files positionally. The format is
//! otherwise not bit-exact-critical.
//!
//! Appends happen on the interlock trip path and at lifecycle transitions,
//! never from inside a healthy cyclic loop.

use servo_common::error::{ServoError, ServoResult};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;
use tracing::warn;

/// Append-only structured log sink backed by a file.
#[derive(Debug)]
pub struct FaultLog {
    file: Mutex<File>,
    path: PathBuf,
    origin: Instant,
}

impl FaultLog {
    /// Open (or create) the log file in append mode.
    ///
    /// # Errors
    ///
    /// Returns `ServoError::Io` if the file cannot be opened.
    pub fn open(path: &Path) -> ServoResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| ServoError::Io(format!("failed to open fault log {path:?}: {e}")))?;

        Ok(Self {
            file: Mutex::new(file),
            path: path.to_path_buf(),
            origin: Instant::now(),
        })
    }

    /// Append one event line and flush.
    ///
    /// Best-effort: write failures are reported through `tracing` rather
    /// than propagated, since the callers are failure paths themselves.
    pub fn append(&self, cpu: i32, file: &str, line: u32, msg: &str) {
        let ts = self.origin.elapsed().as_secs_f64();
        let entry = format!("cpu={cpu} ts={ts:.9} file={file} line={line} msg={msg}\n");

        match self.file.lock() {
            Ok(mut f) => {
                if let Err(e) = f.write_all(entry.as_bytes()).and_then(|()| f.flush()) {
                    warn!(path = ?self.path, error = %e, "fault log write failed");
                }
            }
            Err(_) => warn!(path = ?self.path, "fault log mutex poisoned"),
        }
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}
