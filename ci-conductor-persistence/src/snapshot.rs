// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::fs;
use std::io;
use std::path::PathBuf;

use ci_conductor_core::data::TriggerEvent;
use thiserror::Error;

/// Errors which may occur when working with the queue snapshot.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SnapshotError {
    /// Failed to write the snapshot.
    #[error("failed to write queue snapshot '{}': {}", path.display(), source)]
    Write {
        /// The path to the snapshot.
        path: PathBuf,
        /// The source of the failure.
        source: io::Error,
    },
    /// Failed to read the snapshot.
    #[error("failed to read queue snapshot '{}': {}", path.display(), source)]
    Read {
        /// The path to the snapshot.
        path: PathBuf,
        /// The source of the failure.
        source: io::Error,
    },
    /// Failed to delete the snapshot.
    #[error("failed to delete queue snapshot '{}': {}", path.display(), source)]
    Delete {
        /// The path to the snapshot.
        path: PathBuf,
        /// The source of the failure.
        source: io::Error,
    },
    /// Failed to serialize or parse the snapshot contents.
    #[error("failed to serialize queue snapshot '{}': {}", path.display(), source)]
    Serialize {
        /// The path to the snapshot.
        path: PathBuf,
        /// The source of the failure.
        source: serde_json::Error,
    },
}

impl SnapshotError {
    fn write(path: PathBuf, source: io::Error) -> Self {
        Self::Write {
            path,
            source,
        }
    }

    fn read(path: PathBuf, source: io::Error) -> Self {
        Self::Read {
            path,
            source,
        }
    }

    fn delete(path: PathBuf, source: io::Error) -> Self {
        Self::Delete {
            path,
            source,
        }
    }

    fn serialize(path: PathBuf, source: serde_json::Error) -> Self {
        Self::Serialize {
            path,
            source,
        }
    }
}

/// The trigger-queue snapshot written by a paused scheduler on exit.
///
/// The snapshot holds the serialised sequence of pending trigger events; it
/// is written only on a paused exit and deleted after a successful resume.
#[derive(Debug)]
pub struct QueueSnapshot {
    path: PathBuf,
}

impl QueueSnapshot {
    /// The snapshot file at the given path.
    pub fn new<P>(path: P) -> Self
    where
        P: Into<PathBuf>,
    {
        Self {
            path: path.into(),
        }
    }

    /// Whether a snapshot file exists.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Write the pending events to the snapshot file.
    ///
    /// An empty queue writes no file.
    pub fn save(&self, events: &[TriggerEvent]) -> Result<(), SnapshotError> {
        if events.is_empty() {
            return Ok(());
        }
        let contents = serde_json::to_string(events)
            .map_err(|err| SnapshotError::serialize(self.path.clone(), err))?;
        fs::write(&self.path, contents)
            .map_err(|err| SnapshotError::write(self.path.clone(), err))
    }

    /// Read the events from the snapshot file, if present.
    pub fn load(&self) -> Result<Vec<TriggerEvent>, SnapshotError> {
        if !self.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&self.path)
            .map_err(|err| SnapshotError::read(self.path.clone(), err))?;
        serde_json::from_str(&contents)
            .map_err(|err| SnapshotError::serialize(self.path.clone(), err))
    }

    /// Delete the snapshot file, if present.
    pub fn delete(&self) -> Result<(), SnapshotError> {
        if !self.exists() {
            return Ok(());
        }
        fs::remove_file(&self.path).map_err(|err| SnapshotError::delete(self.path.clone(), err))
    }
}
