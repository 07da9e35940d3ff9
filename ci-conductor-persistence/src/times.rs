// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How many successful durations are kept per job.
const MAX_DURATIONS: usize = 10;

/// Errors which may occur when working with the time database.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TimeDatabaseError {
    /// Failed to create the database directory.
    #[error("failed to create time database directory '{}': {}", path.display(), source)]
    Create {
        /// The path to the directory.
        path: PathBuf,
        /// The source of the failure.
        source: io::Error,
    },
    /// Failed to read a job record.
    #[error("failed to read time record '{}': {}", path.display(), source)]
    Read {
        /// The path to the record.
        path: PathBuf,
        /// The source of the failure.
        source: io::Error,
    },
    /// Failed to write a job record.
    #[error("failed to write time record '{}': {}", path.display(), source)]
    Write {
        /// The path to the record.
        path: PathBuf,
        /// The source of the failure.
        source: io::Error,
    },
    /// Failed to parse a job record.
    #[error("failed to parse time record '{}': {}", path.display(), source)]
    Parse {
        /// The path to the record.
        path: PathBuf,
        /// The source of the failure.
        source: serde_json::Error,
    },
    /// Failed to serialize a job record.
    #[error("failed to serialize time record: {}", source)]
    Serialize {
        /// The source of the failure.
        source: serde_json::Error,
    },
}

impl TimeDatabaseError {
    fn create(path: PathBuf, source: io::Error) -> Self {
        Self::Create {
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

    fn write(path: PathBuf, source: io::Error) -> Self {
        Self::Write {
            path,
            source,
        }
    }

    fn parse(path: PathBuf, source: serde_json::Error) -> Self {
        Self::Parse {
            path,
            source,
        }
    }

    fn serialize(source: serde_json::Error) -> Self {
        Self::Serialize {
            source,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TimeRecord {
    durations: Vec<f64>,
}

impl TimeRecord {
    fn estimate(&self) -> f64 {
        if self.durations.is_empty() {
            return 0.0;
        }
        self.durations.iter().sum::<f64>() / self.durations.len() as f64
    }
}

/// Per-job duration statistics used to estimate build times.
///
/// One JSON record per job name is kept under the database directory. Only
/// successful builds contribute durations; the estimate is the mean of the
/// most recent ones.
#[derive(Debug)]
pub struct TimeDatabase {
    root: PathBuf,
}

impl TimeDatabase {
    /// Open the database rooted at the given directory, creating it if
    /// needed.
    pub fn new<P>(root: P) -> Result<Self, TimeDatabaseError>
    where
        P: Into<PathBuf>,
    {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|err| TimeDatabaseError::create(root.clone(), err))?;
        Ok(Self {
            root,
        })
    }

    fn record_path(&self, job_name: &str) -> PathBuf {
        // Job names may contain separators; flatten them for the filename.
        let flat = job_name.replace(['/', '\\'], "_");
        self.root.join(format!("{}.json", flat))
    }

    fn load(&self, path: &Path) -> Result<TimeRecord, TimeDatabaseError> {
        if !path.exists() {
            return Ok(TimeRecord::default());
        }
        let contents = fs::read_to_string(path)
            .map_err(|err| TimeDatabaseError::read(path.into(), err))?;
        serde_json::from_str(&contents).map_err(|err| TimeDatabaseError::parse(path.into(), err))
    }

    /// The estimated duration of a job in seconds.
    ///
    /// Jobs with no recorded history estimate zero.
    pub fn estimated_time(&self, job_name: &str) -> Result<f64, TimeDatabaseError> {
        let path = self.record_path(job_name);
        Ok(self.load(&path)?.estimate())
    }

    /// Record the duration of a finished build.
    ///
    /// Only successful results contribute to the estimate; other results
    /// are accepted and ignored.
    pub fn update(
        &self,
        job_name: &str,
        duration: f64,
        result: &str,
    ) -> Result<(), TimeDatabaseError> {
        if result != "SUCCESS" {
            return Ok(());
        }
        let path = self.record_path(job_name);
        let mut record = self.load(&path)?;
        record.durations.push(duration);
        if record.durations.len() > MAX_DURATIONS {
            let excess = record.durations.len() - MAX_DURATIONS;
            record.durations.drain(..excess);
        }
        let contents = serde_json::to_string(&record).map_err(TimeDatabaseError::serialize)?;
        fs::write(&path, contents).map_err(|err| TimeDatabaseError::write(path.clone(), err))
    }
}
