//! Durable resume position of the change producer.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::epoch_ms;
use crate::event::ResumePosition;

/// Failure reading or writing a checkpoint.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// Filesystem failure.
    #[error("checkpoint I/O failed for {}: {source}", .path.display())]
    Io {
        /// Checkpoint file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// The checkpoint file holds something unreadable.
    #[error("checkpoint {} is corrupt: {source}", .path.display())]
    Corrupt {
        /// Checkpoint file.
        path: PathBuf,
        /// Decoding error.
        #[source]
        source: serde_json::Error,
    },
}

/// Where the producer remembers how far it has read the change feed.
pub trait CheckpointStore: Send {
    /// Last saved position, `None` on first run.
    fn load(&self) -> Result<Option<ResumePosition>, CheckpointError>;

    /// Durably replaces the saved position.
    fn save(&self, position: &ResumePosition) -> Result<(), CheckpointError>;

    /// Forgets the saved position.
    fn clear(&self) -> Result<(), CheckpointError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointFile {
    resume_position: ResumePosition,
    updated_at_ms: u64,
}

/// JSON checkpoint file, replaced atomically through a rename.
#[derive(Debug, Clone)]
pub struct FileCheckpoint {
    path: PathBuf,
}

impl FileCheckpoint {
    /// Uses the checkpoint at `path`; the file is created on first save.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Checkpoint file location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: io::Error) -> CheckpointError {
        CheckpointError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl CheckpointStore for FileCheckpoint {
    fn load(&self) -> Result<Option<ResumePosition>, CheckpointError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(self.io_error(err)),
        };
        let parsed: CheckpointFile =
            serde_json::from_str(&raw).map_err(|source| CheckpointError::Corrupt {
                path: self.path.clone(),
                source,
            })?;
        Ok(Some(parsed.resume_position))
    }

    fn save(&self, position: &ResumePosition) -> Result<(), CheckpointError> {
        let record = CheckpointFile {
            resume_position: position.clone(),
            updated_at_ms: epoch_ms(),
        };
        let body = serde_json::to_vec(&record).map_err(|source| CheckpointError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        let tmp = self.path.with_extension("tmp");
        let mut file = File::create(&tmp).map_err(|err| self.io_error(err))?;
        file.write_all(&body).map_err(|err| self.io_error(err))?;
        file.sync_all().map_err(|err| self.io_error(err))?;
        fs::rename(&tmp, &self.path).map_err(|err| self.io_error(err))
    }

    fn clear(&self) -> Result<(), CheckpointError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(self.io_error(err)),
        }
    }
}

/// In-process checkpoint; clones share the saved position.
#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpoint {
    position: Arc<Mutex<Option<ResumePosition>>>,
}

impl MemoryCheckpoint {
    /// Empty checkpoint.
    pub fn new() -> Self {
        Self::default()
    }

    /// Currently saved position.
    pub fn current(&self) -> Option<ResumePosition> {
        self.position.lock().clone()
    }
}

impl CheckpointStore for MemoryCheckpoint {
    fn load(&self) -> Result<Option<ResumePosition>, CheckpointError> {
        Ok(self.current())
    }

    fn save(&self, position: &ResumePosition) -> Result<(), CheckpointError> {
        *self.position.lock() = Some(position.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), CheckpointError> {
        *self.position.lock() = None;
        Ok(())
    }
}
