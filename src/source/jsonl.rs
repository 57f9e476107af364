use std::fs::File;
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::{debug, warn};

use super::{ChangeFeed, ChangeStream, FeedError, FeedStart, SourceChange};
use crate::event::{Change, Operation, Payload, ResumePosition, SourceTimestamp};

const TAIL_POLL: Duration = Duration::from_millis(50);

/// Tails an append-only JSONL change log.
///
/// Each line is `{"event_id"?, "operation", "document_id", "document"?,
/// "cluster_time": {"seconds", "increment"}}`. The resume position is the byte
/// offset just past a line, so a log that shrinks below a checkpoint (rotated
/// or truncated) can no longer be resumed.
#[derive(Debug, Clone)]
pub struct JsonlChangeFeed {
    path: PathBuf,
}

impl JsonlChangeFeed {
    /// Feed over the log at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Log location.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ChangeFeed for JsonlChangeFeed {
    fn open(&mut self, start: &FeedStart) -> Result<Box<dyn ChangeStream>, FeedError> {
        let file = File::open(&self.path).map_err(|err| {
            FeedError::Transient(format!("cannot open {}: {err}", self.path.display()))
        })?;
        let len = file.metadata().map_err(transient)?.len();
        let offset = match start {
            FeedStart::Beginning => 0,
            FeedStart::Now => len,
            FeedStart::Resume(position) => {
                let offset: u64 = position.0.parse().map_err(|_| FeedError::ResumeInvalid {
                    position: position.clone(),
                    reason: "not a byte offset".into(),
                })?;
                if offset > len {
                    return Err(FeedError::ResumeInvalid {
                        position: position.clone(),
                        reason: format!("log is only {len} bytes long"),
                    });
                }
                offset
            }
        };
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(offset)).map_err(transient)?;
        debug!(path = %self.path.display(), offset, "opened change log");
        Ok(Box::new(JsonlChangeStream {
            path: self.path.clone(),
            reader,
            offset,
            partial: String::new(),
        }))
    }
}

struct JsonlChangeStream {
    path: PathBuf,
    reader: BufReader<File>,
    offset: u64,
    partial: String,
}

impl JsonlChangeStream {
    fn check_not_truncated(&self) -> Result<(), FeedError> {
        let len = std::fs::metadata(&self.path).map_err(transient)?.len();
        if len < self.offset {
            return Err(FeedError::ResumeInvalid {
                position: ResumePosition(self.offset.to_string()),
                reason: format!("log shrank to {len} bytes while tailing"),
            });
        }
        Ok(())
    }
}

impl ChangeStream for JsonlChangeStream {
    fn next(&mut self, timeout: Duration) -> Result<Option<SourceChange>, FeedError> {
        let deadline = Instant::now() + timeout;
        loop {
            let read = self.reader.read_line(&mut self.partial).map_err(transient)?;
            if read > 0 && self.partial.ends_with('\n') {
                let line = std::mem::take(&mut self.partial);
                self.offset += line.len() as u64;
                let position = ResumePosition(self.offset.to_string());
                if let Some(change) = parse_line(line.trim(), position)? {
                    return Ok(Some(change));
                }
                continue;
            }
            if read > 0 {
                // Half-written line: wait for the writer to finish it.
                continue;
            }
            self.check_not_truncated()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            thread::sleep(TAIL_POLL.min(deadline - now));
        }
    }
}

#[derive(Debug, Deserialize)]
struct LogRecord {
    #[serde(default)]
    event_id: Option<String>,
    operation: Operation,
    document_id: String,
    #[serde(default)]
    document: Option<Payload>,
    cluster_time: SourceTimestamp,
}

/// Blank lines yield `None`; lines that are not a usable change are
/// reported as [`FeedError::Malformed`].
fn parse_line(line: &str, position: ResumePosition) -> Result<Option<SourceChange>, FeedError> {
    if line.is_empty() {
        return Ok(None);
    }
    let malformed = |reason: String| {
        warn!(%position, %reason, "unreadable change log line");
        FeedError::Malformed {
            position: position.clone(),
            raw: line.to_string(),
            reason,
        }
    };
    let record: LogRecord = serde_json::from_str(line).map_err(|err| malformed(err.to_string()))?;
    let change = match (record.operation, record.document) {
        (Operation::Delete, _) => Change::Delete,
        (Operation::Insert, Some(payload)) => Change::Insert { payload },
        (Operation::Update, Some(payload)) => Change::Update { payload },
        (operation, None) => {
            return Err(malformed(format!(
                "{operation} of document {} carries no document snapshot",
                record.document_id
            )));
        }
    };
    Ok(Some(SourceChange {
        event_id: record.event_id,
        change,
        document_id: record.document_id,
        cluster_time: record.cluster_time,
        resume_position: position,
    }))
}

fn transient(err: io::Error) -> FeedError {
    FeedError::Transient(err.to_string())
}
