// sink.rs - Durable destinations for trace events.
//
// The recorder writes each event to its sink before committing it. A sink
// that returns an error leaves the event uncommitted, so a sink must not
// advance any internal state (such as the hash chain) on failure.
//
// JsonlSink stores one JSON object per line. Every line carries the
// SHA-256 of the previous raw line in `previous_hash`, so inserting,
// deleting or editing a line breaks the chain and `verify_chain` reports
// where. Each line goes out in a single write; if that write fails the file
// is truncated back to its last complete line.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::TraceError;
use crate::event::TraceEvent;
use crate::hasher;

/// Somewhere trace events are persisted or forwarded.
pub trait TraceSink: Send {
    fn write(&mut self, event: &TraceEvent) -> Result<(), TraceError>;
}

/// Collects written events in memory. Cloning yields another handle to the
/// same buffer, so a test can keep one handle and give the other to a
/// recorder.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<TraceEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TraceEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TraceSink for MemorySink {
    fn write(&mut self, event: &TraceEvent) -> Result<(), TraceError> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
        Ok(())
    }
}

/// Storage under a [`JsonlSink`].
trait LogFile: Write + Send {
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

impl LogFile for File {
    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

/// Append-only JSONL trace file with a SHA-256 hash chain.
pub struct JsonlSink {
    file: Box<dyn LogFile>,
    path: PathBuf,
    /// Hash of the last line written, linked into the next line.
    last_hash: Option<String>,
    /// File length up to the end of the last complete line.
    len: u64,
}

impl JsonlSink {
    /// Open (or create) a trace file, recovering the chain tail if the file
    /// already has content.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TraceError> {
        let path = path.as_ref().to_path_buf();
        let last_hash = if path.exists() {
            Self::read_last_hash(&path)?
        } else {
            None
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| TraceError::OpenFailed {
                path: path.clone(),
                source,
            })?;
        let len = file
            .metadata()
            .map_err(|source| TraceError::OpenFailed {
                path: path.clone(),
                source,
            })?
            .len();

        tracing::debug!(path = %path.display(), resumed = last_hash.is_some(), "opened trace log");
        Ok(Self {
            file: Box::new(file),
            path,
            last_hash,
            len,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every event from a trace file, oldest first.
    pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<TraceEvent>, TraceError> {
        let mut events = Vec::new();
        for line in Self::lines(path.as_ref())? {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            events.push(serde_json::from_str(&line)?);
        }
        Ok(events)
    }

    /// Check every `previous_hash` link in a trace file. Returns the number
    /// of events verified.
    pub fn verify_chain(path: impl AsRef<Path>) -> Result<usize, TraceError> {
        let mut previous_hash: Option<String> = None;
        let mut verified = 0;

        for (index, line) in Self::lines(path.as_ref())?.enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let event: TraceEvent = serde_json::from_str(&line)?;
            if event.previous_hash != previous_hash {
                return Err(TraceError::IntegrityViolation {
                    line: index + 1,
                    expected: previous_hash.unwrap_or_else(|| "None".to_string()),
                    actual: event.previous_hash.unwrap_or_else(|| "None".to_string()),
                });
            }
            // Hash the raw line: re-serializing could reorder fields.
            previous_hash = Some(hasher::hash_str(&line));
            verified += 1;
        }

        Ok(verified)
    }

    fn lines(path: &Path) -> Result<std::io::Lines<BufReader<File>>, TraceError> {
        let file = File::open(path).map_err(|source| TraceError::OpenFailed {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(BufReader::new(file).lines())
    }

    fn read_last_hash(path: &Path) -> Result<Option<String>, TraceError> {
        let mut last_line = None;
        for line in Self::lines(path)? {
            let line = line?;
            if !line.trim().is_empty() {
                last_line = Some(line);
            }
        }
        Ok(last_line.map(|line| hasher::hash_str(&line)))
    }
}

impl TraceSink for JsonlSink {
    fn write(&mut self, event: &TraceEvent) -> Result<(), TraceError> {
        let mut linked = event.clone();
        linked.previous_hash = self.last_hash.clone();
        let json = serde_json::to_string(&linked)?;
        let hash = hasher::hash_str(&json);
        let line = format!("{}\n", json);

        if let Err(e) = self
            .file
            .write_all(line.as_bytes())
            .and_then(|()| self.file.flush())
        {
            if let Err(rollback) = self.file.truncate(self.len) {
                tracing::error!(
                    path = %self.path.display(),
                    error = %rollback,
                    "failed to drop partial trace line"
                );
            }
            return Err(e.into());
        }

        self.len += line.len() as u64;
        self.last_hash = Some(hash);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ExecutionStatus, TraceEventKind};
    use tempfile::tempdir;
    use uuid::Uuid;

    fn attempted(action_id: Uuid, sequence: u64) -> TraceEvent {
        TraceEvent::new(
            action_id,
            sequence,
            TraceEventKind::ExecutionAttempted {
                attempt: sequence as u32,
            },
        )
    }

    #[test]
    fn memory_sink_handles_share_one_buffer() {
        let sink = MemorySink::new();
        let mut writer = sink.clone();
        writer.write(&attempted(Uuid::new_v4(), 0)).unwrap();
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn jsonl_chain_links_every_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trace.jsonl");
        let action = Uuid::new_v4();
        {
            let mut sink = JsonlSink::open(&path).unwrap();
            for seq in 0..4 {
                sink.write(&attempted(action, seq)).unwrap();
            }
        }

        let events = JsonlSink::read_all(&path).unwrap();
        assert_eq!(events.len(), 4);
        assert!(events[0].previous_hash.is_none());
        assert!(events[1..].iter().all(|e| e.previous_hash.is_some()));
        assert_eq!(JsonlSink::verify_chain(&path).unwrap(), 4);
    }

    #[test]
    fn reopened_log_continues_chain() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trace.jsonl");
        let action = Uuid::new_v4();
        JsonlSink::open(&path)
            .unwrap()
            .write(&attempted(action, 0))
            .unwrap();
        JsonlSink::open(&path)
            .unwrap()
            .write(&attempted(action, 1))
            .unwrap();
        assert_eq!(JsonlSink::verify_chain(&path).unwrap(), 2);
    }

    #[test]
    fn edited_line_breaks_chain() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trace.jsonl");
        let action = Uuid::new_v4();
        {
            let mut sink = JsonlSink::open(&path).unwrap();
            sink.write(&attempted(action, 0)).unwrap();
            sink.write(&TraceEvent::new(
                action,
                1,
                TraceEventKind::ExecutionCompleted {
                    attempt: 1,
                    status: ExecutionStatus::ToolError,
                    duration_ms: 3,
                    error_detail: None,
                },
            ))
            .unwrap();
            sink.write(&attempted(action, 2)).unwrap();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        let tampered = contents.replace("tool_error", "success");
        std::fs::write(&path, tampered).unwrap();

        match JsonlSink::verify_chain(&path) {
            Err(TraceError::IntegrityViolation { line, .. }) => assert_eq!(line, 3),
            other => panic!("expected IntegrityViolation, got {:?}", other),
        }
    }

    /// Accepts a fixed number of bytes, then fails mid-write.
    struct ShortFile {
        bytes: Arc<Mutex<Vec<u8>>>,
        room: usize,
    }

    impl Write for ShortFile {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.room == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "no space left on device"));
            }
            let n = buf.len().min(self.room);
            self.room -= n;
            self.bytes.lock().unwrap().extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl LogFile for ShortFile {
        fn truncate(&mut self, len: u64) -> io::Result<()> {
            self.bytes.lock().unwrap().truncate(len as usize);
            Ok(())
        }
    }

    #[test]
    fn failed_write_leaves_no_partial_line() {
        let bytes = Arc::new(Mutex::new(Vec::new()));
        let mut sink = JsonlSink {
            file: Box::new(ShortFile {
                bytes: Arc::clone(&bytes),
                room: usize::MAX,
            }),
            path: PathBuf::from("short.jsonl"),
            last_hash: None,
            len: 0,
        };
        let action = Uuid::new_v4();
        sink.write(&attempted(action, 0)).unwrap();
        let first = bytes.lock().unwrap().clone();

        // Room for only part of the next line.
        sink.file = Box::new(ShortFile {
            bytes: Arc::clone(&bytes),
            room: 10,
        });
        assert!(matches!(
            sink.write(&attempted(action, 1)),
            Err(TraceError::WriteFailed(_))
        ));
        assert_eq!(*bytes.lock().unwrap(), first);

        sink.file = Box::new(ShortFile {
            bytes: Arc::clone(&bytes),
            room: usize::MAX,
        });
        sink.write(&attempted(action, 1)).unwrap();

        let contents = String::from_utf8(bytes.lock().unwrap().clone()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: TraceEvent = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.previous_hash, Some(hasher::hash_str(lines[0])));
    }

    #[test]
    fn read_all_missing_file_is_open_failed() {
        let dir = tempdir().unwrap();
        let err = JsonlSink::read_all(dir.path().join("absent.jsonl")).unwrap_err();
        assert!(matches!(err, TraceError::OpenFailed { .. }));
    }
}
