//! The shared append-only message log.
//!
//! One `LogSink` exists per server. Every append takes the same lock for
//! "write line, flush, refresh size", so lines from different connections
//! never interleave and the cached size always matches a completed append.
//! The size can be read without the lock for threshold checks.

use chrono::{Local, SecondsFormat};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// Append target plus its cumulative size.
pub struct LogSink {
    path: PathBuf,
    /// Size of the file after the last successful append
    size: AtomicU64,
    /// `None` once closed
    file: Mutex<Option<File>>,
}

impl LogSink {
    /// Open (creating if absent) `path` for appending.
    ///
    /// The starting size is the length of whatever the file already holds.
    pub fn open_for_append(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let size = file.metadata()?.len();

        info!(path = %path.display(), size, "Opened message log");

        Ok(Self {
            path,
            size: AtomicU64::new(size),
            file: Mutex::new(Some(file)),
        })
    }

    /// Append one line for `message` received from `peer`.
    ///
    /// Returns the file size after the append. On error the cached size is
    /// left untouched.
    pub fn append(&self, peer: &str, message: &str) -> io::Result<u64> {
        let line = format_line(peer, message);

        let mut guard = self.lock();
        let file = guard.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "message log is closed")
        })?;

        file.write_all(line.as_bytes())?;
        file.flush()?;
        let size = file.metadata()?.len();
        self.size.store(size, Ordering::Release);

        Ok(size)
    }

    /// Last known cumulative size, read without taking the lock.
    pub fn current_size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Flush and release the file handle. Later calls are no-ops.
    ///
    /// Returns the final size.
    pub fn close(&self) -> io::Result<u64> {
        let mut guard = self.lock();
        if let Some(mut file) = guard.take() {
            file.flush()?;
            let size = file.metadata()?.len();
            self.size.store(size, Ordering::Release);
            debug!(path = %self.path.display(), size, "Closed message log");
        }
        Ok(self.current_size())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, Option<File>> {
        // A panic while holding the lock cannot leave the handle itself invalid.
        self.file.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Format `<timestamp> | <peer> | <message>\n`, keeping the message on one line.
pub fn format_line(peer: &str, message: &str) -> String {
    let timestamp = Local::now().to_rfc3339_opts(SecondsFormat::Millis, false);
    let mut line = String::with_capacity(timestamp.len() + peer.len() + message.len() + 8);
    line.push_str(&timestamp);
    line.push_str(" | ");
    line.push_str(peer);
    line.push_str(" | ");
    for c in message.chars() {
        match c {
            '\n' => line.push_str("\\n"),
            '\r' => line.push_str("\\r"),
            c => line.push(c),
        }
    }
    line.push('\n');
    line
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    static NEXT: AtomicUsize = AtomicUsize::new(0);

    /// A fresh, not-yet-existing path in the temp directory.
    pub(crate) fn temp_log_path(tag: &str) -> PathBuf {
        let n = NEXT.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!(
            "framelog-{tag}-{}-{n}.log",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        path
    }

    fn is_closed(sink: &LogSink) -> bool {
        sink.lock().is_none()
    }

    #[test]
    fn test_format_line() {
        let line = format_line("127.0.0.1:4000", "hello");
        let parts: Vec<&str> = line.trim_end().split(" | ").collect();
        assert_eq!(parts.len(), 3);
        assert!(chrono::DateTime::parse_from_rfc3339(parts[0]).is_ok());
        assert_eq!(parts[1], "127.0.0.1:4000");
        assert_eq!(parts[2], "hello");
        assert!(line.ends_with('\n'));
    }

    #[test]
    fn test_format_line_escapes_newlines() {
        let line = format_line("peer", "one\ntwo\r\nthree");
        assert_eq!(line.matches('\n').count(), 1);
        assert!(line.contains("one\\ntwo\\r\\nthree"));
    }

    #[test]
    fn test_append_tracks_size() {
        let path = temp_log_path("size");
        let sink = LogSink::open_for_append(&path).unwrap();
        assert_eq!(sink.current_size(), 0);

        let after_first = sink.append("peer", "first").unwrap();
        assert_eq!(after_first, sink.current_size());
        let after_second = sink.append("peer", "second").unwrap();
        assert!(after_second > after_first);

        assert_eq!(sink.close().unwrap(), std::fs::metadata(&path).unwrap().len());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_reopen_starts_from_existing_length() {
        let path = temp_log_path("reopen");
        std::fs::write(&path, "existing line\n").unwrap();

        let sink = LogSink::open_for_append(&path).unwrap();
        assert_eq!(sink.current_size(), 14);
        sink.append("peer", "more").unwrap();
        sink.close().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("existing line\n"));
        assert_eq!(contents.lines().count(), 2);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_append_after_close_fails_without_changing_size() {
        let path = temp_log_path("closed");
        let sink = LogSink::open_for_append(&path).unwrap();
        sink.append("peer", "kept").unwrap();
        let size = sink.close().unwrap();
        assert!(is_closed(&sink));

        let err = sink.append("peer", "dropped").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        assert_eq!(sink.current_size(), size);

        // Second close is a no-op.
        assert_eq!(sink.close().unwrap(), size);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_open_in_missing_directory_fails() {
        let path = std::env::temp_dir()
            .join("framelog-no-such-dir")
            .join("nested")
            .join("x.log");
        assert!(LogSink::open_for_append(path).is_err());
    }

    #[test]
    fn test_concurrent_appends_are_atomic() {
        const WORKERS: usize = 8;
        const LINES: usize = 200;

        let path = temp_log_path("concurrent");
        let sink = Arc::new(LogSink::open_for_append(&path).unwrap());

        let handles: Vec<_> = (0..WORKERS)
            .map(|w| {
                let sink = Arc::clone(&sink);
                thread::spawn(move || {
                    let peer = format!("10.0.0.{w}:9000");
                    for k in 0..LINES {
                        let message = format!("worker-{w}-line-{k}-{}", "z".repeat(64));
                        sink.append(&peer, &message).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let final_size = sink.close().unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(final_size, contents.len() as u64);
        assert_eq!(contents.lines().count(), WORKERS * LINES);

        for line in contents.lines() {
            let parts: Vec<&str> = line.split(" | ").collect();
            assert_eq!(parts.len(), 3, "malformed line: {line}");
            let w = parts[1]
                .trim_start_matches("10.0.0.")
                .trim_end_matches(":9000");
            assert!(parts[2].starts_with(&format!("worker-{w}-line-")));
            assert!(parts[2].ends_with(&"z".repeat(64)));
        }
        let _ = std::fs::remove_file(&path);
    }
}
