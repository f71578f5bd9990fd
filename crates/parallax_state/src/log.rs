//! # Replication Trace Log
//!
//! A flat-file trace of every replication decision, for diagnosing
//! desyncs after the fact. Writing happens on a dedicated thread so
//! the tick never touches the filesystem; when no log file is
//! configured the whole path collapses to a boolean check.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel::{unbounded, Sender};

/// Handle to the trace sink.
pub struct ReplicationLog {
    tx: Option<Sender<String>>,
    handle: Option<JoinHandle<()>>,
    start: Instant,
}

impl ReplicationLog {
    /// Opens the sink, spawning the writer thread when a path is
    /// given. A path that cannot be created disables the sink with a
    /// warning rather than failing the server.
    #[must_use]
    pub fn new(path: Option<&Path>) -> Self {
        let mut tx = None;
        let mut handle = None;

        if let Some(path) = path {
            match File::create(path) {
                Ok(file) => {
                    let (sender, receiver) = unbounded::<String>();
                    tx = Some(sender);
                    handle = Some(
                        std::thread::Builder::new()
                            .name("parallax-sync-log".into())
                            .spawn(move || {
                                let mut writer = BufWriter::new(file);
                                while let Ok(line) = receiver.recv() {
                                    let _ = writer.write_all(line.as_bytes());
                                    if receiver.is_empty() {
                                        let _ = writer.flush();
                                    }
                                }
                                let _ = writer.flush();
                            })
                            .expect("spawn log thread"),
                    );
                }
                Err(error) => {
                    tracing::warn!(?path, %error, "cannot open replication log");
                }
            }
        }

        Self {
            tx,
            handle,
            start: Instant::now(),
        }
    }

    /// Returns true when lines are actually being written.
    #[inline]
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Queues a line, formatting only when the sink is enabled.
    pub fn write_with(&self, line: impl FnOnce() -> String) {
        if let Some(tx) = &self.tx {
            let ms = self.start.elapsed().as_millis();
            let _ = tx.send(format!("[{ms:>10}] {}\n", line()));
        }
    }
}

impl Drop for ReplicationLog {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_by_default() {
        let log = ReplicationLog::new(None);
        assert!(!log.enabled());
        // must be a no-op, not a panic
        log.write_with(|| unreachable!("formatter must not run when disabled"));
    }

    #[test]
    fn test_lines_reach_the_file() {
        let path = std::env::temp_dir().join("parallax_log_test.log");
        {
            let log = ReplicationLog::new(Some(&path));
            assert!(log.enabled());
            log.write_with(|| "first line".to_string());
            log.write_with(|| "second line".to_string());
        } // drop joins the writer

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("first line"));
        assert!(contents.contains("second line"));
        assert_eq!(contents.lines().count(), 2);

        let _ = std::fs::remove_file(&path);
    }
}
