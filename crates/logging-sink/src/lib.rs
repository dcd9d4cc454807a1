//! File-backed sink for the daemon's INFO-level log.
//!
//! `rtl_mus.py`'s `setup_logging()` attaches a `logging.FileHandler` at
//! `CONFIG.log_file_path` in addition to the stderr stream handler; this
//! crate is that file handler's Rust counterpart. It owns nothing about
//! verbosity policy (that lives in `logging`), only the mechanics of
//! appending formatted lines to a file shared across threads.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// A file handle opened in append mode, safe to write from multiple threads.
///
/// Every write is flushed immediately: the log file is a diagnostic aid for
/// an operator tailing it, not a buffered bulk-write target, so staleness
/// matters more than syscall count here.
pub struct FileSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileSink {
    /// Opens (creating if absent) the file at `path` for appending.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// The path this sink was opened against.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Write for FileSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&*self).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (&*self).flush()
    }
}

// tracing_subscriber's `MakeWriter` needs `Write` on `&FileSink`, since the
// subscriber only ever holds a shared reference to the sink.
impl Write for &FileSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut file = self.file.lock().unwrap_or_else(|poison| poison.into_inner());
        let n = file.write(buf)?;
        file.flush()?;
        #[cfg(unix)]
        {
            // Best-effort durability: an operator tailing the log across a
            // crash should see the last line that was actually written.
            // SAFETY: `fd` is a valid, open file descriptor owned by `file`
            // for the duration of this call.
            unsafe {
                libc::fsync(file.as_raw_fd());
            }
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(feature = "tracing")]
impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FileSink {
    type Writer = &'a FileSink;

    fn make_writer(&'a self) -> Self::Writer {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn appends_across_multiple_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.log");

        {
            let mut sink = FileSink::open(&path).unwrap();
            writeln!(sink, "first").unwrap();
        }
        {
            let mut sink = FileSink::open(&path).unwrap();
            writeln!(sink, "second").unwrap();
        }

        let mut contents = String::new();
        File::open(&path).unwrap().read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "first\nsecond\n");
    }

    #[test]
    fn concurrent_writers_do_not_interleave_within_a_line() {
        use std::sync::Arc;
        use std::thread;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.log");
        let sink = Arc::new(FileSink::open(&path).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let sink = Arc::clone(&sink);
                thread::spawn(move || {
                    let mut w: &FileSink = &sink;
                    writeln!(w, "line-{i:02}").unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let mut contents = String::new();
        File::open(&path).unwrap().read_to_string(&mut contents).unwrap();
        assert_eq!(contents.lines().count(), 8);
    }
}
