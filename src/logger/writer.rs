//! Log writer module
//!
//! Routes formatted log lines to stdout/stderr or append-mode files.
//! INFO and below go to the info target, WARN and ERROR to the error target.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use parking_lot::{Mutex, MutexGuard};
use tracing::{Level, Metadata};
use tracing_subscriber::fmt::MakeWriter;

/// Log output target
enum LogTarget {
    /// Write to stdout
    Stdout,
    /// Write to stderr
    Stderr,
    /// Write to file
    File(Mutex<File>),
}

impl LogTarget {
    fn open(path: Option<&str>, fallback: Self) -> io::Result<Self> {
        match path {
            Some(path) => Ok(Self::File(Mutex::new(open_log_file(path)?))),
            None => Ok(fallback),
        }
    }

    fn writer(&self) -> TargetWriter<'_> {
        match self {
            Self::Stdout => TargetWriter::Stdout(io::stdout()),
            Self::Stderr => TargetWriter::Stderr(io::stderr()),
            Self::File(file) => TargetWriter::File(file.lock()),
        }
    }
}

/// Writer handed to the fmt layer for one event
pub enum TargetWriter<'a> {
    Stdout(io::Stdout),
    Stderr(io::Stderr),
    File(MutexGuard<'a, File>),
}

impl Write for TargetWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Stdout(out) => out.write(buf),
            Self::Stderr(err) => err.write(buf),
            Self::File(file) => file.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Stdout(out) => out.flush(),
            Self::Stderr(err) => err.flush(),
            Self::File(file) => file.flush(),
        }
    }
}

/// Level-routing log writer
pub struct LogWriter {
    /// Info log target
    info: LogTarget,
    /// Error log target
    error: LogTarget,
}

impl LogWriter {
    /// Create a new log writer with optional file paths
    pub fn new(info_log_file: Option<&str>, error_log_file: Option<&str>) -> io::Result<Self> {
        Ok(Self {
            info: LogTarget::open(info_log_file, LogTarget::Stdout)?,
            error: LogTarget::open(error_log_file, LogTarget::Stderr)?,
        })
    }

    /// Writer for events of the given level
    pub fn writer_for(&self, level: Level) -> TargetWriter<'_> {
        if level <= Level::WARN {
            self.error.writer()
        } else {
            self.info.writer()
        }
    }
}

impl<'a> MakeWriter<'a> for LogWriter {
    type Writer = TargetWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        self.info.writer()
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        self.writer_for(*meta.level())
    }
}

/// Open or create a log file for appending
fn open_log_file(path: &str) -> io::Result<File> {
    // Create parent directories if they don't exist
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    OpenOptions::new().create(true).append(true).open(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_route_to_separate_files() {
        let dir = std::env::temp_dir().join(format!("rudp-logs-{}", std::process::id()));
        let info_path = dir.join("nested/info.log");
        let error_path = dir.join("nested/error.log");

        let writer = LogWriter::new(info_path.to_str(), error_path.to_str()).unwrap();
        writer.writer_for(Level::INFO).write_all(b"hello info\n").unwrap();
        writer.writer_for(Level::DEBUG).write_all(b"hello debug\n").unwrap();
        writer.writer_for(Level::WARN).write_all(b"careful\n").unwrap();
        writer.writer_for(Level::ERROR).write_all(b"boom\n").unwrap();

        let info = std::fs::read_to_string(&info_path).unwrap();
        let error = std::fs::read_to_string(&error_path).unwrap();
        assert_eq!(info, "hello info\nhello debug\n");
        assert_eq!(error, "careful\nboom\n");

        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_files_are_appended() {
        let path = std::env::temp_dir().join(format!("rudp-append-{}.log", std::process::id()));
        std::fs::write(&path, "existing\n").unwrap();

        let writer = LogWriter::new(path.to_str(), None).unwrap();
        writer.make_writer().write_all(b"appended\n").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "existing\nappended\n");
        std::fs::remove_file(path).ok();
    }
}
