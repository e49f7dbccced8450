//! Container log persistence
//!
//! Everything a container prints is appended to `<logs_dir>/<container>.log`.
//! The file outlives the container so output stays readable after a crash
//! or a daemon restart.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::Result;

/// How much of the file end `tail_file` reads. Plenty for a few hundred lines.
const TAIL_WINDOW: u64 = 256 * 1024;

pub fn log_path(logs_dir: &Path, container_name: &str) -> PathBuf {
    logs_dir.join(format!("{}.log", container_name))
}

/// Appends one container's output to its log file.
pub struct ContainerLogger {
    file: File,
    container_name: String,
    bytes_written: usize,
}

impl ContainerLogger {
    /// Open (or create) the log in append mode, creating `logs_dir` if needed.
    pub fn open(logs_dir: &Path, container_name: &str) -> Result<Self> {
        fs::create_dir_all(logs_dir)?;
        let path = log_path(logs_dir, container_name);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        tracing::debug!("container logger opened for {} at {:?}", container_name, path);

        Ok(Self {
            file,
            container_name: container_name.to_string(),
            bytes_written: 0,
        })
    }

    /// Raw bytes, ANSI escapes included. Stripping happens on read.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.file.write_all(data)?;
        self.bytes_written += data.len();
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }

    pub fn bytes_written(&self) -> usize {
        self.bytes_written
    }
}

impl Drop for ContainerLogger {
    fn drop(&mut self) {
        let _ = self.file.flush();
        tracing::debug!(
            "container logger for {} closed ({} bytes written)",
            self.container_name,
            self.bytes_written
        );
    }
}

/// Fixed-capacity line ring: keeps only the newest `capacity` lines.
pub struct LineTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl LineTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub fn push(&mut self, line: String) {
        if self.capacity == 0 {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn into_vec(self) -> Vec<String> {
        self.lines.into()
    }
}

/// Last `lines` lines of `text` with ANSI escapes removed.
pub fn tail_lines(text: &str, lines: usize) -> Vec<String> {
    let mut tail = LineTail::new(lines);
    for line in text.lines() {
        tail.push(strip_ansi_escapes::strip_str(line));
    }
    tail.into_vec()
}

/// Last `lines` lines of a log file, or `None` if nothing was captured yet.
pub fn tail_file(path: &Path, lines: usize) -> Result<Option<Vec<String>>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(None);
    }
    let start = len.saturating_sub(TAIL_WINDOW);
    file.seek(SeekFrom::Start(start))?;

    let mut raw = Vec::new();
    file.read_to_end(&mut raw)?;
    let mut text = String::from_utf8_lossy(&raw).into_owned();
    if start > 0 {
        // First line is probably cut in half
        if let Some(pos) = text.find('\n') {
            text.drain(..=pos);
        }
    }
    Ok(Some(tail_lines(&text, lines)))
}
