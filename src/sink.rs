//! Rotating append-only JSONL sinks.
//!
//! Records are serialised to one JSON line each and appended to the current
//! generation file. When the running size plus the incoming record would
//! exceed the byte budget, the sink rotates first: the current file is
//! closed, gzip-compressed to `<name>.gz`, the uncompressed artifact is
//! removed, and the next generation is opened. Generation indices strictly
//! increase and retired files are never rewritten.
//!
//! ## Concurrency
//!
//! All writes to one sink are serialised by an interior mutex; a whole
//! record is appended under a single lock acquisition, so records from
//! concurrent writers never interleave within a line. No ordering is
//! guaranteed across writers.
//!
//! ## Failure
//!
//! Any write, rotation, or compression failure is fatal to the sink;
//! partially-written trailing records are never read back.

use crate::error::{Error, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

struct Inner {
    dir: PathBuf,
    base: String,
    max_bytes: u64,
    current_bytes: u64,
    /// Index of the currently open generation.
    file_index: u64,
    file: Option<BufWriter<File>>,
}

/// Append-only sink for newline-delimited JSON records with size-based
/// rotation and gzip retirement.
pub struct RotatingJsonlWriter {
    inner: Mutex<Inner>,
}

impl RotatingJsonlWriter {
    /// Creates the sink directory if needed and opens generation
    /// `start_index`. A non-zero start index resumes numbering after an
    /// interrupted run.
    pub fn new(dir: impl Into<PathBuf>, base: &str, max_bytes: u64, start_index: u64) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| Error::Sink(format!("create {}: {}", dir.display(), e)))?;
        let file = open_generation(&dir, base, start_index)?;
        Ok(Self {
            inner: Mutex::new(Inner {
                dir,
                base: base.to_string(),
                max_bytes,
                current_bytes: 0,
                file_index: start_index,
                file: Some(file),
            }),
        })
    }

    /// Serialises `record` and appends it as one line, rotating first when
    /// the byte budget would be exceeded.
    pub fn write<T: Serialize + ?Sized>(&self, record: &T) -> Result<()> {
        let data = serde_json::to_vec(record)?;
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.file.is_none() {
            return Err(Error::Sink("write after close".to_string()));
        }
        let size = data.len() as u64 + 1;
        if inner.current_bytes + size > inner.max_bytes {
            rotate(&mut inner)?;
        }
        let writer = inner
            .file
            .as_mut()
            .ok_or_else(|| Error::Sink("no open generation".to_string()))?;
        writer
            .write_all(&data)
            .and_then(|_| writer.write_all(b"\n"))
            .map_err(|e| Error::Sink(format!("append: {}", e)))?;
        inner.current_bytes += size;
        Ok(())
    }

    /// Flushes, compresses, and retires the final generation. The sink
    /// rejects writes afterwards. Idempotent.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        retire_current(&mut inner)
    }
}

fn generation_path(dir: &Path, base: &str, index: u64) -> PathBuf {
    dir.join(format!("{}_{}.jsonl", base, index))
}

fn open_generation(dir: &Path, base: &str, index: u64) -> Result<BufWriter<File>> {
    let path = generation_path(dir, base, index);
    let file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(&path)
        .map_err(|e| Error::Sink(format!("open {}: {}", path.display(), e)))?;
    Ok(BufWriter::new(file))
}

/// Closes and compresses the current generation. Leaves the sink without an
/// open file; callers either reopen (rotation) or stop (close).
fn retire_current(inner: &mut Inner) -> Result<()> {
    let Some(mut writer) = inner.file.take() else {
        return Ok(());
    };
    writer
        .flush()
        .map_err(|e| Error::Sink(format!("flush: {}", e)))?;
    drop(writer);
    let path = generation_path(&inner.dir, &inner.base, inner.file_index);
    compress_and_remove(&path)?;
    debug!("retired {} generation {}", inner.base, inner.file_index);
    Ok(())
}

fn rotate(inner: &mut Inner) -> Result<()> {
    retire_current(inner)?;
    inner.file_index += 1;
    inner.file = Some(open_generation(&inner.dir, &inner.base, inner.file_index)?);
    inner.current_bytes = 0;
    Ok(())
}

/// Compresses `path` to `<path>.gz`, then removes the uncompressed artifact.
fn compress_and_remove(path: &Path) -> Result<()> {
    let mut input = File::open(path).map_err(|e| Error::Sink(format!("open {}: {}", path.display(), e)))?;
    let gz_path = PathBuf::from(format!("{}.gz", path.display()));
    let output = File::create(&gz_path)
        .map_err(|e| Error::Sink(format!("create {}: {}", gz_path.display(), e)))?;
    let mut encoder = GzEncoder::new(output, Compression::default());
    io::copy(&mut input, &mut encoder).map_err(|e| Error::Sink(format!("compress: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| Error::Sink(format!("finish gzip: {}", e)))?;
    fs::remove_file(path).map_err(|e| Error::Sink(format!("remove {}: {}", path.display(), e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_after_close_fails() {
        let temp = TempDir::new().unwrap();
        let sink = RotatingJsonlWriter::new(temp.path(), "out", 1024, 0).unwrap();
        sink.close().unwrap();
        assert!(sink.write("x").is_err());
    }

    #[test]
    fn test_close_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let sink = RotatingJsonlWriter::new(temp.path(), "out", 1024, 0).unwrap();
        sink.close().unwrap();
        sink.close().unwrap();
    }
}
