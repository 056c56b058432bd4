//! Scan workers.
//!
//! Each scanner consumes extracted blobs, walks their gzip+tar fragments,
//! and maintains a per-file state machine: a path change finalises the
//! previous file (depth bookkeeping, fragment-flag flush into the cache),
//! fragments are fingerprinted and either resolved from the cache or handed
//! to the detector. At end of stream the scanner emits one [`FileRecord`]
//! and one [`SecretRecord`] batch for the layer, then releases the blob's
//! reservation.
//!
//! ## Failure containment
//!
//! Per-layer decode errors are logged and the partial record is still
//! emitted; the worker loop survives. A sink failure is the one fatal case:
//! the worker cancels the root token and degrades to draining the channel so
//! remaining reservations are still released.
//!
//! Scanners run on blocking threads; all decoding and detection is
//! synchronous.

use crate::cache::FragmentCache;
use crate::constants::FRAGMENT_SIZE;
use crate::detect::Detector;
use crate::error::Result;
use crate::fetcher::ExtractedBlob;
use crate::fragment::{walk_fragments, FragmentEvent};
use crate::records::{FileRecord, SecretInfo, SecretRecord};
use crate::reservation::StorageReservation;
use crate::sink::RotatingJsonlWriter;
use std::collections::HashMap;
use std::io::Read;
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use xxhash_rust::xxh64::xxh64;

/// Accumulated state for the layer currently being scanned.
struct LayerState {
    digest: String,
    current_path: String,
    current_size: u64,
    /// Fingerprints seen in the current file, with their verdict so far.
    fragment_flags: HashMap<u64, bool>,
    file_count: u32,
    max_depth: u32,
    total_size: u64,
    secrets: Vec<String>,
    findings: Vec<SecretRecord>,
}

impl LayerState {
    fn new(digest: &str) -> Self {
        Self {
            digest: digest.to_string(),
            current_path: String::new(),
            current_size: 0,
            fragment_flags: HashMap::new(),
            file_count: 0,
            max_depth: 0,
            total_size: 0,
            secrets: Vec::new(),
            findings: Vec::new(),
        }
    }

    fn into_records(self) -> (FileRecord, Vec<SecretRecord>) {
        (
            FileRecord {
                digest: self.digest,
                file_count: self.file_count,
                max_depth: self.max_depth,
                uncompressed_size: self.total_size,
                secrets: self.secrets,
            },
            self.findings,
        )
    }
}

/// One scan worker with its private fragment cache.
pub struct LayerScanner {
    detector: Arc<Detector>,
    cache: FragmentCache,
    file_sink: Arc<RotatingJsonlWriter>,
    secret_sink: Arc<RotatingJsonlWriter>,
    reservation: StorageReservation,
    cancel: CancellationToken,
}

impl LayerScanner {
    pub fn new(
        detector: Arc<Detector>,
        cache: FragmentCache,
        file_sink: Arc<RotatingJsonlWriter>,
        secret_sink: Arc<RotatingJsonlWriter>,
        reservation: StorageReservation,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            detector,
            cache,
            file_sink,
            secret_sink,
            reservation,
            cancel,
        }
    }

    /// Worker loop for a blocking thread. Terminates when the blob channel
    /// closes. After cancellation, remaining blobs are drained unscanned so
    /// their reservations return to the pool.
    pub fn run(mut self, input: Arc<Mutex<mpsc::Receiver<ExtractedBlob>>>) {
        loop {
            let blob = {
                let mut rx = input.blocking_lock();
                match rx.blocking_recv() {
                    Some(blob) => blob,
                    None => return,
                }
            };
            if self.cancel.is_cancelled() {
                self.discard(blob);
                continue;
            }
            info!(
                "scanning layer {} ({} bytes declared)",
                blob.descriptor.digest, blob.descriptor.size
            );
            if let Err(e) = self.scan_layer(blob) {
                error!("sink failure, shutting down: {}", e);
                self.cancel.cancel();
            }
        }
    }

    /// Releases a blob without scanning it.
    fn discard(&self, blob: ExtractedBlob) {
        blob.cancel.cancel();
        self.reservation.release(blob.reserved);
    }

    /// Scans one blob and emits its record pair. The returned error is a
    /// sink failure; everything per-layer is contained inside.
    pub fn scan_layer(&mut self, blob: ExtractedBlob) -> Result<()> {
        let ExtractedBlob {
            descriptor,
            reader,
            cancel: scope,
            reserved,
        } = blob;

        let (record, batch) = self.extract_scan(&descriptor.digest, reader, &scope);
        scope.cancel();

        let written = self
            .file_sink
            .write(&record)
            .and_then(|_| self.secret_sink.write(&batch));
        self.reservation.release(reserved);
        written
    }

    /// Walks the blob's fragments through the state machine. Always returns
    /// the records accumulated so far, even when decoding fails or
    /// cancellation aborts the walk.
    fn extract_scan(
        &mut self,
        digest: &str,
        reader: Box<dyn Read + Send>,
        scope: &CancellationToken,
    ) -> (FileRecord, Vec<SecretRecord>) {
        let mut state = LayerState::new(digest);

        let walk = walk_fragments(reader, FRAGMENT_SIZE, |event| {
            if scope.is_cancelled() || self.cancel.is_cancelled() {
                return ControlFlow::Break(());
            }
            match event {
                FragmentEvent::Data { path, bytes } => {
                    self.consume_fragment(&mut state, path, bytes);
                }
                FragmentEvent::Corrupt { path, error } => {
                    warn!("fragment error path={} err={} (continuing)", path, error);
                }
            }
            ControlFlow::Continue(())
        });
        if let Err(e) = walk {
            let e = crate::error::Error::Decode {
                digest: digest.to_string(),
                reason: e.to_string(),
            };
            warn!("{}; emitting partial record", e);
        }

        self.finalize_file(&mut state);
        state.into_records()
    }

    fn consume_fragment(&mut self, state: &mut LayerState, path: &str, bytes: &[u8]) {
        if path.is_empty() || bytes.is_empty() {
            return;
        }
        if path != state.current_path {
            self.finalize_file(state);
            state.current_path = path.to_string();
            state.current_size = 0;
        }
        state.current_size += bytes.len() as u64;

        let hash = xxh64(bytes, 0);
        state.fragment_flags.entry(hash).or_insert(false);

        if let Some(has_secret) = self.cache.get(hash) {
            if has_secret {
                state.secrets.push(format!("{:016x}", hash));
            }
            return;
        }

        let findings = self.detector.detect(path, bytes);
        if findings.is_empty() {
            self.cache.set(hash, false);
            return;
        }

        state.fragment_flags.insert(hash, true);
        self.cache.set(hash, true);
        let hash_hex = format!("{:016x}", hash);
        state.secrets.push(hash_hex.clone());

        for finding in findings {
            state.findings.push(SecretRecord {
                fragment_hash: hash_hex.clone(),
                secrets: SecretInfo {
                    location: state.current_path.clone(),
                    kind: extension_of(&finding.file),
                    size: state.current_size,
                    origin: finding.rule_id,
                    secret: finding.secret,
                    start_line: finding.start_line,
                },
            });
        }
    }

    /// Closes out the current file: depth bookkeeping, fragment-flag flush
    /// into the cache, running totals.
    fn finalize_file(&mut self, state: &mut LayerState) {
        if state.current_path.is_empty() {
            return;
        }

        let depth = directory_depth(&state.current_path);
        if depth > state.max_depth {
            state.max_depth = depth;
        }

        let flags = std::mem::take(&mut state.fragment_flags);
        for (hash, has_secret) in flags {
            self.cache.set(hash, has_secret);
        }

        state.total_size += state.current_size;
        state.file_count += 1;
        state.current_path.clear();
        state.current_size = 0;
    }
}

/// 1-based directory depth: `1` for a bare name, separator count + 1
/// otherwise.
fn directory_depth(path: &str) -> u32 {
    let separators = path.bytes().filter(|b| *b == b'/').count() as u32;
    if separators == 0 {
        1
    } else {
        separators + 1
    }
}

/// File extension with leading dot, or empty (`keys.env` → `.env`).
fn extension_of(file: &str) -> String {
    match Path::new(file).extension() {
        Some(ext) => format!(".{}", ext.to_string_lossy()),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_depth_law() {
        assert_eq!(directory_depth("file.txt"), 1);
        assert_eq!(directory_depth("a/b.txt"), 2);
        assert_eq!(directory_depth("a/b/c/d.txt"), 4);
    }

    #[test]
    fn test_extension_with_leading_dot() {
        assert_eq!(extension_of("keys.env"), ".env");
        assert_eq!(extension_of("a/b/cfg.yaml"), ".yaml");
        assert_eq!(extension_of("Makefile"), "");
    }
}
