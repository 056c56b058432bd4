//! Pipeline orchestration.
//!
//! Wires the stages together: descriptor read loop → fetcher queue →
//! download workers → extracted-blob queue → scan workers → sinks. Channels
//! close in dependency order (input first, then the blob channel once every
//! fetcher has returned), so no worker ever observes a send on a closed
//! channel, and the sinks are closed last.

use crate::cache::FragmentCache;
use crate::constants::{
    CHANNEL_DEPTH_PER_WORKER, FILE_RECORD_BASE, SECRET_RECORD_BASE, SINK_ROTATE_BYTES,
};
use crate::detect::Detector;
use crate::error::Result;
use crate::fetcher::{BlobFetcher, ExtractedBlob};
use crate::records::LayerDescriptor;
use crate::reservation::StorageReservation;
use crate::scanner::LayerScanner;
use crate::sink::RotatingJsonlWriter;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Operator inputs for one pipeline run.
pub struct PipelineConfig {
    /// Newline-delimited descriptor file.
    pub input_path: PathBuf,
    /// Directory receiving the rotating output files.
    pub result_dir: PathBuf,
    /// Cap on the concurrent in-flight uncompressed footprint, in bytes.
    pub max_storage: u64,
    /// Scan worker count. Defaults to the host CPU count upstream.
    pub scan_workers: usize,
    /// Download worker count.
    pub fetch_workers: usize,
}

/// The two-stage extraction pipeline.
pub struct Pipeline {
    config: PipelineConfig,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, cancel: CancellationToken) -> Self {
        Self { config, cancel }
    }

    /// Runs the pipeline to completion. Blocks until the input drains or the
    /// root token fires; either way every worker has exited and both sinks
    /// are flushed, compressed, and closed on return.
    pub async fn run(self) -> Result<()> {
        let fetch_workers = self.config.fetch_workers.max(1);
        let scan_workers = self.config.scan_workers.max(1);

        // Startup failures (input file, sinks, rules, clients) surface
        // before any worker is spawned.
        let input_file = tokio::fs::File::open(&self.config.input_path).await?;

        let file_sink = Arc::new(RotatingJsonlWriter::new(
            &self.config.result_dir,
            FILE_RECORD_BASE,
            SINK_ROTATE_BYTES,
            0,
        )?);
        let secret_sink = Arc::new(RotatingJsonlWriter::new(
            &self.config.result_dir,
            SECRET_RECORD_BASE,
            SINK_ROTATE_BYTES,
            0,
        )?);
        let detector = Arc::new(Detector::new()?);
        let reservation = StorageReservation::new(self.config.max_storage, self.cancel.clone());

        let mut fetchers = Vec::with_capacity(fetch_workers);
        for _ in 0..fetch_workers {
            fetchers.push(BlobFetcher::new(reservation.clone(), &self.cancel)?);
        }
        let mut scanners = Vec::with_capacity(scan_workers);
        for _ in 0..scan_workers {
            scanners.push(LayerScanner::new(
                detector.clone(),
                FragmentCache::with_default_budget(),
                file_sink.clone(),
                secret_sink.clone(),
                reservation.clone(),
                self.cancel.clone(),
            ));
        }

        let (input_tx, input_rx) = mpsc::channel(CHANNEL_DEPTH_PER_WORKER * fetch_workers);
        let (blob_tx, blob_rx) = mpsc::channel::<ExtractedBlob>(CHANNEL_DEPTH_PER_WORKER * scan_workers);
        let input_rx = Arc::new(Mutex::new(input_rx));
        let blob_rx = Arc::new(Mutex::new(blob_rx));

        let mut fetch_handles = Vec::with_capacity(fetch_workers);
        for fetcher in fetchers {
            fetch_handles.push(tokio::spawn(fetcher.run(input_rx.clone(), blob_tx.clone())));
        }
        // The blob channel closes once every fetcher has returned.
        drop(blob_tx);

        let mut scan_handles = Vec::with_capacity(scan_workers);
        for scanner in scanners {
            let rx = blob_rx.clone();
            scan_handles.push(tokio::task::spawn_blocking(move || scanner.run(rx)));
        }

        info!(
            "pipeline started: {} fetchers, {} scanners, {} byte cap",
            fetch_workers,
            scan_workers,
            reservation.max_storage()
        );

        let mut lines = tokio::io::BufReader::new(input_file).lines();
        let mut read_error = None;
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    read_error = Some(e.into());
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let descriptor: LayerDescriptor = match serde_json::from_str(&line) {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    warn!("{}", crate::error::Error::InvalidDescriptor(e.to_string()));
                    continue;
                }
            };
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                sent = input_tx.send(descriptor) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }

        // Two-phase close: input channel, fetchers, blob channel, scanners.
        drop(input_tx);
        for handle in fetch_handles {
            if let Err(e) = handle.await {
                warn!("fetcher task failed: {}", e);
            }
        }
        for handle in scan_handles {
            if let Err(e) = handle.await {
                warn!("scanner task failed: {}", e);
            }
        }

        file_sink.close()?;
        secret_sink.close()?;

        match read_error {
            Some(e) => Err(e),
            None => {
                info!("pipeline drained");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// No fetch ever succeeds here (bogus registry), but the pipeline must
    /// still drain, close cleanly, and leave the reservation pool intact.
    #[tokio::test]
    async fn test_run_drains_with_unreachable_registry() {
        let temp = tempfile::TempDir::new().unwrap();
        let input_path = temp.path().join("layers.jsonl");
        let mut input = std::fs::File::create(&input_path).unwrap();
        writeln!(
            input,
            r#"{{"repo":"localhost.invalid/none","layer_digest":"sha256:00","size":10}}"#
        )
        .unwrap();
        writeln!(input, "not json").unwrap();
        drop(input);

        let cancel = CancellationToken::new();
        let pipeline = Pipeline::new(
            PipelineConfig {
                input_path,
                result_dir: temp.path().join("results"),
                max_storage: 1 << 30,
                scan_workers: 1,
                fetch_workers: 1,
            },
            cancel,
        );
        pipeline.run().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_input_is_startup_failure() {
        let temp = tempfile::TempDir::new().unwrap();
        let pipeline = Pipeline::new(
            PipelineConfig {
                input_path: temp.path().join("missing.jsonl"),
                result_dir: temp.path().join("results"),
                max_storage: 1 << 30,
                scan_workers: 1,
                fetch_workers: 1,
            },
            CancellationToken::new(),
        );
        assert!(pipeline.run().await.is_err());
    }
}
