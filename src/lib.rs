//! # layerharvest
//!
//! **Registry-scale layer harvesting with streaming secret extraction**
//!
//! This crate fetches compressed layer blobs from a public container
//! registry and streams each one through gzip+tar decomposition and a
//! content-addressed secret detector, producing per-layer file statistics
//! and deduplicated secret findings for downstream relational analysis.
//! Blobs are read once and discarded; nothing is ever fully materialised.
//!
//! # Architecture Overview
//!
//! ```text
//! descriptors ──► input queue ──► BlobFetcher × N ──► blob queue ──► LayerScanner × M
//!  (JSONL)            │               │                                  │
//!                     │          StorageReservation ◄────── release ─────┤
//!                     │           (byte-accounted                        │
//!                     │            admission cap)                        ▼
//!                     │                                     FileRecord / SecretRecord
//!                     ▼                                                  │
//!              CancellationToken ◄── sink failure / Ctrl-C               ▼
//!                                                         RotatingJsonlWriter × 2
//!                                                         (append, rotate, gzip)
//! ```
//!
//! # Memory Bounds
//!
//! Three mechanisms keep the working set bounded regardless of corpus size:
//!
//! - **Reservations**: fetchers acquire `max(size, size × 3)` bytes from a
//!   global cap before downloading and scanners release after scanning.
//! - **Bounded channels**: slow scanners stall fetchers by design; this
//!   protects RAM even when the reservation ceiling is mis-configured.
//! - **Fragment cache**: the dedup cache is fixed-capacity and evicts its
//!   lowest-scored entry, so the repeated-base-image working set never
//!   outgrows its byte budget.
//!
//! # Failure Model
//!
//! Per-layer and per-worker errors are contained: unparseable descriptors,
//! denied reservations, transport failures, rate limits, and decode errors
//! all log and skip (decode errors still emit the partial record). Sink
//! failures and root cancellation propagate to shutdown. There are no
//! automatic retries; operators re-run with the remaining descriptors.
//!
//! # Example
//!
//! ```rust,ignore
//! use layerharvest::{Pipeline, PipelineConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> layerharvest::Result<()> {
//!     let cancel = CancellationToken::new();
//!     let pipeline = Pipeline::new(
//!         PipelineConfig {
//!             input_path: "layers.jsonl".into(),
//!             result_dir: "runtime/results".into(),
//!             max_storage: 50 * 1_000_000_000,
//!             scan_workers: 8,
//!             fetch_workers: 30,
//!         },
//!         cancel.clone(),
//!     );
//!     pipeline.run().await
//! }
//! ```

pub mod cache;
pub mod constants;
pub mod detect;
pub mod error;
pub mod fetcher;
pub mod fragment;
pub mod pipeline;
pub mod records;
pub mod registry;
pub mod reservation;
pub mod scanner;
pub mod sink;

pub use cache::FragmentCache;
pub use detect::{Detector, Finding};
pub use error::{Error, Result};
pub use fetcher::{BlobFetcher, ExtractedBlob};
pub use pipeline::{Pipeline, PipelineConfig};
pub use records::{FileRecord, LayerDescriptor, SecretInfo, SecretRecord};
pub use registry::RegistryClient;
pub use reservation::{estimate_reservation, StorageReservation};
pub use scanner::LayerScanner;
pub use sink::RotatingJsonlWriter;
