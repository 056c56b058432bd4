//! Download workers.
//!
//! Each fetcher consumes layer descriptors from the shared input queue,
//! reserves the estimated uncompressed footprint, issues the streaming blob
//! GET, and delivers an [`ExtractedBlob`] to the scanner stage. Delivery is
//! at-most-once: any failure releases the reservation and drops the
//! descriptor, never re-queueing it.
//!
//! Response handling:
//!
//! | status            | action                                              |
//! |-------------------|-----------------------------------------------------|
//! | 2xx               | deliver the blob stream                             |
//! | 429               | release, sleep until reset (or 300 s), skip         |
//! | HTTP/2 + 500      | release, cancel this fetcher's root token, skip     |
//! | other non-2xx     | release, log, skip                                  |
//!
//! After [`CLIENT_REFRESH_INTERVAL`] successful deliveries the worker
//! rebuilds its registry client to bound the accumulated authorisation
//! scope set.

use crate::constants::{CLIENT_REFRESH_INTERVAL, RATE_LIMIT_BACKOFF};
use crate::error::{Error, Result};
use crate::records::LayerDescriptor;
use crate::registry::{self, RegistryClient};
use crate::reservation::{estimate_reservation, StorageReservation};
use futures::TryStreamExt;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::io::{StreamReader, SyncIoBridge};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// An opened layer blob in flight between fetcher and scanner.
///
/// Exclusively owned by the scanner that receives it. The scanner must drop
/// the reader, cancel the scoped token, and release the reservation on every
/// exit path.
pub struct ExtractedBlob {
    /// The descriptor this blob was fetched for.
    pub descriptor: LayerDescriptor,
    /// Blocking reader positioned at the start of the compressed archive.
    pub reader: Box<dyn Read + Send>,
    /// Scoped cancellation handle for this blob.
    pub cancel: CancellationToken,
    /// Exact byte reservation acquired for this blob.
    pub reserved: u64,
}

struct Fetched {
    blob: ExtractedBlob,
    /// Set when the response reported an exhausted rate-limit budget; the
    /// worker backs off after delivering.
    backoff: Option<Duration>,
}

/// One download worker.
pub struct BlobFetcher {
    client: RegistryClient,
    reservation: StorageReservation,
    cancel: CancellationToken,
    delivered: u32,
}

impl BlobFetcher {
    /// Creates a worker whose root token is a child of `parent`.
    pub fn new(reservation: StorageReservation, parent: &CancellationToken) -> Result<Self> {
        Ok(Self {
            client: RegistryClient::new()?,
            reservation,
            cancel: parent.child_token(),
            delivered: 0,
        })
    }

    /// Cancels this worker's root token and all of its in-flight blobs.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Worker loop. Terminates when the input channel closes or the root
    /// token fires.
    pub async fn run(
        mut self,
        input: Arc<Mutex<mpsc::Receiver<LayerDescriptor>>>,
        output: mpsc::Sender<ExtractedBlob>,
    ) {
        loop {
            let descriptor = {
                let mut rx = input.lock().await;
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    received = rx.recv() => match received {
                        Some(d) => d,
                        None => return,
                    },
                }
            };

            match self.fetch(descriptor).await {
                Ok(fetched) => {
                    if !self.deliver(fetched.blob, &output).await {
                        return;
                    }
                    self.delivered += 1;
                    if self.delivered >= CLIENT_REFRESH_INTERVAL {
                        self.refresh_client();
                    }
                    if let Some(delay) = fetched.backoff {
                        warn!("rate-limit budget exhausted, backing off {:?}", delay);
                        self.sleep(delay).await;
                    }
                }
                Err(e) => warn!("skipping layer: {}", e),
            }
        }
    }

    /// Sends the blob downstream. Returns `false` when the worker must exit;
    /// the blob's reservation is released in that case.
    async fn deliver(&self, blob: ExtractedBlob, output: &mpsc::Sender<ExtractedBlob>) -> bool {
        let reserved = blob.reserved;
        let scope = blob.cancel.clone();
        tokio::select! {
            _ = self.cancel.cancelled() => {
                scope.cancel();
                self.reservation.release(reserved);
                false
            }
            sent = output.send(blob) => {
                if sent.is_err() {
                    scope.cancel();
                    self.reservation.release(reserved);
                    return false;
                }
                true
            }
        }
    }

    async fn fetch(&mut self, descriptor: LayerDescriptor) -> Result<Fetched> {
        let estimate = estimate_reservation(descriptor.size);
        if !self.reservation.acquire(estimate).await {
            return Err(Error::ReservationDenied {
                digest: descriptor.digest,
                requested: estimate,
            });
        }

        let response = match self.client.blob_get(&descriptor).await {
            Ok(r) => r,
            Err(e) => {
                self.reservation.release(estimate);
                return Err(e);
            }
        };

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let delay = registry::reset_delay(response.headers()).unwrap_or(RATE_LIMIT_BACKOFF);
            drop(response);
            self.reservation.release(estimate);
            self.sleep(delay).await;
            return Err(Error::RateLimited {
                digest: descriptor.digest,
            });
        }
        if response.version() == reqwest::Version::HTTP_2
            && status == reqwest::StatusCode::INTERNAL_SERVER_ERROR
        {
            drop(response);
            self.reservation.release(estimate);
            self.stop();
            return Err(Error::ServerTransient {
                digest: descriptor.digest,
            });
        }
        if !status.is_success() {
            drop(response);
            self.reservation.release(estimate);
            return Err(Error::BlobFetchFailed {
                digest: descriptor.digest,
                reason: format!("registry returned {}", status),
            });
        }

        let backoff = if registry::remaining_is_zero(response.headers()) {
            Some(registry::exhausted_backoff(response.headers()))
        } else {
            None
        };

        let stream = response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        let reader = SyncIoBridge::new(StreamReader::new(stream));

        Ok(Fetched {
            blob: ExtractedBlob {
                descriptor,
                reader: Box::new(reader),
                cancel: self.cancel.child_token(),
                reserved: estimate,
            },
            backoff,
        })
    }

    fn refresh_client(&mut self) {
        self.delivered = 0;
        match RegistryClient::new() {
            Ok(client) => self.client = client,
            // Keep the old client rather than lose the worker; the next
            // interval retries the rebuild.
            Err(e) => warn!("client refresh failed: {}", e),
        }
    }

    async fn sleep(&self, delay: Duration) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
