//! Byte-accounted admission control.
//!
//! The pipeline holds layer bytes in flight between download and scan. The
//! reservation pool caps the concurrent uncompressed footprint: fetchers
//! acquire an upper-bound estimate before downloading and the scanner that
//! consumed the blob releases it after scanning. Waits are cancellable via
//! the root token, so saturation never deadlocks shutdown.

use crate::constants::EXPANSION_FACTOR;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Permits are accounted in KiB units: a single tokio acquisition is capped
/// at `u32` permits, and KiB units raise the per-acquisition ceiling to 4 TiB.
const UNIT: u64 = 1024;

fn to_units(bytes: u64) -> u64 {
    bytes.div_ceil(UNIT)
}

/// Counting semaphore over bytes. Cloned handles share one pool.
#[derive(Clone)]
pub struct StorageReservation {
    max_storage: u64,
    sem: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl StorageReservation {
    /// Creates a pool capping the in-flight footprint at `max_storage` bytes.
    /// Acquisitions blocked on a saturated pool abort when `cancel` fires.
    pub fn new(max_storage: u64, cancel: CancellationToken) -> Self {
        Self {
            max_storage,
            sem: Arc::new(Semaphore::new(to_units(max_storage) as usize)),
            cancel,
        }
    }

    /// Returns the configured cap in bytes.
    pub fn max_storage(&self) -> u64 {
        self.max_storage
    }

    /// Reserves `bytes` from the pool. Returns `true` iff the reservation was
    /// granted. Returns `false` immediately when `bytes` exceeds the global
    /// cap, and when the root token fires while waiting.
    pub async fn acquire(&self, bytes: u64) -> bool {
        if bytes > self.max_storage {
            return false;
        }
        let units = to_units(bytes);
        let Ok(units) = u32::try_from(units) else {
            return false;
        };
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            permit = self.sem.acquire_many(units) => match permit {
                Ok(permit) => {
                    permit.forget();
                    true
                }
                Err(_) => false,
            },
        }
    }

    /// Returns `bytes` to the pool. A zero release is a no-op. Every
    /// successful acquire must be paired with exactly one release of the
    /// same amount, on success, error, and cancellation paths alike.
    pub fn release(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        self.sem.add_permits(to_units(bytes) as usize);
    }

    /// Currently available bytes. Test and diagnostics hook; racy by nature.
    pub fn available(&self) -> u64 {
        self.sem.available_permits() as u64 * UNIT
    }
}

/// Upper-bound estimate of a layer's uncompressed footprint:
/// `max(declared, declared × EXPANSION_FACTOR)`.
pub fn estimate_reservation(declared_size: u64) -> u64 {
    let expanded = (declared_size as f64 * EXPANSION_FACTOR) as u64;
    declared_size.max(expanded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_uses_expansion_factor() {
        assert_eq!(estimate_reservation(100), 300);
        assert_eq!(estimate_reservation(0), 0);
    }
}
