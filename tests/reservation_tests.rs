//! Tests for reservation-based admission control.
//!
//! Validates acquire/release balance, the over-cap fast path, blocking
//! behaviour under saturation, and cancellable waits.

use layerharvest::{estimate_reservation, StorageReservation};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const CAP: u64 = 1024 * 1024;

fn pool() -> StorageReservation {
    StorageReservation::new(CAP, CancellationToken::new())
}

// =============================================================================
// Acquire / Release Tests
// =============================================================================

#[tokio::test]
async fn test_acquire_within_cap() {
    let pool = pool();
    assert!(pool.acquire(4096).await);
    assert!(pool.available() < CAP);
    pool.release(4096);
    assert_eq!(pool.available(), CAP);
}

#[tokio::test]
async fn test_acquire_over_cap_fails_immediately() {
    let pool = pool();
    assert!(!pool.acquire(CAP + 1).await);
    assert_eq!(pool.available(), CAP);
}

#[tokio::test]
async fn test_release_zero_is_noop() {
    let pool = pool();
    pool.release(0);
    assert_eq!(pool.available(), CAP);
}

#[tokio::test]
async fn test_balance_across_many_reservations() {
    let pool = pool();
    let sizes = [100u64, 4096, 65_536, 1, 1024];
    for &size in &sizes {
        assert!(pool.acquire(size).await);
    }
    for &size in &sizes {
        pool.release(size);
    }
    assert_eq!(pool.available(), CAP);
}

// =============================================================================
// Saturation Tests
// =============================================================================

#[tokio::test]
async fn test_saturated_pool_blocks_until_release() {
    let pool = pool();
    assert!(pool.acquire(CAP).await);

    // A second acquisition must wait for the release.
    let blocked = pool.clone();
    let waiter = tokio::spawn(async move { blocked.acquire(4096).await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished(), "acquire should block while saturated");

    pool.release(CAP);
    assert!(waiter.await.unwrap());
    pool.release(4096);
    assert_eq!(pool.available(), CAP);
}

// =============================================================================
// Cancellation Tests
// =============================================================================

#[tokio::test]
async fn test_cancelled_wait_returns_false() {
    let cancel = CancellationToken::new();
    let pool = StorageReservation::new(CAP, cancel.clone());
    assert!(pool.acquire(CAP).await);

    let blocked = pool.clone();
    let waiter = tokio::spawn(async move { blocked.acquire(1).await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();
    assert!(!waiter.await.unwrap(), "cancelled acquire must report failure");

    // The failed acquire must not have consumed anything.
    pool.release(CAP);
    assert_eq!(pool.available(), CAP);
}

// =============================================================================
// Estimation Tests
// =============================================================================

#[test]
fn test_estimate_applies_expansion_factor() {
    assert_eq!(estimate_reservation(1000), 3000);
}

#[test]
fn test_estimate_never_below_declared() {
    // The estimate is max(declared, declared * factor); with a factor above
    // one the declared size is always the floor.
    assert!(estimate_reservation(7) >= 7);
    assert_eq!(estimate_reservation(0), 0);
}
