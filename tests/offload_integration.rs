//! End-to-end tests for the offload engine on the emulated accelerator.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use assert_matches::assert_matches;
use tokio::sync::{mpsc, oneshot};

use dedupe_offload::accel::emulated::EmulatedAccelerator;
use dedupe_offload::accel::AccelStatus;
use dedupe_offload::envelope::adler32;
use dedupe_offload::{
    AcceleratorPool, Continuation, DataVio, DmaBuf, Error, OffloadConfig, PoolState, ReadStatus,
    SoftwareCodec, SubmitError,
};

// =============================================================================
// Helpers
// =============================================================================

fn test_config() -> OffloadConfig {
    OffloadConfig {
        spare_cache_initial: 2,
        spare_cache_capacity: 16,
        ..Default::default()
    }
}

fn setup(instances: usize) -> (Arc<EmulatedAccelerator>, AcceleratorPool) {
    let accel = Arc::new(EmulatedAccelerator::with_instances(instances));
    let pool = AcceleratorPool::try_initialize(accel.clone(), test_config()).unwrap();
    (accel, pool)
}

fn text(len: usize, seed: usize) -> Vec<u8> {
    let line = format!("record {:06} shares most of its bytes with its neighbours. ", seed);
    line.bytes().cycle().take(len).collect()
}

fn noise(len: usize, seed: u64) -> Vec<u8> {
    let mut x = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
    (0..len)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            x as u8
        })
        .collect()
}

async fn write(pool: &AcceleratorPool, id: u64, data: &[u8]) -> DataVio {
    let (tx, rx) = oneshot::channel();
    let vio =
        DataVio::for_write(id, DmaBuf::from_slice(data).unwrap(), Continuation::Oneshot(tx)).unwrap();
    pool.compress(vio).unwrap();
    rx.await.unwrap()
}

fn read_vio(id: u64, envelope: &[u8], block_size: usize, tx: oneshot::Sender<DataVio>) -> DataVio {
    let stored = DmaBuf::from_slice(envelope).unwrap();
    DataVio::for_read(id, stored, 0..envelope.len(), block_size, Continuation::Oneshot(tx)).unwrap()
}

async fn read(pool: &AcceleratorPool, id: u64, envelope: &[u8], block_size: usize) -> DataVio {
    let (tx, rx) = oneshot::channel();
    pool.decompress(read_vio(id, envelope, block_size, tx)).unwrap();
    rx.await.unwrap()
}

/// The in-flight count drops just after the continuation runs.
async fn wait_idle(pool: &AcceleratorPool) {
    for _ in 0..200 {
        if pool.inflight() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("requests still in flight: {}", pool.inflight());
}

// =============================================================================
// Round trip and envelope
// =============================================================================

#[tokio::test]
async fn test_compress_decompress_round_trip() {
    let (_accel, pool) = setup(2);
    let data = text(4096, 1);

    let written = write(&pool, 1, &data).await;
    assert!(!written.is_incompressible());
    let envelope = written.compressed_data().unwrap().to_vec();
    assert_eq!(&envelope[..2], &[0x78, 0x01]);
    assert_eq!(&envelope[envelope.len() - 4..], &adler32(&data).to_be_bytes());

    let back = read(&pool, 2, &envelope, 4096).await;
    assert_eq!(back.read_block().status, ReadStatus::Success);
    assert_eq!(back.read_data().unwrap(), data.as_slice());
}

#[tokio::test]
async fn test_envelope_compatible_with_software_codec() {
    let (_accel, pool) = setup(1);
    let codec = SoftwareCodec::new(1, 4096);
    let data = text(4096, 7);

    // Offload-written block read by the software path
    let written = write(&pool, 1, &data).await;
    let envelope = written.compressed_data().unwrap();
    assert_eq!(codec.decompress(envelope, 4096).unwrap(), data);

    // Software-written block read by the offload path
    let envelope = codec.compress(&data).unwrap().unwrap();
    let back = read(&pool, 2, &envelope, 4096).await;
    assert_eq!(back.read_data().unwrap(), data.as_slice());
}

#[tokio::test]
async fn test_large_block_round_trip() {
    let (_accel, pool) = setup(2);
    let data = text(64 * 1024, 3);
    assert!(pool.is_eligible(data.len()));

    let written = write(&pool, 1, &data).await;
    let envelope = written.compressed_data().unwrap().to_vec();
    let back = read(&pool, 2, &envelope, data.len()).await;
    assert_eq!(back.read_data().unwrap(), data.as_slice());
}

#[tokio::test]
async fn test_random_block_is_incompressible() {
    let (_accel, pool) = setup(1);
    let written = write(&pool, 1, &noise(4096, 11)).await;
    assert!(written.is_incompressible());
    assert_eq!(written.compression().size, 4097);
    assert!(written.compressed_data().is_none());
    assert_eq!(pool.stats().snapshot().incompressible_over_budget, 1);
}

// =============================================================================
// Classification
// =============================================================================

#[tokio::test]
async fn test_over_budget_reports_sentinel() {
    let (accel, pool) = setup(1);
    accel.faults().set_produced_override(Some(4091));

    let written = write(&pool, 1, &text(4096, 2)).await;
    assert_eq!(written.compression().size, 4097);
    assert!(written.compressed_data().is_none());

    wait_idle(&pool).await;
    let snap = pool.stats().snapshot();
    assert_eq!(snap.incompressible_over_budget, 1);
    assert_eq!(snap.compressed, 0);
    assert_eq!(pool.spare_cache().outstanding(), 0);
}

#[tokio::test]
async fn test_footer_follows_payload() {
    let (accel, pool) = setup(1);
    accel.faults().set_produced_override(Some(4000));
    let data = text(4096, 4);

    let written = write(&pool, 1, &data).await;
    assert_eq!(written.compression().size, 4006);
    let envelope = written.compressed_data().unwrap();
    assert_eq!(envelope.len(), 4006);
    assert_eq!(&envelope[4002..4006], &adler32(&data).to_be_bytes());
    assert_eq!(pool.stats().snapshot().compressed, 1);
}

#[tokio::test]
async fn test_footer_across_page_boundary_is_incompressible() {
    let (accel, pool) = setup(1);
    accel.faults().set_produced_override(Some(4092));

    let written = write(&pool, 1, &text(8192, 5)).await;
    assert_eq!(written.compression().size, 8193);
    assert_eq!(pool.stats().snapshot().incompressible_page_boundary, 1);
}

#[tokio::test]
async fn test_compress_hardware_failure() {
    let (accel, pool) = setup(1);
    accel.faults().set_fail_compress(true);

    let written = write(&pool, 1, &text(4096, 6)).await;
    assert!(written.is_incompressible());
    assert_eq!(pool.stats().snapshot().hardware_failures, 1);
}

#[tokio::test]
async fn test_decompress_failure_leaves_destination_untouched() {
    let (accel, pool) = setup(1);
    let data = text(4096, 8);
    let envelope = write(&pool, 1, &data).await.compressed_data().unwrap().to_vec();

    accel.faults().set_fail_decompress(true);
    let back = read(&pool, 2, &envelope, 4096).await;
    assert_eq!(back.read_block().status, ReadStatus::InvalidFragment);
    assert!(back.read_data().is_none());
    assert!(back.scratch_block().iter().all(|&b| b == 0));
}

#[tokio::test]
async fn test_corrupt_fragment_is_invalid() {
    let (_accel, pool) = setup(1);
    let data = text(4096, 9);
    let mut envelope = write(&pool, 1, &data).await.compressed_data().unwrap().to_vec();
    let last = envelope.len() - 1;
    envelope[last] ^= 0xFF;

    let back = read(&pool, 2, &envelope, 4096).await;
    assert_eq!(back.read_block().status, ReadStatus::InvalidFragment);
}

// =============================================================================
// Channel selection
// =============================================================================

#[tokio::test]
async fn test_round_robin_order() {
    let (_accel, pool) = setup(3);
    let mut order = Vec::new();
    let mut before = pool.channel_jobs();

    for i in 0..9 {
        write(&pool, i, &text(4096, i as usize)).await;
        let after = pool.channel_jobs();
        let picked = (0..3).find(|&c| after[c] != before[c]).unwrap();
        order.push(picked);
        before = after;
    }
    assert_eq!(order, vec![0, 1, 2, 0, 1, 2, 0, 1, 2]);
}

#[tokio::test]
async fn test_even_distribution() {
    let (accel, pool) = setup(4);
    let (tx, mut rx) = mpsc::unbounded_channel();

    for i in 0..40u64 {
        let data = DmaBuf::from_slice(&text(4096, i as usize)).unwrap();
        let vio = DataVio::for_write(i, data, Continuation::Queue(tx.clone())).unwrap();
        pool.compress(vio).unwrap();
    }
    drop(tx);

    let mut done = 0;
    while rx.recv().await.is_some() {
        done += 1;
    }
    assert_eq!(done, 40);
    assert_eq!(pool.channel_jobs(), vec![10, 10, 10, 10]);

    // Workers count a job after its completion has run.
    wait_idle(&pool).await;
    for _ in 0..200 {
        if (0..4).all(|i| accel.jobs_processed(i) == 10) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    for i in 0..4 {
        assert_eq!(accel.jobs_processed(i), 10);
    }
}

#[tokio::test]
async fn test_callback_continuation() {
    let (_accel, pool) = setup(2);
    let (tx, rx) = oneshot::channel();
    let data = DmaBuf::from_slice(&text(4096, 10)).unwrap();
    let vio = DataVio::for_write(
        5,
        data,
        Continuation::Callback(Box::new(move |vio| {
            let _ = tx.send(vio.compression().size);
        })),
    )
    .unwrap();

    pool.compress(vio).unwrap();
    let size = rx.await.unwrap();
    assert!(size < 4096);
}

#[test]
fn test_concurrent_submitters() {
    const THREADS: u64 = 8;
    const PER_THREAD: u64 = 50;

    let (_accel, pool) = setup(4);
    let pool = Arc::new(pool);
    let baseline = pool.allocator().snapshot();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let submitters: Vec<_> = (0..THREADS)
        .map(|t| {
            let pool = Arc::clone(&pool);
            let tx = tx.clone();
            thread::spawn(move || {
                for j in 0..PER_THREAD {
                    let id = t * 1000 + j;
                    let data = DmaBuf::from_slice(&text(4096, id as usize)).unwrap();
                    let vio = DataVio::for_write(id, data, Continuation::Queue(tx.clone())).unwrap();
                    pool.compress(vio).unwrap();
                }
            })
        })
        .collect();
    drop(tx);
    for submitter in submitters {
        submitter.join().unwrap();
    }

    let mut ids = Vec::new();
    while let Some(vio) = rx.blocking_recv() {
        assert!(!vio.is_incompressible());
        ids.push(vio.id());
    }
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len() as u64, THREADS * PER_THREAD);

    let per_channel = THREADS * PER_THREAD / 4;
    assert_eq!(pool.channel_jobs(), vec![per_channel; 4]);

    let after = pool.allocator().snapshot();
    assert_eq!(after.live_allocations, baseline.live_allocations);
    assert_eq!(after.live_bytes, baseline.live_bytes);
    assert_eq!(pool.spare_cache().outstanding(), 0);
    assert_eq!(pool.stats().snapshot().compressed, THREADS * PER_THREAD);
}

// =============================================================================
// Failure paths and resource accounting
// =============================================================================

#[tokio::test]
async fn test_no_leaks_across_mixed_workload() {
    let (accel, pool) = setup(3);
    let baseline = pool.allocator().snapshot();

    for i in 0..12u64 {
        let data = if i % 3 == 0 { noise(4096, i) } else { text(4096, i as usize) };
        let written = write(&pool, i, &data).await;
        if let Some(envelope) = written.compressed_data() {
            let envelope = envelope.to_vec();
            read(&pool, 100 + i, &envelope, 4096).await;
        }
    }
    accel.faults().set_fail_compress(true);
    write(&pool, 50, &text(4096, 50)).await;
    accel.faults().clear();

    wait_idle(&pool).await;
    let after = pool.allocator().snapshot();
    assert_eq!(after.live_allocations, baseline.live_allocations);
    assert_eq!(after.live_bytes, baseline.live_bytes);
    assert_eq!(after.total_allocations - baseline.total_allocations,
        after.total_frees - baseline.total_frees);
    assert_eq!(pool.spare_cache().outstanding(), 0);
}

#[tokio::test]
async fn test_allocation_failure_resolves_context() {
    let (_accel, pool) = setup(2);
    let baseline = pool.allocator().snapshot();
    pool.allocator().set_limit(Some(baseline.live_bytes as usize + 64));

    let (tx, rx) = oneshot::channel();
    let data = DmaBuf::from_slice(&text(4096, 12)).unwrap();
    let vio = DataVio::for_write(1, data, Continuation::Oneshot(tx)).unwrap();
    let err = pool.compress(vio).unwrap_err();
    assert_matches!(err, SubmitError::Failed(Error::ResourceExhausted { .. }));

    let resolved = rx.await.unwrap();
    assert_eq!(resolved.compression().size, 4097);

    let (tx, rx) = oneshot::channel();
    let err = pool.decompress(read_vio(2, &[0x78, 0x01, 0x00, 0x00], 4096, tx)).unwrap_err();
    assert_matches!(err, SubmitError::Failed(Error::ResourceExhausted { .. }));
    assert_eq!(rx.await.unwrap().read_block().status, ReadStatus::InvalidFragment);

    let after = pool.allocator().snapshot();
    assert_eq!(after.live_allocations, baseline.live_allocations);
    assert_eq!(pool.spare_cache().outstanding(), 0);
    assert_eq!(pool.inflight(), 0);
    assert_eq!(pool.stats().snapshot().resource_exhausted, 2);
}

#[tokio::test]
async fn test_rejected_submission_resolves_context() {
    let (accel, pool) = setup(2);
    let baseline = pool.allocator().snapshot();
    accel.faults().set_reject_submissions(true);

    let (tx, rx) = oneshot::channel();
    let data = DmaBuf::from_slice(&text(4096, 13)).unwrap();
    let vio = DataVio::for_write(1, data, Continuation::Oneshot(tx)).unwrap();
    let err = pool.compress(vio).unwrap_err();
    assert_matches!(
        err,
        SubmitError::Failed(Error::Rejected {
            status: AccelStatus::Retry
        })
    );

    let resolved = rx.await.unwrap();
    assert!(resolved.is_incompressible());
    assert_eq!(pool.allocator().snapshot().live_allocations, baseline.live_allocations);
    assert_eq!(pool.spare_cache().outstanding(), 0);
    assert_eq!(pool.inflight(), 0);
    assert_eq!(pool.stats().snapshot().rejected, 1);
}

// =============================================================================
// Lifecycle
// =============================================================================

#[test]
fn test_shutdown_drains_outstanding_requests() {
    let (accel, pool) = setup(2);
    accel.faults().set_job_delay(Duration::from_millis(20));

    let (tx, mut rx) = mpsc::unbounded_channel();
    for i in 0..8u64 {
        let data = DmaBuf::from_slice(&text(4096, i as usize)).unwrap();
        let vio = DataVio::for_write(i, data, Continuation::Queue(tx.clone())).unwrap();
        pool.compress(vio).unwrap();
    }
    drop(tx);

    pool.shutdown();
    assert_eq!(pool.state(), PoolState::Uninitialized);
    assert_eq!(pool.inflight(), 0);
    assert_eq!(accel.running_instances(), 0);

    let mut delivered = 0;
    while let Ok(vio) = rx.try_recv() {
        assert!(!vio.is_incompressible());
        delivered += 1;
    }
    assert_eq!(delivered, 8);
    assert_eq!(pool.spare_cache().outstanding(), 0);
}

#[tokio::test]
async fn test_shutdown_is_idempotent_and_falls_back() {
    let (accel, pool) = setup(2);
    pool.shutdown();
    pool.shutdown();
    assert_eq!(accel.running_instances(), 0);
    assert!(!pool.is_eligible(4096));

    let (tx, _rx) = oneshot::channel();
    let data = text(4096, 14);
    let vio = DataVio::for_write(1, DmaBuf::from_slice(&data).unwrap(), Continuation::Oneshot(tx))
        .unwrap();
    let mut vio = pool.compress(vio).unwrap_err().into_vio().unwrap();

    let codec = SoftwareCodec::new(1, 4096);
    codec.compress_vio(&mut vio).unwrap();
    assert!(!vio.is_incompressible());
    assert_eq!(codec.decompress(vio.compressed_data().unwrap(), 4096).unwrap(), data);
}

#[test]
fn test_zero_channels_disables_offload() {
    let accel = Arc::new(EmulatedAccelerator::with_instances(0));
    let pool = AcceleratorPool::initialize(accel, test_config());
    assert_eq!(pool.state(), PoolState::Uninitialized);
    assert!(pool.init_error().is_none());
    assert!(!pool.is_eligible(4096));

    let (tx, _rx) = oneshot::channel();
    let vio = DataVio::for_write(1, DmaBuf::new(4096).unwrap(), Continuation::Oneshot(tx)).unwrap();
    assert_matches!(pool.compress(vio), Err(SubmitError::Unavailable(_)));
}

#[test]
fn test_init_failure_rolls_back_everything() {
    let accel = Arc::new(EmulatedAccelerator::with_instances(4));
    accel.faults().set_fail_start_instance(Some(2));

    let pool = AcceleratorPool::initialize(accel.clone(), test_config());
    assert_eq!(pool.state(), PoolState::Uninitialized);
    assert!(pool.init_error().unwrap().contains("start_instance"));
    assert_eq!(accel.running_instances(), 0);

    // Channels 0 and 1 came up and were torn down again
    let snap = pool.allocator().snapshot();
    assert!(snap.total_allocations > 0);
    assert_eq!(snap.total_frees, snap.total_allocations);
    assert_eq!(snap.live_allocations, 0);
    assert_eq!(snap.live_bytes, 0);

    let (tx, _rx) = oneshot::channel();
    let vio = DataVio::for_write(1, DmaBuf::new(4096).unwrap(), Continuation::Oneshot(tx)).unwrap();
    let vio = pool.compress(vio).unwrap_err().into_vio().unwrap();
    assert_eq!(vio.id(), 1);
}

#[test]
fn test_last_pool_handle_dropped_in_continuation() {
    let (accel, pool) = setup(1);
    let pool = Arc::new(pool);
    // Keep later jobs queued behind the first on the same worker
    accel.faults().set_job_delay(Duration::from_millis(20));

    let (done_tx, done_rx) = std::sync::mpsc::channel();
    let holder = Arc::clone(&pool);
    let first_tx = done_tx.clone();
    let data = DmaBuf::from_slice(&text(4096, 30)).unwrap();
    let first = DataVio::for_write(
        0,
        data,
        Continuation::Callback(Box::new(move |vio| {
            drop(holder);
            let _ = first_tx.send(vio.id());
        })),
    )
    .unwrap();
    pool.compress(first).unwrap();

    for id in 1..4u64 {
        let tx = done_tx.clone();
        let data = DmaBuf::from_slice(&text(4096, id as usize)).unwrap();
        let vio = DataVio::for_write(
            id,
            data,
            Continuation::Callback(Box::new(move |vio| {
                let _ = tx.send(vio.id());
            })),
        )
        .unwrap();
        pool.compress(vio).unwrap();
    }
    drop(done_tx);
    drop(pool);

    let mut delivered = Vec::new();
    for _ in 0..4 {
        let id = done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("continuation never ran");
        delivered.push(id);
    }
    delivered.sort_unstable();
    assert_eq!(delivered, vec![0, 1, 2, 3]);

    for _ in 0..200 {
        if accel.running_instances() == 0 {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(accel.running_instances(), 0);
}

#[test]
fn test_eligibility_window() {
    let (_accel, pool) = setup(1);
    assert!(!pool.is_eligible(4095));
    assert!(pool.is_eligible(4096));
    assert!(pool.is_eligible(128 * 1024));
    assert!(!pool.is_eligible(128 * 1024 + 1));
}
