use offload_accelerate::harness::{gemm_on_device, GemmDims};
use offload_accelerate::{reference, AcceleratorSession, InProcessPlatform, ProgramCache};
use offload_api::{OffloadError, QueueProperties};

fn session() -> AcceleratorSession {
    AcceleratorSession::open(&InProcessPlatform::new(), QueueProperties { profiling: true })
        .expect("in-process session")
}

#[test]
fn ones_times_identity_is_ones() {
    let dir = tempfile::tempdir().unwrap();
    let session = session();
    let cache = ProgramCache::new(dir.path());
    let n = 16usize;
    let ones = vec![1.0f32; n * n];
    let identity = reference::identity(n);
    let outcome = gemm_on_device(
        &session,
        &cache,
        &ones,
        &identity,
        GemmDims::padded(16, 16, 16),
        3,
    )
    .unwrap();
    assert_eq!(outcome.c, ones);
    assert_eq!(outcome.tiled.samples.len(), 3);
    assert_eq!(outcome.tiled.summary.count, 3);
}

#[test]
fn rectangular_blocks_cover_every_output() {
    let dir = tempfile::tempdir().unwrap();
    let session = session();
    let cache = ProgramCache::new(dir.path());
    let dims = GemmDims::padded(12, 8, 20);
    let (m, k, n) = (dims.m as usize, dims.k as usize, dims.n as usize);
    let a: Vec<f32> = (0..m * k).map(|i| (i % 7) as f32).collect();
    let b: Vec<f32> = (0..k * n).map(|i| (i % 5) as f32 - 2.0).collect();
    let outcome = gemm_on_device(&session, &cache, &a, &b, dims, 1).unwrap();
    // Small integers: every block must reproduce the host product exactly.
    assert_eq!(outcome.c, reference::gemm(&a, &b, m, k, n).unwrap());
}

#[test]
fn wide_output_spans_several_work_groups() {
    let dir = tempfile::tempdir().unwrap();
    let session = session();
    let cache = ProgramCache::new(dir.path());
    // 36 blocks across exceeds one 8x8 work-group on x.
    let dims = GemmDims::padded(4, 4, 144);
    let a = reference::identity(4);
    let b: Vec<f32> = (0..4 * 144).map(|i| i as f32).collect();
    let outcome = gemm_on_device(&session, &cache, &a, &b, dims, 1).unwrap();
    assert_eq!(outcome.c, b);
}

#[test]
fn mismatched_inputs_are_rejected_before_dispatch() {
    let dir = tempfile::tempdir().unwrap();
    let session = session();
    let cache = ProgramCache::new(dir.path());
    let err = gemm_on_device(
        &session,
        &cache,
        &[1.0; 15],
        &[1.0; 16],
        GemmDims::padded(4, 4, 4),
        1,
    )
    .unwrap_err();
    assert!(matches!(err, OffloadError::LengthMismatch { expected: 16, found: 15 }));
    assert!(!cache.path_for(&offload_accelerate::kernels::GEMM).exists());
}

#[test]
fn zero_iterations_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let session = session();
    let cache = ProgramCache::new(dir.path());
    let ones = vec![1.0f32; 16];
    let err = gemm_on_device(&session, &cache, &ones, &ones, GemmDims::padded(4, 4, 4), 0)
        .unwrap_err();
    assert!(matches!(err, OffloadError::Dispatch(_)));
}
