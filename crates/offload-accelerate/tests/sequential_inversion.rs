use offload_accelerate::harness::invert_on_device;
use offload_accelerate::kernels::{self, INVERSION_ROW_ARG};
use offload_accelerate::{
    reference, AcceleratorSession, InProcessPlatform, KernelDispatcher, KernelLaunch,
    ProgramCache,
};
use offload_api::{AccessMode, QueueProperties, ScalarValue, WorkExtent};

fn session() -> AcceleratorSession {
    AcceleratorSession::open(&InProcessPlatform::new(), QueueProperties { profiling: true })
        .expect("in-process session")
}

/// Non-diagonal 5x5 matrix with a well-conditioned inverse.
fn m5() -> Vec<f32> {
    let mut m = vec![0.0f32; 25];
    for i in 0..5 {
        for j in 0..5 {
            m[i * 5 + j] = if i == j { 5.0 } else { 1.0 + ((i * 3 + j) % 4) as f32 };
        }
    }
    m
}

fn assert_close(got: &[f32], want: &[f32], tol: f32) {
    assert_eq!(got.len(), want.len());
    for (i, (g, w)) in got.iter().zip(want).enumerate() {
        assert!((g - w).abs() <= tol, "element {i}: {g} vs {w}");
    }
}

fn max_deviation(got: &[f32], want: &[f32]) -> f32 {
    got.iter()
        .zip(want)
        .map(|(g, w)| (g - w).abs())
        .fold(0.0, f32::max)
}

#[test]
fn two_by_two_example() {
    let dir = tempfile::tempdir().unwrap();
    let session = session();
    let cache = ProgramCache::new(dir.path());
    let outcome = invert_on_device(&session, &cache, &[4.0, 3.0, 6.0, 3.0], 2).unwrap();
    assert_close(&outcome.inverse, &[-0.5, 0.5, 1.0, -2.0 / 3.0], 1e-5);
    assert_close(&outcome.matrix, &reference::identity(2), 1e-5);
}

#[test]
fn rows_dispatch_in_order_with_a_drain_after_each() {
    let dir = tempfile::tempdir().unwrap();
    let session = session();
    let cache = ProgramCache::new(dir.path());
    let input = m5();
    let outcome = invert_on_device(&session, &cache, &input, 5).unwrap();

    assert_eq!(outcome.trace.rows(), vec![0, 1, 2, 3, 4]);
    assert!(outcome.trace.records().iter().all(|r| r.drained && !r.warmup));
    assert_eq!(outcome.samples.len(), 5);

    assert_close(&outcome.matrix, &reference::identity(5), 1e-4);
    let expected = reference::invert(&input, 5).unwrap();
    assert_close(&outcome.inverse, &expected, 1e-4);
    let product = reference::gemm(&input, &outcome.inverse, 5, 5, 5).unwrap();
    assert_close(&product, &reference::identity(5), 1e-4);
}

#[test]
fn reversed_row_order_breaks_the_inverse() {
    let dir = tempfile::tempdir().unwrap();
    let session = session();
    let cache = ProgramCache::new(dir.path());
    let program = cache.get_program(&session, &kernels::INVERSION).unwrap().program;
    let kernel = session.create_kernel(&program, &kernels::INVERSION_SIG).unwrap();
    let mut dispatcher = KernelDispatcher::new(&session);

    let input = m5();
    let mut mat = input.clone();
    let mut inv = reference::identity(5);
    let mut mat_buf = dispatcher.binder().bind_host(&mut mat, AccessMode::ReadWrite).unwrap();
    let mut inv_buf = dispatcher.binder().bind_host(&mut inv, AccessMode::ReadWrite).unwrap();
    let launch = KernelLaunch::new(&kernel, WorkExtent::D1(5))
        .buffer(&mat_buf)
        .buffer(&inv_buf)
        .scalar(ScalarValue::U32(5))
        .scalar(ScalarValue::U32(0))
        .row_override(INVERSION_ROW_ARG);
    for row in (0..5).rev() {
        let done = dispatcher.launch(&launch, Some(row)).unwrap();
        done.wait().unwrap();
        dispatcher.drain().unwrap();
    }
    mat_buf.read_back().unwrap();
    inv_buf.read_back().unwrap();
    drop(mat_buf);
    drop(inv_buf);

    assert_eq!(dispatcher.trace().rows(), vec![4, 3, 2, 1, 0]);
    let expected = reference::invert(&input, 5).unwrap();
    assert!(max_deviation(&inv, &expected) > 1e-2);
}

#[test]
fn single_element_matrix() {
    let dir = tempfile::tempdir().unwrap();
    let session = session();
    let cache = ProgramCache::new(dir.path());
    let outcome = invert_on_device(&session, &cache, &[4.0], 1).unwrap();
    assert_close(&outcome.inverse, &[0.25], 1e-6);
    assert_close(&outcome.matrix, &[1.0], 1e-6);
}
