use offload_accelerate::harness::matvec::{matvec_on_device, sample_inputs};
use offload_accelerate::{AcceleratorSession, InProcessPlatform, ProgramCache};
use offload_api::{OffloadError, QueueProperties};

fn session() -> AcceleratorSession {
    AcceleratorSession::open(&InProcessPlatform::new(), QueueProperties { profiling: true })
        .expect("in-process session")
}

#[test]
fn doubled_matrix_times_tripled_vector() {
    let dir = tempfile::tempdir().unwrap();
    let session = session();
    let cache = ProgramCache::new(dir.path());
    let (matrix, vector) = sample_inputs(4, 4);
    let outcome = matvec_on_device(&session, &cache, &matrix, &vector, 4, 4).unwrap();
    assert_eq!(outcome.result, vec![84.0, 228.0, 372.0, 516.0]);
    assert!(outcome.sample.is_some());
}

#[test]
fn plain_index_matrix() {
    let dir = tempfile::tempdir().unwrap();
    let session = session();
    let cache = ProgramCache::new(dir.path());
    let matrix: Vec<f32> = (0..16).map(|i| i as f32).collect();
    let vector: Vec<f32> = (0..4).map(|j| j as f32 * 3.0).collect();
    let outcome = matvec_on_device(&session, &cache, &matrix, &vector, 4, 4).unwrap();
    assert_eq!(outcome.result, vec![42.0, 114.0, 186.0, 258.0]);
}

#[test]
fn rows_beyond_one_work_group() {
    let dir = tempfile::tempdir().unwrap();
    let session = session();
    let cache = ProgramCache::new(dir.path());
    let (rows, cols) = (130usize, 3usize);
    let matrix = vec![1.0f32; rows * cols];
    let vector = vec![2.0f32; cols];
    let outcome =
        matvec_on_device(&session, &cache, &matrix, &vector, rows as u32, cols as u32).unwrap();
    assert_eq!(outcome.result, vec![6.0; rows]);
}

#[test]
fn short_vector_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let session = session();
    let cache = ProgramCache::new(dir.path());
    let err = matvec_on_device(&session, &cache, &[1.0; 16], &[1.0; 3], 4, 4).unwrap_err();
    assert!(matches!(err, OffloadError::LengthMismatch { expected: 4, found: 3 }));
}
