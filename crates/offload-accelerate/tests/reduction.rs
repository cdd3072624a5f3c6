use offload_accelerate::harness::findmax_on_device;
use offload_accelerate::kernels::FINDMAX_LOCAL_SIZE;
use offload_accelerate::{reference, AcceleratorSession, InProcessPlatform, ProgramCache};
use offload_api::QueueProperties;
use proptest::prelude::*;

fn session() -> AcceleratorSession {
    AcceleratorSession::open(&InProcessPlatform::new(), QueueProperties { profiling: true })
        .expect("in-process session")
}

fn device_max(data: &[f32]) -> f32 {
    let dir = tempfile::tempdir().unwrap();
    let session = session();
    let cache = ProgramCache::new(dir.path());
    findmax_on_device(&session, &cache, data)
        .expect("findmax")
        .value
}

#[test]
fn boundary_lengths_around_the_work_group() {
    for len in [1usize, 2, 127, 128, 129, 255, 256, 1000, 1024] {
        let data: Vec<f32> = (0..len).map(|i| ((i * 37) % 101) as f32).collect();
        let expected = reference::max(&data).unwrap();
        assert_eq!(device_max(&data), expected, "len {len}");
    }
}

#[test]
fn maximum_in_last_partial_group() {
    let mut data = vec![1.0f32; 300];
    data[299] = 5.0;
    assert_eq!(device_max(&data), 5.0);
}

#[test]
fn all_equal_and_all_negative_inputs() {
    assert_eq!(device_max(&[3.5; 200]), 3.5);
    let negative: Vec<f32> = (0..130).map(|i| -1000.0 - i as f32).collect();
    assert_eq!(device_max(&negative), -1000.0);
}

#[test]
fn one_partial_per_group() {
    let dir = tempfile::tempdir().unwrap();
    let session = session();
    let cache = ProgramCache::new(dir.path());
    let data: Vec<f32> = (0..1024).map(|i| i as f32).collect();
    let outcome = findmax_on_device(&session, &cache, &data).unwrap();
    assert_eq!(outcome.partials.len(), (1024 / FINDMAX_LOCAL_SIZE) as usize);
    assert_eq!(outcome.partials[0], 127.0);
    assert_eq!(outcome.value, 1023.0);
    assert!(outcome.sample.is_some());
}

#[test]
fn empty_input_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let session = session();
    let cache = ProgramCache::new(dir.path());
    assert!(findmax_on_device(&session, &cache, &[]).is_err());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn matches_host_scan(data in prop::collection::vec(-1.0e6f32..1.0e6, 1..2000)) {
        let expected = reference::max(&data).unwrap();
        prop_assert_eq!(device_max(&data), expected);
    }
}
