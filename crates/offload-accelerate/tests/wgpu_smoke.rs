#![cfg(feature = "wgpu")]

use offload_accelerate::backend::wgpu::{WgpuPlatform, WgpuProviderOptions};
use offload_accelerate::harness::{findmax_on_device, matvec_on_device};
use offload_accelerate::{resolver, AcceleratorSession, ProgramCache};
use offload_api::QueueProperties;

fn gpu_session() -> Option<AcceleratorSession> {
    let platform = WgpuPlatform::new(&WgpuProviderOptions::default());
    if platform.is_empty() {
        eprintln!("skipping: no wgpu adapters");
        return None;
    }
    let device = match resolver::resolve(&platform) {
        Ok(device) => device,
        Err(err) => {
            eprintln!("skipping: {err}");
            return None;
        }
    };
    AcceleratorSession::with_device(&platform, device, QueueProperties { profiling: true }).ok()
}

#[test]
fn findmax_and_matvec_on_first_gpu() {
    let Some(session) = gpu_session() else {
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let cache = ProgramCache::new(dir.path());

    let data: Vec<f32> = (0..1000).map(|i| ((i * 37) % 101) as f32).collect();
    let max = findmax_on_device(&session, &cache, &data).expect("findmax");
    assert_eq!(max.value, 100.0);

    let matrix: Vec<f32> = (0..16).map(|i| i as f32 * 2.0).collect();
    let vector: Vec<f32> = (0..4).map(|j| j as f32 * 3.0).collect();
    let out = matvec_on_device(&session, &cache, &matrix, &vector, 4, 4).expect("matvec");
    assert_eq!(out.result, vec![84.0, 228.0, 372.0, 516.0]);

    // Second load comes from the cached SPIR-V image.
    let again = findmax_on_device(&session, &cache, &data).expect("findmax from cache");
    assert!(again.origin.is_hit());
    assert_eq!(again.value, 100.0);
}
