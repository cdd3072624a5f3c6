use offload_accelerate::harness::{
    run_findmax, run_gemm, run_inversion, run_matvec, GemmDims, RunOptions,
};
use offload_accelerate::{AcceleratorSession, InProcessPlatform, ProgramCache, VerifyPolicy};
use offload_api::QueueProperties;

fn session() -> AcceleratorSession {
    AcceleratorSession::open(&InProcessPlatform::new(), QueueProperties { profiling: true })
        .expect("in-process session")
}

fn options() -> RunOptions {
    RunOptions {
        iterations: 2,
        seed: Some(7),
        verify_policy: VerifyPolicy::Exhaustive,
    }
}

#[test]
fn every_program_passes_and_reuses_its_cache_entry() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    let session = session();
    let cache = ProgramCache::new(dir.path());
    let options = options();

    for _ in 0..2 {
        let reports = vec![
            run_findmax(&session, &cache, 1000, &options).expect("findmax"),
            run_gemm(&session, &cache, GemmDims::padded(16, 16, 16), &options).expect("gemm"),
            run_inversion(&session, &cache, 5, &options).expect("inversion"),
            run_matvec(&session, &cache, 4, 4, &options).expect("matvec"),
        ];
        for report in &reports {
            assert!(report.passed(), "{}: {:?}", report.program, report.lines);
            assert_eq!(report.verdict(), "Passed!");
            assert_eq!(report.device, session.device().name);
        }
    }
    assert_eq!(cache.metrics().counters(), (4, 4));
}

#[test]
fn report_lines_follow_the_console_format() {
    let dir = tempfile::tempdir().unwrap();
    let session = session();
    let cache = ProgramCache::new(dir.path());
    let options = options();

    let matvec = run_matvec(&session, &cache, 4, 4, &options).unwrap();
    assert_eq!(
        matvec.lines[0],
        "correct:84.000000 228.000000 372.000000 516.000000"
    );
    assert_eq!(
        matvec.lines.last().unwrap(),
        "Matrix-vector multiplication successful."
    );

    let inversion = run_inversion(&session, &cache, 5, &options).unwrap();
    assert_eq!(inversion.lines[0], "Matrix dimension : 5 ");
    assert_eq!(inversion.timings.count, 5);

    let gemm = run_gemm(&session, &cache, GemmDims::padded(8, 8, 8), &options).unwrap();
    assert!(gemm.lines[0].starts_with("Run gemm with inputA(w:8, h:8)"));
    assert!(gemm.lines[2].starts_with("gemm kernel execution time:"));
    assert_eq!(gemm.timings.count, 2);

    let findmax = run_findmax(&session, &cache, 256, &options).unwrap();
    assert!(findmax.lines[0].starts_with("gpu result : "));
    assert!(findmax.lines[2].starts_with("cpu result : "));
}

#[test]
fn same_seed_same_inputs() {
    let dir = tempfile::tempdir().unwrap();
    let session = session();
    let cache = ProgramCache::new(dir.path());
    let options = options();
    let first = run_findmax(&session, &cache, 512, &options).unwrap();
    let second = run_findmax(&session, &cache, 512, &options).unwrap();
    assert_eq!(first.lines[0], second.lines[0]);
}
