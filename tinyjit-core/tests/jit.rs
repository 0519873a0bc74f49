//! End-to-end tests. These invoke the system C compiler (`TINYJIT_CC`, `CC`
//! or `cc`).

use std::{fs, path::PathBuf, thread, time::Duration};

use tempfile::TempDir;

use tinyjit_core::{
    runtime, Error, Graph, JitConfig, KernelStrategy, NativeModule, PlanConfig, Tensor,
    KERNEL_SYMBOL,
};

const ROWS: usize = 10;

/// A config whose cache lives in a fresh directory, removed when the returned
/// guard drops.
fn config(name: &str) -> (TempDir, JitConfig) {
    let dir = tempfile::Builder::new()
        .prefix(&format!("tinyjit-{name}-"))
        .tempdir()
        .unwrap();
    let cfg = JitConfig::from_env().unwrap().with_cache_dir(dir.path());
    (dir, cfg)
}

fn scenario() -> (Graph, Tensor, Tensor, Tensor) {
    let graph = Graph::empty();
    let a = graph.add_input("A");
    let b = graph.add_input("B");
    let t1 = (&a + &b).unwrap();
    let t2 = (&t1 * &a).unwrap();
    let t3 = b.relu().unwrap();
    let out = (&t2 + &t3).unwrap();
    (graph, a, b, out)
}

#[test]
fn scenario_yields_13_on_every_row() {
    let (graph, a, b, out) = scenario();
    graph.compile().unwrap();
    let (_dir, cfg) = config("scenario");
    let result = graph
        .run(&out, &[(&a, 2.0), (&b, 3.0)], ROWS, &cfg)
        .unwrap();
    assert_eq!(result.scalar(), 13.0);
    assert_eq!(result.rows(), &[13.0; ROWS]);
    assert_eq!(result.arena().len(), graph.arena_size().unwrap());
    assert_eq!(
        graph.evaluate(&out, &[(&a, 2.0), (&b, 3.0)], ROWS).unwrap(),
        result.rows()
    );
}

#[test]
fn diamond_matches_interpreter() {
    let graph = Graph::empty();
    let a = graph.add_input("A");
    let b = graph.add_input("B");
    let s = (&a + &b).unwrap();
    let left = (&s * &a).unwrap();
    let right = s.relu().unwrap();
    let out = (&left + &right).unwrap();
    graph.compile().unwrap();
    let (_dir, cfg) = config("diamond");

    for strategy in [KernelStrategy::Materialize, KernelStrategy::Inline] {
        let source = graph.generate_kernel_with(&out, strategy).unwrap();
        let kernel = runtime::build(&cfg, &source).unwrap();
        for (va, vb) in [(-1.5, 0.5), (2.0, -5.0), (0.25, 4.0)] {
            let inputs = [(&a, va), (&b, vb)];
            let native = graph.execute(&kernel, &inputs, ROWS).unwrap();
            let reference = graph.evaluate(&out, &inputs, ROWS).unwrap();
            assert_eq!(native.rows(), reference.as_slice(), "{strategy:?} A={va} B={vb}");
        }
        kernel.release().unwrap();
    }
}

#[test]
fn identical_source_reuses_cached_module() {
    let (graph, a, b, out) = scenario();
    graph.compile().unwrap();
    let (_dir, cfg) = config("cache");
    let source = graph.generate_kernel(&out).unwrap();

    let first = runtime::build(&cfg, &source).unwrap();
    let module = first.module_path().to_path_buf();
    let built_at = fs::metadata(&module).unwrap().modified().unwrap();
    first.release().unwrap();

    let second = runtime::build(&cfg, &graph.generate_kernel(&out).unwrap()).unwrap();
    assert_eq!(second.module_path(), module.as_path());
    assert_eq!(fs::metadata(&module).unwrap().modified().unwrap(), built_at);
    assert_eq!(second.fingerprint(), source.fingerprint());
    let result = graph.execute(&second, &[(&a, 2.0), (&b, 3.0)], 1).unwrap();
    assert_eq!(result.scalar(), 13.0);
    second.release().unwrap();

    let sources: Vec<PathBuf> = fs::read_dir(&cfg.cache_dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "c"))
        .collect();
    assert_eq!(sources.len(), 1);
}

#[test]
fn missing_compiler_is_a_build_failure() {
    let (graph, _, _, out) = scenario();
    graph.compile().unwrap();
    let (_dir, cfg) = config("no-compiler");
    let cfg = cfg.with_compiler("tinyjit-no-such-compiler");
    let err = runtime::build(&cfg, &graph.generate_kernel(&out).unwrap()).unwrap_err();
    assert!(matches!(err.inner(), Error::BuildFailure { compiler, .. } if compiler == "tinyjit-no-such-compiler"));
}

#[test]
fn rejected_flags_are_a_build_failure() {
    let (graph, _, _, out) = scenario();
    graph.compile().unwrap();
    let (_dir, cfg) = config("bad-flag");
    let cfg = cfg.with_flag("--tinyjit-not-a-flag");
    let err = runtime::build(&cfg, &graph.generate_kernel(&out).unwrap()).unwrap_err();
    match err.inner() {
        Error::BuildFailure { stderr, source_path, .. } => {
            assert!(!stderr.trim().is_empty());
            assert!(source_path.starts_with(&cfg.cache_dir));
        }
        other => panic!("unexpected error {other}"),
    }
}

#[cfg(unix)]
#[test]
fn slow_compiler_times_out() {
    use std::os::unix::fs::PermissionsExt;

    let (graph, _, _, out) = scenario();
    graph.compile().unwrap();
    let (_dir, cfg) = config("slow");
    let script = cfg.cache_dir.join("slow-cc.sh");
    fs::write(&script, "#!/bin/sh\nsleep 5\n").unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

    let cfg = cfg
        .with_compiler(script.to_string_lossy())
        .with_timeout(Duration::from_millis(200));
    let err = runtime::build(&cfg, &graph.generate_kernel(&out).unwrap()).unwrap_err();
    assert!(matches!(err.inner(), Error::BuildTimeout { .. }));
}

#[test]
fn missing_module_is_a_load_failure() {
    let (_dir, cfg) = config("missing-module");
    let path = cfg.cache_dir.join("libtinyjit_missing.so");
    let err = NativeModule::load(&path).unwrap_err();
    assert!(matches!(err.inner(), Error::LoadFailure { path: p, .. } if *p == path));
}

#[test]
fn symbols_resolve_by_exact_name() {
    let (graph, a, b, out) = scenario();
    let plan = graph.compile().unwrap();
    let (_dir, cfg) = config("symbols");
    let kernel = runtime::build(&cfg, &graph.generate_kernel(&out).unwrap()).unwrap();

    let module = NativeModule::load(kernel.module_path()).unwrap();
    let err = module.resolve("fused_kernel_v2").unwrap_err();
    assert!(matches!(err.inner(), Error::SymbolResolutionFailure { symbol, .. } if symbol == "fused_kernel_v2"));

    let entry = module.resolve(KERNEL_SYMBOL).unwrap();
    let mut arena = vec![0.0f32; plan.arena_size()];
    arena[plan.offset(a.id()).unwrap()] = 2.0;
    arena[plan.offset(b.id()).unwrap()] = 3.0;
    unsafe { entry.call(arena.as_mut_ptr(), 1) };
    assert_eq!(arena[plan.offset(out.id()).unwrap()], 13.0);

    module.unload().unwrap();
    kernel.release().unwrap();
}

#[test]
fn rows_beyond_slot_width_overflow() {
    let (graph, a, b, out) = scenario();
    graph
        .compile_with(PlanConfig::default().with_slot_width(16))
        .unwrap();
    let (_dir, cfg) = config("overflow");
    let kernel = runtime::build(&cfg, &graph.generate_kernel(&out).unwrap()).unwrap();

    let err = graph
        .execute(&kernel, &[(&a, 2.0), (&b, 3.0)], 17)
        .unwrap_err();
    assert!(matches!(
        err.inner(),
        Error::ArenaOverflow {
            rows: 17,
            slot_width: 16
        }
    ));
    let full = graph.execute(&kernel, &[(&a, 2.0), (&b, 3.0)], 16).unwrap();
    assert_eq!(full.rows(), &[13.0; 16]);
    kernel.release().unwrap();
}

#[test]
fn bindings_must_name_planned_inputs() {
    let (graph, a, b, out) = scenario();
    graph.compile().unwrap();
    let (_dir, cfg) = config("bindings");
    let kernel = runtime::build(&cfg, &graph.generate_kernel(&out).unwrap()).unwrap();

    let err = graph.execute(&kernel, &[(&out, 1.0)], ROWS).unwrap_err();
    assert!(matches!(err.inner(), Error::UnboundInput { .. }));

    let late = graph.add_input("late");
    let err = graph
        .execute(&kernel, &[(&a, 2.0), (&late, 1.0)], ROWS)
        .unwrap_err();
    assert!(matches!(err.inner(), Error::UnboundInput { label, .. } if label == "late"));

    let other = Graph::empty();
    let stray = other.add_input("stray");
    let err = graph.execute(&kernel, &[(&stray, 1.0)], ROWS).unwrap_err();
    assert!(matches!(err.inner(), Error::ForeignTensor { .. }));

    let ok = graph.execute(&kernel, &[(&a, 2.0), (&b, 3.0)], ROWS).unwrap();
    assert_eq!(ok.scalar(), 13.0);
    kernel.release().unwrap();
}

#[test]
fn stale_kernels_are_refused_after_replanning() {
    let (graph, a, b, out) = scenario();
    graph.compile().unwrap();
    let (_dir, cfg) = config("stale");
    let kernel = runtime::build(&cfg, &graph.generate_kernel(&out).unwrap()).unwrap();

    graph
        .compile_with(PlanConfig::default().with_slot_width(32))
        .unwrap();
    let err = graph
        .execute(&kernel, &[(&a, 2.0), (&b, 3.0)], ROWS)
        .unwrap_err();
    assert!(matches!(err.inner(), Error::Msg(_)));
    kernel.release().unwrap();
}

#[test]
fn late_input_survives_materialized_kernel() {
    let graph = Graph::empty();
    let a = graph.add_input("A");
    let r = a.relu().unwrap();
    let c = graph.add_input("C");
    let out = (&r + &c).unwrap();
    graph.compile().unwrap();
    let (_dir, cfg) = config("late-input");

    for (va, vc) in [(2.0, 0.5), (-4.0, 1.25)] {
        let inputs = [(&a, va), (&c, vc)];
        let native = graph.run(&out, &inputs, ROWS, &cfg).unwrap();
        let reference = graph.evaluate(&out, &inputs, ROWS).unwrap();
        assert_eq!(native.rows(), reference.as_slice(), "A={va} C={vc}");
        let c_slot = native
            .arena()
            .row(graph.get_offset(&c).unwrap(), ROWS)
            .unwrap();
        assert_eq!(c_slot, &[vc; ROWS]);
    }
}

#[test]
fn concurrent_builds_of_one_source_do_not_collide() {
    let (graph, a, b, out) = scenario();
    graph.compile().unwrap();
    let (_dir, cfg) = config("concurrent");
    let source = graph.generate_kernel(&out).unwrap();

    let (shared_cfg, shared_source) = (&cfg, &source);
    thread::scope(|scope| {
        let builds: Vec<_> = (0..4)
            .map(|_| {
                scope.spawn(move || {
                    let kernel = runtime::build(shared_cfg, shared_source).unwrap();
                    let path = kernel.module_path().to_path_buf();
                    kernel.release().unwrap();
                    path
                })
            })
            .collect();
        let paths: Vec<PathBuf> = builds.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(paths.windows(2).all(|pair| pair[0] == pair[1]));
    });

    let leftovers: Vec<PathBuf> = fs::read_dir(&cfg.cache_dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert_eq!(leftovers.len(), 2, "{leftovers:?}");

    let kernel = runtime::build(&cfg, &source).unwrap();
    let result = graph.execute(&kernel, &[(&a, 2.0), (&b, 3.0)], ROWS).unwrap();
    assert_eq!(result.rows(), &[13.0; ROWS]);
    kernel.release().unwrap();
}
