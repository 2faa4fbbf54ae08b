//! The streaming-mode guard as seen from the public API: scoping, nesting,
//! thread locality, and the engine entering it for tile backends.

mod support;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use simdmm_kernels::common::MicrokernelKind;
use simdmm_kernels::{
    Activation, HwOuterProductKernel, Int8Weights, MatMulEngine, Microkernel, NibbleWeights, StreamingModeGuard,
    Tuning, WorkerPool, quantize_int8_weights, quantize_nf4_weights,
};
use support::{assert_close, lcg_values, pool, reference_matmul, transpose};

type SerialFn = fn(&MatMulEngine, &[f32], &[f32], &mut [f32], usize, usize, usize);
type ParallelFn = fn(&MatMulEngine, &WorkerPool, &[f32], &[f32], &mut [f32], usize, usize, usize);

fn on_fresh_thread<R: Send + 'static>(f: impl FnOnce() -> R + Send + 'static) -> R {
    std::thread::spawn(f).join().expect("test thread panicked")
}

#[test]
fn guard_is_scoped_and_nests() {
    on_fresh_thread(|| {
        assert!(!StreamingModeGuard::is_active());
        let outer = StreamingModeGuard::acquire();
        {
            let _inner = StreamingModeGuard::acquire();
            assert_eq!(StreamingModeGuard::depth(), 2);
        }
        assert_eq!(StreamingModeGuard::depth(), 1);
        drop(outer);
        assert_eq!(StreamingModeGuard::depth(), 0);
    });
}

#[test]
fn guard_state_is_per_thread() {
    on_fresh_thread(|| {
        let _g = StreamingModeGuard::acquire();
        let other = std::thread::spawn(StreamingModeGuard::is_active).join().expect("join");
        assert!(!other);
        assert!(StreamingModeGuard::is_active());
    });
}

#[test]
fn guard_released_on_unwind() {
    on_fresh_thread(|| {
        let result = std::panic::catch_unwind(|| {
            let _g = StreamingModeGuard::acquire();
            panic!("tile aborted");
        });
        assert!(result.is_err());
        assert!(!StreamingModeGuard::is_active());
    });
}

/// Portable arithmetic that records whether each tile ran inside a guard.
#[derive(Default)]
struct GuardCheckingKernel {
    calls: AtomicUsize,
    unguarded: AtomicUsize,
}

impl GuardCheckingKernel {
    fn record(&self) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if !StreamingModeGuard::is_active() {
            self.unguarded.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Assert that `op` reached the kernel and never outside a guard, then
    /// reset the counters.
    fn assert_all_guarded(&self, op: &str) {
        let calls = self.calls.swap(0, Ordering::Relaxed);
        let unguarded = self.unguarded.swap(0, Ordering::Relaxed);
        assert!(calls > 0, "{op}: kernel never called");
        assert_eq!(unguarded, 0, "{op}: {unguarded} of {calls} kernel calls ran outside a guard");
    }
}

fn guard_checking_engine() -> (Arc<GuardCheckingKernel>, MatMulEngine) {
    let kernel = Arc::new(GuardCheckingKernel::default());
    // parallel entry points split even tiny problems
    let engine = MatMulEngine::new(kernel.clone(), Tuning { min_parallel_ops: 0, ..Tuning::default() });
    assert!(engine.kernel().requires_streaming_mode());
    (kernel, engine)
}

impl Microkernel for GuardCheckingKernel {
    fn name(&self) -> &'static str {
        "guard-checking"
    }

    fn kind(&self) -> MicrokernelKind {
        MicrokernelKind::HwOuterProduct
    }

    fn is_available(&self) -> bool {
        true
    }

    fn lanes_f32(&self) -> usize {
        4
    }

    fn axpy_f32(&self, a: f32, b: &[f32], acc: &mut [f32]) {
        self.record();
        for (o, &x) in acc.iter_mut().zip(b) {
            *o += a * x;
        }
    }

    fn axpy_f64(&self, a: f64, b: &[f64], acc: &mut [f64]) {
        self.record();
        for (o, &x) in acc.iter_mut().zip(b) {
            *o += a * x;
        }
    }

    fn dot_f32(&self, a: &[f32], b: &[f32]) -> f32 {
        self.record();
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    fn dot_f64(&self, a: &[f64], b: &[f64]) -> f64 {
        self.record();
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }
}

#[test]
fn engine_wraps_streaming_kernels_in_a_guard() {
    on_fresh_thread(|| {
        let (kernel, engine) = guard_checking_engine();
        let workers = pool(3);
        let (m, n, k) = (6, 10, 7);
        let a = lcg_values(m * k, 1);
        let b = lcg_values(k * n, 2);
        let bt = transpose(&b, k, n);
        let expected = reference_matmul(&a, &b, m, n, k);

        let serial: [(&str, SerialFn, &[f32]); 5] = [
            ("matmul", MatMulEngine::matmul::<f32>, b.as_slice()),
            ("blocked_matmul", MatMulEngine::blocked_matmul::<f32>, b.as_slice()),
            ("packed_matmul", MatMulEngine::packed_matmul::<f32>, b.as_slice()),
            ("matmul_klast", MatMulEngine::matmul_klast::<f32>, bt.as_slice()),
            ("blocked_matmul_klast", MatMulEngine::blocked_matmul_klast::<f32>, bt.as_slice()),
        ];
        for (op, run, rhs) in serial {
            let mut c = vec![0.0f32; m * n];
            run(&engine, &a, rhs, &mut c, m, n, k);
            assert_close(&c, &expected, 1e-4);
            kernel.assert_all_guarded(op);
        }

        let parallel: [(&str, ParallelFn, &[f32]); 7] = [
            ("parallel_matmul", MatMulEngine::parallel_matmul::<f32>, b.as_slice()),
            ("parallel_matmul_fine_grained", MatMulEngine::parallel_matmul_fine_grained::<f32>, b.as_slice()),
            ("parallel_packed_matmul", MatMulEngine::parallel_packed_matmul::<f32>, b.as_slice()),
            ("matmul_auto", MatMulEngine::matmul_auto::<f32>, b.as_slice()),
            ("parallel_matmul_klast", MatMulEngine::parallel_matmul_klast::<f32>, bt.as_slice()),
            ("parallel_matmul_klast_fine_grained", MatMulEngine::parallel_matmul_klast_fine_grained::<f32>, bt.as_slice()),
            ("matmul_klast_auto", MatMulEngine::matmul_klast_auto::<f32>, bt.as_slice()),
        ];
        for (op, run, rhs) in parallel {
            let mut c = vec![0.0f32; m * n];
            run(&engine, &workers, &a, rhs, &mut c, m, n, k);
            assert_close(&c, &expected, 1e-4);
            kernel.assert_all_guarded(op);
        }

        assert!(!StreamingModeGuard::is_active());
    });
}

#[test]
fn auto_dispatch_strategies_run_inside_a_guard() {
    on_fresh_thread(|| {
        let (kernel, engine) = guard_checking_engine();
        // every problem clears the streaming threshold
        let tuning = Tuning { small_threshold: 0, rows_per_strip: 4, ..engine.tuning().clone() };
        let engine = engine.with_tuning(tuning);
        let workers = pool(2);
        for (m, n, k) in [(1, 9, 5), (3, 8, 4), (24, 6, 5)] {
            let a = lcg_values(m * k, 7);
            let b = lcg_values(k * n, 8);
            let expected = reference_matmul(&a, &b, m, n, k);
            let strategy = engine.choose_strategy(m, n, k);

            let mut c = vec![0.0f32; m * n];
            engine.matmul_auto(&workers, &a, &b, &mut c, m, n, k);
            assert_close(&c, &expected, 1e-4);
            kernel.assert_all_guarded(&format!("matmul_auto via {strategy}"));

            let mut c = vec![0.0f32; m * n];
            engine.matmul_klast_auto(&workers, &a, &transpose(&b, k, n), &mut c, m, n, k);
            assert_close(&c, &expected, 1e-4);
            kernel.assert_all_guarded(&format!("matmul_klast_auto via {strategy}"));
        }
    });
}

#[test]
fn fused_kernels_run_inside_a_guard() {
    on_fresh_thread(|| {
        let (kernel, engine) = guard_checking_engine();
        let workers = pool(3);
        let g = 16;

        // 3×32×48 is not eligible for the tile path (64×64×64 is)
        for (m, k, n) in [(3, 32, 48), (64, 64, 64)] {
            let tile_path = engine.outer_product_eligible(m, k, n);
            assert_eq!(tile_path, m == 64);
            let input = lcg_values(m * k, 5);
            let w = lcg_values(k * n, 6);
            let (codes, scales) = quantize_int8_weights(&w, k, n, g).expect("int8 weights");
            let int8 = Int8Weights::new(&codes, &scales, k, n, g).expect("int8 descriptor");
            let (packed, nf_scales) = quantize_nf4_weights(&w, k, n, g).expect("nf4 weights");
            let nf4 = NibbleWeights::nf4(&packed, &nf_scales, k, n, g).expect("nf4 descriptor");
            let mut out = vec![0.0f32; m * n];

            engine.fused_int8_matmul_act(&input, &int8, None, &mut out, m, Activation::Silu);
            kernel.assert_all_guarded(&format!("fused_int8_matmul_act {m}x{k}x{n}"));
            engine.parallel_fused_int8_matmul_act(&workers, &input, &int8, None, &mut out, m, Activation::Silu);
            kernel.assert_all_guarded(&format!("parallel_fused_int8_matmul_act {m}x{k}x{n}"));
            engine.fused_nf4_matmul_act(&input, &nf4, None, &mut out, m, Activation::Gelu);
            kernel.assert_all_guarded(&format!("fused_nf4_matmul_act {m}x{k}x{n}"));
            engine.fused_nf4_matmul_swiglu(&input, &nf4, &nf4, &mut out, m);
            kernel.assert_all_guarded(&format!("fused_nf4_matmul_swiglu {m}x{k}x{n}"));
            engine.parallel_fused_nf4_matmul_swiglu(&workers, &input, &nf4, &nf4, &mut out, m);
            kernel.assert_all_guarded(&format!("parallel_fused_nf4_matmul_swiglu {m}x{k}x{n}"));
        }
        assert!(!StreamingModeGuard::is_active());
    });
}

#[test]
fn hw_kernel_matmul_matches_reference() {
    let engine = MatMulEngine::new(Arc::new(HwOuterProductKernel::default()), Tuning::default());
    let (m, n, k) = (33, 48, 20);
    let a = lcg_values(m * k, 3);
    let b = lcg_values(k * n, 4);
    let mut c = vec![0.0f32; m * n];
    engine.packed_matmul(&a, &b, &mut c, m, n, k);
    assert_close(&c, &reference_matmul(&a, &b, m, n, k), 1e-4);
    assert_eq!(StreamingModeGuard::depth(), 0);
}
