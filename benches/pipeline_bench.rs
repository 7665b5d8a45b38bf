//! Pipeline Benchmark Suite
//!
//! Measures:
//! - Cost of one `optimize` call per model shape and dtype
//! - Forward latency before and after optimization
//! - Plain vs fused optimizer update steps
//! - Graph capture dispatch after resolution
//!
//! Run with: `cargo bench --bench pipeline_bench`

use std::hint::black_box;
use std::time::{Duration, Instant};

use tuneforge::config::{FeatureOverrides, RuntimeConfig};
use tuneforge::{optimize, DType, Module, OptimizeOptions, Optimized, Optimizer, OptimizerKind, Tensor};

// ============================================================================
// Benchmark Harness
// ============================================================================

struct Benchmark {
    name: String,
    iterations: usize,
    warmup_iterations: usize,
}

impl Benchmark {
    fn new(name: &str, iterations: usize) -> Self {
        Benchmark {
            name: name.to_string(),
            iterations,
            warmup_iterations: iterations.min(5),
        }
    }

    fn run_time<F, R>(&self, mut f: F) -> BenchmarkResult
    where
        F: FnMut() -> R,
    {
        for _ in 0..self.warmup_iterations {
            black_box(f());
        }

        let mut durations = Vec::with_capacity(self.iterations);
        for _ in 0..self.iterations {
            let start = Instant::now();
            black_box(f());
            durations.push(start.elapsed());
        }

        BenchmarkResult {
            name: self.name.clone(),
            durations,
        }
    }
}

struct BenchmarkResult {
    name: String,
    durations: Vec<Duration>,
}

impl BenchmarkResult {
    fn report(&self) {
        let mut sorted = self.durations.clone();
        sorted.sort();
        let total: Duration = sorted.iter().sum();
        let avg = total / sorted.len().max(1) as u32;
        let p50 = sorted[sorted.len() / 2];
        let p95 = sorted[(sorted.len() * 95) / 100];

        println!("\n=== {} ===", self.name);
        println!("Iterations: {}", sorted.len());
        println!("Average: {:.3} ms", avg.as_secs_f64() * 1000.0);
        println!("P50:     {:.3} ms", p50.as_secs_f64() * 1000.0);
        println!("P95:     {:.3} ms", p95.as_secs_f64() * 1000.0);
    }

    fn avg_ms(&self) -> f64 {
        let total: Duration = self.durations.iter().sum();
        (total / self.durations.len().max(1) as u32).as_secs_f64() * 1000.0
    }
}

// ============================================================================
// Test Data Generation
// ============================================================================

fn mlp(width: usize, training: bool) -> Module {
    let mut m = Module::sequential(
        "mlp",
        vec![
            Module::linear("fc1", width, width * 2, 1).expect("fc1"),
            Module::batch_norm("bn", width * 2)
                .and_then(|bn| bn.with_random_stats(2))
                .expect("bn"),
            Module::relu("act"),
            Module::dropout("drop", 0.1),
            Module::linear("fc2", width * 2, width, 3).expect("fc2"),
        ],
    );
    m.train(training);
    m
}

fn conv_net(channels: usize) -> Module {
    let mut m = Module::sequential(
        "convnet",
        vec![
            Module::conv("conv", 2, 3, channels, 3, 4).expect("conv"),
            Module::batch_norm("bn", channels)
                .and_then(|bn| bn.with_random_stats(5))
                .expect("bn"),
            Module::relu("act"),
        ],
    );
    m.eval();
    m
}

fn input(shape: Vec<usize>) -> Tensor {
    let n: usize = shape.iter().product();
    let values = (0..n).map(|i| (i as f32 * 0.01).sin()).collect();
    Tensor::from_vec(values, shape).expect("input")
}

fn options() -> OptimizeOptions {
    OptimizeOptions::new().with_runtime(RuntimeConfig::default())
}

fn seed_grads(model: &mut Module) {
    for p in model.parameters_mut() {
        let n = p.data.numel();
        let values = (0..n).map(|i| ((i % 7) as f32 - 3.0) * 0.01).collect();
        let grad = Tensor::from_vec(values, p.shape().to_vec()).expect("grad");
        p.set_grad(grad.to_dtype(p.dtype()));
    }
}

// ============================================================================
// Benchmarks
// ============================================================================

fn benchmark_optimize_call() {
    println!("\n[optimize() cost]");
    println!("=================");

    for width in [32, 128, 256] {
        let model = mlp(width, false);
        for dtype in [DType::F32, DType::BF16] {
            let bench = Benchmark::new(&format!("optimize mlp width={} {}", width, dtype), 20);
            let result = bench.run_time(|| optimize(&model, None, options().with_dtype(dtype)));
            result.report();
        }
    }

    let model = conv_net(32);
    Benchmark::new("optimize convnet channels=32", 20)
        .run_time(|| optimize(&model, None, options()))
        .report();
}

fn benchmark_forward() {
    println!("\n[Forward latency]");
    println!("=================");

    for width in [64, 256] {
        let model = mlp(width, false);
        let x = input(vec![16, width]);
        let eager = Benchmark::new(&format!("eager mlp width={}", width), 50).run_time(|| model.forward(&x));

        let optimized = match optimize(&model, None, options()) {
            Ok(Optimized::Inference(m)) => m,
            Ok(Optimized::Training(..)) | Err(_) => {
                println!("skipping width={}: optimize failed", width);
                continue;
            }
        };
        let tuned = Benchmark::new(&format!("optimized mlp width={}", width), 50).run_time(|| optimized.forward(&x));

        eager.report();
        tuned.report();
        println!("Speedup: {:.2}x", eager.avg_ms() / tuned.avg_ms().max(1e-9));
    }
}

fn benchmark_update_step() {
    println!("\n[Optimizer update]");
    println!("==================");

    let model = mlp(128, true);
    let opt = Optimizer::for_model(OptimizerKind::adam(), &model, 1e-3);

    for fused in [false, true] {
        let overrides = FeatureOverrides::new()
            .fuse_update_step(fused)
            .replace_dropout_with_identity(false);
        let (mut m, mut o) = match optimize(&model, Some(&opt), options().with_overrides(overrides)) {
            Ok(Optimized::Training(m, o)) => (m, o),
            _ => {
                println!("skipping fused={}: optimize failed", fused);
                continue;
            }
        };
        seed_grads(m.module_mut());
        let label = if fused { "fused adam step" } else { "plain adam step" };
        Benchmark::new(label, 50).run_time(|| o.step(m.module_mut())).report();
    }
}

fn benchmark_capture_dispatch() {
    println!("\n[Graph capture dispatch]");
    println!("========================");

    let model = mlp(128, false);
    let x = input(vec![8, 128]);
    let overrides = FeatureOverrides::new().graph_mode(true);
    let captured = match optimize(&model, None, options().with_overrides(overrides)) {
        Ok(Optimized::Inference(m)) => m,
        _ => {
            println!("skipping: optimize failed");
            return;
        }
    };

    let first = Instant::now();
    black_box(captured.forward(&x).ok());
    println!("First call (resolution): {:.3} ms", first.elapsed().as_secs_f64() * 1000.0);
    println!("State: {:?}", captured.capture_state());

    Benchmark::new("captured forward", 50).run_time(|| captured.forward(&x)).report();
}

fn main() {
    println!("====================================");
    println!("tuneforge Pipeline Benchmark Suite");
    println!("====================================");

    benchmark_optimize_call();
    benchmark_forward();
    benchmark_update_step();
    benchmark_capture_dispatch();

    println!("\n====================================");
    println!("Done");
    println!("====================================");
}
