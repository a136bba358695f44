//! Step-cycle benchmarks for the state kernel and the TD agent
//!
//! Run with: cargo bench --bench kernel_step

use cephalus_core::{
    AgentConfig, InputPredictionProvider, KernelConfig, ObservationInputProvider,
    ObservationSource, StateKernel, TDAgent,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ndarray::Array1;

struct Ramp {
    width: usize,
    t: f32,
}

impl ObservationSource for Ramp {
    fn observe(&mut self) -> Option<Array1<f32>> {
        self.t += 0.01;
        Some(Array1::from_shape_fn(self.width, |i| (self.t + i as f32).sin()))
    }
}

fn configured_kernel(state_width: usize, input_width: usize) -> StateKernel<Ramp> {
    let mut kernel = StateKernel::new();
    kernel
        .add_module(ObservationInputProvider::new())
        .expect("observation provider");
    kernel
        .add_module(InputPredictionProvider::new())
        .expect("input prediction provider");
    kernel
        .configure(KernelConfig::new(state_width, input_width))
        .expect("valid config");
    kernel
}

/// Benchmark one step, including training of the previous frame
fn bench_kernel_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("kernel_step");
    for &state_width in &[8usize, 32, 128] {
        group.bench_with_input(
            BenchmarkId::from_parameter(state_width),
            &state_width,
            |b, &state_width| {
                let mut kernel = configured_kernel(state_width, 4);
                let mut env = Ramp { width: 4, t: 0.0 };
                let mut frame = kernel.step(&mut env, None).expect("first step");
                b.iter(|| {
                    let next = kernel
                        .step(&mut env, Some(&mut frame))
                        .expect("step");
                    frame = black_box(next);
                });
            },
        );
    }
    group.finish();
}

/// Benchmark a full choose/reward cycle of the TD agent on a fixed state
fn bench_td_cycle(c: &mut Criterion) {
    let template = KernelConfig::default().model_template;
    let mut agent =
        TDAgent::from_config(&AgentConfig::default(), &template, 16, 4).expect("agent");
    let state = cephalus_core::Var::vector(Array1::from_elem(16, 0.1));

    c.bench_function("td_choose_and_reward", |b| {
        b.iter(|| {
            let action = agent.choose_action(&state).expect("choose");
            black_box(agent.accept_reward(action as f32 * 0.1).expect("reward"));
        });
    });
}

criterion_group!(benches, bench_kernel_step, bench_td_cycle);
criterion_main!(benches);
