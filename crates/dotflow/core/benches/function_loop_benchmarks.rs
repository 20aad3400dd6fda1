// Dotflow
// Copyright (C) 2025 Synerthink

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Function loop benchmarks
//!
//! Measures the cost of driving continuation chains through the kernel:
//! - chained functions on the invoking thread (passive team)
//! - hand-off between two executor teams
//! - thread scoped object sourcing and unloading per process

use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use dotflow_core::managed_object::managed;
use dotflow_core::{FunctionResult, Kernel, KernelConfig, ManagedFunctionContext, ManagedObjectScope, ManagedObjectUser, TeamKind};
use std::sync::Arc;

const CHAIN_LENGTH: usize = 16;

fn chained_kernel(config: KernelConfig, teams: &[&str]) -> Kernel {
    let mut builder = Kernel::builder(config);
    for step in 0..CHAIN_LENGTH {
        let name = format!("step-{step}");
        let function = builder.function(name, |context: &mut ManagedFunctionContext<'_>| -> FunctionResult {
            let value = context.take_argument::<u64>().unwrap_or_default();
            Ok(Some(Box::new(black_box(value + 1))))
        });
        let function = match teams.get(step % teams.len().max(1)) {
            Some(team) => function.team(*team),
            None => function,
        };
        if step + 1 < CHAIN_LENGTH {
            function.next(format!("step-{}", step + 1));
        }
    }
    let kernel = builder.build().expect("benchmark kernel builds");
    kernel.open().expect("benchmark kernel opens");
    kernel
}

fn bench_chained_functions(c: &mut Criterion) {
    let mut group = c.benchmark_group("function_loop");
    group.throughput(Throughput::Elements(CHAIN_LENGTH as u64));

    let passive = chained_kernel(KernelConfig::default(), &[]);
    group.bench_function("passive_chain", |b| {
        b.iter(|| passive.invoke_process("step-0", Some(Box::new(0u64))).unwrap().wait())
    });

    let config = KernelConfig::default()
        .with_team("left", TeamKind::Fixed { size: 1 })
        .with_team("right", TeamKind::Fixed { size: 1 });
    let alternating = chained_kernel(config, &["left", "right"]);
    group.bench_function("team_hand_off", |b| {
        b.iter(|| alternating.invoke_process("step-0", Some(Box::new(0u64))).unwrap().wait())
    });

    group.finish();
}

fn bench_object_lifecycle(c: &mut Criterion) {
    let mut builder = Kernel::builder(KernelConfig::default());
    let source = Arc::new(|user: ManagedObjectUser| user.set_managed_object(managed(vec![0u8; 64])));
    let buffer = builder.managed_object::<Vec<u8>>("buffer", ManagedObjectScope::Thread, source).reference();
    let read = buffer.clone();
    builder
        .function("use", move |context: &mut ManagedFunctionContext<'_>| -> FunctionResult {
            black_box(context.object(&read)?.len());
            Ok(None)
        })
        .requires(&buffer);
    let kernel = builder.build().expect("benchmark kernel builds");
    kernel.open().expect("benchmark kernel opens");

    let mut group = c.benchmark_group("managed_objects");
    group.throughput(Throughput::Elements(1));
    group.bench_function("thread_object_per_process", |b| b.iter(|| kernel.invoke_process("use", None).unwrap().wait()));
    group.finish();
}

criterion_group!(benches, bench_chained_functions, bench_object_lifecycle);
criterion_main!(benches);
