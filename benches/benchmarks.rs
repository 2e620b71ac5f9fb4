use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;

use filament::runtime::ReactiveRuntime;
use filament::{create_effect, flush_effects, Memo, Signal};

fn signal_creation_benchmark(c: &mut Criterion) {
    let runtime = ReactiveRuntime::new();
    ReactiveRuntime::with_runtime(runtime, || {
        c.bench_function("signal_creation", |b| {
            b.iter(|| {
                let signal: Signal<i32> = Signal::new(black_box(42));
                signal
            });
        });
    });
}

fn signal_read_benchmark(c: &mut Criterion) {
    let runtime = ReactiveRuntime::new();
    ReactiveRuntime::with_runtime(runtime, || {
        let signal: Signal<i32> = Signal::new(42);

        c.bench_function("signal_read", |b| {
            b.iter(|| {
                black_box(signal.get());
            });
        });
    });
}

fn signal_write_benchmark(c: &mut Criterion) {
    let runtime = ReactiveRuntime::new();
    ReactiveRuntime::with_runtime(runtime, || {
        let signal: Signal<i32> = Signal::new(0);

        c.bench_function("signal_write", |b| {
            let mut i = 0;
            b.iter(|| {
                signal.set(black_box(i));
                i += 1;
            });
        });
    });
}

fn memo_cached_read_benchmark(c: &mut Criterion) {
    let runtime = ReactiveRuntime::new();
    ReactiveRuntime::with_runtime(runtime, || {
        let a: Signal<i32> = Signal::new(5);
        let b: Signal<i32> = Signal::new(10);

        let sum = Memo::new({
            let a = a.clone();
            let b = b.clone();
            move || a.get() + b.get()
        });

        c.bench_function("memo_cached_read", |b| {
            b.iter(|| {
                black_box(sum.get());
            });
        });
    });
}

fn memo_revalidation_benchmark(c: &mut Criterion) {
    let runtime = ReactiveRuntime::new();
    ReactiveRuntime::with_runtime(runtime, || {
        let source: Signal<i32> = Signal::new(0);
        let doubled = Memo::new({
            let source = source.clone();
            move || source.get() * 2
        });

        c.bench_function("memo_revalidation", |b| {
            let mut i = 0;
            b.iter(|| {
                source.set(black_box(i));
                black_box(doubled.get());
                i += 1;
            });
        });
    });
}

fn effect_flush_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("effect_flush");

    for effect_count in [1, 10, 100].iter() {
        let runtime = ReactiveRuntime::new();
        ReactiveRuntime::with_runtime(runtime, || {
            let source: Signal<usize> = Signal::new(0);
            let effects: Vec<_> = (0..*effect_count)
                .map(|_| {
                    create_effect({
                        let source = source.clone();
                        move || {
                            black_box(source.get());
                        }
                    })
                })
                .collect();
            flush_effects().unwrap();

            group.bench_with_input(
                BenchmarkId::from_parameter(effect_count),
                effect_count,
                |b, _| {
                    let mut i = 0;
                    b.iter(|| {
                        source.set(black_box(i));
                        flush_effects().unwrap();
                        i += 1;
                    });
                },
            );
            drop(effects);
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    signal_creation_benchmark,
    signal_read_benchmark,
    signal_write_benchmark,
    memo_cached_read_benchmark,
    memo_revalidation_benchmark,
    effect_flush_benchmark,
);
criterion_main!(benches);
