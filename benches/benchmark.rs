// benches/benchmark.rs
use criterion::{criterion_group, criterion_main, Criterion};
use effect_rail::cause::Exit;
use effect_rail::effect::{for_each_par, Effect};
use effect_rail::fiber::Runtime;
use effect_rail::queue::Queue;
use effect_rail::stream::sink::fold;
use effect_rail::stream::Stream;
use std::hint::black_box;
use tokio::runtime::Runtime as TokioRuntime;

fn tokio_rt() -> TokioRuntime {
    TokioRuntime::new().expect("tokio runtime")
}

// 1. Construction/interpretation benchmark: a pure sequential chain with no
// concurrency, no queues — the interpreter's own per-step overhead.
fn bench_effect_map_chain(c: &mut Criterion) {
    let rt = tokio_rt();
    c.bench_function("effect_map_chain_10", |b| {
        b.iter(|| {
            let mut eff: Effect<String, i32> = Effect::succeed(0);
            for _ in 0..10 {
                eff = eff.map(|x| x + 1);
            }
            black_box(rt.block_on(eff.run_default()))
        })
    });
}

// 2. for_each_par fan-out at varying parallelism over a fixed item count,
// against a baseline sequential for_each built from map/flat_map folding.
fn bench_for_each_par_fan_out(c: &mut Criterion) {
    let rt = tokio_rt();
    let items: Vec<i32> = (0..200).collect();

    c.bench_function("for_each_par_width_4", |b| {
        b.iter(|| {
            let eff = for_each_par(
                black_box(items.clone()),
                |i| Effect::<String, i32>::succeed(i * 2),
                4,
            );
            black_box(rt.block_on(eff.run_default()))
        })
    });

    c.bench_function("for_each_par_width_16", |b| {
        b.iter(|| {
            let eff = for_each_par(
                black_box(items.clone()),
                |i| Effect::<String, i32>::succeed(i * 2),
                16,
            );
            black_box(rt.block_on(eff.run_default()))
        })
    });

    c.bench_function("for_each_par_width_64", |b| {
        b.iter(|| {
            let eff = for_each_par(
                black_box(items.clone()),
                |i| Effect::<String, i32>::succeed(i * 2),
                64,
            );
            black_box(rt.block_on(eff.run_default()))
        })
    });
}

// 3. Bounded Queue throughput: a single producer/consumer pair moving a
// fixed batch through queues of different capacities.
fn bench_queue_throughput(c: &mut Criterion) {
    let rt = tokio_rt();

    for capacity in [0usize, 1, 64] {
        c.bench_function(&format!("queue_throughput_cap_{capacity}"), |b| {
            b.iter(|| {
                rt.block_on(async {
                    let q: Queue<i32> = Queue::new(capacity);
                    let producer_q = q.clone();
                    let producer = tokio::spawn(async move {
                        for i in 0..500 {
                            producer_q.send(i).await.unwrap();
                        }
                        producer_q.close();
                    });
                    let mut count = 0;
                    while q.receive().await.is_ok() {
                        count += 1;
                    }
                    producer.await.unwrap();
                    black_box(count)
                })
            })
        });
    }
}

// 4. Stream throughput: a fixed-size batch through a single map stage versus
// a three-stage pipeline, both drained by `fold`.
fn bench_stream_throughput(c: &mut Criterion) {
    let rt = tokio_rt();
    let items: Vec<i32> = (0..500).collect();

    c.bench_function("stream_single_map_stage", |b| {
        b.iter(|| {
            let s: Stream<i32, String> = Stream::from_iterable(black_box(items.clone())).map(|x| x + 1);
            let eff = s.run(fold(0i64, |acc, x| acc + x as i64));
            black_box(rt.block_on(eff.run_default()))
        })
    });

    c.bench_function("stream_three_stage_pipeline", |b| {
        b.iter(|| {
            let s: Stream<i32, String> = Stream::from_iterable(black_box(items.clone()))
                .map(|x| x + 1)
                .map(|x| x * 2)
                .map(|x| x - 1);
            let eff = s.run(fold(0i64, |acc, x| acc + x as i64));
            black_box(rt.block_on(eff.run_default()))
        })
    });
}

// 5. Fiber fork/join overhead: spawning and joining N trivial fibers under a
// shared Runtime versus running the same work with for_each_par.
fn bench_fiber_fork_join(c: &mut Criterion) {
    let rt = tokio_rt();

    c.bench_function("fiber_fork_join_100", |b| {
        b.iter(|| {
            rt.block_on(async {
                let runtime = Runtime::default();
                let mut fibers = Vec::with_capacity(100);
                for i in 0..100 {
                    fibers.push(runtime.fork(Effect::<String, i32>::succeed(i), None));
                }
                let mut total = 0i32;
                for fiber in fibers {
                    if let Exit::Success(v) = fiber.await_().await {
                        total += v;
                    }
                }
                black_box(total)
            })
        })
    });
}

criterion_group!(
    benches,
    bench_effect_map_chain,
    bench_for_each_par_fan_out,
    bench_queue_throughput,
    bench_stream_throughput,
    bench_fiber_fork_join,
);
criterion_main!(benches);
