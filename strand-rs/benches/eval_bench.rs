use criterion::{black_box, criterion_group, criterion_main, Criterion};

use strand::engine::{ExecutionContext, Scheduler, ScriptingDomain};

fn bench_eval(c: &mut Criterion) {
    let domain = ScriptingDomain::with_standard_functions();
    let ctx = ExecutionContext::new(domain);
    let scheduler = Scheduler::new();

    let mut g = c.benchmark_group("evaluate");

    g.bench_function("arithmetic", |b| {
        b.iter(|| scheduler.evaluate(black_box("12 * 3 + 7 - 10 / 4"), &ctx))
    });

    g.bench_function("string_builtins", |b| {
        b.iter(|| {
            scheduler.evaluate(
                black_box("uppercase(substr('the quick brown fox', 4, 5)) + strlen('abc')"),
                &ctx,
            )
        })
    });

    g.bench_function("loop_sum", |b| {
        b.iter(|| {
            scheduler.evaluate(
                black_box(
                    "var i := 0\nvar sum := 0\nwhile (i < 100) { sum := sum + i; i := i + 1 }\nsum",
                ),
                &ctx,
            )
        })
    });

    g.bench_function("function_calls", |b| {
        scheduler.evaluate(
            "function fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2) }",
            &ctx,
        );
        b.iter(|| scheduler.evaluate(black_box("fib(10)"), &ctx))
    });

    g.finish();
}

criterion_group!(benches, bench_eval);
criterion_main!(benches);
