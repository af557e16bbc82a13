use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use onion_napi::{
    abi::{scope::*, version::napi_get_version},
    Context, EnvConfig, HostFeatures, Worker,
};

const OUT: u32 = 64;

fn setup() -> (Worker, u32) {
    let mut worker = Worker::primary(Context::new(), HostFeatures::default());
    let config = EnvConfig {
        initial_pages: 1,
        maximum_pages: 16,
        ..EnvConfig::default()
    };
    let env = worker.instantiate(&config).map(|env| env.as_raw());
    (worker, env.unwrap_or_default())
}

fn scope_with_handles(c: &mut Criterion) {
    let mut group = c.benchmark_group("handle_scope");
    for count in [1usize, 16, 256] {
        group.bench_function(format!("open_fill_close/{}", count), |b| {
            let (mut worker, env) = setup();
            b.iter(|| {
                napi_open_handle_scope(&mut worker, env, OUT);
                let scope = worker
                    .activate(onion_napi::EnvId::from_raw(env))
                    .map(|mut active| {
                        for _ in 0..count {
                            black_box(active.create_object());
                        }
                        active.env().scopes().current().as_raw()
                    })
                    .unwrap_or_default();
                napi_close_handle_scope(&mut worker, env, scope)
            })
        });
    }
    group.finish();
}

fn escapable_scope(c: &mut Criterion) {
    c.bench_function("escape_handle", |b| {
        b.iter_batched(
            setup,
            |(mut worker, env)| {
                napi_open_escapable_handle_scope(&mut worker, env, OUT);
                let escapee = worker
                    .activate(onion_napi::EnvId::from_raw(env))
                    .and_then(|mut active| {
                        let scope = active.env().scopes().current().as_raw();
                        Ok((scope, active.create_object()?.as_raw()))
                    })
                    .unwrap_or_default();
                napi_escape_handle(&mut worker, env, escapee.0, escapee.1, OUT + 8);
                napi_close_escapable_handle_scope(&mut worker, env, escapee.0)
            },
            BatchSize::SmallInput,
        )
    });
}

fn preamble_round_trip(c: &mut Criterion) {
    let (mut worker, env) = setup();
    c.bench_function("napi_get_version", |b| {
        b.iter(|| napi_get_version(&mut worker, black_box(env), OUT))
    });
}

criterion_group!(benches, scope_with_handles, escapable_scope, preamble_round_trip);
criterion_main!(benches);
