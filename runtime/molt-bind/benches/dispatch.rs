use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use molt_bind::abi::{call, call_method, getattr, new_int, new_str};
use molt_bind::{ModuleBuilder, ObjRef, method, native_class, with_gil};

#[derive(Clone)]
struct Tally {
    total: i64,
}
native_class!(Tally);

fn bench_module() -> ObjRef {
    let mut module = ModuleBuilder::new("bench_dispatch");
    {
        let mut tally = module.class::<Tally>("Tally").unwrap();
        tally.constructor(|| Tally { total: 0 }).unwrap();
        method!(tally, "add", |t: &mut Tally, x: i64| {
            t.total += x;
            t.total
        })
        .unwrap();
        method!(tally, "add", |t: &mut Tally, s: String| {
            t.total += s.len() as i64;
            t.total
        })
        .unwrap();
        tally.finalize().unwrap();
    }
    module
        .add_function("join", |a: String, b: &str| format!("{a}{b}"))
        .unwrap();
    with_gil(|py| module.finalize(py).unwrap())
}

fn bench_dispatch(c: &mut Criterion) {
    let module = bench_module();
    let mut group = c.benchmark_group("dispatch");
    with_gil(|py| {
        let ty = getattr(py, module.borrow(), "Tally").unwrap();
        let tally = call(py, ty.borrow(), &[]).unwrap();
        let one = new_int(py, 1);
        let word = new_str(py, "abc");
        let join = getattr(py, module.borrow(), "join").unwrap();

        group.bench_function("method_first_overload", |b| {
            b.iter(|| black_box(call_method(py, tally.borrow(), "add", &[one.borrow()]).unwrap()));
        });
        group.bench_function("method_second_overload", |b| {
            b.iter(|| black_box(call_method(py, tally.borrow(), "add", &[word.borrow()]).unwrap()));
        });
        group.bench_function("free_function_strings", |b| {
            b.iter(|| {
                black_box(call(py, join.borrow(), &[word.borrow(), word.borrow()]).unwrap())
            });
        });
    });
    group.finish();
}

criterion_group!(dispatch_benches, bench_dispatch);
criterion_main!(dispatch_benches);
