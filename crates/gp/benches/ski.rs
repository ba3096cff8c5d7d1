use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use dkgp_gp::{GridInterpolationKernel, Kernel, RbfKernel, ScaleKernel};
use ndarray::{Array, Array1};
use ndarray_rand::rand::SeedableRng;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand_xoshiro::Xoshiro256Plus;

fn criterion_ski(c: &mut Criterion) {
    let mut rng = Xoshiro256Plus::seed_from_u64(42);
    let base = ScaleKernel::new(RbfKernel::new(0.2).unwrap());

    let mut group = c.benchmark_group("ski");
    group.sample_size(20);
    for n in [500, 2000, 8000] {
        let x = Array::random_using((n, 2), Uniform::new(-1., 1.), &mut rng);
        let v: Array1<f64> = Array::random_using(n, Uniform::new(-1., 1.), &mut rng);
        let ski = GridInterpolationKernel::new(base.clone(), 64, &[(-1., 1.), (-1., 1.)])
            .expect("SKI kernel");

        group.bench_with_input(BenchmarkId::new("structured matvec", n), &n, |b, _| {
            b.iter(|| std::hint::black_box(ski.multiply(&x, &v).expect("SKI matvec")))
        });
        if n <= 2000 {
            group.bench_with_input(BenchmarkId::new("dense matvec", n), &n, |b, _| {
                b.iter(|| {
                    let k = base.value(&x, &x).expect("dense kernel");
                    std::hint::black_box(k.dot(&v))
                })
            });
        }
    }
    group.finish();
}

criterion_group!(benches, criterion_ski);
criterion_main!(benches);
