use criterion::{black_box, criterion_group, criterion_main, Criterion};

use grifola::collections::{list_of_vec, list_unique, set_elt, unique_mfn, vec_of_list};
use grifola::engine::{force, manage};
use grifola::geom::{pt, quickhull, quickhull_mfn, Point};
use grifola::name::name_of_str;

const N: usize = 64;

fn bench_list_unique(c: &mut Criterion) {
    c.bench_function("list_unique/from_scratch", |b| {
        b.iter(|| {
            manage::init_dcg();
            let xs: Vec<usize> = (0..N).map(|i| i % 8).collect();
            let (l, _cells) = list_of_vec(&name_of_str("bench"), &xs);
            let m = unique_mfn(name_of_str("unique"));
            let out = list_unique(&m, name_of_str("root"), &l);
            black_box(vec_of_list(&force(&out)))
        })
    });

    c.bench_function("list_unique/mutate_and_reread", |b| {
        manage::init_dcg();
        let xs: Vec<usize> = (0..N).map(|i| i % 8).collect();
        let (l, cells) = list_of_vec(&name_of_str("bench"), &xs);
        let m = unique_mfn(name_of_str("unique"));
        let out = list_unique(&m, name_of_str("root"), &l);
        let _ = vec_of_list(&force(&out));
        let mut v = N;
        b.iter(|| {
            v += 1;
            set_elt(&cells, N / 2, v);
            black_box(vec_of_list(&force(&out)))
        })
    });
}

fn bench_quickhull(c: &mut Criterion) {
    c.bench_function("quickhull/ring", |b| {
        manage::init_dcg();
        let cloud: Vec<Point> = (0..N)
            .map(|i| {
                let a = (i as f64) * std::f64::consts::TAU / (N as f64);
                pt(a.cos(), a.sin())
            })
            .collect();
        let m = quickhull_mfn(name_of_str("qh"));
        b.iter(|| black_box(quickhull(&m, &cloud)))
    });
}

criterion_group!(benches, bench_list_unique, bench_quickhull);
criterion_main!(benches);
