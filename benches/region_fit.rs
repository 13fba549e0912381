use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use phzfit::grid::{Grid, GridAxes, ModelParameter, PhotometryGrid};
use phzfit::likelihood::scale_factor::ScaleFactorSearch;
use phzfit::likelihood::LikelihoodFamily;
use phzfit::photometry::{shared_filters, FluxErrorPair, Photometry, Source};
use phzfit::region_fit::marginalization::Marginalization;
use phzfit::region_fit::RegionFitEngine;

const BANDS: [&str; 6] = ["u", "g", "r", "i", "z", "y"];

/// 50 redshifts × 4 E(B-V) × 2 curves × 10 SEDs, six bands.
fn synthetic_grid() -> PhotometryGrid {
    let filters = shared_filters(&BANDS);
    let z: Vec<f64> = (0..50).map(|i| 0.06 * i as f64).collect();
    let seds: Vec<String> = (0..10).map(|i| format!("sed{i}")).collect();
    let seds: Vec<&str> = seds.iter().map(String::as_str).collect();
    let axes = GridAxes::from_values(&z, &[0.0, 0.1, 0.2, 0.3], &["calzetti", "smc"], &seds).unwrap();
    Grid::from_fn(axes.clone(), |c| {
        let slope = 0.15 * c[3] as f64 - 0.5 + 0.7 * axes.z()[c[0]];
        let dust = (1.0 + 0.4 * c[2] as f64) * axes.ebv()[c[1]];
        let values = (0..BANDS.len())
            .map(|b| {
                let flux = (1.0 + b as f64).powf(slope)
                    * 10f64.powf(-0.4 * dust * (BANDS.len() - b) as f64);
                FluxErrorPair::new(flux, 0.0)
            })
            .collect();
        Photometry::new(Arc::clone(&filters), values).expect("bench grid")
    })
}

/// Scaled noisy copies of random cells, with an optional upper limit on the bluest band.
fn sources(grid: &PhotometryGrid, n: usize, with_limits: bool) -> Vec<Source> {
    let mut rng = StdRng::seed_from_u64(0x5EED);
    (0..n)
        .map(|id| {
            let model = &grid.cells()[rng.random_range(0..grid.len())];
            let scale = rng.random_range(1.0..50.0);
            let mut values: Vec<FluxErrorPair> = model
                .values()
                .iter()
                .map(|m| {
                    let error = 0.05 * scale * m.flux + 0.01;
                    FluxErrorPair::new(scale * m.flux + error * rng.random_range(-1.0..1.0), error)
                })
                .collect();
            if with_limits {
                values[0] = FluxErrorPair::upper_limit(values[0].flux * 0.5, values[0].error);
            }
            let photometry = Photometry::new(Arc::clone(model.filters()), values).expect("bench source");
            Source::new(id as i64, photometry)
        })
        .collect()
}

fn bench_normal(c: &mut Criterion) {
    let grid = synthetic_grid();
    let catalog = sources(&grid, 64, false);
    let methods = [
        (ModelParameter::Z, Marginalization::Interpolated),
        (ModelParameter::Sed, Marginalization::Sum),
    ];
    let engine = RegionFitEngine::new(LikelihoodFamily::Normal, ScaleFactorSearch::default())
        .with_marginalizations(&methods);

    c.bench_function("region_fit/normal_4000_cells", |b| {
        let mut i = 0;
        b.iter(|| {
            let source = &catalog[i % catalog.len()];
            i += 1;
            black_box(engine.fit("main", black_box(source), &grid).ok());
        })
    });
}

fn bench_upper_limits(c: &mut Criterion) {
    let grid = synthetic_grid();
    let catalog = sources(&grid, 16, true);

    let mut group = c.benchmark_group("region_fit/upper_limit");
    for (label, family) in [
        ("accurate", LikelihoodFamily::UpperLimit),
        ("fast", LikelihoodFamily::UpperLimitFast),
    ] {
        let engine = RegionFitEngine::new(family, ScaleFactorSearch::default());
        group.bench_function(label, |b| {
            b.iter_batched(
                || catalog.clone(),
                |batch| {
                    for source in &batch {
                        black_box(engine.fit("main", source, &grid).ok());
                    }
                },
                BatchSize::LargeInput,
            )
        });
    }
    group.finish();
}

criterion_group!(
    name = benches;
    config = Criterion::default().sample_size(20);
    targets = bench_normal, bench_upper_limits
);
criterion_main!(benches);
