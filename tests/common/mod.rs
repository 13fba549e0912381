#![allow(dead_code)]

use approx::assert_relative_eq;
use phzfit::constants::{PhotometricCorrectionMap, RegionMap};
use phzfit::grid::{Grid, GridAxes, PhotometryGrid};
use phzfit::photometry::{shared_filters, FluxErrorPair, Photometry, Source};
use phzfit::source_fit::SourceResult;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const FILTERS: [&str; 3] = ["g", "r", "i"];

/// Route `log` output through the test harness; repeated calls are harmless.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Every filter of `filters` at 1.
pub fn unit_corrections(filters: &[&str]) -> PhotometricCorrectionMap {
    filters.iter().map(|f| (f.to_string(), 1.0)).collect()
}

/// Single region "main", filters g/r, z ∈ {0.0, 0.1}: (1, 2) at z = 0 and (2, 2) at z = 0.1.
pub fn two_filter_grid() -> RegionMap<PhotometryGrid> {
    let filters = shared_filters(&["g", "r"]);
    let axes = GridAxes::from_values(&[0.0, 0.1], &[0.0], &["none"], &["flat"]).unwrap();
    let grid = Grid::from_fn(axes, |c| {
        let g = if c[0] == 0 { 1.0 } else { 2.0 };
        Photometry::new(
            filters.clone(),
            vec![FluxErrorPair::new(g, 0.0), FluxErrorPair::new(2.0, 0.0)],
        )
        .unwrap()
    });
    [("main".to_string(), grid)].into_iter().collect()
}

/// Smooth synthetic SED: a power law in wavelength index, tilted by z and E(B-V).
fn template_flux(band: usize, z: f64, ebv: f64, reddening: usize, sed: usize) -> f64 {
    let slope = 0.3 * sed as f64 - 0.2 + 0.8 * z;
    let dust = (1.0 + 0.5 * reddening as f64) * ebv * (FILTERS.len() - band) as f64;
    (1.0 + band as f64).powf(slope) * 10f64.powf(-0.4 * dust)
}

/// Two regions over g/r/i sharing E(B-V), reddening and SED axes.
///
/// "high_z" covers z ∈ [1.0, 2.0], "low_z" z ∈ [0.0, 0.9].
pub fn multi_region_grids() -> RegionMap<PhotometryGrid> {
    let filters = shared_filters(&FILTERS);
    let mut grids = RegionMap::new();
    for (name, z0) in [("low_z", 0.0), ("high_z", 1.0)] {
        let z: Vec<f64> = (0..10).map(|i| z0 + 0.1 * i as f64).collect();
        let axes = GridAxes::from_values(&z, &[0.0, 0.1, 0.2], &["calzetti", "smc"], &["ell", "sb", "irr"]).unwrap();
        let grid = Grid::from_fn(axes.clone(), |c| {
            let values = (0..FILTERS.len())
                .map(|b| {
                    FluxErrorPair::new(
                        template_flux(b, axes.z()[c[0]], axes.ebv()[c[1]], c[2], c[3]),
                        0.0,
                    )
                })
                .collect();
            Photometry::new(filters.clone(), values).unwrap()
        });
        grids.insert(name.to_string(), grid);
    }
    grids
}

/// Noisy scaled copies of random model cells of [`multi_region_grids`].
pub fn random_catalog(grids: &RegionMap<PhotometryGrid>, n: usize, seed: u64) -> Vec<Source> {
    let mut rng = StdRng::seed_from_u64(seed);
    let regions: Vec<&PhotometryGrid> = grids.values().collect();
    (0..n)
        .map(|id| {
            let grid = regions[rng.random_range(0..regions.len())];
            let model = &grid.cells()[rng.random_range(0..grid.len())];
            let scale = rng.random_range(0.5..20.0);
            let values = model
                .values()
                .iter()
                .map(|m| {
                    let flux = scale * m.flux;
                    let error = 0.05 * flux + 0.01;
                    FluxErrorPair::new(flux + error * rng.random_range(-1.0..1.0), error)
                })
                .collect();
            Source::new(
                id as i64,
                Photometry::new(model.filters().clone(), values).unwrap(),
            )
        })
        .collect()
}

pub fn assert_results_identical(a: &[SourceResult], b: &[SourceResult]) {
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(b) {
        assert_eq!(x.source_id, y.source_id);
        assert_eq!(x, y);
    }
}

pub fn assert_maps_close(a: &PhotometricCorrectionMap, b: &PhotometricCorrectionMap, eps: f64) {
    assert_eq!(a.keys().collect::<Vec<_>>(), b.keys().collect::<Vec<_>>());
    for (k, v) in a {
        assert_relative_eq!(*v, b[k], epsilon = eps);
    }
}
