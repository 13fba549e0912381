mod common;

use approx::assert_relative_eq;
use phzfit::constants::{RegionMap, SATURATED_RESIDUAL};
use phzfit::grid::{DoubleGrid, Grid, GridAxes, ModelParameter};
use phzfit::likelihood::scale_factor::{sigma_scale_factor, ScaleFactorSampling, ScaleFactorSearch};
use phzfit::likelihood::LikelihoodFamily;
use phzfit::photometry::{FluxErrorPair, Photometry, Source};
use phzfit::phz_errors::PhzError;
use phzfit::phz_params::PhzParams;
use phzfit::region_fit::marginalization::{Marginalization, Pdf1D};
use phzfit::region_fit::priors::GenericGridPrior;
use phzfit::region_fit::RegionFitEngine;
use phzfit::source_fit::combine::region_weights;
use phzfit::source_fit::SourceFitOrchestrator;

use crate::common::{multi_region_grids, random_catalog, two_filter_grid, unit_corrections};

fn unit_source(g: FluxErrorPair) -> Source {
    Source::new(
        1,
        Photometry::from_pairs(&["g", "r"], vec![g, FluxErrorPair::new(1.0, 0.1)]).unwrap(),
    )
}

#[test]
fn two_filter_redshift_scenario() {
    common::init_logging();
    let grids = two_filter_grid();
    let corr = unit_corrections(&["g", "r"]);
    let fitter = SourceFitOrchestrator::new(&grids, &corr, LikelihoodFamily::Normal)
        .unwrap()
        .with_marginalization(ModelParameter::Z, Marginalization::Sum);

    let result = fitter.fit(&unit_source(FluxErrorPair::new(1.0, 0.1))).unwrap();
    let best = result.best_model.unwrap();
    assert_eq!(best.z, 0.1);
    // (2, 2) against (1, 1): closed-form ratio
    assert_relative_eq!(best.scale_factor, 0.5, epsilon = 1e-12);
    assert_relative_eq!(best.likelihood_log, 0.0, epsilon = 1e-12);

    let z = &result.pdfs[&ModelParameter::Z];
    match z {
        Pdf1D::Numeric { x, .. } => assert_eq!(x, &vec![0.0, 0.1]),
        _ => panic!("redshift marginal must be numeric"),
    }
    assert_eq!(z.argmax(), Some(1));
    assert_relative_eq!(z.integral(), 1.0, epsilon = 1e-12);
}

#[test]
fn fast_and_accurate_limits_agree_away_from_threshold() {
    let grids = two_filter_grid();
    let limit = FluxErrorPair::upper_limit(1.0, 0.1);
    let accurate = LikelihoodFamily::UpperLimit;
    let fast = LikelihoodFamily::UpperLimitFast;

    for model in grids["main"].cells() {
        let g = model.values()[0].flux;
        for alpha in [1e-3, 0.01, 3.0, 10.0] {
            assert_eq!(
                accurate.residual(&limit, g, alpha),
                fast.residual(&limit, g, alpha),
                "model g {g}, alpha {alpha}"
            );
        }
        // near the limit the smooth and step forms part ways
        let near = 1.0 / g;
        let smooth = accurate.residual(&limit, g, near);
        assert!(smooth > 0.0 && smooth < SATURATED_RESIDUAL);
        assert_eq!(fast.residual(&limit, g, near), 0.0);
    }
}

#[test]
fn unnormalized_marginals_follow_region_weights() {
    let grids = multi_region_grids();
    let corr = unit_corrections(&common::FILTERS);
    let params = PhzParams::builder().normalize_pdfs(false).build().unwrap();
    let methods = [(ModelParameter::Sed, Marginalization::Sum)];
    let fitter = SourceFitOrchestrator::new(&grids, &corr, LikelihoodFamily::Normal)
        .unwrap()
        .with_params(&params)
        .with_marginalization(ModelParameter::Sed, Marginalization::Sum);
    let engine = RegionFitEngine::new(LikelihoodFamily::Normal, ScaleFactorSearch::default())
        .with_marginalizations(&methods);

    for source in random_catalog(&grids, 4, 11) {
        let combined = fitter.fit(&source).unwrap();
        let regions: Vec<_> = grids
            .iter()
            .map(|(name, grid)| engine.fit(name, &source, grid).unwrap())
            .collect();
        let logs: Vec<f64> = regions.iter().map(|r| r.normalization_log).collect();

        let (reference, weights) = region_weights(&logs);
        let dominant = logs.iter().position(|l| *l == reference).unwrap();
        assert_eq!(weights[dominant], 1.0);
        assert!(weights.iter().all(|w| *w <= 1.0));

        // absolute scale: Σ exp(norm_r)·pdf_r
        let mut expected = vec![0.0; 3];
        for r in &regions {
            for (e, v) in expected.iter_mut().zip(r.pdfs[&ModelParameter::Sed].y()) {
                *e += r.normalization_log.exp() * v;
            }
        }
        let got = combined.pdfs[&ModelParameter::Sed].y();
        for (g, e) in got.iter().zip(&expected) {
            assert_relative_eq!(*g, *e, max_relative = 1e-9);
        }
    }
}

#[test]
fn mismatched_prior_grid_is_refused_before_fitting() {
    let grids = two_filter_grid();
    let corr = unit_corrections(&["g", "r"]);
    let foreign: DoubleGrid = Grid::filled(
        GridAxes::from_values(&[0.0, 0.2], &[0.0], &["none"], &["flat"]).unwrap(),
        1.0,
    );
    let prior_grids: RegionMap<DoubleGrid> = [("main".to_string(), foreign)].into_iter().collect();
    let refused = SourceFitOrchestrator::new(&grids, &corr, LikelihoodFamily::Normal)
        .unwrap()
        .with_prior(Box::new(GenericGridPrior::new(prior_grids)));
    assert!(matches!(
        refused,
        Err(PhzError::ConfigurationInconsistency(_))
    ));
}

#[test]
fn missing_correction_names_the_filter() {
    let grids = two_filter_grid();
    let corr = unit_corrections(&["g"]);
    let fitter = SourceFitOrchestrator::new(&grids, &corr, LikelihoodFamily::Normal).unwrap();
    let err = fitter
        .fit(&unit_source(FluxErrorPair::new(1.0, 0.1)))
        .unwrap_err();
    assert_eq!(
        err,
        PhzError::MissingRequiredAttribute {
            source_id: 1,
            attribute: "photometric correction for filter r".into()
        }
    );
}

#[test]
fn sampled_mean_stays_inside_the_sampled_interval() {
    let grids = two_filter_grid();
    let corr = unit_corrections(&["g", "r"]);
    let source = unit_source(FluxErrorPair::upper_limit(0.5, 0.1));
    let family = LikelihoodFamily::for_catalog([&source], false);
    let params = PhzParams::builder()
        .scale_factor_sampling(Some(ScaleFactorSampling::default()))
        .build()
        .unwrap();

    let plain = SourceFitOrchestrator::new(&grids, &corr, family)
        .unwrap()
        .fit(&source)
        .unwrap();
    let sampled = SourceFitOrchestrator::new(&grids, &corr, family)
        .unwrap()
        .with_params(&params)
        .fit(&source)
        .unwrap();

    let optimum = plain.best_model.unwrap();
    let mean = sampled.best_model.unwrap();
    assert_eq!(mean.coords, optimum.coords);
    assert_eq!(
        sampled.best_likelihood_model.unwrap().scale_factor,
        optimum.scale_factor
    );
    let sigma = sigma_scale_factor(&source.photometry, &mean.photometry);
    assert!(sigma > 0.0);
    assert!((mean.scale_factor - optimum.scale_factor).abs() <= 5.0 * sigma);
}
