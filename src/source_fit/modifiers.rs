//! # Grid modifiers
//!
//! Per-source transformations of a region's model grid, run in the declared order
//! before the region fit. Each modifier receives the grid produced by the previous
//! one and returns a new grid, possibly of a different shape.
//!
//! | Modifier                      | Needs on the source     | Effect                         |
//! |-------------------------------|-------------------------|--------------------------------|
//! | [`FixRedshiftModifier`]       | `fixed_redshift`        | keep the nearest z node only   |
//! | [`GalacticAbsorptionModifier`]| `dust_column_density`   | Milky Way extinction of fluxes |
//! | [`FilterShiftModifier`]       | `filter_shifts`         | bandpass-shift flux rescaling  |
//!
//! The last two read per-region coefficient grids mirroring the model layout. When
//! they run on an already reduced grid the coefficients are looked up by axis value.
use crate::constants::RegionMap;
use crate::grid::{check_region_compatibility, Grid, ModelParameter, PhotometryGrid};
use crate::photometry::{FluxErrorPair, Photometry, Source};
use crate::phz_errors::PhzError;

pub trait GridModifier: Send + Sync {
    /// Transform the grid of `region` for `source`.
    fn modify(
        &self,
        region: &str,
        grid: &PhotometryGrid,
        source: &Source,
    ) -> Result<PhotometryGrid, PhzError>;

    /// Refuse a model layout this modifier cannot be applied to.
    fn check_compatibility(
        &self,
        _model_grids: &RegionMap<PhotometryGrid>,
    ) -> Result<(), PhzError> {
        Ok(())
    }
}

impl<F> GridModifier for F
where
    F: Fn(&str, &PhotometryGrid, &Source) -> Result<PhotometryGrid, PhzError> + Send + Sync,
{
    fn modify(
        &self,
        region: &str,
        grid: &PhotometryGrid,
        source: &Source,
    ) -> Result<PhotometryGrid, PhzError> {
        self(region, grid, source)
    }
}

/// Index of the z node nearest to `fixed_z` on the ascending `axis`.
///
/// Starts from the first node `>= fixed_z` and steps back when the previous node is
/// strictly closer. An exact tie keeps the upper node.
pub(crate) fn nearest_z_index(axis: &[f64], fixed_z: f64) -> usize {
    let mut i = axis
        .iter()
        .position(|z| *z >= fixed_z)
        .unwrap_or(axis.len().saturating_sub(1));
    if i > 0 && fixed_z - axis[i - 1] < axis[i] - fixed_z {
        i -= 1;
    }
    i
}

/// Restrict the grid to the redshift node nearest the source's fixed redshift.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FixRedshiftModifier;

impl GridModifier for FixRedshiftModifier {
    fn modify(
        &self,
        _region: &str,
        grid: &PhotometryGrid,
        source: &Source,
    ) -> Result<PhotometryGrid, PhzError> {
        let fixed_z = source
            .fixed_redshift
            .ok_or_else(|| source.missing_attribute("fixed redshift"))?;
        let axis = grid.axes().z();
        let in_range = match (axis.first(), axis.last()) {
            (Some(lo), Some(hi)) => fixed_z >= *lo && fixed_z <= *hi,
            _ => false,
        };
        if !in_range {
            // the region cannot describe this source
            return Grid::new(grid.axes().emptied(ModelParameter::Z), Vec::new());
        }
        let index = nearest_z_index(axis, fixed_z);
        Ok(grid.fix_axis_by_index(ModelParameter::Z, index)?.to_grid())
    }
}

fn coefficient_cells<'g>(
    coefficients: &'g RegionMap<PhotometryGrid>,
    region: &str,
    grid: &PhotometryGrid,
    what: &str,
) -> Result<Vec<&'g Photometry>, PhzError> {
    let coeff = coefficients.get(region).ok_or_else(|| {
        PhzError::ConfigurationInconsistency(format!("no {what} grid for region {region}"))
    })?;
    coeff.cells_at(grid.axes()).map_err(|e| {
        PhzError::ConfigurationInconsistency(format!("{what} grid of region {region}: {e}"))
    })
}

fn rescale_cells(
    grid: &PhotometryGrid,
    coefficients: Vec<&Photometry>,
    mut rescale: impl FnMut(usize, &FluxErrorPair, &FluxErrorPair) -> FluxErrorPair,
) -> Result<PhotometryGrid, PhzError> {
    let cells = grid
        .cells()
        .iter()
        .zip(coefficients)
        .map(|(model, coeff)| {
            let values = model
                .values()
                .iter()
                .zip(coeff.values())
                .enumerate()
                .map(|(band, (m, c))| rescale(band, m, c))
                .collect();
            Photometry::new(model.filters().clone(), values)
        })
        .collect::<Result<Vec<_>, _>>()?;
    Grid::new(grid.axes().clone(), cells)
}

/// Milky Way extinction of the model fluxes along the source's line of sight.
///
/// For every band, `flux ← flux · 10^(−0.4 · coeff · bpc · E(B-V))`, where `coeff`
/// is the flux of the matching coefficient cell and `E(B-V)` the source's dust column
/// density. The model error is set to 0.
#[derive(Debug, Clone, PartialEq)]
pub struct GalacticAbsorptionModifier {
    coefficients: RegionMap<PhotometryGrid>,
    dust_map_sed_bpc: f64,
}

impl GalacticAbsorptionModifier {
    pub fn new(coefficients: RegionMap<PhotometryGrid>, dust_map_sed_bpc: f64) -> Self {
        Self {
            coefficients,
            dust_map_sed_bpc,
        }
    }
}

impl GridModifier for GalacticAbsorptionModifier {
    fn modify(
        &self,
        region: &str,
        grid: &PhotometryGrid,
        source: &Source,
    ) -> Result<PhotometryGrid, PhzError> {
        let ebv = source
            .dust_column_density
            .ok_or_else(|| source.missing_attribute("dust column density"))?;
        let dust = self.dust_map_sed_bpc * ebv;
        let coeffs = coefficient_cells(&self.coefficients, region, grid, "galactic absorption")?;
        rescale_cells(grid, coeffs, |_, m, c| {
            FluxErrorPair::new(m.flux * 10f64.powf(-0.4 * c.flux * dust), 0.0)
        })
    }

    fn check_compatibility(
        &self,
        model_grids: &RegionMap<PhotometryGrid>,
    ) -> Result<(), PhzError> {
        check_region_compatibility(model_grids, &self.coefficients, "galactic absorption")
    }
}

/// Rescaling of the model photometry for per-source filter bandpass shifts.
///
/// The coefficient cells hold the quadratic term in `flux` and the linear term in
/// `error`: `factor = 1 + a·Δλ² + b·Δλ` multiplies both the flux and the error.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterShiftModifier {
    coefficients: RegionMap<PhotometryGrid>,
}

impl FilterShiftModifier {
    pub fn new(coefficients: RegionMap<PhotometryGrid>) -> Self {
        Self { coefficients }
    }
}

impl GridModifier for FilterShiftModifier {
    fn modify(
        &self,
        region: &str,
        grid: &PhotometryGrid,
        source: &Source,
    ) -> Result<PhotometryGrid, PhzError> {
        let shifts = source
            .filter_shifts
            .as_deref()
            .ok_or_else(|| source.missing_attribute("filter shifts"))?;
        if shifts.len() != source.photometry.len() {
            return Err(source.missing_attribute(format!(
                "filter shifts for {} filters ({} given)",
                source.photometry.len(),
                shifts.len()
            )));
        }
        let coeffs = coefficient_cells(&self.coefficients, region, grid, "filter shift")?;
        rescale_cells(grid, coeffs, |band, m, c| {
            let shift = shifts[band];
            let factor = 1.0 + shift * shift * c.flux + shift * c.error;
            FluxErrorPair::new(m.flux * factor, m.error * factor)
        })
    }

    fn check_compatibility(
        &self,
        model_grids: &RegionMap<PhotometryGrid>,
    ) -> Result<(), PhzError> {
        check_region_compatibility(model_grids, &self.coefficients, "filter shift")
    }
}

#[cfg(test)]
mod modifiers_test {
    use super::*;
    use crate::grid::GridAxes;
    use crate::photometry::shared_filters;
    use approx::assert_relative_eq;

    fn grid(value: f64, error: f64) -> PhotometryGrid {
        let filters = shared_filters(&["g", "r"]);
        let axes = GridAxes::from_values(&[0.0, 0.5, 1.0], &[0.0], &["c"], &["s"]).unwrap();
        Grid::from_fn(axes, |c| {
            Photometry::new(
                filters.clone(),
                vec![
                    FluxErrorPair::new(value + c[0] as f64, error),
                    FluxErrorPair::new(value, error),
                ],
            )
            .unwrap()
        })
    }

    fn source() -> Source {
        Source::new(
            11,
            Photometry::from_pairs(
                &["g", "r"],
                vec![FluxErrorPair::new(1.0, 0.1), FluxErrorPair::new(1.0, 0.1)],
            )
            .unwrap(),
        )
    }

    #[test]
    fn nearest_node_keeps_upper_on_ties() {
        let axis = [0.0, 0.5, 1.0];
        assert_eq!(nearest_z_index(&axis, 0.2), 0);
        assert_eq!(nearest_z_index(&axis, 0.25), 1);
        assert_eq!(nearest_z_index(&axis, 0.3), 1);
        assert_eq!(nearest_z_index(&axis, 1.0), 2);
        assert_eq!(nearest_z_index(&axis, 0.0), 0);
    }

    #[test]
    fn fix_redshift_slices_or_empties() {
        let g = grid(1.0, 0.0);
        let out = FixRedshiftModifier
            .modify("r", &g, &source().with_fixed_redshift(0.6))
            .unwrap();
        assert_eq!(out.axes().z(), &[0.5]);
        assert_relative_eq!(out.cells()[0].values()[0].flux, 2.0);

        let out = FixRedshiftModifier
            .modify("r", &g, &source().with_fixed_redshift(1.5))
            .unwrap();
        assert!(out.is_empty());

        let err = FixRedshiftModifier.modify("r", &g, &source()).unwrap_err();
        assert_eq!(
            err,
            PhzError::MissingRequiredAttribute {
                source_id: 11,
                attribute: "fixed redshift".into()
            }
        );
    }

    #[test]
    fn galactic_absorption_dims_fluxes() {
        let mut coeffs = RegionMap::new();
        coeffs.insert("r".to_string(), grid(2.5, 0.0));
        let modifier = GalacticAbsorptionModifier::new(coeffs, 0.5);
        let g = grid(1.0, 0.3);
        let out = modifier
            .modify("r", &g, &source().with_dust_column_density(2.0))
            .unwrap();
        // r band: coeff 2.5, dust 0.5·2 = 1 → 10^-1
        let v = out.cells()[0].values()[1];
        assert_relative_eq!(v.flux, 0.1, epsilon = 1e-12);
        assert_eq!(v.error, 0.0);

        assert!(matches!(
            modifier.modify("r", &g, &source()),
            Err(PhzError::MissingRequiredAttribute { .. })
        ));
        assert!(matches!(
            modifier.modify("other", &g, &source().with_dust_column_density(1.0)),
            Err(PhzError::ConfigurationInconsistency(_))
        ));
    }

    #[test]
    fn filter_shift_follows_a_fixed_redshift() {
        let mut coeffs = RegionMap::new();
        // a = 1 + z index on g, linear term 0.5
        coeffs.insert("r".to_string(), grid(1.0, 0.5));
        let modifier = FilterShiftModifier::new(coeffs);
        let s = source().with_fixed_redshift(1.0).with_filter_shifts(vec![2.0, 0.0]);

        let fixed = FixRedshiftModifier.modify("r", &grid(1.0, 0.1), &s).unwrap();
        let out = modifier.modify("r", &fixed, &s).unwrap();
        let g = out.cells()[0].values()[0];
        // a = 3 at z = 1.0: factor = 1 + 4·3 + 2·0.5 = 14
        assert_relative_eq!(g.flux, 3.0 * 14.0);
        assert_relative_eq!(g.error, 0.1 * 14.0);
        // zero shift leaves the band alone
        assert_relative_eq!(out.cells()[0].values()[1].flux, 1.0);
    }
}
