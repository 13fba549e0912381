//! # Parameter grids
//!
//! Dense four-axis arrays indexed by model parameters, used both for the synthetic
//! model photometry and for every per-source intermediate (likelihood, posterior,
//! scale factors, prior weights).
//!
//! ## Overview
//! -----------------
//! A grid is a [`GridAxes`] (the ordered axis values) plus one cell per coordinate
//! combination. The axes are, in order:
//!
//! | [`ModelParameter`] | kind        | meaning                          |
//! |--------------------|-------------|----------------------------------|
//! | `Z`                | numeric     | redshift                         |
//! | `Ebv`              | numeric     | dust extinction E(B-V)           |
//! | `ReddeningCurve`   | categorical | dust-law identifier              |
//! | `Sed`              | categorical | template identifier              |
//!
//! Cells are stored flat with the **redshift index varying fastest**, then E(B-V),
//! then the reddening curve, then the SED. This storage order is also the traversal
//! order of [`Grid::iter`] and of the binary layout in [`serialization`].
//!
//! Views
//! -----------------
//! [`Grid::fix_axis_by_index`] and [`Grid::fix_axis_by_value`] return a [`GridView`]
//! borrowing the backing storage. A view exposes the reduced axes (the fixed axis keeps
//! a single value) and can be fixed again or copied out with [`GridView::to_grid`].
//!
//! Regions
//! -----------------
//! A model is a [`RegionMap`] of grids sharing a filter set but each owning its axis
//! extents. Auxiliary grids (correction coefficients, prior weights) must mirror the
//! model layout exactly; [`check_region_compatibility`] enforces this before any fit
//! starts.
use std::fmt;
use std::ops::{Index, IndexMut};

use itertools::iproduct;
use serde::{Deserialize, Serialize};

use crate::constants::RegionMap;
use crate::photometry::Photometry;
use crate::phz_errors::PhzError;

pub mod serialization;

/// Number of model-parameter axes.
pub const N_AXES: usize = 4;

/// Grid coordinates, one index per [`ModelParameter`].
pub type Coords = [usize; N_AXES];

/// Synthetic model photometry grid.
pub type PhotometryGrid = Grid<Photometry>;

/// Scalar grid (likelihood, posterior, scale factor, prior weights).
pub type DoubleGrid = Grid<f64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ModelParameter {
    Z,
    Ebv,
    ReddeningCurve,
    Sed,
}

impl ModelParameter {
    pub const ALL: [ModelParameter; N_AXES] = [
        ModelParameter::Z,
        ModelParameter::Ebv,
        ModelParameter::ReddeningCurve,
        ModelParameter::Sed,
    ];

    #[inline]
    pub fn index(self) -> usize {
        match self {
            ModelParameter::Z => 0,
            ModelParameter::Ebv => 1,
            ModelParameter::ReddeningCurve => 2,
            ModelParameter::Sed => 3,
        }
    }

    #[inline]
    pub fn is_numeric(self) -> bool {
        matches!(self, ModelParameter::Z | ModelParameter::Ebv)
    }

    pub fn name(self) -> &'static str {
        match self {
            ModelParameter::Z => "z",
            ModelParameter::Ebv => "ebv",
            ModelParameter::ReddeningCurve => "reddening_curve",
            ModelParameter::Sed => "sed",
        }
    }
}

impl fmt::Display for ModelParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Borrowed axis values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AxisRef<'a> {
    Numeric(&'a [f64]),
    Categorical(&'a [String]),
}

impl AxisRef<'_> {
    pub fn len(&self) -> usize {
        match self {
            AxisRef::Numeric(v) => v.len(),
            AxisRef::Categorical(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A single axis coordinate value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AxisValue<'a> {
    Numeric(f64),
    Categorical(&'a str),
}

impl fmt::Display for AxisValue<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AxisValue::Numeric(v) => write!(f, "{v}"),
            AxisValue::Categorical(s) => f.write_str(s),
        }
    }
}

/// Ordered axis values of a grid.
///
/// The numeric axes (redshift, E(B-V)) hold finite values in strictly ascending
/// order and the axes together span an addressable number of cells. Both
/// constructors and deserialization enforce this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawGridAxes")]
pub struct GridAxes {
    z: Vec<f64>,
    ebv: Vec<f64>,
    reddening_curve: Vec<String>,
    sed: Vec<String>,
}

#[derive(Deserialize)]
struct RawGridAxes {
    z: Vec<f64>,
    ebv: Vec<f64>,
    reddening_curve: Vec<String>,
    sed: Vec<String>,
}

impl TryFrom<RawGridAxes> for GridAxes {
    type Error = PhzError;

    fn try_from(raw: RawGridAxes) -> Result<Self, PhzError> {
        GridAxes::new(raw.z, raw.ebv, raw.reddening_curve, raw.sed)
    }
}

fn check_ascending(param: ModelParameter, values: &[f64]) -> Result<(), PhzError> {
    if let Some(bad) = values.iter().find(|v| !v.is_finite()) {
        return Err(PhzError::InvalidAxis(format!(
            "axis {param} holds the non-finite value {bad}"
        )));
    }
    match values.windows(2).position(|w| w[0] >= w[1]) {
        Some(i) => Err(PhzError::InvalidAxis(format!(
            "axis {param} is not strictly ascending at position {}: {} then {}",
            i + 1,
            values[i],
            values[i + 1]
        ))),
        None => Ok(()),
    }
}

impl GridAxes {
    /// Validated axes.
    ///
    /// Return
    /// ----------
    /// * `Err(PhzError::InvalidAxis)` when a numeric axis is not finite and strictly
    ///   ascending, or when the cell count overflows `usize`.
    pub fn new(
        z: Vec<f64>,
        ebv: Vec<f64>,
        reddening_curve: Vec<String>,
        sed: Vec<String>,
    ) -> Result<Self, PhzError> {
        check_ascending(ModelParameter::Z, &z)?;
        check_ascending(ModelParameter::Ebv, &ebv)?;
        let axes = Self {
            z,
            ebv,
            reddening_curve,
            sed,
        };
        axes.shape()
            .iter()
            .try_fold(1usize, |acc, n| acc.checked_mul(*n))
            .ok_or_else(|| {
                PhzError::InvalidAxis(format!("axes of shape {:?} span too many cells", axes.shape()))
            })?;
        Ok(axes)
    }

    /// Convenience constructor from string slices for the categorical axes.
    pub fn from_values(
        z: &[f64],
        ebv: &[f64],
        reddening_curve: &[&str],
        sed: &[&str],
    ) -> Result<Self, PhzError> {
        Self::new(
            z.to_vec(),
            ebv.to_vec(),
            reddening_curve.iter().map(|s| s.to_string()).collect(),
            sed.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[inline]
    pub fn z(&self) -> &[f64] {
        &self.z
    }

    #[inline]
    pub fn ebv(&self) -> &[f64] {
        &self.ebv
    }

    #[inline]
    pub fn reddening_curve(&self) -> &[String] {
        &self.reddening_curve
    }

    #[inline]
    pub fn sed(&self) -> &[String] {
        &self.sed
    }

    pub fn axis(&self, param: ModelParameter) -> AxisRef<'_> {
        match param {
            ModelParameter::Z => AxisRef::Numeric(&self.z),
            ModelParameter::Ebv => AxisRef::Numeric(&self.ebv),
            ModelParameter::ReddeningCurve => AxisRef::Categorical(&self.reddening_curve),
            ModelParameter::Sed => AxisRef::Categorical(&self.sed),
        }
    }

    pub fn shape(&self) -> Coords {
        [
            self.z.len(),
            self.ebv.len(),
            self.reddening_curve.len(),
            self.sed.len(),
        ]
    }

    #[inline]
    pub fn len_of(&self, param: ModelParameter) -> usize {
        self.shape()[param.index()]
    }

    /// Number of cells spanned by the axes (cannot overflow, see [`GridAxes::new`]).
    pub fn cell_count(&self) -> usize {
        self.shape().iter().product()
    }

    /// Flat storage index of `coords`, `None` when out of range.
    pub fn flat_index(&self, coords: Coords) -> Option<usize> {
        let shape = self.shape();
        let mut index = 0;
        let mut stride = 1;
        for (c, n) in coords.iter().zip(shape.iter()) {
            if c >= n {
                return None;
            }
            index += c * stride;
            stride *= n;
        }
        Some(index)
    }

    /// Coordinates of the flat storage index `flat`.
    pub fn coords(&self, mut flat: usize) -> Coords {
        let shape = self.shape();
        let mut out = [0; N_AXES];
        for (c, n) in out.iter_mut().zip(shape.iter()) {
            if *n == 0 {
                break;
            }
            *c = flat % n;
            flat /= n;
        }
        out
    }

    /// All coordinates in storage order (redshift fastest).
    pub fn iter_coords(&self) -> impl Iterator<Item = Coords> {
        let [nz, ne, nr, ns] = self.shape();
        iproduct!(0..ns, 0..nr, 0..ne, 0..nz).map(|(s, r, e, z)| [z, e, r, s])
    }

    /// Value of axis `param` at position `index`.
    pub fn value_at(&self, param: ModelParameter, index: usize) -> Option<AxisValue<'_>> {
        match param {
            ModelParameter::Z => self.z.get(index).map(|v| AxisValue::Numeric(*v)),
            ModelParameter::Ebv => self.ebv.get(index).map(|v| AxisValue::Numeric(*v)),
            ModelParameter::ReddeningCurve => self
                .reddening_curve
                .get(index)
                .map(|s| AxisValue::Categorical(s)),
            ModelParameter::Sed => self.sed.get(index).map(|s| AxisValue::Categorical(s)),
        }
    }

    /// Position of `value` on axis `param` (exact match).
    pub fn index_of(&self, param: ModelParameter, value: AxisValue<'_>) -> Option<usize> {
        match (self.axis(param), value) {
            (AxisRef::Numeric(v), AxisValue::Numeric(x)) => v.iter().position(|a| *a == x),
            (AxisRef::Categorical(v), AxisValue::Categorical(x)) => {
                v.iter().position(|a| a == x)
            }
            _ => None,
        }
    }

    /// Copy of these axes with `param` reduced to its `index`-th value.
    pub(crate) fn restricted(&self, param: ModelParameter, index: usize) -> GridAxes {
        let mut out = self.clone();
        match param {
            ModelParameter::Z => out.z = vec![self.z[index]],
            ModelParameter::Ebv => out.ebv = vec![self.ebv[index]],
            ModelParameter::ReddeningCurve => {
                out.reddening_curve = vec![self.reddening_curve[index].clone()]
            }
            ModelParameter::Sed => out.sed = vec![self.sed[index].clone()],
        }
        out
    }

    /// Copy of these axes with `param` emptied (a grid without cells).
    pub(crate) fn emptied(&self, param: ModelParameter) -> GridAxes {
        let mut out = self.clone();
        match param {
            ModelParameter::Z => out.z.clear(),
            ModelParameter::Ebv => out.ebv.clear(),
            ModelParameter::ReddeningCurve => out.reddening_curve.clear(),
            ModelParameter::Sed => out.sed.clear(),
        }
        out
    }

    /// First axis whose value set differs from `other`.
    pub fn first_mismatch(&self, other: &GridAxes) -> Option<ModelParameter> {
        ModelParameter::ALL
            .into_iter()
            .find(|p| self.axis(*p) != other.axis(*p))
    }
}

/// Dense grid of cells over [`GridAxes`].
///
/// Deserialization goes through [`Grid::new`], so a cell list that does not match
/// the axes is refused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawGrid<T>")]
pub struct Grid<T> {
    axes: GridAxes,
    cells: Vec<T>,
}

#[derive(Deserialize)]
struct RawGrid<T> {
    axes: GridAxes,
    cells: Vec<T>,
}

impl<T> TryFrom<RawGrid<T>> for Grid<T> {
    type Error = PhzError;

    fn try_from(raw: RawGrid<T>) -> Result<Self, PhzError> {
        Grid::new(raw.axes, raw.cells)
    }
}

impl<T> Grid<T> {
    /// Wrap existing cells, given in storage order.
    pub fn new(axes: GridAxes, cells: Vec<T>) -> Result<Self, PhzError> {
        let expected = axes.cell_count();
        if cells.len() != expected {
            return Err(PhzError::InvalidAxis(format!(
                "grid axes span {expected} cells but {} were given",
                cells.len()
            )));
        }
        Ok(Self { axes, cells })
    }

    /// Build a grid by evaluating `f` at every coordinate, in storage order.
    pub fn from_fn(axes: GridAxes, f: impl FnMut(Coords) -> T) -> Self {
        let cells = axes.iter_coords().map(f).collect();
        Self { axes, cells }
    }

    #[inline]
    pub fn axes(&self) -> &GridAxes {
        &self.axes
    }

    #[inline]
    pub fn axis(&self, param: ModelParameter) -> AxisRef<'_> {
        self.axes.axis(param)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    #[inline]
    pub fn get(&self, coords: Coords) -> Option<&T> {
        self.axes.flat_index(coords).map(|i| &self.cells[i])
    }

    #[inline]
    pub fn get_mut(&mut self, coords: Coords) -> Option<&mut T> {
        self.axes.flat_index(coords).map(move |i| &mut self.cells[i])
    }

    /// Cells in storage order.
    #[inline]
    pub fn cells(&self) -> &[T] {
        &self.cells
    }

    #[inline]
    pub fn cells_mut(&mut self) -> &mut [T] {
        &mut self.cells
    }

    /// `(coordinates, cell)` pairs in storage order.
    pub fn iter(&self) -> impl Iterator<Item = (Coords, &T)> {
        self.axes.iter_coords().zip(self.cells.iter())
    }

    /// Same-shaped grid of `f(cell)`.
    pub fn map<U>(&self, f: impl FnMut(&T) -> U) -> Grid<U> {
        Grid {
            axes: self.axes.clone(),
            cells: self.cells.iter().map(f).collect(),
        }
    }

    /// Whole-grid view.
    pub fn view(&self) -> GridView<'_, T> {
        GridView {
            grid: self,
            fixed: [None; N_AXES],
            axes: self.axes.clone(),
        }
    }

    /// View with axis `param` fixed to its `index`-th value.
    pub fn fix_axis_by_index(
        &self,
        param: ModelParameter,
        index: usize,
    ) -> Result<GridView<'_, T>, PhzError> {
        self.view().fix_axis_by_index(param, index)
    }

    /// View with axis `param` fixed to `value` (exact match).
    pub fn fix_axis_by_value(
        &self,
        param: ModelParameter,
        value: AxisValue<'_>,
    ) -> Result<GridView<'_, T>, PhzError> {
        self.view().fix_axis_by_value(param, value)
    }

    /// Cells of this grid at every coordinate of `axes`, matched by axis value.
    ///
    /// `axes` is typically a reduced copy of this grid's own axes (a fixed redshift,
    /// for instance). Identical axes are matched without lookups.
    ///
    /// Return
    /// ----------
    /// * The cells in the storage order of `axes`.
    /// * `Err(PhzError::InvalidAxis)` naming the first knot of `axes` missing here.
    pub fn cells_at(&self, axes: &GridAxes) -> Result<Vec<&T>, PhzError> {
        if *axes == self.axes {
            return Ok(self.cells.iter().collect());
        }
        let mut lookup: [Vec<usize>; N_AXES] = Default::default();
        for (p, positions) in ModelParameter::ALL.into_iter().zip(lookup.iter_mut()) {
            for i in 0..axes.len_of(p) {
                let value = axes.value_at(p, i);
                let pos = value
                    .and_then(|v| self.axes.index_of(p, v))
                    .ok_or_else(|| {
                        PhzError::InvalidAxis(format!(
                            "axis {p} has no knot {}",
                            value.map(|v| v.to_string()).unwrap_or_default()
                        ))
                    })?;
                positions.push(pos);
            }
        }
        Ok(axes
            .iter_coords()
            .map(|c| {
                &self[[
                    lookup[0][c[0]],
                    lookup[1][c[1]],
                    lookup[2][c[2]],
                    lookup[3][c[3]],
                ]]
            })
            .collect())
    }
}

impl<T: Clone> Grid<T> {
    /// Grid with every cell set to `value`.
    pub fn filled(axes: GridAxes, value: T) -> Self {
        let cells = vec![value; axes.cell_count()];
        Self { axes, cells }
    }
}

impl<T> Index<Coords> for Grid<T> {
    type Output = T;

    fn index(&self, coords: Coords) -> &T {
        match self.axes.flat_index(coords) {
            Some(i) => &self.cells[i],
            None => panic!("grid coordinates {coords:?} out of range"),
        }
    }
}

impl<T> IndexMut<Coords> for Grid<T> {
    fn index_mut(&mut self, coords: Coords) -> &mut T {
        match self.axes.flat_index(coords) {
            Some(i) => &mut self.cells[i],
            None => panic!("grid coordinates {coords:?} out of range"),
        }
    }
}

impl Grid<Photometry> {
    /// Filter list shared by the cells, `None` for an empty grid.
    pub fn filters(&self) -> Option<&[String]> {
        self.cells.first().map(|p| &**p.filters())
    }
}

/// Lower-dimensional view of a [`Grid`] with some axes fixed.
#[derive(Debug, Clone)]
pub struct GridView<'a, T> {
    grid: &'a Grid<T>,
    fixed: [Option<usize>; N_AXES],
    axes: GridAxes,
}

impl<'a, T> GridView<'a, T> {
    /// Reduced axes: a fixed axis keeps its single selected value.
    #[inline]
    pub fn axes(&self) -> &GridAxes {
        &self.axes
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.axes.cell_count()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Index on the parent axis of a fixed axis.
    pub fn fixed_index(&self, param: ModelParameter) -> Option<usize> {
        self.fixed[param.index()]
    }

    fn parent_coords(&self, coords: Coords) -> Coords {
        let mut out = coords;
        for (c, f) in out.iter_mut().zip(self.fixed.iter()) {
            if let Some(i) = f {
                *c = *i;
            }
        }
        out
    }

    /// Cell at view coordinates (a fixed axis only accepts index 0).
    pub fn get(&self, coords: Coords) -> Option<&'a T> {
        self.axes.flat_index(coords)?;
        self.grid.get(self.parent_coords(coords))
    }

    /// `(view coordinates, cell)` pairs in storage order.
    pub fn iter(&self) -> impl Iterator<Item = (Coords, &'a T)> + '_ {
        let grid = self.grid;
        self.axes
            .iter_coords()
            .map(move |c| (c, &grid[self.parent_coords(c)]))
    }

    pub fn fix_axis_by_index(
        mut self,
        param: ModelParameter,
        index: usize,
    ) -> Result<GridView<'a, T>, PhzError> {
        let len = self.axes.len_of(param);
        if index >= len {
            return Err(PhzError::InvalidAxis(format!(
                "index {index} out of range for axis {param} of length {len}"
            )));
        }
        let parent_index = self.fixed[param.index()].unwrap_or(0) + index;
        self.fixed[param.index()] = Some(parent_index);
        self.axes = self.axes.restricted(param, index);
        Ok(self)
    }

    pub fn fix_axis_by_value(
        self,
        param: ModelParameter,
        value: AxisValue<'_>,
    ) -> Result<GridView<'a, T>, PhzError> {
        let index = self
            .axes
            .index_of(param, value)
            .ok_or_else(|| PhzError::InvalidAxis(format!("value {value} not on axis {param}")))?;
        self.fix_axis_by_index(param, index)
    }
}

impl<T: Clone> GridView<'_, T> {
    /// Copy the viewed cells into an owned grid over the reduced axes.
    pub fn to_grid(&self) -> Grid<T> {
        let cells = self.iter().map(|(_, c)| c.clone()).collect();
        Grid {
            axes: self.axes.clone(),
            cells,
        }
    }
}

/// Check that `other` mirrors the region layout of `reference`.
///
/// Both maps must name the same regions and, region by region, carry identical axis
/// value sets (not merely identical sizes).
///
/// Arguments
/// -----------------
/// * `reference` – the model grids.
/// * `other` – the auxiliary grids to be applied to them.
/// * `what` – label of `other` used in the error message.
///
/// Return
/// ----------
/// * `Err(PhzError::ConfigurationInconsistency)` naming the first offending region or axis.
pub fn check_region_compatibility<A, B>(
    reference: &RegionMap<Grid<A>>,
    other: &RegionMap<Grid<B>>,
    what: &str,
) -> Result<(), PhzError> {
    if reference.len() != other.len() || reference.keys().ne(other.keys()) {
        return Err(PhzError::ConfigurationInconsistency(format!(
            "{what} regions {:?} do not match model regions {:?}",
            other.keys().collect::<Vec<_>>(),
            reference.keys().collect::<Vec<_>>()
        )));
    }
    for (name, grid) in reference {
        if let Some(aux) = other.get(name) {
            if let Some(param) = grid.axes().first_mismatch(aux.axes()) {
                return Err(PhzError::ConfigurationInconsistency(format!(
                    "{what} axis {param} of region {name} differs from the model grid"
                )));
            }
        }
    }
    Ok(())
}
