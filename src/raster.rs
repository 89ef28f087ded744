//! Read-only 2D raster grids indexed by world coordinates, analogous to the
//! raster layers an R `SpatRaster` hands to the segmentation core.
//!
//! Two implementations of [`RasterLayer`] exist: [`Raster`], a rectangular
//! row-major grid with a geographic extent, and [`SingleValueRaster`], which
//! answers every lookup with the same value. The latter lets scalar
//! parameters (a constant ground height, a constant canopy ratio) flow
//! through code written against raster lookups.

use thiserror::Error;

use crate::spatial::{Coordinate, Point3D};

/// Errors raised by raster lookups and copies.
///
/// Only the validating entry points return these; the hot-path lookup
/// [`RasterLayer::value_at_xy_of_unchecked`] skips all checks.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RasterError {
    /// A lookup was attempted with NaN x or y.
    #[error("tried to access a raster value with NaN xy-coordinates")]
    InvalidCoordinate,
    /// A lookup was attempted outside the raster's extent.
    #[error("tried to access a raster value outside of the raster extent")]
    OutOfExtent,
    /// `copy_with_values` was given the wrong number of values.
    #[error("tried to copy-create a raster with {got} values where {expected} were expected")]
    ShapeMismatch { expected: usize, got: usize },
}

/// Common interface of [`Raster`] and [`SingleValueRaster`].
pub trait RasterLayer<T: Copy> {
    /// The underlying cell values, row-major from top-left.
    fn values(&self) -> &[T];

    /// An identical raster carrying different cell values.
    fn copy_with_values(&self, new_values: Vec<T>) -> Result<Self, RasterError>
    where
        Self: Sized;

    /// Whether (x, y) of `point` lies within the closed extent rectangle.
    fn has_value_at_xy_of(&self, point: &Point3D) -> bool;

    /// The cell value at the xy-coordinates of `point`.
    ///
    /// Fails with [`RasterError::InvalidCoordinate`] if x or y is NaN and
    /// with [`RasterError::OutOfExtent`] outside the extent.
    fn value_at_xy_of(&self, point: &Point3D) -> Result<T, RasterError>;

    /// Same as [`Self::value_at_xy_of`] without any validation.
    ///
    /// For NaN coordinates or locations outside the extent the result is
    /// unspecified and the call may panic. Callers either check
    /// [`Self::has_value_at_xy_of`] first or accept propagating whatever
    /// the underlying cells hold.
    fn value_at_xy_of_unchecked(&self, point: &Point3D) -> T;
}

/// A rectangular, non-rotated raster with a geographic extent.
///
/// Values are stored row-major from the top-left corner (max y, min x) to
/// the bottom-right corner, matching the R matrix convention the grids
/// arrive in.
#[derive(Debug, Clone, PartialEq)]
pub struct Raster<T> {
    values: Vec<T>,
    num_rows: usize,
    num_cols: usize,
    x_min: Coordinate,
    x_max: Coordinate,
    y_min: Coordinate,
    y_max: Coordinate,
    row_height: Coordinate,
    col_width: Coordinate,
}

impl<T: Copy> Raster<T> {
    /// Create a raster from row-major values and a geographic extent.
    pub fn new(
        values: Vec<T>,
        num_rows: usize,
        num_cols: usize,
        x_min: Coordinate,
        x_max: Coordinate,
        y_min: Coordinate,
        y_max: Coordinate,
    ) -> Self {
        assert_eq!(values.len(), num_rows * num_cols);
        Self {
            values,
            num_rows,
            num_cols,
            x_min,
            x_max,
            y_min,
            y_max,
            row_height: (y_max - y_min) / num_rows as Coordinate,
            col_width: (x_max - x_min) / num_cols as Coordinate,
        }
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn num_cols(&self) -> usize {
        self.num_cols
    }

    pub fn x_min(&self) -> Coordinate {
        self.x_min
    }

    pub fn x_max(&self) -> Coordinate {
        self.x_max
    }

    pub fn y_min(&self) -> Coordinate {
        self.y_min
    }

    pub fn y_max(&self) -> Coordinate {
        self.y_max
    }
}

impl<T: Copy> RasterLayer<T> for Raster<T> {
    fn values(&self) -> &[T] {
        &self.values
    }

    fn copy_with_values(&self, new_values: Vec<T>) -> Result<Self, RasterError> {
        if new_values.len() != self.values.len() {
            return Err(RasterError::ShapeMismatch {
                expected: self.values.len(),
                got: new_values.len(),
            });
        }
        Ok(Self::new(
            new_values,
            self.num_rows,
            self.num_cols,
            self.x_min,
            self.x_max,
            self.y_min,
            self.y_max,
        ))
    }

    fn has_value_at_xy_of(&self, point: &Point3D) -> bool {
        self.x_min <= point[0]
            && point[0] <= self.x_max
            && self.y_min <= point[1]
            && point[1] <= self.y_max
    }

    fn value_at_xy_of(&self, point: &Point3D) -> Result<T, RasterError> {
        if point[0].is_nan() || point[1].is_nan() {
            return Err(RasterError::InvalidCoordinate);
        }
        if !self.has_value_at_xy_of(point) {
            return Err(RasterError::OutOfExtent);
        }
        Ok(self.value_at_xy_of_unchecked(point))
    }

    fn value_at_xy_of_unchecked(&self, point: &Point3D) -> T {
        let mut row_index = ((self.y_max - point[1]) / self.row_height) as usize;
        // if y == y_min, the row index is too big by one
        if row_index == self.num_rows {
            row_index -= 1;
        }

        let mut col_index = ((point[0] - self.x_min) / self.col_width) as usize;
        // if x == x_max, the column index is too big by one
        if col_index == self.num_cols {
            col_index -= 1;
        }

        self.values[self.num_cols * row_index + col_index]
    }
}

/// Can be used like a raster but returns the same value for every location.
#[derive(Debug, Clone, PartialEq)]
pub struct SingleValueRaster<T> {
    value: T,
    values: Vec<T>,
}

impl<T: Copy> SingleValueRaster<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            values: vec![value],
        }
    }
}

impl<T: Copy> RasterLayer<T> for SingleValueRaster<T> {
    fn values(&self) -> &[T] {
        &self.values
    }

    fn copy_with_values(&self, new_values: Vec<T>) -> Result<Self, RasterError> {
        if new_values.len() != 1 {
            return Err(RasterError::ShapeMismatch {
                expected: 1,
                got: new_values.len(),
            });
        }
        Ok(Self::new(new_values[0]))
    }

    fn has_value_at_xy_of(&self, _point: &Point3D) -> bool {
        true
    }

    fn value_at_xy_of(&self, _point: &Point3D) -> Result<T, RasterError> {
        Ok(self.value)
    }

    fn value_at_xy_of_unchecked(&self, _point: &Point3D) -> T {
        self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demo_raster() -> Raster<f64> {
        // 2 rows x 3 cols over x in [0, 3], y in [0, 2]:
        //   row 0 (y in [1, 2]):  0  1  2
        //   row 1 (y in [0, 1]):  3  4  5
        Raster::new(vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0], 2, 3, 0.0, 3.0, 0.0, 2.0)
    }

    #[test]
    fn value_lookup_maps_world_coordinates_to_cells() {
        let r = demo_raster();
        assert_eq!(r.value_at_xy_of(&[0.5, 1.5, 0.0]).unwrap(), 0.0);
        assert_eq!(r.value_at_xy_of(&[2.5, 1.5, 0.0]).unwrap(), 2.0);
        assert_eq!(r.value_at_xy_of(&[0.5, 0.5, 0.0]).unwrap(), 3.0);
        assert_eq!(r.value_at_xy_of(&[2.5, 0.5, 0.0]).unwrap(), 5.0);
    }

    #[test]
    fn edge_coordinates_clamp_into_the_last_row_and_column() {
        let r = demo_raster();
        // y == y_min lands in the bottom row, x == x_max in the last column
        assert_eq!(r.value_at_xy_of(&[0.5, 0.0, 0.0]).unwrap(), 3.0);
        assert_eq!(r.value_at_xy_of(&[3.0, 1.5, 0.0]).unwrap(), 2.0);
        assert_eq!(r.value_at_xy_of(&[3.0, 0.0, 0.0]).unwrap(), 5.0);
    }

    #[test]
    fn lookups_outside_the_extent_fail() {
        let r = demo_raster();
        assert!(!r.has_value_at_xy_of(&[3.5, 1.0, 0.0]));
        assert_eq!(
            r.value_at_xy_of(&[3.5, 1.0, 0.0]),
            Err(RasterError::OutOfExtent)
        );
        assert_eq!(
            r.value_at_xy_of(&[-0.1, 1.0, 0.0]),
            Err(RasterError::OutOfExtent)
        );
    }

    #[test]
    fn nan_coordinates_fail_eagerly() {
        let r = demo_raster();
        assert_eq!(
            r.value_at_xy_of(&[f64::NAN, 1.0, 0.0]),
            Err(RasterError::InvalidCoordinate)
        );
        assert_eq!(
            r.value_at_xy_of(&[1.0, f64::NAN, 0.0]),
            Err(RasterError::InvalidCoordinate)
        );
    }

    #[test]
    fn copy_with_values_requires_matching_shape() {
        let r = demo_raster();
        let copied = r.copy_with_values(vec![9.0; 6]).unwrap();
        assert_eq!(copied.value_at_xy_of(&[0.5, 1.5, 0.0]).unwrap(), 9.0);
        assert_eq!(
            r.copy_with_values(vec![1.0, 2.0]),
            Err(RasterError::ShapeMismatch {
                expected: 6,
                got: 2
            })
        );
    }

    #[test]
    fn single_value_raster_answers_everywhere() {
        let r = SingleValueRaster::new(7.5);
        assert!(r.has_value_at_xy_of(&[1e9, -1e9, 0.0]));
        assert_eq!(r.value_at_xy_of(&[123.0, 456.0, 0.0]).unwrap(), 7.5);
        assert_eq!(r.values(), &[7.5]);

        let copied = r.copy_with_values(vec![1.0]).unwrap();
        assert_eq!(copied.value_at_xy_of_unchecked(&[0.0, 0.0, 0.0]), 1.0);
        assert_eq!(
            r.copy_with_values(vec![1.0, 2.0]),
            Err(RasterError::ShapeMismatch {
                expected: 1,
                got: 2
            })
        );
    }
}
