//! Spatial primitives for the mode detection core: point types, distance
//! helpers, filtered point iteration, and the R*-tree index with its
//! vertical-cylinder query.
//!
//! The index is always constructed through one of the bulk-loading
//! `create_index_*` functions. Bulk loading (packing) produces a much
//! better balanced tree than one-by-one insertion, which is the whole
//! reason the filtered iterators below exist: they skip unusable points
//! lazily so that a single pass feeds the packing constructor.

use log::debug;
use rstar::{RStarInsertionStrategy, RTree, RTreeParams, AABB};

use crate::raster::RasterLayer;

/// Data type for coordinate values.
pub type Coordinate = f64;
/// Data type for distance values.
pub type Distance = f64;

/// A 2D point: (x, y).
pub type Point2D = [Coordinate; 2];
/// A 3D point: (x, y, z).
pub type Point3D = [Coordinate; 3];

/// Maximum number of elements per R*-tree node.
pub const MAX_NUM_ELEMENTS_PER_RTREE_NODE: usize = 8;

/// R*-tree parameters used for the point cloud index.
pub struct IndexParams;

impl RTreeParams for IndexParams {
    const MIN_SIZE: usize = 3;
    const MAX_SIZE: usize = MAX_NUM_ELEMENTS_PER_RTREE_NODE;
    const REINSERTION_COUNT: usize = 2;
    type DefaultInsertionStrategy = RStarInsertionStrategy;
}

/// R*-tree storing the filtered 3D point cloud.
pub type PointCloudIndex = RTree<Point3D, IndexParams>;

/// Indicates whether `point` has at least one non-finite coordinate value.
#[inline]
pub fn has_non_finite_coordinate_value(point: &Point3D) -> bool {
    // Z values are tested first because they are a tad more likely to be
    // non-finite.
    !point[2].is_finite() || !point[0].is_finite() || !point[1].is_finite()
}

/// Creates a 3D point with NaN coordinate values.
#[inline]
pub fn nan_point() -> Point3D {
    [f64::NAN, f64::NAN, f64::NAN]
}

/// Euclidean distance between two 3D points.
#[inline]
pub fn euclidean_distance(a: &Point3D, b: &Point3D) -> Distance {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    let dz = a[2] - b[2];
    (dx * dx + dy * dy + dz * dz).sqrt()
}

/// Squared distance between two 2D points.
///
/// Ordering-equivalent to the Euclidean distance and cheaper; used for all
/// radius comparisons on the query path.
#[inline]
pub fn comparable_distance_2d(a: &Point2D, b: &Point2D) -> Distance {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    dx * dx + dy * dy
}

/// Get the x and y value of a 3D point and return them as a 2D point.
#[inline]
pub fn xy_point_of(point: &Point3D) -> Point2D {
    [point[0], point[1]]
}

/// Calculates the weighted arithmetic mean of a set of points.
///
/// Returns `None` when the weights sum to zero, in which case no meaningful
/// mean exists.
pub fn weighted_mean_of(points: &[Point3D], weights: &[f64]) -> Option<Point3D> {
    debug_assert_eq!(points.len(), weights.len());

    let weight_sum: f64 = weights.iter().sum();
    if weight_sum == 0.0 {
        return None;
    }

    let mut sum = [0.0; 3];
    for (point, weight) in points.iter().zip(weights) {
        sum[0] += weight * point[0];
        sum[1] += weight * point[1];
        sum[2] += weight * point[2];
    }
    Some([sum[0] / weight_sum, sum[1] / weight_sum, sum[2] / weight_sum])
}

// ---------------------------------------------------------------------------
// Filtered point iteration
// ---------------------------------------------------------------------------

/// Iterates over 3D points, skipping points with non-finite coordinate
/// values and points below a minimum height.
pub struct FinitePointsAboveHeight<'a> {
    points: std::slice::Iter<'a, Point3D>,
    min_height: Coordinate,
}

impl<'a> FinitePointsAboveHeight<'a> {
    pub fn new(points: &'a [Point3D], min_height: Coordinate) -> Self {
        Self {
            points: points.iter(),
            min_height,
        }
    }
}

impl<'a> Iterator for FinitePointsAboveHeight<'a> {
    type Item = &'a Point3D;

    fn next(&mut self) -> Option<Self::Item> {
        let min_height = self.min_height;
        self.points
            .find(|p| !has_non_finite_coordinate_value(p) && p[2] >= min_height)
    }
}

/// Iterates over 3D points, skipping points with non-finite coordinate
/// values, points at non-finite ground heights, and points below a minimum
/// height above ground.
///
/// Points are expected to lie within the ground grid's extent; the lookup
/// is unchecked.
pub struct FinitePointsAboveGround<'a, G> {
    points: std::slice::Iter<'a, Point3D>,
    min_height_above_ground: Coordinate,
    ground_height_grid: &'a G,
}

impl<'a, G: RasterLayer<Coordinate>> FinitePointsAboveGround<'a, G> {
    pub fn new(
        points: &'a [Point3D],
        min_height_above_ground: Coordinate,
        ground_height_grid: &'a G,
    ) -> Self {
        Self {
            points: points.iter(),
            min_height_above_ground,
            ground_height_grid,
        }
    }
}

impl<'a, G: RasterLayer<Coordinate>> Iterator for FinitePointsAboveGround<'a, G> {
    type Item = &'a Point3D;

    fn next(&mut self) -> Option<Self::Item> {
        let min_height_above_ground = self.min_height_above_ground;
        let ground = self.ground_height_grid;
        self.points.find(|p| {
            if has_non_finite_coordinate_value(p) {
                return false;
            }
            let height_above_ground = p[2] - ground.value_at_xy_of_unchecked(p);
            height_above_ground.is_finite() && height_above_ground >= min_height_above_ground
        })
    }
}

/// Same as [`FinitePointsAboveGround`] but reads the minimum height above
/// ground from a grid as well, instead of using one scalar for all points.
pub struct FinitePointsAboveHeightGrid<'a, M, G> {
    points: std::slice::Iter<'a, Point3D>,
    min_height_above_ground_grid: &'a M,
    ground_height_grid: &'a G,
}

impl<'a, M, G> FinitePointsAboveHeightGrid<'a, M, G>
where
    M: RasterLayer<Coordinate>,
    G: RasterLayer<Coordinate>,
{
    pub fn new(
        points: &'a [Point3D],
        min_height_above_ground_grid: &'a M,
        ground_height_grid: &'a G,
    ) -> Self {
        Self {
            points: points.iter(),
            min_height_above_ground_grid,
            ground_height_grid,
        }
    }
}

impl<'a, M, G> Iterator for FinitePointsAboveHeightGrid<'a, M, G>
where
    M: RasterLayer<Coordinate>,
    G: RasterLayer<Coordinate>,
{
    type Item = &'a Point3D;

    fn next(&mut self) -> Option<Self::Item> {
        let min_grid = self.min_height_above_ground_grid;
        let ground = self.ground_height_grid;
        self.points.find(|p| {
            if has_non_finite_coordinate_value(p) {
                return false;
            }
            let height_above_ground = p[2] - ground.value_at_xy_of_unchecked(p);
            let min_height_above_ground = min_grid.value_at_xy_of_unchecked(p);
            height_above_ground.is_finite()
                && min_height_above_ground.is_finite()
                && height_above_ground >= min_height_above_ground
        })
    }
}

// ---------------------------------------------------------------------------
// Index creation
// ---------------------------------------------------------------------------

/// Builds the index from all finite points at or above `min_height`.
pub fn create_index_of_finite(points: &[Point3D], min_height: Coordinate) -> PointCloudIndex {
    let filtered: Vec<Point3D> = FinitePointsAboveHeight::new(points, min_height)
        .copied()
        .collect();
    debug!(
        "bulk-loading {} of {} points into the R*-tree",
        filtered.len(),
        points.len()
    );
    PointCloudIndex::bulk_load_with_params(filtered)
}

/// Builds the index from all finite points at or above
/// `min_height_above_ground`, with ground heights read from a grid.
pub fn create_index_of_above_ground<G: RasterLayer<Coordinate>>(
    points: &[Point3D],
    min_height_above_ground: Coordinate,
    ground_height_grid: &G,
) -> PointCloudIndex {
    let filtered: Vec<Point3D> =
        FinitePointsAboveGround::new(points, min_height_above_ground, ground_height_grid)
            .copied()
            .collect();
    debug!(
        "bulk-loading {} of {} points into the R*-tree",
        filtered.len(),
        points.len()
    );
    PointCloudIndex::bulk_load_with_params(filtered)
}

/// Builds the index with both the ground height and the minimum height
/// above ground read from grids.
pub fn create_index_of_above_ground_grid<M, G>(
    points: &[Point3D],
    min_height_above_ground_grid: &M,
    ground_height_grid: &G,
) -> PointCloudIndex
where
    M: RasterLayer<Coordinate>,
    G: RasterLayer<Coordinate>,
{
    let filtered: Vec<Point3D> = FinitePointsAboveHeightGrid::new(
        points,
        min_height_above_ground_grid,
        ground_height_grid,
    )
    .copied()
    .collect();
    debug!(
        "bulk-loading {} of {} points into the R*-tree",
        filtered.len(),
        points.len()
    );
    PointCloudIndex::bulk_load_with_params(filtered)
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Returns all indexed points inside a vertical cylinder.
///
/// The cylinder has radius `radius` around `xy_center` and spans
/// `[bottom_height, top_height]` along z, both bounds inclusive. Candidates
/// come from a bounding-box envelope query and are refined with the exact
/// z-interval and squared-radius predicates.
pub fn points_intersecting_vertical_cylinder(
    point_cloud: &PointCloudIndex,
    xy_center: &Point2D,
    radius: Distance,
    bottom_height: Coordinate,
    top_height: Coordinate,
) -> Vec<Point3D> {
    let envelope = AABB::from_corners(
        [xy_center[0] - radius, xy_center[1] - radius, bottom_height],
        [xy_center[0] + radius, xy_center[1] + radius, top_height],
    );
    let comparable_radius = radius * radius;

    point_cloud
        .locate_in_envelope_intersecting(&envelope)
        .filter(|p| {
            bottom_height <= p[2]
                && p[2] <= top_height
                && comparable_distance_2d(&xy_point_of(p), xy_center) <= comparable_radius
        })
        .copied()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::{Raster, SingleValueRaster};

    #[test]
    fn finite_points_above_height_skips_unusable_points() {
        let points = vec![
            [0.0, 0.0, 5.0],
            [f64::NAN, 0.0, 6.0],
            [1.0, 1.0, 0.5],
            [1.0, f64::INFINITY, 7.0],
            [2.0, 2.0, 1.0],
        ];
        let kept: Vec<Point3D> = FinitePointsAboveHeight::new(&points, 1.0)
            .copied()
            .collect();
        assert_eq!(kept, vec![[0.0, 0.0, 5.0], [2.0, 2.0, 1.0]]);
    }

    #[test]
    fn finite_points_above_ground_subtracts_the_ground_height() {
        // one cell at ground height 10 over [0, 10] x [0, 10]
        let ground = Raster::new(vec![10.0], 1, 1, 0.0, 10.0, 0.0, 10.0);
        let points = vec![
            [5.0, 5.0, 12.5], // 2.5 above ground
            [5.0, 5.0, 11.0], // 1.0 above ground
            [5.0, 5.0, 9.0],  // below ground
        ];
        let kept: Vec<Point3D> = FinitePointsAboveGround::new(&points, 2.0, &ground)
            .copied()
            .collect();
        assert_eq!(kept, vec![[5.0, 5.0, 12.5]]);
    }

    #[test]
    fn finite_points_above_ground_skips_non_finite_ground_cells() {
        let ground = Raster::new(vec![f64::NAN, 0.0], 1, 2, 0.0, 10.0, 0.0, 10.0);
        let points = vec![
            [2.0, 5.0, 8.0], // NaN ground cell
            [7.0, 5.0, 8.0],
        ];
        let kept: Vec<Point3D> = FinitePointsAboveGround::new(&points, 2.0, &ground)
            .copied()
            .collect();
        assert_eq!(kept, vec![[7.0, 5.0, 8.0]]);
    }

    #[test]
    fn finite_points_above_height_grid_reads_per_cell_minima() {
        let ground = SingleValueRaster::new(0.0);
        // min height 2 in the left cell, 6 in the right cell
        let min_grid = Raster::new(vec![2.0, 6.0], 1, 2, 0.0, 10.0, 0.0, 10.0);
        let points = vec![
            [2.0, 5.0, 4.0], // above the left minimum
            [7.0, 5.0, 4.0], // below the right minimum
            [7.0, 5.0, 6.5],
        ];
        let kept: Vec<Point3D> = FinitePointsAboveHeightGrid::new(&points, &min_grid, &ground)
            .copied()
            .collect();
        assert_eq!(kept, vec![[2.0, 5.0, 4.0], [7.0, 5.0, 6.5]]);
    }

    #[test]
    fn index_contains_exactly_the_filtered_subset() {
        let points = vec![
            [0.0, 0.0, 5.0],
            [f64::NAN, 0.0, 6.0],
            [1.0, 1.0, 0.5],
            [2.0, 2.0, 3.0],
        ];
        let index = create_index_of_finite(&points, 1.0);
        assert_eq!(index.size(), 2);
    }

    #[test]
    fn cylinder_query_bounds_are_inclusive() {
        let points = vec![
            [0.0, 0.0, 1.0],  // exactly at the bottom
            [0.0, 0.0, 5.0],  // exactly at the top
            [0.0, 0.0, 5.1],  // above the top
            [2.0, 0.0, 3.0],  // exactly on the radius
            [2.1, 0.0, 3.0],  // outside the radius
            [1.0, 1.0, 3.0],  // inside
        ];
        let index = create_index_of_finite(&points, 0.0);
        let mut found =
            points_intersecting_vertical_cylinder(&index, &[0.0, 0.0], 2.0, 1.0, 5.0);
        found.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(
            found,
            vec![
                [0.0, 0.0, 1.0],
                [0.0, 0.0, 5.0],
                [1.0, 1.0, 3.0],
                [2.0, 0.0, 3.0],
            ]
        );
    }

    #[test]
    fn cylinder_query_with_inverted_interval_is_empty() {
        let points = vec![[0.0, 0.0, 3.0]];
        let index = create_index_of_finite(&points, 0.0);
        let found = points_intersecting_vertical_cylinder(&index, &[0.0, 0.0], 2.0, 5.0, 1.0);
        assert!(found.is_empty());
    }

    #[test]
    fn weighted_mean_weights_the_components() {
        let points = vec![[0.0, 0.0, 0.0], [4.0, 2.0, 8.0]];
        let mean = weighted_mean_of(&points, &[1.0, 3.0]).unwrap();
        assert_eq!(mean, [3.0, 1.5, 6.0]);
    }

    #[test]
    fn weighted_mean_of_zero_weights_is_undefined() {
        let points = vec![[1.0, 1.0, 1.0], [2.0, 2.0, 2.0]];
        assert_eq!(weighted_mean_of(&points, &[0.0, 0.0]), None);
    }

    #[test]
    fn nan_point_has_only_non_finite_coordinates() {
        let p = nan_point();
        assert!(p.iter().all(|v| v.is_nan()));
        assert!(has_non_finite_coordinate_value(&p));
    }
}
