//! Mean shift adapted to finding tree crowns in 3D LiDAR point clouds, as
//! described by Ferraz et al. 2012 ("ams3d", the 3D adaptive mean shift).
//!
//! For every point of the cloud the algorithm searches the mode, roughly
//! the location of the tree crown the point belongs to:
//!
//! 1. A kernel is constructed: a vertical cylinder whose radius and height
//!    are proportional to the point's height above ground (the crown
//!    diameter and crown height to tree height ratios).
//! 2. The lower quarter of the symmetric kernel is truncated; the kernel
//!    objects here directly model the remaining upper three quarters.
//! 3. All cloud points intersecting the truncated kernel are collected and
//!    a weighted centroid is computed. Points close to the kernel center
//!    weigh more: an Epanechnikov profile on the horizontal distance and a
//!    Gaussian profile on the vertical distance.
//! 4. The kernel, keeping its radius and height, is re-centered on the
//!    centroid and the procedure repeats until consecutive centroids
//!    converge.
//!
//! Modes of points belonging to the same crown cluster shortly below the
//! crown apex; grouping those clusters into crown IDs (e.g. with DBSCAN)
//! happens downstream.
//!
//! Deviations from the published equations: equations (13) and (14) in
//! Ferraz et al. normalize a point's vertical distance to the kernel
//! boundary and subtract it from one; here the relative vertical distance
//! to the kernel *center* is computed directly. Also, since the profile
//! functions square their arguments anyway, the squared relative distances
//! are passed as-is and the squaring inside [`gauss_unsquared`] and
//! [`epanechnikov_unsquared`] is omitted; the numerical result is the same.

use crate::raster::{RasterError, RasterLayer, SingleValueRaster};
use crate::spatial::{
    comparable_distance_2d, euclidean_distance, has_non_finite_coordinate_value, nan_point,
    points_intersecting_vertical_cylinder, weighted_mean_of, xy_point_of, Coordinate, Distance,
    Point2D, Point3D, PointCloudIndex,
};

/// Coefficient of the Gaussian vertical kernel profile.
pub const GAUSSIAN_GAMMA: f64 = -5.0;

/// The Gaussian function f(x) = exp(GAUSSIAN_GAMMA * x²) but without
/// squaring x.
///
/// Analogous to equation (11) in Ferraz et al. 2012; callers pass squared
/// relative distances directly.
#[inline]
pub fn gauss_unsquared(x: f64) -> f64 {
    (GAUSSIAN_GAMMA * x).exp()
}

/// The Epanechnikov function f(x) = 1 − x² but without squaring x.
///
/// Analogous to parts of equation (14) in Ferraz et al. 2012.
#[inline]
pub fn epanechnikov_unsquared(x: f64) -> f64 {
    1.0 - x
}

/// A kernel with the shape of a three-dimensional vertical cylinder.
///
/// The cylinder models the upper three quarters of the symmetric kernel
/// centered on the point it was constructed around: the bottom end sits a
/// quarter of the full kernel height below the point (clamped at the
/// ground), and the stored center is the middle of the remaining cylinder.
#[derive(Debug, Clone)]
pub struct Kernel {
    /// Kernel's horizontal center.
    xy_center: Point2D,
    /// Kernel radius.
    radius: Distance,
    /// Distance between kernel's top and bottom.
    height: Distance,

    // Precomputed at construction because the centroid calculation uses
    // them for every queried point.
    half_height: Distance,
    half_height_squared: Distance,
    radius_squared: Distance,

    /// Absolute height of the kernel's top end.
    top_height: Coordinate,
    /// Absolute height of the kernel's center.
    center_height: Coordinate,
    /// Absolute height of the kernel's bottom end.
    bottom_height: Coordinate,
}

impl Kernel {
    /// Constructs a kernel around `center` whose z-coordinate is already a
    /// height above ground.
    pub fn new(
        center: &Point3D,
        crown_diameter_to_tree_height: f64,
        crown_height_to_tree_height: f64,
    ) -> Self {
        Self::with_ground_height(
            center,
            0.0,
            crown_diameter_to_tree_height,
            crown_height_to_tree_height,
        )
    }

    /// Constructs a kernel around `center`, with `ground_height_at_center`
    /// giving the ground elevation at the xy-location of `center`. The
    /// radius and height derive from the center's height above ground and
    /// the canopy ratios.
    pub fn with_ground_height(
        center: &Point3D,
        ground_height_at_center: Coordinate,
        crown_diameter_to_tree_height: f64,
        crown_height_to_tree_height: f64,
    ) -> Self {
        let height_above_ground = center[2] - ground_height_at_center;
        Self::with_dimensions(
            center,
            ground_height_at_center,
            height_above_ground * crown_diameter_to_tree_height / 2.0,
            height_above_ground * crown_height_to_tree_height,
        )
    }

    /// Constructs a kernel of the given radius and height around `center`.
    ///
    /// The bottom end sits a quarter of `height` below `center` but never
    /// below the ground.
    pub fn with_dimensions(
        center: &Point3D,
        ground_height_at_center: Coordinate,
        radius: Distance,
        height: Distance,
    ) -> Self {
        let height_above_ground = center[2] - ground_height_at_center;
        let mut bottom_height_above_ground = height_above_ground - height * 0.25;
        if bottom_height_above_ground < 0.0 {
            bottom_height_above_ground = 0.0;
        }
        let bottom_height = ground_height_at_center + bottom_height_above_ground;
        let half_height = height / 2.0;

        Self {
            xy_center: xy_point_of(center),
            radius,
            height,
            half_height,
            half_height_squared: half_height * half_height,
            radius_squared: radius * radius,
            top_height: bottom_height + height,
            center_height: bottom_height + half_height,
            bottom_height,
        }
    }

    /// The same kernel placed around a new center: radius and height are
    /// kept, only the cylinder's position follows `center`.
    pub fn moved_to(&self, center: &Point3D, ground_height_at_center: Coordinate) -> Self {
        Self::with_dimensions(center, ground_height_at_center, self.radius, self.height)
    }

    /// Above-ground height of a kernel's bottom side given the height of
    /// the point around which the kernel is constructed and a crown height
    /// to tree height ratio.
    pub fn bottom_height_above_ground_with(
        point_height_above_ground: Coordinate,
        crown_height_to_tree_height: f64,
    ) -> Coordinate {
        let bottom_height_above_ground = point_height_above_ground
            - point_height_above_ground * crown_height_to_tree_height * 0.25;

        if bottom_height_above_ground < 0.0 {
            0.0
        } else {
            bottom_height_above_ground
        }
    }

    /// Maps a crown height to tree height ratio grid to a grid of kernel
    /// bottom heights for a point at `point_height_above_ground`.
    pub fn bottom_height_above_ground_grid_with<R: RasterLayer<f64>>(
        point_height_above_ground: Coordinate,
        crown_height_to_tree_height_grid: &R,
    ) -> Result<R, RasterError> {
        let bottom_heights = crown_height_to_tree_height_grid
            .values()
            .iter()
            .map(|&ratio| Self::bottom_height_above_ground_with(point_height_above_ground, ratio))
            .collect();

        crown_height_to_tree_height_grid.copy_with_values(bottom_heights)
    }

    pub fn radius(&self) -> Distance {
        self.radius
    }

    pub fn height(&self) -> Distance {
        self.height
    }

    pub fn top_height(&self) -> Coordinate {
        self.top_height
    }

    pub fn center_height(&self) -> Coordinate {
        self.center_height
    }

    pub fn bottom_height(&self) -> Coordinate {
        self.bottom_height
    }

    /// Searches for points in `point_cloud` that intersect with the kernel.
    fn find_intersecting_points_in(&self, point_cloud: &PointCloudIndex) -> Vec<Point3D> {
        points_intersecting_vertical_cylinder(
            point_cloud,
            &self.xy_center,
            self.radius,
            self.bottom_height,
            self.top_height,
        )
    }

    /// `point`'s squared distance to the kernel's center on the x-y-plane,
    /// normalized with the kernel's squared radius.
    ///
    /// Analogous to the argument to the function g^s in equation (15) in
    /// Ferraz et al. 2012.
    fn squared_relative_horizontal_distance_of_center_to(&self, point: &Point3D) -> Distance {
        comparable_distance_2d(&xy_point_of(point), &self.xy_center) / self.radius_squared
    }

    /// `point`'s squared distance to the kernel center along the z-axis,
    /// normalized with half the kernel's height squared.
    ///
    /// Analogous to parts of equations (13) and (14) in Ferraz et al. 2012.
    fn squared_relative_vertical_distance_of_center_to(&self, point: &Point3D) -> Distance {
        let dz = point[2] - self.center_height;
        (dz * dz) / self.half_height_squared
    }

    /// The weight of a point inside the kernel according to the kernel's
    /// horizontal and vertical profile.
    fn point_weight_of(&self, point: &Point3D) -> f64 {
        epanechnikov_unsquared(self.squared_relative_horizontal_distance_of_center_to(point))
            * gauss_unsquared(self.squared_relative_vertical_distance_of_center_to(point))
    }

    /// The kernel's weighted centroid within `point_cloud`, or `None` when
    /// no point intersects the kernel or all intersecting points have zero
    /// weight.
    pub fn calculate_centroid_in(&self, point_cloud: &PointCloudIndex) -> Option<Point3D> {
        let points = self.find_intersecting_points_in(point_cloud);
        if points.is_empty() {
            return None;
        }

        let weights: Vec<f64> = points.iter().map(|p| self.point_weight_of(p)).collect();
        weighted_mean_of(&points, &weights)
    }
}

/// Shared mean-shift iteration behind the public single-mode functions.
///
/// The kernel's radius and height derive once from the candidate's height
/// above ground, and the ground height and canopy ratios are read once at
/// the candidate's location; the kernel geometry is fixed by the candidate
/// and only its center follows the centroids.
pub(crate) fn mode_and_centroids<G, D, H>(
    point: &Point3D,
    indexed_point_cloud: &PointCloudIndex,
    min_point_height_above_ground: Coordinate,
    ground_height_grid: &G,
    crown_diameter_to_tree_height_grid: &D,
    crown_height_to_tree_height_grid: &H,
    centroid_convergence_distance: Distance,
    max_num_centroids_per_mode: usize,
    collect_centroids: bool,
) -> (Point3D, Vec<Point3D>)
where
    G: RasterLayer<Coordinate>,
    D: RasterLayer<f64>,
    H: RasterLayer<f64>,
{
    if has_non_finite_coordinate_value(point) {
        return (nan_point(), Vec::new());
    }
    if !ground_height_grid.has_value_at_xy_of(point)
        || !crown_diameter_to_tree_height_grid.has_value_at_xy_of(point)
        || !crown_height_to_tree_height_grid.has_value_at_xy_of(point)
    {
        return (nan_point(), Vec::new());
    }

    let ground_height = ground_height_grid.value_at_xy_of_unchecked(point);
    let crown_diameter_to_tree_height =
        crown_diameter_to_tree_height_grid.value_at_xy_of_unchecked(point);
    let crown_height_to_tree_height =
        crown_height_to_tree_height_grid.value_at_xy_of_unchecked(point);
    if !ground_height.is_finite()
        || !crown_diameter_to_tree_height.is_finite()
        || !crown_height_to_tree_height.is_finite()
    {
        return (nan_point(), Vec::new());
    }
    if point[2] - ground_height < min_point_height_above_ground {
        return (nan_point(), Vec::new());
    }

    let mut kernel = Kernel::with_ground_height(
        point,
        ground_height,
        crown_diameter_to_tree_height,
        crown_height_to_tree_height,
    );
    let mut current = *point;
    let mut centroids = Vec::new();

    for num_centroids in 1..=max_num_centroids_per_mode {
        let Some(centroid) = kernel.calculate_centroid_in(indexed_point_cloud) else {
            // Nothing to average over: treat as converged at the previous
            // center, or as no mode at all if that happens right away.
            if num_centroids == 1 {
                return (nan_point(), Vec::new());
            }
            return (current, centroids);
        };

        if collect_centroids {
            centroids.push(centroid);
        }

        let step = euclidean_distance(&centroid, &current);
        current = centroid;
        if step <= centroid_convergence_distance {
            break;
        }
        kernel = kernel.moved_to(&current, ground_height);
    }

    (current, centroids)
}

/// Calculates the mode of `point` within `indexed_point_cloud`; point
/// heights are heights above ground already.
///
/// Returns a point with NaN coordinate values if any of `point`'s
/// coordinate values are non-finite or `point` lies below
/// `min_point_height_above_ground`.
pub fn calculate_a_single_mode_normalized(
    point: &Point3D,
    indexed_point_cloud: &PointCloudIndex,
    min_point_height_above_ground: Coordinate,
    crown_diameter_to_tree_height: f64,
    crown_height_to_tree_height: f64,
    centroid_convergence_distance: Distance,
    max_num_centroids_per_mode: usize,
) -> Point3D {
    mode_and_centroids(
        point,
        indexed_point_cloud,
        min_point_height_above_ground,
        &SingleValueRaster::new(0.0),
        &SingleValueRaster::new(crown_diameter_to_tree_height),
        &SingleValueRaster::new(crown_height_to_tree_height),
        centroid_convergence_distance,
        max_num_centroids_per_mode,
        false,
    )
    .0
}

/// Same as [`calculate_a_single_mode_normalized`] but also returns the
/// calculated centroids, in order.
pub fn calculate_a_single_mode_normalized_plus_centroids(
    point: &Point3D,
    indexed_point_cloud: &PointCloudIndex,
    min_point_height_above_ground: Coordinate,
    crown_diameter_to_tree_height: f64,
    crown_height_to_tree_height: f64,
    centroid_convergence_distance: Distance,
    max_num_centroids_per_mode: usize,
) -> (Point3D, Vec<Point3D>) {
    mode_and_centroids(
        point,
        indexed_point_cloud,
        min_point_height_above_ground,
        &SingleValueRaster::new(0.0),
        &SingleValueRaster::new(crown_diameter_to_tree_height),
        &SingleValueRaster::new(crown_height_to_tree_height),
        centroid_convergence_distance,
        max_num_centroids_per_mode,
        true,
    )
}

/// Calculates the mode of `point` within `indexed_point_cloud`; point
/// heights are absolute and `ground_height_grid` supplies the local ground
/// elevation.
///
/// Returns a point with NaN coordinate values if any coordinate value of
/// `point` is non-finite, `point` lies below
/// `min_point_height_above_ground`, or the ground height at `point` is
/// missing or non-finite.
pub fn calculate_a_single_mode_terraneous<G: RasterLayer<Coordinate>>(
    point: &Point3D,
    indexed_point_cloud: &PointCloudIndex,
    min_point_height_above_ground: Coordinate,
    ground_height_grid: &G,
    crown_diameter_to_tree_height: f64,
    crown_height_to_tree_height: f64,
    centroid_convergence_distance: Distance,
    max_num_centroids_per_mode: usize,
) -> Point3D {
    mode_and_centroids(
        point,
        indexed_point_cloud,
        min_point_height_above_ground,
        ground_height_grid,
        &SingleValueRaster::new(crown_diameter_to_tree_height),
        &SingleValueRaster::new(crown_height_to_tree_height),
        centroid_convergence_distance,
        max_num_centroids_per_mode,
        false,
    )
    .0
}

/// Same as [`calculate_a_single_mode_terraneous`] but also returns the
/// calculated centroids, in order.
pub fn calculate_a_single_mode_terraneous_plus_centroids<G: RasterLayer<Coordinate>>(
    point: &Point3D,
    indexed_point_cloud: &PointCloudIndex,
    min_point_height_above_ground: Coordinate,
    ground_height_grid: &G,
    crown_diameter_to_tree_height: f64,
    crown_height_to_tree_height: f64,
    centroid_convergence_distance: Distance,
    max_num_centroids_per_mode: usize,
) -> (Point3D, Vec<Point3D>) {
    mode_and_centroids(
        point,
        indexed_point_cloud,
        min_point_height_above_ground,
        ground_height_grid,
        &SingleValueRaster::new(crown_diameter_to_tree_height),
        &SingleValueRaster::new(crown_height_to_tree_height),
        centroid_convergence_distance,
        max_num_centroids_per_mode,
        true,
    )
}

/// Calculates the mode of `point` within `indexed_point_cloud` with the
/// ground height and both canopy ratios supplied as grids.
///
/// Returns a point with NaN coordinate values if any coordinate value of
/// `point` is non-finite, `point` lies below
/// `min_point_height_above_ground`, or any grid value at `point` is
/// missing or non-finite.
pub fn calculate_a_single_mode_flexible<G, D, H>(
    point: &Point3D,
    indexed_point_cloud: &PointCloudIndex,
    min_point_height_above_ground: Coordinate,
    ground_height_grid: &G,
    crown_diameter_to_tree_height_grid: &D,
    crown_height_to_tree_height_grid: &H,
    centroid_convergence_distance: Distance,
    max_num_centroids_per_mode: usize,
) -> Point3D
where
    G: RasterLayer<Coordinate>,
    D: RasterLayer<f64>,
    H: RasterLayer<f64>,
{
    mode_and_centroids(
        point,
        indexed_point_cloud,
        min_point_height_above_ground,
        ground_height_grid,
        crown_diameter_to_tree_height_grid,
        crown_height_to_tree_height_grid,
        centroid_convergence_distance,
        max_num_centroids_per_mode,
        false,
    )
    .0
}

/// Same as [`calculate_a_single_mode_flexible`] but also returns the
/// calculated centroids, in order.
pub fn calculate_a_single_mode_flexible_plus_centroids<G, D, H>(
    point: &Point3D,
    indexed_point_cloud: &PointCloudIndex,
    min_point_height_above_ground: Coordinate,
    ground_height_grid: &G,
    crown_diameter_to_tree_height_grid: &D,
    crown_height_to_tree_height_grid: &H,
    centroid_convergence_distance: Distance,
    max_num_centroids_per_mode: usize,
) -> (Point3D, Vec<Point3D>)
where
    G: RasterLayer<Coordinate>,
    D: RasterLayer<f64>,
    H: RasterLayer<f64>,
{
    mode_and_centroids(
        point,
        indexed_point_cloud,
        min_point_height_above_ground,
        ground_height_grid,
        crown_diameter_to_tree_height_grid,
        crown_height_to_tree_height_grid,
        centroid_convergence_distance,
        max_num_centroids_per_mode,
        true,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spatial::create_index_of_finite;

    #[test]
    fn kernel_geometry_follows_the_canopy_ratios() {
        // height above ground 10, ratios 0.4 and 0.6
        let kernel = Kernel::new(&[3.0, 4.0, 10.0], 0.4, 0.6);
        assert_eq!(kernel.height(), 6.0);
        assert_eq!(kernel.radius(), 2.0);
        // bottom a quarter of the kernel height below the point
        assert_eq!(kernel.bottom_height(), 8.5);
        assert_eq!(kernel.top_height(), 14.5);
        assert_eq!(kernel.center_height(), 11.5);
    }

    #[test]
    fn kernel_geometry_shifts_with_the_ground_height() {
        let low = Kernel::new(&[0.0, 0.0, 10.0], 0.4, 0.6);
        let high = Kernel::with_ground_height(&[0.0, 0.0, 110.0], 100.0, 0.4, 0.6);
        assert_eq!(high.height(), low.height());
        assert_eq!(high.radius(), low.radius());
        assert_eq!(high.bottom_height(), low.bottom_height() + 100.0);
        assert_eq!(high.top_height(), low.top_height() + 100.0);
    }

    #[test]
    fn kernel_bottom_is_clamped_at_the_ground() {
        assert_eq!(Kernel::bottom_height_above_ground_with(10.0, 0.6), 8.5);
        // ratios above four would push the bottom below the ground
        assert_eq!(Kernel::bottom_height_above_ground_with(1.0, 5.0), 0.0);
    }

    #[test]
    fn bottom_height_grid_maps_every_cell() {
        use crate::raster::{Raster, RasterLayer};

        let ratio_grid = Raster::new(vec![0.4, 0.8], 1, 2, 0.0, 2.0, 0.0, 1.0);
        let bottom_grid = Kernel::bottom_height_above_ground_grid_with(10.0, &ratio_grid).unwrap();
        assert_eq!(bottom_grid.values(), &[9.0, 8.0]);
    }

    #[test]
    fn point_weights_combine_both_kernel_profiles() {
        let kernel = Kernel::new(&[0.0, 0.0, 10.0], 0.4, 0.6);
        // r = 2, center height 11.5, half height 3
        let point = [1.0, 0.0, 10.0];
        let s_h = 1.0 / 4.0;
        let s_v = (10.0f64 - 11.5).powi(2) / 9.0;
        let expected = (1.0 - s_h) * (GAUSSIAN_GAMMA * s_v).exp();
        assert_eq!(kernel.point_weight_of(&point), expected);
    }

    #[test]
    fn centroid_of_an_empty_region_is_undefined() {
        let points = vec![[100.0, 100.0, 10.0]];
        let index = create_index_of_finite(&points, 0.0);
        let kernel = Kernel::new(&[0.0, 0.0, 10.0], 0.4, 0.6);
        assert_eq!(kernel.calculate_centroid_in(&index), None);
    }

    #[test]
    fn non_finite_candidates_yield_a_nan_mode() {
        let points = vec![[0.0, 0.0, 10.0]];
        let index = create_index_of_finite(&points, 0.0);
        let (mode, centroids) = calculate_a_single_mode_normalized_plus_centroids(
            &[f64::NAN, 0.0, 10.0],
            &index,
            1.0,
            0.4,
            0.6,
            0.01,
            50,
        );
        assert!(mode.iter().all(|v| v.is_nan()));
        assert!(centroids.is_empty());
    }

    #[test]
    fn candidates_below_the_minimum_height_yield_a_nan_mode() {
        let points = vec![[0.0, 0.0, 0.5], [0.0, 0.0, 10.0]];
        let index = create_index_of_finite(&points, 0.0);
        let (mode, centroids) = calculate_a_single_mode_normalized_plus_centroids(
            &[0.0, 0.0, 0.5],
            &index,
            1.0,
            0.4,
            0.6,
            0.01,
            50,
        );
        assert!(mode.iter().all(|v| v.is_nan()));
        assert!(centroids.is_empty());
    }

    #[test]
    fn a_degenerate_first_step_yields_a_nan_mode() {
        let index = create_index_of_finite(&[], 0.0);
        let mode = calculate_a_single_mode_normalized(
            &[0.0, 0.0, 10.0],
            &index,
            1.0,
            0.4,
            0.6,
            0.01,
            50,
        );
        assert!(mode.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn candidates_outside_the_ground_grid_yield_a_nan_mode() {
        use crate::raster::Raster;

        let ground = Raster::new(vec![0.0], 1, 1, 0.0, 10.0, 0.0, 10.0);
        let points = vec![[50.0, 50.0, 10.0]];
        let index = create_index_of_finite(&points, 0.0);
        let mode = calculate_a_single_mode_terraneous(
            &[50.0, 50.0, 10.0],
            &index,
            1.0,
            &ground,
            0.4,
            0.6,
            0.01,
            50,
        );
        assert!(mode.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn the_last_centroid_is_the_mode() {
        // a compact cluster every point of which sees the whole cluster
        let points = vec![
            [10.0, 10.0, 10.0],
            [10.4, 10.0, 10.2],
            [10.0, 10.4, 10.4],
            [9.6, 10.0, 10.1],
            [10.0, 9.6, 10.3],
        ];
        let index = create_index_of_finite(&points, 0.0);
        let (mode, centroids) = calculate_a_single_mode_normalized_plus_centroids(
            &points[0],
            &index,
            1.0,
            0.4,
            0.6,
            0.01,
            50,
        );
        assert!(!centroids.is_empty());
        assert!(centroids.len() < 50);
        let last = centroids.last().unwrap();
        assert_eq!(euclidean_distance(last, &mode), 0.0);
        assert!(mode.iter().all(|v| v.is_finite()));
    }
}
