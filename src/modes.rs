//! Whole-cloud mode calculation: builds the spatial index once and runs the
//! per-point mean shift over every input point.
//!
//! Three variants exist, differing in how heights relate to the ground:
//! [`calculate_modes_normalized`] for clouds whose z values are heights
//! above ground already, [`calculate_modes_terraneous`] for absolute
//! heights with a ground elevation grid, and [`calculate_modes_flexible`]
//! where the ground elevation and both canopy ratios may each be a full
//! grid or a single value wrapped in a
//! [`SingleValueRaster`](crate::raster::SingleValueRaster).
//!
//! Modes align 1:1 with the input points; rejected or cancelled points
//! carry NaN coordinates. When requested, all intermediate centroids are
//! returned as one flat list together with the index of the input point
//! each centroid belongs to.

use log::debug;

use crate::mean_shift::mode_and_centroids;
use crate::raster::{RasterLayer, SingleValueRaster};
use crate::spatial::{
    create_index_of_above_ground, create_index_of_above_ground_grid, create_index_of_finite,
    nan_point, Coordinate, Distance, Point3D, PointCloudIndex,
};

/// The number of modes to calculate between two progress callbacks.
///
/// Checking more often can slow the host down noticeably (console progress
/// bars do not handle very frequent updates well).
pub const NUM_MODES_PER_PROGRESS_TICK: usize = 2000;

/// Shared numeric parameters of the batch variants.
#[derive(Debug, Clone, Copy)]
pub struct ModeParams {
    /// Points closer to the ground than this are neither indexed nor given
    /// a mode.
    pub min_point_height_above_ground: Coordinate,
    /// Stop iterating once consecutive centroids are at most this far
    /// apart.
    pub centroid_convergence_distance: Distance,
    /// Upper bound on the number of centroids calculated per mode.
    pub max_num_centroids_per_mode: usize,
}

/// Per-run options of the batch variants.
///
/// The progress callback receives the number of completed modes every
/// [`NUM_MODES_PER_PROGRESS_TICK`] points (and once at the end of the run);
/// returning `false` cancels the run, leaving the modes of all unfinished
/// points NaN.
#[derive(Default)]
pub struct BatchOptions<'a> {
    pub also_return_centroids: bool,
    pub progress: Option<&'a mut dyn FnMut(usize) -> bool>,
}

/// All intermediate centroids of a batch run, flattened in input order.
#[derive(Debug, Clone, Default)]
pub struct CentroidList {
    /// The centroids, in input-point order and per point in calculation
    /// order; the last centroid of a point that did not hit the iteration
    /// cap equals its mode.
    pub centroids: Vec<Point3D>,
    /// For every entry of `centroids`, the index of the input point it was
    /// calculated for.
    pub point_indices: Vec<usize>,
}

/// Result of a batch run.
#[derive(Debug, Clone)]
pub struct ModeResult {
    /// One mode per input point; NaN coordinates mark points without a
    /// valid mode.
    pub modes: Vec<Point3D>,
    /// Present when `also_return_centroids` was set.
    pub centroids: Option<CentroidList>,
}

fn run_batch<G, D, H>(
    points: &[Point3D],
    indexed_point_cloud: &PointCloudIndex,
    params: &ModeParams,
    ground_height_grid: &G,
    crown_diameter_to_tree_height_grid: &D,
    crown_height_to_tree_height_grid: &H,
    mut options: BatchOptions,
) -> ModeResult
where
    G: RasterLayer<Coordinate>,
    D: RasterLayer<f64>,
    H: RasterLayer<f64>,
{
    let mut modes = Vec::with_capacity(points.len());
    let mut centroid_list = options.also_return_centroids.then(CentroidList::default);
    let mut cancelled = false;

    for (point_index, point) in points.iter().enumerate() {
        if cancelled {
            modes.push(nan_point());
            continue;
        }

        let (mode, centroids) = mode_and_centroids(
            point,
            indexed_point_cloud,
            params.min_point_height_above_ground,
            ground_height_grid,
            crown_diameter_to_tree_height_grid,
            crown_height_to_tree_height_grid,
            params.centroid_convergence_distance,
            params.max_num_centroids_per_mode,
            options.also_return_centroids,
        );
        modes.push(mode);
        if let Some(list) = centroid_list.as_mut() {
            list.point_indices
                .extend(std::iter::repeat(point_index).take(centroids.len()));
            list.centroids.extend(centroids);
        }

        let num_completed = point_index + 1;
        if num_completed % NUM_MODES_PER_PROGRESS_TICK == 0 {
            if let Some(progress) = options.progress.as_mut() {
                if !progress(num_completed) {
                    cancelled = true;
                }
            }
        }
    }

    if !cancelled && points.len() % NUM_MODES_PER_PROGRESS_TICK != 0 {
        if let Some(progress) = options.progress.as_mut() {
            progress(points.len());
        }
    }

    debug!(
        "calculated {} modes{}",
        modes.len(),
        if cancelled { " (run was cancelled)" } else { "" }
    );

    ModeResult {
        modes,
        centroids: centroid_list,
    }
}

/// Calculates one mode per input point; point heights are heights above
/// ground already.
pub fn calculate_modes_normalized(
    points: &[Point3D],
    params: &ModeParams,
    crown_diameter_to_tree_height: f64,
    crown_height_to_tree_height: f64,
    options: BatchOptions,
) -> ModeResult {
    let index = create_index_of_finite(points, params.min_point_height_above_ground);
    run_batch(
        points,
        &index,
        params,
        &SingleValueRaster::new(0.0),
        &SingleValueRaster::new(crown_diameter_to_tree_height),
        &SingleValueRaster::new(crown_height_to_tree_height),
        options,
    )
}

/// Calculates one mode per input point; point heights are absolute and
/// `ground_height_grid` supplies the local ground elevation.
pub fn calculate_modes_terraneous<G: RasterLayer<Coordinate>>(
    points: &[Point3D],
    params: &ModeParams,
    ground_height_grid: &G,
    crown_diameter_to_tree_height: f64,
    crown_height_to_tree_height: f64,
    options: BatchOptions,
) -> ModeResult {
    let index =
        create_index_of_above_ground(points, params.min_point_height_above_ground, ground_height_grid);
    run_batch(
        points,
        &index,
        params,
        ground_height_grid,
        &SingleValueRaster::new(crown_diameter_to_tree_height),
        &SingleValueRaster::new(crown_height_to_tree_height),
        options,
    )
}

/// Calculates one mode per input point with the ground elevation and both
/// canopy ratios supplied as grids (or single-value rasters).
pub fn calculate_modes_flexible<G, D, H>(
    points: &[Point3D],
    params: &ModeParams,
    ground_height_grid: &G,
    crown_diameter_to_tree_height_grid: &D,
    crown_height_to_tree_height_grid: &H,
    options: BatchOptions,
) -> ModeResult
where
    G: RasterLayer<Coordinate>,
    D: RasterLayer<f64>,
    H: RasterLayer<f64>,
{
    let min_height_above_ground_grid =
        SingleValueRaster::new(params.min_point_height_above_ground);
    let index = create_index_of_above_ground_grid(
        points,
        &min_height_above_ground_grid,
        ground_height_grid,
    );
    run_batch(
        points,
        &index,
        params,
        ground_height_grid,
        crown_diameter_to_tree_height_grid,
        crown_height_to_tree_height_grid,
        options,
    )
}
