//! # crownsegmentr — Rust transpilation of the crownsegmentr R package core
//!
//! Identification of tree crowns within airborne LiDAR 3D point clouds.
//! Transpiled from the C++ core of the R package crownsegmentr by
//! Leon Steinmeier and Nikolai Knapp (UFZ Leipzig), GPL-3.
//!
//! This crate provides:
//! - **Mode detection**: [`calculate_modes_normalized`],
//!   [`calculate_modes_terraneous`], [`calculate_modes_flexible`] run the
//!   adaptive mean shift (AMS3D, Ferraz et al. 2012) over a whole cloud;
//!   `calculate_a_single_mode_*` expose the per-point iteration.
//! - **Spatial plumbing**: an R*-tree point index with vertical-cylinder
//!   queries, filtered bulk-loading iterators, and world-indexed raster
//!   grids for ground elevation and canopy shape ratios.
//!
//! Modes of points belonging to the same crown cluster just below the
//! crown apex; grouping modes into crown IDs (e.g. with DBSCAN) is left to
//! downstream tooling.
//!
//! Reference: Ferraz, A. et al. 2012. *3-D mapping of a multi-layered
//! Mediterranean forest using ALS data*. Remote Sensing of Environment 121.

pub mod mean_shift;
pub mod modes;
pub mod raster;
pub mod spatial;

pub use mean_shift::*;
pub use modes::*;
pub use raster::{Raster, RasterError, RasterLayer, SingleValueRaster};
pub use spatial::*;
