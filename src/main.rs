//! Tree crown mode detection from a CSV point cloud.
//!
//! Usage:
//!   cargo run --release -- points.csv
//!   cargo run --release -- points.csv --ground DTM.tif --min-height 2 --centroids centroids.csv
//!
//! Produces:
//!   modes.csv — point_index, x, y, z, mode_x, mode_y, mode_z

use crownsegmentr::{
    calculate_modes_normalized, calculate_modes_terraneous, BatchOptions, ModeParams, ModeResult,
    Point3D, Raster, SingleValueRaster,
};
use std::fs::File;
use std::io::{BufReader, BufWriter};

use clap::Parser;
use csv::Writer;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::tags::Tag;

// ==========================================================================
// GeoTIFF georeferencing (ModelPixelScale + ModelTiepoint)
// ==========================================================================

/// Cell size and top-left origin of a GeoTIFF.
///
/// Falls back to 1 m cells at origin (0, 0) when the georeferencing tags
/// are absent, so plain TIFFs can still be used with point clouds living
/// in pixel coordinates.
struct GeoTransform {
    res_x: f64,
    res_y: f64,
    origin_x: f64,
    origin_y: f64,
}

impl Default for GeoTransform {
    fn default() -> Self {
        Self {
            res_x: 1.0,
            res_y: 1.0,
            origin_x: 0.0,
            origin_y: 0.0,
        }
    }
}

fn read_f64_tag<R: std::io::Read + std::io::Seek>(
    decoder: &mut Decoder<R>,
    tag: Tag,
) -> Option<Vec<f64>> {
    decoder.find_tag(tag).ok().flatten()?.into_f64_vec().ok()
}

fn geo_transform_of<R: std::io::Read + std::io::Seek>(decoder: &mut Decoder<R>) -> GeoTransform {
    let mut transform = GeoTransform::default();

    match read_f64_tag(decoder, Tag::ModelPixelScaleTag) {
        Some(scale) if scale.len() >= 2 => {
            transform.res_x = scale[0];
            transform.res_y = scale[1];
        }
        _ => eprintln!("⚠ no usable ModelPixelScale tag, assuming 1 m cells"),
    }

    // A tiepoint maps raster location (i, j, k) to model location (x, y, z);
    // the top-left corner convention puts the model x and y at indices 3
    // and 4.
    match read_f64_tag(decoder, Tag::ModelTiepointTag) {
        Some(tiepoint) if tiepoint.len() >= 6 => {
            transform.origin_x = tiepoint[3];
            transform.origin_y = tiepoint[4];
        }
        _ => eprintln!("⚠ no usable ModelTiepoint tag, assuming origin (0, 0)"),
    }

    transform
}

// ==========================================================================
// Loading
// ==========================================================================

fn load_ground_geotiff(path: &str) -> Raster<f64> {
    let file = File::open(path).unwrap_or_else(|e| {
        eprintln!("Cannot open '{}': {}", path, e);
        std::process::exit(1);
    });
    let mut decoder = Decoder::new(BufReader::new(file)).unwrap_or_else(|e| {
        eprintln!("TIFF decoding error: {}", e);
        std::process::exit(1);
    });

    let (width, height) = decoder.dimensions().unwrap_or_else(|e| {
        eprintln!("TIFF dimension error: {}", e);
        std::process::exit(1);
    });
    let num_cols = width as usize;
    let num_rows = height as usize;

    let transform = geo_transform_of(&mut decoder);

    let x_min = transform.origin_x;
    let y_max = transform.origin_y;
    let x_max = x_min + num_cols as f64 * transform.res_x;
    let y_min = y_max - num_rows as f64 * transform.res_y;
    println!(
        "  extent: x [{:.2}, {:.2}], y [{:.2}, {:.2}]",
        x_min, x_max, y_min, y_max
    );

    let result = decoder.read_image().unwrap_or_else(|e| {
        eprintln!("TIFF read error: {}", e);
        std::process::exit(1);
    });

    let raw: Vec<f64> = match result {
        DecodingResult::F64(v) => v,
        DecodingResult::F32(v) => v.iter().map(|x| *x as f64).collect(),
        DecodingResult::U16(v) => v.iter().map(|x| *x as f64).collect(),
        DecodingResult::U8(v) => v.iter().map(|x| *x as f64).collect(),
        _ => {
            eprintln!("Unsupported pixel format");
            std::process::exit(1);
        }
    };

    // Multi-band rasters (interleaved): the ground elevation is expected in
    // the first band.
    let total_pixels = num_rows * num_cols;
    let num_bands = raw.len() / total_pixels;
    let values: Vec<f64> = if num_bands > 1 {
        println!("  {} bands detected — using band 0", num_bands);
        (0..total_pixels).map(|px| raw[px * num_bands]).collect()
    } else {
        raw
    };

    Raster::new(values, num_rows, num_cols, x_min, x_max, y_min, y_max)
}

fn load_points_csv(path: &str, has_header: bool) -> Vec<Point3D> {
    let file = File::open(path).unwrap_or_else(|e| {
        eprintln!("Cannot open '{}': {}", path, e);
        std::process::exit(1);
    });
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(has_header)
        .trim(csv::Trim::All)
        .from_reader(BufReader::new(file));

    let mut points: Vec<Point3D> = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record.unwrap_or_else(|e| {
            eprintln!("CSV read error at record {}: {}", line + 1, e);
            std::process::exit(1);
        });
        if record.len() < 3 {
            eprintln!(
                "Record {} has {} fields, expected at least x,y,z",
                line + 1,
                record.len()
            );
            std::process::exit(1);
        }
        let parse_coordinate = |index: usize| -> f64 {
            let field = &record[index];
            if field.is_empty() || field.eq_ignore_ascii_case("na") || field.eq_ignore_ascii_case("nan")
            {
                return f64::NAN;
            }
            field.parse().unwrap_or_else(|_| {
                eprintln!("Record {}: cannot parse '{}' as a number", line + 1, field);
                std::process::exit(1);
            })
        };
        points.push([parse_coordinate(0), parse_coordinate(1), parse_coordinate(2)]);
    }
    points
}

// ==========================================================================
// CSV export
// ==========================================================================

fn format_coordinate(value: f64) -> String {
    if value.is_nan() {
        "NA".to_string()
    } else {
        format!("{:.3}", value)
    }
}

fn export_modes_csv(points: &[Point3D], modes: &[Point3D], path: &str) {
    let file = File::create(path).unwrap_or_else(|e| {
        eprintln!("Cannot create '{}': {}", path, e);
        std::process::exit(1);
    });
    let mut wtr = Writer::from_writer(BufWriter::new(file));

    wtr.write_record(["point_index", "x", "y", "z", "mode_x", "mode_y", "mode_z"])
        .unwrap();
    for (i, (point, mode)) in points.iter().zip(modes).enumerate() {
        wtr.write_record(&[
            i.to_string(),
            format_coordinate(point[0]),
            format_coordinate(point[1]),
            format_coordinate(point[2]),
            format_coordinate(mode[0]),
            format_coordinate(mode[1]),
            format_coordinate(mode[2]),
        ])
        .unwrap();
    }

    wtr.flush().unwrap_or_else(|e| {
        eprintln!("CSV flush error: {}", e);
        std::process::exit(1);
    });
}

fn export_centroids_csv(centroids: &[Point3D], point_indices: &[usize], path: &str) {
    let file = File::create(path).unwrap_or_else(|e| {
        eprintln!("Cannot create '{}': {}", path, e);
        std::process::exit(1);
    });
    let mut wtr = Writer::from_writer(BufWriter::new(file));

    wtr.write_record(["point_index", "x", "y", "z"]).unwrap();
    for (index, centroid) in point_indices.iter().zip(centroids) {
        wtr.write_record(&[
            index.to_string(),
            format_coordinate(centroid[0]),
            format_coordinate(centroid[1]),
            format_coordinate(centroid[2]),
        ])
        .unwrap();
    }

    wtr.flush().unwrap_or_else(|e| {
        eprintln!("CSV flush error: {}", e);
        std::process::exit(1);
    });
}

// ==========================================================================
// CLI (clap)
// ==========================================================================

#[derive(Parser, Debug)]
#[command(
    name = "crownsegmentr",
    about = "Tree crown mode detection in LiDAR point clouds (adaptive mean shift)",
    after_help = "Produces: modes.csv — point_index, x, y, z, mode_x, mode_y, mode_z"
)]
struct Cli {
    /// Input point cloud CSV with columns x,y,z (NA/empty fields become NaN)
    #[arg(value_name = "points.csv")]
    points_path: String,

    /// Ground elevation GeoTIFF; when given, z values are absolute heights
    #[arg(long, value_name = "ground.tif")]
    ground: Option<String>,

    /// Constant ground elevation as an alternative to --ground
    #[arg(long, value_name = "m", conflicts_with = "ground")]
    ground_height: Option<f64>,

    /// Minimum point height above ground (m)
    #[arg(long, default_value_t = 2.0)]
    min_height: f64,

    /// Crown diameter to tree height ratio
    #[arg(long, default_value_t = 0.6)]
    diameter_ratio: f64,

    /// Crown height to tree height ratio
    #[arg(long, default_value_t = 0.5)]
    height_ratio: f64,

    /// Distance below which consecutive centroids count as converged (m)
    #[arg(long, default_value_t = 0.1)]
    convergence: f64,

    /// Maximum number of centroids per mode
    #[arg(long, default_value_t = 200)]
    max_centroids: usize,

    /// The input CSV has a header row
    #[arg(long)]
    header: bool,

    /// Also export all intermediate centroids to this CSV
    #[arg(long, value_name = "centroids.csv")]
    centroids: Option<String>,

    /// Output CSV for the modes
    #[arg(long, short, default_value = "modes.csv")]
    output: String,
}

// ==========================================================================
// Main
// ==========================================================================

fn main() {
    let cli = Cli::parse();

    println!("══════════════════════════════════════════════════════════");
    println!("  crownsegmentr — tree crown modes via adaptive mean shift");
    println!("══════════════════════════════════════════════════════════\n");

    println!("1. Loading '{}'...", cli.points_path);
    let points = load_points_csv(&cli.points_path, cli.header);
    println!("   {} points read", points.len());

    let ground_raster: Option<Raster<f64>> = cli.ground.as_ref().map(|p| {
        println!("   Loading ground raster '{}'...", p);
        load_ground_geotiff(p)
    });

    println!("\n2. Parameters:");
    println!(
        "   min_height={:.1}m  diameter_ratio={:.2}  height_ratio={:.2}  convergence={:.3}m  max_centroids={}",
        cli.min_height, cli.diameter_ratio, cli.height_ratio, cli.convergence, cli.max_centroids
    );
    match (&ground_raster, cli.ground_height) {
        (Some(g), _) => println!(
            "   ground: raster {} × {} cells",
            g.num_cols(),
            g.num_rows()
        ),
        (None, Some(h)) => println!("   ground: constant elevation {:.2} m", h),
        (None, None) => println!("   ground: none (z values are heights above ground)"),
    }

    let params = ModeParams {
        min_point_height_above_ground: cli.min_height,
        centroid_convergence_distance: cli.convergence,
        max_num_centroids_per_mode: cli.max_centroids,
    };

    println!("\n3. Calculating modes...");
    let t0 = std::time::Instant::now();
    let total = points.len();
    let mut on_progress = |num_completed: usize| {
        println!("   {}/{} modes", num_completed, total);
        true
    };
    let options = BatchOptions {
        also_return_centroids: cli.centroids.is_some(),
        progress: Some(&mut on_progress),
    };

    let result: ModeResult = if let Some(ground) = &ground_raster {
        calculate_modes_terraneous(
            &points,
            &params,
            ground,
            cli.diameter_ratio,
            cli.height_ratio,
            options,
        )
    } else if let Some(ground_height) = cli.ground_height {
        calculate_modes_terraneous(
            &points,
            &params,
            &SingleValueRaster::new(ground_height),
            cli.diameter_ratio,
            cli.height_ratio,
            options,
        )
    } else {
        calculate_modes_normalized(
            &points,
            &params,
            cli.diameter_ratio,
            cli.height_ratio,
            options,
        )
    };
    let dt = t0.elapsed();

    let num_valid = result
        .modes
        .iter()
        .filter(|m| m.iter().all(|v| v.is_finite()))
        .count();
    println!(
        "   ✓ {} modes ({} valid, {} rejected) in {:.2}s\n",
        result.modes.len(),
        num_valid,
        result.modes.len() - num_valid,
        dt.as_secs_f64()
    );

    if num_valid > 0 {
        let zs: Vec<f64> = result
            .modes
            .iter()
            .filter(|m| m.iter().all(|v| v.is_finite()))
            .map(|m| m[2])
            .collect();
        let z_min = zs.iter().cloned().fold(f64::INFINITY, f64::min);
        let z_max = zs.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let z_mean = zs.iter().sum::<f64>() / zs.len() as f64;
        println!("4. Mode heights: min={:.1}  mean={:.1}  max={:.1}", z_min, z_mean, z_max);
    }

    println!("\n5. Export → '{}'", cli.output);
    export_modes_csv(&points, &result.modes, &cli.output);
    println!("   {} rows written.", result.modes.len());

    if let (Some(path), Some(centroids)) = (&cli.centroids, &result.centroids) {
        println!("   Centroids → '{}'", path);
        export_centroids_csv(&centroids.centroids, &centroids.point_indices, path);
        println!("   {} rows written.", centroids.centroids.len());
    }

    println!("\n══════════════════════════════════════════════════════════");
    println!(
        "  ✓ Done — {} modes from {} points",
        num_valid,
        points.len()
    );
    println!("══════════════════════════════════════════════════════════");
}
