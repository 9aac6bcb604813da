//! Seed points with per-seed material data.
//!
//! Seeds are either generated from a random stream or imported from text files. Every
//! element is later given the material data of the seed nearest to its centroid.
use crate::config::{ImportSettings, MaterialKind, SeedingSettings, SeedingStrategy};
use crate::error::{MultiscaleError, Result};
use crate::io::text::read_table_with_columns;
use itertools::Itertools;
use log::debug;
use nalgebra::{Matrix3, Point3};
use ordered_float::OrderedFloat;
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal, Uniform};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Number of classification buckets of seed indices.
pub const NUM_SEED_CLASSES: usize = 50;

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub enum MaterialData {
    /// Row-major rotation tensor.
    Rotation([f64; 9]),
    /// Bunge Euler angles `(phi1, Phi, phi2)` in radians.
    OrientationAngles([f64; 3]),
}

impl MaterialData {
    pub fn kind(&self) -> MaterialKind {
        match self {
            MaterialData::Rotation(_) => MaterialKind::Rotation,
            MaterialData::OrientationAngles(_) => MaterialKind::OrientationAngles,
        }
    }

    pub fn as_slice(&self) -> &[f64] {
        match self {
            MaterialData::Rotation(r) => r,
            MaterialData::OrientationAngles(a) => a,
        }
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        match self {
            MaterialData::Rotation(r) => Matrix3::from_row_slice(r),
            MaterialData::OrientationAngles([phi1, phi, phi2]) => rotation_from_euler_angles(*phi1, *phi, *phi2),
        }
    }

    fn from_row(kind: MaterialKind, row: &[f64]) -> Self {
        match kind {
            MaterialKind::Rotation => {
                let mut r = [0.0; 9];
                r.copy_from_slice(row);
                MaterialData::Rotation(r)
            }
            MaterialKind::OrientationAngles => MaterialData::OrientationAngles([row[0], row[1], row[2]]),
        }
    }
}

/// Rotation matrix of the unit quaternion `(x, y, z, w)`.
#[rustfmt::skip]
pub fn rotation_from_quaternion(x: f64, y: f64, z: f64, w: f64) -> Matrix3<f64> {
    Matrix3::new(
        w * w + x * x - y * y - z * z, 2.0 * (x * y - w * z),         2.0 * (x * z + w * y),
        2.0 * (x * y + w * z),         w * w - x * x + y * y - z * z, 2.0 * (y * z - w * x),
        2.0 * (x * z - w * y),         2.0 * (y * z + w * x),         w * w - x * x - y * y + z * z,
    )
}

/// `R = Rz(phi1) Rx(phi) Rz(phi2)`.
#[rustfmt::skip]
pub fn rotation_from_euler_angles(phi1: f64, phi: f64, phi2: f64) -> Matrix3<f64> {
    let (s1, c1) = phi1.sin_cos();
    let (s, c) = phi.sin_cos();
    let (s2, c2) = phi2.sin_cos();
    Matrix3::new(
        c1 * c2 - s1 * s2 * c, -c1 * s2 - s1 * c2 * c,  s1 * s,
        s1 * c2 + c1 * s2 * c, -s1 * s2 + c1 * c2 * c, -c1 * s,
        s2 * s,                 c2 * s,                  c,
    )
}

fn flatten_row_major(m: &Matrix3<f64>) -> [f64; 9] {
    let mut r = [0.0; 9];
    for i in 0..3 {
        for j in 0..3 {
            r[3 * i + j] = m[(i, j)];
        }
    }
    r
}

#[derive(Debug, Clone, PartialEq)]
pub struct SeedSet {
    points: Vec<Point3<f64>>,
    material: Vec<MaterialData>,
    class_indices: Vec<usize>,
    /// Settings the set was generated from, if any.
    origin: Option<SeedingSettings>,
}

impl SeedSet {
    pub fn new(points: Vec<Point3<f64>>, material: Vec<MaterialData>, class_indices: Vec<usize>) -> Result<Self> {
        if points.len() != material.len() || points.len() != class_indices.len() {
            return Err(MultiscaleError::DataFormat {
                path: None,
                message: format!(
                    "{} seed points, {} material rows and {} class indices",
                    points.len(),
                    material.len(),
                    class_indices.len()
                ),
            });
        }
        Ok(Self {
            points,
            material,
            class_indices,
            origin: None,
        })
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[Point3<f64>] {
        &self.points
    }

    pub fn material(&self) -> &[MaterialData] {
        &self.material
    }

    pub fn class_indices(&self) -> &[usize] {
        &self.class_indices
    }

    /// Index of and distance to the seed closest to `point`.
    ///
    /// Ties are resolved in favor of the lower index.
    pub fn nearest_seed(&self, point: &Point3<f64>) -> Result<(usize, f64)> {
        let mut best: Option<(usize, f64)> = None;
        for (i, seed) in self.points.iter().enumerate() {
            let distance = (seed - point).norm();
            if !distance.is_finite() {
                return Err(MultiscaleError::DataFormat {
                    path: None,
                    message: format!("non-finite distance between {} and seed {}", point, i),
                });
            }
            if best.map(|(_, d)| distance < d).unwrap_or(true) {
                best = Some((i, distance));
            }
        }
        best.ok_or_else(|| MultiscaleError::DataFormat {
            path: None,
            message: "no seeds to assign".to_string(),
        })
    }

    /// Regenerates the set from its original settings with a different random seed.
    pub fn with_random_seed(&self, random_seed: u64) -> Result<Self> {
        let mut settings = self
            .origin
            .clone()
            .ok_or_else(|| MultiscaleError::configuration("imported seeds cannot be regenerated"))?;
        settings.random_seed = random_seed;
        generate(&settings)
    }
}

/// Generates seeds, class indices and rotations from a single random stream.
pub fn generate(settings: &SeedingSettings) -> Result<SeedSet> {
    let (min, max) = (settings.domain_min, settings.domain_max);
    if (0..3).any(|d| !(min[d] < max[d])) {
        return Err(MultiscaleError::configuration(format!(
            "empty seeding domain {:?} to {:?}",
            min, max
        )));
    }

    let mut rng = ChaCha8Rng::seed_from_u64(settings.random_seed);
    let points = match settings.strategy {
        SeedingStrategy::GridJitter { nx, ny, nz } => grid_with_jitter(&mut rng, min, max, [nx, ny, nz]),
        SeedingStrategy::BlueNoise {
            num_seeds,
            batch_size,
            axis_weights,
        } => blue_noise(&mut rng, min, max, num_seeds, batch_size, axis_weights)?,
    };

    let class_distribution = Uniform::new_inclusive(0, settings.num_classes);
    let class_indices = (0..points.len())
        .map(|_| class_distribution.sample(&mut rng))
        .collect();
    let material = (0..points.len())
        .map(|_| MaterialData::Rotation(flatten_row_major(&random_rotation(&mut rng))))
        .collect();

    debug!("Generated {} seeds with random seed {}", points.len(), settings.random_seed);
    let mut seeds = SeedSet::new(points, material, class_indices)?;
    seeds.origin = Some(settings.clone());
    Ok(seeds)
}

/// Rotation of a uniformly random unit quaternion.
pub fn random_rotation(rng: &mut impl Rng) -> Matrix3<f64> {
    let mut q: [f64; 4] = [0.0; 4];
    for q_i in q.iter_mut() {
        *q_i = rng.sample(StandardNormal);
    }
    let norm = q.iter().map(|c| c * c).sum::<f64>().sqrt();
    if norm == 0.0 {
        return Matrix3::identity();
    }
    let [x, y, z, w] = q.map(|c| c / norm);
    rotation_from_quaternion(x, y, z, w)
}

fn grid_with_jitter(rng: &mut impl Rng, min: [f64; 3], max: [f64; 3], counts: [usize; 3]) -> Vec<Point3<f64>> {
    let spacing: Vec<f64> = (0..3)
        .map(|d| (max[d] - min[d]) / (counts[d] + 1) as f64)
        .collect();
    let jitter = Uniform::new_inclusive(-0.25, 0.25);
    let mut points = Vec::with_capacity(counts.iter().product());
    for i in 0..counts[0] {
        for j in 0..counts[1] {
            for k in 0..counts[2] {
                let index = [i, j, k];
                let mut p = Point3::origin();
                for d in 0..3 {
                    let base = min[d] + (index[d] + 1) as f64 * spacing[d];
                    p[d] = base + jitter.sample(rng) * spacing[d];
                }
                points.push(p);
            }
        }
    }
    points
}

/// Weighted distance `sqrt(sum_d w_d (a_d - b_d)^2)`.
fn weighted_distance(a: &Point3<f64>, b: &Point3<f64>, weights: &[f64; 3]) -> f64 {
    (0..3)
        .map(|d| weights[d] * (a[d] - b[d]).powi(2))
        .sum::<f64>()
        .sqrt()
}

fn blue_noise(
    rng: &mut impl Rng,
    min: [f64; 3],
    max: [f64; 3],
    num_seeds: usize,
    batch_size: usize,
    axis_weights: [f64; 3],
) -> Result<Vec<Point3<f64>>> {
    if batch_size == 0 {
        return Err(MultiscaleError::configuration("blue noise batch size must be positive"));
    }
    let weight_norm = axis_weights.iter().map(|w| w * w).sum::<f64>().sqrt();
    if !(weight_norm > 0.0) || axis_weights.iter().any(|w| *w < 0.0) {
        return Err(MultiscaleError::configuration(format!(
            "invalid axis weights {:?}",
            axis_weights
        )));
    }
    let weights = axis_weights.map(|w| 3.0 * w / weight_norm);

    let axes: Vec<Uniform<f64>> = (0..3).map(|d| Uniform::new(min[d], max[d])).collect();
    let mut seeds: Vec<Point3<f64>> = Vec::with_capacity(num_seeds);
    let mut candidates = Vec::with_capacity(batch_size);
    while seeds.len() < num_seeds {
        candidates.clear();
        for _ in 0..batch_size {
            candidates.push(Point3::new(
                axes[0].sample(rng),
                axes[1].sample(rng),
                axes[2].sample(rng),
            ));
        }

        if seeds.is_empty() {
            seeds.push(candidates[0]);
            continue;
        }

        let best = candidates
            .iter()
            .map(|candidate| {
                let min_distance = seeds
                    .iter()
                    .map(|seed| weighted_distance(seed, candidate, &weights))
                    .fold(f64::INFINITY, f64::min);
                OrderedFloat(min_distance)
            })
            .position_max()
            .unwrap_or(0);
        seeds.push(candidates[best]);
    }
    Ok(seeds)
}

fn import_file_names(settings: &ImportSettings) -> Vec<(PathBuf, PathBuf)> {
    let dir = &settings.directory;
    match settings.number_of_files {
        Some(n) => (1..=n)
            .map(|index| {
                (
                    dir.join(format!("{}.{}.dat", settings.points_tag, index)),
                    dir.join(format!("{}.{}.dat", settings.data_tag, index)),
                )
            })
            .collect(),
        None => vec![(
            dir.join(format!("{}.dat", settings.points_tag)),
            dir.join(format!("{}.dat", settings.data_tag)),
        )],
    }
}

/// Reads seed points and material data, one [`SeedSet`] per file pair.
///
/// Imported class indices are the seed index modulo [`NUM_SEED_CLASSES`].
pub fn import_from_files(settings: &ImportSettings) -> Result<Vec<SeedSet>> {
    let data_columns = match settings.kind {
        MaterialKind::Rotation => 9,
        MaterialKind::OrientationAngles => 3,
    };

    import_file_names(settings)
        .into_iter()
        .map(|(points_path, data_path)| {
            let points = read_table_with_columns(&points_path, 3)?;
            let data = read_table_with_columns(&data_path, data_columns)?;
            if points.len() != data.len() {
                return Err(MultiscaleError::data_format(
                    &data_path,
                    format!(
                        "{} material rows do not match {} points in {}",
                        data.len(),
                        points.len(),
                        points_path.display()
                    ),
                ));
            }
            debug!("Imported {} seeds from {}", points.len(), points_path.display());
            SeedSet::new(
                points
                    .iter()
                    .map(|row| Point3::new(row[0], row[1], row[2]))
                    .collect(),
                data.iter()
                    .map(|row| MaterialData::from_row(settings.kind, row))
                    .collect(),
                (0..points.len()).map(|i| i % NUM_SEED_CLASSES).collect(),
            )
        })
        .collect()
}
