use matrixcompare::assert_matrix_eq;
use mscale::config::{ImportSettings, MaterialKind, SeedingSettings, SeedingStrategy};
use mscale::error::MultiscaleError;
use mscale::microstructure::{
    generate, import_from_files, rotation_from_euler_angles, MaterialData, SeedSet, NUM_SEED_CLASSES,
};
use mscale::proptest::{point3, seeding_settings};
use nalgebra::{Matrix3, Point3};
use proptest::prelude::*;
use std::fs;

use super::data_output_path;

fn identity() -> MaterialData {
    MaterialData::Rotation([1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0])
}

#[test]
fn nearest_seed_prefers_lower_index_on_ties() {
    let seeds = SeedSet::new(
        vec![Point3::new(0.0, 0.0, 0.0), Point3::new(1.0, 1.0, 0.0)],
        vec![identity(); 2],
        vec![0, 1],
    )
    .unwrap();
    let (seed, distance) = seeds.nearest_seed(&Point3::new(0.5, 0.5, 0.0)).unwrap();
    assert_eq!(seed, 0);
    assert!((distance - 0.5f64.sqrt()).abs() < 1e-15);
}

#[test]
fn nearest_seed_fails_without_seeds_or_with_non_finite_points() {
    let empty = SeedSet::new(vec![], vec![], vec![]).unwrap();
    assert!(empty.nearest_seed(&Point3::origin()).is_err());

    let seeds = SeedSet::new(vec![Point3::origin()], vec![identity()], vec![0]).unwrap();
    let result = seeds.nearest_seed(&Point3::new(f64::NAN, 0.0, 0.0));
    assert!(matches!(result, Err(MultiscaleError::DataFormat { .. })));
}

#[test]
fn mismatched_seed_data_is_rejected() {
    let result = SeedSet::new(vec![Point3::origin()], vec![], vec![0]);
    assert!(result.is_err());
}

#[test]
fn generation_is_reproducible() {
    let settings = SeedingSettings {
        strategy: SeedingStrategy::BlueNoise {
            num_seeds: 20,
            batch_size: 5,
            axis_weights: [1.0, 1.0, 1.0],
        },
        ..SeedingSettings::default()
    };
    let a = generate(&settings).unwrap();
    let b = generate(&settings).unwrap();
    assert_eq!(a, b);

    let c = a.with_random_seed(settings.random_seed + 1).unwrap();
    assert_eq!(c.len(), 20);
    assert_ne!(a.points(), c.points());
}

fn blue_noise(random_seed: u64, num_seeds: usize, batch_size: usize) -> SeedingSettings {
    SeedingSettings {
        random_seed,
        strategy: SeedingStrategy::BlueNoise {
            num_seeds,
            batch_size,
            axis_weights: [1.0; 3],
        },
        ..SeedingSettings::default()
    }
}

fn min_pairwise_distance(points: &[Point3<f64>]) -> f64 {
    let mut min = f64::INFINITY;
    for (i, p) in points.iter().enumerate() {
        for q in &points[i + 1..] {
            min = min.min((p - q).norm());
        }
    }
    min
}

#[test]
fn blue_noise_separation_grows_with_batch_size() {
    // Averaged over many random seeds, a single run may not be monotone
    let mean_separation = |batch_size: usize| {
        let total: f64 = (0..32)
            .map(|random_seed| min_pairwise_distance(generate(&blue_noise(random_seed, 20, batch_size)).unwrap().points()))
            .sum();
        total / 32.0
    };
    let separations: Vec<f64> = [1, 5, 20].iter().map(|&b| mean_separation(b)).collect();
    assert!(
        separations[0] < separations[1] && separations[1] < separations[2],
        "mean separations {:?} do not grow with the batch size",
        separations
    );
}

#[test]
fn grid_jitter_stays_within_cells() {
    let settings = SeedingSettings {
        strategy: SeedingStrategy::GridJitter { nx: 3, ny: 2, nz: 1 },
        domain_min: [0.0, 0.0, 0.0],
        domain_max: [4.0, 3.0, 2.0],
        ..SeedingSettings::default()
    };
    let seeds = generate(&settings).unwrap();
    assert_eq!(seeds.len(), 6);
    // Spacing is one along every axis, jitter is at most a quarter spacing
    for p in seeds.points() {
        for d in 0..3 {
            let offset = p[d] - p[d].round();
            assert!(offset.abs() <= 0.25 + 1e-12, "{} is too far from a grid point", p);
        }
    }
}

#[test]
fn invalid_seeding_settings_are_rejected() {
    let empty_domain = SeedingSettings {
        domain_max: [1.0, 0.0, 1.0],
        ..SeedingSettings::default()
    };
    assert!(matches!(generate(&empty_domain), Err(MultiscaleError::Configuration(_))));

    let zero_batch = SeedingSettings {
        strategy: SeedingStrategy::BlueNoise {
            num_seeds: 3,
            batch_size: 0,
            axis_weights: [1.0; 3],
        },
        ..SeedingSettings::default()
    };
    assert!(generate(&zero_batch).is_err());

    let negative_weight = SeedingSettings {
        strategy: SeedingStrategy::BlueNoise {
            num_seeds: 3,
            batch_size: 2,
            axis_weights: [1.0, -1.0, 1.0],
        },
        ..SeedingSettings::default()
    };
    assert!(generate(&negative_weight).is_err());
}

#[test]
fn euler_angles_about_z_only() {
    let angle = 0.3;
    let r = rotation_from_euler_angles(angle, 0.0, 0.0);
    let (s, c) = angle.sin_cos();
    #[rustfmt::skip]
    let expected = Matrix3::new(
        c, -s, 0.0,
        s,  c, 0.0,
        0.0, 0.0, 1.0,
    );
    assert_matrix_eq!(r, expected, comp = abs, tol = 1e-15);
}

#[test]
fn import_reads_points_and_rotations() {
    let dir = data_output_path().join("microstructure_import");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("mesh_data_pts.dat"), "0 0 0\n1, 1, 1\n\n").unwrap();
    fs::write(
        dir.join("mesh_data.dat"),
        "1 0 0 0 1 0 0 0 1\n0 -1 0 1 0 0 0 0 1\n",
    )
    .unwrap();

    let settings = ImportSettings {
        directory: dir.clone(),
        ..ImportSettings::default()
    };
    let passes = import_from_files(&settings).unwrap();
    assert_eq!(passes.len(), 1);
    let seeds = &passes[0];
    assert_eq!(seeds.points()[1], Point3::new(1.0, 1.0, 1.0));
    assert_eq!(seeds.class_indices(), &[0, 1]);
    assert_eq!(seeds.material()[1].kind(), MaterialKind::Rotation);
    assert_eq!(seeds.material()[1].rotation_matrix()[(0, 1)], -1.0);
    assert!(seeds.with_random_seed(1).is_err());

    // Material rows must match the points
    fs::write(dir.join("mesh_data.dat"), "1 0 0 0 1 0 0 0 1\n").unwrap();
    assert!(matches!(
        import_from_files(&settings),
        Err(MultiscaleError::DataFormat { path: Some(_), .. })
    ));
}

#[test]
fn import_reads_numbered_orientation_files() {
    let dir = data_output_path().join("microstructure_numbered");
    fs::create_dir_all(&dir).unwrap();
    for index in 1..=2 {
        fs::write(dir.join(format!("pts.{}.dat", index)), format!("{} 0 0\n", index)).unwrap();
        fs::write(dir.join(format!("angles.{}.dat", index)), "0.1 0.2 0.3\n").unwrap();
    }
    let settings = ImportSettings {
        directory: dir,
        points_tag: "pts".to_string(),
        data_tag: "angles".to_string(),
        kind: MaterialKind::OrientationAngles,
        number_of_files: Some(2),
    };
    let passes = import_from_files(&settings).unwrap();
    assert_eq!(passes.len(), 2);
    assert_eq!(passes[1].points()[0], Point3::new(2.0, 0.0, 0.0));
    assert_eq!(passes[1].material()[0], MaterialData::OrientationAngles([0.1, 0.2, 0.3]));
}

#[test]
fn missing_import_file_is_a_data_format_error() {
    let settings = ImportSettings {
        directory: data_output_path().join("does_not_exist"),
        ..ImportSettings::default()
    };
    assert!(matches!(import_from_files(&settings), Err(MultiscaleError::DataFormat { .. })));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn generated_seeds_are_valid(settings in seeding_settings(12)) {
        let seeds = generate(&settings).unwrap();
        let expected_len = match settings.strategy {
            SeedingStrategy::BlueNoise { num_seeds, .. } => num_seeds,
            SeedingStrategy::GridJitter { nx, ny, nz } => nx * ny * nz,
        };
        prop_assert_eq!(seeds.len(), expected_len);
        for (p, class) in seeds.points().iter().zip(seeds.class_indices()) {
            for d in 0..3 {
                prop_assert!(p[d] >= settings.domain_min[d] && p[d] <= settings.domain_max[d]);
            }
            prop_assert!(*class <= settings.num_classes);
        }
        for material in seeds.material() {
            let r = material.rotation_matrix();
            let defect = (r.transpose() * r - Matrix3::identity()).norm();
            prop_assert!(defect < 1e-12);
            prop_assert!((r.determinant() - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn blue_noise_seeds_are_distinct(random_seed in any::<u64>(), num_seeds in 2..16usize, batch_size in 1..8usize) {
        let seeds = generate(&blue_noise(random_seed, num_seeds, batch_size)).unwrap();
        prop_assert!(min_pairwise_distance(seeds.points()) > 0.0);
    }

    #[test]
    fn nearest_seed_is_never_farther_than_any_seed(
        points in prop::collection::vec(point3(), 1..10),
        query in point3(),
    ) {
        let n = points.len();
        let seeds = SeedSet::new(points.clone(), vec![identity(); n], (0..n).map(|i| i % NUM_SEED_CLASSES).collect()).unwrap();
        let (seed, distance) = seeds.nearest_seed(&query).unwrap();
        prop_assert_eq!(distance, (points[seed] - query).norm());
        for p in &points {
            prop_assert!(distance <= (p - query).norm());
        }
    }
}
