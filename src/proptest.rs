//! Strategies for property tests of downstream code.
use crate::config::{SeedingSettings, SeedingStrategy};
use crate::dual::Dual;
use crate::mesh::procedural::StructuredMeshBuilder;
use crate::mesh::BlockMesh;
use ::proptest::prelude::*;
use nalgebra::Point3;

pub fn point3() -> impl Strategy<Value = Point3<f64>> {
    // Keep coordinates moderate so that distances stay well conditioned
    let range = -10.0..10.0;
    [range.clone(), range.clone(), range.clone()].prop_map(|[x, y, z]| Point3::new(x, y, z))
}

/// Duals with up to `max_channels` derivative channels.
pub fn dual(max_channels: usize) -> impl Strategy<Value = Dual<f64>> {
    let range = -10.0..10.0;
    (range.clone(), prop::collection::vec(range, 0..=max_channels))
        .prop_map(|(value, derivatives)| Dual::from_parts(value, derivatives))
}

/// Seeding settings on the unit cube with a small number of seeds.
pub fn seeding_settings(max_seeds: usize) -> impl Strategy<Value = SeedingSettings> {
    let blue_noise = (1..=max_seeds, 1..=8usize).prop_map(|(num_seeds, batch_size)| SeedingStrategy::BlueNoise {
        num_seeds,
        batch_size,
        axis_weights: [1.0; 3],
    });
    let grid = (1..=3usize, 1..=3usize, 1..=3usize).prop_map(|(nx, ny, nz)| SeedingStrategy::GridJitter { nx, ny, nz });
    (any::<u64>(), prop_oneof![blue_noise, grid], 0..=50usize).prop_map(|(random_seed, strategy, num_classes)| {
        SeedingSettings {
            random_seed,
            strategy,
            num_classes,
            ..SeedingSettings::default()
        }
    })
}

/// Structured quad meshes of the unit square with at most `max_cells` cells per axis.
pub fn unit_square_mesh(max_cells: usize) -> impl Strategy<Value = BlockMesh> {
    (1..=max_cells, 1..=max_cells).prop_map(|(nx, ny)| {
        StructuredMeshBuilder::rectangle(nx, ny, [0.0, 0.0], [1.0, 1.0])
            .build()
            .expect("structured mesh with positive cell counts")
    })
}
