use mscale::cell::CellPartition;
use mscale::config::{MeshPerturbation, Settings};
use mscale::distributed::{Communicator, SerialCommunicator};
use mscale::dof::DofManager;
use mscale::mesh::procedural::{create_unit_square_quad_mesh, StructuredMeshBuilder};
use mscale::mesh::BlockMesh;
use mscale::microstructure::{MaterialData, SeedSet};
use mscale::proptest::{point3, unit_square_mesh};
use nalgebra::Point3;
use proptest::prelude::*;
use std::fs;

use super::data_output_path;

fn identity() -> MaterialData {
    MaterialData::Rotation([1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0])
}

fn build(mesh: &BlockMesh, settings: &Settings) -> CellPartition {
    let comm = SerialCommunicator;
    let dofs = DofManager::new(vec!["u".to_string(), "v".to_string()], mesh.num_vertices());
    let parameter_dofs = DofManager::new(vec!["q".to_string()], mesh.num_vertices());
    let owned = mesh.owned_elements(comm.rank(), comm.size());
    CellPartition::build(mesh, &owned, &dofs, &parameter_dofs, settings, &comm).unwrap()
}

fn seed_indices(cells: &CellPartition) -> Vec<usize> {
    cells
        .cells()
        .iter()
        .flat_map(|cell| (0..cell.len()).map(move |e| cell.seed_assignment(e).unwrap().seed))
        .collect()
}

#[test]
fn cells_respect_workset_size_and_dof_layout() {
    let mesh = create_unit_square_quad_mesh(3).unwrap();
    let mut settings = Settings::default();
    settings.mesh.workset_size = 4;
    let cells = build(&mesh, &settings);

    let sizes: Vec<usize> = cells.cells().iter().map(|cell| cell.len()).collect();
    assert_eq!(sizes, vec![4, 4, 1]);
    assert_eq!(cells.num_elements(), 9);

    let cell = &cells.cells()[0];
    assert_eq!(cell.block_name(), "eblock-0");
    assert_eq!(cell.element_nodes(0), &[0, 1, 5, 4]);
    // Component-major: all u dofs of the element first, then all v dofs
    assert_eq!(cell.element_dofs(0), &[0, 2, 10, 8, 1, 3, 11, 9]);
    assert_eq!(cell.element_parameter_dofs(0), &[0, 1, 5, 4]);
    assert_eq!(cells.local_communicator().size(), 1);
}

#[test]
fn zero_workset_size_is_rejected() {
    let mesh = create_unit_square_quad_mesh(1).unwrap();
    let mut settings = Settings::default();
    settings.mesh.workset_size = 0;
    let comm = SerialCommunicator;
    let dofs = DofManager::new(vec!["u".to_string()], mesh.num_vertices());
    let owned = mesh.owned_elements(0, 1);
    assert!(CellPartition::build(&mesh, &owned, &dofs, &dofs, &settings, &comm).is_err());
}

#[test]
fn nearest_seed_assignment_on_two_by_two_grid() {
    let mesh = StructuredMeshBuilder::rectangle(2, 2, [0.0, 0.0], [2.0, 2.0])
        .build()
        .unwrap();
    let mut cells = build(&mesh, &Settings::default());
    let seeds = SeedSet::new(
        vec![Point3::new(0.0, 0.0, 0.0), Point3::new(1.0, 1.0, 1.0)],
        vec![identity(); 2],
        vec![7, 3],
    )
    .unwrap();
    cells.assign_synthesized(&seeds).unwrap();
    assert_eq!(seed_indices(&cells), vec![0, 1, 1, 1]);

    // Elements take the class drawn for their seed
    let cell = &cells.cells()[0];
    assert_eq!(cell.seed_assignment(0).unwrap().class, 7);
    assert_eq!(cell.seed_assignment(1).unwrap().class, 3);
    assert!(cell.has_rotation());
    assert!(!cell.has_orientation_angle());
    assert_eq!(cell.material(0), Some(&identity()));
}

#[test]
fn equidistant_seeds_resolve_to_lower_index() {
    let mesh = create_unit_square_quad_mesh(1).unwrap();
    let mut cells = build(&mesh, &Settings::default());
    let seeds = SeedSet::new(
        vec![Point3::new(0.0, 0.0, 0.0), Point3::new(1.0, 1.0, 0.0)],
        vec![identity(); 2],
        vec![0, 1],
    )
    .unwrap();
    cells.assign_synthesized(&seeds).unwrap();
    assert_eq!(seed_indices(&cells), vec![0]);
}

#[test]
fn later_import_passes_replace_only_strictly_closer_seeds() {
    let mesh = StructuredMeshBuilder::rectangle(2, 1, [0.0, 0.0], [2.0, 1.0])
        .build()
        .unwrap();
    let mut cells = build(&mesh, &Settings::default());

    // Centroids are (0.5, 0.5) and (1.5, 0.5)
    let first = SeedSet::new(vec![Point3::new(0.5, 0.5, 0.0)], vec![identity()], vec![0]).unwrap();
    let rotated = MaterialData::OrientationAngles([0.1, 0.2, 0.3]);
    let second = SeedSet::new(
        vec![Point3::new(0.5, 0.5, 0.0), Point3::new(1.5, 0.5, 0.0)],
        vec![rotated; 2],
        vec![0, 1],
    )
    .unwrap();
    cells.assign_imported(&[first, second]).unwrap();

    let cell = &cells.cells()[0];
    // Tie at distance zero keeps the first pass
    assert_eq!(cell.material(0), Some(&identity()));
    assert_eq!(cell.material(1), Some(&rotated));
    assert_eq!(cell.seed_assignment(1).unwrap().distance, 0.0);

    assert!(cells.assign_imported(&[]).is_err());
}

#[test]
fn sinusoidal_perturbation_moves_the_last_axis() {
    let mesh = create_unit_square_quad_mesh(4).unwrap();
    let mut settings = Settings::default();
    settings.mesh.perturbation = MeshPerturbation::Sinusoidal;
    let cells = build(&mesh, &settings);

    // Element 0 has nodes (0, 0), (0.25, 0), (0.25, 0.25), (0, 0.25)
    let cell = &cells.cells()[0];
    let offsets = cell.element_perturbation(0);
    assert!(offsets[0].abs() < 1e-15);
    assert!((offsets[2] - 0.2).abs() < 1e-12);
    let moved = cell.element_coords(0)[2];
    assert!((moved.x - 0.25).abs() < 1e-15);
    assert!((moved.y - 0.45).abs() < 1e-12);
}

#[test]
fn height_file_scales_with_position_along_last_axis() {
    let dir = data_output_path().join("cell_height_file");
    fs::create_dir_all(&dir).unwrap();
    let path = dir.join("height.dat");
    fs::write(&path, "0 0 0.5\n").unwrap();

    let mesh = create_unit_square_quad_mesh(2).unwrap();
    let mut settings = Settings::default();
    settings.mesh.perturbation = MeshPerturbation::HeightFile(path);
    let cells = build(&mesh, &settings);

    // Element 3 has nodes at y = 0.5 and y = 1
    let cell = &cells.cells()[0];
    let offsets = cell.element_perturbation(3);
    assert!((offsets[0] - 0.25).abs() < 1e-15);
    assert!((offsets[2] - 0.5).abs() < 1e-15);
}

#[test]
fn gathered_vectors_follow_element_dofs() {
    let mesh = create_unit_square_quad_mesh(1).unwrap();
    let mut cells = build(&mesh, &Settings::default());
    let cell = &mut cells.cells_mut()[0];
    cell.gather_state(|gid| gid as f64);
    cell.gather_parameters(|gid| 10.0 * gid as f64);
    assert_eq!(cell.state(0).as_slice(), &[0.0, 2.0, 6.0, 4.0, 1.0, 3.0, 7.0, 5.0]);
    assert_eq!(cell.parameters(0).as_slice(), &[0.0, 10.0, 30.0, 20.0]);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn import_merge_does_not_depend_on_pass_order(
        mesh in unit_square_mesh(3),
        first in prop::collection::vec(point3(), 1..6),
        second in prop::collection::vec(point3(), 1..6),
    ) {
        // Distinct materials per seed identify which seed an element ended up with
        let pass = |points: &[Point3<f64>], offset: f64| {
            let material = (0..points.len())
                .map(|i| MaterialData::OrientationAngles([offset + i as f64, 0.0, 0.0]))
                .collect();
            SeedSet::new(points.to_vec(), material, vec![0; points.len()]).unwrap()
        };
        let (a, b) = (pass(&first, 0.0), pass(&second, 100.0));

        let mut forward = build(&mesh, &Settings::default());
        forward.assign_imported(&[a.clone(), b.clone()]).unwrap();
        let mut backward = build(&mesh, &Settings::default());
        backward.assign_imported(&[b, a]).unwrap();

        for (x, y) in forward.cells().iter().zip(backward.cells()) {
            for e in 0..x.len() {
                let (x, y) = (x.seed_assignment(e).unwrap(), y.seed_assignment(e).unwrap());
                prop_assert_eq!(x.distance, y.distance);
                prop_assert_eq!(x.material, y.material);
            }
        }
    }
}
