use mscale::element::ElementShape;
use mscale::mesh::procedural::{create_unit_cube_hex_mesh, create_unit_square_quad_mesh, StructuredMeshBuilder};
use mscale::mesh::{BlockMesh, ElementBlock};
use mscale::proptest::unit_square_mesh;
use nalgebra::{Point3, Vector3};
use proptest::prelude::*;
use std::collections::BTreeMap;

#[test]
fn structured_square_has_expected_topology() {
    let mesh = create_unit_square_quad_mesh(2).unwrap();
    assert_eq!(mesh.dim(), 2);
    assert_eq!(mesh.num_vertices(), 9);
    assert_eq!(mesh.num_elements(), 4);
    assert_eq!(mesh.element_nodes(0), &[0, 1, 4, 3]);
    assert_eq!(mesh.element_shape(3), ElementShape::Quad4);
    assert_eq!(mesh.side_set_names(), vec!["bottom", "left", "right", "top"]);

    let left: Vec<usize> = mesh.side_set_nodes("left").unwrap().into_iter().collect();
    assert_eq!(left, vec![0, 3, 6]);
    assert!(mesh.side_set_nodes("front").is_none());
}

#[test]
fn structured_cube_has_six_side_sets() {
    let mesh = create_unit_cube_hex_mesh(2).unwrap();
    assert_eq!(mesh.num_vertices(), 27);
    assert_eq!(mesh.num_elements(), 8);
    assert_eq!(mesh.side_sets().len(), 6);
    assert_eq!(mesh.side_set_nodes("front").unwrap().len(), 9);
}

#[test]
fn blocks_split_columns() {
    let mesh = StructuredMeshBuilder::rectangle(4, 1, [0.0, 0.0], [4.0, 1.0])
        .with_blocks_along_x(2)
        .build()
        .unwrap();
    let blocks = mesh.blocks();
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[0].name, "eblock-0");
    assert_eq!(blocks[0].elements, vec![0, 1]);
    assert_eq!(blocks[1].elements, vec![2, 3]);
}

#[test]
fn boundary_flags_reference_side_sets() {
    let mesh = create_unit_square_quad_mesh(1).unwrap();
    let names = mesh.side_set_names();
    let flags = mesh.element_boundary_flags(0);
    assert_eq!(flags.len(), 4);
    for (side, flag) in flags.iter().enumerate() {
        let name = &names[flag.expect("every side of a single element is on the boundary")];
        let expected = ["left", "right", "bottom", "top"][side];
        assert_eq!(name, expected);
    }
}

#[test]
fn invalid_meshes_are_rejected() {
    let vertices = vec![
        Point3::new(0.0, 0.0, 0.0),
        Point3::new(1.0, 0.0, 0.0),
        Point3::new(1.0, 1.0, 0.0),
        Point3::new(0.0, 1.0, 0.0),
    ];
    let block = |elements| ElementBlock {
        name: "b".to_string(),
        shape: ElementShape::Quad4,
        elements,
    };

    // Element outside of any block
    let result = BlockMesh::new(2, vertices.clone(), vec![vec![0, 1, 2, 3]], vec![], BTreeMap::new());
    assert!(result.is_err());

    // Connectivity referencing a missing vertex
    let result = BlockMesh::new(2, vertices.clone(), vec![vec![0, 1, 2, 7]], vec![block(vec![0])], BTreeMap::new());
    assert!(result.is_err());

    // Side index out of range
    let mut side_sets = BTreeMap::new();
    side_sets.insert("s".to_string(), vec![(0, 4)]);
    let result = BlockMesh::new(2, vertices.clone(), vec![vec![0, 1, 2, 3]], vec![block(vec![0])], side_sets);
    assert!(result.is_err());

    // Wrong dimension
    let result = BlockMesh::new(3, vertices, vec![vec![0, 1, 2, 3]], vec![block(vec![0])], BTreeMap::new());
    assert!(result.is_err());
}

#[test]
fn displacing_vertices_keeps_topology() {
    let mut mesh = create_unit_square_quad_mesh(2).unwrap();
    let displacement = vec![Vector3::new(0.5, 0.0, 0.0); mesh.num_vertices()];
    mesh.displace_vertices(&displacement);
    assert_eq!(mesh.vertices()[0], Point3::new(0.5, 0.0, 0.0));
    assert_eq!(mesh.element_nodes(0), &[0, 1, 4, 3]);
}

proptest! {
    #[test]
    fn owned_elements_partition_every_block(mesh in unit_square_mesh(6), size in 1..5usize) {
        let mut all: Vec<usize> = (0..size)
            .flat_map(|rank| mesh.owned_elements(rank, size).into_iter().flatten())
            .collect();
        all.sort_unstable();
        prop_assert_eq!(all, (0..mesh.num_elements()).collect::<Vec<_>>());
    }
}
