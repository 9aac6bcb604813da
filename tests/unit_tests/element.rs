use matrixcompare::assert_scalar_eq;
use mscale::element::{map_physical_coordinates, map_reference_coords, ElementShape, ElementValues, QuadratureRule};
use nalgebra::Point3;
use proptest::prelude::*;

fn skewed_quad() -> Vec<Point3<f64>> {
    vec![
        Point3::new(0.0, 0.0, 0.0),
        Point3::new(2.0, 0.2, 0.0),
        Point3::new(2.5, 1.8, 0.0),
        Point3::new(-0.3, 1.5, 0.0),
    ]
}

#[test]
fn side_nodes_follow_axis_numbering() {
    assert_eq!(ElementShape::Quad4.side_nodes(0), vec![0, 3]);
    assert_eq!(ElementShape::Quad4.side_nodes(1), vec![1, 2]);
    assert_eq!(ElementShape::Quad4.side_nodes(2), vec![0, 1]);
    assert_eq!(ElementShape::Quad4.side_nodes(3), vec![2, 3]);
    assert_eq!(ElementShape::Hex8.side_nodes(4), vec![0, 1, 2, 3]);
    assert_eq!(ElementShape::Hex8.side_nodes(5), vec![4, 5, 6, 7]);
    assert_eq!(ElementShape::Hex8.num_sides(), 6);
}

#[test]
fn gauss_rule_has_reference_volume() {
    for dim in 1..=3 {
        let rule = QuadratureRule::gauss_2x(dim);
        assert_eq!(rule.points.len(), 1 << dim);
        assert_scalar_eq!(rule.weights.iter().sum::<f64>(), (1 << dim) as f64, comp = abs, tol = 1e-14);
    }
}

#[test]
fn basis_is_a_partition_of_unity() {
    for shape in [ElementShape::Quad4, ElementShape::Hex8] {
        let reference = shape.reference();
        let xi = [0.3, -0.6, 0.1];
        let phi = reference.evaluate_basis(&xi[..shape.dim()]);
        assert_scalar_eq!(phi.sum(), 1.0, comp = abs, tol = 1e-14);
        let gradients = reference.evaluate_gradients(&xi[..shape.dim()]);
        for d in 0..shape.dim() {
            assert_scalar_eq!(gradients.row(d).sum(), 0.0, comp = abs, tol = 1e-14);
        }
    }
}

#[test]
fn element_values_integrate_area_and_linear_gradients() {
    let nodes = skewed_quad();
    let values = ElementValues::compute(ElementShape::Quad4.reference(), &nodes).unwrap();

    // Shoelace formula
    let area = 0.5
        * (0..4)
            .map(|i| {
                let (a, b) = (nodes[i], nodes[(i + 1) % 4]);
                a.x * b.y - b.x * a.y
            })
            .sum::<f64>()
            .abs();
    assert_scalar_eq!(values.volume(), area, comp = abs, tol = 1e-12);

    // Bilinear elements reproduce u = 1 + 2x - y exactly
    let u: Vec<f64> = nodes.iter().map(|x| 1.0 + 2.0 * x.x - x.y).collect();
    for q in 0..values.num_points() {
        let grad = &values.gradients[q];
        let gx: f64 = (0..4).map(|i| grad[(0, i)] * u[i]).sum();
        let gy: f64 = (0..4).map(|i| grad[(1, i)] * u[i]).sum();
        assert_scalar_eq!(gx, 2.0, comp = abs, tol = 1e-12);
        assert_scalar_eq!(gy, -1.0, comp = abs, tol = 1e-12);
    }
}

#[test]
fn degenerate_element_is_rejected() {
    let nodes = vec![Point3::origin(); 4];
    assert!(ElementValues::compute(ElementShape::Quad4.reference(), &nodes).is_err());
}

#[test]
fn point_outside_element_is_not_located() {
    let nodes = skewed_quad();
    let outside = Point3::new(10.0, 10.0, 0.0);
    assert!(map_physical_coordinates(ElementShape::Quad4.reference(), &nodes, &outside, 1e-10).is_none());
}

proptest! {
    #[test]
    fn physical_coordinates_invert_the_reference_map(xi in prop::array::uniform2(-0.95..0.95f64)) {
        let nodes = skewed_quad();
        let reference = ElementShape::Quad4.reference();
        let x = map_reference_coords(reference, &nodes, &xi);
        let found = map_physical_coordinates(reference, &nodes, &x, 1e-10);
        prop_assert!(found.is_some());
        let found = found.unwrap();
        prop_assert!((found[0] - xi[0]).abs() < 1e-9);
        prop_assert!((found[1] - xi[1]).abs() < 1e-9);
    }
}
