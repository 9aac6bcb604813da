//! Reference elements, quadrature and per-element geometric values.
//!
//! Elements are multilinear on the reference cube `[-1, 1]^d`. Node coordinates are always
//! stored as 3-D points; two-dimensional elements ignore the `z` component.
use eyre::eyre;
use mscale_optimize::calculus::{FunctionError, VectorFunctionBuilder};
use mscale_optimize::newton::{newton, NewtonSettings, Tolerance};
use nalgebra::{DMatrix, DVector, DVectorView, DVectorViewMut, Point3};
use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementShape {
    Quad4,
    Hex8,
}

impl ElementShape {
    pub fn dim(&self) -> usize {
        match self {
            ElementShape::Quad4 => 2,
            ElementShape::Hex8 => 3,
        }
    }

    pub fn num_nodes(&self) -> usize {
        match self {
            ElementShape::Quad4 => 4,
            ElementShape::Hex8 => 8,
        }
    }

    /// Sides are numbered `2 * axis + (0 for the negative face, 1 for the positive face)`.
    pub fn num_sides(&self) -> usize {
        2 * self.dim()
    }

    pub fn reference(&self) -> &'static dyn ReferenceElement {
        match self {
            ElementShape::Quad4 => &Quad4,
            ElementShape::Hex8 => &Hex8,
        }
    }

    /// Local node indices on the given side.
    pub fn side_nodes(&self, side: usize) -> Vec<usize> {
        let axis = side / 2;
        let sign = if side % 2 == 0 { -1.0 } else { 1.0 };
        self.reference()
            .node_coords()
            .iter()
            .enumerate()
            .filter(|(_, coords)| coords[axis] == sign)
            .map(|(i, _)| i)
            .collect()
    }
}

/// Basis functions and quadrature on a reference element.
pub trait ReferenceElement: Send + Sync {
    fn dim(&self) -> usize;

    /// Reference coordinates of the nodes.
    fn node_coords(&self) -> &'static [[f64; 3]];

    fn num_nodes(&self) -> usize {
        self.node_coords().len()
    }

    fn evaluate_basis(&self, xi: &[f64]) -> DVector<f64>;

    /// Reference gradients, one column per node.
    fn evaluate_gradients(&self, xi: &[f64]) -> DMatrix<f64>;

    fn quadrature(&self) -> QuadratureRule;
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuadratureRule {
    pub points: Vec<Vec<f64>>,
    pub weights: Vec<f64>,
}

impl QuadratureRule {
    /// Tensor product of the two-point Gauss rule, exact for multilinear integrands squared.
    pub fn gauss_2x(dim: usize) -> Self {
        let a = 1.0 / 3.0f64.sqrt();
        let mut points = vec![Vec::new()];
        for _ in 0..dim {
            points = points
                .into_iter()
                .flat_map(|p: Vec<f64>| {
                    [-a, a].into_iter().map(move |c| {
                        let mut q = p.clone();
                        q.push(c);
                        q
                    })
                })
                .collect();
        }
        let weights = vec![1.0; points.len()];
        Self { points, weights }
    }
}

#[rustfmt::skip]
const QUAD4_NODES: [[f64; 3]; 4] = [
    [-1.0, -1.0, 0.0],
    [ 1.0, -1.0, 0.0],
    [ 1.0,  1.0, 0.0],
    [-1.0,  1.0, 0.0],
];

#[rustfmt::skip]
const HEX8_NODES: [[f64; 3]; 8] = [
    [-1.0, -1.0, -1.0],
    [ 1.0, -1.0, -1.0],
    [ 1.0,  1.0, -1.0],
    [-1.0,  1.0, -1.0],
    [-1.0, -1.0,  1.0],
    [ 1.0, -1.0,  1.0],
    [ 1.0,  1.0,  1.0],
    [-1.0,  1.0,  1.0],
];

/// phi_i(xi) = prod_d (1 + c_d xi_d) / 2
fn multilinear_basis(nodes: &[[f64; 3]], dim: usize, xi: &[f64]) -> DVector<f64> {
    DVector::from_iterator(
        nodes.len(),
        nodes
            .iter()
            .map(|c| (0..dim).map(|d| 0.5 * (1.0 + c[d] * xi[d])).product::<f64>()),
    )
}

fn multilinear_gradients(nodes: &[[f64; 3]], dim: usize, xi: &[f64]) -> DMatrix<f64> {
    DMatrix::from_fn(dim, nodes.len(), |k, i| {
        let c = &nodes[i];
        (0..dim)
            .map(|d| {
                if d == k {
                    0.5 * c[d]
                } else {
                    0.5 * (1.0 + c[d] * xi[d])
                }
            })
            .product::<f64>()
    })
}

/// Bilinear quadrilateral.
#[derive(Debug, Copy, Clone, Default)]
pub struct Quad4;

/// Trilinear hexahedron.
#[derive(Debug, Copy, Clone, Default)]
pub struct Hex8;

impl ReferenceElement for Quad4 {
    fn dim(&self) -> usize {
        2
    }

    fn node_coords(&self) -> &'static [[f64; 3]] {
        &QUAD4_NODES
    }

    fn evaluate_basis(&self, xi: &[f64]) -> DVector<f64> {
        multilinear_basis(&QUAD4_NODES, 2, xi)
    }

    fn evaluate_gradients(&self, xi: &[f64]) -> DMatrix<f64> {
        multilinear_gradients(&QUAD4_NODES, 2, xi)
    }

    fn quadrature(&self) -> QuadratureRule {
        QuadratureRule::gauss_2x(2)
    }
}

impl ReferenceElement for Hex8 {
    fn dim(&self) -> usize {
        3
    }

    fn node_coords(&self) -> &'static [[f64; 3]] {
        &HEX8_NODES
    }

    fn evaluate_basis(&self, xi: &[f64]) -> DVector<f64> {
        multilinear_basis(&HEX8_NODES, 3, xi)
    }

    fn evaluate_gradients(&self, xi: &[f64]) -> DMatrix<f64> {
        multilinear_gradients(&HEX8_NODES, 3, xi)
    }

    fn quadrature(&self) -> QuadratureRule {
        QuadratureRule::gauss_2x(3)
    }
}

pub fn map_reference_coords(reference: &dyn ReferenceElement, nodes: &[Point3<f64>], xi: &[f64]) -> Point3<f64> {
    let phi = reference.evaluate_basis(xi);
    nodes
        .iter()
        .zip(phi.iter())
        .fold(Point3::origin(), |x, (node, phi_i)| x + node.coords * *phi_i)
}

/// `J_ij = dx_i / dxi_j`, restricted to the reference dimension.
pub fn reference_jacobian(reference: &dyn ReferenceElement, nodes: &[Point3<f64>], xi: &[f64]) -> DMatrix<f64> {
    let dim = reference.dim();
    let grad = reference.evaluate_gradients(xi);
    DMatrix::from_fn(dim, dim, |i, j| {
        nodes
            .iter()
            .enumerate()
            .map(|(n, node)| node[i] * grad[(j, n)])
            .sum()
    })
}

/// Finds the reference coordinates of a physical point with Newton iterations.
///
/// Returns `None` if the iterations fail or the point lies outside the element by more than
/// `tolerance` in reference coordinates.
pub fn map_physical_coordinates(
    reference: &dyn ReferenceElement,
    nodes: &[Point3<f64>],
    x: &Point3<f64>,
    tolerance: f64,
) -> Option<Vec<f64>> {
    let dim = reference.dim();
    let scale = nodes
        .iter()
        .flat_map(|node| node.coords.iter().take(dim).map(|c| c.abs()))
        .fold(1.0f64, f64::max);

    let function = VectorFunctionBuilder::with_dimension(dim)
        .with_function(|f: &mut DVectorViewMut<f64>, xi: &DVectorView<f64>| {
            let xi: Vec<f64> = xi.iter().copied().collect();
            let mapped = map_reference_coords(reference, nodes, &xi);
            for i in 0..dim {
                f[i] = mapped[i] - x[i];
            }
            Ok(())
        })
        .with_jacobian_solver(
            |sol: &mut DVectorViewMut<f64>, xi: &DVectorView<f64>, rhs: &DVectorView<f64>| {
                let xi: Vec<f64> = xi.iter().copied().collect();
                let j = reference_jacobian(reference, nodes, &xi);
                let solution = j
                    .lu()
                    .solve(rhs)
                    .ok_or_else(|| FunctionError::from("singular element Jacobian"))?;
                sol.copy_from(&solution);
                Ok(())
            },
        );

    let mut xi = DVector::zeros(dim);
    let mut f = DVector::zeros(dim);
    let mut dx = DVector::zeros(dim);
    let settings = NewtonSettings {
        max_iterations: Some(25),
        tolerance: Tolerance::Absolute(1e-13 * scale),
    };
    newton(function, &mut xi, &mut f, &mut dx, settings).ok()?;

    let inside = xi.iter().all(|c| c.abs() <= 1.0 + tolerance);
    inside.then(|| xi.iter().copied().collect())
}

/// Basis values, physical gradients and weights at the quadrature points of one element.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementValues {
    pub points: Vec<Point3<f64>>,
    /// Quadrature weights multiplied by `|det J|`.
    pub weights: Vec<f64>,
    /// `basis[(q, i)]` is basis function `i` at point `q`.
    pub basis: DMatrix<f64>,
    /// Physical gradients per point, one column per basis function.
    pub gradients: Vec<DMatrix<f64>>,
}

impl ElementValues {
    pub fn compute(reference: &dyn ReferenceElement, nodes: &[Point3<f64>]) -> eyre::Result<Self> {
        let rule = reference.quadrature();
        Self::at_reference_points(reference, nodes, &rule.points, &rule.weights)
    }

    /// Values at arbitrary reference points with the given reference weights.
    pub fn at_reference_points(
        reference: &dyn ReferenceElement,
        nodes: &[Point3<f64>],
        points: &[Vec<f64>],
        weights: &[f64],
    ) -> eyre::Result<Self> {
        assert_eq!(points.len(), weights.len());
        if nodes.len() != reference.num_nodes() {
            return Err(eyre!(
                "element has {} nodes, reference element expects {}",
                nodes.len(),
                reference.num_nodes()
            ));
        }

        let n = reference.num_nodes();
        let mut values = ElementValues {
            points: Vec::with_capacity(points.len()),
            weights: Vec::with_capacity(points.len()),
            basis: DMatrix::zeros(points.len(), n),
            gradients: Vec::with_capacity(points.len()),
        };

        for (q, (xi, w)) in points.iter().zip(weights).enumerate() {
            let j = reference_jacobian(reference, nodes, xi);
            let det = j.determinant();
            if det.abs() < 1e-14 {
                return Err(eyre!("degenerate element: det J = {:e} at {:?}", det, xi));
            }
            let j_inv_t = j
                .try_inverse()
                .ok_or_else(|| eyre!("degenerate element at {:?}", xi))?
                .transpose();

            values
                .basis
                .row_mut(q)
                .copy_from(&reference.evaluate_basis(xi).transpose());
            values
                .gradients
                .push(j_inv_t * reference.evaluate_gradients(xi));
            values.weights.push(w * det.abs());
            values.points.push(map_reference_coords(reference, nodes, xi));
        }

        Ok(values)
    }

    pub fn num_points(&self) -> usize {
        self.weights.len()
    }

    pub fn num_nodes(&self) -> usize {
        self.basis.ncols()
    }

    pub fn volume(&self) -> f64 {
        self.weights.iter().sum()
    }
}
