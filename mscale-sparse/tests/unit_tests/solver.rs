use matrixcompare::assert_matrix_eq;
use mscale_sparse::{CooMatrix, CsrMatrix, DirectSolver, IterativeSolver, LinearSolveError, LinearSolver};
use nalgebra::{DMatrix, DVector};

fn csr_from_dense(dense: &DMatrix<f64>) -> CsrMatrix<f64> {
    let mut coo = CooMatrix::new(dense.nrows(), dense.ncols());
    for i in 0..dense.nrows() {
        for j in 0..dense.ncols() {
            if dense[(i, j)] != 0.0 {
                coo.push(i, j, dense[(i, j)]);
            }
        }
    }
    CsrMatrix::from(&coo)
}

#[test]
fn direct_solver_solves_nonsymmetric_system_and_its_transpose() {
    #[rustfmt::skip]
    let dense = DMatrix::from_row_slice(3, 3, &[
        4.0, 1.0, 0.0,
        2.0, 5.0, 1.0,
        0.0, 3.0, 6.0,
    ]);
    let a = csr_from_dense(&dense);
    let b = DVector::from_column_slice(&[1.0, 2.0, 3.0]);

    let mut solver = DirectSolver;
    let x = solver.solve(&a, &b).unwrap();
    assert_matrix_eq!(&dense * &x, b, comp = abs, tol = 1e-12);

    let y = solver.solve_transpose(&a, &b).unwrap();
    assert_matrix_eq!(dense.transpose() * &y, b, comp = abs, tol = 1e-12);
}

#[test]
fn direct_solver_detects_singular_matrix() {
    #[rustfmt::skip]
    let dense = DMatrix::from_row_slice(2, 2, &[
        1.0, 2.0,
        2.0, 4.0,
    ]);
    let a = csr_from_dense(&dense);
    let b = DVector::from_column_slice(&[1.0, 1.0]);
    assert_eq!(DirectSolver.solve(&a, &b).unwrap_err(), LinearSolveError::Singular);
}

#[test]
fn direct_solver_rejects_mismatched_rhs() {
    let a = csr_from_dense(&DMatrix::identity(3, 3));
    let b = DVector::zeros(2);
    assert_eq!(DirectSolver.solve(&a, &b).unwrap_err(), LinearSolveError::DimensionMismatch);
}

#[test]
fn iterative_solver_agrees_with_direct_solver_on_spd_system() {
    #[rustfmt::skip]
    let dense = DMatrix::from_row_slice(3, 3, &[
        5.0, 1.0, 2.0,
        1.0, 4.0, 2.0,
        2.0, 2.0, 4.0,
    ]);
    let a = csr_from_dense(&dense);
    let b = DVector::from_column_slice(&[1.0, 2.0, 3.0]);

    let x_direct = DirectSolver.solve(&a, &b).unwrap();
    let x_cg = IterativeSolver::new(1e-14, 100).solve(&a, &b).unwrap();
    assert_matrix_eq!(x_cg, x_direct, comp = abs, tol = 1e-10);
}
