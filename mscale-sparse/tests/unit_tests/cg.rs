use matrixcompare::assert_matrix_eq;
use mscale_sparse::cg::{ConjugateGradient, IdentityOperator, JacobiPreconditioner};
use mscale_sparse::{CooMatrix, CsrMatrix, LinearSolveError};
use nalgebra::{DMatrix, DVector, DVectorView, DVectorViewMut};
use proptest::prelude::*;

/// Tridiagonal matrix with `diagonal` on the diagonal and -1 off the diagonal.
fn tridiagonal(n: usize, diagonal: f64) -> CsrMatrix<f64> {
    let mut coo = CooMatrix::new(n, n);
    for i in 0..n {
        coo.push(i, i, diagonal);
        if i > 0 {
            coo.push(i, i - 1, -1.0);
        }
        if i + 1 < n {
            coo.push(i, i + 1, -1.0);
        }
    }
    CsrMatrix::from(&coo)
}

#[test]
fn cg_zero_rhs_gives_zero_solution() {
    let a = tridiagonal(5, 2.0);
    let b = DVector::zeros(5);
    let mut x = DVector::repeat(5, 3.0);
    let output = ConjugateGradient::new(1e-12)
        .solve_with_guess(&a, &IdentityOperator, DVectorView::from(&b), DVectorViewMut::from(&mut x))
        .unwrap();
    assert_eq!(output.num_iterations, 0);
    assert_eq!(x, DVector::zeros(5));
}

#[test]
fn cg_reports_indefinite_operator() {
    let a = tridiagonal(4, -2.0);
    let b = DVector::repeat(4, 1.0);
    let mut x = DVector::zeros(4);
    let result = ConjugateGradient::new(1e-12).solve_with_guess(
        &a,
        &IdentityOperator,
        DVectorView::from(&b),
        DVectorViewMut::from(&mut x),
    );
    assert_eq!(result.unwrap_err(), LinearSolveError::IndefiniteOperator);
}

proptest! {
    #[test]
    fn jacobi_cg_solves_diagonally_dominant_systems(n in 1usize..30, shift in 0.1f64..5.0) {
        let a = tridiagonal(n, 2.0 + shift);
        let x_exact = DVector::from_fn(n, |i, _| (i as f64 * 0.37).sin());
        let b = DMatrix::from(&a) * &x_exact;

        let preconditioner = JacobiPreconditioner::from_csr(&a).unwrap();
        let mut x = DVector::zeros(n);
        ConjugateGradient::new(1e-12)
            .with_max_iterations(10 * n)
            .solve_with_guess(&a, &preconditioner, DVectorView::from(&b), DVectorViewMut::from(&mut x))
            .unwrap();

        assert_matrix_eq!(x, x_exact, comp = abs, tol = 1e-9);
    }
}
