use crate::cg::{ConjugateGradient, JacobiPreconditioner};
use log::debug;
use mscale_traits::Real;
use nalgebra::{DMatrix, DVector, DVectorView, DVectorViewMut};
use nalgebra_sparse::CsrMatrix;
use std::error::Error;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum LinearSolveError {
    DimensionMismatch,
    /// The matrix is (numerically) singular.
    Singular,
    IndefiniteOperator,
    IndefinitePreconditioner,
    MaxIterationsReached { max_iter: usize },
}

impl fmt::Display for LinearSolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DimensionMismatch => write!(f, "Matrix and vector dimensions do not match."),
            Self::Singular => write!(f, "Matrix is singular."),
            Self::IndefiniteOperator => write!(f, "Operator appears to be indefinite."),
            Self::IndefinitePreconditioner => write!(f, "Indefinite preconditioner."),
            Self::MaxIterationsReached { max_iter } => {
                write!(f, "Max iterations ({}) reached.", max_iter)
            }
        }
    }
}

impl Error for LinearSolveError {}

/// Solves linear systems with a sparse operator.
pub trait LinearSolver<T: Real>: Send {
    fn solve(&mut self, a: &CsrMatrix<T>, b: &DVector<T>) -> Result<DVector<T>, LinearSolveError>;

    /// Solves `A^T x = b`.
    fn solve_transpose(&mut self, a: &CsrMatrix<T>, b: &DVector<T>) -> Result<DVector<T>, LinearSolveError> {
        self.solve(&a.transpose(), b)
    }
}

/// Dense LU factorization of the sparse operator.
///
/// Only suitable for the moderately sized systems used in verification runs.
#[derive(Debug, Clone, Default)]
pub struct DirectSolver;

impl<T: Real> LinearSolver<T> for DirectSolver {
    fn solve(&mut self, a: &CsrMatrix<T>, b: &DVector<T>) -> Result<DVector<T>, LinearSolveError> {
        if a.nrows() != a.ncols() || a.nrows() != b.len() {
            return Err(LinearSolveError::DimensionMismatch);
        }
        let dense = DMatrix::from(a);
        dense.lu().solve(b).ok_or(LinearSolveError::Singular)
    }
}

/// Jacobi-preconditioned conjugate gradient, for symmetric positive definite systems.
#[derive(Debug, Clone)]
pub struct IterativeSolver<T> {
    cg: ConjugateGradient<T>,
}

impl<T: Real> IterativeSolver<T> {
    pub fn new(tolerance: T, max_iterations: usize) -> Self {
        Self {
            cg: ConjugateGradient::new(tolerance).with_max_iterations(max_iterations),
        }
    }
}

impl<T: Real> LinearSolver<T> for IterativeSolver<T> {
    fn solve(&mut self, a: &CsrMatrix<T>, b: &DVector<T>) -> Result<DVector<T>, LinearSolveError> {
        let preconditioner = JacobiPreconditioner::from_csr(a)?;
        let mut x = DVector::zeros(b.len());
        let output = self.cg.solve_with_guess(
            a,
            &preconditioner,
            DVectorView::from(b),
            DVectorViewMut::from(&mut x),
        )?;
        debug!("CG converged in {} iterations", output.num_iterations);
        Ok(x)
    }
}
