//! Preconditioned conjugate gradient for symmetric positive definite operators.
use crate::solver::LinearSolveError;
use mscale_traits::Real;
use nalgebra::{DMatrix, DVector, DVectorView, DVectorViewMut, Scalar};
use nalgebra_sparse::CsrMatrix;

pub trait LinearOperator<T: Scalar> {
    fn apply(&self, y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), LinearSolveError>;
}

impl<'a, T, A> LinearOperator<T> for &'a A
where
    T: Scalar,
    A: ?Sized + LinearOperator<T>,
{
    fn apply(&self, y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), LinearSolveError> {
        <A as LinearOperator<T>>::apply(self, y, x)
    }
}

impl<T: Real> LinearOperator<T> for DMatrix<T> {
    fn apply(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), LinearSolveError> {
        if self.ncols() != x.len() || self.nrows() != y.len() {
            return Err(LinearSolveError::DimensionMismatch);
        }
        y.gemv(T::one(), self, &x, T::zero());
        Ok(())
    }
}

impl<T: Real> LinearOperator<T> for CsrMatrix<T> {
    fn apply(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), LinearSolveError> {
        if self.ncols() != x.len() || self.nrows() != y.len() {
            return Err(LinearSolveError::DimensionMismatch);
        }
        for (i, row) in self.row_iter().enumerate() {
            y[i] = row
                .col_indices()
                .iter()
                .zip(row.values())
                .fold(T::zero(), |acc, (&j, &a_ij)| acc + a_ij * x[j]);
        }
        Ok(())
    }
}

pub struct IdentityOperator;

impl<T: Scalar> LinearOperator<T> for IdentityOperator {
    fn apply(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), LinearSolveError> {
        y.copy_from(&x);
        Ok(())
    }
}

/// Diagonal (Jacobi) preconditioner `P = diag(A)^{-1}`.
#[derive(Debug, Clone)]
pub struct JacobiPreconditioner<T: Scalar> {
    inverse_diagonal: DVector<T>,
}

impl<T: Real> JacobiPreconditioner<T> {
    pub fn from_csr(matrix: &CsrMatrix<T>) -> Result<Self, LinearSolveError> {
        let mut inverse_diagonal = DVector::zeros(matrix.nrows());
        for (i, row) in matrix.row_iter().enumerate() {
            let a_ii = row.get_entry(i).map(|entry| entry.into_value()).unwrap_or(T::zero());
            if a_ii <= T::zero() {
                return Err(LinearSolveError::IndefiniteOperator);
            }
            inverse_diagonal[i] = T::one() / a_ii;
        }
        Ok(Self { inverse_diagonal })
    }
}

impl<T: Real> LinearOperator<T> for JacobiPreconditioner<T> {
    fn apply(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), LinearSolveError> {
        y.copy_from(&x);
        y.component_mul_assign(&self.inverse_diagonal);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct CgOutput {
    /// Number of updates made to the initial solution vector.
    pub num_iterations: usize,
}

/// Conjugate gradient with a relative residual criterion `||r|| <= tol * ||b||`.
///
/// The criterion uses the recursively updated residual, which may drift from the true residual
/// for badly conditioned systems.
#[derive(Debug, Clone)]
pub struct ConjugateGradient<T> {
    pub tolerance: T,
    pub max_iterations: Option<usize>,
}

impl<T: Real> ConjugateGradient<T> {
    pub fn new(tolerance: T) -> Self {
        Self {
            tolerance,
            max_iterations: None,
        }
    }

    pub fn with_max_iterations(self, max_iterations: usize) -> Self {
        Self {
            max_iterations: Some(max_iterations),
            ..self
        }
    }

    #[allow(non_snake_case)]
    pub fn solve_with_guess(
        &self,
        a: &impl LinearOperator<T>,
        preconditioner: &impl LinearOperator<T>,
        b: DVectorView<T>,
        mut x: DVectorViewMut<T>,
    ) -> Result<CgOutput, LinearSolveError> {
        if b.len() != x.len() {
            return Err(LinearSolveError::DimensionMismatch);
        }
        let n = x.len();
        let mut output = CgOutput { num_iterations: 0 };

        let b_norm = b.norm();
        if b_norm == T::zero() {
            x.fill(T::zero());
            return Ok(output);
        }

        let mut r = DVector::zeros(n);
        let mut z = DVector::zeros(n);
        let mut Ap = DVector::zeros(n);

        // r = b - Ax
        a.apply(DVectorViewMut::from(&mut r), DVectorView::from(&x))?;
        r.zip_apply(&b, |Ax_i, b_i| *Ax_i = b_i - *Ax_i);

        // z = Pr, p = z
        preconditioner.apply(DVectorViewMut::from(&mut z), DVectorView::from(&r))?;
        let mut p = z.clone();
        let mut zTr = z.dot(&r);

        while r.norm() > self.tolerance * b_norm {
            if let Some(max_iter) = self.max_iterations {
                if output.num_iterations >= max_iter {
                    return Err(LinearSolveError::MaxIterationsReached { max_iter });
                }
            }

            a.apply(DVectorViewMut::from(&mut Ap), DVectorView::from(&p))?;
            let pAp = p.dot(&Ap);
            if pAp <= T::zero() {
                return Err(LinearSolveError::IndefiniteOperator);
            }
            if zTr <= T::zero() {
                return Err(LinearSolveError::IndefinitePreconditioner);
            }

            let alpha = zTr / pAp;
            x.axpy(alpha, &p, T::one());
            r.axpy(-alpha, &Ap, T::one());
            output.num_iterations += 1;

            preconditioner.apply(DVectorViewMut::from(&mut z), DVectorView::from(&r))?;
            let zTr_next = z.dot(&r);
            let beta = zTr_next / zTr;

            // p <- z + beta * p
            p.zip_apply(&z, |p_i, z_i| *p_i = z_i + beta * *p_i);
            zTr = zTr_next;
        }

        Ok(output)
    }
}
