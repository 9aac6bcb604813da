use crate::calculus::{DifferentiableVectorFunction, FunctionError, VectorFunction};
use itertools::iterate;
use log::debug;
use mscale_traits::Real;
use nalgebra::{DVectorView, DVectorViewMut, Scalar};
use numeric_literals::replace_float_literals;
use std::error::Error;
use std::fmt;
use std::fmt::Display;

/// Convergence criterion for the residual norm.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Tolerance<T> {
    /// Converged when `|F(u)| <= tol`.
    Absolute(T),
    /// Converged when `|F(u)| <= tol * |F(u_0)|`, where `u_0` is the initial guess.
    ///
    /// A zero initial residual counts as converged.
    RelativeToInitial(T),
}

impl<T: Real> Tolerance<T> {
    fn threshold(&self, initial_norm: T) -> T {
        match *self {
            Tolerance::Absolute(tol) => tol,
            Tolerance::RelativeToInitial(tol) => tol * initial_norm,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NewtonSettings<T> {
    pub max_iterations: Option<usize>,
    pub tolerance: Tolerance<T>,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct NewtonOutput<T> {
    pub iterations: usize,
    pub initial_residual_norm: T,
    pub residual_norm: T,
}

#[derive(Debug)]
pub enum NewtonError {
    /// The procedure failed because the maximum number of iterations was reached.
    MaximumIterationsReached(usize),
    /// Evaluating the function failed.
    FunctionError(FunctionError),
    /// The procedure failed because solving the Jacobian system failed.
    JacobianError(FunctionError),
    /// The line search failed to produce a valid step.
    LineSearchError(FunctionError),
}

impl NewtonError {
    /// The error reported by the function or the line search, if any.
    pub fn into_source(self) -> Option<FunctionError> {
        match self {
            NewtonError::MaximumIterationsReached(_) => None,
            NewtonError::FunctionError(err) | NewtonError::JacobianError(err) | NewtonError::LineSearchError(err) => {
                Some(err)
            }
        }
    }
}

impl Display for NewtonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            &NewtonError::MaximumIterationsReached(maxit) => {
                write!(f, "Failed to converge within maximum number of iterations ({}).", maxit)
            }
            &NewtonError::FunctionError(ref err) => {
                write!(f, "Failed to evaluate function. Error: {}", err)
            }
            &NewtonError::JacobianError(ref err) => {
                write!(f, "Failed to solve Jacobian system. Error: {}", err)
            }
            &NewtonError::LineSearchError(ref err) => {
                write!(f, "Line search failed to produce valid step direction. Error: {}", err)
            }
        }
    }
}

impl Error for NewtonError {}

/// Attempts to solve the non-linear equation F(u) = 0.
///
/// No heap allocation is performed by the iteration itself. Convergence is measured with the
/// norm provided by the function, see [`VectorFunction::norm`].
#[replace_float_literals(T::from_f64(literal).unwrap())]
pub fn newton<'a, T, F>(
    function: F,
    x: impl Into<DVectorViewMut<'a, T>>,
    f: impl Into<DVectorViewMut<'a, T>>,
    dx: impl Into<DVectorViewMut<'a, T>>,
    settings: NewtonSettings<T>,
) -> Result<NewtonOutput<T>, NewtonError>
where
    T: Real,
    F: DifferentiableVectorFunction<T>,
{
    newton_line_search(function, x, f, dx, settings, &mut NoLineSearch {})
}

/// Same as `newton`, but allows specifying a line search.
#[replace_float_literals(T::from_f64(literal).unwrap())]
pub fn newton_line_search<'a, T, F>(
    mut function: F,
    x: impl Into<DVectorViewMut<'a, T>>,
    f: impl Into<DVectorViewMut<'a, T>>,
    dx: impl Into<DVectorViewMut<'a, T>>,
    settings: NewtonSettings<T>,
    line_search: &mut impl LineSearch<T, F>,
) -> Result<NewtonOutput<T>, NewtonError>
where
    T: Real,
    F: DifferentiableVectorFunction<T>,
{
    let mut x = x.into();
    let mut f = f.into();
    let mut minus_dx = dx.into();

    assert_eq!(x.nrows(), f.nrows());
    assert_eq!(minus_dx.nrows(), f.nrows());

    function
        .eval_into(&mut f, &DVectorView::from(&x))
        .map_err(NewtonError::FunctionError)?;

    let initial_residual_norm = function.norm(&DVectorView::from(&f));
    let threshold = settings.tolerance.threshold(initial_residual_norm);
    let mut residual_norm = initial_residual_norm;
    debug!("Newton initial residual norm: {}", initial_residual_norm);

    let mut iter = 0;

    while residual_norm > threshold {
        if settings
            .max_iterations
            .map(|max_iter| iter == max_iter)
            .unwrap_or(false)
        {
            return Err(NewtonError::MaximumIterationsReached(iter));
        }

        // Solve the system J dx = -f   <=>   J (-dx) = f
        function
            .solve_jacobian_system(&mut minus_dx, &DVectorView::from(&x), &DVectorView::from(&f))
            .map_err(NewtonError::JacobianError)?;

        // Flip sign to make it consistent with line search
        minus_dx *= -1.0;
        let dx = &minus_dx;

        let step_length = line_search
            .step(
                &mut function,
                DVectorViewMut::from(&mut f),
                DVectorViewMut::from(&mut x),
                DVectorView::from(dx),
            )
            .map_err(NewtonError::LineSearchError)?;
        residual_norm = function.norm(&DVectorView::from(&f));
        debug!(
            "Newton iter {}: step length {}, residual norm {}",
            iter, step_length, residual_norm
        );
        iter += 1;
    }

    Ok(NewtonOutput {
        iterations: iter,
        initial_residual_norm,
        residual_norm,
    })
}

pub trait LineSearch<T: Scalar, F: VectorFunction<T>> {
    fn step(
        &mut self,
        function: &mut F,
        f: DVectorViewMut<T>,
        x: DVectorViewMut<T>,
        direction: DVectorView<T>,
    ) -> Result<T, FunctionError>;
}

/// Trivial implementation of line search. Equivalent to a single, full Newton step.
///
/// Errors from evaluating the function at the new iterate are returned as-is.
#[derive(Clone, Debug)]
pub struct NoLineSearch;

impl<T, F> LineSearch<T, F> for NoLineSearch
where
    T: Real,
    F: VectorFunction<T>,
{
    fn step(
        &mut self,
        function: &mut F,
        mut f: DVectorViewMut<T>,
        mut x: DVectorViewMut<T>,
        direction: DVectorView<T>,
    ) -> Result<T, FunctionError> {
        let p = direction;
        x.axpy(T::one(), &p, T::one());
        function.eval_into(&mut f, &DVectorView::from(&x))?;
        Ok(T::one())
    }
}

/// Standard backtracking line search using the Armijo condition.
///
/// A trial step at which the function cannot be evaluated is treated like a step that
/// violates the sufficient decrease condition: the step is shortened and retried. Once the
/// step length drops below the minimum, the last evaluation error (if any) is returned.
///
/// See Jorge & Nocedal (2006), Numerical Optimization, Chapter 3.1.
#[derive(Clone, Debug)]
pub struct BacktrackingLineSearch<T> {
    pub sufficient_decrease: T,
    pub min_step_length: T,
}

impl Default for BacktrackingLineSearch<f64> {
    fn default() -> Self {
        Self {
            sufficient_decrease: 1e-4,
            min_step_length: 1e-6,
        }
    }
}

impl<T, F> LineSearch<T, F> for BacktrackingLineSearch<T>
where
    T: Real,
    F: VectorFunction<T>,
{
    #[replace_float_literals(T::from_f64(literal).unwrap())]
    fn step(
        &mut self,
        function: &mut F,
        mut f: DVectorViewMut<T>,
        mut x: DVectorViewMut<T>,
        direction: DVectorView<T>,
    ) -> Result<T, FunctionError> {
        // We seek to solve
        //  F(x) = 0
        // by minimizing
        //  g(x) = (1/2) || F(x) ||^2
        // and the sufficient decrease condition becomes
        //  g(x_k + alpha * p_k) <= (1 - c * alpha) * g(x_k)
        // under the assumption that grad F^T p_k ~= - F(x_k).
        let c = self.sufficient_decrease;
        let alpha_min = self.min_step_length;

        let p = direction;
        let initial_norm = function.norm(&DVectorView::from(&f));
        let g_initial = 0.5 * initial_norm * initial_norm;

        // Decrease slowly at first, then much faster if the first few alphas are rejected.
        let initial_alphas = [0.0, 1.0, 0.75, 0.5];
        let mut alpha_iter = initial_alphas
            .iter()
            .copied()
            .chain(iterate(0.25, |alpha_i| 0.25 * *alpha_i));

        let mut alpha_prev = T::zero();
        let mut alpha = T::one();
        // Skip the leading zero and one, they are already in place
        alpha_iter.nth(1);

        loop {
            // x^{k + 1} = x^k + (alpha^k - alpha^{k - 1}) * p
            let delta_alpha = alpha - alpha_prev;
            x.axpy(delta_alpha, &p, T::one());

            let rejection = match function.eval_into(&mut f, &DVectorView::from(&x)) {
                Ok(()) => {
                    let norm = function.norm(&DVectorView::from(&f));
                    let g = 0.5 * norm * norm;
                    if g <= (1.0 - c * alpha) * g_initial {
                        return Ok(alpha);
                    }
                    None
                }
                Err(err) => {
                    debug!("Function evaluation failed at step length {}: {}", alpha, err);
                    Some(err)
                }
            };

            if alpha < alpha_min {
                return Err(rejection.unwrap_or_else(|| {
                    Box::from(format!(
                        "Failed to produce valid step direction. \
                        Alpha {} is smaller than minimum allowed alpha {}.",
                        alpha, alpha_min
                    ))
                }));
            }

            alpha_prev = alpha;
            // The tail of the iterator is infinite
            alpha = alpha_iter.next().unwrap_or(alpha_prev * 0.25);
        }
    }
}
