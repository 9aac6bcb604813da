//! Error integrals against known exact solutions.
use crate::element::ElementValues;
use crate::error::{MultiscaleError, Result};
use crate::functions::FunctionManager;
use nalgebra::DVector;

/// Estimate the squared $L^2$ error $\norm{u_h - u}^2_{L^2}$ and the squared $H^1$ seminorm
/// error $\seminorm{u_h - u}^2_{H^1}$ of every variable on one element.
///
/// `u_h` holds the element's dofs component-major. The result is laid out as
/// `[L2_0, H1_0, L2_1, H1_1, ...]`.
pub fn estimate_element_errors_squared(
    values: &ElementValues,
    u_h: &[f64],
    variables: &[String],
    functions: &dyn FunctionManager,
    time: f64,
) -> Result<DVector<f64>> {
    let n = values.num_nodes();
    assert_eq!(u_h.len(), n * variables.len());

    let mut result = DVector::zeros(2 * variables.len());
    for (v, variable) in variables.iter().enumerate() {
        let u_h_v = &u_h[v * n..(v + 1) * n];
        for q in 0..values.num_points() {
            let x = &values.points[q];
            let (u, u_grad) = functions.exact_solution(variable, x, time).ok_or_else(|| {
                MultiscaleError::configuration(format!("no exact solution for variable {}", variable))
            })?;

            let u_h_q: f64 = (0..n).map(|i| values.basis[(q, i)] * u_h_v[i]).sum();
            let grad = &values.gradients[q];
            let grad_error_squared: f64 = (0..grad.nrows())
                .map(|d| {
                    let u_h_grad: f64 = (0..n).map(|i| grad[(d, i)] * u_h_v[i]).sum();
                    (u_h_grad - u_grad[d]).powi(2)
                })
                .sum();

            let w = values.weights[q];
            result[2 * v] += w * (u_h_q - u).powi(2);
            result[2 * v + 1] += w * grad_error_squared;
        }
    }
    Ok(result)
}
