//! Pointwise physics and the weak form shared by macro elements and subgrid models.
//!
//! A [`PhysicsEvaluator`] returns, for every variable, a flux vector and a source term at a
//! quadrature point. The residual of test function `i` and variable `v` is
//!
//! ```text
//! R_vi = sum_q w_q (flux_v . grad N_i + source_v N_i).
//! ```
//!
//! Transient terms enter through `u_dot` in [`PointState`], which is the backward Euler
//! difference quotient.
use crate::dual::Dual;
use crate::element::ElementValues;
use crate::microstructure::MaterialData;
use crate::parameters::ParameterValues;
use eyre::eyre;
use nalgebra::{DMatrix, Matrix3, Point3};
use std::sync::Arc;

/// Which inputs carry derivative channels during an evaluation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SeedMode {
    None,
    /// One channel per local state dof.
    State,
    /// One channel per local dof of the previous time step.
    PreviousState,
    /// Active parameter components first, then local discretized parameter dofs.
    Parameters,
}

/// Inputs at a single quadrature point.
#[derive(Debug)]
pub struct PointState<'a> {
    pub x: Point3<f64>,
    pub time: f64,
    pub u: &'a [Dual<f64>],
    /// `grad_u[v][d]`
    pub grad_u: &'a [Vec<Dual<f64>>],
    pub u_dot: &'a [Dual<f64>],
    pub params: &'a ParameterValues,
    /// Discretized parameter fields interpolated to the point.
    pub fields: &'a [Dual<f64>],
    pub field_names: &'a [String],
    pub material: Option<&'a MaterialData>,
}

impl<'a> PointState<'a> {
    pub fn field(&self, name: &str) -> Option<&Dual<f64>> {
        self.field_names
            .iter()
            .position(|n| n == name)
            .map(|i| &self.fields[i])
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PointResidual {
    /// `flux[v][d]`
    pub flux: Vec<Vec<Dual<f64>>>,
    pub source: Vec<Dual<f64>>,
}

pub trait PhysicsEvaluator: Send + Sync {
    fn variables(&self) -> Vec<String>;

    fn evaluate(&self, state: &PointState) -> eyre::Result<PointResidual>;
}

/// Scalar function of position and time.
pub type Forcing = Arc<dyn Fn(&Point3<f64>, f64) -> f64 + Send + Sync>;

/// `du/dt - div((kappa + q) A grad u) + r u^3 - s f = 0`
///
/// - `kappa`: parameter `diffusion` (default 1),
/// - `q`: discretized parameter `diffusion_field` (default 0),
/// - `A = R diag(1, a, 1) R^T` with the material rotation `R` and the parameter `anisotropy`
///   (default 1),
/// - `r`: parameter `reaction` (default 0),
/// - `s`: parameter `source` (default 0), `f` the forcing function.
#[derive(Clone)]
pub struct NonlinearDiffusion {
    dim: usize,
    variable: String,
    forcing: Forcing,
}

impl std::fmt::Debug for NonlinearDiffusion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonlinearDiffusion")
            .field("dim", &self.dim)
            .field("variable", &self.variable)
            .finish()
    }
}

impl NonlinearDiffusion {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            variable: "u".to_string(),
            forcing: Arc::new(|_, _| 1.0),
        }
    }

    pub fn with_variable(self, name: impl Into<String>) -> Self {
        Self {
            variable: name.into(),
            ..self
        }
    }

    pub fn with_forcing(self, forcing: impl Fn(&Point3<f64>, f64) -> f64 + Send + Sync + 'static) -> Self {
        Self {
            forcing: Arc::new(forcing),
            ..self
        }
    }

    fn conductivity_tensor(&self, material: Option<&MaterialData>, anisotropy: f64) -> Matrix3<f64> {
        let d = Matrix3::from_diagonal(&nalgebra::Vector3::new(1.0, anisotropy, 1.0));
        match material {
            Some(material) => {
                let r = material.rotation_matrix();
                r * d * r.transpose()
            }
            None => d,
        }
    }
}

impl PhysicsEvaluator for NonlinearDiffusion {
    fn variables(&self) -> Vec<String> {
        vec![self.variable.clone()]
    }

    fn evaluate(&self, state: &PointState) -> eyre::Result<PointResidual> {
        if state.grad_u.len() != 1 || state.grad_u[0].len() != self.dim {
            return Err(eyre!(
                "expected one variable in {} dimensions, got {} variables",
                self.dim,
                state.grad_u.len()
            ));
        }
        let constant = |value: f64| Dual::constant(value);
        let kappa = state
            .params
            .scalar("diffusion")
            .cloned()
            .unwrap_or_else(|| constant(1.0));
        let reaction = state
            .params
            .scalar("reaction")
            .cloned()
            .unwrap_or_else(|| constant(0.0));
        let source = state
            .params
            .scalar("source")
            .cloned()
            .unwrap_or_else(|| constant(0.0));
        let anisotropy = state
            .params
            .scalar("anisotropy")
            .map(|a| a.value())
            .unwrap_or(1.0);

        let mut coefficient = kappa;
        if let Some(q) = state.field("diffusion_field") {
            coefficient += q;
        }

        let a = self.conductivity_tensor(state.material, anisotropy);
        let grad = &state.grad_u[0];
        let flux = (0..self.dim)
            .map(|i| {
                let a_grad: Dual<f64> = (0..self.dim).map(|j| &grad[j] * a[(i, j)]).sum();
                &coefficient * &a_grad
            })
            .collect();

        let u = &state.u[0];
        let f = (self.forcing)(&state.x, state.time);
        let s = &state.u_dot[0] + &(&reaction * &u.powi(3)) - &source * f;

        Ok(PointResidual {
            flux: vec![flux],
            source: vec![s],
        })
    }
}

/// Interpolates `num_components` nodal fields stored component-major in `local`.
pub fn interpolate(basis: &DMatrix<f64>, q: usize, local: &[Dual<f64>], num_components: usize) -> Vec<Dual<f64>> {
    let n = basis.ncols();
    debug_assert_eq!(local.len(), n * num_components);
    (0..num_components)
        .map(|c| (0..n).map(|i| &local[c * n + i] * basis[(q, i)]).sum())
        .collect()
}

/// Physical gradients `[component][dim]` of component-major nodal fields.
pub fn interpolate_gradient(gradients: &DMatrix<f64>, local: &[Dual<f64>], num_components: usize) -> Vec<Vec<Dual<f64>>> {
    let (dim, n) = gradients.shape();
    (0..num_components)
        .map(|c| {
            (0..dim)
                .map(|d| (0..n).map(|i| &local[c * n + i] * gradients[(d, i)]).sum())
                .collect()
        })
        .collect()
}

/// Quantities common to all quadrature points of an evaluation.
#[derive(Debug, Clone, Copy)]
pub struct EvaluationContext<'a> {
    pub params: &'a ParameterValues,
    pub field_names: &'a [String],
    pub time: f64,
    /// Time step of a backward Euler step, `None` for steady problems.
    pub dt: Option<f64>,
}

/// Solution data on the element used to evaluate the physics.
#[derive(Debug, Clone, Copy)]
pub struct TrialData<'a> {
    pub values: &'a ElementValues,
    pub u: &'a [Dual<f64>],
    pub u_prev: Option<&'a [Dual<f64>]>,
    /// Discretized parameter fields at each quadrature point.
    pub fields: &'a [Vec<Dual<f64>>],
    pub material: Option<&'a MaterialData>,
}

/// Test functions: basis values `(q, i)` and physical gradients per point.
#[derive(Debug, Clone, Copy)]
pub struct TestFunctions<'a> {
    pub basis: &'a DMatrix<f64>,
    pub gradients: &'a [DMatrix<f64>],
}

/// Weak-form residual, component-major over the test functions.
pub fn weak_form_residual(
    physics: &dyn PhysicsEvaluator,
    context: &EvaluationContext,
    trial: &TrialData,
    test: &TestFunctions,
    num_variables: usize,
) -> eyre::Result<Vec<Dual<f64>>> {
    let values = trial.values;
    let num_test = test.basis.ncols();
    let mut residual = vec![Dual::constant(0.0); num_variables * num_test];

    for q in 0..values.num_points() {
        let u = interpolate(&values.basis, q, trial.u, num_variables);
        let grad_u = interpolate_gradient(&values.gradients[q], trial.u, num_variables);
        let u_dot = match (trial.u_prev, context.dt) {
            (Some(u_prev), Some(dt)) => {
                let u_prev = interpolate(&values.basis, q, u_prev, num_variables);
                u.iter()
                    .zip(&u_prev)
                    .map(|(u, u_prev)| (u - u_prev) / dt)
                    .collect()
            }
            _ => vec![Dual::constant(0.0); num_variables],
        };
        let state = PointState {
            x: values.points[q],
            time: context.time,
            u: &u,
            grad_u: &grad_u,
            u_dot: &u_dot,
            params: context.params,
            fields: &trial.fields[q],
            field_names: context.field_names,
            material: trial.material,
        };
        let point = physics.evaluate(&state)?;

        let w = values.weights[q];
        let test_gradients = &test.gradients[q];
        for v in 0..num_variables {
            for i in 0..num_test {
                let mut integrand = &point.source[v] * test.basis[(q, i)];
                for (d, flux) in point.flux[v].iter().enumerate() {
                    integrand += &(flux * test_gradients[(d, i)]);
                }
                residual[v * num_test + i] += &(integrand * w);
            }
        }
    }

    Ok(residual)
}

/// Discretized fields at each quadrature point of an element, interpolated from local nodal
/// values.
pub fn fields_at_points(values: &ElementValues, fields: &[Dual<f64>], num_fields: usize) -> Vec<Vec<Dual<f64>>> {
    (0..values.num_points())
        .map(|q| interpolate(&values.basis, q, fields, num_fields))
        .collect()
}

/// Residual of a plain element tested with its own basis.
pub fn element_residual(
    physics: &dyn PhysicsEvaluator,
    context: &EvaluationContext,
    trial: &TrialData,
    num_variables: usize,
) -> eyre::Result<Vec<Dual<f64>>> {
    let test = TestFunctions {
        basis: &trial.values.basis,
        gradients: &trial.values.gradients,
    };
    weak_form_residual(physics, context, trial, &test, num_variables)
}

/// Element-local duals of a state vector for the given mode.
///
/// `State` seeds `u`, `PreviousState` seeds `u_prev`; other modes leave both constant.
pub fn seed_state(
    mode: SeedMode,
    u: &[f64],
    u_prev: Option<&[f64]>,
) -> (Vec<Dual<f64>>, Option<Vec<Dual<f64>>>) {
    let n = u.len();
    let seeded = |values: &[f64]| -> Vec<Dual<f64>> {
        values
            .iter()
            .enumerate()
            .map(|(j, &v)| Dual::variable(v, j, n))
            .collect()
    };
    let constant = |values: &[f64]| -> Vec<Dual<f64>> { values.iter().map(|&v| Dual::constant(v)).collect() };

    let u_dual = if mode == SeedMode::State { seeded(u) } else { constant(u) };
    let prev_dual = u_prev.map(|prev| {
        if mode == SeedMode::PreviousState {
            seeded(prev)
        } else {
            constant(prev)
        }
    });
    (u_dual, prev_dual)
}

/// Element-local duals of discretized parameter values.
///
/// In `Parameters` mode, local dof `j` gets channel `num_active + j` out of `num_channels`.
pub fn seed_fields(mode: SeedMode, fields: &[f64], num_active: usize, num_channels: usize) -> Vec<Dual<f64>> {
    fields
        .iter()
        .enumerate()
        .map(|(j, &v)| {
            if mode == SeedMode::Parameters {
                Dual::variable(v, num_active + j, num_channels)
            } else {
                Dual::constant(v)
            }
        })
        .collect()
}
