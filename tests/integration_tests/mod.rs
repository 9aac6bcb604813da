use mscale::config::{DirichletCondition, DirichletValue, Settings};
use mscale::distributed::{Communicator, SerialCommunicator};
use mscale::functions::FunctionRegistry;
use mscale::optimize::calculus::approximate_gradient_fd;
use mscale::mesh::BlockMesh;
use mscale::parameters::{Parameter, ParameterSet};
use mscale::physics::{NonlinearDiffusion, PhysicsEvaluator};
use mscale::solve::SolveEngine;
use mscale::subgrid::SubgridModel;
use nalgebra::{DVector, DVectorView};
use std::path::PathBuf;
use std::sync::Arc;

mod newton;
mod outputs;

/// Directory for files written by the integration tests.
pub fn data_output_path() -> PathBuf {
    PathBuf::from("data/integration_tests/")
}

pub fn diffusion_2d() -> Arc<dyn PhysicsEvaluator> {
    Arc::new(NonlinearDiffusion::new(2))
}

/// The same Dirichlet condition on the four sides of a rectangle.
pub fn on_all_sides(value: DirichletValue) -> Vec<DirichletCondition> {
    ["left", "right", "bottom", "top"]
        .iter()
        .map(|side| DirichletCondition {
            side: side.to_string(),
            variable: "u".to_string(),
            value: value.clone(),
        })
        .collect()
}

/// Settings for tightly converged solves with homogeneous Dirichlet conditions.
pub fn tight_settings() -> Settings {
    let mut settings = Settings::default();
    settings.solver.nonlinear_tolerance = 1e-11;
    settings.solver.max_nonlinear_iterations = 30;
    settings.dirichlet = on_all_sides(DirichletValue::Constant(0.0));
    settings
}

pub fn build_engine_with(
    comm: Box<dyn Communicator>,
    mesh: BlockMesh,
    settings: Settings,
    functions: FunctionRegistry,
    parameters: Vec<Parameter>,
    models: Vec<Box<dyn SubgridModel>>,
) -> SolveEngine {
    SolveEngine::new(
        comm,
        mesh,
        settings,
        diffusion_2d(),
        Arc::new(functions),
        ParameterSet::new(parameters).unwrap(),
        models,
    )
    .unwrap()
}

pub fn build_engine(mesh: BlockMesh, settings: Settings, parameters: Vec<Parameter>) -> SolveEngine {
    build_engine_with(
        Box::new(SerialCommunicator),
        mesh,
        settings,
        FunctionRegistry::new(),
        parameters,
        Vec::new(),
    )
}

pub fn assert_close(actual: f64, expected: f64, rtol: f64) {
    assert!(
        (actual - expected).abs() <= rtol * expected.abs().max(1e-12),
        "{} is not within relative tolerance {} of {}",
        actual,
        rtol,
        expected
    );
}

/// Objective after a forward solve with the given active parameter values.
pub fn objective_at(engine: &mut SolveEngine, active: &[f64]) -> f64 {
    engine.set_active_parameter_values(active).unwrap();
    engine.forward_solve().unwrap();
    engine.compute_objective().unwrap()
}

/// Central differences of the objective with respect to all active components.
pub fn finite_difference_gradient(engine: &mut SolveEngine, h: f64) -> DVector<f64> {
    let base = engine.active_parameter_values();
    let mut x = DVector::from_vec(base.clone());
    let gradient = approximate_gradient_fd(
        |x: DVectorView<f64>| objective_at(engine, &x.iter().copied().collect::<Vec<_>>()),
        &mut x,
        h,
    );
    engine.set_active_parameter_values(&base).unwrap();
    gradient
}
