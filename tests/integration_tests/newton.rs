use super::{build_engine, build_engine_with, on_all_sides, tight_settings};
use matrixcompare::assert_scalar_eq;
use mscale::config::{DirichletValue, LinearSolverKind, Settings, TransientSettings};
use mscale::distributed::SerialCommunicator;
use mscale::error::MultiscaleError;
use mscale::functions::FunctionRegistry;
use mscale::mesh::procedural::{create_unit_square_quad_mesh, StructuredMeshBuilder};
use mscale::parameters::{Parameter, ParameterUsage};
use mscale::solve::{NewtonState, SolveEngine, Step};
use nalgebra::Vector3;

fn linear_solution() -> FunctionRegistry {
    FunctionRegistry::new()
        .with_function("g", |x, _| 1.0 + x.x + 2.0 * x.y)
        .with_exact_solution("u", |x, _| (1.0 + x.x + 2.0 * x.y, Vector3::new(1.0, 2.0, 0.0)))
}

fn linear_engine(settings: Settings) -> SolveEngine {
    build_engine_with(
        Box::new(SerialCommunicator),
        create_unit_square_quad_mesh(4).unwrap(),
        settings,
        linear_solution(),
        Vec::new(),
        Vec::new(),
    )
}

fn linear_settings() -> Settings {
    let mut settings = Settings::default();
    settings.dirichlet = on_all_sides(DirichletValue::Function("g".to_string()));
    settings
}

#[test]
fn linear_solution_is_reproduced_in_one_iteration() {
    let mut engine = linear_engine(linear_settings());
    engine.forward_solve().unwrap();

    let u = engine.global_state(1);
    for (node, x) in engine.mesh().vertices().iter().enumerate() {
        assert_scalar_eq!(u[node], 1.0 + x.x + 2.0 * x.y, comp = abs, tol = 1e-12);
    }

    use NewtonState::*;
    assert_eq!(
        engine.state_trace(),
        &[
            Assembling,
            ResidualOnly,
            Assembling,
            JacobianReady,
            LinearSolve,
            Updated,
            Assembling,
            ResidualOnly,
            Converged
        ]
    );

    let errors = engine.compute_verification_error(1).unwrap();
    assert_eq!(errors.len(), 2);
    assert!(errors[0] < 1e-12, "L2 error {}", errors[0]);
    assert!(errors[1] < 1e-11, "H1 error {}", errors[1]);
}

#[test]
fn conjugate_gradient_matches_direct_solver() {
    let mut direct = linear_engine(linear_settings());
    direct.forward_solve().unwrap();

    let mut settings = linear_settings();
    settings.solver.linear_solver = LinearSolverKind::ConjugateGradient {
        tolerance: 1e-12,
        max_iterations: 500,
    };
    let mut iterative = linear_engine(settings);
    iterative.forward_solve().unwrap();
    matrixcompare::assert_matrix_eq!(direct.global_state(1), iterative.global_state(1), comp = abs, tol = 1e-9);
}

#[test]
fn constrained_dofs_hold_boundary_values() {
    let mesh = create_unit_square_quad_mesh(4).unwrap();
    let mut settings = Settings::default();
    settings.dirichlet = on_all_sides(DirichletValue::Constant(0.5));
    let mut engine = build_engine(
        mesh,
        settings,
        vec![Parameter::scalar("source", ParameterUsage::Fixed, 3.0)],
    );
    assert_eq!(engine.constrained_dofs().len(), 16);

    // The initial state already satisfies the boundary conditions
    let initial = engine.global_state(0);
    for &gid in engine.constrained_dofs() {
        assert_eq!(initial[gid], 0.5);
    }

    engine.forward_solve().unwrap();
    let u = engine.global_state(1);
    for &gid in engine.constrained_dofs() {
        assert_scalar_eq!(u[gid], 0.5, comp = abs, tol = 1e-14);
    }
    // A positive source lifts the interior above the boundary value
    let centre = 2 * 5 + 2;
    assert!(u[centre] > 0.5);
}

#[test]
fn nonlinear_reaction_converges_with_line_search() {
    for line_search in [false, true] {
        let mut settings = tight_settings();
        settings.solver.line_search = line_search;
        let mut engine = build_engine(
            create_unit_square_quad_mesh(4).unwrap(),
            settings,
            vec![
                Parameter::scalar("source", ParameterUsage::Fixed, 20.0),
                Parameter::scalar("reaction", ParameterUsage::Fixed, 5.0),
            ],
        );
        engine.forward_solve().unwrap();
        assert_eq!(engine.state_trace().last(), Some(&NewtonState::Converged));
        let iterations = engine
            .state_trace()
            .iter()
            .filter(|&&s| s == NewtonState::Updated)
            .count();
        assert!(iterations > 1);
    }
}

#[test]
fn modified_newton_reuses_the_first_jacobian() {
    let mut settings = tight_settings();
    settings.solver.reuse_jacobian = true;
    settings.solver.max_nonlinear_iterations = 100;
    let parameters = vec![
        Parameter::scalar("source", ParameterUsage::Fixed, 5.0),
        Parameter::scalar("reaction", ParameterUsage::Fixed, 1.0),
    ];
    let mut modified = build_engine(create_unit_square_quad_mesh(3).unwrap(), settings, parameters.clone());
    modified.forward_solve().unwrap();

    let mut full = build_engine(create_unit_square_quad_mesh(3).unwrap(), tight_settings(), parameters);
    full.forward_solve().unwrap();
    matrixcompare::assert_matrix_eq!(modified.global_state(1), full.global_state(1), comp = abs, tol = 1e-9);
}

#[test]
fn iteration_budget_exhaustion_is_a_divergence() {
    let mut settings = tight_settings();
    settings.solver.max_nonlinear_iterations = 1;
    let mut engine = build_engine(
        create_unit_square_quad_mesh(4).unwrap(),
        settings,
        vec![
            Parameter::scalar("source", ParameterUsage::Fixed, 20.0),
            Parameter::scalar("reaction", ParameterUsage::Fixed, 5.0),
        ],
    );
    let err = engine.forward_solve().unwrap_err();
    assert!(matches!(err, MultiscaleError::SolverDivergence { iterations: 1, .. }), "{}", err);
    assert_eq!(engine.state_trace().last(), Some(&NewtonState::Diverged));
    // Only the initial state is kept
    assert_eq!(engine.history().len(), 1);
    assert!(matches!(engine.compute_objective(), Err(MultiscaleError::Configuration(_))));
}

#[test]
fn transient_steps_and_history() {
    let mut settings = tight_settings();
    settings.solver.transient = Some(TransientSettings {
        final_time: 0.5,
        num_steps: 4,
    });
    let mut engine = build_engine(
        create_unit_square_quad_mesh(4).unwrap(),
        settings,
        vec![Parameter::scalar("source", ParameterUsage::Fixed, 1.0)],
    );
    let steps = engine.steps();
    assert_eq!(steps.len(), 4);
    assert_eq!(
        steps[3],
        Step {
            time: 0.5,
            time_index: 4,
            dt: Some(0.125),
            is_final_time: true
        }
    );
    assert!(!steps[0].is_final_time);

    engine.forward_solve().unwrap();
    let times: Vec<f64> = engine.history().iter().map(|(t, _)| *t).collect();
    assert_eq!(times, vec![0.0, 0.125, 0.25, 0.375, 0.5]);

    // The interior heats up monotonically towards the steady state
    let centre = 2 * 5 + 2;
    let values: Vec<f64> = (0..5).map(|n| engine.global_state(n)[centre]).collect();
    assert_eq!(values[0], 0.0);
    assert!(values.windows(2).all(|w| w[1] > w[0]));

    let mut steady = build_engine(
        create_unit_square_quad_mesh(4).unwrap(),
        tight_settings(),
        vec![Parameter::scalar("source", ParameterUsage::Fixed, 1.0)],
    );
    assert_eq!(
        steady.steps(),
        vec![Step {
            time: 0.0,
            time_index: 1,
            dt: None,
            is_final_time: true
        }]
    );
    steady.forward_solve().unwrap();
    assert!(values[4] < steady.global_state(1)[centre]);
}

#[test]
fn remesh_moves_nodes_by_the_final_state() {
    let mut settings = Settings::default();
    settings.dirichlet = on_all_sides(DirichletValue::Constant(0.1));
    settings.solver.remesh_variables = vec!["u".to_string()];
    let mesh = StructuredMeshBuilder::rectangle(2, 2, [0.0, 0.0], [1.0, 1.0])
        .build()
        .unwrap();
    let mut engine = build_engine(mesh, settings, Vec::new());
    engine.forward_solve().unwrap();
    engine.remesh().unwrap();

    for (node, x) in engine.mesh().vertices().iter().enumerate() {
        let (i, j) = (node % 3, node / 3);
        assert_scalar_eq!(x.x, 0.5 * i as f64 + 0.1, comp = abs, tol = 1e-12);
        assert_scalar_eq!(x.y, 0.5 * j as f64, comp = abs, tol = 1e-12);
    }
    let centroid = engine.cells().cells()[0].centroid(0);
    assert_scalar_eq!(centroid.x, 0.35, comp = abs, tol = 1e-12);
}

#[test]
fn invalid_setups_are_rejected() {
    let mesh = || create_unit_square_quad_mesh(2).unwrap();
    let mut settings = Settings::default();
    settings.dirichlet = on_all_sides(DirichletValue::Function("missing".to_string()));
    let result = SolveEngine::new(
        Box::new(SerialCommunicator),
        mesh(),
        settings,
        super::diffusion_2d(),
        std::sync::Arc::new(FunctionRegistry::new()),
        Default::default(),
        Vec::new(),
    );
    assert!(matches!(result, Err(MultiscaleError::Configuration(_))));

    let mut settings = Settings::default();
    settings.dirichlet = on_all_sides(DirichletValue::Constant(0.0));
    settings.dirichlet[0].side = "nowhere".to_string();
    let result = SolveEngine::new(
        Box::new(SerialCommunicator),
        mesh(),
        settings,
        super::diffusion_2d(),
        std::sync::Arc::new(FunctionRegistry::new()),
        Default::default(),
        Vec::new(),
    );
    assert!(matches!(result, Err(MultiscaleError::Configuration(_))));

    let parameters = mscale::parameters::ParameterSet::new(vec![Parameter::new(
        "diffusion_field",
        ParameterUsage::Discretized,
        vec![0.0; 5],
    )])
    .unwrap();
    let result = SolveEngine::new(
        Box::new(SerialCommunicator),
        mesh(),
        Settings::default(),
        super::diffusion_2d(),
        std::sync::Arc::new(FunctionRegistry::new()),
        parameters,
        Vec::new(),
    );
    assert!(matches!(result, Err(MultiscaleError::Configuration(_))));
}
