use mscale::config::{
    DirichletCondition, DirichletValue, LinearSolverKind, MeshDataSource, SeedingSettings, Settings, SubgridRule,
    SubgridSelection, TransientSettings,
};

#[test]
fn defaults() {
    let settings = Settings::default();
    assert_eq!(settings.verbosity, 0);
    assert_eq!(settings.mesh.workset_size, 100);
    assert_eq!(settings.mesh_data, MeshDataSource::None);
    assert_eq!(settings.solver.nonlinear_tolerance, 1e-6);
    assert_eq!(settings.solver.max_nonlinear_iterations, 10);
    assert_eq!(settings.solver.linear_solver, LinearSolverKind::Direct);
    assert!(settings.solver.transient.is_none());
    assert!(settings.multiscale.rules.is_empty());
    assert_eq!(settings.multiscale.fine_scale.refinement, 2);
    assert_eq!(settings.postprocess.sensor_prefix, "sensor");
}

#[test]
fn settings_survive_json() {
    let mut settings = Settings::default();
    settings.mesh_data = MeshDataSource::Compute(SeedingSettings::default());
    settings.solver.transient = Some(TransientSettings {
        final_time: 1.0,
        num_steps: 4,
    });
    settings.dirichlet.push(DirichletCondition {
        side: "left".to_string(),
        variable: "u".to_string(),
        value: DirichletValue::Function("g".to_string()),
    });
    settings.multiscale.rules.push(SubgridRule {
        model: 0,
        selection: SubgridSelection::Blocks(vec!["block_0".to_string()]),
    });

    let json = serde_json::to_string(&settings).unwrap();
    let parsed: Settings = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, settings);
}

#[test]
fn missing_fields_take_defaults() {
    let parsed: Settings = serde_json::from_str(r#"{ "verbosity": 2, "solver": { "line_search": true } }"#).unwrap();
    assert_eq!(parsed.verbosity, 2);
    assert!(parsed.solver.line_search);
    assert_eq!(parsed.solver.max_nonlinear_iterations, 10);
    assert_eq!(parsed.mesh, Settings::default().mesh);
}
