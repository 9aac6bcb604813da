use super::{assert_close, build_engine, build_engine_with, data_output_path, diffusion_2d, tight_settings};
use mscale::config::{FineScaleSettings, ResponseType, Settings, SubgridRule, SubgridSelection};
use mscale::distributed::SerialCommunicator;
use mscale::functions::FunctionRegistry;
use mscale::io::text::read_table;
use mscale::io::vtk::VtkResultSink;
use mscale::io::{OutputMesh, ResultSet, ResultSink};
use mscale::mesh::procedural::create_unit_square_quad_mesh;
use mscale::parameters::{Parameter, ParameterUsage};
use mscale::response::SensorData;
use mscale::subgrid::FineScaleModel;
use std::fs;

#[derive(Default)]
struct RecordingSink {
    writes: Vec<(String, usize, f64, OutputMesh, ResultSet)>,
}

impl ResultSink for RecordingSink {
    fn write(
        &mut self,
        label: &str,
        time_index: usize,
        time: f64,
        mesh: &OutputMesh,
        results: &ResultSet,
    ) -> eyre::Result<()> {
        self.writes
            .push((label.to_string(), time_index, time, mesh.clone(), results.clone()));
        Ok(())
    }
}

fn parameters() -> Vec<Parameter> {
    vec![
        Parameter::scalar("source", ParameterUsage::Active, 4.0),
        Parameter::scalar("diffusion_field", ParameterUsage::Discretized, 0.5),
    ]
}

fn pointwise(mut settings: Settings) -> Settings {
    settings.postprocess.response_type = ResponseType::Pointwise;
    settings.postprocess.sensor_locations = vec![[0.25, 0.25, 0.0], [0.5, 0.5, 0.0]];
    settings
}

#[test]
fn fields_of_a_plain_run() {
    let mut engine = build_engine(create_unit_square_quad_mesh(2).unwrap(), tight_settings(), parameters());
    engine.forward_solve().unwrap();
    engine.compute_sensitivities().unwrap();

    let mut sink = RecordingSink::default();
    engine.write_outputs(Some(&mut sink)).unwrap();
    assert_eq!(sink.writes.len(), 1);
    let (label, time_index, time, mesh, results) = &sink.writes[0];
    assert_eq!(label, "solution");
    assert_eq!((*time_index, *time), (1, 0.0));
    assert_eq!(mesh.vertices.len(), 9);
    assert_eq!(mesh.connectivity.len(), 4);

    let u = engine.global_state(1);
    assert_eq!(results.node_field("u").unwrap(), u.as_slice());
    assert_eq!(results.node_field("diffusion_field").unwrap(), &[0.5; 9]);
    let sensitivity = engine.sensitivity_field().unwrap();
    assert_eq!(results.node_field("diffusion_field_dRdP").unwrap(), sensitivity.as_slice());
    assert_eq!(results.cell_field("mesh_data_seed").unwrap(), &[-1.0; 4]);
    assert_eq!(results.cell_field("subgrid model").unwrap(), &[-1.0; 4]);
    assert_eq!(results.cell_field("subgrid_mean_u").unwrap(), &[0.0; 4]);
}

#[test]
fn subgrid_solutions_are_persisted_per_macro_element() {
    let mut settings = tight_settings();
    settings.postprocess.results_label = Some("run".to_string());
    settings.multiscale.rules = vec![SubgridRule {
        model: 0,
        selection: SubgridSelection::All,
    }];
    let model = FineScaleModel::new(
        diffusion_2d(),
        FineScaleSettings {
            refinement: 2,
            ..FineScaleSettings::default()
        },
    );
    let mut engine = build_engine_with(
        Box::new(SerialCommunicator),
        create_unit_square_quad_mesh(2).unwrap(),
        settings,
        FunctionRegistry::new(),
        parameters(),
        vec![Box::new(model)],
    );
    engine.forward_solve().unwrap();
    engine.compute_sensitivities().unwrap();

    let mut sink = RecordingSink::default();
    engine.write_outputs(Some(&mut sink)).unwrap();
    let labels: Vec<&str> = sink.writes.iter().map(|w| w.0.as_str()).collect();
    assert_eq!(
        labels,
        vec!["run_subgrid_0", "run_subgrid_1", "run_subgrid_2", "run_subgrid_3", "run"]
    );

    for (_, time_index, _, mesh, results) in &sink.writes[..4] {
        assert_eq!(*time_index, 1);
        assert_eq!(mesh.vertices.len(), 9);
        assert_eq!(mesh.connectivity.len(), 4);
        assert_eq!(results.node_field("u").unwrap().len(), 9);
        assert_eq!(results.node_field("u_adjoint").unwrap().len(), 9);
    }

    let results = &sink.writes[4].4;
    assert_eq!(results.cell_field("subgrid model").unwrap(), &[0.0; 4]);
    let means = results.cell_field("subgrid_mean_u").unwrap();
    for (e, mean) in means.iter().enumerate() {
        let fine = sink.writes[e].4.node_field("u").unwrap();
        // Positive source and zero boundary values keep the interior positive
        assert!(*mean > 0.0);
        assert!(*mean < fine.iter().cloned().fold(f64::MIN, f64::max));
    }
}

#[test]
fn vtk_files_are_written_per_time_level() {
    let dir = data_output_path().join("vtk_outputs");
    fs::create_dir_all(&dir).unwrap();
    let mut settings = tight_settings();
    settings.solver.transient = Some(mscale::config::TransientSettings {
        final_time: 1.0,
        num_steps: 2,
    });
    settings.postprocess.results_label = Some("heat".to_string());
    let mut engine = build_engine(create_unit_square_quad_mesh(2).unwrap(), settings, parameters());
    engine.forward_solve().unwrap();

    let mut sink = VtkResultSink::new(&dir);
    engine.write_outputs(Some(&mut sink)).unwrap();
    assert_eq!(sink.written(), &[dir.join("heat_1.vtk"), dir.join("heat_2.vtk")]);
    for path in sink.written() {
        assert!(path.exists());
    }
}

#[test]
fn response_files_and_sensor_data() {
    let dir = data_output_path().join("response_files");
    fs::create_dir_all(&dir).unwrap();
    let mut settings = pointwise(tight_settings());
    settings.postprocess.output_directory = dir.clone();
    settings.postprocess.write_sensors = true;
    settings.postprocess.write_objective = true;
    settings.postprocess.write_dakota = true;
    settings.postprocess.write_height_file = true;
    let mut engine = build_engine(create_unit_square_quad_mesh(4).unwrap(), settings, parameters());
    engine.forward_solve().unwrap();
    engine.write_outputs(None).unwrap();

    let responses = engine.responses().unwrap();
    assert_eq!((responses.num_slots(), responses.num_components(), responses.num_times()), (2, 1, 1));
    // The second sensor sits on the centre node
    let u = engine.global_state(1);
    assert_close(responses.get(1, 0, 0), u[2 * 5 + 2], 1e-12);

    let sensor = read_table(&dir.join("sensor.1.dat")).unwrap();
    assert_eq!(sensor.len(), 1);
    assert_close(sensor[0][1], responses.get(1, 0, 0), 1e-14);

    let objective = engine.compute_objective().unwrap();
    let written = read_table(&dir.join("obj.dat")).unwrap();
    assert_close(written[0][0], objective, 1e-14);
    assert_eq!(read_table(&dir.join("results.out")).unwrap()[0].len(), 2);
    assert_eq!(read_table(&dir.join("meshpert.dat")).unwrap().len(), 25);

    // Data equal to the model's own responses gives a vanishing misfit
    engine.set_sensor_data(Some(SensorData::from_responses(&responses)));
    assert!(engine.compute_objective().unwrap() < 1e-20);
    let gradient = engine.compute_sensitivities().unwrap();
    assert!(gradient.amax() < 1e-10);
}

#[test]
fn noisy_sensor_files_are_reproducible() {
    let dir = data_output_path().join("noisy_sensors");
    fs::create_dir_all(&dir).unwrap();
    let mut settings = pointwise(tight_settings());
    settings.postprocess.output_directory = dir.clone();
    settings.postprocess.write_sensors = true;
    settings.postprocess.noise_std = 0.01;
    let mut engine = build_engine(create_unit_square_quad_mesh(2).unwrap(), settings, parameters());
    engine.forward_solve().unwrap();

    engine.write_outputs(None).unwrap();
    let first = read_table(&dir.join("sensor.0.dat")).unwrap();
    engine.write_outputs(None).unwrap();
    let second = read_table(&dir.join("sensor.0.dat")).unwrap();
    assert_eq!(first, second);

    let exact = engine.responses().unwrap().get(0, 0, 0);
    assert_ne!(first[0][1], exact);
    assert!((first[0][1] - exact).abs() < 0.1);
}
