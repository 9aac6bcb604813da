use mscale::cell::LocatedSensor;
use mscale::config::{PostprocessSettings, RegularizationKind, RegularizationSettings, ResponseType};
use mscale::dual::Dual;
use mscale::element::{ElementShape, ElementValues};
use mscale::functions::FunctionRegistry;
use mscale::io::text::read_table;
use mscale::response::{ResponseArray, ResponseReducer, SensorData};
use nalgebra::Point3;
use std::fs;
use std::sync::Arc;

use super::data_output_path;

fn unit_square() -> ElementValues {
    let nodes = [
        Point3::new(0.0, 0.0, 0.0),
        Point3::new(1.0, 0.0, 0.0),
        Point3::new(1.0, 1.0, 0.0),
        Point3::new(0.0, 1.0, 0.0),
    ];
    ElementValues::compute(ElementShape::Quad4.reference(), &nodes).unwrap()
}

fn reducer(settings: PostprocessSettings) -> ResponseReducer {
    ResponseReducer::new(settings, Arc::new(FunctionRegistry::new()), vec!["u".to_string()])
}

fn constants(values: &[f64]) -> Vec<Dual<f64>> {
    values.iter().map(|&v| Dual::constant(v)).collect()
}

fn centre_sensor() -> LocatedSensor {
    LocatedSensor {
        slot: 0,
        point: Point3::new(0.5, 0.5, 0.0),
        xi: vec![0.0, 0.0],
    }
}

fn assert_close(a: f64, b: f64) {
    assert!((a - b).abs() <= 1e-12 * (1.0 + b.abs()), "{} != {}", a, b);
}

#[test]
fn response_array_layout() {
    let mut array = ResponseArray::zeros(2, 3, 4);
    array.set(1, 2, 3, 5.0);
    array.add(1, 2, 3, 1.0);
    array.add(0, 1, 0, 2.0);
    assert_eq!(array.get(1, 2, 3), 6.0);
    assert_eq!(array.as_slice()[(1 * 3 + 2) * 4 + 3], 6.0);
    assert_eq!(array.as_slice()[4], 2.0);
    assert_eq!(array.as_slice().len(), 24);
}

#[test]
#[should_panic]
fn response_array_rejects_out_of_range_slot() {
    ResponseArray::zeros(1, 1, 1).get(1, 0, 0);
}

#[test]
fn noise_is_reproducible() {
    let array = ResponseArray::zeros(3, 2, 2);
    let a = array.with_noise(0.1, 7);
    let b = array.with_noise(0.1, 7);
    let c = array.with_noise(0.1, 8);
    assert_eq!(a, b);
    assert_ne!(a, c);
    assert_eq!(array.with_noise(0.0, 7), array);
}

#[test]
fn global_objective_of_constant_state() {
    let reducer = reducer(PostprocessSettings::default());
    let values = unit_square();

    // Every node seeded in the same channel, so du/dp = 1 everywhere
    let u = vec![Dual::variable(2.0, 0, 1); 4];
    let objective = reducer.global_objective(&values, &u, 0.0);
    assert_close(objective.value(), 2.0);
    assert_close(objective.derivative(0), 2.0);
}

#[test]
fn pointwise_objective_uses_data_when_available() {
    let mut settings = PostprocessSettings::default();
    settings.response_type = ResponseType::Pointwise;
    settings.sensor_locations = vec![[0.5, 0.5, 0.0]];
    let mut reducer = reducer(settings);
    let u = constants(&[1.0, 2.0, 3.0, 4.0]);
    let sensor = centre_sensor();

    let state = reducer.state_at(ElementShape::Quad4, &sensor.xi, &u);
    assert_close(state[0].value(), 2.5);

    // Without data, the target (zero) is the reference
    let objective = reducer.pointwise_objective(ElementShape::Quad4, &sensor, &u, 0.0, 0);
    assert_close(objective.value(), 0.5 * 2.5 * 2.5);

    reducer.set_sensor_data(Some(SensorData::new(vec![vec![vec![0.5]]])));
    let objective = reducer.pointwise_objective(ElementShape::Quad4, &sensor, &u, 0.0, 0);
    assert_close(objective.value(), 2.0);

    let total = reducer.element_objective(&unit_square(), ElementShape::Quad4, &[sensor], &u, 0.0, 0);
    assert_close(total.value(), 2.0);
}

#[test]
fn accumulated_responses() {
    let values = unit_square();
    let global = reducer(PostprocessSettings::default());
    assert_eq!(global.num_slots(), 1);
    assert_eq!(global.num_components(), 1);
    let mut array = ResponseArray::zeros(1, 1, 2);
    global.accumulate_responses(&values, ElementShape::Quad4, &[], &[1.0, 2.0, 3.0, 4.0], 0.0, 1, &mut array);
    global.accumulate_responses(&values, ElementShape::Quad4, &[], &[1.0, 1.0, 1.0, 1.0], 0.0, 1, &mut array);
    assert_eq!(array.get(0, 0, 0), 0.0);
    assert_close(array.get(0, 0, 1), 3.5);

    let mut settings = PostprocessSettings::default();
    settings.response_type = ResponseType::Pointwise;
    settings.sensor_locations = vec![[0.0, 0.0, 0.0], [0.5, 0.5, 0.0]];
    let pointwise = reducer(settings);
    assert_eq!(pointwise.num_slots(), 2);
    let mut sensor = centre_sensor();
    sensor.slot = 1;
    let mut array = ResponseArray::zeros(2, 1, 1);
    pointwise.accumulate_responses(&values, ElementShape::Quad4, &[sensor], &[1.0, 2.0, 3.0, 4.0], 0.0, 0, &mut array);
    assert_eq!(array.get(0, 0, 0), 0.0);
    assert_close(array.get(1, 0, 0), 2.5);

    let data = SensorData::from_responses(&array);
    assert_eq!(data.get(1, 0), Some(&[2.5][..]));
    assert_eq!(data.get(2, 0), None);
}

#[test]
fn regularization_terms() {
    let values = unit_square();
    let mut settings = PostprocessSettings::default();
    settings.regularization = vec![RegularizationSettings {
        parameter: "q".to_string(),
        kind: RegularizationKind::L2,
        constant: 2.0,
    }];
    let names = vec!["other".to_string(), "q".to_string()];
    // Fields are component-major: "other" first, then "q"
    let mut fields = constants(&[9.0; 4]);
    fields.extend(constants(&[3.0; 4]));
    let l2 = reducer(settings.clone()).element_regularization(&values, &fields, &names);
    assert_close(l2.value(), 0.5 * 2.0 * 9.0);

    settings.regularization[0].kind = RegularizationKind::H1;
    // q = x on the unit square
    let mut fields = constants(&[9.0; 4]);
    fields.extend(constants(&[0.0, 1.0, 1.0, 0.0]));
    let h1 = reducer(settings.clone()).element_regularization(&values, &fields, &names);
    assert_close(h1.value(), 0.5 * 2.0);

    // Regularization of an unknown field is ignored
    settings.regularization[0].parameter = "missing".to_string();
    let none = reducer(settings).element_regularization(&values, &fields, &names);
    assert_eq!(none.value(), 0.0);
}

#[test]
fn output_files() {
    let dir = data_output_path().join("response_outputs");
    fs::create_dir_all(&dir).unwrap();
    let mut settings = PostprocessSettings::default();
    settings.response_type = ResponseType::Pointwise;
    settings.sensor_locations = vec![[0.0, 0.0, 0.0], [1.0, 1.0, 0.0]];
    settings.output_directory = dir.clone();
    settings.write_sensors = true;
    settings.write_objective = true;
    settings.write_dakota = true;
    settings.write_height_file = true;
    let reducer = reducer(settings);

    let mut responses = ResponseArray::zeros(2, 1, 2);
    responses.set(0, 0, 1, 1.5);
    responses.set(1, 0, 0, -2.0);
    let height = [(0.0, 0.0, 0.1), (1.0, 0.0, 0.2)];
    reducer
        .write_outputs(&responses, &[0.0, 0.5], Some(0.25), Some(&height))
        .unwrap();

    assert_eq!(read_table(&dir.join("sensor.0.dat")).unwrap(), vec![vec![0.0, 0.0], vec![0.5, 1.5]]);
    assert_eq!(read_table(&dir.join("sensor.1.dat")).unwrap(), vec![vec![0.0, -2.0], vec![0.5, 0.0]]);
    assert_eq!(read_table(&dir.join("obj.dat")).unwrap(), vec![vec![0.25]]);
    assert_eq!(read_table(&dir.join("results.out")).unwrap(), vec![vec![0.0, 1.5, -2.0, 0.0]]);
    assert_eq!(
        read_table(&dir.join("meshpert.dat")).unwrap(),
        vec![vec![0.0, 0.0, 0.1], vec![1.0, 0.0, 0.2]]
    );
}
