//! Responses, objectives and their reduction across elements and processes.
//!
//! Responses are gathered into a [`ResponseArray`] indexed by `[slot, component, time]`. For
//! global responses there is a single slot holding the domain integral; for pointwise
//! responses there is one slot per sensor.
use crate::cell::LocatedSensor;
use crate::config::{PostprocessSettings, RegularizationKind, RegularizationSettings, ResponseType};
use crate::distributed::Communicator;
use crate::dual::Dual;
use crate::element::{ElementShape, ElementValues};
use crate::error::Result;
use crate::functions::FunctionManager;
use crate::io::text::{format_row, format_value, write_rows};
use crate::physics::interpolate;
use itertools::izip;
use log::debug;
use nalgebra::{DMatrix, Point3};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::f64::consts::PI;
use std::fs;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseArray {
    num_slots: usize,
    num_components: usize,
    num_times: usize,
    values: Vec<f64>,
}

impl ResponseArray {
    pub fn zeros(num_slots: usize, num_components: usize, num_times: usize) -> Self {
        Self {
            num_slots,
            num_components,
            num_times,
            values: vec![0.0; num_slots * num_components * num_times],
        }
    }

    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    pub fn num_components(&self) -> usize {
        self.num_components
    }

    pub fn num_times(&self) -> usize {
        self.num_times
    }

    fn index(&self, slot: usize, component: usize, time: usize) -> usize {
        assert!(slot < self.num_slots && component < self.num_components && time < self.num_times);
        (slot * self.num_components + component) * self.num_times + time
    }

    pub fn get(&self, slot: usize, component: usize, time: usize) -> f64 {
        self.values[self.index(slot, component, time)]
    }

    pub fn set(&mut self, slot: usize, component: usize, time: usize, value: f64) {
        let i = self.index(slot, component, time);
        self.values[i] = value;
    }

    pub fn add(&mut self, slot: usize, component: usize, time: usize, value: f64) {
        let i = self.index(slot, component, time);
        self.values[i] += value;
    }

    /// Values flattened over slot, then component, then time.
    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }

    /// Sums the arrays of all processes.
    pub fn sum_all(&mut self, comm: &dyn Communicator) {
        comm.sum_all(&mut self.values);
    }

    /// Adds independent zero-mean Gaussian noise to every entry.
    pub fn with_noise(&self, std_dev: f64, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut noisy = self.clone();
        for v in &mut noisy.values {
            *v += box_muller(&mut rng, std_dev);
        }
        noisy
    }
}

/// `sigma sqrt(-2 ln U1) cos(2 pi U2)` with `U1` in `(0, 1]`.
pub fn box_muller(rng: &mut impl Rng, std_dev: f64) -> f64 {
    let u1 = 1.0 - rng.gen::<f64>();
    let u2 = rng.gen::<f64>();
    std_dev * (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}

/// Measured data per sensor, time and component.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorData {
    values: Vec<Vec<Vec<f64>>>,
}

impl SensorData {
    /// `values[sensor][time][component]`
    pub fn new(values: Vec<Vec<Vec<f64>>>) -> Self {
        Self { values }
    }

    /// Uses pointwise responses, for instance noisy synthetic ones, as data.
    pub fn from_responses(array: &ResponseArray) -> Self {
        let values = (0..array.num_slots())
            .map(|s| {
                (0..array.num_times())
                    .map(|t| {
                        (0..array.num_components())
                            .map(|c| array.get(s, c, t))
                            .collect()
                    })
                    .collect()
            })
            .collect();
        Self { values }
    }

    pub fn get(&self, sensor: usize, time: usize) -> Option<&[f64]> {
        self.values
            .get(sensor)
            .and_then(|times| times.get(time))
            .map(Vec::as_slice)
    }
}

/// Reduces responses and objectives over elements and processes, and writes them out.
pub struct ResponseReducer {
    settings: PostprocessSettings,
    functions: Arc<dyn FunctionManager>,
    variables: Vec<String>,
    sensor_data: Option<SensorData>,
}

impl std::fmt::Debug for ResponseReducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseReducer")
            .field("response_type", &self.settings.response_type)
            .field("variables", &self.variables)
            .field("has_sensor_data", &self.sensor_data.is_some())
            .finish()
    }
}

impl ResponseReducer {
    pub fn new(settings: PostprocessSettings, functions: Arc<dyn FunctionManager>, variables: Vec<String>) -> Self {
        Self {
            settings,
            functions,
            variables,
            sensor_data: None,
        }
    }

    pub fn response_type(&self) -> ResponseType {
        self.settings.response_type
    }

    pub fn settings(&self) -> &PostprocessSettings {
        &self.settings
    }

    pub fn functions(&self) -> &dyn FunctionManager {
        self.functions.as_ref()
    }

    pub fn set_sensor_data(&mut self, data: Option<SensorData>) {
        self.sensor_data = data;
    }

    pub fn sensor_data(&self) -> Option<&SensorData> {
        self.sensor_data.as_ref()
    }

    pub fn num_components(&self) -> usize {
        self.functions.response_names(&self.variables).len()
    }

    pub fn num_slots(&self) -> usize {
        match self.settings.response_type {
            ResponseType::Global => 1,
            ResponseType::Pointwise => self.settings.sensor_locations.len(),
        }
    }

    fn responses_at(&self, x: &Point3<f64>, time: f64, u: &[Dual<f64>]) -> Vec<Dual<f64>> {
        self.functions.responses(x, time, u, &self.variables)
    }

    /// State variables at reference coordinates `xi` of an element.
    pub fn state_at(&self, shape: ElementShape, xi: &[f64], u: &[Dual<f64>]) -> Vec<Dual<f64>> {
        let phi = shape.reference().evaluate_basis(xi);
        let phi = DMatrix::from_row_slice(1, phi.len(), phi.as_slice());
        interpolate(&phi, 0, u, self.variables.len())
    }

    /// `sum_q sum_c w_c (r_c - t_c)^2 / 2 * |J| w_q`
    pub fn global_objective(&self, values: &ElementValues, u: &[Dual<f64>], time: f64) -> Dual<f64> {
        let mut objective = Dual::constant(0.0);
        for q in 0..values.num_points() {
            let x = &values.points[q];
            let u_q = interpolate(&values.basis, q, u, self.variables.len());
            let r = self.responses_at(x, time, &u_q);
            let weights = self.functions.weights(x, time, r.len());
            let targets = self.functions.targets(x, time, r.len());
            for (r, w, t) in izip!(&r, weights, targets) {
                let misfit = r - t;
                objective += &(&misfit * &misfit * (0.5 * w * values.weights[q]));
            }
        }
        objective
    }

    /// `sum_c (r_c(x_s) - d_c)^2 / 2`, with targets standing in for missing data.
    pub fn pointwise_objective(
        &self,
        shape: ElementShape,
        sensor: &LocatedSensor,
        u: &[Dual<f64>],
        time: f64,
        time_slot: usize,
    ) -> Dual<f64> {
        let u_s = self.state_at(shape, &sensor.xi, u);
        let r = self.responses_at(&sensor.point, time, &u_s);
        let data = self
            .sensor_data
            .as_ref()
            .and_then(|data| data.get(sensor.slot, time_slot))
            .map(<[f64]>::to_vec)
            .unwrap_or_else(|| self.functions.targets(&sensor.point, time, r.len()));
        r.iter()
            .zip(data)
            .map(|(r, d)| {
                let misfit = r - d;
                &misfit * &misfit * 0.5
            })
            .sum()
    }

    /// Objective contribution of one element at one time step.
    pub fn element_objective(
        &self,
        values: &ElementValues,
        shape: ElementShape,
        sensors: &[LocatedSensor],
        u: &[Dual<f64>],
        time: f64,
        time_slot: usize,
    ) -> Dual<f64> {
        match self.settings.response_type {
            ResponseType::Global => self.global_objective(values, u, time),
            ResponseType::Pointwise => sensors
                .iter()
                .map(|sensor| self.pointwise_objective(shape, sensor, u, time, time_slot))
                .sum(),
        }
    }

    /// Adds the responses of one element to `array`.
    pub fn accumulate_responses(
        &self,
        values: &ElementValues,
        shape: ElementShape,
        sensors: &[LocatedSensor],
        u: &[f64],
        time: f64,
        time_slot: usize,
        array: &mut ResponseArray,
    ) {
        let u: Vec<Dual<f64>> = u.iter().map(|&v| Dual::constant(v)).collect();
        match self.settings.response_type {
            ResponseType::Global => {
                for q in 0..values.num_points() {
                    let x = &values.points[q];
                    let u_q = interpolate(&values.basis, q, &u, self.variables.len());
                    let r = self.responses_at(x, time, &u_q);
                    let weights = self.functions.weights(x, time, r.len());
                    for (c, (r, w)) in r.iter().zip(weights).enumerate() {
                        array.add(0, c, time_slot, r.value() * w * values.weights[q]);
                    }
                }
            }
            ResponseType::Pointwise => {
                for sensor in sensors {
                    let u_s = self.state_at(shape, &sensor.xi, &u);
                    for (c, r) in self.responses_at(&sensor.point, time, &u_s).iter().enumerate() {
                        array.set(sensor.slot, c, time_slot, r.value());
                    }
                }
            }
        }
    }

    /// Regularization `beta/2 int q^2` or `beta/2 int |grad q|^2` of one element.
    ///
    /// `fields` holds the element's discretized parameter dofs, component-major in the order
    /// of `field_names`.
    pub fn element_regularization(&self, values: &ElementValues, fields: &[Dual<f64>], field_names: &[String]) -> Dual<f64> {
        let mut total = Dual::constant(0.0);
        let n = values.num_nodes();
        for RegularizationSettings {
            parameter,
            kind,
            constant,
        } in &self.settings.regularization
        {
            let Some(k) = field_names.iter().position(|name| name == parameter) else {
                continue;
            };
            let local = &fields[k * n..(k + 1) * n];
            for q in 0..values.num_points() {
                let integrand: Dual<f64> = match kind {
                    RegularizationKind::L2 => {
                        let q_value = interpolate(&values.basis, q, local, 1).remove(0);
                        &q_value * &q_value
                    }
                    RegularizationKind::H1 => {
                        let grad = &values.gradients[q];
                        (0..grad.nrows())
                            .map(|d| {
                                let g: Dual<f64> = (0..n).map(|i| &local[i] * grad[(d, i)]).sum();
                                &g * &g
                            })
                            .sum()
                    }
                };
                total += &(integrand * (0.5 * constant * values.weights[q]));
            }
        }
        total
    }

    /// Writes the enabled output files. Only call on the root process.
    pub fn write_outputs(
        &self,
        responses: &ResponseArray,
        times: &[f64],
        objective: Option<f64>,
        height: Option<&[(f64, f64, f64)]>,
    ) -> Result<()> {
        let dir = &self.settings.output_directory;
        let observed = if self.settings.noise_std > 0.0 {
            responses.with_noise(self.settings.noise_std, self.settings.noise_seed)
        } else {
            responses.clone()
        };

        if self.settings.write_sensors && self.settings.response_type == ResponseType::Pointwise {
            write_sensor_files(dir, &self.settings.sensor_prefix, &observed, times)?;
        }
        if let (true, Some(objective)) = (self.settings.write_objective, objective) {
            write_objective(dir, objective)?;
        }
        if self.settings.write_dakota {
            write_dakota(dir, &observed)?;
        }
        if let (true, Some(rows)) = (self.settings.write_height_file, height) {
            write_height_file(dir, rows)?;
        }
        Ok(())
    }
}

/// One file `<prefix>.<k>.dat` per sensor with rows `time v_1 v_2 ...`.
pub fn write_sensor_files(dir: &Path, prefix: &str, responses: &ResponseArray, times: &[f64]) -> Result<()> {
    assert_eq!(times.len(), responses.num_times());
    for s in 0..responses.num_slots() {
        let rows = times.iter().enumerate().map(|(t, &time)| {
            std::iter::once(time)
                .chain((0..responses.num_components()).map(|c| responses.get(s, c, t)))
                .collect()
        });
        write_rows(&dir.join(format!("{}.{}.dat", prefix, s)), rows, "  ")?;
    }
    debug!("Wrote {} sensor files to {}", responses.num_slots(), dir.display());
    Ok(())
}

pub fn write_objective(dir: &Path, objective: f64) -> Result<()> {
    fs::write(dir.join("obj.dat"), format!("{}\n", format_value(objective)))?;
    Ok(())
}

/// All responses on a single line, separated by two spaces.
pub fn write_dakota(dir: &Path, responses: &ResponseArray) -> Result<()> {
    let line = format_row(responses.as_slice().iter().copied(), "  ");
    fs::write(dir.join("results.out"), format!("{}\n", line))?;
    Ok(())
}

/// Rows `x y u` of the final state, readable as a height perturbation file.
pub fn write_height_file(dir: &Path, rows: &[(f64, f64, f64)]) -> Result<()> {
    write_rows(
        &dir.join("meshpert.dat"),
        rows.iter().map(|&(x, y, u)| vec![x, y, u]),
        "  ",
    )
}
