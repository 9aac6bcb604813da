use super::{
    adjoint_weighted_derivatives, MacroElementRegistration, SubgridHandle, SubgridModel, SubgridSolveOutput,
    SubgridSolveRequest,
};
use crate::cell::{element_centroid, LocatedSensor};
use crate::config::ResponseType;
use crate::dual::Dual;
use crate::element::{map_physical_coordinates, ElementValues};
use crate::error::{MultiscaleError, Result};
use crate::estimate::estimate_element_errors_squared;
use crate::functions::FunctionManager;
use crate::io::{OutputMesh, ResultSet, ResultSink};
use crate::microstructure::{MaterialData, SeedSet};
use crate::physics::{
    element_residual, fields_at_points, interpolate, seed_fields, seed_state, EvaluationContext, PhysicsEvaluator,
    PointResidual, PointState, SeedMode, TrialData,
};
use crate::response::{ResponseArray, ResponseReducer};
use nalgebra::{DVector, Point3};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Physics whose fluxes are multiplied by a constant factor.
struct ScaledFlux<'a> {
    inner: &'a dyn PhysicsEvaluator,
    scale: f64,
}

impl<'a> PhysicsEvaluator for ScaledFlux<'a> {
    fn variables(&self) -> Vec<String> {
        self.inner.variables()
    }

    fn evaluate(&self, state: &PointState) -> eyre::Result<PointResidual> {
        let mut point = self.inner.evaluate(state)?;
        for flux in point.flux.iter_mut().flat_map(|flux| flux.iter_mut()) {
            *flux *= self.scale;
        }
        Ok(point)
    }
}

/// Evaluates registered macro elements with effective properties.
///
/// The element is integrated directly with the macro physics, whose fluxes are scaled by a
/// constant homogenization factor. A factor of one reproduces the plain element.
pub struct HomogenizedModel {
    physics: Arc<dyn PhysicsEvaluator>,
    variables: Vec<String>,
    flux_scale: f64,
    seeds: Option<SeedSet>,
    elements: Vec<HomogenizedElement>,
}

impl std::fmt::Debug for HomogenizedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HomogenizedModel")
            .field("variables", &self.variables)
            .field("flux_scale", &self.flux_scale)
            .field("elements", &self.elements.len())
            .finish()
    }
}

struct HomogenizedElement {
    registration: MacroElementRegistration,
    values: ElementValues,
    material: Option<MaterialData>,
    sensors: Vec<LocatedSensor>,
    current: Option<DVector<f64>>,
    history: BTreeMap<usize, (f64, DVector<f64>)>,
}

impl HomogenizedElement {
    fn solution(&self, time_index: Option<usize>) -> Option<&DVector<f64>> {
        match time_index {
            Some(index) => self.history.get(&index).map(|(_, u)| u),
            None => self.current.as_ref(),
        }
    }

    fn material_from(&self, seeds: Option<&SeedSet>) -> Result<Option<MaterialData>> {
        match seeds {
            Some(seeds) => {
                let shape = self.registration.shape;
                let centroid = element_centroid(&self.registration.nodes, shape.dim());
                let (seed, _) = seeds.nearest_seed(&centroid)?;
                Ok(Some(seeds.material()[seed]))
            }
            None => Ok(self.registration.material),
        }
    }
}

impl HomogenizedModel {
    pub fn new(physics: Arc<dyn PhysicsEvaluator>, flux_scale: f64) -> Self {
        Self {
            variables: physics.variables(),
            physics,
            flux_scale,
            seeds: None,
            elements: Vec::new(),
        }
    }

    pub fn with_seeds(self, seeds: SeedSet) -> Self {
        Self {
            seeds: Some(seeds),
            ..self
        }
    }

    fn element(&self, handle: SubgridHandle) -> &HomogenizedElement {
        self.elements
            .get(handle.index())
            .unwrap_or_else(|| panic!("subgrid handle {:?} was not issued by this model", handle))
    }

    fn element_mut(&mut self, handle: SubgridHandle) -> &mut HomogenizedElement {
        self.elements
            .get_mut(handle.index())
            .unwrap_or_else(|| panic!("subgrid handle {:?} was not issued by this model", handle))
    }
}

impl SubgridModel for HomogenizedModel {
    fn name(&self) -> &str {
        "homogenized"
    }

    fn register_macro_element(&mut self, registration: MacroElementRegistration) -> Result<SubgridHandle> {
        let values = ElementValues::compute(registration.shape.reference(), &registration.nodes)?;
        let mut element = HomogenizedElement {
            registration,
            values,
            material: None,
            sensors: Vec::new(),
            current: None,
            history: BTreeMap::new(),
        };
        element.material = element.material_from(self.seeds.as_ref())?;
        self.elements.push(element);
        Ok(SubgridHandle::new(self.elements.len() - 1))
    }

    fn solve(&mut self, handle: SubgridHandle, request: &SubgridSolveRequest) -> Result<SubgridSolveOutput> {
        let physics = ScaledFlux {
            inner: &*self.physics,
            scale: self.flux_scale,
        };
        let nv = self.variables.len();
        let element = self
            .elements
            .get(handle.index())
            .unwrap_or_else(|| panic!("subgrid handle {:?} was not issued by this model", handle));

        let mode = request.seed_mode();
        let num_channels = request.num_channels();
        let (u, u_prev) = seed_state(mode, request.macro_state, request.macro_previous_state);
        let fields = seed_fields(mode, request.fields, request.num_active_params, num_channels);
        let fields = fields_at_points(&element.values, &fields, request.field_names.len());
        let context = EvaluationContext {
            params: request.parameters,
            field_names: request.field_names,
            time: request.time,
            dt: request.dt,
        };
        let trial = TrialData {
            values: &element.values,
            u: &u,
            u_prev: u_prev.as_deref(),
            fields: &fields,
            material: element.material.as_ref(),
        };
        let residual = element_residual(&physics, &context, &trial, nv)?;
        let sensitivity = match (request.adjoint, mode, request.macro_adjoint) {
            (true, SeedMode::Parameters, Some(phi)) => Some(adjoint_weighted_derivatives(&residual, phi, num_channels)),
            _ => None,
        };

        let state = DVector::from_column_slice(request.macro_state);
        let element = self.element_mut(handle);
        element.current = Some(state.clone());
        element.history.insert(request.time_index, (request.time, state));

        Ok(SubgridSolveOutput {
            residual,
            sensitivity,
            iterations: 0,
        })
    }

    fn compute_error(
        &self,
        time: f64,
        time_index: usize,
        handle: SubgridHandle,
        functions: &dyn FunctionManager,
    ) -> Result<DVector<f64>> {
        let element = self.element(handle);
        let u = element.solution(Some(time_index)).ok_or_else(|| {
            MultiscaleError::configuration(format!(
                "no solution of macro element {} at time index {}",
                element.registration.element, time_index
            ))
        })?;
        estimate_element_errors_squared(&element.values, u.as_slice(), &self.variables, functions, time)
    }

    fn compute_objective(
        &self,
        _response_type: ResponseType,
        mode: SeedMode,
        time: f64,
        time_index: usize,
        handle: SubgridHandle,
        reducer: &ResponseReducer,
    ) -> Result<Dual<f64>> {
        let element = self.element(handle);
        let u = element
            .solution(Some(time_index))
            .or(element.current.as_ref())
            .ok_or_else(|| MultiscaleError::configuration("subgrid objective requested before any solve"))?;
        // The objective depends on the macro state only.
        let (u, _) = seed_state(mode, u.as_slice(), None);
        Ok(reducer.element_objective(
            &element.values,
            element.registration.shape,
            &element.sensors,
            &u,
            time,
            time_index.saturating_sub(1),
        ))
    }

    fn accumulate_responses(
        &self,
        handle: SubgridHandle,
        time: f64,
        time_index: usize,
        reducer: &ResponseReducer,
        array: &mut ResponseArray,
    ) {
        let element = self.element(handle);
        if let Some(u) = element.solution(Some(time_index)).or(element.current.as_ref()) {
            reducer.accumulate_responses(
                &element.values,
                element.registration.shape,
                &element.sensors,
                u.as_slice(),
                time,
                time_index.saturating_sub(1),
                array,
            );
        }
    }

    fn add_sensors(&mut self, sensors: &[(usize, Point3<f64>)], tolerance: f64, handle: SubgridHandle) -> usize {
        let element = self.element_mut(handle);
        let reference = element.registration.shape.reference();
        let mut found = 0;
        for &(slot, point) in sensors {
            if let Some(xi) = map_physical_coordinates(reference, &element.registration.nodes, &point, tolerance) {
                element.sensors.push(LocatedSensor { slot, point, xi });
                found += 1;
            }
        }
        found
    }

    fn persist_solution(
        &self,
        label: &str,
        handle: SubgridHandle,
        time_index: usize,
        sink: &mut dyn ResultSink,
    ) -> Result<()> {
        let element = self.element(handle);
        let Some((time, u)) = element.history.get(&time_index) else {
            return Ok(());
        };
        let n = element.registration.nodes.len();
        let results = self
            .variables
            .iter()
            .enumerate()
            .fold(ResultSet::default(), |results, (v, name)| {
                results.with_node_field(name.clone(), u.rows(v * n, n).iter().copied().collect())
            });
        let mesh = OutputMesh {
            shape: element.registration.shape,
            vertices: element.registration.nodes.clone(),
            connectivity: vec![(0..n).collect()],
        };
        sink.write(
            &format!("{}_subgrid_{}", label, element.registration.element),
            time_index,
            *time,
            &mesh,
            &results,
        )?;
        Ok(())
    }

    fn clear(&mut self) {
        self.elements.clear();
    }

    fn update_mesh_data(&mut self, seeds: &SeedSet) -> Result<()> {
        self.seeds = Some(seeds.clone());
        for element in &mut self.elements {
            element.material = element.material_from(Some(seeds))?;
        }
        Ok(())
    }

    fn mean_fields(&self, handle: SubgridHandle, time_index: Option<usize>) -> Option<Vec<f64>> {
        let element = self.element(handle);
        let u = element.solution(time_index)?;
        let local: Vec<Dual<f64>> = u.iter().map(|&v| Dual::constant(v)).collect();
        let values = &element.values;
        let nv = self.variables.len();
        let mut integrals = vec![0.0; nv];
        for q in 0..values.num_points() {
            for (integral, u) in integrals.iter_mut().zip(interpolate(&values.basis, q, &local, nv)) {
                *integral += values.weights[q] * u.value();
            }
        }
        let volume = values.volume();
        Some(integrals.into_iter().map(|i| i / volume).collect())
    }
}
