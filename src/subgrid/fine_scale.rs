use super::{
    adjoint_weighted_derivatives, MacroElementRegistration, SubgridHandle, SubgridModel, SubgridSolveOutput,
    SubgridSolveRequest,
};
use crate::cell::{element_centroid, LocatedSensor};
use crate::config::{FineScaleSettings, ResponseType};
use crate::dual::Dual;
use crate::element::{map_physical_coordinates, map_reference_coords, ElementShape, ElementValues};
use crate::error::{MultiscaleError, Result};
use crate::estimate::estimate_element_errors_squared;
use crate::functions::FunctionManager;
use crate::io::{OutputMesh, ResultSet, ResultSink};
use crate::microstructure::{MaterialData, SeedSet};
use crate::parameters::ParameterValues;
use crate::physics::{
    interpolate, seed_fields, seed_state, weak_form_residual, EvaluationContext, PhysicsEvaluator, SeedMode,
    TestFunctions, TrialData,
};
use crate::response::{ResponseArray, ResponseReducer};
use log::trace;
use nalgebra::{DMatrix, DVector, Point3};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Residual norm below which a local problem counts as solved regardless of the relative
/// tolerance.
const ABSOLUTE_TOLERANCE: f64 = 1e-14;

/// Resolves every registered macro element with a fine mesh.
///
/// The fine mesh has `refinement` elements per macro edge and is obtained by mapping a
/// uniform grid on the macro reference element through the macro geometry. The macro
/// interpolant is imposed on the whole fine boundary. The macro residual is the fine weak form
/// tested with the macro basis functions, and its derivatives follow from the implicit function
/// theorem applied to the fine problem.
///
/// In transient runs each fine problem carries its own history: a step starts from the fine
/// state of the previous time index, and only the first step starts from the interpolated
/// initial macro state. The adjoint of that history is carried backward in time by
/// [`SubgridModel::propagate_history_adjoint`].
pub struct FineScaleModel {
    physics: Arc<dyn PhysicsEvaluator>,
    variables: Vec<String>,
    settings: FineScaleSettings,
    seeds: Option<SeedSet>,
    problems: Vec<FineProblem>,
}

impl std::fmt::Debug for FineScaleModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FineScaleModel")
            .field("variables", &self.variables)
            .field("settings", &self.settings)
            .field("problems", &self.problems.len())
            .finish()
    }
}

struct FineProblem {
    registration: MacroElementRegistration,
    vertices: Vec<Point3<f64>>,
    /// Macro basis at the fine nodes, one row per node.
    node_basis: DMatrix<f64>,
    boundary: Vec<bool>,
    elements: Vec<Vec<usize>>,
    values: Vec<ElementValues>,
    /// Macro basis and gradients at the quadrature points of each fine element.
    macro_basis: Vec<DMatrix<f64>>,
    macro_gradients: Vec<Vec<DMatrix<f64>>>,
    materials: Vec<Option<MaterialData>>,
    sensors: Vec<(usize, LocatedSensor)>,
    /// Fine dofs of the last solve, component-major.
    current: Option<DVector<f64>>,
    history: BTreeMap<usize, (f64, DVector<f64>)>,
    /// Macro adjoint interpolated to the fine nodes, for output.
    adjoint_fields: BTreeMap<usize, DVector<f64>>,
    /// Derivative of the later steps' adjoint-weighted residuals and objective with respect to
    /// the fine state at each time index.
    history_adjoint: BTreeMap<usize, DVector<f64>>,
    /// Derivatives of the fine dofs with respect to the channels of each seed mode.
    tangents: FxHashMap<SeedMode, DMatrix<f64>>,
}

/// Uniform grid on `[-1, 1]^dim` with `m` cells per axis, in the node order of the reference
/// elements.
fn reference_grid(dim: usize, m: usize) -> (Vec<[f64; 3]>, Vec<Vec<usize>>) {
    let np = m + 1;
    let nz = if dim == 3 { np } else { 1 };
    let coord = |i: usize| -1.0 + 2.0 * i as f64 / m as f64;
    let index = |i: usize, j: usize, k: usize| i + np * (j + np * k);

    let mut nodes = Vec::with_capacity(np * np * nz);
    for k in 0..nz {
        for j in 0..np {
            for i in 0..np {
                let z = if dim == 3 { coord(k) } else { 0.0 };
                nodes.push([coord(i), coord(j), z]);
            }
        }
    }

    let mut elements = Vec::new();
    for k in 0..(nz - 1).max(1) {
        for j in 0..m {
            for i in 0..m {
                let mut element = vec![index(i, j, k), index(i + 1, j, k), index(i + 1, j + 1, k), index(i, j + 1, k)];
                if dim == 3 {
                    element.extend_from_within(0..4);
                    for node in &mut element[4..] {
                        *node += np * np;
                    }
                }
                elements.push(element);
            }
        }
    }
    (nodes, elements)
}

impl FineProblem {
    fn num_nodes(&self) -> usize {
        self.vertices.len()
    }

    fn shape(&self) -> ElementShape {
        self.registration.shape
    }

    fn element_coords(&self, el: usize) -> Vec<Point3<f64>> {
        self.elements[el].iter().map(|&v| self.vertices[v]).collect()
    }

    fn element_dofs(&self, el: usize, num_variables: usize) -> Vec<usize> {
        let n = self.num_nodes();
        (0..num_variables)
            .flat_map(|v| self.elements[el].iter().map(move |&node| v * n + node))
            .collect()
    }

    /// Macro nodal values, component-major, evaluated at the fine nodes.
    fn interpolate_to_nodes(&self, macro_values: &[Dual<f64>], num_variables: usize) -> Vec<Dual<f64>> {
        let nm = self.node_basis.ncols();
        (0..num_variables)
            .flat_map(|v| {
                (0..self.num_nodes()).map(move |node| {
                    (0..nm)
                        .map(|k| &macro_values[v * nm + k] * self.node_basis[(node, k)])
                        .sum::<Dual<f64>>()
                })
            })
            .collect()
    }

    fn boundary_dofs(&self, num_variables: usize) -> Vec<usize> {
        let n = self.num_nodes();
        (0..num_variables)
            .flat_map(|v| {
                self.boundary
                    .iter()
                    .enumerate()
                    .filter(|(_, &b)| b)
                    .map(move |(node, _)| v * n + node)
            })
            .collect()
    }

    fn fields_at_points(&self, el: usize, fields: &[Dual<f64>], num_fields: usize) -> Vec<Vec<Dual<f64>>> {
        let basis = &self.macro_basis[el];
        (0..basis.nrows())
            .map(|q| interpolate(basis, q, fields, num_fields))
            .collect()
    }

    fn update_materials(&mut self, seeds: Option<&SeedSet>) -> Result<()> {
        let dim = self.shape().dim();
        self.materials = match seeds {
            Some(seeds) => (0..self.elements.len())
                .map(|el| {
                    let centroid = element_centroid(&self.element_coords(el), dim);
                    let (seed, _) = seeds.nearest_seed(&centroid)?;
                    Ok(Some(seeds.material()[seed]))
                })
                .collect::<Result<_>>()?,
            None => vec![self.registration.material; self.elements.len()],
        };
        Ok(())
    }

    fn element_sensors(&self, el: usize) -> Vec<LocatedSensor> {
        self.sensors
            .iter()
            .filter(|(e, _)| *e == el)
            .map(|(_, s)| s.clone())
            .collect()
    }

    /// Previous fine state of a transient step as constants, or the interpolated macro state on
    /// the first step.
    fn previous_state(
        &self,
        request: &SubgridSolveRequest,
        macro_previous: Option<&[Dual<f64>]>,
        num_variables: usize,
    ) -> Result<Option<Vec<Dual<f64>>>> {
        if request.dt.is_none() {
            return Ok(None);
        }
        if request.time_index <= 1 {
            return Ok(macro_previous.map(|prev| self.interpolate_to_nodes(prev, num_variables)));
        }
        let (_, u) = self.history.get(&(request.time_index - 1)).ok_or_else(|| {
            MultiscaleError::configuration(format!(
                "no fine-scale state of macro element {} at time index {}",
                self.registration.element,
                request.time_index - 1
            ))
        })?;
        Ok(Some(u.iter().map(|&v| Dual::constant(v)).collect()))
    }

    fn solution(&self, time_index: Option<usize>) -> Option<&DVector<f64>> {
        match time_index {
            Some(index) => self.history.get(&index).map(|(_, u)| u),
            None => self.current.as_ref(),
        }
    }

    /// Fine dofs as duals carrying the channels of `mode`.
    fn state_duals(&self, u: &DVector<f64>, mode: SeedMode) -> Result<Vec<Dual<f64>>> {
        if mode == SeedMode::None {
            return Ok(u.iter().map(|&v| Dual::constant(v)).collect());
        }
        let tangent = self.tangents.get(&mode).ok_or_else(|| {
            MultiscaleError::configuration(format!(
                "no {:?} tangent available for macro element {}",
                mode, self.registration.element
            ))
        })?;
        Ok(u.iter()
            .enumerate()
            .map(|(i, &v)| Dual::from_parts(v, tangent.row(i).iter().copied().collect()))
            .collect())
    }
}

/// Inputs of the fine-scale weak form that do not change during the local Newton iterations.
struct FineInputs<'a> {
    context: EvaluationContext<'a>,
    /// Previous fine state, component-major over all fine dofs.
    previous: Option<&'a [Dual<f64>]>,
    /// Macro discretized parameter dofs.
    fields: &'a [Dual<f64>],
    num_fields: usize,
}

impl FineScaleModel {
    pub fn new(physics: Arc<dyn PhysicsEvaluator>, settings: FineScaleSettings) -> Self {
        Self {
            variables: physics.variables(),
            physics,
            settings,
            seeds: None,
            problems: Vec::new(),
        }
    }

    /// Assign fine elements the material of their nearest seed.
    pub fn with_seeds(self, seeds: SeedSet) -> Self {
        Self {
            seeds: Some(seeds),
            ..self
        }
    }

    pub fn num_registered(&self) -> usize {
        self.problems.len()
    }

    fn problem(&self, handle: SubgridHandle) -> &FineProblem {
        self.problems
            .get(handle.index())
            .unwrap_or_else(|| panic!("subgrid handle {:?} was not issued by this model", handle))
    }

    fn fine_element_residual(
        physics: &dyn PhysicsEvaluator,
        problem: &FineProblem,
        el: usize,
        inputs: &FineInputs,
        u: &[Dual<f64>],
        macro_test: bool,
        num_variables: usize,
    ) -> eyre::Result<Vec<Dual<f64>>> {
        let dofs = problem.element_dofs(el, num_variables);
        let u_local: Vec<Dual<f64>> = dofs.iter().map(|&g| u[g].clone()).collect();
        let prev_local: Option<Vec<Dual<f64>>> = inputs
            .previous
            .map(|prev| dofs.iter().map(|&g| prev[g].clone()).collect());
        let fields = problem.fields_at_points(el, inputs.fields, inputs.num_fields);
        let values = &problem.values[el];
        let trial = TrialData {
            values,
            u: &u_local,
            u_prev: prev_local.as_deref(),
            fields: &fields,
            material: problem.materials[el].as_ref(),
        };
        let test = if macro_test {
            TestFunctions {
                basis: &problem.macro_basis[el],
                gradients: &problem.macro_gradients[el],
            }
        } else {
            TestFunctions {
                basis: &values.basis,
                gradients: &values.gradients,
            }
        };
        weak_form_residual(physics, &inputs.context, &trial, &test, num_variables)
    }

    /// Fine residual and Jacobian at `u`, with the macro interpolant `g` on the boundary.
    fn assemble_fine_system(
        physics: &dyn PhysicsEvaluator,
        problem: &FineProblem,
        inputs: &FineInputs,
        u: &DVector<f64>,
        g: &[Dual<f64>],
        num_variables: usize,
    ) -> eyre::Result<(DVector<f64>, DMatrix<f64>)> {
        let n = u.len();
        let mut residual = DVector::zeros(n);
        let mut jacobian = DMatrix::zeros(n, n);
        let mut u_duals: Vec<Dual<f64>> = u.iter().map(|&v| Dual::constant(v)).collect();

        for el in 0..problem.elements.len() {
            let dofs = problem.element_dofs(el, num_variables);
            for (j, &gj) in dofs.iter().enumerate() {
                u_duals[gj] = Dual::variable(u[gj], j, dofs.len());
            }
            let r = Self::fine_element_residual(physics, problem, el, inputs, &u_duals, false, num_variables)?;
            for &gj in &dofs {
                u_duals[gj] = Dual::constant(u[gj]);
            }
            for (a, &ga) in dofs.iter().enumerate() {
                residual[ga] += r[a].value();
                for (b, &gb) in dofs.iter().enumerate() {
                    jacobian[(ga, gb)] += r[a].derivative(b);
                }
            }
        }

        for gid in problem.boundary_dofs(num_variables) {
            residual[gid] = u[gid] - g[gid].value();
            jacobian.row_mut(gid).fill(0.0);
            jacobian[(gid, gid)] = 1.0;
        }
        Ok((residual, jacobian))
    }

    /// Explicit derivatives of the fine residual with respect to the request channels.
    fn assemble_channel_derivatives(
        physics: &dyn PhysicsEvaluator,
        problem: &FineProblem,
        inputs: &FineInputs,
        u: &DVector<f64>,
        g: &[Dual<f64>],
        mode: SeedMode,
        num_channels: usize,
        num_variables: usize,
    ) -> eyre::Result<DMatrix<f64>> {
        let mut b = DMatrix::zeros(u.len(), num_channels);
        if mode != SeedMode::State {
            let u_duals: Vec<Dual<f64>> = u.iter().map(|&v| Dual::constant(v)).collect();
            for el in 0..problem.elements.len() {
                let dofs = problem.element_dofs(el, num_variables);
                let r = Self::fine_element_residual(physics, problem, el, inputs, &u_duals, false, num_variables)?;
                for (a, &ga) in dofs.iter().enumerate() {
                    for (c, d) in r[a].derivatives().iter().enumerate() {
                        b[(ga, c)] += d;
                    }
                }
            }
        }
        for gid in problem.boundary_dofs(num_variables) {
            for c in 0..num_channels {
                b[(gid, c)] = -g[gid].derivative(c);
            }
        }
        Ok(b)
    }
}

impl SubgridModel for FineScaleModel {
    fn name(&self) -> &str {
        "fine scale"
    }

    fn register_macro_element(&mut self, registration: MacroElementRegistration) -> Result<SubgridHandle> {
        let shape = registration.shape;
        let reference = shape.reference();
        let dim = shape.dim();
        if registration.nodes.len() != shape.num_nodes() {
            return Err(MultiscaleError::configuration(format!(
                "macro element {} has {} nodes, expected {}",
                registration.element,
                registration.nodes.len(),
                shape.num_nodes()
            )));
        }
        if self.settings.refinement == 0 {
            return Err(MultiscaleError::configuration("fine-scale refinement must be positive"));
        }

        let (node_xi, elements) = reference_grid(dim, self.settings.refinement);
        let vertices: Vec<Point3<f64>> = node_xi
            .iter()
            .map(|xi| map_reference_coords(reference, &registration.nodes, &xi[..dim]))
            .collect();
        let mut node_basis = DMatrix::zeros(node_xi.len(), shape.num_nodes());
        for (i, xi) in node_xi.iter().enumerate() {
            node_basis
                .row_mut(i)
                .copy_from(&reference.evaluate_basis(&xi[..dim]).transpose());
        }
        let boundary = node_xi
            .iter()
            .map(|xi| xi[..dim].iter().any(|c| c.abs() == 1.0))
            .collect();

        let rule = reference.quadrature();
        let mut values = Vec::with_capacity(elements.len());
        let mut macro_basis = Vec::with_capacity(elements.len());
        let mut macro_gradients = Vec::with_capacity(elements.len());
        for element in &elements {
            let coords: Vec<Point3<f64>> = element.iter().map(|&v| vertices[v]).collect();
            values.push(ElementValues::compute(reference, &coords)?);

            // Fine elements are boxes in macro reference coordinates, so the multilinear map
            // of the fine node coordinates is exact.
            let fine_nodes_xi: Vec<Point3<f64>> = element
                .iter()
                .map(|&v| Point3::new(node_xi[v][0], node_xi[v][1], node_xi[v][2]))
                .collect();
            let points_xi: Vec<Vec<f64>> = rule
                .points
                .iter()
                .map(|p| {
                    let xi = map_reference_coords(reference, &fine_nodes_xi, p);
                    xi.coords.iter().take(dim).copied().collect()
                })
                .collect();
            let macro_values =
                ElementValues::at_reference_points(reference, &registration.nodes, &points_xi, &rule.weights)?;
            macro_basis.push(macro_values.basis);
            macro_gradients.push(macro_values.gradients);
        }

        let mut problem = FineProblem {
            registration,
            vertices,
            node_basis,
            boundary,
            elements,
            values,
            macro_basis,
            macro_gradients,
            materials: Vec::new(),
            sensors: Vec::new(),
            current: None,
            history: BTreeMap::new(),
            adjoint_fields: BTreeMap::new(),
            history_adjoint: BTreeMap::new(),
            tangents: FxHashMap::default(),
        };
        problem.update_materials(self.seeds.as_ref())?;

        let handle = SubgridHandle::new(self.problems.len());
        trace!(
            "Registered macro element {} with {} fine elements as {:?}",
            problem.registration.element,
            problem.elements.len(),
            handle
        );
        self.problems.push(problem);
        Ok(handle)
    }

    fn solve(&mut self, handle: SubgridHandle, request: &SubgridSolveRequest) -> Result<SubgridSolveOutput> {
        let Self {
            physics,
            variables,
            settings,
            problems,
            ..
        } = self;
        let problem = problems
            .get_mut(handle.index())
            .unwrap_or_else(|| panic!("subgrid handle {:?} was not issued by this model", handle));
        let physics: &dyn PhysicsEvaluator = &**physics;
        let nv = variables.len();
        let mode = request.seed_mode();
        let num_channels = request.num_channels();
        let num_fields = request.field_names.len();
        assert_eq!(request.macro_state.len(), nv * problem.registration.nodes.len());

        let (u_macro, u_prev_macro) = seed_state(mode, request.macro_state, request.macro_previous_state);
        let fields = seed_fields(mode, request.fields, request.num_active_params, num_channels);
        let g = problem.interpolate_to_nodes(&u_macro, nv);
        let previous = problem.previous_state(request, u_prev_macro.as_deref(), nv)?;

        // Local Newton iterations see no channels.
        let constant_params = request.parameters.to_constant();
        let constant_previous: Option<Vec<Dual<f64>>> = previous
            .as_ref()
            .map(|prev| prev.iter().map(|p| Dual::constant(p.value())).collect());
        let constant_fields: Vec<Dual<f64>> = fields.iter().map(|f| Dual::constant(f.value())).collect();
        let constant_inputs = FineInputs {
            context: EvaluationContext {
                params: &constant_params,
                field_names: request.field_names,
                time: request.time,
                dt: request.dt,
            },
            previous: constant_previous.as_deref(),
            fields: &constant_fields,
            num_fields,
        };

        let ndofs = nv * problem.num_nodes();
        let mut u = problem
            .current
            .clone()
            .filter(|u| u.len() == ndofs)
            .unwrap_or_else(|| DVector::from_iterator(ndofs, g.iter().map(Dual::value)));
        for gid in problem.boundary_dofs(nv) {
            u[gid] = g[gid].value();
        }

        let mut iterations = 0;
        let mut initial_norm = None;
        let jacobian = loop {
            let (residual, jacobian) = Self::assemble_fine_system(physics, problem, &constant_inputs, &u, &g, nv)?;
            let norm = residual.norm();
            let r0 = *initial_norm.get_or_insert(norm);
            if norm <= settings.nonlinear_tolerance * r0 || norm <= ABSOLUTE_TOLERANCE {
                break jacobian;
            }
            let failure = MultiscaleError::SubgridConvergenceFailure {
                handle: Some(handle),
                iterations,
                residual_norm: norm,
            };
            if iterations == settings.max_nonlinear_iterations {
                return Err(failure);
            }
            let minus_dx = jacobian.lu().solve(&residual).ok_or(failure)?;
            u -= minus_dx;
            iterations += 1;
        };
        trace!(
            "Fine-scale solve of macro element {} converged in {} iterations",
            problem.registration.element,
            iterations
        );

        let seeded_inputs = FineInputs {
            context: EvaluationContext {
                params: request.parameters,
                field_names: request.field_names,
                time: request.time,
                dt: request.dt,
            },
            previous: previous.as_deref(),
            fields: &fields,
            num_fields,
        };

        if mode != SeedMode::None {
            let b = Self::assemble_channel_derivatives(physics, problem, &seeded_inputs, &u, &g, mode, num_channels, nv)?;
            let solution = jacobian.lu().solve(&b).ok_or(MultiscaleError::SubgridConvergenceFailure {
                handle: Some(handle),
                iterations,
                residual_norm: f64::NAN,
            })?;
            problem.tangents.insert(mode, -solution);
        }

        problem.current = Some(u.clone());
        problem.history.insert(request.time_index, (request.time, u.clone()));
        let u_duals = problem.state_duals(&u, mode)?;

        let nm = problem.registration.nodes.len();
        let mut residual = vec![Dual::constant(0.0); nv * nm];
        for el in 0..problem.elements.len() {
            let r = Self::fine_element_residual(physics, problem, el, &seeded_inputs, &u_duals, true, nv)?;
            for (total, r) in residual.iter_mut().zip(&r) {
                *total += r;
            }
        }

        let sensitivity = match (request.adjoint, mode, request.macro_adjoint) {
            (true, SeedMode::Parameters, Some(phi)) => Some(adjoint_weighted_derivatives(&residual, phi, num_channels)),
            _ => None,
        };
        if let (true, true, Some(phi)) = (request.adjoint, request.store_adjoint_history, request.macro_adjoint) {
            let phi = DVector::from_column_slice(phi);
            let fine_adjoint: Vec<f64> = (0..nv)
                .flat_map(|v| {
                    let phi_v = phi.rows(v * nm, nm).into_owned();
                    (&problem.node_basis * phi_v).iter().copied().collect::<Vec<_>>()
                })
                .collect();
            problem
                .adjoint_fields
                .insert(request.time_index, DVector::from_vec(fine_adjoint));
        }

        Ok(SubgridSolveOutput {
            residual,
            sensitivity,
            iterations,
        })
    }

    fn compute_error(
        &self,
        time: f64,
        time_index: usize,
        handle: SubgridHandle,
        functions: &dyn FunctionManager,
    ) -> Result<DVector<f64>> {
        let problem = self.problem(handle);
        let u = problem.solution(Some(time_index)).ok_or_else(|| {
            MultiscaleError::configuration(format!(
                "no fine-scale solution of macro element {} at time index {}",
                problem.registration.element, time_index
            ))
        })?;
        let nv = self.variables.len();
        let mut total = DVector::zeros(2 * nv);
        for el in 0..problem.elements.len() {
            let u_local: Vec<f64> = problem
                .element_dofs(el, nv)
                .iter()
                .map(|&g| u[g])
                .collect();
            total += estimate_element_errors_squared(&problem.values[el], &u_local, &self.variables, functions, time)?;
        }
        Ok(total)
    }

    fn compute_objective(
        &self,
        response_type: ResponseType,
        mode: SeedMode,
        time: f64,
        time_index: usize,
        handle: SubgridHandle,
        reducer: &ResponseReducer,
    ) -> Result<Dual<f64>> {
        debug_assert_eq!(response_type, reducer.response_type());
        let problem = self.problem(handle);
        let u = problem
            .solution(Some(time_index))
            .or(problem.current.as_ref())
            .ok_or_else(|| MultiscaleError::configuration("subgrid objective requested before any solve"))?;
        let u_duals = problem.state_duals(u, mode)?;
        let nv = self.variables.len();
        let time_slot = time_index.saturating_sub(1);

        let mut objective = Dual::constant(0.0);
        for el in 0..problem.elements.len() {
            let local: Vec<Dual<f64>> = problem
                .element_dofs(el, nv)
                .iter()
                .map(|&g| u_duals[g].clone())
                .collect();
            let sensors = problem.element_sensors(el);
            objective += &reducer.element_objective(&problem.values[el], problem.shape(), &sensors, &local, time, time_slot);
        }
        Ok(objective)
    }

    fn propagate_history_adjoint(
        &mut self,
        handle: SubgridHandle,
        request: &SubgridSolveRequest,
        reducer: &ResponseReducer,
    ) -> Result<()> {
        let m = request.time_index;
        if request.dt.is_none() || m <= 1 {
            return Ok(());
        }
        let phi = request
            .macro_adjoint
            .ok_or_else(|| MultiscaleError::configuration("history adjoint requires the macro adjoint"))?;
        let physics: &dyn PhysicsEvaluator = &*self.physics;
        let nv = self.variables.len();
        let problem = self.problem(handle);
        let u = problem.solution(Some(m)).ok_or_else(|| {
            MultiscaleError::configuration(format!(
                "no fine-scale solution of macro element {} at time index {}",
                problem.registration.element, m
            ))
        })?;
        let Some(mut previous) = problem.previous_state(request, None, nv)? else {
            return Ok(());
        };

        let constant_params = request.parameters.to_constant();
        let fields: Vec<Dual<f64>> = request.fields.iter().map(|&f| Dual::constant(f)).collect();
        let macro_state: Vec<Dual<f64>> = request.macro_state.iter().map(|&v| Dual::constant(v)).collect();
        let g = problem.interpolate_to_nodes(&macro_state, nv);
        let context = EvaluationContext {
            params: &constant_params,
            field_names: request.field_names,
            time: request.time,
            dt: request.dt,
        };
        let (_, jacobian) = {
            let inputs = FineInputs {
                context,
                previous: Some(&previous),
                fields: &fields,
                num_fields: request.field_names.len(),
            };
            Self::assemble_fine_system(physics, problem, &inputs, u, &g, nv)?
        };

        // w = (dM/dx)^T phi + dj/dx + eta_m
        let ndofs = u.len();
        let mut w = problem
            .history_adjoint
            .get(&m)
            .cloned()
            .unwrap_or_else(|| DVector::zeros(ndofs));
        let mut u_duals: Vec<Dual<f64>> = u.iter().map(|&v| Dual::constant(v)).collect();
        for el in 0..problem.elements.len() {
            let dofs = problem.element_dofs(el, nv);
            for (j, &gj) in dofs.iter().enumerate() {
                u_duals[gj] = Dual::variable(u[gj], j, dofs.len());
            }
            let inputs = FineInputs {
                context,
                previous: Some(&previous),
                fields: &fields,
                num_fields: request.field_names.len(),
            };
            let r = Self::fine_element_residual(physics, problem, el, &inputs, &u_duals, true, nv)?;
            let local: Vec<Dual<f64>> = dofs.iter().map(|&g| u_duals[g].clone()).collect();
            let objective = reducer.element_objective(
                &problem.values[el],
                problem.shape(),
                &problem.element_sensors(el),
                &local,
                request.time,
                m - 1,
            );
            for &gj in &dofs {
                u_duals[gj] = Dual::constant(u[gj]);
            }
            for (b, &gb) in dofs.iter().enumerate() {
                w[gb] += objective.derivative(b) + r.iter().zip(phi).map(|(r, p)| p * r.derivative(b)).sum::<f64>();
            }
        }

        let failure = || MultiscaleError::SubgridConvergenceFailure {
            handle: Some(handle),
            iterations: 0,
            residual_norm: f64::NAN,
        };
        let mu = -jacobian.transpose().lu().solve(&w).ok_or_else(failure)?;

        // eta_{m-1} = (dM/dx_prev)^T phi + (dF/dx_prev)^T mu
        let mut boundary = vec![false; ndofs];
        for gid in problem.boundary_dofs(nv) {
            boundary[gid] = true;
        }
        let mut eta = DVector::zeros(ndofs);
        for el in 0..problem.elements.len() {
            let dofs = problem.element_dofs(el, nv);
            let values: Vec<f64> = dofs.iter().map(|&g| previous[g].value()).collect();
            for (j, &gj) in dofs.iter().enumerate() {
                previous[gj] = Dual::variable(values[j], j, dofs.len());
            }
            let inputs = FineInputs {
                context,
                previous: Some(&previous),
                fields: &fields,
                num_fields: request.field_names.len(),
            };
            let fine = Self::fine_element_residual(physics, problem, el, &inputs, &u_duals, false, nv)?;
            let coarse = Self::fine_element_residual(physics, problem, el, &inputs, &u_duals, true, nv)?;
            for (j, &gj) in dofs.iter().enumerate() {
                previous[gj] = Dual::constant(values[j]);
            }
            for (b, &gb) in dofs.iter().enumerate() {
                let fine_term: f64 = dofs
                    .iter()
                    .zip(&fine)
                    .filter(|(&ga, _)| !boundary[ga])
                    .map(|(&ga, r)| mu[ga] * r.derivative(b))
                    .sum();
                let coarse_term: f64 = coarse.iter().zip(phi).map(|(r, p)| p * r.derivative(b)).sum();
                eta[gb] += fine_term + coarse_term;
            }
        }

        let problem = self
            .problems
            .get_mut(handle.index())
            .unwrap_or_else(|| panic!("subgrid handle {:?} was not issued by this model", handle));
        problem.history_adjoint.insert(m - 1, eta);
        Ok(())
    }

    fn history_adjoint_derivatives(
        &self,
        handle: SubgridHandle,
        mode: SeedMode,
        time_index: usize,
    ) -> Result<Option<DVector<f64>>> {
        let problem = self.problem(handle);
        let Some(eta) = problem.history_adjoint.get(&time_index) else {
            return Ok(None);
        };
        let tangent = problem.tangents.get(&mode).ok_or_else(|| {
            MultiscaleError::configuration(format!(
                "no {:?} tangent available for macro element {}",
                mode, problem.registration.element
            ))
        })?;
        Ok(Some(tangent.tr_mul(eta)))
    }

    fn accumulate_responses(
        &self,
        handle: SubgridHandle,
        time: f64,
        time_index: usize,
        reducer: &ResponseReducer,
        array: &mut ResponseArray,
    ) {
        let problem = self.problem(handle);
        let Some(u) = problem.solution(Some(time_index)).or(problem.current.as_ref()) else {
            return;
        };
        let nv = self.variables.len();
        for el in 0..problem.elements.len() {
            let local: Vec<f64> = problem
                .element_dofs(el, nv)
                .iter()
                .map(|&g| u[g])
                .collect();
            let sensors = problem.element_sensors(el);
            reducer.accumulate_responses(
                &problem.values[el],
                problem.shape(),
                &sensors,
                &local,
                time,
                time_index.saturating_sub(1),
                array,
            );
        }
    }

    fn add_sensors(&mut self, sensors: &[(usize, Point3<f64>)], tolerance: f64, handle: SubgridHandle) -> usize {
        let index = handle.index();
        let problem = self
            .problems
            .get_mut(index)
            .unwrap_or_else(|| panic!("subgrid handle {:?} was not issued by this model", handle));
        let reference = problem.shape().reference();
        let mut found = 0;
        for &(slot, point) in sensors {
            for el in 0..problem.elements.len() {
                let coords = problem.element_coords(el);
                if let Some(xi) = map_physical_coordinates(reference, &coords, &point, tolerance) {
                    problem.sensors.push((el, LocatedSensor { slot, point, xi }));
                    found += 1;
                    break;
                }
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
        let problem = self.problem(handle);
        let Some((time, u)) = problem.history.get(&time_index) else {
            return Ok(());
        };
        let n = problem.num_nodes();
        let mut results = ResultSet::default();
        for (v, name) in self.variables.iter().enumerate() {
            results = results.with_node_field(name.clone(), u.rows(v * n, n).iter().copied().collect());
            if let Some(adjoint) = problem.adjoint_fields.get(&time_index) {
                results = results.with_node_field(
                    format!("{}_adjoint", name),
                    adjoint.rows(v * n, n).iter().copied().collect(),
                );
            }
        }
        let mesh = OutputMesh {
            shape: problem.shape(),
            vertices: problem.vertices.clone(),
            connectivity: problem.elements.clone(),
        };
        sink.write(
            &format!("{}_subgrid_{}", label, problem.registration.element),
            time_index,
            *time,
            &mesh,
            &results,
        )?;
        Ok(())
    }

    fn update_parameters(&mut self, _values: &ParameterValues) {
        for problem in &mut self.problems {
            problem.tangents.clear();
        }
    }

    fn clear(&mut self) {
        self.problems.clear();
    }

    fn update_mesh_data(&mut self, seeds: &SeedSet) -> Result<()> {
        self.seeds = Some(seeds.clone());
        for problem in &mut self.problems {
            problem.update_materials(Some(seeds))?;
            problem.tangents.clear();
        }
        Ok(())
    }

    fn mean_fields(&self, handle: SubgridHandle, time_index: Option<usize>) -> Option<Vec<f64>> {
        let problem = self.problem(handle);
        let u = problem.solution(time_index)?;
        let nv = self.variables.len();
        let mut integrals = vec![0.0; nv];
        let mut volume = 0.0;
        for (el, values) in problem.values.iter().enumerate() {
            let local: Vec<Dual<f64>> = problem
                .element_dofs(el, nv)
                .iter()
                .map(|&g| Dual::constant(u[g]))
                .collect();
            for q in 0..values.num_points() {
                let u_q = interpolate(&values.basis, q, &local, nv);
                for (integral, u) in integrals.iter_mut().zip(&u_q) {
                    *integral += values.weights[q] * u.value();
                }
                volume += values.weights[q];
            }
        }
        Some(integrals.into_iter().map(|i| i / volume).collect())
    }
}
