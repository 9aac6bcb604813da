//! Forward, adjoint and sensitivity solves.
//!
//! The [`SolveEngine`] owns the distributed discretization of one problem: the cells of this
//! process, the partition maps of the state and parameter vectors, the subgrid models and the
//! response reducer. Every public operation is collective: all processes of the communicator
//! must call it in the same order.
//!
//! Time levels are numbered by a time index. Index 0 holds the initial state, index `n >= 1`
//! the solution of step `n`. Steady problems have a single step with index 1 at time 0.
use crate::assembly::{
    apply_dirichlet, assemble_jacobian, assemble_parameter_derivatives, assemble_previous_coupling,
    assemble_residual, history_adjoint_state_gradient, objective_parameter_derivatives, objective_state_gradient,
    objective_value, propagate_history_adjoints, AssemblyInput,
};
use crate::cell::{CellPartition, LocatedSensor};
use crate::config::{DirichletValue, LinearSolverKind, MeshDataSource, ResponseType, Settings};
use crate::distributed::{solve_on_root, Communicator, PartitionMap, Payload};
use crate::dof::DofManager;
use crate::element::map_physical_coordinates;
use crate::error::{MultiscaleError, Result};
use crate::estimate::estimate_element_errors_squared;
use crate::functions::FunctionManager;
use crate::io::{OutputMesh, ResultSet, ResultSink};
use crate::mesh::BlockMesh;
use crate::microstructure::{generate, import_from_files, SeedSet};
use crate::parameters::{ParameterSet, ParameterUsage};
use crate::physics::{PhysicsEvaluator, SeedMode};
use crate::response::{ResponseArray, ResponseReducer, SensorData};
use crate::subgrid::{MacroElementRegistration, MultiscaleManager, SubgridModel};
use log::{debug, info, warn};
use mscale_optimize::calculus::{DifferentiableVectorFunction, FunctionError, VectorFunction};
use mscale_optimize::newton::{
    newton_line_search, BacktrackingLineSearch, NewtonError, NewtonSettings, NoLineSearch, Tolerance,
};
use mscale_sparse::{DirectSolver, IterativeSolver, LinearSolver};
use nalgebra::{DVector, DVectorView, DVectorViewMut, Point3, Vector3};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// States of the nonlinear solver, recorded in the order they are entered.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NewtonState {
    Assembling,
    JacobianReady,
    ResidualOnly,
    LinearSolve,
    Updated,
    Converged,
    IterateAgain,
    Diverged,
}

/// One time level of a solve.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Step {
    pub time: f64,
    pub time_index: usize,
    /// `None` for steady solves.
    pub dt: Option<f64>,
    pub is_final_time: bool,
}

/// Seeds the cells were assigned from.
#[derive(Debug, Clone)]
enum MeshData {
    Synthesized(SeedSet),
    Imported(Vec<SeedSet>),
}

impl MeshData {
    fn seeds(&self) -> Option<&SeedSet> {
        match self {
            MeshData::Synthesized(seeds) => Some(seeds),
            MeshData::Imported(passes) => passes.first(),
        }
    }
}

/// Immutable description of the unknowns and the physics.
struct Discretization {
    physics: Arc<dyn PhysicsEvaluator>,
    dofs: DofManager,
    parameter_dofs: DofManager,
    parameters: ParameterSet,
    field_names: Vec<String>,
    store_adjoint_history: bool,
}

impl Discretization {
    fn input(&self, step: Step) -> AssemblyInput<'_> {
        AssemblyInput {
            physics: self.physics.as_ref(),
            num_variables: self.dofs.num_variables(),
            parameters: &self.parameters,
            field_names: &self.field_names,
            time: step.time,
            time_index: step.time_index,
            dt: step.dt,
            store_adjoint_history: self.store_adjoint_history,
        }
    }

    /// Values of the discretized parameters at a parameter dof.
    fn field_value(&self, gid: usize) -> f64 {
        let (node, k) = self.parameter_dofs.node_and_variable(gid);
        self.parameters
            .get(&self.field_names[k])
            .map(|p| p.values[node])
            .unwrap_or(0.0)
    }
}

/// Turns a local failure into a failure on every process.
///
/// Processes without a local error report the failure of a remote process as a subgrid
/// convergence failure without handle.
fn agree<T>(comm: &dyn Communicator, local: Result<T>) -> Result<T> {
    let failed = comm.any(local.is_err());
    match local {
        Ok(_) if failed => Err(MultiscaleError::SubgridConvergenceFailure {
            handle: None,
            iterations: 0,
            residual_norm: f64::NAN,
        }),
        result => result,
    }
}

fn global_norm(comm: &dyn Communicator, local_norm_squared: f64) -> f64 {
    let mut sum = [local_norm_squared];
    comm.sum_all(&mut sum);
    sum[0].sqrt()
}

pub struct SolveEngine {
    comm: Box<dyn Communicator>,
    mesh: BlockMesh,
    settings: Settings,
    functions: Arc<dyn FunctionManager>,
    discretization: Discretization,
    cells: CellPartition,
    map: PartitionMap,
    parameter_map: PartitionMap,
    multiscale: MultiscaleManager,
    reducer: ResponseReducer,
    mesh_data: Option<MeshData>,
    /// Constrained gid to `(node, value)`.
    dirichlet: BTreeMap<usize, (usize, DirichletValue)>,
    constrained: BTreeSet<usize>,
    linear_solver: Box<dyn LinearSolver<f64>>,
    /// `(time, owned state)` per time index.
    history: Vec<(f64, DVector<f64>)>,
    /// Owned adjoint per time index. Index 0 is unused.
    adjoints: Vec<DVector<f64>>,
    gradient: Option<DVector<f64>>,
    /// Owned `lambda^T dR/dq` per discretized parameter dof.
    sensitivity_field: Option<DVector<f64>>,
    trace: Vec<NewtonState>,
}

impl std::fmt::Debug for SolveEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SolveEngine")
            .field("rank", &self.comm.rank())
            .field("cells", &self.cells)
            .field("multiscale", &self.multiscale)
            .field("num_time_levels", &self.history.len())
            .finish()
    }
}

impl SolveEngine {
    /// Sets up cells, mesh data, subgrid registrations, sensors and boundary conditions.
    pub fn new(
        comm: Box<dyn Communicator>,
        mesh: BlockMesh,
        settings: Settings,
        physics: Arc<dyn PhysicsEvaluator>,
        functions: Arc<dyn FunctionManager>,
        mut parameters: ParameterSet,
        models: Vec<Box<dyn SubgridModel>>,
    ) -> Result<Self> {
        let variables = physics.variables();
        if variables.is_empty() {
            return Err(MultiscaleError::configuration("physics defines no variables"));
        }
        let num_vertices = mesh.num_vertices();
        parameters.expand_discretized(num_vertices)?;
        let field_names = parameters.discretized_names();

        let dofs = DofManager::new(variables.clone(), num_vertices);
        let parameter_dofs = DofManager::new(field_names.clone(), num_vertices);
        let owned = mesh.owned_elements(comm.rank(), comm.size());
        let cells = CellPartition::build(&mesh, &owned, &dofs, &parameter_dofs, &settings, comm.as_ref())?;

        let touched = |dofs: &DofManager| -> Vec<usize> {
            cells
                .cells()
                .iter()
                .flat_map(|cell| (0..cell.len()).flat_map(move |e| dofs.element_dofs(cell.element_nodes(e))))
                .collect()
        };
        let map = PartitionMap::new(comm.as_ref(), touched(&dofs), dofs.num_dofs());
        let parameter_map = PartitionMap::new(comm.as_ref(), touched(&parameter_dofs), parameter_dofs.num_dofs());

        let dirichlet = Self::dirichlet_conditions(&mesh, &settings, &dofs, functions.as_ref())?;
        let constrained = dirichlet.keys().copied().collect();

        let linear_solver: Box<dyn LinearSolver<f64>> = match settings.solver.linear_solver {
            LinearSolverKind::Direct => Box::new(DirectSolver),
            LinearSolverKind::ConjugateGradient {
                tolerance,
                max_iterations,
            } => Box::new(IterativeSolver::new(tolerance, max_iterations)),
        };

        let multiscale = MultiscaleManager::new(models, settings.multiscale.rules.clone())?;
        let reducer = ResponseReducer::new(settings.postprocess.clone(), functions.clone(), variables);

        let mut engine = Self {
            comm,
            mesh,
            functions,
            discretization: Discretization {
                physics,
                dofs,
                parameter_dofs,
                parameters,
                field_names,
                store_adjoint_history: settings.solver.store_adjoint_history,
            },
            settings,
            cells,
            map,
            parameter_map,
            multiscale,
            reducer,
            mesh_data: None,
            dirichlet,
            constrained,
            linear_solver,
            history: Vec::new(),
            adjoints: Vec::new(),
            gradient: None,
            sensitivity_field: None,
            trace: Vec::new(),
        };
        engine.assign_mesh_data()?;
        engine.register_subgrid_elements()?;
        engine.locate_sensors();
        engine.load_parameters();
        engine.reset_history()?;

        if engine.settings.verbosity > 0 && engine.comm.is_root() {
            info!(
                "Set up {} dofs, {} constrained, {} discretized parameter dofs on {} processes",
                engine.map.global_len(),
                engine.constrained.len(),
                engine.parameter_map.global_len(),
                engine.comm.size()
            );
        }
        Ok(engine)
    }

    fn dirichlet_conditions(
        mesh: &BlockMesh,
        settings: &Settings,
        dofs: &DofManager,
        functions: &dyn FunctionManager,
    ) -> Result<BTreeMap<usize, (usize, DirichletValue)>> {
        let mut conditions = BTreeMap::new();
        for condition in &settings.dirichlet {
            let nodes = mesh.side_set_nodes(&condition.side).ok_or_else(|| {
                MultiscaleError::configuration(format!("unknown side set {}", condition.side))
            })?;
            let variable = dofs.variable_index(&condition.variable).ok_or_else(|| {
                MultiscaleError::configuration(format!("unknown variable {}", condition.variable))
            })?;
            if let DirichletValue::Function(name) = &condition.value {
                if functions.evaluate(name, &Point3::origin(), 0.0).is_none() {
                    return Err(MultiscaleError::configuration(format!("unknown function {}", name)));
                }
            }
            for node in nodes {
                conditions.insert(dofs.gid(node, variable), (node, condition.value.clone()));
            }
        }
        Ok(conditions)
    }

    fn assign_mesh_data(&mut self) -> Result<()> {
        let mesh_data = match &self.settings.mesh_data {
            MeshDataSource::None => None,
            MeshDataSource::Compute(seeding) => {
                let seeds = generate(seeding)?;
                self.cells.assign_synthesized(&seeds)?;
                Some(MeshData::Synthesized(seeds))
            }
            MeshDataSource::Import(import) => {
                let passes = import_from_files(import)?;
                self.cells.assign_imported(&passes)?;
                Some(MeshData::Imported(passes))
            }
        };
        if let Some(seeds) = mesh_data.as_ref().and_then(MeshData::seeds) {
            if self.settings.verbosity > 0 {
                info!("Assigned mesh data from {} seeds", seeds.len());
            }
            for model in self.multiscale.models_mut() {
                model.update_mesh_data(seeds)?;
            }
        }
        self.mesh_data = mesh_data;
        Ok(())
    }

    fn register_subgrid_elements(&mut self) -> Result<()> {
        if self.multiscale.is_empty() {
            return Ok(());
        }
        let side_names = self.mesh.side_set_names();
        let dofs = &self.discretization.dofs;
        let mut count = 0;
        for cell in self.cells.cells_mut() {
            for e in 0..cell.len() {
                let class = cell.seed_assignment(e).map(|a| a.class);
                let Some(model) = self.multiscale.select(cell.block_name(), class) else {
                    continue;
                };
                let element = cell.elements()[e];
                let registration = MacroElementRegistration {
                    element,
                    block: cell.block_name().to_string(),
                    shape: cell.shape(),
                    node_ids: cell.element_nodes(e).to_vec(),
                    nodes: cell.element_coords(e).to_vec(),
                    boundary_flags: self.mesh.element_boundary_flags(element),
                    side_names: side_names.clone(),
                    dofs: cell.element_dofs(e).to_vec(),
                    dof_offsets: dofs.offsets(cell.element_nodes(e).len()),
                    material: cell.material(e).copied(),
                };
                let handle = self
                    .multiscale
                    .model_mut(model)
                    .register_macro_element(registration)?;
                cell.set_subgrid(e, model, handle);
                count += 1;
            }
        }
        debug!("Rank {}: registered {} subgrid elements", self.comm.rank(), count);
        Ok(())
    }

    /// Places every sensor in the element with the lowest global id that contains it.
    fn locate_sensors(&mut self) {
        if self.reducer.response_type() != ResponseType::Pointwise {
            return;
        }
        let points: Vec<Point3<f64>> = self
            .settings
            .postprocess
            .sensor_locations
            .iter()
            .map(|&[x, y, z]| Point3::new(x, y, z))
            .collect();
        let tolerance = self.settings.postprocess.sensor_tolerance;

        let mut claims = vec![usize::MAX; points.len()];
        let mut hits = vec![None; points.len()];
        for (s, point) in points.iter().enumerate() {
            for (c, cell) in self.cells.cells().iter().enumerate() {
                let reference = cell.shape().reference();
                for e in 0..cell.len() {
                    let element = cell.elements()[e];
                    if element >= claims[s] {
                        continue;
                    }
                    if let Some(xi) = map_physical_coordinates(reference, cell.element_coords(e), point, tolerance) {
                        claims[s] = element;
                        hits[s] = Some((c, e, xi));
                    }
                }
            }
        }

        let local = claims.clone();
        self.comm.min_all_indices(&mut claims);
        for (s, hit) in hits.into_iter().enumerate() {
            if claims[s] == usize::MAX {
                if self.comm.is_root() {
                    warn!("Sensor {} at {:?} is outside the mesh", s, points[s]);
                }
                continue;
            }
            let (Some((c, e, xi)), true) = (hit, local[s] == claims[s]) else {
                continue;
            };
            let cell = &mut self.cells.cells_mut()[c];
            match cell.subgrid(e) {
                Some((model, handle)) => {
                    let found = self
                        .multiscale
                        .model_mut(model)
                        .add_sensors(&[(s, points[s])], tolerance, handle);
                    if found == 0 {
                        warn!("Subgrid model could not place sensor {}", s);
                    }
                }
                None => cell.add_sensor(
                    e,
                    LocatedSensor {
                        slot: s,
                        point: points[s],
                        xi,
                    },
                ),
            }
        }
    }

    fn load_parameters(&mut self) {
        let discretization = &self.discretization;
        for cell in self.cells.cells_mut() {
            cell.gather_parameters(|gid| discretization.field_value(gid));
        }
        let values = discretization.parameters.values(false, 0);
        for model in self.multiscale.models_mut() {
            model.update_parameters(&values);
        }
    }

    /// Gathers owned vectors into the cells. `previous` and `adjoint` are only gathered when
    /// given.
    fn load_cells(&mut self, state: &DVector<f64>, previous: Option<&DVector<f64>>, adjoint: Option<&DVector<f64>>) {
        let comm = self.comm.as_ref();
        let map = &self.map;
        let lookup = |overlapped: &DVector<f64>, gid: usize| {
            overlapped[map
                .overlapped_lid(gid)
                .unwrap_or_else(|| panic!("dof {} is not part of the overlapped map", gid))]
        };

        let u = map.gather(comm, state);
        let u_prev = previous.map(|p| map.gather(comm, p));
        let lambda = adjoint.map(|a| map.gather(comm, a));
        for cell in self.cells.cells_mut() {
            cell.gather_state(|gid| lookup(&u, gid));
            if let Some(u_prev) = &u_prev {
                cell.gather_previous_state(|gid| lookup(u_prev, gid));
            }
            if let Some(lambda) = &lambda {
                cell.gather_adjoint(|gid| lookup(lambda, gid));
            }
        }
    }

    fn load_step(&mut self, step: Step, adjoint: Option<&DVector<f64>>) {
        let state = self.history[step.time_index].1.clone();
        let previous = step
            .dt
            .map(|_| self.history[step.time_index - 1].1.clone());
        self.load_cells(&state, previous.as_ref(), adjoint);
    }

    fn dirichlet_value(&self, node: usize, value: &DirichletValue, time: f64) -> Result<f64> {
        match value {
            DirichletValue::Constant(value) => Ok(*value),
            DirichletValue::Function(name) => self
                .functions
                .evaluate(name, &self.mesh.vertices()[node], time)
                .ok_or_else(|| MultiscaleError::configuration(format!("unknown function {}", name))),
        }
    }

    fn reset_history(&mut self) -> Result<()> {
        let mut u0 = DVector::from_element(self.map.owned().len(), self.settings.solver.initial_value);
        for (gid, (node, value)) in &self.dirichlet {
            if let Some(lid) = self.map.owned_lid(*gid) {
                u0[lid] = self.dirichlet_value(*node, value, 0.0)?;
            }
        }
        self.history = vec![(0.0, u0)];
        self.adjoints.clear();
        self.gradient = None;
        self.sensitivity_field = None;
        Ok(())
    }

    /// The time levels of a solve, excluding the initial state.
    pub fn steps(&self) -> Vec<Step> {
        match &self.settings.solver.transient {
            None => vec![Step {
                time: 0.0,
                time_index: 1,
                dt: None,
                is_final_time: true,
            }],
            Some(transient) => {
                let dt = transient.final_time / transient.num_steps as f64;
                (1..=transient.num_steps)
                    .map(|n| Step {
                        time: n as f64 * dt,
                        time_index: n,
                        dt: Some(dt),
                        is_final_time: n == transient.num_steps,
                    })
                    .collect()
            }
        }
    }

    /// Residual with constrained rows `u_c - g_c`, in the owned layout.
    fn constrained_residual(&mut self, u: &DVector<f64>, previous: Option<&DVector<f64>>, step: Step) -> Result<DVector<f64>> {
        self.load_cells(u, previous, None);
        let input = self.discretization.input(step);
        let local = assemble_residual(&input, &self.cells, &mut self.multiscale, &self.map);
        let residual = agree(self.comm.as_ref(), local)?;
        let mut residual = self.map.scatter_add(self.comm.as_ref(), &residual);
        for (gid, (node, value)) in &self.dirichlet {
            if let Some(lid) = self.map.owned_lid(*gid) {
                residual[lid] = u[lid] - self.dirichlet_value(*node, value, step.time)?;
            }
        }
        Ok(residual)
    }

    fn jacobian_triplets(
        &mut self,
        u: &DVector<f64>,
        previous: Option<&DVector<f64>>,
        step: Step,
    ) -> Result<Vec<(usize, usize, f64)>> {
        self.load_cells(u, previous, None);
        let input = self.discretization.input(step);
        let local = assemble_jacobian(&input, &self.cells, &mut self.multiscale, &self.map);
        let (_, triplets) = agree(self.comm.as_ref(), local)?;
        Ok(triplets)
    }

    /// Solves `J x = rhs`, or `J^T x = rhs`, with the Dirichlet conditions applied.
    ///
    /// Constrained entries of the right-hand side are kept for the forward system and zeroed
    /// for the transposed one.
    fn solve_linear(&mut self, triplets: Vec<(usize, usize, f64)>, rhs: &DVector<f64>, transpose: bool) -> Result<DVector<f64>> {
        let constrained = &self.constrained;
        let solution = solve_on_root(
            self.comm.as_ref(),
            &self.map,
            triplets,
            rhs,
            self.linear_solver.as_mut(),
            transpose,
            |triplets, b| {
                if transpose {
                    for &c in constrained {
                        b[c] = 0.0;
                    }
                }
                apply_dirichlet(triplets, b, constrained);
            },
        )?;
        Ok(solution)
    }

    fn newton(&mut self, step: Step, previous: Option<DVector<f64>>, u: &mut DVector<f64>) -> Result<()> {
        let n = u.len();
        let mut f = DVector::zeros(n);
        let mut dx = DVector::zeros(n);
        let solver = &self.settings.solver;
        let settings = NewtonSettings {
            max_iterations: Some(solver.max_nonlinear_iterations),
            tolerance: Tolerance::RelativeToInitial(solver.nonlinear_tolerance),
        };
        let line_search = solver.line_search;
        let reuse_jacobian = solver.reuse_jacobian;

        let mut system = NewtonSystem {
            engine: self,
            step,
            previous,
            jacobian: None,
            reuse_jacobian,
            iterations: 0,
            residual_norm: f64::NAN,
        };
        let result = if line_search {
            newton_line_search(&mut system, &mut *u, &mut f, &mut dx, settings, &mut BacktrackingLineSearch::default())
        } else {
            newton_line_search(&mut system, &mut *u, &mut f, &mut dx, settings, &mut NoLineSearch)
        };
        let iterations = system.iterations;
        let residual_norm = system.residual_norm;

        match result {
            Ok(output) => {
                self.trace.push(NewtonState::Converged);
                if self.settings.verbosity > 0 && self.comm.is_root() {
                    info!(
                        "Step {} (t = {}) converged in {} iterations, residual norm {:e}",
                        step.time_index, step.time, output.iterations, output.residual_norm
                    );
                }
                Ok(())
            }
            Err(err) => {
                self.trace.push(NewtonState::Diverged);
                Err(match err {
                    NewtonError::MaximumIterationsReached(iterations) => MultiscaleError::SolverDivergence {
                        iterations,
                        residual_norm,
                    },
                    other => match other.into_source().map(|source| source.downcast::<MultiscaleError>()) {
                        Some(Ok(err)) => *err,
                        _ => MultiscaleError::SolverDivergence {
                            iterations,
                            residual_norm,
                        },
                    },
                })
            }
        }
    }

    /// Solves all time levels, starting from the initial value.
    ///
    /// A step that fails stops the solve. The history then holds the converged steps only.
    pub fn forward_solve(&mut self) -> Result<()> {
        self.trace.clear();
        self.reset_history()?;
        for step in self.steps() {
            let previous = step.dt.map(|_| self.final_state().clone());
            let mut u = self.final_state().clone();
            self.newton(step, previous, &mut u)?;
            self.history.push((step.time, u));
            if step.is_final_time {
                debug!("Reached final time {}", step.time);
            }
        }
        Ok(())
    }

    fn require_forward_solve(&self) -> Result<()> {
        if self.history.len() != self.steps().len() + 1 {
            return Err(MultiscaleError::configuration("a forward solve must complete first"));
        }
        Ok(())
    }

    /// Objective summed over all time levels, including the regularization.
    pub fn compute_objective(&mut self) -> Result<f64> {
        self.require_forward_solve()?;
        let mut total = [0.0];
        for step in self.steps() {
            self.load_step(step, None);
            let input = self.discretization.input(step);
            let local = objective_value(&input, &self.cells, &self.multiscale, &self.reducer, step.time_index == 1);
            total[0] += agree(self.comm.as_ref(), local)?;
        }
        self.comm.sum_all(&mut total);
        Ok(total[0])
    }

    /// Solves the adjoint equations backward in time.
    pub fn adjoint_solve(&mut self) -> Result<()> {
        self.require_forward_solve()?;
        let steps = self.steps();
        let mut adjoints = vec![DVector::zeros(self.map.owned().len()); steps.len() + 1];
        // (dR_{n+1}/du_n)^T lambda_{n+1} + dj_{n+1}/du_n
        let mut coupling: Option<DVector<f64>> = None;

        for step in steps.iter().rev().copied() {
            let n = step.time_index;
            let state = self.history[n].1.clone();
            let previous = step.dt.map(|_| self.history[n - 1].1.clone());
            let triplets = self.jacobian_triplets(&state, previous.as_ref(), step)?;

            let input = self.discretization.input(step);
            let local = objective_state_gradient(
                &input,
                &self.cells,
                &self.multiscale,
                &self.reducer,
                &self.map,
                SeedMode::State,
            );
            let mut gradient = agree(self.comm.as_ref(), local)?;
            if step.dt.is_some() {
                let local = history_adjoint_state_gradient(&input, &self.cells, &self.multiscale, &self.map);
                gradient += agree(self.comm.as_ref(), local)?;
            }
            let mut rhs = -self.map.scatter_add(self.comm.as_ref(), &gradient);
            if let Some(coupling) = coupling.take() {
                rhs -= coupling;
            }
            let lambda = self.solve_linear(triplets, &rhs, true)?;

            if step.dt.is_some() && n > 1 {
                self.load_cells(&state, previous.as_ref(), Some(&lambda));
                let input = self.discretization.input(step);
                let local = assemble_previous_coupling(&input, &self.cells, &mut self.multiscale, &self.map);
                let mut term = agree(self.comm.as_ref(), local)?;
                let local = objective_state_gradient(
                    &input,
                    &self.cells,
                    &self.multiscale,
                    &self.reducer,
                    &self.map,
                    SeedMode::PreviousState,
                );
                term += agree(self.comm.as_ref(), local)?;
                coupling = Some(self.map.scatter_add(self.comm.as_ref(), &term));
                let local = propagate_history_adjoints(&input, &self.cells, &mut self.multiscale, &self.reducer);
                agree(self.comm.as_ref(), local)?;
            }
            adjoints[n] = lambda;
        }
        self.adjoints = adjoints;
        Ok(())
    }

    /// Gradient of the objective: active parameter components first, then all discretized
    /// parameter dofs.
    pub fn compute_sensitivities(&mut self) -> Result<DVector<f64>> {
        if self.adjoints.is_empty() {
            self.adjoint_solve()?;
        }
        let num_active = self.discretization.parameters.num_active_components();
        let num_fields = self.parameter_map.overlapped().len();
        let mut classic = DVector::zeros(num_active);
        let mut residual_fields = DVector::zeros(num_fields);
        let mut total_fields = DVector::zeros(num_fields);

        for step in self.steps() {
            let lambda = self.adjoints[step.time_index].clone();
            self.load_step(step, Some(&lambda));
            let input = self.discretization.input(step);
            let local = assemble_parameter_derivatives(&input, &self.cells, &mut self.multiscale, &self.parameter_map);
            let residual = agree(self.comm.as_ref(), local)?;
            let local = objective_parameter_derivatives(
                &input,
                &self.cells,
                &self.multiscale,
                &self.reducer,
                &self.parameter_map,
                step.time_index == 1,
            );
            let objective = agree(self.comm.as_ref(), local)?;

            classic += &residual.classic + &objective.classic;
            residual_fields += &residual.fields;
            total_fields += &residual.fields + &objective.fields;
        }

        self.comm.sum_all(classic.as_mut_slice());
        let comm = self.comm.as_ref();
        let sensitivity_field = self.parameter_map.scatter_add(comm, &residual_fields);
        let total_fields = self.parameter_map.scatter_add(comm, &total_fields);
        let total_fields = self.parameter_map.all_gather(comm, &total_fields);

        let gradient = DVector::from_iterator(
            num_active + total_fields.len(),
            classic.iter().chain(total_fields.iter()).copied(),
        );
        self.sensitivity_field = Some(sensitivity_field);
        self.gradient = Some(gradient.clone());
        Ok(gradient)
    }

    /// Dual-weighted residual `sum_n lambda_n^T R_n(u_n)` with the unconstrained residual.
    pub fn compute_error_estimate(&mut self) -> Result<f64> {
        if self.adjoints.is_empty() {
            self.adjoint_solve()?;
        }
        let mut estimate = [0.0];
        for step in self.steps() {
            self.load_step(step, None);
            let input = self.discretization.input(step);
            let local = assemble_residual(&input, &self.cells, &mut self.multiscale, &self.map);
            let residual = agree(self.comm.as_ref(), local)?;
            let residual = self.map.scatter_add(self.comm.as_ref(), &residual);
            estimate[0] += self.adjoints[step.time_index].dot(&residual);
        }
        self.comm.sum_all(&mut estimate);
        Ok(estimate[0])
    }

    /// L2 norm and H1 seminorm of the error against the exact solution at a time index,
    /// laid out as `[L2_0, H1_0, L2_1, ...]`.
    ///
    /// Subgrid elements report the error of their solution stored for the same time index.
    pub fn compute_verification_error(&mut self, time_index: usize) -> Result<DVector<f64>> {
        let Some((time, state)) = self.history.get(time_index).cloned() else {
            return Err(MultiscaleError::configuration(format!("no solution at time index {}", time_index)));
        };
        self.load_cells(&state, None, None);
        let variables = self.discretization.dofs.variables();
        let local = (|| -> Result<DVector<f64>> {
            let mut errors = DVector::zeros(2 * variables.len());
            for cell in self.cells.cells() {
                for e in 0..cell.len() {
                    errors += match cell.subgrid(e) {
                        Some((model, handle)) => {
                            self.multiscale
                                .model(model)
                                .compute_error(time, time_index, handle, self.functions.as_ref())?
                        }
                        None => estimate_element_errors_squared(
                            cell.element_values(e),
                            cell.state(e).as_slice(),
                            variables,
                            self.functions.as_ref(),
                            time,
                        )?,
                    };
                }
            }
            Ok(errors)
        })();
        let mut errors = agree(self.comm.as_ref(), local)?;
        self.comm.sum_all(errors.as_mut_slice());
        Ok(errors.map(f64::sqrt))
    }

    /// Moves the mesh nodes by the final values of the variables named in the solver's
    /// remesh variables, one variable per spatial axis, and rebuilds the cells.
    pub fn remesh(&mut self) -> Result<()> {
        let names = self.settings.solver.remesh_variables.clone();
        if names.is_empty() {
            return Ok(());
        }
        let dim = self.mesh.dim();
        if names.len() > dim {
            return Err(MultiscaleError::configuration(format!(
                "{} remesh variables given for a {}-dimensional mesh",
                names.len(),
                dim
            )));
        }
        let dofs = &self.discretization.dofs;
        let variables = names
            .iter()
            .map(|name| {
                dofs.variable_index(name)
                    .ok_or_else(|| MultiscaleError::configuration(format!("unknown remesh variable {}", name)))
            })
            .collect::<Result<Vec<_>>>()?;

        let u = self.global_state(self.history.len() - 1);
        let displacement: Vec<Vector3<f64>> = (0..self.mesh.num_vertices())
            .map(|node| {
                let mut d = Vector3::zeros();
                for (axis, &var) in variables.iter().enumerate() {
                    d[axis] = u[dofs.gid(node, var)];
                }
                d
            })
            .collect();
        self.mesh.displace_vertices(&displacement);

        let owned = self.mesh.owned_elements(self.comm.rank(), self.comm.size());
        self.cells = CellPartition::build(
            &self.mesh,
            &owned,
            &self.discretization.dofs,
            &self.discretization.parameter_dofs,
            &self.settings,
            self.comm.as_ref(),
        )?;
        self.assign_mesh_data()?;
        self.reselect_subgrid_elements()?;
        self.load_parameters();
        info!("Rank {}: remeshed {} nodes", self.comm.rank(), displacement.len());
        Ok(())
    }

    /// Regenerates the synthesized seeds with a new random seed, reassigns them and redoes the
    /// subgrid selection. A forward solve must follow before any derived quantity.
    pub fn update_mesh_data(&mut self, random_seed: u64) -> Result<()> {
        let Some(MeshData::Synthesized(seeds)) = &self.mesh_data else {
            return Err(MultiscaleError::configuration(
                "mesh data can only be regenerated for synthesized seeds",
            ));
        };
        let seeds = seeds.with_random_seed(random_seed)?;
        self.cells.assign_synthesized(&seeds)?;
        for model in self.multiscale.models_mut() {
            model.update_mesh_data(&seeds)?;
        }
        self.mesh_data = Some(MeshData::Synthesized(seeds));
        self.reselect_subgrid_elements()
    }

    /// Redoes the subgrid selection after the mesh data or the cells changed.
    fn reselect_subgrid_elements(&mut self) -> Result<()> {
        for cell in self.cells.cells_mut() {
            cell.clear_delegation();
        }
        self.multiscale.clear();
        self.register_subgrid_elements()?;
        self.locate_sensors();
        self.invalidate_derivatives();
        Ok(())
    }

    fn invalidate_derivatives(&mut self) {
        self.adjoints.clear();
        self.gradient = None;
        self.sensitivity_field = None;
    }

    pub fn parameters(&self) -> &ParameterSet {
        &self.discretization.parameters
    }

    /// Sets the values of a parameter. Discretized parameters take one value per mesh node.
    pub fn set_parameter(&mut self, name: &str, values: Vec<f64>) -> Result<()> {
        let parameters = &mut self.discretization.parameters;
        let discretized = parameters
            .get(name)
            .map(|p| p.usage == ParameterUsage::Discretized)
            .unwrap_or(false);
        if discretized && values.len() != self.mesh.num_vertices() {
            return Err(MultiscaleError::configuration(format!(
                "discretized parameter {} needs {} values, got {}",
                name,
                self.mesh.num_vertices(),
                values.len()
            )));
        }
        parameters.set_values(name, values)?;
        self.load_parameters();
        self.invalidate_derivatives();
        Ok(())
    }

    pub fn active_parameter_values(&self) -> Vec<f64> {
        self.discretization.parameters.active_values()
    }

    pub fn set_active_parameter_values(&mut self, values: &[f64]) -> Result<()> {
        self.discretization.parameters.set_active_values(values)?;
        self.load_parameters();
        self.invalidate_derivatives();
        Ok(())
    }

    pub fn set_sensor_data(&mut self, data: Option<SensorData>) {
        self.reducer.set_sensor_data(data);
        self.invalidate_derivatives();
    }

    /// Responses at every time level, reduced over all processes.
    pub fn responses(&mut self) -> Result<ResponseArray> {
        self.require_forward_solve()?;
        let steps = self.steps();
        let mut array = ResponseArray::zeros(self.reducer.num_slots(), self.reducer.num_components(), steps.len());
        for step in steps {
            self.load_step(step, None);
            for cell in self.cells.cells() {
                for e in 0..cell.len() {
                    match cell.subgrid(e) {
                        Some((model, handle)) => self.multiscale.model(model).accumulate_responses(
                            handle,
                            step.time,
                            step.time_index,
                            &self.reducer,
                            &mut array,
                        ),
                        None => self.reducer.accumulate_responses(
                            cell.element_values(e),
                            cell.shape(),
                            cell.sensors(e),
                            cell.state(e).as_slice(),
                            step.time,
                            step.time_index - 1,
                            &mut array,
                        ),
                    }
                }
            }
        }
        array.sum_all(self.comm.as_ref());
        Ok(array)
    }

    /// Gathers `(element, value)` pairs of all processes into a per-element field on the root.
    fn gather_cell_field(&self, values: Vec<(usize, f64)>) -> Option<Vec<f64>> {
        let mut outgoing = vec![Payload::empty(); self.comm.size()];
        outgoing[0] = Payload::Entries(values);
        let incoming = self.comm.exchange(outgoing);
        self.comm.is_root().then(|| {
            let mut field = vec![0.0; self.mesh.num_elements()];
            for (element, value) in incoming.into_iter().flat_map(Payload::into_entries) {
                field[element] = value;
            }
            field
        })
    }

    fn per_element(&self, f: impl Fn(&crate::cell::Cell, usize) -> f64) -> Vec<(usize, f64)> {
        self.cells
            .cells()
            .iter()
            .flat_map(|cell| (0..cell.len()).map(move |e| (cell, e)))
            .map(|(cell, e)| (cell.elements()[e], f(cell, e)))
            .collect()
    }

    /// Writes the enabled response files on the root and, with a sink, the fields of every
    /// time level.
    ///
    /// Subgrid solutions are persisted by the process owning the macro element.
    pub fn write_outputs(&mut self, sink: Option<&mut dyn ResultSink>) -> Result<()> {
        let responses = self.responses()?;
        let objective = if self.settings.postprocess.write_objective {
            Some(self.compute_objective()?)
        } else {
            None
        };
        let steps = self.steps();
        let final_state = self.global_state(self.history.len() - 1);
        let height: Vec<(f64, f64, f64)> = self
            .mesh
            .vertices()
            .iter()
            .enumerate()
            .map(|(node, x)| (x.x, x.y, final_state[self.discretization.dofs.gid(node, 0)]))
            .collect();
        if self.comm.is_root() {
            let times: Vec<f64> = steps.iter().map(|s| s.time).collect();
            self.reducer
                .write_outputs(&responses, &times, objective, Some(height.as_slice()))?;
        }

        let Some(sink) = sink else {
            return Ok(());
        };
        let label = self
            .settings
            .postprocess
            .results_label
            .clone()
            .unwrap_or_else(|| "solution".to_string());

        let seed = self.gather_cell_field(self.per_element(|cell, e| {
            cell.seed_assignment(e)
                .map(|a| a.seed as f64)
                .unwrap_or(-1.0)
        }));
        let model = self.gather_cell_field(self.per_element(|cell, e| {
            cell.subgrid(e)
                .map(|(model, _)| model as f64)
                .unwrap_or(-1.0)
        }));

        let num_vertices = self.mesh.num_vertices();
        let mut parameter_fields = Vec::new();
        let parameters = &self.discretization.parameters;
        for name in &self.discretization.field_names {
            if let Some(p) = parameters.get(name) {
                parameter_fields.push((name.clone(), p.values.clone()));
            }
        }
        if let Some(field) = &self.sensitivity_field {
            let global = self.parameter_map.all_gather(self.comm.as_ref(), field);
            let num_fields = self.discretization.field_names.len();
            for (k, name) in self.discretization.field_names.iter().enumerate() {
                let values = (0..num_vertices).map(|node| global[node * num_fields + k]).collect();
                parameter_fields.push((format!("{}_dRdP", name), values));
            }
        }

        let mesh = OutputMesh {
            shape: self.mesh.element_shape(0),
            vertices: self.mesh.vertices().to_vec(),
            connectivity: (0..self.mesh.num_elements())
                .map(|e| self.mesh.element_nodes(e).to_vec())
                .collect(),
        };
        let variables = self.discretization.dofs.variables().to_vec();

        for step in steps {
            let state = self.global_state(step.time_index);
            let mut means = Vec::new();
            for (v, name) in variables.iter().enumerate() {
                let field = self.gather_cell_field(self.per_element(|cell, e| {
                    cell.subgrid(e)
                        .and_then(|(model, handle)| {
                            self.multiscale
                                .model(model)
                                .mean_fields(handle, Some(step.time_index))
                        })
                        .map(|means| means[v])
                        .unwrap_or(0.0)
                }));
                means.push((format!("subgrid_mean_{}", name), field));
            }

            for cell in self.cells.cells() {
                for e in 0..cell.len() {
                    if let Some((model, handle)) = cell.subgrid(e) {
                        self.multiscale
                            .model(model)
                            .persist_solution(&label, handle, step.time_index, &mut *sink)?;
                    }
                }
            }

            if !self.comm.is_root() {
                continue;
            }
            let mut results = ResultSet::default();
            for (v, name) in variables.iter().enumerate() {
                let values = (0..num_vertices)
                    .map(|node| state[self.discretization.dofs.gid(node, v)])
                    .collect();
                results = results.with_node_field(name.clone(), values);
            }
            for (name, values) in &parameter_fields {
                results = results.with_node_field(name.clone(), values.clone());
            }
            for (name, field) in [("mesh_data_seed".to_string(), &seed), ("subgrid model".to_string(), &model)]
                .into_iter()
                .chain(means.iter().map(|(name, field)| (name.clone(), field)))
            {
                if let Some(values) = field {
                    results = results.with_cell_field(name, values.clone());
                }
            }
            sink.write(&label, step.time_index, step.time, &mesh, &results)?;
        }
        Ok(())
    }

    /// The full state vector at a time index on every process.
    pub fn global_state(&self, time_index: usize) -> DVector<f64> {
        self.map.all_gather(self.comm.as_ref(), &self.history[time_index].1)
    }

    /// Owned part of the last state in the history.
    pub fn final_state(&self) -> &DVector<f64> {
        &self.history[self.history.len() - 1].1
    }

    /// `(time, owned state)` per time index.
    pub fn history(&self) -> &[(f64, DVector<f64>)] {
        &self.history
    }

    /// Owned adjoint per time index, empty before an adjoint solve.
    pub fn adjoints(&self) -> &[DVector<f64>] {
        &self.adjoints
    }

    pub fn gradient(&self) -> Option<&DVector<f64>> {
        self.gradient.as_ref()
    }

    /// Owned part of `lambda^T dR/dq` per discretized parameter dof.
    pub fn sensitivity_field(&self) -> Option<&DVector<f64>> {
        self.sensitivity_field.as_ref()
    }

    pub fn state_trace(&self) -> &[NewtonState] {
        &self.trace
    }

    pub fn communicator(&self) -> &dyn Communicator {
        self.comm.as_ref()
    }

    pub fn mesh(&self) -> &BlockMesh {
        &self.mesh
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn cells(&self) -> &CellPartition {
        &self.cells
    }

    pub fn dofs(&self) -> &DofManager {
        &self.discretization.dofs
    }

    pub fn parameter_dofs(&self) -> &DofManager {
        &self.discretization.parameter_dofs
    }

    pub fn partition_map(&self) -> &PartitionMap {
        &self.map
    }

    /// Seeds of the current mesh data, the first file for imported data.
    pub fn seeds(&self) -> Option<&SeedSet> {
        self.mesh_data.as_ref().and_then(MeshData::seeds)
    }

    pub fn multiscale(&self) -> &MultiscaleManager {
        &self.multiscale
    }

    pub fn reducer(&self) -> &ResponseReducer {
        &self.reducer
    }

    /// Constrained global dofs.
    pub fn constrained_dofs(&self) -> &BTreeSet<usize> {
        &self.constrained
    }
}

/// The nonlinear system of one step as seen by the Newton solver.
struct NewtonSystem<'a> {
    engine: &'a mut SolveEngine,
    step: Step,
    previous: Option<DVector<f64>>,
    jacobian: Option<Vec<(usize, usize, f64)>>,
    reuse_jacobian: bool,
    iterations: usize,
    residual_norm: f64,
}

fn function_error(err: MultiscaleError) -> FunctionError {
    Box::new(err)
}

impl<'a> VectorFunction<f64> for NewtonSystem<'a> {
    fn dimension(&self) -> usize {
        self.engine.map.owned().len()
    }

    fn eval_into(&mut self, f: &mut DVectorViewMut<f64>, x: &DVectorView<f64>) -> std::result::Result<(), FunctionError> {
        self.engine.trace.push(NewtonState::Assembling);
        self.engine.trace.push(NewtonState::ResidualOnly);
        let u = x.clone_owned();
        let residual = self
            .engine
            .constrained_residual(&u, self.previous.as_ref(), self.step)
            .map_err(function_error)?;
        self.residual_norm = global_norm(self.engine.comm.as_ref(), residual.norm_squared());
        f.copy_from(&residual);
        Ok(())
    }

    fn norm(&self, v: &DVectorView<f64>) -> f64 {
        global_norm(self.engine.comm.as_ref(), v.norm_squared())
    }
}

impl<'a> DifferentiableVectorFunction<f64> for NewtonSystem<'a> {
    fn solve_jacobian_system(
        &mut self,
        sol: &mut DVectorViewMut<f64>,
        x: &DVectorView<f64>,
        rhs: &DVectorView<f64>,
    ) -> std::result::Result<(), FunctionError> {
        if self.iterations > 0 {
            self.engine.trace.push(NewtonState::IterateAgain);
        }
        self.engine.trace.push(NewtonState::Assembling);
        let cached = if self.reuse_jacobian { self.jacobian.clone() } else { None };
        let triplets = match cached {
            Some(triplets) => triplets,
            None => {
                let triplets = self
                    .engine
                    .jacobian_triplets(&x.clone_owned(), self.previous.as_ref(), self.step)
                    .map_err(function_error)?;
                if self.reuse_jacobian {
                    self.jacobian = Some(triplets.clone());
                }
                triplets
            }
        };
        self.engine.trace.push(NewtonState::JacobianReady);
        self.engine.trace.push(NewtonState::LinearSolve);
        let solution = self
            .engine
            .solve_linear(triplets, &rhs.clone_owned(), false)
            .map_err(function_error)?;
        sol.copy_from(&solution);
        self.engine.trace.push(NewtonState::Updated);
        self.iterations += 1;
        Ok(())
    }
}
