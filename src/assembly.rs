//! Global assembly over the cells of one process.
//!
//! Element contributions come from the physics evaluator or, for elements delegated to a
//! subgrid model, from [`MultiscaleManager::solve`]. Vectors are assembled in the overlapped
//! layout of a [`PartitionMap`], matrices as triplets in global ids. Summation across
//! processes is left to the caller.
//!
//! Every function expects the relevant solution vectors to be gathered into the cells
//! beforehand: state and parameters always, the previous state for transient steps and the
//! adjoint wherever adjoint-weighted quantities are assembled.
use crate::cell::{Cell, CellPartition};
use crate::distributed::PartitionMap;
use crate::dual::Dual;
use crate::error::Result;
use crate::parameters::ParameterSet;
use crate::physics::{
    element_residual, fields_at_points, seed_fields, seed_state, EvaluationContext, PhysicsEvaluator, SeedMode,
    TrialData,
};
use crate::response::ResponseReducer;
use crate::subgrid::{adjoint_weighted_derivatives, MultiscaleManager, SubgridSolveRequest};
use nalgebra::DVector;
use std::collections::BTreeSet;

/// Quantities shared by all elements of one assembly pass.
#[derive(Clone, Copy)]
pub struct AssemblyInput<'a> {
    pub physics: &'a dyn PhysicsEvaluator,
    pub num_variables: usize,
    pub parameters: &'a ParameterSet,
    pub field_names: &'a [String],
    pub time: f64,
    pub time_index: usize,
    /// Time step of a backward Euler step, `None` for steady solves.
    pub dt: Option<f64>,
    pub store_adjoint_history: bool,
}

impl<'a> std::fmt::Debug for AssemblyInput<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssemblyInput")
            .field("num_variables", &self.num_variables)
            .field("field_names", &self.field_names)
            .field("time", &self.time)
            .field("time_index", &self.time_index)
            .field("dt", &self.dt)
            .finish()
    }
}

/// Residual of one element with the channels of the requested seed mode.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementContribution {
    pub residual: Vec<Dual<f64>>,
    /// `phi^T dR/dp` for adjoint evaluations in `Parameters` mode.
    pub sensitivity: Option<DVector<f64>>,
}

fn overlapped_index(map: &PartitionMap, gid: usize) -> usize {
    map.overlapped_lid(gid)
        .unwrap_or_else(|| panic!("dof {} is not part of the overlapped map", gid))
}

fn num_channels(input: &AssemblyInput, cell: &Cell, e: usize, mode: SeedMode) -> usize {
    match mode {
        SeedMode::None => 0,
        SeedMode::State | SeedMode::PreviousState => cell.element_dofs(e).len(),
        SeedMode::Parameters => input.parameters.num_active_components() + cell.element_parameter_dofs(e).len(),
    }
}

/// Evaluates the residual of element `e` of `cell`.
pub fn evaluate_element(
    input: &AssemblyInput,
    cell: &Cell,
    e: usize,
    multiscale: &mut MultiscaleManager,
    mode: SeedMode,
    adjoint: bool,
) -> Result<ElementContribution> {
    let num_active = input.parameters.num_active_components();
    let num_channels = num_channels(input, cell, e, mode);
    let params = input
        .parameters
        .values(mode == SeedMode::Parameters, num_channels);
    let fields = cell.parameters(e).as_slice();
    let previous = input.dt.map(|_| cell.previous_state(e).as_slice());

    if let Some((model, handle)) = cell.subgrid(e) {
        let usages = input.parameters.usages();
        let parameter_mode = mode == SeedMode::Parameters;
        let request = SubgridSolveRequest {
            macro_state: cell.state(e).as_slice(),
            macro_previous_state: previous,
            macro_adjoint: adjoint.then(|| cell.adjoint(e).as_slice()),
            parameters: &params,
            parameter_usages: &usages,
            fields,
            field_names: input.field_names,
            time: input.time,
            time_index: input.time_index,
            dt: input.dt,
            transient: input.dt.is_some(),
            adjoint,
            need_jacobian: mode == SeedMode::State,
            need_sensitivity: parameter_mode && num_active > 0,
            num_active_params: num_active,
            need_discretized_sensitivity: parameter_mode && !fields.is_empty(),
            need_aux_sensitivity: mode == SeedMode::PreviousState,
            store_adjoint_history: adjoint && input.store_adjoint_history,
        };
        let output = multiscale.solve(model, handle, &request)?;
        return Ok(ElementContribution {
            residual: output.residual,
            sensitivity: output.sensitivity,
        });
    }

    let values = cell.element_values(e);
    let (u, u_prev) = seed_state(mode, cell.state(e).as_slice(), previous);
    let fields = seed_fields(mode, fields, num_active, num_channels);
    let fields = fields_at_points(values, &fields, input.field_names.len());
    let context = EvaluationContext {
        params: &params,
        field_names: input.field_names,
        time: input.time,
        dt: input.dt,
    };
    let trial = TrialData {
        values,
        u: &u,
        u_prev: u_prev.as_deref(),
        fields: &fields,
        material: cell.material(e),
    };
    let residual = element_residual(input.physics, &context, &trial, input.num_variables)?;
    let sensitivity = (adjoint && mode == SeedMode::Parameters)
        .then(|| adjoint_weighted_derivatives(&residual, cell.adjoint(e).as_slice(), num_channels));
    Ok(ElementContribution { residual, sensitivity })
}

/// Unconstrained residual in the overlapped layout of `map`.
pub fn assemble_residual(
    input: &AssemblyInput,
    cells: &CellPartition,
    multiscale: &mut MultiscaleManager,
    map: &PartitionMap,
) -> Result<DVector<f64>> {
    let mut residual = DVector::zeros(map.overlapped().len());
    for cell in cells.cells() {
        for e in 0..cell.len() {
            let contribution = evaluate_element(input, cell, e, multiscale, SeedMode::None, false)?;
            for (r, &gid) in contribution.residual.iter().zip(cell.element_dofs(e)) {
                residual[overlapped_index(map, gid)] += r.value();
            }
        }
    }
    Ok(residual)
}

/// Unconstrained residual and the triplets of `dR/du` in global ids.
pub fn assemble_jacobian(
    input: &AssemblyInput,
    cells: &CellPartition,
    multiscale: &mut MultiscaleManager,
    map: &PartitionMap,
) -> Result<(DVector<f64>, Vec<(usize, usize, f64)>)> {
    let mut residual = DVector::zeros(map.overlapped().len());
    let mut triplets = Vec::new();
    for cell in cells.cells() {
        for e in 0..cell.len() {
            let contribution = evaluate_element(input, cell, e, multiscale, SeedMode::State, false)?;
            let dofs = cell.element_dofs(e);
            for (r, &row) in contribution.residual.iter().zip(dofs) {
                residual[overlapped_index(map, row)] += r.value();
                triplets.extend(dofs.iter().enumerate().map(|(b, &col)| (row, col, r.derivative(b))));
            }
        }
    }
    Ok((residual, triplets))
}

/// `(dR/du_prev)^T lambda` in the overlapped layout, with `lambda` the gathered adjoint of the
/// current step.
pub fn assemble_previous_coupling(
    input: &AssemblyInput,
    cells: &CellPartition,
    multiscale: &mut MultiscaleManager,
    map: &PartitionMap,
) -> Result<DVector<f64>> {
    assert!(input.dt.is_some(), "previous-state coupling requires a transient step");
    let mut coupling = DVector::zeros(map.overlapped().len());
    for cell in cells.cells() {
        for e in 0..cell.len() {
            let contribution = evaluate_element(input, cell, e, multiscale, SeedMode::PreviousState, true)?;
            let dofs = cell.element_dofs(e);
            let weighted = adjoint_weighted_derivatives(&contribution.residual, cell.adjoint(e).as_slice(), dofs.len());
            for (w, &gid) in weighted.iter().zip(dofs) {
                coupling[overlapped_index(map, gid)] += w;
            }
        }
    }
    Ok(coupling)
}

/// Carries the history adjoints of the subgrid elements from the input's time index to the
/// previous one, using the gathered adjoint of the current step.
pub fn propagate_history_adjoints(
    input: &AssemblyInput,
    cells: &CellPartition,
    multiscale: &mut MultiscaleManager,
    reducer: &ResponseReducer,
) -> Result<()> {
    assert!(input.dt.is_some(), "history adjoints require a transient step");
    let params = input.parameters.values(false, 0);
    let usages = input.parameters.usages();
    for cell in cells.cells() {
        for e in 0..cell.len() {
            let Some((model, handle)) = cell.subgrid(e) else {
                continue;
            };
            let request = SubgridSolveRequest {
                macro_previous_state: Some(cell.previous_state(e).as_slice()),
                macro_adjoint: Some(cell.adjoint(e).as_slice()),
                parameter_usages: &usages,
                time: input.time,
                time_index: input.time_index,
                dt: input.dt,
                transient: true,
                adjoint: true,
                ..SubgridSolveRequest::residual(
                    cell.state(e).as_slice(),
                    &params,
                    cell.parameters(e).as_slice(),
                    input.field_names,
                )
            };
            multiscale
                .model_mut(model)
                .propagate_history_adjoint(handle, &request, reducer)?;
        }
    }
    Ok(())
}

/// History adjoint terms `eta^T dx/du` of the subgrid elements at the input's time index, in the
/// overlapped layout.
///
/// The subgrid elements must have been solved in `State` mode at that time index.
pub fn history_adjoint_state_gradient(
    input: &AssemblyInput,
    cells: &CellPartition,
    multiscale: &MultiscaleManager,
    map: &PartitionMap,
) -> Result<DVector<f64>> {
    let mut gradient = DVector::zeros(map.overlapped().len());
    for cell in cells.cells() {
        for e in 0..cell.len() {
            let Some((model, handle)) = cell.subgrid(e) else {
                continue;
            };
            let Some(term) =
                multiscale
                    .model(model)
                    .history_adjoint_derivatives(handle, SeedMode::State, input.time_index)?
            else {
                continue;
            };
            for (d, &gid) in term.iter().zip(cell.element_dofs(e)) {
                gradient[overlapped_index(map, gid)] += d;
            }
        }
    }
    Ok(gradient)
}

/// Derivatives with respect to the active parameter components and the discretized parameter
/// dofs.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterDerivatives {
    pub classic: DVector<f64>,
    /// Overlapped layout of the parameter map.
    pub fields: DVector<f64>,
}

impl ParameterDerivatives {
    fn zeros(num_active: usize, parameter_map: &PartitionMap) -> Self {
        Self {
            classic: DVector::zeros(num_active),
            fields: DVector::zeros(parameter_map.overlapped().len()),
        }
    }

    fn add_channels(&mut self, cell: &Cell, e: usize, derivatives: &[f64], parameter_map: &PartitionMap) {
        let num_active = self.classic.len();
        for (i, d) in derivatives.iter().take(num_active).enumerate() {
            self.classic[i] += d;
        }
        for (d, &gid) in derivatives
            .iter()
            .skip(num_active)
            .zip(cell.element_parameter_dofs(e))
        {
            self.fields[overlapped_index(parameter_map, gid)] += d;
        }
    }
}

/// `lambda^T dR/dp` with the gathered adjoint of the current step, including the history adjoint
/// terms of the subgrid elements.
pub fn assemble_parameter_derivatives(
    input: &AssemblyInput,
    cells: &CellPartition,
    multiscale: &mut MultiscaleManager,
    parameter_map: &PartitionMap,
) -> Result<ParameterDerivatives> {
    let mut result = ParameterDerivatives::zeros(input.parameters.num_active_components(), parameter_map);
    for cell in cells.cells() {
        for e in 0..cell.len() {
            let contribution = evaluate_element(input, cell, e, multiscale, SeedMode::Parameters, true)?;
            let mut sensitivity = contribution.sensitivity.unwrap_or_else(|| {
                adjoint_weighted_derivatives(
                    &contribution.residual,
                    cell.adjoint(e).as_slice(),
                    num_channels(input, cell, e, SeedMode::Parameters),
                )
            });
            if let Some((model, handle)) = cell.subgrid(e) {
                let history = multiscale.model(model).history_adjoint_derivatives(
                    handle,
                    SeedMode::Parameters,
                    input.time_index,
                )?;
                if let Some(history) = history {
                    sensitivity += history;
                }
            }
            result.add_channels(cell, e, sensitivity.as_slice(), parameter_map);
        }
    }
    Ok(result)
}

/// Objective contribution of one element at the input's time index.
///
/// Subgrid elements report the derivatives of their last solve in `mode`, so the matching
/// solve must precede any seeded call.
pub fn element_objective(
    input: &AssemblyInput,
    cell: &Cell,
    e: usize,
    multiscale: &MultiscaleManager,
    reducer: &ResponseReducer,
    mode: SeedMode,
) -> Result<Dual<f64>> {
    if let Some((model, handle)) = cell.subgrid(e) {
        return multiscale.model(model).compute_objective(
            reducer.response_type(),
            mode,
            input.time,
            input.time_index,
            handle,
            reducer,
        );
    }
    // A plain element's objective depends on its current state only.
    let seeded = if mode == SeedMode::State { SeedMode::State } else { SeedMode::None };
    let (u, _) = seed_state(seeded, cell.state(e).as_slice(), None);
    Ok(reducer.element_objective(
        cell.element_values(e),
        cell.shape(),
        cell.sensors(e),
        &u,
        input.time,
        input.time_index.saturating_sub(1),
    ))
}

fn element_regularization(
    input: &AssemblyInput,
    cell: &Cell,
    e: usize,
    reducer: &ResponseReducer,
    seeded: bool,
) -> Dual<f64> {
    let num_active = input.parameters.num_active_components();
    let mode = if seeded { SeedMode::Parameters } else { SeedMode::None };
    let num_channels = num_channels(input, cell, e, mode);
    let fields = seed_fields(mode, cell.parameters(e).as_slice(), num_active, num_channels);
    reducer.element_regularization(cell.element_values(e), &fields, input.field_names)
}

/// Local objective value at the input's time index, optionally including the regularization.
pub fn objective_value(
    input: &AssemblyInput,
    cells: &CellPartition,
    multiscale: &MultiscaleManager,
    reducer: &ResponseReducer,
    include_regularization: bool,
) -> Result<f64> {
    let mut total = 0.0;
    for cell in cells.cells() {
        for e in 0..cell.len() {
            total += element_objective(input, cell, e, multiscale, reducer, SeedMode::None)?.value();
            if include_regularization {
                total += element_regularization(input, cell, e, reducer, false).value();
            }
        }
    }
    Ok(total)
}

/// Derivative of the objective at the input's time index with respect to the current
/// (`State`) or previous (`PreviousState`) state, in the overlapped layout.
pub fn objective_state_gradient(
    input: &AssemblyInput,
    cells: &CellPartition,
    multiscale: &MultiscaleManager,
    reducer: &ResponseReducer,
    map: &PartitionMap,
    mode: SeedMode,
) -> Result<DVector<f64>> {
    assert!(matches!(mode, SeedMode::State | SeedMode::PreviousState));
    let mut gradient = DVector::zeros(map.overlapped().len());
    for cell in cells.cells() {
        for e in 0..cell.len() {
            if mode == SeedMode::PreviousState && cell.subgrid(e).is_none() {
                continue;
            }
            let objective = element_objective(input, cell, e, multiscale, reducer, mode)?;
            for (d, &gid) in objective.derivatives().iter().zip(cell.element_dofs(e)) {
                gradient[overlapped_index(map, gid)] += d;
            }
        }
    }
    Ok(gradient)
}

/// Direct derivatives of the objective with respect to the parameters.
///
/// Subgrid elements must have been solved in `Parameters` mode at the input's time index.
pub fn objective_parameter_derivatives(
    input: &AssemblyInput,
    cells: &CellPartition,
    multiscale: &MultiscaleManager,
    reducer: &ResponseReducer,
    parameter_map: &PartitionMap,
    include_regularization: bool,
) -> Result<ParameterDerivatives> {
    let mut result = ParameterDerivatives::zeros(input.parameters.num_active_components(), parameter_map);
    for cell in cells.cells() {
        for e in 0..cell.len() {
            if cell.subgrid(e).is_some() {
                let objective = element_objective(input, cell, e, multiscale, reducer, SeedMode::Parameters)?;
                result.add_channels(cell, e, objective.derivatives(), parameter_map);
            }
            if include_regularization {
                let regularization = element_regularization(input, cell, e, reducer, true);
                result.add_channels(cell, e, regularization.derivatives(), parameter_map);
            }
        }
    }
    Ok(result)
}

/// Strong Dirichlet conditions on an assembled system in global ids.
///
/// Couplings into constrained columns are moved to the right-hand side using the constrained
/// entries of `rhs`. Constrained rows and columns are then removed and replaced by a unit
/// diagonal, leaving `rhs` unchanged on the constrained rows.
pub fn apply_dirichlet(triplets: &mut Vec<(usize, usize, f64)>, rhs: &mut DVector<f64>, constrained: &BTreeSet<usize>) {
    for &(i, j, v) in triplets.iter() {
        if !constrained.contains(&i) && constrained.contains(&j) {
            rhs[i] -= v * rhs[j];
        }
    }
    triplets.retain(|(i, j, _)| !constrained.contains(i) && !constrained.contains(j));
    triplets.extend(constrained.iter().map(|&c| (c, c, 1.0)));
}
