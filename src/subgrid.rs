//! Delegation of macro elements to fine-scale models.
//!
//! A [`SubgridModel`] replaces the constitutive evaluation of the macro elements registered
//! with it. Given the macro dofs of an element it returns the element's residual contribution,
//! with derivative channels according to the requested seed mode. Each registered element is
//! addressed through the opaque [`SubgridHandle`] returned at registration.
//!
//! Calling any operation with a handle the model did not issue is a programming error and
//! panics.
use crate::config::{ResponseType, SubgridRule, SubgridSelection};
use crate::dual::Dual;
use crate::element::ElementShape;
use crate::error::{MultiscaleError, Result};
use crate::functions::FunctionManager;
use crate::io::ResultSink;
use crate::microstructure::{MaterialData, SeedSet};
use crate::parameters::{ParameterUsage, ParameterValues};
use crate::physics::SeedMode;
use crate::response::{ResponseArray, ResponseReducer};
use nalgebra::{DVector, Point3};

mod fine_scale;
mod homogenized;

pub use fine_scale::FineScaleModel;
pub use homogenized::HomogenizedModel;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubgridHandle(usize);

impl SubgridHandle {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

/// Everything a model needs to know about a macro element.
#[derive(Debug, Clone, PartialEq)]
pub struct MacroElementRegistration {
    /// Global element id.
    pub element: usize,
    pub block: String,
    pub shape: ElementShape,
    pub node_ids: Vec<usize>,
    pub nodes: Vec<Point3<f64>>,
    /// Side set index per local side, see [`crate::mesh::BlockMesh::element_boundary_flags`].
    pub boundary_flags: Vec<Option<usize>>,
    pub side_names: Vec<String>,
    pub dofs: Vec<usize>,
    /// `dof_offsets[var][i]`: local position of node `i` of variable `var`.
    pub dof_offsets: Vec<Vec<usize>>,
    pub material: Option<MaterialData>,
}

/// Inputs of a single subgrid solve.
///
/// Local vectors are component-major. `parameters` must carry the active parameter channels
/// whenever a parameter sensitivity is requested.
#[derive(Debug, Clone, Copy)]
pub struct SubgridSolveRequest<'a> {
    pub macro_state: &'a [f64],
    pub macro_previous_state: Option<&'a [f64]>,
    pub macro_adjoint: Option<&'a [f64]>,
    pub parameters: &'a ParameterValues,
    pub parameter_usages: &'a [ParameterUsage],
    pub fields: &'a [f64],
    pub field_names: &'a [String],
    pub time: f64,
    pub time_index: usize,
    /// Time step for transient solves.
    pub dt: Option<f64>,
    pub transient: bool,
    pub adjoint: bool,
    pub need_jacobian: bool,
    pub need_sensitivity: bool,
    pub num_active_params: usize,
    pub need_discretized_sensitivity: bool,
    /// Derivatives with respect to the previous time step.
    pub need_aux_sensitivity: bool,
    pub store_adjoint_history: bool,
}

impl<'a> SubgridSolveRequest<'a> {
    /// A residual-only request.
    pub fn residual(
        macro_state: &'a [f64],
        parameters: &'a ParameterValues,
        fields: &'a [f64],
        field_names: &'a [String],
    ) -> Self {
        Self {
            macro_state,
            macro_previous_state: None,
            macro_adjoint: None,
            parameters,
            parameter_usages: &[],
            fields,
            field_names,
            time: 0.0,
            time_index: 1,
            dt: None,
            transient: false,
            adjoint: false,
            need_jacobian: false,
            need_sensitivity: false,
            num_active_params: 0,
            need_discretized_sensitivity: false,
            need_aux_sensitivity: false,
            store_adjoint_history: false,
        }
    }

    pub fn seed_mode(&self) -> SeedMode {
        if self.need_jacobian {
            SeedMode::State
        } else if self.need_aux_sensitivity {
            SeedMode::PreviousState
        } else if self.need_sensitivity || self.need_discretized_sensitivity {
            SeedMode::Parameters
        } else {
            SeedMode::None
        }
    }

    pub fn num_channels(&self) -> usize {
        match self.seed_mode() {
            SeedMode::None => 0,
            SeedMode::State | SeedMode::PreviousState => self.macro_state.len(),
            SeedMode::Parameters => self.num_active_params + self.fields.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubgridSolveOutput {
    /// Macro residual contribution, component-major, with the request's channels.
    pub residual: Vec<Dual<f64>>,
    /// `phi^T dR/dp` when an adjoint sensitivity was requested.
    pub sensitivity: Option<DVector<f64>>,
    pub iterations: usize,
}

/// `phi^T dR/dp` over all channels of the residual.
pub(crate) fn adjoint_weighted_derivatives(residual: &[Dual<f64>], adjoint: &[f64], num_channels: usize) -> DVector<f64> {
    let mut result = DVector::zeros(num_channels);
    for (r, phi) in residual.iter().zip(adjoint) {
        for (j, d) in r.derivatives().iter().enumerate() {
            result[j] += phi * d;
        }
    }
    result
}

pub trait SubgridModel: Send {
    fn name(&self) -> &str;

    fn register_macro_element(&mut self, registration: MacroElementRegistration) -> Result<SubgridHandle>;

    /// Solves the local problem and returns the macro residual contribution.
    ///
    /// A local problem that does not converge yields
    /// [`MultiscaleError::SubgridConvergenceFailure`].
    fn solve(&mut self, handle: SubgridHandle, request: &SubgridSolveRequest) -> Result<SubgridSolveOutput>;

    /// Squared L2 and H1 seminorm errors per variable, `[L2_0, H1_0, L2_1, ...]`, of the solution
    /// stored for `time_index`.
    fn compute_error(
        &self,
        time: f64,
        time_index: usize,
        handle: SubgridHandle,
        functions: &dyn FunctionManager,
    ) -> Result<DVector<f64>>;

    /// Objective contribution of the element at the last solved state.
    ///
    /// `State` channels are the macro dofs, `Parameters` channels those of the last parameter
    /// solve.
    fn compute_objective(
        &self,
        response_type: ResponseType,
        mode: SeedMode,
        time: f64,
        time_index: usize,
        handle: SubgridHandle,
        reducer: &ResponseReducer,
    ) -> Result<Dual<f64>>;

    /// Carries the adjoint of the element's own time history from `request.time_index` back to
    /// the previous time index. `request.macro_adjoint` holds the macro adjoint of the current
    /// step, and the steps after it must already have been propagated.
    ///
    /// Models whose local state depends on the current macro dofs only keep the default.
    fn propagate_history_adjoint(
        &mut self,
        _handle: SubgridHandle,
        _request: &SubgridSolveRequest,
        _reducer: &ResponseReducer,
    ) -> Result<()> {
        Ok(())
    }

    /// `eta^T dx/dc`, with `eta` the history adjoint at `time_index`, `x` the local state and `c`
    /// the channels of the last solve in `mode`. `None` if the element carries no history adjoint
    /// at that time index.
    fn history_adjoint_derivatives(
        &self,
        _handle: SubgridHandle,
        _mode: SeedMode,
        _time_index: usize,
    ) -> Result<Option<DVector<f64>>> {
        Ok(None)
    }

    /// Adds the element's responses at the last solved state.
    fn accumulate_responses(
        &self,
        handle: SubgridHandle,
        time: f64,
        time_index: usize,
        reducer: &ResponseReducer,
        array: &mut ResponseArray,
    );

    /// Locates `(slot, point)` sensors inside the element and returns how many were found.
    fn add_sensors(&mut self, sensors: &[(usize, Point3<f64>)], tolerance: f64, handle: SubgridHandle) -> usize;

    fn persist_solution(
        &self,
        label: &str,
        handle: SubgridHandle,
        time_index: usize,
        sink: &mut dyn ResultSink,
    ) -> Result<()>;

    /// Drops all registered elements. Handles issued before become invalid.
    fn clear(&mut self);

    /// Informs the model about new parameter values.
    fn update_parameters(&mut self, _values: &ParameterValues) {}

    fn update_mesh_data(&mut self, seeds: &SeedSet) -> Result<()>;

    /// Volume averages of the variables at a time index, or at the last solve.
    fn mean_fields(&self, handle: SubgridHandle, time_index: Option<usize>) -> Option<Vec<f64>>;
}

/// The models of a run together with the rules assigning elements to them.
pub struct MultiscaleManager {
    models: Vec<Box<dyn SubgridModel>>,
    rules: Vec<SubgridRule>,
}

impl std::fmt::Debug for MultiscaleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiscaleManager")
            .field("models", &self.models.iter().map(|m| m.name()).collect::<Vec<_>>())
            .field("rules", &self.rules)
            .finish()
    }
}

impl MultiscaleManager {
    pub fn new(models: Vec<Box<dyn SubgridModel>>, rules: Vec<SubgridRule>) -> Result<Self> {
        if let Some(rule) = rules.iter().find(|rule| rule.model >= models.len()) {
            return Err(MultiscaleError::configuration(format!(
                "subgrid rule refers to model {} but only {} models are available",
                rule.model,
                models.len()
            )));
        }
        Ok(Self { models, rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// The model an element is delegated to. The first matching rule wins.
    pub fn select(&self, block: &str, seed_class: Option<usize>) -> Option<usize> {
        self.rules
            .iter()
            .find(|rule| match &rule.selection {
                SubgridSelection::All => true,
                SubgridSelection::Blocks(names) => names.iter().any(|name| name == block),
                SubgridSelection::SeedClasses(classes) => seed_class
                    .map(|class| classes.contains(&class))
                    .unwrap_or(false),
            })
            .map(|rule| rule.model)
    }

    /// Drops the registrations of all models.
    pub fn clear(&mut self) {
        for model in &mut self.models {
            model.clear();
        }
    }

    pub fn model(&self, index: usize) -> &dyn SubgridModel {
        self.models[index].as_ref()
    }

    pub fn model_mut(&mut self, index: usize) -> &mut dyn SubgridModel {
        self.models[index].as_mut()
    }

    pub fn models_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn SubgridModel>> {
        self.models.iter_mut()
    }

    pub fn solve(
        &mut self,
        model: usize,
        handle: SubgridHandle,
        request: &SubgridSolveRequest,
    ) -> Result<SubgridSolveOutput> {
        self.models[model].solve(handle, request)
    }
}
