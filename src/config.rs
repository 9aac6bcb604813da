//! Run configuration.
//!
//! All tunables live in [`Settings`], which is handed by reference to every component when it
//! is constructed. The structs derive serde traits so that a driver can load them from any
//! format it likes, but no input-deck parser is provided here.
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// 0 is quiet; larger values enable setup summaries and per-step logging at `info` level.
    pub verbosity: usize,
    pub mesh: MeshSettings,
    pub mesh_data: MeshDataSource,
    pub solver: SolverSettings,
    pub dirichlet: Vec<DirichletCondition>,
    pub postprocess: PostprocessSettings,
    pub multiscale: MultiscaleSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            verbosity: 0,
            mesh: MeshSettings::default(),
            mesh_data: MeshDataSource::None,
            solver: SolverSettings::default(),
            dirichlet: Vec::new(),
            postprocess: PostprocessSettings::default(),
            multiscale: MultiscaleSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshSettings {
    /// Maximum number of elements per cell.
    pub workset_size: usize,
    pub perturbation: MeshPerturbation,
}

impl Default for MeshSettings {
    fn default() -> Self {
        Self {
            workset_size: 100,
            perturbation: MeshPerturbation::None,
        }
    }
}

/// Deterministic node displacement applied when cells are built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MeshPerturbation {
    None,
    /// Rows `x y h`; nodes are lifted by `h (z - zmin) / (zmax - zmin)` using the nearest row.
    HeightFile(PathBuf),
    /// `dz = 0.2 sin(2 pi x) sin(2 pi y)`.
    Sinusoidal,
}

/// Where per-element material data comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MeshDataSource {
    None,
    Import(ImportSettings),
    Compute(SeedingSettings),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaterialKind {
    /// Nine entries per seed, a row-major rotation tensor.
    Rotation,
    /// Three entries per seed, Bunge Euler angles.
    OrientationAngles,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportSettings {
    pub directory: PathBuf,
    pub points_tag: String,
    pub data_tag: String,
    pub kind: MaterialKind,
    /// When set, files are named `<tag>.<index>.dat` with `index` in `1..=n`.
    pub number_of_files: Option<usize>,
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("."),
            points_tag: "mesh_data_pts".to_string(),
            data_tag: "mesh_data".to_string(),
            kind: MaterialKind::Rotation,
            number_of_files: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeedingSettings {
    pub random_seed: u64,
    pub domain_min: [f64; 3],
    pub domain_max: [f64; 3],
    pub strategy: SeedingStrategy,
    /// Class indices are drawn uniformly from `0..=num_classes`.
    pub num_classes: usize,
}

impl Default for SeedingSettings {
    fn default() -> Self {
        Self {
            random_seed: 1234,
            domain_min: [0.0; 3],
            domain_max: [1.0; 3],
            strategy: SeedingStrategy::default(),
            num_classes: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SeedingStrategy {
    /// `nx * ny * nz` jittered grid points.
    GridJitter { nx: usize, ny: usize, nz: usize },
    /// Farthest-candidate sampling from batches of uniformly random points.
    BlueNoise {
        num_seeds: usize,
        batch_size: usize,
        axis_weights: [f64; 3],
    },
}

impl Default for SeedingStrategy {
    fn default() -> Self {
        SeedingStrategy::BlueNoise {
            num_seeds: 1000,
            batch_size: 10,
            axis_weights: [1.0; 3],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverSettings {
    /// Relative tolerance on the residual norm.
    pub nonlinear_tolerance: f64,
    pub max_nonlinear_iterations: usize,
    /// Backtracking line search, which also retries steps at which a subgrid model fails.
    pub line_search: bool,
    /// Assemble the Jacobian only once per solve (modified Newton).
    pub reuse_jacobian: bool,
    pub transient: Option<TransientSettings>,
    pub initial_value: f64,
    /// Variables whose final values displace the mesh nodes on `remesh`, one per axis.
    pub remesh_variables: Vec<String>,
    pub linear_solver: LinearSolverKind,
    /// Keep the per-step adjoints of a transient solve.
    pub store_adjoint_history: bool,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            nonlinear_tolerance: 1e-6,
            max_nonlinear_iterations: 10,
            line_search: false,
            reuse_jacobian: false,
            transient: None,
            initial_value: 0.0,
            remesh_variables: Vec::new(),
            linear_solver: LinearSolverKind::Direct,
            store_adjoint_history: true,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransientSettings {
    pub final_time: f64,
    pub num_steps: usize,
}

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub enum LinearSolverKind {
    Direct,
    ConjugateGradient { tolerance: f64, max_iterations: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirichletCondition {
    /// Name of the side set.
    pub side: String,
    pub variable: String,
    pub value: DirichletValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DirichletValue {
    Constant(f64),
    /// Name of a function registered with the function manager, evaluated at `(x, t)`.
    Function(String),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseType {
    /// Integrated over the domain.
    Global,
    /// Evaluated at sensor locations.
    Pointwise,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegularizationKind {
    /// `beta/2 * int q^2`
    L2,
    /// `beta/2 * int |grad q|^2`
    H1,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegularizationSettings {
    pub parameter: String,
    pub kind: RegularizationKind,
    pub constant: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostprocessSettings {
    pub response_type: ResponseType,
    pub regularization: Vec<RegularizationSettings>,
    pub sensor_locations: Vec<[f64; 3]>,
    /// Tolerance on reference coordinates when locating sensors in elements.
    pub sensor_tolerance: f64,
    pub sensor_prefix: String,
    /// Standard deviation of Gaussian noise added to written sensor data.
    pub noise_std: f64,
    pub noise_seed: u64,
    pub output_directory: PathBuf,
    pub write_sensors: bool,
    pub write_objective: bool,
    pub write_dakota: bool,
    pub write_height_file: bool,
    /// File name stem for result files written through a result sink.
    pub results_label: Option<String>,
}

impl Default for PostprocessSettings {
    fn default() -> Self {
        Self {
            response_type: ResponseType::Global,
            regularization: Vec::new(),
            sensor_locations: Vec::new(),
            sensor_tolerance: 1e-10,
            sensor_prefix: "sensor".to_string(),
            noise_std: 0.0,
            noise_seed: 1234,
            output_directory: PathBuf::from("."),
            write_sensors: false,
            write_objective: false,
            write_dakota: false,
            write_height_file: false,
            results_label: None,
        }
    }
}

/// Which macro elements are delegated to which subgrid model.
///
/// Rules are tried in order and the first match wins. No rules means no multiscale elements.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiscaleSettings {
    pub rules: Vec<SubgridRule>,
    pub fine_scale: FineScaleSettings,
}


#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubgridRule {
    /// Index into the list of subgrid models handed to the engine.
    pub model: usize,
    pub selection: SubgridSelection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SubgridSelection {
    All,
    Blocks(Vec<String>),
    /// Elements whose seed class (seed index modulo 50) is listed.
    SeedClasses(Vec<usize>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FineScaleSettings {
    /// Number of fine elements per macro element edge.
    pub refinement: usize,
    /// Relative tolerance of the fine-scale Newton iterations.
    pub nonlinear_tolerance: f64,
    pub max_nonlinear_iterations: usize,
}

impl Default for FineScaleSettings {
    fn default() -> Self {
        Self {
            refinement: 2,
            nonlinear_tolerance: 1e-12,
            max_nonlinear_iterations: 20,
        }
    }
}
