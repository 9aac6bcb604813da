//! Error taxonomy for setup, solve and output.
use std::error::Error;
use std::fmt;
use std::path::PathBuf;

use crate::subgrid::SubgridHandle;

#[derive(Debug)]
pub enum MultiscaleError {
    /// A seed, perturbation or sensor data file is missing or malformed.
    DataFormat { path: Option<PathBuf>, message: String },
    /// Newton iterations did not meet the tolerance within the iteration budget.
    SolverDivergence { iterations: usize, residual_norm: f64 },
    /// A fine-scale model failed to solve its local problem.
    ///
    /// `handle` is `None` when the failure happened on another process.
    SubgridConvergenceFailure {
        handle: Option<SubgridHandle>,
        iterations: usize,
        residual_norm: f64,
    },
    /// Parameters, bases or blocks are inconsistent.
    Configuration(String),
    /// A linear system could not be solved.
    LinearSolve(mscale_sparse::LinearSolveError),
    Io(std::io::Error),
    /// A physics evaluator or output callback failed.
    Evaluation(eyre::Report),
}

pub type Result<T> = std::result::Result<T, MultiscaleError>;

impl MultiscaleError {
    pub fn data_format(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::DataFormat {
            path: Some(path.into()),
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn is_subgrid_failure(&self) -> bool {
        matches!(self, Self::SubgridConvergenceFailure { .. })
    }
}

impl fmt::Display for MultiscaleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DataFormat { path: Some(path), message } => {
                write!(f, "Malformed data in {}: {}", path.display(), message)
            }
            Self::DataFormat { path: None, message } => write!(f, "Malformed data: {}", message),
            Self::SolverDivergence {
                iterations,
                residual_norm,
            } => write!(
                f,
                "Nonlinear solver did not converge within {} iterations (residual norm {:e}).",
                iterations, residual_norm
            ),
            Self::SubgridConvergenceFailure {
                handle,
                iterations,
                residual_norm,
            } => {
                match handle {
                    Some(handle) => write!(f, "Subgrid model failed to converge for {:?}", handle)?,
                    None => write!(f, "Subgrid model failed to converge on a remote process")?,
                }
                write!(f, " after {} iterations (residual norm {:e}).", iterations, residual_norm)
            }
            Self::Configuration(message) => write!(f, "Invalid configuration: {}", message),
            Self::LinearSolve(err) => write!(f, "Linear solve failed: {}", err),
            Self::Io(err) => write!(f, "I/O error: {}", err),
            Self::Evaluation(report) => write!(f, "Evaluation failed: {}", report),
        }
    }
}

impl Error for MultiscaleError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::LinearSolve(err) => Some(err),
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for MultiscaleError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<eyre::Report> for MultiscaleError {
    fn from(report: eyre::Report) -> Self {
        Self::Evaluation(report)
    }
}

impl From<mscale_sparse::LinearSolveError> for MultiscaleError {
    fn from(err: mscale_sparse::LinearSolveError) -> Self {
        Self::LinearSolve(err)
    }
}
