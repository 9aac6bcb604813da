//! Linear solvers for the global systems assembled by mscale.
//!
//! The solver crate is deliberately small: the nonlinear solver only ever needs to solve
//! `A x = b` and `A^T x = b` for a sparse matrix assembled on a single process.
pub mod cg;
pub mod solver;

pub use nalgebra_sparse::{CooMatrix, CsrMatrix};
pub use solver::{DirectSolver, IterativeSolver, LinearSolveError, LinearSolver};
