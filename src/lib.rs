//! Distributed multiscale finite element solver.
//!
//! A macro-scale nonlinear PDE is discretized on a block mesh and partitioned over the
//! processes of a [`distributed::Communicator`]. Selected macro elements delegate their
//! residual to a [`subgrid::SubgridModel`], either a fine-scale finite element problem or a
//! homogenized surrogate. The [`solve::SolveEngine`] drives Newton solves, adjoint solves and
//! parameter sensitivities on top of forward-mode [`dual::Dual`] numbers.
pub mod assembly;
pub mod cell;
pub mod config;
pub mod distributed;
pub mod dof;
pub mod dual;
pub mod element;
pub mod error;
pub mod estimate;
pub mod functions;
pub mod io;
pub mod mesh;
pub mod microstructure;
pub mod parameters;
pub mod physics;
pub mod response;
pub mod solve;
pub mod subgrid;

pub mod optimize {
    pub use mscale_optimize::*;
}

pub mod sparse {
    pub use mscale_sparse::*;
}

#[cfg(feature = "proptest")]
pub mod proptest;

pub extern crate nalgebra;
pub extern crate vtkio;

pub use mscale_traits::Real;
