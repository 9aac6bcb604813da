//! Scalar traits shared by the mscale crates.
use nalgebra::RealField;

pub use nalgebra;

/// Real scalar type used by the solvers.
///
/// Everything in mscale runs on `f64` in practice, but the optimization and sparse crates
/// stay generic so that they can be exercised with other real types in tests.
pub trait Real: RealField + Copy {
    /// Converts an `f64` constant into `Self`.
    ///
    /// Panics if the constant is not representable, which mirrors how float literals are
    /// handled with `replace_float_literals` elsewhere in the workspace.
    fn from_constant(value: f64) -> Self {
        Self::from_f64(value).unwrap()
    }
}

impl<T: RealField + Copy> Real for T {}
