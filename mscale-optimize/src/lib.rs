/// Calculus helper traits and numerical differentiation
pub mod calculus;
/// Newton iterations with pluggable line search and convergence criteria
pub mod newton;
