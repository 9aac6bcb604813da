//! Forward-mode dual numbers.
//!
//! A [`Dual`] carries a value together with a vector of directional derivatives ("channels").
//! The same type is used for Jacobians (one channel per local state dof), for parameter
//! sensitivities (one channel per active parameter component plus one per local discretized
//! parameter dof) and for the previous-state coupling of transient adjoints. Which quantity a
//! channel refers to is decided by whoever seeds the inputs.
//!
//! Operands may carry different numbers of channels; missing channels are treated as zero.
use mscale_traits::Real;
use numeric_literals::replace_float_literals;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Div, DivAssign, Mul, MulAssign, Neg, Sub, SubAssign};

/// Maximum number of derivative channels a [`Dual`] may carry.
pub const MAX_DERIVATIVE_CHANNELS: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub struct Dual<T> {
    value: T,
    derivatives: Vec<T>,
}

impl<T: Real> Dual<T> {
    /// A value with no derivative channels.
    pub fn constant(value: T) -> Self {
        Self {
            value,
            derivatives: Vec::new(),
        }
    }

    /// A value seeded with a unit derivative in `channel` out of `num_channels`.
    ///
    /// # Panics
    ///
    /// Panics if `channel >= num_channels` or `num_channels` exceeds [`MAX_DERIVATIVE_CHANNELS`].
    pub fn variable(value: T, channel: usize, num_channels: usize) -> Self {
        assert!(channel < num_channels, "channel {} out of bounds ({})", channel, num_channels);
        let mut derivatives = vec![T::zero(); num_channels];
        derivatives[channel] = T::one();
        Self::from_parts(value, derivatives)
    }

    /// # Panics
    ///
    /// Panics if the number of derivatives exceeds [`MAX_DERIVATIVE_CHANNELS`].
    pub fn from_parts(value: T, derivatives: Vec<T>) -> Self {
        assert!(
            derivatives.len() <= MAX_DERIVATIVE_CHANNELS,
            "{} derivative channels exceed the maximum of {}",
            derivatives.len(),
            MAX_DERIVATIVE_CHANNELS
        );
        Self { value, derivatives }
    }

    pub fn value(&self) -> T {
        self.value
    }

    pub fn derivatives(&self) -> &[T] {
        &self.derivatives
    }

    /// The derivative in the given channel, zero if the channel is not present.
    pub fn derivative(&self, channel: usize) -> T {
        self.derivatives.get(channel).copied().unwrap_or_else(T::zero)
    }

    pub fn num_channels(&self) -> usize {
        self.derivatives.len()
    }

    pub fn is_constant(&self) -> bool {
        self.derivatives.iter().all(|d| *d == T::zero())
    }

    /// Applies a scalar function with value `f` and derivative `df` at `self.value()`.
    fn chain(&self, f: T, df: T) -> Self {
        Self {
            value: f,
            derivatives: self.derivatives.iter().map(|d| *d * df).collect(),
        }
    }

    fn zip_derivatives_with(&mut self, rhs: &[T], f: impl Fn(T, T) -> T) {
        if self.derivatives.len() < rhs.len() {
            self.derivatives.resize(rhs.len(), T::zero());
        }
        for (i, d) in self.derivatives.iter_mut().enumerate() {
            let d_rhs = rhs.get(i).copied().unwrap_or_else(T::zero);
            *d = f(*d, d_rhs);
        }
    }

    pub fn powi(&self, n: i32) -> Self {
        if n == 0 {
            return Self::constant(T::one());
        }
        let df = self.value.powi(n - 1) * T::from_constant(n as f64);
        self.chain(self.value.powi(n), df)
    }

    #[replace_float_literals(T::from_f64(literal).unwrap())]
    pub fn sqrt(&self) -> Self {
        let s = self.value.sqrt();
        self.chain(s, 0.5 / s)
    }

    pub fn exp(&self) -> Self {
        let e = self.value.exp();
        self.chain(e, e)
    }

    pub fn ln(&self) -> Self {
        self.chain(self.value.ln(), T::one() / self.value)
    }

    pub fn sin(&self) -> Self {
        self.chain(self.value.sin(), self.value.cos())
    }

    pub fn cos(&self) -> Self {
        self.chain(self.value.cos(), -self.value.sin())
    }

    pub fn abs(&self) -> Self {
        let sign = if self.value >= T::zero() { T::one() } else { -T::one() };
        self.chain(self.value.abs(), sign)
    }
}

impl<T: Real> From<T> for Dual<T> {
    fn from(value: T) -> Self {
        Self::constant(value)
    }
}

impl<'a, T: Real> AddAssign<&'a Dual<T>> for Dual<T> {
    fn add_assign(&mut self, rhs: &'a Dual<T>) {
        self.value += rhs.value;
        self.zip_derivatives_with(&rhs.derivatives, |a, b| a + b);
    }
}

impl<'a, T: Real> SubAssign<&'a Dual<T>> for Dual<T> {
    fn sub_assign(&mut self, rhs: &'a Dual<T>) {
        self.value -= rhs.value;
        self.zip_derivatives_with(&rhs.derivatives, |a, b| a - b);
    }
}

impl<'a, T: Real> MulAssign<&'a Dual<T>> for Dual<T> {
    fn mul_assign(&mut self, rhs: &'a Dual<T>) {
        let (a, b) = (self.value, rhs.value);
        self.zip_derivatives_with(&rhs.derivatives, |da, db| da * b + a * db);
        self.value = a * b;
    }
}

impl<'a, T: Real> DivAssign<&'a Dual<T>> for Dual<T> {
    fn div_assign(&mut self, rhs: &'a Dual<T>) {
        let (a, b) = (self.value, rhs.value);
        let b_squared = b * b;
        self.zip_derivatives_with(&rhs.derivatives, |da, db| (da * b - a * db) / b_squared);
        self.value = a / b;
    }
}

impl<T: Real> AddAssign<T> for Dual<T> {
    fn add_assign(&mut self, rhs: T) {
        self.value += rhs;
    }
}

impl<T: Real> SubAssign<T> for Dual<T> {
    fn sub_assign(&mut self, rhs: T) {
        self.value -= rhs;
    }
}

impl<T: Real> MulAssign<T> for Dual<T> {
    fn mul_assign(&mut self, rhs: T) {
        self.value *= rhs;
        self.derivatives.iter_mut().for_each(|d| *d *= rhs);
    }
}

impl<T: Real> DivAssign<T> for Dual<T> {
    fn div_assign(&mut self, rhs: T) {
        self.value /= rhs;
        self.derivatives.iter_mut().for_each(|d| *d /= rhs);
    }
}

macro_rules! impl_dual_ops {
    ($Op:ident, $op:ident, $OpAssign:ident, $op_assign:ident) => {
        impl<T: Real> $OpAssign<Dual<T>> for Dual<T> {
            fn $op_assign(&mut self, rhs: Dual<T>) {
                self.$op_assign(&rhs);
            }
        }

        impl<T: Real> $Op<Dual<T>> for Dual<T> {
            type Output = Dual<T>;
            fn $op(mut self, rhs: Dual<T>) -> Dual<T> {
                self.$op_assign(&rhs);
                self
            }
        }

        impl<'a, T: Real> $Op<&'a Dual<T>> for Dual<T> {
            type Output = Dual<T>;
            fn $op(mut self, rhs: &'a Dual<T>) -> Dual<T> {
                self.$op_assign(rhs);
                self
            }
        }

        impl<'a, T: Real> $Op<Dual<T>> for &'a Dual<T> {
            type Output = Dual<T>;
            fn $op(self, rhs: Dual<T>) -> Dual<T> {
                let mut result = self.clone();
                result.$op_assign(&rhs);
                result
            }
        }

        impl<'a, 'b, T: Real> $Op<&'b Dual<T>> for &'a Dual<T> {
            type Output = Dual<T>;
            fn $op(self, rhs: &'b Dual<T>) -> Dual<T> {
                let mut result = self.clone();
                result.$op_assign(rhs);
                result
            }
        }

        impl<T: Real> $Op<T> for Dual<T> {
            type Output = Dual<T>;
            fn $op(mut self, rhs: T) -> Dual<T> {
                self.$op_assign(rhs);
                self
            }
        }

        impl<'a, T: Real> $Op<T> for &'a Dual<T> {
            type Output = Dual<T>;
            fn $op(self, rhs: T) -> Dual<T> {
                let mut result = self.clone();
                result.$op_assign(rhs);
                result
            }
        }

        impl $Op<Dual<f64>> for f64 {
            type Output = Dual<f64>;
            fn $op(self, rhs: Dual<f64>) -> Dual<f64> {
                let mut result = Dual::constant(self);
                result.$op_assign(&rhs);
                result
            }
        }

        impl<'a> $Op<&'a Dual<f64>> for f64 {
            type Output = Dual<f64>;
            fn $op(self, rhs: &'a Dual<f64>) -> Dual<f64> {
                let mut result = Dual::constant(self);
                result.$op_assign(rhs);
                result
            }
        }
    };
}

impl_dual_ops!(Add, add, AddAssign, add_assign);
impl_dual_ops!(Sub, sub, SubAssign, sub_assign);
impl_dual_ops!(Mul, mul, MulAssign, mul_assign);
impl_dual_ops!(Div, div, DivAssign, div_assign);

impl<T: Real> Neg for Dual<T> {
    type Output = Dual<T>;
    fn neg(mut self) -> Dual<T> {
        self.value = -self.value;
        self.derivatives.iter_mut().for_each(|d| *d = -*d);
        self
    }
}

impl<'a, T: Real> Neg for &'a Dual<T> {
    type Output = Dual<T>;
    fn neg(self) -> Dual<T> {
        -self.clone()
    }
}

impl<T: Real> Sum for Dual<T> {
    fn sum<I: Iterator<Item = Dual<T>>>(iter: I) -> Self {
        iter.fold(Dual::constant(T::zero()), |acc, x| acc + x)
    }
}

impl<'a, T: Real> Sum<&'a Dual<T>> for Dual<T> {
    fn sum<I: Iterator<Item = &'a Dual<T>>>(iter: I) -> Self {
        iter.fold(Dual::constant(T::zero()), |acc, x| acc + x)
    }
}

/// Dot product of two slices of duals.
pub fn dot<T: Real>(a: &[Dual<T>], b: &[Dual<T>]) -> Dual<T> {
    assert_eq!(a.len(), b.len());
    a.iter()
        .zip(b)
        .fold(Dual::constant(T::zero()), |acc, (a_i, b_i)| acc + a_i * b_i)
}
