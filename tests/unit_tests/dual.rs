use mscale::dual::{dot, Dual};
use mscale::proptest::dual;
use proptest::prelude::*;

fn assert_close(a: f64, b: f64, tol: f64) {
    assert!((a - b).abs() <= tol * (1.0 + b.abs()), "{} != {}", a, b);
}

#[test]
fn variable_seeds_unit_channel() {
    let x = Dual::variable(3.0, 1, 3);
    assert_eq!(x.value(), 3.0);
    assert_eq!(x.derivatives(), &[0.0, 1.0, 0.0]);
    assert_eq!(x.derivative(7), 0.0);
    assert!(Dual::constant(2.0).is_constant());
}

#[test]
#[should_panic]
fn variable_rejects_channel_out_of_bounds() {
    let _ = Dual::variable(1.0, 3, 3);
}

#[test]
fn product_rule_and_quotient_rule() {
    let x = Dual::variable(2.0, 0, 2);
    let y = Dual::variable(5.0, 1, 2);

    let p = &x * &y;
    assert_eq!(p.value(), 10.0);
    assert_eq!(p.derivatives(), &[5.0, 2.0]);

    let q = &x / &y;
    assert_close(q.value(), 0.4, 1e-15);
    assert_close(q.derivative(0), 0.2, 1e-15);
    assert_close(q.derivative(1), -2.0 / 25.0, 1e-15);
}

#[test]
fn mismatched_channel_counts_are_zero_padded() {
    let a = Dual::from_parts(1.0, vec![1.0]);
    let b = Dual::from_parts(2.0, vec![0.0, 0.0, 3.0]);
    let sum = &a + &b;
    assert_eq!(sum.value(), 3.0);
    assert_eq!(sum.derivatives(), &[1.0, 0.0, 3.0]);

    let product = a * b;
    assert_eq!(product.derivatives(), &[2.0, 0.0, 3.0]);
}

#[test]
fn elementary_functions_match_analytic_derivatives() {
    let x = Dual::variable(0.7, 0, 1);
    assert_close(x.powi(3).derivative(0), 3.0 * 0.49, 1e-14);
    assert_close(x.sqrt().derivative(0), 0.5 / 0.7f64.sqrt(), 1e-14);
    assert_close(x.exp().derivative(0), 0.7f64.exp(), 1e-14);
    assert_close(x.ln().derivative(0), 1.0 / 0.7, 1e-14);
    assert_close(x.sin().derivative(0), 0.7f64.cos(), 1e-14);
    assert_close(x.cos().derivative(0), -0.7f64.sin(), 1e-14);
    assert_close((-&x).abs().derivative(0), 1.0, 1e-14);
    assert!(x.powi(0).is_constant());
}

#[test]
fn dot_product_accumulates_all_channels() {
    let a = vec![Dual::variable(1.0, 0, 2), Dual::variable(2.0, 1, 2)];
    let b = vec![Dual::constant(3.0), Dual::constant(4.0)];
    let d = dot(&a, &b);
    assert_eq!(d.value(), 11.0);
    assert_eq!(d.derivatives(), &[3.0, 4.0]);
}

#[test]
fn sum_of_duals() {
    let values = vec![Dual::variable(1.0, 0, 2), Dual::variable(2.0, 1, 2), Dual::constant(3.0)];
    let total: Dual<f64> = values.iter().sum();
    assert_eq!(total.value(), 6.0);
    assert_eq!(total.derivatives(), &[1.0, 1.0]);
}

proptest! {
    #[test]
    fn addition_is_commutative(a in dual(4), b in dual(4)) {
        let ab = &a + &b;
        let ba = &b + &a;
        prop_assert_eq!(ab.value(), ba.value());
        for i in 0..4 {
            prop_assert_eq!(ab.derivative(i), ba.derivative(i));
        }
    }

    #[test]
    fn scaling_scales_derivatives(a in dual(4), s in -5.0..5.0f64) {
        let scaled = &a * s;
        prop_assert_eq!(scaled.value(), a.value() * s);
        for i in 0..a.num_channels() {
            prop_assert_eq!(scaled.derivative(i), a.derivative(i) * s);
        }
    }

    #[test]
    fn subtracting_itself_gives_zero(a in dual(4)) {
        let zero = &a - &a;
        prop_assert_eq!(zero.value(), 0.0);
        prop_assert!(zero.is_constant());
    }
}
