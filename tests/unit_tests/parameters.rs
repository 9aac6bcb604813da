use mscale::error::MultiscaleError;
use mscale::parameters::{Parameter, ParameterSet, ParameterUsage};

fn set() -> ParameterSet {
    ParameterSet::new(vec![
        Parameter::scalar("fixed", ParameterUsage::Fixed, 2.0),
        Parameter::new("a", ParameterUsage::Active, vec![1.0, 3.0]),
        Parameter::scalar("noise", ParameterUsage::Stochastic, 0.5),
        Parameter::scalar("b", ParameterUsage::Active, 4.0).with_bounds(0.0, 10.0),
        Parameter::scalar("q", ParameterUsage::Discretized, 0.25),
    ])
    .unwrap()
}

#[test]
fn active_components_are_ordered_by_declaration() {
    let set = set();
    assert_eq!(set.num_active_components(), 3);
    assert_eq!(
        set.active_components(),
        vec![("a".to_string(), 0), ("a".to_string(), 1), ("b".to_string(), 0)]
    );
    assert_eq!(set.active_values(), vec![1.0, 3.0, 4.0]);
    assert_eq!(set.discretized_names(), vec!["q".to_string()]);
}

#[test]
fn seeded_values_put_active_components_in_their_channels() {
    let values = set().values(true, 5);
    assert_eq!(values.names(), &["fixed", "a", "noise", "b"]);
    assert!(values.get("q").is_none());

    assert!(values.scalar("fixed").unwrap().is_constant());
    assert!(values.scalar("noise").unwrap().is_constant());
    let a = values.get("a").unwrap();
    assert_eq!(a[0].derivatives(), &[1.0, 0.0, 0.0, 0.0, 0.0]);
    assert_eq!(a[1].derivatives(), &[0.0, 1.0, 0.0, 0.0, 0.0]);
    let b = values.scalar("b").unwrap();
    assert_eq!(b.value(), 4.0);
    assert_eq!(b.derivative(2), 1.0);

    let constant = values.to_constant();
    assert!(constant.get("a").unwrap().iter().all(|v| v.is_constant()));
    assert_eq!(constant.scalar("b").unwrap().value(), 4.0);
}

#[test]
fn unseeded_values_are_constant() {
    let values = set().values(false, 5);
    assert!(values.get("a").unwrap().iter().all(|v| v.is_constant()));
}

#[test]
fn set_active_values_splits_over_parameters() {
    let mut set = set();
    set.set_active_values(&[5.0, 6.0, 7.0]).unwrap();
    assert_eq!(set.get("a").unwrap().values, vec![5.0, 6.0]);
    assert_eq!(set.get("b").unwrap().values, vec![7.0]);

    assert!(set.set_active_values(&[1.0]).is_err());
    assert!(matches!(set.set_active_values(&[1.0, 2.0, 11.0]), Err(MultiscaleError::Configuration(_))));
}

#[test]
fn set_values_checks_name_length_and_bounds() {
    let mut set = set();
    assert!(set.set_values("missing", vec![1.0]).is_err());
    assert!(set.set_values("a", vec![1.0]).is_err());
    assert!(set.set_values("b", vec![-1.0]).is_err());
    set.set_values("b", vec![10.0]).unwrap();
    assert_eq!(set.get("b").unwrap().values, vec![10.0]);
}

#[test]
fn invalid_sets_are_rejected() {
    let duplicate = ParameterSet::new(vec![
        Parameter::scalar("a", ParameterUsage::Fixed, 1.0),
        Parameter::scalar("a", ParameterUsage::Active, 1.0),
    ]);
    assert!(matches!(duplicate, Err(MultiscaleError::Configuration(_))));

    let empty = ParameterSet::new(vec![Parameter::new("a", ParameterUsage::Fixed, Vec::new())]);
    assert!(empty.is_err());

    let out_of_bounds = ParameterSet::new(vec![Parameter::scalar("a", ParameterUsage::Active, 2.0).with_bounds(0.0, 1.0)]);
    assert!(out_of_bounds.is_err());
}

#[test]
fn discretized_values_expand_to_nodes() {
    let mut set = set();
    set.expand_discretized(4).unwrap();
    assert_eq!(set.get("q").unwrap().values, vec![0.25; 4]);
    // Already nodal
    set.expand_discretized(4).unwrap();
    assert!(set.expand_discretized(6).is_err());
    // Other parameters are untouched
    assert_eq!(set.get("a").unwrap().values, vec![1.0, 3.0]);
}
