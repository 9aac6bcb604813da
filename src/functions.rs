//! Named functions of space and time, responses and exact solutions.
use crate::dual::Dual;
use nalgebra::{Point3, Vector3};
use rustc_hash::FxHashMap;

/// Evaluates user-supplied expressions.
pub trait FunctionManager: Send + Sync {
    fn evaluate(&self, name: &str, x: &Point3<f64>, time: f64) -> Option<f64>;

    fn response_names(&self, variables: &[String]) -> Vec<String>;

    /// Responses at a point, given the state variables there.
    fn responses(&self, x: &Point3<f64>, time: f64, state: &[Dual<f64>], variables: &[String]) -> Vec<Dual<f64>>;

    fn weights(&self, x: &Point3<f64>, time: f64, num_responses: usize) -> Vec<f64>;

    fn targets(&self, x: &Point3<f64>, time: f64, num_responses: usize) -> Vec<f64>;

    /// Value and gradient of the exact solution for a variable, if known.
    fn exact_solution(&self, variable: &str, x: &Point3<f64>, time: f64) -> Option<(f64, Vector3<f64>)>;
}

type ScalarFunction = Box<dyn Fn(&Point3<f64>, f64) -> f64 + Send + Sync>;
type ResponseFunction = Box<dyn Fn(&Point3<f64>, f64, &[Dual<f64>]) -> Dual<f64> + Send + Sync>;
type ExactFunction = Box<dyn Fn(&Point3<f64>, f64) -> (f64, Vector3<f64>) + Send + Sync>;

struct Response {
    name: String,
    response: ResponseFunction,
    weight: ScalarFunction,
    target: ScalarFunction,
}

/// A [`FunctionManager`] backed by closures.
///
/// Without registered responses, the responses are the state variables themselves with unit
/// weight and zero target.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: FxHashMap<String, ScalarFunction>,
    responses: Vec<Response>,
    exact: FxHashMap<String, ExactFunction>,
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .field("responses", &self.responses.iter().map(|r| &r.name).collect::<Vec<_>>())
            .field("exact", &self.exact.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_function(
        mut self,
        name: impl Into<String>,
        function: impl Fn(&Point3<f64>, f64) -> f64 + Send + Sync + 'static,
    ) -> Self {
        self.functions.insert(name.into(), Box::new(function));
        self
    }

    pub fn with_response(
        mut self,
        name: impl Into<String>,
        response: impl Fn(&Point3<f64>, f64, &[Dual<f64>]) -> Dual<f64> + Send + Sync + 'static,
        weight: impl Fn(&Point3<f64>, f64) -> f64 + Send + Sync + 'static,
        target: impl Fn(&Point3<f64>, f64) -> f64 + Send + Sync + 'static,
    ) -> Self {
        self.responses.push(Response {
            name: name.into(),
            response: Box::new(response),
            weight: Box::new(weight),
            target: Box::new(target),
        });
        self
    }

    pub fn with_exact_solution(
        mut self,
        variable: impl Into<String>,
        exact: impl Fn(&Point3<f64>, f64) -> (f64, Vector3<f64>) + Send + Sync + 'static,
    ) -> Self {
        self.exact.insert(variable.into(), Box::new(exact));
        self
    }
}

impl FunctionManager for FunctionRegistry {
    fn evaluate(&self, name: &str, x: &Point3<f64>, time: f64) -> Option<f64> {
        self.functions.get(name).map(|f| f(x, time))
    }

    fn response_names(&self, variables: &[String]) -> Vec<String> {
        if self.responses.is_empty() {
            variables.to_vec()
        } else {
            self.responses.iter().map(|r| r.name.clone()).collect()
        }
    }

    fn responses(&self, x: &Point3<f64>, time: f64, state: &[Dual<f64>], _variables: &[String]) -> Vec<Dual<f64>> {
        if self.responses.is_empty() {
            state.to_vec()
        } else {
            self.responses
                .iter()
                .map(|r| (r.response)(x, time, state))
                .collect()
        }
    }

    fn weights(&self, x: &Point3<f64>, time: f64, num_responses: usize) -> Vec<f64> {
        if self.responses.is_empty() {
            vec![1.0; num_responses]
        } else {
            self.responses.iter().map(|r| (r.weight)(x, time)).collect()
        }
    }

    fn targets(&self, x: &Point3<f64>, time: f64, num_responses: usize) -> Vec<f64> {
        if self.responses.is_empty() {
            vec![0.0; num_responses]
        } else {
            self.responses.iter().map(|r| (r.target)(x, time)).collect()
        }
    }

    fn exact_solution(&self, variable: &str, x: &Point3<f64>, time: f64) -> Option<(f64, Vector3<f64>)> {
        self.exact.get(variable).map(|f| f(x, time))
    }
}
