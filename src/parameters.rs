//! Named model parameters.
use crate::dual::Dual;
use crate::error::{MultiscaleError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParameterUsage {
    Fixed,
    /// Optimized over; every component gets a sensitivity channel.
    Active,
    /// Sampled by an outer uncertainty loop; constant during a solve.
    Stochastic,
    /// A nodal field over the mesh with one channel per local dof.
    Discretized,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub usage: ParameterUsage,
    /// For discretized parameters, either one value for every node or one value per node.
    pub values: Vec<f64>,
    pub bounds: Option<(f64, f64)>,
}

impl Parameter {
    pub fn new(name: impl Into<String>, usage: ParameterUsage, values: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            usage,
            values,
            bounds: None,
        }
    }

    pub fn scalar(name: impl Into<String>, usage: ParameterUsage, value: f64) -> Self {
        Self::new(name, usage, vec![value])
    }

    pub fn with_bounds(self, lower: f64, upper: f64) -> Self {
        Self {
            bounds: Some((lower, upper)),
            ..self
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    parameters: Vec<Parameter>,
}

impl ParameterSet {
    pub fn new(parameters: Vec<Parameter>) -> Result<Self> {
        for (i, p) in parameters.iter().enumerate() {
            if parameters[..i].iter().any(|q| q.name == p.name) {
                return Err(MultiscaleError::configuration(format!("duplicate parameter {}", p.name)));
            }
            if p.values.is_empty() {
                return Err(MultiscaleError::configuration(format!("parameter {} has no values", p.name)));
            }
            check_bounds(p, &p.values)?;
        }
        Ok(Self { parameters })
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn set_values(&mut self, name: &str, values: Vec<f64>) -> Result<()> {
        let parameter = self
            .parameters
            .iter_mut()
            .find(|p| p.name == name)
            .ok_or_else(|| MultiscaleError::configuration(format!("unknown parameter {}", name)))?;
        if parameter.values.len() != values.len() {
            return Err(MultiscaleError::configuration(format!(
                "parameter {} has {} components, got {}",
                name,
                parameter.values.len(),
                values.len()
            )));
        }
        check_bounds(parameter, &values)?;
        parameter.values = values;
        Ok(())
    }

    /// Turns every discretized parameter into one value per node. A single value is
    /// repeated; any other count must equal `num_nodes`.
    pub fn expand_discretized(&mut self, num_nodes: usize) -> Result<()> {
        for p in self
            .parameters
            .iter_mut()
            .filter(|p| p.usage == ParameterUsage::Discretized)
        {
            match p.values.len() {
                n if n == num_nodes => {}
                1 => p.values = vec![p.values[0]; num_nodes],
                n => {
                    return Err(MultiscaleError::configuration(format!(
                        "discretized parameter {} has {} values, but the mesh has {} nodes",
                        p.name, n, num_nodes
                    )))
                }
            }
        }
        Ok(())
    }

    pub fn discretized_names(&self) -> Vec<String> {
        self.parameters
            .iter()
            .filter(|p| p.usage == ParameterUsage::Discretized)
            .map(|p| p.name.clone())
            .collect()
    }

    /// Total number of components of the active parameters.
    pub fn num_active_components(&self) -> usize {
        self.active().map(|p| p.values.len()).sum()
    }

    fn active(&self) -> impl Iterator<Item = &Parameter> {
        self.parameters
            .iter()
            .filter(|p| p.usage == ParameterUsage::Active)
    }

    /// `(name, component)` of every active channel, in channel order.
    pub fn active_components(&self) -> Vec<(String, usize)> {
        self.active()
            .flat_map(|p| (0..p.values.len()).map(move |c| (p.name.clone(), c)))
            .collect()
    }

    pub fn active_values(&self) -> Vec<f64> {
        self.active().flat_map(|p| p.values.iter().copied()).collect()
    }

    pub fn set_active_values(&mut self, values: &[f64]) -> Result<()> {
        if values.len() != self.num_active_components() {
            return Err(MultiscaleError::configuration(format!(
                "expected {} active parameter values, got {}",
                self.num_active_components(),
                values.len()
            )));
        }
        let mut offset = 0;
        let names: Vec<(String, usize)> = self.active().map(|p| (p.name.clone(), p.values.len())).collect();
        for (name, n) in names {
            self.set_values(&name, values[offset..offset + n].to_vec())?;
            offset += n;
        }
        Ok(())
    }

    /// Values of the non-discretized parameters as duals.
    ///
    /// With `seeded`, active components carry unit derivatives in channels
    /// `0..num_active_components()` out of `num_channels`.
    pub fn values(&self, seeded: bool, num_channels: usize) -> ParameterValues {
        let mut channel = 0;
        let mut names = Vec::new();
        let mut values = Vec::new();
        for p in self
            .parameters
            .iter()
            .filter(|p| p.usage != ParameterUsage::Discretized)
        {
            let components = p
                .values
                .iter()
                .map(|&v| {
                    if seeded && p.usage == ParameterUsage::Active {
                        channel += 1;
                        Dual::variable(v, channel - 1, num_channels)
                    } else {
                        Dual::constant(v)
                    }
                })
                .collect();
            names.push(p.name.clone());
            values.push(components);
        }
        ParameterValues { names, values }
    }

    pub fn usages(&self) -> Vec<ParameterUsage> {
        self.parameters.iter().map(|p| p.usage).collect()
    }
}

fn check_bounds(parameter: &Parameter, values: &[f64]) -> Result<()> {
    if let Some((lower, upper)) = parameter.bounds {
        if let Some(v) = values.iter().find(|v| !(lower..=upper).contains(*v)) {
            return Err(MultiscaleError::configuration(format!(
                "value {} of parameter {} is outside [{}, {}]",
                v, parameter.name, lower, upper
            )));
        }
    }
    Ok(())
}

/// Parameter values handed to physics and subgrid models.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterValues {
    names: Vec<String>,
    values: Vec<Vec<Dual<f64>>>,
}

impl ParameterValues {
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn get(&self, name: &str) -> Option<&[Dual<f64>]> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| self.values[i].as_slice())
    }

    /// First component of the named parameter.
    pub fn scalar(&self, name: &str) -> Option<&Dual<f64>> {
        self.get(name).and_then(|v| v.first())
    }

    /// The same values without derivative channels.
    pub fn to_constant(&self) -> ParameterValues {
        ParameterValues {
            names: self.names.clone(),
            values: self
                .values
                .iter()
                .map(|v| v.iter().map(|d| Dual::constant(d.value())).collect())
                .collect(),
        }
    }
}
